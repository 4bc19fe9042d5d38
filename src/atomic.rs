//! Acquire/release operations on words living in mapped memory
//!
//! Every index shared between processes goes through these wrappers so the
//! ordering at each call site is explicit. Loads are acquire, stores are
//! release, read-modify-write operations are acq-rel.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// A 32-bit word in shared memory
#[derive(Clone, Copy)]
pub struct AtomicWord<'a>(&'a AtomicU32);

impl<'a> AtomicWord<'a> {
    #[inline(always)]
    pub fn new(word: &'a AtomicU32) -> Self {
        Self(word)
    }

    #[inline(always)]
    pub fn load_acquire(&self) -> u32 {
        self.0.load(Ordering::Acquire)
    }

    #[inline(always)]
    pub fn store_release(&self, value: u32) {
        self.0.store(value, Ordering::Release)
    }

    #[inline(always)]
    pub fn exchange(&self, value: u32) -> u32 {
        self.0.swap(value, Ordering::AcqRel)
    }

    /// Returns the previous value on success and the observed value on failure
    #[inline(always)]
    pub fn compare_exchange(&self, current: u32, new: u32) -> Result<u32, u32> {
        self.0
            .compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire)
    }

    /// Load through a compare-exchange with identical operands.
    ///
    /// Produces the same value as [`load_acquire`](Self::load_acquire); kept for
    /// peers that only expose compare-exchange on the mapped word.
    #[inline(always)]
    pub fn cas_load(&self) -> u32 {
        match self.compare_exchange(0, 0) {
            Ok(v) | Err(v) => v,
        }
    }
}

/// A 64-bit word in shared memory
#[derive(Clone, Copy)]
pub struct AtomicWide<'a>(&'a AtomicU64);

impl<'a> AtomicWide<'a> {
    #[inline(always)]
    pub fn new(word: &'a AtomicU64) -> Self {
        Self(word)
    }

    #[inline(always)]
    pub fn load_acquire(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    #[inline(always)]
    pub fn store_release(&self, value: u64) {
        self.0.store(value, Ordering::Release)
    }

    #[inline(always)]
    pub fn exchange(&self, value: u64) -> u64 {
        self.0.swap(value, Ordering::AcqRel)
    }

    #[inline(always)]
    pub fn compare_exchange(&self, current: u64, new: u64) -> Result<u64, u64> {
        self.0
            .compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire)
    }
}
