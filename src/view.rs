//! Bounds-checked windows over mapped memory
//!
//! A [`MemoryView`] is a pointer and a length borrowed from a region that
//! outlives it. Views are `Copy`; slicing produces another view over the same
//! bytes. All integer accessors use host byte order and tolerate unaligned
//! offsets, except the atomic accessors which require natural alignment.

use crate::atomic::{AtomicWide, AtomicWord};
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicU64};

/// Non-owning view of `len` bytes of shared memory
#[derive(Clone, Copy)]
pub struct MemoryView<'a> {
    ptr: NonNull<u8>,
    len: usize,
    _marker: PhantomData<&'a [u8]>,
}

// SAFETY: a view is a window into memory that other processes mutate anyway;
// concurrent access is coordinated by the session lock or by atomics.
unsafe impl Send for MemoryView<'_> {}
unsafe impl Sync for MemoryView<'_> {}

impl<'a> MemoryView<'a> {
    /// Build a view over raw memory
    ///
    /// # Safety
    /// `ptr` must be valid for reads and writes of `len` bytes for `'a`.
    pub unsafe fn from_raw_parts(ptr: NonNull<u8>, len: usize) -> Self {
        Self {
            ptr,
            len,
            _marker: PhantomData,
        }
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline(always)]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    #[inline(always)]
    fn check(&self, offset: usize, len: usize) {
        assert!(
            offset.checked_add(len).is_some_and(|end| end <= self.len),
            "view access out of bounds: {}+{} > {}",
            offset,
            len,
            self.len
        );
    }

    /// Sub-view of `len` bytes starting at `offset`
    #[inline]
    pub fn slice(&self, offset: usize, len: usize) -> MemoryView<'a> {
        self.check(offset, len);
        // SAFETY: bounds checked above, same backing allocation
        unsafe {
            MemoryView::from_raw_parts(NonNull::new_unchecked(self.ptr.as_ptr().add(offset)), len)
        }
    }

    /// Sub-view from `offset` to the end
    #[inline]
    pub fn tail(&self, offset: usize) -> MemoryView<'a> {
        self.slice(offset, self.len - offset.min(self.len))
    }

    #[inline]
    pub fn read_u32(&self, offset: usize) -> u32 {
        self.check(offset, 4);
        unsafe { std::ptr::read_unaligned(self.ptr.as_ptr().add(offset).cast::<u32>()) }
    }

    #[inline]
    pub fn write_u32(&self, offset: usize, value: u32) {
        self.check(offset, 4);
        unsafe { std::ptr::write_unaligned(self.ptr.as_ptr().add(offset).cast::<u32>(), value) }
    }

    #[inline]
    pub fn read_i32(&self, offset: usize) -> i32 {
        self.read_u32(offset) as i32
    }

    #[inline]
    pub fn write_i32(&self, offset: usize, value: i32) {
        self.write_u32(offset, value as u32)
    }

    #[inline]
    pub fn read_u64(&self, offset: usize) -> u64 {
        self.check(offset, 8);
        unsafe { std::ptr::read_unaligned(self.ptr.as_ptr().add(offset).cast::<u64>()) }
    }

    #[inline]
    pub fn write_u64(&self, offset: usize, value: u64) {
        self.check(offset, 8);
        unsafe { std::ptr::write_unaligned(self.ptr.as_ptr().add(offset).cast::<u64>(), value) }
    }

    /// Copy `buf.len()` bytes out of the view
    #[inline]
    pub fn read_bytes(&self, offset: usize, buf: &mut [u8]) {
        self.check(offset, buf.len());
        unsafe {
            std::ptr::copy_nonoverlapping(self.ptr.as_ptr().add(offset), buf.as_mut_ptr(), buf.len());
        }
    }

    /// Copy `data` into the view
    #[inline]
    pub fn write_bytes(&self, offset: usize, data: &[u8]) {
        self.check(offset, data.len());
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.as_ptr().add(offset), data.len());
        }
    }

    /// Set every byte of the view to `byte`
    #[inline]
    pub fn fill(&self, byte: u8) {
        unsafe { std::ptr::write_bytes(self.ptr.as_ptr(), byte, self.len) }
    }

    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.len];
        self.read_bytes(0, &mut out);
        out
    }

    /// Atomic 32-bit word at `offset` (must be 4-byte aligned)
    #[inline]
    pub fn atomic_u32(&self, offset: usize) -> AtomicWord<'a> {
        self.check(offset, 4);
        let ptr = unsafe { self.ptr.as_ptr().add(offset) };
        assert!(ptr as usize % 4 == 0, "misaligned atomic u32 at offset {}", offset);
        // SAFETY: aligned, in bounds, lives as long as the view's region
        AtomicWord::new(unsafe { &*ptr.cast::<AtomicU32>() })
    }

    /// Atomic 64-bit word at `offset` (must be 8-byte aligned)
    #[inline]
    pub fn atomic_u64(&self, offset: usize) -> AtomicWide<'a> {
        self.check(offset, 8);
        let ptr = unsafe { self.ptr.as_ptr().add(offset) };
        assert!(ptr as usize % 8 == 0, "misaligned atomic u64 at offset {}", offset);
        AtomicWide::new(unsafe { &*ptr.cast::<AtomicU64>() })
    }
}

impl std::fmt::Debug for MemoryView<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryView")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backing(words: usize) -> Vec<u64> {
        vec![0u64; words]
    }

    fn view_of(buf: &mut [u64]) -> MemoryView<'_> {
        let len = buf.len() * 8;
        unsafe { MemoryView::from_raw_parts(NonNull::new(buf.as_mut_ptr().cast()).unwrap(), len) }
    }

    #[test]
    fn test_integer_roundtrip_unaligned() {
        let mut buf = backing(8);
        let view = view_of(&mut buf);

        view.write_u32(1, 0xDEADBEEF);
        view.write_u64(13, 0x0102030405060708);
        view.write_i32(40, -5);

        assert_eq!(view.read_u32(1), 0xDEADBEEF);
        assert_eq!(view.read_u64(13), 0x0102030405060708);
        assert_eq!(view.read_i32(40), -5);
    }

    #[test]
    fn test_slices_share_memory() {
        let mut buf = backing(4);
        let view = view_of(&mut buf);
        let sub = view.slice(8, 16);

        sub.write_bytes(0, b"venom");
        let mut out = [0u8; 5];
        view.read_bytes(8, &mut out);
        assert_eq!(&out, b"venom");
        assert_eq!(view.tail(24).len(), 8);
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn test_out_of_bounds_panics() {
        let mut buf = backing(1);
        let view = view_of(&mut buf);
        view.read_u32(6);
    }

    #[test]
    fn test_atomics_alias_plain_accessors() {
        let mut buf = backing(2);
        let view = view_of(&mut buf);
        view.atomic_u32(4).store_release(77);
        assert_eq!(view.read_u32(4), 77);
        view.atomic_u64(8).store_release(1 << 40);
        assert_eq!(view.read_u64(8), 1 << 40);
    }
}
