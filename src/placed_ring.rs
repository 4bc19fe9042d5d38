//! Variable-length record ring buffer placed inside a larger region
//!
//! Used as the session change log. One writer mutates it while holding the
//! session lock; readers keep their own [`PlacedRingIterator`] cursor.
//!
//! # Layout
//!
//! ```text
//! +0   pool_size       u32
//! +4   count           u32
//! +8   start_id        u32   id of the oldest element
//! +12  start_offset    u32   pool offset of the oldest element
//! +16  prewrap_offset  u32   bytes at or past this offset are stale
//! +20  end_offset      u32   pool offset one past the newest element
//! +24  pool            [u8; pool_size]
//! ```
//!
//! Each element is a `u32` length followed by the payload, padded to 4 bytes.
//! When the newest element sits before the oldest one the buffer is wrapped:
//! live bytes are `[start, prewrap)` followed by `[0, end)`.

use crate::error::{MirrorError, Result};
use crate::view::MemoryView;

const POOL_SIZE: usize = 0;
const COUNT: usize = 4;
const START_ID: usize = 8;
const START_OFFSET: usize = 12;
const PREWRAP_OFFSET: usize = 16;
const END_OFFSET: usize = 20;

/// Size of the length prefix in front of every element
pub const ELEMENT_HEADER: usize = 4;

#[inline(always)]
const fn align4(size: usize) -> usize {
    (size + 3) & !3
}

/// Bytes an element of `size` occupies in the pool
#[inline(always)]
pub const fn element_footprint(size: usize) -> usize {
    ELEMENT_HEADER + align4(size)
}

/// Ring buffer of variable-length records over a [`MemoryView`]
#[derive(Clone, Copy)]
pub struct PlacedRingBuffer<'a> {
    props: MemoryView<'a>,
    pool: MemoryView<'a>,
}

impl<'a> PlacedRingBuffer<'a> {
    /// Size of the properties block in front of the pool
    pub const PROPERTIES_SIZE: usize = 24;

    /// Total bytes needed to place a buffer with `pool_size` bytes of pool
    pub const fn required_size(pool_size: usize) -> usize {
        Self::PROPERTIES_SIZE + align4(pool_size)
    }

    fn split(view: MemoryView<'a>) -> Result<Self> {
        if view.len() < Self::PROPERTIES_SIZE + ELEMENT_HEADER {
            return Err(MirrorError::RegionTooSmall {
                required: Self::PROPERTIES_SIZE + ELEMENT_HEADER,
                got: view.len(),
            });
        }
        let pool_len = (view.len() - Self::PROPERTIES_SIZE) & !3;
        Ok(Self {
            props: view.slice(0, Self::PROPERTIES_SIZE),
            pool: view.slice(Self::PROPERTIES_SIZE, pool_len),
        })
    }

    /// Format `view` as an empty buffer whose pool fills the rest of the view
    pub fn init(view: MemoryView<'a>) -> Result<Self> {
        let this = Self::split(view)?;
        this.props.write_u32(POOL_SIZE, this.pool.len() as u32);
        this.props.write_u32(START_ID, 0);
        this.reset_empty();
        Ok(this)
    }

    /// Attach to a buffer previously formatted with [`init`](Self::init)
    pub fn attach(view: MemoryView<'a>) -> Result<Self> {
        let this = Self::split(view)?;
        let recorded = this.props.read_u32(POOL_SIZE) as usize;
        if recorded != this.pool.len() {
            return Err(MirrorError::LayoutMismatch {
                expected: this.pool.len(),
                got: recorded,
            });
        }
        Ok(this)
    }

    #[inline]
    pub fn pool_size(&self) -> usize {
        self.pool.len()
    }

    #[inline]
    pub fn len(&self) -> u32 {
        self.props.read_u32(COUNT)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Id of the oldest retained element
    #[inline]
    pub fn min_id(&self) -> u32 {
        self.props.read_u32(START_ID)
    }

    /// Id of the newest element, `None` when empty
    #[inline]
    pub fn max_id(&self) -> Option<u32> {
        match self.len() {
            0 => None,
            n => Some(self.min_id().wrapping_add(n - 1)),
        }
    }

    /// Id the next pushed element will receive
    #[inline]
    pub fn end_id(&self) -> u32 {
        self.min_id().wrapping_add(self.len())
    }

    #[inline]
    fn start_offset(&self) -> usize {
        self.props.read_u32(START_OFFSET) as usize
    }

    #[inline]
    fn end_offset(&self) -> usize {
        self.props.read_u32(END_OFFSET) as usize
    }

    #[inline]
    fn prewrap_offset(&self) -> usize {
        self.props.read_u32(PREWRAP_OFFSET) as usize
    }

    fn reset_empty(&self) {
        self.props.write_u32(COUNT, 0);
        self.props.write_u32(START_OFFSET, 0);
        self.props.write_u32(END_OFFSET, 0);
        self.props.write_u32(PREWRAP_OFFSET, self.pool.len() as u32);
    }

    /// Drop every element, keeping id numbering
    pub fn clear(&self) {
        let end = self.end_id();
        self.reset_empty();
        self.props.write_u32(START_ID, end);
    }

    #[inline]
    fn element_at(&self, offset: usize) -> MemoryView<'a> {
        let size = self.pool.read_u32(offset) as usize;
        self.pool.slice(offset + ELEMENT_HEADER, size)
    }

    /// Reserve `size` bytes for a new element, evicting the oldest elements
    /// until it fits.
    ///
    /// Returns the element's id and a writable view of its payload, or `None`
    /// without touching the buffer if the element could not fit even in an
    /// empty pool.
    pub fn push(&self, size: usize) -> Option<(u32, MemoryView<'a>)> {
        let pool_size = self.pool.len();
        let needed = element_footprint(size);
        if needed > pool_size {
            tracing::warn!(size, pool_size, "change-log element larger than pool");
            return None;
        }

        let offset = loop {
            if self.is_empty() {
                self.reset_empty();
                break 0;
            }

            let start = self.start_offset();
            let end = self.end_offset();
            if end > start {
                if pool_size - end >= needed {
                    break end;
                }
                // Wrap to the front; everything from `end` on is now stale
                if start > needed {
                    self.props.write_u32(PREWRAP_OFFSET, end as u32);
                    break 0;
                }
            } else if start - end > needed {
                break end;
            }

            self.shift();
        };

        self.pool.write_u32(offset, size as u32);
        self.props.write_u32(END_OFFSET, (offset + needed) as u32);
        let count = self.len() + 1;
        self.props.write_u32(COUNT, count);

        let id = self.min_id().wrapping_add(count - 1);
        Some((id, self.pool.slice(offset + ELEMENT_HEADER, size)))
    }

    /// Remove the oldest element and return its payload.
    ///
    /// The returned view stays readable until the next push reuses its bytes.
    pub fn shift(&self) -> Option<MemoryView<'a>> {
        let count = self.len();
        if count == 0 {
            return None;
        }

        let start = self.start_offset();
        let element = self.element_at(start);
        let mut next = start + element_footprint(element.len());
        if next >= self.prewrap_offset() {
            next = 0;
            self.props.write_u32(PREWRAP_OFFSET, self.pool.len() as u32);
        }

        self.props.write_u32(START_ID, self.min_id().wrapping_add(1));
        if count == 1 {
            self.reset_empty();
        } else {
            self.props.write_u32(COUNT, count - 1);
            self.props.write_u32(START_OFFSET, next as u32);
        }
        Some(element)
    }

    /// Element at position `index`, 0 being the oldest
    pub fn get_at(&self, index: u32) -> Option<MemoryView<'a>> {
        if index >= self.len() {
            return None;
        }
        let prewrap = self.prewrap_offset();
        let mut offset = self.start_offset();
        for _ in 0..index {
            offset += element_footprint(self.pool.read_u32(offset) as usize);
            if offset >= prewrap {
                offset = 0;
            }
        }
        Some(self.element_at(offset))
    }

    /// Position of `id` in the buffer.
    ///
    /// Ids older than the oldest retained element map to index 0; callers that
    /// need the exact record must compare against [`min_id`](Self::min_id).
    pub fn index_for_id(&self, id: u32) -> Option<u32> {
        let start = self.min_id();
        if id < start {
            return if self.is_empty() { None } else { Some(0) };
        }
        let index = id - start;
        (index < self.len()).then_some(index)
    }

    /// Element with `id`, clamped to the oldest element like
    /// [`index_for_id`](Self::index_for_id)
    pub fn get_by_id(&self, id: u32) -> Option<MemoryView<'a>> {
        self.index_for_id(id).and_then(|index| self.get_at(index))
    }
}

/// A reader's position in a [`PlacedRingBuffer`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlacedRingIterator {
    next_id: u32,
}

impl PlacedRingIterator {
    /// Cursor that starts at id `next_id`
    pub fn new(next_id: u32) -> Self {
        Self { next_id }
    }

    /// Cursor positioned after everything currently queued
    pub fn at_end(buffer: &PlacedRingBuffer<'_>) -> Self {
        Self::new(buffer.end_id())
    }

    /// Next id this cursor will read
    #[inline]
    pub fn cursor(&self) -> u32 {
        self.next_id
    }

    #[inline]
    pub fn has_next(&self, buffer: &PlacedRingBuffer<'_>) -> bool {
        self.next_id < buffer.end_id()
    }

    /// True if entries were evicted before this cursor reached them
    #[inline]
    pub fn has_missed_entries(&self, buffer: &PlacedRingBuffer<'_>) -> bool {
        self.next_id < buffer.min_id()
    }

    /// Element at the cursor, advancing past it
    pub fn next<'a>(&mut self, buffer: &PlacedRingBuffer<'a>) -> Option<(u32, MemoryView<'a>)> {
        if !self.has_next(buffer) {
            return None;
        }
        let id = self.next_id;
        let element = buffer.get_by_id(id)?;
        self.next_id = id.wrapping_add(1);
        Some((id, element))
    }

    /// Skip everything currently queued
    pub fn set_to_end(&mut self, buffer: &PlacedRingBuffer<'_>) {
        self.next_id = buffer.end_id();
    }

    /// Jump to the oldest retained element
    pub fn set_to_oldest(&mut self, buffer: &PlacedRingBuffer<'_>) {
        self.next_id = buffer.min_id();
    }
}
