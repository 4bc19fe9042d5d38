//! Named memory regions shared between processes
//!
//! A region is either a POSIX shared memory segment or, for single-process
//! tests, a named heap block. Both are looked up by name and report whether
//! this handle created the backing memory, which drives session
//! initialization.

use crate::error::{MirrorError, Result};
use crate::view::MemoryView;
use parking_lot::Mutex;
use rustix::fd::OwnedFd;
use rustix::fs::ftruncate;
use rustix::io::Errno;
use rustix::mm::{mmap, munmap, MapFlags, ProtFlags};
use rustix::shm::{shm_open, shm_unlink, Mode, ShmOFlags};
use std::alloc::Layout;
use std::collections::BTreeMap;
use std::ffi::CString;
use std::ptr::NonNull;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

const VENOM_SHM_PREFIX: &str = "/venom_";
const MAX_NAME_LEN: usize = 255 - VENOM_SHM_PREFIX.len();

/// How long an opener waits for the creator to size a fresh segment
const SIZE_WAIT: Duration = Duration::from_millis(250);

/// Alignment of heap blocks, matches a cache line
const HEAP_ALIGN: usize = 64;

/// Where a region's bytes live
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backing {
    /// POSIX shared memory, visible to other processes
    #[default]
    Shm,
    /// Process-local heap block shared by name
    Heap,
}

fn shm_c_name(name: &str) -> Result<CString> {
    if name.len() > MAX_NAME_LEN {
        return Err(MirrorError::NameTooLong {
            max: MAX_NAME_LEN,
            got: name.len(),
        });
    }
    CString::new(format!("{}{}", VENOM_SHM_PREFIX, name)).map_err(|e| MirrorError::RegionOpen {
        name: name.to_string(),
        source: std::io::Error::new(std::io::ErrorKind::InvalidInput, e),
    })
}

/// Handle to a mapped POSIX shared memory segment
pub struct ShmSegment {
    #[allow(dead_code)]
    fd: OwnedFd,
    addr: NonNull<u8>,
    size: usize,
    name: String,
    is_owner: bool,
}

// SAFETY: the mapping stays valid for the life of the handle; access to its
// contents is synchronized by the structures placed inside it
unsafe impl Send for ShmSegment {}
unsafe impl Sync for ShmSegment {}

impl ShmSegment {
    /// Create the segment, or open it if another process got there first
    pub fn open_or_create(name: &str, size: usize) -> Result<Self> {
        let c_name = shm_c_name(name)?;

        match shm_open(
            c_name.as_c_str(),
            ShmOFlags::CREATE | ShmOFlags::EXCL | ShmOFlags::RDWR,
            Mode::RUSR | Mode::WUSR | Mode::RGRP | Mode::WGRP,
        ) {
            Ok(fd) => {
                if let Err(e) = ftruncate(&fd, size as u64) {
                    let _ = shm_unlink(c_name.as_c_str());
                    return Err(MirrorError::Resize(e.into()));
                }
                // Fresh segments are zero-filled by the kernel
                let addr = Self::map(&fd, size)?;
                tracing::debug!(name, size, "created shared memory segment");
                Ok(Self {
                    fd,
                    addr,
                    size,
                    name: name.to_string(),
                    is_owner: true,
                })
            }
            Err(e) if e == Errno::EXIST => Self::open(name),
            Err(e) => Err(MirrorError::RegionCreate {
                name: name.to_string(),
                source: e.into(),
            }),
        }
    }

    /// Open an existing segment, waiting briefly for its creator to size it
    pub fn open(name: &str) -> Result<Self> {
        let c_name = shm_c_name(name)?;
        let open_err = |e: Errno| MirrorError::RegionOpen {
            name: name.to_string(),
            source: e.into(),
        };

        let fd = shm_open(c_name.as_c_str(), ShmOFlags::RDWR, Mode::empty()).map_err(open_err)?;

        let deadline = Instant::now() + SIZE_WAIT;
        let size = loop {
            let stat = rustix::fs::fstat(&fd).map_err(open_err)?;
            if stat.st_size > 0 {
                break stat.st_size as usize;
            }
            if Instant::now() >= deadline {
                return Err(MirrorError::Uninitialized(name.to_string()));
            }
            std::thread::sleep(Duration::from_millis(1));
        };

        let addr = Self::map(&fd, size)?;
        Ok(Self {
            fd,
            addr,
            size,
            name: name.to_string(),
            is_owner: false,
        })
    }

    fn map(fd: &OwnedFd, size: usize) -> Result<NonNull<u8>> {
        let addr = unsafe {
            mmap(
                std::ptr::null_mut(),
                size,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                fd,
                0,
            )
            .map_err(|e| MirrorError::Map(e.into()))?
        };
        NonNull::new(addr.cast::<u8>()).ok_or_else(|| {
            MirrorError::Map(std::io::Error::new(
                std::io::ErrorKind::Other,
                "mmap returned null",
            ))
        })
    }

    /// Remove a segment name, e.g. one left behind by a crashed process
    pub fn unlink(name: &str) -> Result<()> {
        let c_name = shm_c_name(name)?;
        shm_unlink(c_name.as_c_str()).map_err(|e| MirrorError::RegionOpen {
            name: name.to_string(),
            source: e.into(),
        })
    }

    #[inline(always)]
    pub fn as_ptr(&self) -> *mut u8 {
        self.addr.as_ptr()
    }

    #[inline(always)]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline(always)]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline(always)]
    pub fn is_owner(&self) -> bool {
        self.is_owner
    }
}

impl Drop for ShmSegment {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(self.addr.as_ptr().cast(), self.size);
        }

        if self.is_owner {
            if let Ok(c_name) = shm_c_name(&self.name) {
                let _ = shm_unlink(c_name.as_c_str());
            }
        }
    }
}

/// Zeroed, cache-line aligned heap allocation
pub struct HeapBlock {
    ptr: NonNull<u8>,
    layout: Layout,
}

unsafe impl Send for HeapBlock {}
unsafe impl Sync for HeapBlock {}

impl HeapBlock {
    fn new(size: usize) -> Self {
        let layout = Layout::from_size_align(size.max(1), HEAP_ALIGN)
            .unwrap_or_else(|_| Layout::new::<u64>());
        let raw = unsafe { std::alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).unwrap_or_else(|| std::alloc::handle_alloc_error(layout));
        Self { ptr, layout }
    }

    fn size(&self) -> usize {
        self.layout.size()
    }
}

impl Drop for HeapBlock {
    fn drop(&mut self) {
        unsafe { std::alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

static HEAP_BLOCKS: Mutex<BTreeMap<String, Weak<HeapBlock>>> =
    parking_lot::const_mutex(BTreeMap::new());

fn heap_open_or_create(name: &str, size: usize) -> (Arc<HeapBlock>, bool) {
    let mut blocks = HEAP_BLOCKS.lock();
    blocks.retain(|_, weak| weak.strong_count() > 0);
    if let Some(block) = blocks.get(name).and_then(Weak::upgrade) {
        return (block, false);
    }
    let block = Arc::new(HeapBlock::new(size));
    blocks.insert(name.to_string(), Arc::downgrade(&block));
    (block, true)
}

enum RegionInner {
    Shm(ShmSegment),
    Heap(Arc<HeapBlock>),
}

/// A named, mapped region and whether this handle created it
pub struct SharedRegion {
    inner: RegionInner,
    name: String,
    created: bool,
}

impl SharedRegion {
    /// Open the region called `name`, creating it with `size` bytes if absent.
    ///
    /// An existing region keeps its original size; callers validate it.
    pub fn open_or_create(name: &str, size: usize, backing: Backing) -> Result<Self> {
        let (inner, created) = match backing {
            Backing::Shm => {
                let seg = ShmSegment::open_or_create(name, size)?;
                let created = seg.is_owner();
                (RegionInner::Shm(seg), created)
            }
            Backing::Heap => {
                let (block, created) = heap_open_or_create(name, size);
                (RegionInner::Heap(block), created)
            }
        };
        Ok(Self {
            inner,
            name: name.to_string(),
            created,
        })
    }

    /// Open an existing region without creating it
    pub fn open(name: &str, backing: Backing) -> Result<Self> {
        let inner = match backing {
            Backing::Shm => RegionInner::Shm(ShmSegment::open(name)?),
            Backing::Heap => {
                let block = HEAP_BLOCKS
                    .lock()
                    .get(name)
                    .and_then(Weak::upgrade)
                    .ok_or_else(|| MirrorError::RegionOpen {
                        name: name.to_string(),
                        source: std::io::ErrorKind::NotFound.into(),
                    })?;
                RegionInner::Heap(block)
            }
        };
        Ok(Self {
            inner,
            name: name.to_string(),
            created: false,
        })
    }

    /// View over the whole region
    #[inline]
    pub fn view(&self) -> MemoryView<'_> {
        let (ptr, len) = match &self.inner {
            RegionInner::Shm(seg) => (seg.addr, seg.size()),
            RegionInner::Heap(block) => (block.ptr, block.size()),
        };
        // SAFETY: the mapping/allocation lives as long as `self`
        unsafe { MemoryView::from_raw_parts(ptr, len) }
    }

    #[inline]
    pub fn len(&self) -> usize {
        match &self.inner {
            RegionInner::Shm(seg) => seg.size(),
            RegionInner::Heap(block) => block.size(),
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// True if this handle allocated the backing memory
    #[inline]
    pub fn created(&self) -> bool {
        self.created
    }

    #[inline]
    pub fn backing(&self) -> Backing {
        match self.inner {
            RegionInner::Shm(_) => Backing::Shm,
            RegionInner::Heap(_) => Backing::Heap,
        }
    }
}
