//! Named interprocess locks
//!
//! Two backends sit behind [`InterprocessMutex`]:
//!
//! - [`RobustMutex`]: a process-shared, robust pthread mutex living in its own
//!   small region. A holder that dies leaves the mutex "abandoned"; the next
//!   acquirer marks it consistent and proceeds.
//! - [`FileLock`]: an advisory `flock` on a file in the temp directory. There
//!   is no timed wait, so acquisition polls every millisecond.
//!
//! `lock_wait(0)` tries once without blocking on both backends.

use crate::error::{MirrorError, Result};
use crate::region::Backing;
use rustix::fd::OwnedFd;
use rustix::fs::{flock, FlockOperation, Mode, OFlags};
use rustix::io::Errno;
use std::path::PathBuf;
use std::time::{Duration, Instant};

/// Poll interval for backends without a native timed wait
const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// A lock shared by every process that opens the same name
pub trait InterprocessMutex: Send + Sync {
    /// Wait up to `timeout_ms` for the lock. Returns false on timeout.
    fn lock_wait(&self, timeout_ms: u32) -> bool;

    /// Release a lock acquired with [`lock_wait`](Self::lock_wait)
    fn unlock(&self);
}

/// Releases the lock when dropped
pub struct LockGuard<'a> {
    mutex: &'a dyn InterprocessMutex,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}

/// Acquire `mutex` within `timeout_ms`, returning a guard that unlocks on drop
pub fn lock_guard(mutex: &dyn InterprocessMutex, timeout_ms: u32) -> Option<LockGuard<'_>> {
    if mutex.lock_wait(timeout_ms) {
        Some(LockGuard { mutex })
    } else {
        tracing::debug!(timeout_ms, "interprocess lock not acquired");
        None
    }
}

/// Which lock implementation a session uses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutexBackend {
    /// Robust process-shared pthread mutex (Linux)
    Robust,
    /// Advisory file lock with polling
    File,
}

impl MutexBackend {
    pub fn platform_default() -> Self {
        if cfg!(target_os = "linux") {
            MutexBackend::Robust
        } else {
            MutexBackend::File
        }
    }
}

impl Default for MutexBackend {
    fn default() -> Self {
        Self::platform_default()
    }
}

/// Open the lock called `name` with the requested backend.
///
/// `backing` decides where the robust mutex itself lives; the file backend
/// always uses the filesystem.
pub fn open_mutex(
    name: &str,
    backend: MutexBackend,
    backing: Backing,
) -> Result<Box<dyn InterprocessMutex>> {
    match backend {
        #[cfg(target_os = "linux")]
        MutexBackend::Robust => Ok(Box::new(RobustMutex::open(name, backing)?)),
        #[cfg(not(target_os = "linux"))]
        MutexBackend::Robust => {
            let _ = backing;
            tracing::debug!(name, "robust mutex unavailable, using file lock");
            Ok(Box::new(FileLock::open(name)?))
        }
        MutexBackend::File => Ok(Box::new(FileLock::open(name)?)),
    }
}

#[cfg(target_os = "linux")]
pub use robust::RobustMutex;

#[cfg(target_os = "linux")]
mod robust {
    use super::*;
    use crate::region::SharedRegion;
    use std::mem::size_of;

    const READY_OFFSET: usize = 0;
    const MUTEX_OFFSET: usize = 64;
    const READY_WAIT: Duration = Duration::from_millis(250);

    /// Robust pthread mutex in a region named `<name>_lock`
    pub struct RobustMutex {
        region: SharedRegion,
    }

    // SAFETY: the pthread mutex is process-shared and designed for
    // concurrent use; the region is only accessed through it
    unsafe impl Send for RobustMutex {}
    unsafe impl Sync for RobustMutex {}

    impl RobustMutex {
        pub fn open(name: &str, backing: Backing) -> Result<Self> {
            let lock_name = format!("{}_lock", name);
            let size = MUTEX_OFFSET + size_of::<libc::pthread_mutex_t>();
            let region = SharedRegion::open_or_create(&lock_name, size, backing)?;
            if region.len() < size {
                return Err(MirrorError::RegionTooSmall {
                    required: size,
                    got: region.len(),
                });
            }

            let this = Self { region };
            let ready = this.region.view().atomic_u32(READY_OFFSET);

            if this.region.created() {
                this.init().map_err(|source| MirrorError::LockOpen {
                    name: lock_name.clone(),
                    source,
                })?;
                ready.store_release(1);
            } else {
                let deadline = Instant::now() + READY_WAIT;
                while ready.load_acquire() == 0 {
                    if Instant::now() >= deadline {
                        return Err(MirrorError::Uninitialized(lock_name));
                    }
                    std::thread::sleep(POLL_INTERVAL);
                }
            }
            Ok(this)
        }

        fn raw(&self) -> *mut libc::pthread_mutex_t {
            // SAFETY: MUTEX_OFFSET is 64-byte aligned within an aligned region
            unsafe {
                self.region
                    .view()
                    .as_ptr()
                    .add(MUTEX_OFFSET)
                    .cast::<libc::pthread_mutex_t>()
            }
        }

        fn init(&self) -> std::io::Result<()> {
            unsafe {
                let mut attr: libc::pthread_mutexattr_t = std::mem::zeroed();
                check(libc::pthread_mutexattr_init(&mut attr))?;
                let result = (|| {
                    check(libc::pthread_mutexattr_setpshared(
                        &mut attr,
                        libc::PTHREAD_PROCESS_SHARED,
                    ))?;
                    check(libc::pthread_mutexattr_setrobust(
                        &mut attr,
                        libc::PTHREAD_MUTEX_ROBUST,
                    ))?;
                    check(libc::pthread_mutexattr_settype(
                        &mut attr,
                        libc::PTHREAD_MUTEX_ERRORCHECK,
                    ))?;
                    check(libc::pthread_mutex_init(self.raw(), &attr))
                })();
                libc::pthread_mutexattr_destroy(&mut attr);
                result
            }
        }

        fn deadline(timeout_ms: u32) -> libc::timespec {
            let mut now: libc::timespec = unsafe { std::mem::zeroed() };
            unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut now) };
            let nanos = now.tv_nsec as i64 + (timeout_ms as i64 % 1000) * 1_000_000;
            libc::timespec {
                tv_sec: now.tv_sec + (timeout_ms / 1000) as libc::time_t + (nanos / 1_000_000_000) as libc::time_t,
                tv_nsec: (nanos % 1_000_000_000) as _,
            }
        }
    }

    fn check(rc: libc::c_int) -> std::io::Result<()> {
        if rc == 0 {
            Ok(())
        } else {
            Err(std::io::Error::from_raw_os_error(rc))
        }
    }

    impl InterprocessMutex for RobustMutex {
        fn lock_wait(&self, timeout_ms: u32) -> bool {
            let rc = unsafe {
                if timeout_ms == 0 {
                    libc::pthread_mutex_trylock(self.raw())
                } else {
                    let deadline = Self::deadline(timeout_ms);
                    libc::pthread_mutex_timedlock(self.raw(), &deadline)
                }
            };
            match rc {
                0 => true,
                libc::EOWNERDEAD => {
                    // Previous holder died; every structure behind this lock
                    // is restored atomically, so the state is usable as-is
                    tracing::warn!(name = self.region.name(), "recovered abandoned lock");
                    unsafe { libc::pthread_mutex_consistent(self.raw()) };
                    true
                }
                libc::ETIMEDOUT | libc::EBUSY | libc::EDEADLK => false,
                other => {
                    tracing::error!(
                        name = self.region.name(),
                        errno = other,
                        "robust mutex lock failed"
                    );
                    false
                }
            }
        }

        fn unlock(&self) {
            unsafe {
                libc::pthread_mutex_unlock(self.raw());
            }
        }
    }
}

/// Advisory file lock on `<tmp>/venom_<name>.lock`
pub struct FileLock {
    fd: OwnedFd,
    path: PathBuf,
}

impl FileLock {
    pub fn open(name: &str) -> Result<Self> {
        let path = std::env::temp_dir().join(format!("venom_{}.lock", name));
        let fd = rustix::fs::open(
            path.as_path(),
            OFlags::CREATE | OFlags::RDWR | OFlags::CLOEXEC,
            Mode::RUSR | Mode::WUSR | Mode::RGRP | Mode::WGRP,
        )
        .map_err(|e| MirrorError::LockOpen {
            name: name.to_string(),
            source: e.into(),
        })?;
        Ok(Self { fd, path })
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

impl InterprocessMutex for FileLock {
    fn lock_wait(&self, timeout_ms: u32) -> bool {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms as u64);
        loop {
            match flock(&self.fd, FlockOperation::NonBlockingLockExclusive) {
                Ok(()) => return true,
                Err(e) if e == Errno::WOULDBLOCK || e == Errno::INTR => {}
                Err(e) => {
                    tracing::error!(path = %self.path.display(), error = %e, "flock failed");
                    return false;
                }
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    fn unlock(&self) {
        let _ = flock(&self.fd, FlockOperation::Unlock);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_lock_excludes_second_handle() {
        let name = format!("test_flock_{}", std::process::id());
        let a = FileLock::open(&name).unwrap();
        let b = FileLock::open(&name).unwrap();

        assert!(a.lock_wait(0));
        assert!(!b.lock_wait(0));

        let start = Instant::now();
        assert!(!b.lock_wait(20));
        assert!(start.elapsed() >= Duration::from_millis(20));

        a.unlock();
        assert!(b.lock_wait(0));
        b.unlock();
        let _ = std::fs::remove_file(a.path());
    }

    #[test]
    fn test_guard_unlocks_on_drop() {
        let name = format!("test_guard_{}", std::process::id());
        let a = FileLock::open(&name).unwrap();
        let b = FileLock::open(&name).unwrap();
        {
            let _guard = lock_guard(&a, 10).unwrap();
            assert!(lock_guard(&b, 0).is_none());
        }
        assert!(lock_guard(&b, 0).is_some());
        let _ = std::fs::remove_file(a.path());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_robust_mutex_times_out_across_threads() {
        let name = format!("test_robust_timeout_{}", std::process::id());
        let a = RobustMutex::open(&name, Backing::Heap).unwrap();
        let b = RobustMutex::open(&name, Backing::Heap).unwrap();

        assert!(a.lock_wait(10));
        let waiter = std::thread::spawn(move || b.lock_wait(20));
        assert!(!waiter.join().unwrap());
        a.unlock();
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_robust_mutex_recovers_abandoned_lock() {
        let name = format!("test_robust_abandon_{}", std::process::id());
        let main = RobustMutex::open(&name, Backing::Heap).unwrap();

        let holder_name = name.clone();
        std::thread::spawn(move || {
            let holder = RobustMutex::open(&holder_name, Backing::Heap).unwrap();
            assert!(holder.lock_wait(10));
            // Thread exits while still holding the lock
        })
        .join()
        .unwrap();

        assert!(main.lock_wait(100));
        main.unlock();
        assert!(main.lock_wait(0));
        main.unlock();
    }

    #[test]
    fn test_factory_selects_backend() {
        let name = format!("test_factory_{}", std::process::id());
        let m = open_mutex(&name, MutexBackend::File, Backing::Heap).unwrap();
        assert!(m.lock_wait(0));
        m.unlock();
        let _ = std::fs::remove_file(std::env::temp_dir().join(format!("venom_{}.lock", name)));
    }
}
