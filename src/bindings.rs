//! C Bindings for venom_mirror
//!
//! Provides a raw C API for signal streams.

use crate::region::Backing;
use crate::signal::{SignalConfig, SignalReader, SignalWriter, StartAt};
use crate::spmc::ReadOutcome;
use std::ffi::CStr;
use std::os::raw::c_char;
use std::ptr;
use std::slice;

// Opaque handles
pub struct VenomSignalWriterHandle(SignalWriter);
pub struct VenomSignalReaderHandle(SignalReader);

#[repr(C)]
pub struct VenomSignalConfig {
    pub block_size: u32,
    pub block_count: u32,
}

/// Returned by `venom_signal_read` when nothing new is published
pub const VENOM_READ_EMPTY: i64 = -1;
/// Returned by `venom_signal_read` when the entry was overwritten mid-copy
pub const VENOM_READ_STALE: i64 = -2;
/// Returned by `venom_signal_read` when the entry does not fit the buffer
pub const VENOM_READ_TRUNCATED: i64 = -3;

unsafe fn name_arg<'a>(name: *const c_char) -> Option<&'a str> {
    if name.is_null() {
        return None;
    }
    CStr::from_ptr(name).to_str().ok()
}

/// Create a signal stream backed by POSIX shared memory
///
/// # Safety
/// name must be a valid null-terminated string
#[no_mangle]
pub unsafe extern "C" fn venom_signal_writer_create(
    name: *const c_char,
    config: VenomSignalConfig,
) -> *mut VenomSignalWriterHandle {
    let Some(name) = name_arg(name) else {
        return ptr::null_mut();
    };

    let rust_config = SignalConfig {
        block_size: config.block_size,
        block_count: config.block_count,
    };

    match SignalWriter::create(name, rust_config, Backing::Shm) {
        Ok(writer) => Box::into_raw(Box::new(VenomSignalWriterHandle(writer))),
        Err(e) => {
            tracing::error!(name, error = %e, "venom_signal_writer_create failed");
            ptr::null_mut()
        }
    }
}

/// Destroy a writer handle
///
/// # Safety
/// handle must come from `venom_signal_writer_create` and not be used afterwards
#[no_mangle]
pub unsafe extern "C" fn venom_signal_writer_destroy(handle: *mut VenomSignalWriterHandle) {
    if !handle.is_null() {
        drop(Box::from_raw(handle));
    }
}

/// Writer: publish `len` bytes
///
/// # Safety
/// handle must be live and data must point to `len` readable bytes
#[no_mangle]
pub unsafe extern "C" fn venom_signal_write(
    handle: *mut VenomSignalWriterHandle,
    data: *const u8,
    len: usize,
) -> bool {
    if handle.is_null() || (data.is_null() && len > 0) {
        return false;
    }
    let writer = &mut (*handle).0;
    let data = if len == 0 { &[][..] } else { slice::from_raw_parts(data, len) };
    writer.write_bytes(data)
}

/// Writer: largest entry that fits
///
/// # Safety
/// handle must be live
#[no_mangle]
pub unsafe extern "C" fn venom_signal_max_payload(handle: *const VenomSignalWriterHandle) -> usize {
    if handle.is_null() {
        return 0;
    }
    (*handle).0.max_payload()
}

// --- Reader Side ---

/// Connect to an existing stream. `from_oldest` replays retained entries.
///
/// # Safety
/// name must be a valid null-terminated string
#[no_mangle]
pub unsafe extern "C" fn venom_signal_reader_connect(
    name: *const c_char,
    from_oldest: bool,
) -> *mut VenomSignalReaderHandle {
    let Some(name) = name_arg(name) else {
        return ptr::null_mut();
    };
    let start = if from_oldest { StartAt::Oldest } else { StartAt::End };

    match SignalReader::connect(name, Backing::Shm, start) {
        Ok(reader) => Box::into_raw(Box::new(VenomSignalReaderHandle(reader))),
        Err(e) => {
            tracing::debug!(name, error = %e, "venom_signal_reader_connect failed");
            ptr::null_mut()
        }
    }
}

/// Destroy a reader handle
///
/// # Safety
/// handle must come from `venom_signal_reader_connect` and not be used afterwards
#[no_mangle]
pub unsafe extern "C" fn venom_signal_reader_destroy(handle: *mut VenomSignalReaderHandle) {
    if !handle.is_null() {
        drop(Box::from_raw(handle));
    }
}

/// Reader: copy the next entry into `buf`
///
/// Returns the entry length, or one of the negative `VENOM_READ_*` codes.
/// A truncated entry is consumed.
///
/// # Safety
/// handle must be live and buf must point to `max_len` writable bytes
#[no_mangle]
pub unsafe extern "C" fn venom_signal_read(
    handle: *mut VenomSignalReaderHandle,
    buf: *mut u8,
    max_len: usize,
) -> i64 {
    if handle.is_null() || (buf.is_null() && max_len > 0) {
        return VENOM_READ_EMPTY;
    }
    let reader = &mut (*handle).0;
    let out: &mut [u8] = if max_len == 0 { &mut [] } else { slice::from_raw_parts_mut(buf, max_len) };

    let mut len = 0usize;
    match reader.read_next(|entry| {
        len = entry.len();
        if len <= out.len() {
            entry.read_bytes(0, &mut out[..len]);
        }
    }) {
        ReadOutcome::Read if len > max_len => VENOM_READ_TRUNCATED,
        ReadOutcome::Read => len as i64,
        ReadOutcome::Empty => VENOM_READ_EMPTY,
        ReadOutcome::Stale => VENOM_READ_STALE,
    }
}

/// Reader: true if the producer lapped this reader
///
/// # Safety
/// handle must be live
#[no_mangle]
pub unsafe extern "C" fn venom_signal_missed(handle: *const VenomSignalReaderHandle) -> bool {
    !handle.is_null() && (*handle).0.has_missed_entries()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;

    #[test]
    fn test_c_roundtrip() {
        let name = CString::new(format!("test_bindings_{}", std::process::id())).unwrap();
        let config = VenomSignalConfig {
            block_size: 64,
            block_count: 16,
        };
        unsafe {
            let writer = venom_signal_writer_create(name.as_ptr(), config);
            assert!(!writer.is_null());
            let reader = venom_signal_reader_connect(name.as_ptr(), true);
            assert!(!reader.is_null());

            let payload = b"hello from C";
            assert!(venom_signal_write(writer, payload.as_ptr(), payload.len()));

            let mut buf = [0u8; 4];
            assert_eq!(venom_signal_read(reader, buf.as_mut_ptr(), buf.len()), VENOM_READ_TRUNCATED);

            assert!(venom_signal_write(writer, payload.as_ptr(), payload.len()));
            let mut buf = [0u8; 64];
            let n = venom_signal_read(reader, buf.as_mut_ptr(), buf.len());
            assert_eq!(n, payload.len() as i64);
            assert_eq!(&buf[..n as usize], payload);
            assert_eq!(venom_signal_read(reader, buf.as_mut_ptr(), buf.len()), VENOM_READ_EMPTY);
            assert!(!venom_signal_missed(reader));

            venom_signal_reader_destroy(reader);
            venom_signal_writer_destroy(writer);
        }
    }

    #[test]
    fn test_null_arguments() {
        unsafe {
            assert!(venom_signal_writer_create(ptr::null(), VenomSignalConfig { block_size: 64, block_count: 4 }).is_null());
            assert!(venom_signal_reader_connect(ptr::null(), false).is_null());
            assert_eq!(venom_signal_read(ptr::null_mut(), ptr::null_mut(), 0), VENOM_READ_EMPTY);
            assert_eq!(venom_signal_max_payload(ptr::null()), 0);
        }
    }
}
