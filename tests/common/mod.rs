//! Helpers shared by the integration tests

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use venom_mirror::{
    Backing, FieldMask, MemoryView, MutexBackend, ObjectId, Reconciled, SessionConfig,
};

pub const VALUE: FieldMask = FieldMask::bit(0);
pub const STATUS: FieldMask = FieldMask::bit(1);

/// Region name unique to this process and call
pub fn unique_name(prefix: &str) -> String {
    static NEXT: AtomicU32 = AtomicU32::new(0);
    format!(
        "{}_{}_{}",
        prefix,
        std::process::id(),
        NEXT.fetch_add(1, Ordering::Relaxed)
    )
}

/// In-process session config with a small change log
pub fn heap_config(name: &str, changelog_size: usize) -> SessionConfig {
    SessionConfig {
        backing: Backing::Heap,
        mutex_backend: MutexBackend::File,
        changelog_size,
        schema_hash: [0xfeed, 0, 0, 1],
        stale_after: Duration::from_secs(20),
        ..SessionConfig::new(name)
    }
}

pub fn oid(n: u128) -> ObjectId {
    ObjectId::from_u128(n)
}

/// Two u32 fields
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Sensor {
    pub value: u32,
    pub status: u32,
}

impl Sensor {
    pub fn new(value: u32, status: u32) -> Self {
        Self { value, status }
    }
}

impl Reconciled for Sensor {
    fn encoded_len(&self, fields: FieldMask) -> usize {
        [VALUE, STATUS].iter().filter(|f| fields.contains(**f)).count() * 4
    }

    fn encode(&self, fields: FieldMask, out: MemoryView<'_>) {
        let mut offset = 0;
        if fields.contains(VALUE) {
            out.write_u32(offset, self.value);
            offset += 4;
        }
        if fields.contains(STATUS) {
            out.write_u32(offset, self.status);
        }
    }

    fn apply(&mut self, encoded: FieldMask, accept: FieldMask, data: MemoryView<'_>) {
        let mut offset = 0;
        if encoded.contains(VALUE) {
            if accept.contains(VALUE) {
                self.value = data.read_u32(offset);
            }
            offset += 4;
        }
        if encoded.contains(STATUS) && accept.contains(STATUS) {
            self.status = data.read_u32(offset);
        }
    }
}

/// Encode `sensor`'s `fields` into `buf`
pub fn encoded<'b>(sensor: &Sensor, fields: FieldMask, buf: &'b mut [u32; 2]) -> MemoryView<'b> {
    let len = sensor.encoded_len(fields);
    // SAFETY: `buf` outlives the view and holds at least `len` bytes
    let view = unsafe { MemoryView::from_raw_parts(std::ptr::NonNull::from(&mut buf[..]).cast(), len) };
    sensor.encode(fields, view);
    view
}
