//! Change-event wire format
//!
//! Every change-log record starts with an 8-byte event header:
//!
//! ```text
//! +0  type              u32
//! +4  timestamp_delta   i32   milliseconds since the session base timestamp
//! ```
//!
//! followed by a type-specific body. Object events (create, update, upsert,
//! delete) carry the object id and collection id; all but delete also carry
//! the changed-field mask and the encoded fields. A full reconcile carries
//! the authoritative id set of one collection, a shutdown names the
//! collection whose producer is leaving.
//!
//! The timestamp delta keeps millisecond resolution only. Microseconds are
//! truncated on write and restored as `delta * 1000` on read.

use crate::view::MemoryView;
use std::fmt;
use std::ops::{BitAnd, BitAndAssign, BitOr, BitOrAssign, Not};

pub const EVENT_HEADER_SIZE: usize = 8;
pub const OBJECT_HEADER_SIZE: usize = 24;
pub const FIELDS_SIZE: usize = 8;
pub const OBJECT_ID_SIZE: usize = 16;

/// Collection id addressing every collection in a shutdown event
pub const ALL_COLLECTIONS: u32 = u32::MAX;

/// 128-bit object identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ObjectId {
    pub hi: u64,
    pub lo: u64,
}

impl ObjectId {
    pub const fn new(hi: u64, lo: u64) -> Self {
        Self { hi, lo }
    }

    pub const fn from_u128(v: u128) -> Self {
        Self {
            hi: (v >> 64) as u64,
            lo: v as u64,
        }
    }

    pub const fn as_u128(self) -> u128 {
        ((self.hi as u128) << 64) | self.lo as u128
    }

    pub fn read(view: &MemoryView<'_>, offset: usize) -> Self {
        Self::new(view.read_u64(offset), view.read_u64(offset + 8))
    }

    pub fn write(self, view: &MemoryView<'_>, offset: usize) {
        view.write_u64(offset, self.hi);
        view.write_u64(offset + 8, self.lo);
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}{:016x}", self.hi, self.lo)
    }
}

/// Bitmask of object fields, one bit per schema field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FieldMask(pub u64);

impl FieldMask {
    pub const EMPTY: FieldMask = FieldMask(0);
    pub const ALL: FieldMask = FieldMask(u64::MAX);

    /// Mask with only field `index` set
    pub const fn bit(index: u32) -> Self {
        FieldMask(1 << index)
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn intersects(self, other: FieldMask) -> bool {
        self.0 & other.0 != 0
    }

    #[inline]
    pub const fn contains(self, other: FieldMask) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for FieldMask {
    type Output = FieldMask;
    fn bitor(self, rhs: FieldMask) -> FieldMask {
        FieldMask(self.0 | rhs.0)
    }
}

impl BitOrAssign for FieldMask {
    fn bitor_assign(&mut self, rhs: FieldMask) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for FieldMask {
    type Output = FieldMask;
    fn bitand(self, rhs: FieldMask) -> FieldMask {
        FieldMask(self.0 & rhs.0)
    }
}

impl BitAndAssign for FieldMask {
    fn bitand_assign(&mut self, rhs: FieldMask) {
        self.0 &= rhs.0;
    }
}

impl Not for FieldMask {
    type Output = FieldMask;
    fn not(self) -> FieldMask {
        FieldMask(!self.0)
    }
}

/// Type tag of a change-log record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ChangeEventType {
    CreateObject = 1,
    UpdateObject = 2,
    DeleteObject = 3,
    UpsertObject = 4,
    FullReconcile = 5,
    Shutdown = 6,
}

impl ChangeEventType {
    pub fn from_tag(tag: u32) -> Option<Self> {
        Some(match tag {
            1 => Self::CreateObject,
            2 => Self::UpdateObject,
            3 => Self::DeleteObject,
            4 => Self::UpsertObject,
            5 => Self::FullReconcile,
            6 => Self::Shutdown,
            _ => return None,
        })
    }

    /// True for events that carry a field mask and field data
    pub fn carries_fields(self) -> bool {
        matches!(
            self,
            Self::CreateObject | Self::UpdateObject | Self::UpsertObject
        )
    }
}

/// Encode a timestamp as the wire's millisecond delta
pub fn encode_delta(timestamp_us: u64, base_us: u64) -> i32 {
    let delta_ms = timestamp_us.saturating_sub(base_us) / 1000;
    delta_ms.min(i32::MAX as u64) as i32
}

/// Restore a timestamp from its wire delta
pub fn decode_delta(delta_ms: i32, base_us: u64) -> u64 {
    base_us + (delta_ms.max(0) as u64) * 1000
}

/// Write the event header at the start of `record`
pub fn write_event_header(record: &MemoryView<'_>, kind: ChangeEventType, delta_ms: i32) {
    record.write_u32(0, kind as u32);
    record.write_i32(4, delta_ms);
}

/// Body size of an object event carrying `data_len` bytes of fields
pub fn object_body_size(kind: ChangeEventType, data_len: usize) -> usize {
    if kind.carries_fields() {
        OBJECT_HEADER_SIZE + FIELDS_SIZE + data_len
    } else {
        OBJECT_HEADER_SIZE
    }
}

/// Encode an object event body, returning the view for its field data
pub fn write_object_body<'a>(
    body: MemoryView<'a>,
    kind: ChangeEventType,
    object_id: ObjectId,
    collection_id: u32,
    fields: FieldMask,
) -> MemoryView<'a> {
    object_id.write(&body, 0);
    body.write_u32(16, collection_id);
    body.write_u32(20, 0);
    if kind.carries_fields() {
        body.write_u64(OBJECT_HEADER_SIZE, fields.0);
        body.tail(OBJECT_HEADER_SIZE + FIELDS_SIZE)
    } else {
        body.tail(OBJECT_HEADER_SIZE)
    }
}

/// Body size of a full reconcile over `count` ids
pub fn full_reconcile_body_size(count: usize) -> usize {
    8 + count * OBJECT_ID_SIZE
}

pub fn write_full_reconcile_body(body: &MemoryView<'_>, collection_id: u32, ids: &[ObjectId]) {
    body.write_u32(0, collection_id);
    body.write_u32(4, ids.len() as u32);
    for (i, id) in ids.iter().enumerate() {
        id.write(body, 8 + i * OBJECT_ID_SIZE);
    }
}

pub const SHUTDOWN_BODY_SIZE: usize = 4;

pub fn write_shutdown_body(body: &MemoryView<'_>, collection_id: u32) {
    body.write_u32(0, collection_id);
}

/// A decoded change-log record
#[derive(Debug, Clone, Copy)]
pub struct ChangeEvent<'a> {
    /// Change-log id of the record
    pub id: u32,
    /// Raw type tag; unknown tags are kept so readers can skip them
    pub tag: u32,
    /// Absolute timestamp in microseconds, millisecond resolution
    pub timestamp_us: u64,
    /// Everything after the event header
    pub body: MemoryView<'a>,
}

impl<'a> ChangeEvent<'a> {
    /// Decode a record; `None` if it is shorter than an event header
    pub fn decode(id: u32, record: MemoryView<'a>, base_us: u64) -> Option<Self> {
        if record.len() < EVENT_HEADER_SIZE {
            return None;
        }
        Some(Self {
            id,
            tag: record.read_u32(0),
            timestamp_us: decode_delta(record.read_i32(4), base_us),
            body: record.tail(EVENT_HEADER_SIZE),
        })
    }

    pub fn kind(&self) -> Option<ChangeEventType> {
        ChangeEventType::from_tag(self.tag)
    }

    /// Typed body, `None` for unknown tags or truncated records
    pub fn payload(&self) -> Option<EventPayload<'a>> {
        let kind = self.kind()?;
        let body = self.body;
        match kind {
            ChangeEventType::FullReconcile => {
                if body.len() < 8 {
                    return None;
                }
                let count = body.read_u32(4) as usize;
                if body.len() < full_reconcile_body_size(count) {
                    return None;
                }
                Some(EventPayload::FullReconcile {
                    collection_id: body.read_u32(0),
                    ids: IdList {
                        view: body.slice(8, count * OBJECT_ID_SIZE),
                    },
                })
            }
            ChangeEventType::Shutdown => {
                if body.len() < SHUTDOWN_BODY_SIZE {
                    return None;
                }
                Some(EventPayload::Shutdown {
                    collection_id: body.read_u32(0),
                })
            }
            _ => {
                if body.len() < object_body_size(kind, 0) {
                    return None;
                }
                let (fields, data) = if kind.carries_fields() {
                    (
                        FieldMask(body.read_u64(OBJECT_HEADER_SIZE)),
                        body.tail(OBJECT_HEADER_SIZE + FIELDS_SIZE),
                    )
                } else {
                    (FieldMask::EMPTY, body.tail(OBJECT_HEADER_SIZE))
                };
                Some(EventPayload::Object(ObjectEvent {
                    kind,
                    object_id: ObjectId::read(&body, 0),
                    collection_id: body.read_u32(16),
                    fields,
                    data,
                }))
            }
        }
    }
}

/// Typed view of a change-event body
#[derive(Debug, Clone, Copy)]
pub enum EventPayload<'a> {
    Object(ObjectEvent<'a>),
    FullReconcile { collection_id: u32, ids: IdList<'a> },
    Shutdown { collection_id: u32 },
}

/// Create, update, upsert or delete of one object
#[derive(Debug, Clone, Copy)]
pub struct ObjectEvent<'a> {
    pub kind: ChangeEventType,
    pub object_id: ObjectId,
    pub collection_id: u32,
    pub fields: FieldMask,
    pub data: MemoryView<'a>,
}

/// Packed array of object ids inside a record
#[derive(Debug, Clone, Copy)]
pub struct IdList<'a> {
    view: MemoryView<'a>,
}

impl<'a> IdList<'a> {
    pub fn len(&self) -> usize {
        self.view.len() / OBJECT_ID_SIZE
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: usize) -> Option<ObjectId> {
        (index < self.len()).then(|| ObjectId::read(&self.view, index * OBJECT_ID_SIZE))
    }

    pub fn iter(&self) -> impl Iterator<Item = ObjectId> + 'a {
        let view = self.view;
        (0..self.len()).map(move |i| ObjectId::read(&view, i * OBJECT_ID_SIZE))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ptr::NonNull;

    fn scratch(buf: &mut Vec<u64>) -> MemoryView<'_> {
        let len = buf.len() * 8;
        unsafe { MemoryView::from_raw_parts(NonNull::new(buf.as_mut_ptr().cast()).unwrap(), len) }
    }

    #[test]
    fn test_delta_truncates_to_milliseconds() {
        let base = 1_000_000_000;
        let delta = encode_delta(base + 12_345_678, base);
        assert_eq!(delta, 12_345);
        assert_eq!(decode_delta(delta, base), base + 12_345_000);
        assert_eq!(encode_delta(base - 5, base), 0);
    }

    #[test]
    fn test_update_event_decodes() {
        let mut buf = vec![0u64; 16];
        let data_len = 12;
        let record = scratch(&mut buf);
        let size = EVENT_HEADER_SIZE + object_body_size(ChangeEventType::UpdateObject, data_len);
        let record = record.slice(0, size);

        write_event_header(&record, ChangeEventType::UpdateObject, 42);
        let data = write_object_body(
            record.tail(EVENT_HEADER_SIZE),
            ChangeEventType::UpdateObject,
            ObjectId::new(1, 2),
            7,
            FieldMask::bit(3),
        );
        assert_eq!(data.len(), data_len);
        data.write_u32(0, 99);

        let event = ChangeEvent::decode(5, record, 1_000).unwrap();
        assert_eq!(event.timestamp_us, 43_000);
        match event.payload().unwrap() {
            EventPayload::Object(obj) => {
                assert_eq!(obj.kind, ChangeEventType::UpdateObject);
                assert_eq!(obj.object_id, ObjectId::new(1, 2));
                assert_eq!(obj.collection_id, 7);
                assert_eq!(obj.fields, FieldMask::bit(3));
                assert_eq!(obj.data.read_u32(0), 99);
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_full_reconcile_ids() {
        let mut buf = vec![0u64; 16];
        let ids = [ObjectId::from_u128(5), ObjectId::from_u128(u128::MAX)];
        let view = scratch(&mut buf);
        let record = view.slice(0, EVENT_HEADER_SIZE + full_reconcile_body_size(ids.len()));
        write_event_header(&record, ChangeEventType::FullReconcile, 0);
        write_full_reconcile_body(&record.tail(EVENT_HEADER_SIZE), 3, &ids);

        let event = ChangeEvent::decode(0, record, 0).unwrap();
        let EventPayload::FullReconcile { collection_id, ids: list } = event.payload().unwrap() else {
            panic!("expected full reconcile");
        };
        assert_eq!(collection_id, 3);
        assert_eq!(list.iter().collect::<Vec<_>>(), ids.to_vec());
        assert_eq!(list.get(2), None);
    }

    #[test]
    fn test_unknown_and_truncated_records() {
        let mut buf = vec![0u64; 4];
        let view = scratch(&mut buf);
        view.write_u32(0, 77);
        let event = ChangeEvent::decode(0, view, 0).unwrap();
        assert!(event.kind().is_none());
        assert!(event.payload().is_none());

        let short = view.slice(0, EVENT_HEADER_SIZE + 4);
        write_event_header(&short, ChangeEventType::DeleteObject, 0);
        assert!(ChangeEvent::decode(0, short, 0).unwrap().payload().is_none());
        assert!(ChangeEvent::decode(0, view.slice(0, 4), 0).is_none());
    }

    #[test]
    fn test_field_mask_ops() {
        let a = FieldMask::bit(0) | FieldMask::bit(5);
        assert!(a.intersects(FieldMask::bit(5)));
        assert!(!a.intersects(FieldMask::bit(1)));
        assert!(a.contains(FieldMask::bit(0)));
        assert_eq!(a & FieldMask::bit(0), FieldMask::bit(0));
        assert!((a & !a).is_empty());
        assert_eq!(ObjectId::from_u128(0x1_0000_0000_0000_0002).to_string(),
            "00000000000000010000000000000002");
    }
}
