use criterion::{black_box, criterion_group, criterion_main, Criterion};
use venom_mirror::placed_ring::PlacedRingBuffer;
use venom_mirror::spmc::{SpmcIterator, SpmcRingBuffer};
use venom_mirror::{
    Backing, ChangeEventType, FieldMask, MutexBackend, ObjectId, SessionConfig, SharedRegion,
    TransportSession,
};

fn bench_placed_ring_push(c: &mut Criterion) {
    let region = SharedRegion::open_or_create(
        "bench_placed_ring",
        PlacedRingBuffer::required_size(64 * 1024),
        Backing::Heap,
    )
    .unwrap();
    let ring = PlacedRingBuffer::init(region.view()).unwrap();
    let record = [0xA5u8; 48];

    c.bench_function("placed_ring_push_48b", |b| {
        b.iter(|| {
            let (_, data) = ring.push(black_box(record.len())).unwrap();
            data.write_bytes(0, black_box(&record));
        })
    });
}

fn bench_spmc_write_read(c: &mut Criterion) {
    let (block_size, block_count) = (256, 1024);
    let region = SharedRegion::open_or_create(
        "bench_spmc",
        SpmcRingBuffer::required_size(block_size, block_count),
        Backing::Heap,
    )
    .unwrap();
    let ring = SpmcRingBuffer::init(region.view(), block_size).unwrap();
    let frame = [0x5Au8; 512];
    let mut reader = SpmcIterator::at_end(&ring);
    let mut copy = vec![0u8; frame.len()];

    c.bench_function("spmc_write_read_512b", |b| {
        b.iter(|| {
            ring.write(frame.len() as i32, |out| out.write_bytes(0, black_box(&frame)));
            black_box(reader.read_next(&ring, |entry| entry.read_bytes(0, &mut copy)));
        })
    });
}

fn bench_session_transaction(c: &mut Criterion) {
    let config = SessionConfig {
        backing: Backing::Heap,
        mutex_backend: MutexBackend::platform_default(),
        ..SessionConfig::new(format!("bench_session_{}", std::process::id()))
    };
    let mut session = TransportSession::open(config).unwrap();
    let id = ObjectId::new(1, 2);

    c.bench_function("session_update_event", |b| {
        b.iter(|| {
            session
                .transact(100, |tx| {
                    let data =
                        tx.write_object_event(ChangeEventType::UpdateObject, id, 1, FieldMask::bit(0), 8)?;
                    data.write_u64(0, black_box(42));
                    tx.skip_to_end();
                    Ok(())
                })
                .unwrap()
        })
    });
}

criterion_group!(
    benches,
    bench_placed_ring_push,
    bench_spmc_write_read,
    bench_session_transaction
);
criterion_main!(benches);
