//! Transport session lifecycle across several handles

mod common;

use common::{heap_config, oid, unique_name};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};
use venom_mirror::session::FORMAT_VERSION;
use venom_mirror::{
    Backing, ChangeEventType, EventPayload, FieldMask, MirrorError, SessionState, SharedRegion,
    TransportSession,
};

#[test]
fn second_handle_reads_events_written_before_it_joined() {
    let name = unique_name("sess_join");
    let mut producer = TransportSession::open(heap_config(&name, 1024)).unwrap();
    producer
        .transact(50, |tx| {
            let data = tx.write_object_event(
                ChangeEventType::CreateObject,
                oid(7),
                3,
                FieldMask::bit(0),
                4,
            )?;
            data.write_u32(0, 42);
            Ok(())
        })
        .unwrap();

    let mut consumer = TransportSession::open(heap_config(&name, 1024)).unwrap();
    assert_eq!(consumer.state(), SessionState::Ready);
    assert_eq!(consumer.base_timestamp_us(), producer.base_timestamp_us());
    assert!(consumer.needs_processing());

    let seen = consumer
        .transact(50, |tx| {
            let event = tx.next_entry().expect("one entry");
            match event.payload() {
                Some(EventPayload::Object(obj)) => {
                    Ok((obj.kind, obj.object_id, obj.collection_id, obj.data.read_u32(0)))
                }
                other => panic!("unexpected payload {:?}", other),
            }
        })
        .unwrap();
    assert_eq!(seen, (ChangeEventType::CreateObject, oid(7), 3, 42));
    assert!(!consumer.needs_processing());
}

#[test]
fn live_region_with_other_schema_is_refused() {
    let name = unique_name("sess_schema_live");
    let _producer = TransportSession::open(heap_config(&name, 1024)).unwrap();

    let mut other = heap_config(&name, 1024);
    other.schema_hash = [1, 2, 3, 4];
    let err = TransportSession::open(other).err().unwrap();
    assert!(matches!(err, MirrorError::SchemaMismatch));
}

#[test]
fn stale_region_with_other_schema_is_rebuilt() {
    let name = unique_name("sess_schema_stale");
    let mut producer = TransportSession::open(heap_config(&name, 1024)).unwrap();
    producer.transact(50, |tx| tx.write_shutdown(0)).unwrap();
    let old_base = producer.base_timestamp_us();

    thread::sleep(Duration::from_millis(120));
    let mut other = heap_config(&name, 1024);
    other.schema_hash = [1, 2, 3, 4];
    other.stale_after = Duration::from_millis(50);
    let rebuilt = TransportSession::open(other).unwrap();

    assert_eq!(rebuilt.state(), SessionState::Ready);
    assert!(rebuilt.base_timestamp_us() > old_base);
    assert_eq!(rebuilt.changelog_head(), 0);
    assert!(!rebuilt.needs_processing());

    // The old handle notices the new epoch and finds an empty log
    let entries = producer
        .transact(50, |tx| {
            let mut n = 0;
            while tx.next_entry().is_some() {
                n += 1;
            }
            Ok(n)
        })
        .unwrap();
    assert_eq!(entries, 0);
}

#[test]
fn different_changelog_size_is_a_layout_mismatch() {
    let name = unique_name("sess_layout");
    let _producer = TransportSession::open(heap_config(&name, 1024)).unwrap();
    let err = TransportSession::open(heap_config(&name, 2048)).err().unwrap();
    assert!(matches!(err, MirrorError::LayoutMismatch { .. }));
}

#[test]
fn joiner_takes_over_an_unfinished_region() {
    let name = unique_name("sess_takeover");
    let config = heap_config(&name, 1024);
    // A creator that died before writing anything
    let _abandoned = SharedRegion::open_or_create(&name, config.total_size(), Backing::Heap).unwrap();

    let started = Instant::now();
    let session = TransportSession::open(config.clone()).unwrap();
    // The creator gets the lock timeout to finish before a takeover
    assert!(started.elapsed() >= Duration::from_millis(config.lock_timeout_ms.into()));
    assert_eq!(session.state(), SessionState::Ready);
    assert_ne!(session.base_timestamp_us(), 0);
}

#[test]
fn live_region_with_other_format_version_is_refused() {
    let name = unique_name("sess_version");
    let _producer = TransportSession::open(heap_config(&name, 1024)).unwrap();
    let raw = SharedRegion::open(&name, Backing::Heap).unwrap();
    raw.view().write_u32(0, FORMAT_VERSION + 1);

    let err = TransportSession::open(heap_config(&name, 1024)).err().unwrap();
    assert!(matches!(
        err,
        MirrorError::VersionMismatch { expected, got } if expected == FORMAT_VERSION && got == FORMAT_VERSION + 1
    ));

    // Once its producer goes quiet the same region is rebuilt
    thread::sleep(Duration::from_millis(120));
    let mut config = heap_config(&name, 1024);
    config.stale_after = Duration::from_millis(50);
    let rebuilt = TransportSession::open(config).unwrap();
    assert_eq!(rebuilt.state(), SessionState::Ready);
    assert_eq!(raw.view().read_u32(0), FORMAT_VERSION);
}

#[test]
fn abandoned_shm_region_of_another_size_is_replaced() {
    let name = unique_name("sess_resize");
    let mut config = heap_config(&name, 1024);
    config.backing = Backing::Shm;
    config.stale_after = Duration::from_millis(50);

    // Header of a producer that died long ago, built with another layout
    let old = SharedRegion::open_or_create(&name, config.total_size() + 4096, Backing::Shm).unwrap();
    old.view().write_u64(40, 1);
    old.view().write_u64(48, 1);
    // A crashed producer never unlinks its segment
    std::mem::forget(old);

    let session = TransportSession::open(config).unwrap();
    assert_eq!(session.state(), SessionState::Ready);
    assert!(session.base_timestamp_us() > 1);
    assert_eq!(session.changelog_head(), 0);
}

#[test]
fn live_shm_region_of_another_size_is_refused() {
    let name = unique_name("sess_resize_live");
    let mut config = heap_config(&name, 1024);
    config.backing = Backing::Shm;
    let _producer = TransportSession::open(config.clone()).unwrap();

    config.changelog_size = 2048;
    let err = TransportSession::open(config).err().unwrap();
    assert!(matches!(err, MirrorError::LayoutMismatch { .. }));
}

#[test]
fn transact_times_out_while_another_handle_holds_the_lock() {
    let name = unique_name("sess_timeout");
    let mut holder = TransportSession::open(heap_config(&name, 1024)).unwrap();
    let mut waiter = TransportSession::open(heap_config(&name, 1024)).unwrap();

    let (locked_tx, locked_rx) = mpsc::channel();
    let handle = thread::spawn(move || {
        holder
            .transact(100, |_tx| {
                locked_tx.send(()).unwrap();
                thread::sleep(Duration::from_millis(300));
                Ok(())
            })
            .unwrap();
    });

    locked_rx.recv().unwrap();
    let err = waiter.transact(20, |_tx| Ok(())).unwrap_err();
    assert!(matches!(err, MirrorError::LockTimeout { timeout_ms: 20 }));

    handle.join().unwrap();
    waiter.transact(100, |_tx| Ok(())).unwrap();
}

#[test]
fn lagging_handle_detects_missed_entries_and_resyncs() {
    let name = unique_name("sess_missed");
    let mut consumer = TransportSession::open(heap_config(&name, 256)).unwrap();
    let mut producer = TransportSession::open(heap_config(&name, 256)).unwrap();

    producer
        .transact(50, |tx| {
            for collection in 0..50 {
                tx.write_shutdown(collection)?;
            }
            Ok(())
        })
        .unwrap();
    assert_eq!(producer.changelog_head(), 50);

    let collections = consumer
        .transact(50, |tx| {
            assert!(tx.has_missed_entries());
            assert!(tx.next_entry().is_none());
            tx.resync_to_oldest();
            let mut seen = Vec::new();
            while let Some(event) = tx.next_entry() {
                match event.payload() {
                    Some(EventPayload::Shutdown { collection_id }) => seen.push(collection_id),
                    other => panic!("unexpected payload {:?}", other),
                }
            }
            Ok(seen)
        })
        .unwrap();

    assert!(!collections.is_empty() && collections.len() < 50);
    assert_eq!(collections.last(), Some(&49));
    assert!(collections.windows(2).all(|w| w[1] == w[0] + 1));
}

#[test]
fn health_check_rebuilds_after_producer_goes_quiet() {
    let name = unique_name("sess_health");
    let mut config = heap_config(&name, 1024);
    config.stale_after = Duration::from_millis(50);
    let mut session = TransportSession::open(config).unwrap();
    let base = session.base_timestamp_us();

    assert_eq!(session.check_health().unwrap(), SessionState::Ready);
    thread::sleep(Duration::from_millis(120));
    assert!(session.is_stale());
    assert_eq!(session.check_health().unwrap(), SessionState::Ready);
    assert!(session.base_timestamp_us() > base);
    assert!(!session.is_stale());
}
