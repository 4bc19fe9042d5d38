//! Example producer
//!
//! Owns a small collection of gauges and publishes their changes through a
//! shared-memory session. Run `state_consumer` with the same name to mirror
//! them.

use std::time::{Duration, Instant};
use venom_mirror::{
    FieldMask, LocalCollection, MemoryView, ObjectId, Reconciled, SessionConfig, TransportSession,
};

const GAUGES: u32 = 1;
const LEVEL: FieldMask = FieldMask::bit(0);
const PEAK: FieldMask = FieldMask::bit(1);

#[derive(Debug, Default)]
struct Gauge {
    level: u32,
    peak: u32,
}

impl Reconciled for Gauge {
    fn encoded_len(&self, fields: FieldMask) -> usize {
        [LEVEL, PEAK].iter().filter(|f| fields.contains(**f)).count() * 4
    }

    fn encode(&self, fields: FieldMask, out: MemoryView<'_>) {
        let mut offset = 0;
        if fields.contains(LEVEL) {
            out.write_u32(offset, self.level);
            offset += 4;
        }
        if fields.contains(PEAK) {
            out.write_u32(offset, self.peak);
        }
    }

    fn apply(&mut self, encoded: FieldMask, accept: FieldMask, data: MemoryView<'_>) {
        let mut offset = 0;
        if encoded.contains(LEVEL) {
            if accept.contains(LEVEL) {
                self.level = data.read_u32(offset);
            }
            offset += 4;
        }
        if encoded.contains(PEAK) && accept.contains(PEAK) {
            self.peak = data.read_u32(offset);
        }
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("venom_mirror=info".parse().unwrap()),
        )
        .with_writer(std::io::stderr)
        .init();

    let name = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "venom_mirror_demo".to_string());
    let ticks: u32 = std::env::args()
        .nth(2)
        .and_then(|s| s.parse().ok())
        .unwrap_or(600);

    println!("[Producer] Opening session '{}'", name);
    let mut session = match TransportSession::open(SessionConfig::new(name.clone())) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("[Producer] Failed to open session: {}", e);
            std::process::exit(1);
        }
    };

    let mut gauges: LocalCollection<Gauge> = LocalCollection::new(GAUGES);
    for n in 0..4u64 {
        gauges.add_object(ObjectId::new(0, n), Gauge::default());
    }

    let mut last_snapshot = Instant::now();
    for tick in 0..ticks {
        for n in 0..4u64 {
            let id = ObjectId::new(0, n);
            let level = (tick * (n as u32 + 1)) % 100;
            let raised = gauges
                .modify(id, LEVEL, |g| {
                    g.level = level;
                    level > g.peak
                })
                .unwrap_or(false);
            if raised {
                gauges.modify(id, PEAK, |g| g.peak = level);
            }
        }

        // A periodic snapshot lets lagging consumers rebuild their mirror
        let snapshot = last_snapshot.elapsed() > Duration::from_secs(5);
        let result = session.transact(100, |tx| {
            if snapshot {
                gauges.write_snapshot(tx)
            } else {
                gauges.flush(tx).map(|_| ())
            }
        });
        match result {
            Ok(()) if snapshot => {
                println!("[Producer] Tick {}: wrote snapshot", tick);
                last_snapshot = Instant::now();
            }
            Ok(()) => {}
            Err(e) => eprintln!("[Producer] Tick {}: publish failed: {}", tick, e),
        }
        if let Err(e) = session.heartbeat() {
            eprintln!("[Producer] Heartbeat failed: {}", e);
        }
        std::thread::sleep(Duration::from_millis(100));
    }

    let _ = session.transact(100, |tx| gauges.write_shutdown(tx));
    println!("[Producer] Done after {} ticks", ticks);
}
