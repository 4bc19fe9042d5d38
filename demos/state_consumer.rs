//! Example consumer
//!
//! Mirrors the gauges published by `state_producer` and prints them.

use std::time::Duration;
use venom_mirror::{
    pump, FieldMask, MemoryView, Reconciled, RemoteCollection, SessionConfig,
    SessionState, TransportSession,
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

    fn removed(&mut self) {
        println!("[Consumer] Gauge removed (level {}, peak {})", self.level, self.peak);
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

    let mut session = match TransportSession::open(SessionConfig::new(name.clone())) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("[Consumer] Failed to open session '{}': {}", name, e);
            std::process::exit(1);
        }
    };
    println!("[Consumer] Joined session '{}'", name);

    let mut gauges = RemoteCollection::new(GAUGES, LEVEL | PEAK, |id| {
        println!("[Consumer] New gauge {}", id);
        Gauge::default()
    });

    let mut polls = 0u64;
    loop {
        match pump(&mut session, 50, &mut [&mut gauges]) {
            Ok(stats) if stats.resync_needed => {
                println!("[Consumer] Fell behind; waiting for the next snapshot");
            }
            Ok(stats) if stats.applied > 0 && polls % 20 == 0 => {
                let line: Vec<String> = gauges
                    .iter()
                    .map(|(_, g)| format!("{:3}/{:3}", g.level, g.peak))
                    .collect();
                println!("[Consumer] {}", line.join("  "));
            }
            Ok(_) => {}
            Err(e) => eprintln!("[Consumer] Pump failed: {}", e),
        }

        match session.check_health() {
            Ok(SessionState::Ready) => {}
            Ok(state) => println!("[Consumer] Session state {:?}", state),
            Err(e) => eprintln!("[Consumer] Health check failed: {}", e),
        }
        polls += 1;
        std::thread::sleep(Duration::from_millis(50));
    }
}
