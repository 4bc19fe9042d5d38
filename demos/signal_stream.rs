//! Signal stream example
//!
//! One writer thread publishes fixed-size frames while reader threads of
//! different speeds consume them. The slow reader gets lapped and reports how
//! many frames it skipped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use venom_mirror::{Backing, ReadOutcome, SignalConfig, SignalReader, SignalWriter, StartAt};

const FRAMES: u64 = 200_000;
const FRAME_SIZE: usize = 480;

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
        .unwrap_or_else(|| "venom_signal_demo".to_string());

    let config = SignalConfig {
        block_size: 128,
        block_count: 256,
    };
    let mut writer = match SignalWriter::create(&name, config, Backing::Shm) {
        Ok(w) => w,
        Err(e) => {
            eprintln!("[Signal] Failed to create stream: {}", e);
            std::process::exit(1);
        }
    };
    println!(
        "[Signal] Stream '{}' ready: {} blocks of {} bytes",
        name,
        writer.block_count(),
        writer.block_size()
    );

    let done = Arc::new(AtomicBool::new(false));
    let readers: Vec<_> = [("fast", Duration::ZERO), ("slow", Duration::from_micros(50))]
        .into_iter()
        .map(|(label, delay)| {
            let mut reader = SignalReader::connect(&name, Backing::Shm, StartAt::Oldest)
                .expect("writer created the stream");
            let done = Arc::clone(&done);
            thread::spawn(move || {
                let mut frame = Vec::with_capacity(FRAME_SIZE);
                let (mut received, mut last, mut skipped) = (0u64, None::<u64>, 0u64);
                loop {
                    match reader.read_into(&mut frame) {
                        ReadOutcome::Read => {
                            let seq = u64::from_le_bytes(frame[..8].try_into().unwrap());
                            if let Some(prev) = last {
                                skipped += seq - prev - 1;
                            }
                            last = Some(seq);
                            received += 1;
                            if !delay.is_zero() {
                                thread::sleep(delay);
                            }
                        }
                        ReadOutcome::Empty if done.load(Ordering::Acquire) => break,
                        ReadOutcome::Empty | ReadOutcome::Stale => thread::yield_now(),
                    }
                }
                println!(
                    "[Signal] {} reader: {} frames, {} skipped, {} stale",
                    label,
                    received,
                    skipped,
                    reader.stale_reads()
                );
            })
        })
        .collect();

    let start = Instant::now();
    let mut frame = [0u8; FRAME_SIZE];
    for seq in 0..FRAMES {
        frame[..8].copy_from_slice(&seq.to_le_bytes());
        writer.write_bytes(&frame);
    }
    let elapsed = start.elapsed();
    done.store(true, Ordering::Release);

    for reader in readers {
        let _ = reader.join();
    }
    println!(
        "[Signal] Wrote {} frames in {:.2?} ({:.0} frames/s)",
        FRAMES,
        elapsed,
        FRAMES as f64 / elapsed.as_secs_f64()
    );
}
