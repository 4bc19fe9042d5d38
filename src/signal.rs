//! Named signal streams
//!
//! A producer process owns a [`SignalWriter`] and any number of consumers
//! attach with [`SignalReader`]. The producer never blocks; slow readers skip
//! ahead when the ring laps them.

use crate::error::{MirrorError, Result};
use crate::region::{Backing, SharedRegion};
use crate::spmc::{ReadOutcome, SpmcIterator, SpmcRingBuffer};
use crate::view::MemoryView;

/// Default bytes per block, including the 4-byte length field
const DEFAULT_BLOCK_SIZE: u32 = 256;

/// Default number of blocks
const DEFAULT_BLOCK_COUNT: u32 = 1024;

/// Signal ring geometry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalConfig {
    /// Bytes per block, a multiple of 4
    pub block_size: u32,
    /// Number of blocks
    pub block_count: u32,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            block_count: DEFAULT_BLOCK_COUNT,
        }
    }
}

impl SignalConfig {
    pub fn region_size(&self) -> usize {
        SpmcRingBuffer::required_size(self.block_size, self.block_count)
    }
}

/// Where a new reader starts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartAt {
    /// Oldest entry still retained
    Oldest,
    /// Only entries published after connecting
    #[default]
    End,
}

/// Producer side of a signal stream
pub struct SignalWriter {
    region: SharedRegion,
    block_size: u32,
    block_count: u32,
}

impl SignalWriter {
    /// Create the stream called `name`, or resume one left by an earlier writer.
    ///
    /// An existing stream keeps its entries and write position. It is refused
    /// if its size or block geometry differs from `config`.
    pub fn create(name: &str, config: SignalConfig, backing: Backing) -> Result<Self> {
        let region = SharedRegion::open_or_create(name, config.region_size(), backing)?;
        let ring = if region.created() {
            SpmcRingBuffer::init(region.view(), config.block_size)?
        } else {
            Self::resume(&region, config)?
        };
        let block_count = ring.block_count();
        tracing::info!(
            name,
            block_size = config.block_size,
            block_count,
            resumed_at = ring.write_index(),
            reused = !region.created(),
            "signal stream created"
        );
        Ok(Self {
            region,
            block_size: config.block_size,
            block_count,
        })
    }

    fn resume(region: &SharedRegion, config: SignalConfig) -> Result<SpmcRingBuffer<'_>> {
        if region.len() != config.region_size() {
            tracing::error!(
                name = region.name(),
                expected = config.region_size(),
                got = region.len(),
                "signal stream has a different size"
            );
            return Err(MirrorError::LayoutMismatch {
                expected: config.region_size(),
                got: region.len(),
            });
        }
        match SpmcRingBuffer::attach(region.view()) {
            Ok(ring)
                if ring.block_size() == config.block_size
                    && ring.block_count() == config.block_count =>
            {
                Ok(ring)
            }
            Ok(ring) => {
                tracing::error!(
                    name = region.name(),
                    block_size = ring.block_size(),
                    block_count = ring.block_count(),
                    "signal stream has a different geometry"
                );
                Err(MirrorError::GeometryMismatch {
                    block_size: config.block_size,
                    block_count: config.block_count,
                    existing_block_size: ring.block_size(),
                    existing_block_count: ring.block_count(),
                })
            }
            // The previous writer died before formatting it
            Err(MirrorError::Uninitialized(_)) => SpmcRingBuffer::init(region.view(), config.block_size),
            Err(e) => Err(e),
        }
    }

    fn ring(&self) -> SpmcRingBuffer<'_> {
        SpmcRingBuffer::from_validated(self.region.view(), self.block_size, self.block_count)
    }

    /// Publish an entry of `size` bytes filled in place by `fill`.
    ///
    /// Returns false if the entry is empty or larger than the ring.
    pub fn write<F>(&mut self, size: usize, fill: F) -> bool
    where
        F: FnOnce(MemoryView<'_>),
    {
        let ring = self.ring();
        let Ok(len) = i32::try_from(size) else {
            tracing::warn!(size, "signal entry too large");
            return false;
        };
        if size > ring.max_payload() {
            tracing::warn!(size, max = ring.max_payload(), "signal entry too large");
            return false;
        }
        ring.write(len, fill)
    }

    /// Publish a copy of `data`
    pub fn write_bytes(&mut self, data: &[u8]) -> bool {
        self.write(data.len(), |out| out.write_bytes(0, data))
    }

    pub fn name(&self) -> &str {
        self.region.name()
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn block_count(&self) -> u32 {
        self.block_count
    }

    /// Largest entry that fits
    pub fn max_payload(&self) -> usize {
        self.ring().max_payload()
    }

    /// Blocks published so far
    pub fn write_index(&self) -> u32 {
        self.ring().write_index()
    }
}

/// Consumer side of a signal stream
pub struct SignalReader {
    region: SharedRegion,
    block_size: u32,
    block_count: u32,
    cursor: SpmcIterator,
    stale_reads: u64,
}

impl SignalReader {
    /// Attach to the stream called `name`
    pub fn connect(name: &str, backing: Backing, start: StartAt) -> Result<Self> {
        let region = SharedRegion::open(name, backing)?;
        let ring = SpmcRingBuffer::attach(region.view())?;
        let cursor = match start {
            StartAt::Oldest => SpmcIterator::at_oldest(&ring),
            StartAt::End => SpmcIterator::at_end(&ring),
        };
        let (block_size, block_count) = (ring.block_size(), ring.block_count());
        tracing::debug!(name, cursor = cursor.cursor(), "signal reader connected");
        Ok(Self {
            region,
            block_size,
            block_count,
            cursor,
            stale_reads: 0,
        })
    }

    /// Hand the next entry to `read`.
    ///
    /// On [`ReadOutcome::Stale`] whatever `read` copied must be discarded.
    pub fn read_next<F>(&mut self, read: F) -> ReadOutcome
    where
        F: FnOnce(MemoryView<'_>),
    {
        let ring = SpmcRingBuffer::from_validated(self.region.view(), self.block_size, self.block_count);
        if self.cursor.has_missed_entries(&ring) {
            tracing::debug!(
                cursor = self.cursor.cursor(),
                oldest = ring.min_read_index(),
                "signal reader lapped; skipping ahead"
            );
        }
        let outcome = self.cursor.read_next(&ring, read);
        if outcome == ReadOutcome::Stale {
            self.stale_reads += 1;
            tracing::debug!(cursor = self.cursor.cursor(), "signal entry overwritten while reading");
        }
        outcome
    }

    /// Copy the next entry into `buf`, replacing its contents
    pub fn read_into(&mut self, buf: &mut Vec<u8>) -> ReadOutcome {
        let outcome = self.read_next(|entry| {
            buf.resize(entry.len(), 0);
            entry.read_bytes(0, buf);
        });
        if outcome != ReadOutcome::Read {
            buf.clear();
        }
        outcome
    }

    pub fn has_next(&self) -> bool {
        self.cursor.has_next(&self.ring())
    }

    pub fn has_missed_entries(&self) -> bool {
        self.cursor.has_missed_entries(&self.ring())
    }

    /// Reads discarded because the producer overwrote the entry mid-copy
    pub fn stale_reads(&self) -> u64 {
        self.stale_reads
    }

    pub fn name(&self) -> &str {
        self.region.name()
    }

    fn ring(&self) -> SpmcRingBuffer<'_> {
        SpmcRingBuffer::from_validated(self.region.view(), self.block_size, self.block_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> SignalConfig {
        SignalConfig {
            block_size: 16,
            block_count: 8,
        }
    }

    #[test]
    fn test_default_config() {
        let config = SignalConfig::default();
        assert_eq!(config.block_size, 256);
        assert_eq!(config.block_count, 1024);
        assert_eq!(config.region_size(), SpmcRingBuffer::HEADER_SIZE + 256 * 1024);
    }

    #[test]
    fn test_write_then_read() {
        let mut writer = SignalWriter::create("test_signal_basic", small(), Backing::Heap).unwrap();
        let mut reader = SignalReader::connect("test_signal_basic", Backing::Heap, StartAt::Oldest).unwrap();

        assert!(writer.write_bytes(b"ping"));
        assert!(writer.write_bytes(b"a longer payload spanning blocks"));

        let mut buf = Vec::new();
        assert_eq!(reader.read_into(&mut buf), ReadOutcome::Read);
        assert_eq!(buf, b"ping");
        assert_eq!(reader.read_into(&mut buf), ReadOutcome::Read);
        assert_eq!(buf, b"a longer payload spanning blocks");
        assert_eq!(reader.read_into(&mut buf), ReadOutcome::Empty);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_start_at_end_skips_history() {
        let mut writer = SignalWriter::create("test_signal_end", small(), Backing::Heap).unwrap();
        writer.write_bytes(b"old");
        let mut reader = SignalReader::connect("test_signal_end", Backing::Heap, StartAt::End).unwrap();
        assert!(!reader.has_next());

        writer.write_bytes(b"new");
        let mut buf = Vec::new();
        assert_eq!(reader.read_into(&mut buf), ReadOutcome::Read);
        assert_eq!(buf, b"new");
    }

    #[test]
    fn test_lapped_reader_skips_to_oldest() {
        let mut writer = SignalWriter::create("test_signal_lap", small(), Backing::Heap).unwrap();
        let mut reader = SignalReader::connect("test_signal_lap", Backing::Heap, StartAt::Oldest).unwrap();
        for i in 0u32..20 {
            assert!(writer.write_bytes(&i.to_le_bytes()));
        }
        assert!(reader.has_missed_entries());

        let mut seen = Vec::new();
        let mut buf = Vec::new();
        while reader.read_into(&mut buf) == ReadOutcome::Read {
            seen.push(u32::from_le_bytes(buf[..4].try_into().unwrap()));
        }
        // Eight one-block entries fit
        assert_eq!(seen, (12..20).collect::<Vec<_>>());
    }

    #[test]
    fn test_oversize_and_empty_rejected() {
        let mut writer = SignalWriter::create("test_signal_oversize", small(), Backing::Heap).unwrap();
        assert!(!writer.write_bytes(&[]));
        let too_big = vec![0u8; writer.max_payload() + 1];
        assert!(!writer.write_bytes(&too_big));
        assert_eq!(writer.write_index(), 0);
    }

    #[test]
    fn test_conflicting_geometry_rejected() {
        let mut writer = SignalWriter::create("test_signal_geometry", small(), Backing::Heap).unwrap();
        let mut reader = SignalReader::connect("test_signal_geometry", Backing::Heap, StartAt::Oldest).unwrap();
        assert!(writer.write_bytes(b"first"));

        let bigger = SignalConfig {
            block_size: 32,
            block_count: 64,
        };
        let err = SignalWriter::create("test_signal_geometry", bigger, Backing::Heap).err().unwrap();
        assert!(matches!(err, MirrorError::LayoutMismatch { .. }));

        // Same byte size, different blocks
        let reshaped = SignalConfig {
            block_size: 32,
            block_count: 4,
        };
        assert_eq!(reshaped.region_size(), small().region_size());
        let err = SignalWriter::create("test_signal_geometry", reshaped, Backing::Heap).err().unwrap();
        assert!(matches!(
            err,
            MirrorError::GeometryMismatch {
                existing_block_size: 16,
                existing_block_count: 8,
                ..
            }
        ));

        let mut buf = Vec::new();
        assert_eq!(reader.read_into(&mut buf), ReadOutcome::Read);
        assert_eq!(buf, b"first");
    }

    #[test]
    fn test_restarted_writer_resumes_stream() {
        let mut writer = SignalWriter::create("test_signal_resume", small(), Backing::Heap).unwrap();
        let mut reader = SignalReader::connect("test_signal_resume", Backing::Heap, StartAt::Oldest).unwrap();
        assert!(writer.write_bytes(b"before"));
        drop(writer);

        let mut writer = SignalWriter::create("test_signal_resume", small(), Backing::Heap).unwrap();
        assert_eq!(writer.write_index(), 1);
        assert!(writer.write_bytes(b"after"));

        let mut buf = Vec::new();
        assert_eq!(reader.read_into(&mut buf), ReadOutcome::Read);
        assert_eq!(buf, b"before");
        assert_eq!(reader.read_into(&mut buf), ReadOutcome::Read);
        assert_eq!(buf, b"after");
    }

    #[test]
    fn test_connect_missing_stream() {
        assert!(SignalReader::connect("test_signal_missing", Backing::Heap, StartAt::End).is_err());
    }
}
