//! Transport session over a shared change-log region
//!
//! A session owns one named region laid out as a fixed header followed by a
//! [`PlacedRingBuffer`] used as the change log. Writers append change events
//! inside [`TransportSession::transact`], which holds the interprocess lock
//! for the duration of the body. Readers poll with the lock-free
//! [`TransportSession::needs_processing`] and then drain entries inside a
//! transaction.
//!
//! # Header layout
//!
//! ```text
//! +0   version            u32
//! +4   total_size         u32
//! +8   schema_hash        [u64; 4]
//! +40  base_timestamp_us  u64   atomic, 0 = not initialized, written last
//! +48  last_update_us     u64   atomic
//! +56  changelog_head     u32   atomic, one past the newest change-log id
//! +60  changelog_size     u32
//! +64  change log (PlacedRingBuffer)
//! ```

use crate::error::{MirrorError, Result};
use crate::event::{
    self, ChangeEvent, ChangeEventType, FieldMask, ObjectId, EVENT_HEADER_SIZE,
};
use crate::mutex::{lock_guard, open_mutex, InterprocessMutex, MutexBackend};
use crate::placed_ring::{PlacedRingBuffer, PlacedRingIterator};
use crate::region::{Backing, SharedRegion, ShmSegment};
use crate::view::MemoryView;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Layout version written by this build
pub const FORMAT_VERSION: u32 = 1;

pub const HEADER_SIZE: usize = 64;

const VERSION: usize = 0;
const TOTAL_SIZE: usize = 4;
const SCHEMA_HASH: usize = 8;
const BASE_TIMESTAMP: usize = 40;
const LAST_UPDATE: usize = 48;
const CHANGELOG_HEAD: usize = 56;
const CHANGELOG_SIZE: usize = 60;

/// Default change-log pool (64KB)
const DEFAULT_CHANGELOG_SIZE: usize = 64 * 1024;

/// 256-bit hash of the schema both ends were generated from
pub type SchemaHash = [u64; 4];

/// Current wall-clock time in microseconds, never zero
pub fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
        .max(1)
}

/// True when a region's header shows a producer that stopped updating it
fn region_abandoned(region: &SharedRegion, stale_after: Duration) -> bool {
    if region.len() < HEADER_SIZE {
        return false;
    }
    let header = region.view().slice(0, HEADER_SIZE);
    if header.atomic_u64(BASE_TIMESTAMP).load_acquire() == 0 {
        return false;
    }
    let age = now_micros().saturating_sub(header.atomic_u64(LAST_UPDATE).load_acquire());
    Duration::from_micros(age) > stale_after
}

/// Session configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Region and lock name shared by every participant
    pub name: String,
    pub backing: Backing,
    pub mutex_backend: MutexBackend,
    /// Bytes of change-log pool
    pub changelog_size: usize,
    pub schema_hash: SchemaHash,
    /// Lock wait used while opening and for health checks
    pub lock_timeout_ms: u32,
    /// A region not updated for this long is considered abandoned
    pub stale_after: Duration,
    /// Producers write a heartbeat when idle for this long
    pub heartbeat_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            name: "venom_session".to_string(),
            backing: Backing::Shm,
            mutex_backend: MutexBackend::platform_default(),
            changelog_size: DEFAULT_CHANGELOG_SIZE,
            schema_hash: [0; 4],
            lock_timeout_ms: 100,
            stale_after: Duration::from_secs(20),
            heartbeat_interval: Duration::from_secs(1),
        }
    }
}

impl SessionConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Total region size for this configuration
    pub fn total_size(&self) -> usize {
        HEADER_SIZE + PlacedRingBuffer::required_size(self.changelog_size)
    }
}

/// Lifecycle of a session's view of its region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Initializing,
    Ready,
    /// The region went stale and is about to be rebuilt
    Expired,
    Reinitializing,
}

/// One participant's handle on a shared change-log region
pub struct TransportSession {
    region: SharedRegion,
    mutex: Box<dyn InterprocessMutex>,
    config: SessionConfig,
    state: SessionState,
    cursor: PlacedRingIterator,
    /// Base timestamp the cursor belongs to; changes on reinitialization
    epoch: u64,
}

impl TransportSession {
    /// Create or join the session named in `config`
    pub fn open(config: SessionConfig) -> Result<Self> {
        let size = config.total_size();
        let mut region = SharedRegion::open_or_create(&config.name, size, config.backing)?;
        if region.len() != size
            && config.backing == Backing::Shm
            && region_abandoned(&region, config.stale_after)
        {
            tracing::warn!(
                name = %config.name,
                expected = size,
                got = region.len(),
                "abandoned session region has a different layout, replacing it"
            );
            drop(region);
            if let Err(e) = ShmSegment::unlink(&config.name) {
                // Another opener may have replaced it first
                tracing::debug!(name = %config.name, error = %e, "unlink of abandoned region failed");
            }
            region = SharedRegion::open_or_create(&config.name, size, config.backing)?;
        }
        if region.len() != size {
            tracing::error!(
                name = %config.name,
                expected = size,
                got = region.len(),
                "session region has a different layout; unlink it if its producer is gone"
            );
            return Err(MirrorError::LayoutMismatch {
                expected: size,
                got: region.len(),
            });
        }
        let mutex = open_mutex(&config.name, config.mutex_backend, config.backing)?;

        let mut session = Self {
            region,
            mutex,
            config,
            state: SessionState::Uninitialized,
            cursor: PlacedRingIterator::default(),
            epoch: 0,
        };

        if session.region.created() {
            session.initialize(SessionState::Initializing)?;
        } else {
            session.join()?;
        }
        session.sync_cursor();
        Ok(session)
    }

    fn header(&self) -> MemoryView<'_> {
        self.region.view().slice(0, HEADER_SIZE)
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Next change-log id this session will read
    pub fn cursor(&self) -> u32 {
        self.cursor.cursor()
    }

    /// Session base timestamp, 0 while uninitialized
    pub fn base_timestamp_us(&self) -> u64 {
        self.header().atomic_u64(BASE_TIMESTAMP).load_acquire()
    }

    pub fn last_update_us(&self) -> u64 {
        self.header().atomic_u64(LAST_UPDATE).load_acquire()
    }

    /// One past the newest change-log id
    pub fn changelog_head(&self) -> u32 {
        self.header().atomic_u32(CHANGELOG_HEAD).load_acquire()
    }

    /// Write a fresh header and empty change log. Caller holds the lock.
    fn write_header(&self) -> Result<u64> {
        let view = self.region.view();
        let header = view.slice(0, HEADER_SIZE);
        let base = header.atomic_u64(BASE_TIMESTAMP);

        base.store_release(0);
        header.write_u32(VERSION, FORMAT_VERSION);
        header.write_u32(TOTAL_SIZE, view.len() as u32);
        for (i, word) in self.config.schema_hash.iter().enumerate() {
            header.write_u64(SCHEMA_HASH + i * 8, *word);
        }
        header.write_u32(CHANGELOG_SIZE, self.config.changelog_size as u32);
        PlacedRingBuffer::init(view.tail(HEADER_SIZE))?;
        header.atomic_u32(CHANGELOG_HEAD).store_release(0);

        let now = now_micros();
        header.atomic_u64(LAST_UPDATE).store_release(now);
        // Readers treat a non-zero base timestamp as "safe to read"
        base.store_release(now);
        Ok(now)
    }

    fn initialize(&mut self, state: SessionState) -> Result<()> {
        self.state = state;
        let timeout_ms = self.config.lock_timeout_ms;
        let guard = lock_guard(self.mutex.as_ref(), timeout_ms)
            .ok_or(MirrorError::LockTimeout { timeout_ms })?;
        if state == SessionState::Reinitializing && !self.is_stale() {
            // Another participant rebuilt the region while we waited
            drop(guard);
            return self.join();
        }
        if state == SessionState::Initializing && self.base_timestamp_us() != 0 {
            // A joiner took over before this handle got the lock
            drop(guard);
            return self.join();
        }
        let base = self.write_header()?;
        drop(guard);

        tracing::info!(
            name = %self.config.name,
            size = self.region.len(),
            changelog = self.config.changelog_size,
            reinitialized = state == SessionState::Reinitializing,
            "session initialized"
        );
        self.epoch = base;
        self.state = SessionState::Ready;
        Ok(())
    }

    fn join(&mut self) -> Result<()> {
        if !self.wait_for_creator() {
            let timeout_ms = self.config.lock_timeout_ms;
            let guard = lock_guard(self.mutex.as_ref(), timeout_ms)
                .ok_or(MirrorError::LockTimeout { timeout_ms })?;
            if self.base_timestamp_us() == 0 {
                tracing::warn!(name = %self.config.name, "creator never finished, taking over initialization");
                self.state = SessionState::Initializing;
                let base = self.write_header()?;
                drop(guard);
                self.epoch = base;
                self.state = SessionState::Ready;
                return Ok(());
            }
        }

        let header = self.header();
        let version = header.read_u32(VERSION);
        let mut hash = [0u64; 4];
        for (i, word) in hash.iter_mut().enumerate() {
            *word = header.read_u64(SCHEMA_HASH + i * 8);
        }
        let changelog_size = header.read_u32(CHANGELOG_SIZE) as usize;

        let mismatch = if version != FORMAT_VERSION {
            Some(MirrorError::VersionMismatch {
                expected: FORMAT_VERSION,
                got: version,
            })
        } else if hash != self.config.schema_hash {
            Some(MirrorError::SchemaMismatch)
        } else if changelog_size != self.config.changelog_size {
            Some(MirrorError::LayoutMismatch {
                expected: self.config.changelog_size,
                got: changelog_size,
            })
        } else {
            None
        };

        if self.is_stale() {
            tracing::warn!(
                name = %self.config.name,
                incompatible = mismatch.is_some(),
                "session region is stale, reinitializing"
            );
            self.state = SessionState::Expired;
            return self.initialize(SessionState::Reinitializing);
        }
        if let Some(err) = mismatch {
            tracing::error!(name = %self.config.name, error = %err, "refusing incompatible session");
            return Err(err);
        }

        self.epoch = self.base_timestamp_us();
        self.state = SessionState::Ready;
        Ok(())
    }

    /// Poll up to `lock_timeout_ms` for the creator to publish the header
    fn wait_for_creator(&self) -> bool {
        let deadline = Instant::now() + Duration::from_millis(self.config.lock_timeout_ms.into());
        loop {
            if self.base_timestamp_us() != 0 {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn sync_cursor(&mut self) {
        if let Ok(ring) = PlacedRingBuffer::attach(self.region.view().tail(HEADER_SIZE)) {
            self.cursor.set_to_oldest(&ring);
        }
    }

    /// True when nothing has been written for longer than `stale_after`
    pub fn is_stale(&self) -> bool {
        let base = self.base_timestamp_us();
        if base == 0 {
            return false;
        }
        let age = now_micros().saturating_sub(self.last_update_us());
        Duration::from_micros(age) > self.config.stale_after
    }

    /// True when a liveness write is due
    pub fn needs_heartbeat(&self) -> bool {
        let age = now_micros().saturating_sub(self.last_update_us());
        Duration::from_micros(age) > self.config.heartbeat_interval
    }

    /// Stamp liveness if due. Returns whether a heartbeat was written.
    pub fn heartbeat(&mut self) -> Result<bool> {
        if !self.needs_heartbeat() {
            return Ok(false);
        }
        let timeout_ms = self.config.lock_timeout_ms;
        self.transact(timeout_ms, |tx| {
            tx.touch();
            Ok(())
        })?;
        Ok(true)
    }

    /// Periodic staleness check; rebuilds the region if its producer died
    pub fn check_health(&mut self) -> Result<SessionState> {
        if self.state == SessionState::Ready && self.is_stale() {
            tracing::warn!(name = %self.config.name, "session expired, reinitializing");
            self.state = SessionState::Expired;
            self.initialize(SessionState::Reinitializing)?;
            self.sync_cursor();
        }
        Ok(self.state)
    }

    /// Lock-free check for unread change-log entries
    pub fn needs_processing(&self) -> bool {
        let base = self.base_timestamp_us();
        if base == 0 {
            return false;
        }
        base != self.epoch || self.cursor.cursor() < self.changelog_head()
    }

    /// Run `body` while holding the session lock.
    ///
    /// Fails with [`MirrorError::LockTimeout`] if the lock is not acquired in
    /// `timeout_ms`. Records written before `body` returns an error stay in
    /// the change log.
    pub fn transact<R, F>(&mut self, timeout_ms: u32, body: F) -> Result<R>
    where
        F: FnOnce(&mut Transaction<'_>) -> Result<R>,
    {
        let _guard = lock_guard(self.mutex.as_ref(), timeout_ms)
            .ok_or(MirrorError::LockTimeout { timeout_ms })?;

        let view = self.region.view();
        let header = view.slice(0, HEADER_SIZE);
        let base = header.atomic_u64(BASE_TIMESTAMP).load_acquire();
        if base == 0 {
            return Err(MirrorError::Uninitialized(self.config.name.clone()));
        }
        let ring = PlacedRingBuffer::attach(view.tail(HEADER_SIZE))?;
        if base != self.epoch {
            tracing::info!(name = %self.config.name, "session was reinitialized, rewinding cursor");
            self.cursor.set_to_oldest(&ring);
            self.epoch = base;
        }

        let mut tx = Transaction {
            header,
            ring,
            cursor: &mut self.cursor,
            base_us: base,
            touched: false,
        };
        let result = body(&mut tx);
        if tx.touched {
            header.atomic_u64(LAST_UPDATE).store_release(now_micros());
        }
        result
    }
}

/// Access to the change log while the session lock is held
pub struct Transaction<'a> {
    header: MemoryView<'a>,
    ring: PlacedRingBuffer<'a>,
    cursor: &'a mut PlacedRingIterator,
    base_us: u64,
    touched: bool,
}

impl<'a> Transaction<'a> {
    pub fn base_timestamp_us(&self) -> u64 {
        self.base_us
    }

    pub fn changelog(&self) -> &PlacedRingBuffer<'a> {
        &self.ring
    }

    /// Mark the session as updated without writing an event
    pub fn touch(&mut self) {
        self.touched = true;
    }

    /// Append a change event with `extra_bytes` of body, returning the body
    pub fn write_change_event(
        &mut self,
        kind: ChangeEventType,
        extra_bytes: usize,
    ) -> Result<MemoryView<'a>> {
        let size = EVENT_HEADER_SIZE + extra_bytes;
        let (id, record) = self.ring.push(size).ok_or(MirrorError::OutOfMemory {
            requested: size,
            pool: self.ring.pool_size(),
        })?;
        event::write_event_header(&record, kind, event::encode_delta(now_micros(), self.base_us));
        self.header
            .atomic_u32(CHANGELOG_HEAD)
            .store_release(id.wrapping_add(1));
        self.touched = true;
        Ok(record.tail(EVENT_HEADER_SIZE))
    }

    /// Append an object event, returning the view for `data_len` bytes of fields
    pub fn write_object_event(
        &mut self,
        kind: ChangeEventType,
        object_id: ObjectId,
        collection_id: u32,
        fields: FieldMask,
        data_len: usize,
    ) -> Result<MemoryView<'a>> {
        let body = self.write_change_event(kind, event::object_body_size(kind, data_len))?;
        Ok(event::write_object_body(body, kind, object_id, collection_id, fields))
    }

    pub fn write_full_reconcile(&mut self, collection_id: u32, ids: &[ObjectId]) -> Result<()> {
        let body = self.write_change_event(
            ChangeEventType::FullReconcile,
            event::full_reconcile_body_size(ids.len()),
        )?;
        event::write_full_reconcile_body(&body, collection_id, ids);
        Ok(())
    }

    pub fn write_shutdown(&mut self, collection_id: u32) -> Result<()> {
        let body = self.write_change_event(ChangeEventType::Shutdown, event::SHUTDOWN_BODY_SIZE)?;
        event::write_shutdown_body(&body, collection_id);
        Ok(())
    }

    /// True if entries were evicted before this session read them
    pub fn has_missed_entries(&self) -> bool {
        self.cursor.has_missed_entries(&self.ring)
    }

    pub fn has_next(&self) -> bool {
        self.cursor.has_next(&self.ring)
    }

    /// Next unread entry.
    ///
    /// Returns `None` when nothing is queued or when entries were missed; in
    /// the latter case resynchronize with
    /// [`resync_to_oldest`](Self::resync_to_oldest) or
    /// [`skip_to_end`](Self::skip_to_end) first.
    pub fn next_entry(&mut self) -> Option<ChangeEvent<'a>> {
        if self.has_missed_entries() {
            return None;
        }
        let (id, record) = self.cursor.next(&self.ring)?;
        ChangeEvent::decode(id, record, self.base_us)
    }

    pub fn resync_to_oldest(&mut self) {
        self.cursor.set_to_oldest(&self.ring);
    }

    pub fn skip_to_end(&mut self) {
        self.cursor.set_to_end(&self.ring);
    }
}
