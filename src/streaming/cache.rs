//! Per-asset streaming cache
//!
//! Keeps the chunks a consumer declares as needed resident in memory, issues
//! async reads for missing ones, drains completed reads and evicts chunks
//! that are neither needed nor mapped.
//!
//! Per chunk: `Absent -> Requested -> Available -> Evicting -> (Absent | Available)`.
//! Prefetch and the already-in-memory fast path go `Absent -> Available` directly.
//!
//! All bookkeeping lives behind one re-entrant critical section. Lifecycle
//! notifications are sent to the [`ChunkSource`] with that section still held
//! but with the state borrow released, so a notification handler may map or
//! unmap chunks of the same cache from the notifying thread.

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::ops::Deref;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::{ReentrantMutex, ReentrantMutexGuard};

use crate::streaming::request::{CompletedChunk, CompletionCallback};
use crate::streaming::resident::ResidentChunkTable;
use crate::streaming::source::{ChunkId, ChunkSource, StreamingOwner};

/// Waits shorter than this are not attempted; it is the practical timer granularity.
pub(crate) const MIN_WAIT: Duration = Duration::from_millis(1);

/// Where a chunk is in its streaming lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChunkState {
    /// No data and no read outstanding
    Absent,
    /// Async read outstanding
    Requested,
    /// Resident and mappable
    Available,
    /// No longer needed, waiting for its mappings to be released
    Evicting,
}

/// Counters describing one cache
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub needed: usize,
    pub available: usize,
    pub requested: usize,
    pub evicting: usize,
    /// Bytes held by resident chunks
    pub resident_bytes: usize,
    /// Async reads issued since creation
    pub requests_issued: u64,
    /// Completions applied by the drain (successful or failed)
    pub completions_drained: u64,
    /// Async reads that returned no data
    pub failed_reads: u64,
}

/// A borrowed view of a resident chunk.
///
/// Each successful [`StreamingCache::map_chunk`] must be paired with one
/// [`StreamingCache::unmap_chunk`] for the same chunk; until then the chunk is
/// never released.
#[derive(Clone, Debug)]
pub struct MappedChunk {
    chunk_id: ChunkId,
    data: Arc<[u8]>,
}

impl MappedChunk {
    /// Index of the mapped chunk
    pub fn chunk_id(&self) -> ChunkId {
        self.chunk_id
    }

    /// Size of the chunk in bytes
    pub fn size(&self) -> u32 {
        self.data.len() as u32
    }

    /// Address of the chunk's bytes, stable while mapped
    pub fn as_ptr(&self) -> *const u8 {
        self.data.as_ptr()
    }
}

impl Deref for MappedChunk {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

enum ChunkEvent {
    Available(ChunkId),
    Evicting(ChunkId),
    Evicted(ChunkId),
}

/// Everything guarded by the cache's critical section
struct CacheState {
    table: ResidentChunkTable,
    /// Declared by the consumer for the current update
    needed: BTreeSet<ChunkId>,
    /// Resident and usable now
    available: BTreeSet<ChunkId>,
    /// Async read outstanding
    requested: BTreeSet<ChunkId>,
    /// Unneeded, pending unmap before release
    evicting: BTreeSet<ChunkId>,
    completed_rx: Receiver<CompletedChunk>,
    /// Notifications waiting to be sent once the state borrow is released
    events: Vec<ChunkEvent>,
    streamed_bytes: u64,
    requests_issued: u64,
    completions_drained: u64,
    failed_reads: u64,
}

impl CacheState {
    fn new(completed_rx: Receiver<CompletedChunk>) -> Self {
        Self {
            table: ResidentChunkTable::new(),
            needed: BTreeSet::new(),
            available: BTreeSet::new(),
            requested: BTreeSet::new(),
            evicting: BTreeSet::new(),
            completed_rx,
            events: Vec::new(),
            streamed_bytes: 0,
            requests_issued: 0,
            completions_drained: 0,
            failed_reads: 0,
        }
    }

    fn state_of(&self, id: ChunkId) -> ChunkState {
        if self.available.contains(&id) {
            ChunkState::Available
        } else if self.requested.contains(&id) {
            ChunkState::Requested
        } else if self.evicting.contains(&id) {
            ChunkState::Evicting
        } else {
            ChunkState::Absent
        }
    }

    fn make_available(&mut self, id: ChunkId) {
        self.available.insert(id);
        self.events.push(ChunkEvent::Available(id));
    }

    /// Step 1: revive or request every needed chunk that is not available
    fn request_needed_chunks(&mut self, source: &dyn ChunkSource, completed_tx: &Sender<CompletedChunk>) {
        let needed: Vec<ChunkId> = self.needed.iter().copied().collect();

        for id in needed {
            if self.available.contains(&id) || self.requested.contains(&id) {
                continue;
            }

            // Still pinned by a mapper, so the data never left
            if self.evicting.remove(&id) {
                log::trace!("Reviving chunk {}", id);
                self.available.insert(id);
                continue;
            }

            let data_size = source.chunk_byte_size(id);

            if source.is_already_loaded_in_memory(id) {
                let mut bytes = vec![0u8; data_size as usize];
                source.copy_already_loaded_chunk(id, &mut bytes);
                self.table.add_resident_chunk(id, data_size);
                self.table.store_memory(id, bytes);
                self.make_available(id);
                continue;
            }

            self.table.add_resident_chunk(id, data_size);
            let callback = CompletionCallback::new(id, completed_tx.clone());

            match source.create_async_read_request(id, callback) {
                Some(request) => {
                    if let Some(record) = self.table.get_mut(id) {
                        record.io_request = Some(request);
                    }
                    self.requested.insert(id);
                    self.requests_issued += 1;
                    log::trace!("Requested chunk {} ({} bytes)", id, data_size);
                }
                None => {
                    log::error!("Streaming read request for chunk {} could not be created", id);
                    self.table.forget(id);
                }
            }
        }
    }

    /// Step 2: apply every completion queued by I/O threads since the last drain
    fn process_completed_chunks(&mut self) {
        while let Ok(CompletedChunk { chunk_id, request }) = self.completed_rx.try_recv() {
            let current = self
                .table
                .get(chunk_id)
                .and_then(|record| record.io_request.as_ref())
                .is_some_and(|pending| Arc::ptr_eq(pending, &request));

            if !current {
                if self.table.contains(chunk_id) {
                    log::debug!("Discarding superseded read for chunk {}", chunk_id);
                } else {
                    log::warn!("Got a stray async read for chunk {}", chunk_id);
                }
                continue;
            }

            self.completions_drained += 1;
            if let Some(record) = self.table.get_mut(chunk_id) {
                record.io_request = None;
            }
            self.requested.remove(&chunk_id);

            match request.take_read_results() {
                Some(bytes) => {
                    let expected = self.table.get(chunk_id).map_or(0, |record| record.data_size);
                    if bytes.len() != expected as usize {
                        log::warn!(
                            "Chunk {} read {} bytes, expected {}",
                            chunk_id,
                            bytes.len(),
                            expected
                        );
                    }
                    self.streamed_bytes += bytes.len() as u64;
                    self.table.store_memory(chunk_id, bytes);
                    self.make_available(chunk_id);
                }
                None => {
                    // Requested again on a later update if still needed
                    log::error!("Async loading request for chunk {} failed", chunk_id);
                    self.failed_reads += 1;
                    self.table.forget(chunk_id);
                }
            }
        }
    }

    /// Step 3: move available chunks that are no longer needed to evicting
    fn collect_unneeded_chunks(&mut self) {
        let unneeded: Vec<ChunkId> = self.available.difference(&self.needed).copied().collect();

        for id in unneeded {
            self.available.remove(&id);
            self.evicting.insert(id);
            self.events.push(ChunkEvent::Evicting(id));
        }
    }

    /// Step 4: release evicting chunks nobody maps anymore
    fn release_evicted_chunks(&mut self) {
        let releasable: Vec<ChunkId> = self
            .evicting
            .iter()
            .copied()
            .filter(|id| self.table.get(*id).map_or(true, |record| record.ref_count == 0))
            .collect();

        for id in releasable {
            self.table.forget(id);
            self.evicting.remove(&id);
            self.events.push(ChunkEvent::Evicted(id));
            log::trace!("Evicted chunk {}", id);
        }
    }

    fn map(&mut self, id: ChunkId, must_be_streamed: bool) -> Option<MappedChunk> {
        if !self.available.contains(&id) {
            if must_be_streamed {
                match self.state_of(id) {
                    ChunkState::Requested => {
                        log::debug!("Tried to map chunk {} that is still being streamed in", id)
                    }
                    ChunkState::Evicting => log::debug!("Tried to map evicted chunk {}", id),
                    _ => log::debug!("Tried to map unavailable non-requested chunk {}", id),
                }
            }
            return None;
        }

        let Some(record) = self.table.get_mut(id) else {
            log::error!("Available chunk {} has no resident record", id);
            return None;
        };
        let Some(data) = record.memory.clone() else {
            log::error!("Available chunk {} has no memory", id);
            return None;
        };

        record.ref_count += 1;
        Some(MappedChunk { chunk_id: id, data })
    }

    /// Synchronous load straight to available. Returns false if the read failed.
    fn prefetch_chunk(&mut self, source: &dyn ChunkSource, id: ChunkId) -> bool {
        // Whatever arrived last minute saves us a blocking read
        self.process_completed_chunks();

        if self.available.contains(&id) {
            return true;
        }

        if self.evicting.remove(&id) {
            self.available.insert(id);
            return true;
        }

        // The outstanding read is superseded; its completion is discarded when drained
        self.requested.remove(&id);

        let data_size = source.chunk_byte_size(id);
        let mut bytes = vec![0u8; data_size as usize];
        self.table.add_resident_chunk(id, data_size);

        let loaded = if source.is_already_loaded_in_memory(id) {
            source.copy_already_loaded_chunk(id, &mut bytes);
            Ok(())
        } else {
            source.load_chunk_synchronously(id, &mut bytes)
        };

        if let Err(e) = loaded {
            log::error!("Synchronous load of chunk {} failed: {}", id, e);
            self.table.forget(id);
            return false;
        }

        self.table.store_memory(id, bytes);
        self.make_available(id);
        true
    }

    fn stats(&self) -> CacheStats {
        CacheStats {
            needed: self.needed.len(),
            available: self.available.len(),
            requested: self.requested.len(),
            evicting: self.evicting.len(),
            resident_bytes: self.table.resident_bytes(),
            requests_issued: self.requests_issued,
            completions_drained: self.completions_drained,
            failed_reads: self.failed_reads,
        }
    }
}

type StateGuard<'a> = ReentrantMutexGuard<'a, RefCell<CacheState>>;

/// Streaming cache for a single asset.
///
/// The update thread calls [`reset_needed_chunks`](Self::reset_needed_chunks),
/// [`add_needed_chunk`](Self::add_needed_chunk) and
/// [`update_streaming_status`](Self::update_streaming_status) once per tick;
/// any thread may [`map_chunk`](Self::map_chunk)/[`unmap_chunk`](Self::unmap_chunk);
/// I/O threads only ever touch the completion channel.
pub struct StreamingCache {
    source: Arc<dyn ChunkSource>,
    completed_tx: Sender<CompletedChunk>,
    state: ReentrantMutex<RefCell<CacheState>>,
    teardown_time_limit: Option<Duration>,
}

impl StreamingCache {
    /// Create a cache for `source`. Nothing is loaded until chunks are needed.
    pub fn new(source: Arc<dyn ChunkSource>) -> Self {
        let (completed_tx, completed_rx) = crossbeam_channel::unbounded();
        Self {
            source,
            completed_tx,
            state: ReentrantMutex::new(RefCell::new(CacheState::new(completed_rx))),
            teardown_time_limit: None,
        }
    }

    /// Bound the wait for outstanding reads when the cache is dropped.
    ///
    /// Reads still in flight after the limit are abandoned; their completions
    /// land in a closed channel and never touch freed state.
    pub fn with_teardown_time_limit(mut self, limit: Option<Duration>) -> Self {
        self.teardown_time_limit = limit;
        self
    }

    /// The asset this cache streams
    pub fn source(&self) -> &Arc<dyn ChunkSource> {
        &self.source
    }

    /// Clear the needed set. Call at the start of every update.
    pub fn reset_needed_chunks(&self) {
        let guard = self.state.lock();
        guard.borrow_mut().needed.clear();
    }

    /// Declare a chunk as needed for this update. Idempotent.
    pub fn add_needed_chunk(&self, id: ChunkId) {
        let count = self.source.chunk_count();
        if id >= count {
            log::warn!("Ignoring needed chunk {} (asset has {} chunks)", id, count);
            return;
        }

        let guard = self.state.lock();
        guard.borrow_mut().needed.insert(id);
    }

    /// Main per-tick entry point.
    ///
    /// Issues reads, then drains completions, then marks unneeded chunks as
    /// evicting, then releases unmapped evicting chunks, in that order.
    pub fn update_streaming_status(&self) {
        let guard = self.state.lock();

        guard
            .borrow_mut()
            .request_needed_chunks(&*self.source, &self.completed_tx);
        self.dispatch_events(&guard);

        guard.borrow_mut().process_completed_chunks();
        self.dispatch_events(&guard);

        // Evicting notifications go out before any memory is released
        guard.borrow_mut().collect_unneeded_chunks();
        self.dispatch_events(&guard);

        guard.borrow_mut().release_evicted_chunks();
        self.dispatch_events(&guard);
    }

    /// Drain queued completions now
    pub fn process_completed_chunks(&self) {
        let guard = self.state.lock();
        guard.borrow_mut().process_completed_chunks();
        self.dispatch_events(&guard);
    }

    /// Map an available chunk, incrementing its reference count.
    ///
    /// Returns `None` when the chunk is not available yet (or anymore); that is
    /// "not ready", not an error. With `must_be_streamed` the miss is logged.
    pub fn map_chunk(&self, id: ChunkId, must_be_streamed: bool) -> Option<MappedChunk> {
        let guard = self.state.lock();
        let mapped = {
            let mut state = guard.borrow_mut();
            state.process_completed_chunks();
            state.map(id, must_be_streamed)
        };
        self.dispatch_events(&guard);
        mapped
    }

    /// Release one mapping of `id`.
    ///
    /// # Panics
    /// If `id` is not mapped: the map/unmap calls are out of balance and a
    /// consumer may still be reading memory about to be released.
    pub fn unmap_chunk(&self, id: ChunkId) {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();

        let mapped_state = matches!(state.state_of(id), ChunkState::Available | ChunkState::Evicting);
        let Some(record) = state.table.get_mut(id) else {
            panic!("Tried to unmap chunk {} which was never mapped", id);
        };
        assert!(
            record.ref_count > 0,
            "Map/Unmap out of balance for chunk {}. Make sure you unmap once for every map.",
            id
        );
        assert!(mapped_state, "Tried to unmap chunk {} in an invalid state", id);

        record.ref_count -= 1;
    }

    /// Compute the needed set from `owner` and load every missing chunk synchronously.
    ///
    /// Used at registration so something is displayable before async reads land.
    /// Returns the number of needed chunks that are available afterwards.
    pub fn prefetch_data(&self, owner: &dyn StreamingOwner) -> usize {
        let mut needed = Vec::new();
        owner.compute_needed_chunk_indices(&mut needed);
        self.prefetch_chunks(&needed)
    }

    /// Synchronously load the given chunks. See [`prefetch_data`](Self::prefetch_data).
    pub fn prefetch_chunks(&self, ids: &[ChunkId]) -> usize {
        let count = self.source.chunk_count();
        let guard = self.state.lock();
        let mut loaded = 0;

        for &id in ids {
            if id >= count {
                log::warn!("Ignoring prefetch of chunk {} (asset has {} chunks)", id, count);
                continue;
            }
            if guard.borrow_mut().prefetch_chunk(&*self.source, id) {
                loaded += 1;
            }
            self.dispatch_events(&guard);
        }

        log::debug!("Prefetched {}/{} chunks", loaded, ids.len());
        loaded
    }

    /// True while any async read is outstanding
    pub fn is_streaming_in_progress(&self) -> bool {
        let guard = self.state.lock();
        let in_progress = !guard.borrow().requested.is_empty();
        in_progress
    }

    /// Block until every outstanding read has completed and been drained.
    ///
    /// `None` or a zero limit waits without bound. Returns false if the limit
    /// expired first.
    pub fn block_till_all_requests_finished(&self, time_limit: Option<Duration>) -> bool {
        let guard = self.state.lock();
        let deadline = time_limit
            .filter(|limit| !limit.is_zero())
            .map(|limit| Instant::now() + limit);

        let pending = guard.borrow().table.in_flight_requests();
        for (id, request) in pending {
            match deadline {
                None => {
                    request.wait_completion(None);
                }
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining < MIN_WAIT || !request.wait_completion(Some(remaining)) {
                        log::debug!("Timed out waiting for chunk {}", id);
                        return false;
                    }
                }
            }

            guard.borrow_mut().process_completed_chunks();
            self.dispatch_events(&guard);
        }

        true
    }

    /// Lifecycle state of a chunk
    pub fn chunk_state(&self, id: ChunkId) -> ChunkState {
        let guard = self.state.lock();
        let state = guard.borrow().state_of(id);
        state
    }

    /// Current mapping count of a chunk (0 when unknown)
    pub fn ref_count(&self, id: ChunkId) -> u32 {
        let guard = self.state.lock();
        let count = guard.borrow().table.get(id).map_or(0, |record| record.ref_count);
        count
    }

    /// Snapshot of the cache counters
    pub fn stats(&self) -> CacheStats {
        let guard = self.state.lock();
        let stats = guard.borrow().stats();
        stats
    }

    /// Bytes delivered by async reads since the last call
    pub fn take_streamed_bytes(&self) -> u64 {
        let guard = self.state.lock();
        let bytes = std::mem::take(&mut guard.borrow_mut().streamed_bytes);
        bytes
    }

    fn dispatch_events(&self, guard: &StateGuard<'_>) {
        loop {
            let events = std::mem::take(&mut guard.borrow_mut().events);
            if events.is_empty() {
                return;
            }

            for event in events {
                match event {
                    ChunkEvent::Available(id) => self.source.on_chunk_available(id),
                    ChunkEvent::Evicting(id) => self.source.on_chunk_evicting(id),
                    ChunkEvent::Evicted(id) => self.source.on_chunk_evicted(id),
                }
            }
        }
    }
}

impl Drop for StreamingCache {
    fn drop(&mut self) {
        if !self.block_till_all_requests_finished(self.teardown_time_limit) {
            log::warn!("Abandoning in-flight chunk reads at teardown");
        }

        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        for id in state.table.ids() {
            if let Some(record) = state.table.get_mut(id) {
                if record.ref_count > 0 {
                    log::error!("Chunk {} still mapped {} times at teardown", id, record.ref_count);
                    record.ref_count = 0;
                }
                record.io_request = None;
            }
            state.table.forget(id);
        }
        state.available.clear();
        state.requested.clear();
        state.evicting.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::testing::{FixedOwner, Notification, ReadMode, ScriptedSource};

    fn cache_for(source: &Arc<ScriptedSource>) -> StreamingCache {
        StreamingCache::new(source.clone())
    }

    fn need(cache: &StreamingCache, ids: &[ChunkId]) {
        cache.reset_needed_chunks();
        for &id in ids {
            cache.add_needed_chunk(id);
        }
    }

    /// No chunk is in two of the three tracked sets at once
    fn assert_partitioned(cache: &StreamingCache, count: u32) {
        let guard = cache.state.lock();
        let state = guard.borrow();
        for id in 0..count {
            let memberships = [
                state.available.contains(&id),
                state.requested.contains(&id),
                state.evicting.contains(&id),
            ];
            assert!(memberships.iter().filter(|m| **m).count() <= 1, "chunk {} in two sets", id);
            if memberships.iter().any(|m| *m) {
                assert!(state.table.contains(id), "chunk {} tracked without a record", id);
            }
        }
    }

    #[test]
    fn test_ten_chunk_scenario() {
        let source = ScriptedSource::new(10, 1024, ReadMode::Immediate);
        let cache = cache_for(&source);

        need(&cache, &[3, 4, 5]);
        cache.update_streaming_status();

        let mapped = cache.map_chunk(4, true).expect("chunk 4 should be available");
        assert_eq!(mapped.size(), 1024);
        assert!(mapped.iter().all(|b| *b == 4));
        assert!(!mapped.as_ptr().is_null());
        assert_eq!(cache.ref_count(4), 1);

        assert!(cache.map_chunk(7, true).is_none());
        assert_eq!(cache.ref_count(7), 0);

        cache.unmap_chunk(4);
        need(&cache, &[]);
        cache.update_streaming_status();

        for id in [3, 4, 5] {
            assert_eq!(cache.chunk_state(id), ChunkState::Absent);
            assert_eq!(source.count(Notification::Evicting(id)), 1);
            assert_eq!(source.count(Notification::Evicted(id)), 1);
        }
        assert_eq!(cache.stats().resident_bytes, 0);
        assert_partitioned(&cache, 10);
    }

    #[test]
    fn test_add_needed_chunk_is_idempotent() {
        let source = ScriptedSource::new(4, 8, ReadMode::Manual);
        let cache = cache_for(&source);

        cache.reset_needed_chunks();
        cache.add_needed_chunk(2);
        cache.add_needed_chunk(2);
        cache.add_needed_chunk(2);
        cache.update_streaming_status();

        assert_eq!(cache.stats().needed, 1);
        assert_eq!(source.async_requests(), 1);
        assert_eq!(cache.chunk_state(2), ChunkState::Requested);

        assert_eq!(source.complete_parked(), 1);
    }

    #[test]
    fn test_out_of_range_chunk_is_ignored() {
        let source = ScriptedSource::new(4, 8, ReadMode::Immediate);
        let cache = cache_for(&source);

        need(&cache, &[4, 100]);
        cache.update_streaming_status();
        assert_eq!(cache.stats().needed, 0);
        assert_eq!(source.async_requests(), 0);
    }

    #[test]
    fn test_requested_chunk_is_not_rerequested() {
        let source = ScriptedSource::new(4, 8, ReadMode::Manual);
        let cache = cache_for(&source);

        need(&cache, &[1]);
        cache.update_streaming_status();
        cache.update_streaming_status();
        assert_eq!(source.async_requests(), 1);
        assert!(cache.is_streaming_in_progress());

        source.complete_parked();
        assert_eq!(cache.chunk_state(1), ChunkState::Requested);
        cache.update_streaming_status();
        assert_eq!(cache.chunk_state(1), ChunkState::Available);
        assert!(!cache.is_streaming_in_progress());
    }

    #[test]
    fn test_map_drains_last_instant_completion() {
        let source = ScriptedSource::new(4, 8, ReadMode::Manual);
        let cache = cache_for(&source);

        need(&cache, &[0]);
        cache.update_streaming_status();
        assert!(cache.map_chunk(0, true).is_none());

        source.complete_parked();
        let mapped = cache.map_chunk(0, true).expect("completion drained by map");
        assert_eq!(mapped.chunk_id(), 0);
        cache.unmap_chunk(0);
    }

    #[test]
    fn test_revival_issues_no_new_request() {
        let source = ScriptedSource::new(8, 16, ReadMode::Immediate);
        let cache = cache_for(&source);

        need(&cache, &[2]);
        cache.update_streaming_status();
        let _mapping = cache.map_chunk(2, true).unwrap();
        let requests_before = cache.stats().requests_issued;

        need(&cache, &[]);
        cache.update_streaming_status();
        assert_eq!(cache.chunk_state(2), ChunkState::Evicting);

        need(&cache, &[2]);
        cache.update_streaming_status();
        assert_eq!(cache.chunk_state(2), ChunkState::Available);
        assert_eq!(cache.stats().requests_issued, requests_before);
        assert_eq!(source.async_requests(), 1);
        assert_eq!(source.count(Notification::Evicted(2)), 0);
        assert_partitioned(&cache, 8);

        cache.unmap_chunk(2);
    }

    #[test]
    fn test_mapped_chunk_survives_eviction_cycles() {
        let source = ScriptedSource::new(8, 16, ReadMode::Immediate);
        let cache = cache_for(&source);

        need(&cache, &[1]);
        cache.update_streaming_status();
        let mapping = cache.map_chunk(1, true).unwrap();

        for _ in 0..20 {
            need(&cache, &[]);
            cache.update_streaming_status();
            assert_eq!(cache.chunk_state(1), ChunkState::Evicting);
            assert_eq!(cache.stats().resident_bytes, 16);
        }
        assert_eq!(source.count(Notification::Evicting(1)), 1);
        assert_eq!(source.count(Notification::Evicted(1)), 0);
        assert!(mapping.iter().all(|b| *b == 1));

        // Mapping an evicting chunk is refused
        assert!(cache.map_chunk(1, true).is_none());

        cache.unmap_chunk(1);
        cache.update_streaming_status();
        assert_eq!(cache.chunk_state(1), ChunkState::Absent);
        assert_eq!(source.count(Notification::Evicted(1)), 1);
    }

    #[test]
    fn test_evicting_notified_before_evicted() {
        let source = ScriptedSource::new(4, 4, ReadMode::Immediate);
        let cache = cache_for(&source);

        need(&cache, &[0, 1]);
        cache.update_streaming_status();
        need(&cache, &[]);
        cache.update_streaming_status();

        assert_eq!(
            source.notifications(),
            vec![
                Notification::Available(0),
                Notification::Available(1),
                Notification::Evicting(0),
                Notification::Evicting(1),
                Notification::Evicted(0),
                Notification::Evicted(1),
            ]
        );
    }

    #[test]
    fn test_completed_and_unneeded_in_same_tick_is_available_first() {
        let source = ScriptedSource::new(4, 4, ReadMode::Manual);
        let cache = cache_for(&source);

        need(&cache, &[3]);
        cache.update_streaming_status();
        source.complete_parked();

        need(&cache, &[]);
        cache.update_streaming_status();
        assert_eq!(source.count(Notification::Available(3)), 1);
        assert_eq!(source.count(Notification::Evicted(3)), 1);
        assert_eq!(cache.chunk_state(3), ChunkState::Absent);
    }

    #[test]
    fn test_unneeded_requested_chunk_is_not_cancelled() {
        let source = ScriptedSource::new(4, 4, ReadMode::Manual);
        let cache = cache_for(&source);

        need(&cache, &[2]);
        cache.update_streaming_status();
        need(&cache, &[]);
        cache.update_streaming_status();
        assert_eq!(cache.chunk_state(2), ChunkState::Requested);

        source.complete_parked();
        cache.update_streaming_status();
        assert_eq!(cache.chunk_state(2), ChunkState::Absent);
        assert_eq!(source.count(Notification::Available(2)), 1);
    }

    #[test]
    fn test_failed_read_is_retried_next_cycle() {
        let source = ScriptedSource::new(4, 4, ReadMode::Fail);
        let cache = cache_for(&source);

        need(&cache, &[1]);
        cache.update_streaming_status();
        assert_eq!(cache.chunk_state(1), ChunkState::Absent);
        assert_eq!(cache.stats().failed_reads, 1);
        assert!(cache.map_chunk(1, true).is_none());

        source.set_mode(ReadMode::Immediate);
        cache.update_streaming_status();
        assert_eq!(source.async_requests(), 2);
        assert_eq!(cache.chunk_state(1), ChunkState::Available);
    }

    #[test]
    fn test_refused_request_continues_with_other_chunks() {
        let source = ScriptedSource::new(4, 4, ReadMode::Refuse);
        let cache = cache_for(&source);

        need(&cache, &[0, 1]);
        cache.update_streaming_status();
        assert_eq!(cache.chunk_state(0), ChunkState::Absent);
        assert_eq!(cache.chunk_state(1), ChunkState::Absent);
        assert_eq!(cache.stats().requests_issued, 0);

        source.set_mode(ReadMode::Immediate);
        cache.update_streaming_status();
        assert_eq!(cache.stats().available, 2);
    }

    #[test]
    fn test_already_loaded_chunk_skips_io() {
        let source = ScriptedSource::new(4, 8, ReadMode::Manual);
        source.mark_in_memory(2);
        let cache = cache_for(&source);

        need(&cache, &[2]);
        cache.update_streaming_status();
        assert_eq!(cache.chunk_state(2), ChunkState::Available);
        assert_eq!(source.async_requests(), 0);
        assert_eq!(&*cache.map_chunk(2, true).unwrap(), &source.payload(2)[..]);
        cache.unmap_chunk(2);
    }

    #[test]
    fn test_prefetch_loads_synchronously() {
        let source = ScriptedSource::new(6, 8, ReadMode::Manual);
        let cache = cache_for(&source);
        let owner = FixedOwner::new(&[0, 1]);

        assert_eq!(cache.prefetch_data(owner.as_ref()), 2);
        assert_eq!(source.sync_loads(), 2);
        assert_eq!(source.async_requests(), 0);
        assert_eq!(source.count(Notification::Available(0)), 1);
        assert_eq!(source.count(Notification::Available(1)), 1);
        assert_eq!(cache.chunk_state(0), ChunkState::Available);

        // A following update with the same needs issues no reads
        need(&cache, &[0, 1]);
        cache.update_streaming_status();
        assert_eq!(source.async_requests(), 0);
    }

    #[test]
    fn test_prefetch_failure_leaves_chunk_absent() {
        let source = ScriptedSource::new(4, 8, ReadMode::Fail);
        let cache = cache_for(&source);

        assert_eq!(cache.prefetch_chunks(&[3]), 0);
        assert_eq!(cache.chunk_state(3), ChunkState::Absent);
    }

    #[test]
    fn test_prefetch_supersedes_outstanding_read() {
        let source = ScriptedSource::new(4, 8, ReadMode::Manual);
        let cache = cache_for(&source);

        need(&cache, &[3]);
        cache.update_streaming_status();
        assert_eq!(cache.chunk_state(3), ChunkState::Requested);

        assert_eq!(cache.prefetch_chunks(&[3]), 1);
        assert_eq!(cache.chunk_state(3), ChunkState::Available);

        // The late async completion is discarded
        source.complete_parked();
        cache.update_streaming_status();
        assert_eq!(source.count(Notification::Available(3)), 1);
        assert_eq!(cache.chunk_state(3), ChunkState::Available);
        assert_eq!(cache.stats().completions_drained, 0);
        assert_partitioned(&cache, 4);
    }

    #[test]
    fn test_prefetch_revives_evicting_chunk() {
        let source = ScriptedSource::new(4, 8, ReadMode::Immediate);
        let cache = cache_for(&source);

        need(&cache, &[1]);
        cache.update_streaming_status();
        let _mapping = cache.map_chunk(1, false).unwrap();
        need(&cache, &[]);
        cache.update_streaming_status();

        assert_eq!(cache.prefetch_chunks(&[1]), 1);
        assert_eq!(cache.chunk_state(1), ChunkState::Available);
        assert_eq!(source.sync_loads(), 0);
        cache.unmap_chunk(1);
    }

    #[test]
    #[should_panic(expected = "out of balance")]
    fn test_unmap_without_map_panics() {
        let source = ScriptedSource::new(4, 4, ReadMode::Immediate);
        let cache = cache_for(&source);

        need(&cache, &[0]);
        cache.update_streaming_status();
        cache.unmap_chunk(0);
    }

    #[test]
    #[should_panic(expected = "out of balance")]
    fn test_double_unmap_panics() {
        let source = ScriptedSource::new(4, 4, ReadMode::Immediate);
        let cache = cache_for(&source);

        need(&cache, &[0]);
        cache.update_streaming_status();
        let _mapping = cache.map_chunk(0, true).unwrap();
        cache.unmap_chunk(0);
        cache.unmap_chunk(0);
    }

    #[test]
    #[should_panic(expected = "never mapped")]
    fn test_unmap_unknown_chunk_panics() {
        let source = ScriptedSource::new(4, 4, ReadMode::Immediate);
        let cache = cache_for(&source);
        cache.unmap_chunk(3);
    }

    #[test]
    fn test_block_till_all_requests_finished_unbounded() {
        let source = ScriptedSource::new(8, 32, ReadMode::Delayed(Duration::from_millis(20)));
        let cache = cache_for(&source);

        need(&cache, &[0, 1, 2, 3, 4]);
        cache.update_streaming_status();
        assert_eq!(cache.stats().requested, 5);

        assert!(cache.block_till_all_requests_finished(None));
        assert!(!cache.is_streaming_in_progress());
        assert_eq!(cache.stats().available, 5);
        assert_eq!(cache.stats().completions_drained, 5);
        for id in 0..5 {
            assert_eq!(source.count(Notification::Available(id)), 1);
        }
    }

    #[test]
    fn test_block_till_all_requests_finished_zero_limit_is_unbounded() {
        let source = ScriptedSource::new(8, 32, ReadMode::Delayed(Duration::from_millis(5)));
        let cache = cache_for(&source);

        need(&cache, &[0, 1]);
        cache.update_streaming_status();
        assert!(cache.block_till_all_requests_finished(Some(Duration::ZERO)));
        assert_eq!(cache.stats().available, 2);
    }

    #[test]
    fn test_block_till_all_requests_finished_times_out() {
        let source = ScriptedSource::new(8, 32, ReadMode::Delayed(Duration::from_millis(300)));
        let cache = cache_for(&source)
            .with_teardown_time_limit(Some(Duration::from_millis(1)));

        need(&cache, &[0, 1, 2, 3, 4]);
        cache.update_streaming_status();

        assert!(!cache.block_till_all_requests_finished(Some(Duration::from_millis(1))));
        assert!(cache.is_streaming_in_progress());
    }

    #[test]
    fn test_concurrent_completions_drain_exactly_once() {
        const CHUNKS: u32 = 64;
        const THREADS: usize = 4;

        let source = ScriptedSource::new(CHUNKS, 8, ReadMode::Manual);
        let cache = cache_for(&source);
        let all: Vec<ChunkId> = (0..CHUNKS).collect();

        need(&cache, &all);
        cache.update_streaming_status();
        assert_eq!(cache.stats().requested, CHUNKS as usize);

        let mut parked = source.take_parked();
        let per_thread = parked.len().div_ceil(THREADS);
        let mut workers = Vec::new();
        while !parked.is_empty() {
            let batch: Vec<_> = parked.drain(..per_thread.min(parked.len())).collect();
            workers.push(std::thread::spawn(move || {
                for callback in batch {
                    let data = vec![callback.chunk_id() as u8; 8];
                    callback.complete(Some(data));
                    std::thread::yield_now();
                }
            }));
        }

        let deadline = Instant::now() + Duration::from_secs(10);
        while cache.stats().available < CHUNKS as usize {
            assert!(Instant::now() < deadline, "completions were lost");
            need(&cache, &all);
            cache.update_streaming_status();
            assert_partitioned(&cache, CHUNKS);
        }
        for worker in workers {
            worker.join().unwrap();
        }
        cache.update_streaming_status();

        assert_eq!(cache.stats().completions_drained, CHUNKS as u64);
        for id in 0..CHUNKS {
            assert_eq!(source.count(Notification::Available(id)), 1, "chunk {}", id);
        }
    }

    #[test]
    fn test_notification_handler_can_map_reentrantly() {
        let source = ScriptedSource::new(4, 8, ReadMode::Immediate);
        let cache = Arc::new(StreamingCache::new(source.clone()));
        source.map_from_notifications(&cache);

        need(&cache, &[0, 1]);
        cache.update_streaming_status();
        assert_eq!(cache.ref_count(0), 1);
        assert_eq!(cache.ref_count(1), 1);

        need(&cache, &[]);
        cache.update_streaming_status();
        assert_eq!(cache.chunk_state(0), ChunkState::Evicting);

        for mapping in source.take_held_mappings() {
            cache.unmap_chunk(mapping.chunk_id());
        }
        cache.update_streaming_status();
        assert_eq!(cache.chunk_state(0), ChunkState::Absent);
        assert_eq!(cache.chunk_state(1), ChunkState::Absent);
    }

    #[test]
    fn test_streamed_bytes_are_taken_once() {
        let source = ScriptedSource::new(4, 100, ReadMode::Immediate);
        let cache = cache_for(&source);

        need(&cache, &[0, 1]);
        cache.update_streaming_status();
        assert_eq!(cache.take_streamed_bytes(), 200);
        assert_eq!(cache.take_streamed_bytes(), 0);
    }

    #[test]
    fn test_drop_with_outstanding_reads() {
        let source = ScriptedSource::new(4, 8, ReadMode::Delayed(Duration::from_millis(10)));
        let cache = cache_for(&source);
        need(&cache, &[0, 1, 2]);
        cache.update_streaming_status();
        drop(cache);
        assert_eq!(source.async_requests(), 3);
    }

    #[test]
    fn test_drop_abandons_never_completing_reads_under_limit() {
        let source = ScriptedSource::new(4, 8, ReadMode::Manual);
        let cache = cache_for(&source).with_teardown_time_limit(Some(Duration::from_millis(20)));
        need(&cache, &[0, 1]);
        cache.update_streaming_status();
        assert!(cache.is_streaming_in_progress());

        let started = Instant::now();
        drop(cache);
        assert!(started.elapsed() < Duration::from_secs(5), "teardown waited past its limit");

        // Reads outliving the cache can still complete without a receiver
        let parked = source.take_parked();
        assert_eq!(parked.len(), 2);
        let requests: Vec<_> = parked.iter().map(|callback| callback.request()).collect();
        assert!(requests.iter().all(|request| !request.poll_completion()));
        for callback in parked {
            let data = source.payload(callback.chunk_id());
            callback.complete(Some(data));
        }
        assert!(requests.iter().all(|request| request.poll_completion()));
    }
}
