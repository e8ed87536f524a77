//! Volume streaming manager
//!
//! Registry of streamed assets (one [`StreamingCache`] each) and of the owners
//! that consume them. [`update_resource_streaming`](VolumeStreamingManager::update_resource_streaming)
//! is the per-tick driver: reset every needed set, gather needs from every
//! owner, then update every cache.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::core::StreamingConfig;
use crate::streaming::cache::{MappedChunk, StreamingCache, MIN_WAIT};
use crate::streaming::source::{ChunkId, ChunkSource, StreamingOwner};

/// Handle of a registered asset
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VolumeId(u64);

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "volume#{}", self.0)
    }
}

/// Handle of a registered owner
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OwnerId(u64);

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "owner#{}", self.0)
    }
}

/// Manager-wide counters, refreshed every tick
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StreamingStats {
    pub volumes: usize,
    pub owners: usize,
    pub resident_bytes: usize,
    pub requests_in_flight: usize,
    /// Bytes delivered by async reads during the last tick
    pub bytes_streamed_last_tick: u64,
    /// `bytes_streamed_last_tick` over the wall time since the previous tick
    pub bandwidth_bytes_per_sec: f64,
    pub ticks: u64,
}

struct RegisteredOwner {
    owner: Arc<dyn StreamingOwner>,
    volumes: Vec<VolumeId>,
}

#[derive(Default)]
struct ManagerState {
    volumes: BTreeMap<VolumeId, Arc<StreamingCache>>,
    owners: BTreeMap<OwnerId, RegisteredOwner>,
    next_id: u64,
    last_tick: Option<Instant>,
    bytes_streamed_last_tick: u64,
    bandwidth_bytes_per_sec: f64,
    ticks: u64,
}

impl ManagerState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Explicitly constructed streaming manager
///
/// The registry lock is never held while calling into caches or owners, so
/// owners and chunk notifications may call back into the manager.
pub struct VolumeStreamingManager {
    config: StreamingConfig,
    state: Mutex<ManagerState>,
}

impl VolumeStreamingManager {
    pub fn new(config: StreamingConfig) -> Self {
        Self {
            config,
            state: Mutex::new(ManagerState::default()),
        }
    }

    pub fn config(&self) -> &StreamingConfig {
        &self.config
    }

    // --- Volumes ---

    /// Register an asset and create its cache
    pub fn add_volume(&self, source: Arc<dyn ChunkSource>) -> VolumeId {
        let chunk_count = source.chunk_count();
        let cache = StreamingCache::new(source)
            .with_teardown_time_limit(self.config.teardown_time_limit());

        let mut state = self.state.lock();
        let id = VolumeId(state.next_id());
        state.volumes.insert(id, Arc::new(cache));

        log::info!("Registered {} ({} chunks)", id, chunk_count);
        id
    }

    /// Unregister an asset, draining its outstanding reads.
    ///
    /// Owners still referencing it simply stop streaming it.
    pub fn remove_volume(&self, volume: VolumeId) -> bool {
        let Some(cache) = self.state.lock().volumes.remove(&volume) else {
            return false;
        };

        cache.block_till_all_requests_finished(self.config.teardown_time_limit());
        log::info!("Unregistered {}", volume);
        true
    }

    pub fn is_managed_volume(&self, volume: VolumeId) -> bool {
        self.state.lock().volumes.contains_key(&volume)
    }

    /// Cache streaming `volume`
    pub fn cache(&self, volume: VolumeId) -> Option<Arc<StreamingCache>> {
        self.state.lock().volumes.get(&volume).cloned()
    }

    /// True while `volume` has outstanding reads. Unknown volumes are not streaming.
    pub fn is_streaming_in_progress(&self, volume: VolumeId) -> bool {
        self.cache(volume)
            .is_some_and(|cache| cache.is_streaming_in_progress())
    }

    // --- Owners ---

    /// Register an owner consuming `volumes` and prefetch what it needs now.
    ///
    /// Registering the same owner twice returns its existing id.
    pub fn add_streaming_owner(&self, owner: Arc<dyn StreamingOwner>, volumes: Vec<VolumeId>) -> OwnerId {
        let id = {
            let mut state = self.state.lock();
            let existing = state
                .owners
                .iter()
                .find(|(_, registered)| Arc::ptr_eq(&registered.owner, &owner))
                .map(|(id, _)| *id);

            match existing {
                Some(id) => {
                    log::debug!("{} already registered", id);
                    return id;
                }
                None => {
                    let id = OwnerId(state.next_id());
                    state.owners.insert(
                        id,
                        RegisteredOwner {
                            owner,
                            volumes,
                        },
                    );
                    id
                }
            }
        };

        log::info!("Registered {}", id);
        self.prefetch_data(id);
        id
    }

    pub fn remove_streaming_owner(&self, owner: OwnerId) -> bool {
        let removed = self.state.lock().owners.remove(&owner).is_some();
        if removed {
            log::info!("Unregistered {}", owner);
        }
        removed
    }

    pub fn is_managed_owner(&self, owner: OwnerId) -> bool {
        self.state.lock().owners.contains_key(&owner)
    }

    /// Synchronously load everything `owner` needs right now in each of its volumes
    pub fn prefetch_data(&self, owner: OwnerId) {
        let Some((owner_ref, caches)) = self.owner_caches(owner) else {
            log::error!("Tried to prefetch data for unregistered {}", owner);
            return;
        };

        for (volume, cache) in caches {
            match cache {
                Some(cache) => {
                    let loaded = cache.prefetch_data(owner_ref.as_ref());
                    log::debug!("Prefetched {} chunks of {} for {}", loaded, volume, owner);
                }
                None => log::error!("{} streams {} which is not registered", owner, volume),
            }
        }
    }

    // --- Per-tick driver ---

    /// Reset, gather, update. Call once per tick from the update thread.
    pub fn update_resource_streaming(&self) {
        let (caches, owners) = {
            let state = self.state.lock();
            let caches: Vec<Arc<StreamingCache>> = state.volumes.values().cloned().collect();
            let owners: Vec<(Arc<dyn StreamingOwner>, Vec<Arc<StreamingCache>>)> = state
                .owners
                .values()
                .map(|registered| {
                    let volumes = registered
                        .volumes
                        .iter()
                        .filter_map(|volume| state.volumes.get(volume).cloned())
                        .collect();
                    (registered.owner.clone(), volumes)
                })
                .collect();
            (caches, owners)
        };

        // Phase 0
        for cache in &caches {
            cache.reset_needed_chunks();
        }

        // Phase 1
        let mut needed: Vec<ChunkId> = Vec::new();
        for (owner, volumes) in &owners {
            for cache in volumes {
                needed.clear();
                owner.compute_needed_chunk_indices(&mut needed);
                for &chunk in &needed {
                    cache.add_needed_chunk(chunk);
                }
            }
        }

        // Phase 2
        let mut streamed = 0u64;
        for cache in &caches {
            cache.update_streaming_status();
            streamed += cache.take_streamed_bytes();
        }

        let now = Instant::now();
        let mut state = self.state.lock();
        let elapsed = state.last_tick.map(|last| now - last);
        state.last_tick = Some(now);
        state.bytes_streamed_last_tick = streamed;
        state.bandwidth_bytes_per_sec = match elapsed {
            Some(elapsed) if !elapsed.is_zero() => streamed as f64 / elapsed.as_secs_f64(),
            _ => 0.0,
        };
        state.ticks += 1;

        log::trace!(
            "Streaming tick {}: {} caches, {} owners, {} bytes",
            state.ticks,
            caches.len(),
            owners.len(),
            streamed
        );
    }

    /// Block until every cache has drained its reads.
    ///
    /// `None` or zero waits without bound. Otherwise the limit is shared across
    /// all caches; returns false as soon as it runs out.
    pub fn block_till_all_requests_finished(&self, time_limit: Option<Duration>) -> bool {
        let caches: Vec<Arc<StreamingCache>> = self.state.lock().volumes.values().cloned().collect();

        let Some(limit) = time_limit.filter(|limit| !limit.is_zero()) else {
            for cache in &caches {
                cache.block_till_all_requests_finished(None);
            }
            return true;
        };

        let deadline = Instant::now() + limit;
        for cache in &caches {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining < MIN_WAIT || !cache.block_till_all_requests_finished(Some(remaining)) {
                return false;
            }
        }
        true
    }

    // --- Chunk access ---

    /// Map a chunk of `volume`. See [`StreamingCache::map_chunk`].
    pub fn map_chunk(&self, volume: VolumeId, chunk: ChunkId, must_be_streamed: bool) -> Option<MappedChunk> {
        match self.cache(volume) {
            Some(cache) => cache.map_chunk(chunk, must_be_streamed),
            None => {
                log::error!("Tried to map chunk {} in unregistered {}", chunk, volume);
                None
            }
        }
    }

    /// Release a mapping obtained from [`map_chunk`](Self::map_chunk)
    pub fn unmap_chunk(&self, volume: VolumeId, chunk: ChunkId) {
        match self.cache(volume) {
            Some(cache) => cache.unmap_chunk(chunk),
            None => log::error!("Tried to unmap chunk {} in unregistered {}", chunk, volume),
        }
    }

    pub fn stats(&self) -> StreamingStats {
        let (caches, mut stats) = {
            let state = self.state.lock();
            let caches: Vec<Arc<StreamingCache>> = state.volumes.values().cloned().collect();
            let stats = StreamingStats {
                volumes: state.volumes.len(),
                owners: state.owners.len(),
                bytes_streamed_last_tick: state.bytes_streamed_last_tick,
                bandwidth_bytes_per_sec: state.bandwidth_bytes_per_sec,
                ticks: state.ticks,
                ..Default::default()
            };
            (caches, stats)
        };

        for cache in caches {
            let cache_stats = cache.stats();
            stats.resident_bytes += cache_stats.resident_bytes;
            stats.requests_in_flight += cache_stats.requested;
        }
        stats
    }

    /// Drain every cache and drop all registrations
    pub fn shutdown(&self) {
        let (volumes, owners) = {
            let mut state = self.state.lock();
            (
                std::mem::take(&mut state.volumes),
                std::mem::take(&mut state.owners),
            )
        };
        if volumes.is_empty() && owners.is_empty() {
            return;
        }

        drop(owners);
        for (id, cache) in volumes {
            if !cache.block_till_all_requests_finished(self.config.teardown_time_limit()) {
                log::warn!("{} still has reads in flight at shutdown", id);
            }
        }
        log::info!("Streaming manager shut down");
    }

    fn owner_caches(
        &self,
        owner: OwnerId,
    ) -> Option<(Arc<dyn StreamingOwner>, Vec<(VolumeId, Option<Arc<StreamingCache>>)>)> {
        let state = self.state.lock();
        let registered = state.owners.get(&owner)?;
        let caches = registered
            .volumes
            .iter()
            .map(|volume| (*volume, state.volumes.get(volume).cloned()))
            .collect();
        Some((registered.owner.clone(), caches))
    }
}

impl Drop for VolumeStreamingManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}
