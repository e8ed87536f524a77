//! Scripted in-memory chunk source shared by the streaming unit tests

use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use parking_lot::Mutex;

use crate::core::{Error, Result};
use crate::streaming::cache::{MappedChunk, StreamingCache};
use crate::streaming::request::{CompletionCallback, RequestHandle};
use crate::streaming::source::{ChunkId, ChunkSource, StreamingOwner};

/// How the scripted source answers async reads
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadMode {
    /// Complete inside `create_async_read_request`
    Immediate,
    /// Park callbacks until the test completes them
    Manual,
    /// Complete from a spawned thread after a delay
    Delayed(Duration),
    /// Complete with no data
    Fail,
    /// Refuse to create the request
    Refuse,
}

/// Lifecycle notification received by the source
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Notification {
    Available(ChunkId),
    Evicting(ChunkId),
    Evicted(ChunkId),
}

pub struct ScriptedSource {
    chunk_count: u32,
    chunk_size: u32,
    mode: Mutex<ReadMode>,
    in_memory: Mutex<Vec<ChunkId>>,
    parked: Mutex<Vec<CompletionCallback>>,
    notifications: Mutex<Vec<Notification>>,
    async_requests: Mutex<u32>,
    sync_loads: Mutex<u32>,
    map_on_available: OnceLock<Weak<StreamingCache>>,
    held: Mutex<Vec<MappedChunk>>,
}

impl ScriptedSource {
    pub fn new(chunk_count: u32, chunk_size: u32, mode: ReadMode) -> Arc<Self> {
        Arc::new(Self {
            chunk_count,
            chunk_size,
            mode: Mutex::new(mode),
            in_memory: Mutex::new(Vec::new()),
            parked: Mutex::new(Vec::new()),
            notifications: Mutex::new(Vec::new()),
            async_requests: Mutex::new(0),
            sync_loads: Mutex::new(0),
            map_on_available: OnceLock::new(),
            held: Mutex::new(Vec::new()),
        })
    }

    /// Bytes every read of `id` produces
    pub fn payload(&self, id: ChunkId) -> Vec<u8> {
        vec![id as u8; self.chunk_size as usize]
    }

    pub fn set_mode(&self, mode: ReadMode) {
        *self.mode.lock() = mode;
    }

    pub fn mark_in_memory(&self, id: ChunkId) {
        self.in_memory.lock().push(id);
    }

    /// Map every chunk from inside `on_chunk_available`, like a decoder would
    pub fn map_from_notifications(&self, cache: &Arc<StreamingCache>) {
        let _ = self.map_on_available.set(Arc::downgrade(cache));
    }

    pub fn take_held_mappings(&self) -> Vec<MappedChunk> {
        std::mem::take(&mut *self.held.lock())
    }

    pub fn take_parked(&self) -> Vec<CompletionCallback> {
        std::mem::take(&mut *self.parked.lock())
    }

    pub fn complete_parked(&self) -> usize {
        let parked = self.take_parked();
        let count = parked.len();
        for callback in parked {
            let data = self.payload(callback.chunk_id());
            callback.complete(Some(data));
        }
        count
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.notifications.lock().clone()
    }

    pub fn count(&self, notification: Notification) -> usize {
        self.notifications.lock().iter().filter(|n| **n == notification).count()
    }

    pub fn async_requests(&self) -> u32 {
        *self.async_requests.lock()
    }

    pub fn sync_loads(&self) -> u32 {
        *self.sync_loads.lock()
    }
}

impl ChunkSource for ScriptedSource {
    fn chunk_count(&self) -> u32 {
        self.chunk_count
    }

    fn chunk_byte_size(&self, _id: ChunkId) -> u32 {
        self.chunk_size
    }

    fn is_already_loaded_in_memory(&self, id: ChunkId) -> bool {
        self.in_memory.lock().contains(&id)
    }

    fn copy_already_loaded_chunk(&self, id: ChunkId, destination: &mut [u8]) {
        destination.copy_from_slice(&self.payload(id));
    }

    fn load_chunk_synchronously(&self, id: ChunkId, destination: &mut [u8]) -> Result<()> {
        *self.sync_loads.lock() += 1;
        if *self.mode.lock() == ReadMode::Fail {
            return Err(Error::Streaming(format!("scripted failure for chunk {}", id)));
        }
        destination.copy_from_slice(&self.payload(id));
        Ok(())
    }

    fn create_async_read_request(
        &self,
        id: ChunkId,
        callback: CompletionCallback,
    ) -> Option<RequestHandle> {
        let mode = *self.mode.lock();
        if mode == ReadMode::Refuse {
            callback.abandon();
            return None;
        }
        *self.async_requests.lock() += 1;

        let handle = callback.request();
        match mode {
            ReadMode::Immediate => callback.complete(Some(self.payload(id))),
            ReadMode::Manual => self.parked.lock().push(callback),
            ReadMode::Delayed(delay) => {
                let data = self.payload(id);
                std::thread::spawn(move || {
                    std::thread::sleep(delay);
                    callback.complete(Some(data));
                });
            }
            ReadMode::Fail => callback.complete(None),
            ReadMode::Refuse => unreachable!(),
        }
        Some(handle)
    }

    fn on_chunk_available(&self, id: ChunkId) {
        self.notifications.lock().push(Notification::Available(id));
        if let Some(cache) = self.map_on_available.get().and_then(Weak::upgrade) {
            if let Some(mapping) = cache.map_chunk(id, false) {
                self.held.lock().push(mapping);
            }
        }
    }

    fn on_chunk_evicting(&self, id: ChunkId) {
        self.notifications.lock().push(Notification::Evicting(id));
    }

    fn on_chunk_evicted(&self, id: ChunkId) {
        self.notifications.lock().push(Notification::Evicted(id));
    }
}

/// Owner that needs a fixed, swappable set of chunks
#[derive(Default)]
pub struct FixedOwner {
    needed: Mutex<Vec<ChunkId>>,
}

impl FixedOwner {
    pub fn new(needed: &[ChunkId]) -> Arc<Self> {
        Arc::new(Self {
            needed: Mutex::new(needed.to_vec()),
        })
    }

    pub fn set_needed(&self, needed: &[ChunkId]) {
        *self.needed.lock() = needed.to_vec();
    }
}

impl StreamingOwner for FixedOwner {
    fn compute_needed_chunk_indices(&self, out: &mut Vec<ChunkId>) {
        out.extend(self.needed.lock().iter().copied());
    }
}
