//! Resident chunk table: per-chunk records and the memory they own

use std::collections::HashMap;
use std::sync::Arc;

use crate::streaming::request::RequestHandle;
use crate::streaming::source::ChunkId;

/// A chunk known to the cache: requested, resident or waiting for eviction.
#[derive(Debug, Default)]
pub struct ResidentChunk {
    /// Chunk bytes. `Some` only once the chunk has been loaded.
    pub memory: Option<Arc<[u8]>>,
    /// Byte size reported by the source
    pub data_size: u32,
    /// Number of active mappings
    pub ref_count: u32,
    /// Outstanding read. `Some` while loading, `None` once resident.
    pub io_request: Option<RequestHandle>,
}

impl ResidentChunk {
    /// True when the chunk holds loaded bytes
    pub fn is_resident(&self) -> bool {
        self.memory.is_some()
    }
}

/// Table of [`ResidentChunk`] records keyed by chunk index.
///
/// The table is the only owner of chunk memory. Mappers receive a shared
/// read-only view whose validity is tracked by `ref_count`.
#[derive(Debug, Default)]
pub struct ResidentChunkTable {
    chunks: HashMap<ChunkId, ResidentChunk>,
    resident_bytes: usize,
}

impl ResidentChunkTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a zero-refcount, empty record for `id`, replacing any idle record.
    ///
    /// # Panics
    /// If a record for `id` exists and is still mapped.
    pub fn add_resident_chunk(&mut self, id: ChunkId, data_size: u32) -> &mut ResidentChunk {
        if let Some(previous) = self.chunks.get_mut(&id) {
            assert!(
                previous.ref_count == 0,
                "Chunk {} added twice while still mapped ({} mappings)",
                id,
                previous.ref_count
            );
            // Superseded in-flight reads are dropped here; their completion is discarded as stale
            previous.io_request = None;
            Self::release(&mut self.resident_bytes, previous);
        }

        let record = self.chunks.entry(id).or_default();
        *record = ResidentChunk {
            data_size,
            ..Default::default()
        };
        record
    }

    /// Free a record's memory and reset its fields. The record stays in the table.
    ///
    /// # Panics
    /// If the chunk is still mapped or still has a read in flight: both mean a
    /// map/unmap imbalance or a skipped drain, and freeing would leave a dangling view.
    pub fn remove_resident_chunk(&mut self, id: ChunkId) {
        let Some(record) = self.chunks.get_mut(&id) else {
            return;
        };

        assert!(
            record.ref_count == 0,
            "Tried to remove chunk {} which is still mapped. Make sure there is an unmap for every map.",
            id
        );
        assert!(
            record.io_request.is_none(),
            "Tried to remove chunk {} before its read was processed by the completion drain.",
            id
        );

        Self::release(&mut self.resident_bytes, record);
    }

    /// Release a record and drop it from the table
    pub fn forget(&mut self, id: ChunkId) {
        self.remove_resident_chunk(id);
        self.chunks.remove(&id);
    }

    /// Hand freshly loaded bytes to `id`'s record. Returns false if no record exists.
    pub fn store_memory(&mut self, id: ChunkId, bytes: Vec<u8>) -> bool {
        let Some(record) = self.chunks.get_mut(&id) else {
            return false;
        };
        if let Some(previous) = record.memory.take() {
            self.resident_bytes = self.resident_bytes.saturating_sub(previous.len());
        }
        self.resident_bytes += bytes.len();
        record.memory = Some(Arc::from(bytes.into_boxed_slice()));
        true
    }

    fn release(resident_bytes: &mut usize, record: &mut ResidentChunk) {
        if let Some(memory) = record.memory.take() {
            *resident_bytes = resident_bytes.saturating_sub(memory.len());
        }
        record.io_request = None;
        record.data_size = 0;
        record.ref_count = 0;
    }

    /// Look up a record
    pub fn get(&self, id: ChunkId) -> Option<&ResidentChunk> {
        self.chunks.get(&id)
    }

    /// Look up a record mutably
    pub fn get_mut(&mut self, id: ChunkId) -> Option<&mut ResidentChunk> {
        self.chunks.get_mut(&id)
    }

    /// Whether a record exists for `id`
    pub fn contains(&self, id: ChunkId) -> bool {
        self.chunks.contains_key(&id)
    }

    /// Outstanding reads, sorted by chunk index
    pub fn in_flight_requests(&self) -> Vec<(ChunkId, RequestHandle)> {
        let mut requests: Vec<_> = self
            .chunks
            .iter()
            .filter_map(|(id, record)| record.io_request.clone().map(|req| (*id, req)))
            .collect();
        requests.sort_by_key(|(id, _)| *id);
        requests
    }

    /// Every chunk index with a record
    pub fn ids(&self) -> Vec<ChunkId> {
        self.chunks.keys().copied().collect()
    }

    /// Total bytes held by loaded records
    pub fn resident_bytes(&self) -> usize {
        self.resident_bytes
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    /// True when no records exist
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}
