//! Collaborator traits: the streamed asset and the consumer that drives it

use crate::core::Result;
use crate::streaming::request::{CompletionCallback, RequestHandle};

/// Index of a chunk within one asset. Stable for the asset's lifetime.
pub type ChunkId = u32;

/// An asset whose chunks can be streamed by a [`StreamingCache`](super::StreamingCache).
///
/// The cache never owns the asset's storage; it only asks for sizes and reads.
/// Size queries and read methods are called while the cache's lock is held and
/// must not call back into the cache. The `on_chunk_*` notifications are
/// dispatched with the lock still held but re-enterable, so they may map and
/// unmap chunks of the same cache from the notifying thread.
pub trait ChunkSource: Send + Sync {
    /// Number of chunks in the asset
    fn chunk_count(&self) -> u32;

    /// Byte size of a chunk, fixed for the asset's lifetime
    fn chunk_byte_size(&self, id: ChunkId) -> u32;

    /// True when the chunk's bytes are already in memory and no I/O is needed
    fn is_already_loaded_in_memory(&self, _id: ChunkId) -> bool {
        false
    }

    /// Copy already-resident bytes into `destination` (exactly `chunk_byte_size` long)
    fn copy_already_loaded_chunk(&self, _id: ChunkId, _destination: &mut [u8]) {}

    /// Blocking read of a chunk into `destination` on the calling thread
    fn load_chunk_synchronously(&self, id: ChunkId, destination: &mut [u8]) -> Result<()>;

    /// Start an asynchronous read.
    ///
    /// The implementation must eventually call [`CompletionCallback::complete`]
    /// (from any thread) and return the callback's handle. Returning `None`
    /// means the request could not be created; the cache logs and retries on a
    /// later update. A source that refuses must hand the callback to
    /// [`CompletionCallback::abandon`] before returning `None`; dropping it
    /// instead reports a failed read that reaches the cache as a stray
    /// completion.
    fn create_async_read_request(
        &self,
        id: ChunkId,
        callback: CompletionCallback,
    ) -> Option<RequestHandle>;

    /// The chunk just became mappable
    fn on_chunk_available(&self, _id: ChunkId) {}

    /// The chunk is no longer needed; its memory will be released once unmapped
    fn on_chunk_evicting(&self, _id: ChunkId) {}

    /// The chunk's memory has been released
    fn on_chunk_evicted(&self, _id: ChunkId) {}
}

/// Consumer side: decides which chunks it needs every update.
pub trait StreamingOwner: Send + Sync {
    /// Append the chunk indices needed right now to `out`.
    ///
    /// Called once per manager update; `out` is empty on entry.
    fn compute_needed_chunk_indices(&self, out: &mut Vec<ChunkId>);
}
