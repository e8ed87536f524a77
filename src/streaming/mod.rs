//! Chunk streaming: per-asset caches, async reads and the manager that drives them

pub mod source;
pub mod request;
pub mod resident;
pub mod cache;
pub mod manager;
pub mod disk_io;
pub mod async_reader;
pub mod file_source;

#[cfg(test)]
pub(crate) mod testing;

pub use source::{ChunkId, ChunkSource, StreamingOwner};
pub use request::{CompletedChunk, CompletionCallback, ReadRequest, RequestHandle};
pub use resident::{ResidentChunk, ResidentChunkTable};
pub use cache::{CacheStats, ChunkState, MappedChunk, StreamingCache};
pub use manager::{OwnerId, StreamingStats, VolumeId, VolumeStreamingManager};
pub use disk_io::{
    ChunkEntry, SequenceFile, SEQUENCE_MAGIC, SEQUENCE_VERSION,
    encode_sequence, write_sequence_file, read_chunk_range,
};
pub use async_reader::AsyncReader;
pub use file_source::FileChunkSource;
