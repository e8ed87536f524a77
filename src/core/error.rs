//! Error types for volstream

use thiserror::Error;

use crate::streaming::ChunkId;

/// Main error type for the crate
///
/// Only setup paths (files, config, reader construction) return this. The
/// streaming cache itself reports recoverable conditions through `Option`/`bool`
/// and logging.
#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Sequence format error: {0}")]
    Format(String),

    #[error("Chunk {chunk} out of range (asset has {count} chunks)")]
    ChunkOutOfRange { chunk: ChunkId, count: u32 },

    #[error("Streaming error: {0}")]
    Streaming(String),
}

/// Result alias used by the fallible setup APIs
pub type Result<T> = std::result::Result<T, Error>;
