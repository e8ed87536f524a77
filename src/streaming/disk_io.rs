//! Packed volume-sequence files and chunk reads
//!
//! Layout (little endian):
//!
//! ```text
//! "VSEQ" | version: u32 | chunk_count: u32 | chunk_count x (offset: u64, size: u32) | payloads
//! ```
//!
//! Payloads are stored uncompressed so a chunk is one contiguous ranged read.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::core::{Error, Result};
use crate::streaming::source::ChunkId;

/// File signature
pub const SEQUENCE_MAGIC: [u8; 4] = *b"VSEQ";
/// Current format version
pub const SEQUENCE_VERSION: u32 = 1;

const PREAMBLE_SIZE: u64 = 12;
const ENTRY_SIZE: u64 = 12;

/// Location of one chunk's payload in the file
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkEntry {
    pub offset: u64,
    pub size: u32,
}

/// Serialize chunk payloads into the packed layout
pub fn encode_sequence<C: AsRef<[u8]>>(chunks: &[C]) -> Vec<u8> {
    let table_end = PREAMBLE_SIZE + ENTRY_SIZE * chunks.len() as u64;
    let payload_size: usize = chunks.iter().map(|c| c.as_ref().len()).sum();
    let mut bytes = Vec::with_capacity(table_end as usize + payload_size);

    bytes.extend_from_slice(&SEQUENCE_MAGIC);
    bytes.extend_from_slice(&SEQUENCE_VERSION.to_le_bytes());
    bytes.extend_from_slice(&(chunks.len() as u32).to_le_bytes());

    let mut offset = table_end;
    for chunk in chunks {
        let size = chunk.as_ref().len() as u32;
        bytes.extend_from_slice(&offset.to_le_bytes());
        bytes.extend_from_slice(&size.to_le_bytes());
        offset += size as u64;
    }

    for chunk in chunks {
        bytes.extend_from_slice(chunk.as_ref());
    }

    bytes
}

/// Write a sequence file, creating parent directories as needed
pub fn write_sequence_file<C: AsRef<[u8]>>(path: &Path, chunks: &[C]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut writer = BufWriter::new(File::create(path)?);
    writer.write_all(&encode_sequence(chunks))?;
    writer.flush()?;

    log::debug!("Wrote {} chunks to {}", chunks.len(), path.display());
    Ok(())
}

/// An opened sequence file: its chunk table, read once, plus the path for ranged reads
#[derive(Clone, Debug)]
pub struct SequenceFile {
    path: PathBuf,
    entries: Vec<ChunkEntry>,
}

impl SequenceFile {
    /// Read and validate the header and chunk table
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = File::open(&path)?;
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);

        let mut preamble = [0u8; PREAMBLE_SIZE as usize];
        reader
            .read_exact(&mut preamble)
            .map_err(|_| Error::Format(format!("{}: truncated header", path.display())))?;

        if preamble[0..4] != SEQUENCE_MAGIC {
            return Err(Error::Format(format!("{}: not a sequence file", path.display())));
        }
        let version = read_u32(&preamble[4..8]);
        if version != SEQUENCE_VERSION {
            return Err(Error::Format(format!(
                "{}: unsupported version {} (expected {})",
                path.display(),
                version,
                SEQUENCE_VERSION
            )));
        }
        let count = read_u32(&preamble[8..12]);

        let table_end = PREAMBLE_SIZE + ENTRY_SIZE * count as u64;
        if table_end > file_len {
            return Err(Error::Format(format!(
                "{}: chunk table for {} chunks exceeds file size",
                path.display(),
                count
            )));
        }

        let mut table = vec![0u8; (ENTRY_SIZE * count as u64) as usize];
        reader.read_exact(&mut table)?;

        let entries = table
            .chunks_exact(ENTRY_SIZE as usize)
            .map(|raw| ChunkEntry {
                offset: read_u64(&raw[0..8]),
                size: read_u32(&raw[8..12]),
            })
            .collect::<Vec<_>>();

        for (id, entry) in entries.iter().enumerate() {
            if entry.offset < table_end || entry.offset.saturating_add(entry.size as u64) > file_len {
                return Err(Error::Format(format!(
                    "{}: chunk {} [{}, +{}) lies outside the payload area",
                    path.display(),
                    id,
                    entry.offset,
                    entry.size
                )));
            }
        }

        log::debug!("Opened {} ({} chunks)", path.display(), entries.len());
        Ok(Self { path, entries })
    }

    /// Path the file was opened from
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of chunks
    pub fn chunk_count(&self) -> u32 {
        self.entries.len() as u32
    }

    /// Table entry for a chunk
    pub fn entry(&self, id: ChunkId) -> Result<ChunkEntry> {
        self.entries
            .get(id as usize)
            .copied()
            .ok_or(Error::ChunkOutOfRange {
                chunk: id,
                count: self.chunk_count(),
            })
    }

    /// Blocking read of one chunk into `destination`, which must be exactly the chunk's size
    pub fn read_chunk_into(&self, id: ChunkId, destination: &mut [u8]) -> Result<()> {
        let entry = self.entry(id)?;
        if destination.len() != entry.size as usize {
            return Err(Error::Streaming(format!(
                "chunk {} is {} bytes, destination holds {}",
                id,
                entry.size,
                destination.len()
            )));
        }

        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(entry.offset))?;
        file.read_exact(destination)?;
        Ok(())
    }

    /// Read every chunk into memory in one pass
    pub fn read_all(&self) -> Result<Vec<Vec<u8>>> {
        let bytes = std::fs::read(&self.path)?;
        self.entries
            .iter()
            .enumerate()
            .map(|(id, entry)| {
                let start = entry.offset as usize;
                bytes
                    .get(start..start + entry.size as usize)
                    .map(<[u8]>::to_vec)
                    .ok_or_else(|| {
                        Error::Format(format!("{}: chunk {} truncated", self.path.display(), id))
                    })
            })
            .collect()
    }
}

/// Async ranged read of one chunk payload
pub async fn read_chunk_range(path: &Path, entry: ChunkEntry) -> Result<Vec<u8>> {
    let mut file = tokio::fs::File::open(path).await?;
    file.seek(SeekFrom::Start(entry.offset)).await?;

    let mut data = vec![0u8; entry.size as usize];
    file.read_exact(&mut data).await?;
    Ok(data)
}

fn read_u32(raw: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&raw[..4]);
    u32::from_le_bytes(buf)
}

fn read_u64(raw: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&raw[..8]);
    u64::from_le_bytes(buf)
}
