//! [`ChunkSource`] over a packed sequence file

use std::path::PathBuf;
use std::sync::Arc;

use crate::core::Result;
use crate::streaming::async_reader::AsyncReader;
use crate::streaming::disk_io::SequenceFile;
use crate::streaming::request::{CompletionCallback, RequestHandle};
use crate::streaming::source::{ChunkId, ChunkSource};

/// A sequence file streamed through a shared [`AsyncReader`].
///
/// With [`preload`](Self::preload) every chunk is held in memory and the cache
/// takes the copy path instead of issuing reads.
pub struct FileChunkSource {
    file: SequenceFile,
    path: Arc<PathBuf>,
    reader: Arc<AsyncReader>,
    preloaded: Option<Vec<Vec<u8>>>,
}

impl FileChunkSource {
    /// Wrap an opened sequence file
    pub fn new(file: SequenceFile, reader: Arc<AsyncReader>) -> Self {
        let path = Arc::new(file.path().to_path_buf());
        Self {
            file,
            path,
            reader,
            preloaded: None,
        }
    }

    /// Open a sequence file and wrap it
    pub fn open(path: impl Into<PathBuf>, reader: Arc<AsyncReader>) -> Result<Self> {
        Ok(Self::new(SequenceFile::open(path)?, reader))
    }

    /// Read the whole file into memory now
    pub fn preload(mut self) -> Result<Self> {
        let chunks = self.file.read_all()?;
        log::debug!("Preloaded {} chunks from {}", chunks.len(), self.path.display());
        self.preloaded = Some(chunks);
        Ok(self)
    }

    /// The underlying file
    pub fn file(&self) -> &SequenceFile {
        &self.file
    }
}

impl ChunkSource for FileChunkSource {
    fn chunk_count(&self) -> u32 {
        self.file.chunk_count()
    }

    fn chunk_byte_size(&self, id: ChunkId) -> u32 {
        self.file.entry(id).map_or(0, |entry| entry.size)
    }

    fn is_already_loaded_in_memory(&self, id: ChunkId) -> bool {
        self.preloaded
            .as_ref()
            .is_some_and(|chunks| (id as usize) < chunks.len())
    }

    fn copy_already_loaded_chunk(&self, id: ChunkId, destination: &mut [u8]) {
        if let Some(chunk) = self.preloaded.as_ref().and_then(|chunks| chunks.get(id as usize)) {
            destination.copy_from_slice(chunk);
        }
    }

    fn load_chunk_synchronously(&self, id: ChunkId, destination: &mut [u8]) -> Result<()> {
        self.file.read_chunk_into(id, destination)
    }

    fn create_async_read_request(
        &self,
        id: ChunkId,
        callback: CompletionCallback,
    ) -> Option<RequestHandle> {
        match self.file.entry(id) {
            Ok(entry) => self.reader.submit(self.path.clone(), entry, callback),
            Err(e) => {
                log::error!("{}", e);
                callback.abandon();
                None
            }
        }
    }

    fn on_chunk_available(&self, id: ChunkId) {
        log::trace!("{}: chunk {} available", self.path.display(), id);
    }

    fn on_chunk_evicted(&self, id: ChunkId) {
        log::trace!("{}: chunk {} evicted", self.path.display(), id);
    }
}
