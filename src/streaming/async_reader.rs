//! Async chunk reader: ranged file reads on a dedicated tokio runtime
//!
//! Reads are queued FIFO and at most `max_concurrent` run at once. Each read
//! completes its [`CompletionCallback`] from a runtime worker thread.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::runtime::Runtime;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::core::{Result, StreamingConfig};
use crate::streaming::disk_io::{ChunkEntry, read_chunk_range};
use crate::streaming::request::{CompletionCallback, RequestHandle};

/// One queued ranged read
struct ReadJob {
    path: Arc<PathBuf>,
    entry: ChunkEntry,
    callback: CompletionCallback,
}

/// Worker pool serving chunk reads for any number of sequence files
pub struct AsyncReader {
    /// Channel feeding the worker loop
    job_tx: mpsc::UnboundedSender<ReadJob>,
    /// Owned runtime; shut down in the background on drop
    runtime: Option<Runtime>,
}

impl AsyncReader {
    /// Create a reader with its own runtime
    ///
    /// # Arguments
    /// * `io_threads` - Runtime worker threads
    /// * `max_concurrent` - Reads allowed in flight at once
    pub fn new(io_threads: usize, max_concurrent: usize) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(io_threads.max(1))
            .thread_name("volstream-io")
            .enable_all()
            .build()?;

        let (job_tx, job_rx) = mpsc::unbounded_channel::<ReadJob>();
        runtime.spawn(Self::worker_loop(max_concurrent.max(1), job_rx));

        log::debug!(
            "Async reader started ({} threads, {} concurrent reads)",
            io_threads,
            max_concurrent
        );

        Ok(Self {
            job_tx,
            runtime: Some(runtime),
        })
    }

    /// Create a reader sized from the streaming config
    pub fn from_config(config: &StreamingConfig) -> Result<Self> {
        config.validate()?;
        Self::new(config.io_threads, config.max_concurrent_reads)
    }

    /// Queue a read of `entry` from `path`.
    ///
    /// Returns the request handle, or `None` if the reader has shut down.
    pub fn submit(
        &self,
        path: Arc<PathBuf>,
        entry: ChunkEntry,
        callback: CompletionCallback,
    ) -> Option<RequestHandle> {
        let handle = callback.request();
        match self.job_tx.send(ReadJob {
            path,
            entry,
            callback,
        }) {
            Ok(()) => Some(handle),
            Err(mpsc::error::SendError(job)) => {
                log::error!("Async reader is shut down, dropping read of chunk {}", job.callback.chunk_id());
                job.callback.abandon();
                None
            }
        }
    }

    async fn worker_loop(max_concurrent: usize, mut job_rx: mpsc::UnboundedReceiver<ReadJob>) {
        let mut active = JoinSet::new();
        let mut queued: VecDeque<ReadJob> = VecDeque::new();
        let mut accepting = true;

        loop {
            tokio::select! {
                job = job_rx.recv(), if accepting => {
                    match job {
                        Some(job) => queued.push_back(job),
                        None => accepting = false,
                    }
                }

                Some(result) = active.join_next(), if !active.is_empty() => {
                    if let Err(e) = result {
                        log::error!("Chunk read task failed: {}", e);
                    }
                }

                // Channel closed and nothing left in flight
                else => break,
            }

            while active.len() < max_concurrent {
                let Some(job) = queued.pop_front() else {
                    break;
                };
                active.spawn(Self::read_task(job));
            }
        }
    }

    async fn read_task(job: ReadJob) {
        let ReadJob {
            path,
            entry,
            callback,
        } = job;

        match read_chunk_range(&path, entry).await {
            Ok(data) => callback.complete(Some(data)),
            Err(e) => {
                log::error!(
                    "Read of chunk {} from {} failed: {}",
                    callback.chunk_id(),
                    path.display(),
                    e
                );
                callback.complete(None);
            }
        }
    }
}

impl Drop for AsyncReader {
    fn drop(&mut self) {
        // Unfinished reads are dropped with the runtime and report failure
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}
