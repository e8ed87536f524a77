//! Async read handles and the completion hand-off from I/O threads
//!
//! A [`CompletionCallback`] is handed to the [`ChunkSource`](super::ChunkSource)
//! with every async read. When the read finishes, an I/O thread calls
//! [`CompletionCallback::complete`], which stores the result in the shared
//! [`ReadRequest`], pushes a [`CompletedChunk`] onto the cache's completion
//! channel and wakes anyone blocked on the request. It never touches the
//! cache's lock: the I/O layer may hold its own lock while invoking us, and a
//! thread holding the cache lock may be waiting on that I/O layer.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use parking_lot::{Condvar, Mutex};

use crate::streaming::source::ChunkId;

/// Shared handle to an outstanding or finished read
pub type RequestHandle = Arc<ReadRequest>;

#[derive(Default)]
struct ReadState {
    finished: bool,
    results: Option<Vec<u8>>,
}

/// One asynchronous chunk read.
///
/// Results are taken exactly once by the drain step.
#[derive(Default)]
pub struct ReadRequest {
    state: Mutex<ReadState>,
    finished: Condvar,
}

impl std::fmt::Debug for ReadRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ReadRequest")
            .field("finished", &state.finished)
            .field("has_results", &state.results.is_some())
            .finish()
    }
}

impl ReadRequest {
    fn new() -> RequestHandle {
        Arc::new(Self::default())
    }

    /// True once the read has finished, successfully or not
    pub fn poll_completion(&self) -> bool {
        self.state.lock().finished
    }

    /// Block until the read finishes.
    ///
    /// `None` waits forever. Returns false if the timeout expired first.
    pub fn wait_completion(&self, timeout: Option<Duration>) -> bool {
        let mut state = self.state.lock();
        match timeout {
            None => {
                while !state.finished {
                    self.finished.wait(&mut state);
                }
                true
            }
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                while !state.finished {
                    if self.finished.wait_until(&mut state, deadline).timed_out() {
                        return state.finished;
                    }
                }
                true
            }
        }
    }

    /// Take the bytes read, leaving `None` behind. `None` also means the read failed.
    pub fn take_read_results(&self) -> Option<Vec<u8>> {
        self.state.lock().results.take()
    }

    fn set_results(&self, results: Option<Vec<u8>>) {
        self.state.lock().results = results;
    }

    fn mark_finished(&self) {
        self.state.lock().finished = true;
        self.finished.notify_all();
    }
}

/// A finished read waiting to be drained by the cache
#[derive(Debug)]
pub struct CompletedChunk {
    pub chunk_id: ChunkId,
    pub request: RequestHandle,
}

/// Completion hook passed to [`ChunkSource::create_async_read_request`](super::ChunkSource::create_async_read_request).
///
/// Dropping it without calling `complete` reports the read as failed, so a
/// source that loses a request cannot leave a waiter blocked forever.
pub struct CompletionCallback {
    chunk_id: ChunkId,
    request: RequestHandle,
    completed_tx: Option<Sender<CompletedChunk>>,
}

impl CompletionCallback {
    pub(crate) fn new(chunk_id: ChunkId, completed_tx: Sender<CompletedChunk>) -> Self {
        Self {
            chunk_id,
            request: ReadRequest::new(),
            completed_tx: Some(completed_tx),
        }
    }

    /// Chunk this read is for
    pub fn chunk_id(&self) -> ChunkId {
        self.chunk_id
    }

    /// Handle the source returns from `create_async_read_request`
    pub fn request(&self) -> RequestHandle {
        self.request.clone()
    }

    /// Report the read result. Safe to call from any thread; never blocks on the cache.
    ///
    /// `None` reports a failed read.
    pub fn complete(mut self, data: Option<Vec<u8>>) {
        self.finish(data);
    }

    /// Give up on a read that was never started. Waiters are released but
    /// nothing is queued for the cache.
    pub fn abandon(mut self) {
        self.completed_tx = None;
        self.request.mark_finished();
    }

    fn finish(&mut self, data: Option<Vec<u8>>) {
        let Some(completed_tx) = self.completed_tx.take() else {
            return;
        };

        // Results before the enqueue so the drain never sees an empty success,
        // enqueue before finishing so a woken waiter always finds the record queued
        self.request.set_results(data);

        // The cache may already be gone; the request still completes for waiters
        let _ = completed_tx.send(CompletedChunk {
            chunk_id: self.chunk_id,
            request: self.request.clone(),
        });

        self.request.mark_finished();
    }
}

impl Drop for CompletionCallback {
    fn drop(&mut self) {
        if self.completed_tx.is_some() {
            log::warn!("Read request for chunk {} dropped without completing", self.chunk_id);
            self.finish(None);
        }
    }
}
