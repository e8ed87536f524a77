//! Streaming configuration

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::error::{Error, Result};

/// Tunables for the streaming manager, the async reader and sequence players.
///
/// Every field has a default so a partial JSON file is valid.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// Frames behind the playhead kept resident while playing.
    pub frames_behind_to_cache: u32,
    /// Frames ahead of the playhead streamed while playing.
    pub frames_ahead_to_cache: u32,
    /// Frames buffered from the playhead before playback starts.
    pub frames_to_cache_before_starting: u32,
    /// Worker threads of the async reader runtime.
    pub io_threads: usize,
    /// Reads allowed in flight at once.
    pub max_concurrent_reads: usize,
    /// Time limit for the blocking drain at teardown, in milliseconds. 0 = unbounded.
    pub teardown_time_limit_ms: u64,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            frames_behind_to_cache: 1,
            frames_ahead_to_cache: 3,
            frames_to_cache_before_starting: 2,
            io_threads: 2,
            max_concurrent_reads: 8,
            teardown_time_limit_ms: 0,
        }
    }
}

impl StreamingConfig {
    /// Load a config from a JSON file and validate it
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let config: StreamingConfig = serde_json::from_str(&json)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the reader cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.io_threads == 0 {
            return Err(Error::Config("io_threads must be at least 1".into()));
        }
        if self.max_concurrent_reads == 0 {
            return Err(Error::Config("max_concurrent_reads must be at least 1".into()));
        }
        Ok(())
    }

    /// Teardown limit as accepted by `block_till_all_requests_finished`
    pub fn teardown_time_limit(&self) -> Option<Duration> {
        match self.teardown_time_limit_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }
}
