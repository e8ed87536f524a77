//! Frame sequence playback driving chunk streaming
//!
//! A [`SequencePlayer`] is a [`StreamingOwner`]: every manager tick it declares
//! the frames it needs around its playhead.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::animation::window::{StreamWindow, add_indices_of_chunks_to_stream};
use crate::core::StreamingConfig;
use crate::streaming::{ChunkId, ChunkState, StreamingCache, StreamingOwner};

/// Playback mode
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PlayMode {
    #[default]
    Stopped,
    Playing,
    Paused,
}

/// Tells the player whether a frame's data can be displayed
pub trait FrameReadiness: Send + Sync {
    fn is_frame_ready(&self, frame: u32) -> bool;
}

impl FrameReadiness for StreamingCache {
    fn is_frame_ready(&self, frame: u32) -> bool {
        self.chunk_state(frame) == ChunkState::Available
    }
}

#[derive(Debug)]
struct PlayerState {
    mode: PlayMode,
    looping: bool,
    manual_tick: bool,
    speed: f32,
    elapsed: f32,
    loop_count: u32,
    last_displayed: Option<u32>,
    /// Waiting for the first frames before time starts advancing
    buffering: bool,
}

impl Default for PlayerState {
    fn default() -> Self {
        Self {
            mode: PlayMode::Stopped,
            looping: false,
            manual_tick: false,
            speed: 1.0,
            elapsed: 0.0,
            loop_count: 0,
            last_displayed: None,
            buffering: false,
        }
    }
}

/// Plays a sequence of `frame_count` frames at `frame_rate` frames per second
pub struct SequencePlayer {
    frame_count: u32,
    frame_rate: f32,
    window: StreamWindow,
    frames_to_cache_before_starting: u32,
    readiness: Option<Arc<dyn FrameReadiness>>,
    state: Mutex<PlayerState>,
}

impl SequencePlayer {
    pub fn new(frame_count: u32, frame_rate: f32, config: &StreamingConfig) -> Self {
        Self {
            frame_count,
            frame_rate: if frame_rate > 0.0 { frame_rate } else { 1.0 },
            window: StreamWindow::new(config.frames_behind_to_cache, config.frames_ahead_to_cache),
            frames_to_cache_before_starting: config.frames_to_cache_before_starting,
            readiness: None,
            state: Mutex::new(PlayerState::default()),
        }
    }

    /// Consult `readiness` for frame availability. Without it every frame counts as ready.
    pub fn with_readiness(mut self, readiness: Arc<dyn FrameReadiness>) -> Self {
        self.readiness = Some(readiness);
        self
    }

    pub fn frame_count(&self) -> u32 {
        self.frame_count
    }

    /// Sequence length in seconds
    pub fn duration(&self) -> f32 {
        self.frame_count as f32 / self.frame_rate
    }

    // --- Controls ---

    /// Start or resume. Playback from a stop buffers first.
    pub fn play(&self) {
        let mut state = self.state.lock();
        if state.mode == PlayMode::Stopped {
            state.buffering = true;
        }
        state.mode = PlayMode::Playing;
    }

    pub fn pause(&self) {
        let mut state = self.state.lock();
        if state.mode == PlayMode::Playing {
            state.mode = PlayMode::Paused;
        }
    }

    /// Stop and rewind
    pub fn stop(&self) {
        let mut state = self.state.lock();
        state.mode = PlayMode::Stopped;
        state.elapsed = 0.0;
        state.loop_count = 0;
        state.buffering = false;
    }

    pub fn set_looping(&self, looping: bool) {
        self.state.lock().looping = looping;
    }

    /// In manual-tick mode time only moves through [`seek`](Self::seek)
    pub fn set_manual_tick(&self, manual_tick: bool) {
        self.state.lock().manual_tick = manual_tick;
    }

    pub fn set_speed(&self, speed: f32) {
        self.state.lock().speed = speed;
    }

    /// Jump to `time` seconds, clamped to the sequence
    pub fn seek(&self, time: f32) {
        self.state.lock().elapsed = time.clamp(0.0, self.duration());
    }

    // --- Queries ---

    pub fn mode(&self) -> PlayMode {
        self.state.lock().mode
    }

    pub fn is_buffering(&self) -> bool {
        self.state.lock().buffering
    }

    pub fn loop_count(&self) -> u32 {
        self.state.lock().loop_count
    }

    /// Frame under the playhead
    pub fn current_frame(&self) -> u32 {
        let elapsed = self.state.lock().elapsed;
        self.frame_at(elapsed)
    }

    /// Last frame that was ready when needs were computed
    pub fn last_displayed_frame(&self) -> Option<u32> {
        self.state.lock().last_displayed
    }

    fn frame_at(&self, time: f32) -> u32 {
        if self.frame_count == 0 {
            return 0;
        }
        let time = time.clamp(0.0, self.duration());
        ((time * self.frame_rate).floor() as u32).min(self.frame_count - 1)
    }

    fn is_frame_ready(&self, frame: u32) -> bool {
        self.readiness
            .as_ref()
            .is_none_or(|readiness| readiness.is_frame_ready(frame))
    }

    /// Advance the playhead by `dt` seconds.
    ///
    /// Time does not move while stopped, paused, in manual-tick mode, or while
    /// the first frames after `play` are still streaming in.
    pub fn tick(&self, dt: f32) {
        let mut state = self.state.lock();
        if state.manual_tick || state.mode != PlayMode::Playing || self.frame_count == 0 {
            return;
        }

        if state.buffering {
            let begin = self.frame_at(state.elapsed);
            let end = begin
                .saturating_add(self.frames_to_cache_before_starting)
                .min(self.frame_count);
            if !(begin..end).all(|frame| self.is_frame_ready(frame)) {
                log::trace!("Buffering frames [{}, {})", begin, end);
                return;
            }
            state.buffering = false;
        }

        let duration = self.duration();
        let advanced = state.elapsed + dt * state.speed;

        if state.looping {
            // A wrap in either direction counts as a loop
            if !(0.0..duration).contains(&advanced) {
                state.loop_count += 1;
            }
            state.elapsed = advanced.rem_euclid(duration);
        } else {
            state.elapsed = advanced.clamp(0.0, duration);
        }
    }
}

impl StreamingOwner for SequencePlayer {
    fn compute_needed_chunk_indices(&self, out: &mut Vec<ChunkId>) {
        if self.frame_count == 0 {
            return;
        }

        let mut state = self.state.lock();
        let frame = self.frame_at(state.elapsed);
        out.push(frame);

        // Keep the displayed frame until the new one can replace it
        let ready = self.is_frame_ready(frame);
        if !ready {
            if let Some(displayed) = state.last_displayed.filter(|displayed| *displayed != frame) {
                out.push(displayed);
            }
        }

        if state.mode != PlayMode::Stopped || state.manual_tick {
            let window = if state.manual_tick {
                self.window.symmetric()
            } else {
                self.window
            };
            let wrap = state.looping && state.loop_count > 0;
            window.add_chunks(out, frame, self.frame_count, wrap);
        }

        if state.buffering && self.frames_to_cache_before_starting > 0 {
            let last = frame
                .saturating_add(self.frames_to_cache_before_starting - 1)
                .min(self.frame_count - 1);
            add_indices_of_chunks_to_stream(out, self.frame_count, frame, last);
        }

        if ready {
            state.last_displayed = Some(frame);
        }
    }
}
