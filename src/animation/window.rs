//! Frame window around a playhead, as chunk indices
//!
//! One frame maps to one chunk, so frame and chunk indices are interchangeable here.

use crate::streaming::ChunkId;

/// Append the chunk range `[first, last]` to `out`, skipping indices already present.
///
/// When `last < first` the range wraps past the end of the sequence and
/// `[first, frame_count - 1]` then `[0, last]` are added.
pub fn add_indices_of_chunks_to_stream(
    out: &mut Vec<ChunkId>,
    frame_count: u32,
    first: ChunkId,
    last: ChunkId,
) {
    let mut push_unique = |id: ChunkId| {
        if !out.contains(&id) {
            out.push(id);
        }
    };

    if last < first {
        (first..frame_count).for_each(&mut push_unique);
        (0..=last).for_each(&mut push_unique);
    } else {
        (first..=last).for_each(&mut push_unique);
    }
}

/// Frames kept resident behind and ahead of the playhead
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamWindow {
    pub behind: u32,
    pub ahead: u32,
}

impl StreamWindow {
    pub fn new(behind: u32, ahead: u32) -> Self {
        Self { behind, ahead }
    }

    /// Window with both sides widened to the larger of the two (used for scrubbing)
    pub fn symmetric(self) -> Self {
        let widest = self.behind.max(self.ahead);
        Self::new(widest, widest)
    }

    /// First and last frame of the window around `frame`.
    ///
    /// Without `wrap` the window is clamped to the sequence. With `wrap` a
    /// start before frame 0 continues from the end and an end past the last
    /// frame continues from the start, so `last < first` is possible.
    /// Returns `None` for an empty sequence.
    pub fn bounds(&self, frame: u32, frame_count: u32, wrap: bool) -> Option<(u32, u32)> {
        if frame_count == 0 {
            return None;
        }
        let last_frame = frame_count - 1;
        let frame = frame.min(last_frame);

        if !wrap {
            let first = frame.saturating_sub(self.behind);
            let last = frame.saturating_add(self.ahead).min(last_frame);
            return Some((first, last));
        }

        // Window covers the whole loop
        if self.behind as u64 + self.ahead as u64 + 1 >= frame_count as u64 {
            return Some((0, last_frame));
        }

        let first = if self.behind > frame {
            frame_count - (self.behind - frame)
        } else {
            frame - self.behind
        };

        let end = frame + self.ahead;
        let last = if end > last_frame { end - last_frame - 1 } else { end };

        Some((first, last))
    }

    /// Append the window around `frame` to `out`
    pub fn add_chunks(&self, out: &mut Vec<ChunkId>, frame: u32, frame_count: u32, wrap: bool) {
        if let Some((first, last)) = self.bounds(frame, frame_count, wrap) {
            add_indices_of_chunks_to_stream(out, frame_count, first, last);
        }
    }
}
