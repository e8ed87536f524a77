//! Frame sequence playback and the frame windows it streams

pub mod window;
pub mod player;

pub use window::{StreamWindow, add_indices_of_chunks_to_stream};
pub use player::{FrameReadiness, PlayMode, SequencePlayer};
