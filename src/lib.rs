//! Volstream - chunked streaming cache for volumetric frame sequences

pub mod core;
pub mod streaming;
pub mod animation;
