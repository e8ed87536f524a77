//! Core types shared by the streaming and animation modules

pub mod config;
pub mod error;
pub mod logging;

pub use config::StreamingConfig;
pub use error::{Error, Result};
