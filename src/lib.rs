//! avmux - drift-corrected A/V sync engine
//!
//! Ingests independently-clocked audio and video sample streams and
//! re-emits them as a single, strictly time-ordered stream suitable
//! for a downstream real-time encoder.

pub mod audio;
pub mod config;
pub mod error;
pub mod sync;
pub mod video;

pub use error::{AvmuxError, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
