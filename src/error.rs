//! Unified error types for avmux

use thiserror::Error;

/// Main error type for avmux operations
#[derive(Error, Debug)]
pub enum AvmuxError {
    /// Stream format rejected at allocation time
    #[error("Invalid stream format: {0}")]
    InvalidFormat(String),

    /// Buffer allocation failed (over the memory ceiling, could not degrade)
    #[error("Buffer allocation failed: {0}")]
    AllocationFailed(String),

    /// Stream handle does not refer to a registered stream
    #[error("Stream not found: index {0}")]
    StreamNotFound(usize),

    /// Audio stream limit reached
    #[error("Too many audio streams (limit {0})")]
    TooManyStreams(usize),

    /// Engine not running
    #[error("Sync engine not running")]
    NotRunning,

    /// Engine already running
    #[error("Sync engine already running")]
    AlreadyRunning,

    /// Live splice or live add gave up within its bounded wait
    #[error("Splice timed out: {0}")]
    SpliceTimeout(String),

    /// A live splice is already staged or running
    #[error("A live splice is already in progress")]
    SpliceInProgress,

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Thread communication error
    #[error("Thread communication error: {0}")]
    ChannelError(String),
}

/// Result type alias for avmux operations
pub type Result<T> = std::result::Result<T, AvmuxError>;

impl AvmuxError {
    /// Check if this error is recoverable (can retry)
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            AvmuxError::SpliceTimeout(_) | AvmuxError::ChannelError(_)
        )
    }
}
