//! Error types for the live voice session.

use crate::audio::codec::CodecError;

/// Top-level error type for the live consult session.
#[derive(Debug, thiserror::Error)]
pub enum LiveError {
    /// Microphone or speaker unavailable, permission denied, or stream failure.
    #[error("device error: {0}")]
    Device(String),

    /// The remote session link failed to open or dropped.
    #[error("link error: {0}")]
    Link(String),

    /// An audio chunk could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Operation not valid for the session's current state.
    #[error("session error: {0}")]
    Session(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, LiveError>;
