//! Error types for the client mirror.

use thiserror::Error;

/// Result type for mirror operations.
pub type MirrorResult<T> = Result<T, MirrorError>;

/// Errors that can occur while loading, persisting or feeding the mirror.
#[derive(Error, Debug)]
pub enum MirrorError {
    /// I/O error from a file-backed storage.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Stored document could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Stored document was written by an incompatible version.
    #[error("unsupported mirror document version {found} (expected {expected})")]
    UnsupportedVersion {
        /// Version found on disk.
        found: u32,
        /// Version this build writes.
        expected: u32,
    },

    /// A stream frame could not be applied.
    #[error("invalid frame: {0}")]
    InvalidFrame(String),
}

impl MirrorError {
    /// Returns true if the error came from malformed stream input rather
    /// than local storage.
    pub fn is_frame_error(&self) -> bool {
        matches!(self, MirrorError::InvalidFrame(_))
    }
}
