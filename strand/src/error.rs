//! Error handling.

use std::error::Error as StdError;

use displaydoc::Display;

pub type StrandResult<T> = Result<T, StrandError>;

/// An error.
#[derive(Debug, Display)]
pub enum StrandError {
    /// Invalid blob hash "{hash}": {reason}
    InvalidBlobHash { hash: String, reason: &'static str },

    /// Invalid stream descriptor: {reason}
    InvalidDescriptor { reason: String },

    /// Chunk decryption failed: {reason}
    DecryptionFailed { reason: &'static str },

    /// Seeking out of bounds
    SeekOutOfBounds,

    /// Seeking before the beginning of the stream
    SeekBeforeStart,

    /// Stream size is zero
    StreamSizeZero,
}

impl StrandError {
    pub fn name(&self) -> &'static str {
        match self {
            Self::InvalidBlobHash { .. } => "InvalidBlobHash",
            Self::InvalidDescriptor { .. } => "InvalidDescriptor",
            Self::DecryptionFailed { .. } => "DecryptionFailed",
            Self::SeekOutOfBounds => "SeekOutOfBounds",
            Self::SeekBeforeStart => "SeekBeforeStart",
            Self::StreamSizeZero => "StreamSizeZero",
        }
    }
}

impl StdError for StrandError {}
