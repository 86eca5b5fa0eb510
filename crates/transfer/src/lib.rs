//! Upload state and chunked, seekable data sources for tus uploads.
//!
//! An [`UploadHandle`] tracks what the server has acknowledged; a
//! [`ChunkReader`] produces the bytes that follow that offset.

mod chunked;
mod progress;
mod types;

pub use chunked::{Chunk, ChunkReader};
pub use progress::SpeedCalculator;
pub use types::{PartialUploadSet, UploadHandle, UploadLength, UploadState};

pub use tuskit_protocol::constants::DEFAULT_CHUNK_SIZE;

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("source position unknown, seek before reading")]
    UnknownPosition,

    #[error("offset would move backwards from {current} to {reported}")]
    OffsetRegression { current: u64, reported: u64 },

    #[error("offset {offset} exceeds declared length {length}")]
    LengthExceeded { offset: u64, length: u64 },

    #[error("upload length already declared as {declared}, got {requested}")]
    LengthConflict { declared: u64, requested: u64 },
}
