//! Wire-level encoding for the tus resumable upload protocol.
//!
//! This crate has no transport dependencies: it deals in header names and
//! header values only. The HTTP exchange lives in `tuskit-client`.

pub mod constants;
pub mod headers;
pub mod metadata;
pub mod server;

pub use headers::Concat;
pub use metadata::{DecodeWarning, DecodedMetadata, Metadata, MetadataError, WarningReason};
pub use server::{Extension, ServerConfiguration};

/// Errors raised when a server response does not follow the protocol.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("HTTP header {0:?} not included in server response")]
    MissingHeader(&'static str),

    #[error("unable to convert {header:?} header {value:?} to a non-negative integer")]
    InvalidInteger { header: &'static str, value: String },

    #[error("invalid Upload-Concat value: {0:?}")]
    InvalidConcat(String),

    #[error("\"Tus-Version\" header not present")]
    MissingVersion,
}
