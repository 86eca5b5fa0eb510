//! Client error types.

use std::fmt;

use tuskit_protocol::{Extension, MetadataError, ProtocolError};
use tuskit_transfer::TransferError;

use crate::retry::RetryOn;

/// Coarse classification of a transport failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    Timeout,
    Connect,
    Other,
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransportErrorKind::Timeout => "timeout",
            TransportErrorKind::Connect => "connection",
            TransportErrorKind::Other => "transport",
        })
    }
}

/// A request that did not produce an HTTP response.
#[derive(Debug, thiserror::Error)]
#[error("{kind} error: {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        let kind = if e.is_timeout() {
            TransportErrorKind::Timeout
        } else if e.is_connect() {
            TransportErrorKind::Connect
        } else {
            TransportErrorKind::Other
        };
        Self {
            kind,
            message: e.to_string(),
            source: Some(Box::new(e)),
        }
    }
}

/// Errors produced by upload operations.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("{operation} rejected by server with status {status}")]
    ServerRejected { operation: &'static str, status: u16 },

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("server does not support the \"{0}\" extension")]
    MissingCapability(Extension),

    #[error("invalid metadata: {0}")]
    InvalidMetadata(#[from] MetadataError),

    #[error("data source error: {0}")]
    Source(#[from] TransferError),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("invalid header value for {0}")]
    InvalidHeader(String),

    #[error("TLS configuration error: {0}")]
    Tls(String),

    #[error("concatenation needs at least one partial upload")]
    NothingToConcatenate,

    #[error("cancelled")]
    Cancelled,

    #[error("giving up after {attempts} attempt(s): {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: Box<UploadError>,
    },

    #[error("upload of part {index} failed: {source}")]
    PartFailed {
        index: usize,
        #[source]
        source: Box<UploadError>,
    },
}

impl UploadError {
    /// Whether retrying the same operation may succeed.
    ///
    /// Transport failures follow the given policy, server rejections are
    /// retryable for 5xx statuses only, everything else is fatal.
    pub fn is_retryable(&self, policy: &RetryOn) -> bool {
        match self {
            UploadError::Transport(e) => match e.kind {
                TransportErrorKind::Timeout => policy.timeouts,
                TransportErrorKind::Connect => policy.connect,
                TransportErrorKind::Other => policy.other_transport,
            },
            UploadError::ServerRejected { status, .. } => *status >= 500 && policy.server_errors,
            _ => false,
        }
    }

    /// `true` for failures that leave the upload resumable: the request did
    /// not complete, the server failed on its side, or the caller cancelled.
    pub(crate) fn is_interruption(&self) -> bool {
        match self {
            UploadError::Transport(_) | UploadError::Cancelled => true,
            UploadError::ServerRejected { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// The HTTP status, for server rejections.
    pub fn status(&self) -> Option<u16> {
        match self {
            UploadError::ServerRejected { status, .. } => Some(*status),
            UploadError::RetriesExhausted { last, .. } => last.status(),
            UploadError::PartFailed { source, .. } => source.status(),
            _ => None,
        }
    }
}
