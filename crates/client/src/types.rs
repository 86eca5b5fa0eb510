use std::time::Duration;

use tokio::sync::mpsc;
use tuskit_protocol::{Concat, DecodedMetadata, Metadata, ServerConfiguration};
use tuskit_transfer::{DEFAULT_CHUNK_SIZE, UploadHandle};

use crate::error::UploadError;

/// Outcome of transferring data for one upload.
#[derive(Debug)]
pub enum TransferResult {
    /// Every byte was acknowledged.
    Success { offset: u64 },
    /// Stopped early; `offset` is the last acknowledged offset and the upload
    /// can be resumed from there.
    PartialFailure { offset: u64, cause: UploadError },
    /// The upload cannot continue.
    Fatal { cause: UploadError },
}

impl TransferResult {
    pub fn is_success(&self) -> bool {
        matches!(self, TransferResult::Success { .. })
    }

    /// Last acknowledged offset, unless the failure was fatal.
    pub fn offset(&self) -> Option<u64> {
        match self {
            TransferResult::Success { offset } | TransferResult::PartialFailure { offset, .. } => {
                Some(*offset)
            }
            TransferResult::Fatal { .. } => None,
        }
    }

    pub fn cause(&self) -> Option<&UploadError> {
        match self {
            TransferResult::Success { .. } => None,
            TransferResult::PartialFailure { cause, .. } | TransferResult::Fatal { cause } => {
                Some(cause)
            }
        }
    }

    pub fn into_result(self) -> Result<u64, UploadError> {
        match self {
            TransferResult::Success { offset } => Ok(offset),
            TransferResult::PartialFailure { cause, .. } | TransferResult::Fatal { cause } => {
                Err(cause)
            }
        }
    }
}

/// Result of a high-level upload: the handle (if the upload was created)
/// and how the transfer ended.
#[derive(Debug)]
pub struct UploadReport {
    pub handle: Option<UploadHandle>,
    pub result: TransferResult,
}

impl UploadReport {
    pub(crate) fn failed(cause: UploadError) -> Self {
        Self {
            handle: None,
            result: TransferResult::Fatal { cause },
        }
    }

    /// The completed handle, or the error that stopped the upload.
    pub fn into_result(self) -> Result<UploadHandle, UploadError> {
        match self.result {
            TransferResult::Success { .. } => self
                .handle
                .ok_or_else(|| UploadError::ProtocolViolation("upload finished without a handle".into())),
            TransferResult::PartialFailure { cause, .. } | TransferResult::Fatal { cause } => {
                Err(cause)
            }
        }
    }
}

/// How the total length is announced at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LengthMode {
    /// Measure the source and declare its length.
    #[default]
    Auto,
    /// Create with a deferred length; the closing chunk declares it.
    Deferred,
}

/// Per-upload options.
#[derive(Debug, Clone)]
pub struct UploadOptions {
    pub chunk_size: usize,
    pub metadata: Metadata,
    pub length: LengthMode,
    /// Previously fetched server configuration. When present, capabilities
    /// are checked and the chunk size is capped by `Tus-Max-Size`.
    pub server: Option<ServerConfiguration>,
    pub events: Option<mpsc::Sender<UploadEvent>>,
    /// Partial uploads in flight at once when uploading several sources.
    pub parallel_parts: usize,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            metadata: Metadata::new(),
            length: LengthMode::Auto,
            server: None,
            events: None,
            parallel_parts: 3,
        }
    }
}

impl UploadOptions {
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn deferred(mut self) -> Self {
        self.length = LengthMode::Deferred;
        self
    }

    pub fn with_server(mut self, server: ServerConfiguration) -> Self {
        self.server = Some(server);
        self
    }

    pub fn with_events(mut self, events: mpsc::Sender<UploadEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_parallel_parts(mut self, parallel_parts: usize) -> Self {
        self.parallel_parts = parallel_parts;
        self
    }

    /// Chunk size after applying the server limit.
    pub(crate) fn effective_chunk_size(&self) -> usize {
        let requested = if self.chunk_size == 0 {
            DEFAULT_CHUNK_SIZE
        } else {
            self.chunk_size
        };
        match &self.server {
            Some(server) => server.cap_chunk_size(requested),
            None => requested,
        }
    }
}

/// Server-side state of an upload, as reported by `HEAD`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadStatus {
    pub offset: u64,
    pub length: Option<u64>,
    /// The length has not been declared yet.
    pub deferred: bool,
    pub metadata: DecodedMetadata,
    pub concat: Option<Concat>,
}

/// Progress notifications sent while uploading.
#[derive(Debug, Clone, PartialEq)]
pub enum UploadEvent {
    Created {
        location: String,
    },
    /// Continuing from a server-confirmed offset after an interruption or
    /// from a stored handle.
    Resumed {
        location: String,
        offset: u64,
    },
    Progress {
        location: String,
        offset: u64,
        length: Option<u64>,
        bytes_per_second: f64,
        /// Time left at the current speed, once speed and length are known.
        eta: Option<Duration>,
    },
    Completed {
        location: String,
        offset: u64,
    },
}
