use serde::{Deserialize, Serialize};
use tuskit_protocol::Metadata;

use crate::TransferError;

/// Total length of an upload as announced at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UploadLength {
    Declared(u64),
    /// Unknown at creation; fixed by the closing chunk.
    Deferred,
}

/// Lifecycle of an upload handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UploadState {
    Created,
    Transferring,
    Completed,
    /// Stopped with a valid offset; can be resumed.
    Suspended,
    /// Abandoned after a fatal error.
    Failed,
}

/// A reserved upload resource on the server.
///
/// The offset only ever moves forward through [`advance_to`](Self::advance_to).
/// Handles are serializable so an interrupted upload can be resumed later.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadHandle {
    location: String,
    length: Option<u64>,
    deferred: bool,
    offset: u64,
    #[serde(default)]
    metadata: Metadata,
    #[serde(default)]
    partial: bool,
    state: UploadState,
}

impl UploadHandle {
    /// Creates a handle for a freshly created upload (offset 0).
    pub fn new(
        location: impl Into<String>,
        length: UploadLength,
        metadata: Metadata,
        partial: bool,
    ) -> Self {
        let (length, deferred) = match length {
            UploadLength::Declared(n) => (Some(n), false),
            UploadLength::Deferred => (None, true),
        };
        Self {
            location: location.into(),
            length,
            deferred,
            offset: 0,
            metadata,
            partial,
            state: UploadState::Created,
        }
    }

    /// Creates a handle for an existing upload from its queried status.
    pub fn resumed(
        location: impl Into<String>,
        offset: u64,
        length: Option<u64>,
        metadata: Metadata,
    ) -> Self {
        let state = if length == Some(offset) {
            UploadState::Completed
        } else {
            UploadState::Suspended
        };
        Self {
            location: location.into(),
            deferred: length.is_none(),
            length,
            offset,
            metadata,
            partial: false,
            state,
        }
    }

    /// Marks the handle as a fragment of a later concatenation.
    pub fn with_partial(mut self, partial: bool) -> Self {
        self.partial = partial;
        self
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    /// Bytes acknowledged by the server.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Total length, if declared (at creation or by the closing chunk).
    pub fn length(&self) -> Option<u64> {
        self.length
    }

    /// `true` if the length was unknown at creation.
    pub fn is_deferred(&self) -> bool {
        self.deferred
    }

    pub fn is_partial(&self) -> bool {
        self.partial
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn state(&self) -> UploadState {
        self.state
    }

    pub fn set_state(&mut self, state: UploadState) {
        self.state = state;
    }

    /// Bytes still to send, if the length is known.
    pub fn remaining(&self) -> Option<u64> {
        self.length.map(|len| len.saturating_sub(self.offset))
    }

    pub fn is_complete(&self) -> bool {
        self.length == Some(self.offset)
    }

    /// Moves the acknowledged offset forward.
    ///
    /// Moving backwards or past the declared length is rejected and leaves
    /// the handle unchanged.
    pub fn advance_to(&mut self, offset: u64) -> Result<(), TransferError> {
        if offset < self.offset {
            return Err(TransferError::OffsetRegression {
                current: self.offset,
                reported: offset,
            });
        }
        if let Some(length) = self.length {
            if offset > length {
                return Err(TransferError::LengthExceeded { offset, length });
            }
        }
        self.offset = offset;
        Ok(())
    }

    /// Fixes the total length of a deferred upload.
    pub fn declare_length(&mut self, length: u64) -> Result<(), TransferError> {
        match self.length {
            Some(declared) if declared != length => Err(TransferError::LengthConflict {
                declared,
                requested: length,
            }),
            _ if length < self.offset => Err(TransferError::LengthExceeded {
                offset: self.offset,
                length,
            }),
            _ => {
                self.length = Some(length);
                Ok(())
            }
        }
    }
}

/// An ordered set of completed partial uploads, referenced by a single
/// concatenation request.
///
/// Order matters: the server concatenates the parts in the order given.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PartialUploadSet {
    parts: Vec<UploadHandle>,
}

impl PartialUploadSet {
    pub fn new(parts: Vec<UploadHandle>) -> Self {
        Self { parts }
    }

    pub fn push(&mut self, part: UploadHandle) {
        self.parts.push(part);
    }

    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &UploadHandle> {
        self.parts.iter()
    }

    /// Locations of the parts, in order.
    pub fn locations(&self) -> Vec<&str> {
        self.parts.iter().map(UploadHandle::location).collect()
    }

    /// `true` if every part reached its declared length.
    pub fn all_complete(&self) -> bool {
        self.parts.iter().all(UploadHandle::is_complete)
    }

    /// Sum of the part lengths, if all are known.
    pub fn total_length(&self) -> Option<u64> {
        self.parts.iter().map(UploadHandle::length).sum()
    }
}

impl FromIterator<UploadHandle> for PartialUploadSet {
    fn from_iter<I: IntoIterator<Item = UploadHandle>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}
