//! `Upload-Metadata` header codec.
//!
//! The header is a comma separated list of entries. Each entry is a key,
//! optionally followed by a single space and the base64 encoded value:
//!
//! ```text
//! filename d29ybGRfZG9taW5hdGlvbl9wbGFuLnBkZg==,is_confidential
//! ```
//!
//! Encoding is strict (invalid keys are rejected), decoding is tolerant: an
//! entry that cannot be decoded is dropped and reported as a
//! [`DecodeWarning`] while the remaining entries are still returned.

use base64::{Engine, engine::general_purpose::STANDARD};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Errors raised when encoding metadata whose keys cannot be transmitted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MetadataError {
    #[error("metadata keys must not be empty")]
    EmptyKey,

    #[error("metadata key {0:?} must only contain printable ASCII characters")]
    NonPrintable(String),

    #[error("metadata key {key:?} must not contain {ch:?}")]
    ReservedCharacter { key: String, ch: char },
}

/// Key → optional binary value mapping attached to an upload.
///
/// Keys are unique. Insertion order is kept so that the encoded header is
/// reproducible, but equality ignores order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Metadata {
    entries: Vec<(String, Option<Vec<u8>>)>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces an entry. `None` is an absent value, which is
    /// distinct from an empty one.
    pub fn insert(&mut self, key: impl Into<String>, value: Option<Vec<u8>>) {
        let key = key.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    /// Builder-style insert of a key with a value.
    pub fn with(mut self, key: impl Into<String>, value: impl AsRef<[u8]>) -> Self {
        self.insert(key, Some(value.as_ref().to_vec()));
        self
    }

    /// Builder-style insert of a key without a value.
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.insert(key, None);
        self
    }

    /// Returns `Some(value)` if the key is present; the inner option is the
    /// (possibly absent) value.
    pub fn get(&self, key: &str) -> Option<Option<&[u8]>> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_deref())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.iter().any(|(k, _)| k == key)
    }

    pub fn remove(&mut self, key: &str) -> Option<Option<Vec<u8>>> {
        let index = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(index).1)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&[u8]>)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_deref()))
    }
}

impl PartialEq for Metadata {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len() && self.iter().all(|(k, v)| other.get(k) == Some(v))
    }
}

impl Eq for Metadata {}

impl<K: Into<String>> FromIterator<(K, Option<Vec<u8>>)> for Metadata {
    fn from_iter<I: IntoIterator<Item = (K, Option<Vec<u8>>)>>(iter: I) -> Self {
        let mut metadata = Metadata::new();
        for (k, v) in iter {
            metadata.insert(k, v);
        }
        metadata
    }
}

/// Checks that a key can be transmitted in the header.
pub fn validate_key(key: &str) -> Result<(), MetadataError> {
    if key.is_empty() {
        return Err(MetadataError::EmptyKey);
    }
    for ch in key.chars() {
        if ch == ' ' || ch == ',' {
            return Err(MetadataError::ReservedCharacter {
                key: key.to_string(),
                ch,
            });
        }
        if !ch.is_ascii_graphic() {
            return Err(MetadataError::NonPrintable(key.to_string()));
        }
    }
    Ok(())
}

/// Encodes metadata into an `Upload-Metadata` header value.
///
/// Entries appear in map order. A key without a value is encoded as the
/// bare key; an empty value keeps the separating space.
pub fn encode(metadata: &Metadata) -> Result<String, MetadataError> {
    let mut pairs = Vec::with_capacity(metadata.len());
    for (key, value) in metadata.iter() {
        validate_key(key)?;
        match value {
            Some(v) => pairs.push(format!("{key} {}", STANDARD.encode(v))),
            None => pairs.push(key.to_string()),
        }
    }
    Ok(pairs.join(","))
}

/// Why a single metadata entry could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WarningReason {
    #[error("invalid base64: {0}")]
    InvalidBase64(String),

    #[error("entry consists of more than two elements")]
    TooManyElements,

    #[error("duplicate key, later value kept")]
    DuplicateKey,
}

/// A metadata entry that was dropped or overridden while decoding.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("metadata entry {key:?}: {reason}")]
pub struct DecodeWarning {
    pub key: String,
    pub reason: WarningReason,
}

/// Result of a tolerant decode: the entries that could be decoded plus a
/// record of the ones that could not.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodedMetadata {
    pub metadata: Metadata,
    pub warnings: Vec<DecodeWarning>,
}

impl DecodedMetadata {
    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }
}

/// Decodes an `Upload-Metadata` header value.
pub fn decode(header: &str) -> DecodedMetadata {
    let mut decoded = DecodedMetadata::default();

    for entry in header.split(',') {
        let entry = entry.trim_start();
        if entry.trim().is_empty() {
            continue;
        }

        let (key, value) = match entry.split_once(' ') {
            None => (entry, None),
            Some((key, rest)) => {
                let rest = rest.trim();
                if rest.split_whitespace().count() > 1 {
                    decoded.warnings.push(DecodeWarning {
                        key: key.to_string(),
                        reason: WarningReason::TooManyElements,
                    });
                    continue;
                }
                match STANDARD.decode(rest) {
                    Ok(bytes) => (key, Some(bytes)),
                    Err(e) => {
                        decoded.warnings.push(DecodeWarning {
                            key: key.to_string(),
                            reason: WarningReason::InvalidBase64(e.to_string()),
                        });
                        continue;
                    }
                }
            }
        };

        if decoded.metadata.contains_key(key) {
            decoded.warnings.push(DecodeWarning {
                key: key.to_string(),
                reason: WarningReason::DuplicateKey,
            });
        }
        decoded.metadata.insert(key, value);
    }

    if !decoded.warnings.is_empty() {
        debug!(warnings = decoded.warnings.len(), "metadata decoded with warnings");
    }
    decoded
}
