//! Capability advertisement returned by an `OPTIONS` request.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::ProtocolError;
use crate::constants::HEADER_TUS_MAX_SIZE;
use crate::headers::{parse_non_negative, split_list};

/// A protocol extension a server may advertise in `Tus-Extension`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum Extension {
    Creation,
    CreationWithUpload,
    CreationDeferLength,
    Concatenation,
    Termination,
    Expiration,
    Checksum,
    Other(String),
}

impl Extension {
    pub fn as_str(&self) -> &str {
        match self {
            Extension::Creation => "creation",
            Extension::CreationWithUpload => "creation-with-upload",
            Extension::CreationDeferLength => "creation-defer-length",
            Extension::Concatenation => "concatenation",
            Extension::Termination => "termination",
            Extension::Expiration => "expiration",
            Extension::Checksum => "checksum",
            Extension::Other(name) => name,
        }
    }
}

impl FromStr for Extension {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim() {
            "creation" => Extension::Creation,
            "creation-with-upload" => Extension::CreationWithUpload,
            "creation-defer-length" => Extension::CreationDeferLength,
            "concatenation" => Extension::Concatenation,
            "termination" => Extension::Termination,
            "expiration" => Extension::Expiration,
            "checksum" => Extension::Checksum,
            other => Extension::Other(other.to_string()),
        })
    }
}

impl From<String> for Extension {
    fn from(s: String) -> Self {
        match s.parse() {
            Ok(ext) => ext,
            Err(never) => match never {},
        }
    }
}

impl From<Extension> for String {
    fn from(ext: Extension) -> Self {
        ext.as_str().to_string()
    }
}

impl fmt::Display for Extension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The server's configuration as reported by `OPTIONS`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfiguration {
    /// Supported protocol versions, in the server's order of preference.
    pub protocol_versions: Vec<String>,
    /// Maximum upload size in bytes, if advertised.
    pub max_size: Option<u64>,
    pub extensions: Vec<Extension>,
}

impl ServerConfiguration {
    /// Builds the configuration from the raw header values of an `OPTIONS`
    /// response. `Tus-Version` is mandatory.
    pub fn from_headers(
        version: Option<&str>,
        max_size: Option<&str>,
        extension: Option<&str>,
    ) -> Result<Self, ProtocolError> {
        let versions = split_list(version.ok_or(ProtocolError::MissingVersion)?);
        if versions.is_empty() {
            return Err(ProtocolError::MissingVersion);
        }

        let max_size = match max_size {
            Some(raw) => Some(parse_non_negative(HEADER_TUS_MAX_SIZE, Some(raw))?),
            None => None,
        };

        let extensions = extension
            .map(split_list)
            .unwrap_or_default()
            .into_iter()
            .map(Extension::from)
            .collect();

        Ok(Self {
            protocol_versions: versions,
            max_size,
            extensions,
        })
    }

    pub fn supports(&self, extension: &Extension) -> bool {
        self.extensions.contains(extension)
    }

    pub fn supports_version(&self, version: &str) -> bool {
        self.protocol_versions.iter().any(|v| v == version)
    }

    /// Caps a requested chunk size by the advertised maximum size.
    pub fn cap_chunk_size(&self, requested: usize) -> usize {
        match self.max_size {
            Some(max) if max > 0 => requested.min(usize::try_from(max).unwrap_or(usize::MAX)),
            _ => requested,
        }
    }
}
