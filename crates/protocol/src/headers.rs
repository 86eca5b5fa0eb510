//! Parsing and formatting of individual tus header values.

use crate::ProtocolError;

/// Parses a header carrying a non-negative byte count.
///
/// `value` is `None` when the header was absent from the response.
pub fn parse_non_negative(header: &'static str, value: Option<&str>) -> Result<u64, ProtocolError> {
    let raw = value.ok_or(ProtocolError::MissingHeader(header))?;
    raw.trim()
        .parse::<u64>()
        .map_err(|_| ProtocolError::InvalidInteger {
            header,
            value: raw.to_string(),
        })
}

/// Splits a comma separated header value (`Tus-Version`, `Tus-Extension`).
pub fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Value of the `Upload-Concat` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Concat {
    /// The upload is one fragment of a later concatenation.
    Partial,
    /// The upload is the concatenation of the listed partial uploads,
    /// in order.
    Final(Vec<String>),
}

impl Concat {
    /// Formats the header value.
    pub fn to_header(&self) -> String {
        match self {
            Concat::Partial => "partial".to_string(),
            Concat::Final(parts) => format!("final;{}", parts.join(" ")),
        }
    }

    /// Parses a header value as sent back by a server.
    pub fn parse(value: &str) -> Result<Self, ProtocolError> {
        let value = value.trim();
        if value == "partial" {
            return Ok(Concat::Partial);
        }
        match value.strip_prefix("final;") {
            Some(rest) => {
                let parts: Vec<String> = rest.split_whitespace().map(str::to_string).collect();
                if parts.is_empty() {
                    return Err(ProtocolError::InvalidConcat(value.to_string()));
                }
                Ok(Concat::Final(parts))
            }
            None => Err(ProtocolError::InvalidConcat(value.to_string())),
        }
    }
}
