//! Queries that read server state: capabilities (`OPTIONS`) and upload
//! status (`HEAD`).

use reqwest::{Method, Url};
use tracing::{debug, warn};
use tuskit_protocol::constants::{
    DEFER_LENGTH_MARKER, HEADER_TUS_EXTENSION, HEADER_TUS_MAX_SIZE, HEADER_TUS_VERSION,
    HEADER_UPLOAD_CONCAT, HEADER_UPLOAD_DEFER_LENGTH, HEADER_UPLOAD_LENGTH, HEADER_UPLOAD_METADATA,
    HEADER_UPLOAD_OFFSET,
};
use tuskit_protocol::headers::parse_non_negative;
use tuskit_protocol::{Concat, ServerConfiguration, metadata};

use crate::error::UploadError;
use crate::transport::{Exchange, TusRequest};
use crate::types::UploadStatus;

/// Fetches the server's protocol versions, size limit and extensions.
pub async fn configuration(
    exchange: &Exchange<'_>,
    endpoint: &Url,
) -> Result<ServerConfiguration, UploadError> {
    let resp = exchange
        .send(TusRequest::new(Method::OPTIONS, endpoint.clone()))
        .await?;
    if !resp.status.is_success() {
        return Err(UploadError::ServerRejected {
            operation: "configuration query",
            status: resp.status.as_u16(),
        });
    }

    let config = ServerConfiguration::from_headers(
        resp.header(HEADER_TUS_VERSION),
        resp.header(HEADER_TUS_MAX_SIZE),
        resp.header(HEADER_TUS_EXTENSION),
    )?;
    debug!(
        endpoint = %endpoint,
        versions = ?config.protocol_versions,
        extensions = config.extensions.len(),
        max_size = ?config.max_size,
        "server configuration"
    );
    Ok(config)
}

/// Queries the authoritative state of an upload.
pub async fn status(exchange: &Exchange<'_>, location: &Url) -> Result<UploadStatus, UploadError> {
    let resp = exchange
        .send(TusRequest::tus(Method::HEAD, location.clone()))
        .await?;
    if !resp.status.is_success() {
        return Err(UploadError::ServerRejected {
            operation: "status query",
            status: resp.status.as_u16(),
        });
    }

    let offset = parse_non_negative(HEADER_UPLOAD_OFFSET, resp.header(HEADER_UPLOAD_OFFSET))?;
    let length = match resp.header(HEADER_UPLOAD_LENGTH) {
        Some(raw) => Some(parse_non_negative(HEADER_UPLOAD_LENGTH, Some(raw))?),
        None => None,
    };
    let deferred = resp.header(HEADER_UPLOAD_DEFER_LENGTH) == Some(DEFER_LENGTH_MARKER);
    let metadata = resp
        .header(HEADER_UPLOAD_METADATA)
        .map(metadata::decode)
        .unwrap_or_default();
    for warning in &metadata.warnings {
        warn!(location = %location, "{warning}");
    }
    let concat = resp
        .header(HEADER_UPLOAD_CONCAT)
        .and_then(|raw| Concat::parse(raw).ok());

    debug!(location = %location, offset, ?length, deferred, "upload status");
    Ok(UploadStatus {
        offset,
        length,
        deferred,
        metadata,
        concat,
    })
}

/// Queries only the acknowledged offset of an upload.
pub async fn offset(exchange: &Exchange<'_>, location: &Url) -> Result<u64, UploadError> {
    status(exchange, location).await.map(|s| s.offset)
}
