//! Upload creation (`POST`), including final uploads built by
//! concatenation.

use reqwest::{Method, Url};
use tracing::{debug, info};
use tuskit_protocol::constants::{
    DEFER_LENGTH_MARKER, HEADER_UPLOAD_CONCAT, HEADER_UPLOAD_DEFER_LENGTH, HEADER_UPLOAD_LENGTH,
    HEADER_UPLOAD_METADATA,
};
use tuskit_protocol::{Concat, Extension, Metadata, ServerConfiguration, metadata};
use tuskit_transfer::{PartialUploadSet, UploadHandle, UploadLength, UploadState};

use crate::error::UploadError;
use crate::transport::{Exchange, TusRequest, TusResponse};

/// Creates an upload resource and returns a handle at offset 0.
///
/// `partial` marks the upload as a fragment of a later concatenation.
pub async fn create(
    exchange: &Exchange<'_>,
    endpoint: &Url,
    length: UploadLength,
    metadata: &Metadata,
    partial: bool,
) -> Result<UploadHandle, UploadError> {
    let mut request = TusRequest::tus(Method::POST, endpoint.clone());
    match length {
        UploadLength::Declared(n) => request.set_header(HEADER_UPLOAD_LENGTH, &n.to_string())?,
        UploadLength::Deferred => request.set_header(HEADER_UPLOAD_DEFER_LENGTH, DEFER_LENGTH_MARKER)?,
    }
    set_metadata(&mut request, metadata)?;
    if partial {
        request.set_header(HEADER_UPLOAD_CONCAT, &Concat::Partial.to_header())?;
    }

    debug!(endpoint = %endpoint, ?length, partial, "creating upload");
    let resp = exchange.send(request).await?;
    let location = created_location(endpoint, &resp, "creation")?;
    info!(location = %location, "upload created");
    Ok(UploadHandle::new(location.as_str(), length, metadata.clone(), partial))
}

/// Creates the final upload joining `parts`, in order.
///
/// The concatenation capability is checked against `server` before any
/// request is sent. The returned handle is complete: the server assembles
/// the final upload from data it already holds.
pub async fn concatenate(
    exchange: &Exchange<'_>,
    endpoint: &Url,
    server: &ServerConfiguration,
    parts: &PartialUploadSet,
    metadata: &Metadata,
) -> Result<UploadHandle, UploadError> {
    if !server.supports(&Extension::Concatenation) {
        return Err(UploadError::MissingCapability(Extension::Concatenation));
    }
    if parts.is_empty() {
        return Err(UploadError::NothingToConcatenate);
    }

    let references = parts
        .locations()
        .into_iter()
        .map(part_reference)
        .collect::<Vec<_>>();
    let concat = Concat::Final(references);

    let mut request = TusRequest::tus(Method::POST, endpoint.clone());
    request.set_header(HEADER_UPLOAD_CONCAT, &concat.to_header())?;
    set_metadata(&mut request, metadata)?;

    debug!(endpoint = %endpoint, parts = parts.len(), "concatenating uploads");
    let resp = exchange.send(request).await?;
    let location = created_location(endpoint, &resp, "concatenation")?;

    let mut handle = match parts.total_length() {
        Some(total) => {
            let mut handle = UploadHandle::new(
                location.as_str(),
                UploadLength::Declared(total),
                metadata.clone(),
                false,
            );
            handle.advance_to(total)?;
            handle
        }
        None => UploadHandle::new(
            location.as_str(),
            UploadLength::Deferred,
            metadata.clone(),
            false,
        ),
    };
    handle.set_state(UploadState::Completed);
    info!(location = %location, parts = parts.len(), "final upload created");
    Ok(handle)
}

fn set_metadata(request: &mut TusRequest, metadata: &Metadata) -> Result<(), UploadError> {
    if !metadata.is_empty() {
        request.set_header(HEADER_UPLOAD_METADATA, &metadata::encode(metadata)?)?;
    }
    Ok(())
}

/// Partial uploads are referenced by their URL path.
fn part_reference(location: &str) -> String {
    match Url::parse(location) {
        Ok(url) => url.path().to_string(),
        Err(_) => location.to_string(),
    }
}

/// Checks a creation response and resolves its `Location` against the
/// endpoint.
fn created_location(
    endpoint: &Url,
    resp: &TusResponse,
    operation: &'static str,
) -> Result<Url, UploadError> {
    if !resp.status.is_success() {
        return Err(UploadError::ServerRejected {
            operation,
            status: resp.status.as_u16(),
        });
    }
    let raw = resp
        .header("location")
        .ok_or_else(|| UploadError::ProtocolViolation("missing Location header in creation response".into()))?;
    endpoint
        .join(raw)
        .map_err(|e| UploadError::ProtocolViolation(format!("invalid Location {raw:?}: {e}")))
}
