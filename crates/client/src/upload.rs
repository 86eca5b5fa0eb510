//! The offset loop.
//!
//! Data is always sent from the last offset the server acknowledged. After a
//! conflict or an interrupted request the server is asked for its offset and
//! the source is re-read from there; the local offset only moves forward.

use std::io;

use reqwest::{Method, StatusCode, Url};
use tokio::io::{AsyncRead, AsyncSeek};
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};
use tuskit_protocol::constants::{HEADER_UPLOAD_LENGTH, HEADER_UPLOAD_OFFSET, OFFSET_OCTET_STREAM};
use tuskit_protocol::headers::parse_non_negative;
use tuskit_transfer::{ChunkReader, SpeedCalculator, TransferError, UploadHandle, UploadState};

use crate::discovery;
use crate::error::UploadError;
use crate::retry::{RetryConfiguration, backoff};
use crate::transport::{Exchange, TusRequest, TusResponse};
use crate::types::{TransferResult, UploadEvent, UploadStatus};

/// Consecutive offset conflicts or interruptions that make no progress,
/// tolerated before the loop gives up.
pub const MAX_RECONCILIATIONS: u32 = 3;

/// Sends `reader`'s data from `handle`'s offset until the upload is complete.
///
/// The chunk size is the reader's. A deferred upload declares its length
/// with the chunk that reaches the end of the source.
pub async fn upload_chunks<R>(
    exchange: &Exchange<'_>,
    handle: &mut UploadHandle,
    reader: &mut ChunkReader<R>,
    events: Option<&mpsc::Sender<UploadEvent>>,
) -> TransferResult
where
    R: AsyncRead + AsyncSeek + Unpin + Send,
{
    let location = match parse_location(handle) {
        Ok(url) => url,
        Err(e) => return fail(handle, e),
    };
    handle.set_state(UploadState::Transferring);

    let mut speed = SpeedCalculator::default();
    speed.add_sample(0);
    let mut conflicts = 0u32;
    let mut stalls = 0u32;

    loop {
        if exchange.is_cancelled() {
            return suspend(handle, UploadError::Cancelled);
        }
        if handle.is_complete() {
            handle.set_state(UploadState::Completed);
            info!(location = %location, offset = handle.offset(), "upload complete");
            emit(
                events,
                UploadEvent::Completed {
                    location: handle.location().to_string(),
                    offset: handle.offset(),
                },
            );
            return TransferResult::Success {
                offset: handle.offset(),
            };
        }

        let offset = handle.offset();
        if reader.position() != Some(offset) {
            if let Err(e) = reader.seek_to(offset).await {
                return fail(handle, e.into());
            }
        }
        let chunk = match reader.next_chunk(handle.remaining()).await {
            Ok(chunk) => chunk,
            Err(e) => return fail(handle, e.into()),
        };
        if let Some(length) = handle.length() {
            if chunk.eof && chunk.end() < length {
                let e = io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("source ended at {} before upload length {length}", chunk.end()),
                );
                return fail(handle, TransferError::Io(e).into());
            }
        }

        let sent = chunk.len() as u64;
        let closing = handle.length().is_none() && chunk.eof;
        let mut request = TusRequest::tus(Method::PATCH, location.clone());
        if let Err(e) = patch_headers(&mut request, offset, sent, closing.then(|| chunk.end())) {
            return fail(handle, e);
        }
        request.body = Some(chunk.data);
        debug!(location = %location, offset, bytes = sent, closing, "sending chunk");

        let err = match exchange.send(request).await {
            Ok(resp) if resp.status.is_success() => {
                if let Err(e) = acknowledge(handle, &resp, offset + sent, closing) {
                    return fail(handle, e);
                }
                conflicts = 0;
                stalls = 0;
                speed.add_sample(sent);
                emit(
                    events,
                    UploadEvent::Progress {
                        location: handle.location().to_string(),
                        offset: handle.offset(),
                        length: handle.length(),
                        bytes_per_second: speed.bytes_per_second(),
                        eta: handle.remaining().and_then(|rest| speed.eta(rest)),
                    },
                );
                continue;
            }
            Ok(resp) if resp.status == StatusCode::CONFLICT => {
                conflicts += 1;
                if conflicts > MAX_RECONCILIATIONS {
                    return fail(
                        handle,
                        UploadError::ProtocolViolation(format!(
                            "offset {offset} still rejected after {MAX_RECONCILIATIONS} reconciliations"
                        )),
                    );
                }
                warn!(location = %location, offset, attempt = conflicts, "offset conflict, querying server offset");
                if let Err(result) = reconcile(exchange, &location, handle).await {
                    return result;
                }
                if handle.offset() > offset {
                    conflicts = 0;
                }
                continue;
            }
            Ok(resp) => UploadError::ServerRejected {
                operation: "chunk transfer",
                status: resp.status.as_u16(),
            },
            Err(e) => e,
        };

        if !matches!(err, UploadError::Transport(_)) {
            return interrupted(handle, err);
        }

        warn!(location = %location, offset, error = %err, "chunk transfer interrupted, querying server offset");
        if let Err(result) = reconcile(exchange, &location, handle).await {
            return result;
        }
        if handle.offset() > offset {
            stalls = 0;
        } else {
            stalls += 1;
            if stalls > MAX_RECONCILIATIONS {
                return suspend(handle, err);
            }
        }
        info!(location = %location, offset = handle.offset(), "resuming");
        speed.reset();
        speed.add_sample(0);
        emit(
            events,
            UploadEvent::Resumed {
                location: handle.location().to_string(),
                offset: handle.offset(),
            },
        );
    }
}

/// [`upload_chunks`] with retries: resumable failures are retried after a
/// backoff delay, each time from the offset the server reports.
pub async fn upload_with_retry<R>(
    config: &RetryConfiguration,
    exchange: &Exchange<'_>,
    handle: &mut UploadHandle,
    reader: &mut ChunkReader<R>,
    events: Option<&mpsc::Sender<UploadEvent>>,
) -> TransferResult
where
    R: AsyncRead + AsyncSeek + Unpin + Send,
{
    let max = config.attempts();
    let mut attempt = 1;
    let mut resync = false;
    loop {
        let outcome = if resync {
            match resync_offset(exchange, handle).await {
                Ok(()) => upload_chunks(exchange, handle, reader, events).await,
                Err(result) => result,
            }
        } else {
            upload_chunks(exchange, handle, reader, events).await
        };

        let (offset, cause) = match outcome {
            TransferResult::PartialFailure { offset, cause } => (offset, cause),
            done => return done,
        };
        if !cause.is_retryable(&config.retry_on) {
            return TransferResult::PartialFailure { offset, cause };
        }
        if attempt >= max {
            error!(location = handle.location(), attempts = attempt, offset, error = %cause, "giving up on upload");
            return TransferResult::PartialFailure {
                offset,
                cause: UploadError::RetriesExhausted {
                    attempts: attempt,
                    last: Box::new(cause),
                },
            };
        }

        let delay = config.delay_for_attempt(attempt);
        warn!(
            location = handle.location(),
            attempt,
            offset,
            delay_ms = delay.as_millis() as u64,
            error = %cause,
            "upload interrupted, retrying"
        );
        if let Err(cause) = backoff(exchange.cancel_token(), delay).await {
            return TransferResult::PartialFailure { offset, cause };
        }
        attempt += 1;
        resync = true;
    }
}

/// Takes over the server's view of an upload. Fails if the server is
/// behind the acknowledged offset or disagrees on the length.
pub(crate) fn adopt(handle: &mut UploadHandle, status: &UploadStatus) -> Result<(), UploadError> {
    if status.offset < handle.offset() {
        return Err(UploadError::ProtocolViolation(format!(
            "server offset {} is behind acknowledged offset {}",
            status.offset,
            handle.offset()
        )));
    }
    if let Some(length) = status.length {
        match handle.length() {
            None => handle.declare_length(length).map_err(violation)?,
            Some(declared) if declared != length => {
                return Err(UploadError::ProtocolViolation(format!(
                    "server reports length {length}, upload declared {declared}"
                )));
            }
            Some(_) => {}
        }
    }
    handle.advance_to(status.offset).map_err(violation)
}

fn parse_location(handle: &UploadHandle) -> Result<Url, UploadError> {
    Url::parse(handle.location())
        .map_err(|e| UploadError::InvalidUrl(format!("{}: {e}", handle.location())))
}

fn patch_headers(
    request: &mut TusRequest,
    offset: u64,
    len: u64,
    declare_length: Option<u64>,
) -> Result<(), UploadError> {
    request.set_header(HEADER_UPLOAD_OFFSET, &offset.to_string())?;
    request.set_header("content-type", OFFSET_OCTET_STREAM)?;
    request.set_header("content-length", &len.to_string())?;
    if let Some(total) = declare_length {
        request.set_header(HEADER_UPLOAD_LENGTH, &total.to_string())?;
    }
    Ok(())
}

/// Checks the offset of a successful `PATCH` response and records it.
fn acknowledge(
    handle: &mut UploadHandle,
    resp: &TusResponse,
    expected: u64,
    closing: bool,
) -> Result<(), UploadError> {
    let reported = parse_non_negative(HEADER_UPLOAD_OFFSET, resp.header(HEADER_UPLOAD_OFFSET))?;
    if reported < handle.offset() {
        return Err(UploadError::ProtocolViolation(format!(
            "server offset moved backwards from {} to {reported}",
            handle.offset()
        )));
    }
    if reported != expected {
        return Err(UploadError::ProtocolViolation(format!(
            "server acknowledged offset {reported}, expected {expected}"
        )));
    }
    if closing {
        handle.declare_length(expected).map_err(violation)?;
    }
    handle.advance_to(reported).map_err(violation)
}

async fn reconcile(
    exchange: &Exchange<'_>,
    location: &Url,
    handle: &mut UploadHandle,
) -> Result<(), TransferResult> {
    match discovery::status(exchange, location).await {
        Ok(status) => match adopt(handle, &status) {
            Ok(()) => Ok(()),
            Err(e) => Err(fail(handle, e)),
        },
        Err(e) => Err(interrupted(handle, e)),
    }
}

async fn resync_offset(exchange: &Exchange<'_>, handle: &mut UploadHandle) -> Result<(), TransferResult> {
    let location = match parse_location(handle) {
        Ok(url) => url,
        Err(e) => return Err(fail(handle, e)),
    };
    reconcile(exchange, &location, handle).await
}

fn violation(e: TransferError) -> UploadError {
    UploadError::ProtocolViolation(e.to_string())
}

fn interrupted(handle: &mut UploadHandle, cause: UploadError) -> TransferResult {
    if cause.is_interruption() {
        suspend(handle, cause)
    } else {
        fail(handle, cause)
    }
}

fn suspend(handle: &mut UploadHandle, cause: UploadError) -> TransferResult {
    debug!(location = handle.location(), offset = handle.offset(), error = %cause, "upload suspended");
    handle.set_state(UploadState::Suspended);
    TransferResult::PartialFailure {
        offset: handle.offset(),
        cause,
    }
}

fn fail(handle: &mut UploadHandle, cause: UploadError) -> TransferResult {
    debug!(location = handle.location(), offset = handle.offset(), error = %cause, "upload failed");
    handle.set_state(UploadState::Failed);
    TransferResult::Fatal { cause }
}

pub(crate) fn emit(events: Option<&mpsc::Sender<UploadEvent>>, event: UploadEvent) {
    if let Some(tx) = events {
        if let Err(e) = tx.try_send(event) {
            trace!("dropping upload event: {e}");
        }
    }
}
