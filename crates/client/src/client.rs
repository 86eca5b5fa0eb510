//! High-level upload client.

use std::path::Path;
use std::sync::Arc;

use futures_util::{StreamExt, TryStreamExt, stream};
use reqwest::Url;
use reqwest::header::HeaderMap;
use tokio::io::{AsyncRead, AsyncSeek};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tuskit_protocol::{Concat, DecodedMetadata, Extension, Metadata, ServerConfiguration};
use tuskit_transfer::{ChunkReader, PartialUploadSet, UploadHandle, UploadLength};

use crate::error::UploadError;
use crate::retry::{RetryConfiguration, with_retry};
use crate::transport::{Exchange, HttpTransport, Transport};
use crate::types::{LengthMode, TransferResult, UploadEvent, UploadOptions, UploadReport, UploadStatus};
use crate::upload::{emit, upload_with_retry};
use crate::{creation, discovery};

/// Resumable upload client.
///
/// Cloning is cheap; clones share the connection pool, configuration and
/// cancellation token, so independent uploads can run concurrently.
#[derive(Clone)]
pub struct Client {
    transport: Arc<dyn Transport>,
    config: Arc<RetryConfiguration>,
    headers: Arc<HeaderMap>,
    cancel: CancellationToken,
}

impl Client {
    /// Creates a client speaking HTTP(S) through `reqwest`.
    pub fn new(config: RetryConfiguration) -> Result<Self, UploadError> {
        let transport = HttpTransport::new(&config)?;
        Self::with_transport(Arc::new(transport), config)
    }

    /// Creates a client on top of a custom transport.
    pub fn with_transport(
        transport: Arc<dyn Transport>,
        config: RetryConfiguration,
    ) -> Result<Self, UploadError> {
        let headers = config.header_map()?;
        Ok(Self {
            transport,
            config: Arc::new(config),
            headers: Arc::new(headers),
            cancel: CancellationToken::new(),
        })
    }

    /// Uses `cancel` instead of the client's own token.
    pub fn with_cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stops all operations of this client and its clones. Uploads in
    /// progress end as resumable partial failures.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn config(&self) -> &RetryConfiguration {
        &self.config
    }

    fn exchange(&self) -> Exchange<'_> {
        Exchange::new(self.transport.as_ref(), &self.headers, &self.cancel)
    }

    /// Queries the server's capabilities.
    pub async fn configuration(&self, endpoint: &str) -> Result<ServerConfiguration, UploadError> {
        let endpoint = parse_url(endpoint)?;
        let exchange = self.exchange();
        with_retry(&self.config, &self.cancel, "configuration query", || {
            discovery::configuration(&exchange, &endpoint)
        })
        .await
    }

    /// Queries the server-side state of an upload.
    pub async fn status(&self, location: &str) -> Result<UploadStatus, UploadError> {
        let location = parse_url(location)?;
        let exchange = self.exchange();
        with_retry(&self.config, &self.cancel, "status query", || {
            discovery::status(&exchange, &location)
        })
        .await
    }

    /// Fetches and decodes the metadata of an upload.
    pub async fn metadata(&self, location: &str) -> Result<DecodedMetadata, UploadError> {
        self.status(location).await.map(|status| status.metadata)
    }

    /// Creates an upload resource without sending data.
    pub async fn create(
        &self,
        endpoint: &str,
        length: UploadLength,
        metadata: &Metadata,
        partial: bool,
    ) -> Result<UploadHandle, UploadError> {
        let endpoint = parse_url(endpoint)?;
        let exchange = self.exchange();
        with_retry(&self.config, &self.cancel, "creation", || {
            creation::create(&exchange, &endpoint, length, metadata, partial)
        })
        .await
    }

    /// Sends the data of an existing upload, retrying resumable failures.
    pub async fn transfer<R>(
        &self,
        handle: &mut UploadHandle,
        reader: &mut ChunkReader<R>,
        events: Option<&mpsc::Sender<UploadEvent>>,
    ) -> TransferResult
    where
        R: AsyncRead + AsyncSeek + Unpin + Send,
    {
        upload_with_retry(&self.config, &self.exchange(), handle, reader, events).await
    }

    /// Creates an upload for `source` and sends all of it.
    pub async fn upload<R>(&self, endpoint: &str, source: R, options: UploadOptions) -> UploadReport
    where
        R: AsyncRead + AsyncSeek + Unpin + Send,
    {
        self.start(endpoint, source, &options, false).await
    }

    /// Uploads the file at `path`.
    pub async fn upload_file(&self, endpoint: &str, path: &Path, options: UploadOptions) -> UploadReport {
        match tokio::fs::File::open(path).await {
            Ok(file) => self.upload(endpoint, file, options).await,
            Err(e) => {
                error!(path = %path.display(), error = %e, "cannot open upload source");
                UploadReport::failed(UploadError::Source(e.into()))
            }
        }
    }

    /// Continues the upload at `location` from the offset the server
    /// reports. `source` must hold the same data as the original upload.
    pub async fn resume<R>(&self, location: &str, source: R, options: UploadOptions) -> UploadReport
    where
        R: AsyncRead + AsyncSeek + Unpin + Send,
    {
        let status = match self.status(location).await {
            Ok(status) => status,
            Err(e) => {
                error!(location, error = %e, "cannot query upload to resume");
                return UploadReport::failed(e);
            }
        };

        let partial = status.concat == Some(Concat::Partial);
        let mut handle =
            UploadHandle::resumed(location, status.offset, status.length, status.metadata.metadata)
                .with_partial(partial);
        let mut reader = ChunkReader::new(source, options.effective_chunk_size());
        info!(location, offset = handle.offset(), length = ?handle.length(), "resuming upload");
        emit(
            options.events.as_ref(),
            UploadEvent::Resumed {
                location: location.to_string(),
                offset: handle.offset(),
            },
        );

        let result = self
            .transfer(&mut handle, &mut reader, options.events.as_ref())
            .await;
        log_outcome(&handle, &result);
        UploadReport {
            handle: Some(handle),
            result,
        }
    }

    /// Uploads each source as a partial upload, at most
    /// `options.parallel_parts` at a time, then joins them in order into one
    /// final upload carrying `options.metadata`.
    ///
    /// The first part that fails stops the others.
    pub async fn upload_multiple<R>(
        &self,
        endpoint: &str,
        sources: Vec<R>,
        options: UploadOptions,
    ) -> Result<UploadHandle, UploadError>
    where
        R: AsyncRead + AsyncSeek + Unpin + Send,
    {
        let endpoint_url = parse_url(endpoint)?;
        let server = match &options.server {
            Some(server) => server.clone(),
            None => self.configuration(endpoint).await?,
        };
        if !server.supports(&Extension::Concatenation) {
            error!(endpoint, "server does not support concatenation");
            return Err(UploadError::MissingCapability(Extension::Concatenation));
        }
        if sources.is_empty() {
            return Err(UploadError::NothingToConcatenate);
        }

        let part_options = UploadOptions {
            metadata: Metadata::new(),
            server: Some(server.clone()),
            ..options.clone()
        };
        info!(endpoint, parts = sources.len(), "uploading partial uploads");
        let parts: Vec<UploadHandle> = stream::iter(sources.into_iter().enumerate())
            .map(|(index, source)| {
                let part_options = &part_options;
                async move { self.upload_part(endpoint, index, source, part_options).await }
            })
            .buffered(options.parallel_parts.max(1))
            .try_collect()
            .await?;

        let parts = PartialUploadSet::new(parts);
        let exchange = self.exchange();
        let handle = with_retry(&self.config, &self.cancel, "concatenation", || {
            creation::concatenate(&exchange, &endpoint_url, &server, &parts, &options.metadata)
        })
        .await?;
        emit(
            options.events.as_ref(),
            UploadEvent::Completed {
                location: handle.location().to_string(),
                offset: handle.offset(),
            },
        );
        Ok(handle)
    }

    async fn upload_part<R>(
        &self,
        endpoint: &str,
        index: usize,
        source: R,
        options: &UploadOptions,
    ) -> Result<UploadHandle, UploadError>
    where
        R: AsyncRead + AsyncSeek + Unpin + Send,
    {
        self.start(endpoint, source, options, true)
            .await
            .into_result()
            .map_err(|e| UploadError::PartFailed {
                index,
                source: Box::new(e),
            })
    }

    async fn start<R>(
        &self,
        endpoint: &str,
        source: R,
        options: &UploadOptions,
        partial: bool,
    ) -> UploadReport
    where
        R: AsyncRead + AsyncSeek + Unpin + Send,
    {
        let mut reader = ChunkReader::new(source, options.effective_chunk_size());
        let length = match options.length {
            LengthMode::Auto => match reader.total_len().await {
                Ok(n) => UploadLength::Declared(n),
                Err(e) => return UploadReport::failed(e.into()),
            },
            LengthMode::Deferred => UploadLength::Deferred,
        };
        if let Some(server) = &options.server {
            if let Err(e) = check_capabilities(server, length, partial) {
                error!(endpoint, error = %e, "upload not supported by server");
                return UploadReport::failed(e);
            }
        }

        let mut handle = match self.create(endpoint, length, &options.metadata, partial).await {
            Ok(handle) => handle,
            Err(e) => {
                error!(endpoint, error = %e, "upload creation failed");
                return UploadReport::failed(e);
            }
        };
        emit(
            options.events.as_ref(),
            UploadEvent::Created {
                location: handle.location().to_string(),
            },
        );

        let result = self
            .transfer(&mut handle, &mut reader, options.events.as_ref())
            .await;
        log_outcome(&handle, &result);
        UploadReport {
            handle: Some(handle),
            result,
        }
    }
}

fn parse_url(raw: &str) -> Result<Url, UploadError> {
    Url::parse(raw).map_err(|e| UploadError::InvalidUrl(format!("{raw}: {e}")))
}

fn check_capabilities(
    server: &ServerConfiguration,
    length: UploadLength,
    partial: bool,
) -> Result<(), UploadError> {
    if length == UploadLength::Deferred && !server.supports(&Extension::CreationDeferLength) {
        return Err(UploadError::MissingCapability(Extension::CreationDeferLength));
    }
    if partial && !server.supports(&Extension::Concatenation) {
        return Err(UploadError::MissingCapability(Extension::Concatenation));
    }
    Ok(())
}

fn log_outcome(handle: &UploadHandle, result: &TransferResult) {
    match result {
        TransferResult::Success { offset } => {
            info!(location = handle.location(), offset, "upload finished");
        }
        TransferResult::PartialFailure { offset, cause } => {
            warn!(location = handle.location(), offset, error = %cause, "upload suspended, can be resumed");
        }
        TransferResult::Fatal { cause } => {
            error!(location = handle.location(), error = %cause, "upload failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{FakeServer, Fault};
    use reqwest::Method;
    use std::io::Cursor;
    use std::io::Write;
    use tuskit_protocol::WarningReason;
    use tuskit_transfer::UploadState;

    const ENDPOINT: &str = "http://tus.test/files/";
    const DATA: &[u8] = b"0123456789";

    fn client(server: &Arc<FakeServer>) -> Client {
        let config = RetryConfiguration {
            jitter: false,
            ..RetryConfiguration::default()
        };
        Client::with_transport(server.clone(), config).unwrap()
    }

    fn source(data: &[u8]) -> Cursor<Vec<u8>> {
        Cursor::new(data.to_vec())
    }

    #[test]
    fn http_client_builds_from_default_configuration() {
        assert!(Client::new(RetryConfiguration::default()).is_ok());
    }

    #[test]
    fn invalid_extra_header_is_rejected() {
        let config = RetryConfiguration {
            headers: vec![("x-token".into(), "line\nbreak".into())],
            ..RetryConfiguration::default()
        };
        assert!(matches!(
            Client::with_transport(FakeServer::new(), config),
            Err(UploadError::InvalidHeader(_))
        ));
    }

    #[tokio::test]
    async fn uploads_source_with_metadata() {
        let server = FakeServer::new();
        let (tx, mut rx) = mpsc::channel(16);
        let options = UploadOptions::default()
            .with_chunk_size(4)
            .with_metadata(Metadata::new().with("filename", "digits.txt"))
            .with_events(tx);

        let report = client(&server).upload(ENDPOINT, source(DATA), options).await;

        assert!(matches!(report.result, TransferResult::Success { offset: 10 }));
        let handle = report.into_result().unwrap();
        assert_eq!(handle.state(), UploadState::Completed);
        assert_eq!(server.data(handle.location()), DATA);
        assert_eq!(
            server.metadata_header(handle.location()).as_deref(),
            Some("filename ZGlnaXRzLnR4dA==")
        );
        assert!(matches!(rx.try_recv(), Ok(UploadEvent::Created { .. })));
    }

    #[tokio::test]
    async fn connection_drop_mid_upload_resumes_from_server_offset() {
        let server = FakeServer::new();
        server.inject(Method::PATCH, 1, Fault::DropResponse);
        let (tx, mut rx) = mpsc::channel(16);
        let options = UploadOptions::default()
            .with_chunk_size(5)
            .with_metadata(Metadata::new().with("name", "a.txt"))
            .with_events(tx);

        let report = client(&server).upload(ENDPOINT, source(DATA), options).await;

        assert!(matches!(report.result, TransferResult::Success { offset: 10 }));
        let location = report.handle.unwrap().location().to_string();
        assert_eq!(server.data(&location), DATA);
        assert_eq!(server.requests_of(Method::HEAD).len(), 1);

        let mut offsets = Vec::new();
        while let Ok(event) = rx.try_recv() {
            match event {
                UploadEvent::Progress { offset, .. }
                | UploadEvent::Resumed { offset, .. }
                | UploadEvent::Completed { offset, .. } => offsets.push(offset),
                UploadEvent::Created { .. } => {}
            }
        }
        assert_eq!(offsets, vec![5, 10, 10]);
    }

    #[tokio::test]
    async fn uploads_files() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("upload.bin");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(b"file contents")
            .unwrap();

        let server = FakeServer::new();
        let report = client(&server)
            .upload_file(ENDPOINT, &path, UploadOptions::default().with_chunk_size(5))
            .await;
        let handle = report.into_result().unwrap();
        assert_eq!(server.data(handle.location()), b"file contents");
        assert_eq!(server.requests_of(Method::PATCH).len(), 3);

        let missing = client(&server)
            .upload_file(ENDPOINT, &dir.path().join("missing"), UploadOptions::default())
            .await;
        assert!(missing.handle.is_none());
        assert!(matches!(
            missing.result,
            TransferResult::Fatal {
                cause: UploadError::Source(_)
            }
        ));
    }

    #[tokio::test]
    async fn deferred_upload_needs_server_support() {
        let server = FakeServer::new();
        server.set_extensions(&["creation"]);
        let c = client(&server);
        let config = c.configuration(ENDPOINT).await.unwrap();

        let report = c
            .upload(
                ENDPOINT,
                source(DATA),
                UploadOptions::default().deferred().with_server(config),
            )
            .await;
        assert!(matches!(
            report.result,
            TransferResult::Fatal {
                cause: UploadError::MissingCapability(Extension::CreationDeferLength)
            }
        ));
        assert!(server.requests_of(Method::POST).is_empty());
    }

    #[tokio::test]
    async fn chunks_are_capped_by_server_max_size() {
        let server = FakeServer::new();
        server.set_max_size(Some(3));
        let c = client(&server);
        let config = c.configuration(ENDPOINT).await.unwrap();

        let report = c
            .upload(
                ENDPOINT,
                source(b"abcdefg"),
                UploadOptions::default().with_chunk_size(1024).with_server(config),
            )
            .await;
        assert!(report.result.is_success());
        assert_eq!(server.requests_of(Method::PATCH).len(), 3);
    }

    #[tokio::test]
    async fn resumes_partially_uploaded_data() {
        let server = FakeServer::new();
        let location = server.insert_upload(b"01234", Some(10), Some("filename YS50eHQ="));

        let report = client(&server)
            .resume(location.as_str(), source(DATA), UploadOptions::default())
            .await;

        assert!(matches!(report.result, TransferResult::Success { offset: 10 }));
        let patches = server.requests_of(Method::PATCH);
        assert_eq!(patches.len(), 1);
        assert_eq!(patches[0].header("upload-offset"), Some("5"));
        assert_eq!(server.data(location.as_str()), DATA);
        let handle = report.handle.unwrap();
        assert_eq!(handle.metadata(), &Metadata::new().with("filename", "a.txt"));
    }

    #[tokio::test]
    async fn resumed_partial_upload_stays_partial() {
        let server = FakeServer::new();
        let location = server.insert_upload(b"012", Some(10), None);
        server.set_concat(location.as_str(), "partial");

        let report = client(&server)
            .resume(location.as_str(), source(DATA), UploadOptions::default())
            .await;

        assert!(matches!(report.result, TransferResult::Success { offset: 10 }));
        let handle = report.handle.unwrap();
        assert!(handle.is_partial());
        assert!(PartialUploadSet::new(vec![handle]).all_complete());
    }

    #[tokio::test]
    async fn resuming_a_finished_upload_sends_nothing() {
        let server = FakeServer::new();
        let location = server.insert_upload(DATA, Some(10), None);

        let report = client(&server)
            .resume(location.as_str(), source(DATA), UploadOptions::default())
            .await;

        assert!(matches!(report.result, TransferResult::Success { offset: 10 }));
        assert!(server.requests_of(Method::PATCH).is_empty());
    }

    #[tokio::test]
    async fn cancelled_upload_can_be_resumed_by_another_client() {
        let server = FakeServer::new();
        server.inject(Method::PATCH, 1, Fault::CancelClient);
        let cancelling = client(&server).with_cancel_token(server.cancel_token());

        let report = cancelling
            .upload(ENDPOINT, source(DATA), UploadOptions::default().with_chunk_size(4))
            .await;
        assert!(matches!(
            report.result,
            TransferResult::PartialFailure {
                offset: 4,
                cause: UploadError::Cancelled
            }
        ));
        let suspended = report.handle.unwrap();
        assert_eq!(suspended.state(), UploadState::Suspended);

        let json = serde_json::to_string(&suspended).unwrap();
        let stored: UploadHandle = serde_json::from_str(&json).unwrap();
        let report = client(&server)
            .resume(stored.location(), source(DATA), UploadOptions::default())
            .await;
        assert!(matches!(report.result, TransferResult::Success { offset: 10 }));
        assert_eq!(server.data(stored.location()), DATA);
    }

    #[tokio::test]
    async fn metadata_decoding_is_tolerant() {
        let server = FakeServer::new();
        let location = server.insert_upload(b"", Some(1), Some("good djE=,bad *,flag"));

        let decoded = client(&server).metadata(location.as_str()).await.unwrap();

        assert_eq!(
            decoded.metadata,
            Metadata::new().with("good", "v1").with_key("flag")
        );
        assert_eq!(decoded.warnings.len(), 1);
        assert_eq!(decoded.warnings[0].key, "bad");
        assert!(matches!(
            decoded.warnings[0].reason,
            WarningReason::InvalidBase64(_)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn configuration_query_is_retried() {
        let server = FakeServer::new();
        server.inject(Method::OPTIONS, 1, Fault::Status(503));

        let config = client(&server).configuration(ENDPOINT).await.unwrap();

        assert!(config.supports(&Extension::Concatenation));
        assert_eq!(server.requests_of(Method::OPTIONS).len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn creation_gives_up_after_max_attempts() {
        let server = FakeServer::new();
        server.inject(Method::POST, 1, Fault::Status(500));
        server.inject(Method::POST, 2, Fault::DropRequest);
        let config = RetryConfiguration {
            max_attempts: 2,
            jitter: false,
            ..RetryConfiguration::default()
        };
        let c = Client::with_transport(server.clone(), config).unwrap();

        let report = c.upload(ENDPOINT, source(DATA), UploadOptions::default()).await;

        assert!(report.handle.is_none());
        match report.result {
            TransferResult::Fatal {
                cause: UploadError::RetriesExhausted { attempts, last },
            } => {
                assert_eq!(attempts, 2);
                assert!(matches!(*last, UploadError::Transport(_)));
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(server.upload_count(), 0);
    }

    #[tokio::test]
    async fn invalid_endpoint_is_rejected() {
        let server = FakeServer::new();
        let report = client(&server)
            .upload("not a url", source(DATA), UploadOptions::default())
            .await;
        assert!(matches!(
            report.result,
            TransferResult::Fatal {
                cause: UploadError::InvalidUrl(_)
            }
        ));
        assert!(server.requests().is_empty());
    }

    #[tokio::test]
    async fn uploads_parts_and_concatenates_in_order() {
        let server = FakeServer::new();
        let sources = vec![source(b"abc"), source(b"defg"), source(b"hi")];
        let options = UploadOptions::default()
            .with_chunk_size(2)
            .with_metadata(Metadata::new().with("filename", "joined.txt"));

        let handle = client(&server)
            .upload_multiple(ENDPOINT, sources, options)
            .await
            .unwrap();

        assert_eq!(handle.state(), UploadState::Completed);
        assert_eq!(handle.offset(), 9);
        assert_eq!(server.data(handle.location()), b"abcdefghi");

        let posts = server.requests_of(Method::POST);
        assert_eq!(posts.len(), 4);
        for part in &posts[..3] {
            assert_eq!(part.header("upload-concat"), Some("partial"));
            assert!(part.header("upload-metadata").is_none());
        }
        assert_eq!(
            posts[3].header("upload-concat"),
            Some("final;/files/1 /files/2 /files/3")
        );
        assert_eq!(
            posts[3].header("upload-metadata"),
            Some("filename am9pbmVkLnR4dA==")
        );
    }

    #[tokio::test]
    async fn multiple_upload_requires_concatenation_up_front() {
        let server = FakeServer::new();
        server.set_extensions(&["creation"]);

        let err = client(&server)
            .upload_multiple(ENDPOINT, vec![source(b"abc")], UploadOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            UploadError::MissingCapability(Extension::Concatenation)
        ));
        let requests = server.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].method, Method::OPTIONS);
    }

    #[tokio::test]
    async fn failed_part_stops_the_concatenation() {
        let server = FakeServer::new();
        server.inject(Method::POST, 2, Fault::Status(400));
        let sources = vec![source(b"abc"), source(b"def"), source(b"ghi")];

        let err = client(&server)
            .upload_multiple(ENDPOINT, sources, UploadOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(err, UploadError::PartFailed { .. }));
        assert_eq!(err.status(), Some(400));
        assert!(
            server
                .requests_of(Method::POST)
                .iter()
                .all(|r| r.header("upload-concat") == Some("partial"))
        );
    }
}
