//! HTTP seam between the upload engine and the network.
//!
//! The engine talks to a [`Transport`], which turns a [`TusRequest`] into a
//! [`TusResponse`]. [`HttpTransport`] is the production implementation on top
//! of `reqwest`; tests substitute an in-memory server.

use std::future::Future;
use std::pin::Pin;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, StatusCode, Url};
use tokio_util::sync::CancellationToken;
use tracing::trace;
use tuskit_protocol::constants::{HEADER_TUS_RESUMABLE, TUS_RESUMABLE};

use crate::error::{TransportError, UploadError};
use crate::retry::RetryConfiguration;

/// A request to a tus server.
#[derive(Debug, Clone)]
pub struct TusRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Vec<u8>>,
}

impl TusRequest {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
        }
    }

    /// A request carrying the `Tus-Resumable` version header.
    pub(crate) fn tus(method: Method, url: Url) -> Self {
        let mut request = Self::new(method, url);
        request.headers.insert(
            HeaderName::from_static(HEADER_TUS_RESUMABLE),
            HeaderValue::from_static(TUS_RESUMABLE),
        );
        request
    }

    /// Sets a header, replacing any previous value.
    pub fn set_header(&mut self, name: &'static str, value: &str) -> Result<(), UploadError> {
        let value = HeaderValue::from_str(value).map_err(|_| UploadError::InvalidHeader(name.into()))?;
        self.headers.insert(HeaderName::from_static(name), value);
        Ok(())
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// Status and headers of a server response. Bodies are not used by the
/// protocol and are discarded.
#[derive(Debug, Clone)]
pub struct TusResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
}

impl TusResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// Sends tus requests.
///
/// Implementations report only failures to obtain a response; any HTTP
/// status is a successful exchange at this level.
pub trait Transport: Send + Sync {
    fn send(
        &self,
        request: TusRequest,
    ) -> Pin<Box<dyn Future<Output = Result<TusResponse, TransportError>> + Send + '_>>;
}

/// [`Transport`] over a pooled `reqwest` client.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    http: reqwest::Client,
}

impl HttpTransport {
    /// Builds a client honoring the TLS and timeout settings of `config`.
    pub fn new(config: &RetryConfiguration) -> Result<Self, UploadError> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = config.request_timeout {
            builder = builder.timeout(timeout);
        }
        if config.tls.accept_invalid_certs {
            builder = builder.danger_accept_invalid_certs(true);
        }
        for pem in &config.tls.root_certificates_pem {
            let cert = reqwest::Certificate::from_pem(pem).map_err(|e| UploadError::Tls(e.to_string()))?;
            builder = builder.add_root_certificate(cert);
        }
        let http = builder.build().map_err(|e| UploadError::Tls(e.to_string()))?;
        Ok(Self { http })
    }

    /// Wraps an existing client.
    pub fn from_client(http: reqwest::Client) -> Self {
        Self { http }
    }
}

impl Transport for HttpTransport {
    fn send(
        &self,
        request: TusRequest,
    ) -> Pin<Box<dyn Future<Output = Result<TusResponse, TransportError>> + Send + '_>> {
        Box::pin(async move {
            let mut builder = self
                .http
                .request(request.method, request.url)
                .headers(request.headers);
            if let Some(body) = request.body {
                builder = builder.body(body);
            }

            let resp = builder.send().await?;
            let status = resp.status();
            let headers = resp.headers().clone();
            // Drain the body so the connection goes back to the pool.
            let _ = resp.bytes().await;
            Ok(TusResponse { status, headers })
        })
    }
}

/// One logical conversation with a server: a transport plus the extra
/// headers and the cancellation token shared by every request.
#[derive(Clone, Copy)]
pub struct Exchange<'a> {
    transport: &'a dyn Transport,
    headers: &'a HeaderMap,
    cancel: &'a CancellationToken,
}

impl<'a> Exchange<'a> {
    pub fn new(
        transport: &'a dyn Transport,
        headers: &'a HeaderMap,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            transport,
            headers,
            cancel,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        self.cancel
    }

    /// Sends `request`, racing it against cancellation.
    ///
    /// Extra headers never override the protocol headers already set.
    pub async fn send(&self, mut request: TusRequest) -> Result<TusResponse, UploadError> {
        for (name, value) in self.headers {
            if !request.headers.contains_key(name) {
                request.headers.insert(name.clone(), value.clone());
            }
        }

        let method = request.method.clone();
        let url = request.url.clone();
        let resp = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(UploadError::Cancelled),
            result = self.transport.send(request) => result.map_err(UploadError::from),
        }?;
        trace!(%method, %url, status = resp.status.as_u16(), "response");
        Ok(resp)
    }
}
