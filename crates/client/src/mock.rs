//! In-memory tus server implementing [`Transport`], with fault injection.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, StatusCode, Url};
use tokio_util::sync::CancellationToken;
use tuskit_protocol::constants::OFFSET_OCTET_STREAM;

use crate::error::{TransportError, TransportErrorKind};
use crate::transport::{Exchange, Transport, TusRequest, TusResponse};

/// What goes wrong with a targeted request.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Fault {
    /// The request never reaches the server.
    DropRequest,
    /// The server applies the request but the response is lost.
    DropResponse,
    /// The request times out without reaching the server.
    Timeout,
    /// The server answers with this status without applying the request.
    Status(u16),
    /// The server applies a `PATCH` but reports `offset + delta`.
    MisreportOffset(i64),
    /// The response is delivered, then the client's token is cancelled.
    CancelClient,
    /// The server stores the first bytes of a `PATCH` body, then answers 409.
    PartialConflict(usize),
}

struct FakeUpload {
    data: Vec<u8>,
    length: Option<u64>,
    metadata: Option<String>,
    concat: Option<String>,
}

#[derive(Default)]
struct State {
    uploads: HashMap<String, FakeUpload>,
    next_id: u32,
    requests: Vec<TusRequest>,
    counters: HashMap<Method, usize>,
    faults: Vec<(Method, usize, Fault)>,
    extensions: Vec<String>,
    max_size: Option<u64>,
    omit_offset: bool,
}

pub(crate) struct FakeServer {
    state: Mutex<State>,
    headers: HeaderMap,
    cancel: CancellationToken,
}

fn response(status: u16, headers: &[(&'static str, String)]) -> TusResponse {
    let mut map = HeaderMap::new();
    map.insert("tus-resumable", HeaderValue::from_static("1.0.0"));
    for (name, value) in headers {
        map.insert(
            HeaderName::from_static(name),
            HeaderValue::from_str(value).unwrap(),
        );
    }
    TusResponse {
        status: StatusCode::from_u16(status).unwrap(),
        headers: map,
    }
}

impl FakeServer {
    pub(crate) fn new() -> Arc<Self> {
        let state = State {
            extensions: ["creation", "creation-defer-length", "concatenation", "termination"]
                .map(String::from)
                .to_vec(),
            ..State::default()
        };
        Arc::new(Self {
            state: Mutex::new(state),
            headers: HeaderMap::new(),
            cancel: CancellationToken::new(),
        })
    }

    pub(crate) fn endpoint(&self) -> Url {
        Url::parse("http://tus.test/files/").unwrap()
    }

    pub(crate) fn exchange(&self) -> Exchange<'_> {
        Exchange::new(self, &self.headers, &self.cancel)
    }

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub(crate) fn set_extensions(&self, extensions: &[&str]) {
        self.state.lock().unwrap().extensions = extensions.iter().map(|s| s.to_string()).collect();
    }

    pub(crate) fn set_max_size(&self, max_size: Option<u64>) {
        self.state.lock().unwrap().max_size = max_size;
    }

    pub(crate) fn omit_offset_header(&self, omit: bool) {
        self.state.lock().unwrap().omit_offset = omit;
    }

    /// Injects `fault` into the `nth` (1-based) request with `method`.
    pub(crate) fn inject(&self, method: Method, nth: usize, fault: Fault) {
        self.state.lock().unwrap().faults.push((method, nth, fault));
    }

    /// Stores an upload directly, bypassing creation.
    pub(crate) fn insert_upload(&self, data: &[u8], length: Option<u64>, metadata: Option<&str>) -> Url {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let path = format!("/files/{}", state.next_id);
        state.uploads.insert(
            path.clone(),
            FakeUpload {
                data: data.to_vec(),
                length,
                metadata: metadata.map(str::to_string),
                concat: None,
            },
        );
        self.endpoint().join(&path).unwrap()
    }

    pub(crate) fn set_concat(&self, location: &str, concat: &str) {
        let url = Url::parse(location).unwrap();
        if let Some(upload) = self.state.lock().unwrap().uploads.get_mut(url.path()) {
            upload.concat = Some(concat.to_string());
        }
    }

    pub(crate) fn data(&self, location: &str) -> Vec<u8> {
        let url = Url::parse(location).unwrap();
        self.state.lock().unwrap().uploads[url.path()].data.clone()
    }

    pub(crate) fn length(&self, location: &str) -> Option<u64> {
        let url = Url::parse(location).unwrap();
        self.state.lock().unwrap().uploads[url.path()].length
    }

    pub(crate) fn metadata_header(&self, location: &str) -> Option<String> {
        let url = Url::parse(location).unwrap();
        self.state.lock().unwrap().uploads[url.path()].metadata.clone()
    }

    pub(crate) fn upload_count(&self) -> usize {
        self.state.lock().unwrap().uploads.len()
    }

    pub(crate) fn requests(&self) -> Vec<TusRequest> {
        self.state.lock().unwrap().requests.clone()
    }

    pub(crate) fn requests_of(&self, method: Method) -> Vec<TusRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.method == method)
            .collect()
    }

    fn handle(&self, request: TusRequest) -> Result<TusResponse, TransportError> {
        let mut state = self.state.lock().unwrap();
        state.requests.push(request.clone());
        let count = state.counters.entry(request.method.clone()).or_insert(0);
        *count += 1;
        let nth = *count;
        let fault = state
            .faults
            .iter()
            .position(|(m, n, _)| *m == request.method && *n == nth)
            .map(|i| state.faults.remove(i).2);

        match fault {
            Some(Fault::DropRequest) => {
                return Err(TransportError::new(TransportErrorKind::Other, "connection reset"));
            }
            Some(Fault::Timeout) => {
                return Err(TransportError::new(TransportErrorKind::Timeout, "timed out"));
            }
            Some(Fault::Status(status)) => return Ok(response(status, &[])),
            Some(Fault::PartialConflict(keep)) => return Ok(state.partial_write(&request, keep)),
            _ => {}
        }

        let mut resp = match request.method {
            Method::OPTIONS => state.options(),
            Method::POST => state.create(&request),
            Method::HEAD => state.head(&request),
            Method::PATCH => state.patch(&request),
            _ => response(405, &[]),
        };

        match fault {
            Some(Fault::DropResponse) => Err(TransportError::new(
                TransportErrorKind::Other,
                "connection closed before response",
            )),
            Some(Fault::MisreportOffset(delta)) => {
                let reported = resp
                    .header("upload-offset")
                    .and_then(|v| v.parse::<i64>().ok())
                    .unwrap_or(0)
                    + delta;
                resp.headers.insert(
                    "upload-offset",
                    HeaderValue::from_str(&reported.to_string()).unwrap(),
                );
                Ok(resp)
            }
            Some(Fault::CancelClient) => {
                self.cancel.cancel();
                Ok(resp)
            }
            _ => Ok(resp),
        }
    }
}

impl State {
    fn options(&self) -> TusResponse {
        let mut headers = vec![
            ("tus-version", "1.0.0".to_string()),
            ("tus-extension", self.extensions.join(",")),
        ];
        if let Some(max) = self.max_size {
            headers.push(("tus-max-size", max.to_string()));
        }
        response(204, &headers)
    }

    fn create(&mut self, request: &TusRequest) -> TusResponse {
        if request.url.path() != "/files/" {
            return response(404, &[]);
        }
        if request.header("tus-resumable") != Some("1.0.0") {
            return response(412, &[]);
        }

        let concat = request.header("upload-concat");
        let (data, length) = match concat.and_then(|v| v.strip_prefix("final;")) {
            Some(parts) => {
                let mut data = Vec::new();
                for part in parts.split_whitespace() {
                    match self.uploads.get(part) {
                        Some(u) if u.length == Some(u.data.len() as u64) => {
                            data.extend_from_slice(&u.data)
                        }
                        _ => return response(400, &[]),
                    }
                }
                let length = data.len() as u64;
                (data, Some(length))
            }
            None => {
                let length = match (
                    request.header("upload-length"),
                    request.header("upload-defer-length"),
                ) {
                    (Some(raw), _) => match raw.parse::<u64>() {
                        Ok(n) => Some(n),
                        Err(_) => return response(400, &[]),
                    },
                    (None, Some("1")) => None,
                    _ => return response(400, &[]),
                };
                (Vec::new(), length)
            }
        };

        self.next_id += 1;
        let path = format!("/files/{}", self.next_id);
        self.uploads.insert(
            path.clone(),
            FakeUpload {
                data,
                length,
                metadata: request.header("upload-metadata").map(str::to_string),
                concat: concat.map(str::to_string),
            },
        );
        response(201, &[("location", path)])
    }

    fn head(&self, request: &TusRequest) -> TusResponse {
        let Some(upload) = self.uploads.get(request.url.path()) else {
            return response(404, &[]);
        };
        let mut headers = vec![("cache-control", "no-store".to_string())];
        if !self.omit_offset {
            headers.push(("upload-offset", upload.data.len().to_string()));
        }
        match upload.length {
            Some(len) => headers.push(("upload-length", len.to_string())),
            None => headers.push(("upload-defer-length", "1".to_string())),
        }
        if let Some(metadata) = &upload.metadata {
            headers.push(("upload-metadata", metadata.clone()));
        }
        if let Some(concat) = &upload.concat {
            headers.push(("upload-concat", concat.clone()));
        }
        response(200, &headers)
    }

    fn partial_write(&mut self, request: &TusRequest, keep: usize) -> TusResponse {
        if let Some(upload) = self.uploads.get_mut(request.url.path()) {
            let body = request.body.as_deref().unwrap_or(&[]);
            upload.data.extend_from_slice(&body[..keep.min(body.len())]);
        }
        response(409, &[])
    }

    fn patch(&mut self, request: &TusRequest) -> TusResponse {
        let Some(upload) = self.uploads.get_mut(request.url.path()) else {
            return response(404, &[]);
        };
        if request.header("content-type") != Some(OFFSET_OCTET_STREAM) {
            return response(415, &[]);
        }
        let Some(offset) = request
            .header("upload-offset")
            .and_then(|v| v.parse::<u64>().ok())
        else {
            return response(400, &[]);
        };
        if offset != upload.data.len() as u64 {
            return response(409, &[]);
        }
        if let Some(raw) = request.header("upload-length") {
            let Ok(len) = raw.parse::<u64>() else {
                return response(400, &[]);
            };
            match upload.length {
                None => upload.length = Some(len),
                Some(declared) if declared != len => return response(400, &[]),
                Some(_) => {}
            }
        }
        let body = request.body.as_deref().unwrap_or(&[]);
        if let Some(len) = upload.length {
            if offset + body.len() as u64 > len {
                return response(400, &[]);
            }
        }
        upload.data.extend_from_slice(body);
        response(204, &[("upload-offset", upload.data.len().to_string())])
    }
}

impl Transport for FakeServer {
    fn send(
        &self,
        request: TusRequest,
    ) -> Pin<Box<dyn Future<Output = Result<TusResponse, TransportError>> + Send + '_>> {
        Box::pin(async move { self.handle(request) })
    }
}
