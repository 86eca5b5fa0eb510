//! Client for the tus resumable upload protocol.
//!
//! [`Client`] is the entry point: it creates uploads, sends their data in
//! chunks and resumes them from the server's offset after interruptions.
//! The building blocks it is made of ([`creation`], [`discovery`],
//! [`upload`]) are public for callers that drive the protocol themselves.
//!
//! ```no_run
//! use tuskit_client::{Client, RetryConfiguration, UploadOptions};
//! use tuskit_protocol::Metadata;
//!
//! # async fn run() -> Result<(), tuskit_client::UploadError> {
//! let client = Client::new(RetryConfiguration::default())?;
//! let file = tokio::fs::File::open("video.mp4").await.map_err(tuskit_transfer::TransferError::from)?;
//! let options = UploadOptions::default().with_metadata(Metadata::new().with("filename", "video.mp4"));
//! let handle = client
//!     .upload("https://tus.example.com/files/", file, options)
//!     .await
//!     .into_result()?;
//! println!("uploaded to {}", handle.location());
//! # Ok(())
//! # }
//! ```

mod client;
pub mod creation;
pub mod discovery;
pub mod error;
pub mod retry;
pub mod transport;
pub mod types;
pub mod upload;

#[cfg(test)]
mod mock;

pub use client::Client;
pub use error::{TransportError, TransportErrorKind, UploadError};
pub use retry::{RetryConfiguration, RetryOn, TlsConfig, with_retry};
pub use transport::{Exchange, HttpTransport, Transport, TusRequest, TusResponse};
pub use types::{LengthMode, TransferResult, UploadEvent, UploadOptions, UploadReport, UploadStatus};
pub use upload::MAX_RECONCILIATIONS;
