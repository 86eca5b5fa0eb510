//! Protocol version, header names and reserved header values.
//!
//! Header names are lowercase so they can be used with
//! `HeaderName::from_static` directly.

/// The version of the tus protocol implemented by this crate.
pub const TUS_RESUMABLE: &str = "1.0.0";

/// Content type required for `PATCH` request bodies.
pub const OFFSET_OCTET_STREAM: &str = "application/offset+octet-stream";

pub const HEADER_TUS_RESUMABLE: &str = "tus-resumable";
pub const HEADER_TUS_VERSION: &str = "tus-version";
pub const HEADER_TUS_EXTENSION: &str = "tus-extension";
pub const HEADER_TUS_MAX_SIZE: &str = "tus-max-size";

pub const HEADER_UPLOAD_OFFSET: &str = "upload-offset";
pub const HEADER_UPLOAD_LENGTH: &str = "upload-length";
pub const HEADER_UPLOAD_DEFER_LENGTH: &str = "upload-defer-length";
pub const HEADER_UPLOAD_METADATA: &str = "upload-metadata";
pub const HEADER_UPLOAD_CONCAT: &str = "upload-concat";

/// Value of `Upload-Defer-Length` announcing that the length follows later.
pub const DEFER_LENGTH_MARKER: &str = "1";

/// Default chunk size: 4 MiB.
pub const DEFAULT_CHUNK_SIZE: usize = 4 * 1024 * 1024;
