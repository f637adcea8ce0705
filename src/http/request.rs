//! Request state tracked through the pipeline.
//!
//! # Responsibilities
//! - Hold method, path, query, headers and the accumulated body
//! - Hold routing results (path template, path params)
//! - Hold lazily deserialized content, type-erased
//! - Carry a string-keyed attribute bag for cross-stage annotations
//!
//! # Design Decisions
//! - Once the last chunk is seen, no more body bytes may be appended
//! - Content is set at most once per request

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use http::request::Parts;
use http::{HeaderMap, Method, Uri, Version};
use percent_encoding::percent_decode_str;

use crate::error::PipelineError;

/// Deserialized request content.
pub type Content = Arc<dyn Any + Send + Sync>;

/// Everything known about the in-flight request.
#[derive(Clone)]
pub struct RequestInfo {
    method: Method,
    uri: Uri,
    path: String,
    query_params: HashMap<String, Vec<String>>,
    version: Version,
    headers: HeaderMap,
    trailing_headers: HeaderMap,
    raw_content: BytesMut,
    content: Option<Content>,
    content_deserialized: bool,
    content_validated: bool,
    path_template: Option<String>,
    path_params: HashMap<String, String>,
    attributes: HashMap<String, serde_json::Value>,
    chunk_count: u64,
    last_chunk_seen: bool,
}

impl std::fmt::Debug for RequestInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestInfo")
            .field("method", &self.method)
            .field("uri", &self.uri)
            .field("path_template", &self.path_template)
            .field("chunk_count", &self.chunk_count)
            .field("raw_content_len", &self.raw_content.len())
            .field("last_chunk_seen", &self.last_chunk_seen)
            .finish()
    }
}

/// Percent-decode a request path. Invalid escapes are kept as sent.
pub(crate) fn decode_path(path: &str) -> String {
    percent_decode_str(path).decode_utf8_lossy().into_owned()
}

/// Strip trailing slashes, keeping the root path intact.
pub(crate) fn normalize_path(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

impl RequestInfo {
    /// Build from decoded request head.
    pub fn from_parts(parts: &Parts) -> Self {
        Self::new(parts.method.clone(), parts.uri.clone(), parts.version, parts.headers.clone())
    }

    pub fn new(method: Method, uri: Uri, version: Version, headers: HeaderMap) -> Self {
        let query_params = uri
            .query()
            .map(|q| {
                let mut params: HashMap<String, Vec<String>> = HashMap::new();
                for (k, v) in url::form_urlencoded::parse(q.as_bytes()) {
                    params.entry(k.into_owned()).or_default().push(v.into_owned());
                }
                params
            })
            .unwrap_or_default();

        Self {
            path: normalize_path(&decode_path(uri.path())),
            method,
            uri,
            query_params,
            version,
            headers,
            trailing_headers: HeaderMap::new(),
            raw_content: BytesMut::new(),
            content: None,
            content_deserialized: false,
            content_validated: false,
            path_template: None,
            path_params: HashMap::new(),
            attributes: HashMap::new(),
            chunk_count: 0,
            last_chunk_seen: false,
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    /// Decoded path with any trailing slash removed. [`uri`](Self::uri) keeps the raw form.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query_string(&self) -> Option<&str> {
        self.uri.query()
    }

    pub fn query_params(&self) -> &HashMap<String, Vec<String>> {
        &self.query_params
    }

    /// First value of a query parameter.
    pub fn query_param_single(&self, name: &str) -> Option<&str> {
        self.query_params
            .get(name)
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// First value of a header as a string, if it is valid visible ASCII.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn trailing_headers(&self) -> &HeaderMap {
        &self.trailing_headers
    }

    /// Declared `Content-Length`, if present and parseable.
    pub fn content_length(&self) -> Result<Option<u64>, PipelineError> {
        match self.headers.get(http::header::CONTENT_LENGTH) {
            None => Ok(None),
            Some(value) => value
                .to_str()
                .ok()
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Some)
                .ok_or_else(|| PipelineError::malformed("Invalid Content-Length header")),
        }
    }

    pub fn is_chunked(&self) -> bool {
        self.headers
            .get_all(http::header::TRANSFER_ENCODING)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .any(|v| v.to_ascii_lowercase().contains("chunked"))
    }

    /// Append one body chunk. Fails once the last chunk has been seen or the limit is exceeded.
    pub fn append_chunk(&mut self, chunk: Bytes, max_size: Option<usize>) -> Result<(), PipelineError> {
        if self.last_chunk_seen {
            return Err(PipelineError::Unhandled(
                "body chunk received after the last chunk".into(),
            ));
        }
        if let Some(max) = max_size {
            if self.raw_content.len() + chunk.len() > max {
                return Err(PipelineError::request_too_large(max));
            }
        }
        self.chunk_count += 1;
        self.raw_content.extend_from_slice(&chunk);
        Ok(())
    }

    /// Mark the body complete, optionally recording trailers.
    pub fn mark_last_chunk(&mut self, trailers: Option<HeaderMap>) {
        if let Some(trailers) = trailers {
            self.trailing_headers.extend(trailers);
        }
        self.last_chunk_seen = true;
    }

    pub fn is_complete_request_with_all_chunks(&self) -> bool {
        self.last_chunk_seen
    }

    pub fn chunk_count(&self) -> u64 {
        self.chunk_count
    }

    pub fn raw_content_bytes(&self) -> &[u8] {
        &self.raw_content
    }

    /// Body as UTF-8, lossily decoded.
    pub fn raw_content_string(&self) -> String {
        String::from_utf8_lossy(&self.raw_content).into_owned()
    }

    pub fn raw_content_len(&self) -> usize {
        self.raw_content.len()
    }

    /// Replace the assembled body, e.g. after payload decompression.
    pub fn replace_raw_content(&mut self, body: Bytes) {
        self.raw_content = BytesMut::from(&body[..]);
    }

    /// Deserialized content downcast to `T`.
    pub fn content<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.content.as_ref().and_then(|c| c.downcast_ref::<T>())
    }

    pub fn content_erased(&self) -> Option<&Content> {
        self.content.as_ref()
    }

    pub fn is_content_deserialized(&self) -> bool {
        self.content_deserialized
    }

    /// Record deserialized content. Only the first call has an effect.
    pub fn set_content(&mut self, content: Option<Content>) -> bool {
        if self.content_deserialized {
            return false;
        }
        self.content_deserialized = true;
        self.content = content;
        true
    }

    pub fn is_content_validated(&self) -> bool {
        self.content_validated
    }

    /// Returns false if validation already ran for this request.
    pub fn mark_content_validated(&mut self) -> bool {
        !std::mem::replace(&mut self.content_validated, true)
    }

    pub fn path_template(&self) -> Option<&str> {
        self.path_template.as_deref()
    }

    pub fn path_params(&self) -> &HashMap<String, String> {
        &self.path_params
    }

    pub fn path_param(&self, name: &str) -> Option<&str> {
        self.path_params.get(name).map(String::as_str)
    }

    /// Record the matched template and the params extracted from it.
    pub fn set_route(&mut self, template: String, params: HashMap<String, String>) {
        self.path_template = Some(template);
        self.path_params = params;
    }

    pub fn attribute(&self, key: &str) -> Option<&serde_json::Value> {
        self.attributes.get(key)
    }

    pub fn set_attribute(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.attributes.insert(key.into(), value);
    }

    pub fn attributes(&self) -> &HashMap<String, serde_json::Value> {
        &self.attributes
    }
}
