//! Response state produced by endpoints, filters or the error mapper.
//!
//! # Responsibilities
//! - Carry status, headers and a payload descriptor
//! - Carry the prevent-compression flag and content-type override
//! - Distinguish pass-through (proxied) responses whose framing must not change
//!
//! # Design Decisions
//! - The sender consumes a `ResponseInfo` by value, so it cannot be sent twice
//! - Streaming payloads are never buffered

use axum::body::Body;
use bytes::Bytes;
use http::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use http::{HeaderMap, StatusCode};
use serde::Serialize;

use crate::error::PipelineError;

/// Response extension marking a response that must not be compressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreventCompression;

/// What will be written as the body.
pub enum Payload {
    /// No body.
    Empty,
    /// Fully in memory; sent with a known Content-Length.
    Buffered(Bytes),
    /// Produced incrementally; sent chunked unless framing is passed through.
    Streaming(Body),
}

impl std::fmt::Debug for Payload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Payload::Empty => write!(f, "Empty"),
            Payload::Buffered(b) => write!(f, "Buffered({} bytes)", b.len()),
            Payload::Streaming(_) => write!(f, "Streaming"),
        }
    }
}

/// The outgoing response.
#[derive(Debug)]
pub struct ResponseInfo {
    status: StatusCode,
    headers: HeaderMap,
    payload: Payload,
    prevent_compression: bool,
    content_type: Option<String>,
    pass_through_framing: bool,
}

impl ResponseInfo {
    pub fn new(status: StatusCode, payload: Payload) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            payload,
            prevent_compression: false,
            content_type: None,
            pass_through_framing: false,
        }
    }

    /// A response with no body.
    pub fn empty(status: StatusCode) -> Self {
        Self::new(status, Payload::Empty)
    }

    /// A buffered body with an explicit content type.
    pub fn bytes(status: StatusCode, body: impl Into<Bytes>, content_type: &str) -> Self {
        let mut response = Self::new(status, Payload::Buffered(body.into()));
        response.content_type = Some(content_type.to_string());
        response
    }

    /// A UTF-8 text body.
    pub fn text(status: StatusCode, body: impl Into<String>) -> Self {
        let body: String = body.into();
        Self::bytes(status, body, "text/plain; charset=utf-8")
    }

    /// A JSON body serialized from `value`.
    pub fn json<T: Serialize + ?Sized>(status: StatusCode, value: &T) -> Result<Self, PipelineError> {
        let body = serde_json::to_vec(value)
            .map_err(|e| PipelineError::ResponseSendFailure(format!("serializing response: {}", e)))?;
        Ok(Self::bytes(status, body, "application/json"))
    }

    /// A chunked body produced incrementally.
    pub fn streaming(status: StatusCode, body: Body) -> Self {
        Self::new(status, Payload::Streaming(body))
    }

    /// A response relayed from a downstream call. Headers and framing pass through untouched.
    pub fn proxied(status: StatusCode, headers: HeaderMap, body: Body) -> Self {
        Self {
            status,
            headers,
            payload: Payload::Streaming(body),
            prevent_compression: true,
            content_type: None,
            pass_through_framing: true,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn set_status(&mut self, status: StatusCode) {
        self.status = status;
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// Set a header from strings.
    pub fn set_header(&mut self, name: &str, value: &str) -> Result<(), PipelineError> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| PipelineError::ResponseSendFailure(format!("invalid header name: {}", e)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| PipelineError::ResponseSendFailure(format!("invalid header value: {}", e)))?;
        self.headers.insert(name, value);
        Ok(())
    }

    /// Builder-style header setter for static values.
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn set_payload(&mut self, payload: Payload) {
        self.payload = payload;
    }

    /// Buffered body bytes, if the payload is in memory.
    pub fn buffered_body(&self) -> Option<&Bytes> {
        match &self.payload {
            Payload::Buffered(b) => Some(b),
            _ => None,
        }
    }

    pub fn prevent_compression(&self) -> bool {
        self.prevent_compression
    }

    pub fn set_prevent_compression(&mut self, prevent: bool) {
        self.prevent_compression = prevent;
    }

    /// Builder-style variant of [`set_prevent_compression`](Self::set_prevent_compression).
    pub fn without_compression(mut self) -> Self {
        self.prevent_compression = true;
        self
    }

    /// Desired content type; overrides any `Content-Type` header at send time.
    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn set_content_type(&mut self, content_type: impl Into<String>) {
        self.content_type = Some(content_type.into());
    }

    /// True when the response was relayed and its framing headers must be kept.
    pub fn is_pass_through(&self) -> bool {
        self.pass_through_framing
    }

    /// Effective content type: override first, then the header.
    pub fn effective_content_type(&self) -> Option<&str> {
        self.content_type
            .as_deref()
            .or_else(|| self.headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok()))
    }

    pub(crate) fn into_parts(self) -> (StatusCode, HeaderMap, Payload, ResponseFlags) {
        (
            self.status,
            self.headers,
            self.payload,
            ResponseFlags {
                prevent_compression: self.prevent_compression,
                content_type: self.content_type,
                pass_through_framing: self.pass_through_framing,
            },
        )
    }
}

/// Send-time flags split off from a consumed response.
#[derive(Debug, Clone)]
pub(crate) struct ResponseFlags {
    pub prevent_compression: bool,
    pub content_type: Option<String>,
    pub pass_through_framing: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_response_sets_content_type() {
        let response = ResponseInfo::json(StatusCode::CREATED, &serde_json::json!({"id": 1})).unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.effective_content_type(), Some("application/json"));
        assert_eq!(response.buffered_body().unwrap().as_ref(), br#"{"id":1}"#);
    }

    #[test]
    fn proxied_response_keeps_framing_and_skips_compression() {
        let mut headers = HeaderMap::new();
        headers.insert(http::header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        let response = ResponseInfo::proxied(StatusCode::OK, headers, Body::empty());
        assert!(response.is_pass_through());
        assert!(response.prevent_compression());
        assert!(response.headers().contains_key(http::header::TRANSFER_ENCODING));
    }

    #[test]
    fn override_wins_over_header() {
        let mut response = ResponseInfo::text(StatusCode::OK, "hi");
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("text/html"));
        response.set_content_type("text/csv");
        assert_eq!(response.effective_content_type(), Some("text/csv"));
    }

    #[test]
    fn rejects_invalid_header() {
        let mut response = ResponseInfo::empty(StatusCode::NO_CONTENT);
        assert!(response.set_header("bad header", "x").is_err());
        assert!(response.set_header("x-ok", "line\nbreak").is_err());
    }
}
