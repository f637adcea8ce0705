//! Descriptions of a downstream call, produced by proxy router endpoints.

use http::header::HOST;
use http::uri::PathAndQuery;
use http::{HeaderMap, HeaderValue, Method, StatusCode, Uri};

use crate::error::PipelineError;
use crate::http::request::RequestInfo;

/// The request head sent downstream.
#[derive(Debug, Clone)]
pub struct DownstreamRequestHead {
    pub method: Method,
    /// Origin-form target: path plus optional query.
    pub path_and_query: PathAndQuery,
    /// Forwarded unchanged apart from `Host` and tracing headers.
    pub headers: HeaderMap,
}

impl DownstreamRequestHead {
    /// Copy the inbound head, keeping its framing headers so the body is
    /// relayed with the same transfer encoding.
    pub fn from_request(request: &RequestInfo) -> Self {
        let path_and_query = request
            .uri()
            .path_and_query()
            .cloned()
            .unwrap_or_else(|| PathAndQuery::from_static("/"));
        Self {
            method: request.method().clone(),
            path_and_query,
            headers: request.headers().clone(),
        }
    }

    /// Replace the path, keeping the query string.
    pub fn set_path(&mut self, path: &str) -> Result<(), PipelineError> {
        let target = match self.path_and_query.query() {
            Some(q) => format!("{}?{}", path, q),
            None => path.to_string(),
        };
        self.path_and_query = target
            .parse()
            .map_err(|e| PipelineError::Unhandled(format!("invalid downstream path '{}': {}", target, e)))?;
        Ok(())
    }
}

/// Where and how a proxy router endpoint wants the request forwarded.
#[derive(Debug, Clone)]
pub struct DownstreamRequestFirstChunkInfo {
    pub host: String,
    pub port: u16,
    pub is_https: bool,
    pub first_chunk: DownstreamRequestHead,
    /// Attach the current trace context as B3 headers.
    pub add_tracing_headers: bool,
    /// Wrap the call in a child span.
    pub perform_subspan: bool,
    pub relaxed_https_validation: bool,
}

impl DownstreamRequestFirstChunkInfo {
    pub fn new(host: impl Into<String>, port: u16, is_https: bool, first_chunk: DownstreamRequestHead) -> Self {
        Self {
            host: host.into(),
            port,
            is_https,
            first_chunk,
            add_tracing_headers: true,
            perform_subspan: true,
            relaxed_https_validation: false,
        }
    }

    /// Forward `request` as-is to `host:port`.
    pub fn forward(request: &RequestInfo, host: impl Into<String>, port: u16, is_https: bool) -> Self {
        Self::new(host, port, is_https, DownstreamRequestHead::from_request(request))
    }

    pub fn with_tracing_headers(mut self, add: bool) -> Self {
        self.add_tracing_headers = add;
        self
    }

    pub fn with_subspan(mut self, subspan: bool) -> Self {
        self.perform_subspan = subspan;
        self
    }

    pub fn with_relaxed_https_validation(mut self, relaxed: bool) -> Self {
        self.relaxed_https_validation = relaxed;
        self
    }

    /// `Host` header value for the target, omitting default ports.
    pub fn host_header(&self) -> Result<HeaderValue, PipelineError> {
        let default_port = if self.is_https { 443 } else { 80 };
        let value = if self.port == default_port {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        };
        HeaderValue::from_str(&value)
            .map_err(|e| PipelineError::Unhandled(format!("invalid downstream host '{}': {}", value, e)))
    }

    /// Build the outbound request head: origin-form URI and rewritten `Host`.
    pub(crate) fn outbound_parts(&self) -> Result<(Method, Uri, HeaderMap), PipelineError> {
        let uri = Uri::from(self.first_chunk.path_and_query.clone());
        let mut headers = self.first_chunk.headers.clone();
        headers.insert(HOST, self.host_header()?);
        Ok((self.first_chunk.method.clone(), uri, headers))
    }
}

/// Status and headers of the downstream response, before any body is relayed.
#[derive(Debug, Clone)]
pub struct DownstreamResponseHead {
    pub status: StatusCode,
    pub headers: HeaderMap,
}
