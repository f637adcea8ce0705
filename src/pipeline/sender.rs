//! Turning a [`ResponseInfo`] into the response hyper writes.
//!
//! # Responsibilities
//! - Apply the framing rules for bodiless statuses and HEAD requests
//! - Set `Content-Length` for buffered bodies, leave streaming framing to the connection
//! - Keep proxied framing headers exactly as the downstream sent them
//! - Stamp the trace id header and record the outcome on the finalizer
//! - Fall back to a fixed 500 when the response itself cannot be built
//!
//! # Design Decisions
//! - The sender consumes the response, so a request can never be answered twice
//! - The finalizer moves into the body; the body decides sent vs. write failure

use axum::body::Body;
use bytes::Bytes;
use http::header::{HeaderValue, CONTENT_LENGTH, CONTENT_TYPE, TRANSFER_ENCODING};
use http::{HeaderMap, Method, Response, StatusCode};

use crate::error::{ErrorEntry, ErrorResponseBody, PipelineError, ERROR_UID_HEADER};
use crate::http::body::CompletionBody;
use crate::http::response::{Payload, PreventCompression, ResponseInfo};
use crate::observability::tracing::{Annotation, SpanHandle, TRACE_ID_HEADER};
use crate::pipeline::finalizer::FinalizerHandle;

/// The response could not be produced at all; the connection must be closed.
#[derive(Debug, thiserror::Error)]
#[error("response could not be sent: {0}")]
pub struct ConnectionAbort(pub String);

/// Statuses that never carry a body.
fn forbids_body(status: StatusCode) -> bool {
    status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::RESET_CONTENT
        || status == StatusCode::NOT_MODIFIED
}

fn set_content_length(headers: &mut HeaderMap, len: u64) {
    headers.insert(CONTENT_LENGTH, HeaderValue::from(len));
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

/// Builds outgoing responses.
#[derive(Debug, Clone, Default)]
pub struct ResponseSender;

impl ResponseSender {
    pub fn new() -> Self {
        Self
    }

    /// Send `response` for a request made with `method`.
    ///
    /// Falls back to the last-ditch 500 if the response cannot be built, and
    /// only fails if that fails too.
    pub fn send(
        &self,
        response: ResponseInfo,
        method: &Method,
        span: &SpanHandle,
        finalizer: &mut FinalizerHandle,
    ) -> Result<Response<CompletionBody>, ConnectionAbort> {
        span.annotate(Annotation::WireSendStart);
        match self.build(response, method, span, finalizer) {
            Ok(response) => Ok(response),
            Err(e) => {
                tracing::error!(error = %e, "Failed to build response, sending last-ditch error");
                if let Some(finalizer) = finalizer.get() {
                    finalizer.record_error(&e.to_string());
                }
                let fallback = last_ditch_response().map_err(|e| {
                    tracing::error!(error = %e, "Last-ditch response failed, closing connection");
                    ConnectionAbort(e.to_string())
                })?;
                self.build(fallback, method, span, finalizer)
                    .map_err(|e| ConnectionAbort(e.to_string()))
            }
        }
    }

    fn build(
        &self,
        response: ResponseInfo,
        method: &Method,
        span: &SpanHandle,
        finalizer: &mut FinalizerHandle,
    ) -> Result<Response<CompletionBody>, PipelineError> {
        let (status, mut headers, payload, flags) = response.into_parts();

        if let Some(content_type) = &flags.content_type {
            let value = HeaderValue::from_str(content_type)
                .map_err(|e| PipelineError::ResponseSendFailure(format!("invalid content type: {}", e)))?;
            headers.insert(CONTENT_TYPE, value);
        }

        let body = if forbids_body(status) || *method == Method::HEAD {
            headers.remove(TRANSFER_ENCODING);
            if status.is_informational() || status == StatusCode::NO_CONTENT {
                headers.remove(CONTENT_LENGTH);
            } else if status == StatusCode::RESET_CONTENT {
                set_content_length(&mut headers, 0);
            } else if let (Payload::Buffered(bytes), false) = (&payload, headers.contains_key(CONTENT_LENGTH)) {
                // HEAD advertises the length the GET would have had.
                set_content_length(&mut headers, bytes.len() as u64);
            }
            Body::empty()
        } else {
            match payload {
                Payload::Empty => {
                    if !flags.pass_through_framing {
                        headers.remove(TRANSFER_ENCODING);
                        set_content_length(&mut headers, 0);
                    }
                    Body::empty()
                }
                Payload::Buffered(bytes) => {
                    headers.remove(TRANSFER_ENCODING);
                    set_content_length(&mut headers, bytes.len() as u64);
                    Body::from(bytes)
                }
                Payload::Streaming(body) => {
                    if !flags.pass_through_framing {
                        headers.remove(CONTENT_LENGTH);
                        headers.remove(TRANSFER_ENCODING);
                    }
                    body
                }
            }
        };

        let trace_id = HeaderValue::from_str(&span.context().trace_id)
            .map_err(|e| PipelineError::ResponseSendFailure(format!("invalid trace id: {}", e)))?;
        headers.insert(TRACE_ID_HEADER, trace_id);

        if let Some(finalizer) = finalizer.get() {
            let error_uid = headers
                .get(ERROR_UID_HEADER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            finalizer.record_response(status.as_u16(), content_length(&headers), error_uid);
        }

        let mut out = Response::new(CompletionBody::new(body, finalizer.take()));
        *out.status_mut() = status;
        *out.headers_mut() = headers;
        if flags.prevent_compression {
            out.extensions_mut().insert(PreventCompression);
        }
        Ok(out)
    }
}

/// Fixed 500 used when the real response cannot be built.
fn last_ditch_response() -> Result<ResponseInfo, PipelineError> {
    let error_id = uuid::Uuid::new_v4().to_string();
    let body = ErrorResponseBody {
        error_id: error_id.clone(),
        errors: vec![ErrorEntry {
            code: "GENERIC_SERVICE_ERROR".to_string(),
            message: "An error occurred while fulfilling the request".to_string(),
            metadata: Default::default(),
        }],
    };
    let bytes = serde_json::to_vec(&body)
        .map_err(|e| PipelineError::ResponseSendFailure(format!("serializing last-ditch response: {}", e)))?;
    let mut response = ResponseInfo::bytes(StatusCode::INTERNAL_SERVER_ERROR, Bytes::from(bytes), "application/json");
    response.set_header(ERROR_UID_HEADER, &error_id)?;
    Ok(response)
}
