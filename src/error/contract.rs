//! Serializable error contract and the kind → status mapping.

use http::StatusCode;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Metadata, PipelineError};
use crate::http::response::ResponseInfo;

/// Response header echoing the `error_id` of an error body.
pub const ERROR_UID_HEADER: &str = "error_uid";

/// One error as the client sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiError {
    pub code: &'static str,
    pub message: String,
    pub status: StatusCode,
    pub metadata: Metadata,
}

impl ApiError {
    fn new(code: &'static str, message: impl Into<String>, status: StatusCode) -> Self {
        Self {
            code,
            message: message.into(),
            status,
            metadata: Metadata::new(),
        }
    }

    fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Wire form of a single error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEntry {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Metadata::is_empty")]
    pub metadata: Metadata,
}

/// Wire form of an error response: `{error_id, errors:[...]}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponseBody {
    pub error_id: String,
    pub errors: Vec<ErrorEntry>,
}

/// Maps [`PipelineError`]s to API errors and error responses.
#[derive(Debug, Clone, Default)]
pub struct ErrorMapper;

impl ErrorMapper {
    pub fn new() -> Self {
        Self
    }

    /// The client-visible errors for a pipeline failure. Never empty.
    pub fn api_errors(&self, err: &PipelineError) -> Vec<ApiError> {
        match err {
            PipelineError::MalformedRequest { metadata, .. } => vec![ApiError::new(
                "MALFORMED_REQUEST",
                "Malformed request",
                StatusCode::BAD_REQUEST,
            )
            .with_metadata(metadata.clone())],
            PipelineError::Unauthorized(_) => vec![ApiError::new(
                "UNAUTHORIZED",
                "Unauthorized access",
                StatusCode::UNAUTHORIZED,
            )],
            PipelineError::Forbidden(_) => vec![ApiError::new(
                "FORBIDDEN",
                "Forbidden access",
                StatusCode::FORBIDDEN,
            )],
            PipelineError::InvalidContent(violations) if !violations.is_empty() => violations
                .iter()
                .map(|v| {
                    let mut metadata = Metadata::new();
                    metadata.insert("field".into(), serde_json::Value::String(v.field.clone()));
                    metadata.insert("constraint".into(), serde_json::Value::String(v.code.clone()));
                    ApiError::new("INVALID_CONTENT", v.message.clone(), StatusCode::BAD_REQUEST)
                        .with_metadata(metadata)
                })
                .collect(),
            PipelineError::InvalidContent(_) => vec![ApiError::new(
                "INVALID_CONTENT",
                "Request content failed validation",
                StatusCode::BAD_REQUEST,
            )],
            PipelineError::MissingContent => vec![ApiError::new(
                "MISSING_EXPECTED_CONTENT",
                "Missing expected content",
                StatusCode::BAD_REQUEST,
            )],
            PipelineError::NotFound { .. } => vec![ApiError::new(
                "NOT_FOUND",
                "The requested resource was not found",
                StatusCode::NOT_FOUND,
            )],
            PipelineError::MethodNotAllowed { .. } => vec![ApiError::new(
                "METHOD_NOT_ALLOWED",
                "Http Request method not allowed for this resource",
                StatusCode::METHOD_NOT_ALLOWED,
            )],
            PipelineError::Timeout { kind, after } => {
                let mut metadata = Metadata::new();
                metadata.insert("cause".into(), serde_json::Value::String(format!("{} timed out", kind)));
                metadata.insert("timeout_millis".into(), serde_json::Value::from(after.as_millis() as u64));
                vec![ApiError::new(
                    "TEMPORARY_SERVICE_PROBLEM",
                    "A temporary service problem occurred",
                    StatusCode::SERVICE_UNAVAILABLE,
                )
                .with_metadata(metadata)]
            }
            PipelineError::DownstreamFailure(_) => vec![ApiError::new(
                "TEMPORARY_SERVICE_PROBLEM",
                "A temporary service problem occurred",
                StatusCode::SERVICE_UNAVAILABLE,
            )],
            PipelineError::ResponseSendFailure(_) | PipelineError::Unhandled(_) => vec![ApiError::new(
                "GENERIC_SERVICE_ERROR",
                "An error occurred while fulfilling the request",
                StatusCode::INTERNAL_SERVER_ERROR,
            )],
        }
    }

    /// Status code for an error. Multi-error responses take the first entry's status.
    pub fn status(&self, err: &PipelineError) -> StatusCode {
        self.api_errors(err)
            .first()
            .map(|e| e.status)
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }

    /// Build the wire body with a fresh `error_id`.
    pub fn body(&self, err: &PipelineError) -> ErrorResponseBody {
        ErrorResponseBody {
            error_id: Uuid::new_v4().to_string(),
            errors: self
                .api_errors(err)
                .into_iter()
                .map(|e| ErrorEntry {
                    code: e.code.to_string(),
                    message: e.message,
                    metadata: e.metadata,
                })
                .collect(),
        }
    }

    /// Convert an error into a JSON response carrying the `error_uid` header.
    pub fn to_response(&self, err: &PipelineError) -> Result<ResponseInfo, PipelineError> {
        let status = self.status(err);
        let body = self.body(err);

        if status.is_server_error() {
            tracing::error!(error_id = %body.error_id, kind = err.kind(), error = %err, "Request failed");
        } else {
            tracing::warn!(error_id = %body.error_id, kind = err.kind(), error = %err, "Request rejected");
        }

        let mut response = ResponseInfo::json(status, &body)?;
        response.set_header(ERROR_UID_HEADER, &body.error_id)?;
        Ok(response)
    }
}
