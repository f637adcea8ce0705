//! Request payload decompression.
//!
//! Bodies sent with a `Content-Encoding` are inflated after assembly, before
//! deserialization, for direct endpoints that allow it. Proxied bodies are
//! always relayed as received. The request size limit applies to the
//! inflated bytes; inflation stops as soon as the limit is crossed.

use bytes::Bytes;
use futures_util::future::BoxFuture;
use http::header::CONTENT_ENCODING;
use http::{HeaderValue, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use tower::ServiceExt;
use tower_http::decompression::{DecompressionBody, RequestDecompression};

use crate::error::PipelineError;
use crate::http::body::BoxError;

/// Inflates an assembled request body.
pub trait PayloadDecompressor: Send + Sync {
    /// Whether `encoding` (already lowercased) can be handled.
    fn supports(&self, encoding: &str) -> bool;

    /// Inflate `payload`, failing with a too-large error once more than
    /// `max` bytes come out. `None` means unbounded.
    fn decompress<'a>(
        &'a self,
        encoding: &'a str,
        payload: Bytes,
        max: Option<usize>,
    ) -> BoxFuture<'a, Result<Bytes, PipelineError>>;
}

/// gzip and deflate through tower-http's request decompression.
#[derive(Debug, Default, Clone, Copy)]
pub struct HttpPayloadDecompressor;

impl PayloadDecompressor for HttpPayloadDecompressor {
    fn supports(&self, encoding: &str) -> bool {
        matches!(encoding, "gzip" | "x-gzip" | "deflate")
    }

    fn decompress<'a>(
        &'a self,
        encoding: &'a str,
        payload: Bytes,
        max: Option<usize>,
    ) -> BoxFuture<'a, Result<Bytes, PipelineError>> {
        Box::pin(async move {
            let encoding = if encoding == "x-gzip" { "gzip" } else { encoding };
            let mut request = Request::new(Full::new(payload));
            let value = HeaderValue::from_str(encoding)
                .map_err(|_| PipelineError::malformed("Invalid Content-Encoding header"))?;
            request.headers_mut().insert(CONTENT_ENCODING, value);

            let inflate = tower::service_fn(move |req: Request<DecompressionBody<Full<Bytes>>>| async move {
                let body = req.into_body();
                let inflated = match max {
                    Some(max) => Limited::new(body, max).collect().await?.to_bytes(),
                    None => body.collect().await?.to_bytes(),
                };
                Ok::<_, BoxError>(Response::new(Full::new(inflated)))
            });

            let response = RequestDecompression::new(inflate)
                .oneshot(request)
                .await
                .map_err(|e| {
                    if let (Some(max), true) = (max, e.is::<LengthLimitError>()) {
                        tracing::debug!(encoding, max, "Inflated request payload exceeds the size limit");
                        return PipelineError::request_too_large(max);
                    }
                    PipelineError::malformed("Unable to decompress request payload")
                        .with_metadata("content_encoding", encoding)
                        .with_metadata("reason", e.to_string())
                })?;

            if response.status() == StatusCode::UNSUPPORTED_MEDIA_TYPE {
                return Err(PipelineError::malformed("Unsupported Content-Encoding")
                    .with_metadata("content_encoding", encoding));
            }

            let bytes = response
                .into_body()
                .collect()
                .await
                .map_err(|e| PipelineError::Unhandled(format!("collecting inflated payload: {}", e)))?
                .to_bytes();
            Ok(bytes)
        })
    }
}
