//! When responses get compressed.

use http::Response;
use tower_http::compression::predicate::{NotForContentType, Predicate, SizeAbove};

use crate::http::response::PreventCompression;

/// Compress responses above a size threshold unless the pipeline marked
/// them with [`PreventCompression`].
#[derive(Debug, Clone, Copy)]
pub struct CompressionPolicy {
    threshold: u16,
}

impl CompressionPolicy {
    pub fn new(threshold_bytes: u16) -> Self {
        Self {
            threshold: threshold_bytes,
        }
    }

    pub fn threshold(&self) -> u16 {
        self.threshold
    }
}

impl Predicate for CompressionPolicy {
    fn should_compress<B>(&self, response: &Response<B>) -> bool
    where
        B: http_body::Body,
    {
        if response.extensions().get::<PreventCompression>().is_some() {
            return false;
        }
        SizeAbove::new(self.threshold)
            .and(NotForContentType::GRPC)
            .and(NotForContentType::IMAGES)
            .and(NotForContentType::SSE)
            .should_compress(response)
    }
}
