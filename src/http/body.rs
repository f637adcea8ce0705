//! Response body wrapper that drives finalization.
//!
//! The connection polls this body while writing. Reaching the end of the
//! stream finalizes the request as sent; an error, or being dropped before
//! the end, finalizes it as a failed write.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use bytes::Bytes;
use http_body::{Body as HttpBody, Frame, SizeHint};

use crate::pipeline::finalizer::{RequestFinalizer, SendOutcome};

/// Boxed error type used by body wrappers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// The body type handed to the connection for every response.
pub struct CompletionBody {
    inner: Body,
    finalizer: Option<Arc<RequestFinalizer>>,
}

impl CompletionBody {
    pub fn new(inner: Body, finalizer: Option<Arc<RequestFinalizer>>) -> Self {
        Self { inner, finalizer }
    }

    fn finish(&mut self, outcome: SendOutcome) {
        if let Some(finalizer) = self.finalizer.take() {
            finalizer.finalize(outcome);
        }
    }
}

impl HttpBody for CompletionBody {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = &mut *self;
        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(None) => {
                this.finish(SendOutcome::Sent);
                Poll::Ready(None)
            }
            Poll::Ready(Some(Err(e))) => {
                tracing::debug!(error = %e, "Response body failed mid-stream");
                this.finish(SendOutcome::WriteFailed);
                Poll::Ready(Some(Err(e)))
            }
            other => other,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl Drop for CompletionBody {
    fn drop(&mut self) {
        let outcome = if self.inner.is_end_stream() {
            SendOutcome::Sent
        } else {
            SendOutcome::WriteFailed
        };
        self.finish(outcome);
    }
}
