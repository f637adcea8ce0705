//! Streaming bodies for proxied calls.
//!
//! [`UploadBody`] relays the caller's request body downstream chunk by chunk;
//! [`DownstreamBody`] relays the downstream response body back. Neither
//! buffers: each frame is passed on as soon as it is polled. Both enforce an
//! idle timeout between chunks and stop when the call is cancelled.

use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use axum::body::Body;
use bytes::Bytes;
use http_body::{Body as HttpBody, Frame, SizeHint};
use hyper::body::Incoming;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

use crate::observability::tracing::{Annotation, SpanHandle};
use crate::proxy::error::ProxyError;
use crate::proxy::pool::ConnectionLease;
use crate::resilience::timeouts::IdleDeadline;

/// Why an upload stopped early.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadFailure {
    /// The caller stopped sending before the last chunk.
    Incomplete(Duration),
    /// The body crossed the size limit.
    TooLarge(usize),
    Cancelled,
    /// Reading the caller's body failed.
    Inbound(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum UploadPhase {
    Streaming,
    Complete,
    Failed(UploadFailure),
}

/// Progress of an upload, shared between the body and the proxy client.
#[derive(Debug)]
pub struct UploadState {
    phase: Mutex<UploadPhase>,
    last_progress: Mutex<Instant>,
}

impl Default for UploadState {
    fn default() -> Self {
        Self::new()
    }
}

impl UploadState {
    pub fn new() -> Self {
        Self {
            phase: Mutex::new(UploadPhase::Streaming),
            last_progress: Mutex::new(Instant::now()),
        }
    }

    pub fn mark_complete(&self) {
        if let Ok(mut phase) = self.phase.lock() {
            if *phase == UploadPhase::Streaming {
                *phase = UploadPhase::Complete;
            }
        }
    }

    fn fail(&self, failure: UploadFailure) {
        if let Ok(mut phase) = self.phase.lock() {
            if *phase == UploadPhase::Streaming {
                *phase = UploadPhase::Failed(failure);
            }
        }
    }

    pub fn is_complete(&self) -> bool {
        self.phase
            .lock()
            .map(|phase| *phase == UploadPhase::Complete)
            .unwrap_or(false)
    }

    pub fn failure(&self) -> Option<UploadFailure> {
        match self.phase.lock().ok()?.clone() {
            UploadPhase::Failed(failure) => Some(failure),
            _ => None,
        }
    }

    fn touch(&self) {
        if let Ok(mut at) = self.last_progress.lock() {
            *at = Instant::now();
        }
    }

    /// When the last chunk went downstream.
    pub fn last_progress(&self) -> Instant {
        self.last_progress
            .lock()
            .map(|at| *at)
            .unwrap_or_else(|_| Instant::now())
    }
}

/// The caller's request body on its way downstream.
pub struct UploadBody {
    inner: Body,
    state: std::sync::Arc<UploadState>,
    received: usize,
    max_size: Option<usize>,
    idle: IdleDeadline,
    cancel: Pin<Box<WaitForCancellationFutureOwned>>,
    done: bool,
}

impl UploadBody {
    pub fn new(
        inner: Body,
        state: std::sync::Arc<UploadState>,
        max_size: Option<usize>,
        idle_timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            inner,
            state,
            received: 0,
            max_size,
            idle: IdleDeadline::new(idle_timeout),
            cancel: Box::pin(cancel.cancelled_owned()),
            done: false,
        }
    }

    fn fail(&mut self, failure: UploadFailure) -> ProxyError {
        self.done = true;
        let err = ProxyError::Upload(format!("{:?}", failure));
        self.state.fail(failure);
        err
    }
}

impl HttpBody for UploadBody {
    type Data = Bytes;
    type Error = ProxyError;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = &mut *self;
        if this.done {
            return Poll::Ready(None);
        }
        if this.cancel.as_mut().poll(cx).is_ready() {
            return Poll::Ready(Some(Err(this.fail(UploadFailure::Cancelled))));
        }

        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    this.received += data.len();
                    if let Some(max) = this.max_size.filter(|max| this.received > *max) {
                        return Poll::Ready(Some(Err(this.fail(UploadFailure::TooLarge(max)))));
                    }
                }
                this.idle.reset();
                this.state.touch();
                if this.inner.is_end_stream() {
                    this.state.mark_complete();
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(Some(Err(e))) => Poll::Ready(Some(Err(this.fail(UploadFailure::Inbound(e.to_string()))))),
            Poll::Ready(None) => {
                this.done = true;
                this.state.mark_complete();
                Poll::Ready(None)
            }
            Poll::Pending => {
                if this.idle.poll_expired(cx).is_ready() {
                    let idle = this.idle.idle();
                    tracing::debug!(
                        received = this.received,
                        idle_ms = idle.as_millis() as u64,
                        "Upload stalled before the last chunk"
                    );
                    return Poll::Ready(Some(Err(this.fail(UploadFailure::Incomplete(idle)))));
                }
                Poll::Pending
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        let end = self.done || self.inner.is_end_stream();
        if end {
            self.state.mark_complete();
        }
        end
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

/// The downstream response body on its way back to the caller.
///
/// When `owns_span` is set, `span` is the call's child span and is completed
/// here, however the body ends.
pub struct DownstreamBody {
    inner: Incoming,
    lease: ConnectionLease,
    idle: IdleDeadline,
    cancel: Pin<Box<WaitForCancellationFutureOwned>>,
    span: SpanHandle,
    owns_span: bool,
    done: bool,
}

impl DownstreamBody {
    pub(crate) fn new(
        inner: Incoming,
        lease: ConnectionLease,
        idle_timeout: Duration,
        cancel: CancellationToken,
        span: SpanHandle,
        owns_span: bool,
    ) -> Self {
        let mut body = Self {
            inner,
            lease,
            idle: IdleDeadline::new(idle_timeout),
            cancel: Box::pin(cancel.cancelled_owned()),
            span,
            owns_span,
            done: false,
        };
        if body.inner.is_end_stream() {
            body.complete();
        }
        body
    }

    fn complete(&mut self) {
        if !self.done {
            self.done = true;
            self.span.annotate(Annotation::DownstreamComplete);
            self.lease.finish();
            self.close_span();
        }
    }

    fn abort(&mut self) {
        self.done = true;
        self.lease.evict();
        if self.owns_span {
            self.span.annotate(Annotation::Error);
            self.close_span();
        }
    }

    fn close_span(&self) {
        if self.owns_span {
            self.span.complete();
        }
    }
}

impl Drop for DownstreamBody {
    fn drop(&mut self) {
        // The caller went away mid-body.
        if !self.done {
            self.abort();
        }
    }
}

impl HttpBody for DownstreamBody {
    type Data = Bytes;
    type Error = ProxyError;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = &mut *self;
        if this.done {
            return Poll::Ready(None);
        }
        if this.cancel.as_mut().poll(cx).is_ready() {
            this.abort();
            return Poll::Ready(Some(Err(ProxyError::Cancelled)));
        }

        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                this.idle.reset();
                if this.inner.is_end_stream() {
                    this.complete();
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(Some(Err(e))) => {
                tracing::debug!(error = %e, "Downstream response body failed");
                this.abort();
                Poll::Ready(Some(Err(ProxyError::Request(e))))
            }
            Poll::Ready(None) => {
                this.complete();
                Poll::Ready(None)
            }
            Poll::Pending => {
                if this.idle.poll_expired(cx).is_ready() {
                    this.abort();
                    return Poll::Ready(Some(Err(ProxyError::IdleTimeout(this.idle.idle()))));
                }
                Poll::Pending
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.done || self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use std::sync::Arc;

    #[tokio::test]
    async fn upload_completes_when_body_ends() {
        let state = Arc::new(UploadState::new());
        let body = UploadBody::new(
            Body::from("abc"),
            state.clone(),
            None,
            Duration::from_secs(1),
            CancellationToken::new(),
        );
        let bytes = body.collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], b"abc");
        assert!(state.is_complete());
    }

    #[tokio::test]
    async fn upload_over_limit_fails() {
        let state = Arc::new(UploadState::new());
        let body = UploadBody::new(
            Body::from("abcdef"),
            state.clone(),
            Some(3),
            Duration::from_secs(1),
            CancellationToken::new(),
        );
        assert!(body.collect().await.is_err());
        assert_eq!(state.failure(), Some(UploadFailure::TooLarge(3)));
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_upload_times_out() {
        let (tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes, std::io::Error>>(1);
        let stream = futures_util::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) });
        let state = Arc::new(UploadState::new());
        let body = UploadBody::new(
            Body::from_stream(stream),
            state.clone(),
            None,
            Duration::from_millis(100),
            CancellationToken::new(),
        );
        tx.send(Ok(Bytes::from_static(b"first"))).await.unwrap();
        assert!(body.collect().await.is_err());
        assert_eq!(state.failure(), Some(UploadFailure::Incomplete(Duration::from_millis(100))));
        drop(tx);
    }

    #[tokio::test]
    async fn cancelled_upload_fails() {
        let cancel = CancellationToken::new();
        let (_tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes, std::io::Error>>(1);
        let stream = futures_util::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) });
        let state = Arc::new(UploadState::new());
        let body = UploadBody::new(Body::from_stream(stream), state.clone(), None, Duration::from_secs(5), cancel.clone());
        cancel.cancel();
        assert!(body.collect().await.is_err());
        assert_eq!(state.failure(), Some(UploadFailure::Cancelled));
        assert!(!state.is_complete());
    }
}
