//! Timeout enforcement.
//!
//! # Responsibilities
//! - Wrap endpoint and downstream calls with a deadline
//! - Track idle time between body chunks
//!
//! # Design Decisions
//! - Uses Tokio's timeout facilities
//! - Timeout errors are distinct from other errors and name what timed out
//! - Timed-out calls surface as 503 temporary service problems
//! - Dropping the wrapped future is the cancellation; nothing it produces later is observed

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::time::{Instant, Sleep};

use crate::error::{PipelineError, TimeoutKind};

/// Await `fut`, failing with a timeout error of `kind` after `after`.
pub async fn with_deadline<F: Future>(kind: TimeoutKind, after: Duration, fut: F) -> Result<F::Output, PipelineError> {
    tokio::time::timeout(after, fut).await.map_err(|_| {
        tracing::debug!(kind = %kind, timeout_ms = after.as_millis() as u64, "Deadline expired");
        PipelineError::Timeout { kind, after }
    })
}

/// A timer that fires when no progress is reported for `idle`.
///
/// Meant to be polled from inside `poll_frame` implementations.
#[derive(Debug)]
pub struct IdleDeadline {
    idle: Duration,
    sleep: Pin<Box<Sleep>>,
}

impl IdleDeadline {
    pub fn new(idle: Duration) -> Self {
        Self {
            idle,
            sleep: Box::pin(tokio::time::sleep(idle)),
        }
    }

    pub fn idle(&self) -> Duration {
        self.idle
    }

    /// Record progress, pushing the deadline out.
    pub fn reset(&mut self) {
        self.sleep.as_mut().reset(Instant::now() + self.idle);
    }

    /// Ready once the idle window has elapsed without a reset.
    pub fn poll_expired(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        self.sleep.as_mut().poll(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn deadline_passes_fast_futures() {
        let value = with_deadline(TimeoutKind::Endpoint, Duration::from_millis(100), async { 5 })
            .await
            .unwrap();
        assert_eq!(value, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_names_the_timeout() {
        let err = with_deadline(
            TimeoutKind::DownstreamConnect,
            Duration::from_millis(50),
            tokio::time::sleep(Duration::from_secs(10)),
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Timeout {
                kind: TimeoutKind::DownstreamConnect,
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_deadline_resets_on_progress() {
        let mut deadline = IdleDeadline::new(Duration::from_millis(100));
        tokio::time::advance(Duration::from_millis(80)).await;
        deadline.reset();
        tokio::time::advance(Duration::from_millis(80)).await;
        assert!(futures_util::poll!(futures_util::future::poll_fn(|cx| deadline.poll_expired(cx))).is_pending());
        tokio::time::advance(Duration::from_millis(30)).await;
        std::future::poll_fn(|cx| deadline.poll_expired(cx)).await;
    }
}
