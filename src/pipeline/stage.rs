//! The stage abstraction the request pipeline is built from.

use std::sync::Arc;

use futures_util::future::BoxFuture;

use crate::error::PipelineError;
use crate::http::response::ResponseInfo;
use crate::pipeline::exchange::Exchange;

/// What a stage decided.
#[derive(Debug)]
pub enum Outcome {
    /// Hand the exchange to the next stage.
    Continue,
    /// Skip every remaining request stage and send this response.
    ShortCircuit(ResponseInfo),
    /// Skip every remaining request stage and send the mapped error.
    Error(PipelineError),
}

impl From<Result<(), PipelineError>> for Outcome {
    fn from(result: Result<(), PipelineError>) -> Self {
        match result {
            Ok(()) => Outcome::Continue,
            Err(e) => Outcome::Error(e),
        }
    }
}

/// One step of request processing.
///
/// Stages run strictly in order on the connection's task. A stage that needs
/// to wait (body chunks, the worker pool, a downstream call) awaits inside
/// `process`; the next stage never starts before it resolves.
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;

    fn process<'a>(&'a self, exchange: &'a mut Exchange) -> BoxFuture<'a, Outcome>;
}

/// Application hook that may rearrange the stage list once, at startup.
pub trait PipelineHook: Send + Sync {
    fn on_pipeline_created(&self, stages: &mut Vec<Arc<dyn Stage>>);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn results_convert_to_outcomes() {
        assert!(matches!(Outcome::from(Ok(())), Outcome::Continue));
        assert!(matches!(
            Outcome::from(Err(PipelineError::MissingContent)),
            Outcome::Error(PipelineError::MissingContent)
        ));
    }
}
