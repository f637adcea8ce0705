//! Pre-execution work: security validation, deserialization and content validation.
//!
//! # Responsibilities
//! - Run the security validator for endpoints it protects
//! - Reject empty bodies for endpoints that require content
//! - Deserialize the assembled body and validate the result
//!
//! # Design Decisions
//! - A validator fast enough for inline execution runs on the request head,
//!   right after routing and before any body is read. A slow one is deferred
//!   into the work chain and runs ahead of deserialization
//! - The whole chain is one pure function of the request, so it can run
//!   inline or be moved to the worker pool unchanged
//! - Results come back as a [`WorkChainResult`] and are applied to the request
//!   on the connection's task; the pipeline resumes right after
//! - Proxied requests only get the security step; their body is never read

use std::sync::Arc;

use futures_util::future::BoxFuture;

use crate::endpoint::Endpoint;
use crate::error::PipelineError;
use crate::http::request::{Content, RequestInfo};
use crate::pipeline::exchange::Exchange;
use crate::pipeline::stage::{Outcome, Stage};
use crate::pipeline::worker_pool::WorkerPool;
use crate::security::{should_validate, RequestSecurityValidator};
use crate::validation::ContentValidator;

/// Attribute set on requests that passed security validation.
pub const SECURITY_VALIDATED_ATTRIBUTE: &str = "security.validated";

/// What the chain produced, applied to the request afterwards.
#[derive(Default)]
pub struct WorkChainResult {
    pub security_validated: bool,
    /// `Some` when deserialization ran.
    pub content: Option<Option<Content>>,
    pub content_validated: bool,
}

impl std::fmt::Debug for WorkChainResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkChainResult")
            .field("security_validated", &self.security_validated)
            .field("deserialized", &self.content.is_some())
            .field("content_validated", &self.content_validated)
            .finish()
    }
}

#[derive(Clone)]
struct Validators {
    security: Option<Arc<dyn RequestSecurityValidator>>,
    content: Option<Arc<dyn ContentValidator>>,
}

impl Validators {
    fn run(&self, request: &RequestInfo, endpoint: &Endpoint) -> Result<WorkChainResult, PipelineError> {
        let mut result = WorkChainResult::default();

        if let Some(security) = self.deferred_security(endpoint) {
            security.validate(request, endpoint)?;
            result.security_validated = true;
        }

        let Endpoint::Direct(direct) = endpoint else {
            return Ok(result);
        };

        if direct.requires_content() && request.raw_content_len() == 0 {
            return Err(PipelineError::MissingContent);
        }

        if let Some(deserializer) = direct.content_deserializer() {
            if !request.is_content_deserialized() {
                let content = deserializer.deserialize(request.raw_content_bytes())?;
                tracing::trace!(
                    content_type = deserializer.content_type_name(),
                    present = content.is_some(),
                    "Request content deserialized"
                );
                result.content = Some(content);
            }
        }

        let content = match &result.content {
            Some(content) => content.as_ref(),
            None => request.content_erased(),
        };
        if let (Some(validator), Some(content)) = (&self.content, content) {
            if direct.validate_content() && !request.is_content_validated() {
                validator
                    .validate(request, &**content)
                    .map_err(PipelineError::InvalidContent)?;
                result.content_validated = true;
            }
        }

        Ok(result)
    }

    /// The security validator, when it protects `endpoint` but is too slow to
    /// have run on the request head.
    fn deferred_security(&self, endpoint: &Endpoint) -> Option<&dyn RequestSecurityValidator> {
        self.security
            .as_deref()
            .filter(|v| should_validate(*v, endpoint) && !v.is_fast_enough_for_inline_execution())
    }

    fn needs_worker_pool(&self, endpoint: &Endpoint) -> bool {
        let security_slow = self.deferred_security(endpoint).is_some();
        match endpoint {
            Endpoint::ProxyRouter(_) => security_slow,
            Endpoint::Direct(direct) => {
                let content_slow = direct.validate_content()
                    && direct.content_deserializer().is_some()
                    && self
                        .content
                        .as_ref()
                        .map_or(false, |v| !v.is_fast_enough_for_inline_execution());
                direct.should_validate_asynchronously() || security_slow || content_slow
            }
        }
    }
}

/// Applies a chain result to the request.
fn apply(exchange: &mut Exchange, result: WorkChainResult) {
    let request = exchange.request_mut();
    if result.security_validated {
        request.set_attribute(SECURITY_VALIDATED_ATTRIBUTE, serde_json::Value::Bool(true));
    }
    if let Some(content) = result.content {
        request.set_content(content);
    }
    if result.content_validated {
        request.mark_content_validated();
    }
}

/// Validates the request head for endpoints the security validator protects.
///
/// Only fast validators run here; slow ones are left to [`WorkChainStage`].
pub struct SecurityValidationStage {
    validator: Option<Arc<dyn RequestSecurityValidator>>,
}

impl SecurityValidationStage {
    pub fn new(validator: Option<Arc<dyn RequestSecurityValidator>>) -> Self {
        Self { validator }
    }
}

impl Stage for SecurityValidationStage {
    fn name(&self) -> &'static str {
        "security_validation"
    }

    fn process<'a>(&'a self, exchange: &'a mut Exchange) -> BoxFuture<'a, Outcome> {
        Box::pin(async move {
            let Some(validator) = self.validator.as_deref() else {
                return Outcome::Continue;
            };
            let Some(endpoint) = exchange.endpoint.as_ref().map(|m| m.endpoint.clone()) else {
                return Outcome::Error(PipelineError::Unhandled("security validation ran before routing".into()));
            };
            if !should_validate(validator, &endpoint) || !validator.is_fast_enough_for_inline_execution() {
                return Outcome::Continue;
            }

            tracing::debug!(endpoint = endpoint.name(), "Validating request security");
            if let Err(e) = validator.validate(exchange.request(), &endpoint) {
                return Outcome::Error(e);
            }
            exchange
                .request_mut()
                .set_attribute(SECURITY_VALIDATED_ATTRIBUTE, serde_json::Value::Bool(true));
            Outcome::Continue
        })
    }
}

pub struct WorkChainStage {
    validators: Validators,
    pool: WorkerPool,
}

impl WorkChainStage {
    pub fn new(
        security: Option<Arc<dyn RequestSecurityValidator>>,
        content: Option<Arc<dyn ContentValidator>>,
        pool: WorkerPool,
    ) -> Self {
        Self {
            validators: Validators { security, content },
            pool,
        }
    }

    async fn run(&self, request: Arc<RequestInfo>, endpoint: Endpoint) -> Result<WorkChainResult, PipelineError> {
        if !self.validators.needs_worker_pool(&endpoint) {
            return self.validators.run(&request, &endpoint);
        }

        tracing::trace!(endpoint = endpoint.name(), "Running work chain on the worker pool");
        let validators = self.validators.clone();
        self.pool
            .run_blocking(move || validators.run(&request, &endpoint))
            .await?
    }
}

impl Stage for WorkChainStage {
    fn name(&self) -> &'static str {
        "work_chain"
    }

    fn process<'a>(&'a self, exchange: &'a mut Exchange) -> BoxFuture<'a, Outcome> {
        Box::pin(async move {
            let Some(endpoint) = exchange.endpoint.as_ref().map(|m| m.endpoint.clone()) else {
                return Outcome::Error(PipelineError::Unhandled("work chain ran before routing".into()));
            };
            match self.run(exchange.request_arc(), endpoint).await {
                Ok(result) => {
                    apply(exchange, result);
                    Outcome::Continue
                }
                Err(e) => Outcome::Error(e),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::HandlerEndpoint;
    use crate::error::FieldViolation;
    use crate::http::response::ResponseInfo;
    use crate::net::ConnectionContext;
    use crate::observability::tracing::{LoggingSpanSink, SpanHandle, SpanPolicy, TraceContext};
    use crate::pipeline::finalizer::{FinalizerHandle, FinalizerSinks, RequestFinalizer};
    use crate::routing::{MatchedEndpoint, Matcher};
    use crate::security::BasicAuthSecurityValidator;
    use crate::validation::{JsonContent, Validate, ValidatorRegistry};
    use axum::body::Body;
    use bytes::Bytes;
    use http::{HeaderMap, Method, StatusCode, Version};
    use serde::Deserialize;
    use std::collections::HashMap;

    #[derive(Debug, Deserialize)]
    struct Signup {
        name: String,
    }

    impl Validate for Signup {
        fn validate(&self) -> Vec<FieldViolation> {
            if self.name.is_empty() {
                vec![FieldViolation::new("name", "NOT_BLANK", "name is required")]
            } else {
                Vec::new()
            }
        }
    }

    fn endpoint(asynchronous: bool) -> Endpoint {
        let endpoint = HandlerEndpoint::new("signup", Matcher::single("/signup").unwrap(), |_req, _ctx| async {
            Ok(ResponseInfo::empty(StatusCode::OK))
        })
        .with_deserializer(JsonContent::<Signup>::new())
        .requiring_content();
        let endpoint = if asynchronous { endpoint.validate_asynchronously() } else { endpoint };
        Endpoint::direct(endpoint)
    }

    fn exchange(endpoint: Endpoint, headers: HeaderMap, body: &'static [u8]) -> Exchange {
        let mut request = RequestInfo::new(Method::POST, "/signup".parse().unwrap(), Version::HTTP_11, headers);
        if !body.is_empty() {
            request.append_chunk(Bytes::from_static(body), None).unwrap();
        }
        request.mark_last_chunk(None);
        let span = SpanHandle::start("t", TraceContext::new_root(), SpanPolicy::default(), Arc::new(LoggingSpanSink));
        let connection = Arc::new(ConnectionContext::detached());
        let finalizer = RequestFinalizer::begin(&request, span.clone(), connection.clone(), FinalizerSinks::default());
        let mut ex = Exchange::new(request, Body::empty(), connection, span, FinalizerHandle::new(finalizer));
        ex.endpoint = Some(MatchedEndpoint {
            endpoint,
            template: "/signup".into(),
            params: HashMap::new(),
        });
        ex
    }

    fn stage(security: Option<Arc<dyn RequestSecurityValidator>>) -> WorkChainStage {
        WorkChainStage::new(
            security,
            Some(Arc::new(ValidatorRegistry::new().register::<Signup>())),
            WorkerPool::new(2),
        )
    }

    #[tokio::test]
    async fn deserializes_and_validates_inline() {
        let mut ex = exchange(endpoint(false), HeaderMap::new(), br#"{"name":"ada"}"#);
        assert!(matches!(stage(None).process(&mut ex).await, Outcome::Continue));
        assert_eq!(ex.request().content::<Signup>().unwrap().name, "ada");
        assert!(ex.request().is_content_validated());
    }

    #[tokio::test]
    async fn asynchronous_chain_reports_violations() {
        let mut ex = exchange(endpoint(true), HeaderMap::new(), br#"{"name":""}"#);
        match stage(None).process(&mut ex).await {
            Outcome::Error(PipelineError::InvalidContent(violations)) => {
                assert_eq!(violations[0].field, "name");
            }
            other => panic!("expected invalid content, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn empty_body_is_missing_content() {
        let mut ex = exchange(endpoint(false), HeaderMap::new(), b"");
        assert!(matches!(
            stage(None).process(&mut ex).await,
            Outcome::Error(PipelineError::MissingContent)
        ));
    }

    /// Basic auth that claims to be too slow for inline execution.
    struct SlowBasicAuth(BasicAuthSecurityValidator);

    impl RequestSecurityValidator for SlowBasicAuth {
        fn validate(&self, request: &RequestInfo, endpoint: &Endpoint) -> Result<(), PipelineError> {
            self.0.validate(request, endpoint)
        }

        fn endpoints_to_validate(&self) -> std::collections::HashSet<String> {
            self.0.endpoints_to_validate()
        }

        fn is_fast_enough_for_inline_execution(&self) -> bool {
            false
        }
    }

    fn basic_auth() -> BasicAuthSecurityValidator {
        BasicAuthSecurityValidator::new(["signup"], "user", "pass")
    }

    fn authorized() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(http::header::AUTHORIZATION, "Basic dXNlcjpwYXNz".parse().unwrap());
        headers
    }

    #[tokio::test]
    async fn slow_security_runs_in_the_chain_before_deserialization() {
        let security: Arc<dyn RequestSecurityValidator> = Arc::new(SlowBasicAuth(basic_auth()));
        let mut ex = exchange(endpoint(false), HeaderMap::new(), b"not json");
        assert!(matches!(
            stage(Some(security.clone())).process(&mut ex).await,
            Outcome::Error(PipelineError::Unauthorized(_))
        ));

        let mut ex = exchange(endpoint(false), authorized(), br#"{"name":"ada"}"#);
        assert!(matches!(stage(Some(security)).process(&mut ex).await, Outcome::Continue));
        assert_eq!(
            ex.request().attribute(SECURITY_VALIDATED_ATTRIBUTE),
            Some(&serde_json::Value::Bool(true))
        );
    }

    #[tokio::test]
    async fn fast_security_runs_on_the_head_only() {
        let security: Arc<dyn RequestSecurityValidator> = Arc::new(basic_auth());
        let head_stage = SecurityValidationStage::new(Some(security.clone()));

        let mut ex = exchange(endpoint(false), HeaderMap::new(), b"");
        assert!(matches!(
            head_stage.process(&mut ex).await,
            Outcome::Error(PipelineError::Unauthorized(_))
        ));

        let mut ex = exchange(endpoint(false), authorized(), br#"{"name":"ada"}"#);
        assert!(matches!(head_stage.process(&mut ex).await, Outcome::Continue));
        assert_eq!(
            ex.request().attribute(SECURITY_VALIDATED_ATTRIBUTE),
            Some(&serde_json::Value::Bool(true))
        );

        // The chain leaves a fast validator alone, even without credentials.
        let mut ex = exchange(endpoint(false), HeaderMap::new(), br#"{"name":"ada"}"#);
        assert!(matches!(stage(Some(security)).process(&mut ex).await, Outcome::Continue));
    }
}
