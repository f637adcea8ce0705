//! Request-side stages ahead of the work chain: size ceiling, routing and body assembly.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use futures_util::future::BoxFuture;
use http::header::{CONTENT_ENCODING, CONTENT_LENGTH};
use http::HeaderValue;
use http_body_util::BodyExt;

use crate::endpoint::Endpoint;
use crate::error::PipelineError;
use crate::http::decompression::PayloadDecompressor;
use crate::observability::tracing::Annotation;
use crate::pipeline::exchange::Exchange;
use crate::pipeline::stage::{Outcome, Stage};
use crate::routing::EndpointRegistry;
use crate::security::RequestSizeLimit;

/// Rejects a declared body larger than any endpoint could accept.
///
/// Runs before routing, so the bound is the loosest limit across endpoints.
pub struct RequestSizeStage {
    ceiling: RequestSizeLimit,
}

impl RequestSizeStage {
    pub fn new(registry: &EndpointRegistry, global_max: usize) -> Self {
        Self {
            ceiling: RequestSizeLimit::new(registry.max_request_size_ceiling(global_max)),
        }
    }
}

impl Stage for RequestSizeStage {
    fn name(&self) -> &'static str {
        "request_size"
    }

    fn process<'a>(&'a self, exchange: &'a mut Exchange) -> BoxFuture<'a, Outcome> {
        Box::pin(async move { self.ceiling.check_declared(exchange.request()).into() })
    }
}

/// Picks the endpoint and records the route on the request and span.
pub struct RoutingStage {
    registry: EndpointRegistry,
    global_max: usize,
}

impl RoutingStage {
    pub fn new(registry: EndpointRegistry, global_max: usize) -> Self {
        Self { registry, global_max }
    }
}

impl Stage for RoutingStage {
    fn name(&self) -> &'static str {
        "routing"
    }

    fn process<'a>(&'a self, exchange: &'a mut Exchange) -> BoxFuture<'a, Outcome> {
        Box::pin(async move {
            let matched = match self.registry.route(exchange.request()) {
                Ok(matched) => matched,
                Err(e) => return Outcome::Error(e),
            };

            let method = exchange.request().method().clone();
            exchange.span.rename(format!("{} {}", method, matched.template));
            exchange.span.tag_http("http.route", matched.template.clone());
            if let Some(finalizer) = exchange.finalizer.get() {
                finalizer.record_route(&matched.template);
            }
            exchange
                .request_mut()
                .set_route(matched.template.clone(), matched.params.clone());

            tracing::debug!(
                endpoint = matched.endpoint.name(),
                template = %matched.template,
                proxy = matched.endpoint.is_proxy(),
                "Request routed"
            );

            let limit = RequestSizeLimit::new(matched.endpoint.effective_max_request_size(self.global_max));
            exchange.endpoint = Some(matched);
            limit.check_declared(exchange.request()).into()
        })
    }
}

/// Reads the whole body of a direct-endpoint request into the request state.
///
/// Each chunk must arrive within the incomplete-call timeout. Proxied
/// requests skip this stage; their body streams downstream untouched.
pub struct BodyAssemblyStage {
    global_max: usize,
    incomplete_call: Duration,
    decompressor: Option<Arc<dyn PayloadDecompressor>>,
}

impl BodyAssemblyStage {
    pub fn new(global_max: usize, incomplete_call: Duration, decompressor: Option<Arc<dyn PayloadDecompressor>>) -> Self {
        Self {
            global_max,
            incomplete_call,
            decompressor,
        }
    }

    async fn assemble(&self, exchange: &mut Exchange, max: Option<usize>) -> Result<(), PipelineError> {
        let mut body = exchange.take_body().unwrap_or_else(Body::empty);
        let mut trailers = None;

        loop {
            let frame = match tokio::time::timeout(self.incomplete_call, body.frame()).await {
                Err(_) => {
                    tracing::debug!(
                        received = exchange.request().raw_content_len(),
                        timeout_ms = self.incomplete_call.as_millis() as u64,
                        "Request body stalled before the last chunk"
                    );
                    return Err(PipelineError::incomplete_request(self.incomplete_call));
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    return Err(PipelineError::malformed("Unable to read request body").with_metadata("reason", e.to_string()))
                }
                Ok(Some(Ok(frame))) => frame,
            };

            match frame.into_data() {
                Ok(data) => {
                    if !data.is_empty() {
                        exchange.request_mut().append_chunk(data, max)?;
                    }
                }
                Err(frame) => {
                    if let Ok(t) = frame.into_trailers() {
                        trailers = Some(t);
                    }
                }
            }
        }

        exchange.request_mut().mark_last_chunk(trailers);
        Ok(())
    }

    async fn decompress(
        &self,
        exchange: &mut Exchange,
        endpoint: &Endpoint,
        max: Option<usize>,
    ) -> Result<(), PipelineError> {
        let Some(decompressor) = &self.decompressor else {
            return Ok(());
        };
        let allowed = match endpoint {
            Endpoint::Direct(direct) => direct.is_decompress_payload_allowed(),
            Endpoint::ProxyRouter(_) => false,
        };
        let encoding = match exchange.request().header(CONTENT_ENCODING.as_str()) {
            Some(encoding) => encoding.trim().to_ascii_lowercase(),
            None => return Ok(()),
        };
        if !allowed || encoding == "identity" || !decompressor.supports(&encoding) {
            return Ok(());
        }
        if exchange.request().raw_content_len() == 0 {
            return Ok(());
        }

        let payload = bytes::Bytes::copy_from_slice(exchange.request().raw_content_bytes());
        let inflated = decompressor.decompress(&encoding, payload, max).await?;
        if let Some(max) = max.filter(|max| inflated.len() > *max) {
            return Err(PipelineError::request_too_large(max));
        }
        tracing::trace!(
            encoding = %encoding,
            compressed = exchange.request().raw_content_len(),
            inflated = inflated.len(),
            "Request payload decompressed"
        );

        let request = exchange.request_mut();
        request.headers_mut().remove(CONTENT_ENCODING);
        request
            .headers_mut()
            .insert(CONTENT_LENGTH, HeaderValue::from(inflated.len() as u64));
        request.replace_raw_content(inflated);
        Ok(())
    }
}

impl Stage for BodyAssemblyStage {
    fn name(&self) -> &'static str {
        "body_assembly"
    }

    fn process<'a>(&'a self, exchange: &'a mut Exchange) -> BoxFuture<'a, Outcome> {
        Box::pin(async move {
            let Some(endpoint) = exchange.endpoint.as_ref().map(|m| m.endpoint.clone()) else {
                return Outcome::Error(PipelineError::Unhandled("body assembly ran before routing".into()));
            };
            if endpoint.is_proxy() {
                return Outcome::Continue;
            }

            let max = endpoint.effective_max_request_size(self.global_max);
            if let Err(e) = self.assemble(exchange, max).await {
                return Outcome::Error(e);
            }
            exchange.span.annotate(Annotation::WireReceiveFinish);
            self.decompress(exchange, &endpoint, max).await.into()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::HandlerEndpoint;
    use crate::http::request::RequestInfo;
    use crate::http::response::ResponseInfo;
    use crate::net::ConnectionContext;
    use crate::observability::tracing::{LoggingSpanSink, SpanHandle, SpanPolicy, TraceContext};
    use crate::pipeline::finalizer::{FinalizerHandle, FinalizerSinks, RequestFinalizer};
    use crate::routing::Matcher;
    use bytes::Bytes;
    use http::{HeaderMap, Method, StatusCode, Version};

    fn registry(limit: Option<usize>) -> EndpointRegistry {
        let endpoint = HandlerEndpoint::new("echo", Matcher::single("/echo/{id}").unwrap(), |_req, _ctx| async {
            Ok(ResponseInfo::empty(StatusCode::OK))
        });
        let endpoint = match limit {
            Some(limit) => endpoint.with_max_request_size(limit),
            None => endpoint,
        };
        EndpointRegistry::new(vec![Endpoint::direct(endpoint)])
    }

    fn exchange(method: Method, uri: &str, headers: HeaderMap, body: Body) -> Exchange {
        let request = RequestInfo::new(method, uri.parse().unwrap(), Version::HTTP_11, headers);
        let span = SpanHandle::start("t", TraceContext::new_root(), SpanPolicy::default(), Arc::new(LoggingSpanSink));
        let connection = Arc::new(ConnectionContext::detached());
        let finalizer = RequestFinalizer::begin(&request, span.clone(), connection.clone(), FinalizerSinks::default());
        Exchange::new(request, body, connection, span, FinalizerHandle::new(finalizer))
    }

    #[tokio::test]
    async fn routing_records_template_and_params() {
        let stage = RoutingStage::new(registry(None), 0);
        let mut ex = exchange(Method::GET, "/echo/7", HeaderMap::new(), Body::empty());
        assert!(matches!(stage.process(&mut ex).await, Outcome::Continue));
        assert_eq!(ex.request().path_template(), Some("/echo/{id}"));
        assert_eq!(ex.request().path_param("id"), Some("7"));
    }

    #[tokio::test]
    async fn routing_applies_endpoint_limit() {
        let stage = RoutingStage::new(registry(Some(4)), 0);
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("10"));
        let mut ex = exchange(Method::POST, "/echo/7", headers, Body::empty());
        assert!(matches!(
            stage.process(&mut ex).await,
            Outcome::Error(PipelineError::MalformedRequest { .. })
        ));
    }

    #[tokio::test]
    async fn assembles_body_and_marks_last_chunk() {
        let routing = RoutingStage::new(registry(None), 0);
        let assembly = BodyAssemblyStage::new(0, Duration::from_secs(1), None);
        let mut ex = exchange(Method::POST, "/echo/1", HeaderMap::new(), Body::from("payload"));
        routing.process(&mut ex).await;
        assert!(matches!(assembly.process(&mut ex).await, Outcome::Continue));
        assert!(ex.request().is_complete_request_with_all_chunks());
        assert_eq!(ex.request().raw_content_string(), "payload");
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_body_is_incomplete() {
        let (tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes, std::io::Error>>(1);
        let stream = futures_util::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) });
        let routing = RoutingStage::new(registry(None), 0);
        let assembly = BodyAssemblyStage::new(0, Duration::from_millis(200), None);
        let mut ex = exchange(Method::POST, "/echo/1", HeaderMap::new(), Body::from_stream(stream));
        routing.process(&mut ex).await;
        tx.send(Ok(Bytes::from_static(b"part"))).await.unwrap();

        match assembly.process(&mut ex).await {
            Outcome::Error(PipelineError::MalformedRequest { metadata, .. }) => {
                assert_eq!(metadata["incomplete_http_call_timeout_millis"], 200);
            }
            other => panic!("expected incomplete request, got {:?}", other),
        }
        drop(tx);
    }

    // 4096 bytes of 'a' compressed with gzip.
    const GZIP_4K: [u8; 40] = [
        0x1f, 0x8b, 0x08, 0x00, 0x00, 0x00, 0x00, 0x00, 0x02, 0x03, 0xed, 0xc1, 0x01, 0x0d, 0x00, 0x00,
        0x00, 0xc2, 0xa0, 0xac, 0xef, 0x5f, 0xc2, 0x1e, 0x0e, 0x28, 0x00, 0x00, 0x00, 0xe0, 0xdd, 0x00,
        0x73, 0xdc, 0x99, 0x9c, 0x00, 0x10, 0x00, 0x00,
    ];

    fn gzip_upload() -> Exchange {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        exchange(Method::POST, "/echo/1", headers, Body::from(Bytes::from_static(&GZIP_4K)))
    }

    #[tokio::test]
    async fn size_limit_applies_to_the_inflated_body() {
        let decompressor: Arc<dyn PayloadDecompressor> = Arc::new(crate::http::HttpPayloadDecompressor);

        let routing = RoutingStage::new(registry(Some(1_000)), 0);
        let assembly = BodyAssemblyStage::new(0, Duration::from_secs(1), Some(decompressor.clone()));
        let mut ex = gzip_upload();
        assert!(matches!(routing.process(&mut ex).await, Outcome::Continue));
        match assembly.process(&mut ex).await {
            Outcome::Error(PipelineError::MalformedRequest { metadata, .. }) => {
                assert_eq!(metadata["max_request_size_bytes"], 1_000);
            }
            other => panic!("expected too large, got {:?}", other),
        }

        let routing = RoutingStage::new(registry(Some(8_192)), 0);
        let assembly = BodyAssemblyStage::new(0, Duration::from_secs(1), Some(decompressor));
        let mut ex = gzip_upload();
        routing.process(&mut ex).await;
        assert!(matches!(assembly.process(&mut ex).await, Outcome::Continue));
        assert_eq!(ex.request().raw_content_len(), 4_096);
        assert!(ex.request().header("content-encoding").is_none());
    }

    #[tokio::test]
    async fn oversized_stream_is_rejected_while_reading() {
        let routing = RoutingStage::new(registry(Some(3)), 0);
        let assembly = BodyAssemblyStage::new(0, Duration::from_secs(1), None);
        let mut ex = exchange(Method::POST, "/echo/1", HeaderMap::new(), Body::from("too long"));
        routing.process(&mut ex).await;
        assert!(matches!(
            assembly.process(&mut ex).await,
            Outcome::Error(PipelineError::MalformedRequest { .. })
        ));
    }
}
