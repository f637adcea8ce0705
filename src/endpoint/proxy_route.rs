//! Proxy router endpoint configured from `[[proxy_routes]]`.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use http::Method;

use crate::config::ProxyRouteConfig;
use crate::endpoint::{
    DownstreamRequestFirstChunkInfo, DownstreamRequestHead, EndpointBase, ExecutionContext, ProxyRouterEndpoint,
};
use crate::error::PipelineError;
use crate::http::request::RequestInfo;
use crate::routing::matcher::Matcher;

/// Forwards matching requests to one fixed downstream target.
#[derive(Debug)]
pub struct SimpleProxyRouterEndpoint {
    name: String,
    matcher: Matcher,
    host: String,
    port: u16,
    tls: bool,
    strip_prefix: Option<String>,
    tracing_headers: bool,
    subspan: bool,
    relaxed_tls: bool,
}

impl SimpleProxyRouterEndpoint {
    pub fn from_config(route: &ProxyRouteConfig) -> Result<Self, String> {
        let methods = route
            .methods
            .iter()
            .map(|m| Method::from_bytes(m.to_ascii_uppercase().as_bytes()).map_err(|e| e.to_string()))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            name: route.name.clone(),
            matcher: Matcher::single(&route.path)?.with_methods(methods),
            host: route.host.clone(),
            port: route.port,
            tls: route.tls,
            strip_prefix: route.strip_prefix.clone(),
            tracing_headers: route.propagate_tracing_headers,
            subspan: route.subspan,
            relaxed_tls: route.relaxed_tls,
        })
    }

    fn downstream_path(&self, path: &str) -> String {
        let Some(prefix) = self.strip_prefix.as_deref() else {
            return path.to_string();
        };
        match path.strip_prefix(prefix.trim_end_matches('/')) {
            Some(rest) if rest.is_empty() => "/".to_string(),
            Some(rest) if rest.starts_with('/') => rest.to_string(),
            _ => path.to_string(),
        }
    }

    fn first_chunk_info(&self, request: &RequestInfo) -> Result<DownstreamRequestFirstChunkInfo, PipelineError> {
        let mut head = DownstreamRequestHead::from_request(request);
        if self.strip_prefix.is_some() {
            head.set_path(&self.downstream_path(request.uri().path()))?;
        }
        Ok(DownstreamRequestFirstChunkInfo::new(self.host.clone(), self.port, self.tls, head)
            .with_tracing_headers(self.tracing_headers)
            .with_subspan(self.subspan)
            .with_relaxed_https_validation(self.relaxed_tls))
    }
}

impl EndpointBase for SimpleProxyRouterEndpoint {
    fn matcher(&self) -> &Matcher {
        &self.matcher
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl ProxyRouterEndpoint for SimpleProxyRouterEndpoint {
    fn downstream_request_first_chunk<'a>(
        &'a self,
        request: Arc<RequestInfo>,
        _ctx: ExecutionContext,
    ) -> BoxFuture<'a, Result<DownstreamRequestFirstChunkInfo, PipelineError>> {
        Box::pin(async move { self.first_chunk_info(&request) })
    }
}
