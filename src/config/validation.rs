//! Configuration validation.
//!
//! Serde handles syntax; this module checks value ranges and cross-field
//! rules and reports every problem at once.

use std::net::SocketAddr;

use http::Method;

use crate::config::schema::ServerConfig;
use crate::routing::matcher::PathTemplate;

/// One semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Validate a parsed configuration, collecting every error.
pub fn validate_config(config: &ServerConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "listener.bind_address",
            format!("'{}' is not a socket address", config.listener.bind_address),
        ));
    }

    if config.listener.max_open_connections == 0 || config.listener.max_open_connections < -1 {
        errors.push(ValidationError::new(
            "listener.max_open_connections",
            "must be positive, or -1 to disable the cap",
        ));
    }

    if config.workers.pool_size == 0 {
        errors.push(ValidationError::new("workers.pool_size", "must be at least 1"));
    }

    let timeouts = [
        ("timeouts.endpoint_ms", config.timeouts.endpoint_ms),
        ("timeouts.downstream_connect_ms", config.timeouts.downstream_connect_ms),
        ("timeouts.downstream_idle_ms", config.timeouts.downstream_idle_ms),
        ("timeouts.incomplete_call_ms", config.timeouts.incomplete_call_ms),
        ("timeouts.keep_alive_idle_ms", config.timeouts.keep_alive_idle_ms),
    ];
    for (field, value) in timeouts {
        if value == 0 {
            errors.push(ValidationError::new(field, "must be greater than zero"));
        }
    }

    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!("'{}' is not a socket address", config.observability.metrics_address),
        ));
    }

    if !matches!(config.observability.log_format.as_str(), "pretty" | "json") {
        errors.push(ValidationError::new(
            "observability.log_format",
            "must be \"pretty\" or \"json\"",
        ));
    }

    for (i, route) in config.proxy_routes.iter().enumerate() {
        let prefix = format!("proxy_routes[{}]", i);
        if route.host.trim().is_empty() {
            errors.push(ValidationError::new(format!("{}.host", prefix), "must not be empty"));
        }
        if route.port == 0 {
            errors.push(ValidationError::new(format!("{}.port", prefix), "must not be 0"));
        }
        if let Err(e) = PathTemplate::parse(&route.path) {
            errors.push(ValidationError::new(format!("{}.path", prefix), e));
        }
        for method in &route.methods {
            if Method::from_bytes(method.as_bytes()).is_err() {
                errors.push(ValidationError::new(
                    format!("{}.methods", prefix),
                    format!("'{}' is not an HTTP method", method),
                ));
            }
        }
        if let Some(strip) = &route.strip_prefix {
            if !strip.starts_with('/') {
                errors.push(ValidationError::new(
                    format!("{}.strip_prefix", prefix),
                    "must start with '/'",
                ));
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::ProxyRouteConfig;

    fn route(path: &str) -> ProxyRouteConfig {
        ProxyRouteConfig {
            name: "r".into(),
            path: path.into(),
            methods: vec![],
            host: "127.0.0.1".into(),
            port: 9000,
            tls: false,
            strip_prefix: None,
            propagate_tracing_headers: true,
            subspan: true,
            relaxed_tls: false,
        }
    }

    #[test]
    fn default_config_is_valid() {
        assert!(validate_config(&ServerConfig::default()).is_ok());
    }

    #[test]
    fn collects_all_errors() {
        let mut config = ServerConfig::default();
        config.listener.bind_address = "not-an-address".into();
        config.listener.max_open_connections = 0;
        config.timeouts.endpoint_ms = 0;

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 3);
        assert!(errors.iter().any(|e| e.field == "timeouts.endpoint_ms"));
    }

    #[test]
    fn minus_one_disables_connection_cap() {
        let mut config = ServerConfig::default();
        config.listener.max_open_connections = -1;
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn rejects_bad_proxy_routes() {
        let mut config = ServerConfig::default();
        let mut bad = route("/a/**/b");
        bad.methods = vec!["NOT A METHOD".into()];
        bad.port = 0;
        config.proxy_routes.push(route("/ok/{id}"));
        config.proxy_routes.push(bad);

        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<_> = errors.iter().map(|e| e.field.as_str()).collect();
        assert!(fields.contains(&"proxy_routes[1].path"));
        assert!(fields.contains(&"proxy_routes[1].methods"));
        assert!(fields.contains(&"proxy_routes[1].port"));
    }
}
