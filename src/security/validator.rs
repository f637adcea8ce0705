//! Request security validation.
//!
//! # Responsibilities
//! - Define the validator contract run first in the pre-execution work chain
//! - Provide Basic auth and an any-of combinator
//!
//! # Design Decisions
//! - Endpoints are selected by name; a validator ignores endpoints outside its set
//! - Validators see the request head only; the body may not have arrived yet

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use http::header::AUTHORIZATION;

use crate::endpoint::Endpoint;
use crate::error::PipelineError;
use crate::http::request::RequestInfo;

/// Rejects requests that fail authentication or authorization.
pub trait RequestSecurityValidator: Send + Sync {
    /// Return `Unauthorized` or `Forbidden` to reject the request.
    fn validate(&self, request: &RequestInfo, endpoint: &Endpoint) -> Result<(), PipelineError>;

    /// Names of the endpoints this validator protects.
    fn endpoints_to_validate(&self) -> HashSet<String>;

    /// False moves the work chain onto the worker pool.
    fn is_fast_enough_for_inline_execution(&self) -> bool {
        true
    }
}

/// Whether `validator` applies to `endpoint`.
pub fn should_validate(validator: &dyn RequestSecurityValidator, endpoint: &Endpoint) -> bool {
    validator.endpoints_to_validate().contains(endpoint.name())
}

/// Standard base64 decoding, padding optional.
fn base64_decode(input: &str) -> Option<Vec<u8>> {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

    let mut output = Vec::with_capacity(input.len() * 3 / 4);
    let mut buffer = 0u32;
    let mut bits = 0;

    for c in input.bytes() {
        if c == b'=' {
            break;
        }
        let value = ALPHABET.iter().position(|&x| x == c)? as u32;
        buffer = (buffer << 6) | value;
        bits += 6;
        if bits >= 8 {
            bits -= 8;
            output.push((buffer >> bits) as u8);
            buffer &= (1 << bits) - 1;
        }
    }

    Some(output)
}

/// Requires a matching `Authorization: Basic` header.
#[derive(Debug, Clone)]
pub struct BasicAuthSecurityValidator {
    endpoints: HashSet<String>,
    username: String,
    password: String,
}

impl BasicAuthSecurityValidator {
    pub fn new<I, S>(endpoints: I, username: impl Into<String>, password: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            endpoints: endpoints.into_iter().map(Into::into).collect(),
            username: username.into(),
            password: password.into(),
        }
    }
}

impl RequestSecurityValidator for BasicAuthSecurityValidator {
    fn validate(&self, request: &RequestInfo, _endpoint: &Endpoint) -> Result<(), PipelineError> {
        let header = request
            .header(AUTHORIZATION.as_str())
            .ok_or_else(|| PipelineError::Unauthorized("Missing authorization header.".into()))?;

        let encoded = match header.split_once(' ') {
            Some(("Basic", encoded)) if !encoded.contains(' ') => encoded,
            _ => {
                return Err(PipelineError::Unauthorized(
                    "Authorization header does not contain Basic".into(),
                ))
            }
        };

        let decoded = base64_decode(encoded)
            .and_then(|bytes| String::from_utf8(bytes).ok())
            .ok_or_else(|| {
                PipelineError::Unauthorized("Malformed Authorization header (not Base64 encoded)".into())
            })?;

        let (username, password) = decoded
            .split_once(':')
            .ok_or_else(|| PipelineError::Unauthorized("Malformed Authorization header.".into()))?;

        if username != self.username || password != self.password {
            return Err(PipelineError::Unauthorized("Invalid username or password".into()));
        }
        Ok(())
    }

    fn endpoints_to_validate(&self) -> HashSet<String> {
        self.endpoints.clone()
    }
}

/// Passes a request if any validator registered for its endpoint passes.
///
/// Validators are tried in list order. A `Forbidden` rejection is final;
/// `Unauthorized` rejections move on to the next validator and are combined
/// when all of them fail.
pub struct PolymorphicSecurityValidator {
    by_endpoint: HashMap<String, Vec<Arc<dyn RequestSecurityValidator>>>,
    inline: bool,
}

impl PolymorphicSecurityValidator {
    pub fn new(validators: Vec<Arc<dyn RequestSecurityValidator>>) -> Self {
        let inline = validators.iter().all(|v| v.is_fast_enough_for_inline_execution());
        let mut by_endpoint: HashMap<String, Vec<Arc<dyn RequestSecurityValidator>>> = HashMap::new();
        for validator in validators {
            for endpoint in validator.endpoints_to_validate() {
                by_endpoint.entry(endpoint).or_default().push(Arc::clone(&validator));
            }
        }
        Self { by_endpoint, inline }
    }
}

impl RequestSecurityValidator for PolymorphicSecurityValidator {
    fn validate(&self, request: &RequestInfo, endpoint: &Endpoint) -> Result<(), PipelineError> {
        let Some(validators) = self.by_endpoint.get(endpoint.name()).filter(|v| !v.is_empty()) else {
            return Ok(());
        };

        let mut failures = Vec::with_capacity(validators.len());
        for validator in validators {
            match validator.validate(request, endpoint) {
                Ok(()) => return Ok(()),
                Err(PipelineError::Unauthorized(reason)) => failures.push(reason),
                Err(other) => return Err(other),
            }
        }
        Err(PipelineError::Unauthorized(format!(
            "Request failed all auth validation: {}",
            failures.join("; ")
        )))
    }

    fn endpoints_to_validate(&self) -> HashSet<String> {
        self.by_endpoint.keys().cloned().collect()
    }

    fn is_fast_enough_for_inline_execution(&self) -> bool {
        self.inline
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::HandlerEndpoint;
    use crate::http::response::ResponseInfo;
    use crate::routing::Matcher;
    use http::{HeaderMap, HeaderValue, Method, StatusCode, Version};

    fn endpoint(name: &str) -> Endpoint {
        Endpoint::direct(HandlerEndpoint::new(name, Matcher::single("/x").unwrap(), |_req, _ctx| async {
            Ok(ResponseInfo::empty(StatusCode::OK))
        }))
    }

    fn request(auth: Option<&'static str>) -> RequestInfo {
        let mut headers = HeaderMap::new();
        if let Some(auth) = auth {
            headers.insert(AUTHORIZATION, HeaderValue::from_static(auth));
        }
        RequestInfo::new(Method::GET, "/x".parse().unwrap(), Version::HTTP_11, headers)
    }

    #[test]
    fn decodes_base64() {
        assert_eq!(base64_decode("dXNlcjpwYXNz").unwrap(), b"user:pass");
        assert_eq!(base64_decode("YQ==").unwrap(), b"a");
        assert!(base64_decode("not base64!").is_none());
    }

    #[test]
    fn basic_auth() {
        let validator = BasicAuthSecurityValidator::new(["secure"], "user", "pass");
        let ep = endpoint("secure");
        assert!(should_validate(&validator, &ep));
        assert!(!should_validate(&validator, &endpoint("open")));

        // user:pass
        assert!(validator.validate(&request(Some("Basic dXNlcjpwYXNz")), &ep).is_ok());
        // user:nope
        assert!(validator.validate(&request(Some("Basic dXNlcjpub3Bl")), &ep).is_err());
        assert!(validator.validate(&request(Some("Bearer abc")), &ep).is_err());
        assert!(matches!(
            validator.validate(&request(None), &ep),
            Err(PipelineError::Unauthorized(_))
        ));
    }

    struct Deny(&'static str, bool);

    impl RequestSecurityValidator for Deny {
        fn validate(&self, _request: &RequestInfo, _endpoint: &Endpoint) -> Result<(), PipelineError> {
            if self.1 {
                Err(PipelineError::Forbidden(self.0.into()))
            } else {
                Err(PipelineError::Unauthorized(self.0.into()))
            }
        }

        fn endpoints_to_validate(&self) -> HashSet<String> {
            HashSet::from(["secure".to_string()])
        }

        fn is_fast_enough_for_inline_execution(&self) -> bool {
            false
        }
    }

    #[test]
    fn polymorphic_passes_if_any_passes() {
        let combined = PolymorphicSecurityValidator::new(vec![
            Arc::new(Deny("first", false)),
            Arc::new(BasicAuthSecurityValidator::new(["secure"], "user", "pass")),
        ]);
        assert!(!combined.is_fast_enough_for_inline_execution());
        let ep = endpoint("secure");
        assert!(combined.validate(&request(Some("Basic dXNlcjpwYXNz")), &ep).is_ok());

        match combined.validate(&request(None), &ep) {
            Err(PipelineError::Unauthorized(msg)) => {
                assert!(msg.contains("first"));
                assert!(msg.contains("Missing authorization header"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(combined.validate(&request(None), &endpoint("open")).is_ok());
    }

    #[test]
    fn forbidden_is_final() {
        let combined = PolymorphicSecurityValidator::new(vec![
            Arc::new(Deny("blocked", true)),
            Arc::new(Deny("never reached", false)),
        ]);
        assert!(matches!(
            combined.validate(&request(None), &endpoint("secure")),
            Err(PipelineError::Forbidden(_))
        ));
    }
}
