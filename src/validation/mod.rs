//! Content deserialization and validation.
//!
//! # Data Flow
//! ```text
//! raw body bytes
//!     → ContentDeserializer (endpoint-declared type, or none = raw access only)
//!     → ContentValidator (field-level violations)
//!     → RequestInfo::content::<T>()
//! ```
//!
//! Both run inside the pre-execution work chain, inline or on the worker
//! pool depending on the endpoint and on `is_fast_enough_for_inline_execution`.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;

use crate::error::{FieldViolation, PipelineError};
use crate::http::request::{Content, RequestInfo};

/// Converts raw body bytes into an endpoint's declared content type.
pub trait ContentDeserializer: Send + Sync {
    /// `Ok(None)` means the body stays raw.
    fn deserialize(&self, body: &[u8]) -> Result<Option<Content>, PipelineError>;

    /// Name of the produced type, for logs.
    fn content_type_name(&self) -> &'static str;
}

/// Deserializes JSON bodies into `T`.
pub struct JsonContent<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonContent<T> {
    pub fn new() -> Self {
        Self { _marker: PhantomData }
    }
}

impl<T> Default for JsonContent<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ContentDeserializer for JsonContent<T>
where
    T: DeserializeOwned + Send + Sync + 'static,
{
    fn deserialize(&self, body: &[u8]) -> Result<Option<Content>, PipelineError> {
        if body.is_empty() {
            return Ok(None);
        }
        let value: T = serde_json::from_slice(body).map_err(|e| {
            PipelineError::malformed("Unable to deserialize request content")
                .with_metadata("content_type", std::any::type_name::<T>())
                .with_metadata("detail", e.to_string())
        })?;
        Ok(Some(Arc::new(value)))
    }

    fn content_type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }
}

/// Field-level validation for deserialized content.
pub trait Validate {
    fn validate(&self) -> Vec<FieldViolation>;
}

/// Validates deserialized content before the endpoint runs.
pub trait ContentValidator: Send + Sync {
    fn validate(&self, request: &RequestInfo, content: &(dyn Any + Send + Sync)) -> Result<(), Vec<FieldViolation>>;

    /// False moves the work chain onto the worker pool.
    fn is_fast_enough_for_inline_execution(&self) -> bool {
        true
    }
}

type ErasedCheck = Box<dyn Fn(&(dyn Any + Send + Sync)) -> Vec<FieldViolation> + Send + Sync>;

/// A [`ContentValidator`] dispatching on the concrete content type.
///
/// Types that were never registered pass validation.
#[derive(Default)]
pub struct ValidatorRegistry {
    checks: HashMap<TypeId, ErasedCheck>,
    inline: bool,
}

impl ValidatorRegistry {
    pub fn new() -> Self {
        Self {
            checks: HashMap::new(),
            inline: true,
        }
    }

    /// Register `T`'s [`Validate`] impl.
    pub fn register<T: Validate + Send + Sync + 'static>(mut self) -> Self {
        self.checks.insert(
            TypeId::of::<T>(),
            Box::new(|content| {
                content
                    .downcast_ref::<T>()
                    .map(Validate::validate)
                    .unwrap_or_default()
            }),
        );
        self
    }

    /// Mark validation as too slow for the I/O task.
    pub fn run_on_worker_pool(mut self) -> Self {
        self.inline = false;
        self
    }
}

impl ContentValidator for ValidatorRegistry {
    fn validate(&self, _request: &RequestInfo, content: &(dyn Any + Send + Sync)) -> Result<(), Vec<FieldViolation>> {
        let violations = self
            .checks
            .get(&content.type_id())
            .map(|check| check(content))
            .unwrap_or_default();
        if violations.is_empty() {
            Ok(())
        } else {
            Err(violations)
        }
    }

    fn is_fast_enough_for_inline_execution(&self) -> bool {
        self.inline
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    struct Signup {
        email: String,
        age: u32,
    }

    impl Validate for Signup {
        fn validate(&self) -> Vec<FieldViolation> {
            let mut violations = Vec::new();
            if !self.email.contains('@') {
                violations.push(FieldViolation::new("email", "email", "must be an email address"));
            }
            if self.age < 18 {
                violations.push(FieldViolation::new("age", "min", "must be at least 18"));
            }
            violations
        }
    }

    fn request() -> RequestInfo {
        RequestInfo::new(
            http::Method::POST,
            http::Uri::from_static("/signup"),
            http::Version::HTTP_11,
            http::HeaderMap::new(),
        )
    }

    #[test]
    fn json_deserializes_into_type() {
        let content = JsonContent::<Signup>::new()
            .deserialize(br#"{"email":"a@b.c","age":30}"#)
            .unwrap()
            .unwrap();
        let signup = content.downcast_ref::<Signup>().unwrap();
        assert_eq!(signup.age, 30);
    }

    #[test]
    fn bad_json_is_malformed() {
        let err = JsonContent::<Signup>::new().deserialize(b"{not json").unwrap_err();
        assert!(matches!(err, PipelineError::MalformedRequest { .. }));
    }

    #[test]
    fn empty_body_stays_raw() {
        assert!(JsonContent::<Signup>::new().deserialize(b"").unwrap().is_none());
    }

    #[test]
    fn registry_reports_every_violation() {
        let registry = ValidatorRegistry::new().register::<Signup>();
        let bad = Signup {
            email: "nope".into(),
            age: 3,
        };
        let violations = registry.validate(&request(), &bad).unwrap_err();
        assert_eq!(violations.len(), 2);
        assert_eq!(violations[0].field, "email");

        let good = Signup {
            email: "a@b.c".into(),
            age: 40,
        };
        assert!(registry.validate(&request(), &good).is_ok());
        assert!(registry.validate(&request(), &5u8).is_ok());
    }
}
