//! Endpoint matching.
//!
//! # Responsibilities
//! - Parse path templates (`/users/{id}`, `/static/*`, `/files/**`)
//! - Match a request path against one or more templates, extracting params
//! - Check the HTTP method and an optional custom predicate
//!
//! # Design Decisions
//! - Path matching is case-sensitive and ignores a trailing slash
//! - No regex: templates compile to a segment list matched in O(segments)
//! - A multi-template matcher uses the first template that textually matches,
//!   in declaration order, and takes params from that template only. Declaring
//!   a less specific template before a more specific one therefore shadows it.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use http::Method;

use crate::http::request::{normalize_path, RequestInfo};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
    /// `*`: exactly one segment.
    Wildcard,
    /// `**`: any number of trailing segments, including none.
    CatchAll,
}

/// A compiled path template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathTemplate {
    raw: String,
    segments: Vec<Segment>,
}

fn split_segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

impl PathTemplate {
    /// Compile a template. Fails on a missing leading slash, malformed
    /// `{param}` segments or a `**` that is not the last segment.
    pub fn parse(template: &str) -> Result<Self, String> {
        if !template.starts_with('/') {
            return Err(format!("path template '{}' must start with '/'", template));
        }

        let raw = normalize_path(template);
        let parts: Vec<&str> = split_segments(&raw).collect();
        let mut segments = Vec::with_capacity(parts.len());

        for (i, part) in parts.iter().enumerate() {
            let segment = if *part == "**" {
                if i + 1 != parts.len() {
                    return Err(format!(
                        "path template '{}' may only use '**' as the last segment",
                        template
                    ));
                }
                Segment::CatchAll
            } else if *part == "*" {
                Segment::Wildcard
            } else if let Some(name) = part.strip_prefix('{').and_then(|p| p.strip_suffix('}')) {
                if name.is_empty() || name.contains(['{', '}']) {
                    return Err(format!("path template '{}' has an invalid parameter '{}'", template, part));
                }
                Segment::Param(name.to_string())
            } else if part.contains(['{', '}', '*']) {
                return Err(format!("path template '{}' has an invalid segment '{}'", template, part));
            } else {
                Segment::Literal((*part).to_string())
            };
            segments.push(segment);
        }

        Ok(Self { raw, segments })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Names of the `{param}` segments, in order.
    pub fn param_names(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Param(name) => Some(name.as_str()),
            _ => None,
        })
    }

    /// Match a normalized path. Returns the extracted params on success.
    pub fn match_path(&self, path: &str) -> Option<HashMap<String, String>> {
        let mut params = HashMap::new();
        let mut parts = split_segments(path);

        for segment in &self.segments {
            match segment {
                Segment::CatchAll => return Some(params),
                Segment::Literal(expected) => {
                    if parts.next()? != expected {
                        return None;
                    }
                }
                Segment::Param(name) => {
                    params.insert(name.clone(), parts.next()?.to_string());
                }
                Segment::Wildcard => {
                    parts.next()?;
                }
            }
        }

        parts.next().is_none().then_some(params)
    }
}

impl fmt::Display for PathTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Extra application-defined match condition.
pub type RequestPredicate = Arc<dyn Fn(&RequestInfo) -> bool + Send + Sync>;

/// Outcome of matching one request against one matcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchResult {
    Matched {
        template: String,
        params: HashMap<String, String>,
    },
    /// A template matched the path but the method is not accepted.
    MethodMismatch,
    NoMatch,
}

/// Path templates plus optional method and predicate constraints.
#[derive(Clone)]
pub struct Matcher {
    templates: Vec<PathTemplate>,
    methods: Vec<Method>,
    predicate: Option<RequestPredicate>,
}

impl fmt::Debug for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Matcher")
            .field("templates", &self.templates)
            .field("methods", &self.methods)
            .field("has_predicate", &self.predicate.is_some())
            .finish()
    }
}

impl Matcher {
    /// Match a single template, any method.
    pub fn single(template: &str) -> Result<Self, String> {
        Self::multi([template])
    }

    /// Match any of several templates, tried in the given order.
    pub fn multi<'a>(templates: impl IntoIterator<Item = &'a str>) -> Result<Self, String> {
        let templates = templates
            .into_iter()
            .map(PathTemplate::parse)
            .collect::<Result<Vec<_>, _>>()?;
        if templates.is_empty() {
            return Err("a matcher needs at least one path template".to_string());
        }
        Ok(Self {
            templates,
            methods: Vec::new(),
            predicate: None,
        })
    }

    /// Restrict to these methods. An empty list accepts every method.
    pub fn with_methods(mut self, methods: impl IntoIterator<Item = Method>) -> Self {
        self.methods = methods.into_iter().collect();
        self
    }

    pub fn with_predicate(mut self, predicate: impl Fn(&RequestInfo) -> bool + Send + Sync + 'static) -> Self {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    pub fn templates(&self) -> &[PathTemplate] {
        &self.templates
    }

    pub fn methods(&self) -> &[Method] {
        &self.methods
    }

    pub fn accepts_method(&self, method: &Method) -> bool {
        self.methods.is_empty() || self.methods.contains(method)
    }

    pub fn matches(&self, request: &RequestInfo) -> MatchResult {
        let Some((template, params)) = self
            .templates
            .iter()
            .find_map(|t| t.match_path(request.path()).map(|params| (t, params)))
        else {
            return MatchResult::NoMatch;
        };

        if !self.accepts_method(request.method()) {
            return MatchResult::MethodMismatch;
        }
        if let Some(predicate) = &self.predicate {
            if !predicate(request) {
                return MatchResult::NoMatch;
            }
        }

        MatchResult::Matched {
            template: template.as_str().to_string(),
            params,
        }
    }
}
