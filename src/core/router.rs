//! Route pattern compiler and matcher.
//!
//! A [`Router`] keeps one table per HTTP method. Each table holds three buckets that are
//! consulted in a fixed order: exact static paths, then param patterns, then wildcard
//! patterns. Within a bucket the first registered pattern wins. A subrouter is a wildcard
//! entry whose endpoint is another [`Router`]; matching descends into it with the full
//! request path and whatever it decides is final.
use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, LazyLock},
};

use axum::{extract::Request, response::IntoResponse};
use futures_util::future::{FutureExt, ready};
use http::Method;
use regex::Regex;

use crate::{
    config::models::{Protocol, RouteType},
    core::{
        errors::{ErrorCode, GatewayError},
        handler::{Handler, HandlerFuture, SharedHandler},
    },
};

/// Every verb registered for `*`
pub const ALL_METHODS: [Method; 7] = [
    Method::GET,
    Method::POST,
    Method::PUT,
    Method::DELETE,
    Method::PATCH,
    Method::HEAD,
    Method::OPTIONS,
];

const WILDCARD_GROUP: &str = "__rest";
const DEFAULT_SEGMENT: &str = "[^/]+";

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r":([A-Za-z_][A-Za-z0-9_]*)").expect("Invalid placeholder regex")
});

/// Body of the parenthesized constraint opening at `open` and the index past its closing
/// `)`. Escaped parentheses do not count toward nesting.
fn inline_constraint(path: &str, open: usize) -> Option<(&str, usize)> {
    let mut depth = 0usize;
    let mut escaped = false;
    for (offset, ch) in path[open..].char_indices() {
        match ch {
            _ if escaped => escaped = false,
            '\\' => escaped = true,
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    let close = open + offset;
                    return Some((&path[open + 1..close], close + 1));
                }
            }
            _ => {}
        }
    }
    None
}

/// Route compilation errors
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum RouteError {
    #[error("invalid route pattern '{path}': {reason}")]
    InvalidPattern { path: String, reason: String },
    #[error("invalid HTTP method '{0}'")]
    InvalidMethod(String),
    #[error("subrouter requires a prefix")]
    MissingPrefix,
}

/// Parameters captured by a match, exposed to handlers as a request extension
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteParams(BTreeMap<String, String>);

impl RouteParams {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.insert(name.into(), value.into());
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// The pattern a request matched, as a request extension
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchedRoute(pub String);

/// Bucket a pattern is stored in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternKind {
    Static,
    Param,
    Wildcard,
}

#[derive(Debug, Clone)]
enum Matcher {
    Exact,
    Regex {
        regex: Regex,
        names: Vec<String>,
        /// Param key of the wildcard remainder, if any
        rest: Option<String>,
    },
}

/// A compiled path pattern
#[derive(Debug, Clone)]
pub struct RoutePattern {
    path: String,
    kind: PatternKind,
    matcher: Matcher,
}

impl RoutePattern {
    /// Compile `path`.
    ///
    /// Paths ending in `/*` (or `/*name`) and nodes typed `wildcard` match any suffix below
    /// their base. `:name` placeholders compile to named groups constrained by an inline
    /// `(pattern)`, then by `constraints[name]`, then by a single path segment.
    pub fn compile(
        path: &str,
        kind: RouteType,
        constraints: &BTreeMap<String, String>,
    ) -> Result<Self, RouteError> {
        if let Some((base, rest)) = Self::split_wildcard(path, kind) {
            let (body, names) = Self::translate(path, base, constraints)?;
            let source = format!("^{body}/(?P<{WILDCARD_GROUP}>.*)$");
            let regex = Self::build(path, &source)?;
            return Ok(Self {
                path: path.to_string(),
                kind: PatternKind::Wildcard,
                matcher: Matcher::Regex {
                    regex,
                    names,
                    rest: Some(rest.to_string()),
                },
            });
        }

        if PLACEHOLDER.is_match(path) {
            let (body, names) = Self::translate(path, path, constraints)?;
            let regex = Self::build(path, &format!("^{body}$"))?;
            return Ok(Self {
                path: path.to_string(),
                kind: PatternKind::Param,
                matcher: Matcher::Regex {
                    regex,
                    names,
                    rest: None,
                },
            });
        }

        Ok(Self {
            path: path.to_string(),
            kind: PatternKind::Static,
            matcher: Matcher::Exact,
        })
    }

    /// `(base, capture key)` for wildcard paths
    fn split_wildcard(path: &str, kind: RouteType) -> Option<(&str, &str)> {
        if let Some(idx) = path.rfind("/*") {
            let name = &path[idx + 2..];
            if !name.contains('/') {
                let key = if name.is_empty() { "*" } else { name };
                return Some((&path[..idx], key));
            }
        }
        if kind == RouteType::Wildcard {
            return Some((path.trim_end_matches('/'), "*"));
        }
        None
    }

    fn translate(
        route: &str,
        path: &str,
        constraints: &BTreeMap<String, String>,
    ) -> Result<(String, Vec<String>), RouteError> {
        let mut body = String::with_capacity(path.len() + 16);
        let mut names = Vec::new();
        let mut last = 0;
        for caps in PLACEHOLDER.captures_iter(path) {
            let Some(whole) = caps.get(0) else {
                continue;
            };
            // inside an inline constraint already consumed
            if whole.start() < last {
                continue;
            }
            let name = &caps[1];
            let mut end = whole.end();
            let mut inline = None;
            if path[end..].starts_with('(') {
                let (constraint, close) =
                    inline_constraint(path, end).ok_or_else(|| RouteError::InvalidPattern {
                        path: route.to_string(),
                        reason: format!("unbalanced parentheses in constraint of ':{name}'"),
                    })?;
                inline = Some(constraint).filter(|c| !c.is_empty());
                end = close;
            }
            let constraint = inline
                .or_else(|| constraints.get(name).map(String::as_str))
                .unwrap_or(DEFAULT_SEGMENT);
            body.push_str(&regex::escape(&path[last..whole.start()]));
            body.push_str(&format!("(?P<{name}>{constraint})"));
            names.push(name.to_string());
            last = end;
        }
        body.push_str(&regex::escape(&path[last..]));
        Ok((body, names))
    }

    fn build(path: &str, source: &str) -> Result<Regex, RouteError> {
        Regex::new(source).map_err(|e| RouteError::InvalidPattern {
            path: path.to_string(),
            reason: e.to_string(),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn kind(&self) -> PatternKind {
        self.kind
    }

    /// Match a request path, returning the captured params
    pub fn matches(&self, path: &str) -> Option<RouteParams> {
        match &self.matcher {
            Matcher::Exact => (self.path == path).then(RouteParams::default),
            Matcher::Regex { regex, names, rest } => {
                let caps = regex.captures(path)?;
                let mut params = RouteParams::default();
                for name in names {
                    if let Some(value) = caps.name(name) {
                        params.insert(name.as_str(), value.as_str());
                    }
                }
                if let (Some(key), Some(value)) = (rest, caps.name(WILDCARD_GROUP)) {
                    params.insert(key.as_str(), value.as_str());
                }
                Some(params)
            }
        }
    }
}

/// Methods a route node registers
pub fn parse_methods(methods: &[String], protocol: Protocol) -> Result<Vec<Method>, RouteError> {
    if methods.is_empty() {
        return Ok(match protocol {
            Protocol::WebSocket => vec![Method::GET],
            _ => ALL_METHODS.to_vec(),
        });
    }

    let mut out: Vec<Method> = Vec::new();
    for raw in methods {
        let raw = raw.trim();
        if raw == "*" {
            for method in ALL_METHODS {
                if !out.contains(&method) {
                    out.push(method);
                }
            }
            continue;
        }
        let method = Method::from_bytes(raw.to_ascii_uppercase().as_bytes())
            .map_err(|_| RouteError::InvalidMethod(raw.to_string()))?;
        if !out.contains(&method) {
            out.push(method);
        }
    }
    Ok(out)
}

/// What a registered pattern leads to
#[derive(Clone)]
pub enum Endpoint {
    Handler(SharedHandler),
    Subrouter(Arc<Router>),
}

/// Outcome of a lookup
#[derive(Clone)]
pub enum RouteMatch {
    Found {
        handler: SharedHandler,
        params: RouteParams,
        pattern: String,
    },
    MethodNotAllowed,
    NotFound,
}

impl RouteMatch {
    /// Pattern that matched, if any
    pub fn pattern(&self) -> Option<&str> {
        match self {
            Self::Found { pattern, .. } => Some(pattern),
            _ => None,
        }
    }
}

#[derive(Default)]
struct MethodTable {
    statics: HashMap<String, (String, Endpoint)>,
    params: Vec<(RoutePattern, Endpoint)>,
    wildcards: Vec<(RoutePattern, Endpoint)>,
}

impl MethodTable {
    fn insert(&mut self, pattern: &RoutePattern, endpoint: Endpoint) -> bool {
        match pattern.kind() {
            PatternKind::Static => {
                if self.statics.contains_key(pattern.path()) {
                    return false;
                }
                self.statics.insert(
                    pattern.path().to_string(),
                    (pattern.path().to_string(), endpoint),
                );
                true
            }
            PatternKind::Param => Self::push_unique(&mut self.params, pattern, endpoint),
            PatternKind::Wildcard => Self::push_unique(&mut self.wildcards, pattern, endpoint),
        }
    }

    fn push_unique(
        bucket: &mut Vec<(RoutePattern, Endpoint)>,
        pattern: &RoutePattern,
        endpoint: Endpoint,
    ) -> bool {
        if bucket.iter().any(|(p, _)| p.path() == pattern.path()) {
            return false;
        }
        bucket.push((pattern.clone(), endpoint));
        true
    }

    fn lookup(&self, method: &Method, path: &str) -> Option<RouteMatch> {
        if let Some((pattern, endpoint)) = self.statics.get(path) {
            return Some(endpoint.resolve(method, path, RouteParams::default(), pattern));
        }
        for bucket in [&self.params, &self.wildcards] {
            for (pattern, endpoint) in bucket {
                if let Some(params) = pattern.matches(path) {
                    return Some(endpoint.resolve(method, path, params, pattern.path()));
                }
            }
        }
        None
    }
}

impl Endpoint {
    fn resolve(&self, method: &Method, path: &str, params: RouteParams, pattern: &str) -> RouteMatch {
        match self {
            Self::Handler(handler) => RouteMatch::Found {
                handler: handler.clone(),
                params,
                pattern: pattern.to_string(),
            },
            Self::Subrouter(nested) => nested.find(method, path),
        }
    }
}

/// Per-method route tables with static > param > wildcard precedence
#[derive(Default)]
pub struct Router {
    tables: HashMap<Method, MethodTable>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `endpoint` for every method in `methods`.
    ///
    /// Returns how many registrations were accepted; duplicates of an already registered
    /// pattern are ignored so the first registration wins.
    pub fn add(&mut self, methods: &[Method], pattern: &RoutePattern, endpoint: Endpoint) -> usize {
        let mut accepted = 0;
        for method in methods {
            let table = self.tables.entry(method.clone()).or_default();
            if table.insert(pattern, endpoint.clone()) {
                accepted += 1;
            } else {
                tracing::warn!(
                    method = %method,
                    path = pattern.path(),
                    "Duplicate route ignored, first registration wins"
                );
            }
        }
        accepted
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Find the handler for a request line
    pub fn find(&self, method: &Method, path: &str) -> RouteMatch {
        if let Some(found) = self
            .tables
            .get(method)
            .and_then(|table| table.lookup(method, path))
        {
            return found;
        }

        let allowed_elsewhere = self
            .tables
            .iter()
            .filter(|(other, _)| *other != method)
            .any(|(other, table)| {
                matches!(table.lookup(other, path), Some(RouteMatch::Found { .. }))
            });
        if allowed_elsewhere {
            RouteMatch::MethodNotAllowed
        } else {
            RouteMatch::NotFound
        }
    }
}

impl Handler for Router {
    fn call(&self, mut req: Request) -> HandlerFuture {
        match self.find(req.method(), req.uri().path()) {
            RouteMatch::Found {
                handler,
                params,
                pattern,
            } => {
                req.extensions_mut().insert(params);
                req.extensions_mut().insert(MatchedRoute(pattern));
                handler.call(req)
            }
            RouteMatch::MethodNotAllowed => {
                ready(GatewayError::new(ErrorCode::METHOD_NOT_ALLOWED).into_response()).boxed()
            }
            RouteMatch::NotFound => {
                ready(GatewayError::new(ErrorCode::ROUTE_NOT_FOUND).into_response()).boxed()
            }
        }
    }
}
