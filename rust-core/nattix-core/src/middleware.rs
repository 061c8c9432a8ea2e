//! # Middleware System
//!
//! Pre-action hooks that may block a request or let it through, plus
//! after-response hooks.
//!
//! Two places run middlewares:
//!
//! - the kernel's global [`MiddlewareChain`] (every request), and
//! - per-route / per-controller lists, resolved at route registration
//!   through the [`MiddlewareRegistry`].

use crate::error::{Error, Result};
use crate::request::Request;
use crate::response::Response;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Middleware trait for request/response interception
///
/// `before` runs ahead of the action, in registration order; `after` runs
/// once a response exists, in reverse order.
pub trait Middleware: Send + Sync {
    /// Called before the action
    ///
    /// Can modify the request/response or return early with a response.
    fn before(&self, _req: &mut Request, _res: &mut Response) -> MiddlewareResult {
        MiddlewareResult::Continue
    }

    /// Called after the action
    fn after(&self, _req: &Request, _res: &mut Response) {}

    /// Middleware name for logging
    fn name(&self) -> &str {
        "Unknown"
    }
}

/// Result of middleware execution
#[derive(Debug)]
pub enum MiddlewareResult {
    /// Continue to next middleware/handler
    Continue,
    /// Short-circuit with this response (skip handler)
    Respond(Response),
}

/// Shared middleware handle
pub type SharedMiddleware = Arc<dyn Middleware>;

/// Closure middleware
pub struct FnMiddleware<F> {
    name: String,
    func: F,
}

impl<F> FnMiddleware<F>
where
    F: Fn(&mut Request, &mut Response) -> MiddlewareResult + Send + Sync,
{
    /// Wrap a closure
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }
}

impl<F> Middleware for FnMiddleware<F>
where
    F: Fn(&mut Request, &mut Response) -> MiddlewareResult + Send + Sync,
{
    fn before(&self, req: &mut Request, res: &mut Response) -> MiddlewareResult {
        (self.func)(req, res)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// A middleware as declared on a route or controller
#[derive(Clone)]
pub enum MiddlewareRef {
    /// Looked up in the [`MiddlewareRegistry`] by conventional name
    Named(String),
    /// Used as is
    Instance(SharedMiddleware),
}

impl MiddlewareRef {
    /// Declare a closure middleware
    pub fn func<F>(func: F) -> Self
    where
        F: Fn(&mut Request, &mut Response) -> MiddlewareResult + Send + Sync + 'static,
    {
        Self::Instance(Arc::new(FnMiddleware::new("closure", func)))
    }
}

impl From<&str> for MiddlewareRef {
    fn from(name: &str) -> Self {
        Self::Named(name.to_string())
    }
}

impl std::fmt::Debug for MiddlewareRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Named(name) => f.debug_tuple("Named").field(name).finish(),
            Self::Instance(mw) => f.debug_tuple("Instance").field(&mw.name()).finish(),
        }
    }
}

/// Conventional class name for a middleware name
///
/// `auth` → `AuthMiddleware`, `rate-limit` → `RateLimitMiddleware`,
/// `AuthMiddleware` stays as is.
#[must_use]
pub fn conventional_name(name: &str) -> String {
    let mut out: String = name
        .split(|c: char| c == '-' || c == '_' || c == ' ')
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            chars.next().map_or_else(String::new, |first| {
                first.to_uppercase().chain(chars).collect::<String>()
            })
        })
        .collect();
    if !out.ends_with("Middleware") {
        out.push_str("Middleware");
    }
    out
}

/// Named middlewares available to routes and controllers
#[derive(Default, Clone)]
pub struct MiddlewareRegistry {
    entries: HashMap<String, SharedMiddleware>,
}

impl MiddlewareRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a middleware under its conventional name
    pub fn register<M: Middleware + 'static>(&mut self, name: &str, middleware: M) {
        self.entries
            .insert(conventional_name(name), Arc::new(middleware));
    }

    /// Look up by any spelling that maps to the same conventional name
    ///
    /// # Errors
    ///
    /// Returns `Error::MiddlewareNotFound` if nothing is registered.
    pub fn resolve(&self, name: &str) -> Result<SharedMiddleware> {
        let key = conventional_name(name);
        self.entries
            .get(&key)
            .cloned()
            .ok_or(Error::MiddlewareNotFound { name: key })
    }

    /// Turn a declaration into a runnable middleware
    ///
    /// # Errors
    ///
    /// Returns `Error::MiddlewareNotFound` for unknown names.
    pub fn instantiate(&self, reference: &MiddlewareRef) -> Result<SharedMiddleware> {
        match reference {
            MiddlewareRef::Named(name) => self.resolve(name),
            MiddlewareRef::Instance(mw) => Ok(Arc::clone(mw)),
        }
    }

    /// Whether a name resolves
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(&conventional_name(name))
    }
}

/// Run `before` hooks in order; the first `Respond` wins
pub fn run_before(
    middlewares: &[SharedMiddleware],
    req: &mut Request,
    res: &mut Response,
) -> MiddlewareResult {
    for mw in middlewares {
        match mw.before(req, res) {
            MiddlewareResult::Continue => continue,
            result => return result,
        }
    }
    MiddlewareResult::Continue
}

/// Middleware chain for processing requests
#[derive(Default, Clone)]
pub struct MiddlewareChain {
    middlewares: Vec<SharedMiddleware>,
}

impl MiddlewareChain {
    /// Create a new empty middleware chain
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a middleware to the chain
    pub fn add<M: Middleware + 'static>(&mut self, middleware: M) {
        self.middlewares.push(Arc::new(middleware));
    }

    /// Execute `before` for all middlewares
    pub fn run_before(&self, req: &mut Request, res: &mut Response) -> MiddlewareResult {
        run_before(&self.middlewares, req, res)
    }

    /// Execute `after` for all middlewares (in reverse order)
    pub fn run_after(&self, req: &Request, res: &mut Response) {
        for mw in self.middlewares.iter().rev() {
            mw.after(req, res);
        }
    }

    /// Get the number of middlewares
    #[must_use]
    pub fn len(&self) -> usize {
        self.middlewares.len()
    }

    /// Check if chain is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }
}

/// Logging middleware - structured request/response log lines
#[derive(Default)]
pub struct LoggingMiddleware;

impl LoggingMiddleware {
    /// Create a new logging middleware
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

/// Header the logging middleware stamps with the request start time
const STARTED_HEADER: &str = "x-nattix-started-ns";

impl Middleware for LoggingMiddleware {
    fn before(&self, req: &mut Request, _res: &mut Response) -> MiddlewareResult {
        let request_id = req.header("x-request-id").unwrap_or("-").to_string();
        info!(
            method = %req.method,
            path = %req.path,
            request_id = %request_id,
            "Request received"
        );
        let started = START.get_or_init(Instant::now).elapsed().as_nanos();
        req.set_header(STARTED_HEADER, &started.to_string());
        MiddlewareResult::Continue
    }

    fn after(&self, req: &Request, res: &mut Response) {
        let request_id = req.header("x-request-id").unwrap_or("-");
        let duration_ms = req
            .header(STARTED_HEADER)
            .and_then(|s| s.parse::<u128>().ok())
            .map(|started| {
                START
                    .get_or_init(Instant::now)
                    .elapsed()
                    .as_nanos()
                    .saturating_sub(started)
                    / 1_000_000
            })
            .unwrap_or_default();
        info!(
            method = %req.method,
            path = %req.path,
            status = res.status,
            request_id = %request_id,
            duration_ms = %duration_ms,
            "Response sent"
        );
    }

    fn name(&self) -> &str {
        "LoggingMiddleware"
    }
}

static START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();

/// CORS middleware - adds Cross-Origin Resource Sharing headers
#[derive(Clone)]
pub struct CorsMiddleware {
    allow_origin: String,
    allow_methods: String,
    allow_headers: String,
}

impl Default for CorsMiddleware {
    fn default() -> Self {
        Self {
            allow_origin: "*".to_string(),
            allow_methods: "GET, POST, PUT, DELETE, PATCH, OPTIONS".to_string(),
            allow_headers: "Content-Type, Authorization".to_string(),
        }
    }
}

impl CorsMiddleware {
    /// Create a new CORS middleware with default settings
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set allowed origin
    #[must_use]
    pub fn allow_origin(mut self, origin: impl Into<String>) -> Self {
        self.allow_origin = origin.into();
        self
    }

    /// Set allowed methods
    #[must_use]
    pub fn allow_methods(mut self, methods: impl Into<String>) -> Self {
        self.allow_methods = methods.into();
        self
    }

    /// Get the Access-Control-Allow-Origin header value
    #[must_use]
    pub fn origin(&self) -> &str {
        &self.allow_origin
    }
}

impl Middleware for CorsMiddleware {
    fn after(&self, _req: &Request, res: &mut Response) {
        res.set_header("Access-Control-Allow-Origin", &self.allow_origin);
        res.set_header("Access-Control-Allow-Methods", &self.allow_methods);
        res.set_header("Access-Control-Allow-Headers", &self.allow_headers);
    }

    fn name(&self) -> &str {
        "CorsMiddleware"
    }
}

/// Bearer-token authentication (HS256 JWT)
///
/// On success the decoded claims are stored on the request.
#[derive(Clone)]
pub struct AuthMiddleware {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl AuthMiddleware {
    /// Create from shared secret
    #[must_use]
    pub fn new(secret: &str) -> Self {
        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }

    fn unauthorized(message: &str) -> MiddlewareResult {
        MiddlewareResult::Respond(Response::json_error(message, 401))
    }
}

impl Middleware for AuthMiddleware {
    fn before(&self, req: &mut Request, _res: &mut Response) -> MiddlewareResult {
        let Some(token) = req
            .header("authorization")
            .and_then(|h| h.strip_prefix("Bearer "))
            .map(str::to_string)
        else {
            return Self::unauthorized("Missing or invalid Authorization header");
        };

        match decode::<serde_json::Value>(&token, &self.decoding_key, &self.validation) {
            Ok(token_data) => {
                req.claims = Some(token_data.claims);
                MiddlewareResult::Continue
            }
            Err(e) => {
                warn!("JWT validation failed: {}", e);
                Self::unauthorized("Unauthorized")
            }
        }
    }

    fn name(&self) -> &str {
        "AuthMiddleware"
    }
}
