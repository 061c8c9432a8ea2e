//! # Router
//!
//! Maps an HTTP method and path to a closure or a controller action.
//!
//! ## Matching
//!
//! 1. Exact match of the raw request path against the literal routes of the
//!    method (indexed in a `matchit` radix tree).
//! 2. Otherwise every pattern of the method is tried in registration order
//!    against the slash-trimmed path; the first full match wins and its
//!    captures become the request's parameter bag.
//!
//! Controller targets and named middlewares are resolved when the route is
//! declared, so a typo fails at startup instead of on the first request.

use crate::controller::{ActionHandle, BoxFuture, ControllerRegistry};
use crate::error::{Error, Result};
use crate::kernel::AppContext;
use crate::middleware::{run_before, MiddlewareRef, MiddlewareRegistry, MiddlewareResult, SharedMiddleware};
use crate::request::Request;
use crate::response::Response;
use crate::route::RouteInfo;
use crate::types::ParamValue;
use matchit::Router as MatchitRouter;
use std::collections::HashMap;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;

/// HTTP methods supported by the router
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// HTTP GET
    Get,
    /// HTTP POST
    Post,
    /// HTTP PUT
    Put,
    /// HTTP DELETE
    Delete,
    /// HTTP PATCH
    Patch,
    /// HTTP HEAD
    Head,
    /// HTTP OPTIONS
    Options,
}

impl Method {
    /// Convert from hyper's method (unknown methods map to GET)
    #[must_use]
    pub fn from_hyper(method: &hyper::Method) -> Self {
        method.as_str().parse().unwrap_or(Self::Get)
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Get => write!(f, "GET"),
            Self::Post => write!(f, "POST"),
            Self::Put => write!(f, "PUT"),
            Self::Delete => write!(f, "DELETE"),
            Self::Patch => write!(f, "PATCH"),
            Self::Head => write!(f, "HEAD"),
            Self::Options => write!(f, "OPTIONS"),
        }
    }
}

impl FromStr for Method {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "GET" => Ok(Self::Get),
            "POST" => Ok(Self::Post),
            "PUT" => Ok(Self::Put),
            "DELETE" => Ok(Self::Delete),
            "PATCH" => Ok(Self::Patch),
            "HEAD" => Ok(Self::Head),
            "OPTIONS" => Ok(Self::Options),
            other => Err(Error::InvalidRoutePattern {
                pattern: other.to_string(),
                reason: "unsupported HTTP method".to_string(),
            }),
        }
    }
}

/// Route handler identifier
pub type HandlerId = usize;

/// Closure route handler
pub type ClosureHandler =
    Arc<dyn Fn(Request, Response) -> BoxFuture<'static, Result<Response>> + Send + Sync>;

/// What a route dispatches to, as declared
pub enum RouteTarget {
    /// Closure invoked with (request, response)
    Closure(ClosureHandler),
    /// `"Controller@action"`
    Action(String),
    /// `("Controller", "action")`
    Pair(String, String),
}

impl RouteTarget {
    /// Wrap an async closure
    pub fn closure<F, Fut>(handler: F) -> Self
    where
        F: Fn(Request, Response) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Response>> + Send + 'static,
    {
        Self::Closure(Arc::new(move |req, res| Box::pin(handler(req, res))))
    }
}

impl From<&str> for RouteTarget {
    fn from(target: &str) -> Self {
        Self::Action(target.to_string())
    }
}

impl From<(&str, &str)> for RouteTarget {
    fn from((controller, action): (&str, &str)) -> Self {
        Self::Pair(controller.to_string(), action.to_string())
    }
}

/// Resolved route callback
#[derive(Clone)]
enum Callback {
    Closure(ClosureHandler),
    Action(ActionHandle),
}

#[derive(Clone)]
struct RouteEntry {
    info: RouteInfo,
    callback: Callback,
    middlewares: Vec<SharedMiddleware>,
}

/// Matched route with extracted and converted parameters
#[derive(Debug)]
pub struct Match {
    /// The handler ID for this route
    pub handler_id: HandlerId,
    /// Pattern the route was registered with
    pub pattern: String,
    /// Captured values, in placeholder order
    pub params: Vec<(String, String)>,
    /// Typed path parameters
    pub typed_params: HashMap<String, ParamValue>,
}

impl Match {
    /// Raw captured value by name
    #[must_use]
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Get a typed parameter by name
    #[must_use]
    pub fn get_typed(&self, name: &str) -> Option<&ParamValue> {
        self.typed_params.get(name)
    }

    /// Get a parameter as i64 (convenience method)
    #[must_use]
    pub fn get_int(&self, name: &str) -> Option<i64> {
        self.typed_params.get(name).and_then(ParamValue::as_int)
    }

    /// Get a parameter as f64 (convenience method)
    #[must_use]
    pub fn get_float(&self, name: &str) -> Option<f64> {
        self.typed_params.get(name).and_then(ParamValue::as_float)
    }

    /// Get a parameter as bool (convenience method)
    #[must_use]
    pub fn get_bool(&self, name: &str) -> Option<bool> {
        self.typed_params.get(name).and_then(ParamValue::as_bool)
    }
}

/// Per-method storage for routes
#[derive(Clone)]
struct MethodRoutes {
    /// Literal paths, for the exact-match step
    literals: MatchitRouter<usize>,
    /// Entries in registration order
    entries: Vec<RouteEntry>,
    /// Registered path string → entry index
    by_path: HashMap<String, usize>,
}

impl Default for MethodRoutes {
    fn default() -> Self {
        Self {
            literals: MatchitRouter::new(),
            entries: Vec::new(),
            by_path: HashMap::new(),
        }
    }
}

/// HTTP router
#[derive(Default)]
pub struct Router {
    method_routes: HashMap<Method, MethodRoutes>,
    controllers: ControllerRegistry,
    middlewares: MiddlewareRegistry,
    next_handler_id: HandlerId,
}

impl Router {
    /// Create a new empty router
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Controllers that `"Controller@action"` targets resolve against
    pub fn controllers_mut(&mut self) -> &mut ControllerRegistry {
        &mut self.controllers
    }

    /// Named middlewares that routes and controllers resolve against
    pub fn middlewares_mut(&mut self) -> &mut MiddlewareRegistry {
        &mut self.middlewares
    }

    /// Named middlewares
    #[must_use]
    pub const fn middlewares(&self) -> &MiddlewareRegistry {
        &self.middlewares
    }

    /// Register a route
    ///
    /// Registering the same path string twice for a method replaces the
    /// earlier callback without changing its precedence.
    ///
    /// # Errors
    ///
    /// - `InvalidRoutePattern` for a malformed pattern or a target string
    ///   without exactly one `@`
    /// - `ControllerNotFound` / `MethodNotFound` for unknown targets
    /// - `MiddlewareNotFound` for unknown middleware names
    pub fn add_route(
        &mut self,
        method: Method,
        path: &str,
        target: RouteTarget,
        middlewares: Vec<MiddlewareRef>,
    ) -> Result<HandlerId> {
        let callback = self.resolve_target(path, target)?;
        let middlewares = middlewares
            .iter()
            .map(|m| self.middlewares.instantiate(m))
            .collect::<Result<Vec<_>>>()?;

        let routes = self.method_routes.entry(method).or_default();

        if let Some(&index) = routes.by_path.get(path) {
            let entry = &mut routes.entries[index];
            entry.callback = callback;
            entry.middlewares = middlewares;
            debug!(%method, path, "Route replaced");
            return Ok(entry.info.handler_id);
        }

        let handler_id = self.next_handler_id;
        let info = RouteInfo::new(handler_id, path)?;
        self.next_handler_id += 1;

        let index = routes.entries.len();
        if info.is_literal() {
            if let Err(e) = routes.literals.insert(path, index) {
                // The ordered scan still finds it
                debug!(path, error = %e, "Literal route not indexed");
            }
        }
        routes.by_path.insert(path.to_string(), index);
        routes.entries.push(RouteEntry {
            info,
            callback,
            middlewares,
        });

        Ok(handler_id)
    }

    fn resolve_target(&self, path: &str, target: RouteTarget) -> Result<Callback> {
        match target {
            RouteTarget::Closure(handler) => Ok(Callback::Closure(handler)),
            RouteTarget::Pair(controller, action) => self
                .controllers
                .lookup(&controller, &action)
                .map(Callback::Action),
            RouteTarget::Action(target) => {
                let mut parts = target.split('@');
                match (parts.next(), parts.next(), parts.next()) {
                    (Some(controller), Some(action), None)
                        if !controller.is_empty() && !action.is_empty() =>
                    {
                        self.controllers
                            .lookup(controller, action)
                            .map(Callback::Action)
                    }
                    _ => Err(Error::InvalidRoutePattern {
                        pattern: path.to_string(),
                        reason: format!("'{target}' is not of the form Controller@action"),
                    }),
                }
            }
        }
    }

    /// Register a GET route
    ///
    /// # Errors
    ///
    /// See [`Router::add_route`].
    pub fn get(&mut self, path: &str, target: impl Into<RouteTarget>) -> Result<HandlerId> {
        self.add_route(Method::Get, path, target.into(), Vec::new())
    }

    /// Register a POST route
    ///
    /// # Errors
    ///
    /// See [`Router::add_route`].
    pub fn post(&mut self, path: &str, target: impl Into<RouteTarget>) -> Result<HandlerId> {
        self.add_route(Method::Post, path, target.into(), Vec::new())
    }

    /// Register a PUT route
    ///
    /// # Errors
    ///
    /// See [`Router::add_route`].
    pub fn put(&mut self, path: &str, target: impl Into<RouteTarget>) -> Result<HandlerId> {
        self.add_route(Method::Put, path, target.into(), Vec::new())
    }

    /// Register a PATCH route
    ///
    /// # Errors
    ///
    /// See [`Router::add_route`].
    pub fn patch(&mut self, path: &str, target: impl Into<RouteTarget>) -> Result<HandlerId> {
        self.add_route(Method::Patch, path, target.into(), Vec::new())
    }

    /// Register a DELETE route
    ///
    /// # Errors
    ///
    /// See [`Router::add_route`].
    pub fn delete(&mut self, path: &str, target: impl Into<RouteTarget>) -> Result<HandlerId> {
        self.add_route(Method::Delete, path, target.into(), Vec::new())
    }

    /// Register a GET route with route-level middlewares
    ///
    /// # Errors
    ///
    /// See [`Router::add_route`].
    pub fn get_with(
        &mut self,
        path: &str,
        target: impl Into<RouteTarget>,
        middlewares: Vec<MiddlewareRef>,
    ) -> Result<HandlerId> {
        self.add_route(Method::Get, path, target.into(), middlewares)
    }

    /// Register a POST route with route-level middlewares
    ///
    /// # Errors
    ///
    /// See [`Router::add_route`].
    pub fn post_with(
        &mut self,
        path: &str,
        target: impl Into<RouteTarget>,
        middlewares: Vec<MiddlewareRef>,
    ) -> Result<HandlerId> {
        self.add_route(Method::Post, path, target.into(), middlewares)
    }

    /// Register a PUT route with route-level middlewares
    ///
    /// # Errors
    ///
    /// See [`Router::add_route`].
    pub fn put_with(
        &mut self,
        path: &str,
        target: impl Into<RouteTarget>,
        middlewares: Vec<MiddlewareRef>,
    ) -> Result<HandlerId> {
        self.add_route(Method::Put, path, target.into(), middlewares)
    }

    /// Register a PATCH route with route-level middlewares
    ///
    /// # Errors
    ///
    /// See [`Router::add_route`].
    pub fn patch_with(
        &mut self,
        path: &str,
        target: impl Into<RouteTarget>,
        middlewares: Vec<MiddlewareRef>,
    ) -> Result<HandlerId> {
        self.add_route(Method::Patch, path, target.into(), middlewares)
    }

    /// Register a DELETE route with route-level middlewares
    ///
    /// # Errors
    ///
    /// See [`Router::add_route`].
    pub fn delete_with(
        &mut self,
        path: &str,
        target: impl Into<RouteTarget>,
        middlewares: Vec<MiddlewareRef>,
    ) -> Result<HandlerId> {
        self.add_route(Method::Delete, path, target.into(), middlewares)
    }

    /// Register the CRUD routes of a resource controller
    ///
    /// Only actions the controller defines are routed. Returns how many
    /// routes were registered.
    ///
    /// # Errors
    ///
    /// `ControllerNotFound` if the controller defines none of the actions.
    pub fn resource(&mut self, path: &str, controller: &str) -> Result<usize> {
        let base = path.trim_end_matches('/');
        let routes = [
            (Method::Get, base.to_string(), "index"),
            (Method::Get, format!("{base}/create"), "create"),
            (Method::Post, base.to_string(), "store"),
            (Method::Get, format!("{base}/{{id}}"), "show"),
            (Method::Get, format!("{base}/{{id}}/edit"), "edit"),
            (Method::Put, format!("{base}/{{id}}"), "update"),
            (Method::Delete, format!("{base}/{{id}}"), "destroy"),
        ];

        let mut registered = 0;
        for (method, route_path, action) in routes {
            if !self.controllers.has_action(controller, action) {
                continue;
            }
            let route_path = if route_path.is_empty() { "/".to_string() } else { route_path };
            self.add_route(
                method,
                &route_path,
                RouteTarget::Pair(controller.to_string(), action.to_string()),
                Vec::new(),
            )?;
            registered += 1;
        }

        if registered == 0 {
            return Err(Error::ControllerNotFound {
                name: controller.to_string(),
            });
        }
        Ok(registered)
    }

    fn find(&self, method: Method, path: &str) -> Result<(&RouteEntry, Vec<(String, String)>)> {
        let not_found = || Error::NotFound {
            method: method.to_string(),
            path: path.to_string(),
        };
        let routes = self.method_routes.get(&method).ok_or_else(not_found)?;

        if let Ok(matched) = routes.literals.at(path) {
            return Ok((&routes.entries[*matched.value], Vec::new()));
        }

        let trimmed = path.trim_matches('/');
        routes
            .entries
            .iter()
            .filter(|entry| !entry.info.is_root())
            .find_map(|entry| entry.info.captures(trimmed).map(|params| (entry, params)))
            .ok_or_else(not_found)
    }

    /// Match a request path against registered routes
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` carrying the method and path when nothing
    /// matches.
    pub fn match_route(&self, method: Method, path: &str) -> Result<Match> {
        let (entry, params) = self.find(method, path)?;
        let typed_params = params
            .iter()
            .map(|(name, raw)| (name.clone(), entry.info.typed_value(name, raw)))
            .collect();

        Ok(Match {
            handler_id: entry.info.handler_id,
            pattern: entry.info.path_pattern.clone(),
            params,
            typed_params,
        })
    }

    /// Dispatch a request to its route
    ///
    /// Route middlewares run first, then the controller's own; a
    /// middleware that answers short-circuits the action.
    ///
    /// # Errors
    ///
    /// `NotFound` when nothing matches; otherwise whatever the controller
    /// constructor, a controller middleware lookup or the action returns.
    pub async fn resolve(
        &self,
        ctx: Arc<AppContext>,
        mut req: Request,
        mut res: Response,
    ) -> Result<Response> {
        let (entry, params) = self.find(req.method, &req.path)?;

        req.typed_params = params
            .iter()
            .map(|(name, raw)| (name.clone(), entry.info.typed_value(name, raw)))
            .collect();
        req.set_parameters(params);

        if let MiddlewareResult::Respond(early) = run_before(&entry.middlewares, &mut req, &mut res) {
            return Ok(early);
        }

        match &entry.callback {
            Callback::Closure(handler) => handler(req, res).await,
            Callback::Action(handle) => {
                debug!(target = ?handle, "Dispatching action");
                let bound = handle.instantiate(ctx)?;
                let controller_middlewares = bound
                    .middlewares()
                    .iter()
                    .map(|m| self.middlewares.instantiate(m))
                    .collect::<Result<Vec<_>>>()?;

                if let MiddlewareResult::Respond(early) =
                    run_before(&controller_middlewares, &mut req, &mut res)
                {
                    return Ok(early);
                }
                bound.invoke(req, res).await
            }
        }
    }

    /// Number of registered routes for a method
    #[must_use]
    pub fn route_count(&self, method: Method) -> usize {
        self.method_routes
            .get(&method)
            .map_or(0, |routes| routes.entries.len())
    }
}
