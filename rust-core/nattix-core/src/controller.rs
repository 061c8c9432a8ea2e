//! # Controllers
//!
//! Application controllers embed a [`ControllerBase`] and implement
//! [`Controller`]. Their actions are plain functions registered by name in the
//! [`ControllerRegistry`]; the router looks them up once, when a route is
//! declared, and instantiates the controller only when the route matches.

use crate::error::{Error, Result};
use crate::kernel::AppContext;
use crate::middleware::MiddlewareRef;
use crate::request::Request;
use crate::response::Response;
use crate::view::View;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;

/// Boxed future returned by actions and closure handlers
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Controller action: consumes the controller instance built for the request
pub type Action<C> = fn(C, Request, Response) -> BoxFuture<'static, Result<Response>>;

/// State shared by every controller
#[derive(Debug)]
pub struct ControllerBase {
    /// View used by the actions
    pub view: View,
    /// Name of the action being dispatched
    pub action: String,
    middlewares: Vec<MiddlewareRef>,
    current_user: Option<Value>,
}

impl ControllerBase {
    /// Base with a view rooted at the application's templates
    #[must_use]
    pub fn new(ctx: &AppContext) -> Self {
        Self {
            view: View::new(ctx.paths.templates_path(), ctx.url_root.clone()),
            action: String::new(),
            middlewares: Vec::new(),
            current_user: None,
        }
    }

    /// Attach a middleware that runs before every action of this controller
    pub fn register_middleware(&mut self, middleware: impl Into<MiddlewareRef>) {
        self.middlewares.push(middleware.into());
    }

    /// Middlewares registered on this controller
    #[must_use]
    pub fn middlewares(&self) -> &[MiddlewareRef] {
        &self.middlewares
    }

    /// Remember the authenticated user
    pub fn set_current_user(&mut self, user: Value) {
        self.current_user = Some(user);
    }

    /// The authenticated user, if any
    #[must_use]
    pub const fn current_user(&self) -> Option<&Value> {
        self.current_user.as_ref()
    }
}

/// Application controller
pub trait Controller: Send + Sized + 'static {
    /// Build an instance for one request
    ///
    /// # Errors
    ///
    /// Any error aborts the request and reaches the kernel's error boundary.
    fn create(ctx: Arc<AppContext>) -> Result<Self>;

    /// Shared controller state
    fn base(&self) -> &ControllerBase;

    /// Shared controller state, mutably
    fn base_mut(&mut self) -> &mut ControllerBase;

    /// Runs right after `create`
    fn on_construct(&mut self) {}
}

/// A controller instance bound to one of its actions
pub(crate) trait BoundAction: Send {
    fn middlewares(&self) -> Vec<MiddlewareRef>;
    fn invoke(self: Box<Self>, req: Request, res: Response) -> BoxFuture<'static, Result<Response>>;
}

struct Bound<C: Controller> {
    controller: C,
    action: Action<C>,
}

impl<C: Controller> BoundAction for Bound<C> {
    fn middlewares(&self) -> Vec<MiddlewareRef> {
        self.controller.base().middlewares().to_vec()
    }

    fn invoke(self: Box<Self>, req: Request, res: Response) -> BoxFuture<'static, Result<Response>> {
        (self.action)(self.controller, req, res)
    }
}

type ActionFactory = Arc<dyn Fn(Arc<AppContext>) -> Result<Box<dyn BoundAction>> + Send + Sync>;

/// Resolved `Controller@action` target
#[derive(Clone)]
pub struct ActionHandle {
    /// Controller name
    pub controller: String,
    /// Action name
    pub action: String,
    factory: ActionFactory,
}

impl ActionHandle {
    /// Instantiate the controller for one request
    pub(crate) fn instantiate(&self, ctx: Arc<AppContext>) -> Result<Box<dyn BoundAction>> {
        (self.factory)(ctx)
    }
}

impl std::fmt::Debug for ActionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.controller, self.action)
    }
}

#[derive(Default)]
struct ControllerEntry {
    actions: HashMap<String, ActionFactory>,
}

/// Controllers known to the application, by name
#[derive(Default)]
pub struct ControllerRegistry {
    entries: HashMap<String, ControllerEntry>,
}

impl ControllerRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a controller; add its actions on the returned builder
    pub fn register<C: Controller>(&mut self, name: &str) -> ControllerBuilder<'_, C> {
        ControllerBuilder {
            entry: self.entries.entry(name.to_string()).or_default(),
            _controller: PhantomData,
        }
    }

    /// Look up an action
    ///
    /// # Errors
    ///
    /// `ControllerNotFound` for an unknown controller, `MethodNotFound` when
    /// the controller has no such action.
    pub fn lookup(&self, controller: &str, action: &str) -> Result<ActionHandle> {
        let entry = self
            .entries
            .get(controller)
            .ok_or_else(|| Error::ControllerNotFound {
                name: controller.to_string(),
            })?;
        let factory = entry
            .actions
            .get(action)
            .ok_or_else(|| Error::MethodNotFound {
                controller: controller.to_string(),
                action: action.to_string(),
            })?;
        Ok(ActionHandle {
            controller: controller.to_string(),
            action: action.to_string(),
            factory: Arc::clone(factory),
        })
    }

    /// Whether the controller defines this action
    #[must_use]
    pub fn has_action(&self, controller: &str, action: &str) -> bool {
        self.entries
            .get(controller)
            .is_some_and(|e| e.actions.contains_key(action))
    }
}

/// Adds actions to a registered controller
pub struct ControllerBuilder<'a, C> {
    entry: &'a mut ControllerEntry,
    _controller: PhantomData<fn() -> C>,
}

impl<C: Controller> ControllerBuilder<'_, C> {
    /// Register an action under `name`
    #[must_use]
    pub fn action(self, name: &str, action: Action<C>) -> Self {
        let action_name = name.to_string();
        let factory: ActionFactory = Arc::new(move |ctx| {
            let mut controller = C::create(ctx)?;
            controller.on_construct();
            controller.base_mut().action.clone_from(&action_name);
            Ok(Box::new(Bound { controller, action }) as Box<dyn BoundAction>)
        });
        self.entry.actions.insert(name.to_string(), factory);
        self
    }
}

/// JSON response with permissive CORS headers
///
/// When the query string carries a `callback` parameter the body is wrapped
/// as JSONP.
#[must_use]
pub fn json_response<T: Serialize>(req: &Request, value: &T, status: u16) -> Response {
    let body = match crate::json::to_json(value) {
        Ok(body) => body,
        Err(_) => return json_error_response(req, "Error encoding JSON", 500),
    };

    let mut res = Response::json(body).with_status(status);
    res.set_header("Access-Control-Allow-Origin", "*")
        .set_header("Access-Control-Allow-Methods", "GET, POST, OPTIONS")
        .set_header("Access-Control-Allow-Headers", "Content-Type");

    if let Some(callback) = req.query_map().get("callback").filter(|c| is_js_identifier(c)) {
        let wrapped = format!("{callback}({});", res.body);
        res.set_content(wrapped)
            .set_header("Content-Type", "application/javascript");
    }
    res
}

/// `{"error": true, "message": ...}` through [`json_response`]
#[must_use]
pub fn json_error_response(req: &Request, message: &str, status: u16) -> Response {
    json_response(
        req,
        &serde_json::json!({ "error": true, "message": message }),
        status,
    )
}

fn is_js_identifier(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$' || c == '.')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::Method;
    use std::collections::HashMap;

    struct Pages {
        base: ControllerBase,
    }

    impl Controller for Pages {
        fn create(ctx: Arc<AppContext>) -> Result<Self> {
            Ok(Self {
                base: ControllerBase::new(&ctx),
            })
        }

        fn base(&self) -> &ControllerBase {
            &self.base
        }

        fn base_mut(&mut self) -> &mut ControllerBase {
            &mut self.base
        }

        fn on_construct(&mut self) {
            self.base.register_middleware("auth");
        }
    }

    impl Pages {
        fn show(self, req: Request, _res: Response) -> BoxFuture<'static, Result<Response>> {
            Box::pin(async move {
                let id = req.parameter_or("id", "none").to_string();
                Ok(Response::text(format!("{}:{id}", self.base.action)))
            })
        }
    }

    #[test]
    fn test_lookup_errors() {
        let mut registry = ControllerRegistry::new();
        let _ = registry.register::<Pages>("Pages").action("show", Pages::show);

        assert!(registry.has_action("Pages", "show"));
        assert!(matches!(
            registry.lookup("Posts", "show"),
            Err(Error::ControllerNotFound { .. })
        ));
        assert!(matches!(
            registry.lookup("Pages", "edit"),
            Err(Error::MethodNotFound { controller, action }) if controller == "Pages" && action == "edit"
        ));
    }

    #[tokio::test]
    async fn test_handle_instantiates_and_invokes() {
        let mut registry = ControllerRegistry::new();
        let _ = registry.register::<Pages>("Pages").action("show", Pages::show);
        let handle = registry.lookup("Pages", "show").unwrap();

        let ctx = Arc::new(AppContext::for_tests());
        let bound = handle.instantiate(ctx).unwrap();
        assert_eq!(bound.middlewares().len(), 1);

        let mut req = Request::new(Method::Get, "/pages/3", HashMap::new(), None);
        req.set_parameters(vec![("id".to_string(), "3".to_string())]);
        let res = bound.invoke(req, Response::new()).await.unwrap();
        assert_eq!(res.body, "show:3");
    }

    #[test]
    fn test_json_response_jsonp() {
        let req = Request::new(Method::Get, "/api?callback=handle", HashMap::new(), None);
        let res = json_response(&req, &serde_json::json!({ "ok": true }), 200);
        assert!(res.body.starts_with("handle("));
        assert!(res.body.ends_with(");"));
        assert_eq!(res.content_type, "application/javascript");
        assert_eq!(
            res.headers.get("Access-Control-Allow-Origin"),
            Some(&"*".to_string())
        );
    }

    #[test]
    fn test_json_response_ignores_unsafe_callback() {
        let req = Request::new(
            Method::Get,
            "/api?callback=alert(1)",
            HashMap::new(),
            None,
        );
        let res = json_error_response(&req, "nope", 400);
        assert_eq!(res.status, 400);
        assert_eq!(res.content_type, "application/json");
        assert!(res.body.contains("\"error\": true"));
    }
}
