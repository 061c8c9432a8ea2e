//! # Kernel
//!
//! The front controller. [`AppContext`] bundles the per-application services
//! (configuration, paths, container, database, hooks, sessions, cookies) and is
//! shared behind an `Arc` with every controller and plugin. [`Kernel`] owns the
//! route table and turns one [`Request`] into one [`Response`]: errors that
//! escape routing or an action are rendered here and nowhere else.

use crate::config::Config;
use crate::container::Container;
use crate::controller::ControllerRegistry;
use crate::cookie::CookieJar;
use crate::database::Database;
use crate::error::{Error, Result};
use crate::hooks::Hooks;
use crate::middleware::{LoggingMiddleware, Middleware, MiddlewareChain, MiddlewareRegistry, MiddlewareResult};
use crate::path::PathResolver;
use crate::plugins::{load_plugins, LoadedPlugin, PluginRegistry, ScanOptions};
use crate::request::{sanitize, Request};
use crate::response::Response;
use crate::router::Router;
use crate::server::{Server, ServerConfig};
use crate::session::SessionStore;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, error, info, warn};

/// Container binding holding the shared [`Database`]
pub const DATABASE_BINDING: &str = "database";

/// Hook fired once every plugin has booted
pub const PLUGINS_LOADED_HOOK: &str = "plugins_loaded";

/// Services shared by the whole application
pub struct AppContext {
    /// Merged configuration
    pub config: Config,
    /// Project path resolver
    pub paths: PathResolver,
    /// Dependency-injection container
    pub container: Container,
    /// Database connection, when `DB_*` keys are configured
    pub database: Option<Arc<Database>>,
    /// Action hooks
    pub hooks: Hooks,
    /// Session storage
    pub sessions: SessionStore,
    /// Encrypted cookie jar, when `COOKIE_SECRET` is configured
    pub cookies: Option<CookieJar>,
    /// `URL_ROOT` without trailing slash
    pub url_root: String,
}

impl AppContext {
    /// Context rooted at `root`, without a database
    pub fn new(root: impl AsRef<Path>, config: Config) -> Self {
        let cookies = match CookieJar::from_config(&config) {
            Ok(jar) => Some(jar),
            Err(e) => {
                debug!("Encrypted cookies disabled: {}", e);
                None
            }
        };
        let url_root = config.url_root();
        let secure = url_root.starts_with("https://");

        Self {
            paths: PathResolver::new(root),
            container: Container::new(),
            database: None,
            hooks: Hooks::new(),
            sessions: SessionStore::new().secure(secure),
            cookies,
            url_root,
            config,
        }
    }

    /// Attach a database and bind it in the container
    #[must_use]
    pub fn with_database(mut self, database: Database) -> Self {
        let database = Arc::new(database);
        self.container
            .instance(DATABASE_BINDING, Arc::clone(&database));
        self.database = Some(database);
        self
    }

    /// The database, or a configuration error when none is set up
    ///
    /// # Errors
    ///
    /// `Error::Config` when no `DB_*` configuration was found at bootstrap.
    pub fn db(&self) -> Result<&Database> {
        self.database.as_deref().ok_or_else(|| Error::Config {
            message: "no database configured".to_string(),
        })
    }

    #[cfg(test)]
    pub(crate) fn for_tests() -> Self {
        Self::new(std::env::temp_dir(), Config::new())
    }
}

/// Application kernel: route table, registries and the request pipeline
pub struct Kernel {
    ctx: Arc<AppContext>,
    router: Router,
    plugins: PluginRegistry,
    middleware: MiddlewareChain,
}

impl Kernel {
    /// Load configuration from `root`, connect the database and build a kernel
    ///
    /// # Errors
    ///
    /// Configuration files that exist but cannot be parsed, or a database that
    /// is configured but unreachable.
    pub async fn bootstrap(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        let config = Config::load(root)?;
        let database = Database::from_config(&config).await?;

        let mut ctx = AppContext::new(root, config);
        if let Some(database) = database {
            ctx = ctx.with_database(database);
        }
        info!(root = %root.display(), "Application bootstrapped");
        Ok(Self::new(ctx))
    }

    /// Kernel around an already built context
    pub fn new(ctx: AppContext) -> Self {
        let mut middleware = MiddlewareChain::new();
        middleware.add(LoggingMiddleware::new());

        Self {
            ctx: Arc::new(ctx),
            router: Router::new(),
            plugins: PluginRegistry::new(),
            middleware,
        }
    }

    /// Shared application context
    #[must_use]
    pub fn context(&self) -> &Arc<AppContext> {
        &self.ctx
    }

    /// Route table
    #[must_use]
    pub const fn router(&self) -> &Router {
        &self.router
    }

    /// Route table, for declaring routes
    pub fn router_mut(&mut self) -> &mut Router {
        &mut self.router
    }

    /// Controller registry
    pub fn controllers_mut(&mut self) -> &mut ControllerRegistry {
        self.router.controllers_mut()
    }

    /// Named middleware registry
    pub fn middlewares_mut(&mut self) -> &mut MiddlewareRegistry {
        self.router.middlewares_mut()
    }

    /// Compiled-in plugin implementations
    pub fn plugins_mut(&mut self) -> &mut PluginRegistry {
        &mut self.plugins
    }

    /// Add a middleware that wraps every request
    pub fn add_middleware<M: Middleware + 'static>(&mut self, middleware: M) {
        self.middleware.add(middleware);
    }

    /// Scan `<root>/plugins`, validate the manifests and boot every plugin
    ///
    /// # Errors
    ///
    /// The first validation failure, a plugin id without a registered
    /// implementation, or an error from a plugin's `boot`/`routes`.
    pub fn load_plugins(&mut self) -> Result<Vec<LoadedPlugin>> {
        self.load_plugins_with(&ScanOptions::default())
    }

    /// [`Self::load_plugins`] with explicit scan options
    ///
    /// # Errors
    ///
    /// See [`Self::load_plugins`].
    pub fn load_plugins_with(&mut self, options: &ScanOptions) -> Result<Vec<LoadedPlugin>> {
        let loaded = load_plugins(&self.ctx.paths.plugins_path(), options)?;
        self.plugins.boot(&loaded, &self.ctx, &mut self.router)?;
        self.ctx.hooks.do_action(PLUGINS_LOADED_HOOK, &[]);
        info!(count = loaded.len(), "Plugins loaded");
        Ok(loaded)
    }

    /// Run one request through middlewares, routing and the error boundary
    pub async fn handle(&self, mut req: Request) -> Response {
        let request_id = match req.header("x-request-id") {
            Some(id) => id.to_string(),
            None => {
                let id = generate_request_id();
                req.set_header("x-request-id", &id);
                id
            }
        };
        if req.session_id.is_none() {
            req.session_id = self.ctx.sessions.current_id(&req);
        }
        let wants_json = req.wants_json();

        let mut res = Response::new();
        let (mut response, finished) = match self.middleware.run_before(&mut req, &mut res) {
            MiddlewareResult::Respond(early) => (early, req),
            MiddlewareResult::Continue => {
                let snapshot = req.clone();
                let response = match self.router.resolve(Arc::clone(&self.ctx), req, res).await {
                    Ok(response) => response,
                    Err(err) => render_error(&err, wants_json),
                };
                (response, snapshot)
            }
        };

        response.set_header("x-request-id", &request_id);
        self.middleware.run_after(&finished, &mut response);
        response
    }

    /// Serve the application over HTTP until Ctrl-C
    ///
    /// # Errors
    ///
    /// An `APP_ADDR` that is not a socket address, or a bind failure.
    pub async fn run(self) -> Result<()> {
        let config = ServerConfig::from_config(&self.ctx.config)?;
        Server::new(Arc::new(self), config).serve().await
    }
}

/// Present an error that reached the request boundary
///
/// The error is logged at its level and turned into a styled HTML page, or a
/// JSON object when the client asked for JSON.
#[must_use]
pub fn render_error(err: &Error, wants_json: bool) -> Response {
    let status = err.status_code();
    let level = err.level();
    match level {
        "info" => info!(status, level, "{}", err),
        "critical" => error!(status, level, "{}", err),
        _ => warn!(status, level, "{}", err),
    }

    if wants_json {
        return Response::json_value(&serde_json::json!({
            "error": true,
            "level": level,
            "status": status,
            "message": err.to_string(),
        }))
        .with_status(status);
    }

    Response::html(error_page(level, &sanitize(&err.to_string()))).with_status(status)
}

fn level_style(level: &str) -> &'static str {
    match level {
        "info" => "background-color: #007BFF; color: #FFFFFF;",
        "critical" => "background-color: #FF0000; color: #FFFFFF; font-weight: bold;",
        "warning" => "background-color: #FFA500; color: #000000;",
        _ => "background-color: tomato; color: #FFFFFF;",
    }
}

fn error_page(level: &str, message: &str) -> String {
    let style = level_style(level);
    format!(
        r#"<!DOCTYPE html>
<html lang="en-us">
<head>
<title>Nattix Error</title>
<style>
body {{ margin: 0; padding: 0; background-color: #F0F0F0; }}
.error-container {{ display: flex; align-items: center; justify-content: center; height: 100vh; }}
.error-box {{ background-color: #FFF; width: 80%; max-width: 600px; border: 1px solid #E0E0E0; border-radius: 5px; padding: 20px; text-align: center; }}
h2 {{ text-transform: uppercase; color: #333; }}
</style>
</head>
<body>
<div class="error-container">
<div class="error-box">
<h2>Nattix Error</h2>
<div style="{style}border-radius: 5px; padding: 10px; margin-top: 10px;">
<strong>{level}:</strong> {message}
</div>
</div>
</div>
</body>
</html>
"#
    )
}

static REQUEST_COUNTER: AtomicUsize = AtomicUsize::new(1);

fn generate_request_id() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let counter = REQUEST_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{:x}-{:x}", now.as_nanos(), counter)
}
