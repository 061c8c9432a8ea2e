//! # Nattix front controller
//!
//! Bootstraps the application found at `NATTIX_ROOT` (or the current
//! directory), declares the site routes, loads plugins and serves HTTP.

mod site;
mod xhomepage;

use anyhow::Context;
use nattix_core::{AuthMiddleware, CorsMiddleware, Kernel, Method, Request, Response, RouteTarget};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("nattix=info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .try_init();
}

fn project_root() -> anyhow::Result<PathBuf> {
    match std::env::var_os("NATTIX_ROOT") {
        Some(root) => Ok(PathBuf::from(root)),
        None => std::env::current_dir().context("cannot read the current directory"),
    }
}

/// Declare the application routes on `kernel`
pub(crate) fn register_routes(kernel: &mut Kernel) -> nattix_core::Result<()> {
    site::register(kernel.controllers_mut());

    let secret = kernel
        .context()
        .config
        .get_str("JWT_SECRET")
        .filter(|s| !s.is_empty());

    let router = kernel.router_mut();
    router.get("/", ("SiteController", "index"))?;
    router.get("/users", "SiteController@users")?;
    router.get("/users/{id:int}", ("SiteController", "show"))?;
    router.get("/visits", ("SiteController", "visits"))?;
    router.get("/api/users", ("SiteController", "api_users"))?;
    router.get(
        "/api/status",
        RouteTarget::closure(|req: Request, _res: Response| async move {
            Ok(nattix_core::json_response(
                &req,
                &serde_json::json!({ "status": "ok", "version": nattix_core::VERSION }),
                200,
            ))
        }),
    )?;

    match secret {
        Some(secret) => {
            router
                .middlewares_mut()
                .register("auth", AuthMiddleware::new(&secret));
            router.get_with("/api/me", ("SiteController", "me"), vec!["auth".into()])?;
        }
        None => warn!("JWT_SECRET not set, /api/me is disabled"),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let root = project_root()?;
    let mut kernel = Kernel::bootstrap(&root)
        .await
        .with_context(|| format!("bootstrapping {}", root.display()))?;

    register_routes(&mut kernel)?;
    let cors_origin = kernel
        .context()
        .config
        .get_str("CORS_ORIGIN")
        .filter(|o| !o.is_empty());
    if let Some(origin) = cors_origin {
        kernel.add_middleware(CorsMiddleware::new().allow_origin(origin));
    }
    kernel
        .plugins_mut()
        .register(xhomepage::PLUGIN_ID, xhomepage::XHomepage);
    let plugins = kernel.load_plugins()?;

    info!(
        routes = kernel.router().route_count(Method::Get),
        plugins = plugins.len(),
        "Routes registered"
    );

    kernel.run().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nattix_core::{params, AppContext, Config, Database, QueryParams, Server, ServerConfig};
    use std::sync::Arc;
    use std::collections::HashMap;
    use std::fs;
    use tempfile::TempDir;

    fn app(dir: &TempDir) -> Kernel {
        app_with(dir, AppContext::new(dir.path(), Config::new()))
    }

    fn app_with(dir: &TempDir, ctx: AppContext) -> Kernel {
        let templates = dir.path().join("templates");
        fs::create_dir_all(templates.join("layouts")).unwrap();
        fs::write(templates.join("welcome.html"), "<h1>{{title}}</h1><p>{{view.name}}</p>").unwrap();
        fs::write(
            templates.join("layouts").join("default.html"),
            "<html>{{stylesheets}}{{content}}{{scripts}}</html>",
        )
        .unwrap();

        let mut kernel = Kernel::new(ctx);
        register_routes(&mut kernel).unwrap();
        kernel
    }

    fn get(path: &str) -> Request {
        Request::new(Method::Get, path, HashMap::new(), None)
    }

    #[tokio::test]
    async fn test_home_renders_welcome_in_layout() {
        let dir = TempDir::new().unwrap();
        let res = app(&dir).handle(get("/")).await;
        assert_eq!(res.status, 200);
        assert!(res.body.starts_with("<html><link rel=\"stylesheet\" href=\"/assets/css/style.css\">"));
        assert!(res.body.contains("<h1>Welcome</h1>"));
        assert!(res.body.contains("<script src=\"/assets/js/scripts.js\"></script>"));
    }

    #[tokio::test]
    async fn test_user_id_must_be_int() {
        let dir = TempDir::new().unwrap();
        let kernel = app(&dir);
        assert_eq!(kernel.handle(get("/users/abc")).await.status, 404);
        let res = kernel.handle(get("/users/7")).await;
        assert_eq!(res.status, 200);
        assert!(res.body.contains("\"id\": 7"));
    }

    #[tokio::test]
    async fn test_user_lookup_against_database() {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        db.execute_raw(
            "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT)",
            &QueryParams::new(),
        )
        .await
        .unwrap();
        db.insert("users", &params(serde_json::json!({ "name": "Ana" })))
            .await
            .unwrap();

        let dir = TempDir::new().unwrap();
        let ctx = AppContext::new(dir.path(), Config::new()).with_database(db);
        let server = Server::new(Arc::new(app_with(&dir, ctx)), ServerConfig::default());

        let found = server
            .test_request(Method::Get, "/users/1", HashMap::new(), None)
            .await;
        assert_eq!(found.status, 200);
        assert!(found.body.contains("\"name\": \"Ana\""));
        assert!(found.body.contains("\"id\": 1"));

        let missing = server
            .test_request(Method::Get, "/users/99", HashMap::new(), None)
            .await;
        assert_eq!(missing.status, 404);
        assert!(missing.body.contains("user not found"));
    }

    #[tokio::test]
    async fn test_status_endpoint() {
        let dir = TempDir::new().unwrap();
        let res = app(&dir).handle(get("/api/status")).await;
        assert_eq!(res.status, 200);
        assert!(res.body.contains("\"status\": \"ok\""));
    }

    #[tokio::test]
    async fn test_api_users_without_database() {
        let dir = TempDir::new().unwrap();
        let res = app(&dir).handle(get("/api/users")).await;
        assert_eq!(res.status, 500);
    }

    #[tokio::test]
    async fn test_visits_counts_per_session() {
        let dir = TempDir::new().unwrap();
        let kernel = app(&dir);
        let first = kernel.handle(get("/visits")).await;
        assert!(first.body.contains("\"visits\": 1"));

        let cookie = first.cookies[0].split(';').next().unwrap().to_string();
        let mut headers = HashMap::new();
        headers.insert("cookie".to_string(), cookie);
        let second = kernel
            .handle(Request::new(Method::Get, "/visits", headers, None))
            .await;
        assert!(second.body.contains("\"visits\": 2"));
        assert!(second.cookies.is_empty());
    }
}
