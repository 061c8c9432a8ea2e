//! # Nattix Core
//!
//! Core library for the Nattix MVC framework: routing, controllers, views,
//! a dependency-injection container, sessions and cookies, a database layer
//! with a fluent query builder, and folder-based plugins.
//!
//! ## Architecture
//!
//! A [`Kernel`] owns the route table and an [`AppContext`] holding the
//! application services. The [`Server`] hands every HTTP request to
//! [`Kernel::handle`], which runs the global middlewares, resolves the route
//! and renders any error that escapes as an HTML or JSON error page.
//!
//! ## Modules
//!
//! - `kernel` - Application context, request pipeline and error boundary
//! - `server` - HTTP server built on Hyper
//! - `router` - Route table, pattern matching and dispatch
//! - `route` - Route pattern compilation and metadata
//! - `request` / `response` - HTTP request and response wrappers
//! - `middleware` - Before/after middlewares and the named registry
//! - `controller` - Controller base, actions and the controller registry
//! - `view` - Template and layout rendering
//! - `container` - Dependency-injection container
//! - `database` - SQLx connection, transactions and CRUD helpers
//! - `query_builder` - Step-checked fluent SQL builder
//! - `session` / `cookie` - Sessions and encrypted cookies
//! - `plugins` / `hooks` - Plugin loading and action hooks
//! - `config` / `path` - Configuration and project paths
//! - `json` - JSON parsing with simd-json
//! - `types` - Path parameter types and conversion
//! - `error` - Error types and handling

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod container;
pub mod controller;
pub mod cookie;
pub mod database;
pub mod error;
pub mod hooks;
pub mod json;
pub mod kernel;
pub mod middleware;
pub mod path;
pub mod plugins;
pub mod query_builder;
pub mod request;
pub mod response;
pub mod route;
pub mod router;
pub mod server;
pub mod session;
pub mod types;
pub mod view;

pub use config::{Config, DatabaseConfig};
pub use container::{Container, Params, Resolver};
pub use controller::{json_error_response, json_response, BoxFuture, Controller, ControllerBase};
pub use cookie::{CookieJar, CookieOptions, SameSite};
pub use database::{params, Backend, Database, QueryParams, QueryResult, Row, Transaction, TxOutcome};
pub use error::{Error, Result};
pub use hooks::Hooks;
pub use json::{parse_json, to_json};
pub use kernel::{AppContext, Kernel};
pub use middleware::{
    AuthMiddleware, CorsMiddleware, LoggingMiddleware, Middleware, MiddlewareChain,
    MiddlewareRef, MiddlewareResult,
};
pub use path::PathResolver;
pub use plugins::{LoadedPlugin, Manifest, Plugin, PluginRegistry, ScanOptions};
pub use query_builder::{Aggregate, Page, QueryBuilder};
pub use request::Request;
pub use response::Response;
pub use route::RouteInfo;
pub use router::{Method, RouteTarget, Router};
pub use server::{Server, ServerConfig};
pub use session::{Session, SessionStore};
pub use types::{ParamType, ParamValue};
pub use view::View;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert_eq!(VERSION, "0.1.0");
    }
}
