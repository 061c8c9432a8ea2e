//! # Error Handling
//!
//! Centralized error types for Nattix core.
//! Uses `thiserror` for ergonomic error definitions.
//!
//! Errors are plain values. Turning one into an HTTP response happens once,
//! at the kernel boundary (see `kernel::render_error`).

use thiserror::Error;

/// Result type alias for Nattix operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for the Nattix framework
#[derive(Error, Debug)]
pub enum Error {
    /// Server failed to bind to the specified address
    #[error("Failed to bind server to {address}: {source}")]
    BindError {
        /// The address we tried to bind to
        address: String,
        /// The underlying IO error
        #[source]
        source: std::io::Error,
    },

    /// No route matched the request
    #[error("Callback - [ Method: {method}, Path: {path} ] - Not Found")]
    NotFound {
        /// Request method
        method: String,
        /// Request path
        path: String,
    },

    /// Controller exists but does not define the requested action
    #[error("[{controller}] - [{action}] Method Not Found")]
    MethodNotFound {
        /// Controller name
        controller: String,
        /// Action name
        action: String,
    },

    /// Controller name was never registered
    #[error("Controller not registered: {name}")]
    ControllerNotFound {
        /// Controller name
        name: String,
    },

    /// Named middleware was never registered
    #[error("Middleware not registered: {name}")]
    MiddlewareNotFound {
        /// Conventional middleware name that was looked up
        name: String,
    },

    /// Invalid route pattern provided
    #[error("Invalid route pattern: {pattern}: {reason}")]
    InvalidRoutePattern {
        /// The invalid pattern
        pattern: String,
        /// Reason for invalidity
        reason: String,
    },

    /// Query builder method called from a state that does not allow it
    #[error("Query builder: `{method}` cannot be called after `{step}`")]
    QueryOrder {
        /// Method that was called
        method: &'static str,
        /// Current builder step
        step: &'static str,
    },

    /// Query builder received an invalid argument
    #[error("Query builder: {message}")]
    QueryArgument {
        /// What was wrong
        message: String,
    },

    /// Statement built by the query builder failed in the driver
    #[error("Query execution failed: {message}")]
    QueryExecution {
        /// Original driver message
        message: String,
    },

    /// Database error
    #[error("Database error: {message}")]
    Database {
        /// Error message from database
        message: String,
    },

    /// Commit/rollback without an open transaction, or similar
    #[error("Transaction error: {message}")]
    TransactionState {
        /// What went wrong
        message: String,
    },

    /// Container has no binding under this name
    #[error("Binding for '{name}' not found.")]
    BindingNotFound {
        /// Requested binding
        name: String,
    },

    /// A factory could not resolve one of its parameters
    #[error("Unable to resolve dependency: {parameter} (while building '{binding}')")]
    UnresolvableDependency {
        /// Binding being built
        binding: String,
        /// Parameter that could not be resolved
        parameter: String,
    },

    /// Resolution re-entered a binding that is still being built
    #[error("Circular dependency detected: {chain}")]
    CircularDependency {
        /// Resolution chain, outermost first
        chain: String,
    },

    /// Binding produced a value of another type than requested
    #[error("Binding '{name}' does not hold a value of type {expected}")]
    BindingType {
        /// Binding name
        name: String,
        /// Requested type name
        expected: &'static str,
    },

    /// Plugin manifest or dependency check failed
    #[error("Plugin '{plugin}': {reason}")]
    PluginValidation {
        /// Plugin folder name
        plugin: String,
        /// Reason for rejection
        reason: String,
    },

    /// A plugin folder declares an id with no compiled-in implementation
    #[error("Plugin '{plugin}': no implementation registered for id '{id}'")]
    PluginNotRegistered {
        /// Plugin folder name
        plugin: String,
        /// Manifest id
        id: String,
    },

    /// Encrypted cookies used without a configured secret
    #[error("COOKIE_SECRET is not defined.")]
    CookieSecretMissing,

    /// Cookie encryption failure
    #[error("Cookie error: {message}")]
    Cookie {
        /// Error message
        message: String,
    },

    /// View template file missing
    #[error("Template not found: {path}")]
    TemplateNotFound {
        /// Resolved template path
        path: String,
    },

    /// Configuration could not be loaded
    #[error("Configuration error: {message}")]
    Config {
        /// Error message
        message: String,
    },

    /// HTTP protocol error
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Request payload too large
    #[error("Payload too large: limit={limit} bytes, received={actual} bytes")]
    PayloadTooLarge {
        /// Max allowed size
        limit: usize,
        /// Actual size
        actual: usize,
    },
}

impl Error {
    /// HTTP status code used when this error reaches the request boundary
    #[must_use]
    pub const fn status_code(&self) -> u16 {
        match self {
            Self::NotFound { .. }
            | Self::MethodNotFound { .. }
            | Self::TemplateNotFound { .. } => 404,
            Self::PayloadTooLarge { .. } => 413,
            Self::QueryArgument { .. } => 400,
            _ => 500,
        }
    }

    /// Severity label shown on the error page and in logs
    #[must_use]
    pub const fn level(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "info",
            Self::Database { .. } | Self::QueryExecution { .. } | Self::BindError { .. } => {
                "critical"
            }
            _ => "error",
        }
    }

    pub(crate) fn query_argument(message: impl Into<String>) -> Self {
        Self::QueryArgument {
            message: message.into(),
        }
    }

    pub(crate) fn plugin(plugin: &str, reason: impl Into<String>) -> Self {
        Self::PluginValidation {
            plugin: plugin.to_string(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_error() {
        let err = Error::NotFound {
            method: "GET".to_string(),
            path: "/unknown".to_string(),
        };
        assert!(err.to_string().contains("/unknown"));
        assert!(err.to_string().contains("GET"));
        assert_eq!(err.status_code(), 404);
        assert_eq!(err.level(), "info");
    }

    #[test]
    fn test_bind_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::AddrInUse, "address in use");
        let err = Error::BindError {
            address: "0.0.0.0:8000".to_string(),
            source: io_err,
        };
        assert!(err.to_string().contains("0.0.0.0:8000"));
        assert_eq!(err.status_code(), 500);
    }

    #[test]
    fn test_query_order_message() {
        let err = Error::QueryOrder {
            method: "insert",
            step: "where",
        };
        assert_eq!(
            err.to_string(),
            "Query builder: `insert` cannot be called after `where`"
        );
    }

    #[test]
    fn test_argument_errors_are_client_errors() {
        assert_eq!(Error::query_argument("limit must be positive").status_code(), 400);
    }
}
