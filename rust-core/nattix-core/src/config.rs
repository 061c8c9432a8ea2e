//! # Configuration
//!
//! Settings come from `configs/config.json` and the project's `.env` file.
//! Both are flattened into one key/value map; `.env` is applied last, so it
//! wins when a key appears in both.

use crate::error::{Error, Result};
use crate::json::read_json_file;
use crate::path::PathResolver;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::Path;
use tracing::debug;

/// Default listen address
pub const DEFAULT_ADDR: &str = "127.0.0.1:8000";

/// Default request body limit (10 MiB)
pub const DEFAULT_MAX_BODY_SIZE: usize = 10 * 1024 * 1024;

/// Merged application settings
#[derive(Debug, Clone, Default)]
pub struct Config {
    values: HashMap<String, Value>,
}

impl Config {
    /// Empty configuration
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load `configs/config.json` then `.env` below `root`
    ///
    /// Missing files count as empty sources.
    ///
    /// # Errors
    ///
    /// `Error::Config` when a file exists but cannot be parsed.
    pub fn load(root: impl AsRef<Path>) -> Result<Self> {
        let paths = PathResolver::new(root);
        let mut config = Self::new();

        let json_path = paths.resolve(&["configs", "config.json"]);
        if json_path.is_file() {
            let parsed: Map<String, Value> = read_json_file(&json_path).map_err(|e| Error::Config {
                message: format!("{}: {e}", json_path.display()),
            })?;
            debug!(path = %json_path.display(), keys = parsed.len(), "Loaded JSON config");
            config.values.extend(parsed);
        }

        let env_path = paths.resolve(&[".env"]);
        if env_path.is_file() {
            let iter = dotenvy::from_path_iter(&env_path).map_err(|e| Error::Config {
                message: format!("{}: {e}", env_path.display()),
            })?;
            for item in iter {
                let (key, value) = item.map_err(|e| Error::Config {
                    message: format!("{}: {e}", env_path.display()),
                })?;
                config.values.insert(key, Value::String(value));
            }
            debug!(path = %env_path.display(), "Loaded .env");
        }

        Ok(config)
    }

    /// Build from string pairs
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            values: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), Value::String(v.into())))
                .collect(),
        }
    }

    /// Override a key
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(key.into(), value.into());
    }

    /// Raw value
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Value as text; numbers and booleans are formatted
    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<String> {
        match self.values.get(key)? {
            Value::String(s) => Some(s.clone()),
            Value::Null => None,
            other => Some(other.to_string()),
        }
    }

    /// Value as text, or `default`
    #[must_use]
    pub fn get_or(&self, key: &str, default: &str) -> String {
        self.get_str(key).unwrap_or_else(|| default.to_string())
    }

    /// Value deserialized into `T`
    ///
    /// `.env` values are strings; they are first read as JSON so that
    /// `PORT=8080` can be fetched as a number.
    #[must_use]
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.values.get(key)?;
        if let Value::String(s) = value {
            if let Ok(parsed) = serde_json::from_str::<T>(s) {
                return Some(parsed);
            }
        }
        serde_json::from_value(value.clone()).ok()
    }

    /// Whether a non-empty value is set
    #[must_use]
    pub fn has(&self, key: &str) -> bool {
        self.get_str(key).is_some_and(|s| !s.is_empty())
    }

    /// `APP_ADDR`
    #[must_use]
    pub fn addr(&self) -> String {
        self.get_or("APP_ADDR", DEFAULT_ADDR)
    }

    /// `MAX_BODY_SIZE` in bytes
    #[must_use]
    pub fn max_body_size(&self) -> usize {
        self.get_as("MAX_BODY_SIZE").unwrap_or(DEFAULT_MAX_BODY_SIZE)
    }

    /// `URL_ROOT`, without a trailing slash
    #[must_use]
    pub fn url_root(&self) -> String {
        self.get_or("URL_ROOT", "").trim_end_matches('/').to_string()
    }
}

/// Connection settings derived from the `DB_*` keys
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
    /// sqlx connection URL
    pub url: String,
}

impl DatabaseConfig {
    /// Derive connection settings
    ///
    /// `DATABASE_URL` is used as is when present. Otherwise `DB_DRIVERS`
    /// selects the backend (`sqlite`, or `pgsql`/`postgres`). Returns `None`
    /// when no database is configured.
    ///
    /// # Errors
    ///
    /// `Error::Config` for an unknown driver or missing `DB_DATABASE`.
    pub fn from_config(config: &Config) -> Result<Option<Self>> {
        if let Some(url) = config.get_str("DATABASE_URL").filter(|u| !u.is_empty()) {
            return Ok(Some(Self { url }));
        }

        let Some(driver) = config.get_str("DB_DRIVERS").filter(|d| !d.is_empty()) else {
            return Ok(None);
        };
        let database = config
            .get_str("DB_DATABASE")
            .filter(|d| !d.is_empty())
            .ok_or_else(|| Error::Config {
                message: "DB_DATABASE is not set".to_string(),
            })?;

        let url = match driver.to_lowercase().as_str() {
            "sqlite" => {
                if database == ":memory:" {
                    "sqlite::memory:".to_string()
                } else {
                    format!("sqlite:{database}")
                }
            }
            "pgsql" | "postgres" | "postgresql" => {
                let host = config.get_or("DB_HOST", "localhost");
                let user = config.get_or("DB_USERNAME", "");
                let password = config.get_or("DB_PASSWORD", "");
                let credentials = match (user.is_empty(), password.is_empty()) {
                    (true, _) => String::new(),
                    (false, true) => format!("{user}@"),
                    (false, false) => format!("{user}:{password}@"),
                };
                format!("postgres://{credentials}{host}/{database}")
            }
            other => {
                return Err(Error::Config {
                    message: format!("Unsupported DB_DRIVERS value: {other}"),
                })
            }
        };
        Ok(Some(Self { url }))
    }
}
