//! # JSON
//!
//! Reading goes through simd-json, writing through serde_json. Config files,
//! plugin manifests and request bodies are parsed here; JSON responses are
//! encoded here.

use crate::error::{Error, Result};
use serde::de::{DeserializeOwned, Error as _};
use serde::Serialize;
use std::path::Path;

fn parse_error(e: &simd_json::Error) -> Error {
    Error::Json(serde_json::Error::custom(format!("Parse error: {e}")))
}

/// Parse a JSON document
///
/// # Errors
///
/// Returns `Error::Json` if parsing fails
pub fn parse_json<T: DeserializeOwned>(json_str: &str) -> Result<T> {
    let mut bytes = json_str.as_bytes().to_vec();
    parse_json_bytes(&mut bytes)
}

/// Parse JSON bytes in place
///
/// simd-json rewrites the buffer while parsing, hence `&mut`.
///
/// # Errors
///
/// Returns `Error::Json` if parsing fails
pub fn parse_json_bytes<T: DeserializeOwned>(bytes: &mut [u8]) -> Result<T> {
    simd_json::from_slice(bytes).map_err(|e| parse_error(&e))
}

/// Read and parse a JSON file
///
/// # Errors
///
/// `Error::Io` when the file cannot be read, `Error::Json` when it does not
/// decode into `T`.
pub fn read_json_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let mut raw = std::fs::read(path)?;
    parse_json_bytes(&mut raw)
}

/// Encode a response body (pretty-printed)
///
/// # Errors
///
/// Returns `Error::Json` if the value cannot be serialized
pub fn to_json<T: Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string_pretty(value)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::Value;
    use tempfile::TempDir;

    #[derive(Debug, Deserialize)]
    struct Manifest {
        id: String,
        #[serde(default)]
        index: i64,
    }

    #[test]
    fn test_parse_config_document() {
        let config: serde_json::Map<String, Value> =
            parse_json(r#"{"DB_DRIVERS": "sqlite", "MAX_BODY_SIZE": 1024}"#).unwrap();
        assert_eq!(config["DB_DRIVERS"], "sqlite");
        assert_eq!(config["MAX_BODY_SIZE"], 1024);
    }

    #[test]
    fn test_read_manifest_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("install.json");
        std::fs::write(&path, r#"{"id": "xhomepage", "index": 3}"#).unwrap();

        let manifest: Manifest = read_json_file(&path).unwrap();
        assert_eq!(manifest.id, "xhomepage");
        assert_eq!(manifest.index, 3);

        let missing: Result<Manifest> = read_json_file(&dir.path().join("nope.json"));
        assert!(matches!(missing, Err(Error::Io(_))));
    }

    #[test]
    fn test_malformed_input() {
        let result: Result<Manifest> = parse_json("{\"id\": ");
        assert!(matches!(result, Err(Error::Json(_))));
        let wrong_shape: Result<Manifest> = parse_json("[1, 2]");
        assert!(wrong_shape.is_err());
    }

    #[test]
    fn test_to_json_is_pretty() {
        let body = to_json(&serde_json::json!({ "error": true })).unwrap();
        assert_eq!(body, "{\n  \"error\": true\n}");
    }
}
