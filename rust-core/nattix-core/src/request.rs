//! # HTTP Request
//!
//! Request wrapper handed to middlewares, controllers and closures.
//!
//! Carries the method (with `_method` override), the path without its query
//! string, parsed query and form data, headers, cookies, the raw body and the
//! route parameter bag filled in by the router.

use crate::error::{Error, Result};
use crate::router::Method;
use crate::types::ParamValue;
use http_body_util::BodyExt;
use hyper::body::Bytes;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;

/// Form field that overrides the request method on POST
pub const METHOD_OVERRIDE_FIELD: &str = "_method";

/// HTTP request
#[derive(Debug, Clone)]
pub struct Request {
    /// HTTP method (after `_method` override)
    pub method: Method,
    /// Request path (without query string)
    pub path: String,
    query_string: Option<String>,
    query_params: HashMap<String, String>,
    form_params: HashMap<String, String>,
    parameters: Vec<(String, String)>,
    /// Typed path parameters
    pub typed_params: HashMap<String, ParamValue>,
    headers: hyper::HeaderMap,
    cookies: HashMap<String, String>,
    body: Option<Bytes>,
    /// Validated JWT claims
    pub claims: Option<Value>,
    /// Session id attached by the kernel
    pub session_id: Option<String>,
}

impl Request {
    /// Create a request manually (for testing/internal use)
    ///
    /// `path` may carry a query string.
    pub fn new(
        method: Method,
        path: impl Into<String>,
        headers_map: HashMap<String, String>,
        body: Option<Bytes>,
    ) -> Self {
        let path = path.into();
        let (path, query_string) = match path.split_once('?') {
            Some((p, q)) => (p.to_string(), Some(q.to_string())),
            None => (path, None),
        };

        let mut headers = hyper::HeaderMap::new();
        for (k, v) in headers_map {
            if let (Ok(n), Ok(v)) = (
                hyper::header::HeaderName::from_bytes(k.as_bytes()),
                hyper::header::HeaderValue::from_str(&v),
            ) {
                headers.insert(n, v);
            }
        }

        Self::assemble(method, path, query_string, headers, body)
    }

    /// Create from hyper request with body size limit
    ///
    /// # Errors
    ///
    /// Returns `Error::PayloadTooLarge` if the declared or actual body size
    /// exceeds `max_body_size`.
    pub async fn from_hyper_with_limit(
        req: hyper::Request<hyper::body::Incoming>,
        max_body_size: usize,
    ) -> Result<Self> {
        let method = Method::from_hyper(req.method());
        let uri = req.uri();
        let path = uri.path().to_string();
        let query_string = uri.query().map(String::from);

        let headers = req.headers().clone();
        if let Some(content_len) = headers
            .get(hyper::header::CONTENT_LENGTH)
            .and_then(|len| len.to_str().ok())
            .and_then(|len| len.parse::<usize>().ok())
        {
            if content_len > max_body_size {
                return Err(Error::PayloadTooLarge {
                    limit: max_body_size,
                    actual: content_len,
                });
            }
        }

        let body = match BodyExt::collect(req.into_body()).await {
            Ok(collected) => {
                let bytes = collected.to_bytes();
                if bytes.len() > max_body_size {
                    return Err(Error::PayloadTooLarge {
                        limit: max_body_size,
                        actual: bytes.len(),
                    });
                }
                Some(bytes)
            }
            Err(_) => None,
        };

        Ok(Self::assemble(method, path, query_string, headers, body))
    }

    fn assemble(
        method: Method,
        path: String,
        query_string: Option<String>,
        headers: hyper::HeaderMap,
        body: Option<Bytes>,
    ) -> Self {
        let query_params = parse_query_string(query_string.as_deref());

        let is_form = headers
            .get(hyper::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("application/x-www-form-urlencoded"));
        let form_params = if is_form {
            parse_query_string(body.as_ref().and_then(|b| std::str::from_utf8(b).ok()))
        } else {
            HashMap::new()
        };

        // a form field wins over the query string
        let override_field = form_params
            .get(METHOD_OVERRIDE_FIELD)
            .or_else(|| query_params.get(METHOD_OVERRIDE_FIELD));
        let method = match override_field {
            Some(over) if method == Method::Post => over.parse().unwrap_or(method),
            _ => method,
        };

        let cookies = headers
            .get_all(hyper::header::COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(parse_cookie_header)
            .collect();

        Self {
            method,
            path,
            query_string,
            query_params,
            form_params,
            parameters: Vec::new(),
            typed_params: HashMap::new(),
            headers,
            cookies,
            body,
            claims: None,
            session_id: None,
        }
    }

    /// Is this a GET request
    #[must_use]
    pub fn is_get(&self) -> bool {
        self.method == Method::Get
    }

    /// Is this a POST request
    #[must_use]
    pub fn is_post(&self) -> bool {
        self.method == Method::Post
    }

    /// Is this a PUT request
    #[must_use]
    pub fn is_put(&self) -> bool {
        self.method == Method::Put
    }

    /// Is this a PATCH request
    #[must_use]
    pub fn is_patch(&self) -> bool {
        self.method == Method::Patch
    }

    /// Is this a DELETE request
    #[must_use]
    pub fn is_delete(&self) -> bool {
        self.method == Method::Delete
    }

    /// Sanitized input value: query string on GET, form body otherwise
    #[must_use]
    pub fn get(&self, key: &str, default: &str) -> String {
        let source = if self.is_get() {
            &self.query_params
        } else {
            &self.form_params
        };
        sanitize(source.get(key).map_or(default, String::as_str))
    }

    /// Sanitized form body value
    #[must_use]
    pub fn post(&self, key: &str, default: &str) -> String {
        sanitize(self.form_params.get(key).map_or(default, String::as_str))
    }

    /// All query and form values, sanitized (form wins on conflicts)
    #[must_use]
    pub fn body(&self) -> HashMap<String, String> {
        self.query_params
            .iter()
            .chain(self.form_params.iter())
            .map(|(k, v)| (k.clone(), sanitize(v)))
            .collect()
    }

    /// Replace the route parameter bag
    pub fn set_parameters(&mut self, parameters: Vec<(String, String)>) -> &mut Self {
        self.parameters = parameters;
        self
    }

    /// Route parameters in placeholder order
    #[must_use]
    pub fn parameters(&self) -> &[(String, String)] {
        &self.parameters
    }

    /// A single route parameter
    #[must_use]
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// A single route parameter, or `default`
    #[must_use]
    pub fn parameter_or<'a>(&'a self, name: &str, default: &'a str) -> &'a str {
        self.parameter(name).unwrap_or(default)
    }

    /// Get a header value by name (case-insensitive)
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Set or override a header
    pub fn set_header(&mut self, name: &str, value: &str) {
        if let (Ok(n), Ok(v)) = (
            hyper::header::HeaderName::from_bytes(name.as_bytes()),
            hyper::header::HeaderValue::from_str(value),
        ) {
            self.headers.insert(n, v);
        }
    }

    /// Get all headers as a HashMap
    #[must_use]
    pub fn headers_map(&self) -> HashMap<String, String> {
        self.headers
            .iter()
            .filter_map(|(k, v)| {
                v.to_str()
                    .ok()
                    .map(|val| (k.as_str().to_string(), val.to_string()))
            })
            .collect()
    }

    /// Raw query parameters
    #[must_use]
    pub const fn query_map(&self) -> &HashMap<String, String> {
        &self.query_params
    }

    /// Raw query string
    #[must_use]
    pub fn query_string(&self) -> Option<&str> {
        self.query_string.as_deref()
    }

    /// Raw cookie value as sent by the client
    #[must_use]
    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(String::as_str)
    }

    /// All raw cookies
    #[must_use]
    pub const fn cookies(&self) -> &HashMap<String, String> {
        &self.cookies
    }

    /// Whether the client prefers a JSON answer
    #[must_use]
    pub fn wants_json(&self) -> bool {
        self.header("accept")
            .is_some_and(|accept| accept.contains("application/json"))
    }

    /// Get the request body as bytes
    #[must_use]
    pub fn body_bytes(&self) -> Option<&[u8]> {
        self.body.as_ref().map(AsRef::as_ref)
    }

    /// Get the request body as string (UTF-8)
    #[must_use]
    pub fn body_str(&self) -> Option<&str> {
        self.body_bytes().and_then(|b| std::str::from_utf8(b).ok())
    }

    /// Deserialize the body as JSON
    ///
    /// # Errors
    ///
    /// Returns a JSON error when the body is absent or malformed.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        crate::json::parse_json(self.body_str().unwrap_or_default())
    }
}

/// Escape `& < > " '` as HTML entities
#[must_use]
pub fn sanitize(dirty: &str) -> String {
    let mut clean = String::with_capacity(dirty.len());
    for c in dirty.chars() {
        match c {
            '&' => clean.push_str("&amp;"),
            '<' => clean.push_str("&lt;"),
            '>' => clean.push_str("&gt;"),
            '"' => clean.push_str("&quot;"),
            '\'' => clean.push_str("&apos;"),
            _ => clean.push(c),
        }
    }
    clean
}

/// Parse query string into HashMap
///
/// Handles URL decoding and duplicate keys (last value wins).
fn parse_query_string(query: Option<&str>) -> HashMap<String, String> {
    query
        .map(|q| {
            q.split('&')
                .filter(|pair| !pair.is_empty())
                .filter_map(|pair| {
                    let mut parts = pair.splitn(2, '=');
                    let key = parts.next()?;
                    let value = parts.next().unwrap_or("");
                    Some((url_decode(key), url_decode(value)))
                })
                .collect()
        })
        .unwrap_or_default()
}

fn parse_cookie_header(header: &str) -> Vec<(String, String)> {
    header
        .split(';')
        .filter_map(|pair| {
            let (name, value) = pair.trim().split_once('=')?;
            Some((name.trim().to_string(), value.trim().to_string()))
        })
        .collect()
}

/// URL decoding (`+` is a space, `%XX` escapes are UTF-8 bytes)
fn url_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' if i + 2 < bytes.len() => {
                match std::str::from_utf8(&bytes[i + 1..i + 3])
                    .ok()
                    .and_then(|hex| u8::from_str_radix(hex, 16).ok())
                {
                    Some(byte) => {
                        out.push(byte);
                        i += 2;
                    }
                    None => out.push(b'%'),
                }
            }
            b => out.push(b),
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn form_request(method: Method, body: &str) -> Request {
        let mut headers = HashMap::new();
        headers.insert(
            "content-type".to_string(),
            "application/x-www-form-urlencoded".to_string(),
        );
        Request::new(method, "/items", headers, Some(Bytes::from(body.to_string())))
    }

    #[test]
    fn test_parse_query_string_simple() {
        let result = parse_query_string(Some("page=1&limit=10"));
        assert_eq!(result.get("page"), Some(&"1".to_string()));
        assert_eq!(result.get("limit"), Some(&"10".to_string()));
    }

    #[test]
    fn test_parse_query_string_empty() {
        assert!(parse_query_string(None).is_empty());
    }

    #[test]
    fn test_url_decode() {
        assert_eq!(url_decode("hello+world"), "hello world");
        assert_eq!(url_decode("hello%20world"), "hello world");
        assert_eq!(url_decode("100%25"), "100%");
        assert_eq!(url_decode("caf%C3%A9"), "café");
        assert_eq!(url_decode("50%"), "50%");
    }

    #[test]
    fn test_method_override_from_form() {
        let req = form_request(Method::Post, "_method=DELETE&id=3");
        assert_eq!(req.method, Method::Delete);
        assert!(req.is_delete());
    }

    #[test]
    fn test_method_override_from_query_string() {
        let req = Request::new(Method::Post, "/items/3?_method=patch", HashMap::new(), None);
        assert_eq!(req.method, Method::Patch);
        assert_eq!(req.path, "/items/3");

        let mut headers = HashMap::new();
        headers.insert(
            "content-type".to_string(),
            "application/x-www-form-urlencoded".to_string(),
        );
        let body = Some(Bytes::from_static(b"_method=DELETE"));
        let req = Request::new(Method::Post, "/items/3?_method=PUT", headers, body);
        assert_eq!(req.method, Method::Delete);
    }

    #[test]
    fn test_method_override_ignored_on_get() {
        let req = Request::new(Method::Get, "/items?_method=PUT", HashMap::new(), None);
        assert_eq!(req.method, Method::Get);
    }

    #[test]
    fn test_get_reads_query_on_get_and_body_otherwise() {
        let req = Request::new(Method::Get, "/s?q=<b>", HashMap::new(), None);
        assert_eq!(req.get("q", ""), "&lt;b&gt;");
        assert_eq!(req.get("missing", "dflt"), "dflt");

        let req = form_request(Method::Post, "name=O%27Neil");
        assert_eq!(req.get("name", ""), "O&apos;Neil");
        assert_eq!(req.post("name", ""), "O&apos;Neil");
    }

    #[test]
    fn test_parameters_bag() {
        let mut req = Request::new(Method::Get, "/users/42", HashMap::new(), None);
        req.set_parameters(vec![("id".to_string(), "42".to_string())]);
        assert_eq!(req.parameter("id"), Some("42"));
        assert_eq!(req.parameter_or("name", "anon"), "anon");
    }

    #[test]
    fn test_cookies_parsed() {
        let mut headers = HashMap::new();
        headers.insert("cookie".to_string(), "a=1; theme=dark".to_string());
        let req = Request::new(Method::Get, "/", headers, None);
        assert_eq!(req.cookie("theme"), Some("dark"));
        assert_eq!(req.cookies().len(), 2);
    }

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize(r#"<a href="x">&'"#), "&lt;a href=&quot;x&quot;&gt;&amp;&apos;");
    }
}
