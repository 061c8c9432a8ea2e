//! # HTTP Response
//!
//! Outgoing status, headers, cookies and body. Handlers receive one and hand
//! it back; the server turns it into a hyper response.

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::StatusCode;
use serde::Serialize;
use std::collections::HashMap;

/// HTTP response under construction
#[derive(Debug, Clone)]
pub struct Response {
    /// HTTP status code
    pub status: u16,
    /// Response body
    pub body: String,
    /// Content type
    pub content_type: String,
    /// Response headers
    pub headers: HashMap<String, String>,
    /// Serialized `Set-Cookie` values
    pub cookies: Vec<String>,
}

impl Default for Response {
    fn default() -> Self {
        Self {
            status: 200,
            body: String::new(),
            content_type: "text/html; charset=utf-8".to_string(),
            headers: HashMap::new(),
            cookies: Vec::new(),
        }
    }
}

impl Response {
    /// Create an empty 200 response
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a JSON response from an already encoded body
    #[must_use]
    pub fn json(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            content_type: "application/json".to_string(),
            ..Self::default()
        }
    }

    /// Create a JSON response by serializing `value`
    #[must_use]
    pub fn json_value<T: Serialize>(value: &T) -> Self {
        match crate::json::to_json(value) {
            Ok(body) => Self::json(body),
            Err(e) => Self::json_error(&format!("Error encoding JSON: {e}"), 500),
        }
    }

    /// `{"error": true, "message": ...}` with the given status
    #[must_use]
    pub fn json_error(message: &str, status: u16) -> Self {
        let body = serde_json::json!({ "error": true, "message": message });
        Self::json(body.to_string()).with_status(status)
    }

    /// Create a text response
    #[must_use]
    pub fn text(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            content_type: "text/plain".to_string(),
            ..Self::default()
        }
    }

    /// Create an HTML response
    #[must_use]
    pub fn html(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            ..Self::default()
        }
    }

    /// 302 redirect
    #[must_use]
    pub fn redirect(location: &str) -> Self {
        Self::default()
            .with_status(302)
            .with_header("Location", location)
    }

    /// Set status code
    #[must_use]
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    /// Set header
    #[must_use]
    pub fn with_header(mut self, key: &str, value: &str) -> Self {
        self.set_header(key, value);
        self
    }

    /// Set status code in place
    pub fn set_status_code(&mut self, status: u16) -> &mut Self {
        self.status = status;
        self
    }

    /// Set or override a header
    pub fn set_header(&mut self, key: &str, value: &str) -> &mut Self {
        if key.eq_ignore_ascii_case("content-type") {
            self.content_type = value.to_string();
        } else {
            self.headers.insert(key.to_string(), value.to_string());
        }
        self
    }

    /// Replace the body
    pub fn set_content(&mut self, content: impl Into<String>) -> &mut Self {
        self.body = content.into();
        self
    }

    /// Append a serialized `Set-Cookie` value
    pub fn add_cookie(&mut self, cookie: String) -> &mut Self {
        self.cookies.push(cookie);
        self
    }

    /// Convert to hyper Response
    #[must_use]
    pub fn into_hyper(self) -> hyper::Response<Full<Bytes>> {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut builder = hyper::Response::builder()
            .status(status)
            .header("Content-Type", &self.content_type);
        for (k, v) in &self.headers {
            builder = builder.header(k.as_str(), v.as_str());
        }
        for cookie in &self.cookies {
            builder = builder.header("Set-Cookie", cookie.as_str());
        }

        builder
            .body(Full::new(Bytes::from(self.body)))
            .unwrap_or_else(|_| {
                let mut fallback = hyper::Response::new(Full::new(Bytes::from("Internal Server Error")));
                *fallback.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                fallback
            })
    }
}
