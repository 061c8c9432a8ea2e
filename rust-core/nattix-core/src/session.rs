//! # Sessions
//!
//! In-memory session storage keyed by a random id carried in the
//! `NATTIX_SESSID` cookie.

use crate::cookie::{set_cookie_header, CookieOptions};
use crate::request::Request;
use crate::response::Response;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Session cookie name
pub const SESSION_COOKIE: &str = "NATTIX_SESSID";

type Data = HashMap<String, Value>;

/// Shared session storage
#[derive(Clone, Default)]
pub struct SessionStore {
    sessions: Arc<RwLock<HashMap<String, Data>>>,
    secure: bool,
}

impl SessionStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark session cookies `Secure`
    #[must_use]
    pub fn secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    /// Id from the request cookie, if it names a live session
    #[must_use]
    pub fn current_id(&self, req: &Request) -> Option<String> {
        let id = req.cookie(SESSION_COOKIE)?;
        let sessions = self.sessions.read();
        sessions.contains_key(id).then(|| id.to_string())
    }

    /// Resume the request's session or start a new one
    ///
    /// A new session queues its cookie on `res` and is recorded on the
    /// request.
    pub fn start(&self, req: &mut Request, res: &mut Response) -> Session {
        if let Some(id) = req.session_id.clone().or_else(|| self.current_id(req)) {
            if self.exists(&id) {
                req.session_id = Some(id.clone());
                return self.handle(id);
            }
        }

        let id = Uuid::new_v4().simple().to_string();
        self.sessions.write().insert(id.clone(), Data::new());

        let options = CookieOptions {
            secure: self.secure,
            ..CookieOptions::default()
        };
        res.add_cookie(set_cookie_header(SESSION_COOKIE, &id, &options));
        debug!(session_id = %id, "Session started");

        req.session_id = Some(id.clone());
        self.handle(id)
    }

    /// Number of live sessions
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    /// Whether no session is live
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn exists(&self, id: &str) -> bool {
        self.sessions.read().contains_key(id)
    }

    fn handle(&self, id: String) -> Session {
        Session {
            id,
            store: self.clone(),
        }
    }
}

/// One client's session
#[derive(Clone)]
pub struct Session {
    id: String,
    store: SessionStore,
}

impl Session {
    /// Session id
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Store a value
    pub fn set<T: Serialize>(&self, key: &str, value: T) {
        let value = serde_json::to_value(value).unwrap_or(Value::Null);
        let mut sessions = self.store.sessions.write();
        if let Some(data) = sessions.get_mut(&self.id) {
            data.insert(key.to_string(), value);
        }
    }

    /// Read a value
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Value> {
        let sessions = self.store.sessions.read();
        sessions.get(&self.id)?.get(key).cloned()
    }

    /// Read a value as `T`
    #[must_use]
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.get(key).and_then(|v| serde_json::from_value(v).ok())
    }

    /// Remove a value
    pub fn remove(&self, key: &str) {
        let mut sessions = self.store.sessions.write();
        if let Some(data) = sessions.get_mut(&self.id) {
            data.remove(key);
        }
    }

    /// Drop the session and all its data
    pub fn destroy(&self) {
        self.store.sessions.write().remove(&self.id);
    }

    /// Whether the session is still live
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.store.exists(&self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::Method;

    fn request(cookie: Option<&str>) -> Request {
        let mut headers = HashMap::new();
        if let Some(cookie) = cookie {
            headers.insert("cookie".to_string(), cookie.to_string());
        }
        Request::new(Method::Get, "/", headers, None)
    }

    #[test]
    fn test_start_issues_cookie() {
        let store = SessionStore::new();
        let mut req = request(None);
        let mut res = Response::new();
        let session = store.start(&mut req, &mut res);

        assert!(session.is_started());
        assert_eq!(req.session_id.as_deref(), Some(session.id()));
        assert!(res.cookies[0].starts_with(&format!("{SESSION_COOKIE}={}", session.id())));
        assert!(res.cookies[0].contains("HttpOnly"));
    }

    #[test]
    fn test_resume_from_cookie() {
        let store = SessionStore::new();
        let first = store.start(&mut request(None), &mut Response::new());
        first.set("user_id", 7);

        let mut req = request(Some(&format!("{SESSION_COOKIE}={}", first.id())));
        let mut res = Response::new();
        let again = store.start(&mut req, &mut res);
        assert_eq!(again.id(), first.id());
        assert_eq!(again.get_as::<i64>("user_id"), Some(7));
        assert!(res.cookies.is_empty());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_unknown_cookie_gets_new_session() {
        let store = SessionStore::new();
        let mut req = request(Some(&format!("{SESSION_COOKIE}=forged")));
        assert!(store.current_id(&req).is_none());
        let session = store.start(&mut req, &mut Response::new());
        assert_ne!(session.id(), "forged");
    }

    #[test]
    fn test_remove_and_destroy() {
        let store = SessionStore::new();
        let session = store.start(&mut request(None), &mut Response::new());
        session.set("flash", "saved");
        session.remove("flash");
        assert!(session.get("flash").is_none());

        session.destroy();
        assert!(!session.is_started());
        assert!(store.is_empty());
    }

    #[test]
    fn test_store_survives_panicking_writer() {
        let store = SessionStore::new();
        let session = store.start(&mut request(None), &mut Response::new());

        let shared = store.clone();
        let crashed = std::thread::spawn(move || {
            let _guard = shared.sessions.write();
            panic!("handler crashed while holding the session lock");
        })
        .join();
        assert!(crashed.is_err());

        session.set("after", true);
        assert_eq!(session.get_as::<bool>("after"), Some(true));
        assert_eq!(store.len(), 1);
    }
}
