//! # Encrypted Cookies
//!
//! Cookie values are sealed with AES-256-GCM-SIV before they leave the
//! server. Wire format of a value: `base64url(nonce (12) || ciphertext+tag)`.
//! The cookie name is bound as associated data, so a value copied under
//! another name does not decrypt.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::request::Request;
use crate::response::Response;
use aes_gcm_siv::aead::generic_array::GenericArray;
use aes_gcm_siv::aead::{Aead, KeyInit, Payload};
use aes_gcm_siv::Aes256GcmSiv;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Nonce size in bytes (96-bit)
const NONCE_SIZE: usize = 12;

/// `SameSite` attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SameSite {
    /// `SameSite=Strict`
    Strict,
    /// `SameSite=Lax`
    #[default]
    Lax,
    /// `SameSite=None`
    None,
}

impl fmt::Display for SameSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Strict => write!(f, "Strict"),
            Self::Lax => write!(f, "Lax"),
            Self::None => write!(f, "None"),
        }
    }
}

/// Attributes of a `Set-Cookie` header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CookieOptions {
    /// Expiry as a unix timestamp; `None` for a session cookie
    pub expires: Option<i64>,
    /// `Path`
    pub path: String,
    /// `Domain`
    pub domain: Option<String>,
    /// `Secure`
    pub secure: bool,
    /// `HttpOnly`
    pub http_only: bool,
    /// `SameSite`
    pub same_site: SameSite,
}

impl Default for CookieOptions {
    fn default() -> Self {
        Self {
            expires: None,
            path: "/".to_string(),
            domain: None,
            secure: false,
            http_only: true,
            same_site: SameSite::Lax,
        }
    }
}

/// Serialize a `Set-Cookie` value
///
/// Expiry is written as `Max-Age` relative to now.
#[must_use]
pub fn set_cookie_header(name: &str, value: &str, options: &CookieOptions) -> String {
    let mut header = format!("{name}={value}");
    if let Some(expires) = options.expires {
        let max_age = (expires - unix_now()).max(0);
        header.push_str(&format!("; Max-Age={max_age}"));
    }
    header.push_str(&format!("; Path={}", options.path));
    if let Some(domain) = options.domain.as_deref().filter(|d| !d.is_empty()) {
        header.push_str(&format!("; Domain={domain}"));
    }
    if options.secure {
        header.push_str("; Secure");
    }
    if options.http_only {
        header.push_str("; HttpOnly");
    }
    header.push_str(&format!("; SameSite={}", options.same_site));
    header
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
}

/// Reads and writes encrypted cookies
#[derive(Clone)]
pub struct CookieJar {
    key: [u8; 32],
}

impl fmt::Debug for CookieJar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CookieJar").finish_non_exhaustive()
    }
}

impl CookieJar {
    /// Derive the key from a secret
    ///
    /// # Errors
    ///
    /// `CookieSecretMissing` for an empty secret.
    pub fn new(secret: &str) -> Result<Self> {
        if secret.is_empty() {
            return Err(Error::CookieSecretMissing);
        }
        Ok(Self {
            key: Sha256::digest(secret.as_bytes()).into(),
        })
    }

    /// Jar keyed by `COOKIE_SECRET`
    ///
    /// # Errors
    ///
    /// `CookieSecretMissing` when the key is absent or empty.
    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(&config.get_str("COOKIE_SECRET").unwrap_or_default())
    }

    fn cipher(&self) -> Aes256GcmSiv {
        Aes256GcmSiv::new(GenericArray::from_slice(&self.key))
    }

    /// Seal a value for cookie `name`
    ///
    /// # Errors
    ///
    /// `Error::Cookie` if encryption fails.
    pub fn encrypt(&self, name: &str, value: &str) -> Result<String> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = GenericArray::from_slice(&nonce_bytes);

        let payload = Payload {
            msg: value.as_bytes(),
            aad: name.as_bytes(),
        };
        let ciphertext = self.cipher().encrypt(nonce, payload).map_err(|e| Error::Cookie {
            message: format!("encrypt failed: {e}"),
        })?;

        let mut output = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        output.extend_from_slice(&nonce_bytes);
        output.extend_from_slice(&ciphertext);
        Ok(URL_SAFE_NO_PAD.encode(output))
    }

    /// Open a sealed value; `None` when it was tampered with or is not ours
    #[must_use]
    pub fn decrypt(&self, name: &str, encoded: &str) -> Option<String> {
        let raw = URL_SAFE_NO_PAD.decode(encoded).ok()?;
        if raw.len() < NONCE_SIZE {
            return None;
        }
        let (nonce_bytes, ciphertext) = raw.split_at(NONCE_SIZE);
        let payload = Payload {
            msg: ciphertext,
            aad: name.as_bytes(),
        };
        let plain = self
            .cipher()
            .decrypt(GenericArray::from_slice(nonce_bytes), payload)
            .ok()?;
        String::from_utf8(plain).ok()
    }

    /// Queue an encrypted cookie on the response
    ///
    /// # Errors
    ///
    /// `Error::Cookie` if encryption fails.
    pub fn set(&self, res: &mut Response, name: &str, value: &str, options: &CookieOptions) -> Result<()> {
        let sealed = self.encrypt(name, value)?;
        res.add_cookie(set_cookie_header(name, &sealed, options));
        Ok(())
    }

    /// Decrypted value of a request cookie
    #[must_use]
    pub fn get(&self, req: &Request, name: &str) -> Option<String> {
        req.cookie(name).and_then(|raw| self.decrypt(name, raw))
    }

    /// Whether the request carries the cookie
    #[must_use]
    pub fn has(req: &Request, name: &str) -> bool {
        req.cookie(name).is_some()
    }

    /// Expire a cookie the client sent
    pub fn delete(req: &Request, res: &mut Response, name: &str, options: &CookieOptions) {
        if Self::has(req, name) {
            let expired = CookieOptions {
                expires: Some(0),
                ..options.clone()
            };
            res.add_cookie(set_cookie_header(name, "", &expired));
        }
    }

    /// Raw values of every request cookie
    #[must_use]
    pub fn get_all(req: &Request) -> HashMap<String, String> {
        req.cookies().clone()
    }

    /// Expire every cookie the client sent
    pub fn clear_all(req: &Request, res: &mut Response, options: &CookieOptions) {
        let mut names: Vec<&String> = req.cookies().keys().collect();
        names.sort();
        for name in names {
            Self::delete(req, res, name, options);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::Method;

    fn request_with_cookie(header: &str) -> Request {
        let mut headers = HashMap::new();
        headers.insert("cookie".to_string(), header.to_string());
        Request::new(Method::Get, "/", headers, None)
    }

    #[test]
    fn test_secret_required() {
        assert!(matches!(CookieJar::new(""), Err(Error::CookieSecretMissing)));
        assert!(matches!(
            CookieJar::from_config(&Config::new()),
            Err(Error::CookieSecretMissing)
        ));
    }

    #[test]
    fn test_set_then_get() {
        let jar = CookieJar::new("s3cret").unwrap();
        let mut res = Response::new();
        jar.set(&mut res, "theme", "dark", &CookieOptions::default()).unwrap();

        let header = &res.cookies[0];
        assert!(header.ends_with("; Path=/; HttpOnly; SameSite=Lax"));
        let sealed = header
            .strip_prefix("theme=")
            .and_then(|rest| rest.split(';').next())
            .unwrap();
        assert_ne!(sealed, "dark");

        let req = request_with_cookie(&format!("theme={sealed}"));
        assert_eq!(jar.get(&req, "theme").as_deref(), Some("dark"));
    }

    #[test]
    fn test_tampered_or_foreign_values_rejected() {
        let jar = CookieJar::new("s3cret").unwrap();
        let sealed = jar.encrypt("theme", "dark").unwrap();

        assert!(jar.decrypt("layout", &sealed).is_none());
        assert!(CookieJar::new("other").unwrap().decrypt("theme", &sealed).is_none());

        let mut bytes = URL_SAFE_NO_PAD.decode(&sealed).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        assert!(jar.decrypt("theme", &URL_SAFE_NO_PAD.encode(bytes)).is_none());
        assert!(jar.decrypt("theme", "short").is_none());
    }

    #[test]
    fn test_delete_only_present_cookies() {
        let req = request_with_cookie("a=1; b=2");
        let mut res = Response::new();
        CookieJar::delete(&req, &mut res, "missing", &CookieOptions::default());
        assert!(res.cookies.is_empty());

        CookieJar::clear_all(&req, &mut res, &CookieOptions::default());
        assert_eq!(res.cookies.len(), 2);
        assert!(res.cookies[0].starts_with("a=; Max-Age=0"));
    }

    #[test]
    fn test_header_attributes() {
        let options = CookieOptions {
            domain: Some("nattix.test".to_string()),
            secure: true,
            http_only: false,
            same_site: SameSite::Strict,
            ..CookieOptions::default()
        };
        assert_eq!(
            set_cookie_header("id", "1", &options),
            "id=1; Path=/; Domain=nattix.test; Secure; SameSite=Strict"
        );
    }
}
