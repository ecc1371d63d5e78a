//! Request Identity
//!
//! Derives the pool key and broker credentials from an inbound request.
//! HTTP Basic credentials become `user:pass`; everything else shares the
//! anonymous key.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hyper::header::AUTHORIZATION;
use hyper::HeaderMap;

use crate::client::Credentials;

/// Pool key shared by every caller without usable credentials
pub const ANONYMOUS_KEY: &str = "_anonymous";

/// Who a request acts as
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    key: String,
    credentials: Option<Credentials>,
}

impl Identity {
    pub fn anonymous() -> Self {
        Self {
            key: ANONYMOUS_KEY.to_string(),
            credentials: None,
        }
    }

    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        let credentials = Credentials::new(username, password);
        Self {
            key: format!("{}:{}", credentials.username, credentials.password),
            credentials: Some(credentials),
        }
    }

    /// Pool key. Contains the password for authenticated callers, so never log it.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }

    pub fn is_anonymous(&self) -> bool {
        self.credentials.is_none()
    }

    /// Name safe to put in logs
    pub fn username(&self) -> &str {
        match self.credentials {
            Some(ref creds) => &creds.username,
            None => ANONYMOUS_KEY,
        }
    }
}

/// Derive the identity of a request from its headers
pub fn extract(headers: &HeaderMap) -> Identity {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(parse_basic)
        .map(|(user, pass)| Identity::basic(user, pass))
        .unwrap_or_else(Identity::anonymous)
}

/// Parse `Basic <base64(user:pass)>`
fn parse_basic(value: &str) -> Option<(String, String)> {
    let (scheme, encoded) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }

    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, pass) = decoded.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}
