//! Role-scoped session cookies.
//!
//! Admin and user surfaces carry sessions under distinct cookie names so one
//! browser can hold both without either surface seeing the other's session.

use axum::http::{
    HeaderMap, HeaderValue,
    header::{AUTHORIZATION, COOKIE, InvalidHeaderValue},
};

use crate::session::SessionScope;

const ADMIN_COOKIE_NAME: &str = "zerogate_admin";
const USER_COOKIE_NAME: &str = "zerogate_session";

/// Builds and reads the session cookie for one role scope.
#[derive(Clone, Debug)]
pub struct CookieBinder {
    name: &'static str,
    secure: bool,
    ttl_seconds: i64,
}

impl CookieBinder {
    #[must_use]
    pub fn new(scope: SessionScope, secure: bool, ttl_seconds: i64) -> Self {
        let name = match scope {
            SessionScope::Admin => ADMIN_COOKIE_NAME,
            SessionScope::User => USER_COOKIE_NAME,
        };
        Self {
            name,
            secure,
            ttl_seconds,
        }
    }

    /// Build the `Set-Cookie` value installing a session token.
    ///
    /// With `remember` the cookie persists for the session TTL; without it the
    /// cookie is dropped when the browser closes.
    pub fn install(&self, token: &str, remember: bool) -> Result<HeaderValue, InvalidHeaderValue> {
        let mut cookie = format!(
            "{}={token}; Path=/; HttpOnly; SameSite=Lax",
            self.name
        );
        if remember {
            cookie.push_str(&format!("; Max-Age={}", self.ttl_seconds));
        }
        if self.secure {
            cookie.push_str("; Secure");
        }
        HeaderValue::from_str(&cookie)
    }

    /// Build the `Set-Cookie` value clearing the session cookie.
    pub fn clear(&self) -> Result<HeaderValue, InvalidHeaderValue> {
        let mut cookie = format!("{}=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0", self.name);
        if self.secure {
            cookie.push_str("; Secure");
        }
        HeaderValue::from_str(&cookie)
    }

    /// Extract the session token for this scope from request headers.
    ///
    /// A bearer token takes precedence over the cookie so API clients can
    /// avoid cookie handling entirely.
    #[must_use]
    pub fn token_from_headers(&self, headers: &HeaderMap) -> Option<String> {
        if let Some(token) = bearer_token(headers) {
            return Some(token);
        }
        let header = headers.get(COOKIE)?;
        let value = header.to_str().ok()?;
        for pair in value.split(';') {
            let trimmed = pair.trim();
            let mut parts = trimmed.splitn(2, '=');
            let key = parts.next()?.trim();
            let val = parts.next()?.trim();
            if key == self.name {
                return Some(val.to_string());
            }
        }
        None
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let trimmed = value.trim();
    let token = trimmed
        .strip_prefix("Bearer ")
        .or_else(|| trimmed.strip_prefix("bearer "))?
        .trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}
