//! HTTP handlers and shared surface plumbing.
//!
//! The admin and user modules are thin role adapters over the shared engine:
//! they parse the request, call the matching engine operation with their
//! role, and map the outcome through [`respond`].

pub(crate) mod admin;
pub(crate) mod health;
pub(crate) mod types;
pub(crate) mod user;

use axum::{
    Json,
    http::{
        HeaderMap, Method, StatusCode, Uri,
        header::{LOCATION, SET_COOKIE},
    },
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use tracing::error;

use crate::audit::RequestInfo;
use crate::auth::AuthEngine;
use crate::auth::outcome::{AuthOutcome, ChallengeFetch, ErrorData};
use crate::cookie::CookieBinder;
use crate::principal::{Principal, Role};

/// Post-login shape on success: local/secondary paths answer in place, the
/// federated callback always redirects.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum SuccessRouting {
    InPlace,
    Callback,
}

pub(crate) fn request_info(method: &Method, uri: &Uri, headers: &HeaderMap) -> RequestInfo {
    RequestInfo::new(method.as_str(), uri.path()).with_remote_ip(extract_client_ip(headers))
}

/// Extract a client IP from common proxy headers.
fn extract_client_ip(headers: &HeaderMap) -> Option<String> {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty());
    if forwarded.is_some() {
        return forwarded.map(str::to_string);
    }
    headers
        .get("x-real-ip")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

pub(crate) fn binder_for(engine: &AuthEngine, role: Role) -> CookieBinder {
    CookieBinder::new(
        role.session_scope(),
        engine.config().session_cookie_secure(),
        engine.config().session_ttl_seconds(),
    )
}

pub(crate) fn internal_error(err: &anyhow::Error) -> Response {
    error!("Request failed: {err:#}");
    StatusCode::INTERNAL_SERVER_ERROR.into_response()
}

fn found(location: &str) -> Response {
    match location.parse() {
        Ok(value) => {
            let mut headers = HeaderMap::new();
            headers.insert(LOCATION, value);
            (StatusCode::FOUND, headers).into_response()
        }
        Err(err) => {
            error!("Failed to build redirect location: {err}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

fn post_login_location(preserved_query: Option<&str>, raw_query: &str) -> String {
    let query = preserved_query
        .filter(|query| !query.is_empty())
        .unwrap_or(raw_query);
    if query.is_empty() {
        "/".to_string()
    } else {
        format!("/?{query}")
    }
}

/// Map an engine outcome onto the wire for one surface.
///
/// The cookie header is only ever attached to the session-installing branch;
/// every 401/500 leaves the response cookie-free.
pub(crate) fn respond(
    outcome: AuthOutcome,
    role: Role,
    engine: &AuthEngine,
    raw_query: &str,
    routing: SuccessRouting,
) -> Response {
    match outcome {
        AuthOutcome::SessionInstalled {
            session,
            preserved_query,
            ..
        } => {
            let binder = binder_for(engine, role);
            let cookie = match binder.install(&session.token, true) {
                Ok(cookie) => cookie,
                Err(err) => {
                    error!("Failed to build session cookie: {err}");
                    return StatusCode::INTERNAL_SERVER_ERROR.into_response();
                }
            };
            let mut headers = HeaderMap::new();
            headers.insert(SET_COOKIE, cookie);

            match (role, routing) {
                (Role::Admin, SuccessRouting::InPlace) => {
                    (StatusCode::OK, headers).into_response()
                }
                (Role::Admin, SuccessRouting::Callback) => (headers, found("/")).into_response(),
                (Role::User, _) => {
                    let location = post_login_location(preserved_query.as_deref(), raw_query);
                    (headers, found(&location)).into_response()
                }
            }
        }
        AuthOutcome::SecondaryRequired(descriptor) => {
            (StatusCode::CREATED, Json(descriptor)).into_response()
        }
        AuthOutcome::SecondaryPrompt { query } => found(&format!("/login?{query}")),
        AuthOutcome::SecondaryIncomplete => StatusCode::CREATED.into_response(),
        AuthOutcome::SecondaryExpired => (
            StatusCode::UNAUTHORIZED,
            Json(ErrorData::secondary_expired()),
        )
            .into_response(),
        AuthOutcome::Denied { data, .. } => {
            (StatusCode::UNAUTHORIZED, Json(data)).into_response()
        }
        AuthOutcome::InvalidState => found("/"),
    }
}

/// Map a device challenge fetch onto the wire.
pub(crate) fn respond_challenge_fetch(fetch: ChallengeFetch) -> Response {
    match fetch {
        ChallengeFetch::Challenge(challenge) => (StatusCode::OK, Json(challenge)).into_response(),
        ChallengeFetch::Expired => (
            StatusCode::UNAUTHORIZED,
            Json(ErrorData::secondary_expired()),
        )
            .into_response(),
        ChallengeFetch::Rejected(data) => {
            (StatusCode::UNAUTHORIZED, Json(data)).into_response()
        }
    }
}

/// Resolve the caller's session into a principal, or fail with 401/500.
pub(crate) async fn require_principal(
    headers: &HeaderMap,
    engine: &Arc<AuthEngine>,
    role: Role,
) -> Result<(Principal, String), Response> {
    let binder = binder_for(engine, role);
    let Some(token) = binder.token_from_headers(headers) else {
        return Err(StatusCode::UNAUTHORIZED.into_response());
    };
    match engine.authorize(&token, role).await {
        Ok(Some(principal)) => Ok((principal, token)),
        Ok(None) => Err(StatusCode::UNAUTHORIZED.into_response()),
        Err(err) => Err(internal_error(&err)),
    }
}

/// Split a callback query into the signature and the canonical query the
/// signature covers (everything before the trailing `&sig=`).
pub(crate) fn split_callback_query(raw_query: &str) -> (String, String) {
    let canonical = raw_query
        .split("&sig=")
        .next()
        .unwrap_or_default()
        .to_string();
    let sig = url::form_urlencoded::parse(raw_query.as_bytes())
        .find(|(key, _)| key == "sig")
        .map(|(_, value)| value.into_owned())
        .unwrap_or_default();
    (sig, canonical)
}
