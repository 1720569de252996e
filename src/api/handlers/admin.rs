//! Management-surface auth endpoints.
//!
//! Same engine as the user surface; only the role parameter and post-login
//! routing differ (status codes in place of redirects).

use axum::{
    Json,
    extract::{Extension, Query, RawQuery},
    http::{HeaderMap, Method, StatusCode, Uri, header::SET_COOKIE},
    response::{IntoResponse, Response},
};
use std::sync::Arc;

use super::{
    SuccessRouting, binder_for, internal_error, request_info, respond, respond_challenge_fetch,
    split_callback_query,
};
use crate::api::handlers::types::{DeviceSignRequest, LoginRequest, SecondaryRequest, SignTokenQuery};
use crate::auth::{AuthEngine, StateDescriptor};
use crate::auth::outcome::ErrorData;
use crate::principal::{Credentials, Role};

const ROLE: Role = Role::Admin;

#[utoipa::path(
    get,
    path = "/auth/state",
    responses(
        (status = 200, description = "Configured providers", body = StateDescriptor)
    ),
    tag = "auth"
)]
pub async fn auth_state(engine: Extension<Arc<AuthEngine>>) -> impl IntoResponse {
    Json(engine.discover_state().await)
}

#[utoipa::path(
    post,
    path = "/auth/session",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Session installed"),
        (status = 201, description = "Secondary factor required"),
        (status = 401, description = "Authentication refused", body = ErrorData)
    ),
    tag = "auth"
)]
pub async fn auth_session_post(
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    engine: Extension<Arc<AuthEngine>>,
    payload: Option<Json<LoginRequest>>,
) -> Response {
    let Some(Json(request)) = payload else {
        return (StatusCode::BAD_REQUEST, "Missing payload").into_response();
    };
    let info = request_info(&method, &uri, &headers);
    let creds = Credentials {
        username: request.username,
        password: request.password,
    };
    match engine.begin_local(&creds, ROLE, &info).await {
        Ok(outcome) => respond(outcome, ROLE, &engine, "", SuccessRouting::InPlace),
        Err(err) => internal_error(&err),
    }
}

#[utoipa::path(
    post,
    path = "/auth/secondary",
    request_body = SecondaryRequest,
    responses(
        (status = 200, description = "Session installed"),
        (status = 201, description = "Factor verification still in progress"),
        (status = 401, description = "Challenge expired or factor rejected", body = ErrorData)
    ),
    tag = "auth"
)]
pub async fn auth_secondary_post(
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    engine: Extension<Arc<AuthEngine>>,
    payload: Option<Json<SecondaryRequest>>,
) -> Response {
    let Some(Json(request)) = payload else {
        return (StatusCode::BAD_REQUEST, "Missing payload").into_response();
    };
    let info = request_info(&method, &uri, &headers);
    match engine
        .complete_secondary(&request.token, &request.factor, &request.passcode, ROLE, &info)
        .await
    {
        Ok(outcome) => respond(outcome, ROLE, &engine, "", SuccessRouting::InPlace),
        Err(err) => internal_error(&err),
    }
}

#[utoipa::path(
    get,
    path = "/auth/request",
    responses(
        (status = 302, description = "Redirect to the identity provider")
    ),
    tag = "auth"
)]
pub async fn auth_request_get(engine: Extension<Arc<AuthEngine>>) -> Response {
    match engine.begin_federated(ROLE, None).await {
        Ok(redirect) => super::found(&redirect),
        Err(err) => internal_error(&err),
    }
}

#[utoipa::path(
    get,
    path = "/auth/callback",
    responses(
        (status = 302, description = "Session installed or benign state mismatch"),
        (status = 201, description = "Device factor required"),
        (status = 401, description = "Authentication refused", body = ErrorData)
    ),
    tag = "auth"
)]
pub async fn auth_callback_get(
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    engine: Extension<Arc<AuthEngine>>,
    RawQuery(raw_query): RawQuery,
) -> Response {
    let raw_query = raw_query.unwrap_or_default();
    let (sig, canonical) = split_callback_query(&raw_query);
    let info = request_info(&method, &uri, &headers);
    match engine.complete_federated(&sig, &canonical, ROLE, &info).await {
        Ok(outcome) => respond(outcome, ROLE, &engine, "", SuccessRouting::Callback),
        Err(err) => internal_error(&err),
    }
}

#[utoipa::path(
    get,
    path = "/auth/u2f/sign",
    params(
        ("token" = String, Query, description = "Secondary challenge token")
    ),
    responses(
        (status = 200, description = "Device sign challenge"),
        (status = 401, description = "Challenge expired", body = ErrorData)
    ),
    tag = "auth"
)]
pub async fn auth_u2f_sign_get(
    engine: Extension<Arc<AuthEngine>>,
    query: Query<SignTokenQuery>,
) -> Response {
    match engine.device_sign_request(&query.token, ROLE).await {
        Ok(fetch) => respond_challenge_fetch(fetch),
        Err(err) => internal_error(&err),
    }
}

#[utoipa::path(
    post,
    path = "/auth/u2f/sign",
    request_body = DeviceSignRequest,
    responses(
        (status = 200, description = "Session installed"),
        (status = 201, description = "Provider factor additionally required"),
        (status = 401, description = "Challenge expired or device rejected", body = ErrorData)
    ),
    tag = "auth"
)]
pub async fn auth_u2f_sign_post(
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    engine: Extension<Arc<AuthEngine>>,
    payload: Option<Json<DeviceSignRequest>>,
) -> Response {
    let Some(Json(request)) = payload else {
        return (StatusCode::BAD_REQUEST, "Missing payload").into_response();
    };
    let info = request_info(&method, &uri, &headers);
    match engine
        .device_sign_response(&request.token, &request.response, ROLE, &info)
        .await
    {
        Ok(outcome) => respond(outcome, ROLE, &engine, "", SuccessRouting::InPlace),
        Err(err) => internal_error(&err),
    }
}

#[utoipa::path(
    get,
    path = "/logout",
    responses(
        (status = 302, description = "Session revoked; redirect to login")
    ),
    tag = "auth"
)]
pub async fn logout_get(
    headers: HeaderMap,
    engine: Extension<Arc<AuthEngine>>,
) -> Response {
    let binder = binder_for(&engine, ROLE);
    let token = binder.token_from_headers(&headers);
    if let Err(err) = engine.logout(token.as_deref()).await {
        return internal_error(&err);
    }

    // Clear the cookie even if no session record existed.
    let mut response = super::found("/login");
    if let Ok(cookie) = binder.clear() {
        response.headers_mut().insert(SET_COOKIE, cookie);
    }
    response
}
