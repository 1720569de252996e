//! Router and server wiring for the two surfaces.
//!
//! The management and user surfaces share one engine and one pool but listen
//! on separate ports, mirroring the gateway's deployment shape where the
//! management plane is not exposed alongside proxied user traffic.

use anyhow::{Context, Result};
use axum::{
    Extension,
    body::Body,
    extract::MatchedPath,
    http::{HeaderName, HeaderValue, Request},
};
use sqlx::{PgPool, postgres::PgPoolOptions};
use std::{sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{
    request_id::PropagateRequestIdLayer, set_header::SetRequestHeaderLayer, trace::TraceLayer,
};
use tracing::{Span, info, info_span};
use ulid::Ulid;

pub(crate) mod handlers;
mod openapi;

pub use openapi::openapi;

use crate::auth::{AuthConfig, AuthEngine, Collaborators};
use crate::device::{PgDeviceStore, SecurityKeyVerifier};
use crate::factor::{FactorRegistry, PgTotpSecretStore, TotpProvider};
use crate::federated::{FederatedCoordinator, SsoProvider};
use crate::principal::PgCredentialStore;
use crate::secondary::PgSecondaryStore;
use crate::session::PgSessionStore;
use crate::validator::{PolicyValidator, RolePolicy};

pub const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);

/// Identifier of the built-in passcode provider.
pub const TOTP_PROVIDER_ID: &str = "totp";

#[derive(Debug)]
pub struct ServerConfig {
    pub admin_port: u16,
    pub user_port: u16,
    pub dsn: String,
    pub state_secret: String,
    pub base_url: String,
    pub demo: bool,
    pub session_ttl_seconds: i64,
    pub secondary_ttl_seconds: i64,
    pub state_ttl_seconds: i64,
    pub sso_providers: Vec<SsoProvider>,
    pub admin_policy: RolePolicy,
    pub user_policy: RolePolicy,
}

/// Compose the engine over Postgres-backed stores.
///
/// # Errors
/// Returns an error if the device verifier configuration is rejected.
pub fn build_engine(pool: PgPool, config: &ServerConfig) -> Result<Arc<AuthEngine>> {
    let auth_config = AuthConfig::new(config.base_url.clone())
        .with_demo(config.demo)
        .with_session_ttl_seconds(config.session_ttl_seconds)
        .with_secondary_ttl_seconds(config.secondary_ttl_seconds)
        .with_state_ttl_seconds(config.state_ttl_seconds);

    let devices = Arc::new(PgDeviceStore::new(pool.clone()));
    let device_verifier = SecurityKeyVerifier::new(
        auth_config.rp_id(),
        &auth_config.rp_origin(),
        auth_config.rp_name(),
    )?;
    let totp_secrets = Arc::new(PgTotpSecretStore::new(pool.clone()));
    let factors = FactorRegistry::new(vec![Arc::new(TotpProvider::new(
        TOTP_PROVIDER_ID,
        "Authenticator passcode",
        auth_config.rp_name(),
        totp_secrets,
    ))]);
    let federated = Arc::new(FederatedCoordinator::new(
        config.state_secret.clone().into_bytes(),
        config.sso_providers.clone(),
        auth_config.state_ttl_seconds(),
    ));
    let validator = Arc::new(PolicyValidator::new(
        config.admin_policy.clone(),
        config.user_policy.clone(),
        devices.clone(),
    ));

    let collaborators = Collaborators {
        credentials: Arc::new(PgCredentialStore::new(pool.clone())),
        validator,
        challenges: Arc::new(PgSecondaryStore::new(
            pool.clone(),
            auth_config.secondary_ttl_seconds(),
        )),
        sessions: Arc::new(PgSessionStore::new(
            pool.clone(),
            auth_config.session_ttl_seconds(),
        )),
        audit: Arc::new(crate::audit::PgAuditSink::new(pool.clone())),
        devices,
        device_verifier: Arc::new(device_verifier),
        factors,
        federated,
    };

    Ok(Arc::new(AuthEngine::new(auth_config, collaborators)))
}

/// Start both surfaces.
///
/// # Errors
/// Returns an error if the database is unreachable or a listener fails.
pub async fn serve(config: ServerConfig) -> Result<()> {
    let pool = PgPoolOptions::new()
        .min_connections(1)
        .max_connections(5)
        .max_lifetime(Duration::from_secs(60 * 2))
        .test_before_acquire(true)
        .connect(&config.dsn)
        .await
        .context("Failed to connect to database")?;

    let engine = build_engine(pool.clone(), &config)?;

    let (admin_router, _spec) = openapi::admin_router().split_for_parts();
    let admin_app = admin_router.layer(
        ServiceBuilder::new()
            .layer(SetRequestHeaderLayer::if_not_present(
                HeaderName::from_static("x-request-id"),
                |_req: &Request<Body>| HeaderValue::from_str(Ulid::new().to_string().as_str()).ok(),
            ))
            .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
                "x-request-id",
            )))
            .layer(TraceLayer::new_for_http().make_span_with(make_span))
            .layer(Extension(engine.clone()))
            .layer(Extension(pool.clone())),
    );

    let (user_router, _spec) = openapi::user_router().split_for_parts();
    let user_app = user_router.layer(
        ServiceBuilder::new()
            .layer(SetRequestHeaderLayer::if_not_present(
                HeaderName::from_static("x-request-id"),
                |_req: &Request<Body>| HeaderValue::from_str(Ulid::new().to_string().as_str()).ok(),
            ))
            .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
                "x-request-id",
            )))
            .layer(TraceLayer::new_for_http().make_span_with(make_span))
            .layer(Extension(engine))
            .layer(Extension(pool)),
    );

    let admin_listener = TcpListener::bind(format!("::0:{}", config.admin_port))
        .await
        .context("Failed to bind management listener")?;
    let user_listener = TcpListener::bind(format!("::0:{}", config.user_port))
        .await
        .context("Failed to bind user listener")?;

    info!(
        "Listening on [::]:{} (management) and [::]:{} (user)",
        config.admin_port, config.user_port
    );

    let admin_serve = axum::serve(admin_listener, admin_app.into_make_service())
        .with_graceful_shutdown(shutdown_signal());
    let user_serve = axum::serve(user_listener, user_app.into_make_service())
        .with_graceful_shutdown(shutdown_signal());

    tokio::try_join!(
        async move { admin_serve.await },
        async move { user_serve.await }
    )
    .context("Server error")?;

    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("Gracefully shutdown");
    }
}

fn make_span(request: &Request<Body>) -> Span {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|val| val.to_str().ok())
        .unwrap_or("none");
    let matched_path = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| request.uri().path(), MatchedPath::as_str);

    info_span!(
        "http.request",
        http.method = %request.method(),
        http.route = matched_path,
        request_id
    )
}
