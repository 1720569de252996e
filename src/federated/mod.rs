//! Federated single sign-on coordination.
//!
//! Outbound requests carry a signed state (nonce + provider + role); the
//! identity provider signs the callback query with the shared secret. A
//! callback whose signature or nonce does not match an outstanding request is
//! `InvalidState`: benign from the user's perspective, never a 500.

use anyhow::{Context, Result, anyhow};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};

use crate::auth::outcome::ErrorData;
use crate::principal::Role;
use crate::tokens::generate_token;

type HmacSha256 = Hmac<Sha256>;

/// A configured identity provider.
#[derive(Clone, Debug, Deserialize)]
pub struct SsoProvider {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub label: String,
    pub authorize_url: String,
}

#[derive(Debug, Error)]
pub enum FederatedError {
    /// Signature mismatch, unknown nonce, replay, or expired state.
    #[error("federated state invalid")]
    InvalidState,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Verified callback content.
#[derive(Debug)]
pub enum CallbackOutcome {
    Verified {
        username: String,
        role: Role,
        /// Post-login query captured at request time, preserved across the
        /// round trip for the user surface.
        preserved_query: Option<String>,
    },
    Rejected(ErrorData),
}

struct StateRecord {
    created_at: DateTime<Utc>,
    role: Role,
    preserved_query: Option<String>,
}

/// Issues outbound authorization requests and verifies callbacks.
pub struct FederatedCoordinator {
    key: Vec<u8>,
    // Read-mostly; reloads swap the whole list atomically.
    providers: RwLock<Arc<Vec<SsoProvider>>>,
    states: Mutex<HashMap<String, StateRecord>>,
    state_ttl_seconds: i64,
}

impl FederatedCoordinator {
    #[must_use]
    pub fn new(key: Vec<u8>, providers: Vec<SsoProvider>, state_ttl_seconds: i64) -> Self {
        Self {
            key,
            providers: RwLock::new(Arc::new(providers)),
            states: Mutex::new(HashMap::new()),
            state_ttl_seconds,
        }
    }

    pub async fn providers(&self) -> Arc<Vec<SsoProvider>> {
        self.providers.read().await.clone()
    }

    /// Replace the provider configuration.
    pub async fn reload(&self, providers: Vec<SsoProvider>) {
        *self.providers.write().await = Arc::new(providers);
    }

    fn sign(&self, canonical: &str) -> Result<String> {
        let mut mac = HmacSha256::new_from_slice(&self.key)
            .map_err(|err| anyhow!("invalid state signing key: {err}"))?;
        mac.update(canonical.as_bytes());
        Ok(URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes()))
    }

    fn verify_signature(&self, sig: &str, canonical: &str) -> bool {
        let Ok(decoded) = URL_SAFE_NO_PAD.decode(sig.as_bytes()) else {
            return false;
        };
        let Ok(mut mac) = HmacSha256::new_from_slice(&self.key) else {
            return false;
        };
        mac.update(canonical.as_bytes());
        mac.verify_slice(&decoded).is_ok()
    }

    /// Build the outbound redirect for a new authorization request.
    ///
    /// # Errors
    /// Returns an error when no provider is configured or signing fails.
    pub async fn request(&self, role: Role, preserved_query: Option<String>) -> Result<String> {
        let providers = self.providers().await;
        let provider = providers
            .first()
            .context("no federated provider configured")?;

        let state = generate_token()?;
        let now = Utc::now();
        {
            let mut states = self.states.lock().await;
            let ttl = Duration::seconds(self.state_ttl_seconds);
            states.retain(|_, record| now - record.created_at < ttl);
            states.insert(
                state.clone(),
                StateRecord {
                    created_at: now,
                    role,
                    preserved_query,
                },
            );
        }

        let canonical = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("state", &state)
            .append_pair("provider", &provider.id)
            .append_pair("role", role.as_str())
            .finish();
        let sig = self.sign(&canonical)?;
        let base = provider.authorize_url.trim_end_matches('/');
        Ok(format!("{base}?{canonical}&sig={sig}"))
    }

    /// Verify a callback: signature over the canonical query, then the
    /// outstanding-nonce check. The check consumes the nonce, so a second
    /// callback with the same state is a replay.
    pub async fn callback(
        &self,
        sig: &str,
        canonical_query: &str,
    ) -> Result<CallbackOutcome, FederatedError> {
        if !self.verify_signature(sig, canonical_query) {
            return Err(FederatedError::InvalidState);
        }

        let params: HashMap<String, String> =
            url::form_urlencoded::parse(canonical_query.as_bytes())
                .into_owned()
                .collect();

        let state = params.get("state").ok_or(FederatedError::InvalidState)?;

        let record = {
            let now = Utc::now();
            let ttl = Duration::seconds(self.state_ttl_seconds);
            let mut states = self.states.lock().await;
            states.retain(|_, record| now - record.created_at < ttl);
            states.remove(state).ok_or(FederatedError::InvalidState)?
        };

        let username = params
            .get("username")
            .map(String::as_str)
            .unwrap_or_default()
            .trim();
        if username.is_empty() {
            return Ok(CallbackOutcome::Rejected(ErrorData::unauthorized(
                "Provider did not return a username",
            )));
        }

        Ok(CallbackOutcome::Verified {
            username: username.to_string(),
            role: record.role,
            preserved_query: record.preserved_query,
        })
    }
}
