//! External secondary-factor providers.
//!
//! A provider verifies one submitted factor for a user. `Incomplete` models
//! multi-step providers (push approval polls back later) and keeps the
//! challenge open.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use totp_rs::{Algorithm, TOTP};
use tracing::Instrument;
use uuid::Uuid;

use crate::auth::outcome::ErrorData;
use crate::principal::Principal;

/// A specific way of satisfying a provider challenge.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Factor {
    Passcode,
    Push,
    Sms,
    Phone,
}

impl Factor {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Passcode => "passcode",
            Self::Push => "push",
            Self::Sms => "sms",
            Self::Phone => "phone",
        }
    }

    #[must_use]
    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "passcode" => Some(Self::Passcode),
            "push" => Some(Self::Push),
            "sms" => Some(Self::Sms),
            "phone" => Some(Self::Phone),
            _ => None,
        }
    }
}

/// Verification result for one factor submission.
#[derive(Debug)]
pub enum FactorVerdict {
    Approved,
    /// Multi-step provider still waiting on an out-of-band approval.
    Incomplete,
    Denied(ErrorData),
}

#[async_trait]
pub trait FactorProvider: Send + Sync {
    fn id(&self) -> &str;
    fn label(&self) -> &str;
    fn factors(&self) -> &[Factor];

    async fn verify(
        &self,
        principal: &Principal,
        factor: Factor,
        passcode: &str,
    ) -> Result<FactorVerdict>;
}

/// Lookup table of configured providers.
#[derive(Clone, Default)]
pub struct FactorRegistry {
    providers: Vec<Arc<dyn FactorProvider>>,
}

impl FactorRegistry {
    #[must_use]
    pub fn new(providers: Vec<Arc<dyn FactorProvider>>) -> Self {
        Self { providers }
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Arc<dyn FactorProvider>> {
        self.providers.iter().find(|provider| provider.id() == id)
    }
}

/// Source of enrolled TOTP secrets.
#[async_trait]
pub trait TotpSecretStore: Send + Sync {
    async fn secret(&self, user_id: Uuid) -> Result<Option<Vec<u8>>>;
}

/// Postgres-backed secret source over `user_totp`.
pub struct PgTotpSecretStore {
    pool: PgPool,
}

impl PgTotpSecretStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TotpSecretStore for PgTotpSecretStore {
    async fn secret(&self, user_id: Uuid) -> Result<Option<Vec<u8>>> {
        let query = "SELECT secret FROM user_totp WHERE user_id = $1 LIMIT 1";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("failed to lookup TOTP secret")?;
        Ok(row.map(|row| row.get("secret")))
    }
}

/// In-memory secret source for tests and local development.
#[derive(Default)]
pub struct MemoryTotpSecrets {
    secrets: Mutex<HashMap<Uuid, Vec<u8>>>,
}

impl MemoryTotpSecrets {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn enroll(&self, user_id: Uuid, secret: Vec<u8>) {
        self.secrets.lock().await.insert(user_id, secret);
    }
}

#[async_trait]
impl TotpSecretStore for MemoryTotpSecrets {
    async fn secret(&self, user_id: Uuid) -> Result<Option<Vec<u8>>> {
        Ok(self.secrets.lock().await.get(&user_id).cloned())
    }
}

const TOTP_FACTORS: [Factor; 1] = [Factor::Passcode];

/// RFC 6238 passcode provider.
pub struct TotpProvider {
    id: String,
    label: String,
    issuer: String,
    secrets: Arc<dyn TotpSecretStore>,
}

impl TotpProvider {
    #[must_use]
    pub fn new(id: &str, label: &str, issuer: &str, secrets: Arc<dyn TotpSecretStore>) -> Self {
        Self {
            id: id.to_string(),
            label: label.to_string(),
            issuer: issuer.to_string(),
            secrets,
        }
    }

    fn totp(&self, secret: Vec<u8>, account: &str) -> Result<TOTP> {
        TOTP::new(
            Algorithm::SHA1,
            6,
            1,
            30,
            secret,
            Some(self.issuer.clone()),
            account.to_string(),
        )
        .map_err(|err| anyhow::anyhow!("failed to build TOTP: {err}"))
    }
}

#[async_trait]
impl FactorProvider for TotpProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn factors(&self) -> &[Factor] {
        &TOTP_FACTORS
    }

    async fn verify(
        &self,
        principal: &Principal,
        factor: Factor,
        passcode: &str,
    ) -> Result<FactorVerdict> {
        if factor != Factor::Passcode {
            return Ok(FactorVerdict::Denied(ErrorData::secondary_invalid(
                "Factor is not supported by this provider",
            )));
        }

        let Some(secret) = self.secrets.secret(principal.id).await? else {
            return Ok(FactorVerdict::Denied(ErrorData::secondary_invalid(
                "No passcode enrollment for this account",
            )));
        };

        let totp = self.totp(secret, &principal.username)?;
        let valid = totp
            .check_current(passcode.trim())
            .map_err(|err| anyhow::anyhow!("failed to check passcode: {err}"))?;
        if valid {
            Ok(FactorVerdict::Approved)
        } else {
            Ok(FactorVerdict::Denied(ErrorData::secondary_invalid(
                "Invalid passcode",
            )))
        }
    }
}
