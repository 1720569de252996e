//! Challenge persistence with optimistic state transitions.

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::Instrument;
use uuid::Uuid;

use super::{Challenge, ChallengeScope, ChallengeState};
use crate::tokens::{generate_token, hash_token};

#[async_trait]
pub trait SecondaryStore: Send + Sync {
    /// Open a challenge bound to `(user_id, scope)`. The binding is fixed for
    /// the challenge's lifetime.
    async fn create(
        &self,
        user_id: Uuid,
        scope: ChallengeScope,
        provider_ref: &str,
    ) -> Result<Challenge>;

    /// Look up a live challenge. Expired or scope-mismatched tokens are
    /// absent.
    async fn get(&self, token: &str, scope: ChallengeScope) -> Result<Option<Challenge>>;

    /// Compare-and-set the state. Returns the updated challenge, or `None`
    /// when the token is absent, expired, or not in one of `from` (a
    /// concurrent caller won the transition).
    async fn transition(
        &self,
        token: &str,
        from: &[ChallengeState],
        to: ChallengeState,
    ) -> Result<Option<Challenge>>;

    /// Attach provider verification state to the challenge.
    async fn set_payload(&self, token: &str, payload: serde_json::Value) -> Result<()>;

    /// Complete and remove the challenge. At most one caller succeeds; the
    /// rest observe `None`.
    async fn consume(&self, token: &str) -> Result<Option<Challenge>>;

    /// Mark the challenge failed and remove it; later operations see
    /// not-found.
    async fn fail(&self, token: &str) -> Result<()>;
}

/// Postgres-backed store over `secondary_challenges`.
pub struct PgSecondaryStore {
    pool: PgPool,
    ttl_seconds: i64,
}

impl PgSecondaryStore {
    #[must_use]
    pub fn new(pool: PgPool, ttl_seconds: i64) -> Self {
        Self { pool, ttl_seconds }
    }
}

fn challenge_from_row(row: &sqlx::postgres::PgRow, token: &str) -> Result<Challenge> {
    let scope: String = row.get("scope");
    let state: String = row.get("state");
    let payload: Option<serde_json::Value> = row.get("payload");
    Ok(Challenge {
        token: token.to_string(),
        user_id: row.get("user_id"),
        scope: ChallengeScope::from_str(&scope)
            .ok_or_else(|| anyhow!("unknown challenge scope: {scope}"))?,
        provider_ref: row.get("provider_ref"),
        state: ChallengeState::from_str(&state)
            .ok_or_else(|| anyhow!("unknown challenge state: {state}"))?,
        created_at: row.get("created_at"),
        expires_at: row.get("expires_at"),
        payload,
    })
}

#[async_trait]
impl SecondaryStore for PgSecondaryStore {
    async fn create(
        &self,
        user_id: Uuid,
        scope: ChallengeScope,
        provider_ref: &str,
    ) -> Result<Challenge> {
        let token = generate_token()?;
        let token_hash = hash_token(&token);
        let query = r"
            INSERT INTO secondary_challenges
                (token_hash, user_id, scope, provider_ref, state, expires_at)
            VALUES ($1, $2, $3, $4, 'pending', NOW() + ($5 * INTERVAL '1 second'))
            RETURNING user_id, scope, provider_ref, state, created_at, expires_at, payload
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(&token_hash)
            .bind(user_id)
            .bind(scope.as_str())
            .bind(provider_ref)
            .bind(self.ttl_seconds)
            .fetch_one(&self.pool)
            .instrument(span)
            .await
            .context("failed to insert secondary challenge")?;

        challenge_from_row(&row, &token)
    }

    async fn get(&self, token: &str, scope: ChallengeScope) -> Result<Option<Challenge>> {
        let token_hash = hash_token(token);
        let query = r"
            SELECT user_id, scope, provider_ref, state, created_at, expires_at, payload
            FROM secondary_challenges
            WHERE token_hash = $1
              AND scope = $2
              AND expires_at > NOW()
            LIMIT 1
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(&token_hash)
            .bind(scope.as_str())
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("failed to lookup secondary challenge")?;

        row.map(|row| challenge_from_row(&row, token)).transpose()
    }

    async fn transition(
        &self,
        token: &str,
        from: &[ChallengeState],
        to: ChallengeState,
    ) -> Result<Option<Challenge>> {
        let token_hash = hash_token(token);
        let from: Vec<String> = from.iter().map(|state| state.as_str().to_string()).collect();
        let query = r"
            UPDATE secondary_challenges
            SET state = $3
            WHERE token_hash = $1
              AND state = ANY($2)
              AND expires_at > NOW()
            RETURNING user_id, scope, provider_ref, state, created_at, expires_at, payload
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(&token_hash)
            .bind(&from)
            .bind(to.as_str())
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("failed to transition secondary challenge")?;

        row.map(|row| challenge_from_row(&row, token)).transpose()
    }

    async fn set_payload(&self, token: &str, payload: serde_json::Value) -> Result<()> {
        let token_hash = hash_token(token);
        let query = r"
            UPDATE secondary_challenges
            SET payload = $2
            WHERE token_hash = $1
              AND expires_at > NOW()
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        sqlx::query(query)
            .bind(&token_hash)
            .bind(payload)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to store challenge payload")?;
        Ok(())
    }

    async fn consume(&self, token: &str) -> Result<Option<Challenge>> {
        let token_hash = hash_token(token);
        // The state column is the serialization point: only one caller moves
        // the row to complete, and the delete that follows makes any later
        // lookup a not-found.
        let query = r"
            DELETE FROM secondary_challenges
            WHERE token_hash = $1
              AND state IN ('pending', 'in-progress')
              AND expires_at > NOW()
            RETURNING user_id, scope, provider_ref, state, created_at, expires_at, payload
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "DELETE",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(&token_hash)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("failed to consume secondary challenge")?;

        row.map(|row| {
            let mut challenge = challenge_from_row(&row, token)?;
            challenge.state = ChallengeState::Complete;
            Ok(challenge)
        })
        .transpose()
    }

    async fn fail(&self, token: &str) -> Result<()> {
        let token_hash = hash_token(token);
        let query = "DELETE FROM secondary_challenges WHERE token_hash = $1";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "DELETE",
            db.statement = query
        );
        sqlx::query(query)
            .bind(&token_hash)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to remove secondary challenge")?;
        Ok(())
    }
}

/// In-memory store sweeping expired entries on access.
pub struct MemorySecondaryStore {
    ttl_seconds: i64,
    entries: Mutex<HashMap<String, Challenge>>,
}

impl MemorySecondaryStore {
    #[must_use]
    pub fn new(ttl_seconds: i64) -> Self {
        Self {
            ttl_seconds,
            entries: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl SecondaryStore for MemorySecondaryStore {
    async fn create(
        &self,
        user_id: Uuid,
        scope: ChallengeScope,
        provider_ref: &str,
    ) -> Result<Challenge> {
        let now = Utc::now();
        let challenge = Challenge {
            token: generate_token()?,
            user_id,
            scope,
            provider_ref: provider_ref.to_string(),
            state: ChallengeState::Pending,
            created_at: now,
            expires_at: now + Duration::seconds(self.ttl_seconds),
            payload: None,
        };
        self.entries
            .lock()
            .await
            .insert(challenge.token.clone(), challenge.clone());
        Ok(challenge)
    }

    async fn get(&self, token: &str, scope: ChallengeScope) -> Result<Option<Challenge>> {
        let now = Utc::now();
        let mut entries = self.entries.lock().await;
        entries.retain(|_, challenge| !challenge.is_expired(now));
        Ok(entries
            .get(token)
            .filter(|challenge| challenge.scope == scope)
            .cloned())
    }

    async fn transition(
        &self,
        token: &str,
        from: &[ChallengeState],
        to: ChallengeState,
    ) -> Result<Option<Challenge>> {
        let now = Utc::now();
        let mut entries = self.entries.lock().await;
        entries.retain(|_, challenge| !challenge.is_expired(now));
        let Some(challenge) = entries.get_mut(token) else {
            return Ok(None);
        };
        if !from.contains(&challenge.state) {
            return Ok(None);
        }
        challenge.state = to;
        Ok(Some(challenge.clone()))
    }

    async fn set_payload(&self, token: &str, payload: serde_json::Value) -> Result<()> {
        let mut entries = self.entries.lock().await;
        if let Some(challenge) = entries.get_mut(token) {
            challenge.payload = Some(payload);
        }
        Ok(())
    }

    async fn consume(&self, token: &str) -> Result<Option<Challenge>> {
        let now = Utc::now();
        let mut entries = self.entries.lock().await;
        entries.retain(|_, challenge| !challenge.is_expired(now));
        let live = entries
            .get(token)
            .is_some_and(|challenge| {
                matches!(
                    challenge.state,
                    ChallengeState::Pending | ChallengeState::InProgress
                )
            });
        if !live {
            return Ok(None);
        }
        let mut challenge = entries.remove(token).context("challenge vanished")?;
        challenge.state = ChallengeState::Complete;
        Ok(Some(challenge))
    }

    async fn fail(&self, token: &str) -> Result<()> {
        self.entries.lock().await.remove(token);
        Ok(())
    }
}
