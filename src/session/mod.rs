//! Session records scoped to the admin or user surface.
//!
//! Tokens are opaque; the Postgres store persists only a hash. Revocation is
//! durable per record, which lets logout-all loop over sessions without an
//! enclosing transaction.

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::Instrument;
use uuid::Uuid;

use crate::tokens::{generate_token, hash_token};

/// Role partition for sessions and cookies.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionScope {
    Admin,
    User,
}

impl SessionScope {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::User => "user",
        }
    }
}

/// A stored session record. The raw token is never part of the record.
#[derive(Clone, Debug)]
pub struct Session {
    pub id: Uuid,
    pub user_id: Uuid,
    pub scope: SessionScope,
    pub created_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// A freshly minted session together with the raw token for the cookie.
#[derive(Clone, Debug)]
pub struct MintedSession {
    pub record: Session,
    pub token: String,
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Mint a session bound to a user and role scope.
    async fn create(&self, user_id: Uuid, scope: SessionScope) -> Result<MintedSession>;

    /// Resolve a raw token. Expired or scope-mismatched sessions are absent.
    /// Touches `last_seen` on hit.
    async fn get(&self, token: &str, scope: SessionScope) -> Result<Option<Session>>;

    async fn list_for_user(&self, user_id: Uuid) -> Result<Vec<Session>>;

    /// Revoke by record id. Revoking an absent session is a no-op.
    async fn revoke(&self, id: Uuid) -> Result<()>;

    /// Revoke by raw token. Absent tokens are a no-op.
    async fn revoke_token(&self, token: &str) -> Result<()>;
}

/// Postgres-backed store over `sessions`.
pub struct PgSessionStore {
    pool: PgPool,
    ttl_seconds: i64,
}

impl PgSessionStore {
    #[must_use]
    pub fn new(pool: PgPool, ttl_seconds: i64) -> Self {
        Self { pool, ttl_seconds }
    }
}

fn scope_from_str(value: &str) -> Result<SessionScope> {
    match value {
        "admin" => Ok(SessionScope::Admin),
        "user" => Ok(SessionScope::User),
        other => Err(anyhow!("unknown session scope: {other}")),
    }
}

#[async_trait]
impl SessionStore for PgSessionStore {
    async fn create(&self, user_id: Uuid, scope: SessionScope) -> Result<MintedSession> {
        let query = r"
            INSERT INTO sessions (id, user_id, scope, token_hash, expires_at)
            VALUES ($1, $2, $3, $4, NOW() + ($5 * INTERVAL '1 second'))
            RETURNING created_at, last_seen
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query
        );

        for _ in 0..3 {
            let id = Uuid::new_v4();
            let token = generate_token()?;
            let token_hash = hash_token(&token);
            let result = sqlx::query(query)
                .bind(id)
                .bind(user_id)
                .bind(scope.as_str())
                .bind(&token_hash)
                .bind(self.ttl_seconds)
                .fetch_one(&self.pool)
                .instrument(span.clone())
                .await;

            match result {
                Ok(row) => {
                    return Ok(MintedSession {
                        record: Session {
                            id,
                            user_id,
                            scope,
                            created_at: row.get("created_at"),
                            last_seen: row.get("last_seen"),
                        },
                        token,
                    });
                }
                Err(err) if is_unique_violation(&err) => {}
                Err(err) => return Err(err).context("failed to insert session"),
            }
        }

        Err(anyhow!("failed to generate unique session token"))
    }

    async fn get(&self, token: &str, scope: SessionScope) -> Result<Option<Session>> {
        let token_hash = hash_token(token);
        // Touching last_seen in the same statement keeps hit + activity update
        // a single round trip.
        let query = r"
            UPDATE sessions
            SET last_seen = NOW()
            WHERE token_hash = $1
              AND scope = $2
              AND expires_at > NOW()
            RETURNING id, user_id, created_at, last_seen
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(&token_hash)
            .bind(scope.as_str())
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("failed to lookup session")?;

        Ok(row.map(|row| Session {
            id: row.get("id"),
            user_id: row.get("user_id"),
            scope,
            created_at: row.get("created_at"),
            last_seen: row.get("last_seen"),
        }))
    }

    async fn list_for_user(&self, user_id: Uuid) -> Result<Vec<Session>> {
        let query = r"
            SELECT id, user_id, scope, created_at, last_seen
            FROM sessions
            WHERE user_id = $1
              AND expires_at > NOW()
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let rows = sqlx::query(query)
            .bind(user_id)
            .fetch_all(&self.pool)
            .instrument(span)
            .await
            .context("failed to list sessions")?;

        rows.into_iter()
            .map(|row| {
                let scope: String = row.get("scope");
                Ok(Session {
                    id: row.get("id"),
                    user_id: row.get("user_id"),
                    scope: scope_from_str(&scope)?,
                    created_at: row.get("created_at"),
                    last_seen: row.get("last_seen"),
                })
            })
            .collect()
    }

    async fn revoke(&self, id: Uuid) -> Result<()> {
        let query = "DELETE FROM sessions WHERE id = $1";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "DELETE",
            db.statement = query
        );
        sqlx::query(query)
            .bind(id)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to revoke session")?;
        Ok(())
    }

    async fn revoke_token(&self, token: &str) -> Result<()> {
        let token_hash = hash_token(token);
        let query = "DELETE FROM sessions WHERE token_hash = $1";
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
            .context("failed to revoke session by token")?;
        Ok(())
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().is_some_and(|code| code.as_ref() == "23505"),
        _ => false,
    }
}

struct MemoryEntry {
    session: Session,
    expires_at: DateTime<Utc>,
}

/// In-memory store keyed by token hash.
pub struct MemorySessionStore {
    ttl_seconds: i64,
    entries: Mutex<HashMap<Vec<u8>, MemoryEntry>>,
}

impl MemorySessionStore {
    #[must_use]
    pub fn new(ttl_seconds: i64) -> Self {
        Self {
            ttl_seconds,
            entries: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn create(&self, user_id: Uuid, scope: SessionScope) -> Result<MintedSession> {
        let token = generate_token()?;
        let now = Utc::now();
        let session = Session {
            id: Uuid::new_v4(),
            user_id,
            scope,
            created_at: now,
            last_seen: now,
        };
        let entry = MemoryEntry {
            session: session.clone(),
            expires_at: now + chrono::Duration::seconds(self.ttl_seconds),
        };
        self.entries.lock().await.insert(hash_token(&token), entry);
        Ok(MintedSession {
            record: session,
            token,
        })
    }

    async fn get(&self, token: &str, scope: SessionScope) -> Result<Option<Session>> {
        let now = Utc::now();
        let mut entries = self.entries.lock().await;
        entries.retain(|_, entry| entry.expires_at > now);
        let Some(entry) = entries.get_mut(&hash_token(token)) else {
            return Ok(None);
        };
        if entry.session.scope != scope {
            return Ok(None);
        }
        entry.session.last_seen = now;
        Ok(Some(entry.session.clone()))
    }

    async fn list_for_user(&self, user_id: Uuid) -> Result<Vec<Session>> {
        let now = Utc::now();
        let entries = self.entries.lock().await;
        Ok(entries
            .values()
            .filter(|entry| entry.expires_at > now && entry.session.user_id == user_id)
            .map(|entry| entry.session.clone())
            .collect())
    }

    async fn revoke(&self, id: Uuid) -> Result<()> {
        let mut entries = self.entries.lock().await;
        entries.retain(|_, entry| entry.session.id != id);
        Ok(())
    }

    async fn revoke_token(&self, token: &str) -> Result<()> {
        let mut entries = self.entries.lock().await;
        entries.remove(&hash_token(token));
        Ok(())
    }
}
