//! Principals, roles, and local credential verification.

use anyhow::{Context, Result};
use argon2::{
    Argon2, PasswordHash, PasswordVerifier,
    password_hash::{PasswordHasher, SaltString, rand_core::OsRng},
};
use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tokio::sync::Mutex;
use tracing::Instrument;
use uuid::Uuid;

use crate::audit::AuditKind;
use crate::secondary::ChallengeScope;
use crate::session::SessionScope;

/// Surface role. Routes post-login behavior and parameterizes the validator.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Role {
    Admin,
    User,
}

impl Role {
    #[must_use]
    pub fn session_scope(self) -> SessionScope {
        match self {
            Self::Admin => SessionScope::Admin,
            Self::User => SessionScope::User,
        }
    }

    #[must_use]
    pub fn login_scope(self) -> ChallengeScope {
        match self {
            Self::Admin => ChallengeScope::AdminLogin,
            Self::User => ChallengeScope::UserLogin,
        }
    }

    #[must_use]
    pub fn login_kind(self) -> AuditKind {
        match self {
            Self::Admin => AuditKind::AdminLogin,
            Self::User => AuditKind::UserLogin,
        }
    }

    #[must_use]
    pub fn login_failed_kind(self) -> AuditKind {
        match self {
            Self::Admin => AuditKind::AdminLoginFailed,
            Self::User => AuditKind::UserLoginFailed,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::User => "user",
        }
    }

    #[must_use]
    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "admin" => Some(Self::Admin),
            "user" => Some(Self::User),
            _ => None,
        }
    }
}

/// Authenticated user identity.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Principal {
    pub id: Uuid,
    pub username: String,
}

/// Local login input.
#[derive(Clone, Debug)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Source of principals and local password verification.
///
/// User provisioning lives elsewhere; this contract only resolves and
/// verifies existing accounts.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Verify username/password. `None` means the credentials are invalid;
    /// the caller must not distinguish unknown users from wrong passwords.
    async fn verify(&self, creds: &Credentials) -> Result<Option<Principal>>;

    async fn lookup(&self, user_id: Uuid) -> Result<Option<Principal>>;

    async fn lookup_username(&self, username: &str) -> Result<Option<Principal>>;
}

/// Postgres-backed credential source over `users`.
pub struct PgCredentialStore {
    pool: PgPool,
}

impl PgCredentialStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CredentialStore for PgCredentialStore {
    async fn verify(&self, creds: &Credentials) -> Result<Option<Principal>> {
        let query = r"
            SELECT id, username, password_hash
            FROM users
            WHERE username = $1
              AND status = 'active'
            LIMIT 1
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(&creds.username)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("failed to lookup user for login")?;

        let Some(row) = row else {
            return Ok(None);
        };

        let hash: String = row.get("password_hash");
        if !verify_password(&creds.password, &hash) {
            return Ok(None);
        }

        Ok(Some(Principal {
            id: row.get("id"),
            username: row.get("username"),
        }))
    }

    async fn lookup(&self, user_id: Uuid) -> Result<Option<Principal>> {
        let query = r"
            SELECT id, username
            FROM users
            WHERE id = $1
              AND status = 'active'
            LIMIT 1
        ";
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
            .context("failed to lookup user")?;

        Ok(row.map(|row| Principal {
            id: row.get("id"),
            username: row.get("username"),
        }))
    }

    async fn lookup_username(&self, username: &str) -> Result<Option<Principal>> {
        let query = r"
            SELECT id, username
            FROM users
            WHERE username = $1
              AND status = 'active'
            LIMIT 1
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(username)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("failed to lookup user by username")?;

        Ok(row.map(|row| Principal {
            id: row.get("id"),
            username: row.get("username"),
        }))
    }
}

/// Verify a password against a stored argon2 hash.
///
/// Malformed stored hashes verify as false rather than erroring; an account
/// with a corrupt hash is unusable, not a 500.
fn verify_password(password: &str, hash: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(hash) else {
        return false;
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

/// Hash a password for storage.
pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|err| anyhow::anyhow!("failed to hash password: {err}"))?;
    Ok(hash.to_string())
}

struct MemoryUser {
    principal: Principal,
    password_hash: String,
}

/// In-memory credential source for tests and local development.
#[derive(Default)]
pub struct MemoryCredentialStore {
    users: Mutex<Vec<MemoryUser>>,
}

impl MemoryCredentialStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a user with the given password; returns the new principal.
    pub async fn add_user(&self, username: &str, password: &str) -> Result<Principal> {
        let principal = Principal {
            id: Uuid::new_v4(),
            username: username.to_string(),
        };
        let user = MemoryUser {
            principal: principal.clone(),
            password_hash: hash_password(password)?,
        };
        self.users.lock().await.push(user);
        Ok(principal)
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn verify(&self, creds: &Credentials) -> Result<Option<Principal>> {
        let users = self.users.lock().await;
        Ok(users
            .iter()
            .find(|user| user.principal.username == creds.username)
            .filter(|user| verify_password(&creds.password, &user.password_hash))
            .map(|user| user.principal.clone()))
    }

    async fn lookup(&self, user_id: Uuid) -> Result<Option<Principal>> {
        let users = self.users.lock().await;
        Ok(users
            .iter()
            .find(|user| user.principal.id == user_id)
            .map(|user| user.principal.clone()))
    }

    async fn lookup_username(&self, username: &str) -> Result<Option<Principal>> {
        let users = self.users.lock().await;
        Ok(users
            .iter()
            .find(|user| user.principal.username == username)
            .map(|user| user.principal.clone()))
    }
}
