//! Append-only audit log for authentication outcomes.
//!
//! Every accepted or rejected login attempt is recorded before a session is
//! ever installed; a failed audit write aborts the attempt.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use sqlx::PgPool;
use std::collections::BTreeMap;
use tokio::sync::Mutex;
use tracing::Instrument;
use uuid::Uuid;

/// Event kinds emitted by the authentication engine.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AuditKind {
    AdminLogin,
    AdminLoginFailed,
    UserLogin,
    UserLoginFailed,
    UserDeviceRegister,
    UserDeviceRegisterFailed,
}

impl AuditKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AdminLogin => "admin-login",
            Self::AdminLoginFailed => "admin-login-failed",
            Self::UserLogin => "user-login",
            Self::UserLoginFailed => "user-login-failed",
            Self::UserDeviceRegister => "user-device-register",
            Self::UserDeviceRegisterFailed => "user-device-register-failed",
        }
    }

    /// True for kinds recording an accepted authentication.
    #[must_use]
    pub fn is_success(self) -> bool {
        matches!(
            self,
            Self::AdminLogin | Self::UserLogin | Self::UserDeviceRegister
        )
    }
}

/// Request context captured alongside each event.
#[derive(Clone, Debug, Default)]
pub struct RequestInfo {
    pub method: String,
    pub path: String,
    pub remote_ip: Option<String>,
}

impl RequestInfo {
    #[must_use]
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            remote_ip: None,
        }
    }

    #[must_use]
    pub fn with_remote_ip(mut self, ip: Option<String>) -> Self {
        self.remote_ip = ip;
        self
    }
}

/// A single audit record.
#[derive(Clone, Debug)]
pub struct AuditEvent {
    pub user_id: Uuid,
    pub kind: AuditKind,
    pub request: RequestInfo,
    pub fields: BTreeMap<String, String>,
    pub timestamp: DateTime<Utc>,
}

impl AuditEvent {
    #[must_use]
    pub fn new(user_id: Uuid, kind: AuditKind, request: RequestInfo) -> Self {
        Self {
            user_id,
            kind,
            request,
            fields: BTreeMap::new(),
            timestamp: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_field(mut self, key: &str, value: &str) -> Self {
        self.fields.insert(key.to_string(), value.to_string());
        self
    }
}

/// Destination for audit events.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn write(&self, event: AuditEvent) -> Result<()>;
}

/// Postgres-backed sink appending to `audit_events`.
pub struct PgAuditSink {
    pool: PgPool,
}

impl PgAuditSink {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuditSink for PgAuditSink {
    async fn write(&self, event: AuditEvent) -> Result<()> {
        let query = r"
            INSERT INTO audit_events
                (user_id, kind, method, path, remote_ip, fields, created_at)
            VALUES ($1, $2, $3, $4, $5, $6::jsonb, $7)
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query
        );
        let fields = serde_json::to_string(&json!(event.fields))
            .context("failed to serialize audit fields")?;
        sqlx::query(query)
            .bind(event.user_id)
            .bind(event.kind.as_str())
            .bind(&event.request.method)
            .bind(&event.request.path)
            .bind(event.request.remote_ip.as_deref())
            .bind(fields)
            .bind(event.timestamp)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to insert audit event")?;
        Ok(())
    }
}

/// In-memory sink; used by tests to assert on recorded events.
#[derive(Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot(&self) -> Vec<AuditEvent> {
        self.events.lock().await.clone()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn write(&self, event: AuditEvent) -> Result<()> {
        self.events.lock().await.push(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_names_match_log_format() {
        assert_eq!(AuditKind::AdminLogin.as_str(), "admin-login");
        assert_eq!(AuditKind::AdminLoginFailed.as_str(), "admin-login-failed");
        assert_eq!(AuditKind::UserLogin.as_str(), "user-login");
        assert_eq!(AuditKind::UserLoginFailed.as_str(), "user-login-failed");
        assert_eq!(
            AuditKind::UserDeviceRegister.as_str(),
            "user-device-register"
        );
        assert_eq!(
            AuditKind::UserDeviceRegisterFailed.as_str(),
            "user-device-register-failed"
        );
    }

    #[test]
    fn success_kinds_classified() {
        assert!(AuditKind::AdminLogin.is_success());
        assert!(AuditKind::UserDeviceRegister.is_success());
        assert!(!AuditKind::UserLoginFailed.is_success());
    }

    #[tokio::test]
    async fn memory_sink_records_events() {
        let sink = MemoryAuditSink::new();
        let event = AuditEvent::new(
            Uuid::new_v4(),
            AuditKind::UserLogin,
            RequestInfo::new("POST", "/auth/session"),
        )
        .with_field("method", "local");
        sink.write(event).await.expect("write");

        let events = sink.snapshot().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, AuditKind::UserLogin);
        assert_eq!(events[0].fields.get("method").map(String::as_str), Some("local"));
    }
}
