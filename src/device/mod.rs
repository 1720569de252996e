//! Registered hardware authenticators bound to principals.

mod verifier;

pub use verifier::{
    ChallengeOutcome, DeviceChallenge, DeviceVerifier, RegisterVerdict, SecurityKeyVerifier,
    SignVerdict,
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tokio::sync::Mutex;
use tracing::Instrument;
use uuid::Uuid;

/// Persisted device credential.
#[derive(Clone, Debug)]
pub struct DeviceRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub label: String,
    /// Verifier-specific credential blob; opaque to everything else.
    pub credential: serde_json::Value,
    pub counter: u32,
    pub registered_at: DateTime<Utc>,
}

impl DeviceRecord {
    #[must_use]
    pub fn new(user_id: Uuid, label: &str, credential: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            label: label.to_string(),
            credential,
            counter: 0,
            registered_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait DeviceStore: Send + Sync {
    async fn list(&self, user_id: Uuid) -> Result<Vec<DeviceRecord>>;
    async fn insert(&self, record: DeviceRecord) -> Result<()>;
    async fn update_counter(&self, id: Uuid, counter: u32) -> Result<()>;
}

/// Postgres-backed store over `devices`.
pub struct PgDeviceStore {
    pool: PgPool,
}

impl PgDeviceStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DeviceStore for PgDeviceStore {
    async fn list(&self, user_id: Uuid) -> Result<Vec<DeviceRecord>> {
        let query = r"
            SELECT id, user_id, label, credential, counter, registered_at
            FROM devices
            WHERE user_id = $1
            ORDER BY registered_at
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
            .context("failed to list devices")?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let counter: i64 = row.get("counter");
                DeviceRecord {
                    id: row.get("id"),
                    user_id: row.get("user_id"),
                    label: row.get("label"),
                    credential: row.get("credential"),
                    counter: u32::try_from(counter).unwrap_or(0),
                    registered_at: row.get("registered_at"),
                }
            })
            .collect())
    }

    async fn insert(&self, record: DeviceRecord) -> Result<()> {
        let query = r"
            INSERT INTO devices (id, user_id, label, credential, counter, registered_at)
            VALUES ($1, $2, $3, $4, $5, $6)
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query
        );
        sqlx::query(query)
            .bind(record.id)
            .bind(record.user_id)
            .bind(&record.label)
            .bind(&record.credential)
            .bind(i64::from(record.counter))
            .bind(record.registered_at)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to insert device")?;
        Ok(())
    }

    async fn update_counter(&self, id: Uuid, counter: u32) -> Result<()> {
        let query = "UPDATE devices SET counter = $2 WHERE id = $1";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        sqlx::query(query)
            .bind(id)
            .bind(i64::from(counter))
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to update device counter")?;
        Ok(())
    }
}

/// In-memory device store for tests and local development.
#[derive(Default)]
pub struct MemoryDeviceStore {
    records: Mutex<Vec<DeviceRecord>>,
}

impl MemoryDeviceStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeviceStore for MemoryDeviceStore {
    async fn list(&self, user_id: Uuid) -> Result<Vec<DeviceRecord>> {
        let records = self.records.lock().await;
        Ok(records
            .iter()
            .filter(|record| record.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn insert(&self, record: DeviceRecord) -> Result<()> {
        self.records.lock().await.push(record);
        Ok(())
    }

    async fn update_counter(&self, id: Uuid, counter: u32) -> Result<()> {
        let mut records = self.records.lock().await;
        if let Some(record) = records.iter_mut().find(|record| record.id == id) {
            record.counter = counter;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn list_is_scoped_to_user() {
        let store = MemoryDeviceStore::new();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        store
            .insert(DeviceRecord::new(alice, "yubikey", serde_json::json!({})))
            .await
            .expect("insert");
        store
            .insert(DeviceRecord::new(bob, "solokey", serde_json::json!({})))
            .await
            .expect("insert");

        let devices = store.list(alice).await.expect("list");
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].label, "yubikey");
    }

    #[tokio::test]
    async fn counter_updates_by_id() {
        let store = MemoryDeviceStore::new();
        let alice = Uuid::new_v4();
        let record = DeviceRecord::new(alice, "yubikey", serde_json::json!({}));
        let id = record.id;
        store.insert(record).await.expect("insert");
        store.update_counter(id, 7).await.expect("update");

        let devices = store.list(alice).await.expect("list");
        assert_eq!(devices[0].counter, 7);
    }
}
