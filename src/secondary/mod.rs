//! Secondary challenges: short-lived tokens for in-progress 2FA attempts.
//!
//! A challenge is bound to one `(user, scope)` pair at creation and walks a
//! strict state machine: `pending -> in-progress -> (complete | failed)`,
//! with expiry authoritative at every step. Transitions are enforced at the
//! store boundary so concurrent handlers can never observe an inconsistent
//! challenge: the compare-and-set has one winner, the loser sees not-found.

mod store;

pub use store::{MemorySecondaryStore, PgSecondaryStore, SecondaryStore};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// Provider reference used for hardware security key challenges.
pub const DEVICE_PROVIDER: &str = "device";

/// What the challenge authorizes on completion.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ChallengeScope {
    AdminLogin,
    UserLogin,
    /// Device enrollment; completion mutates the device set, never a session.
    Register,
}

impl ChallengeScope {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AdminLogin => "admin-login",
            Self::UserLogin => "user-login",
            Self::Register => "register",
        }
    }

    #[must_use]
    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "admin-login" => Some(Self::AdminLogin),
            "user-login" => Some(Self::UserLogin),
            "register" => Some(Self::Register),
            _ => None,
        }
    }
}

/// Lifecycle state of a challenge.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ChallengeState {
    Pending,
    InProgress,
    Complete,
    Failed,
}

impl ChallengeState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in-progress",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "in-progress" => Some(Self::InProgress),
            "complete" => Some(Self::Complete),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// The transient challenge entity.
#[derive(Clone, Debug)]
pub struct Challenge {
    pub token: String,
    pub user_id: Uuid,
    pub scope: ChallengeScope,
    pub provider_ref: String,
    pub state: ChallengeState,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Provider-specific verification state (e.g. a device challenge nonce).
    pub payload: Option<serde_json::Value>,
}

impl Challenge {
    #[must_use]
    pub fn is_device(&self) -> bool {
        self.provider_ref == DEVICE_PROVIDER
    }

    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// Metadata returned to the client to launch the secondary flow.
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct ChallengeDescriptor {
    pub token: String,
    pub provider: String,
    pub label: String,
    pub factors: Vec<String>,
    pub device: bool,
}

impl ChallengeDescriptor {
    /// Query string for the 2FA screen on federated redirects.
    #[must_use]
    pub fn prompt_query(&self) -> String {
        url::form_urlencoded::Serializer::new(String::new())
            .append_pair("secondary", &self.token)
            .append_pair("provider", &self.provider)
            .finish()
    }
}
