//! Outcome sum types for engine operations.
//!
//! Every orchestrator operation resolves to one of an enumerated set of
//! outcomes; only genuine store/audit failures travel the error channel.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::principal::Principal;
use crate::secondary::ChallengeDescriptor;
use crate::session::MintedSession;

/// Client-facing error payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ErrorData {
    pub error: String,
    pub message: String,
}

impl ErrorData {
    #[must_use]
    pub fn new(error: &str, message: &str) -> Self {
        Self {
            error: error.to_string(),
            message: message.to_string(),
        }
    }

    #[must_use]
    pub fn invalid_credentials() -> Self {
        Self::new("auth_invalid", "Username or password is incorrect")
    }

    #[must_use]
    pub fn secondary_expired() -> Self {
        Self::new(
            "secondary_expired",
            "Two-factor authentication has expired",
        )
    }

    #[must_use]
    pub fn secondary_invalid(message: &str) -> Self {
        Self::new("secondary_invalid", message)
    }

    #[must_use]
    pub fn unauthorized(message: &str) -> Self {
        Self::new("unauthorized", message)
    }
}

/// Result of a login-path operation.
#[derive(Debug)]
pub enum AuthOutcome {
    /// Authentication accepted and audited; the handler installs the cookie.
    /// `preserved_query` carries the caller's post-login query on the user
    /// surface where the federated flow captured one.
    SessionInstalled {
        principal: Principal,
        session: MintedSession,
        preserved_query: Option<String>,
    },
    /// A secondary factor is required; the descriptor launches the client flow.
    SecondaryRequired(ChallengeDescriptor),
    /// Federated login needs a provider factor; redirect to the 2FA screen.
    SecondaryPrompt { query: String },
    /// Multi-step provider is mid-flight; the challenge stays open.
    SecondaryIncomplete,
    /// Challenge token absent, expired, or scope-mismatched.
    SecondaryExpired,
    /// Authentication refused. `audited` distinguishes policy rejections
    /// (recorded) from credential failures (silent, anti-enumeration).
    Denied { data: ErrorData, audited: bool },
    /// Federated callback replay or tampering; benign redirect home.
    InvalidState,
}

/// Result of fetching a device challenge (sign request).
#[derive(Debug)]
pub enum ChallengeFetch {
    Challenge(serde_json::Value),
    Expired,
    Rejected(ErrorData),
}

/// Result of starting device registration.
#[derive(Debug)]
pub enum RegisterBegin {
    Started {
        token: String,
        request: serde_json::Value,
    },
    Rejected(ErrorData),
}

/// Result of finishing device registration. Never mints a session.
#[derive(Debug)]
pub enum RegisterFinish {
    Registered,
    Expired,
    Rejected { data: ErrorData, audited: bool },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_data_serializes_to_wire_shape() {
        let data = ErrorData::secondary_expired();
        let value = serde_json::to_value(&data).expect("serialize");
        assert_eq!(
            value.get("error").and_then(serde_json::Value::as_str),
            Some("secondary_expired")
        );
        assert_eq!(
            value.get("message").and_then(serde_json::Value::as_str),
            Some("Two-factor authentication has expired")
        );
    }

    #[test]
    fn error_data_round_trips() {
        let data = ErrorData::new("policy_reject", "Access denied by policy");
        let value = serde_json::to_value(&data).expect("serialize");
        let decoded: ErrorData = serde_json::from_value(value).expect("deserialize");
        assert_eq!(decoded, data);
    }
}
