//! Hardware-token challenge/response verification.
//!
//! The `DeviceVerifier` trait is the boundary the engine depends on; the
//! protocol cryptography lives entirely inside the implementation. Challenge
//! and response payloads are opaque JSON: the `public` half goes to the
//! client, the `state` half rides along in the secondary challenge payload.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{Value, json};
use url::Url;
use uuid::Uuid;
use webauthn_rs::prelude::*;

use super::DeviceRecord;
use crate::auth::outcome::ErrorData;
use crate::principal::Principal;

/// One half-open challenge: payload for the client, state for the server.
#[derive(Debug)]
pub struct DeviceChallenge {
    pub public: Value,
    pub state: Value,
}

/// Result of generating a challenge.
#[derive(Debug)]
pub enum ChallengeOutcome {
    Challenge(DeviceChallenge),
    Rejected(ErrorData),
}

/// Result of verifying a sign response.
#[derive(Debug)]
pub enum SignVerdict {
    Verified { device_id: Uuid, counter: u32 },
    Rejected(ErrorData),
}

/// Result of verifying a register response.
#[derive(Debug)]
pub enum RegisterVerdict {
    Registered(DeviceRecord),
    Rejected(ErrorData),
}

/// External verifier interface for hardware security keys.
///
/// Implementations must treat the `state` value as their own serialized
/// protocol state from a prior `*_request` call; client-supplied `response`
/// values are untrusted and malformed input is a rejection, not an error.
#[async_trait]
pub trait DeviceVerifier: Send + Sync {
    async fn sign_request(
        &self,
        principal: &Principal,
        devices: &[DeviceRecord],
    ) -> Result<ChallengeOutcome>;

    async fn sign_response(
        &self,
        state: &Value,
        response: &Value,
        devices: &[DeviceRecord],
    ) -> Result<SignVerdict>;

    async fn register_request(
        &self,
        principal: &Principal,
        devices: &[DeviceRecord],
    ) -> Result<ChallengeOutcome>;

    async fn register_response(
        &self,
        state: &Value,
        response: &Value,
        principal: &Principal,
    ) -> Result<RegisterVerdict>;

    /// Application facet descriptor served to clients.
    fn facets(&self) -> Value;
}

/// WebAuthn security-key verifier.
pub struct SecurityKeyVerifier {
    webauthn: Webauthn,
    origin: String,
}

impl SecurityKeyVerifier {
    /// Build a verifier for the given relying party.
    ///
    /// # Errors
    /// Returns an error if the origin is not a valid URL or the relying
    /// party configuration is rejected.
    pub fn new(rp_id: &str, rp_origin: &str, rp_name: &str) -> Result<Self> {
        let origin_url = Url::parse(rp_origin).context("invalid relying party origin")?;
        let webauthn = WebauthnBuilder::new(rp_id, &origin_url)
            .context("failed to configure webauthn")?
            .rp_name(rp_name)
            .build()
            .context("failed to build webauthn verifier")?;
        Ok(Self {
            webauthn,
            origin: rp_origin.trim_end_matches('/').to_string(),
        })
    }

    fn security_keys(devices: &[DeviceRecord]) -> Vec<(Uuid, SecurityKey)> {
        // Records that fail to parse are skipped; a corrupt credential should
        // not lock the user out of their remaining keys.
        devices
            .iter()
            .filter_map(|record| {
                serde_json::from_value::<SecurityKey>(record.credential.clone())
                    .ok()
                    .map(|key| (record.id, key))
            })
            .collect()
    }
}

#[async_trait]
impl DeviceVerifier for SecurityKeyVerifier {
    async fn sign_request(
        &self,
        _principal: &Principal,
        devices: &[DeviceRecord],
    ) -> Result<ChallengeOutcome> {
        let keys: Vec<SecurityKey> = Self::security_keys(devices)
            .into_iter()
            .map(|(_, key)| key)
            .collect();
        if keys.is_empty() {
            return Ok(ChallengeOutcome::Rejected(ErrorData::secondary_invalid(
                "No registered devices for this account",
            )));
        }

        let (challenge, state) = self
            .webauthn
            .start_securitykey_authentication(&keys)
            .context("failed to start device authentication")?;

        Ok(ChallengeOutcome::Challenge(DeviceChallenge {
            public: serde_json::to_value(&challenge)
                .context("failed to serialize device challenge")?,
            state: serde_json::to_value(&state)
                .context("failed to serialize device authentication state")?,
        }))
    }

    async fn sign_response(
        &self,
        state: &Value,
        response: &Value,
        devices: &[DeviceRecord],
    ) -> Result<SignVerdict> {
        let state: SecurityKeyAuthentication = serde_json::from_value(state.clone())
            .context("corrupt device authentication state")?;
        let Ok(credential) = serde_json::from_value::<PublicKeyCredential>(response.clone()) else {
            return Ok(SignVerdict::Rejected(ErrorData::secondary_invalid(
                "Malformed device response",
            )));
        };

        match self
            .webauthn
            .finish_securitykey_authentication(&credential, &state)
        {
            Ok(result) => {
                let device_id = Self::security_keys(devices)
                    .into_iter()
                    .find(|(_, key)| key.cred_id() == result.cred_id())
                    .map(|(id, _)| id);
                match device_id {
                    Some(device_id) => Ok(SignVerdict::Verified {
                        device_id,
                        counter: result.counter(),
                    }),
                    None => Ok(SignVerdict::Rejected(ErrorData::secondary_invalid(
                        "Device is not registered for this account",
                    ))),
                }
            }
            Err(_) => Ok(SignVerdict::Rejected(ErrorData::secondary_invalid(
                "Device authentication failed",
            ))),
        }
    }

    async fn register_request(
        &self,
        principal: &Principal,
        devices: &[DeviceRecord],
    ) -> Result<ChallengeOutcome> {
        let exclude: Vec<CredentialID> = Self::security_keys(devices)
            .into_iter()
            .map(|(_, key)| key.cred_id().clone())
            .collect();

        let (challenge, state) = self
            .webauthn
            .start_securitykey_registration(
                principal.id,
                &principal.username,
                &principal.username,
                Some(exclude),
                None,
                None,
            )
            .context("failed to start device registration")?;

        Ok(ChallengeOutcome::Challenge(DeviceChallenge {
            public: serde_json::to_value(&challenge)
                .context("failed to serialize registration challenge")?,
            state: serde_json::to_value(&state)
                .context("failed to serialize registration state")?,
        }))
    }

    async fn register_response(
        &self,
        state: &Value,
        response: &Value,
        principal: &Principal,
    ) -> Result<RegisterVerdict> {
        let state: SecurityKeyRegistration =
            serde_json::from_value(state.clone()).context("corrupt device registration state")?;
        let Ok(credential) =
            serde_json::from_value::<RegisterPublicKeyCredential>(response.clone())
        else {
            return Ok(RegisterVerdict::Rejected(ErrorData::secondary_invalid(
                "Malformed device response",
            )));
        };

        match self
            .webauthn
            .finish_securitykey_registration(&credential, &state)
        {
            Ok(key) => {
                let credential = serde_json::to_value(&key)
                    .context("failed to serialize device credential")?;
                Ok(RegisterVerdict::Registered(DeviceRecord::new(
                    principal.id,
                    "Security key",
                    credential,
                )))
            }
            Err(_) => Ok(RegisterVerdict::Rejected(ErrorData::secondary_invalid(
                "Device registration failed",
            ))),
        }
    }

    fn facets(&self) -> Value {
        json!({
            "trustedFacets": [{
                "version": { "major": 1, "minor": 0 },
                "ids": [self.origin],
            }]
        })
    }
}
