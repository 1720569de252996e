//! The authentication orchestrator.
//!
//! Stateless per request: every operation is a function over the injected
//! stores. Admin and user surfaces run the same code path; the role only
//! parameterizes challenge scope, audit kinds, and post-login routing.
//!
//! Ordering within one accepted request is fixed: the audit write commits,
//! then the session is minted, then the handler installs the cookie. A
//! failed audit write aborts acceptance.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use utoipa::ToSchema;

use super::config::AuthConfig;
use super::outcome::{
    AuthOutcome, ChallengeFetch, ErrorData, RegisterBegin, RegisterFinish,
};
use crate::audit::{AuditEvent, AuditSink, RequestInfo};
use crate::device::{
    ChallengeOutcome, DeviceStore, DeviceVerifier, RegisterVerdict, SignVerdict,
};
use crate::factor::{Factor, FactorRegistry, FactorVerdict};
use crate::federated::{CallbackOutcome, FederatedCoordinator, FederatedError};
use crate::principal::{CredentialStore, Credentials, Principal, Role};
use crate::secondary::{
    Challenge, ChallengeDescriptor, ChallengeScope, ChallengeState, DEVICE_PROVIDER,
    SecondaryStore,
};
use crate::session::SessionStore;

/// Provider entry in the discovery response.
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct ProviderDescriptor {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub label: String,
}

/// Discovery response listing configured entry paths.
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct StateDescriptor {
    pub providers: Vec<ProviderDescriptor>,
}

/// How a provider-factor requirement is delivered to the client.
enum SecondaryDelivery {
    /// JSON challenge descriptor (local login, device factor).
    Descriptor,
    /// Redirect to the 2FA screen (federated login).
    LoginRedirect { preserved: Option<String> },
}

impl SecondaryDelivery {
    fn preserved(self) -> Option<String> {
        match self {
            Self::Descriptor => None,
            Self::LoginRedirect { preserved } => preserved,
        }
    }
}

/// External collaborators the engine composes.
pub struct Collaborators {
    pub credentials: Arc<dyn CredentialStore>,
    pub validator: Arc<dyn crate::validator::Validator>,
    pub challenges: Arc<dyn SecondaryStore>,
    pub sessions: Arc<dyn SessionStore>,
    pub audit: Arc<dyn AuditSink>,
    pub devices: Arc<dyn DeviceStore>,
    pub device_verifier: Arc<dyn DeviceVerifier>,
    pub factors: FactorRegistry,
    pub federated: Arc<FederatedCoordinator>,
}

pub struct AuthEngine {
    config: AuthConfig,
    credentials: Arc<dyn CredentialStore>,
    validator: Arc<dyn crate::validator::Validator>,
    challenges: Arc<dyn SecondaryStore>,
    sessions: Arc<dyn SessionStore>,
    audit: Arc<dyn AuditSink>,
    devices: Arc<dyn DeviceStore>,
    device_verifier: Arc<dyn DeviceVerifier>,
    factors: FactorRegistry,
    federated: Arc<FederatedCoordinator>,
}

impl AuthEngine {
    #[must_use]
    pub fn new(config: AuthConfig, collaborators: Collaborators) -> Self {
        let Collaborators {
            credentials,
            validator,
            challenges,
            sessions,
            audit,
            devices,
            device_verifier,
            factors,
            federated,
        } = collaborators;
        Self {
            config,
            credentials,
            validator,
            challenges,
            sessions,
            audit,
            devices,
            device_verifier,
            factors,
            federated,
        }
    }

    #[must_use]
    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    #[must_use]
    pub fn device_verifier(&self) -> &dyn DeviceVerifier {
        self.device_verifier.as_ref()
    }

    /// List configured entry paths. Pure read; demo mode appends a synthetic
    /// provider.
    pub async fn discover_state(&self) -> StateDescriptor {
        let mut providers: Vec<ProviderDescriptor> = self
            .federated
            .providers()
            .await
            .iter()
            .map(|provider| ProviderDescriptor {
                id: provider.id.clone(),
                kind: provider.kind.clone(),
                label: provider.label.clone(),
            })
            .collect();

        if self.config.demo() {
            providers.push(ProviderDescriptor {
                id: "demo".to_string(),
                kind: "demo".to_string(),
                label: "demo".to_string(),
            });
        }

        StateDescriptor { providers }
    }

    /// Resolve a session token into a principal for the given surface.
    pub async fn authorize(&self, token: &str, role: Role) -> Result<Option<Principal>> {
        let Some(session) = self.sessions.get(token, role.session_scope()).await? else {
            return Ok(None);
        };
        self.credentials.lookup(session.user_id).await
    }

    /// Local password entry path.
    pub async fn begin_local(
        &self,
        creds: &Credentials,
        role: Role,
        request: &RequestInfo,
    ) -> Result<AuthOutcome> {
        // Invalid credentials are not audited: an audit trail keyed on
        // attempted usernames would confirm which accounts exist.
        let Some(principal) = self.credentials.verify(creds).await? else {
            return Ok(AuthOutcome::Denied {
                data: ErrorData::invalid_credentials(),
                audited: false,
            });
        };

        self.run_policy(principal, role, request, "local", SecondaryDelivery::Descriptor)
            .await
    }

    /// Complete an external-provider secondary challenge.
    pub async fn complete_secondary(
        &self,
        token: &str,
        factor: &str,
        passcode: &str,
        role: Role,
        request: &RequestInfo,
    ) -> Result<AuthOutcome> {
        let Some(challenge) = self.challenges.get(token, role.login_scope()).await? else {
            return Ok(AuthOutcome::SecondaryExpired);
        };
        if challenge.is_device() {
            return Ok(AuthOutcome::Denied {
                data: ErrorData::secondary_invalid("Challenge requires a device factor"),
                audited: false,
            });
        }
        let Some(factor) = Factor::from_str(factor) else {
            return Ok(AuthOutcome::Denied {
                data: ErrorData::secondary_invalid("Unknown factor"),
                audited: false,
            });
        };
        let provider = self
            .factors
            .get(&challenge.provider_ref)
            .with_context(|| {
                format!(
                    "secondary provider {} is not configured",
                    challenge.provider_ref
                )
            })?
            .clone();
        let Some(principal) = self.credentials.lookup(challenge.user_id).await? else {
            return Ok(AuthOutcome::SecondaryExpired);
        };

        if self
            .challenges
            .transition(
                token,
                &[ChallengeState::Pending, ChallengeState::InProgress],
                ChallengeState::InProgress,
            )
            .await?
            .is_none()
        {
            return Ok(AuthOutcome::SecondaryExpired);
        }

        match provider.verify(&principal, factor, passcode).await? {
            FactorVerdict::Incomplete => Ok(AuthOutcome::SecondaryIncomplete),
            // Denied leaves the challenge open so the user may retry until
            // it expires.
            FactorVerdict::Denied(data) => Ok(AuthOutcome::Denied {
                data,
                audited: false,
            }),
            FactorVerdict::Approved => {
                if self.challenges.consume(token).await?.is_none() {
                    return Ok(AuthOutcome::SecondaryExpired);
                }

                // Policy may have degraded since the first factor.
                let decision = self.validator.validate(&principal, role, request).await?;
                if let crate::validator::PolicyOutcome::Reject(data) = decision.outcome() {
                    let data = data.clone();
                    self.audit_login_failure(principal.id, role, request, &data)
                        .await?;
                    return Ok(AuthOutcome::Denied {
                        data,
                        audited: true,
                    });
                }

                self.accept(principal, role, "secondary", request, None).await
            }
        }
    }

    /// Start the federated entry path; returns the IdP redirect target.
    pub async fn begin_federated(
        &self,
        role: Role,
        preserved_query: Option<String>,
    ) -> Result<String> {
        self.federated.request(role, preserved_query).await
    }

    /// Finish the federated entry path from the IdP callback.
    pub async fn complete_federated(
        &self,
        sig: &str,
        canonical_query: &str,
        role: Role,
        request: &RequestInfo,
    ) -> Result<AuthOutcome> {
        let outcome = match self.federated.callback(sig, canonical_query).await {
            Ok(outcome) => outcome,
            Err(FederatedError::InvalidState) => return Ok(AuthOutcome::InvalidState),
            Err(FederatedError::Internal(err)) => return Err(err),
        };

        match outcome {
            CallbackOutcome::Rejected(data) => Ok(AuthOutcome::Denied {
                data,
                audited: false,
            }),
            CallbackOutcome::Verified {
                username,
                role: state_role,
                preserved_query,
            } => {
                // A state minted for one surface must not complete on the
                // other.
                if state_role != role {
                    return Ok(AuthOutcome::InvalidState);
                }
                let Some(principal) = self.credentials.lookup_username(&username).await? else {
                    return Ok(AuthOutcome::Denied {
                        data: ErrorData::unauthorized(
                            "Account is not authorized on this gateway",
                        ),
                        audited: false,
                    });
                };
                let preserved = match role {
                    Role::User => preserved_query,
                    Role::Admin => None,
                };
                self.run_policy(
                    principal,
                    role,
                    request,
                    "sso",
                    SecondaryDelivery::LoginRedirect { preserved },
                )
                .await
            }
        }
    }

    /// Fetch the device sign challenge for an open secondary challenge.
    pub async fn device_sign_request(&self, token: &str, role: Role) -> Result<ChallengeFetch> {
        let Some(challenge) = self.challenges.get(token, role.login_scope()).await? else {
            return Ok(ChallengeFetch::Expired);
        };
        if !challenge.is_device() {
            return Ok(ChallengeFetch::Rejected(ErrorData::secondary_invalid(
                "Challenge does not use a device factor",
            )));
        }
        let Some(principal) = self.credentials.lookup(challenge.user_id).await? else {
            return Ok(ChallengeFetch::Expired);
        };
        let devices = self.devices.list(principal.id).await?;

        match self.device_verifier.sign_request(&principal, &devices).await? {
            ChallengeOutcome::Rejected(data) => Ok(ChallengeFetch::Rejected(data)),
            ChallengeOutcome::Challenge(device_challenge) => {
                if self
                    .challenges
                    .transition(
                        token,
                        &[ChallengeState::Pending, ChallengeState::InProgress],
                        ChallengeState::InProgress,
                    )
                    .await?
                    .is_none()
                {
                    return Ok(ChallengeFetch::Expired);
                }
                self.challenges
                    .set_payload(token, device_challenge.state)
                    .await?;
                Ok(ChallengeFetch::Challenge(device_challenge.public))
            }
        }
    }

    /// Verify a device sign response and finish the login.
    ///
    /// Verification failure consumes the challenge and is surfaced before
    /// re-validation. A successful device factor does not bypass a provider
    /// factor the validator now requires.
    pub async fn device_sign_response(
        &self,
        token: &str,
        response: &Value,
        role: Role,
        request: &RequestInfo,
    ) -> Result<AuthOutcome> {
        let Some(challenge) = self.challenges.get(token, role.login_scope()).await? else {
            return Ok(AuthOutcome::SecondaryExpired);
        };
        let Some(state) = challenge.payload.clone() else {
            // No outstanding sign request for this challenge.
            return Ok(AuthOutcome::SecondaryExpired);
        };
        let Some(principal) = self.credentials.lookup(challenge.user_id).await? else {
            return Ok(AuthOutcome::SecondaryExpired);
        };
        let devices = self.devices.list(principal.id).await?;

        match self
            .device_verifier
            .sign_response(&state, response, &devices)
            .await?
        {
            SignVerdict::Rejected(data) => {
                self.challenges.fail(token).await?;
                Ok(AuthOutcome::Denied {
                    data,
                    audited: false,
                })
            }
            SignVerdict::Verified { device_id, counter } => {
                if self.challenges.consume(token).await?.is_none() {
                    return Ok(AuthOutcome::SecondaryExpired);
                }
                self.devices.update_counter(device_id, counter).await?;

                let decision = self.validator.validate(&principal, role, request).await?;
                if let crate::validator::PolicyOutcome::Reject(data) = decision.outcome() {
                    let data = data.clone();
                    self.audit_login_failure(principal.id, role, request, &data)
                        .await?;
                    return Ok(AuthOutcome::Denied {
                        data,
                        audited: true,
                    });
                }
                // The device factor is settled; only a provider requirement
                // can still stand between the user and a session.
                if let Some(id) = decision
                    .secondary_provider
                    .as_deref()
                    .filter(|id| !id.is_empty())
                {
                    let descriptor = self
                        .open_challenge(principal.id, role.login_scope(), id)
                        .await?;
                    return Ok(AuthOutcome::SecondaryRequired(descriptor));
                }
                self.accept(principal, role, "secondary", request, None).await
            }
        }
    }

    /// Open a device registration challenge for an authenticated user.
    pub async fn device_register_request(&self, principal: &Principal) -> Result<RegisterBegin> {
        let devices = self.devices.list(principal.id).await?;
        match self
            .device_verifier
            .register_request(principal, &devices)
            .await?
        {
            ChallengeOutcome::Rejected(data) => Ok(RegisterBegin::Rejected(data)),
            ChallengeOutcome::Challenge(device_challenge) => {
                let challenge = self
                    .challenges
                    .create(principal.id, ChallengeScope::Register, DEVICE_PROVIDER)
                    .await?;
                self.challenges
                    .set_payload(&challenge.token, device_challenge.state)
                    .await?;
                Ok(RegisterBegin::Started {
                    token: challenge.token,
                    request: device_challenge.public,
                })
            }
        }
    }

    /// Verify a device registration response and update the device set.
    /// Never mints a session.
    pub async fn device_register_response(
        &self,
        token: &str,
        response: &Value,
        principal: &Principal,
        request: &RequestInfo,
    ) -> Result<RegisterFinish> {
        let Some(challenge) = self
            .challenges
            .get(token, ChallengeScope::Register)
            .await?
        else {
            return Ok(RegisterFinish::Expired);
        };
        // The challenge is bound to the principal that opened it.
        if challenge.user_id != principal.id {
            return Ok(RegisterFinish::Expired);
        }
        let Some(state) = challenge.payload.clone() else {
            return Ok(RegisterFinish::Expired);
        };

        match self
            .device_verifier
            .register_response(&state, response, principal)
            .await?
        {
            RegisterVerdict::Rejected(data) => {
                self.challenges.fail(token).await?;
                self.audit
                    .write(
                        AuditEvent::new(
                            principal.id,
                            crate::audit::AuditKind::UserDeviceRegisterFailed,
                            request.clone(),
                        )
                        .with_field("error", &data.error)
                        .with_field("message", &data.message),
                    )
                    .await?;
                Ok(RegisterFinish::Rejected {
                    data,
                    audited: true,
                })
            }
            RegisterVerdict::Registered(record) => {
                if self.challenges.consume(token).await?.is_none() {
                    return Ok(RegisterFinish::Expired);
                }
                self.devices.insert(record).await?;
                self.audit
                    .write(
                        AuditEvent::new(
                            principal.id,
                            crate::audit::AuditKind::UserDeviceRegister,
                            request.clone(),
                        )
                        .with_field("method", "secondary"),
                    )
                    .await?;
                Ok(RegisterFinish::Registered)
            }
        }
    }

    /// Revoke the presented session, if any.
    pub async fn logout(&self, token: Option<&str>) -> Result<()> {
        if let Some(token) = token {
            self.sessions.revoke_token(token).await?;
        }
        Ok(())
    }

    /// Revoke every session for the user, then the presented one. Each
    /// revocation is durable on its own, so a partial failure never
    /// resurrects already-revoked sessions; the call is idempotent.
    pub async fn logout_all(&self, principal: &Principal, token: Option<&str>) -> Result<()> {
        let sessions = self.sessions.list_for_user(principal.id).await?;
        for session in sessions {
            self.sessions.revoke(session.id).await?;
        }
        self.logout(token).await
    }

    async fn run_policy(
        &self,
        principal: Principal,
        role: Role,
        request: &RequestInfo,
        method: &str,
        delivery: SecondaryDelivery,
    ) -> Result<AuthOutcome> {
        let decision = self.validator.validate(&principal, role, request).await?;
        match decision.outcome() {
            crate::validator::PolicyOutcome::Reject(data) => {
                let data = data.clone();
                self.audit_login_failure(principal.id, role, request, &data)
                    .await?;
                Ok(AuthOutcome::Denied {
                    data,
                    audited: true,
                })
            }
            crate::validator::PolicyOutcome::Device => {
                let descriptor = self
                    .open_challenge(principal.id, role.login_scope(), DEVICE_PROVIDER)
                    .await?;
                Ok(AuthOutcome::SecondaryRequired(descriptor))
            }
            crate::validator::PolicyOutcome::Provider(id) => {
                let descriptor = self
                    .open_challenge(principal.id, role.login_scope(), id)
                    .await?;
                match delivery {
                    SecondaryDelivery::Descriptor => {
                        Ok(AuthOutcome::SecondaryRequired(descriptor))
                    }
                    SecondaryDelivery::LoginRedirect { preserved } => {
                        let mut query = descriptor.prompt_query();
                        if let Some(preserved) = preserved
                            && !preserved.is_empty()
                        {
                            query.push('&');
                            query.push_str(&preserved);
                        }
                        Ok(AuthOutcome::SecondaryPrompt { query })
                    }
                }
            }
            crate::validator::PolicyOutcome::Accept => {
                self.accept(principal, role, method, request, delivery.preserved())
                    .await
            }
        }
    }

    async fn open_challenge(
        &self,
        user_id: uuid::Uuid,
        scope: ChallengeScope,
        provider_ref: &str,
    ) -> Result<ChallengeDescriptor> {
        let challenge = self.challenges.create(user_id, scope, provider_ref).await?;
        Ok(self.describe(&challenge))
    }

    fn describe(&self, challenge: &Challenge) -> ChallengeDescriptor {
        if challenge.is_device() {
            return ChallengeDescriptor {
                token: challenge.token.clone(),
                provider: DEVICE_PROVIDER.to_string(),
                label: "Security key".to_string(),
                factors: Vec::new(),
                device: true,
            };
        }
        let provider = self.factors.get(&challenge.provider_ref);
        ChallengeDescriptor {
            token: challenge.token.clone(),
            provider: challenge.provider_ref.clone(),
            label: provider
                .map(|provider| provider.label().to_string())
                .unwrap_or_else(|| challenge.provider_ref.clone()),
            factors: provider
                .map(|provider| {
                    provider
                        .factors()
                        .iter()
                        .map(|factor| factor.as_str().to_string())
                        .collect()
                })
                .unwrap_or_default(),
            device: false,
        }
    }

    async fn accept(
        &self,
        principal: Principal,
        role: Role,
        method: &str,
        request: &RequestInfo,
        preserved_query: Option<String>,
    ) -> Result<AuthOutcome> {
        // The audit record commits before the session exists; an attempt the
        // log cannot hold never becomes a session.
        self.audit
            .write(
                AuditEvent::new(principal.id, role.login_kind(), request.clone())
                    .with_field("method", method),
            )
            .await?;
        let session = self
            .sessions
            .create(principal.id, role.session_scope())
            .await?;
        Ok(AuthOutcome::SessionInstalled {
            principal,
            session,
            preserved_query,
        })
    }

    async fn audit_login_failure(
        &self,
        user_id: uuid::Uuid,
        role: Role,
        request: &RequestInfo,
        data: &ErrorData,
    ) -> Result<()> {
        self.audit
            .write(
                AuditEvent::new(user_id, role.login_failed_kind(), request.clone())
                    .with_field("error", &data.error)
                    .with_field("message", &data.message),
            )
            .await
    }
}
