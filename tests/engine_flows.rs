//! End-to-end engine flows over in-memory stores.

use anyhow::Result;
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use serde_json::{Value, json};
use sha2::Sha256;
use std::sync::Arc;
use tokio::sync::Mutex;

use zerogate::audit::{AuditEvent, AuditKind, AuditSink, MemoryAuditSink, RequestInfo};
use zerogate::auth::outcome::{AuthOutcome, ChallengeFetch, ErrorData, RegisterBegin, RegisterFinish};
use zerogate::auth::{AuthConfig, AuthEngine, Collaborators};
use zerogate::device::{
    ChallengeOutcome, DeviceChallenge, DeviceRecord, DeviceStore, DeviceVerifier,
    MemoryDeviceStore, RegisterVerdict, SignVerdict,
};
use zerogate::factor::{
    Factor, FactorProvider, FactorRegistry, FactorVerdict, MemoryTotpSecrets, TotpProvider,
    TotpSecretStore,
};
use zerogate::federated::{FederatedCoordinator, SsoProvider};
use zerogate::principal::{Credentials, MemoryCredentialStore, Principal, Role};
use zerogate::secondary::{MemorySecondaryStore, SecondaryStore};
use zerogate::session::{MemorySessionStore, SessionStore};
use zerogate::validator::{PolicyDecision, PolicyValidator, RolePolicy, Validator};

const STATE_KEY: &[u8] = b"integration-state-key";

/// Validator whose decision tests can swap mid-flow.
struct StaticValidator {
    decision: Mutex<PolicyDecision>,
}

impl StaticValidator {
    fn new(decision: PolicyDecision) -> Arc<Self> {
        Arc::new(Self {
            decision: Mutex::new(decision),
        })
    }

    async fn set(&self, decision: PolicyDecision) {
        *self.decision.lock().await = decision;
    }
}

#[async_trait]
impl Validator for StaticValidator {
    async fn validate(
        &self,
        _principal: &Principal,
        _role: Role,
        _request: &RequestInfo,
    ) -> Result<PolicyDecision> {
        Ok(self.decision.lock().await.clone())
    }
}

/// Deterministic device verifier: `{"ok": true}` responses pass.
struct FakeDeviceVerifier;

#[async_trait]
impl DeviceVerifier for FakeDeviceVerifier {
    async fn sign_request(
        &self,
        _principal: &Principal,
        devices: &[DeviceRecord],
    ) -> Result<ChallengeOutcome> {
        if devices.is_empty() {
            return Ok(ChallengeOutcome::Rejected(ErrorData::secondary_invalid(
                "No registered devices for this account",
            )));
        }
        Ok(ChallengeOutcome::Challenge(DeviceChallenge {
            public: json!({"challenge": "sign-nonce"}),
            state: json!({"nonce": "sign-state"}),
        }))
    }

    async fn sign_response(
        &self,
        state: &Value,
        response: &Value,
        devices: &[DeviceRecord],
    ) -> Result<SignVerdict> {
        assert_eq!(state, &json!({"nonce": "sign-state"}));
        let approved = response.get("ok").and_then(Value::as_bool).unwrap_or(false);
        match devices.first() {
            Some(device) if approved => Ok(SignVerdict::Verified {
                device_id: device.id,
                counter: device.counter + 1,
            }),
            _ => Ok(SignVerdict::Rejected(ErrorData::secondary_invalid(
                "Device authentication failed",
            ))),
        }
    }

    async fn register_request(
        &self,
        _principal: &Principal,
        _devices: &[DeviceRecord],
    ) -> Result<ChallengeOutcome> {
        Ok(ChallengeOutcome::Challenge(DeviceChallenge {
            public: json!({"challenge": "register-nonce"}),
            state: json!({"nonce": "register-state"}),
        }))
    }

    async fn register_response(
        &self,
        state: &Value,
        response: &Value,
        principal: &Principal,
    ) -> Result<RegisterVerdict> {
        assert_eq!(state, &json!({"nonce": "register-state"}));
        let approved = response.get("ok").and_then(Value::as_bool).unwrap_or(false);
        if approved {
            Ok(RegisterVerdict::Registered(DeviceRecord::new(
                principal.id,
                "test key",
                json!({"cred": "fake"}),
            )))
        } else {
            Ok(RegisterVerdict::Rejected(ErrorData::secondary_invalid(
                "Device registration failed",
            )))
        }
    }

    fn facets(&self) -> Value {
        json!({"trustedFacets": []})
    }
}

/// Push-style provider: the push factor never completes in one step.
struct PushProvider;

#[async_trait]
impl FactorProvider for PushProvider {
    fn id(&self) -> &str {
        "push-1"
    }

    fn label(&self) -> &str {
        "Push approval"
    }

    fn factors(&self) -> &[Factor] {
        &[Factor::Push, Factor::Passcode]
    }

    async fn verify(
        &self,
        _principal: &Principal,
        factor: Factor,
        passcode: &str,
    ) -> Result<FactorVerdict> {
        match factor {
            Factor::Push => Ok(FactorVerdict::Incomplete),
            Factor::Passcode if passcode == "approved" => Ok(FactorVerdict::Approved),
            _ => Ok(FactorVerdict::Denied(ErrorData::secondary_invalid(
                "Invalid passcode",
            ))),
        }
    }
}

/// Sink that refuses every write.
struct FailingAuditSink;

#[async_trait]
impl AuditSink for FailingAuditSink {
    async fn write(&self, _event: AuditEvent) -> Result<()> {
        anyhow::bail!("audit backend unavailable")
    }
}

struct Harness {
    engine: AuthEngine,
    audit: Arc<MemoryAuditSink>,
    credentials: Arc<MemoryCredentialStore>,
    devices: Arc<MemoryDeviceStore>,
    secrets: Arc<MemoryTotpSecrets>,
    sessions: Arc<MemorySessionStore>,
    challenges: Arc<MemorySecondaryStore>,
    federated: Arc<FederatedCoordinator>,
    validator: Arc<StaticValidator>,
}

struct HarnessOptions {
    secondary_ttl_seconds: i64,
    demo: bool,
    audit: Option<Arc<dyn AuditSink>>,
    validator: Option<Arc<dyn Validator>>,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            secondary_ttl_seconds: 60,
            demo: false,
            audit: None,
            validator: None,
        }
    }
}

fn providers() -> Vec<SsoProvider> {
    vec![SsoProvider {
        id: "corp-idp".to_string(),
        kind: "saml".to_string(),
        label: "Corp IdP".to_string(),
        authorize_url: "https://idp.example.com/authorize".to_string(),
    }]
}

fn harness_with(options: HarnessOptions) -> Harness {
    let audit = Arc::new(MemoryAuditSink::new());
    let credentials = Arc::new(MemoryCredentialStore::new());
    let devices = Arc::new(MemoryDeviceStore::new());
    let secrets = Arc::new(MemoryTotpSecrets::new());
    let sessions = Arc::new(MemorySessionStore::new(3600));
    let challenges = Arc::new(MemorySecondaryStore::new(options.secondary_ttl_seconds));
    let federated = Arc::new(FederatedCoordinator::new(
        STATE_KEY.to_vec(),
        providers(),
        300,
    ));
    let validator = StaticValidator::new(PolicyDecision::accept());

    let totp_secrets: Arc<dyn TotpSecretStore> = secrets.clone();
    let factors = FactorRegistry::new(vec![
        Arc::new(TotpProvider::new(
            "totp-1",
            "Authenticator",
            "zerogate",
            totp_secrets,
        )),
        Arc::new(PushProvider),
    ]);

    let config = AuthConfig::new("https://gate.example.com".to_string())
        .with_demo(options.demo)
        .with_secondary_ttl_seconds(options.secondary_ttl_seconds);

    let default_validator: Arc<dyn Validator> = validator.clone();
    let default_audit: Arc<dyn AuditSink> = audit.clone();
    let engine = AuthEngine::new(
        config,
        Collaborators {
            credentials: credentials.clone(),
            validator: options.validator.unwrap_or(default_validator),
            challenges: challenges.clone(),
            sessions: sessions.clone(),
            audit: options.audit.unwrap_or(default_audit),
            devices: devices.clone(),
            device_verifier: Arc::new(FakeDeviceVerifier),
            factors,
            federated: federated.clone(),
        },
    );

    Harness {
        engine,
        audit,
        credentials,
        devices,
        secrets,
        sessions,
        challenges,
        federated,
        validator,
    }
}

fn harness() -> Harness {
    harness_with(HarnessOptions::default())
}

fn request() -> RequestInfo {
    RequestInfo::new("POST", "/auth/session").with_remote_ip(Some("10.0.0.1".to_string()))
}

fn creds(username: &str, password: &str) -> Credentials {
    Credentials {
        username: username.to_string(),
        password: password.to_string(),
    }
}

fn sign_callback(canonical: &str) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(STATE_KEY).expect("mac");
    mac.update(canonical.as_bytes());
    URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
}

fn callback_for(redirect: &str, username: &str) -> (String, String) {
    let query = redirect.split_once('?').expect("query").1;
    let state = url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == "state")
        .map(|(_, value)| value.into_owned())
        .expect("state");
    let canonical = url::form_urlencoded::Serializer::new(String::new())
        .append_pair("username", username)
        .append_pair("state", &state)
        .finish();
    let sig = sign_callback(&canonical);
    (sig, canonical)
}

fn totp_code(secret: &[u8], username: &str) -> String {
    let totp = totp_rs::TOTP::new(
        totp_rs::Algorithm::SHA1,
        6,
        1,
        30,
        secret.to_vec(),
        Some("zerogate".to_string()),
        username.to_string(),
    )
    .expect("totp");
    totp.generate_current().expect("code")
}

// --- local path -----------------------------------------------------------

#[tokio::test]
async fn local_single_factor_login_audits_then_mints() -> Result<()> {
    let harness = harness();
    let alice = harness.credentials.add_user("alice", "pw").await?;

    let outcome = harness
        .engine
        .begin_local(&creds("alice", "pw"), Role::Admin, &request())
        .await?;

    let AuthOutcome::SessionInstalled {
        principal, session, ..
    } = outcome
    else {
        panic!("expected session, got {outcome:?}");
    };
    assert_eq!(principal.id, alice.id);
    assert_eq!(session.record.user_id, alice.id);

    let events = harness.audit.snapshot().await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, AuditKind::AdminLogin);
    assert_eq!(events[0].user_id, alice.id);
    assert_eq!(
        events[0].fields.get("method").map(String::as_str),
        Some("local")
    );

    // The minted token resolves on the right surface only.
    assert!(
        harness
            .engine
            .authorize(&session.token, Role::Admin)
            .await?
            .is_some()
    );
    assert!(
        harness
            .engine
            .authorize(&session.token, Role::User)
            .await?
            .is_none()
    );
    Ok(())
}

#[tokio::test]
async fn invalid_credentials_emit_no_audit_event() -> Result<()> {
    let harness = harness();
    harness.credentials.add_user("alice", "pw").await?;

    for attempt in [creds("alice", "wrong"), creds("nobody", "pw")] {
        let outcome = harness
            .engine
            .begin_local(&attempt, Role::Admin, &request())
            .await?;
        let AuthOutcome::Denied { data, audited } = outcome else {
            panic!("expected denial, got {outcome:?}");
        };
        assert_eq!(data.error, "auth_invalid");
        assert!(!audited);
    }

    assert!(harness.audit.snapshot().await.is_empty());
    Ok(())
}

#[tokio::test]
async fn policy_reject_is_audited_as_login_failed() -> Result<()> {
    let harness = harness();
    let alice = harness.credentials.add_user("alice", "pw").await?;
    harness
        .validator
        .set(PolicyDecision::reject(ErrorData::new(
            "policy_reject",
            "Access denied by policy",
        )))
        .await;

    let outcome = harness
        .engine
        .begin_local(&creds("alice", "pw"), Role::User, &request())
        .await?;
    let AuthOutcome::Denied { data, audited } = outcome else {
        panic!("expected denial, got {outcome:?}");
    };
    assert!(audited);
    assert_eq!(data.error, "policy_reject");

    let events = harness.audit.snapshot().await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, AuditKind::UserLoginFailed);
    assert_eq!(events[0].user_id, alice.id);
    assert_eq!(
        events[0].fields.get("error").map(String::as_str),
        Some("policy_reject")
    );
    assert!(harness.sessions.list_for_user(alice.id).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn audit_failure_blocks_acceptance() -> Result<()> {
    let harness = harness_with(HarnessOptions {
        audit: Some(Arc::new(FailingAuditSink)),
        ..HarnessOptions::default()
    });
    let alice = harness.credentials.add_user("alice", "pw").await?;

    let result = harness
        .engine
        .begin_local(&creds("alice", "pw"), Role::Admin, &request())
        .await;
    assert!(result.is_err());
    assert!(harness.sessions.list_for_user(alice.id).await?.is_empty());
    Ok(())
}

// --- provider secondary ---------------------------------------------------

#[tokio::test]
async fn totp_secondary_retries_then_installs_session() -> Result<()> {
    let harness = harness();
    let alice = harness.credentials.add_user("alice", "pw").await?;
    let secret = b"integrationtestsecret".to_vec();
    harness.secrets.enroll(alice.id, secret.clone()).await;
    harness.validator.set(PolicyDecision::provider("totp-1")).await;

    let outcome = harness
        .engine
        .begin_local(&creds("alice", "pw"), Role::User, &request())
        .await?;
    let AuthOutcome::SecondaryRequired(descriptor) = outcome else {
        panic!("expected challenge, got {outcome:?}");
    };
    assert_eq!(descriptor.provider, "totp-1");
    assert!(!descriptor.device);
    assert_eq!(descriptor.factors, vec!["passcode".to_string()]);
    assert!(harness.audit.snapshot().await.is_empty());

    // Wrong passcode: 401 and the challenge survives for a retry.
    let wrong = harness
        .engine
        .complete_secondary(&descriptor.token, "passcode", "000000", Role::User, &request())
        .await?;
    let AuthOutcome::Denied { data, audited } = wrong else {
        panic!("expected denial, got {wrong:?}");
    };
    assert_eq!(data.error, "secondary_invalid");
    assert!(!audited);

    harness.validator.set(PolicyDecision::accept()).await;
    let code = totp_code(&secret, "alice");
    let outcome = harness
        .engine
        .complete_secondary(&descriptor.token, "passcode", &code, Role::User, &request())
        .await?;
    let AuthOutcome::SessionInstalled { session, .. } = outcome else {
        panic!("expected session, got {outcome:?}");
    };
    assert_eq!(session.record.user_id, alice.id);

    let events = harness.audit.snapshot().await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, AuditKind::UserLogin);
    assert_eq!(
        events[0].fields.get("method").map(String::as_str),
        Some("secondary")
    );

    // The challenge is gone: any follow-up reads as expired.
    let replay = harness
        .engine
        .complete_secondary(&descriptor.token, "passcode", &code, Role::User, &request())
        .await?;
    assert!(matches!(replay, AuthOutcome::SecondaryExpired));
    Ok(())
}

#[tokio::test]
async fn unknown_or_expired_token_reads_as_expired() -> Result<()> {
    let harness = harness();
    let outcome = harness
        .engine
        .complete_secondary("expired", "passcode", "123456", Role::Admin, &request())
        .await?;
    assert!(matches!(outcome, AuthOutcome::SecondaryExpired));

    // A real challenge that has outlived its TTL behaves identically.
    let expired = harness_with(HarnessOptions {
        secondary_ttl_seconds: -1,
        ..HarnessOptions::default()
    });
    expired.credentials.add_user("alice", "pw").await?;
    expired.validator.set(PolicyDecision::provider("totp-1")).await;
    let outcome = expired
        .engine
        .begin_local(&creds("alice", "pw"), Role::User, &request())
        .await?;
    let AuthOutcome::SecondaryRequired(descriptor) = outcome else {
        panic!("expected challenge, got {outcome:?}");
    };
    let outcome = expired
        .engine
        .complete_secondary(&descriptor.token, "passcode", "123456", Role::User, &request())
        .await?;
    assert!(matches!(outcome, AuthOutcome::SecondaryExpired));
    Ok(())
}

#[tokio::test]
async fn challenge_scope_is_enforced_across_surfaces() -> Result<()> {
    let harness = harness();
    harness.credentials.add_user("alice", "pw").await?;
    harness.validator.set(PolicyDecision::provider("totp-1")).await;

    let outcome = harness
        .engine
        .begin_local(&creds("alice", "pw"), Role::Admin, &request())
        .await?;
    let AuthOutcome::SecondaryRequired(descriptor) = outcome else {
        panic!("expected challenge, got {outcome:?}");
    };

    // An admin-login challenge presented on the user surface is not-found.
    let outcome = harness
        .engine
        .complete_secondary(&descriptor.token, "passcode", "123456", Role::User, &request())
        .await?;
    assert!(matches!(outcome, AuthOutcome::SecondaryExpired));
    Ok(())
}

#[tokio::test]
async fn push_factor_stays_incomplete_until_approved() -> Result<()> {
    let harness = harness();
    harness.credentials.add_user("alice", "pw").await?;
    harness.validator.set(PolicyDecision::provider("push-1")).await;

    let outcome = harness
        .engine
        .begin_local(&creds("alice", "pw"), Role::User, &request())
        .await?;
    let AuthOutcome::SecondaryRequired(descriptor) = outcome else {
        panic!("expected challenge, got {outcome:?}");
    };

    let pending = harness
        .engine
        .complete_secondary(&descriptor.token, "push", "", Role::User, &request())
        .await?;
    assert!(matches!(pending, AuthOutcome::SecondaryIncomplete));

    // Incomplete preserved the challenge; the passcode path can finish it.
    harness.validator.set(PolicyDecision::accept()).await;
    let outcome = harness
        .engine
        .complete_secondary(&descriptor.token, "passcode", "approved", Role::User, &request())
        .await?;
    assert!(matches!(outcome, AuthOutcome::SessionInstalled { .. }));
    Ok(())
}

#[tokio::test]
async fn degraded_policy_after_factor_is_audited_reject() -> Result<()> {
    let harness = harness();
    let alice = harness.credentials.add_user("alice", "pw").await?;
    harness.validator.set(PolicyDecision::provider("push-1")).await;

    let outcome = harness
        .engine
        .begin_local(&creds("alice", "pw"), Role::Admin, &request())
        .await?;
    let AuthOutcome::SecondaryRequired(descriptor) = outcome else {
        panic!("expected challenge, got {outcome:?}");
    };

    // Policy degrades while the factor is in flight.
    harness
        .validator
        .set(PolicyDecision::reject(ErrorData::new(
            "policy_reject",
            "Access revoked",
        )))
        .await;

    let outcome = harness
        .engine
        .complete_secondary(&descriptor.token, "passcode", "approved", Role::Admin, &request())
        .await?;
    let AuthOutcome::Denied { audited, .. } = outcome else {
        panic!("expected denial, got {outcome:?}");
    };
    assert!(audited);

    let events = harness.audit.snapshot().await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, AuditKind::AdminLoginFailed);
    assert!(harness.sessions.list_for_user(alice.id).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn device_challenge_rejects_the_passcode_path() -> Result<()> {
    let harness = harness();
    let alice = harness.credentials.add_user("alice", "pw").await?;
    harness
        .devices
        .insert(DeviceRecord::new(alice.id, "key", json!({})))
        .await?;
    harness.validator.set(PolicyDecision::device()).await;

    let outcome = harness
        .engine
        .begin_local(&creds("alice", "pw"), Role::Admin, &request())
        .await?;
    let AuthOutcome::SecondaryRequired(descriptor) = outcome else {
        panic!("expected challenge, got {outcome:?}");
    };
    assert!(descriptor.device);

    let outcome = harness
        .engine
        .complete_secondary(&descriptor.token, "passcode", "123456", Role::Admin, &request())
        .await?;
    let AuthOutcome::Denied { data, .. } = outcome else {
        panic!("expected denial, got {outcome:?}");
    };
    assert_eq!(data.error, "secondary_invalid");
    Ok(())
}

// --- device sign ----------------------------------------------------------

#[tokio::test]
async fn device_sign_flow_installs_session() -> Result<()> {
    let harness = harness();
    let alice = harness.credentials.add_user("alice", "pw").await?;
    harness
        .devices
        .insert(DeviceRecord::new(alice.id, "key", json!({})))
        .await?;
    harness.validator.set(PolicyDecision::device()).await;

    let outcome = harness
        .engine
        .begin_local(&creds("alice", "pw"), Role::Admin, &request())
        .await?;
    let AuthOutcome::SecondaryRequired(descriptor) = outcome else {
        panic!("expected challenge, got {outcome:?}");
    };

    let fetch = harness
        .engine
        .device_sign_request(&descriptor.token, Role::Admin)
        .await?;
    let ChallengeFetch::Challenge(challenge) = fetch else {
        panic!("expected sign challenge, got {fetch:?}");
    };
    assert_eq!(challenge, json!({"challenge": "sign-nonce"}));

    let outcome = harness
        .engine
        .device_sign_response(&descriptor.token, &json!({"ok": true}), Role::Admin, &request())
        .await?;
    let AuthOutcome::SessionInstalled { session, .. } = outcome else {
        panic!("expected session, got {outcome:?}");
    };
    assert_eq!(session.record.user_id, alice.id);

    let events = harness.audit.snapshot().await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, AuditKind::AdminLogin);
    assert_eq!(
        events[0].fields.get("method").map(String::as_str),
        Some("secondary")
    );

    // Sign counter advanced on the stored device.
    let devices = harness.devices.list(alice.id).await?;
    assert_eq!(devices[0].counter, 1);
    Ok(())
}

#[tokio::test]
async fn device_sign_failure_fails_closed() -> Result<()> {
    let harness = harness();
    let alice = harness.credentials.add_user("alice", "pw").await?;
    harness
        .devices
        .insert(DeviceRecord::new(alice.id, "key", json!({})))
        .await?;
    harness.validator.set(PolicyDecision::device()).await;

    let outcome = harness
        .engine
        .begin_local(&creds("alice", "pw"), Role::Admin, &request())
        .await?;
    let AuthOutcome::SecondaryRequired(descriptor) = outcome else {
        panic!("expected challenge, got {outcome:?}");
    };
    harness
        .engine
        .device_sign_request(&descriptor.token, Role::Admin)
        .await?;

    let outcome = harness
        .engine
        .device_sign_response(&descriptor.token, &json!({"ok": false}), Role::Admin, &request())
        .await?;
    let AuthOutcome::Denied { data, audited } = outcome else {
        panic!("expected denial, got {outcome:?}");
    };
    assert_eq!(data.error, "secondary_invalid");
    assert!(!audited);

    // The challenge is consumed: no second try on the same token.
    let retry = harness
        .engine
        .device_sign_response(&descriptor.token, &json!({"ok": true}), Role::Admin, &request())
        .await?;
    assert!(matches!(retry, AuthOutcome::SecondaryExpired));
    assert!(harness.sessions.list_for_user(alice.id).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn device_factor_does_not_bypass_fresh_provider_requirement() -> Result<()> {
    let harness = harness();
    let alice = harness.credentials.add_user("alice", "pw").await?;
    harness
        .devices
        .insert(DeviceRecord::new(alice.id, "key", json!({})))
        .await?;
    let secret = b"integrationtestsecret".to_vec();
    harness.secrets.enroll(alice.id, secret.clone()).await;

    // Policy wants the device factor and a provider factor.
    harness
        .validator
        .set(PolicyDecision {
            device_required: true,
            secondary_provider: Some("totp-1".to_string()),
            reject: None,
        })
        .await;

    let outcome = harness
        .engine
        .begin_local(&creds("alice", "pw"), Role::User, &request())
        .await?;
    let AuthOutcome::SecondaryRequired(device_descriptor) = outcome else {
        panic!("expected device challenge, got {outcome:?}");
    };
    assert!(device_descriptor.device);

    harness
        .engine
        .device_sign_request(&device_descriptor.token, Role::User)
        .await?;
    let outcome = harness
        .engine
        .device_sign_response(
            &device_descriptor.token,
            &json!({"ok": true}),
            Role::User,
            &request(),
        )
        .await?;

    // The satisfied device factor opens a provider challenge instead of a
    // session.
    let AuthOutcome::SecondaryRequired(provider_descriptor) = outcome else {
        panic!("expected provider challenge, got {outcome:?}");
    };
    assert_eq!(provider_descriptor.provider, "totp-1");
    assert!(harness.sessions.list_for_user(alice.id).await?.is_empty());

    harness.validator.set(PolicyDecision::accept()).await;
    let code = totp_code(&secret, "alice");
    let outcome = harness
        .engine
        .complete_secondary(
            &provider_descriptor.token,
            "passcode",
            &code,
            Role::User,
            &request(),
        )
        .await?;
    assert!(matches!(outcome, AuthOutcome::SessionInstalled { .. }));
    Ok(())
}

// --- device registration --------------------------------------------------

#[tokio::test]
async fn register_flow_adds_device_without_session() -> Result<()> {
    let harness = harness();
    let alice = harness.credentials.add_user("alice", "pw").await?;

    let begin = harness.engine.device_register_request(&alice).await?;
    let RegisterBegin::Started { token, request: challenge } = begin else {
        panic!("expected registration start, got {begin:?}");
    };
    assert_eq!(challenge, json!({"challenge": "register-nonce"}));

    let finish = harness
        .engine
        .device_register_response(&token, &json!({"ok": true}), &alice, &request())
        .await?;
    assert!(matches!(finish, RegisterFinish::Registered));

    let devices = harness.devices.list(alice.id).await?;
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].label, "test key");

    let events = harness.audit.snapshot().await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, AuditKind::UserDeviceRegister);

    // Register scope never mints a session.
    assert!(harness.sessions.list_for_user(alice.id).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn register_failure_is_audited_and_consumes_the_challenge() -> Result<()> {
    let harness = harness();
    let alice = harness.credentials.add_user("alice", "pw").await?;

    let RegisterBegin::Started { token, .. } =
        harness.engine.device_register_request(&alice).await?
    else {
        panic!("expected registration start");
    };

    let finish = harness
        .engine
        .device_register_response(&token, &json!({"ok": false}), &alice, &request())
        .await?;
    let RegisterFinish::Rejected { data, audited } = finish else {
        panic!("expected rejection, got {finish:?}");
    };
    assert!(audited);
    assert_eq!(data.error, "secondary_invalid");

    let events = harness.audit.snapshot().await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, AuditKind::UserDeviceRegisterFailed);
    assert!(harness.devices.list(alice.id).await?.is_empty());

    let retry = harness
        .engine
        .device_register_response(&token, &json!({"ok": true}), &alice, &request())
        .await?;
    assert!(matches!(retry, RegisterFinish::Expired));
    Ok(())
}

#[tokio::test]
async fn register_challenge_is_bound_to_its_principal() -> Result<()> {
    let harness = harness();
    let alice = harness.credentials.add_user("alice", "pw").await?;
    let bob = harness.credentials.add_user("bob", "pw").await?;

    let RegisterBegin::Started { token, .. } =
        harness.engine.device_register_request(&alice).await?
    else {
        panic!("expected registration start");
    };

    let finish = harness
        .engine
        .device_register_response(&token, &json!({"ok": true}), &bob, &request())
        .await?;
    assert!(matches!(finish, RegisterFinish::Expired));
    assert!(harness.devices.list(bob.id).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn registered_device_flips_policy_to_device_requirement() -> Result<()> {
    // Round-trip law with the real validator: register a device, and the next
    // login requires it.
    let devices = Arc::new(MemoryDeviceStore::new());
    let watched: Arc<dyn DeviceStore> = devices.clone();
    let validator: Arc<dyn Validator> = Arc::new(PolicyValidator::new(
        RolePolicy::default(),
        RolePolicy {
            require_device: true,
            secondary_provider: None,
        },
        watched,
    ));
    let harness = harness_with(HarnessOptions {
        validator: Some(validator),
        ..HarnessOptions::default()
    });
    let alice = harness.credentials.add_user("alice", "pw").await?;

    let outcome = harness
        .engine
        .begin_local(&creds("alice", "pw"), Role::User, &request())
        .await?;
    assert!(matches!(outcome, AuthOutcome::SessionInstalled { .. }));

    devices
        .insert(DeviceRecord::new(alice.id, "key", json!({})))
        .await?;

    let outcome = harness
        .engine
        .begin_local(&creds("alice", "pw"), Role::User, &request())
        .await?;
    let AuthOutcome::SecondaryRequired(descriptor) = outcome else {
        panic!("expected device challenge, got {outcome:?}");
    };
    assert!(descriptor.device);
    Ok(())
}

// --- federated path -------------------------------------------------------

#[tokio::test]
async fn federated_login_preserves_the_deep_link() -> Result<()> {
    let harness = harness();
    let alice = harness.credentials.add_user("alice", "pw").await?;

    let redirect = harness
        .engine
        .begin_federated(Role::User, Some("next=%2Fapp".to_string()))
        .await?;
    let (sig, canonical) = callback_for(&redirect, "alice");

    let outcome = harness
        .engine
        .complete_federated(&sig, &canonical, Role::User, &request())
        .await?;
    let AuthOutcome::SessionInstalled {
        principal,
        preserved_query,
        ..
    } = outcome
    else {
        panic!("expected session, got {outcome:?}");
    };
    assert_eq!(principal.id, alice.id);
    assert_eq!(preserved_query.as_deref(), Some("next=%2Fapp"));

    let events = harness.audit.snapshot().await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, AuditKind::UserLogin);
    assert_eq!(
        events[0].fields.get("method").map(String::as_str),
        Some("sso")
    );
    Ok(())
}

#[tokio::test]
async fn tampered_callback_is_benign_invalid_state() -> Result<()> {
    let harness = harness();
    harness.credentials.add_user("alice", "pw").await?;

    let redirect = harness.engine.begin_federated(Role::User, None).await?;
    let (_, canonical) = callback_for(&redirect, "alice");

    let outcome = harness
        .engine
        .complete_federated("BAD", &canonical, Role::User, &request())
        .await?;
    assert!(matches!(outcome, AuthOutcome::InvalidState));
    assert!(harness.audit.snapshot().await.is_empty());
    Ok(())
}

#[tokio::test]
async fn callback_for_the_wrong_surface_is_invalid_state() -> Result<()> {
    let harness = harness();
    harness.credentials.add_user("alice", "pw").await?;

    let redirect = harness.engine.begin_federated(Role::User, None).await?;
    let (sig, canonical) = callback_for(&redirect, "alice");

    let outcome = harness
        .engine
        .complete_federated(&sig, &canonical, Role::Admin, &request())
        .await?;
    assert!(matches!(outcome, AuthOutcome::InvalidState));
    Ok(())
}

#[tokio::test]
async fn unknown_federated_principal_is_denied() -> Result<()> {
    let harness = harness();

    let redirect = harness.engine.begin_federated(Role::User, None).await?;
    let (sig, canonical) = callback_for(&redirect, "mallory");

    let outcome = harness
        .engine
        .complete_federated(&sig, &canonical, Role::User, &request())
        .await?;
    let AuthOutcome::Denied { data, audited } = outcome else {
        panic!("expected denial, got {outcome:?}");
    };
    assert_eq!(data.error, "unauthorized");
    assert!(!audited);
    Ok(())
}

#[tokio::test]
async fn federated_provider_requirement_redirects_to_login() -> Result<()> {
    let harness = harness();
    harness.credentials.add_user("alice", "pw").await?;
    harness.validator.set(PolicyDecision::provider("totp-1")).await;

    let redirect = harness
        .engine
        .begin_federated(Role::User, Some("next=%2Fapp".to_string()))
        .await?;
    let (sig, canonical) = callback_for(&redirect, "alice");

    let outcome = harness
        .engine
        .complete_federated(&sig, &canonical, Role::User, &request())
        .await?;
    let AuthOutcome::SecondaryPrompt { query } = outcome else {
        panic!("expected prompt, got {outcome:?}");
    };
    assert!(query.contains("secondary="));
    assert!(query.contains("provider=totp-1"));
    // The caller's deep link rides along to the 2FA screen.
    assert!(query.ends_with("&next=%2Fapp"));
    Ok(())
}

// --- state discovery ------------------------------------------------------

#[tokio::test]
async fn discover_state_lists_providers_and_demo() -> Result<()> {
    let harness = harness();
    let state = harness.engine.discover_state().await;
    assert_eq!(state.providers.len(), 1);
    assert_eq!(state.providers[0].id, "corp-idp");

    let demo = harness_with(HarnessOptions {
        demo: true,
        ..HarnessOptions::default()
    });
    let state = demo.engine.discover_state().await;
    assert_eq!(state.providers.len(), 2);
    assert!(
        state
            .providers
            .iter()
            .any(|provider| provider.id == "demo" && provider.kind == "demo")
    );
    Ok(())
}

// --- logout ---------------------------------------------------------------

#[tokio::test]
async fn logout_all_revokes_every_session_and_is_idempotent() -> Result<()> {
    let harness = harness();
    let alice = harness.credentials.add_user("alice", "pw").await?;
    let bob = harness.credentials.add_user("bob", "pw").await?;

    let mut tokens = Vec::new();
    for _ in 0..3 {
        let minted = harness
            .sessions
            .create(alice.id, Role::User.session_scope())
            .await?;
        tokens.push(minted.token);
    }
    let bob_session = harness
        .sessions
        .create(bob.id, Role::User.session_scope())
        .await?;

    harness
        .engine
        .logout_all(&alice, Some(tokens[0].as_str()))
        .await?;

    assert!(harness.sessions.list_for_user(alice.id).await?.is_empty());
    for token in &tokens {
        assert!(harness.engine.authorize(token, Role::User).await?.is_none());
    }
    // Other users are untouched.
    assert_eq!(harness.sessions.list_for_user(bob.id).await?.len(), 1);
    assert!(
        harness
            .engine
            .authorize(&bob_session.token, Role::User)
            .await?
            .is_some()
    );

    // Second call finds nothing to revoke and succeeds.
    harness
        .engine
        .logout_all(&alice, Some(tokens[0].as_str()))
        .await?;
    assert!(harness.sessions.list_for_user(alice.id).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn logout_without_a_session_is_a_noop() -> Result<()> {
    let harness = harness();
    harness.engine.logout(None).await?;
    harness.engine.logout(Some("missing")).await?;
    Ok(())
}

// --- challenge store serialization ---------------------------------------

#[tokio::test]
async fn concurrent_consumers_observe_a_single_winner() -> Result<()> {
    let harness = harness();
    let alice = harness.credentials.add_user("alice", "pw").await?;
    let challenge = harness
        .challenges
        .create(
            alice.id,
            Role::User.login_scope(),
            "totp-1",
        )
        .await?;

    let mut winners = 0;
    for _ in 0..4 {
        if harness.challenges.consume(&challenge.token).await?.is_some() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
    Ok(())
}

#[tokio::test]
async fn federated_reload_swaps_discovery_atomically() -> Result<()> {
    let harness = harness();
    harness
        .federated
        .reload(vec![SsoProvider {
            id: "new-idp".to_string(),
            kind: "oidc".to_string(),
            label: "New IdP".to_string(),
            authorize_url: "https://new.example.com/authorize".to_string(),
        }])
        .await;

    let state = harness.engine.discover_state().await;
    assert_eq!(state.providers.len(), 1);
    assert_eq!(state.providers[0].id, "new-idp");
    Ok(())
}
