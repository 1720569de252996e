//! Per-user policy evaluation.
//!
//! The engine only depends on this narrow contract; richer policy engines
//! plug in behind it. Outcome precedence is fixed: reject wins over a device
//! requirement, which wins over a provider requirement, which wins over
//! plain acceptance.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

use crate::audit::RequestInfo;
use crate::auth::outcome::ErrorData;
use crate::device::DeviceStore;
use crate::principal::{Principal, Role};

/// Decision returned by a validator.
#[derive(Clone, Debug, Default)]
pub struct PolicyDecision {
    pub device_required: bool,
    pub secondary_provider: Option<String>,
    pub reject: Option<ErrorData>,
}

/// Decision collapsed into the precedence order the engine acts on.
#[derive(Debug, PartialEq, Eq)]
pub enum PolicyOutcome<'a> {
    Reject(&'a ErrorData),
    Device,
    Provider(&'a str),
    Accept,
}

impl PolicyDecision {
    #[must_use]
    pub fn accept() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn reject(data: ErrorData) -> Self {
        Self {
            reject: Some(data),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn device() -> Self {
        Self {
            device_required: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn provider(id: &str) -> Self {
        Self {
            secondary_provider: Some(id.to_string()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn outcome(&self) -> PolicyOutcome<'_> {
        if let Some(reject) = &self.reject {
            return PolicyOutcome::Reject(reject);
        }
        if self.device_required {
            return PolicyOutcome::Device;
        }
        if let Some(provider) = self.secondary_provider.as_deref()
            && !provider.is_empty()
        {
            return PolicyOutcome::Provider(provider);
        }
        PolicyOutcome::Accept
    }
}

#[async_trait]
pub trait Validator: Send + Sync {
    async fn validate(
        &self,
        principal: &Principal,
        role: Role,
        request: &RequestInfo,
    ) -> Result<PolicyDecision>;
}

/// Per-role factor requirements for the built-in validator.
#[derive(Clone, Debug, Default)]
pub struct RolePolicy {
    pub require_device: bool,
    pub secondary_provider: Option<String>,
}

/// Configuration-driven validator.
///
/// A device requirement only applies once the user has a registered device;
/// until then the configured provider factor (if any) carries the login.
pub struct PolicyValidator {
    admin: RolePolicy,
    user: RolePolicy,
    devices: Arc<dyn DeviceStore>,
}

impl PolicyValidator {
    #[must_use]
    pub fn new(admin: RolePolicy, user: RolePolicy, devices: Arc<dyn DeviceStore>) -> Self {
        Self {
            admin,
            user,
            devices,
        }
    }
}

#[async_trait]
impl Validator for PolicyValidator {
    async fn validate(
        &self,
        principal: &Principal,
        role: Role,
        _request: &RequestInfo,
    ) -> Result<PolicyDecision> {
        let policy = match role {
            Role::Admin => &self.admin,
            Role::User => &self.user,
        };

        if policy.require_device {
            let devices = self.devices.list(principal.id).await?;
            if !devices.is_empty() {
                return Ok(PolicyDecision::device());
            }
        }

        if let Some(provider) = policy.secondary_provider.as_deref()
            && !provider.is_empty()
        {
            return Ok(PolicyDecision::provider(provider));
        }

        Ok(PolicyDecision::accept())
    }
}
