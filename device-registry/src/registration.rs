use async_trait::async_trait;
use chrono::{DateTime, Utc};
use http::StatusCode;
use serde::{Deserialize, Serialize};

use crate::error::RegistrationError;

/// Proof that a device is registered and enabled, handed to protocol adapters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationAssertion {
    pub device_id: String,
    /// Opaque token identifying this assertion
    pub token: String,
    /// Gateways the device may connect through
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub via: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_content_type: Option<String>,
    pub issued_at: DateTime<Utc>,
}

/// Outcome of a registration assertion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationResult {
    Ok(RegistrationAssertion),
    /// The gateway may not act on behalf of the device
    Forbidden,
    /// The device is unknown to the tenant or disabled
    NotFound,
}

impl RegistrationResult {
    pub fn status(&self) -> StatusCode {
        match self {
            RegistrationResult::Ok(_) => StatusCode::OK,
            RegistrationResult::Forbidden => StatusCode::FORBIDDEN,
            RegistrationResult::NotFound => StatusCode::NOT_FOUND,
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, RegistrationResult::Ok(_))
    }

    pub fn assertion(&self) -> Option<&RegistrationAssertion> {
        match self {
            RegistrationResult::Ok(assertion) => Some(assertion),
            _ => None,
        }
    }
}

#[async_trait]
pub trait RegistrationService: Send + Sync {
    /// Assert that `device_id` is registered with the tenant and enabled.
    ///
    /// With a `gateway_id`, additionally assert that the gateway is registered,
    /// enabled and allowed to act on behalf of the device.
    async fn assert_registration(
        &self,
        tenant_id: &str,
        device_id: &str,
        gateway_id: Option<&str>,
    ) -> Result<RegistrationResult, RegistrationError>;
}
