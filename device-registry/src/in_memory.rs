use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tracing::debug;
use uuid::Uuid;

use crate::error::{require_id, RegistrationError};
use crate::registration::{RegistrationAssertion, RegistrationResult, RegistrationService};

/// Registration data of a single device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRegistration {
    pub enabled: bool,
    /// Gateways allowed to act on behalf of this device
    pub via: Vec<String>,
    pub default_content_type: Option<String>,
}

impl Default for DeviceRegistration {
    fn default() -> Self {
        Self {
            enabled: true,
            via: vec![],
            default_content_type: None,
        }
    }
}

impl DeviceRegistration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn with_via(mut self, gateway_id: impl Into<String>) -> Self {
        self.via.push(gateway_id.into());
        self
    }

    pub fn with_default_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.default_content_type = Some(content_type.into());
        self
    }
}

/// Registry keeping all devices in memory, keyed by tenant and device id.
#[derive(Debug, Default)]
pub struct InMemoryRegistrationService {
    devices: DashMap<(String, String), DeviceRegistration>,
}

impl InMemoryRegistrationService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a device's registration.
    pub fn register(
        &self,
        tenant_id: &str,
        device_id: &str,
        registration: DeviceRegistration,
    ) -> Result<(), RegistrationError> {
        require_id(tenant_id, "tenant id must not be empty")?;
        require_id(device_id, "device id must not be empty")?;

        self.devices
            .insert((tenant_id.to_string(), device_id.to_string()), registration);
        Ok(())
    }

    pub fn remove(&self, tenant_id: &str, device_id: &str) -> Option<DeviceRegistration> {
        self.devices
            .remove(&(tenant_id.to_string(), device_id.to_string()))
            .map(|(_, registration)| registration)
    }

    /// Returns false if the device is not registered.
    pub fn set_enabled(&self, tenant_id: &str, device_id: &str, enabled: bool) -> bool {
        match self
            .devices
            .get_mut(&(tenant_id.to_string(), device_id.to_string()))
        {
            Some(mut registration) => {
                registration.enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    fn enabled_device(&self, tenant_id: &str, device_id: &str) -> Option<DeviceRegistration> {
        self.devices
            .get(&(tenant_id.to_string(), device_id.to_string()))
            .filter(|registration| registration.enabled)
            .map(|registration| registration.value().clone())
    }
}

#[async_trait]
impl RegistrationService for InMemoryRegistrationService {
    async fn assert_registration(
        &self,
        tenant_id: &str,
        device_id: &str,
        gateway_id: Option<&str>,
    ) -> Result<RegistrationResult, RegistrationError> {
        require_id(tenant_id, "tenant id must not be empty")?;
        require_id(device_id, "device id must not be empty")?;
        if let Some(gateway_id) = gateway_id {
            require_id(gateway_id, "gateway id must not be empty")?;
        }

        let Some(device) = self.enabled_device(tenant_id, device_id) else {
            debug!(tenant_id, device_id, "Device is not registered or disabled");
            return Ok(RegistrationResult::NotFound);
        };

        if let Some(gateway_id) = gateway_id {
            if self.enabled_device(tenant_id, gateway_id).is_none() {
                debug!(tenant_id, device_id, gateway_id, "Gateway is not registered or disabled");
                return Ok(RegistrationResult::Forbidden);
            }
            if !device.via.iter().any(|via| via == gateway_id) {
                debug!(tenant_id, device_id, gateway_id, "Gateway may not act for device");
                return Ok(RegistrationResult::Forbidden);
            }
        }

        Ok(RegistrationResult::Ok(RegistrationAssertion {
            device_id: device_id.to_string(),
            token: Uuid::new_v4().simple().to_string(),
            via: device.via,
            default_content_type: device.default_content_type,
            issued_at: Utc::now(),
        }))
    }
}
