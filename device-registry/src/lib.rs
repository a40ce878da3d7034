//! Device registration assertions.
//!
//! Protocol adapters ask the registry whether a device is registered and
//! enabled for a tenant, optionally on behalf of a gateway, before they accept
//! its telemetry or events.

pub mod error;
pub mod in_memory;
pub mod registration;

pub use error::RegistrationError;
pub use in_memory::{DeviceRegistration, InMemoryRegistrationService};
pub use registration::{RegistrationAssertion, RegistrationResult, RegistrationService};
