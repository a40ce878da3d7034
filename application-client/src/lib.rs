//! Northbound application client.
//!
//! Consumes the telemetry and event messages that devices of a tenant publish
//! to the broker and hands them to an application supplied handler. A consumer
//! is created through [`ApplicationClientFactory`] and runs on its own task:
//!
//! ```text
//! Factory ─► Lifecycle manager ─► poll ─► dispatch (per record) ─► offset tracker ─► commit
//!                    ▲                 │               │                                │
//!                    └──── PollFailure ┘ HandlerFailure┘                   CommitFailure ┘
//! ```
//!
//! A handled record is acknowledged implicitly: returning `Ok(())` from the
//! handler marks its offset for commit. Any failure is fatal to the consumer
//! instance. Poll and commit failures are reported through the optional close
//! handler, handler failures and explicit closes are not. A closed consumer is
//! never reused; create a new one through the factory.
//!
//! ## Error logging
//!
//! Log error chains with `error = ?e` or `{e:#}` so the root cause stays visible.

pub mod broker;
pub mod config;
pub mod consumer;
pub mod error;
pub mod factory;
pub mod lifecycle;
pub mod message;
pub mod metrics_consts;
pub mod metrics_server;
pub mod offset_tracker;

// Used in "mod tests" and tests/ directory (integration tests)
pub mod test_utils;

pub use broker::{Broker, BrokerConnector, Record};
pub use config::{ApiKind, ConsumerConfig, ConsumerSettings};
pub use consumer::{CloseHandler, MessageConsumer, MessageHandler};
pub use error::{BrokerError, ConsumerError, FactoryError};
pub use factory::ApplicationClientFactory;
pub use lifecycle::ConsumerState;
pub use message::{DownstreamMessage, MessageContext, QoS};
