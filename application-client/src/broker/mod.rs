//! Boundary to the partitioned log broker.
//!
//! The consumer core only needs three independently failable operations on
//! top of a subscription: poll, commit and close. [`kafka::KafkaBroker`] is
//! the production implementation, [`crate::test_utils::ScriptedBroker`] drives
//! the lifecycle in tests.

pub mod kafka;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::ConsumerConfig;
use crate::error::BrokerError;

/// A record fetched from the broker. Owned by the dispatch stage while its
/// handler runs and dropped afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub payload: Option<Vec<u8>>,
    pub headers: Vec<(String, Vec<u8>)>,
    /// Broker timestamp in milliseconds since the epoch, if any
    pub timestamp_ms: Option<i64>,
}

impl Record {
    pub fn new(topic: impl Into<String>, partition: i32, offset: i64) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
            key: None,
            payload: None,
            headers: vec![],
            timestamp_ms: None,
        }
    }

    pub fn with_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_timestamp_ms(mut self, timestamp_ms: i64) -> Self {
        self.timestamp_ms = Some(timestamp_ms);
        self
    }

    /// Last value of the named header, matching the name case-sensitively.
    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .rev()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_slice())
    }
}

/// Subscription to one topic, driven exclusively by a consumer's worker task.
#[async_trait]
pub trait Broker: Send + 'static {
    /// Subscribe to the topic and wait until the broker can serve it.
    async fn subscribe(&mut self, topic: &str, timeout: Duration) -> Result<(), BrokerError>;

    /// Wait up to `timeout` for records, returning at most `max_records`.
    /// An empty result means nothing arrived in time.
    async fn poll(
        &mut self,
        max_records: usize,
        timeout: Duration,
    ) -> Result<Vec<Record>, BrokerError>;

    /// Commit the given offsets, keyed by partition. Values are the next offset
    /// to consume, i.e. the last handled offset + 1.
    async fn commit(&mut self, offsets: &HashMap<i32, i64>) -> Result<(), BrokerError>;

    /// Leave the subscription and release the connection. Never fails.
    async fn close(&mut self);
}

/// Creates a fresh broker connection for every consumer a factory builds.
pub trait BrokerConnector: Send + Sync + 'static {
    type Broker: Broker;

    fn connect(&self, config: &ConsumerConfig) -> Result<Self::Broker, BrokerError>;
}
