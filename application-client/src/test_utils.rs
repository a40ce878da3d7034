use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};

use crate::broker::{Broker, BrokerConnector, Record};
use crate::config::{ConsumerConfig, ConsumerSettings};
use crate::consumer::{CloseHandler, MessageHandler};
use crate::error::{BrokerError, ConsumerError};
use crate::message::{DownstreamMessage, HEADER_CONTENT_TYPE, HEADER_CREATION_TIME};

/// Test utilities for driving consumers without a running Kafka cluster
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Settings that keep lifecycle tests fast: short polls and a commit after
/// every batch.
pub fn fast_settings() -> ConsumerSettings {
    ConsumerSettings {
        poll_interval: Duration::from_millis(10),
        commit_interval: Duration::ZERO,
        max_batch_size: 100,
        subscribe_timeout: Duration::from_secs(1),
    }
}

/// A telemetry-like record for `device-<offset>` with a small JSON payload.
pub fn create_test_record(topic: &str, partition: i32, offset: i64) -> Record {
    Record::new(topic, partition, offset)
        .with_key(format!("device-{offset}"))
        .with_payload(format!(r#"{{"temp":{offset}}}"#))
        .with_header(HEADER_CONTENT_TYPE, "application/json")
        .with_header(HEADER_CREATION_TIME, "1700000000000")
        .with_timestamp_ms(1_700_000_000_000)
}

pub fn create_test_records(
    topic: &str,
    partition: i32,
    offsets: impl IntoIterator<Item = i64>,
) -> Vec<Record> {
    offsets
        .into_iter()
        .map(|offset| create_test_record(topic, partition, offset))
        .collect()
}

pub fn poll_error() -> BrokerError {
    BrokerError::Kafka(KafkaError::MessageConsumption(
        RDKafkaErrorCode::BrokerTransportFailure,
    ))
}

pub fn commit_error() -> BrokerError {
    BrokerError::Kafka(KafkaError::ConsumerCommit(
        RDKafkaErrorCode::RebalanceInProgress,
    ))
}

pub fn subscribe_error() -> BrokerError {
    BrokerError::Kafka(KafkaError::Subscription(
        "unknown topic or partition".to_string(),
    ))
}

/// What a [`ScriptedBroker`] was asked to do, shared with the test.
#[derive(Debug, Default)]
pub struct BrokerLog {
    pub subscribed: Vec<String>,
    pub polls: usize,
    pub commit_attempts: Vec<HashMap<i32, i64>>,
    pub committed: Vec<HashMap<i32, i64>>,
    pub closed: bool,
}

impl BrokerLog {
    /// Highest committed next-offset per partition.
    pub fn committed_offsets(&self) -> HashMap<i32, i64> {
        let mut offsets = HashMap::new();
        for commit in &self.committed {
            for (partition, offset) in commit {
                let entry = offsets.entry(*partition).or_insert(*offset);
                *entry = (*entry).max(*offset);
            }
        }
        offsets
    }
}

enum PollStep {
    Records(Vec<Record>),
    Fail(BrokerError),
}

/// In-memory broker replaying a script of poll results.
///
/// Once the script is exhausted every poll waits out its timeout and returns
/// nothing, like an idle topic. Commits succeed unless a failure was queued.
#[derive(Default)]
pub struct ScriptedBroker {
    subscribe_error: Option<BrokerError>,
    subscribe_delay: Option<Duration>,
    polls: VecDeque<PollStep>,
    commits: VecDeque<BrokerError>,
    log: Arc<Mutex<BrokerLog>>,
}

impl ScriptedBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_subscribe(mut self, error: BrokerError) -> Self {
        self.subscribe_error = Some(error);
        self
    }

    pub fn delay_subscribe(mut self, delay: Duration) -> Self {
        self.subscribe_delay = Some(delay);
        self
    }

    pub fn then_records(mut self, records: Vec<Record>) -> Self {
        self.polls.push_back(PollStep::Records(records));
        self
    }

    pub fn then_empty_poll(mut self) -> Self {
        self.polls.push_back(PollStep::Records(vec![]));
        self
    }

    pub fn then_poll_error(mut self, error: BrokerError) -> Self {
        self.polls.push_back(PollStep::Fail(error));
        self
    }

    /// Fail the next commit that is attempted.
    pub fn fail_next_commit(mut self, error: BrokerError) -> Self {
        self.commits.push_back(error);
        self
    }

    pub fn log(&self) -> Arc<Mutex<BrokerLog>> {
        self.log.clone()
    }
}

#[async_trait]
impl Broker for ScriptedBroker {
    async fn subscribe(&mut self, topic: &str, _timeout: Duration) -> Result<(), BrokerError> {
        if let Some(delay) = self.subscribe_delay {
            tokio::time::sleep(delay).await;
        }
        lock(&self.log).subscribed.push(topic.to_string());

        match self.subscribe_error.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn poll(
        &mut self,
        max_records: usize,
        timeout: Duration,
    ) -> Result<Vec<Record>, BrokerError> {
        lock(&self.log).polls += 1;

        match self.polls.pop_front() {
            Some(PollStep::Records(mut records)) => {
                if records.len() > max_records {
                    let rest = records.split_off(max_records);
                    self.polls.push_front(PollStep::Records(rest));
                }
                Ok(records)
            }
            Some(PollStep::Fail(e)) => Err(e),
            None => {
                tokio::time::sleep(timeout).await;
                Ok(vec![])
            }
        }
    }

    async fn commit(&mut self, offsets: &HashMap<i32, i64>) -> Result<(), BrokerError> {
        let mut log = lock(&self.log);
        log.commit_attempts.push(offsets.clone());

        match self.commits.pop_front() {
            Some(e) => Err(e),
            None => {
                log.committed.push(offsets.clone());
                Ok(())
            }
        }
    }

    async fn close(&mut self) {
        lock(&self.log).closed = true;
    }
}

/// Hands out prepared [`ScriptedBroker`]s, one per created consumer.
#[derive(Default)]
pub struct ScriptedConnector {
    brokers: Mutex<VecDeque<ScriptedBroker>>,
    connected: Mutex<Vec<ConsumerConfig>>,
}

impl ScriptedConnector {
    pub fn new(brokers: impl IntoIterator<Item = ScriptedBroker>) -> Self {
        Self {
            brokers: Mutex::new(brokers.into_iter().collect()),
            connected: Mutex::new(vec![]),
        }
    }

    /// Configurations of the consumers that got a broker.
    pub fn connected(&self) -> Vec<ConsumerConfig> {
        lock(&self.connected).clone()
    }
}

impl BrokerConnector for ScriptedConnector {
    type Broker = ScriptedBroker;

    fn connect(&self, config: &ConsumerConfig) -> Result<ScriptedBroker, BrokerError> {
        let broker = lock(&self.brokers).pop_front().ok_or_else(|| {
            BrokerError::Kafka(KafkaError::ClientCreation(
                "no scripted broker left".to_string(),
            ))
        })?;
        lock(&self.connected).push(config.clone());
        Ok(broker)
    }
}

/// Message handler that records every invocation and fails or panics on chosen offsets.
#[derive(Default)]
pub struct RecordingHandler {
    fail_on: HashSet<i64>,
    panic_on: HashSet<i64>,
    delay: Option<Duration>,
    invoked: Mutex<Vec<(i32, i64)>>,
    handled: Mutex<Vec<DownstreamMessage>>,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_at(mut self, offset: i64) -> Self {
        self.fail_on.insert(offset);
        self
    }

    pub fn panicking_at(mut self, offset: i64) -> Self {
        self.panic_on.insert(offset);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Partition/offset of every invocation, including failed ones.
    pub fn invocations(&self) -> Vec<(i32, i64)> {
        lock(&self.invoked).clone()
    }

    pub fn invocation_count(&self) -> usize {
        lock(&self.invoked).len()
    }

    /// Offsets of the messages that were handled successfully.
    pub fn handled_offsets(&self) -> Vec<i64> {
        lock(&self.handled)
            .iter()
            .map(|m| m.context().offset())
            .collect()
    }

    pub fn handled_device_ids(&self) -> Vec<String> {
        lock(&self.handled)
            .iter()
            .filter_map(|m| m.device_id().map(str::to_string))
            .collect()
    }
}

#[async_trait]
impl MessageHandler for RecordingHandler {
    async fn handle(&self, message: &DownstreamMessage) -> Result<()> {
        let context = message.context();
        lock(&self.invoked).push((context.partition(), context.offset()));

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        if self.panic_on.contains(&context.offset()) {
            panic!("handler blew up at offset {}", context.offset());
        }

        if self.fail_on.contains(&context.offset()) {
            return Err(anyhow!("rejected message at offset {}", context.offset()));
        }

        lock(&self.handled).push(message.clone());
        Ok(())
    }
}

/// Collects the errors passed to the close handlers it creates.
#[derive(Clone, Default)]
pub struct CloseRecorder {
    errors: Arc<Mutex<Vec<ConsumerError>>>,
}

impl CloseRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn close_handler(&self) -> CloseHandler {
        let errors = self.errors.clone();
        Box::new(move |e| lock(&errors).push(e))
    }

    pub fn count(&self) -> usize {
        lock(&self.errors).len()
    }

    pub fn is_poll_failure(&self) -> bool {
        matches!(lock(&self.errors).first(), Some(ConsumerError::Poll(_)))
    }

    pub fn is_commit_failure(&self) -> bool {
        matches!(lock(&self.errors).first(), Some(ConsumerError::Commit(_)))
    }
}

/// Poll `f` until it returns true, panicking after `timeout`.
pub async fn wait_for_condition<F, Fut>(timeout: Duration, interval: Duration, f: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if f().await {
            return;
        }
        tokio::time::sleep(interval).await;
    }
    panic!("condition not met within {timeout:?}");
}
