use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::{BorrowedMessage, Headers, Message};
use rdkafka::{ClientConfig, Offset, TopicPartitionList};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::broker::{Broker, BrokerConnector, Record};
use crate::config::ConsumerConfig;
use crate::error::BrokerError;

/// Broker backed by an rdkafka [`StreamConsumer`] joined to a consumer group.
pub struct KafkaBroker {
    consumer: Arc<StreamConsumer>,
    topic: Option<String>,
}

impl KafkaBroker {
    pub fn new(config: &ClientConfig) -> Result<Self, BrokerError> {
        let consumer: StreamConsumer = config.create()?;
        Ok(Self {
            consumer: Arc::new(consumer),
            topic: None,
        })
    }

    fn to_record(message: &BorrowedMessage<'_>) -> Record {
        let headers = message
            .headers()
            .map(|headers| {
                headers
                    .iter()
                    .filter_map(|h| h.value.map(|v| (h.key.to_string(), v.to_vec())))
                    .collect()
            })
            .unwrap_or_default();

        Record {
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
            key: message.key().map(|k| k.to_vec()),
            payload: message.payload().map(|p| p.to_vec()),
            headers,
            timestamp_ms: message.timestamp().to_millis(),
        }
    }

    // End-of-partition notices only say that we caught up, they are not failures
    fn is_informational(e: &KafkaError) -> bool {
        matches!(
            e,
            KafkaError::PartitionEOF(_)
                | KafkaError::MessageConsumption(RDKafkaErrorCode::PartitionEOF)
        )
    }
}

#[async_trait]
impl Broker for KafkaBroker {
    async fn subscribe(&mut self, topic: &str, timeout: Duration) -> Result<(), BrokerError> {
        self.consumer.subscribe(&[topic])?;
        self.topic = Some(topic.to_string());

        // subscribe() is lazy, fetching metadata proves the cluster is reachable
        let consumer = self.consumer.clone();
        let requested = topic.to_string();
        let topic_state = tokio::task::spawn_blocking(move || {
            let metadata = consumer.fetch_metadata(Some(&requested), timeout)?;
            let found = metadata
                .topics()
                .iter()
                .find(|t| t.name() == requested)
                .map(|t| (t.error().map(RDKafkaErrorCode::from), t.partitions().len()));
            Ok::<_, KafkaError>(found)
        })
        .await??;

        match topic_state {
            // the topic is created with the tenant's first message
            Some((Some(code), _)) => warn!(topic, error = ?code, "Topic metadata not available yet"),
            Some((None, partitions)) => info!(topic, partitions, "Subscribed to topic"),
            None => warn!(topic, "Topic missing from metadata response"),
        }

        Ok(())
    }

    async fn poll(
        &mut self,
        max_records: usize,
        timeout: Duration,
    ) -> Result<Vec<Record>, BrokerError> {
        let deadline = Instant::now() + timeout;
        let mut records = Vec::with_capacity(max_records.min(1024));

        while records.len() < max_records {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }

            match tokio::time::timeout(remaining, self.consumer.recv()).await {
                Err(_) => break,
                Ok(Ok(message)) => records.push(Self::to_record(&message)),
                Ok(Err(e)) if Self::is_informational(&e) => {
                    debug!("Reached end of partition: {e}");
                }
                Ok(Err(e)) => return Err(e.into()),
            }
        }

        Ok(records)
    }

    async fn commit(&mut self, offsets: &HashMap<i32, i64>) -> Result<(), BrokerError> {
        let Some(topic) = self.topic.as_deref() else {
            return Err(KafkaError::Subscription("commit before subscribe".to_string()).into());
        };

        let mut list = TopicPartitionList::new();
        for (partition, next_offset) in offsets {
            list.add_partition_offset(topic, *partition, Offset::Offset(*next_offset))?;
        }

        // Sync commit so a failure is seen by the caller, off the async workers
        let consumer = self.consumer.clone();
        tokio::task::spawn_blocking(move || consumer.commit(&list, CommitMode::Sync)).await??;

        Ok(())
    }

    async fn close(&mut self) {
        if self.topic.take().is_some() {
            self.consumer.unsubscribe();
        }
    }
}

/// Creates one [`KafkaBroker`] per consumer from a shared client configuration.
pub struct KafkaConnector {
    client_config: ClientConfig,
}

impl KafkaConnector {
    pub fn new(client_config: ClientConfig) -> Self {
        Self { client_config }
    }
}

impl BrokerConnector for KafkaConnector {
    type Broker = KafkaBroker;

    fn connect(&self, config: &ConsumerConfig) -> Result<KafkaBroker, BrokerError> {
        let mut client_config = self.client_config.clone();
        let group = client_config.get("group.id").unwrap_or("application-client");
        let client_id = format!("{group}-{}-{}", config.api_kind(), config.tenant_id());
        client_config.set("client.id", client_id);

        KafkaBroker::new(&client_config)
    }
}
