use std::time::Duration;

use rdkafka::error::KafkaError;
use thiserror::Error;

/// Failure of one of the broker boundary operations (subscribe, poll, commit).
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("kafka error: {0}")]
    Kafka(#[from] KafkaError),

    #[error("broker did not respond within {0:?}")]
    Timeout(Duration),

    #[error("blocking broker call did not complete: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Returned by the factory when a consumer could not be brought to RUNNING.
#[derive(Debug, Error)]
pub enum FactoryError {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("failed to subscribe to topic {topic}: {source}")]
    Subscription {
        topic: String,
        #[source]
        source: BrokerError,
    },

    #[error("consumer was closed before it became ready")]
    ClosedBeforeReady,
}

/// Cause passed to a consumer's close handler.
///
/// Only poll and commit failures are reported this way. Handler failures and
/// explicit closes end the consumer without a notification.
#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("failed to poll records: {0}")]
    Poll(#[source] BrokerError),

    #[error("failed to commit offsets: {0}")]
    Commit(#[source] BrokerError),
}

impl ConsumerError {
    pub fn broker_error(&self) -> &BrokerError {
        match self {
            ConsumerError::Poll(e) | ConsumerError::Commit(e) => e,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broker_error_is_shared_by_poll_and_commit_failures() {
        let poll = ConsumerError::Poll(BrokerError::Kafka(KafkaError::NoMessageReceived));
        let commit = ConsumerError::Commit(BrokerError::Timeout(Duration::from_secs(1)));

        assert!(matches!(
            poll.broker_error(),
            BrokerError::Kafka(KafkaError::NoMessageReceived)
        ));
        assert!(matches!(commit.broker_error(), BrokerError::Timeout(d) if *d == Duration::from_secs(1)));
        assert_eq!(commit.to_string(), "failed to commit offsets: broker did not respond within 1s");
    }
}
