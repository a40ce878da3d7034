use std::sync::Arc;

use rdkafka::ClientConfig;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{info_span, Instrument};

use crate::broker::kafka::KafkaConnector;
use crate::broker::BrokerConnector;
use crate::config::{ApiKind, ConsumerConfig, ConsumerSettings};
use crate::consumer::{CloseHandler, ConsumerWorker, MessageConsumer, MessageHandler};
use crate::error::FactoryError;
use crate::lifecycle::Lifecycle;

/// Creates consumers for the northbound telemetry and event APIs.
///
/// Messages are acknowledged automatically when the message handler returns
/// `Ok(())`. Be careful with handler errors: the first one closes the consumer
/// and nothing more is consumed for it until a new consumer is created.
///
/// If polling or committing offsets fails, the consumer is closed and the close
/// handler, if any, is invoked with a [`crate::ConsumerError`] describing the
/// cause. Some of these failures go away on their own, so creating a new
/// consumer can make sense; others need to be resolved externally.
pub struct ApplicationClientFactory<C: BrokerConnector> {
    connector: C,
    settings: ConsumerSettings,
}

impl ApplicationClientFactory<KafkaConnector> {
    pub fn kafka(client_config: ClientConfig, settings: ConsumerSettings) -> Self {
        Self::new(KafkaConnector::new(client_config), settings)
    }
}

impl<C: BrokerConnector> ApplicationClientFactory<C> {
    pub fn new(connector: C, settings: ConsumerSettings) -> Self {
        Self {
            connector,
            settings,
        }
    }

    pub fn settings(&self) -> &ConsumerSettings {
        &self.settings
    }

    /// Consume the tenant's telemetry messages.
    ///
    /// Resolves once the consumer is subscribed and RUNNING, fails if it cannot
    /// be started.
    pub async fn create_telemetry_consumer(
        &self,
        tenant_id: &str,
        message_handler: Arc<dyn MessageHandler>,
        close_handler: Option<CloseHandler>,
    ) -> Result<MessageConsumer, FactoryError> {
        self.create_consumer(tenant_id, ApiKind::Telemetry, message_handler, close_handler)
            .await
    }

    /// Consume the tenant's event messages.
    ///
    /// Resolves once the consumer is subscribed and RUNNING, fails if it cannot
    /// be started.
    pub async fn create_event_consumer(
        &self,
        tenant_id: &str,
        message_handler: Arc<dyn MessageHandler>,
        close_handler: Option<CloseHandler>,
    ) -> Result<MessageConsumer, FactoryError> {
        self.create_consumer(tenant_id, ApiKind::Event, message_handler, close_handler)
            .await
    }

    /// Create a consumer for the tenant's topic of the given API.
    ///
    /// Polling starts right away on a task of its own. Dropping the returned
    /// future before it resolves closes the consumer again.
    pub async fn create_consumer(
        &self,
        tenant_id: &str,
        api_kind: ApiKind,
        message_handler: Arc<dyn MessageHandler>,
        close_handler: Option<CloseHandler>,
    ) -> Result<MessageConsumer, FactoryError> {
        if tenant_id.trim().is_empty() {
            return Err(FactoryError::InvalidArgument("tenant id must not be empty"));
        }

        let config = Arc::new(ConsumerConfig::with_settings(
            tenant_id,
            api_kind,
            &self.settings,
        ));

        let broker = self
            .connector
            .connect(&config)
            .map_err(|source| FactoryError::Subscription {
                topic: config.topic().to_string(),
                source,
            })?;

        let (lifecycle, state_rx) = Lifecycle::new(tenant_id);
        let shutdown = CancellationToken::new();
        let (ready_tx, ready_rx) = oneshot::channel();

        let worker = ConsumerWorker::new(
            config.clone(),
            broker,
            message_handler,
            close_handler,
            lifecycle,
            shutdown.clone(),
        );

        let span = info_span!(
            "application_consumer",
            tenant_id = %config.tenant_id(),
            api = %config.api_kind()
        );
        tokio::spawn(worker.run(ready_tx).instrument(span));

        match ready_rx.await {
            Ok(Ok(())) => Ok(MessageConsumer::new(config, shutdown, state_rx)),
            Ok(Err(e)) => Err(e),
            // the worker ended without answering, which it only does by panicking
            Err(_) => Err(FactoryError::ClosedBeforeReady),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::ConsumerState;
    use crate::test_utils::{fast_settings, RecordingHandler, ScriptedBroker, ScriptedConnector};

    fn factory(brokers: Vec<ScriptedBroker>) -> ApplicationClientFactory<ScriptedConnector> {
        ApplicationClientFactory::new(ScriptedConnector::new(brokers), fast_settings())
    }

    #[tokio::test]
    async fn test_blank_tenant_is_rejected_without_connecting() {
        let factory = factory(vec![ScriptedBroker::new()]);

        let result = factory
            .create_telemetry_consumer("  ", Arc::new(RecordingHandler::new()), None)
            .await;

        assert!(matches!(result, Err(FactoryError::InvalidArgument(_))));
        assert!(factory.connector.connected().is_empty());
    }

    #[tokio::test]
    async fn test_connect_failure_is_a_subscription_error() {
        let factory = factory(vec![]);

        let result = factory
            .create_event_consumer("tenant-a", Arc::new(RecordingHandler::new()), None)
            .await;

        match result {
            Err(FactoryError::Subscription { topic, .. }) => {
                assert_eq!(topic, "hono.event.tenant-a");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_consumers_get_their_tenant_topic() {
        let factory = factory(vec![ScriptedBroker::new(), ScriptedBroker::new()]);
        let handler = Arc::new(RecordingHandler::new());

        let telemetry = factory
            .create_telemetry_consumer("tenant-a", handler.clone(), None)
            .await
            .unwrap();
        let event = factory
            .create_event_consumer("tenant-a", handler, None)
            .await
            .unwrap();

        assert_eq!(telemetry.topic(), "hono.telemetry.tenant-a");
        assert_eq!(telemetry.api_kind(), ApiKind::Telemetry);
        assert_eq!(event.topic(), "hono.event.tenant-a");
        assert_eq!(event.tenant_id(), "tenant-a");
        assert_eq!(telemetry.state(), ConsumerState::Running);

        let connected = factory.connector.connected();
        assert_eq!(connected.len(), 2);
        assert_eq!(connected[0].poll_interval(), fast_settings().poll_interval);

        telemetry.close().await;
        event.close().await;
        assert_eq!(telemetry.state(), ConsumerState::Closed);
    }
}
