use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use application_client::config::Config;
use application_client::metrics_server::{metrics_routes, serve, setup_metrics_recorder};
use application_client::{
    ApplicationClientFactory, CloseHandler, ConsumerError, DownstreamMessage, MessageHandler,
};
use async_trait::async_trait;
use envconfig::Envconfig;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

fn setup_tracing() {
    let log_layer = tracing_subscriber::fmt::layer().with_filter(
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    );
    tracing_subscriber::registry().with(log_layer).init();
}

fn start_server(config: &Config, recorder_handle: PrometheusHandle) -> JoinHandle<()> {
    let router = metrics_routes(recorder_handle);
    let bind = config.bind_address();

    tokio::spawn(async move {
        if let Err(e) = serve(router, &bind).await {
            error!(error = ?e, %bind, "Metrics server stopped");
        }
    })
}

/// Logs every message it receives.
struct LoggingHandler;

#[async_trait]
impl MessageHandler for LoggingHandler {
    async fn handle(&self, message: &DownstreamMessage) -> Result<()> {
        let context = message.context();
        info!(
            tenant_id = message.tenant_id(),
            device_id = message.device_id(),
            content_type = message.content_type(),
            partition = context.partition(),
            offset = context.offset(),
            payload_len = message.payload().len(),
            "Received message"
        );

        if message.content_type() == Some("application/json") {
            let payload: serde_json::Value = message
                .payload_json()
                .with_context(|| format!("payload at offset {} is not JSON", context.offset()))?;
            info!(%payload, "Message payload");
        }

        Ok(())
    }
}

/// Outcome of one consumer instance as seen by the service loop.
enum ConsumerOutcome {
    ShutdownRequested,
    Failed(ConsumerError),
    HandlerFailed,
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = ?e, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}

/// Sleeps for `delay`, returning false if shutdown was requested meanwhile.
async fn wait_before_recreate(delay: Duration) -> bool {
    tokio::select! {
        _ = shutdown_signal() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_tracing();
    info!("Starting application client");

    let config = Config::init_from_env()
        .context("Failed to load configuration from environment variables")?;
    info!(?config, "Configuration loaded");

    let recorder_handle =
        setup_metrics_recorder().context("Failed to install the metrics recorder")?;
    let server_handle = start_server(&config, recorder_handle);
    info!("Started metrics server on {}", config.bind_address());

    let factory = ApplicationClientFactory::kafka(config.client_config(), config.settings());
    let handler: Arc<dyn MessageHandler> = Arc::new(LoggingHandler);

    loop {
        let (failed_tx, failed_rx) = oneshot::channel();
        let close_handler: CloseHandler = Box::new(move |e| {
            if failed_tx.send(e).is_err() {
                warn!("Service loop is gone, dropping consumer failure");
            }
        });

        let consumer = match factory
            .create_consumer(
                &config.tenant_id,
                config.api_kind,
                handler.clone(),
                Some(close_handler),
            )
            .await
        {
            Ok(consumer) => consumer,
            Err(e) => {
                error!(error = ?e, "Failed to create consumer");
                if wait_before_recreate(config.recreate_delay()).await {
                    continue;
                }
                break;
            }
        };
        info!(topic = consumer.topic(), "Consumer is running");

        let outcome = tokio::select! {
            _ = shutdown_signal() => ConsumerOutcome::ShutdownRequested,
            failure = failed_rx => match failure {
                Ok(e) => ConsumerOutcome::Failed(e),
                // the close handler is dropped unused when the message handler failed
                Err(_) => ConsumerOutcome::HandlerFailed,
            },
        };

        match outcome {
            ConsumerOutcome::ShutdownRequested => {
                info!("Shutdown requested, closing consumer");
                consumer.close().await;
                break;
            }
            ConsumerOutcome::Failed(e) => {
                warn!(
                    error = ?e,
                    broker_error = %e.broker_error(),
                    delay_ms = config.recreate_delay_ms,
                    "Consumer was closed, recreating"
                );
                if !wait_before_recreate(config.recreate_delay()).await {
                    break;
                }
            }
            ConsumerOutcome::HandlerFailed => {
                consumer.closed().await;
                anyhow::bail!("message handler failed, consumer {} closed", consumer.topic());
            }
        }
    }

    server_handle.abort();
    info!("Application client stopped");
    Ok(())
}
