use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::{oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::{Broker, Record};
use crate::config::{ApiKind, ConsumerConfig};
use crate::error::{BrokerError, ConsumerError, FactoryError};
use crate::lifecycle::{
    ConsumerState, Effect, FailureRecord, Lifecycle, LifecycleEvent, Termination,
};
use crate::message::DownstreamMessage;
use crate::metrics_consts::{
    CONSUMER_BATCH_SIZE, CONSUMER_COMMIT_DURATION_MS, CONSUMER_COMMIT_FAILURES,
    CONSUMER_HANDLER_FAILURES, CONSUMER_MESSAGES_HANDLED, CONSUMER_OFFSETS_COMMITTED,
    CONSUMER_POLL_FAILURES, CONSUMER_STALE_RECORDS_SKIPPED, CONSUMER_SUBSCRIPTION_FAILURES,
};
use crate::offset_tracker::OffsetTracker;

/// Application code invoked with every consumed message.
///
/// Returning `Ok(())` acknowledges the message: its offset becomes eligible
/// for commit. Returning an error stops the consumer for good, no further
/// message is delivered and the close handler is not invoked. A panic is
/// treated like an error.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, message: &DownstreamMessage) -> anyhow::Result<()>;
}

/// Notified at most once, when a poll or commit failure closed the consumer.
pub type CloseHandler = Box<dyn FnOnce(ConsumerError) + Send + 'static>;

/// Handle to a running consumer. Cloning it does not create a new consumer.
#[derive(Debug, Clone)]
pub struct MessageConsumer {
    config: Arc<ConsumerConfig>,
    shutdown: CancellationToken,
    state_rx: watch::Receiver<ConsumerState>,
}

impl MessageConsumer {
    pub(crate) fn new(
        config: Arc<ConsumerConfig>,
        shutdown: CancellationToken,
        state_rx: watch::Receiver<ConsumerState>,
    ) -> Self {
        Self {
            config,
            shutdown,
            state_rx,
        }
    }

    pub fn tenant_id(&self) -> &str {
        self.config.tenant_id()
    }

    pub fn api_kind(&self) -> ApiKind {
        self.config.api_kind()
    }

    pub fn topic(&self) -> &str {
        self.config.topic()
    }

    pub fn state(&self) -> ConsumerState {
        *self.state_rx.borrow()
    }

    /// Request the consumer to close.
    ///
    /// The request is made before this returns and never blocks. The returned
    /// future resolves once the consumer is CLOSED; awaiting it is optional.
    /// The close handler is not invoked for an explicit close.
    pub fn close(&self) -> impl Future<Output = ()> + Send + 'static {
        self.shutdown.cancel();
        Self::wait_closed(self.state_rx.clone())
    }

    /// Resolves once the consumer is CLOSED, for whatever reason.
    pub fn closed(&self) -> impl Future<Output = ()> + Send + 'static {
        Self::wait_closed(self.state_rx.clone())
    }

    async fn wait_closed(mut state_rx: watch::Receiver<ConsumerState>) {
        // the worker only drops the sender after reaching CLOSED
        if state_rx.wait_for(|s| s.is_terminal()).await.is_err() {
            debug!("Consumer worker is gone");
        }
    }
}

/// Drives one consumer: poll, dispatch and commit run one after another on
/// the worker's task, so a slow handler throttles polling.
pub(crate) struct ConsumerWorker<B: Broker> {
    config: Arc<ConsumerConfig>,
    broker: B,
    handler: Arc<dyn MessageHandler>,
    close_handler: Option<CloseHandler>,
    tracker: OffsetTracker,
    lifecycle: Lifecycle,
    shutdown: CancellationToken,
    last_commit: Instant,
}

impl<B: Broker> ConsumerWorker<B> {
    pub(crate) fn new(
        config: Arc<ConsumerConfig>,
        broker: B,
        handler: Arc<dyn MessageHandler>,
        close_handler: Option<CloseHandler>,
        lifecycle: Lifecycle,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            config,
            broker,
            handler,
            close_handler,
            tracker: OffsetTracker::new(),
            lifecycle,
            shutdown,
            last_commit: Instant::now(),
        }
    }

    /// Run the consumer until CLOSED. `ready_tx` is completed exactly once:
    /// with `Ok` on entering RUNNING, with the cause if the consumer never did.
    pub(crate) async fn run(mut self, ready_tx: oneshot::Sender<Result<(), FactoryError>>) {
        let topic = self.config.topic().to_string();

        let started = match self.start(&topic).await {
            Ok(()) => ready_tx.send(Ok(())),
            Err(e) => {
                if ready_tx.send(Err(e)).is_err() {
                    debug!("Nobody waits for the failed start");
                }
                return;
            }
        };

        if started.is_err() {
            warn!(%topic, "Consumer creation was abandoned by the caller, closing");
            self.shutdown.cancel();
        }

        let event = self.consume().await;
        let termination = match self.lifecycle.apply(event) {
            Effect::Unwind(termination) => Some(termination),
            _ => None,
        };
        self.shut_down(termination).await;
    }

    async fn start(&mut self, topic: &str) -> Result<(), FactoryError> {
        let timeout = self.config.subscribe_timeout();

        let subscribed = tokio::select! {
            biased;

            _ = self.shutdown.cancelled() => None,

            result = tokio::time::timeout(timeout, self.broker.subscribe(topic, timeout)) => {
                Some(result.unwrap_or_else(|_| Err(BrokerError::Timeout(timeout))))
            }
        };

        let (event, outcome) = match subscribed {
            Some(Ok(())) => (LifecycleEvent::Subscribed, Ok(())),
            Some(Err(e)) => {
                error!(topic, error = ?e, "Failed to subscribe");
                metrics::counter!(CONSUMER_SUBSCRIPTION_FAILURES).increment(1);
                let error = FactoryError::Subscription {
                    topic: topic.to_string(),
                    source: e,
                };
                (LifecycleEvent::SubscriptionFailed, Err(error))
            }
            None => (LifecycleEvent::CloseRequested, Err(FactoryError::ClosedBeforeReady)),
        };

        match self.lifecycle.apply(event) {
            Effect::Ready => outcome,
            Effect::StartFailed => {
                self.broker.close().await;
                outcome
            }
            effect => {
                warn!(?effect, "Unexpected lifecycle effect while starting");
                self.broker.close().await;
                Err(FactoryError::ClosedBeforeReady)
            }
        }
    }

    /// The RUNNING phase. Returns the event that ends it.
    async fn consume(&mut self) -> LifecycleEvent {
        let max_batch_size = self.config.max_batch_size();
        let poll_interval = self.config.poll_interval();

        info!(topic = self.config.topic(), "Starting message consumption");

        loop {
            let polled = tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => {
                    return LifecycleEvent::CloseRequested;
                }

                polled = self.broker.poll(max_batch_size, poll_interval) => polled,
            };

            let records = match polled {
                Ok(records) => records,
                Err(e) => {
                    error!(error = ?e, "Poll failed, closing consumer");
                    metrics::counter!(CONSUMER_POLL_FAILURES).increment(1);
                    return LifecycleEvent::Failed(FailureRecord::Poll(e));
                }
            };

            if !records.is_empty() {
                metrics::histogram!(CONSUMER_BATCH_SIZE).record(records.len() as f64);
                if let Some(event) = self.dispatch_batch(records).await {
                    return event;
                }
            }

            if self.commit_due() {
                if let Err(e) = self.commit_tracked_offsets().await {
                    error!(error = ?e, "Offset commit failed, closing consumer");
                    metrics::counter!(CONSUMER_COMMIT_FAILURES).increment(1);
                    return LifecycleEvent::Failed(FailureRecord::Commit(e));
                }
            }
        }
    }

    /// Hand every record to the message handler in the order the broker
    /// returned them. Stops at the first handler error or close request.
    async fn dispatch_batch(&mut self, records: Vec<Record>) -> Option<LifecycleEvent> {
        for record in records {
            if self.shutdown.is_cancelled() {
                return Some(LifecycleEvent::CloseRequested);
            }

            let partition = record.partition;
            let offset = record.offset;

            if self
                .tracker
                .last_handled(partition)
                .is_some_and(|handled| offset <= handled)
            {
                debug!(partition, offset, "Skipping record that was already handled");
                metrics::counter!(CONSUMER_STALE_RECORDS_SKIPPED).increment(1);
                continue;
            }

            let message = DownstreamMessage::from_record(self.config.tenant_id(), record);
            let handled = AssertUnwindSafe(self.handler.handle(&message))
                .catch_unwind()
                .await
                .unwrap_or_else(|payload| {
                    Err(anyhow!("message handler panicked: {}", panic_message(&*payload)))
                });
            match handled {
                Ok(()) => {
                    self.tracker.mark_handled(partition, offset);
                    metrics::counter!(CONSUMER_MESSAGES_HANDLED).increment(1);
                }
                Err(cause) => {
                    error!(
                        partition,
                        offset,
                        device_id = message.device_id(),
                        error = ?cause,
                        "Message handler failed, no further messages will be consumed"
                    );
                    metrics::counter!(CONSUMER_HANDLER_FAILURES).increment(1);
                    return Some(LifecycleEvent::Failed(FailureRecord::Handler {
                        cause,
                        record: message.into_record(),
                    }));
                }
            }
        }

        None
    }

    fn commit_due(&self) -> bool {
        self.tracker.has_uncommitted() && self.last_commit.elapsed() >= self.config.commit_interval()
    }

    async fn commit_tracked_offsets(&mut self) -> Result<(), BrokerError> {
        let offsets = self.tracker.committable_offsets();
        if offsets.is_empty() {
            return Ok(());
        }

        let started = Instant::now();
        self.broker.commit(&offsets).await?;
        metrics::histogram!(CONSUMER_COMMIT_DURATION_MS)
            .record(started.elapsed().as_millis() as f64);

        self.tracker.mark_committed(&offsets);
        self.last_commit = Instant::now();

        debug!(partitions = offsets.len(), "Committed offsets");
        metrics::counter!(CONSUMER_OFFSETS_COMMITTED).increment(offsets.len() as u64);
        Ok(())
    }

    /// The CLOSING phase: no new poll is issued, handled offsets are committed
    /// if the broker can still be trusted, then the broker is released.
    async fn shut_down(&mut self, termination: Option<Termination>) {
        let (reason, notify) = match termination {
            Some(Termination { reason, notify }) => (Some(reason), notify),
            None => (None, None),
        };

        if reason.is_some_and(|r| r.commits_on_close()) {
            if let Err(e) = self.commit_tracked_offsets().await {
                warn!(error = ?e, "Failed to commit handled offsets while closing");
            }
        }

        self.broker.close().await;
        self.tracker.clear_all();

        // notified before CLOSED is published, so anyone who saw CLOSED also
        // saw the notification
        if let Some(cause) = notify {
            match self.close_handler.take() {
                Some(close_handler) => close_handler(cause),
                None => warn!(error = ?cause, "Consumer failed and no close handler is registered"),
            }
        }

        match self.lifecycle.apply(LifecycleEvent::Unwound) {
            Effect::Released => info!(
                topic = self.config.topic(),
                reason = reason.map(|r| r.as_str()),
                "Consumer closed"
            ),
            effect => warn!(?effect, "Unexpected lifecycle effect while closing"),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}
