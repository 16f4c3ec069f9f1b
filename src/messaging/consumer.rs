use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::{FutureExt, Stream, StreamExt};
use lapin::{
    Channel,
    acker::Acker,
    options::{BasicAckOptions, BasicConsumeOptions, BasicRejectOptions},
    types::FieldTable,
};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::channel::{ChannelError, ChannelProvider};
use super::connection::{ConnectionError, ConnectionSlot, RabbitMqConnection};
use super::envelope::{Envelope, IncomingMessage};
use super::handler::{HandlerRegistry, MessageHandler};
use super::topology::{Topology, TopologyError};
use crate::config::RabbitMqConfig;
use crate::contracts::{Disposition, ProcessingOutcome};
use crate::metrics::Metrics;

/// One unacknowledged delivery per channel: messages of a queue are
/// processed strictly one at a time, in delivery order.
pub const PREFETCH_COUNT: u16 = 1;

const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Settles a delivery with the broker. Consumed by value, so a delivery can
/// be acknowledged or rejected at most once.
#[async_trait]
pub trait DeliveryHandle: Send + Sized {
    async fn settle(self, disposition: Disposition) -> Result<(), lapin::Error>;
}

#[async_trait]
impl DeliveryHandle for Acker {
    async fn settle(self, disposition: Disposition) -> Result<(), lapin::Error> {
        match disposition {
            Disposition::Ack => self.ack(BasicAckOptions::default()).await.map(drop),
            Disposition::Requeue | Disposition::Discard => self
                .reject(BasicRejectOptions {
                    requeue: disposition.requeue(),
                })
                .await
                .map(drop),
        }
    }
}

/// How a message left the dispatch pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Verdict {
    Handled {
        action: String,
        outcome: ProcessingOutcome,
    },
    ParseFailed,
    NoHandler {
        action: String,
    },
    HandlerFailed {
        action: String,
    },
}

impl Verdict {
    fn disposition(&self) -> Disposition {
        match self {
            Self::Handled { outcome, .. } => Disposition::from(*outcome),
            Self::ParseFailed | Self::NoHandler { .. } | Self::HandlerFailed { .. } => {
                Disposition::Discard
            }
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Self::Handled { outcome, .. } => outcome.as_str(),
            Self::ParseFailed => "parse_error",
            Self::NoHandler { .. } => "no_handler",
            Self::HandlerFailed { .. } => "handler_error",
        }
    }

    fn action(&self) -> &str {
        match self {
            Self::Handled { action, .. }
            | Self::NoHandler { action }
            | Self::HandlerFailed { action } => action,
            Self::ParseFailed => "",
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum SubscriptionEnd {
    Shutdown,
    StreamClosed,
}

/// Pulls task messages from a queue and dispatches them to handlers.
///
/// Handlers are registered through `&mut self` and consumption borrows
/// `&self`, so the registry cannot change while [`Consumer::consume`] runs.
/// [`Consumer::close`] is terminal: a closed consumer stays shut down.
pub struct Consumer {
    config: RabbitMqConfig,
    connection: ConnectionSlot<RabbitMqConnection>,
    handlers: HandlerRegistry,
    shutdown: CancellationToken,
    shutdown_grace: Duration,
    consumer_tag_prefix: String,
    /// Held by [`Consumer::consume`] for as long as it runs.
    running: Mutex<()>,
    metrics: Arc<Metrics>,
}

impl Consumer {
    pub fn new(config: RabbitMqConfig, metrics: Arc<Metrics>) -> Self {
        let consumer_tag_prefix = config
            .connection_name
            .clone()
            .unwrap_or_else(|| "task-broker".to_string());

        Self {
            config,
            connection: ConnectionSlot::new(),
            handlers: HandlerRegistry::new(),
            shutdown: CancellationToken::new(),
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            consumer_tag_prefix,
            running: Mutex::new(()),
            metrics,
        }
    }

    /// How long an in-flight handler may keep running after shutdown is requested.
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub async fn initialize(&self) -> Result<(), ConnectionError> {
        self.connection
            .establish(|| RabbitMqConnection::connect(&self.config))
            .await?;
        info!("RabbitMQ consumer initialized successfully");
        Ok(())
    }

    pub fn register_handler(&mut self, handler: Arc<dyn MessageHandler>) {
        info!(handler = handler.name(), "RabbitMQ consumer registered handler");
        self.handlers.register(handler);
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    /// Cancelling this token stops [`Consumer::consume`].
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Consumes `topology`'s queue until shutdown is requested.
    ///
    /// A delivery stream that ends without a shutdown request is treated as
    /// a lost connection: the connection is re-established and the queue
    /// re-subscribed, up to the configured number of attempts.
    pub async fn consume(&self, topology: &Topology) -> Result<(), ConsumerError> {
        let _running = self.running.lock().await;

        let mut connection = self
            .connection
            .current()
            .await
            .ok_or(ConsumerError::NotInitialized)?;

        if self.handlers.is_empty() {
            warn!(
                queue = %topology.queue_name(),
                "No handlers registered, every message will be rejected"
            );
        }

        loop {
            match self.run_subscription(&connection, topology).await? {
                SubscriptionEnd::Shutdown => return Ok(()),
                SubscriptionEnd::StreamClosed => {}
            }

            match self.reconnect(topology.queue_name()).await? {
                Some(restored) => connection = restored,
                None => return Ok(()),
            }
        }
    }

    /// Cancels the run loop and closes the connection, which also closes
    /// any channel still open on it. Safe to call more than once.
    ///
    /// Waits for a running [`Consumer::consume`] to return first, so an
    /// in-flight message still gets its shutdown grace period and is settled
    /// on a live channel.
    pub async fn close(&self) -> Result<(), ConnectionError> {
        self.shutdown.cancel();
        drop(self.running.lock().await);

        if let Some(connection) = self.connection.take().await {
            connection.shutdown().await?;
            info!("RabbitMQ consumer closed");
        }

        Ok(())
    }

    async fn run_subscription(
        &self,
        connection: &RabbitMqConnection,
        topology: &Topology,
    ) -> Result<SubscriptionEnd, ConsumerError> {
        let channel =
            ChannelProvider::create_consumer_channel(connection.get_connection(), PREFETCH_COUNT)
                .await?;

        let result = self.consume_on(&channel, topology).await;

        if let Err(e) = ChannelProvider::close_channel(&channel).await {
            warn!(error = %e, queue = %topology.queue_name(), "Failed to close consumer channel");
        }

        result
    }

    async fn consume_on(
        &self,
        channel: &Channel,
        topology: &Topology,
    ) -> Result<SubscriptionEnd, ConsumerError> {
        topology.declare(channel).await?;

        let queue_name = topology.queue_name();
        let consumer_tag = format!("{}-{}", self.consumer_tag_prefix, Uuid::new_v4());

        let deliveries = channel
            .basic_consume(
                queue_name,
                &consumer_tag,
                BasicConsumeOptions {
                    no_ack: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                error!(error = %e, queue = %queue_name, "Failed to start consumer");
                ConsumerError::ConsumeFailed(e.to_string())
            })?;

        info!(
            queue = %queue_name,
            consumer_tag = %consumer_tag,
            handlers = ?self.handlers.names(),
            "RabbitMQ consumer started consuming messages"
        );

        let deliveries =
            deliveries.map(|delivery| delivery.map(IncomingMessage::from_delivery));
        Ok(self.run_deliveries(deliveries, queue_name, &consumer_tag).await)
    }

    /// Processes deliveries one at a time, in stream order, until shutdown is
    /// requested or the stream fails or ends. A shutdown request wakes the
    /// loop even while it waits for the next delivery.
    async fn run_deliveries<S, D, E>(
        &self,
        deliveries: S,
        queue_name: &str,
        consumer_tag: &str,
    ) -> SubscriptionEnd
    where
        S: Stream<Item = Result<(IncomingMessage, D), E>>,
        D: DeliveryHandle,
        E: std::fmt::Display,
    {
        tokio::pin!(deliveries);
        self.metrics.active_consumers.inc();

        let end = loop {
            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => {
                    info!(
                        consumer_tag = %consumer_tag,
                        "Shutdown signal received, stopping consumer"
                    );
                    break SubscriptionEnd::Shutdown;
                }

                delivery = deliveries.next() => {
                    match delivery {
                        Some(Ok((message, handle))) => {
                            self.process_delivery(message, handle, queue_name).await;
                        }
                        Some(Err(e)) => {
                            error!(error = %e, queue = %queue_name, "Error receiving message from RabbitMQ");
                            break SubscriptionEnd::StreamClosed;
                        }
                        None => {
                            warn!(queue = %queue_name, "Consumer stream ended");
                            break SubscriptionEnd::StreamClosed;
                        }
                    }
                }
            }
        };

        self.metrics.active_consumers.dec();
        info!(consumer_tag = %consumer_tag, "Consumer stopped");
        end
    }

    /// `Ok(None)` when shutdown was requested while waiting to reconnect.
    async fn reconnect(
        &self,
        queue_name: &str,
    ) -> Result<Option<Arc<RabbitMqConnection>>, ConsumerError> {
        let max_attempts = self.config.reconnect_attempts;

        for attempt in 1..=max_attempts {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return Ok(None),
                _ = tokio::time::sleep(self.config.reconnect_delay) => {}
            }

            match self
                .connection
                .establish(|| RabbitMqConnection::connect(&self.config))
                .await
            {
                Ok(connection) => {
                    info!(queue = %queue_name, attempt, "Consumer connection re-established");
                    return Ok(Some(connection));
                }
                Err(e) => {
                    warn!(
                        error = %e,
                        queue = %queue_name,
                        attempt,
                        max_attempts,
                        "Consumer reconnect attempt failed"
                    );
                }
            }
        }

        error!(queue = %queue_name, max_attempts, "Giving up on consumer connection");
        Err(ConsumerError::ConnectionLost {
            attempts: max_attempts,
        })
    }

    /// Runs one delivery through parse, dispatch and settlement.
    ///
    /// Returns the disposition sent to the broker, or `None` when shutdown
    /// cut the handler off after the grace period and the delivery was left
    /// unacknowledged for the broker to redeliver.
    pub async fn process_delivery<D: DeliveryHandle>(
        &self,
        message: IncomingMessage,
        handle: D,
        queue_name: &str,
    ) -> Option<Disposition> {
        let started = Instant::now();
        let delivery_tag = message.delivery_tag;

        let Some(verdict) = self.within_grace(self.dispatch(&message, queue_name)).await else {
            warn!(
                delivery_tag,
                queue = %queue_name,
                grace_ms = self.shutdown_grace.as_millis() as u64,
                "Shutdown grace period elapsed, leaving message unacknowledged for redelivery"
            );
            return None;
        };

        let disposition = verdict.disposition();
        let elapsed = started.elapsed();
        self.record(&verdict, queue_name, elapsed);

        match handle.settle(disposition).await {
            Ok(()) => {
                let action = verdict.action();
                let duration_ms = elapsed.as_secs_f64() * 1000.0;
                match disposition {
                    Disposition::Ack => info!(
                        delivery_tag, action, duration_ms,
                        "Consumer processed message successfully"
                    ),
                    Disposition::Requeue => info!(
                        delivery_tag, action, duration_ms,
                        "Consumer message requeued for retry"
                    ),
                    Disposition::Discard => warn!(
                        delivery_tag, action, duration_ms,
                        reason = verdict.label(),
                        "Consumer message rejected"
                    ),
                }
            }
            Err(e) => {
                error!(
                    error = %e,
                    delivery_tag,
                    disposition = ?disposition,
                    "Failed to settle message with the broker"
                );
            }
        }

        Some(disposition)
    }

    async fn dispatch(&self, message: &IncomingMessage, queue_name: &str) -> Verdict {
        let delivery_tag = message.delivery_tag;

        let envelope = match Envelope::parse(message, queue_name) {
            Ok(envelope) => envelope,
            Err(e) => {
                error!(
                    error = %e,
                    delivery_tag,
                    queue = %queue_name,
                    body = %message.body_preview(),
                    "Failed to parse message"
                );
                return Verdict::ParseFailed;
            }
        };

        let lookup = std::panic::catch_unwind(AssertUnwindSafe(|| {
            self.handlers.find(&envelope.action)
        }));
        let found = match lookup {
            Ok(found) => found,
            Err(panic) => {
                error!(
                    panic = %panic_message(panic.as_ref()),
                    action = %envelope.action,
                    delivery_tag,
                    "Handler lookup panicked"
                );
                return Verdict::HandlerFailed {
                    action: envelope.action,
                };
            }
        };

        let Some(handler) = found else {
            warn!(
                action = %envelope.action,
                queue = %queue_name,
                delivery_tag,
                "No handler registered for action, skipping message"
            );
            return Verdict::NoHandler {
                action: envelope.action,
            };
        };

        info!(
            action = %envelope.action,
            handler = handler.name(),
            delivery_tag,
            redelivered = envelope.redelivered,
            "Consumer start process message"
        );
        debug!(payload = ?envelope.payload, "Message payload");

        let result = AssertUnwindSafe(handler.handle(&envelope))
            .catch_unwind()
            .await;

        match result {
            Ok(Ok(outcome)) => Verdict::Handled {
                action: envelope.action,
                outcome,
            },
            Ok(Err(e)) => {
                error!(
                    error = %e,
                    action = %envelope.action,
                    handler = handler.name(),
                    payload = ?envelope.payload,
                    "Handler failed to process message"
                );
                Verdict::HandlerFailed {
                    action: envelope.action,
                }
            }
            Err(panic) => {
                error!(
                    panic = %panic_message(panic.as_ref()),
                    action = %envelope.action,
                    handler = handler.name(),
                    payload = ?envelope.payload,
                    "Handler panicked while processing message"
                );
                Verdict::HandlerFailed {
                    action: envelope.action,
                }
            }
        }
    }

    /// Completes `work`, or gives up `shutdown_grace` after shutdown is requested.
    async fn within_grace<F: Future>(&self, work: F) -> Option<F::Output> {
        tokio::pin!(work);

        tokio::select! {
            biased;
            output = &mut work => return Some(output),
            _ = self.shutdown.cancelled() => {}
        }

        info!(
            grace_ms = self.shutdown_grace.as_millis() as u64,
            "Shutdown requested while a message is in flight, waiting for it to finish"
        );
        tokio::time::timeout(self.shutdown_grace, work).await.ok()
    }

    fn record(&self, verdict: &Verdict, queue_name: &str, elapsed: Duration) {
        self.metrics
            .message_processing_duration_seconds
            .with_label_values(&[queue_name, verdict.label()])
            .observe(elapsed.as_secs_f64());

        match verdict.disposition() {
            Disposition::Ack => self
                .metrics
                .messages_acked_total
                .with_label_values(&[queue_name, verdict.action()])
                .inc(),
            Disposition::Requeue => self
                .metrics
                .messages_requeued_total
                .with_label_values(&[queue_name, verdict.action()])
                .inc(),
            Disposition::Discard => self
                .metrics
                .messages_discarded_total
                .with_label_values(&[queue_name, verdict.label()])
                .inc(),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        *s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "Unknown panic payload"
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    #[error("RabbitMQ consumer is not initialized")]
    NotInitialized,

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Topology(#[from] TopologyError),

    #[error("Failed to start consumer: {0}")]
    ConsumeFailed(String),

    #[error("Connection lost and not restored after {attempts} attempts")]
    ConnectionLost { attempts: u32 },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::handler::HandlerError;
    use futures::stream;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone, Default)]
    struct RecordingHandle {
        settled: Arc<Mutex<Vec<Disposition>>>,
    }

    impl RecordingHandle {
        fn settled(&self) -> Vec<Disposition> {
            self.settled.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl DeliveryHandle for RecordingHandle {
        async fn settle(self, disposition: Disposition) -> Result<(), lapin::Error> {
            self.settled.lock().unwrap().push(disposition);
            Ok(())
        }
    }

    enum Behaviour {
        Outcome(ProcessingOutcome),
        Fail,
        Panic,
        Sleep(Duration),
    }

    struct TestHandler {
        name: &'static str,
        actions: &'static [&'static str],
        behaviour: Behaviour,
        calls: Arc<AtomicUsize>,
    }

    impl TestHandler {
        fn new(name: &'static str, actions: &'static [&'static str], behaviour: Behaviour) -> Self {
            Self {
                name,
                actions,
                behaviour,
                calls: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    #[async_trait]
    impl MessageHandler for TestHandler {
        fn name(&self) -> &str {
            self.name
        }

        fn can_handle(&self, action: &str) -> bool {
            self.actions.contains(&action)
        }

        async fn handle(
            &self,
            _envelope: &Envelope,
        ) -> Result<ProcessingOutcome, HandlerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.behaviour {
                Behaviour::Outcome(outcome) => Ok(*outcome),
                Behaviour::Fail => Err(HandlerError::Failed("smtp exploded".to_string())),
                Behaviour::Panic => panic!("handler bug"),
                Behaviour::Sleep(duration) => {
                    tokio::time::sleep(*duration).await;
                    Ok(ProcessingOutcome::Success)
                }
            }
        }
    }

    fn consumer() -> Consumer {
        Consumer::new(
            RabbitMqConfig::new("amqp://localhost:5672"),
            Metrics::new().unwrap(),
        )
    }

    fn consumer_with(handler: TestHandler) -> (Consumer, Arc<AtomicUsize>) {
        let calls = Arc::clone(&handler.calls);
        let mut consumer = consumer();
        consumer.register_handler(Arc::new(handler));
        (consumer, calls)
    }

    fn message(body: &str) -> IncomingMessage {
        IncomingMessage {
            body: body.as_bytes().to_vec(),
            routing_key: "p_email".to_string(),
            delivery_tag: 1,
            ..Default::default()
        }
    }

    const EMAIL_BODY: &str =
        r#"{"action":"send_email","to":"a@b.com","subject":"hi","body":"hello"}"#;

    #[tokio::test]
    async fn test_success_acks_once() {
        let (consumer, calls) = consumer_with(TestHandler::new(
            "email",
            &["send_email"],
            Behaviour::Outcome(ProcessingOutcome::Success),
        ));
        let handle = RecordingHandle::default();

        let disposition = consumer
            .process_delivery(message(EMAIL_BODY), handle.clone(), "p_email")
            .await;

        assert_eq!(disposition, Some(Disposition::Ack));
        assert_eq!(handle.settled(), vec![Disposition::Ack]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            consumer
                .metrics
                .messages_acked_total
                .with_label_values(&["p_email", "send_email"])
                .get(),
            1.0
        );
    }

    #[tokio::test]
    async fn test_retry_requeues_once() {
        let (consumer, _) = consumer_with(TestHandler::new(
            "email",
            &["send_email"],
            Behaviour::Outcome(ProcessingOutcome::Retry),
        ));
        let handle = RecordingHandle::default();

        consumer
            .process_delivery(message(EMAIL_BODY), handle.clone(), "p_email")
            .await;

        assert_eq!(handle.settled(), vec![Disposition::Requeue]);
        assert!(handle.settled()[0].requeue());
    }

    #[tokio::test]
    async fn test_reject_outcome_discards() {
        let (consumer, _) = consumer_with(TestHandler::new(
            "email",
            &["send_email"],
            Behaviour::Outcome(ProcessingOutcome::Reject),
        ));
        let handle = RecordingHandle::default();

        consumer
            .process_delivery(message(EMAIL_BODY), handle.clone(), "p_email")
            .await;

        assert_eq!(handle.settled(), vec![Disposition::Discard]);
    }

    #[tokio::test]
    async fn test_unknown_action_discards_without_invoking_handlers() {
        let (consumer, calls) = consumer_with(TestHandler::new(
            "email",
            &["send_email"],
            Behaviour::Outcome(ProcessingOutcome::Success),
        ));
        let handle = RecordingHandle::default();

        consumer
            .process_delivery(message(r#"{"action":"resize_image"}"#), handle.clone(), "p_email")
            .await;

        assert_eq!(handle.settled(), vec![Disposition::Discard]);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(
            consumer
                .metrics
                .messages_discarded_total
                .with_label_values(&["p_email", "no_handler"])
                .get(),
            1.0
        );
    }

    #[tokio::test]
    async fn test_handler_error_discards_once() {
        let (consumer, calls) =
            consumer_with(TestHandler::new("email", &["send_email"], Behaviour::Fail));
        let handle = RecordingHandle::default();

        consumer
            .process_delivery(message(EMAIL_BODY), handle.clone(), "p_email")
            .await;

        assert_eq!(handle.settled(), vec![Disposition::Discard]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_handler_panic_discards_once() {
        let (consumer, _) =
            consumer_with(TestHandler::new("email", &["send_email"], Behaviour::Panic));
        let handle = RecordingHandle::default();

        let disposition = consumer
            .process_delivery(message(EMAIL_BODY), handle.clone(), "p_email")
            .await;

        assert_eq!(disposition, Some(Disposition::Discard));
        assert_eq!(handle.settled(), vec![Disposition::Discard]);
        assert_eq!(
            consumer
                .metrics
                .messages_discarded_total
                .with_label_values(&["p_email", "handler_error"])
                .get(),
            1.0
        );
    }

    #[tokio::test]
    async fn test_invalid_json_discards_without_invoking_handlers() {
        let (consumer, calls) = consumer_with(TestHandler::new(
            "email",
            &["send_email"],
            Behaviour::Outcome(ProcessingOutcome::Success),
        ));
        let handle = RecordingHandle::default();

        consumer
            .process_delivery(message("{not json"), handle.clone(), "p_email")
            .await;

        assert_eq!(handle.settled(), vec![Disposition::Discard]);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_first_registered_handler_wins() {
        let first = TestHandler::new("h1", &["x"], Behaviour::Outcome(ProcessingOutcome::Success));
        let second = TestHandler::new(
            "h2",
            &["x", "y"],
            Behaviour::Outcome(ProcessingOutcome::Reject),
        );
        let first_calls = Arc::clone(&first.calls);
        let second_calls = Arc::clone(&second.calls);

        let mut consumer = consumer();
        consumer.register_handler(Arc::new(first));
        consumer.register_handler(Arc::new(second));

        let handle = RecordingHandle::default();
        consumer
            .process_delivery(message(r#"{"action":"x"}"#), handle.clone(), "q")
            .await;

        assert_eq!(handle.settled(), vec![Disposition::Ack]);
        assert_eq!(first_calls.load(Ordering::SeqCst), 1);
        assert_eq!(second_calls.load(Ordering::SeqCst), 0);

        let handle = RecordingHandle::default();
        consumer
            .process_delivery(message(r#"{"action":"y"}"#), handle.clone(), "q")
            .await;
        assert_eq!(handle.settled(), vec![Disposition::Discard]);
        assert_eq!(second_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_same_body_twice_is_processed_twice() {
        let (consumer, calls) = consumer_with(TestHandler::new(
            "email",
            &["send_email"],
            Behaviour::Outcome(ProcessingOutcome::Success),
        ));
        let first = RecordingHandle::default();
        let second = RecordingHandle::default();

        consumer
            .process_delivery(message(EMAIL_BODY), first.clone(), "p_email")
            .await;
        consumer
            .process_delivery(
                IncomingMessage {
                    delivery_tag: 2,
                    ..message(EMAIL_BODY)
                },
                second.clone(),
                "p_email",
            )
            .await;

        assert_eq!(first.settled(), vec![Disposition::Ack]);
        assert_eq!(second.settled(), vec![Disposition::Ack]);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_in_flight_message_finishes_within_grace() {
        let (consumer, _) = consumer_with(TestHandler::new(
            "slow",
            &["send_email"],
            Behaviour::Sleep(Duration::from_millis(20)),
        ));
        let consumer = consumer.with_shutdown_grace(Duration::from_secs(5));
        consumer.shutdown_token().cancel();

        let handle = RecordingHandle::default();
        let disposition = consumer
            .process_delivery(message(EMAIL_BODY), handle.clone(), "p_email")
            .await;

        assert_eq!(disposition, Some(Disposition::Ack));
        assert_eq!(handle.settled(), vec![Disposition::Ack]);
    }

    #[tokio::test]
    async fn test_in_flight_message_left_unacked_after_grace() {
        let (consumer, _) = consumer_with(TestHandler::new(
            "stuck",
            &["send_email"],
            Behaviour::Sleep(Duration::from_secs(30)),
        ));
        let consumer = consumer.with_shutdown_grace(Duration::from_millis(20));
        consumer.shutdown_token().cancel();

        let handle = RecordingHandle::default();
        let disposition = consumer
            .process_delivery(message(EMAIL_BODY), handle.clone(), "p_email")
            .await;

        assert_eq!(disposition, None);
        assert!(handle.settled().is_empty());
    }

    #[tokio::test]
    async fn test_consume_requires_initialization() {
        let consumer = consumer();
        let result = consumer
            .consume(&Topology::direct("p_email", "p_email_exchange"))
            .await;
        assert!(matches!(result, Err(ConsumerError::NotInitialized)));
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_cancels() {
        let consumer = consumer();
        let token = consumer.shutdown_token();

        assert!(consumer.close().await.is_ok());
        assert!(consumer.close().await.is_ok());
        assert!(token.is_cancelled());
    }

    struct PanickingPredicate;

    #[async_trait]
    impl MessageHandler for PanickingPredicate {
        fn name(&self) -> &str {
            "broken-predicate"
        }

        fn can_handle(&self, _action: &str) -> bool {
            panic!("predicate bug")
        }

        async fn handle(&self, _envelope: &Envelope) -> Result<ProcessingOutcome, HandlerError> {
            Ok(ProcessingOutcome::Success)
        }
    }

    #[tokio::test]
    async fn test_panicking_can_handle_discards_once() {
        let mut consumer = consumer();
        consumer.register_handler(Arc::new(PanickingPredicate));
        let handle = RecordingHandle::default();

        let disposition = consumer
            .process_delivery(message(r#"{"action":"x"}"#), handle.clone(), "q")
            .await;

        assert_eq!(disposition, Some(Disposition::Discard));
        assert_eq!(handle.settled(), vec![Disposition::Discard]);
        assert_eq!(
            consumer
                .metrics
                .messages_discarded_total
                .with_label_values(&["q", "handler_error"])
                .get(),
            1.0
        );
    }

    /// Records the delivery tags it sees, in order.
    #[derive(Default)]
    struct OrderHandler {
        seen: Arc<Mutex<Vec<u64>>>,
    }

    #[async_trait]
    impl MessageHandler for OrderHandler {
        fn name(&self) -> &str {
            "order"
        }

        fn can_handle(&self, _action: &str) -> bool {
            true
        }

        async fn handle(&self, envelope: &Envelope) -> Result<ProcessingOutcome, HandlerError> {
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.seen.lock().unwrap().push(envelope.delivery_tag);
            Ok(ProcessingOutcome::Success)
        }
    }

    #[tokio::test]
    async fn test_shutdown_wakes_loop_waiting_for_delivery() {
        let consumer = consumer();
        let token = consumer.shutdown_token();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel();
        });

        let deliveries = stream::pending::<Result<(IncomingMessage, RecordingHandle), String>>();
        let end = tokio::time::timeout(
            Duration::from_secs(5),
            consumer.run_deliveries(deliveries, "p_email", "tag"),
        )
        .await
        .expect("loop did not observe shutdown");

        assert_eq!(end, SubscriptionEnd::Shutdown);
        assert_eq!(consumer.metrics.active_consumers.get(), 0.0);
    }

    #[tokio::test]
    async fn test_deliveries_settled_in_order() {
        let handler = OrderHandler::default();
        let seen = Arc::clone(&handler.seen);
        let mut consumer = consumer();
        consumer.register_handler(Arc::new(handler));

        let handle = RecordingHandle::default();
        let deliveries = (1..=3u64)
            .map(|tag| {
                let message = IncomingMessage {
                    delivery_tag: tag,
                    ..message(r#"{"action":"send_email"}"#)
                };
                Ok::<_, String>((message, handle.clone()))
            })
            .collect::<Vec<_>>();

        let end = consumer
            .run_deliveries(stream::iter(deliveries), "p_email", "tag")
            .await;

        assert_eq!(end, SubscriptionEnd::StreamClosed);
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
        assert_eq!(handle.settled(), vec![Disposition::Ack; 3]);
    }

    #[tokio::test]
    async fn test_stream_error_ends_loop_after_earlier_deliveries() {
        let (consumer, calls) = consumer_with(TestHandler::new(
            "email",
            &["send_email"],
            Behaviour::Outcome(ProcessingOutcome::Success),
        ));
        let handle = RecordingHandle::default();

        let deliveries = vec![
            Ok((message(EMAIL_BODY), handle.clone())),
            Err("channel closed".to_string()),
            Ok((message(EMAIL_BODY), handle.clone())),
        ];
        let end = consumer
            .run_deliveries(stream::iter(deliveries), "p_email", "tag")
            .await;

        assert_eq!(end, SubscriptionEnd::StreamClosed);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(handle.settled(), vec![Disposition::Ack]);
    }

    #[tokio::test]
    async fn test_close_waits_for_running_consume() {
        let consumer = Arc::new(consumer());
        let token = consumer.shutdown_token();

        // Stands in for a consume call that is still draining.
        let running = consumer.running.lock().await;
        let closer = tokio::spawn({
            let consumer = Arc::clone(&consumer);
            async move { consumer.close().await }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(token.is_cancelled());
        assert!(!closer.is_finished());

        drop(running);
        assert!(closer.await.unwrap().is_ok());
    }
}
