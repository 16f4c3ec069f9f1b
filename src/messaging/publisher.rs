use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures::future::join_all;
use lapin::{BasicProperties, Channel, options::BasicPublishOptions, types::FieldTable};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::channel::{ChannelError, ChannelProvider};
use super::connection::{ConnectionError, ConnectionSlot, RabbitMqConnection};
use super::envelope::ACTION_FIELD;
use super::topology::{Topology, TopologyError};
use crate::config::RabbitMqConfig;
use crate::metrics::Metrics;

pub const DELIVERY_MODE_TRANSIENT: u8 = 1;
pub const DELIVERY_MODE_PERSISTENT: u8 = 2;
pub const DEFAULT_CONTENT_TYPE: &str = "application/json";

/// Outbound message body.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageBody {
    /// Serialized as a JSON object; gets the `action` field when one is given.
    Json(Map<String, Value>),
    /// Sent as-is.
    Text(String),
    /// Sent as-is.
    Bytes(Vec<u8>),
}

impl MessageBody {
    /// Serializes `value`, which must serialize to a JSON object.
    pub fn json<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        match serde_json::to_value(value)? {
            Value::Object(map) => Ok(Self::Json(map)),
            _ => Err(<serde_json::Error as serde::ser::Error>::custom(
                "message body must serialize to a JSON object",
            )),
        }
    }

    pub fn encode(self, action: Option<&str>) -> Result<Vec<u8>, serde_json::Error> {
        match self {
            Self::Json(mut map) => {
                if let Some(action) = action {
                    map.insert(ACTION_FIELD.to_string(), Value::String(action.to_string()));
                }
                serde_json::to_vec(&map)
            }
            Self::Text(text) => Ok(text.into_bytes()),
            Self::Bytes(bytes) => Ok(bytes),
        }
    }
}

impl From<Map<String, Value>> for MessageBody {
    fn from(map: Map<String, Value>) -> Self {
        Self::Json(map)
    }
}

impl From<String> for MessageBody {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for MessageBody {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<Vec<u8>> for MessageBody {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Bytes(bytes)
    }
}

#[derive(Debug, Clone)]
pub struct PublishOptions {
    pub action: Option<String>,
    /// Defaults to the queue name.
    pub routing_key: Option<String>,
    pub priority: u8,
    pub expiration: Option<Duration>,
    pub headers: FieldTable,
    /// Durable topology and persistent delivery when `true`, transient otherwise.
    pub durable: bool,
    pub content_type: String,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            action: None,
            routing_key: None,
            priority: 0,
            expiration: None,
            headers: FieldTable::default(),
            durable: true,
            content_type: DEFAULT_CONTENT_TYPE.to_string(),
        }
    }
}

impl PublishOptions {
    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    pub fn with_routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = Some(routing_key.into());
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_expiration(mut self, expiration: Duration) -> Self {
        self.expiration = Some(expiration);
        self
    }

    pub fn with_headers(mut self, headers: FieldTable) -> Self {
        self.headers = headers;
        self
    }

    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn delivery_mode(&self) -> u8 {
        if self.durable {
            DELIVERY_MODE_PERSISTENT
        } else {
            DELIVERY_MODE_TRANSIENT
        }
    }

    pub fn topology(&self, queue_name: &str, exchange_name: &str) -> Topology {
        let topology = Topology::direct(queue_name, exchange_name).durable(self.durable);
        match &self.routing_key {
            Some(key) => topology.routing_key(key.clone()),
            None => topology,
        }
    }

    /// AMQP properties for one message. Every call gets a fresh message id.
    pub fn properties(&self) -> BasicProperties {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or_default();

        let properties = BasicProperties::default()
            .with_delivery_mode(self.delivery_mode())
            .with_content_type(self.content_type.clone().into())
            .with_priority(self.priority)
            .with_headers(self.headers.clone())
            .with_timestamp(timestamp)
            .with_message_id(Uuid::new_v4().to_string().into());

        match self.expiration {
            Some(ttl) => properties.with_expiration(ttl.as_millis().to_string().into()),
            None => properties,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub success: usize,
    pub failed: usize,
}

impl BatchReport {
    pub fn from_results<I>(results: I) -> Self
    where
        I: IntoIterator<Item = Result<bool, PublisherError>>,
    {
        results
            .into_iter()
            .fold(Self::default(), |mut report, result| {
                match result {
                    Ok(true) => report.success += 1,
                    Ok(false) | Err(_) => report.failed += 1,
                }
                report
            })
    }

    pub fn total(&self) -> usize {
        self.success + self.failed
    }
}

/// Publishes task messages over one owned connection.
///
/// Broker-side failures never surface as errors from [`Publisher::publish`]:
/// they are logged and reported as `Ok(false)`.
pub struct Publisher {
    config: RabbitMqConfig,
    connection: ConnectionSlot<RabbitMqConnection>,
    metrics: Arc<Metrics>,
}

impl Publisher {
    pub fn new(config: RabbitMqConfig, metrics: Arc<Metrics>) -> Self {
        Self {
            config,
            connection: ConnectionSlot::new(),
            metrics,
        }
    }

    pub async fn initialize(&self) -> Result<(), ConnectionError> {
        self.connection
            .establish(|| RabbitMqConnection::connect(&self.config))
            .await?;
        info!("RabbitMQ publisher initialized successfully");
        Ok(())
    }

    pub async fn close(&self) -> Result<(), ConnectionError> {
        if let Some(connection) = self.connection.take().await {
            connection.shutdown().await?;
            info!("RabbitMQ publisher closed");
        }
        Ok(())
    }

    pub async fn is_connected(&self) -> bool {
        self.connection.is_alive().await
    }

    pub async fn publish(
        &self,
        queue_name: &str,
        exchange_name: &str,
        body: impl Into<MessageBody>,
        options: &PublishOptions,
    ) -> Result<bool, PublisherError> {
        let outcome = match self.live_connection().await {
            Err(PublisherError::NotInitialized) => return Err(PublisherError::NotInitialized),
            Err(e) => Err(e),
            Ok(connection) => {
                self.try_publish(&connection, queue_name, exchange_name, body.into(), options)
                    .await
            }
        };

        match outcome {
            Ok(()) => {
                self.metrics
                    .messages_published_total
                    .with_label_values(&[queue_name])
                    .inc();
                info!(
                    queue = %queue_name,
                    exchange = %exchange_name,
                    action = options.action.as_deref().unwrap_or_default(),
                    durable = options.durable,
                    "Message sent to queue"
                );
                Ok(true)
            }
            Err(e) => {
                self.metrics
                    .publish_failures_total
                    .with_label_values(&[queue_name])
                    .inc();
                error!(
                    error = %e,
                    queue = %queue_name,
                    exchange = %exchange_name,
                    action = options.action.as_deref().unwrap_or_default(),
                    "Failed to send message"
                );
                Ok(false)
            }
        }
    }

    /// Publishes every body concurrently. Neither order nor atomicity is
    /// guaranteed; one failure does not affect the others.
    pub async fn publish_batch<I, B>(
        &self,
        queue_name: &str,
        exchange_name: &str,
        bodies: I,
        options: &PublishOptions,
    ) -> Result<BatchReport, PublisherError>
    where
        I: IntoIterator<Item = B>,
        B: Into<MessageBody>,
    {
        if self.connection.current().await.is_none() {
            return Err(PublisherError::NotInitialized);
        }

        let publishes = bodies
            .into_iter()
            .map(|body| self.publish(queue_name, exchange_name, body, options));
        let report = BatchReport::from_results(join_all(publishes).await);

        info!(
            queue = %queue_name,
            success = report.success,
            failed = report.failed,
            "Batch publish finished"
        );

        Ok(report)
    }

    /// Reconnects a connection that dropped since `initialize`.
    async fn live_connection(&self) -> Result<Arc<RabbitMqConnection>, PublisherError> {
        let current = self
            .connection
            .current()
            .await
            .ok_or(PublisherError::NotInitialized)?;

        if current.is_connected() {
            return Ok(current);
        }

        warn!(endpoint = %current.endpoint(), "Publisher connection lost, reconnecting");
        let connection = self
            .connection
            .establish(|| RabbitMqConnection::connect(&self.config))
            .await?;
        Ok(connection)
    }

    async fn try_publish(
        &self,
        connection: &RabbitMqConnection,
        queue_name: &str,
        exchange_name: &str,
        body: MessageBody,
        options: &PublishOptions,
    ) -> Result<(), PublisherError> {
        let payload = body.encode(options.action.as_deref())?;
        let topology = options.topology(queue_name, exchange_name);

        let channel = ChannelProvider::create_publisher_channel(connection.get_connection()).await?;
        let result = Self::publish_on(&channel, &topology, &payload, options).await;

        if let Err(e) = ChannelProvider::close_channel(&channel).await {
            warn!(error = %e, queue = %queue_name, "Failed to release publisher channel");
        }

        result
    }

    async fn publish_on(
        channel: &Channel,
        topology: &Topology,
        payload: &[u8],
        options: &PublishOptions,
    ) -> Result<(), PublisherError> {
        topology.declare(channel).await?;

        let confirmation = channel
            .basic_publish(
                topology.exchange_name(),
                &topology.routing_key,
                BasicPublishOptions::default(),
                payload,
                options.properties(),
            )
            .await?
            .await?;

        if confirmation.is_nack() {
            return Err(PublisherError::Nacked);
        }

        debug!(
            exchange = %topology.exchange_name(),
            routing_key = %topology.routing_key,
            payload_size = payload.len(),
            "Publish confirmed"
        );

        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PublisherError {
    #[error("Publisher not initialized")]
    NotInitialized,

    #[error("Failed to re-establish connection: {0}")]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Topology(#[from] TopologyError),

    #[error("Failed to encode message body: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Broker rejected publish: {0}")]
    Publish(#[from] lapin::Error),

    #[error("Broker nacked the message")]
    Nacked,
}
