use std::future::Future;
use std::sync::Arc;

use lapin::{Connection, ConnectionProperties, uri::AMQPUri};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::config::RabbitMqConfig;

pub struct RabbitMqConnection {
    connection: Connection,
    endpoint: String,
}

impl RabbitMqConnection {
    pub async fn connect(config: &RabbitMqConfig) -> Result<Self, ConnectionError> {
        let mut uri: AMQPUri = config.url.parse().map_err(|e: String| {
            error!(error = %e, "Invalid RabbitMQ URL");
            ConnectionError::InvalidUrl(e)
        })?;
        uri.query.heartbeat = Some(config.heartbeat);

        // Credentials stay out of the logs.
        let endpoint = format!(
            "{}:{}/{}",
            uri.authority.host, uri.authority.port, uri.vhost
        );
        info!(endpoint = %endpoint, heartbeat = config.heartbeat, "Connecting to RabbitMQ");

        let mut properties = ConnectionProperties::default();
        if let Some(name) = &config.connection_name {
            properties = properties.with_connection_name(name.clone().into());
        }

        let connection =
            tokio::time::timeout(config.connection_timeout, Connection::connect_uri(uri, properties))
                .await
                .map_err(|_| {
                    error!(
                        endpoint = %endpoint,
                        timeout_secs = config.connection_timeout.as_secs(),
                        "Timed out connecting to RabbitMQ"
                    );
                    ConnectionError::Timeout(config.connection_timeout.as_secs())
                })?
                .map_err(|e| {
                    error!(error = %e, endpoint = %endpoint, "Failed to connect to RabbitMQ");
                    ConnectionError::ConnectionFailed(e.to_string())
                })?;

        info!(endpoint = %endpoint, "Successfully connected to RabbitMQ");

        Ok(Self {
            connection,
            endpoint,
        })
    }

    pub fn get_connection(&self) -> &Connection {
        &self.connection
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn is_connected(&self) -> bool {
        self.connection.status().connected()
    }

    pub async fn shutdown(&self) -> Result<(), ConnectionError> {
        if !self.is_connected() {
            return Ok(());
        }

        info!(endpoint = %self.endpoint, "Shutting down RabbitMQ connection");

        self.connection
            .close(200, "Normal shutdown")
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to close RabbitMQ connection gracefully");
                ConnectionError::ShutdownFailed(e.to_string())
            })?;

        info!("RabbitMQ connection closed successfully");
        Ok(())
    }
}

impl Liveness for RabbitMqConnection {
    fn is_alive(&self) -> bool {
        self.is_connected()
    }
}

pub trait Liveness {
    fn is_alive(&self) -> bool;
}

/// Holds the single connection owned by a publisher or consumer.
///
/// `establish` connects at most once while the held connection is alive and
/// replaces it when the transport reports it dead.
pub struct ConnectionSlot<C> {
    inner: Mutex<Option<Arc<C>>>,
}

impl<C: Liveness> ConnectionSlot<C> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }

    pub async fn establish<F, Fut, E>(&self, connect: F) -> Result<Arc<C>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<C, E>>,
    {
        let mut slot = self.inner.lock().await;
        if let Some(existing) = slot.as_ref() {
            if existing.is_alive() {
                return Ok(Arc::clone(existing));
            }
            warn!("Held connection is no longer alive, reconnecting");
        }

        let connection = Arc::new(connect().await?);
        *slot = Some(Arc::clone(&connection));
        Ok(connection)
    }

    /// The held connection, alive or not. `None` until first established.
    pub async fn current(&self) -> Option<Arc<C>> {
        self.inner.lock().await.clone()
    }

    pub async fn take(&self) -> Option<Arc<C>> {
        self.inner.lock().await.take()
    }

    pub async fn is_alive(&self) -> bool {
        self.inner
            .lock()
            .await
            .as_ref()
            .is_some_and(|connection| connection.is_alive())
    }
}

impl<C: Liveness> Default for ConnectionSlot<C> {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Invalid RabbitMQ URL: {0}")]
    InvalidUrl(String),

    #[error("Failed to connect to RabbitMQ: {0}")]
    ConnectionFailed(String),

    #[error("Timed out connecting to RabbitMQ after {0}s")]
    Timeout(u64),

    #[error("Failed to shutdown connection gracefully: {0}")]
    ShutdownFailed(String),
}
