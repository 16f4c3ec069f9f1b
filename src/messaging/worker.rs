use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::connection::ConnectionError;
use super::consumer::{Consumer, ConsumerError};
use super::handler::MessageHandler;
use super::topology::Topology;

/// Runs one [`Consumer`] with a fixed handler set for a single queue/exchange pair.
pub struct Worker {
    consumer: Consumer,
    topology: Topology,
}

impl Worker {
    /// Durable, non-exclusive, non-auto-delete topology for `queue` on `exchange`.
    pub fn new(consumer: Consumer, queue: impl Into<String>, exchange: impl Into<String>) -> Self {
        let topology = Topology::direct(queue, exchange)
            .durable(true)
            .exclusive(false)
            .auto_delete(false);
        Self::with_topology(consumer, topology)
    }

    pub fn with_topology(consumer: Consumer, topology: Topology) -> Self {
        Self { consumer, topology }
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.consumer.shutdown_token()
    }

    /// Connects the consumer, then registers `handlers` in order.
    pub async fn initialize(
        &mut self,
        handlers: Vec<Arc<dyn MessageHandler>>,
    ) -> Result<(), WorkerError> {
        self.consumer.initialize().await?;
        for handler in handlers {
            self.consumer.register_handler(handler);
        }

        info!(
            queue = %self.topology.queue_name(),
            exchange = %self.topology.exchange_name(),
            handlers = self.consumer.handlers().len(),
            "RabbitMQ worker initialized successfully"
        );
        Ok(())
    }

    /// Consumes until shutdown, then stops the worker. `stop` runs on every
    /// exit path, including a failed consume.
    pub async fn start(&mut self) -> Result<(), WorkerError> {
        info!(queue = %self.topology.queue_name(), "Starting RabbitMQ worker");

        let result = self.consumer.consume(&self.topology).await;

        if let Err(e) = &result {
            error!(error = %e, queue = %self.topology.queue_name(), "RabbitMQ worker failed");
        }

        let stopped = self.stop().await;
        result?;
        stopped
    }

    pub async fn stop(&mut self) -> Result<(), WorkerError> {
        self.consumer.close().await?;
        info!(queue = %self.topology.queue_name(), "RabbitMQ worker stopped successfully");
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Consumer(#[from] ConsumerError),
}
