use lapin::{
    Channel, ExchangeKind,
    options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions},
    types::FieldTable,
};
use tracing::{error, info};

/// Direct exchange descriptor. Only direct routing is used.
#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeConfig {
    pub name: String,
    pub durable: bool,
    pub auto_delete: bool,
    pub internal: bool,
    pub arguments: FieldTable,
}

impl ExchangeConfig {
    pub fn direct(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            auto_delete: false,
            internal: false,
            arguments: FieldTable::default(),
        }
    }

    fn declare_options(&self) -> ExchangeDeclareOptions {
        ExchangeDeclareOptions {
            durable: self.durable,
            auto_delete: self.auto_delete,
            internal: self.internal,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueueConfig {
    pub name: String,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    pub arguments: FieldTable,
}

impl QueueConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            exclusive: false,
            auto_delete: false,
            arguments: FieldTable::default(),
        }
    }

    fn declare_options(&self) -> QueueDeclareOptions {
        QueueDeclareOptions {
            durable: self.durable,
            exclusive: self.exclusive,
            auto_delete: self.auto_delete,
            ..Default::default()
        }
    }
}

/// Exchange, queue and the binding between them.
///
/// Publisher and consumer must declare the same topology for a queue: the
/// broker refuses a redeclaration whose flags differ.
#[derive(Debug, Clone, PartialEq)]
pub struct Topology {
    pub exchange: ExchangeConfig,
    pub queue: QueueConfig,
    pub routing_key: String,
}

impl Topology {
    /// Durable direct exchange bound to a durable queue by the queue name.
    pub fn direct(queue: impl Into<String>, exchange: impl Into<String>) -> Self {
        let queue = QueueConfig::new(queue);
        Self {
            routing_key: queue.name.clone(),
            exchange: ExchangeConfig::direct(exchange),
            queue,
        }
    }

    pub fn durable(mut self, durable: bool) -> Self {
        self.exchange.durable = durable;
        self.queue.durable = durable;
        self
    }

    pub fn exclusive(mut self, exclusive: bool) -> Self {
        self.queue.exclusive = exclusive;
        self
    }

    pub fn auto_delete(mut self, auto_delete: bool) -> Self {
        self.exchange.auto_delete = auto_delete;
        self.queue.auto_delete = auto_delete;
        self
    }

    pub fn routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = routing_key.into();
        self
    }

    pub fn queue_arguments(mut self, arguments: FieldTable) -> Self {
        self.queue.arguments = arguments;
        self
    }

    pub fn queue_name(&self) -> &str {
        &self.queue.name
    }

    pub fn exchange_name(&self) -> &str {
        &self.exchange.name
    }

    /// Declares the exchange and queue and binds them.
    pub async fn declare(&self, channel: &Channel) -> Result<(), TopologyError> {
        channel
            .exchange_declare(
                &self.exchange.name,
                ExchangeKind::Direct,
                self.exchange.declare_options(),
                self.exchange.arguments.clone(),
            )
            .await
            .map_err(|e| {
                error!(error = %e, exchange = %self.exchange.name, "Failed to declare exchange");
                TopologyError::ExchangeDeclareFailed(e.to_string())
            })?;

        channel
            .queue_declare(
                &self.queue.name,
                self.queue.declare_options(),
                self.queue.arguments.clone(),
            )
            .await
            .map_err(|e| {
                error!(error = %e, queue = %self.queue.name, "Failed to declare queue");
                TopologyError::QueueDeclareFailed(e.to_string())
            })?;

        channel
            .queue_bind(
                &self.queue.name,
                &self.exchange.name,
                &self.routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                error!(
                    error = %e,
                    queue = %self.queue.name,
                    exchange = %self.exchange.name,
                    "Failed to bind queue"
                );
                TopologyError::BindFailed(e.to_string())
            })?;

        info!(
            exchange = %self.exchange.name,
            queue = %self.queue.name,
            routing_key = %self.routing_key,
            durable = self.queue.durable,
            "Queue topology configured"
        );

        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TopologyError {
    #[error("Failed to declare exchange: {0}")]
    ExchangeDeclareFailed(String),

    #[error("Failed to declare queue: {0}")]
    QueueDeclareFailed(String),

    #[error("Failed to bind queue: {0}")]
    BindFailed(String),
}
