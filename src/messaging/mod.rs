pub mod channel;
pub mod connection;
pub mod consumer;
pub mod envelope;
pub mod handler;
pub mod publisher;
pub mod topology;
pub mod worker;

pub use channel::{ChannelError, ChannelProvider};
pub use connection::{ConnectionError, ConnectionSlot, RabbitMqConnection};
pub use consumer::{Consumer, ConsumerError, DeliveryHandle};
pub use envelope::{Envelope, IncomingMessage, ParseError};
pub use handler::{HandlerError, HandlerRegistry, MessageHandler};
pub use publisher::{BatchReport, MessageBody, PublishOptions, Publisher, PublisherError};
pub use topology::{ExchangeConfig, QueueConfig, Topology, TopologyError};
pub use worker::{Worker, WorkerError};
