//! Broker connection management: transport seam, topology and reconnects.

#[cfg(feature = "amqp")]
pub mod amqp;
pub mod backoff;
pub mod config;
pub mod manager;
pub mod memory;
pub mod state;
pub mod topology;
pub mod transport;

#[cfg(feature = "amqp")]
pub use amqp::AmqpTransport;
pub use backoff::RetryPolicy;
pub use config::{BrokerConfig, ConnectionOptions, RetryConfig};
pub use manager::ConnectionManager;
pub use memory::{InMemoryTransport, PublishedMessage, TopologyOp};
pub use state::{ConnectionState, StateMachine};
pub use transport::{
    BrokerChannel, BrokerConnection, ConnectionError, Delivery, DeliveryStream, ExchangeKind,
    ExchangeOptions, QueueOptions, Transport,
};
