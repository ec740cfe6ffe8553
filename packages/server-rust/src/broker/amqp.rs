//! AMQP 0-9-1 transport backed by `lapin`.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::future;
use futures_util::StreamExt;
use lapin::options::{
    BasicConsumeOptions, BasicPublishOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tokio::sync::watch;
use tracing::warn;

use super::config::ConnectionOptions;
use super::transport::{
    BrokerChannel, BrokerConnection, ConnectionError, Delivery, DeliveryStream, ExchangeKind,
    ExchangeOptions, QueueOptions, Transport,
};

/// AMQP reply code for a normal client-initiated close.
const REPLY_SUCCESS: u16 = 200;

/// Opens real broker connections.
#[derive(Debug, Clone, Copy, Default)]
pub struct AmqpTransport;

impl AmqpTransport {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for AmqpTransport {
    async fn connect(
        &self,
        options: &ConnectionOptions,
    ) -> Result<Arc<dyn BrokerConnection>, ConnectionError> {
        let properties = ConnectionProperties {
            locale: options.locale.clone(),
            ..ConnectionProperties::default()
        };
        let connection = Connection::connect(&options.uri(), properties)
            .await
            .map_err(|e| ConnectionError::Connect(e.to_string()))?;

        let (closed_tx, _closed_rx) = watch::channel(None);
        let closed_tx = Arc::new(closed_tx);
        let on_error = Arc::clone(&closed_tx);
        connection.on_error(move |err| {
            on_error.send_replace(Some(ConnectionError::Closed(err.to_string())));
        });

        Ok(Arc::new(AmqpConnection {
            connection,
            closed_tx,
        }))
    }
}

struct AmqpConnection {
    connection: Connection,
    closed_tx: Arc<watch::Sender<Option<ConnectionError>>>,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, ConnectionError> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| ConnectionError::Channel(e.to_string()))?;
        Ok(Arc::new(AmqpChannel { channel }))
    }

    async fn closed(&self) -> ConnectionError {
        let mut rx = self.closed_tx.subscribe();
        loop {
            if let Some(err) = rx.borrow_and_update().clone() {
                return err;
            }
            if rx.changed().await.is_err() {
                return ConnectionError::Closed("connection dropped".to_string());
            }
        }
    }

    async fn close(&self) -> Result<(), ConnectionError> {
        self.closed_tx
            .send_replace(Some(ConnectionError::Closed("closed by client".to_string())));
        self.connection
            .close(REPLY_SUCCESS, "shutdown")
            .await
            .map_err(|e| ConnectionError::Closed(e.to_string()))
    }
}

struct AmqpChannel {
    channel: Channel,
}

fn topology_error(step: &str) -> impl FnOnce(lapin::Error) -> ConnectionError + '_ {
    move |e| ConnectionError::Topology {
        step: step.to_string(),
        reason: e.to_string(),
    }
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeOptions,
    ) -> Result<(), ConnectionError> {
        let kind = match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        };
        let declare = ExchangeDeclareOptions {
            durable: options.durable,
            ..ExchangeDeclareOptions::default()
        };
        self.channel
            .exchange_declare(name, kind, declare, FieldTable::default())
            .await
            .map_err(topology_error("declare_exchange"))
    }

    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<(), ConnectionError> {
        let declare = QueueDeclareOptions {
            durable: options.durable,
            exclusive: options.exclusive,
            ..QueueDeclareOptions::default()
        };
        self.channel
            .queue_declare(name, declare, FieldTable::default())
            .await
            .map(|_| ())
            .map_err(topology_error("declare_queue"))
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        pattern: &str,
    ) -> Result<(), ConnectionError> {
        self.channel
            .queue_bind(queue, exchange, pattern, QueueBindOptions::default(), FieldTable::default())
            .await
            .map_err(topology_error("bind_queue"))
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, ConnectionError> {
        let options = BasicConsumeOptions {
            no_ack: true,
            ..BasicConsumeOptions::default()
        };
        let consumer = self
            .channel
            .basic_consume(queue, consumer_tag, options, FieldTable::default())
            .await
            .map_err(|e| ConnectionError::Consume {
                queue: queue.to_string(),
                reason: e.to_string(),
            })?;

        let deliveries = consumer
            .take_while(|next| {
                if let Err(err) = next {
                    warn!(error = %err, "consumer failed");
                }
                future::ready(next.is_ok())
            })
            .filter_map(|next| {
                future::ready(next.ok().map(|delivery| Delivery {
                    routing_key: delivery.routing_key.as_str().to_string(),
                    body: Bytes::from(delivery.data),
                }))
            });
        Ok(deliveries.boxed())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
    ) -> Result<(), ConnectionError> {
        let to_publish_error = |e: lapin::Error| ConnectionError::Publish {
            exchange: exchange.to_string(),
            reason: e.to_string(),
        };
        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                BasicProperties::default().with_content_type("application/json".into()),
            )
            .await
            .map_err(to_publish_error)?
            .await
            .map(|_| ())
            .map_err(to_publish_error)
    }
}
