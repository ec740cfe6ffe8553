//! In-process broker used as the transport in tests and local wiring.
//!
//! Records every declaration, binding and publish, lets callers inject
//! deliveries into the active consumer, and can script connect failures,
//! topology failures and broker-initiated closes.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{self, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use super::config::ConnectionOptions;
use super::transport::{
    BrokerChannel, BrokerConnection, ConnectionError, Delivery, DeliveryStream, ExchangeKind,
    ExchangeOptions, QueueOptions, Transport,
};

/// One recorded topology or consumer operation, in call order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopologyOp {
    DeclareExchange {
        name: String,
        kind: ExchangeKind,
        durable: bool,
    },
    DeclareQueue {
        name: String,
        durable: bool,
        exclusive: bool,
    },
    Bind {
        queue: String,
        exchange: String,
        pattern: String,
    },
    Consume {
        queue: String,
    },
}

/// A message published through the in-memory broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub payload: Bytes,
}

impl PublishedMessage {
    /// Parses the payload as JSON. Returns `Value::Null` for non-JSON bodies.
    #[must_use]
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.payload).unwrap_or(serde_json::Value::Null)
    }
}

#[derive(Default)]
struct BrokerState {
    connect_attempts: AtomicU32,
    scripted_connect_failures: Mutex<VecDeque<ConnectionError>>,
    failing_topology_steps: AtomicU32,
    connect_delay: Mutex<Option<Duration>>,
    fail_publishes: Mutex<bool>,
    topology: Mutex<Vec<TopologyOp>>,
    published: Mutex<Vec<PublishedMessage>>,
    consumer: Mutex<Option<mpsc::UnboundedSender<Delivery>>>,
    current: Mutex<Option<Arc<InMemoryConnection>>>,
}

// ---------------------------------------------------------------------------
// InMemoryTransport
// ---------------------------------------------------------------------------

/// Cloneable handle to a shared in-memory broker.
#[derive(Clone, Default)]
pub struct InMemoryTransport {
    state: Arc<BrokerState>,
}

impl InMemoryTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` connect attempts fail.
    pub fn fail_next_connects(&self, count: usize) {
        let mut scripted = self.state.scripted_connect_failures.lock();
        for _ in 0..count {
            scripted.push_back(ConnectionError::Connect("connection refused".to_string()));
        }
    }

    /// Makes the next `count` declare/bind calls fail.
    pub fn fail_next_topology_steps(&self, count: u32) {
        self.state
            .failing_topology_steps
            .fetch_add(count, Ordering::SeqCst);
    }

    /// Makes every connect attempt wait `delay` before it resolves.
    pub fn set_connect_delay(&self, delay: Duration) {
        *self.state.connect_delay.lock() = Some(delay);
    }

    /// Makes every publish fail until reset.
    pub fn set_fail_publishes(&self, fail: bool) {
        *self.state.fail_publishes.lock() = fail;
    }

    /// Number of connect attempts seen so far.
    #[must_use]
    pub fn connect_attempts(&self) -> u32 {
        self.state.connect_attempts.load(Ordering::SeqCst)
    }

    /// Every topology operation recorded so far, across all connections.
    #[must_use]
    pub fn topology(&self) -> Vec<TopologyOp> {
        self.state.topology.lock().clone()
    }

    /// Every published message, in publish order.
    #[must_use]
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.state.published.lock().clone()
    }

    /// Whether a consumer is currently attached.
    #[must_use]
    pub fn is_consuming(&self) -> bool {
        self.state
            .consumer
            .lock()
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }

    /// Pushes a delivery to the active consumer.
    ///
    /// Returns `false` when nothing is consuming.
    pub fn deliver(&self, delivery: Delivery) -> bool {
        match self.state.consumer.lock().as_ref() {
            Some(tx) => tx.send(delivery).is_ok(),
            None => false,
        }
    }

    /// Simulates a broker-initiated close of the current connection.
    pub fn close_connection(&self, reason: &str) {
        let current = self.state.current.lock().take();
        if let Some(conn) = current {
            conn.mark_closed(ConnectionError::Closed(reason.to_string()));
        }
        self.state.consumer.lock().take();
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn connect(
        &self,
        _options: &ConnectionOptions,
    ) -> Result<Arc<dyn BrokerConnection>, ConnectionError> {
        self.state.connect_attempts.fetch_add(1, Ordering::SeqCst);
        let delay = *self.state.connect_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let scripted = self.state.scripted_connect_failures.lock().pop_front();
        if let Some(err) = scripted {
            return Err(err);
        }

        let (closed_tx, _closed_rx) = watch::channel(None);
        let conn = Arc::new(InMemoryConnection {
            state: Arc::clone(&self.state),
            closed_tx,
        });
        *self.state.current.lock() = Some(Arc::clone(&conn));
        Ok(conn)
    }
}

// ---------------------------------------------------------------------------
// Connection and channel
// ---------------------------------------------------------------------------

struct InMemoryConnection {
    state: Arc<BrokerState>,
    closed_tx: watch::Sender<Option<ConnectionError>>,
}

impl InMemoryConnection {
    fn mark_closed(&self, err: ConnectionError) {
        self.closed_tx.send_replace(Some(err));
    }

    fn is_closed(&self) -> bool {
        self.closed_tx.borrow().is_some()
    }
}

#[async_trait]
impl BrokerConnection for InMemoryConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Channel("connection is closed".to_string()));
        }
        Ok(Arc::new(InMemoryChannel {
            state: Arc::clone(&self.state),
            closed_rx: self.closed_tx.subscribe(),
        }))
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
        self.mark_closed(ConnectionError::Closed("closed by client".to_string()));
        self.state.consumer.lock().take();
        Ok(())
    }
}

struct InMemoryChannel {
    state: Arc<BrokerState>,
    closed_rx: watch::Receiver<Option<ConnectionError>>,
}

impl InMemoryChannel {
    fn ensure_open(&self) -> Result<(), ConnectionError> {
        match self.closed_rx.borrow().as_ref() {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    /// Consumes one scripted topology failure, if any are pending.
    fn take_topology_failure(&self, step: &str) -> Result<(), ConnectionError> {
        let failing = self
            .state
            .failing_topology_steps
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(ConnectionError::Topology {
                step: step.to_string(),
                reason: "scripted failure".to_string(),
            });
        }
        Ok(())
    }

    fn record(&self, op: TopologyOp) {
        self.state.topology.lock().push(op);
    }
}

#[async_trait]
impl BrokerChannel for InMemoryChannel {
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeOptions,
    ) -> Result<(), ConnectionError> {
        self.ensure_open()?;
        self.take_topology_failure("declare_exchange")?;
        self.record(TopologyOp::DeclareExchange {
            name: name.to_string(),
            kind,
            durable: options.durable,
        });
        Ok(())
    }

    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<(), ConnectionError> {
        self.ensure_open()?;
        self.take_topology_failure("declare_queue")?;
        self.record(TopologyOp::DeclareQueue {
            name: name.to_string(),
            durable: options.durable,
            exclusive: options.exclusive,
        });
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        pattern: &str,
    ) -> Result<(), ConnectionError> {
        self.ensure_open()?;
        self.take_topology_failure("bind_queue")?;
        self.record(TopologyOp::Bind {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            pattern: pattern.to_string(),
        });
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        _consumer_tag: &str,
    ) -> Result<DeliveryStream, ConnectionError> {
        self.ensure_open()?;
        let (tx, rx) = mpsc::unbounded_channel();
        *self.state.consumer.lock() = Some(tx);
        self.record(TopologyOp::Consume {
            queue: queue.to_string(),
        });

        let deliveries = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|delivery| (delivery, rx))
        });
        Ok(deliveries.boxed())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
    ) -> Result<(), ConnectionError> {
        self.ensure_open()?;
        if *self.state.fail_publishes.lock() {
            return Err(ConnectionError::Publish {
                exchange: exchange.to_string(),
                reason: "scripted failure".to_string(),
            });
        }
        self.state.published.lock().push(PublishedMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            payload: Bytes::copy_from_slice(payload),
        });
        Ok(())
    }
}
