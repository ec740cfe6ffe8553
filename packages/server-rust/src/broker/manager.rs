//! Connection lifecycle: connect, configure, consume, and reconnect with
//! backoff.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::backoff::RetryPolicy;
use super::config::BrokerConfig;
use super::state::{ConnectionState, StateMachine};
use super::topology;
use super::transport::{BrokerChannel, BrokerConnection, ConnectionError, DeliveryStream, Transport};
use crate::dispatch::{
    Event, EventRegistry, MessageDispatcher, ResponsePublisher, RoutingBinder, ServiceError,
    Validators,
};

type ReadyCallback = Box<dyn FnOnce() + Send>;

/// Owns the broker connection, its channel and the inbox consumer.
///
/// At most one connect sequence runs at a time: `connect` only proceeds from
/// `Disconnected`, and only one reconnect timer is ever armed. Every
/// established connection gets a generation number so that close signals
/// from a connection that has already been replaced are ignored.
pub struct ConnectionManager {
    config: Arc<BrokerConfig>,
    transport: Arc<dyn Transport>,
    registry: Arc<EventRegistry>,
    dispatcher: Arc<MessageDispatcher>,
    publisher: Arc<ResponsePublisher>,
    state: StateMachine,
    retry: Mutex<RetryPolicy>,
    ready_callbacks: Mutex<Vec<ReadyCallback>>,
    reconnect_armed: AtomicBool,
    shutting_down: AtomicBool,
    generation: AtomicU64,
    connection: Mutex<Option<Arc<dyn BrokerConnection>>>,
    consumer_tag: String,
}

impl ConnectionManager {
    #[must_use]
    pub fn new(
        config: BrokerConfig,
        transport: Arc<dyn Transport>,
        registry: Arc<EventRegistry>,
        validators: Validators,
    ) -> Arc<Self> {
        let publisher = Arc::new(ResponsePublisher::new(
            config.reply_exchange.clone(),
            validators.outgoing,
        ));
        let dispatcher = Arc::new(MessageDispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&publisher),
            validators.incoming,
        ));
        Arc::new(Self {
            retry: Mutex::new(RetryPolicy::new(&config.retry)),
            config: Arc::new(config),
            transport,
            registry,
            dispatcher,
            publisher,
            state: StateMachine::new(),
            ready_callbacks: Mutex::new(Vec::new()),
            reconnect_armed: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            connection: Mutex::new(None),
            consumer_tag: format!("brokerline-{}", Uuid::new_v4()),
        })
    }

    // -- accessors ----------------------------------------------------------

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    /// Every state transition applied after this call, in order.
    #[must_use]
    pub fn subscribe_state(&self) -> broadcast::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<EventRegistry> {
        &self.registry
    }

    /// A routing binder on this manager's registry.
    #[must_use]
    pub fn binder(&self) -> RoutingBinder {
        RoutingBinder::new(Arc::clone(&self.registry))
    }

    #[must_use]
    pub fn publisher(&self) -> &Arc<ResponsePublisher> {
        &self.publisher
    }

    #[must_use]
    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Consecutive failed attempts since the connection was last ready.
    #[must_use]
    pub fn retry_failures(&self) -> u32 {
        self.retry.lock().failures()
    }

    /// Delay the next reconnect would wait.
    #[must_use]
    pub fn next_retry_delay(&self) -> Duration {
        self.retry.lock().current_delay()
    }

    // -- readiness ----------------------------------------------------------

    /// Runs `callback` now if the connection is ready, otherwise exactly once
    /// when it next becomes ready. A panicking callback is logged and does
    /// not affect the caller or the other callbacks.
    pub fn on_ready<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut queued = self.ready_callbacks.lock();
        if self.state.get() == ConnectionState::Ready {
            drop(queued);
            run_ready_callback(callback);
        } else {
            queued.push(Box::new(callback));
        }
    }

    /// Resolves once the connection is ready. Pending forever after
    /// [`shutdown`](Self::shutdown).
    pub async fn wait_ready(&self) {
        let (tx, rx) = oneshot::channel();
        self.on_ready(move || {
            let _ = tx.send(());
        });
        let _ = rx.await;
    }

    // -- lifecycle ----------------------------------------------------------

    /// Runs one connect sequence.
    ///
    /// Returns immediately if another sequence is already in flight or the
    /// manager was shut down. Failures are reported through the `error`
    /// event and retried with backoff; this method never returns an error.
    pub async fn connect(self: &Arc<Self>) {
        if self.shutting_down.load(Ordering::SeqCst) {
            return;
        }
        if !self
            .state
            .transition(ConnectionState::Disconnected, ConnectionState::Connecting)
        {
            debug!(state = self.state.get().as_str(), "connect already in progress");
            return;
        }

        info!(uri = %self.config.connection.redacted_uri(), "connecting to broker");
        let conn = match self.transport.connect(&self.config.connection).await {
            Ok(conn) => conn,
            Err(err) => {
                self.fail(err);
                return;
            }
        };

        if !self
            .state
            .transition(ConnectionState::Connecting, ConnectionState::ConfiguringTopology)
        {
            // Shut down while the connect call was in flight.
            close_quietly(conn.as_ref()).await;
            return;
        }

        match self.configure(conn.as_ref()).await {
            Ok((channel, deliveries)) => self.go_ready(conn, channel, deliveries).await,
            Err(err) => {
                close_quietly(conn.as_ref()).await;
                self.fail(err);
            }
        }
    }

    /// Stops reconnecting and closes the connection.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        // State first: a connect sequence that reaches Ready before this
        // point has already stored its connection in the slot below.
        self.state.disconnect();
        self.publisher.detach();
        let conn = self.connection.lock().take();
        if let Some(conn) = conn {
            close_quietly(conn.as_ref()).await;
        }
        info!("broker connection shut down");
    }

    async fn configure(
        &self,
        conn: &dyn BrokerConnection,
    ) -> Result<(Arc<dyn BrokerChannel>, DeliveryStream), ConnectionError> {
        let channel = conn.create_channel().await?;
        topology::apply(channel.as_ref(), &self.config).await?;
        let deliveries = channel
            .consume(&self.config.inbox_queue, &self.consumer_tag)
            .await?;
        Ok((channel, deliveries))
    }

    async fn go_ready(
        self: &Arc<Self>,
        conn: Arc<dyn BrokerConnection>,
        channel: Arc<dyn BrokerChannel>,
        deliveries: DeliveryStream,
    ) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *self.connection.lock() = Some(Arc::clone(&conn));
        self.publisher.attach(channel);

        let callbacks = {
            let mut queued = self.ready_callbacks.lock();
            if self
                .state
                .transition(ConnectionState::ConfiguringTopology, ConnectionState::Ready)
            {
                Some(std::mem::take(&mut *queued))
            } else {
                None
            }
        };
        let Some(callbacks) = callbacks else {
            // Shut down during configuration.
            self.publisher.detach();
            let stored = self.connection.lock().take();
            if let Some(stored) = stored {
                close_quietly(stored.as_ref()).await;
            }
            return;
        };

        self.retry.lock().reset();
        info!(
            queue = %self.config.inbox_queue,
            topics = self.config.topics.len(),
            generation,
            "broker connection ready"
        );

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut deliveries = deliveries;
            while let Some(delivery) = deliveries.next().await {
                manager.dispatcher.dispatch(&delivery);
            }
            manager.handle_close(generation, ConnectionError::ConsumerEnded);
        });

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let err = conn.closed().await;
            manager.handle_close(generation, err);
        });

        for callback in callbacks {
            run_ready_callback(callback);
        }
        if let Some(violation) = self.registry.dispatch(Event::Ready).violation {
            error!(error = %violation, "ready listener violated its binding contract");
        }
    }

    /// Reacts to a close signal from the connection of `generation`.
    fn handle_close(self: &Arc<Self>, generation: u64, err: ConnectionError) {
        if self.shutting_down.load(Ordering::SeqCst) {
            return;
        }
        if self.generation.load(Ordering::SeqCst) != generation {
            debug!(generation, error = %err, "ignoring close of superseded connection");
            return;
        }
        if !self
            .state
            .transition(ConnectionState::Ready, ConnectionState::Disconnected)
        {
            // The other close signal of the same connection got here first.
            return;
        }
        self.publisher.detach();
        self.connection.lock().take();
        self.report_and_retry(err);
    }

    /// Handles a failed connect or configure step.
    ///
    /// A failure that lands after `shutdown` only cleans up; it is neither
    /// reported nor retried.
    fn fail(self: &Arc<Self>, err: ConnectionError) {
        self.state.disconnect();
        self.publisher.detach();
        self.connection.lock().take();
        if self.shutting_down.load(Ordering::SeqCst) {
            debug!(error = %err, "connect failed after shutdown");
            return;
        }
        self.report_and_retry(err);
    }

    fn report_and_retry(self: &Arc<Self>, err: ConnectionError) {
        warn!(error = %err, "broker connection lost");
        let report = Event::Error(Arc::new(ServiceError::Connection(err)));
        if let Some(violation) = self.registry.dispatch(report).violation {
            error!(error = %violation, "error listener violated its binding contract");
        }
        self.schedule_reconnect();
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        if self.shutting_down.load(Ordering::SeqCst) {
            return;
        }
        if self.reconnect_armed.swap(true, Ordering::SeqCst) {
            debug!("reconnect already armed");
            return;
        }

        let delay = self.retry.lock().record_failure();
        info!(
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "scheduling reconnect"
        );
        metrics::counter!("brokerline_reconnects_total").increment(1);

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            manager.reconnect_armed.store(false, Ordering::SeqCst);
            manager.connect().await;
        });
    }
}

fn run_ready_callback(callback: impl FnOnce()) {
    if std::panic::catch_unwind(AssertUnwindSafe(callback)).is_err() {
        warn!("ready callback panicked");
    }
}

async fn close_quietly(conn: &dyn BrokerConnection) {
    if let Err(err) = conn.close().await {
        debug!(error = %err, "error while closing broker connection");
    }
}
