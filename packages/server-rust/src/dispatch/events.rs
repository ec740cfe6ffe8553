//! Typed publish/subscribe registry between the dispatcher and domain code.
//!
//! Listeners are registered per [`EventKind`]. Emitting an event invokes
//! every listener of that kind (fan-out); each listener returns the future
//! that does the actual work, which [`EventRegistry::dispatch`] spawns with
//! failure containment.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use brokerline_core::InboundMessage;
use futures_util::future::{self, BoxFuture, FutureExt};
use parking_lot::RwLock;
use tracing::{error, warn};

use super::error::{BindingContractError, ServiceError};
use super::publisher::ReplyHandle;

// ---------------------------------------------------------------------------
// Event kinds and payloads
// ---------------------------------------------------------------------------

/// Closed set of event channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Ready,
    Error,
    Create,
    Read,
    Update,
    Delete,
    /// Requests whose intention is missing or not one of the CRUD four.
    Any,
}

impl EventKind {
    pub const ALL: [EventKind; 7] = [
        Self::Ready,
        Self::Error,
        Self::Create,
        Self::Read,
        Self::Update,
        Self::Delete,
        Self::Any,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Error => "error",
            Self::Create => "create",
            Self::Read => "read",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Any => "any",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified inbound request and the means to answer it.
#[derive(Debug, Clone)]
pub struct Request {
    /// Routing key the request was delivered under.
    pub routing_key: String,
    pub message: Arc<InboundMessage>,
    /// Reply callback bound to this request's id and intention.
    pub reply: ReplyHandle,
}

/// An event carried through the registry.
#[derive(Debug, Clone)]
pub enum Event {
    Ready,
    Error(Arc<ServiceError>),
    Create(Request),
    Read(Request),
    Update(Request),
    Delete(Request),
    Any(Request),
}

impl Event {
    /// Wraps a request in the event for the given request channel.
    ///
    /// `Ready` and `Error` carry no request; asking for them yields `Any`.
    #[must_use]
    pub fn for_request(kind: EventKind, request: Request) -> Self {
        match kind {
            EventKind::Create => Self::Create(request),
            EventKind::Read => Self::Read(request),
            EventKind::Update => Self::Update(request),
            EventKind::Delete => Self::Delete(request),
            EventKind::Any | EventKind::Ready | EventKind::Error => Self::Any(request),
        }
    }

    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Ready => EventKind::Ready,
            Self::Error(_) => EventKind::Error,
            Self::Create(_) => EventKind::Create,
            Self::Read(_) => EventKind::Read,
            Self::Update(_) => EventKind::Update,
            Self::Delete(_) => EventKind::Delete,
            Self::Any(_) => EventKind::Any,
        }
    }

    #[must_use]
    pub fn request(&self) -> Option<&Request> {
        match self {
            Self::Create(r) | Self::Read(r) | Self::Update(r) | Self::Delete(r) | Self::Any(r) => {
                Some(r)
            }
            Self::Ready | Self::Error(_) => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Listeners
// ---------------------------------------------------------------------------

/// Work produced by a listener for one event.
pub type HandlerFuture = BoxFuture<'static, anyhow::Result<()>>;

/// A registered listener.
///
/// `Ok(None)` means the listener declined the event (for example, a routing
/// key filter did not match). `Err` is a synchronous contract violation.
pub type Listener =
    Arc<dyn Fn(&Event) -> Result<Option<HandlerFuture>, BindingContractError> + Send + Sync>;

/// Identifier of one subscription, unique within its registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// Result of [`EventRegistry::emit`].
#[must_use]
#[derive(Default)]
pub struct Emission {
    /// One future per listener that produced work, in subscription order.
    pub work: Vec<HandlerFuture>,
    /// First contract violation raised while emitting.
    pub violation: Option<BindingContractError>,
}

/// Result of [`EventRegistry::dispatch`].
#[must_use]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatched {
    /// Number of spawned handler tasks.
    pub handlers: usize,
    pub violation: Option<BindingContractError>,
}

struct Subscription {
    id: SubscriptionId,
    listener: Listener,
    once: bool,
}

// ---------------------------------------------------------------------------
// EventRegistry
// ---------------------------------------------------------------------------

/// Subscription table keyed by event kind.
///
/// Subscriptions can be added and removed at any time, including from inside
/// a listener, without touching the broker connection.
pub struct EventRegistry {
    subscriptions: RwLock<HashMap<EventKind, Vec<Subscription>>>,
    next_id: AtomicU64,
}

impl EventRegistry {
    /// Creates an empty registry. Subscription IDs start at 1.
    #[must_use]
    pub fn new() -> Self {
        Self {
            subscriptions: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Registers a raw listener.
    pub fn subscribe(&self, kind: EventKind, listener: Listener, once: bool) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscriptions
            .write()
            .entry(kind)
            .or_default()
            .push(Subscription { id, listener, once });
        id
    }

    /// Subscribes `handler` to every event of `kind`.
    pub fn on<F, Fut>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.subscribe(kind, into_listener(handler), false)
    }

    /// Subscribes `handler` to the next event of `kind` only.
    pub fn once<F, Fut>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.subscribe(kind, into_listener(handler), true)
    }

    /// Removes a subscription. Returns `false` if it was already gone.
    pub fn off(&self, id: SubscriptionId) -> bool {
        let mut subscriptions = self.subscriptions.write();
        for list in subscriptions.values_mut() {
            if let Some(pos) = list.iter().position(|s| s.id == id) {
                list.remove(pos);
                return true;
            }
        }
        false
    }

    /// Number of live subscriptions for `kind`.
    #[must_use]
    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.subscriptions.read().get(&kind).map_or(0, Vec::len)
    }

    /// Invokes every listener of the event's kind and collects their work.
    ///
    /// `once` subscriptions are removed before any listener runs, so two
    /// concurrent emits can never both invoke them. A listener that panics
    /// contributes a failing future instead of unwinding into the caller.
    /// A `BindingContractError` does not stop the fan-out: the remaining
    /// listeners still run and the first violation is kept in the result.
    pub fn emit(&self, event: &Event) -> Emission {
        let listeners: Vec<Listener> = {
            let mut subscriptions = self.subscriptions.write();
            let Some(list) = subscriptions.get_mut(&event.kind()) else {
                return Emission::default();
            };
            let selected = list.iter().map(|s| Arc::clone(&s.listener)).collect();
            list.retain(|s| !s.once);
            selected
        };

        let mut emission = Emission {
            work: Vec::with_capacity(listeners.len()),
            violation: None,
        };
        for listener in listeners {
            match std::panic::catch_unwind(AssertUnwindSafe(|| listener(event))) {
                Ok(Ok(Some(fut))) => emission.work.push(fut),
                Ok(Ok(None)) => {}
                Ok(Err(violation)) => {
                    emission.violation.get_or_insert(violation);
                }
                Err(_) => emission
                    .work
                    .push(future::ready(Err(anyhow::anyhow!("listener panicked"))).boxed()),
            }
        }
        emission
    }

    /// Emits the event and spawns each listener's work on the runtime.
    ///
    /// A future that resolves to `Err` or panics is reported as an `error`
    /// event; it never affects other listeners or later events. Work is
    /// spawned even when a listener raised a contract violation; the
    /// violation is handed back to the caller to report.
    pub fn dispatch(self: &Arc<Self>, event: Event) -> Dispatched {
        let kind = event.kind();
        let msg_id = event.request().map(|r| r.message.msg_id);
        let Emission { work, violation } = self.emit(&event);
        let handlers = work.len();

        for fut in work {
            let registry = Arc::clone(self);
            tokio::spawn(async move {
                let outcome = match AssertUnwindSafe(fut).catch_unwind().await {
                    Ok(result) => result,
                    Err(_) => Err(anyhow::anyhow!("handler panicked")),
                };
                if let Err(cause) = outcome {
                    registry.report_failure(kind, msg_id, cause);
                }
            });
        }
        Dispatched { handlers, violation }
    }

    fn report_failure(self: &Arc<Self>, kind: EventKind, msg_id: Option<i64>, cause: anyhow::Error) {
        warn!(kind = %kind, msg_id = ?msg_id, error = %format!("{cause:#}"), "handler failed");
        // A failing error listener is only logged, never re-emitted.
        if kind == EventKind::Error {
            return;
        }
        let report = Event::Error(Arc::new(ServiceError::Handler { kind, msg_id, cause }));
        if let Some(violation) = self.dispatch(report).violation {
            error!(error = %violation, "error listener violated its binding contract");
        }
    }
}

impl Default for EventRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn into_listener<F, Fut>(handler: F) -> Listener
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |event: &Event| -> Result<Option<HandlerFuture>, BindingContractError> {
        Ok(Some(handler(event.clone()).boxed()))
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
