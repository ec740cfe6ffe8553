//! Declarative binding of request handlers to an action and routing key.

use std::future::Future;
use std::sync::Arc;

use brokerline_core::Intention;
use futures_util::FutureExt;
use regex::Regex;

use super::error::BindingContractError;
use super::events::{Event, EventKind, EventRegistry, HandlerFuture, Request, SubscriptionId};

/// Routing-key filter for a binding.
#[derive(Debug, Clone)]
pub enum RouteMatcher {
    Exact(String),
    Pattern(Regex),
    Any,
}

impl RouteMatcher {
    #[must_use]
    pub fn exact(key: impl Into<String>) -> Self {
        Self::Exact(key.into())
    }

    /// Compiles a regular-expression matcher.
    ///
    /// # Errors
    ///
    /// Returns the regex compile error for an invalid pattern.
    pub fn pattern(pattern: &str) -> Result<Self, regex::Error> {
        Regex::new(pattern).map(Self::Pattern)
    }

    #[must_use]
    pub fn matches(&self, routing_key: &str) -> bool {
        match self {
            Self::Exact(key) => key == routing_key,
            Self::Pattern(re) => re.is_match(routing_key),
            Self::Any => true,
        }
    }
}

/// Request action a binding serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Create,
    Read,
    Update,
    Delete,
    /// Requests with a missing or non-CRUD intention.
    Any,
}

impl Action {
    #[must_use]
    pub fn kind(self) -> EventKind {
        match self {
            Self::Create => EventKind::Create,
            Self::Read => EventKind::Read,
            Self::Update => EventKind::Update,
            Self::Delete => EventKind::Delete,
            Self::Any => EventKind::Any,
        }
    }

    /// Whether a message with this intention may reach a handler bound to
    /// this action.
    #[must_use]
    pub fn accepts(self, intention: &Intention) -> bool {
        match self {
            Self::Create => *intention == Intention::Create,
            Self::Read => *intention == Intention::Read,
            Self::Update => *intention == Intention::Update,
            Self::Delete => *intention == Intention::Delete,
            Self::Any => !intention.is_crud(),
        }
    }
}

/// Handler context for routing-key bindings on one registry.
#[derive(Clone)]
pub struct RoutingBinder {
    registry: Arc<EventRegistry>,
}

impl RoutingBinder {
    #[must_use]
    pub fn new(registry: Arc<EventRegistry>) -> Self {
        Self { registry }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<EventRegistry> {
        &self.registry
    }

    /// Calls `callback` for requests of `action` whose routing key matches.
    ///
    /// The listener declines requests on other routing keys. A request whose
    /// intention disagrees with `action` is a wiring bug: the listener returns
    /// [`BindingContractError::IntentionMismatch`] and the callback is not run.
    pub fn bind<F, Fut>(&self, action: Action, matcher: RouteMatcher, callback: F) -> SubscriptionId
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let listener = move |event: &Event| -> Result<Option<HandlerFuture>, BindingContractError> {
            let Some(request) = event.request() else {
                return Ok(None);
            };
            if !matcher.matches(&request.routing_key) {
                return Ok(None);
            }
            let intention = request.message.intention();
            if !action.accepts(&intention) {
                return Err(BindingContractError::IntentionMismatch {
                    action: action.kind(),
                    intention: intention.to_string(),
                    routing_key: request.routing_key.clone(),
                });
            }
            Ok(Some(callback(request.clone()).boxed()))
        };
        self.registry.subscribe(action.kind(), Arc::new(listener), false)
    }

    pub fn unbind(&self, id: SubscriptionId) -> bool {
        self.registry.off(id)
    }
}
