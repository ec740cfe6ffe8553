//! Inbound dispatch, event fan-out, routing bindings and reply publishing.

pub mod binder;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod handler;
pub mod publisher;

use std::sync::Arc;

use brokerline_core::{EnvelopeSchema, EnvelopeValidator};

pub use binder::{Action, RouteMatcher, RoutingBinder};
pub use dispatcher::{classify, DispatchOutcome, MessageDispatcher};
pub use error::{BindingContractError, ProtocolError, ServiceError};
pub use events::{
    Dispatched, Emission, Event, EventKind, EventRegistry, HandlerFuture, Listener, Request,
    SubscriptionId,
};
pub use handler::{attach_handler, MessageHandler};
pub use publisher::{PublishOutcome, ReplyHandle, ResponsePublisher};

/// Structural validators for both directions of traffic.
#[derive(Clone)]
pub struct Validators {
    pub incoming: Arc<dyn EnvelopeValidator>,
    pub outgoing: Arc<dyn EnvelopeValidator>,
}

impl Default for Validators {
    fn default() -> Self {
        Self {
            incoming: Arc::new(EnvelopeSchema::incoming()),
            outgoing: Arc::new(EnvelopeSchema::outgoing()),
        }
    }
}
