//! Trait-based alternative to registering closures one channel at a time.

use std::sync::Arc;

use async_trait::async_trait;

use super::error::ServiceError;
use super::events::{Event, EventKind, EventRegistry, Request, SubscriptionId};

/// Domain hooks for a service.
///
/// Every method has a no-op default, so implementors override only the
/// channels they serve.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn on_create(&self, _request: Request) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_read(&self, _request: Request) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_update(&self, _request: Request) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_delete(&self, _request: Request) -> anyhow::Result<()> {
        Ok(())
    }

    /// Requests with a missing or non-CRUD intention.
    async fn on_other(&self, _request: Request) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_ready(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_error(&self, _error: Arc<ServiceError>) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Subscribes `handler` to every event channel.
///
/// Returns the subscription ids so the caller can detach it again with
/// [`EventRegistry::off`].
pub fn attach_handler<H: MessageHandler>(registry: &EventRegistry, handler: Arc<H>) -> Vec<SubscriptionId> {
    EventKind::ALL
        .iter()
        .map(|&kind| {
            let handler = Arc::clone(&handler);
            registry.on(kind, move |event| {
                let handler = Arc::clone(&handler);
                async move {
                    match event {
                        Event::Ready => handler.on_ready().await,
                        Event::Error(err) => handler.on_error(err).await,
                        Event::Create(request) => handler.on_create(request).await,
                        Event::Read(request) => handler.on_read(request).await,
                        Event::Update(request) => handler.on_update(request).await,
                        Event::Delete(request) => handler.on_delete(request).await,
                        Event::Any(request) => handler.on_other(request).await,
                    }
                }
            })
        })
        .collect()
}
