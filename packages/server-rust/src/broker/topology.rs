//! Exchange, queue, and binding declarations run on every (re)connect.

use tracing::debug;

use super::config::BrokerConfig;
use super::transport::{BrokerChannel, ConnectionError, ExchangeKind, ExchangeOptions, QueueOptions};

/// Reply exchange flags: direct, survives broker restarts.
pub const REPLY_EXCHANGE_OPTIONS: ExchangeOptions = ExchangeOptions { durable: true };

/// Request exchange flags: topic, non-durable.
pub const REQUEST_EXCHANGE_OPTIONS: ExchangeOptions = ExchangeOptions { durable: false };

/// Inbox flags: non-exclusive so several service processes share one inbox.
pub const INBOX_QUEUE_OPTIONS: QueueOptions = QueueOptions {
    durable: true,
    exclusive: false,
};

/// Declares the service topology on a freshly opened channel.
///
/// Order is fixed: reply exchange, request exchange, inbox queue, then one
/// binding per configured topic. Every step is idempotent on the broker, so
/// a retry after a partial failure simply re-declares what already exists.
///
/// # Errors
///
/// Returns the first failing step's `ConnectionError`. The caller treats it
/// like any other connection failure and reconnects with backoff.
pub async fn apply(channel: &dyn BrokerChannel, config: &BrokerConfig) -> Result<(), ConnectionError> {
    channel
        .declare_exchange(&config.reply_exchange, ExchangeKind::Direct, REPLY_EXCHANGE_OPTIONS)
        .await?;
    channel
        .declare_exchange(&config.request_exchange, ExchangeKind::Topic, REQUEST_EXCHANGE_OPTIONS)
        .await?;
    channel
        .declare_queue(&config.inbox_queue, INBOX_QUEUE_OPTIONS)
        .await?;

    for topic in &config.topics {
        channel
            .bind_queue(&config.inbox_queue, &config.request_exchange, topic)
            .await?;
        debug!(
            queue = %config.inbox_queue,
            exchange = %config.request_exchange,
            topic = %topic,
            "inbox bound"
        );
    }

    Ok(())
}
