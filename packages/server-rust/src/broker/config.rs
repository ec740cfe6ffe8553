//! Broker configuration types.

use std::time::Duration;

/// Top-level broker configuration for one service process.
///
/// Built once at startup and shared read-only (`Arc<BrokerConfig>`) by the
/// connection manager and topology initializer.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Transport-level connection parameters.
    pub connection: ConnectionOptions,
    /// Direct exchange replies are published on.
    pub reply_exchange: String,
    /// Topic exchange requests arrive through.
    pub request_exchange: String,
    /// Shared inbox queue. Non-exclusive so several processes can consume it.
    pub inbox_queue: String,
    /// Topic patterns the inbox is bound with, applied in order.
    pub topics: Vec<String>,
    /// Reconnect backoff settings.
    pub retry: RetryConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionOptions::default(),
            reply_exchange: "replies".to_string(),
            request_exchange: "requests".to_string(),
            inbox_queue: "inbox".to_string(),
            topics: vec!["#".to_string()],
            retry: RetryConfig::default(),
        }
    }
}

/// Connection parameters handed to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionOptions {
    /// URI scheme, `amqp` or `amqps`.
    pub protocol: String,
    pub hostname: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// Locale advertised during the connection handshake.
    pub locale: String,
    /// Maximum frame size in bytes. 0 lets the broker decide.
    pub frame_max: u32,
    /// Heartbeat interval in seconds. 0 disables heartbeats.
    pub heartbeat: u16,
    pub vhost: String,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            protocol: "amqp".to_string(),
            hostname: "localhost".to_string(),
            port: 5672,
            username: "guest".to_string(),
            password: "guest".to_string(),
            locale: "en_US".to_string(),
            frame_max: 0,
            heartbeat: 0,
            vhost: "/".to_string(),
        }
    }
}

impl ConnectionOptions {
    /// Renders the options as an AMQP URI.
    ///
    /// The vhost is percent-encoded as a single path segment, so the default
    /// vhost `/` becomes `%2f`. The locale is not part of the URI; transports
    /// pass it through their handshake properties.
    #[must_use]
    pub fn uri(&self) -> String {
        self.render(&encode_component(&self.password))
    }

    /// The URI with the password masked, for logging.
    #[must_use]
    pub fn redacted_uri(&self) -> String {
        self.render("***")
    }

    fn render(&self, password: &str) -> String {
        format!(
            "{}://{}:{}@{}:{}/{}?heartbeat={}&frame_max={}",
            self.protocol,
            encode_component(&self.username),
            password,
            self.hostname,
            self.port,
            encode_component(&self.vhost),
            self.heartbeat,
            self.frame_max,
        )
    }
}

/// Percent-encodes everything outside the RFC 3986 unreserved set.
fn encode_component(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'.' | b'_' | b'~') {
            out.push(char::from(byte));
        } else {
            out.push_str(&format!("%{byte:02x}"));
        }
    }
    out
}

/// Exponential backoff applied between reconnect attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Delay before the first reconnect attempt.
    pub initial_delay: Duration,
    /// Multiplier applied after every failed attempt.
    pub growth_factor: f64,
    /// Upper bound on the delay.
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            growth_factor: 2.0,
            max_delay: Duration::from_secs(30),
        }
    }
}
