//! Command-line and environment configuration for service binaries.

use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;

use crate::broker::{BrokerConfig, ConnectionOptions, RetryConfig};
use crate::telemetry::TracingConfig;

/// Options shared by every brokerline service. Each flag can also be set
/// through the environment variable named next to it.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Broker-connected microservice")]
pub struct ServiceArgs {
    /// URI scheme, `amqp` or `amqps`
    #[arg(long, env = "BROKER_PROTOCOL", default_value = "amqp")]
    pub protocol: String,

    #[arg(long, env = "BROKER_HOST", default_value = "localhost")]
    pub host: String,

    #[arg(long, env = "BROKER_PORT", default_value_t = 5672)]
    pub port: u16,

    #[arg(long, env = "BROKER_USER", default_value = "guest")]
    pub username: String,

    #[arg(long, env = "BROKER_PASSWORD", default_value = "guest", hide_env_values = true)]
    pub password: String,

    #[arg(long, env = "BROKER_VHOST", default_value = "/")]
    pub vhost: String,

    #[arg(long, env = "BROKER_LOCALE", default_value = "en_US")]
    pub locale: String,

    /// Heartbeat interval in seconds, 0 to disable
    #[arg(long, env = "BROKER_HEARTBEAT", default_value_t = 0)]
    pub heartbeat: u16,

    /// Maximum frame size in bytes, 0 to let the broker decide
    #[arg(long, env = "BROKER_FRAME_MAX", default_value_t = 0)]
    pub frame_max: u32,

    #[arg(long, env = "BROKER_REPLY_EXCHANGE", default_value = "replies")]
    pub reply_exchange: String,

    #[arg(long, env = "BROKER_REQUEST_EXCHANGE", default_value = "requests")]
    pub request_exchange: String,

    #[arg(long, env = "BROKER_QUEUE", default_value = "inbox")]
    pub queue: String,

    /// Topic patterns to bind the inbox with, comma-separated
    #[arg(long, env = "BROKER_TOPICS", value_delimiter = ',', default_value = "#")]
    pub topics: Vec<String>,

    #[arg(long, env = "BROKER_RETRY_INITIAL_MS", default_value_t = 1000)]
    pub retry_initial_ms: u64,

    #[arg(long, env = "BROKER_RETRY_FACTOR", default_value_t = 2.0)]
    pub retry_factor: f64,

    #[arg(long, env = "BROKER_RETRY_MAX_MS", default_value_t = 30_000)]
    pub retry_max_ms: u64,

    /// Address the health endpoints listen on
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8080")]
    pub health_addr: SocketAddr,

    /// Log filter used when `RUST_LOG` is unset
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[arg(long, env = "LOG_JSON")]
    pub json_logs: bool,
}

impl ServiceArgs {
    #[must_use]
    pub fn broker_config(&self) -> BrokerConfig {
        BrokerConfig {
            connection: ConnectionOptions {
                protocol: self.protocol.clone(),
                hostname: self.host.clone(),
                port: self.port,
                username: self.username.clone(),
                password: self.password.clone(),
                locale: self.locale.clone(),
                frame_max: self.frame_max,
                heartbeat: self.heartbeat,
                vhost: self.vhost.clone(),
            },
            reply_exchange: self.reply_exchange.clone(),
            request_exchange: self.request_exchange.clone(),
            inbox_queue: self.queue.clone(),
            topics: self
                .topics
                .iter()
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect(),
            retry: RetryConfig {
                initial_delay: Duration::from_millis(self.retry_initial_ms),
                growth_factor: self.retry_factor,
                max_delay: Duration::from_millis(self.retry_max_ms),
            },
        }
    }

    #[must_use]
    pub fn tracing_config(&self, service_name: &str) -> TracingConfig {
        TracingConfig {
            service_name: service_name.to_string(),
            log_level: self.log_level.clone(),
            json_logs: self.json_logs,
        }
    }
}
