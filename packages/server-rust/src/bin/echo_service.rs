use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use brokerline_core::status;
use clap::Parser;
use serde_json::{json, Value};
use tracing::{info, warn};

use brokerline_service::broker::AmqpTransport;
use brokerline_service::config::ServiceArgs;
use brokerline_service::dispatch::ServiceError;
use brokerline_service::health::{self, AppState};
use brokerline_service::telemetry::init_tracing;
use brokerline_service::{attach_handler, ConnectionManager, EventRegistry, MessageHandler, Request, Validators};

/// Answers reads with the request's domain fields and mutations with the
/// request id.
struct EchoHandler;

impl EchoHandler {
    async fn ack(request: Request, code: i64) -> Result<()> {
        request
            .reply
            .respond(code, vec![json!(request.message.msg_id)])
            .await;
        Ok(())
    }
}

#[async_trait]
impl MessageHandler for EchoHandler {
    async fn on_create(&self, request: Request) -> Result<()> {
        Self::ack(request, status::CREATED).await
    }

    async fn on_read(&self, request: Request) -> Result<()> {
        let fields = Value::Object(request.message.fields.clone());
        request.reply.respond(status::OK, vec![fields]).await;
        Ok(())
    }

    async fn on_update(&self, request: Request) -> Result<()> {
        Self::ack(request, status::OK).await
    }

    async fn on_delete(&self, request: Request) -> Result<()> {
        Self::ack(request, status::OK).await
    }

    async fn on_other(&self, request: Request) -> Result<()> {
        request.reply.respond(status::BAD_REQUEST, Vec::new()).await;
        Ok(())
    }

    async fn on_ready(&self) -> Result<()> {
        info!("echo service ready");
        Ok(())
    }

    async fn on_error(&self, error: Arc<ServiceError>) -> Result<()> {
        warn!(error = %error, "service error");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = ServiceArgs::parse();
    init_tracing(&args.tracing_config("brokerline-echo"))?;

    let config = args.broker_config();
    info!(
        version = env!("CARGO_PKG_VERSION"),
        broker = %config.connection.redacted_uri(),
        topics = ?config.topics,
        "starting echo service"
    );

    let registry = Arc::new(EventRegistry::new());
    attach_handler(&registry, Arc::new(EchoHandler));
    let manager = ConnectionManager::new(
        config,
        Arc::new(AmqpTransport::new()),
        registry,
        Validators::default(),
    );

    let listener = tokio::net::TcpListener::bind(args.health_addr)
        .await
        .with_context(|| format!("binding health endpoint on {}", args.health_addr))?;
    info!(addr = %args.health_addr, "health endpoint listening");
    let app = health::router(AppState::new(Arc::clone(&manager)));
    let server = tokio::spawn(async move { axum::serve(listener, app).await });

    manager.connect().await;

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutdown requested");
    manager.shutdown().await;
    server.abort();

    Ok(())
}
