//! # Voice Bridge
//!
//! Bridges telephony media streams to a speech-to-speech realtime AI service.
//!
//! ## Request Flow:
//! 1. The telephony provider calls `POST /twilio/voice`, which answers with TwiML
//!    pointing the call's audio at `/twilio/stream`
//! 2. `/twilio/stream` upgrades to a WebSocket; its `start` frame registers a
//!    session and opens the realtime connection
//! 3. Caller audio is transcoded to PCM16, buffered, and appended to the AI input;
//!    AI audio deltas are transcoded back to µ-law and sent to the caller
//! 4. `stop`, a dropped socket on either side, or shutdown tears the session down
//!
//! ## Module Structure:
//! - `config`: Layered configuration (defaults, file, environment)
//! - `error`: Bridge error type
//! - `audio`: Codec and inbound buffering
//! - `realtime`: AI service protocol, connection, and event handling
//! - `bridge`: Session registry and per-call state
//! - `context`: Per-call conversation context
//! - `telephony`: Media-stream frames and the per-stream worker
//! - `websocket`, `webhook`, `health`: HTTP surface

mod audio;
mod bridge;
mod config;
mod context;
mod error;
mod health;
mod realtime;
mod state;
mod telephony;
mod webhook;
mod websocket;

use actix_web::{web, App, HttpServer};
use anyhow::{Context as _, Result};
use crate::config::AppConfig;
use crate::context::{ContextStore, InMemoryContextStore};
use crate::realtime::{ConnectionLifecycleManager, OpenAiRealtimeConnector};
use crate::state::AppState;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::bridge::SessionBridge;

#[actix_web::main]
async fn main() -> Result<()> {
    // Missing .env is fine; real deployments use the environment directly
    dotenv::dotenv().ok();

    init_tracing();

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting {} v{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
    info!(
        host = %config.server.host,
        port = config.server.port,
        model = %config.realtime.model,
        max_sessions = config.bridge.max_concurrent_sessions,
        "Configuration loaded"
    );
    if config.realtime.api_key.is_empty() {
        warn!("OPENAI_API_KEY is not set; realtime connections will be rejected");
    }
    if config.telephony.stream_endpoint.trim().is_empty() {
        warn!("TWILIO_STREAM_ENDPOINT is not set; incoming calls will hear the fallback message");
    }

    let bridge = build_bridge(&config)?;
    let app_state = AppState::new(config.clone(), Arc::clone(&bridge));

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(TracingLogger::default())
            .route("/health", web::get().to(health::health_check))
            .service(
                web::scope("/twilio")
                    .route("/voice", web::post().to(webhook::twilio_voice))
                    .route("/stream", web::get().to(websocket::twilio_stream)),
            )
    })
    .bind(&bind_addr)
    .with_context(|| format!("failed to bind {}", bind_addr))?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    bridge.terminate_all();
    info!("Server stopped gracefully");
    Ok(())
}

/// Wire the realtime connector, context store, and lifecycle manager into a bridge.
fn build_bridge(config: &AppConfig) -> Result<Arc<SessionBridge>> {
    let connector = OpenAiRealtimeConnector::new(&config.realtime).context("invalid realtime configuration")?;
    let context: Arc<dyn ContextStore> = Arc::new(InMemoryContextStore::new(config.realtime.instructions.clone()));

    let lifecycle = ConnectionLifecycleManager::new(
        Arc::new(connector),
        Arc::clone(&context),
        config.realtime.clone(),
        &config.bridge,
    );

    Ok(Arc::new(SessionBridge::new(lifecycle, context, config.bridge.clone())))
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voice_bridge=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Resolves on SIGINT, or SIGTERM where supported.
async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for SIGINT: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Received SIGINT");
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                info!("Received SIGTERM");
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
