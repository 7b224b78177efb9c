/*
 * Conversation Graph Engine - Server Entry Point
 * Copyright (c) 2026 Conversation Graph Engine Contributors
 *
 * This work is licensed under the Creative Commons Attribution-NonCommercial 4.0 International License.
 * To view a copy of this license, visit http://creativecommons.org/licenses/by-nc/4.0/
 *
 * You are free to share and adapt this work for non-commercial purposes with attribution.
 * Commercial use is prohibited without explicit written permission.
 *
 * For commercial licensing inquiries, please contact the project maintainers.
 */

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tower_http::cors::CorsLayer;
use tracing_subscriber::EnvFilter;

use conversation_graph_engine::config::AppConfig;
use conversation_graph_engine::http_clients::OutboundLimits;
use conversation_graph_engine::ingress::{sse, ws, AppState};
use conversation_graph_engine::registry::SessionRegistry;
use conversation_graph_engine::store::EventStore;

/// Live-conversation ingestion engine: audio/text ingress, diarization,
/// chunking, and an LLM-backed conversation graph, fanned out over
/// WebSocket and Server-Sent Events.
#[derive(Parser)]
#[command(name = "conversation-graph-engine")]
#[command(version)]
#[command(about = "Live-conversation ingestion and analysis engine")]
struct Cli {
    /// Address to bind the HTTP/WebSocket server on.
    #[arg(long)]
    addr: Option<String>,

    /// sqlite connection string for the event store.
    #[arg(long)]
    database_url: Option<String>,

    /// Bearer token required on `/ws/transcripts` and `/api/import/process-file`.
    #[arg(long)]
    auth_token: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let mut config = AppConfig::load().context("failed to load configuration")?;
    if let Some(addr) = cli.addr {
        config.bind_addr = addr;
    }
    if let Some(database_url) = cli.database_url {
        config.database_url = database_url;
    }
    if cli.auth_token.is_some() {
        config.auth_token = cli.auth_token;
    }
    let config = Arc::new(config);

    let store = EventStore::connect(&config.database_url)
        .await
        .context("failed to connect to event store")?;
    let registry = Arc::new(SessionRegistry::new());
    let limits = OutboundLimits::new(config.http_out_permits, config.llm_in_flight_permits);
    let state = AppState::new(registry, store, config.clone(), limits);

    let app = axum::Router::new()
        .route("/ws/transcripts", axum::routing::get(ws::upgrade))
        .route("/api/import/process-file", axum::routing::post(sse::process_file))
        .route("/healthz", axum::routing::get(healthz))
        .layer(CorsLayer::permissive())
        .layer(axum::extract::DefaultBodyLimit::max(config.max_body_bytes))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    tracing::info!(addr = %config.bind_addr, "conversation graph engine listening");

    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}

async fn healthz() -> &'static str {
    "ok"
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}
