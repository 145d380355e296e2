//! ponytalk-server - client-facing gateway for the voice dialogue.
//!
//! Endpoints:
//! - GET  /health       - liveness and version
//! - GET  /api/config   - static client configuration
//! - WS   /ws/e2e-chat  - end-to-end realtime dialogue
//! - WS   /ws/chat      - staged ASR → LLM → TTS pipeline

mod e2e_ws;
mod messages;
mod settings;
mod staged_ws;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::State;
use axum::response::Json;
use axum::routing::get;
use axum::Router;
use clap::Parser;
use tower_http::cors::CorsLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

use ponytalk_text::Emotion;

use crate::settings::Settings;

/// Client-facing gateway for the PonyTalk voice dialogue.
#[derive(Parser, Debug)]
#[command(name = "ponytalk-server")]
#[command(about = "Voice dialogue gateway")]
#[command(version)]
struct Args {
    /// Listen address (e.g. 0.0.0.0:8000 or :8000)
    #[arg(long, default_value = ":8000")]
    addr: String,
}

/// Shared router state.
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let settings = Arc::new(Settings::from_env());
    info!("{} v{} starting", settings.app_name, settings.app_version);

    let state = AppState { settings };
    let app = Router::new()
        .route("/health", get(health))
        .route("/api/config", get(get_config))
        .route("/ws/chat", get(staged_ws::staged_ws))
        .route("/ws/e2e-chat", get(e2e_ws::e2e_ws))
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr = parse_addr(&args.addr)?;
    info!("listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": state.settings.app_version,
    }))
}

async fn get_config(State(_state): State<AppState>) -> Json<serde_json::Value> {
    let emotion_types: Vec<&str> = Emotion::ALL.iter().map(|e| e.as_str()).collect();
    Json(serde_json::json!({ "emotion_types": emotion_types }))
}

/// Parses a listen address; a bare `:port` binds all interfaces.
fn parse_addr(addr: &str) -> Result<SocketAddr> {
    let addr = if addr.starts_with(':') {
        format!("0.0.0.0{}", addr)
    } else {
        addr.to_string()
    };
    Ok(addr.parse()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_addr_accepts_bare_port() {
        assert_eq!(
            parse_addr(":8000").unwrap(),
            "0.0.0.0:8000".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            parse_addr("127.0.0.1:9001").unwrap(),
            "127.0.0.1:9001".parse::<SocketAddr>().unwrap()
        );
        assert!(parse_addr("not-an-addr").is_err());
    }
}
