//! Read-only HTTP status API.

use std::net::SocketAddr;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use serde_json::json;
use tokio::net::TcpListener;

use fleetbid_auction::RoundSnapshot;
use fleetbid_network::DeviceSnapshot;
use fleetbid_state::ScoreEntry;

use crate::orchestrator::{Orchestrator, OutcomeRecord};

pub struct StatusServer {
    listener: TcpListener,
    orchestrator: Orchestrator,
}

impl StatusServer {
    pub async fn bind(bind_addr: &str, orchestrator: Orchestrator) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|e| anyhow::anyhow!("failed to bind status API on {bind_addr}: {e}"))?;
        Ok(Self { listener, orchestrator })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self) -> anyhow::Result<()> {
        tracing::info!(addr = %self.local_addr()?, "status API listening");
        axum::serve(self.listener, router(self.orchestrator)).await?;
        Ok(())
    }
}

pub fn router(orchestrator: Orchestrator) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/devices", get(api_devices))
        .route("/api/rounds", get(api_rounds))
        .route("/api/scores", get(api_scores))
        .route("/api/outcomes", get(api_outcomes))
        .with_state(orchestrator)
}

async fn health(State(orchestrator): State<Orchestrator>) -> Json<serde_json::Value> {
    let state = orchestrator.shared_state();
    let state = state.read().await;
    let uptime = Utc::now().signed_duration_since(state.started_at).num_seconds().max(0);
    Json(json!({
        "status": "ok",
        "devices": state.registry.len(),
        "open_rounds": state.coordinator.open_rounds(),
        "ledger_observations": state.ledger.len(),
        "uptime_secs": uptime,
    }))
}

async fn api_devices(State(orchestrator): State<Orchestrator>) -> Json<Vec<DeviceSnapshot>> {
    Json(orchestrator.devices().await)
}

async fn api_rounds(State(orchestrator): State<Orchestrator>) -> Json<Vec<RoundSnapshot>> {
    Json(orchestrator.rounds().await)
}

async fn api_scores(State(orchestrator): State<Orchestrator>) -> Json<Vec<ScoreEntry>> {
    Json(orchestrator.scores().await)
}

async fn api_outcomes(State(orchestrator): State<Orchestrator>) -> Json<Vec<OutcomeRecord>> {
    Json(orchestrator.outcomes().await)
}
