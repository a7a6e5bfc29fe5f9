use crate::api::AppState;
use crate::error::Result;
use crate::services::engine::SkipOutcome;
use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/status", get(status))
        .route("/control/start", post(start))
        .route("/control/stop", post(stop))
        .route("/dashboard/transport/skip", post(skip))
}

async fn healthz() -> Json<serde_json::Value> {
    Json(json!({ "ok": true, "service": "radio-jockey" }))
}

async fn status(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let snapshot = state.engine.runtime().snapshot();
    let last_played: Vec<String> = state
        .builder
        .last_played()
        .await
        .into_iter()
        .map(|t| format!("{} by {}", t.title, t.artist))
        .collect();
    Json(json!({
        "running": snapshot.running,
        "tracksLoaded": snapshot.tracks_loaded,
        "phase": snapshot.phase,
        "bufferedSec": snapshot.buffered_sec,
        "lastPlayed": last_played,
        "lastError": snapshot.last_error,
    }))
}

async fn start(State(state): State<Arc<AppState>>) -> Result<Json<serde_json::Value>> {
    state.engine.clone().start().await?;
    Ok(Json(json!({ "ok": true })))
}

async fn stop(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    state.engine.stop().await;
    Json(json!({ "ok": true }))
}

async fn skip(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let outcome = state.engine.skip_current().await;
    let label = match outcome {
        SkipOutcome::Skipped => "skipped",
        SkipOutcome::Unsupported => "unsupported",
        SkipOutcome::Idle => "idle",
    };
    Json(json!({ "ok": true, "skip": label }))
}
