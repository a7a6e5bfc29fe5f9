use crate::api::AppState;
use crate::error::Result;
use crate::models::TimelineSnapshot;
use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use std::sync::Arc;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/timeline/snapshot", get(snapshot))
        .route("/timeline/rebuild", post(rebuild))
}

async fn snapshot(State(state): State<Arc<AppState>>) -> Json<TimelineSnapshot> {
    Json(state.engine.timeline_snapshot().await)
}

async fn rebuild(State(state): State<Arc<AppState>>) -> Result<Json<TimelineSnapshot>> {
    Ok(Json(state.engine.rebuild_timeline().await?))
}
