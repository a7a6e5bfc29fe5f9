use crate::api::AppState;
use crate::error::RjError;
use crate::models::{DashboardSnapshot, QueueItem};
use axum::{
    body::Body,
    extract::{Path as AxumPath, Query, State},
    http::header,
    response::Response,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use validator::Validate;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/dashboard/snapshot", get(snapshot))
        .route("/dashboard/queue", get(queue))
        .route("/dashboard/queue/commentary", post(enqueue_commentary))
        .route("/dashboard/queue/track", post(enqueue_track))
        .route(
            "/dashboard/queue/:id",
            axum::routing::delete(remove_queued).patch(update_queued),
        )
        .route("/dashboard/media/:segment_id", get(media_by_segment))
        .route("/dashboard/media-by-path", get(media_by_path))
        .route("/dashboard/commentary/history", get(commentary_history))
}

async fn snapshot(State(state): State<Arc<AppState>>) -> Json<DashboardSnapshot> {
    Json(state.engine.runtime().snapshot())
}

async fn queue(State(state): State<Arc<AppState>>) -> Json<Vec<QueueItem>> {
    Json(state.engine.runtime().snapshot().queue)
}

#[derive(Debug, Deserialize, Validate)]
struct EnqueueCommentaryRequest {
    #[validate(length(min = 1, message = "text must not be empty"))]
    text: String,
}

async fn enqueue_commentary(
    State(state): State<Arc<AppState>>,
    Json(req): Json<EnqueueCommentaryRequest>,
) -> crate::error::Result<Json<serde_json::Value>> {
    req.validate()
        .map_err(|e| RjError::Validation(e.to_string()))?;

    let segment = state.builder.build_manual_commentary(&req.text).await?;
    let item = state.engine.enqueue_segment(segment).await;
    Ok(Json(json!({ "ok": true, "segment": item.segment })))
}

#[derive(Debug, Deserialize, Validate)]
struct EnqueueTrackRequest {
    #[validate(length(min = 1, message = "title must not be empty"))]
    title: String,
    artist: Option<String>,
    #[validate(length(min = 1, message = "youtube_url must not be empty"))]
    youtube_url: String,
}

async fn enqueue_track(
    State(state): State<Arc<AppState>>,
    Json(req): Json<EnqueueTrackRequest>,
) -> crate::error::Result<Json<serde_json::Value>> {
    req.validate()
        .map_err(|e| RjError::Validation(e.to_string()))?;

    let segment = state
        .builder
        .build_manual_song(&req.title, req.artist.as_deref(), &req.youtube_url)
        .await?;
    let item = state.engine.enqueue_segment(segment).await;
    Ok(Json(json!({ "ok": true, "segment": item.segment })))
}

async fn remove_queued(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> crate::error::Result<Json<serde_json::Value>> {
    state.engine.remove_queued(&id).await?;
    Ok(Json(json!({ "ok": true })))
}

#[derive(Debug, Deserialize)]
struct UpdateQueuedRequest {
    priority: Option<u16>,
    pinned: Option<bool>,
}

async fn update_queued(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
    Json(req): Json<UpdateQueuedRequest>,
) -> crate::error::Result<Json<serde_json::Value>> {
    let item = state
        .engine
        .update_queued(&id, req.priority, req.pinned)
        .await?;
    Ok(Json(json!({ "ok": true, "item": item })))
}

async fn media_by_segment(
    State(state): State<Arc<AppState>>,
    AxumPath(segment_id): AxumPath<String>,
) -> crate::error::Result<Response> {
    let path = state
        .engine
        .runtime()
        .segment_path(&segment_id)
        .ok_or_else(|| RjError::NotFound(format!("unknown segment: {}", segment_id)))?;
    serve_wav(&path).await
}

#[derive(Debug, Deserialize)]
struct MediaByPathQuery {
    path: String,
}

async fn media_by_path(
    State(state): State<Arc<AppState>>,
    Query(query): Query<MediaByPathQuery>,
) -> crate::error::Result<Response> {
    let requested = PathBuf::from(&query.path);
    let resolved = tokio::fs::canonicalize(&requested)
        .await
        .map_err(|_| RjError::NotFound(format!("no such file: {}", query.path)))?;

    let mut allowed = vec![state.config.work_dir.clone()];
    if let Some(liner_dir) = &state.config.liner_dir {
        allowed.push(liner_dir.clone());
    }
    let permitted = allowed.iter().any(|root| {
        std::fs::canonicalize(root)
            .map(|root| resolved.starts_with(&root))
            .unwrap_or(false)
    });
    if !permitted {
        return Err(RjError::Forbidden(
            "path resolves outside the media directories".to_string(),
        ));
    }
    serve_wav(&resolved).await
}

async fn serve_wav(path: &Path) -> crate::error::Result<Response> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|_| RjError::NotFound(format!("unreadable file: {}", path.display())))?;
    Ok(Response::builder()
        .header(header::CONTENT_TYPE, "audio/wav")
        .header(header::CONTENT_LENGTH, bytes.len())
        .body(Body::from(bytes))
        .expect("static response builds"))
}

async fn commentary_history(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!({
        "ok": true,
        "history": state.commentary.history(),
        "phrases": state.commentary.phrase_frequencies(),
    }))
}
