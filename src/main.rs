mod api;
mod config;
mod error;
mod models;
mod services;

use crate::api::AppState;
use crate::config::Config;
use crate::services::{
    CommentaryGenerator, PlayoutEngine, ProcessRunner, RtmpSink, RuntimeState, SegmentBuilder,
    TimelineRenderer, TrackCache, TtsClient,
};
use axum::http::{header, Method};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,radio_jockey=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Arc::new(Config::from_env()?);
    tracing::info!(
        "Configuration loaded: station '{}', work dir {}, rtmp {}",
        config.station_name,
        config.work_dir.display(),
        config.rtmp_url
    );
    if config.llm_api_key.is_none() {
        tracing::warn!("No LLM API key set - commentary will use the deterministic fallback");
    }

    tokio::fs::create_dir_all(&config.work_dir).await?;

    // Load the track catalog
    let tracks = Arc::new(models::track::load_catalog(&config.catalog_path)?);
    tracing::info!("Catalog loaded: {} tracks", tracks.len());

    // Initialize services
    let runner = Arc::new(ProcessRunner::new());
    let cache = Arc::new(TrackCache::new(runner.clone(), &config.work_dir).await?);
    let renderer = Arc::new(TimelineRenderer::new(runner.clone()));
    let tts = Arc::new(TtsClient::new(config.tts_base_url.clone()));
    let commentary = Arc::new(CommentaryGenerator::new(&config));
    let builder = Arc::new(SegmentBuilder::new(
        &config,
        tracks.clone(),
        cache.clone(),
        renderer.clone(),
        tts.clone(),
        commentary.clone(),
        runner.clone(),
    ));
    let state = Arc::new(RuntimeState::new(tracks.len()));
    let sink = Arc::new(RtmpSink::new(
        config.work_dir.clone(),
        config.rtmp_url.clone(),
    ));
    let engine = Arc::new(PlayoutEngine::new(
        config.clone(),
        tracks.clone(),
        builder.clone(),
        state.clone(),
        sink.clone(),
        renderer.clone(),
        runner.clone(),
    ));

    // Start broadcasting right away; the control API can restart later if
    // this fails (e.g. the RTMP target is not up yet).
    if let Err(e) = engine.clone().start().await {
        tracing::error!("Autostart failed: {} (waiting for /control/start)", e);
    }

    let app_state = Arc::new(AppState {
        config: config.clone(),
        engine: engine.clone(),
        builder: builder.clone(),
        commentary: commentary.clone(),
    });

    // Build router
    let app = api::routes(app_state)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([Method::GET, Method::POST, Method::PATCH, Method::DELETE])
                .allow_headers([header::CONTENT_TYPE]),
        );

    // Start server
    let addr = format!("0.0.0.0:{}", config.server_port);
    tracing::info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
