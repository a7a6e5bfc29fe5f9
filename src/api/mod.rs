pub mod control;
pub mod dashboard;
pub mod events;
pub mod timeline;

use crate::config::Config;
use crate::services::{CommentaryGenerator, PlayoutEngine, SegmentBuilder};
use axum::Router;
use std::sync::Arc;

/// Shared handler state. The engine handle is owned by `main` and passed in;
/// the facade never reaches for process-wide state.
pub struct AppState {
    pub config: Arc<Config>,
    pub engine: Arc<PlayoutEngine>,
    pub builder: Arc<SegmentBuilder>,
    pub commentary: Arc<CommentaryGenerator>,
}

pub fn routes(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(control::routes())
        .merge(dashboard::routes())
        .merge(timeline::routes())
        .merge(events::routes())
        .with_state(state)
}
