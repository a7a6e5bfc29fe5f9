pub mod builder;
pub mod commentary;
pub mod engine;
pub mod process;
pub mod queue;
pub mod renderer;
pub mod scheduler;
pub mod sink;
pub mod state;
#[cfg(test)]
pub(crate) mod testutil;
pub mod tts;
pub mod track_cache;

pub use builder::SegmentBuilder;
pub use commentary::CommentaryGenerator;
pub use engine::PlayoutEngine;
pub use process::ProcessRunner;
pub use renderer::TimelineRenderer;
pub use sink::RtmpSink;
pub use state::RuntimeState;
pub use track_cache::TrackCache;
pub use tts::TtsClient;
