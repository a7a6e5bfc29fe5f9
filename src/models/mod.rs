pub mod clip;
pub mod segment;
pub mod snapshot;
pub mod track;

pub use clip::{
    AudioChannel, Deck, DeckTransition, FadeCurve, GainRamp, QueueArbitration, ScheduledClip,
    TimelineSnapshot,
};
pub use segment::{ArbitrationReason, QueueItem, RenderedSegment, SegmentKind, SegmentSource};
pub use snapshot::{
    BuilderPhase, Counters, CrossfaderState, DashboardSnapshot, DeckState, DuckingState,
    MeterLevels, PublisherHealth, RecentError,
};
pub use track::Track;
