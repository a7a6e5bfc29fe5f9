use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const MAX_PRIORITY: u16 = 200;
pub const AUTO_PRIORITY: u16 = 50;
pub const MANUAL_PRIORITY: u16 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SegmentKind {
    Song,
    Commentary,
    Liner,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SegmentSource {
    Auto,
    Manual,
}

/// A produced audio file ready for playout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderedSegment {
    pub id: String,
    pub kind: SegmentKind,
    pub file_path: PathBuf,
    pub duration_sec: f64,
    pub note: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commentary_text: Option<String>,
    pub source: SegmentSource,
    pub priority: u16,
    pub pinned: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<crate::models::clip::AudioChannel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_start_sec: Option<f64>,
}

impl RenderedSegment {
    pub fn new(
        kind: SegmentKind,
        file_path: PathBuf,
        duration_sec: f64,
        note: impl Into<String>,
        source: SegmentSource,
    ) -> Self {
        let priority = match source {
            SegmentSource::Auto => AUTO_PRIORITY,
            SegmentSource::Manual => MANUAL_PRIORITY,
        };
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            file_path,
            duration_sec,
            note: note.into(),
            commentary_text: None,
            source,
            priority,
            pinned: false,
            channel: None,
            scheduled_start_sec: None,
        }
    }

    pub fn with_priority(mut self, priority: u16) -> Self {
        self.priority = clamp_priority(priority);
        self
    }

    pub fn pinned(mut self) -> Self {
        self.pinned = true;
        self
    }
}

pub fn clamp_priority(priority: u16) -> u16 {
    priority.min(MAX_PRIORITY)
}

/// Why a queued item sits where it does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArbitrationReason {
    ManualPinned,
    ManualPriority,
    AutoPriority,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    pub segment: RenderedSegment,
    pub enqueued_at: DateTime<Utc>,
    /// Monotonic enqueue sequence; the deterministic tie-break.
    pub enqueue_seq: u64,
}

impl QueueItem {
    pub fn arbitration_reason(&self) -> ArbitrationReason {
        match (self.segment.pinned, self.segment.source) {
            (true, SegmentSource::Manual) => ArbitrationReason::ManualPinned,
            (_, SegmentSource::Manual) => ArbitrationReason::ManualPriority,
            _ => ArbitrationReason::AutoPriority,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_is_clamped() {
        let seg = RenderedSegment::new(
            SegmentKind::Song,
            PathBuf::from("/tmp/a.wav"),
            10.0,
            "test",
            SegmentSource::Manual,
        )
        .with_priority(999);
        assert_eq!(seg.priority, MAX_PRIORITY);
    }

    #[test]
    fn default_priorities_by_source() {
        let auto = RenderedSegment::new(
            SegmentKind::Song,
            PathBuf::from("a.wav"),
            1.0,
            "",
            SegmentSource::Auto,
        );
        let manual = RenderedSegment::new(
            SegmentKind::Song,
            PathBuf::from("a.wav"),
            1.0,
            "",
            SegmentSource::Manual,
        );
        assert_eq!(auto.priority, 50);
        assert_eq!(manual.priority, 100);
    }

    #[test]
    fn arbitration_reason_tags() {
        let mut seg = RenderedSegment::new(
            SegmentKind::Commentary,
            PathBuf::from("a.wav"),
            1.0,
            "",
            SegmentSource::Manual,
        );
        let item = |seg: &RenderedSegment| QueueItem {
            segment: seg.clone(),
            enqueued_at: Utc::now(),
            enqueue_seq: 0,
        };

        assert_eq!(
            item(&seg).arbitration_reason(),
            ArbitrationReason::ManualPriority
        );
        seg.pinned = true;
        assert_eq!(
            item(&seg).arbitration_reason(),
            ArbitrationReason::ManualPinned
        );
        seg.source = SegmentSource::Auto;
        assert_eq!(
            item(&seg).arbitration_reason(),
            ArbitrationReason::AutoPriority
        );
    }
}
