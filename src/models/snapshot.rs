use crate::models::{QueueItem, RenderedSegment};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuilderPhase {
    Songs,
    Commentary,
}

impl Default for BuilderPhase {
    fn default() -> Self {
        BuilderPhase::Songs
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublisherHealth {
    pub connected: bool,
    pub reconnects: u32,
    pub last_exit_code: Option<i32>,
    pub last_tool_output: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeterLevels {
    pub music: f64,
    pub voice: f64,
    pub jingle: f64,
    pub ads: f64,
    pub master: f64,
}

impl MeterLevels {
    /// Sum of absolute per-channel differences, used for the emit gate.
    pub fn l1_delta(&self, other: &MeterLevels) -> f64 {
        (self.music - other.music).abs()
            + (self.voice - other.voice).abs()
            + (self.jingle - other.jingle).abs()
            + (self.ads - other.ads).abs()
            + (self.master - other.master).abs()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeckState {
    pub segment_id: Option<String>,
    pub note: Option<String>,
    pub started_at_sec: Option<f64>,
    pub ends_at_sec: Option<f64>,
    pub active: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrossfaderState {
    /// 0.0 = fully on the outgoing deck, 1.0 = fully on the incoming deck.
    pub position: f64,
    pub active: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DuckingState {
    pub active: bool,
    pub amount: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecentError {
    pub ts: DateTime<Utc>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Counters {
    pub segments_built: u64,
    pub songs: u64,
    pub commentaries: u64,
    pub liners: u64,
    pub render_errors: u64,
    pub recoveries: u64,
    pub windows_pushed: u64,
}

/// The full observable state of the broadcaster.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardSnapshot {
    pub running: bool,
    pub stream_started_at: Option<DateTime<Utc>>,
    pub phase: BuilderPhase,
    pub tracks_loaded: usize,
    pub buffered_sec: f64,
    pub last_error: Option<String>,
    pub now_playing: Option<QueueItem>,
    pub queue: Vec<QueueItem>,
    pub recent_segments: Vec<RenderedSegment>,
    pub recent_errors: Vec<RecentError>,
    pub publisher: PublisherHealth,
    pub counters: Counters,
    pub master_playhead_sec: f64,
    pub deck_a: DeckState,
    pub deck_b: DeckState,
    pub voice_lane: DeckState,
    pub crossfader: CrossfaderState,
    pub ducking: DuckingState,
    pub lookahead_sec: f64,
    pub meters: MeterLevels,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{SegmentKind, SegmentSource};
    use std::path::PathBuf;

    #[test]
    fn meter_delta_is_l1() {
        let a = MeterLevels {
            music: 0.5,
            voice: 0.1,
            jingle: 0.0,
            ads: 0.0,
            master: 0.6,
        };
        let b = MeterLevels {
            music: 0.4,
            voice: 0.2,
            jingle: 0.0,
            ads: 0.0,
            master: 0.6,
        };
        assert!((a.l1_delta(&b) - 0.2).abs() < 1e-9);
    }

    #[test]
    fn snapshot_round_trips_through_json() {
        let seg = RenderedSegment::new(
            SegmentKind::Commentary,
            PathBuf::from("/tmp/talk.wav"),
            12.5,
            "evening talk break",
            SegmentSource::Manual,
        )
        .with_priority(120)
        .pinned();

        let snapshot = DashboardSnapshot {
            running: true,
            stream_started_at: Some(Utc::now()),
            phase: BuilderPhase::Commentary,
            tracks_loaded: 42,
            buffered_sec: 123.4,
            last_error: Some("boom".to_string()),
            now_playing: Some(QueueItem {
                segment: seg.clone(),
                enqueued_at: Utc::now(),
                enqueue_seq: 7,
            }),
            queue: vec![QueueItem {
                segment: seg,
                enqueued_at: Utc::now(),
                enqueue_seq: 8,
            }],
            recent_errors: vec![RecentError {
                ts: Utc::now(),
                message: "older boom".to_string(),
            }],
            lookahead_sec: 30.0,
            ..Default::default()
        };

        let json = serde_json::to_string(&snapshot).expect("serialize");
        let back: DashboardSnapshot = serde_json::from_str(&json).expect("deserialize");

        assert_eq!(back.running, snapshot.running);
        assert_eq!(back.phase, snapshot.phase);
        assert_eq!(back.tracks_loaded, snapshot.tracks_loaded);
        assert_eq!(back.buffered_sec, snapshot.buffered_sec);
        assert_eq!(back.last_error, snapshot.last_error);
        assert_eq!(back.queue.len(), 1);
        assert_eq!(back.queue[0].enqueue_seq, 8);
        let np = back.now_playing.expect("now playing survives");
        assert_eq!(np.segment.priority, 120);
        assert!(np.segment.pinned);
        assert_eq!(np.segment.commentary_text, None);
        assert_eq!(back.recent_errors[0].message, "older boom");
    }
}
