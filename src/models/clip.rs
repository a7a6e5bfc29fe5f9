use crate::models::segment::ArbitrationReason;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// A virtual stereo slot used to plan crossfades for music clips.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Deck {
    A,
    B,
}

impl Deck {
    pub fn other(self) -> Deck {
        match self {
            Deck::A => Deck::B,
            Deck::B => Deck::A,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioChannel {
    Music,
    Voice,
    Jingle,
    Ads,
}

/// Linear gain ramp from `from` to `to` over the first `ramp_sec` seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GainRamp {
    pub from: f64,
    pub to: f64,
    pub ramp_sec: f64,
}

impl GainRamp {
    /// Ramp value at `t` seconds into the clip.
    pub fn value_at(&self, t: f64) -> f64 {
        if self.ramp_sec <= 0.0 {
            return self.to;
        }
        let p = (t / self.ramp_sec).clamp(0.0, 1.0);
        self.from + (self.to - self.from) * p
    }
}

/// A single atomic output element on the virtual timeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledClip {
    pub id: String,
    pub segment_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_segment_id: Option<String>,
    pub channel: AudioChannel,
    pub file_path: PathBuf,
    /// Seconds from stream start.
    pub start_at_sec: f64,
    pub source_offset_sec: f64,
    pub duration_sec: f64,
    pub gain: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gain_ramp: Option<GainRamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fade_in_sec: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fade_out_sec: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deck: Option<Deck>,
}

impl ScheduledClip {
    pub fn end_at_sec(&self) -> f64 {
        self.start_at_sec + self.duration_sec
    }

    pub fn is_active_at(&self, now_sec: f64) -> bool {
        now_sec >= self.start_at_sec && now_sec < self.end_at_sec()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FadeCurve {
    Log,
    Exp,
    Tri,
}

/// A planned deck-to-deck crossfade.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeckTransition {
    pub from_segment_id: String,
    pub to_segment_id: String,
    pub from_deck: Deck,
    pub to_deck: Deck,
    /// Start of the crossfade window, seconds from stream start.
    pub at_sec: f64,
    pub window_sec: f64,
    pub curve: FadeCurve,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueArbitration {
    pub segment_id: String,
    pub note: String,
    pub reason: ArbitrationReason,
}

/// Read-only view of the upcoming timeline within the lookahead window.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineSnapshot {
    pub deck_a: Vec<ScheduledClip>,
    pub deck_b: Vec<ScheduledClip>,
    pub voice_lane: Vec<ScheduledClip>,
    pub jingle_lane: Vec<ScheduledClip>,
    pub transitions: Vec<DeckTransition>,
    pub lookahead_sec: f64,
    pub queue: Vec<QueueArbitration>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ramp_interpolates_linearly() {
        let ramp = GainRamp {
            from: 1.0,
            to: 0.2,
            ramp_sec: 4.0,
        };
        assert_eq!(ramp.value_at(0.0), 1.0);
        assert!((ramp.value_at(2.0) - 0.6).abs() < 1e-9);
        assert_eq!(ramp.value_at(4.0), 0.2);
        assert_eq!(ramp.value_at(100.0), 0.2);
    }

    #[test]
    fn clip_activity_window_is_half_open() {
        let clip = ScheduledClip {
            id: "c".into(),
            segment_id: "s".into(),
            parent_segment_id: None,
            channel: AudioChannel::Music,
            file_path: "/tmp/a.wav".into(),
            start_at_sec: 10.0,
            source_offset_sec: 0.0,
            duration_sec: 5.0,
            gain: 1.0,
            gain_ramp: None,
            fade_in_sec: None,
            fade_out_sec: None,
            deck: Some(Deck::A),
        };
        assert!(!clip.is_active_at(9.99));
        assert!(clip.is_active_at(10.0));
        assert!(clip.is_active_at(14.99));
        assert!(!clip.is_active_at(15.0));
    }
}
