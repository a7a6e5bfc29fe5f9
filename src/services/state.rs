//! Runtime State
//!
//! The single in-process authoritative state. Mutations are synchronous and
//! each one emits a compact event to subscribers; bounded rings keep the
//! recent past observable without unbounded growth.

use crate::models::{DashboardSnapshot, MeterLevels, QueueItem, RecentError, RenderedSegment};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::broadcast;

pub const EVENT_RING: usize = 200;
pub const SEGMENT_RING: usize = 50;
pub const ERROR_RING: usize = 50;
/// Minimum L1 meter change that produces a `meters` event.
pub const METER_DELTA_GATE: f64 = 0.02;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeEvent {
    pub ts: DateTime<Utc>,
    pub revision: u64,
    pub event: String,
    pub payload: serde_json::Value,
}

struct StateInner {
    snapshot: DashboardSnapshot,
    events: VecDeque<RuntimeEvent>,
    revision: u64,
    last_meters: MeterLevels,
}

pub struct RuntimeState {
    inner: Mutex<StateInner>,
    events_tx: broadcast::Sender<RuntimeEvent>,
}

impl RuntimeState {
    pub fn new(tracks_loaded: usize) -> Self {
        let (events_tx, _) = broadcast::channel(256);
        let snapshot = DashboardSnapshot {
            tracks_loaded,
            ..Default::default()
        };
        Self {
            inner: Mutex::new(StateInner {
                snapshot,
                events: VecDeque::with_capacity(EVENT_RING),
                revision: 0,
                last_meters: MeterLevels::default(),
            }),
            events_tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.events_tx.subscribe()
    }

    pub fn snapshot(&self) -> DashboardSnapshot {
        self.inner.lock().expect("state mutex poisoned").snapshot.clone()
    }

    pub fn revision(&self) -> u64 {
        self.inner.lock().expect("state mutex poisoned").revision
    }

    /// Events after `revision`, or `None` when that far back has been
    /// evicted from the ring and the caller needs a fresh snapshot.
    pub fn events_since(&self, revision: u64) -> Option<Vec<RuntimeEvent>> {
        let inner = self.inner.lock().expect("state mutex poisoned");
        if revision >= inner.revision {
            return Some(Vec::new());
        }
        let oldest_retained = inner.events.front().map(|e| e.revision)?;
        if revision + 1 < oldest_retained {
            return None;
        }
        Some(
            inner
                .events
                .iter()
                .filter(|e| e.revision > revision)
                .cloned()
                .collect(),
        )
    }

    /// Publish an event without touching the snapshot.
    pub fn publish(&self, event: &str, payload: serde_json::Value) {
        let mut inner = self.inner.lock().expect("state mutex poisoned");
        self.publish_locked(&mut inner, event, payload);
    }

    /// Mutate the snapshot and publish a compact event for it.
    pub fn update<F>(&self, event: &str, payload: serde_json::Value, mutate: F)
    where
        F: FnOnce(&mut DashboardSnapshot),
    {
        let mut inner = self.inner.lock().expect("state mutex poisoned");
        mutate(&mut inner.snapshot);
        self.publish_locked(&mut inner, event, payload);
    }

    /// Mutate the snapshot without emitting an event. For high-frequency
    /// fields (playhead, buffered seconds) surfaced by periodic
    /// `state.updated` events instead.
    pub fn set_quiet<F>(&self, mutate: F)
    where
        F: FnOnce(&mut DashboardSnapshot),
    {
        let mut inner = self.inner.lock().expect("state mutex poisoned");
        mutate(&mut inner.snapshot);
    }

    fn publish_locked(&self, inner: &mut StateInner, event: &str, payload: serde_json::Value) {
        inner.revision += 1;
        let ev = RuntimeEvent {
            ts: Utc::now(),
            revision: inner.revision,
            event: event.to_string(),
            payload,
        };
        if inner.events.len() == EVENT_RING {
            inner.events.pop_front();
        }
        inner.events.push_back(ev.clone());
        let _ = self.events_tx.send(ev);
    }

    /// Apply new meter readings; emits only when the L1 change clears the
    /// gate. Returns whether an event went out.
    pub fn set_meters(&self, meters: MeterLevels) -> bool {
        let mut inner = self.inner.lock().expect("state mutex poisoned");
        inner.snapshot.meters = meters;
        if meters.l1_delta(&inner.last_meters) <= METER_DELTA_GATE {
            return false;
        }
        inner.last_meters = meters;
        let payload = serde_json::to_value(meters).unwrap_or_default();
        self.publish_locked(&mut inner, "meters", payload);
        true
    }

    pub fn record_error(&self, message: &str) {
        let mut inner = self.inner.lock().expect("state mutex poisoned");
        inner.snapshot.last_error = Some(message.to_string());
        if inner.snapshot.recent_errors.len() == ERROR_RING {
            inner.snapshot.recent_errors.remove(0);
        }
        inner.snapshot.recent_errors.push(RecentError {
            ts: Utc::now(),
            message: message.to_string(),
        });
        let payload = serde_json::json!({ "message": message });
        self.publish_locked(&mut inner, "error", payload);
    }

    pub fn push_recent_segment(&self, segment: RenderedSegment) {
        let mut inner = self.inner.lock().expect("state mutex poisoned");
        if inner.snapshot.recent_segments.len() == SEGMENT_RING {
            inner.snapshot.recent_segments.remove(0);
        }
        inner.snapshot.recent_segments.push(segment);
    }

    pub fn set_queue_view(&self, queue: Vec<QueueItem>, buffered_sec: f64) {
        let payload = serde_json::json!({
            "len": queue.len(),
            "bufferedSec": buffered_sec,
        });
        self.update("queue.updated", payload, |s| {
            s.queue = queue;
            s.buffered_sec = buffered_sec.max(0.0);
        });
    }

    /// Find a segment's file path anywhere it is still owned: now-playing,
    /// the queue, or the recent ring.
    pub fn segment_path(&self, segment_id: &str) -> Option<std::path::PathBuf> {
        let inner = self.inner.lock().expect("state mutex poisoned");
        let snap = &inner.snapshot;
        if let Some(np) = &snap.now_playing {
            if np.segment.id == segment_id {
                return Some(np.segment.file_path.clone());
            }
        }
        snap.queue
            .iter()
            .map(|item| &item.segment)
            .chain(snap.recent_segments.iter())
            .find(|seg| seg.id == segment_id)
            .map(|seg| seg.file_path.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{SegmentKind, SegmentSource};
    use std::path::PathBuf;

    #[test]
    fn revision_is_monotone_and_ring_bounded() {
        let state = RuntimeState::new(0);
        for i in 0..(EVENT_RING + 25) {
            state.publish("tick", serde_json::json!({ "i": i }));
        }
        assert_eq!(state.revision(), (EVENT_RING + 25) as u64);
        let inner = state.inner.lock().unwrap();
        assert_eq!(inner.events.len(), EVENT_RING);
        assert_eq!(inner.events.front().unwrap().revision, 26);
    }

    #[test]
    fn events_since_replays_or_signals_eviction() {
        let state = RuntimeState::new(0);
        for _ in 0..10 {
            state.publish("tick", serde_json::Value::Null);
        }
        let replay = state.events_since(7).expect("still in ring");
        assert_eq!(replay.len(), 3);
        assert_eq!(replay[0].revision, 8);

        assert_eq!(state.events_since(10).unwrap().len(), 0);

        for _ in 0..EVENT_RING {
            state.publish("tick", serde_json::Value::Null);
        }
        assert!(state.events_since(5).is_none());
    }

    #[test]
    fn meter_gate_suppresses_small_changes() {
        let state = RuntimeState::new(0);
        let mut meters = MeterLevels {
            music: 0.5,
            ..Default::default()
        };
        meters.master = 0.5;
        assert!(state.set_meters(meters));

        // A change below the gate updates the snapshot but emits nothing.
        meters.music = 0.505;
        assert!(!state.set_meters(meters));
        assert_eq!(state.snapshot().meters.music, 0.505);

        meters.music = 0.6;
        assert!(state.set_meters(meters));
    }

    #[test]
    fn error_ring_is_bounded() {
        let state = RuntimeState::new(0);
        for i in 0..(ERROR_RING + 10) {
            state.record_error(&format!("e{i}"));
        }
        let snap = state.snapshot();
        assert_eq!(snap.recent_errors.len(), ERROR_RING);
        assert_eq!(snap.last_error.as_deref(), Some("e59"));
    }

    #[test]
    fn segment_path_searches_all_owners() {
        let state = RuntimeState::new(0);
        let seg = RenderedSegment::new(
            SegmentKind::Song,
            PathBuf::from("/tmp/x.wav"),
            10.0,
            "x",
            SegmentSource::Auto,
        );
        let id = seg.id.clone();
        state.push_recent_segment(seg);
        assert_eq!(state.segment_path(&id), Some(PathBuf::from("/tmp/x.wav")));
        assert_eq!(state.segment_path("ghost"), None);
    }
}
