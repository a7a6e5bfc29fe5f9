//! Playout Engine
//!
//! The single active agent: keeps buffered seconds above the target by
//! driving the Segment Builder, places output through either the per-segment
//! sink path or the timeline/chunked path, advances segment lifecycles, and
//! publishes meters and state to the runtime bus.

use crate::config::Config;
use crate::error::{Result, RjError};
use crate::models::{
    AudioChannel, CrossfaderState, Deck, DeckState, DuckingState, MeterLevels, QueueArbitration,
    QueueItem, RenderedSegment, ScheduledClip, SegmentKind, TimelineSnapshot, Track,
};
use crate::services::builder::{write_silence_wav, SegmentBuilder};
use crate::services::queue::PlayoutQueue;
use crate::services::renderer::{RenderClip, TimelineRenderer};
use crate::services::scheduler::TimelineScheduler;
use crate::services::sink::{RtmpSink, SinkEvent};
use crate::services::state::RuntimeState;
use crate::services::track_cache::probe_duration;
use crate::services::process::ProcessRunner;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

const TICK: Duration = Duration::from_millis(250);
const METER_INTERVAL: Duration = Duration::from_millis(300);
/// Finished clips linger this long before being dropped from the schedule.
const FINISHED_CLIP_GRACE_SEC: f64 = 4.0;
const RECOVERY_SILENCE_SEC: f64 = 2.0;
/// How far ahead of the wall clock the chunked renderer keeps the horizon.
const CHUNK_LEAD_SEC: f64 = 8.0;
pub const LOOKAHEAD_SEC: f64 = 30.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    PerSegment,
    Timeline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipOutcome {
    Skipped,
    Unsupported,
    Idle,
}

/// Wall clock expressed as seconds since stream start.
pub struct StreamClock {
    started: StdMutex<Option<Instant>>,
}

impl StreamClock {
    pub fn new() -> Self {
        Self {
            started: StdMutex::new(None),
        }
    }

    pub fn start(&self) {
        *self.started.lock().expect("clock mutex") = Some(Instant::now());
    }

    pub fn now_sec(&self) -> f64 {
        self.started
            .lock()
            .expect("clock mutex")
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SegPhase {
    Enqueued,
    Started,
    Finished,
}

/// Guards the `enqueued -> started -> finished` (or `enqueued -> removed`)
/// ordering: transitions fire once, in order, never both paths.
#[derive(Default)]
struct Lifecycle {
    phases: HashMap<String, SegPhase>,
}

impl Lifecycle {
    fn on_enqueued(&mut self, id: &str) -> bool {
        if self.phases.contains_key(id) {
            return false;
        }
        self.phases.insert(id.to_string(), SegPhase::Enqueued);
        true
    }

    fn on_started(&mut self, id: &str) -> bool {
        match self.phases.get(id) {
            Some(SegPhase::Enqueued) => {
                self.phases.insert(id.to_string(), SegPhase::Started);
                true
            }
            _ => false,
        }
    }

    fn on_finished(&mut self, id: &str) -> bool {
        match self.phases.get(id) {
            Some(SegPhase::Started) => {
                self.phases.insert(id.to_string(), SegPhase::Finished);
                true
            }
            _ => false,
        }
    }

    fn on_removed(&mut self, id: &str) -> bool {
        match self.phases.get(id) {
            Some(SegPhase::Enqueued) => {
                self.phases.remove(id);
                true
            }
            _ => false,
        }
    }

    fn forget(&mut self, id: &str) {
        self.phases.remove(id);
    }

    /// Drop everything but still-queued entries (used on restart).
    fn reset_started(&mut self) {
        self.phases.retain(|_, phase| *phase == SegPhase::Enqueued);
    }
}

pub struct PlayoutEngine {
    config: Arc<Config>,
    tracks: Arc<Vec<Track>>,
    builder: Arc<SegmentBuilder>,
    queue: Arc<Mutex<PlayoutQueue>>,
    scheduler: Arc<Mutex<TimelineScheduler>>,
    state: Arc<RuntimeState>,
    sink: Arc<RtmpSink>,
    renderer: Arc<TimelineRenderer>,
    runner: Arc<ProcessRunner>,
    running: AtomicBool,
    mode: OutputMode,
    clock: StreamClock,
    /// Single in-flight chunk render loop; re-entry bounces off this lock.
    render_gate: Arc<Mutex<()>>,
    horizon_sec: StdMutex<f64>,
    lifecycle: StdMutex<Lifecycle>,
    /// Segments pulled from the queue and not yet finished.
    active: StdMutex<HashMap<String, QueueItem>>,
    push_inflight: AtomicBool,
    last_meter_at: StdMutex<Option<Instant>>,
    publisher_seen_start: AtomicBool,
    forwarder_spawned: AtomicBool,
}

impl PlayoutEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<Config>,
        tracks: Arc<Vec<Track>>,
        builder: Arc<SegmentBuilder>,
        state: Arc<RuntimeState>,
        sink: Arc<RtmpSink>,
        renderer: Arc<TimelineRenderer>,
        runner: Arc<ProcessRunner>,
    ) -> Self {
        let mode = if config.timeline_engine_v2 {
            OutputMode::Timeline
        } else {
            OutputMode::PerSegment
        };
        let mut scheduler = TimelineScheduler::new(None);
        scheduler.set_carry_over_offset(config.carry_over_offset);
        Self {
            config,
            tracks,
            builder,
            queue: Arc::new(Mutex::new(PlayoutQueue::new())),
            scheduler: Arc::new(Mutex::new(scheduler)),
            state,
            sink,
            renderer,
            runner,
            running: AtomicBool::new(false),
            mode,
            clock: StreamClock::new(),
            render_gate: Arc::new(Mutex::new(())),
            horizon_sec: StdMutex::new(0.0),
            lifecycle: StdMutex::new(Lifecycle::default()),
            active: StdMutex::new(HashMap::new()),
            push_inflight: AtomicBool::new(false),
            last_meter_at: StdMutex::new(None),
            publisher_seen_start: AtomicBool::new(false),
            forwarder_spawned: AtomicBool::new(false),
        }
    }

    pub fn mode(&self) -> OutputMode {
        self.mode
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn runtime(&self) -> &Arc<RuntimeState> {
        &self.state
    }

    pub fn now_sec(&self) -> f64 {
        self.clock.now_sec()
    }

    pub async fn start(self: Arc<Self>) -> Result<()> {
        if self.tracks.is_empty() {
            return Err(RjError::CatalogInvalid("catalog is empty".to_string()));
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        tokio::fs::create_dir_all(&self.config.work_dir).await?;

        // Subscribe before the sink emits its first event.
        if !self.forwarder_spawned.swap(true, Ordering::SeqCst) {
            self.clone().spawn_sink_forwarder();
        }

        if let Err(e) = self.sink.start().await {
            self.running.store(false, Ordering::SeqCst);
            return Err(e);
        }

        // Station-ID duration is probed once; short or unreadable files
        // disable the prepend rule.
        if let Some(path) = &self.config.station_id_wav {
            let duration = probe_duration(&self.runner, path).await;
            let mut scheduler = self.scheduler.lock().await;
            scheduler.set_station_id(Some((path.clone(), duration)));
        }

        // A (re)start is a fresh stream: clock, timeline, and horizon all
        // return to zero. Queued segments survive.
        {
            let mut scheduler = self.scheduler.lock().await;
            scheduler.reset();
        }
        *self.horizon_sec.lock().expect("horizon mutex") = 0.0;
        self.lifecycle.lock().expect("lifecycle mutex").reset_started();
        self.active.lock().expect("active mutex").clear();

        self.clock.start();
        self.state.update(
            "engine.started",
            serde_json::json!({ "mode": format!("{:?}", self.mode) }),
            |s| {
                s.running = true;
                s.stream_started_at = Some(chrono::Utc::now());
                s.last_error = None;
            },
        );

        let engine = self.clone();
        tokio::spawn(async move {
            engine.run_loop().await;
        });

        info!(
            "Playout engine started ({:?} mode, target buffer {:.0}s)",
            self.mode, self.config.target_buffer_sec
        );
        Ok(())
    }

    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.sink.stop().await;
        self.state
            .update("engine.stopped", serde_json::Value::Null, |s| {
                s.running = false;
            });
        info!("Playout engine stopped");
    }

    /// Terminate the in-flight transcode. Timeline mode cannot skip a
    /// partially rendered window; callers get an advisory instead.
    pub async fn skip_current(&self) -> SkipOutcome {
        match self.mode {
            OutputMode::Timeline => SkipOutcome::Unsupported,
            OutputMode::PerSegment => {
                if self.sink.abort_current().await {
                    SkipOutcome::Skipped
                } else {
                    SkipOutcome::Idle
                }
            }
        }
    }

    pub async fn enqueue_segment(&self, segment: RenderedSegment) -> QueueItem {
        let item = {
            let mut queue = self.queue.lock().await;
            queue.enqueue(segment)
        };
        self.lifecycle
            .lock()
            .expect("lifecycle mutex")
            .on_enqueued(&item.segment.id);
        self.state.publish(
            "segment.enqueued",
            serde_json::json!({
                "segmentId": item.segment.id,
                "kind": item.segment.kind,
                "note": item.segment.note,
            }),
        );
        self.publish_queue_view().await;
        item
    }

    pub async fn remove_queued(&self, id: &str) -> Result<()> {
        let removed = {
            let mut queue = self.queue.lock().await;
            queue.remove(id)
        };
        if !removed {
            return Err(RjError::QueueMiss(id.to_string()));
        }
        {
            let mut lifecycle = self.lifecycle.lock().expect("lifecycle mutex");
            lifecycle.on_removed(id);
        }
        self.state
            .publish("segment.removed", serde_json::json!({ "segmentId": id }));
        self.publish_queue_view().await;
        Ok(())
    }

    pub async fn update_queued(
        &self,
        id: &str,
        priority: Option<u16>,
        pinned: Option<bool>,
    ) -> Result<QueueItem> {
        let item = {
            let mut queue = self.queue.lock().await;
            queue.update(id, priority, pinned)?
        };
        self.publish_queue_view().await;
        Ok(item)
    }

    pub async fn timeline_snapshot(&self) -> TimelineSnapshot {
        let now = self.clock.now_sec();
        let reasons = self.queue_arbitration().await;
        let scheduler = self.scheduler.lock().await;
        scheduler.snapshot(now, LOOKAHEAD_SEC, reasons)
    }

    pub async fn rebuild_timeline(&self) -> Result<TimelineSnapshot> {
        let now = self.clock.now_sec();
        let reasons = self.queue_arbitration().await;
        let mut scheduler = self.scheduler.lock().await;
        scheduler.rebuild_transitions();
        Ok(scheduler.snapshot(now, LOOKAHEAD_SEC, reasons))
    }

    pub async fn buffered_sec(&self) -> f64 {
        self.buffered_sec_at(self.clock.now_sec()).await
    }

    async fn buffered_sec_at(&self, now: f64) -> f64 {
        match self.mode {
            OutputMode::Timeline => {
                let cursor = {
                    let scheduler = self.scheduler.lock().await;
                    scheduler.cursor_sec()
                };
                // Segments built but not yet placed still count; without
                // them a burst of builds would overshoot the target.
                let queued = self.queue.lock().await.total_duration_sec();
                (cursor - now).max(0.0) + queued
            }
            OutputMode::PerSegment => self.queue.lock().await.total_duration_sec(),
        }
    }

    async fn queue_arbitration(&self) -> Vec<QueueArbitration> {
        let queue = self.queue.lock().await;
        queue
            .items()
            .iter()
            .map(|item| QueueArbitration {
                segment_id: item.segment.id.clone(),
                note: item.segment.note.clone(),
                reason: item.arbitration_reason(),
            })
            .collect()
    }

    async fn publish_queue_view(&self) {
        let (items, buffered) = {
            let queue = self.queue.lock().await;
            (queue.items().to_vec(), queue.total_duration_sec())
        };
        let buffered = match self.mode {
            OutputMode::Timeline => {
                let scheduler = self.scheduler.lock().await;
                (scheduler.cursor_sec() - self.clock.now_sec()).max(0.0) + buffered
            }
            OutputMode::PerSegment => buffered,
        };
        self.state.set_queue_view(items, buffered);
    }

    // ------------------------------------------------------------------
    // The control loop
    // ------------------------------------------------------------------

    async fn run_loop(self: Arc<Self>) {
        let mut last_state_event = Instant::now();
        let mut last_low_buffer_warn: Option<Instant> = None;
        let mut buffer_was_healthy = false;
        while self.running.load(Ordering::SeqCst) {
            let now = self.clock.now_sec();

            if self.mode == OutputMode::Timeline {
                self.lifecycle_sync(now).await;
                self.publish_meters(now).await;
            }

            self.build_ahead(now).await;

            match self.mode {
                OutputMode::Timeline => {
                    self.dispatch_to_timeline(now).await;
                    self.clone().ensure_chunk_loop();
                }
                OutputMode::PerSegment => {
                    self.clone().dispatch_to_sink().await;
                }
            }

            // Low-rate heartbeat of the fast-moving fields.
            let buffered = self.buffered_sec_at(now).await;
            if buffered >= self.config.min_buffer_sec {
                buffer_was_healthy = true;
            } else if buffer_was_healthy
                && last_low_buffer_warn
                    .map(|at| at.elapsed() >= Duration::from_secs(30))
                    .unwrap_or(true)
            {
                last_low_buffer_warn = Some(Instant::now());
                warn!(
                    "Buffered audio down to {:.0}s (minimum {:.0}s)",
                    buffered, self.config.min_buffer_sec
                );
            }
            let phase = self.builder.phase().await;
            self.state.set_quiet(|s| {
                s.buffered_sec = buffered;
                s.master_playhead_sec = now;
                s.phase = phase;
            });
            if last_state_event.elapsed() >= Duration::from_secs(1) {
                last_state_event = Instant::now();
                self.state.publish(
                    "state.updated",
                    serde_json::json!({ "bufferedSec": buffered, "playheadSec": now }),
                );
            }

            tokio::time::sleep(TICK).await;
        }
    }

    /// Build segments while the buffer is under target, capped per tick.
    async fn build_ahead(&self, now: f64) {
        let max_builds = match self.mode {
            OutputMode::Timeline => 4,
            OutputMode::PerSegment => 1,
        };
        let mut builds = 0;
        while builds < max_builds {
            let buffered = self.buffered_sec_at(now).await;
            if buffered >= self.config.target_buffer_sec {
                break;
            }
            match self.builder.build_next().await {
                Ok(segment) => {
                    let kind = segment.kind;
                    self.enqueue_segment(segment).await;
                    self.state.set_quiet(|s| {
                        s.counters.segments_built += 1;
                        match kind {
                            SegmentKind::Song => s.counters.songs += 1,
                            SegmentKind::Commentary => s.counters.commentaries += 1,
                            SegmentKind::Liner => s.counters.liners += 1,
                        }
                    });
                }
                Err(e) => {
                    error!("Segment build failed: {}", e);
                    self.state.record_error(&e.to_string());
                    self.enqueue_recovery_silence().await;
                    break;
                }
            }
            builds += 1;
        }
    }

    /// Recovery silence keeps the buffer advancing so the sink never starves.
    async fn enqueue_recovery_silence(&self) {
        let path = self
            .config
            .work_dir
            .join(format!("recover-{}.wav", uuid::Uuid::new_v4()));
        if let Err(e) = write_silence_wav(&path, RECOVERY_SILENCE_SEC) {
            error!("Could not write recovery silence: {}", e);
            return;
        }
        let segment = RenderedSegment::new(
            SegmentKind::Liner,
            path,
            RECOVERY_SILENCE_SEC,
            "recovery silence",
            crate::models::SegmentSource::Auto,
        )
        .with_priority(200)
        .pinned();
        self.enqueue_segment(segment).await;
        self.state.set_quiet(|s| s.counters.recoveries += 1);
    }

    /// Timeline mode: drain the queue onto the scheduler.
    async fn dispatch_to_timeline(&self, now: f64) {
        loop {
            let item = {
                let mut queue = self.queue.lock().await;
                queue.pop()
            };
            let Some(item) = item else { break };

            let placed = {
                let mut scheduler = self.scheduler.lock().await;
                scheduler.place(&item.segment, now)
            };
            info!(
                "Scheduled {:?} '{}' as {} clip(s) at {:.1}s",
                item.segment.kind,
                item.segment.note,
                placed.len(),
                placed.first().map(|c| c.start_at_sec).unwrap_or(now)
            );
            self.active
                .lock()
                .expect("active mutex")
                .insert(item.segment.id.clone(), item);
        }
        self.publish_queue_view().await;
    }

    /// Per-segment mode: feed the sink one whole segment at a time.
    async fn dispatch_to_sink(self: Arc<Self>) {
        if self.push_inflight.load(Ordering::SeqCst) {
            return;
        }
        let item = {
            let mut queue = self.queue.lock().await;
            queue.pop()
        };
        let Some(item) = item else { return };
        self.push_inflight.store(true, Ordering::SeqCst);
        self.publish_queue_view().await;

        let engine = self.clone();
        tokio::spawn(async move {
            let id = item.segment.id.clone();
            let path = item.segment.file_path.clone();

            if engine
                .lifecycle
                .lock()
                .expect("lifecycle mutex")
                .on_started(&id)
            {
                engine.state.update(
                    "segment.started",
                    serde_json::json!({ "segmentId": id, "note": item.segment.note }),
                    |s| {
                        s.now_playing = Some(item.clone());
                    },
                );
            }

            let result = engine.sink.push_file(&path).await;
            engine.push_inflight.store(false, Ordering::SeqCst);

            if let Err(e) = &result {
                warn!("push_file for {} ended early: {}", id, e);
                engine.state.record_error(&e.to_string());
            }

            let buffered = engine.buffered_sec().await;
            if engine
                .lifecycle
                .lock()
                .expect("lifecycle mutex")
                .on_finished(&id)
            {
                let segment = item.segment.clone();
                engine.state.update(
                    "segment.finished",
                    serde_json::json!({ "segmentId": id, "bufferedSec": buffered }),
                    |s| {
                        if s.now_playing.as_ref().map(|np| np.segment.id == id) == Some(true) {
                            s.now_playing = None;
                        }
                    },
                );
                engine.state.push_recent_segment(segment);
            }
            engine.lifecycle.lock().expect("lifecycle mutex").forget(&id);
        });
    }

    /// Advance segment lifecycles from the scheduled clips.
    async fn lifecycle_sync(&self, now: f64) {
        let clips: Vec<ScheduledClip> = {
            let scheduler = self.scheduler.lock().await;
            scheduler.clips().to_vec()
        };

        // A segment may span several clips; its window is their union.
        let mut spans: HashMap<String, (f64, f64)> = HashMap::new();
        for clip in &clips {
            let entry = spans
                .entry(clip.segment_id.clone())
                .or_insert((clip.start_at_sec, clip.end_at_sec()));
            entry.0 = entry.0.min(clip.start_at_sec);
            entry.1 = entry.1.max(clip.end_at_sec());
        }

        for (segment_id, (start, end)) in &spans {
            if now >= *start {
                let fired = self
                    .lifecycle
                    .lock()
                    .expect("lifecycle mutex")
                    .on_started(segment_id);
                if fired {
                    let item = self
                        .active
                        .lock()
                        .expect("active mutex")
                        .get(segment_id)
                        .cloned();
                    self.state.update(
                        "segment.started",
                        serde_json::json!({ "segmentId": segment_id }),
                        |s| {
                            if let Some(item) = item {
                                s.now_playing = Some(item);
                            }
                        },
                    );
                }
            }
            if now >= *end {
                let fired = self
                    .lifecycle
                    .lock()
                    .expect("lifecycle mutex")
                    .on_finished(segment_id);
                if fired {
                    let item = self
                        .active
                        .lock()
                        .expect("active mutex")
                        .remove(segment_id);
                    let buffered = self.buffered_sec_at(now).await;
                    let id = segment_id.clone();
                    self.state.update(
                        "segment.finished",
                        serde_json::json!({ "segmentId": id, "bufferedSec": buffered }),
                        |s| {
                            if s.now_playing.as_ref().map(|np| np.segment.id == id)
                                == Some(true)
                            {
                                s.now_playing = None;
                            }
                        },
                    );
                    if let Some(item) = item {
                        self.state.push_recent_segment(item.segment);
                    }
                    self.lifecycle
                        .lock()
                        .expect("lifecycle mutex")
                        .forget(segment_id);
                }
            }
        }

        let (deck_a, deck_b, voice_lane, crossfader, ducking) = {
            let scheduler = self.scheduler.lock().await;
            let lanes = lane_states(scheduler.clips(), now);
            let crossfader = crossfader_state(scheduler.transitions(), now);
            (lanes.0, lanes.1, lanes.2, crossfader, lanes.3)
        };
        self.state.set_quiet(|s| {
            s.deck_a = deck_a;
            s.deck_b = deck_b;
            s.voice_lane = voice_lane;
            s.crossfader = crossfader;
            s.ducking = ducking;
            s.lookahead_sec = LOOKAHEAD_SEC;
        });

        let mut scheduler = self.scheduler.lock().await;
        scheduler.prune_finished(now, FINISHED_CLIP_GRACE_SEC);
    }

    async fn publish_meters(&self, now: f64) {
        {
            let mut last = self.last_meter_at.lock().expect("meter mutex");
            if let Some(at) = *last {
                if at.elapsed() < METER_INTERVAL {
                    return;
                }
            }
            *last = Some(Instant::now());
        }
        let meters = {
            let scheduler = self.scheduler.lock().await;
            compute_meters(scheduler.clips(), now)
        };
        self.state.set_meters(meters);
    }

    /// Spawn the chunk render loop unless one is already in flight.
    fn ensure_chunk_loop(self: Arc<Self>) {
        tokio::spawn(async move {
            let Ok(_gate) = self.render_gate.clone().try_lock_owned() else {
                return;
            };
            self.render_and_push().await;
        });
    }

    /// Render fixed windows from the timeline into the sink until the
    /// horizon is comfortably ahead of the wall clock.
    async fn render_and_push(&self) {
        let window_sec = self.config.master_window_sec;
        loop {
            if !self.running.load(Ordering::SeqCst) {
                return;
            }
            let now = self.clock.now_sec();
            let horizon = *self.horizon_sec.lock().expect("horizon mutex");
            if horizon >= now + CHUNK_LEAD_SEC {
                return;
            }

            let window_end = horizon + window_sec;
            let overlapping = {
                let scheduler = self.scheduler.lock().await;
                scheduler.clips_overlapping(horizon, window_end)
            };

            let out = self
                .config
                .work_dir
                .join(format!("engine-chunk-{}.wav", uuid::Uuid::new_v4()));

            let rendered = if overlapping.is_empty() {
                write_silence_wav(&out, window_sec).map_err(RjError::Io)
            } else {
                let inputs = window_inputs(&overlapping, horizon, window_end);
                self.renderer.render(&inputs, &out, false).await
            };

            if let Err(e) = rendered {
                // Abort this tick; the next tick retries the same window.
                error!("Window render failed at {:.1}s: {}", horizon, e);
                self.state.record_error(&e.to_string());
                self.state.set_quiet(|s| s.counters.render_errors += 1);
                return;
            }

            let pushed = self.sink.push_file(&out).await;
            let _ = tokio::fs::remove_file(&out).await;
            match pushed {
                Ok(()) => {
                    *self.horizon_sec.lock().expect("horizon mutex") = window_end;
                    self.state.set_quiet(|s| s.counters.windows_pushed += 1);
                }
                Err(e) => {
                    warn!("Window push failed: {}", e);
                    self.state.record_error(&e.to_string());
                    return;
                }
            }
        }
    }

    /// Forward sink events into runtime state / publisher health.
    fn spawn_sink_forwarder(self: Arc<Self>) {
        let engine = self;
        let mut rx = engine.sink.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = rx.recv().await {
                match event {
                    SinkEvent::Started { rtmp_url } => {
                        let reconnect = engine.publisher_seen_start.swap(true, Ordering::SeqCst);
                        engine.state.update(
                            "publisher.started",
                            serde_json::json!({ "rtmpUrl": rtmp_url }),
                            |s| {
                                s.publisher.connected = true;
                                if reconnect {
                                    s.publisher.reconnects += 1;
                                }
                            },
                        );
                    }
                    SinkEvent::Error { message, exit_code } => {
                        let err = RjError::PublisherExited(exit_code);
                        engine.state.record_error(&err.to_string());
                        engine.state.update(
                            "publisher.error",
                            serde_json::json!({ "message": message, "exitCode": exit_code }),
                            |s| {
                                s.publisher.connected = false;
                                s.publisher.last_exit_code = exit_code;
                            },
                        );
                        // Report and wait for an external /control/start.
                        engine.running.store(false, Ordering::SeqCst);
                        engine
                            .state
                            .update("engine.stopped", serde_json::Value::Null, |s| {
                                s.running = false;
                            });
                    }
                    SinkEvent::Stopped => {
                        engine.state.update(
                            "publisher.stopped",
                            serde_json::Value::Null,
                            |s| {
                                s.publisher.connected = false;
                            },
                        );
                    }
                    SinkEvent::ToolOutput { line } => {
                        engine.state.set_quiet(|s| {
                            s.publisher.last_tool_output = Some(line.clone());
                        });
                    }
                }
            }
        });
    }
}

// ----------------------------------------------------------------------
// Pure helpers (tested without a clock or children)
// ----------------------------------------------------------------------

/// Fade-envelope level of a clip at `now`, in [0, 1]. Level, not amplitude:
/// the meters reflect the planned envelope rather than decoded samples.
pub(crate) fn envelope_level(clip: &ScheduledClip, now: f64) -> f64 {
    if !clip.is_active_at(now) {
        return 0.0;
    }
    let t = now - clip.start_at_sec;
    let remaining = clip.end_at_sec() - now;
    let mut level: f64 = 1.0;
    if let Some(fade_in) = clip.fade_in_sec.filter(|&f| f > 0.0) {
        if t < fade_in {
            level = level.min(t / fade_in);
        }
    }
    if let Some(fade_out) = clip.fade_out_sec.filter(|&f| f > 0.0) {
        if remaining < fade_out {
            level = level.min(remaining / fade_out);
        }
    }
    level.clamp(0.0, 1.0)
}

pub(crate) fn clip_gain_at(clip: &ScheduledClip, now: f64) -> f64 {
    let t = now - clip.start_at_sec;
    let ramp = clip.gain_ramp.map(|r| r.value_at(t)).unwrap_or(1.0);
    clip.gain * ramp
}

pub(crate) fn compute_meters(clips: &[ScheduledClip], now: f64) -> MeterLevels {
    let level_for = |channel: AudioChannel| -> f64 {
        clips
            .iter()
            .filter(|c| c.channel == channel)
            .map(|c| (envelope_level(c, now) * clip_gain_at(c, now)).clamp(0.0, 1.0))
            .fold(0.0, f64::max)
    };
    let music = level_for(AudioChannel::Music);
    let voice = level_for(AudioChannel::Voice);
    let jingle = level_for(AudioChannel::Jingle);
    let ads = level_for(AudioChannel::Ads);
    let master = (music * music + voice * voice + jingle * jingle + ads * ads)
        .sqrt()
        .min(1.0);
    MeterLevels {
        music,
        voice,
        jingle,
        ads,
        master,
    }
}

/// Cut the audible sub-windows of `clips` for the output window
/// `[from, to)`, with per-window gain endpoints taken from each ramp.
pub(crate) fn window_inputs(clips: &[ScheduledClip], from: f64, to: f64) -> Vec<RenderClip> {
    clips
        .iter()
        .filter(|clip| clip.start_at_sec < to && clip.end_at_sec() > from)
        .map(|clip| {
            let audible_start = clip.start_at_sec.max(from);
            let audible_end = clip.end_at_sec().min(to);
            let source_offset = clip.source_offset_sec + (from - clip.start_at_sec).max(0.0);
            let g0 = clip_gain_at(clip, audible_start);
            let g1 = clip_gain_at(clip, audible_end);
            let duration = audible_end - audible_start;
            RenderClip {
                file_path: clip.file_path.clone(),
                start_sec: audible_start - from,
                source_offset_sec: source_offset,
                duration_sec: Some(duration),
                gain: None,
                gain_ramp: Some(crate::models::GainRamp {
                    from: g0,
                    to: g1,
                    ramp_sec: duration,
                }),
                fade_in_sec: None,
                fade_out_sec: None,
            }
        })
        .collect()
}

fn lane_states(
    clips: &[ScheduledClip],
    now: f64,
) -> (DeckState, DeckState, DeckState, DuckingState) {
    let state_for = |pred: &dyn Fn(&ScheduledClip) -> bool| -> DeckState {
        clips
            .iter()
            .filter(|c| pred(c) && c.is_active_at(now))
            .max_by(|a, b| a.start_at_sec.total_cmp(&b.start_at_sec))
            .map(|c| DeckState {
                segment_id: Some(c.segment_id.clone()),
                note: None,
                started_at_sec: Some(c.start_at_sec),
                ends_at_sec: Some(c.end_at_sec()),
                active: true,
            })
            .unwrap_or_default()
    };
    let deck_a = state_for(&|c| c.deck == Some(Deck::A));
    let deck_b = state_for(&|c| c.deck == Some(Deck::B));
    let voice = state_for(&|c| c.channel == AudioChannel::Voice);

    let music_active = deck_a.active || deck_b.active;
    let ducking = DuckingState {
        active: music_active && voice.active,
        amount: if music_active && voice.active { 0.3 } else { 0.0 },
    };
    (deck_a, deck_b, voice, ducking)
}

fn crossfader_state(
    transitions: &[crate::models::DeckTransition],
    now: f64,
) -> CrossfaderState {
    transitions
        .iter()
        .find(|t| now >= t.at_sec && now < t.at_sec + t.window_sec)
        .map(|t| CrossfaderState {
            position: ((now - t.at_sec) / t.window_sec).clamp(0.0, 1.0),
            active: true,
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::GainRamp;
    use std::path::PathBuf;

    fn clip(channel: AudioChannel, start: f64, duration: f64) -> ScheduledClip {
        ScheduledClip {
            id: "c".into(),
            segment_id: "s".into(),
            parent_segment_id: None,
            channel,
            file_path: PathBuf::from("/tmp/a.wav"),
            start_at_sec: start,
            source_offset_sec: 0.0,
            duration_sec: duration,
            gain: 1.0,
            gain_ramp: None,
            fade_in_sec: None,
            fade_out_sec: None,
            deck: None,
        }
    }

    #[test]
    fn envelope_respects_fades() {
        let mut c = clip(AudioChannel::Music, 10.0, 10.0);
        c.fade_in_sec = Some(2.0);
        c.fade_out_sec = Some(4.0);
        assert_eq!(envelope_level(&c, 9.0), 0.0);
        assert!((envelope_level(&c, 11.0) - 0.5).abs() < 1e-9);
        assert!((envelope_level(&c, 13.0) - 1.0).abs() < 1e-9);
        assert!((envelope_level(&c, 18.0) - 0.5).abs() < 1e-9);
        assert_eq!(envelope_level(&c, 20.0), 0.0);
    }

    #[test]
    fn meters_stay_in_unit_range() {
        // A hot voice ramp (peaks at 1.35 gain) must still clamp to 1.
        let mut voice = clip(AudioChannel::Voice, 0.0, 10.0);
        voice.gain_ramp = Some(GainRamp {
            from: 0.65,
            to: 1.35,
            ramp_sec: 3.5,
        });
        let mut music = clip(AudioChannel::Music, 0.0, 10.0);
        music.gain_ramp = Some(GainRamp {
            from: 0.7,
            to: 1.0,
            ramp_sec: 7.0,
        });
        let clips = vec![voice, music];
        for step in 0..100 {
            let now = step as f64 * 0.1;
            let meters = compute_meters(&clips, now);
            for v in [
                meters.music,
                meters.voice,
                meters.jingle,
                meters.ads,
                meters.master,
            ] {
                assert!((0.0..=1.0).contains(&v), "meter {} out of range at {}", v, now);
            }
        }
    }

    #[test]
    fn master_is_rms_ish_combination() {
        let a = clip(AudioChannel::Music, 0.0, 10.0);
        let b = clip(AudioChannel::Voice, 0.0, 10.0);
        let meters = compute_meters(&[a, b], 5.0);
        assert_eq!(meters.music, 1.0);
        assert_eq!(meters.voice, 1.0);
        assert_eq!(meters.master, 1.0);
    }

    #[test]
    fn window_inputs_cut_and_offset() {
        // Clip [3, 13) with source offset 1.5; window [4, 6).
        let mut c = clip(AudioChannel::Music, 3.0, 10.0);
        c.source_offset_sec = 1.5;
        let inputs = window_inputs(&[c], 4.0, 6.0);
        assert_eq!(inputs.len(), 1);
        let input = &inputs[0];
        assert!((input.start_sec - 0.0).abs() < 1e-9);
        assert!((input.source_offset_sec - 2.5).abs() < 1e-9);
        assert!((input.duration_sec.unwrap() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn window_inputs_handle_clip_starting_mid_window() {
        // Clip [5, 8); window [4, 6): audible [5, 6), delayed 1s into window.
        let c = clip(AudioChannel::Voice, 5.0, 3.0);
        let inputs = window_inputs(&[c], 4.0, 6.0);
        let input = &inputs[0];
        assert!((input.start_sec - 1.0).abs() < 1e-9);
        assert!((input.source_offset_sec - 0.0).abs() < 1e-9);
        assert!((input.duration_sec.unwrap() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn window_gain_endpoints_follow_ramp() {
        let mut c = clip(AudioChannel::Music, 0.0, 10.0);
        c.gain_ramp = Some(GainRamp {
            from: 0.0,
            to: 1.0,
            ramp_sec: 10.0,
        });
        let inputs = window_inputs(&[c], 2.0, 4.0);
        let ramp = inputs[0].gain_ramp.unwrap();
        assert!((ramp.from - 0.2).abs() < 1e-9);
        assert!((ramp.to - 0.4).abs() < 1e-9);
    }

    #[test]
    fn lifecycle_orders_events_and_rejects_duplicates() {
        let mut lifecycle = Lifecycle::default();
        assert!(lifecycle.on_enqueued("s1"));
        assert!(!lifecycle.on_enqueued("s1"));
        // Cannot finish before starting.
        assert!(!lifecycle.on_finished("s1"));
        assert!(lifecycle.on_started("s1"));
        assert!(!lifecycle.on_started("s1"));
        assert!(lifecycle.on_finished("s1"));
        assert!(!lifecycle.on_finished("s1"));
        // A started segment can no longer be "removed".
        assert!(!lifecycle.on_removed("s1"));

        assert!(lifecycle.on_enqueued("s2"));
        assert!(lifecycle.on_removed("s2"));
        assert!(!lifecycle.on_started("s2"));
    }

    #[test]
    fn crossfader_tracks_transition_window() {
        let transitions = vec![crate::models::DeckTransition {
            from_segment_id: "a".into(),
            to_segment_id: "b".into(),
            from_deck: Deck::A,
            to_deck: Deck::B,
            at_sec: 10.0,
            window_sec: 4.0,
            curve: crate::models::FadeCurve::Tri,
        }];
        assert!(!crossfader_state(&transitions, 9.0).active);
        let mid = crossfader_state(&transitions, 12.0);
        assert!(mid.active);
        assert!((mid.position - 0.5).abs() < 1e-9);
        assert!(!crossfader_state(&transitions, 14.0).active);
    }

    #[test]
    fn ducking_needs_music_and_voice() {
        let music = clip(AudioChannel::Music, 0.0, 10.0);
        let mut with_deck = music.clone();
        with_deck.deck = Some(Deck::A);
        let voice = clip(AudioChannel::Voice, 0.0, 10.0);

        let (_, _, _, ducking) = lane_states(&[with_deck.clone(), voice.clone()], 5.0);
        assert!(ducking.active);
        let (_, _, _, ducking) = lane_states(&[with_deck], 5.0);
        assert!(!ducking.active);
    }

    use crate::models::SegmentSource;
    use crate::services::commentary::CommentaryGenerator;
    use crate::services::testutil::{test_config, FakeToolExecutor};
    use crate::services::track_cache::TrackCache;
    use crate::services::tts::TtsClient;

    async fn engine_with_tracks(
        dir: &std::path::Path,
        tracks: Vec<Track>,
    ) -> Arc<PlayoutEngine> {
        let config = Arc::new(test_config(dir.to_path_buf()));
        let runner = Arc::new(ProcessRunner::with_executor(Arc::new(
            FakeToolExecutor::ok(),
        )));
        let cache = Arc::new(TrackCache::new(runner.clone(), dir).await.unwrap());
        let renderer = Arc::new(TimelineRenderer::new(runner.clone()));
        let tts = Arc::new(TtsClient::new(config.tts_base_url.clone()));
        let commentary = Arc::new(CommentaryGenerator::new(&config));
        let tracks = Arc::new(tracks);
        let builder = Arc::new(SegmentBuilder::new(
            &config,
            tracks.clone(),
            cache,
            renderer.clone(),
            tts,
            commentary,
            runner.clone(),
        ));
        let state = Arc::new(RuntimeState::new(tracks.len()));
        let sink = Arc::new(RtmpSink::new(
            config.work_dir.clone(),
            config.rtmp_url.clone(),
        ));
        Arc::new(PlayoutEngine::new(
            config, tracks, builder, state, sink, renderer, runner,
        ))
    }

    fn catalog_track(id: &str) -> Track {
        Track {
            id: id.to_string(),
            title: "Song".to_string(),
            artist: "Artist".to_string(),
            url: "https://x/1".to_string(),
            duration_sec: 180,
            tags: Vec::new(),
            energy: 0.5,
            mood: "neutral".to_string(),
            language: "en".to_string(),
        }
    }

    #[tokio::test]
    async fn start_with_empty_catalog_is_catalog_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_with_tracks(dir.path(), Vec::new()).await;
        let err = engine.clone().start().await.unwrap_err();
        assert!(matches!(err, RjError::CatalogInvalid(_)));
        assert!(!engine.is_running());
    }

    #[tokio::test]
    async fn enqueue_update_remove_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_with_tracks(dir.path(), vec![catalog_track("t1")]).await;

        let segment = RenderedSegment::new(
            SegmentKind::Song,
            dir.path().join("a.wav"),
            30.0,
            "a",
            SegmentSource::Auto,
        );
        let id = segment.id.clone();
        engine.enqueue_segment(segment).await;

        let snapshot = engine.runtime().snapshot();
        assert_eq!(snapshot.queue.len(), 1);
        assert_eq!(snapshot.buffered_sec, 30.0);

        let item = engine
            .update_queued(&id, Some(500), Some(true))
            .await
            .unwrap();
        assert_eq!(item.segment.priority, 200);
        assert!(item.segment.pinned);

        engine.remove_queued(&id).await.unwrap();
        let snapshot = engine.runtime().snapshot();
        assert!(snapshot.queue.is_empty());
        assert_eq!(snapshot.buffered_sec, 0.0);

        assert!(matches!(
            engine.remove_queued(&id).await,
            Err(RjError::QueueMiss(_))
        ));
    }

    #[tokio::test]
    async fn skip_is_advisory_in_timeline_mode() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path().to_path_buf());
        config.timeline_engine_v2 = true;
        let runner = Arc::new(ProcessRunner::with_executor(Arc::new(
            FakeToolExecutor::ok(),
        )));
        let cache = Arc::new(TrackCache::new(runner.clone(), dir.path()).await.unwrap());
        let renderer = Arc::new(TimelineRenderer::new(runner.clone()));
        let config = Arc::new(config);
        let tts = Arc::new(TtsClient::new(config.tts_base_url.clone()));
        let commentary = Arc::new(CommentaryGenerator::new(&config));
        let tracks = Arc::new(vec![catalog_track("t1")]);
        let builder = Arc::new(SegmentBuilder::new(
            &config,
            tracks.clone(),
            cache,
            renderer.clone(),
            tts,
            commentary,
            runner.clone(),
        ));
        let state = Arc::new(RuntimeState::new(1));
        let sink = Arc::new(RtmpSink::new(
            config.work_dir.clone(),
            config.rtmp_url.clone(),
        ));
        let engine = Arc::new(PlayoutEngine::new(
            config, tracks, builder, state, sink, renderer, runner,
        ));
        assert_eq!(engine.mode(), OutputMode::Timeline);
        assert_eq!(engine.skip_current().await, SkipOutcome::Unsupported);
    }
}
