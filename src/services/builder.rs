//! Segment Builder
//!
//! Produces the next rendered segment (music, commentary, or liner),
//! alternating phase on the configured cadence. Song clips come from the
//! track cache with edge fades applied; commentary goes text to TTS to the
//! voice chain, and any failure on that path degrades to an emergency liner.

use crate::config::Config;
use crate::error::Result;
use crate::models::{BuilderPhase, RenderedSegment, SegmentKind, SegmentSource, Track};
use crate::services::commentary::{CommentaryGenerator, PlayedTrack};
use crate::services::process::ProcessRunner;
use crate::services::renderer::TimelineRenderer;
use crate::services::track_cache::{probe_duration, TrackCache};
use crate::services::tts::TtsClient;
use rand::seq::SliceRandom;
use rand::Rng;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

pub const SONG_FADE_IN_SEC: f64 = 0.4;
pub const SONG_FADE_OUT_SEC: f64 = 0.9;
pub const FALLBACK_SILENCE_SEC: f64 = 3.0;
const LAST_PLAYED_CAP: usize = 10;

/// Shuffled walk over track indices. A fresh permutation is drawn whenever
/// the pointer runs off the end; the previous last-played track never lands
/// at position 0 of the new permutation.
#[derive(Debug)]
pub struct Rotation {
    order: Vec<usize>,
    pos: usize,
    last_index: Option<usize>,
}

impl Rotation {
    pub fn new(len: usize, rng: &mut impl Rng) -> Self {
        let mut rotation = Self {
            order: Vec::new(),
            pos: 0,
            last_index: None,
        };
        rotation.reshuffle(len, rng);
        rotation
    }

    fn reshuffle(&mut self, len: usize, rng: &mut impl Rng) {
        let mut order: Vec<usize> = (0..len).collect();
        order.shuffle(rng);
        if len > 1 {
            if let Some(last) = self.last_index {
                if order[0] == last {
                    let swap_with = rng.gen_range(1..len);
                    order.swap(0, swap_with);
                }
            }
        }
        self.order = order;
        self.pos = 0;
    }

    pub fn next(&mut self, rng: &mut impl Rng) -> usize {
        if self.pos >= self.order.len() {
            self.reshuffle(self.order.len(), rng);
        }
        let index = self.order[self.pos];
        self.pos += 1;
        self.last_index = Some(index);
        index
    }

    /// The index `next` would return, without consuming it.
    pub fn peek(&mut self, rng: &mut impl Rng) -> usize {
        if self.pos >= self.order.len() {
            self.reshuffle(self.order.len(), rng);
        }
        self.order[self.pos]
    }
}

struct BuilderState {
    phase: BuilderPhase,
    rotation: Rotation,
    songs_since_commentary: u32,
    last_played: Vec<PlayedTrack>,
}

pub struct SegmentBuilder {
    tracks: Arc<Vec<Track>>,
    cache: Arc<TrackCache>,
    renderer: Arc<TimelineRenderer>,
    tts: Arc<TtsClient>,
    commentary: Arc<CommentaryGenerator>,
    runner: Arc<ProcessRunner>,
    work_dir: PathBuf,
    liner_dir: Option<PathBuf>,
    cadence: u32,
    /// Audio engine v2: whole-segment song renders go through mastering.
    master_segments: bool,
    state: Mutex<BuilderState>,
}

impl SegmentBuilder {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &Config,
        tracks: Arc<Vec<Track>>,
        cache: Arc<TrackCache>,
        renderer: Arc<TimelineRenderer>,
        tts: Arc<TtsClient>,
        commentary: Arc<CommentaryGenerator>,
        runner: Arc<ProcessRunner>,
    ) -> Self {
        let rotation = Rotation::new(tracks.len(), &mut rand::thread_rng());
        Self {
            tracks,
            cache,
            renderer,
            tts,
            commentary,
            runner,
            work_dir: config.work_dir.clone(),
            liner_dir: config.liner_dir.clone(),
            cadence: config.commentary_every_n_songs,
            master_segments: config.audio_engine_v2,
            state: Mutex::new(BuilderState {
                phase: BuilderPhase::Songs,
                rotation,
                songs_since_commentary: 0,
                last_played: Vec::new(),
            }),
        }
    }

    pub async fn phase(&self) -> BuilderPhase {
        self.state.lock().await.phase
    }

    pub async fn songs_since_commentary(&self) -> u32 {
        self.state.lock().await.songs_since_commentary
    }

    pub async fn last_played(&self) -> Vec<PlayedTrack> {
        self.state.lock().await.last_played.clone()
    }

    /// Produce the next segment per the current phase, then advance it.
    pub async fn build_next(&self) -> Result<RenderedSegment> {
        let phase = self.state.lock().await.phase;
        match phase {
            BuilderPhase::Songs => {
                let track = self.pick_next_track().await;
                let segment = self.build_song(&track).await?;
                self.note_song_built(&track).await;
                Ok(segment)
            }
            BuilderPhase::Commentary => {
                let segment = self.build_commentary_or_liner().await;
                let mut state = self.state.lock().await;
                state.phase = BuilderPhase::Songs;
                state.songs_since_commentary = 0;
                Ok(segment)
            }
        }
    }

    async fn pick_next_track(&self) -> Track {
        let mut state = self.state.lock().await;
        let index = state.rotation.next(&mut rand::thread_rng());
        self.tracks[index].clone()
    }

    async fn note_song_built(&self, track: &Track) {
        let mut state = self.state.lock().await;
        state.last_played.push(PlayedTrack {
            title: track.title.clone(),
            artist: track.artist.clone(),
        });
        if state.last_played.len() > LAST_PLAYED_CAP {
            state.last_played.remove(0);
        }
        state.songs_since_commentary += 1;
        if state.songs_since_commentary >= self.cadence {
            state.phase = BuilderPhase::Commentary;
        }
    }

    async fn build_song(&self, track: &Track) -> Result<RenderedSegment> {
        let source = self.cache.fetch_track_wav(track).await?;
        let source_duration = probe_duration(&self.runner, &source).await;

        let out = self
            .work_dir
            .join(format!("song-faded-{}.wav", uuid::Uuid::new_v4()));
        self.renderer
            .edge_fade(
                &source,
                &out,
                source_duration.max(0.0),
                SONG_FADE_IN_SEC,
                SONG_FADE_OUT_SEC,
                self.master_segments,
            )
            .await?;

        let duration = probe_duration(&self.runner, &out).await.max(0.0);
        info!("Built song segment: {} - {} ({:.1}s)", track.artist, track.title, duration);
        Ok(RenderedSegment::new(
            SegmentKind::Song,
            out,
            duration,
            format!("{} by {}", track.title, track.artist),
            SegmentSource::Auto,
        ))
    }

    async fn build_commentary_or_liner(&self) -> RenderedSegment {
        match self.build_commentary().await {
            Ok(segment) => segment,
            Err(e) => {
                warn!("Commentary build failed ({}), falling back to liner", e);
                self.build_liner().await
            }
        }
    }

    async fn build_commentary(&self) -> Result<RenderedSegment> {
        let (recent, upcoming) = {
            let mut state = self.state.lock().await;
            let upcoming = if self.tracks.is_empty() {
                None
            } else {
                let index = state.rotation.peek(&mut rand::thread_rng());
                Some(self.tracks[index].clone())
            };
            (state.last_played.clone(), upcoming)
        };
        let text = self.commentary.generate(&recent, upcoming.as_ref()).await;

        let raw = self
            .work_dir
            .join(format!("talk-raw-{}.wav", uuid::Uuid::new_v4()));
        self.tts.synthesize(&text, &raw).await?;

        let out = self
            .work_dir
            .join(format!("talk-mix-{}.wav", uuid::Uuid::new_v4()));
        self.renderer.enhance_voice(&raw, &out).await?;
        let _ = tokio::fs::remove_file(&raw).await;

        let duration = probe_duration(&self.runner, &out).await.max(0.0);
        info!("Built commentary segment ({:.1}s)", duration);
        let mut segment = RenderedSegment::new(
            SegmentKind::Commentary,
            out,
            duration,
            "talk break",
            SegmentSource::Auto,
        );
        segment.commentary_text = Some(text);
        Ok(segment)
    }

    async fn build_liner(&self) -> RenderedSegment {
        if let Some(path) = self.pick_liner_file().await {
            let duration = probe_duration(&self.runner, &path).await;
            if duration > 0.0 {
                return RenderedSegment::new(
                    SegmentKind::Liner,
                    path,
                    duration,
                    "emergency liner",
                    SegmentSource::Auto,
                );
            }
        }

        let path = self
            .work_dir
            .join(format!("recover-{}.wav", uuid::Uuid::new_v4()));
        if let Err(e) = write_silence_wav(&path, FALLBACK_SILENCE_SEC) {
            warn!("Failed to write silence liner: {}", e);
        }
        RenderedSegment::new(
            SegmentKind::Liner,
            path,
            FALLBACK_SILENCE_SEC,
            "silence liner",
            SegmentSource::Auto,
        )
    }

    async fn pick_liner_file(&self) -> Option<PathBuf> {
        let dir = self.liner_dir.as_ref()?;
        let mut entries = tokio::fs::read_dir(dir).await.ok()?;
        let mut wavs = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.extension().map(|e| e == "wav").unwrap_or(false) {
                wavs.push(path);
            }
        }
        wavs.choose(&mut rand::thread_rng()).cloned()
    }

    /// Fetch + fade a listener-requested track; pinned at priority 110.
    pub async fn build_manual_song(
        &self,
        title: &str,
        artist: Option<&str>,
        url: &str,
    ) -> Result<RenderedSegment> {
        let track = Track {
            id: format!("manual-{}", uuid::Uuid::new_v4()),
            title: title.to_string(),
            artist: artist.unwrap_or("listener request").to_string(),
            url: url.to_string(),
            duration_sec: 60,
            tags: Vec::new(),
            energy: 0.5,
            mood: "neutral".to_string(),
            language: "en".to_string(),
        };
        let mut segment = self.build_song(&track).await?;
        segment.source = SegmentSource::Manual;
        segment.priority = 110;
        segment.pinned = true;
        Ok(segment)
    }

    /// Synthesize operator-supplied text; pinned at priority 120.
    pub async fn build_manual_commentary(&self, text: &str) -> Result<RenderedSegment> {
        let raw = self
            .work_dir
            .join(format!("talk-raw-{}.wav", uuid::Uuid::new_v4()));
        self.tts.synthesize(text, &raw).await?;

        let out = self
            .work_dir
            .join(format!("talk-mix-{}.wav", uuid::Uuid::new_v4()));
        self.renderer.enhance_voice(&raw, &out).await?;
        let _ = tokio::fs::remove_file(&raw).await;

        let duration = probe_duration(&self.runner, &out).await.max(0.0);
        let mut segment = RenderedSegment::new(
            SegmentKind::Commentary,
            out,
            duration,
            "manual talk break",
            SegmentSource::Manual,
        );
        segment.commentary_text = Some(text.to_string());
        segment.priority = 120;
        segment.pinned = true;
        Ok(segment)
    }
}

/// Write a 48 kHz stereo 16-bit PCM WAV of digital silence.
pub fn write_silence_wav(path: &Path, seconds: f64) -> std::io::Result<()> {
    const SAMPLE_RATE: u32 = 48_000;
    const CHANNELS: u16 = 2;
    const BITS: u16 = 16;

    let frames = (seconds.max(0.0) * SAMPLE_RATE as f64) as u32;
    let data_len = frames * CHANNELS as u32 * (BITS / 8) as u32;
    let byte_rate = SAMPLE_RATE * CHANNELS as u32 * (BITS / 8) as u32;
    let block_align = CHANNELS * (BITS / 8);

    let mut file = std::fs::File::create(path)?;
    file.write_all(b"RIFF")?;
    file.write_all(&(36 + data_len).to_le_bytes())?;
    file.write_all(b"WAVE")?;
    file.write_all(b"fmt ")?;
    file.write_all(&16u32.to_le_bytes())?;
    file.write_all(&1u16.to_le_bytes())?;
    file.write_all(&CHANNELS.to_le_bytes())?;
    file.write_all(&SAMPLE_RATE.to_le_bytes())?;
    file.write_all(&byte_rate.to_le_bytes())?;
    file.write_all(&block_align.to_le_bytes())?;
    file.write_all(&BITS.to_le_bytes())?;
    file.write_all(b"data")?;
    file.write_all(&data_len.to_le_bytes())?;
    file.write_all(&vec![0u8; data_len as usize])?;
    Ok(())
}
