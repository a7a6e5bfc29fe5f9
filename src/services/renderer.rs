//! Timeline Renderer
//!
//! Turns a set of positioned clips into one mixed WAV through a single
//! ffmpeg invocation: per-input trim, fades, gain envelope and delay, summed
//! with `amix=duration=longest:normalize=0`, optionally put through the
//! mastering chain. No audio math happens in-process.

use crate::error::{Result, RjError};
use crate::models::GainRamp;
use crate::services::process::ProcessRunner;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// One input to a render: a source window placed on the output timeline.
#[derive(Debug, Clone)]
pub struct RenderClip {
    pub file_path: PathBuf,
    /// Delay on the output timeline, seconds.
    pub start_sec: f64,
    pub source_offset_sec: f64,
    pub duration_sec: Option<f64>,
    pub gain: Option<f64>,
    pub gain_ramp: Option<GainRamp>,
    pub fade_in_sec: Option<f64>,
    pub fade_out_sec: Option<f64>,
}

impl RenderClip {
    pub fn whole_file(path: PathBuf) -> Self {
        Self {
            file_path: path,
            start_sec: 0.0,
            source_offset_sec: 0.0,
            duration_sec: None,
            gain: None,
            gain_ramp: None,
            fade_in_sec: None,
            fade_out_sec: None,
        }
    }
}

const MASTER_CHAIN: &str =
    "loudnorm=I=-14:TP=-1.5:LRA=11,acompressor=threshold=-18dB:ratio=3:attack=20:release=250,alimiter=limit=0.95";

pub struct TimelineRenderer {
    runner: Arc<ProcessRunner>,
}

impl TimelineRenderer {
    pub fn new(runner: Arc<ProcessRunner>) -> Self {
        Self { runner }
    }

    /// Mix `clips` into `out` (48 kHz stereo s16le WAV). `master` appends the
    /// loudness-normalize + compressor + limiter chain.
    pub async fn render(&self, clips: &[RenderClip], out: &Path, master: bool) -> Result<()> {
        if clips.is_empty() {
            return Err(RjError::Render("no input clips".to_string()));
        }

        let mut args: Vec<String> = vec![
            "-y".to_string(),
            "-hide_banner".to_string(),
            "-loglevel".to_string(),
            "error".to_string(),
        ];
        for clip in clips {
            args.push("-i".to_string());
            args.push(clip.file_path.to_string_lossy().to_string());
        }
        args.push("-filter_complex".to_string());
        args.push(filter_graph(clips, master));
        args.push("-map".to_string());
        args.push("[out]".to_string());
        args.push("-ar".to_string());
        args.push("48000".to_string());
        args.push("-ac".to_string());
        args.push("2".to_string());
        args.push("-c:a".to_string());
        args.push("pcm_s16le".to_string());
        args.push(out.to_string_lossy().to_string());

        debug!("Rendering {} clips -> {}", clips.len(), out.display());
        self.runner.run("ffmpeg", &args).await.map_err(|e| match e {
            RjError::Process { stderr, .. } => RjError::Render(stderr),
            other => other,
        })?;
        Ok(())
    }

    /// Apply the song edge fades to a single file, optionally mastering it.
    pub async fn edge_fade(
        &self,
        input: &Path,
        out: &Path,
        duration_sec: f64,
        fade_in_sec: f64,
        fade_out_sec: f64,
        master: bool,
    ) -> Result<()> {
        let clip = RenderClip {
            file_path: input.to_path_buf(),
            start_sec: 0.0,
            source_offset_sec: 0.0,
            duration_sec: Some(duration_sec),
            gain: None,
            gain_ramp: None,
            fade_in_sec: Some(fade_in_sec),
            fade_out_sec: Some(fade_out_sec),
        };
        self.render(&[clip], out, master).await
    }

    /// The voice enhancement chain: gain lift, broadcast loudness, short
    /// fade-in to swallow TTS onset clicks.
    pub async fn enhance_voice(&self, input: &Path, out: &Path) -> Result<()> {
        let args = vec![
            "-y".to_string(),
            "-hide_banner".to_string(),
            "-loglevel".to_string(),
            "error".to_string(),
            "-i".to_string(),
            input.to_string_lossy().to_string(),
            "-af".to_string(),
            "volume=1.9,loudnorm=I=-15:TP=-1.5:LRA=11,afade=t=in:st=0:d=0.25".to_string(),
            "-ar".to_string(),
            "48000".to_string(),
            "-ac".to_string(),
            "2".to_string(),
            "-c:a".to_string(),
            "pcm_s16le".to_string(),
            out.to_string_lossy().to_string(),
        ];
        self.runner.run("ffmpeg", &args).await.map_err(|e| match e {
            RjError::Process { stderr, .. } => RjError::Render(stderr),
            other => other,
        })?;
        Ok(())
    }
}

/// Build the filter graph for a render. Exposed for tests.
pub(crate) fn filter_graph(clips: &[RenderClip], master: bool) -> String {
    let mut parts: Vec<String> = Vec::with_capacity(clips.len() + 1);

    for (i, clip) in clips.iter().enumerate() {
        let mut chain: Vec<String> = Vec::new();

        let trim = match clip.duration_sec {
            Some(dur) => format!(
                "atrim=start={:.4}:end={:.4}",
                clip.source_offset_sec,
                clip.source_offset_sec + dur
            ),
            None => format!("atrim=start={:.4}", clip.source_offset_sec),
        };
        chain.push(trim);
        chain.push("asetpts=PTS-STARTPTS".to_string());

        if let Some(fade_in) = clip.fade_in_sec.filter(|&f| f > 0.0) {
            chain.push(format!("afade=t=in:st=0:d={:.4}", fade_in));
        }
        if let (Some(fade_out), Some(dur)) = (clip.fade_out_sec.filter(|&f| f > 0.0), clip.duration_sec)
        {
            let st = (dur - fade_out).max(0.0);
            chain.push(format!("afade=t=out:st={:.4}:d={:.4}", st, fade_out));
        }

        if let Some(ramp) = clip.gain_ramp {
            chain.push(format!(
                "volume='{:.4}+({:.4}-{:.4})*min(t/{:.4}\\,1)':eval=frame",
                ramp.from, ramp.to, ramp.from, ramp.ramp_sec.max(0.001)
            ));
        } else if let Some(gain) = clip.gain {
            chain.push(format!("volume={:.4}", gain));
        }

        if clip.start_sec > 0.0 {
            let ms = (clip.start_sec * 1000.0).round() as u64;
            chain.push(format!("adelay={ms}|{ms}"));
        }

        parts.push(format!("[{}:a]{}[a{}]", i, chain.join(","), i));
    }

    let inputs: String = (0..clips.len()).map(|i| format!("[a{}]", i)).collect();
    let mix_label = if master { "mix" } else { "out" };
    parts.push(format!(
        "{}amix=inputs={}:duration=longest:normalize=0[{}]",
        inputs,
        clips.len(),
        mix_label
    ));
    if master {
        parts.push(format!("[mix]{}[out]", MASTER_CHAIN));
    }

    parts.join(";")
}
