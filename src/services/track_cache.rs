//! Audio Source Cache
//!
//! Resolves a catalog track to a normalized 48 kHz stereo 16-bit WAV of at
//! most 60 seconds on local disk. Downloads go through yt-dlp, the re-encode
//! through ffmpeg; cache hits are validated by probed duration.

use crate::error::{Result, RjError};
use crate::models::Track;
use crate::services::process::ProcessRunner;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Length of the clip window each track is reduced to.
pub const CLIP_WINDOW_SEC: f64 = 60.0;
/// Probed durations above this mark a cached file as stale.
pub const MAX_VALID_DURATION_SEC: f64 = 60.25;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Downloader {
    /// The `yt-dlp` binary on PATH.
    Binary,
    /// `python3 -m yt_dlp` fallback.
    PythonModule,
}

pub struct TrackCache {
    runner: Arc<ProcessRunner>,
    cache_dir: PathBuf,
    downloader: Downloader,
    /// Per-track-id fetch locks: at most one concurrent fetch per key.
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl TrackCache {
    pub async fn new(runner: Arc<ProcessRunner>, work_dir: &Path) -> Result<Self> {
        let cache_dir = work_dir.join("yt-cache");
        tokio::fs::create_dir_all(&cache_dir).await?;

        let downloader = resolve_downloader(&runner).await?;
        info!("Track cache ready at {} ({:?})", cache_dir.display(), downloader);

        Ok(Self {
            runner,
            cache_dir,
            downloader,
            locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn cache_path(&self, track_id: &str) -> PathBuf {
        self.cache_dir.join(format!("{}-60s.wav", track_id))
    }

    /// Resolve a track to its normalized clip WAV, fetching on miss.
    pub async fn fetch_track_wav(&self, track: &Track) -> Result<PathBuf> {
        let lock = self.key_lock(&track.id).await;
        let _guard = lock.lock().await;

        let path = self.cache_path(&track.id);
        if path.exists() {
            let duration = probe_duration(&self.runner, &path).await;
            if duration > 0.0 && duration <= MAX_VALID_DURATION_SEC {
                debug!("Cache hit for {} ({:.2}s)", track.id, duration);
                return Ok(path);
            }
            warn!(
                "Cached clip for {} has duration {:.2}s, regenerating",
                track.id, duration
            );
        }

        self.download(&track.url, &path).await?;
        self.normalize(&path).await?;
        Ok(path)
    }

    async fn key_lock(&self, track_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(track_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn download(&self, url: &str, dest: &Path) -> Result<()> {
        // yt-dlp substitutes the extension itself; strip ours off the template.
        let template = dest.with_extension("").to_string_lossy().to_string() + ".%(ext)s";
        let tool_args = vec![
            "-x".to_string(),
            "--audio-format".to_string(),
            "wav".to_string(),
            "--no-playlist".to_string(),
            "--no-progress".to_string(),
            "-o".to_string(),
            template,
            url.to_string(),
        ];

        info!("Downloading {} -> {}", url, dest.display());
        match self.downloader {
            Downloader::Binary => {
                self.runner.run("yt-dlp", &tool_args).await?;
            }
            Downloader::PythonModule => {
                let mut args = vec!["-m".to_string(), "yt_dlp".to_string()];
                args.extend(tool_args);
                self.runner.run("python3", &args).await?;
            }
        }
        Ok(())
    }

    /// Re-encode in place: constrain to the clip window, 48 kHz, stereo,
    /// then atomically replace the downloaded file.
    async fn normalize(&self, path: &Path) -> Result<()> {
        let tmp = self
            .cache_dir
            .join(format!("norm-{}.wav", uuid::Uuid::new_v4()));
        let args = vec![
            "-y".to_string(),
            "-hide_banner".to_string(),
            "-loglevel".to_string(),
            "error".to_string(),
            "-i".to_string(),
            path.to_string_lossy().to_string(),
            "-t".to_string(),
            format!("{}", CLIP_WINDOW_SEC),
            "-ar".to_string(),
            "48000".to_string(),
            "-ac".to_string(),
            "2".to_string(),
            "-c:a".to_string(),
            "pcm_s16le".to_string(),
            tmp.to_string_lossy().to_string(),
        ];
        if let Err(e) = self.runner.run("ffmpeg", &args).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e);
        }
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    pub async fn probe(&self, path: &Path) -> f64 {
        probe_duration(&self.runner, path).await
    }
}

/// Read a file's duration via ffprobe. Returns -1.0 on any failure; the
/// cache's happy path never propagates probe errors.
pub async fn probe_duration(runner: &ProcessRunner, path: &Path) -> f64 {
    let args = vec![
        "-v".to_string(),
        "error".to_string(),
        "-show_entries".to_string(),
        "format=duration".to_string(),
        "-of".to_string(),
        "default=noprint_wrappers=1:nokey=1".to_string(),
        path.to_string_lossy().to_string(),
    ];
    match runner.run("ffprobe", &args).await {
        Ok((stdout, _)) => stdout.trim().parse::<f64>().unwrap_or(-1.0),
        Err(e) => {
            debug!("ffprobe failed for {}: {}", path.display(), e);
            -1.0
        }
    }
}

async fn resolve_downloader(runner: &ProcessRunner) -> Result<Downloader> {
    if runner.run("yt-dlp", &["--version".to_string()]).await.is_ok() {
        return Ok(Downloader::Binary);
    }
    let module_args = vec![
        "-m".to_string(),
        "yt_dlp".to_string(),
        "--version".to_string(),
    ];
    if runner.run("python3", &module_args).await.is_ok() {
        return Ok(Downloader::PythonModule);
    }
    Err(RjError::DependencyMissing(
        "neither yt-dlp nor python3 -m yt_dlp is invocable".to_string(),
    ))
}
