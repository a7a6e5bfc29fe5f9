//! RTMP Sink
//!
//! Owns the named pipe and the ffmpeg ingest process that reads raw PCM from
//! it and pushes FLV/AAC to the RTMP target. Each clip is transcoded by a
//! short-lived ffmpeg whose stdout is piped into the FIFO without ever
//! closing the write side between clips.

use crate::error::{Result, RjError};
use crate::services::process::{send_sigterm, ChildHandle};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub enum SinkEvent {
    Started { rtmp_url: String },
    Stopped,
    Error { message: String, exit_code: Option<i32> },
    ToolOutput { line: String },
}

/// Per-clip transcode lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClipPhase {
    Idle,
    Transcoding,
    Aborted,
    Done,
}

/// Small state machine guarding a clip push. Transitions:
/// `Idle --start--> Transcoding --exit(0)--> Done`;
/// `Transcoding --abort--> Aborted`, and an exit after abort stays Aborted.
#[derive(Debug, Default)]
pub struct ClipMachine {
    phase: ClipPhase,
}

impl Default for ClipPhase {
    fn default() -> Self {
        ClipPhase::Idle
    }
}

impl ClipMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> ClipPhase {
        self.phase
    }

    pub fn start(&mut self) -> bool {
        if self.phase == ClipPhase::Idle {
            self.phase = ClipPhase::Transcoding;
            true
        } else {
            false
        }
    }

    pub fn abort(&mut self) -> bool {
        if self.phase == ClipPhase::Transcoding {
            self.phase = ClipPhase::Aborted;
            true
        } else {
            false
        }
    }

    pub fn exit(&mut self, code: Option<i32>) -> ClipPhase {
        self.phase = match (self.phase, code) {
            (ClipPhase::Aborted, _) => ClipPhase::Aborted,
            (_, Some(0)) => ClipPhase::Done,
            _ => ClipPhase::Aborted,
        };
        self.phase
    }
}

#[derive(Default)]
struct IngestState {
    fifo_writer: Option<tokio::fs::File>,
    ingest: Option<ChildHandle>,
}

pub struct RtmpSink {
    work_dir: PathBuf,
    rtmp_url: String,
    running: Arc<AtomicBool>,
    events_tx: broadcast::Sender<SinkEvent>,
    ingest: Arc<Mutex<IngestState>>,
    /// Pid of the in-flight transcode, if any. `abort_current` signals it.
    current_transcode: StdMutex<Option<u32>>,
    /// Serializes `push_file`: exactly one transcode writes the FIFO.
    push_lock: Mutex<()>,
}

impl RtmpSink {
    pub fn new(work_dir: PathBuf, rtmp_url: String) -> Self {
        let (events_tx, _) = broadcast::channel(64);
        Self {
            work_dir,
            rtmp_url,
            running: Arc::new(AtomicBool::new(false)),
            events_tx,
            ingest: Arc::new(Mutex::new(IngestState::default())),
            current_transcode: StdMutex::new(None),
            push_lock: Mutex::new(()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SinkEvent> {
        self.events_tx.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn fifo_path(&self) -> PathBuf {
        self.work_dir.join("live.pcm")
    }

    /// Recreate the FIFO, spawn the ingest, open the write side.
    pub async fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let fifo = self.fifo_path();
        let _ = tokio::fs::remove_file(&fifo).await;
        let output = tokio::process::Command::new("mkfifo")
            .arg(&fifo)
            .output()
            .await?;
        if !output.status.success() {
            self.running.store(false, Ordering::SeqCst);
            return Err(RjError::Process {
                program: "mkfifo".to_string(),
                args: vec![fifo.to_string_lossy().to_string()],
                exit_code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }

        let mut args: Vec<String> = ["-hide_banner", "-loglevel", "warning", "-re"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        args.extend(
            ["-f", "s16le", "-ar", "48000", "-ac", "2", "-i"]
                .iter()
                .map(|s| s.to_string()),
        );
        args.push(fifo.to_string_lossy().to_string());
        args.extend(
            ["-c:a", "aac", "-b:a", "192k", "-f", "flv"]
                .iter()
                .map(|s| s.to_string()),
        );
        args.push(self.rtmp_url.clone());

        let events_tx = self.events_tx.clone();
        let ingest = ChildHandle::spawn("ffmpeg", &args, move |line| {
            let _ = events_tx.send(SinkEvent::ToolOutput { line });
        })?;

        // The ingest opens the FIFO read side; the write open unblocks once
        // it does. A stuck open here means the ingest died immediately.
        let writer = tokio::time::timeout(
            Duration::from_secs(5),
            tokio::fs::OpenOptions::new().write(true).open(&fifo),
        )
        .await
        .map_err(|_| RjError::PublisherExited(None))??;

        {
            let mut state = self.ingest.lock().await;
            state.fifo_writer = Some(writer);
            state.ingest = Some(ingest);
        }

        self.spawn_exit_watch();

        info!("RTMP sink started -> {}", self.rtmp_url);
        let _ = self.events_tx.send(SinkEvent::Started {
            rtmp_url: self.rtmp_url.clone(),
        });
        Ok(())
    }

    /// Watch for the ingest dying underneath us; emit the error and mark
    /// not-running so the supervisor can report and wait for a restart.
    fn spawn_exit_watch(&self) {
        let running = self.running.clone();
        let ingest = self.ingest.clone();
        let events_tx = self.events_tx.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(500)).await;
                let mut state = ingest.lock().await;
                let Some(child) = state.ingest.as_mut() else {
                    return;
                };
                match child.try_status() {
                    Ok(Some(status)) => {
                        let code = status.code();
                        if running.swap(false, Ordering::SeqCst) {
                            warn!("ffmpeg ingest exited with {:?}", code);
                            let _ = events_tx.send(SinkEvent::Error {
                                message: "ffmpeg ingest exited".to_string(),
                                exit_code: code,
                            });
                        }
                        state.ingest = None;
                        state.fifo_writer = None;
                        return;
                    }
                    Ok(None) => continue,
                    Err(e) => {
                        warn!("ingest status check failed: {}", e);
                        continue;
                    }
                }
            }
        });
    }

    /// Transcode `path` to raw PCM and stream it into the FIFO. Resolves
    /// when the transcode exits 0; rejects otherwise. One at a time.
    pub async fn push_file(&self, path: &Path) -> Result<()> {
        let _push = self.push_lock.lock().await;
        if !self.is_running() {
            return Err(RjError::PublisherExited(None));
        }

        let mut machine = ClipMachine::new();
        machine.start();

        let mut args: Vec<String> = ["-hide_banner", "-loglevel", "error", "-i"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        args.push(path.to_string_lossy().to_string());
        args.extend(
            ["-f", "s16le", "-acodec", "pcm_s16le", "-ar", "48000", "-ac", "2", "pipe:1"]
                .iter()
                .map(|s| s.to_string()),
        );

        let events_tx = self.events_tx.clone();
        let mut child = ChildHandle::spawn("ffmpeg", &args, move |line| {
            let _ = events_tx.send(SinkEvent::ToolOutput { line });
        })?;
        let mut stdout = child
            .take_stdout()
            .ok_or_else(|| RjError::Render("transcode stdout unavailable".to_string()))?;

        *self.current_transcode.lock().expect("transcode mutex") = child.id();

        // Stream into the FIFO while holding the writer. The File goes back
        // into its slot untouched: the write side never closes between clips.
        let copy_result = {
            let mut state = self.ingest.lock().await;
            match state.fifo_writer.as_mut() {
                Some(writer) => tokio::io::copy(&mut stdout, writer).await.map(|_| ()),
                None => Err(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "fifo writer closed",
                )),
            }
        };

        let status = child.wait().await;
        *self.current_transcode.lock().expect("transcode mutex") = None;

        let code = status.ok().and_then(|s| s.code());
        let final_phase = machine.exit(code);

        copy_result?;
        match final_phase {
            ClipPhase::Done => Ok(()),
            _ => Err(RjError::Process {
                program: "ffmpeg".to_string(),
                args,
                exit_code: code,
                stderr: "transcode did not complete".to_string(),
            }),
        }
    }

    /// Gracefully terminate the in-flight transcode, if any.
    pub async fn abort_current(&self) -> bool {
        let pid = *self.current_transcode.lock().expect("transcode mutex");
        match pid {
            Some(pid) => {
                info!("Aborting in-flight transcode (pid {})", pid);
                send_sigterm(pid).await;
                true
            }
            None => false,
        }
    }

    /// Stop ordering: mark not-running, kill the transcode, close the FIFO
    /// writer, terminate the ingest, emit stopped.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.abort_current().await;

        let mut state = self.ingest.lock().await;
        state.fifo_writer = None;
        if let Some(mut ingest) = state.ingest.take() {
            ingest.terminate().await;
        }
        drop(state);

        let _ = tokio::fs::remove_file(self.fifo_path()).await;
        info!("RTMP sink stopped");
        let _ = self.events_tx.send(SinkEvent::Stopped);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clip_machine_happy_path() {
        let mut m = ClipMachine::new();
        assert_eq!(m.phase(), ClipPhase::Idle);
        assert!(m.start());
        assert_eq!(m.phase(), ClipPhase::Transcoding);
        assert_eq!(m.exit(Some(0)), ClipPhase::Done);
    }

    #[test]
    fn clip_machine_abort_sticks_through_exit() {
        let mut m = ClipMachine::new();
        m.start();
        assert!(m.abort());
        // Even a clean exit code cannot resurrect an aborted clip.
        assert_eq!(m.exit(Some(0)), ClipPhase::Aborted);
    }

    #[test]
    fn clip_machine_nonzero_exit_is_aborted() {
        let mut m = ClipMachine::new();
        m.start();
        assert_eq!(m.exit(Some(1)), ClipPhase::Aborted);
        assert_eq!(ClipMachine::new().exit(None), ClipPhase::Aborted);
    }

    #[test]
    fn clip_machine_rejects_double_start() {
        let mut m = ClipMachine::new();
        assert!(m.start());
        assert!(!m.start());
        assert!(!ClipMachine::new().abort());
    }

    #[tokio::test]
    async fn push_file_rejects_when_not_running() {
        let dir = tempfile::tempdir().unwrap();
        let sink = RtmpSink::new(dir.path().to_path_buf(), "rtmp://localhost/x".to_string());
        let err = sink.push_file(Path::new("/tmp/a.wav")).await.unwrap_err();
        assert!(matches!(err, RjError::PublisherExited(None)));
    }

    #[tokio::test]
    async fn abort_with_no_transcode_returns_false() {
        let dir = tempfile::tempdir().unwrap();
        let sink = RtmpSink::new(dir.path().to_path_buf(), "rtmp://localhost/x".to_string());
        assert!(!sink.abort_current().await);
    }
}
