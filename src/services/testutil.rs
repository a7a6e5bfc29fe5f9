//! Shared fixtures for service tests: a scripted tool executor and a config
//! builder pointing at a temp work directory.

use crate::config::Config;
use crate::services::process::CommandExecutor;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Fakes every external tool: ffprobe answers with a fixed duration, listed
/// programs fail, everything else exits clean. Records invocations.
pub(crate) struct FakeToolExecutor {
    pub probe_stdout: &'static str,
    pub fail_programs: Vec<&'static str>,
    pub seen: Mutex<Vec<(String, Vec<String>)>>,
}

impl FakeToolExecutor {
    pub fn ok() -> Self {
        Self {
            probe_stdout: "59.9\n",
            fail_programs: Vec::new(),
            seen: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl CommandExecutor for FakeToolExecutor {
    async fn output(
        &self,
        program: &str,
        args: &[String],
        _cwd: Option<&Path>,
    ) -> std::io::Result<std::process::Output> {
        #[cfg(unix)]
        use std::os::unix::process::ExitStatusExt;
        self.seen
            .lock()
            .unwrap()
            .push((program.to_string(), args.to_vec()));
        let fail = self.fail_programs.contains(&program);
        let stdout = if program == "ffprobe" {
            self.probe_stdout
        } else {
            ""
        };
        Ok(std::process::Output {
            status: std::process::ExitStatus::from_raw(if fail { 1 << 8 } else { 0 }),
            stdout: stdout.as_bytes().to_vec(),
            stderr: b"scripted failure".to_vec(),
        })
    }
}

pub(crate) fn test_config(work_dir: PathBuf) -> Config {
    Config {
        server_port: 0,
        llm_api_key: None,
        llm_model: "test-model".to_string(),
        llm_base_url: "http://127.0.0.1:9".to_string(),
        catalog_path: work_dir.join("catalog.json"),
        tts_base_url: "http://127.0.0.1:9".to_string(),
        rtmp_url: "rtmp://127.0.0.1:1935/live/test".to_string(),
        commentary_every_n_songs: 2,
        work_dir,
        liner_dir: None,
        station_name: "Test FM".to_string(),
        station_id_wav: None,
        target_buffer_sec: 600.0,
        min_buffer_sec: 180.0,
        timeline_engine_v2: false,
        audio_engine_v2: false,
        master_window_sec: 2.0,
        carry_over_offset: false,
    }
}
