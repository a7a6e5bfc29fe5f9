//! Child tool execution.
//!
//! Everything CPU-heavy (download, probe, mix, transcode) happens in external
//! tools. `run` captures a short-lived tool to completion; `spawn` hands back
//! a handle for long-lived children whose stdout streams somewhere else.

use crate::error::{Result, RjError};
use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, warn};

/// Grace period between SIGTERM and SIGKILL when terminating a child.
const TERMINATE_GRACE: Duration = Duration::from_secs(3);

/// Execution seam so tests can fake tool invocations.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn output(
        &self,
        program: &str,
        args: &[String],
        cwd: Option<&Path>,
    ) -> std::io::Result<std::process::Output>;
}

#[derive(Debug, Default)]
pub struct SystemCommandExecutor;

#[async_trait]
impl CommandExecutor for SystemCommandExecutor {
    async fn output(
        &self,
        program: &str,
        args: &[String],
        cwd: Option<&Path>,
    ) -> std::io::Result<std::process::Output> {
        let mut command = Command::new(program);
        command.args(args);
        if let Some(dir) = cwd {
            command.current_dir(dir);
        }
        command.output().await
    }
}

pub struct ProcessRunner {
    executor: Arc<dyn CommandExecutor>,
}

impl ProcessRunner {
    pub fn new() -> Self {
        Self {
            executor: Arc::new(SystemCommandExecutor),
        }
    }

    pub fn with_executor(executor: Arc<dyn CommandExecutor>) -> Self {
        Self { executor }
    }

    /// Run a tool to completion, capturing both streams.
    pub async fn run(&self, program: &str, args: &[String]) -> Result<(String, String)> {
        self.run_in(program, args, None).await
    }

    pub async fn run_in(
        &self,
        program: &str,
        args: &[String],
        cwd: Option<&Path>,
    ) -> Result<(String, String)> {
        debug!("exec: {} {}", program, args.join(" "));
        let output = self.executor.output(program, args, cwd).await?;
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        if !output.status.success() {
            return Err(RjError::Process {
                program: program.to_string(),
                args: args.to_vec(),
                exit_code: output.status.code(),
                stderr,
            });
        }
        Ok((stdout, stderr))
    }
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new()
    }
}

/// A spawned long-lived child. Stdout is piped and can be taken by the
/// caller; stderr lines are forwarded to the supplied callback.
pub struct ChildHandle {
    program: String,
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
}

impl ChildHandle {
    pub fn spawn<F>(program: &str, args: &[String], on_stderr_line: F) -> Result<Self>
    where
        F: Fn(String) + Send + 'static,
    {
        debug!("spawn: {} {}", program, args.join(" "));
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    on_stderr_line(line);
                }
            });
        }

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        Ok(Self {
            program: program.to_string(),
            child,
            stdin,
            stdout,
        })
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.stdout.take()
    }

    #[allow(dead_code)]
    pub fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.stdin.take()
    }

    pub async fn wait(&mut self) -> std::io::Result<std::process::ExitStatus> {
        self.child.wait().await
    }

    /// Non-blocking exit check.
    pub fn try_status(&mut self) -> std::io::Result<Option<std::process::ExitStatus>> {
        self.child.try_wait()
    }

    /// Graceful stop: SIGTERM, then SIGKILL after the grace period.
    pub async fn terminate(&mut self) {
        if let Some(pid) = self.child.id() {
            send_sigterm(pid).await;
            match tokio::time::timeout(TERMINATE_GRACE, self.child.wait()).await {
                Ok(Ok(status)) => {
                    debug!("{} terminated with {:?}", self.program, status.code());
                    return;
                }
                Ok(Err(e)) => warn!("{} wait failed during terminate: {}", self.program, e),
                Err(_) => warn!("{} ignored SIGTERM, killing", self.program),
            }
        }
        let _ = self.child.start_kill();
        let _ = self.child.wait().await;
    }
}

/// Best-effort SIGTERM to a pid. The `kill` tool keeps signal plumbing out
/// of the process image, same as every other external invocation here.
pub async fn send_sigterm(pid: u32) {
    let _ = Command::new("kill")
        .args(["-TERM", &pid.to_string()])
        .output()
        .await;
}
