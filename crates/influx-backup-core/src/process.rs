//! influxd subprocess execution
//!
//! A run moves through [`ProcessState`]: it is spawned, its output is
//! streamed to the log, and it terminates. Any output on stderr is treated as
//! fatal: the child is killed at once and the stderr text becomes the failure
//! reason, taking precedence over the exit code.

use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::errors::{BackupError, Result};

const READ_CHUNK: usize = 8 * 1024;

/// Executes one external command to completion
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    async fn run(&self, working_dir: &Path, args: &[String]) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessState {
    Idle,
    Spawned,
    /// stderr output was seen and the child was told to exit
    Killed,
    Terminated,
}

/// Bookkeeping for a single run, independent of how the child is driven
#[derive(Debug)]
pub struct ProcessLifecycle {
    state: ProcessState,
    failure: Option<String>,
}

impl Default for ProcessLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessLifecycle {
    pub fn new() -> Self {
        Self {
            state: ProcessState::Idle,
            failure: None,
        }
    }

    pub fn state(&self) -> &ProcessState {
        &self.state
    }

    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    pub fn spawned(&mut self) {
        self.state = ProcessState::Spawned;
    }

    /// Record a chunk of stderr. Returns true when the child must be killed.
    pub fn stderr(&mut self, text: &str) -> bool {
        if self.state != ProcessState::Spawned {
            return false;
        }
        self.state = ProcessState::Killed;
        let trimmed = text.trim_end();
        self.failure = Some(if trimmed.is_empty() { text } else { trimmed }.to_string());
        true
    }

    /// Record a process level error (spawn failure, wait failure)
    pub fn error(&mut self, err: impl Display) {
        if self.failure.is_none() {
            self.failure = Some(err.to_string());
        }
    }

    /// Interpret the exit code and settle the run
    pub fn terminated(&mut self, code: Option<i32>) -> Result<()> {
        self.state = ProcessState::Terminated;
        match (code, self.failure.take()) {
            (Some(0), None) => Ok(()),
            (_, Some(reason)) => Err(BackupError::Subprocess(reason)),
            (Some(code), None) => Err(BackupError::Subprocess(format!(
                "exited with code {}",
                code
            ))),
            (None, None) => Err(BackupError::Subprocess("terminated by signal".into())),
        }
    }
}

/// Runs the influxd binary as a child process
#[derive(Debug, Clone)]
pub struct InfluxdRunner {
    binary: PathBuf,
}

impl InfluxdRunner {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }
}

#[async_trait]
impl ProcessRunner for InfluxdRunner {
    async fn run(&self, working_dir: &Path, args: &[String]) -> Result<()> {
        let mut lifecycle = ProcessLifecycle::new();

        let mut command = Command::new(&self.binary);
        command
            .args(args)
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!("Failed to spawn {}: {}", self.binary.display(), e);
                lifecycle.error(format!("failed to spawn {}: {}", self.binary.display(), e));
                return lifecycle.terminated(None);
            }
        };
        lifecycle.spawned();
        info!(
            "influxd command started: {} {}",
            self.binary.display(),
            args.join(" ")
        );

        let (mut stdout, mut stderr) = match (child.stdout.take(), child.stderr.take()) {
            (Some(stdout), Some(stderr)) => (stdout, stderr),
            _ => {
                let _ = child.start_kill();
                return Err(BackupError::Internal("child output not captured".into()));
            }
        };

        let mut out_buf = vec![0u8; READ_CHUNK];
        let mut err_buf = vec![0u8; READ_CHUNK];
        let mut stdout_open = true;
        let mut stderr_open = true;

        // Settle after both pipes close so no stderr is missed. Once killed,
        // wait on the child alone: a grandchild may still hold the pipes.
        let code = loop {
            tokio::select! {
                read = stdout.read(&mut out_buf), if stdout_open => match read {
                    Ok(0) => stdout_open = false,
                    Ok(n) => debug!("{}", String::from_utf8_lossy(&out_buf[..n]).trim_end()),
                    Err(e) => {
                        warn!("Failed to read influxd stdout: {}", e);
                        stdout_open = false;
                    }
                },
                read = stderr.read(&mut err_buf), if stderr_open => match read {
                    Ok(0) => stderr_open = false,
                    Ok(n) => {
                        let text = String::from_utf8_lossy(&err_buf[..n]).into_owned();
                        warn!("influxd stderr: {}", text.trim_end());
                        if lifecycle.stderr(&text) {
                            if let Err(e) = child.start_kill() {
                                debug!("Kill after stderr failed: {}", e);
                            }
                        }
                    }
                    Err(e) => {
                        warn!("Failed to read influxd stderr: {}", e);
                        stderr_open = false;
                    }
                },
                status = child.wait(),
                    if (!stdout_open && !stderr_open) || *lifecycle.state() == ProcessState::Killed =>
                match status {
                    Ok(status) => break status.code(),
                    Err(e) => {
                        lifecycle.error(e);
                        break None;
                    }
                },
            }
        };

        info!("influxd command done (exit code {:?})", code);
        lifecycle.terminated(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_exit_succeeds() {
        let mut lifecycle = ProcessLifecycle::new();
        lifecycle.spawned();
        assert!(lifecycle.terminated(Some(0)).is_ok());
        assert_eq!(lifecycle.state(), &ProcessState::Terminated);
    }

    #[test]
    fn test_nonzero_exit_reports_code() {
        let mut lifecycle = ProcessLifecycle::new();
        lifecycle.spawned();
        let err = lifecycle.terminated(Some(2)).unwrap_err();
        assert_eq!(err.to_string(), "influxd failed: exited with code 2");
    }

    #[test]
    fn test_first_stderr_chunk_wins() {
        let mut lifecycle = ProcessLifecycle::new();
        lifecycle.spawned();

        assert!(lifecycle.stderr("backup failed: shard 3\n"));
        assert_eq!(lifecycle.state(), &ProcessState::Killed);
        assert!(!lifecycle.stderr("second chunk"));
        lifecycle.error("broken pipe");

        match lifecycle.terminated(Some(-1)) {
            Err(BackupError::Subprocess(reason)) => assert_eq!(reason, "backup failed: shard 3"),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_stderr_fails_even_on_zero_exit() {
        let mut lifecycle = ProcessLifecycle::new();
        lifecycle.spawned();
        lifecycle.stderr("warning");
        assert!(lifecycle.terminated(Some(0)).is_err());
    }

    #[test]
    fn test_signal_without_reason() {
        let mut lifecycle = ProcessLifecycle::new();
        lifecycle.spawned();
        let err = lifecycle.terminated(None).unwrap_err();
        assert!(err.to_string().contains("terminated by signal"));
    }

    #[cfg(unix)]
    mod unix {
        use super::*;
        use std::time::{Duration, Instant};
        use tempfile::TempDir;

        fn sh(script: &str) -> Vec<String> {
            vec!["-c".to_string(), script.to_string()]
        }

        #[tokio::test]
        async fn test_success_with_large_stdout() {
            let dir = TempDir::new().unwrap();
            let runner = InfluxdRunner::new("sh");
            runner
                .run(dir.path(), &sh("i=0; while [ $i -lt 5000 ]; do echo line $i; i=$((i+1)); done"))
                .await
                .unwrap();
        }

        #[tokio::test]
        async fn test_runs_in_working_directory() {
            let dir = TempDir::new().unwrap();
            let runner = InfluxdRunner::new("sh");
            runner.run(dir.path(), &sh("echo data > out.txt")).await.unwrap();
            assert!(dir.path().join("out.txt").exists());
        }

        #[tokio::test]
        async fn test_nonzero_exit() {
            let dir = TempDir::new().unwrap();
            let runner = InfluxdRunner::new("sh");
            let err = runner.run(dir.path(), &sh("exit 3")).await.unwrap_err();
            assert!(err.to_string().contains("exited with code 3"));
        }

        #[tokio::test]
        async fn test_stderr_kills_process() {
            let dir = TempDir::new().unwrap();
            let runner = InfluxdRunner::new("sh");
            let started = Instant::now();

            let err = runner
                .run(dir.path(), &sh("echo 'restore: database exists' >&2; exec sleep 30"))
                .await
                .unwrap_err();

            assert!(started.elapsed() < Duration::from_secs(20));
            match err {
                BackupError::Subprocess(reason) => assert_eq!(reason, "restore: database exists"),
                other => panic!("unexpected error: {:?}", other),
            }
        }

        #[tokio::test]
        async fn test_stderr_kill_ignores_inherited_pipes() {
            let dir = TempDir::new().unwrap();
            let runner = InfluxdRunner::new("sh");
            let started = Instant::now();

            // The background sleep keeps stdout and stderr open after sh is killed
            let err = runner
                .run(dir.path(), &sh("sleep 30 & echo 'shard disabled' >&2; sleep 30"))
                .await
                .unwrap_err();

            assert!(started.elapsed() < Duration::from_secs(20));
            match err {
                BackupError::Subprocess(reason) => assert_eq!(reason, "shard disabled"),
                other => panic!("unexpected error: {:?}", other),
            }
        }

        #[tokio::test]
        async fn test_missing_binary() {
            let dir = TempDir::new().unwrap();
            let runner = InfluxdRunner::new("/nonexistent/influxd");
            let err = runner.run(dir.path(), &sh("true")).await.unwrap_err();
            assert!(matches!(err, BackupError::Subprocess(_)));
            assert!(err.to_string().contains("failed to spawn"));
        }
    }
}
