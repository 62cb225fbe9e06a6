//! Single-flight queue for influxd runs
//!
//! A [`ProcessQueue`] starts at most one run at a time. Requests arriving
//! while a run is active wait in FIFO order and are started as soon as the
//! active one terminates. Each caller gets exactly one outcome.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::errors::{BackupError, Result};
use crate::process::ProcessRunner;

/// Working directory and arguments of one run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRequest {
    pub working_dir: PathBuf,
    pub args: Vec<String>,
}

struct PendingRun {
    id: u64,
    request: RunRequest,
    done: oneshot::Sender<Result<()>>,
}

#[derive(Default)]
struct QueueState {
    active: Option<u64>,
    pending: VecDeque<PendingRun>,
    next_id: u64,
}

impl QueueState {
    fn start_next(&mut self) -> Option<PendingRun> {
        let run = self.pending.pop_front()?;
        self.active = Some(run.id);
        Some(run)
    }
}

#[derive(Clone)]
pub struct ProcessQueue {
    runner: Arc<dyn ProcessRunner>,
    state: Arc<Mutex<QueueState>>,
}

impl ProcessQueue {
    pub fn new(runner: Arc<dyn ProcessRunner>) -> Self {
        Self {
            runner,
            state: Arc::new(Mutex::new(QueueState::default())),
        }
    }

    /// Run a command once every earlier request has finished
    pub async fn run(&self, working_dir: impl Into<PathBuf>, args: Vec<String>) -> Result<()> {
        let (done, outcome) = oneshot::channel();
        let request = RunRequest {
            working_dir: working_dir.into(),
            args,
        };

        let ready = {
            let mut state = self.state.lock();
            let id = state.next_id;
            state.next_id += 1;
            state.pending.push_back(PendingRun { id, request, done });

            if state.active.is_none() {
                state.start_next()
            } else {
                debug!(
                    "influxd run {} queued behind {} pending",
                    id,
                    state.pending.len() - 1
                );
                None
            }
        };
        if let Some(run) = ready {
            self.dispatch(run);
        }

        outcome
            .await
            .map_err(|_| BackupError::Internal("influxd run dropped before completion".into()))?
    }

    /// Whether a run is currently executing
    pub fn is_active(&self) -> bool {
        self.state.lock().active.is_some()
    }

    /// Number of requests waiting behind the active run
    pub fn pending(&self) -> usize {
        self.state.lock().pending.len()
    }

    fn dispatch(&self, run: PendingRun) {
        let queue = self.clone();
        tokio::spawn(async move {
            let PendingRun { id, request, done } = run;
            debug!("Starting influxd run {} in {:?}", id, request.working_dir);

            // A panicking runner must not stall the queue
            let runner = queue.runner.clone();
            let result = tokio::spawn(async move {
                runner.run(&request.working_dir, &request.args).await
            })
            .await
            .unwrap_or_else(|e| Err(e.into()));

            if done.send(result).is_err() {
                warn!("Caller of influxd run {} went away before completion", id);
            }

            let next = {
                let mut state = queue.state.lock();
                state.active = None;
                state.start_next()
            };
            if let Some(next) = next {
                queue.dispatch(next);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingRunner {
        running: AtomicUsize,
        max_running: AtomicUsize,
        started: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ProcessRunner for RecordingRunner {
        async fn run(&self, _working_dir: &Path, args: &[String]) -> Result<()> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(now, Ordering::SeqCst);
            self.started.lock().push(args[0].clone());

            tokio::time::sleep(Duration::from_millis(5)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);

            match args[0].as_str() {
                "fail" => Err(BackupError::Subprocess("exited with code 1".into())),
                "panic" => panic!("runner exploded"),
                _ => Ok(()),
            }
        }
    }

    async fn submit_all(queue: &ProcessQueue, names: &[&str]) -> Vec<Result<()>> {
        let mut handles = Vec::new();
        for name in names {
            let queue = queue.clone();
            let args = vec![name.to_string()];
            handles.push(tokio::spawn(async move { queue.run("/tmp", args).await }));
            tokio::task::yield_now().await;
        }

        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap());
        }
        results
    }

    #[tokio::test]
    async fn test_runs_start_in_submission_order() {
        let runner = Arc::new(RecordingRunner::default());
        let queue = ProcessQueue::new(runner.clone());

        let names: Vec<String> = (0..8).map(|i| format!("run{}", i)).collect();
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
        let results = submit_all(&queue, &refs).await;

        assert!(results.iter().all(|r| r.is_ok()));
        assert_eq!(*runner.started.lock(), names);
        assert_eq!(runner.max_running.load(Ordering::SeqCst), 1);
        assert!(!queue.is_active());
        assert_eq!(queue.pending(), 0);
    }

    #[tokio::test]
    async fn test_failure_reaches_only_its_caller() {
        let runner = Arc::new(RecordingRunner::default());
        let queue = ProcessQueue::new(runner.clone());

        let results = submit_all(&queue, &["a", "fail", "b"]).await;

        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(BackupError::Subprocess(_))));
        assert!(results[2].is_ok());
        assert_eq!(*runner.started.lock(), vec!["a", "fail", "b"]);
    }

    #[tokio::test]
    async fn test_panicking_runner_does_not_stall_queue() {
        let runner = Arc::new(RecordingRunner::default());
        let queue = ProcessQueue::new(runner.clone());

        let results = submit_all(&queue, &["panic", "after"]).await;

        assert!(matches!(results[0], Err(BackupError::Internal(_))));
        assert!(results[1].is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_reports_activity() {
        let runner = Arc::new(RecordingRunner::default());
        let queue = ProcessQueue::new(runner);

        let first = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.run("/tmp", vec!["slow".into()]).await })
        };
        let second = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.run("/tmp", vec!["next".into()]).await })
        };
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;

        assert!(queue.is_active());
        assert_eq!(queue.pending(), 1);

        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();
        assert!(!queue.is_active());
    }
}
