//! Supervision of background watch tasks.
//!
//! Each watch runs as one tokio task registered under a name together with
//! its cancellation token. Stopping a watch cancels the token and joins the
//! task. A task that returns an error is recorded as a terminal failure and
//! is not restarted.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::Result;

/// A watch task that ended with an error.
#[derive(Debug, Clone)]
pub struct WatchFailure {
    /// Name the task was registered under.
    pub name: String,
    /// Rendered error.
    pub error: String,
    /// When the failure was recorded.
    pub at: SystemTime,
}

struct WatchTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Tracks one task per active watch.
#[derive(Default)]
pub struct WatchSupervisor {
    tasks: Mutex<HashMap<String, WatchTask>>,
    failures: Arc<Mutex<Vec<WatchFailure>>>,
    closed: AtomicBool,
}

impl WatchSupervisor {
    /// Create an empty supervisor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `task` under `name` until it returns or `cancel` fires.
    ///
    /// Returns false, and cancels `cancel`, if a live task already holds
    /// the name or the supervisor has been shut down. A finished task under
    /// the same name is replaced.
    pub fn spawn<F>(&self, name: impl Into<String>, cancel: CancellationToken, task: F) -> bool
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let name = name.into();
        let mut tasks = self.tasks.lock();
        if self.closed.load(Ordering::Acquire) {
            debug!(watch = %name, "supervisor shut down, not starting watch");
            cancel.cancel();
            return false;
        }
        if let Some(existing) = tasks.get(&name) {
            if !existing.handle.is_finished() {
                debug!(watch = %name, "watch already running");
                cancel.cancel();
                return false;
            }
        }

        let failures = self.failures.clone();
        let task_name = name.clone();
        let handle = tokio::spawn(async move {
            match task.await {
                Ok(()) => debug!(watch = %task_name, "watch task finished"),
                Err(err) => {
                    error!(watch = %task_name, error = %err, "watch task failed, not restarting");
                    failures.lock().push(WatchFailure {
                        name: task_name,
                        error: err.to_string(),
                        at: SystemTime::now(),
                    });
                }
            }
        });

        info!(watch = %name, "watch started");
        tasks.insert(name, WatchTask { cancel, handle });
        true
    }

    /// Cancel and join the task registered under `name`.
    ///
    /// Returns false if no task was registered. Calling it again is a no-op.
    pub async fn stop(&self, name: &str) -> bool {
        let task = self.tasks.lock().remove(name);
        match task {
            Some(task) => {
                task.cancel.cancel();
                Self::join(name, task.handle).await;
                info!(watch = %name, "watch stopped");
                true
            }
            None => false,
        }
    }

    /// Cancel and join every task. No task can be started afterwards.
    pub async fn shutdown(&self) {
        let tasks: Vec<(String, WatchTask)> = {
            let mut tasks = self.tasks.lock();
            self.closed.store(true, Ordering::Release);
            tasks.drain().collect()
        };
        for (_, task) in &tasks {
            task.cancel.cancel();
        }
        for (name, task) in tasks {
            Self::join(&name, task.handle).await;
        }
        debug!("all watches stopped");
    }

    async fn join(name: &str, handle: JoinHandle<()>) {
        if let Err(err) = handle.await {
            warn!(watch = %name, error = %err, "watch task did not exit cleanly");
        }
    }

    /// Whether a live task is registered under `name`.
    pub fn is_running(&self, name: &str) -> bool {
        self.tasks
            .lock()
            .get(name)
            .map(|task| !task.handle.is_finished())
            .unwrap_or(false)
    }

    /// Names of all live tasks.
    pub fn active(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .tasks
            .lock()
            .iter()
            .filter(|(_, task)| !task.handle.is_finished())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Terminal failures recorded so far.
    pub fn failures(&self) -> Vec<WatchFailure> {
        self.failures.lock().clone()
    }
}
