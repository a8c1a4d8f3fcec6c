//! TaskCoordinator - lifecycle of the hub's long-running background tasks
//!
//! The set of tasks is small and fixed: liveness probing, presence event
//! handling, presence watching, daemon polling. Each runs under a child of the
//! coordinator's shutdown token so it can be stopped on its own or with
//! everything else.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{HubError, HubResult};

pub const TASK_LIVENESS: &str = "liveness";
pub const TASK_PRESENCE_EVENTS: &str = "presence-events";
pub const TASK_PRESENCE_WATCH: &str = "presence-watch";
pub const TASK_SPOTIFY_POLL: &str = "spotify-poll";

/// Every task the hub knows how to run
pub const KNOWN_TASKS: &[&str] = &[
    TASK_LIVENESS,
    TASK_PRESENCE_EVENTS,
    TASK_PRESENCE_WATCH,
    TASK_SPOTIFY_POLL,
];

struct RunningTask {
    handle: JoinHandle<()>,
    cancel: CancellationToken,
}

pub struct TaskCoordinator {
    tasks: Mutex<BTreeMap<String, RunningTask>>,
    /// Parent of every task token
    shutdown: CancellationToken,
    /// How long to wait for a cancelled task to finish
    join_timeout: Duration,
}

impl Default for TaskCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskCoordinator {
    pub fn new() -> Self {
        Self::with_join_timeout(Duration::from_secs(5))
    }

    pub fn with_join_timeout(timeout: Duration) -> Self {
        Self {
            tasks: Mutex::new(BTreeMap::new()),
            shutdown: CancellationToken::new(),
            join_timeout: timeout,
        }
    }

    /// Start a named task. The closure receives the task's own token.
    ///
    /// Unknown names are rejected; starting a task that is already running
    /// is a no-op.
    pub fn start<F, Fut>(&self, name: &str, spawn_fn: F) -> HubResult<()>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if !KNOWN_TASKS.contains(&name) {
            return Err(HubError::not_found("task", name));
        }

        let mut tasks = self.tasks.lock();
        if tasks.get(name).is_some_and(|t| !t.handle.is_finished()) {
            debug!("Task {} already running", name);
            return Ok(());
        }

        let cancel = self.shutdown.child_token();
        let handle = tokio::spawn(spawn_fn(cancel.clone()));
        tasks.insert(name.to_string(), RunningTask { handle, cancel });
        info!("Started task: {}", name);
        Ok(())
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.tasks
            .lock()
            .get(name)
            .is_some_and(|t| !t.handle.is_finished())
    }

    /// Cancel one task and wait (bounded) for it to finish
    pub async fn stop(&self, name: &str) -> HubResult<()> {
        let task = {
            let mut tasks = self.tasks.lock();
            tasks.remove(name)
        };
        let Some(task) = task else {
            return Err(HubError::not_found("task", name));
        };

        info!("Stopping task: {}", name);
        task.cancel.cancel();
        self.join(name, task.handle).await;
        Ok(())
    }

    /// Cancel every task and wait for them
    pub async fn shutdown(&self) {
        info!("Coordinator initiating shutdown");
        self.shutdown.cancel();

        let handles: Vec<(String, JoinHandle<()>)> = {
            let mut tasks = self.tasks.lock();
            std::mem::take(&mut *tasks)
                .into_iter()
                .map(|(name, task)| (name, task.handle))
                .collect()
        };

        if handles.is_empty() {
            info!("No tasks running, shutdown complete");
            return;
        }

        info!("Waiting for {} task(s)", handles.len());
        for (name, handle) in handles {
            self.join(&name, handle).await;
        }
        info!("Coordinator shutdown complete");
    }

    async fn join(&self, name: &str, handle: JoinHandle<()>) {
        let abort = handle.abort_handle();
        match tokio::time::timeout(self.join_timeout, handle).await {
            Ok(Ok(())) => debug!("Task {} stopped cleanly", name),
            Ok(Err(e)) if e.is_cancelled() => debug!("Task {} aborted", name),
            Ok(Err(e)) => error!("Task {} panicked: {}", name, e),
            Err(_) => {
                warn!("Task {} did not stop within {:?}, aborting", name, self.join_timeout);
                abort.abort();
            }
        }
    }

    /// Token that fires when the coordinator shuts down
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn task_status(&self) -> BTreeMap<String, TaskStatus> {
        self.tasks
            .lock()
            .iter()
            .map(|(name, task)| {
                (
                    name.clone(),
                    TaskStatus {
                        running: !task.handle.is_finished(),
                    },
                )
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TaskStatus {
    pub running: bool,
}
