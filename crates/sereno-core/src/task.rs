//! Tasks run by workers and the desired worker set.
//!
//! The host application registers one [`Task`] per base name, optionally
//! with a replica count. [`TaskCatalog::desired_set`] expands that into the
//! list of registry keys the supervisor keeps running.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{Result, SupervisorError};
use crate::types::WorkerName;

/// Longest single nap taken by [`WorkerContext::sleep`].
const SLEEP_SLICE: Duration = Duration::from_millis(100);

/// How a task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TaskOutcome {
    /// Normal return; the supervisor respawns the worker while it is wanted up.
    #[default]
    Finished,
    /// Take this worker down and leave it down until an explicit `up`.
    Down,
}

/// Runtime context handed to a task inside its worker process.
#[derive(Debug, Clone)]
pub struct WorkerContext {
    name: WorkerName,
    pid: i32,
    shutdown: &'static AtomicBool,
}

impl WorkerContext {
    /// Creates a context for worker `name` running as `pid`.
    ///
    /// `shutdown` is the process-wide flag raised by SIGINT/SIGTERM.
    #[must_use]
    pub fn new(name: WorkerName, pid: i32, shutdown: &'static AtomicBool) -> Self {
        Self {
            name,
            pid,
            shutdown,
        }
    }

    /// Registry key of this worker (including any replica suffix).
    #[must_use]
    pub const fn name(&self) -> &WorkerName {
        &self.name
    }

    /// Task name without the replica suffix.
    #[must_use]
    pub fn base_name(&self) -> &str {
        self.name.base()
    }

    /// Process id of the worker.
    #[must_use]
    pub const fn pid(&self) -> i32 {
        self.pid
    }

    /// Returns true once the worker has been asked to stop.
    #[must_use]
    pub fn should_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Sleeps for `duration`, waking early if shutdown is requested.
    ///
    /// Returns false if the sleep was cut short.
    pub async fn sleep(&self, duration: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + duration;
        loop {
            if self.should_shutdown() {
                return false;
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return true;
            }
            tokio::time::sleep((deadline - now).min(SLEEP_SLICE)).await;
        }
    }
}

/// A named unit of long-running work executed inside a worker process.
///
/// `run` is invoked once per process lifetime. Long loops should check
/// [`WorkerContext::should_shutdown`] or use [`WorkerContext::sleep`] so an
/// interrupt ends the task instead of waiting for SIGKILL.
#[async_trait]
pub trait Task: Send + Sync + 'static {
    /// Runs the task to completion.
    ///
    /// # Errors
    /// An error is logged and treated like [`TaskOutcome::Finished`].
    async fn run(&self, ctx: WorkerContext) -> Result<TaskOutcome>;
}

/// Adapts an async closure into a [`Task`].
pub struct FnTask<F>(F);

#[async_trait]
impl<F, Fut> Task for FnTask<F>
where
    F: Fn(WorkerContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<TaskOutcome>> + Send + 'static,
{
    async fn run(&self, ctx: WorkerContext) -> Result<TaskOutcome> {
        (self.0)(ctx).await
    }
}

/// Wraps an async closure as a task.
pub fn task_fn<F, Fut>(f: F) -> FnTask<F>
where
    F: Fn(WorkerContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<TaskOutcome>> + Send + 'static,
{
    FnTask(f)
}

#[derive(Clone)]
struct Entry {
    task: Arc<dyn Task>,
    process_count: u32,
}

/// Base task names with their tasks and replica hints.
#[derive(Clone, Default)]
pub struct TaskCatalog {
    entries: BTreeMap<String, Entry>,
}

impl std::fmt::Debug for TaskCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(self.entries.iter().map(|(k, e)| (k, e.process_count)))
            .finish()
    }
}

impl TaskCatalog {
    /// Creates an empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a single-copy task.
    #[must_use]
    pub fn with_task(self, name: impl Into<String>, task: impl Task) -> Self {
        self.with_replicas(name, 1, task)
    }

    /// Registers a task run as `process_count` parallel copies.
    #[must_use]
    pub fn with_replicas(mut self, name: impl Into<String>, process_count: u32, task: impl Task) -> Self {
        self.entries.insert(
            name.into(),
            Entry {
                task: Arc::new(task),
                process_count,
            },
        );
        self
    }

    /// Overrides replica counts, keyed by base name. Unknown names are ignored.
    pub fn apply_process_counts(&mut self, counts: &BTreeMap<String, u32>) {
        for (name, count) in counts {
            match self.entries.get_mut(name) {
                Some(entry) => entry.process_count = *count,
                None => tracing::warn!(task = %name, "process_count set for unknown task"),
            }
        }
    }

    /// Looks up the task for a worker, by its base name.
    #[must_use]
    pub fn task_for(&self, name: &WorkerName) -> Option<Arc<dyn Task>> {
        self.entries.get(name.base()).map(|e| Arc::clone(&e.task))
    }

    /// Number of registered base names.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if no task is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Expands the catalog into the desired worker set.
    ///
    /// # Errors
    /// `Config` if the expansion exceeds `maximum`.
    pub fn desired_set(&self, maximum: usize) -> Result<Vec<WorkerName>> {
        expand_desired_set(
            self.entries
                .iter()
                .map(|(name, entry)| (name.as_str(), entry.process_count)),
            maximum,
        )
    }
}

/// Expands `(base name, process count)` pairs into worker names.
///
/// A count of 0 or 1 yields the bare name; `n > 1` yields `name^0 .. name^(n-1)`.
///
/// # Errors
/// `Config` if the total exceeds `maximum`; nothing is truncated.
pub fn expand_desired_set<'a>(
    tasks: impl IntoIterator<Item = (&'a str, u32)>,
    maximum: usize,
) -> Result<Vec<WorkerName>> {
    let mut names = Vec::new();
    for (base, count) in tasks {
        if count <= 1 {
            names.push(WorkerName::new(base));
        } else {
            names.extend((0..count).map(|i| WorkerName::replica(base, i)));
        }
    }
    if names.len() > maximum {
        return Err(SupervisorError::config(format!(
            "total daemon processes are {}, greater than {maximum} processes; \
             lower process_count or raise maximum_processes",
            names.len()
        )));
    }
    Ok(names)
}
