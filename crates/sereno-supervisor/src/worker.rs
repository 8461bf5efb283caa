//! Worker side of a fork: report in, run the task, report out.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use sereno_core::{
    ChannelWriter, Message, Report, Result, SupervisorError, Task, TaskOutcome, WorkerContext,
    WorkerName,
};

use crate::signals;

/// Runs one task inside a worker process.
pub struct WorkerRunner {
    name: WorkerName,
    task: Arc<dyn Task>,
    channel: Option<PathBuf>,
    terminate_wait: Option<Duration>,
    ignore_hangup: bool,
}

impl std::fmt::Debug for WorkerRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerRunner")
            .field("name", &self.name)
            .field("channel", &self.channel)
            .field("terminate_wait", &self.terminate_wait)
            .field("ignore_hangup", &self.ignore_hangup)
            .finish_non_exhaustive()
    }
}

impl WorkerRunner {
    /// Creates a runner for `task` under registry key `name`.
    #[must_use]
    pub fn new(name: WorkerName, task: Arc<dyn Task>) -> Self {
        Self {
            name,
            task,
            channel: None,
            terminate_wait: None,
            ignore_hangup: false,
        }
    }

    /// Reports to the supervisor over the FIFO at `path`.
    #[must_use]
    pub fn with_channel(mut self, path: impl Into<PathBuf>) -> Self {
        self.channel = Some(path.into());
        self
    }

    /// Lingers for `wait` after an interrupt before exiting.
    #[must_use]
    pub const fn with_terminate_wait(mut self, wait: Option<Duration>) -> Self {
        self.terminate_wait = wait;
        self
    }

    /// Keeps SIGHUP from stopping the worker.
    #[must_use]
    pub const fn with_ignore_hangup(mut self, ignore: bool) -> Self {
        self.ignore_hangup = ignore;
        self
    }

    /// Runs the task to completion and returns the process exit code.
    ///
    /// Reporting failures are logged; a worker whose supervisor vanished
    /// still runs its task.
    #[must_use]
    pub fn run(self) -> i32 {
        signals::reset();
        if let Err(e) = signals::install(self.ignore_hangup) {
            tracing::error!(worker = %self.name, error = %e, "cannot install signal handlers");
            return 1;
        }
        let pid = std::process::id() as i32;

        let mut writer = self.channel.as_ref().and_then(|path| {
            ChannelWriter::open(path)
                .inspect_err(|e| {
                    tracing::warn!(worker = %self.name, error = %e, "cannot open notification channel");
                })
                .ok()
        });
        if let Some(writer) = writer.as_ref() {
            signals::set_wake_fd(writer.raw_fd());
        }
        self.report(writer.as_mut(), Report::Alive(pid));
        tracing::debug!(worker = %self.name, pid, "worker started");

        let outcome = match self.execute(pid) {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(worker = %self.name, error = %e, "task failed");
                TaskOutcome::Finished
            }
        };

        if signals::quitting() {
            if let Some(wait) = self.terminate_wait {
                tracing::info!(
                    worker = %self.name,
                    wait = %humantime::format_duration(wait),
                    "waiting before exit"
                );
                std::thread::sleep(wait);
            }
        }

        let report = match outcome {
            TaskOutcome::Finished => Report::Finished,
            TaskOutcome::Down => {
                tracing::warn!(worker = %self.name, "task requested to go down");
                Report::Down
            }
        };
        self.report(writer.as_mut(), report);
        signals::clear_wake_fd();
        drop(writer);
        tracing::debug!(worker = %self.name, pid, "worker exiting");
        0
    }

    fn execute(&self, pid: i32) -> Result<TaskOutcome> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| SupervisorError::process_control(format!("tokio runtime: {e}")))?;
        let ctx = WorkerContext::new(self.name.clone(), pid, signals::shutdown_flag());
        runtime.block_on(self.task.run(ctx))
    }

    fn report(&self, writer: Option<&mut ChannelWriter>, report: Report) {
        let Some(writer) = writer else { return };
        if let Err(e) = writer.send(&Message::report(self.name.clone(), report)) {
            tracing::warn!(worker = %self.name, error = %e, "cannot report to supervisor");
        }
    }
}
