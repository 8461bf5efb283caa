// Allow unwrap/expect in tests for clear failure messages
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

//! Sereno: a multi-process worker supervisor with a file-backed registry.
//!
//! A host binary registers named tasks, optionally replicated, and hands
//! them to [`cli::main`]. The supervisor forks one worker per name, respawns
//! crashed workers, and answers `--stat`, `--up`, `--down`, `--bounce`,
//! `--stop` and `--kill` from separate invocations through the registry file.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use sereno::prelude::*;
//!
//! let catalog = TaskCatalog::new().with_replicas(
//!     "mailer",
//!     2,
//!     task_fn(|ctx: WorkerContext| async move {
//!         while ctx.sleep(std::time::Duration::from_secs(5)).await {
//!             tracing::info!(worker = %ctx.name(), "polling outbox");
//!         }
//!         Ok(TaskOutcome::Finished)
//!     }),
//! );
//! std::process::exit(sereno::cli::main(catalog));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;

pub use sereno_core as core;
pub use sereno_supervisor as supervisor;

/// Prelude module for common imports.
pub mod prelude {
    pub use sereno_core::{
        Result, SupervisorConfig, SupervisorError, Task, TaskCatalog, TaskOutcome, WorkerContext,
        WorkerName, task_fn,
    };
    pub use sereno_supervisor::{Admin, StartOptions, StateChange, Supervisor};
}
