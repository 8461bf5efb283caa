// Allow unwrap/expect in tests for clear failure messages
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

//! # sereno-core
//!
//! Shared primitives for the Sereno worker supervisor.
//!
//! - [`Registry`] / [`RegistryFile`]: the lock-guarded worker registry
//! - [`ChannelReader`] / [`ChannelWriter`]: the named-pipe notification channel
//! - [`Task`] / [`TaskCatalog`]: application work and the desired worker set
//! - [`FileWatch`]: attribute watcher that ends the supervisor on change
//! - [`SupervisorConfig`]: validated configuration
//!
//! Nothing in this crate forks or installs signal handlers; that lives in
//! `sereno-supervisor`.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod channel;
pub mod config;
pub mod error;
pub mod registry;
pub mod task;
pub mod types;
pub mod watch;

pub use channel::{ChannelReader, ChannelWriter, FrameDecoder, Message, Report, wake_supervisor};
pub use config::{EscalationConfig, SupervisorConfig};
pub use error::{Result, SupervisorError};
pub use registry::{Registry, RegistryFile};
pub use task::{
    FnTask, Task, TaskCatalog, TaskOutcome, WorkerContext, expand_desired_set, task_fn,
};
pub use types::{SUPERVISOR_KEY, WorkerName, WorkerRecord, WorkerStatus, now_epoch_ms};
pub use watch::FileWatch;
