// Allow unwrap/expect in tests for clear failure messages
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

//! # sereno-supervisor
//!
//! Process side of the Sereno worker supervisor.
//!
//! - [`Supervisor`]: fork, reap and respawn the desired worker set
//! - [`WorkerRunner`]: what a forked worker does with its task
//! - [`Admin`]: `--stat`, `--up`, `--down`, `--bounce`, `--stop`, `--kill`
//! - [`signals`]: flag-only signal handlers shared by both sides of a fork
//!
//! Unix only.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod admin;
pub mod process;
pub mod signals;
pub mod supervisor;
pub mod worker;

pub use admin::{Admin, StateChange, status_lines};
pub use nix::sys::signal::Signal;
pub use process::{Escalation, Forked, ReapState};
pub use supervisor::{StartOptions, Supervisor};
pub use worker::WorkerRunner;
