// Allow unwrap/expect in tests for clear failure messages
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

//! # sereno-test
//!
//! Testing infrastructure for the Sereno supervisor.
//!
//! - **Harness**: temporary run directory, launch and poll helpers
//! - **Fixtures**: the `sereno-fixture` binary hosting tasks with known
//!   behaviour, selected through `SERENO_FIXTURE`
//!
//! ## Example
//!
//! ```rust,ignore
//! use sereno_test::SupervisorHarness;
//!
//! let harness = SupervisorHarness::builder(env!("CARGO_BIN_EXE_sereno-fixture"))
//!     .env("SERENO_FIXTURE", "ping")
//!     .build()?;
//! let mut supervisor = harness.start(["run"])?;
//! harness.wait_for_up("ping", Duration::from_secs(5))?;
//! supervisor.signal(Signal::SIGTERM)?;
//! harness.wait_for_cleanup(Duration::from_secs(12))?;
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod fixture;
pub mod harness;

pub use error::{Result, TestError};
pub use fixture::{FIXTURE_ENV, fixture_catalog, parse_fixture_spec};
pub use harness::{
    DetachedSupervisor, RunningSupervisor, SupervisorHarness, SupervisorHarnessBuilder,
};
