//! Fixture tasks with known behaviour.
//!
//! `SERENO_FIXTURE` holds a comma-separated list of `name[:count]`. The base
//! name picks the behaviour; unknown names behave like `ping`.
//!
//! | name       | behaviour                                              |
//! |------------|--------------------------------------------------------|
//! | `ping`     | idles until interrupted                                |
//! | `quitter`  | asks to go down after 200ms                            |
//! | `crasher`  | fails after 300ms, so it is respawned                  |
//! | `stubborn` | ignores interrupts; only SIGKILL stops it              |

use std::time::Duration;

use sereno_core::{SupervisorError, TaskCatalog, TaskOutcome, WorkerContext, task_fn};

/// Environment variable read by the fixture binary.
pub const FIXTURE_ENV: &str = "SERENO_FIXTURE";

/// Parses `name[:count],...`. Malformed counts fall back to 1.
#[must_use]
pub fn parse_fixture_spec(spec: &str) -> Vec<(String, u32)> {
    spec.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| match entry.split_once(':') {
            Some((name, count)) => (name.to_string(), count.trim().parse().unwrap_or(1)),
            None => (entry.to_string(), 1),
        })
        .collect()
}

/// Builds the catalog described by `spec`.
#[must_use]
pub fn fixture_catalog(spec: &str) -> TaskCatalog {
    parse_fixture_spec(spec)
        .into_iter()
        .fold(TaskCatalog::new(), |catalog, (name, count)| {
            match name.as_str() {
                "quitter" => catalog.with_replicas(name, count, task_fn(quitter)),
                "crasher" => catalog.with_replicas(name, count, task_fn(crasher)),
                "stubborn" => catalog.with_replicas(name, count, task_fn(stubborn)),
                _ => catalog.with_replicas(name, count, task_fn(ping)),
            }
        })
}

async fn ping(ctx: WorkerContext) -> sereno_core::Result<TaskOutcome> {
    while ctx.sleep(Duration::from_millis(50)).await {}
    Ok(TaskOutcome::Finished)
}

async fn quitter(ctx: WorkerContext) -> sereno_core::Result<TaskOutcome> {
    if ctx.sleep(Duration::from_millis(200)).await {
        Ok(TaskOutcome::Down)
    } else {
        Ok(TaskOutcome::Finished)
    }
}

async fn crasher(ctx: WorkerContext) -> sereno_core::Result<TaskOutcome> {
    if ctx.sleep(Duration::from_millis(300)).await {
        Err(SupervisorError::process_control(format!("{} crashed", ctx.name())))
    } else {
        Ok(TaskOutcome::Finished)
    }
}

async fn stubborn(ctx: WorkerContext) -> sereno_core::Result<TaskOutcome> {
    // Blocks the runtime on purpose; the shutdown flag is never consulted.
    while ctx.pid() > 0 {
        std::thread::sleep(Duration::from_millis(100));
    }
    Ok(TaskOutcome::Finished)
}
