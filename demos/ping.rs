//! Minimal host application.
//!
//! ```text
//! cargo run --example ping                  # supervise in the foreground
//! cargo run --example ping -- --stat        # from another terminal
//! cargo run --example ping -- --down=pong
//! cargo run --example ping -- --stop
//! ```

use std::time::Duration;

use async_trait::async_trait;
use sereno::prelude::*;

/// Logs a line every few seconds until interrupted.
struct Ping {
    every: Duration,
}

#[async_trait]
impl Task for Ping {
    async fn run(&self, ctx: WorkerContext) -> Result<TaskOutcome> {
        let mut count = 0u64;
        while ctx.sleep(self.every).await {
            count += 1;
            tracing::info!(worker = %ctx.name(), pid = ctx.pid(), count, "ping");
        }
        Ok(TaskOutcome::Finished)
    }
}

fn main() -> anyhow::Result<()> {
    let catalog = TaskCatalog::new()
        .with_task(
            "ping",
            Ping {
                every: Duration::from_secs(2),
            },
        )
        .with_replicas(
            "pong",
            2,
            task_fn(|ctx: WorkerContext| async move {
                // Crash after a while to show respawning.
                ctx.sleep(Duration::from_secs(15)).await;
                if ctx.should_shutdown() {
                    return Ok(TaskOutcome::Finished);
                }
                Err(SupervisorError::process_control(format!(
                    "{} gave up",
                    ctx.name()
                )))
            }),
        );

    let code = sereno::cli::main(catalog);
    if code != 0 {
        anyhow::bail!("sereno exited with status {code}");
    }
    Ok(())
}
