//! Administrative commands run against a live (or dead) supervisor.
//!
//! Every command works from the registry file alone. State changes are
//! written first and then enforced by signalling; the supervisor notices on
//! its next pass, which a wake-up ping on the channel brings forward.

use std::io::Write;

use nix::sys::signal::Signal;
use sereno_core::{
    Registry, RegistryFile, Result, SupervisorConfig, SupervisorError, TaskCatalog, WorkerName,
    WorkerStatus, now_epoch_ms, wake_supervisor,
};

use crate::process::{self, Escalation};

/// What `--up`, `--down` and `--bounce` ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateChange {
    /// Want the worker running.
    Up,
    /// Want the worker stopped and not respawned.
    Down,
    /// Restart the worker once.
    Bounce,
}

impl std::fmt::Display for StateChange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Up => "up",
            Self::Down => "down",
            Self::Bounce => "bounce",
        })
    }
}

/// Administrative command runner.
#[derive(Debug, Clone)]
pub struct Admin {
    config: SupervisorConfig,
    registry: RegistryFile,
}

impl Admin {
    /// Creates a runner for the registry described by `config`.
    #[must_use]
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            registry: RegistryFile::new(config.registry_path()),
            config,
        }
    }

    /// Prints the desired set, one name per line.
    ///
    /// # Errors
    /// `Config` if the desired set exceeds the ceiling; write errors.
    pub fn list(&self, catalog: &TaskCatalog, out: &mut dyn Write) -> Result<i32> {
        let mut catalog = catalog.clone();
        catalog.apply_process_counts(&self.config.process_count);
        for name in catalog.desired_set(self.config.maximum_processes)? {
            writeln!(out, "{name}")?;
        }
        Ok(0)
    }

    /// Prints one status line per registry record.
    ///
    /// Records marked `up` whose process is gone are pruned first.
    ///
    /// # Errors
    /// Registry access or write errors.
    pub fn stat(&self, out: &mut dyn Write) -> Result<i32> {
        let mut registry = self.registry.load_or_empty()?;
        let before = registry.len();
        registry.retain(|name, record| {
            let keep = record.status == WorkerStatus::Down || process::is_alive(record.pid);
            if !keep {
                tracing::debug!(worker = %name, pid = record.pid, "pruning dead process");
            }
            keep
        });
        if registry.len() != before {
            self.registry.save(&registry)?;
        }

        if registry.is_empty() {
            writeln!(out, "Not running.")?;
            return Ok(0);
        }
        for line in status_lines(&registry, now_epoch_ms(), process::is_alive) {
            writeln!(out, "{line}")?;
        }
        Ok(0)
    }

    /// Applies `change` to every worker matching `pattern`.
    ///
    /// `all` selects every worker; an exact name selects one; anything else
    /// matches case-insensitively as a substring.
    ///
    /// # Errors
    /// `NotFound` if nothing matches; registry access errors.
    pub fn change_state(&self, pattern: &str, change: StateChange) -> Result<i32> {
        let registry = self.registry.load_or_empty()?;
        let names = registry.resolve(pattern);
        if names.is_empty() {
            return Err(SupervisorError::NotFound(pattern.to_string()));
        }
        if pattern != "all" && names.iter().all(|name| name.as_str() != pattern) {
            for name in &names {
                tracing::info!(worker = %name, "Matched process name {name}");
            }
        }

        let mut code = 0;
        for name in &names {
            code = code.max(self.change_one(name, change)?);
        }
        if !wake_supervisor(&self.config.channel_path()) {
            tracing::debug!("no supervisor listening");
        }
        Ok(code)
    }

    fn change_one(&self, name: &WorkerName, change: StateChange) -> Result<i32> {
        let mut registry = self.registry.load_or_empty()?;
        let Some(record) = registry.get_mut(name) else {
            tracing::warn!(worker = %name, "vanished from the registry");
            return Ok(0);
        };
        let pid = record.pid;
        let previous = record.status;

        let target = match (change, previous) {
            (StateChange::Up, WorkerStatus::Up) | (StateChange::Down, WorkerStatus::Down) => {
                tracing::info!(worker = %name, status = %previous, "already in requested state");
                return Ok(0);
            }
            (StateChange::Down, _) => WorkerStatus::Down,
            _ => WorkerStatus::Up,
        };
        record.set_status(target);
        self.registry.save(&registry)?;
        tracing::info!(worker = %name, %change, "state changed");

        // Bouncing a stopped worker just brings it up.
        if target == WorkerStatus::Up && previous == WorkerStatus::Down {
            return Ok(0);
        }
        Ok(self.terminate(name, pid))
    }

    /// SIGTERM, then SIGKILL after the grace period; 1 if it never exits.
    fn terminate(&self, name: &WorkerName, pid: i32) -> i32 {
        let stragglers = Escalation::new(&self.config.shutdown)
            .with_poll(self.config.admin_poll)
            .run(vec![(name.clone(), pid)], Signal::SIGTERM, |pid| {
                !process::is_alive(pid)
            });
        if stragglers.is_empty() {
            0
        } else {
            tracing::error!(worker = %name, pid, "Unable to kill process {name} ({pid})");
            1
        }
    }

    /// Signals the supervisor, or every worker if the supervisor is gone.
    ///
    /// # Errors
    /// Registry access or write errors.
    pub fn stop(&self, signal: Signal, out: &mut dyn Write) -> Result<i32> {
        let mut registry = self.registry.load_or_empty()?;
        if registry.is_empty() {
            writeln!(out, "Not running.")?;
            return Ok(0);
        }

        if let Some(me) = registry.supervisor().copied() {
            match process::send_signal(me.pid, signal) {
                Ok(()) => {
                    tracing::info!(pid = me.pid, %signal, "Sent {signal} to daemon");
                    return Ok(0);
                }
                Err(e) => tracing::warn!(error = %e, "daemon is gone"),
            }
            registry.remove(&WorkerName::supervisor());
        }

        tracing::error!("Parent process has been terminated - signalling children");
        let mut gone = Vec::new();
        for (name, record) in registry.workers() {
            if record.status == WorkerStatus::Down {
                gone.push(name.clone());
                continue;
            }
            match process::send_signal(record.pid, signal) {
                Ok(()) => tracing::info!(worker = %name, pid = record.pid, "Sent {signal}"),
                Err(_) => {
                    tracing::info!(worker = %name, pid = record.pid, "Dead process");
                    gone.push(name.clone());
                }
            }
        }
        for name in &gone {
            registry.remove(name);
        }
        self.registry.save(&registry)?;
        Ok(0)
    }
}

/// Formats one aligned status line per record.
///
/// `name: up (pid 4242), 17 seconds` with `, want down` appended when the
/// desired status and the actual process state disagree.
pub fn status_lines(registry: &Registry, now_ms: u64, alive: impl Fn(i32) -> bool) -> Vec<String> {
    let width = registry
        .iter()
        .map(|(name, _)| name.as_str().len())
        .max()
        .unwrap_or(0);
    registry
        .iter()
        .map(|(name, record)| {
            let running = alive(record.pid);
            let state = if running { "up" } else { "down" };
            let pid = if running {
                format!(" (pid {})", record.pid)
            } else {
                String::new()
            };
            let age = record.age_secs(now_ms);
            let unit = if age == 1 { "second" } else { "seconds" };
            let want = match (record.status, running) {
                (WorkerStatus::Up, false) => ", want up",
                (WorkerStatus::Down, true) => ", want down",
                _ => "",
            };
            format!("{:<width$}: {state}{pid}, {age} {unit}{want}", name.as_str())
        })
        .collect()
}
