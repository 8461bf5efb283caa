//! The supervisor: startup, reconciliation loop and shutdown.
//!
//! The parent process stays single-threaded so `fork` is always safe. Each
//! pass of the loop reloads the registry, forks whatever is missing, reaps
//! whatever exited and then blocks on the notification channel for at most
//! `read_timeout`.

use std::path::PathBuf;
use std::time::{Duration, Instant, SystemTime};

use nix::sys::signal::Signal;
use sereno_core::{
    ChannelReader, FileWatch, Message, Registry, RegistryFile, Report, Result, SupervisorConfig,
    SupervisorError, TaskCatalog, WorkerName, WorkerRecord, WorkerStatus,
};

use crate::process::{self, Escalation, Forked, ReapState};
use crate::signals;
use crate::worker::WorkerRunner;

/// How the supervisor was started.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StartOptions {
    /// Detach from the terminal and ignore SIGHUP.
    pub nohup: bool,
    /// Exit quietly with success when a supervisor is already running.
    pub cron: bool,
    /// Run the first worker inline, without forking.
    pub no_fork: bool,
}

/// Keeps the desired worker set running.
#[derive(Debug)]
pub struct Supervisor {
    config: SupervisorConfig,
    catalog: TaskCatalog,
    options: StartOptions,
    desired: Vec<WorkerName>,
    registry: RegistryFile,
    channel: Option<ChannelReader>,
    watch: FileWatch,
    started: Instant,
    next_heartbeat: Duration,
}

impl Supervisor {
    /// Prepares a supervisor for `catalog`.
    ///
    /// Applies configured replica overrides and expands the desired set.
    ///
    /// # Errors
    /// `Config` if the configuration is invalid or the desired set exceeds
    /// `maximum_processes`.
    pub fn new(
        mut config: SupervisorConfig,
        mut catalog: TaskCatalog,
        options: StartOptions,
    ) -> Result<Self> {
        config.validate()?;
        catalog.apply_process_counts(&config.process_count);
        let desired = catalog.desired_set(config.maximum_processes)?;

        // Daemonizing moves to `/`.
        config.run_dir = absolute(&config.run_dir)?;
        config.watch = config
            .watch
            .iter()
            .map(|path| absolute(path))
            .collect::<Result<_>>()?;

        Ok(Self {
            registry: RegistryFile::new(config.registry_path()),
            watch: FileWatch::default(),
            config,
            catalog,
            options,
            desired,
            channel: None,
            started: Instant::now(),
            next_heartbeat: Duration::ZERO,
        })
    }

    /// The expanded desired set, in launch order.
    #[must_use]
    pub fn desired(&self) -> &[WorkerName] {
        &self.desired
    }

    /// Runs until a shutdown request and returns the exit code.
    ///
    /// In the parent of a `--nohup` launch this returns right after the
    /// fork.
    ///
    /// # Errors
    /// `AlreadyRunning` when another supervisor owns the registry, or any
    /// startup failure.
    pub fn run(mut self) -> Result<i32> {
        let existing = self.registry.load_or_empty()?;
        if let Some(me) = existing.supervisor() {
            if me.pid != own_pid() && process::is_alive(me.pid) {
                if self.options.cron {
                    tracing::debug!(pid = me.pid, "daemon already running");
                    return Ok(0);
                }
                return Err(SupervisorError::AlreadyRunning(me.pid));
            }
        }

        if self.options.no_fork {
            return self.run_inline();
        }

        std::fs::create_dir_all(&self.config.run_dir)
            .map_err(|e| SupervisorError::file_permission(&self.config.run_dir, e))?;

        if self.options.nohup {
            if let Forked::Parent(pid) = process::daemonize()? {
                tracing::info!(pid, "Launched daemon PID {pid}");
                return Ok(0);
            }
        }

        let mut registry = existing;
        registry.insert(WorkerName::supervisor(), WorkerRecord::up(own_pid()));
        self.registry.save(&registry)?;
        tracing::info!(pid = own_pid(), run_dir = %self.config.run_dir.display(), "Daemon run successfully");

        if let Err(e) = self.open_channel() {
            self.discard_registry();
            return Err(e);
        }
        self.watch = FileWatch::new(self.config.watch.iter().cloned());
        self.started = Instant::now();

        if self.desired.is_empty() {
            tracing::warn!("No daemons found to run");
        }

        self.supervise();
        self.shutdown();
        Ok(0)
    }

    fn open_channel(&mut self) -> Result<()> {
        let reader = ChannelReader::create(self.config.channel_path())?;
        signals::set_wake_fd(reader.raw_fd());
        self.channel = Some(reader);
        signals::install(self.options.nohup)
    }

    fn discard_registry(&self) {
        if let Err(e) = self.registry.remove() {
            tracing::error!(error = %e, "cannot remove registry");
        }
    }

    fn run_inline(&self) -> Result<i32> {
        let Some(name) = self.desired.first() else {
            tracing::warn!("No daemons found to run");
            return Ok(0);
        };
        let task = self
            .catalog
            .task_for(name)
            .ok_or_else(|| SupervisorError::NotFound(name.to_string()))?;
        tracing::warn!(worker = %name, "not forking for child process (--no-fork)");
        Ok(WorkerRunner::new(name.clone(), task)
            .with_terminate_wait(self.config.terminate_wait)
            .with_ignore_hangup(self.options.nohup)
            .run())
    }

    fn supervise(&mut self) {
        loop {
            if self.should_quit() {
                break;
            }
            if self.watch.changed() {
                tracing::info!("watched file changed, stopping");
                signals::request_quit();
                break;
            }

            self.reconcile();
            self.drain_channel();

            let elapsed = self.started.elapsed();
            if let Some(limit) = self.config.terminate_after {
                if elapsed >= limit {
                    tracing::info!(after = %humantime::format_duration(limit), "time limit reached, stopping");
                    signals::request_quit();
                }
            }
            if elapsed >= self.next_heartbeat {
                self.next_heartbeat = elapsed + self.config.alive_interval;
                tracing::info!(
                    "Daemon is running at {}",
                    humantime::format_rfc3339_seconds(SystemTime::now())
                );
            }
        }
    }

    fn should_quit(&self) -> bool {
        if !signals::quitting() {
            return false;
        }
        if let Some(signal) = signals::take_signal() {
            tracing::info!(%signal, "received signal, stopping");
        }
        true
    }

    /// One reconciliation pass over the desired set.
    fn reconcile(&mut self) {
        let mut registry = match self.registry.load_or_empty() {
            Ok(registry) => registry,
            Err(e) => {
                tracing::error!(error = %e, "cannot read registry");
                return;
            }
        };
        let mut dirty = false;

        for name in self.desired.clone() {
            if signals::quitting() {
                break;
            }
            let Some(record) = registry.get(&name).copied() else {
                if let Some(pid) = self.spawn(&name) {
                    registry.insert(name, WorkerRecord::up(pid));
                    dirty = true;
                }
                continue;
            };

            match process::try_reap(record.pid) {
                ReapState::Exited(status) => {
                    tracing::debug!(worker = %name, pid = record.pid, ?status, "worker exited");
                    if record.status == WorkerStatus::Up {
                        registry.remove(&name);
                    } else if let Some(parked) = registry.get_mut(&name) {
                        parked.pid = 0;
                    }
                    dirty = true;
                }
                _ if process::is_alive(record.pid) => {
                    if record.status == WorkerStatus::Down {
                        tracing::debug!(worker = %name, pid = record.pid, "wanted down, sending SIGTERM");
                        if let Err(e) = process::send_signal(record.pid, Signal::SIGTERM) {
                            tracing::warn!(worker = %name, error = %e, "cannot stop worker");
                        }
                    }
                }
                _ if record.status == WorkerStatus::Up => {
                    tracing::info!(worker = %name, pid = record.pid, "worker is gone, respawning");
                    if let Some(pid) = self.spawn(&name) {
                        registry.insert(name, WorkerRecord::up(pid));
                        dirty = true;
                    }
                }
                _ => {}
            }
        }

        for status in process::reap_strays() {
            tracing::debug!(?status, "reaped stray child");
        }
        if dirty {
            self.save(&registry);
        }
    }

    fn spawn(&mut self, name: &WorkerName) -> Option<i32> {
        let Some(task) = self.catalog.task_for(name) else {
            tracing::error!(worker = %name, "no task registered");
            return None;
        };
        match process::fork_process() {
            Ok(Forked::Parent(pid)) => {
                tracing::info!(worker = %name, pid, "forked worker");
                Some(pid)
            }
            Ok(Forked::Child) => {
                signals::clear_wake_fd();
                drop(self.channel.take());
                let code = WorkerRunner::new(name.clone(), task)
                    .with_channel(self.config.channel_path())
                    .with_terminate_wait(self.config.terminate_wait)
                    .with_ignore_hangup(self.options.nohup)
                    .run();
                std::process::exit(code);
            }
            Err(e) => {
                tracing::error!(worker = %name, error = %e, "unable to fork");
                None
            }
        }
    }

    /// Waits for the first message, then drains whatever else is queued.
    fn drain_channel(&mut self) {
        let mut timeout = self.config.read_timeout;
        loop {
            let received = match self.channel.as_mut() {
                Some(reader) => reader.receive(timeout),
                None => return,
            };
            match received {
                Ok(Some(Message::Wake)) => {}
                Ok(Some(Message::Reports(reports))) => self.apply_reports(reports),
                Ok(None) => return,
                Err(SupervisorError::Protocol(reason)) => {
                    tracing::warn!(%reason, "discarding malformed channel data");
                }
                Err(e) => {
                    tracing::error!(error = %e, "cannot read notification channel");
                    return;
                }
            }
            if signals::quitting() {
                return;
            }
            timeout = Duration::ZERO;
        }
    }

    fn apply_reports(&self, reports: Vec<(WorkerName, Report)>) {
        let mut registry = match self.registry.load_or_empty() {
            Ok(registry) => registry,
            Err(e) => {
                tracing::error!(error = %e, "cannot read registry");
                return;
            }
        };
        let mut dirty = false;

        for (name, report) in reports {
            match report {
                Report::Alive(pid) => match registry.get(&name) {
                    Some(record) if record.pid == pid => {
                        tracing::debug!(worker = %name, pid, "worker reported in");
                    }
                    Some(record) => tracing::error!(
                        worker = %name,
                        pid,
                        recorded = record.pid,
                        "child reported a pid that does not match the registry"
                    ),
                    None => tracing::error!(
                        worker = %name,
                        pid,
                        "child sent a name which isn't in the registry"
                    ),
                },
                Report::Finished | Report::Down => {
                    let record = registry.get(&name).copied();
                    // A pid that is still running after the grace period stays
                    // recorded so the next pass can stop it.
                    let running = match record {
                        Some(record)
                            if !process::reap_within(
                                record.pid,
                                self.config.shutdown.interrupt_grace,
                            ) =>
                        {
                            tracing::warn!(worker = %name, pid = record.pid, "worker reported out but is still running");
                            record.pid
                        }
                        _ => 0,
                    };
                    if report == Report::Down {
                        // Reconcile may already have reaped the worker and
                        // dropped its record; park it regardless.
                        tracing::warn!(worker = %name, "Service {name} requested to go down");
                        registry.insert(name, WorkerRecord::new(running, WorkerStatus::Down));
                        dirty = true;
                    } else if let Some(record) = record {
                        if record.status == WorkerStatus::Up {
                            registry.remove(&name);
                        } else if let Some(parked) = registry.get_mut(&name) {
                            parked.pid = running;
                        }
                        dirty = true;
                    } else {
                        tracing::warn!(worker = %name, "report from unregistered worker");
                    }
                }
                Report::Unknown(value) => {
                    tracing::warn!(worker = %name, %value, "unknown report");
                }
            }
        }
        if dirty {
            self.save(&registry);
        }
    }

    fn save(&self, registry: &Registry) {
        if let Err(e) = self.registry.save(registry) {
            tracing::error!(error = %e, "cannot write registry");
        }
    }

    /// Interrupts every worker, escalates, and removes the run files.
    fn shutdown(&mut self) {
        tracing::info!("stopping workers");
        let registry = self.registry.load_or_empty().unwrap_or_else(|e| {
            tracing::error!(error = %e, "cannot read registry");
            Registry::new()
        });
        if registry.is_empty() {
            tracing::error!("registry is empty on termination");
        }

        let stragglers = Escalation::new(&self.config.shutdown).run(
            registry.up_workers(),
            Signal::SIGINT,
            |pid| match process::try_reap(pid) {
                ReapState::Running => false,
                ReapState::Exited(_) => true,
                ReapState::NotChild => !process::is_alive(pid),
            },
        );
        for (name, pid) in stragglers {
            tracing::error!(worker = %name, pid, "Unable to kill process {name} ({pid})");
        }
        process::reap_strays();

        signals::clear_wake_fd();
        if let Some(reader) = self.channel.take() {
            if let Err(e) = reader.remove() {
                tracing::error!(error = %e, "cannot remove notification channel");
            }
        }
        self.discard_registry();
        tracing::info!("Daemon stopped");
    }
}

fn own_pid() -> i32 {
    std::process::id() as i32
}

fn absolute(path: &std::path::Path) -> Result<PathBuf> {
    std::path::absolute(path).map_err(|e| SupervisorError::file_permission(path, e))
}
