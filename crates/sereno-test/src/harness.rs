//! Supervisor test harness.
//!
//! Each harness owns a temporary run directory and launches a host binary
//! against it as a separate process, so the supervisor always forks from a
//! single-threaded parent.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Output, Stdio};
use std::time::{Duration, Instant};

use sereno_core::{Registry, RegistryFile, SupervisorConfig, WorkerName, WorkerRecord};
use sereno_supervisor::{Signal, process};
use tempfile::TempDir;

use crate::error::{Result, TestError};

const POLL: Duration = Duration::from_millis(50);

/// Temporary run directory plus the binary under test.
pub struct SupervisorHarness {
    dir: TempDir,
    binary: PathBuf,
    env: Vec<(String, String)>,
}

impl SupervisorHarness {
    /// Creates a harness builder.
    #[must_use]
    pub fn builder(binary: impl Into<PathBuf>) -> SupervisorHarnessBuilder {
        SupervisorHarnessBuilder {
            binary: binary.into(),
            env: Vec::new(),
        }
    }

    /// Run directory handed to every invocation.
    #[must_use]
    pub fn run_dir(&self) -> &Path {
        self.dir.path()
    }

    /// Configuration matching the run directory.
    #[must_use]
    pub fn config(&self) -> SupervisorConfig {
        SupervisorConfig::new(self.run_dir())
    }

    /// Registry file handle.
    #[must_use]
    pub fn registry_file(&self) -> RegistryFile {
        RegistryFile::new(self.config().registry_path())
    }

    /// Returns true if the notification channel exists.
    #[must_use]
    pub fn channel_exists(&self) -> bool {
        self.config().channel_path().exists()
    }

    /// Reads the registry.
    ///
    /// # Errors
    /// Registry access errors.
    pub fn registry(&self) -> Result<Registry> {
        Ok(self.registry_file().load()?)
    }

    fn command<I, S>(&self, args: I) -> Command
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut command = Command::new(&self.binary);
        command.arg("--run-dir").arg(self.run_dir()).args(args);
        for (key, value) in &self.env {
            command.env(key, value);
        }
        command
    }

    /// Starts the supervisor in the foreground.
    ///
    /// # Errors
    /// `Harness` if the binary cannot be launched.
    pub fn start<I, S>(&self, args: I) -> Result<RunningSupervisor>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let child = self
            .command(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| TestError::harness(format!("cannot launch {}: {e}", self.binary.display())))?;
        tracing::debug!(pid = child.id(), "supervisor launched");
        Ok(RunningSupervisor {
            child,
            registry: self.registry_file(),
        })
    }

    /// Runs a one-shot invocation (admin command, failing startup) to
    /// completion.
    ///
    /// # Errors
    /// `Harness` if the binary cannot be launched.
    pub fn invoke<I, S>(&self, args: I) -> Result<Output>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.command(args)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| TestError::harness(format!("cannot launch {}: {e}", self.binary.display())))
    }

    /// Polls the registry until `check` accepts it.
    ///
    /// # Errors
    /// `Timeout` if `check` never holds within `limit`.
    pub fn wait_for(
        &self,
        what: &str,
        limit: Duration,
        mut check: impl FnMut(&Registry) -> bool,
    ) -> Result<Registry> {
        let deadline = Instant::now() + limit;
        loop {
            // The file may be mid-rewrite; treat read errors as "not yet".
            if let Ok(registry) = self.registry() {
                if check(&registry) {
                    return Ok(registry);
                }
            }
            if Instant::now() >= deadline {
                return Err(TestError::timeout(limit, what));
            }
            std::thread::sleep(POLL);
        }
    }

    /// Waits until `name` is recorded `up` with a live pid.
    ///
    /// # Errors
    /// `Timeout`.
    pub fn wait_for_up(&self, name: &str, limit: Duration) -> Result<WorkerRecord> {
        let name = WorkerName::new(name);
        let registry = self.wait_for(&format!("{name} up"), limit, |registry| {
            registry
                .get(&name)
                .is_some_and(|r| r.status == sereno_core::WorkerStatus::Up && process::is_alive(r.pid))
        })?;
        registry
            .get(&name)
            .copied()
            .ok_or_else(|| TestError::harness(format!("{name} vanished")))
    }

    /// Waits for a supervisor started with `--nohup` by `launcher` to record
    /// itself, and returns a guard for it.
    ///
    /// # Errors
    /// `Timeout` if no live `me` record other than `launcher` shows up.
    pub fn wait_for_detached(&self, launcher: i32, limit: Duration) -> Result<DetachedSupervisor> {
        let registry = self.wait_for("detached supervisor", limit, |registry| {
            registry
                .supervisor()
                .is_some_and(|me| me.pid != launcher && process::is_alive(me.pid))
        })?;
        let me = registry
            .supervisor()
            .copied()
            .ok_or_else(|| TestError::harness("supervisor record vanished"))?;
        Ok(DetachedSupervisor {
            pid: me.pid,
            registry: self.registry_file(),
        })
    }

    /// Waits until the registry file and channel are both gone.
    ///
    /// # Errors
    /// `Timeout`.
    pub fn wait_for_cleanup(&self, limit: Duration) -> Result<()> {
        let deadline = Instant::now() + limit;
        while self.registry_file().exists() || self.channel_exists() {
            if Instant::now() >= deadline {
                return Err(TestError::timeout(limit, "registry and channel removal"));
            }
            std::thread::sleep(POLL);
        }
        Ok(())
    }
}

impl std::fmt::Debug for SupervisorHarness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SupervisorHarness")
            .field("run_dir", &self.dir.path())
            .field("binary", &self.binary)
            .finish_non_exhaustive()
    }
}

/// Builder for [`SupervisorHarness`].
#[derive(Debug)]
pub struct SupervisorHarnessBuilder {
    binary: PathBuf,
    env: Vec<(String, String)>,
}

impl SupervisorHarnessBuilder {
    /// Sets an environment variable for every invocation.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Creates the run directory.
    ///
    /// # Errors
    /// `Io` if the temporary directory cannot be created.
    pub fn build(self) -> Result<SupervisorHarness> {
        if !self.binary.exists() {
            return Err(TestError::harness(format!(
                "binary {} does not exist",
                self.binary.display()
            )));
        }
        Ok(SupervisorHarness {
            dir: tempfile::tempdir()?,
            binary: self.binary,
            env: self.env,
        })
    }
}

/// A supervisor launched by [`SupervisorHarness::start`].
///
/// Dropping it kills the supervisor and every worker still in the registry.
#[derive(Debug)]
pub struct RunningSupervisor {
    child: Child,
    registry: RegistryFile,
}

impl RunningSupervisor {
    /// Pid of the supervisor process.
    #[must_use]
    pub fn pid(&self) -> i32 {
        self.child.id() as i32
    }

    /// Sends `signal` to the supervisor.
    ///
    /// # Errors
    /// `Supervisor` if delivery fails.
    pub fn signal(&self, signal: Signal) -> Result<()> {
        Ok(process::send_signal(self.pid(), signal)?)
    }

    /// Waits up to `limit` for the supervisor to exit.
    ///
    /// # Errors
    /// `Timeout` if it is still running.
    pub fn wait_exit(&mut self, limit: Duration) -> Result<ExitStatus> {
        let deadline = Instant::now() + limit;
        loop {
            if let Some(status) = self.child.try_wait()? {
                return Ok(status);
            }
            if Instant::now() >= deadline {
                return Err(TestError::timeout(limit, "supervisor exit"));
            }
            std::thread::sleep(POLL);
        }
    }
}

impl Drop for RunningSupervisor {
    fn drop(&mut self) {
        if matches!(self.child.try_wait(), Ok(Some(_))) {
            return;
        }
        let _ = self.child.kill();
        let _ = self.child.wait();
        kill_workers(&self.registry);
    }
}

/// A supervisor that detached with `--nohup` and is no longer a child of the
/// test process.
///
/// Dropping it kills the supervisor and its workers if the registry is still
/// there.
#[derive(Debug)]
pub struct DetachedSupervisor {
    pid: i32,
    registry: RegistryFile,
}

impl DetachedSupervisor {
    /// Pid recorded as `me`.
    #[must_use]
    pub fn pid(&self) -> i32 {
        self.pid
    }

    /// Sends `signal` to the supervisor.
    ///
    /// # Errors
    /// `Supervisor` if delivery fails.
    pub fn signal(&self, signal: Signal) -> Result<()> {
        Ok(process::send_signal(self.pid, signal)?)
    }
}

impl Drop for DetachedSupervisor {
    fn drop(&mut self) {
        if !self.registry.exists() {
            return;
        }
        let _ = process::send_signal(self.pid, Signal::SIGKILL);
        kill_workers(&self.registry);
    }
}

fn kill_workers(registry: &RegistryFile) {
    if let Ok(registry) = registry.load() {
        for (_, record) in registry.workers() {
            let _ = process::send_signal(record.pid, Signal::SIGKILL);
        }
    }
}
