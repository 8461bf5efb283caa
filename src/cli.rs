//! Command-line surface shared by every host binary.
//!
//! A host application builds its [`TaskCatalog`] and hands it to [`main`]:
//!
//! ```rust,no_run
//! use sereno::prelude::*;
//!
//! fn main() {
//!     let catalog = TaskCatalog::new().with_task(
//!         "ping",
//!         task_fn(|ctx: WorkerContext| async move {
//!             while ctx.sleep(std::time::Duration::from_secs(1)).await {}
//!             Ok(TaskOutcome::Finished)
//!         }),
//!     );
//!     std::process::exit(sereno::cli::main(catalog));
//! }
//! ```

use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgGroup, Parser, Subcommand};
use sereno_core::{Result, SupervisorConfig, SupervisorError, TaskCatalog};
use sereno_supervisor::{Admin, Signal, StartOptions, StateChange, Supervisor};
use tracing_subscriber::EnvFilter;

/// Supervise a set of named worker processes.
#[derive(Parser, Debug, Clone, Default)]
#[command(version, about, long_about = None)]
#[command(group(
    ArgGroup::new("action").args(["stop", "kill", "list", "stat", "up", "down", "bounce"])
))]
pub struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Detach from the terminal and ignore SIGHUP
    #[arg(long)]
    pub nohup: bool,

    /// Ask the running supervisor to shut down (SIGTERM)
    #[arg(long)]
    pub stop: bool,

    /// Kill the running supervisor (SIGKILL)
    #[arg(long)]
    pub kill: bool,

    /// Print the expanded worker set and exit
    #[arg(long)]
    pub list: bool,

    /// Print the state of every registered worker
    #[arg(long)]
    pub stat: bool,

    /// Exit quietly if a supervisor is already running
    #[arg(long)]
    pub cron: bool,

    /// Bring matching workers up (`all`, exact name or substring)
    #[arg(long, value_name = "NAME")]
    pub up: Option<String>,

    /// Take matching workers down and keep them down
    #[arg(long, value_name = "NAME")]
    pub down: Option<String>,

    /// Restart matching workers
    #[arg(long, value_name = "NAME")]
    pub bounce: Option<String>,

    /// Stop the supervisor after this long (seconds or e.g. "2h")
    #[arg(long, value_name = "SECONDS", value_parser = parse_duration)]
    pub terminate_after: Option<Duration>,

    /// Interval between "running" heartbeat log lines
    #[arg(long, value_name = "SECONDS", value_parser = parse_duration)]
    pub alive_interval: Option<Duration>,

    /// Pause an interrupted worker this long before it exits
    #[arg(long, value_name = "SECONDS", value_parser = parse_duration)]
    pub terminate_wait: Option<Duration>,

    /// Stop the supervisor when this file changes (repeatable)
    #[arg(long, value_name = "FILE")]
    pub watch: Vec<PathBuf>,

    /// Run the first worker inline without forking (debugging)
    #[arg(long)]
    pub no_fork: bool,

    /// TOML configuration file
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Directory holding the registry and notification channel
    #[arg(long, value_name = "DIR")]
    pub run_dir: Option<PathBuf>,

    /// Log at debug level regardless of RUST_LOG
    #[arg(long)]
    pub debug_log: bool,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// Start the supervisor (default)
    Run,
}

/// What one invocation does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Start the supervisor.
    Run,
    /// Print the desired set.
    List,
    /// Print registry status.
    Stat,
    /// Signal the supervisor.
    Signal(Signal),
    /// Change the desired state of matching workers.
    Change(StateChange, String),
}

impl Cli {
    /// The action selected by the flags; starting the supervisor by default.
    #[must_use]
    pub fn action(&self) -> Action {
        if self.list {
            Action::List
        } else if self.stat {
            Action::Stat
        } else if self.stop {
            Action::Signal(Signal::SIGTERM)
        } else if self.kill {
            Action::Signal(Signal::SIGKILL)
        } else if let Some(name) = &self.up {
            Action::Change(StateChange::Up, name.clone())
        } else if let Some(name) = &self.down {
            Action::Change(StateChange::Down, name.clone())
        } else if let Some(name) = &self.bounce {
            Action::Change(StateChange::Bounce, name.clone())
        } else {
            Action::Run
        }
    }

    /// Loads the configuration file (if any) and applies flag overrides.
    ///
    /// # Errors
    /// `Config` if the file is unreadable or the result is invalid.
    pub fn config(&self) -> Result<SupervisorConfig> {
        let mut config = match &self.config {
            Some(path) => SupervisorConfig::load(path)?,
            None => SupervisorConfig::default(),
        };
        if let Some(dir) = &self.run_dir {
            config.run_dir.clone_from(dir);
        }
        if self.terminate_after.is_some() {
            config.terminate_after = self.terminate_after;
        }
        if let Some(interval) = self.alive_interval {
            config.alive_interval = interval;
        }
        if self.terminate_wait.is_some() {
            config.terminate_wait = self.terminate_wait;
        }
        config.watch.extend(self.watch.iter().cloned());
        config.validate()?;
        Ok(config)
    }

    fn start_options(&self) -> StartOptions {
        StartOptions {
            nohup: self.nohup,
            cron: self.cron,
            no_fork: self.no_fork,
        }
    }
}

fn parse_duration(text: &str) -> std::result::Result<Duration, String> {
    if let Ok(secs) = text.trim().parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    humantime::parse_duration(text).map_err(|e| e.to_string())
}

/// Installs the stderr log subscriber.
///
/// `RUST_LOG` wins unless `debug` forces the debug level; the default is
/// `info`. A second call is a no-op.
pub fn init_tracing(debug: bool) {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

/// Executes `cli` against `catalog` and returns the process exit code.
#[must_use]
pub fn run(cli: &Cli, catalog: TaskCatalog) -> i32 {
    match dispatch(cli, catalog) {
        Ok(code) => code,
        Err(SupervisorError::AlreadyRunning(pid)) => {
            tracing::error!(pid, "Daemon already running.");
            1
        }
        Err(e) => {
            tracing::error!(error = %e, "{e}");
            e.exit_code()
        }
    }
}

fn dispatch(cli: &Cli, catalog: TaskCatalog) -> Result<i32> {
    let config = cli.config()?;
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    match cli.action() {
        Action::Run => {
            drop(out);
            Supervisor::new(config, catalog, cli.start_options())?.run()
        }
        Action::List => Admin::new(config).list(&catalog, &mut out),
        Action::Stat => Admin::new(config).stat(&mut out),
        Action::Signal(signal) => Admin::new(config).stop(signal, &mut out),
        Action::Change(change, name) => Admin::new(config).change_state(&name, change),
    }
}

/// Parses the process arguments, sets up logging and runs.
#[must_use]
pub fn main(catalog: TaskCatalog) -> i32 {
    let cli = Cli::parse();
    init_tracing(cli.debug_log);
    run(&cli, catalog)
}
