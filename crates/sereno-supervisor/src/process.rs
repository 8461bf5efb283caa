//! Process control: liveness, signals, reaping, fork and escalation.

use std::fs::OpenOptions;
use std::os::fd::AsRawFd;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::sys::stat::{Mode, umask};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::{ForkResult, Pid, dup2, fork, setsid};
use sereno_core::{EscalationConfig, Result, SupervisorError, WorkerName};

/// Returns true if `pid` names an existing process.
///
/// Uses the null signal; a process owned by another user still counts.
#[must_use]
pub fn is_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    matches!(kill(Pid::from_raw(pid), None), Ok(()) | Err(Errno::EPERM))
}

/// Sends `signal` to `pid`.
///
/// # Errors
/// `SignalDelivery` if the process is gone or not ours to signal.
pub fn send_signal(pid: i32, signal: Signal) -> Result<()> {
    if pid <= 0 {
        return Err(SupervisorError::SignalDelivery {
            pid,
            signal: signal.to_string(),
            reason: "not a process id".to_string(),
        });
    }
    kill(Pid::from_raw(pid), signal).map_err(|errno| SupervisorError::SignalDelivery {
        pid,
        signal: signal.to_string(),
        reason: errno.to_string(),
    })?;
    tracing::debug!(pid, %signal, "sent signal");
    Ok(())
}

/// Result of a non-blocking wait on one pid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReapState {
    /// Our child, still running.
    Running,
    /// Our child exited and has now been reaped.
    Exited(WaitStatus),
    /// Not a child of this process (or already reaped).
    NotChild,
}

/// Reaps `pid` if it has exited, without blocking.
#[must_use]
pub fn try_reap(pid: i32) -> ReapState {
    if pid <= 0 {
        return ReapState::NotChild;
    }
    loop {
        match waitpid(Pid::from_raw(pid), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => return ReapState::Running,
            Ok(status) => return ReapState::Exited(status),
            Err(Errno::EINTR) => {}
            Err(_) => return ReapState::NotChild,
        }
    }
}

/// Waits up to `limit` for child `pid` to exit.
///
/// Returns false if the child was still running at the deadline.
#[must_use]
pub fn reap_within(pid: i32, limit: Duration) -> bool {
    let deadline = Instant::now() + limit;
    loop {
        match try_reap(pid) {
            ReapState::Running if Instant::now() < deadline => {
                std::thread::sleep(Duration::from_millis(10));
            }
            ReapState::Running => return false,
            ReapState::Exited(status) => {
                tracing::debug!(pid, ?status, "reaped");
                return true;
            }
            ReapState::NotChild => return true,
        }
    }
}

/// Reaps every exited child not otherwise accounted for.
pub fn reap_strays() -> Vec<WaitStatus> {
    let mut reaped = Vec::new();
    loop {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) | Err(Errno::ECHILD) => break,
            Ok(status) => reaped.push(status),
            Err(Errno::EINTR) => {}
            Err(errno) => {
                tracing::debug!(%errno, "waitpid(-1) failed");
                break;
            }
        }
    }
    reaped
}

/// Which side of a fork the caller is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Forked {
    /// The original process; carries the child's pid.
    Parent(i32),
    /// The new process.
    Child,
}

/// Forks the current process.
///
/// Must only be called while the process is single-threaded.
///
/// # Errors
/// `ProcessControl` if `fork` fails.
#[allow(unsafe_code)]
pub fn fork_process() -> Result<Forked> {
    // SAFETY: the supervisor never starts threads, so the child inherits a
    // consistent heap and no held locks.
    match unsafe { fork() } {
        Ok(ForkResult::Parent { child }) => Ok(Forked::Parent(child.as_raw())),
        Ok(ForkResult::Child) => Ok(Forked::Child),
        Err(errno) => Err(SupervisorError::process_control(format!("fork: {errno}"))),
    }
}

/// Detaches from the controlling terminal.
///
/// The parent gets [`Forked::Parent`] and should exit. The child becomes a
/// session leader with a cleared umask, `/` as working directory and the
/// standard descriptors on `/dev/null`.
///
/// # Errors
/// `ProcessControl` if any step fails.
pub fn daemonize() -> Result<Forked> {
    let forked = fork_process()?;
    if forked == Forked::Child {
        setsid().map_err(|errno| SupervisorError::process_control(format!("setsid: {errno}")))?;
        umask(Mode::empty());
        std::env::set_current_dir("/")?;
        let null = OpenOptions::new().read(true).write(true).open("/dev/null")?;
        for fd in [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO] {
            dup2(null.as_raw_fd(), fd)
                .map_err(|errno| SupervisorError::process_control(format!("dup2: {errno}")))?;
        }
    }
    Ok(forked)
}

/// Interrupt, wait, kill, give up.
///
/// Sends a first signal to every target, polls until they are gone, sends
/// SIGKILL to whatever remains after the grace period and returns the
/// targets still present at the deadline.
#[derive(Debug, Clone, Copy)]
pub struct Escalation {
    grace: Duration,
    deadline: Duration,
    poll: Duration,
}

impl Escalation {
    /// Builds an escalation from a configured schedule.
    #[must_use]
    pub const fn new(schedule: &EscalationConfig) -> Self {
        Self {
            grace: schedule.interrupt_grace,
            deadline: schedule.kill_deadline,
            poll: schedule.poll_interval,
        }
    }

    /// Overrides the poll interval.
    #[must_use]
    pub const fn with_poll(mut self, poll: Duration) -> Self {
        self.poll = poll;
        self
    }

    /// Runs the escalation. `gone` decides whether a pid has terminated.
    pub fn run(
        &self,
        mut targets: Vec<(WorkerName, i32)>,
        first: Signal,
        mut gone: impl FnMut(i32) -> bool,
    ) -> Vec<(WorkerName, i32)> {
        targets.retain(|(name, pid)| match send_signal(*pid, first) {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(worker = %name, error = %e, "already gone");
                false
            }
        });

        let start = Instant::now();
        let mut killed = false;
        loop {
            targets.retain(|(_, pid)| !gone(*pid));
            if targets.is_empty() {
                return targets;
            }
            let elapsed = start.elapsed();
            if elapsed >= self.deadline {
                return targets;
            }
            if !killed && elapsed >= self.grace {
                for (name, pid) in &targets {
                    tracing::warn!(worker = %name, pid, "did not stop in time, sending SIGKILL");
                    if let Err(e) = send_signal(*pid, Signal::SIGKILL) {
                        tracing::debug!(worker = %name, error = %e, "SIGKILL not delivered");
                    }
                }
                killed = true;
            }
            std::thread::sleep(self.poll);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::{Command, Stdio};

    fn spawn(script: &str) -> std::process::Child {
        Command::new("sh")
            .arg("-c")
            .arg(script)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .unwrap()
    }

    fn fast_schedule() -> EscalationConfig {
        EscalationConfig {
            interrupt_grace: Duration::from_millis(300),
            kill_deadline: Duration::from_secs(5),
            poll_interval: Duration::from_millis(20),
        }
    }

    #[test]
    fn test_current_process_is_alive() {
        assert!(is_alive(std::process::id() as i32));
        assert!(!is_alive(0));
        assert!(!is_alive(-5));
    }

    #[test]
    fn test_signal_invalid_pid_fails() {
        assert!(matches!(
            send_signal(0, Signal::SIGTERM),
            Err(SupervisorError::SignalDelivery { .. })
        ));
    }

    #[test]
    fn test_try_reap_lifecycle() {
        let child = spawn("exec sleep 30");
        let pid = child.id() as i32;
        assert_eq!(try_reap(pid), ReapState::Running);

        send_signal(pid, Signal::SIGKILL).unwrap();
        assert!(reap_within(pid, Duration::from_secs(5)));
        assert_eq!(try_reap(pid), ReapState::NotChild);
        assert!(!is_alive(pid));
    }

    #[test]
    fn test_reap_within_times_out_on_running_child() {
        let child = spawn("exec sleep 30");
        let pid = child.id() as i32;
        assert!(!reap_within(pid, Duration::from_millis(50)));
        send_signal(pid, Signal::SIGKILL).unwrap();
        assert!(reap_within(pid, Duration::from_secs(5)));
    }

    #[test]
    fn test_escalation_interrupt_is_enough() {
        let child = spawn("exec sleep 30");
        let pid = child.id() as i32;
        let left = Escalation::new(&fast_schedule()).run(
            vec![(WorkerName::new("sleeper"), pid)],
            Signal::SIGINT,
            |pid| !matches!(try_reap(pid), ReapState::Running),
        );
        assert!(left.is_empty());
    }

    #[test]
    fn test_escalation_kills_stubborn_child() {
        let child = spawn("trap '' INT TERM; while true; do sleep 1; done");
        let pid = child.id() as i32;
        std::thread::sleep(Duration::from_millis(100));

        let start = Instant::now();
        let left = Escalation::new(&fast_schedule()).run(
            vec![(WorkerName::new("stubborn"), pid)],
            Signal::SIGTERM,
            |pid| !matches!(try_reap(pid), ReapState::Running),
        );
        assert!(left.is_empty());
        assert!(start.elapsed() >= Duration::from_millis(300));
        assert!(!is_alive(pid));
    }

    #[test]
    fn test_escalation_skips_dead_targets() {
        let left = Escalation::new(&fast_schedule()).run(
            vec![(WorkerName::new("ghost"), -1)],
            Signal::SIGTERM,
            |_| false,
        );
        assert!(left.is_empty());
    }
}
