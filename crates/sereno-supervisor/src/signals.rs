//! Signal coordinator.
//!
//! Handlers only touch atomics and, for SIGCHLD, write the wake-up ping to
//! the notification channel with a raw `write(2)`. Everything else (logging,
//! registry access) happens in the supervisor loop once it observes the flags.
//!
//! | Signal  | Effect                                            |
//! |---------|---------------------------------------------------|
//! | SIGCHLD | write [`WAKE_FRAME`] to the registered descriptor |
//! | SIGINT  | request shutdown                                  |
//! | SIGTERM | request shutdown                                  |
//! | SIGHUP  | request shutdown unless started with `--nohup`    |
//! | SIGALRM | nothing (interrupts a blocking call)              |
//!
//! Handlers are installed without `SA_RESTART` so a blocking `poll` on the
//! channel returns as soon as a signal arrives.

use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};
use sereno_core::channel::WAKE_FRAME;
use sereno_core::{Result, SupervisorError};

static QUITTING: AtomicBool = AtomicBool::new(false);
static LAST_SIGNAL: AtomicI32 = AtomicI32::new(0);
static IGNORE_HANGUP: AtomicBool = AtomicBool::new(false);
static WAKE_FD: AtomicI32 = AtomicI32::new(-1);

const HANDLED: [Signal; 5] = [
    Signal::SIGCHLD,
    Signal::SIGINT,
    Signal::SIGTERM,
    Signal::SIGHUP,
    Signal::SIGALRM,
];

extern "C" fn on_signal(signo: libc::c_int) {
    match signo {
        libc::SIGCHLD => write_wake(),
        libc::SIGINT | libc::SIGTERM => quit(signo),
        libc::SIGHUP if !IGNORE_HANGUP.load(Ordering::SeqCst) => quit(signo),
        _ => {}
    }
}

fn quit(signo: libc::c_int) {
    LAST_SIGNAL.store(signo, Ordering::SeqCst);
    QUITTING.store(true, Ordering::SeqCst);
}

#[allow(unsafe_code)]
fn write_wake() {
    let fd = WAKE_FD.load(Ordering::SeqCst);
    if fd < 0 {
        return;
    }
    // SAFETY: write(2) is async-signal-safe; the buffer is a static. A full
    // pipe or a closed descriptor only loses a redundant wake-up.
    unsafe {
        libc::write(fd, WAKE_FRAME.as_ptr().cast(), WAKE_FRAME.len());
    }
}

/// Installs the handler set for this process.
///
/// Called by the supervisor at startup and again by every worker after
/// fork. `ignore_hangup` keeps SIGHUP from ending the process.
///
/// # Errors
/// `ProcessControl` if `sigaction` fails.
#[allow(unsafe_code)]
pub fn install(ignore_hangup: bool) -> Result<()> {
    IGNORE_HANGUP.store(ignore_hangup, Ordering::SeqCst);
    let action = SigAction::new(
        SigHandler::Handler(on_signal),
        SaFlags::SA_NOCLDSTOP,
        SigSet::empty(),
    );
    for signal in HANDLED {
        // SAFETY: the handler only performs atomic stores and write(2).
        unsafe { sigaction(signal, &action) }.map_err(|errno| {
            SupervisorError::process_control(format!("sigaction({signal}): {errno}"))
        })?;
    }
    tracing::debug!(ignore_hangup, "signal handlers installed");
    Ok(())
}

/// Returns true once shutdown has been requested.
#[must_use]
pub fn quitting() -> bool {
    QUITTING.load(Ordering::SeqCst)
}

/// Process-wide shutdown flag, shared with [`sereno_core::WorkerContext`].
#[must_use]
pub fn shutdown_flag() -> &'static AtomicBool {
    &QUITTING
}

/// Requests shutdown from regular code (time limit, watched file).
pub fn request_quit() {
    QUITTING.store(true, Ordering::SeqCst);
}

/// Returns and clears the signal that last requested shutdown.
#[must_use]
pub fn take_signal() -> Option<Signal> {
    match LAST_SIGNAL.swap(0, Ordering::SeqCst) {
        0 => None,
        signo => Signal::try_from(signo).ok(),
    }
}

/// Directs SIGCHLD wake-ups to `fd`.
pub fn set_wake_fd(fd: RawFd) {
    WAKE_FD.store(fd, Ordering::SeqCst);
}

/// Stops SIGCHLD wake-ups; call before closing the registered descriptor.
pub fn clear_wake_fd() {
    WAKE_FD.store(-1, Ordering::SeqCst);
}

/// Clears every flag. Used by a freshly forked worker.
pub fn reset() {
    QUITTING.store(false, Ordering::SeqCst);
    LAST_SIGNAL.store(0, Ordering::SeqCst);
    clear_wake_fd();
}
