//! End-to-end supervisor scenarios against the `sereno-fixture` binary.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::time::{Duration, Instant};

use sereno_core::{WorkerName, WorkerStatus};
use sereno_supervisor::{Signal, process};
use sereno_test::{FIXTURE_ENV, SupervisorHarness};

const FIXTURE: &str = env!("CARGO_BIN_EXE_sereno-fixture");
const STARTUP: Duration = Duration::from_secs(10);
// Escalation deadline plus one drain timeout and some slack.
const SHUTDOWN: Duration = Duration::from_secs(15);

fn harness(spec: &str) -> SupervisorHarness {
    SupervisorHarness::builder(FIXTURE)
        .env(FIXTURE_ENV, spec)
        .build()
        .unwrap()
}

fn stdout(output: &std::process::Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

#[test]
fn start_then_terminate_removes_run_files() {
    let harness = harness("ping");
    let mut supervisor = harness.start(["run"]).unwrap();

    let ping = harness.wait_for_up("ping", STARTUP).unwrap();
    let registry = harness.registry().unwrap();
    let me = registry.supervisor().copied().unwrap();
    assert_eq!(me.pid, supervisor.pid());
    assert_eq!(me.status, WorkerStatus::Up);
    assert!(harness.channel_exists());

    supervisor.signal(Signal::SIGTERM).unwrap();
    let status = supervisor.wait_exit(SHUTDOWN).unwrap();
    assert!(status.success());
    harness.wait_for_cleanup(Duration::from_secs(1)).unwrap();
    assert!(!process::is_alive(ping.pid));
}

#[test]
fn stop_command_and_not_running() {
    let harness = harness("ping");
    let mut supervisor = harness.start(Vec::<&str>::new()).unwrap();
    harness.wait_for_up("ping", STARTUP).unwrap();

    let output = harness.invoke(["--stop"]).unwrap();
    assert!(output.status.success());
    supervisor.wait_exit(SHUTDOWN).unwrap();
    harness.wait_for_cleanup(Duration::from_secs(1)).unwrap();

    let output = harness.invoke(["--stop"]).unwrap();
    assert!(output.status.success());
    assert_eq!(stdout(&output), "Not running.\n");

    let output = harness.invoke(["--stat"]).unwrap();
    assert_eq!(stdout(&output), "Not running.\n");
}

#[test]
fn down_then_up_forks_a_new_worker() {
    let harness = harness("ping");
    let _supervisor = harness.start(["run"]).unwrap();
    let first = harness.wait_for_up("ping", STARTUP).unwrap();

    let output = harness.invoke(["--down=ping"]).unwrap();
    assert_eq!(output.status.code(), Some(0));
    let registry = harness.registry().unwrap();
    let record = registry.get(&WorkerName::new("ping")).unwrap();
    assert_eq!(record.status, WorkerStatus::Down);
    assert!(!process::is_alive(first.pid));

    // Still down after a couple of reconciliation passes.
    std::thread::sleep(Duration::from_millis(2500));
    let record = *harness.registry().unwrap().get(&WorkerName::new("ping")).unwrap();
    assert_eq!(record.status, WorkerStatus::Down);

    let output = harness.invoke(["--up=ping"]).unwrap();
    assert_eq!(output.status.code(), Some(0));
    // The old pid is dead, so this only passes once the worker is respawned.
    let second = harness.wait_for_up("ping", STARTUP).unwrap();
    assert_ne!(second.pid, first.pid);
}

#[test]
fn bounce_restarts_running_worker() {
    let harness = harness("ping");
    let _supervisor = harness.start(["run"]).unwrap();
    let first = harness.wait_for_up("ping", STARTUP).unwrap();

    let output = harness.invoke(["--bounce=ping"]).unwrap();
    assert_eq!(output.status.code(), Some(0));
    assert!(!process::is_alive(first.pid));

    let registry = harness
        .wait_for("bounced ping", STARTUP, |r| {
            r.get(&WorkerName::new("ping")).is_some_and(|rec| {
                rec.pid != first.pid && rec.status == WorkerStatus::Up && process::is_alive(rec.pid)
            })
        })
        .unwrap();
    assert_eq!(registry.len(), 2);
}

#[test]
fn nohup_detaches_and_ignores_hangup() {
    let harness = harness("ping");
    let mut launcher = harness.start(["--nohup"]).unwrap();
    let status = launcher.wait_exit(STARTUP).unwrap();
    assert!(status.success());

    let daemon = harness.wait_for_detached(launcher.pid(), STARTUP).unwrap();
    assert_ne!(daemon.pid(), launcher.pid());
    let ping = harness.wait_for_up("ping", STARTUP).unwrap();

    daemon.signal(Signal::SIGHUP).unwrap();
    std::thread::sleep(Duration::from_millis(1500));
    let registry = harness.registry().unwrap();
    assert_eq!(registry.supervisor().map(|me| me.pid), Some(daemon.pid()));
    assert_eq!(registry.get(&WorkerName::new("ping")).map(|r| r.pid), Some(ping.pid));
    assert!(harness.channel_exists());

    // Not our child, so completion shows up as the run files going away.
    daemon.signal(Signal::SIGTERM).unwrap();
    harness.wait_for_cleanup(SHUTDOWN).unwrap();
}

#[test]
fn killed_worker_is_respawned() {
    let harness = harness("ping");
    let _supervisor = harness.start(["run"]).unwrap();
    let first = harness.wait_for_up("ping", STARTUP).unwrap();

    process::send_signal(first.pid, Signal::SIGKILL).unwrap();
    let registry = harness
        .wait_for("respawned ping", STARTUP, |r| {
            r.get(&WorkerName::new("ping")).is_some_and(|rec| {
                rec.pid != first.pid && rec.status == WorkerStatus::Up && process::is_alive(rec.pid)
            })
        })
        .unwrap();
    assert_eq!(registry.len(), 2);
}

#[test]
fn crashing_task_is_respawned() {
    let harness = harness("crasher");
    let _supervisor = harness.start(["run"]).unwrap();
    let first = harness.wait_for_up("crasher", STARTUP).unwrap();

    harness
        .wait_for("crasher restarted", STARTUP, |r| {
            r.get(&WorkerName::new("crasher"))
                .is_some_and(|rec| rec.pid != first.pid)
        })
        .unwrap();
}

#[test]
fn worker_that_goes_down_stays_down() {
    let harness = harness("quitter,ping");
    let _supervisor = harness.start(["run"]).unwrap();

    let registry = harness
        .wait_for("quitter down", STARTUP, |r| {
            r.get(&WorkerName::new("quitter"))
                .is_some_and(|rec| rec.status == WorkerStatus::Down)
        })
        .unwrap();
    let parked = *registry.get(&WorkerName::new("quitter")).unwrap();

    std::thread::sleep(Duration::from_millis(2500));
    let registry = harness.registry().unwrap();
    let record = registry.get(&WorkerName::new("quitter")).unwrap();
    assert_eq!(record.status, WorkerStatus::Down);
    assert_eq!(record.pid, parked.pid);
    // The reaped worker's pid is not kept around for reuse to hit.
    assert_eq!(record.pid, 0);

    let output = harness.invoke(["--stat"]).unwrap();
    let text = stdout(&output);
    assert!(text.contains("quitter: down"), "{text}");
    assert!(text.contains("ping   : up (pid"), "{text}");
}

#[test]
fn replicas_and_list() {
    let harness = harness("ping:3");
    let output = harness.invoke(["--list"]).unwrap();
    assert!(output.status.success());
    assert_eq!(stdout(&output), "ping^0\nping^1\nping^2\n");

    let _supervisor = harness.start(["run"]).unwrap();
    for name in ["ping^0", "ping^1", "ping^2"] {
        harness.wait_for_up(name, STARTUP).unwrap();
    }

    // Substring match hits every replica.
    let output = harness.invoke(["--down=PING^"]).unwrap();
    assert_eq!(output.status.code(), Some(0));
    let registry = harness.registry().unwrap();
    assert_eq!(
        registry
            .workers()
            .filter(|(_, r)| r.status == WorkerStatus::Down)
            .count(),
        3
    );
}

#[test]
fn ceiling_violation_fails_without_forking() {
    let harness = harness("ping:100,extra");
    let output = harness.invoke(["run"]).unwrap();
    assert_eq!(output.status.code(), Some(1));
    assert!(!harness.registry_file().exists());
    assert!(!harness.channel_exists());
}

#[test]
fn second_instance_is_refused() {
    let harness = harness("ping");
    let _supervisor = harness.start(["run"]).unwrap();
    harness.wait_for_up("ping", STARTUP).unwrap();

    let output = harness.invoke(["run"]).unwrap();
    assert_eq!(output.status.code(), Some(1));

    let output = harness.invoke(["--cron"]).unwrap();
    assert_eq!(output.status.code(), Some(0));
    assert!(harness.registry_file().exists());
}

#[test]
fn unknown_worker_exits_2() {
    let harness = harness("ping");
    let _supervisor = harness.start(["run"]).unwrap();
    harness.wait_for_up("ping", STARTUP).unwrap();

    let output = harness.invoke(["--bounce=nothing"]).unwrap();
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn stubborn_worker_is_killed_within_bound() {
    let harness = harness("stubborn");
    let mut supervisor = harness.start(["run"]).unwrap();
    let stubborn = harness.wait_for_up("stubborn", STARTUP).unwrap();

    let start = Instant::now();
    supervisor.signal(Signal::SIGINT).unwrap();
    supervisor.wait_exit(SHUTDOWN).unwrap();
    let elapsed = start.elapsed();

    // Interrupt is ignored, so the kill comes after the grace period.
    assert!(elapsed >= Duration::from_secs(3), "{elapsed:?}");
    assert!(!process::is_alive(stubborn.pid));
    harness.wait_for_cleanup(Duration::from_secs(1)).unwrap();
}

#[test]
fn terminate_after_stops_supervisor() {
    let harness = harness("ping");
    let mut supervisor = harness.start(["--terminate-after=2"]).unwrap();
    harness.wait_for_up("ping", STARTUP).unwrap();

    let status = supervisor.wait_exit(SHUTDOWN).unwrap();
    assert!(status.success());
    harness.wait_for_cleanup(Duration::from_secs(1)).unwrap();
}

#[test]
fn watched_file_change_stops_supervisor() {
    let harness = harness("ping");
    let watched = harness.run_dir().join("app.toml");
    std::fs::write(&watched, "a = 1\n").unwrap();
    let watch_arg = format!("--watch={}", watched.display());
    let mut supervisor = harness.start([watch_arg.as_str()]).unwrap();
    harness.wait_for_up("ping", STARTUP).unwrap();

    std::fs::write(&watched, "a = 22\n").unwrap();
    supervisor.wait_exit(SHUTDOWN).unwrap();
    harness.wait_for_cleanup(Duration::from_secs(1)).unwrap();
}

#[test]
fn stop_with_dead_supervisor_signals_workers() {
    let harness = harness("ping");
    let mut supervisor = harness.start(["run"]).unwrap();
    let ping = harness.wait_for_up("ping", STARTUP).unwrap();

    // SIGKILL leaves the registry behind with a dead `me`.
    supervisor.signal(Signal::SIGKILL).unwrap();
    supervisor.wait_exit(SHUTDOWN).unwrap();
    assert!(harness.registry_file().exists());

    let output = harness.invoke(["--stop"]).unwrap();
    assert!(output.status.success());

    // The orphan may linger as a zombie, so check the registry instead.
    let registry = harness.registry().unwrap();
    assert!(registry.supervisor().is_none());
    assert_eq!(registry.get(&WorkerName::new("ping")).map(|r| r.pid), Some(ping.pid));
}
