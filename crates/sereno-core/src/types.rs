//! Core types for worker bookkeeping.
//!
//! A worker is identified by its registry key. Replicas of one task share a
//! base name and differ by a `^N` suffix:
//! ```text
//! indexer        one copy of task "indexer"
//! mailer^0       first of N copies of task "mailer"
//! mailer^1       second copy
//! ```

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Separator between a base task name and its replica index.
pub const REPLICA_SEPARATOR: char = '^';

/// Registry key reserved for the supervisor process itself.
pub const SUPERVISOR_KEY: &str = "me";

/// Registry key of a worker.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerName(String);

impl WorkerName {
    /// Creates a worker name from a registry key.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Creates the key of replica `index` of task `base`.
    #[must_use]
    pub fn replica(base: &str, index: u32) -> Self {
        Self(format!("{base}{REPLICA_SEPARATOR}{index}"))
    }

    /// The supervisor's own key.
    #[must_use]
    pub fn supervisor() -> Self {
        Self(SUPERVISOR_KEY.to_string())
    }

    /// Returns the full registry key.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the task name with any replica suffix removed.
    #[must_use]
    pub fn base(&self) -> &str {
        self.0
            .split_once(REPLICA_SEPARATOR)
            .map_or(self.0.as_str(), |(base, _)| base)
    }

    /// Returns the replica index, if the name carries one.
    #[must_use]
    pub fn replica_index(&self) -> Option<u32> {
        self.0
            .split_once(REPLICA_SEPARATOR)
            .and_then(|(_, index)| index.parse().ok())
    }

    /// Returns true for the reserved `me` key.
    #[must_use]
    pub fn is_supervisor(&self) -> bool {
        self.0 == SUPERVISOR_KEY
    }

    /// Case-insensitive substring match used by administrative commands.
    #[must_use]
    pub fn matches(&self, pattern: &str) -> bool {
        self.0.to_lowercase().contains(&pattern.to_lowercase())
    }
}

impl fmt::Display for WorkerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WorkerName {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for WorkerName {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// Desired/observed state of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    /// Worker should be running; respawned when it dies.
    Up,
    /// Worker is held down; never respawned until brought up again.
    Down,
}

impl WorkerStatus {
    /// Returns the lowercase label used in logs and `stat` output.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Up => "up",
            Self::Down => "down",
        }
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One registry entry.
///
/// A record with status [`WorkerStatus::Up`] refers to a live process or to
/// one that exited and has not been reaped yet. A `down` record whose process
/// has been reaped carries pid 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerRecord {
    /// Process id of the worker (or of the supervisor for `me`).
    pub pid: i32,
    /// Desired status.
    pub status: WorkerStatus,
    /// Last change, Unix epoch milliseconds.
    #[serde(rename = "time")]
    pub changed_at_ms: u64,
}

impl WorkerRecord {
    /// Creates a record stamped with the current time.
    #[must_use]
    pub fn new(pid: i32, status: WorkerStatus) -> Self {
        Self {
            pid,
            status,
            changed_at_ms: now_epoch_ms(),
        }
    }

    /// Creates an `up` record for a freshly forked process.
    #[must_use]
    pub fn up(pid: i32) -> Self {
        Self::new(pid, WorkerStatus::Up)
    }

    /// Changes the desired status and restamps the record.
    pub fn set_status(&mut self, status: WorkerStatus) {
        self.status = status;
        self.changed_at_ms = now_epoch_ms();
    }

    /// Whole seconds since the last change, as of `now_ms`.
    #[must_use]
    pub fn age_secs(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.changed_at_ms) / 1000
    }
}

/// Current time in Unix epoch milliseconds.
#[must_use]
pub fn now_epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_name_strips_replica() {
        assert_eq!(WorkerName::new("mailer^3").base(), "mailer");
        assert_eq!(WorkerName::new("mailer").base(), "mailer");
    }

    #[test]
    fn test_replica_index() {
        let name = WorkerName::replica("x", 2);
        assert_eq!(name.as_str(), "x^2");
        assert_eq!(name.replica_index(), Some(2));
        assert_eq!(WorkerName::new("x").replica_index(), None);
    }

    #[test]
    fn test_supervisor_key() {
        assert!(WorkerName::supervisor().is_supervisor());
        assert!(!WorkerName::new("mercury").is_supervisor());
    }

    #[test]
    fn test_matches_is_case_insensitive() {
        let name = WorkerName::new("Queue::Mailer^1");
        assert!(name.matches("mailer"));
        assert!(name.matches("QUEUE"));
        assert!(!name.matches("indexer"));
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let json = serde_json::to_string(&WorkerStatus::Down).unwrap();
        assert_eq!(json, "\"down\"");
    }

    #[test]
    fn test_record_age() {
        let record = WorkerRecord {
            pid: 10,
            status: WorkerStatus::Up,
            changed_at_ms: 1_000,
        };
        assert_eq!(record.age_secs(62_500), 61);
        assert_eq!(record.age_secs(0), 0);
    }

    #[test]
    fn test_set_status_restamps() {
        let mut record = WorkerRecord {
            pid: 10,
            status: WorkerStatus::Up,
            changed_at_ms: 0,
        };
        record.set_status(WorkerStatus::Down);
        assert_eq!(record.status, WorkerStatus::Down);
        assert!(record.changed_at_ms > 0);
    }
}
