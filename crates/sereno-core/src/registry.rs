//! Persistent worker registry.
//!
//! The registry maps worker names to [`WorkerRecord`]s and lives in a single
//! JSON file shared by the running supervisor and every administrative
//! invocation. Reads hold a shared `flock`, writes an exclusive one, and a
//! write always replaces the whole file (truncate, then write) so a reader
//! never observes a partial mapping.
//!
//! An empty registry means "not running": saving one removes the file.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SupervisorError};
use crate::types::{WorkerName, WorkerRecord, WorkerStatus};

/// In-memory copy of the registry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Registry {
    workers: BTreeMap<WorkerName, WorkerRecord>,
}

impl Registry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the record for `name`.
    #[must_use]
    pub fn get(&self, name: &WorkerName) -> Option<&WorkerRecord> {
        self.workers.get(name)
    }

    /// Returns a mutable record for `name`.
    pub fn get_mut(&mut self, name: &WorkerName) -> Option<&mut WorkerRecord> {
        self.workers.get_mut(name)
    }

    /// Inserts or replaces a record.
    pub fn insert(&mut self, name: WorkerName, record: WorkerRecord) -> Option<WorkerRecord> {
        self.workers.insert(name, record)
    }

    /// Removes a record.
    pub fn remove(&mut self, name: &WorkerName) -> Option<WorkerRecord> {
        self.workers.remove(name)
    }

    /// Returns true if `name` has a record.
    #[must_use]
    pub fn contains(&self, name: &WorkerName) -> bool {
        self.workers.contains_key(name)
    }

    /// Number of records, including `me`.
    #[must_use]
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    /// Returns true if there are no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Iterates over all records in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&WorkerName, &WorkerRecord)> {
        self.workers.iter()
    }

    /// Iterates over worker records, skipping `me`.
    pub fn workers(&self) -> impl Iterator<Item = (&WorkerName, &WorkerRecord)> {
        self.workers.iter().filter(|(name, _)| !name.is_supervisor())
    }

    /// Keeps only the records for which `keep` returns true.
    pub fn retain(&mut self, mut keep: impl FnMut(&WorkerName, &WorkerRecord) -> bool) {
        self.workers.retain(|name, record| keep(name, record));
    }

    /// The supervisor's own record.
    #[must_use]
    pub fn supervisor(&self) -> Option<&WorkerRecord> {
        self.workers.get(&WorkerName::supervisor())
    }

    /// Worker names that are recorded `up`.
    #[must_use]
    pub fn up_workers(&self) -> Vec<(WorkerName, i32)> {
        self.workers()
            .filter(|(_, record)| record.status == WorkerStatus::Up)
            .map(|(name, record)| (name.clone(), record.pid))
            .collect()
    }

    /// Resolves an administrative target.
    ///
    /// `all` selects every worker, an exact key selects that worker, and
    /// anything else is a case-insensitive substring match. `me` is never
    /// returned.
    #[must_use]
    pub fn resolve(&self, pattern: &str) -> Vec<WorkerName> {
        if pattern == "all" {
            return self.workers().map(|(name, _)| name.clone()).collect();
        }
        let exact = WorkerName::new(pattern);
        if !exact.is_supervisor() && self.contains(&exact) {
            return vec![exact];
        }
        self.workers()
            .filter(|(name, _)| name.matches(pattern))
            .map(|(name, _)| name.clone())
            .collect()
    }
}

/// Lock-guarded registry file.
#[derive(Debug, Clone)]
pub struct RegistryFile {
    path: PathBuf,
}

impl RegistryFile {
    /// Creates a handle for the registry at `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the registry file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns true if the registry file exists.
    #[must_use]
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Reads the registry under a shared lock.
    ///
    /// A missing or empty file yields an empty registry.
    ///
    /// # Errors
    /// `FilePermission` if the file cannot be opened or locked, `FileParse`
    /// if its contents are not a registry.
    pub fn load(&self) -> Result<Registry> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Registry::new()),
            Err(e) => return Err(SupervisorError::file_permission(&self.path, e)),
        };
        let locked = self.lock(file, FlockArg::LockShared)?;

        let mut content = String::new();
        (&*locked)
            .read_to_string(&mut content)
            .map_err(|e| SupervisorError::file_permission(&self.path, e))?;
        drop(locked);

        if content.trim().is_empty() {
            return Ok(Registry::new());
        }
        serde_json::from_str(&content).map_err(|e| SupervisorError::file_parse(&self.path, e))
    }

    /// Reads the registry, treating unparsable contents as empty.
    ///
    /// # Errors
    /// `FilePermission` if the file cannot be opened or locked.
    pub fn load_or_empty(&self) -> Result<Registry> {
        match self.load() {
            Err(SupervisorError::FileParse { path, reason }) => {
                tracing::warn!(
                    path = %path.display(),
                    reason = %reason,
                    "registry is corrupt, treating as empty"
                );
                Ok(Registry::new())
            }
            other => other,
        }
    }

    /// Replaces the registry file with `registry` under an exclusive lock.
    ///
    /// Saving an empty registry deletes the file.
    ///
    /// # Errors
    /// `FilePermission` if the file cannot be written, locked or removed.
    pub fn save(&self, registry: &Registry) -> Result<()> {
        if registry.is_empty() {
            return self.remove();
        }

        let mut bytes = serde_json::to_vec_pretty(registry)
            .map_err(|e| SupervisorError::file_permission(&self.path, e))?;
        bytes.push(b'\n');

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
            .map_err(|e| SupervisorError::file_permission(&self.path, e))?;
        let locked = self.lock(file, FlockArg::LockExclusive)?;

        locked
            .set_len(0)
            .and_then(|()| (&*locked).write_all(&bytes))
            .and_then(|()| (&*locked).flush())
            .map_err(|e| SupervisorError::file_permission(&self.path, e))?;
        Ok(())
    }

    // Handlers are installed without SA_RESTART, so a signal can cut a
    // blocking flock short.
    fn lock(&self, mut file: File, arg: FlockArg) -> Result<Flock<File>> {
        loop {
            match Flock::lock(file, arg) {
                Ok(locked) => return Ok(locked),
                Err((unlocked, Errno::EINTR)) => file = unlocked,
                Err((_, errno)) => {
                    return Err(SupervisorError::file_permission(
                        &self.path,
                        format!("{arg:?}: {errno}"),
                    ));
                }
            }
        }
    }

    /// Deletes the registry file; a missing file is not an error.
    ///
    /// # Errors
    /// `FilePermission` if the file exists and cannot be removed.
    pub fn remove(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SupervisorError::file_permission(&self.path, e)),
        }
    }
}
