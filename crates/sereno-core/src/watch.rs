//! File attribute watcher.
//!
//! Polled once per reconciliation pass. The supervisor forks workers, so the
//! watcher must not start background threads; it compares file attributes
//! (existence, size, mtime, inode) against a snapshot instead.

use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Stamp {
    len: u64,
    mtime: i64,
    mtime_nsec: i64,
    ino: u64,
}

fn stamp(path: &Path) -> Option<Stamp> {
    std::fs::metadata(path).ok().map(|m| Stamp {
        len: m.len(),
        mtime: m.mtime(),
        mtime_nsec: m.mtime_nsec(),
        ino: m.ino(),
    })
}

/// Watches a set of files for attribute changes.
#[derive(Debug, Clone, Default)]
pub struct FileWatch {
    files: Vec<(PathBuf, Option<Stamp>)>,
}

impl FileWatch {
    /// Snapshots the current attributes of `paths`.
    #[must_use]
    pub fn new(paths: impl IntoIterator<Item = impl Into<PathBuf>>) -> Self {
        Self {
            files: paths
                .into_iter()
                .map(Into::into)
                .map(|path| {
                    let snapshot = stamp(&path);
                    (path, snapshot)
                })
                .collect(),
        }
    }

    /// Returns true if nothing is watched.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Returns true if any watched file changed since the last call.
    pub fn changed(&mut self) -> bool {
        let mut changed = false;
        for (path, previous) in &mut self.files {
            let current = stamp(path);
            if current != *previous {
                tracing::info!(file = %path.display(), "watched file changed");
                *previous = current;
                changed = true;
            }
        }
        changed
    }
}
