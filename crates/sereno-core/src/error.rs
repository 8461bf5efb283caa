//! Error types for sereno-core.
//!
//! Startup errors are fatal and surface as a non-zero exit code. Steady-state
//! errors are logged by the supervisor loop and retried on the next pass.

use std::path::{Path, PathBuf};

/// Result type alias for supervisor operations.
pub type Result<T> = std::result::Result<T, SupervisorError>;

/// Error type covering every failure mode of the supervisor and its tools.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    /// The registry file or the notification channel could not be created,
    /// opened, locked or removed.
    #[error("file permission error on {}: {reason}", path.display())]
    FilePermission {
        /// File that could not be accessed.
        path: PathBuf,
        /// What went wrong.
        reason: String,
    },

    /// Registry contents do not deserialize.
    #[error("cannot parse {}: {reason}", path.display())]
    FileParse {
        /// Registry file.
        path: PathBuf,
        /// Deserializer message.
        reason: String,
    },

    /// Invalid configuration, including a DesiredSet over the ceiling.
    #[error("configuration error: {0}")]
    Config(String),

    /// Fork, wait or other process control failed.
    #[error("process control error: {0}")]
    ProcessControl(String),

    /// A signal could not be delivered (usually because the pid is gone).
    #[error("signal {signal} not delivered to pid {pid}: {reason}")]
    SignalDelivery {
        /// Target process.
        pid: i32,
        /// Signal name.
        signal: String,
        /// OS error message.
        reason: String,
    },

    /// No registry entry matches a requested worker name.
    #[error("unknown process {0}")]
    NotFound(String),

    /// Another supervisor owns the registry.
    #[error("daemon already running (pid {0})")]
    AlreadyRunning(i32),

    /// Malformed notification channel frame.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SupervisorError {
    /// Creates a configuration error.
    #[must_use]
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Creates a process control error.
    #[must_use]
    pub fn process_control(msg: impl Into<String>) -> Self {
        Self::ProcessControl(msg.into())
    }

    /// Creates a protocol error.
    #[must_use]
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Creates a file permission error for `path`.
    #[must_use]
    pub fn file_permission(path: &Path, reason: impl std::fmt::Display) -> Self {
        Self::FilePermission {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        }
    }

    /// Creates a parse error for `path`.
    #[must_use]
    pub fn file_parse(path: &Path, reason: impl std::fmt::Display) -> Self {
        Self::FileParse {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        }
    }

    /// Returns true if the supervisor loop can continue after this error.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::FileParse { .. }
                | Self::ProcessControl(_)
                | Self::SignalDelivery { .. }
                | Self::Protocol(_)
        )
    }

    /// Returns true if this error must stop the supervisor at startup.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::FilePermission { .. } | Self::Config(_) | Self::AlreadyRunning(_)
        )
    }

    /// Process exit code reported by the command line tool.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::NotFound(_) => 2,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SupervisorError::config("too many processes");
        assert_eq!(err.to_string(), "configuration error: too many processes");
    }

    #[test]
    fn test_file_permission_display() {
        let err = SupervisorError::file_permission(Path::new("/run/x"), "denied");
        assert_eq!(err.to_string(), "file permission error on /run/x: denied");
        assert!(err.is_fatal());
    }

    #[test]
    fn test_error_recoverable() {
        assert!(SupervisorError::process_control("fork failed").is_recoverable());
        assert!(SupervisorError::file_parse(Path::new("r"), "eof").is_recoverable());
        assert!(!SupervisorError::config("bad").is_recoverable());
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(SupervisorError::NotFound("ping".into()).exit_code(), 2);
        assert_eq!(SupervisorError::AlreadyRunning(42).exit_code(), 1);
        assert_eq!(SupervisorError::config("bad").exit_code(), 1);
    }
}
