//! Supervisor configuration.
//!
//! Configuration is validated at load time, with sensible defaults and clear
//! error messages. Durations are written in human form (`"3s"`, `"10m"`).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, SupervisorError};

/// Supervisor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Directory holding the registry file and the notification channel.
    #[serde(default = "default_run_dir")]
    pub run_dir: PathBuf,

    /// Registry file name inside `run_dir`.
    #[serde(default = "default_registry_file")]
    pub registry_file: String,

    /// Notification channel (FIFO) name inside `run_dir`.
    #[serde(default = "default_channel_file")]
    pub channel_file: String,

    /// Ceiling on the expanded number of workers.
    #[serde(default = "default_maximum_processes")]
    pub maximum_processes: usize,

    /// How long one channel drain may block.
    #[serde(default = "default_read_timeout")]
    #[serde(with = "humantime_serde")]
    pub read_timeout: Duration,

    /// Period of the "still alive" log line.
    #[serde(default = "default_alive_interval")]
    #[serde(with = "humantime_serde")]
    pub alive_interval: Duration,

    /// Shut down after this much wall-clock time.
    #[serde(default, with = "humantime_serde::option")]
    pub terminate_after: Option<Duration>,

    /// Pause of an interrupted worker before it exits.
    #[serde(default, with = "humantime_serde::option")]
    pub terminate_wait: Option<Duration>,

    /// Escalation schedule used by shutdown and `down`.
    #[serde(default)]
    pub shutdown: EscalationConfig,

    /// Poll period of an administrative `down` waiting for its worker.
    #[serde(default = "default_admin_poll")]
    #[serde(with = "humantime_serde")]
    pub admin_poll: Duration,

    /// Replica count overrides, keyed by base task name.
    #[serde(default)]
    pub process_count: BTreeMap<String, u32>,

    /// Files whose change makes the supervisor exit.
    #[serde(default)]
    pub watch: Vec<PathBuf>,
}

fn default_run_dir() -> PathBuf {
    PathBuf::from("run")
}

fn default_registry_file() -> String {
    "daemon.json".to_string()
}

fn default_channel_file() -> String {
    "daemon-controller".to_string()
}

fn default_maximum_processes() -> usize {
    100
}

fn default_read_timeout() -> Duration {
    Duration::from_secs(1)
}

fn default_alive_interval() -> Duration {
    Duration::from_secs(600)
}

fn default_admin_poll() -> Duration {
    Duration::from_millis(20)
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            run_dir: default_run_dir(),
            registry_file: default_registry_file(),
            channel_file: default_channel_file(),
            maximum_processes: default_maximum_processes(),
            read_timeout: default_read_timeout(),
            alive_interval: default_alive_interval(),
            terminate_after: None,
            terminate_wait: None,
            shutdown: EscalationConfig::default(),
            admin_poll: default_admin_poll(),
            process_count: BTreeMap::new(),
            watch: vec![],
        }
    }
}

impl SupervisorConfig {
    /// Creates a configuration rooted at `run_dir` with default settings.
    #[must_use]
    pub fn new(run_dir: impl Into<PathBuf>) -> Self {
        Self {
            run_dir: run_dir.into(),
            ..Self::default()
        }
    }

    /// Path of the registry file.
    #[must_use]
    pub fn registry_path(&self) -> PathBuf {
        self.run_dir.join(&self.registry_file)
    }

    /// Path of the notification channel.
    #[must_use]
    pub fn channel_path(&self) -> PathBuf {
        self.run_dir.join(&self.channel_file)
    }

    /// Validates the configuration.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<()> {
        if self.run_dir.as_os_str().is_empty() {
            return Err(SupervisorError::config("run_dir cannot be empty"));
        }
        for (key, value) in [
            ("registry_file", &self.registry_file),
            ("channel_file", &self.channel_file),
        ] {
            if value.is_empty() || value.contains('/') {
                return Err(SupervisorError::config(format!(
                    "{key} must be a plain file name"
                )));
            }
        }
        if self.registry_file == self.channel_file {
            return Err(SupervisorError::config(
                "registry_file and channel_file must differ",
            ));
        }
        if self.maximum_processes == 0 {
            return Err(SupervisorError::config(
                "maximum_processes must be greater than 0",
            ));
        }
        if self.read_timeout.is_zero() {
            return Err(SupervisorError::config("read_timeout must be positive"));
        }
        if self.alive_interval.is_zero() {
            return Err(SupervisorError::config("alive_interval must be positive"));
        }
        self.shutdown.validate()?;
        Ok(())
    }

    /// Loads configuration from a TOML file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| SupervisorError::config(format!("failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| SupervisorError::config(format!("failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }
}

/// Interrupt, wait, kill, wait, give up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationConfig {
    /// Time allowed after the polite signal before SIGKILL is sent.
    #[serde(default = "default_interrupt_grace")]
    #[serde(with = "humantime_serde")]
    pub interrupt_grace: Duration,

    /// Total time after which waiting stops and an error is logged.
    #[serde(default = "default_kill_deadline")]
    #[serde(with = "humantime_serde")]
    pub kill_deadline: Duration,

    /// Period between reap attempts.
    #[serde(default = "default_poll_interval")]
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
}

fn default_interrupt_grace() -> Duration {
    Duration::from_secs(3)
}

fn default_kill_deadline() -> Duration {
    Duration::from_secs(10)
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(100)
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            interrupt_grace: default_interrupt_grace(),
            kill_deadline: default_kill_deadline(),
            poll_interval: default_poll_interval(),
        }
    }
}

impl EscalationConfig {
    /// Validates the escalation schedule.
    ///
    /// # Errors
    /// Returns an error if the deadlines are out of order.
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval.is_zero() {
            return Err(SupervisorError::config("poll_interval must be positive"));
        }
        if self.kill_deadline < self.interrupt_grace {
            return Err(SupervisorError::config(
                "kill_deadline must not be shorter than interrupt_grace",
            ));
        }
        Ok(())
    }
}

/// Serde helper for humantime durations.
mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    /// Serializes a duration as a human-readable string.
    ///
    /// # Errors
    /// Returns an error if serialization fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    /// Deserializes a duration from a human-readable string.
    ///
    /// # Errors
    /// Returns an error if the string cannot be parsed.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }

    /// Same as the parent module, for optional durations.
    pub mod option {
        use serde::{Deserialize, Deserializer, Serializer};
        use std::time::Duration;

        /// Serializes an optional duration.
        ///
        /// # Errors
        /// Returns an error if serialization fails.
        pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match duration {
                Some(d) => super::serialize(d, serializer),
                None => serializer.serialize_none(),
            }
        }

        /// Deserializes an optional duration.
        ///
        /// # Errors
        /// Returns an error if the string cannot be parsed.
        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            let s = Option::<String>::deserialize(deserializer)?;
            s.map(|s| humantime::parse_duration(&s).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = SupervisorConfig::default();
        assert_eq!(config.maximum_processes, 100);
        assert_eq!(config.read_timeout, Duration::from_secs(1));
        assert_eq!(config.alive_interval, Duration::from_secs(600));
        assert!(config.terminate_after.is_none());
        assert!(config.terminate_wait.is_none());
        assert_eq!(config.shutdown.interrupt_grace, Duration::from_secs(3));
        assert_eq!(config.shutdown.kill_deadline, Duration::from_secs(10));
        assert_eq!(config.shutdown.poll_interval, Duration::from_millis(100));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_paths_live_in_run_dir() {
        let config = SupervisorConfig::new("/var/run/app");
        assert_eq!(config.registry_path(), PathBuf::from("/var/run/app/daemon.json"));
        assert_eq!(
            config.channel_path(),
            PathBuf::from("/var/run/app/daemon-controller")
        );
    }

    #[test]
    fn test_validate_zero_ceiling() {
        let config = SupervisorConfig {
            maximum_processes: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_file_names() {
        let mut config = SupervisorConfig::default();
        config.registry_file = "a/b".to_string();
        assert!(config.validate().is_err());

        let mut config = SupervisorConfig::default();
        config.channel_file = config.registry_file.clone();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_escalation_order() {
        let config = EscalationConfig {
            interrupt_grace: Duration::from_secs(5),
            kill_deadline: Duration::from_secs(1),
            poll_interval: Duration::from_millis(100),
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_toml() {
        let config: SupervisorConfig = toml::from_str(
            r#"
            run_dir = "/tmp/sereno"
            maximum_processes = 12
            terminate_after = "1h"
            alive_interval = "30s"

            [shutdown]
            interrupt_grace = "1s"

            [process_count]
            mailer = 3
            "#,
        )
        .unwrap();
        assert_eq!(config.run_dir, PathBuf::from("/tmp/sereno"));
        assert_eq!(config.maximum_processes, 12);
        assert_eq!(config.terminate_after, Some(Duration::from_secs(3600)));
        assert_eq!(config.alive_interval, Duration::from_secs(30));
        assert_eq!(config.shutdown.interrupt_grace, Duration::from_secs(1));
        assert_eq!(config.shutdown.kill_deadline, Duration::from_secs(10));
        assert_eq!(config.process_count.get("mailer"), Some(&3));
    }

    #[test]
    fn test_load_rejects_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sereno.toml");
        std::fs::write(&path, "maximum_processes = 0\n").unwrap();
        assert!(SupervisorConfig::load(&path).is_err());
    }

    #[test]
    fn test_load_missing_file() {
        assert!(SupervisorConfig::load("/nonexistent/sereno.toml").is_err());
    }

    #[test]
    fn test_config_serialize_roundtrip() {
        let mut config = SupervisorConfig::new("/tmp/x");
        config.terminate_wait = Some(Duration::from_secs(2));
        let text = toml::to_string(&config).unwrap();
        let back: SupervisorConfig = toml::from_str(&text).unwrap();
        assert_eq!(back.run_dir, config.run_dir);
        assert_eq!(back.terminate_wait, Some(Duration::from_secs(2)));
    }
}
