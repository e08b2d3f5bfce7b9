//! Server configuration
//!
//! Configuration is read from a TOML file (every field optional, see the
//! `Default` impls) and then overridden from the environment:
//!
//! - `REDIS_KEYSPACE_DATABASES`: number of logical databases
//! - `REDIS_KEYSPACE_HZ`: cron frequency
//! - `REDIS_KEYSPACE_REQUIREPASS`: password required by AUTH
//! - `REDIS_KEYSPACE_NOTIFY`: keyspace event classes (e.g. `KEA`)
//! - `REDIS_KEYSPACE_LOGLEVEL`: tracing level filter

use crate::redis::NotifyFlags;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Longest password AUTH will compare.
pub const AUTHPASS_MAX_LEN: usize = 512;

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
    Invalid { field: &'static str, reason: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "config I/O error: {}", e),
            ConfigError::Parse(e) => write!(f, "config parse error: {}", e),
            ConfigError::Invalid { field, reason } => {
                write!(f, "invalid config value for '{}': {}", field, reason)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// A `save <seconds> <changes>` point. Only its presence matters to the
/// engine: write refusal after a failed background save requires at least one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct SavePoint {
    pub seconds: u64,
    pub changes: u64,
}

/// Tuning knobs of the active expire cycle.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ActiveExpireConfig {
    /// Keys sampled per database per loop.
    pub lookups_per_loop: usize,
    /// Budget of a fast cycle, in microseconds.
    pub fast_duration_us: u64,
    /// Share of each cron tick a slow cycle may use, in percent.
    pub slow_time_perc: u64,
    /// Re-sample a database while more than this share of a batch expired.
    pub acceptable_stale_perc: usize,
    /// Databases visited per call unless the previous call ran out of time.
    pub dbs_per_call: usize,
}

impl Default for ActiveExpireConfig {
    fn default() -> Self {
        ActiveExpireConfig {
            lookups_per_loop: 20,
            fast_duration_us: 1000,
            slow_time_perc: 25,
            acceptable_stale_perc: 25,
            dbs_per_call: 16,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SlowlogConfig {
    /// Threshold in microseconds; negative disables the slow log.
    pub log_slower_than_us: i64,
    pub max_len: usize,
}

impl Default for SlowlogConfig {
    fn default() -> Self {
        SlowlogConfig {
            log_slower_than_us: 10_000,
            max_len: 128,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub databases: usize,
    pub hz: u64,
    pub requirepass: Option<String>,
    pub notify_keyspace_events: String,
    pub active_expire_enabled: bool,
    pub active_expire: ActiveExpireConfig,
    pub slowlog: SlowlogConfig,
    pub stop_writes_on_bgsave_error: bool,
    pub save_points: Vec<SavePoint>,
    pub replica_read_only: bool,
    /// Old name -> new name. An empty new name removes the command.
    pub rename_commands: HashMap<String, String>,
    pub pidfile: Option<PathBuf>,
    pub loglevel: String,
    pub log_json: bool,
    /// Seed for key sampling; random when unset.
    pub seed: Option<u64>,
    /// Start the background job workers.
    pub bio_threads: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            databases: 16,
            hz: 10,
            requirepass: None,
            notify_keyspace_events: String::new(),
            active_expire_enabled: true,
            active_expire: ActiveExpireConfig::default(),
            slowlog: SlowlogConfig::default(),
            stop_writes_on_bgsave_error: true,
            save_points: vec![
                SavePoint { seconds: 3600, changes: 1 },
                SavePoint { seconds: 300, changes: 100 },
                SavePoint { seconds: 60, changes: 10_000 },
            ],
            replica_read_only: true,
            rename_commands: HashMap::new(),
            pidfile: None,
            loglevel: "info".to_string(),
            log_json: false,
            seed: None,
            bio_threads: true,
        }
    }
}

impl ServerConfig {
    /// Config for tests: fixed seed, no worker threads, slow log off.
    pub fn test() -> Self {
        ServerConfig {
            seed: Some(0),
            bio_threads: false,
            slowlog: SlowlogConfig {
                log_slower_than_us: -1,
                max_len: 128,
            },
            ..Default::default()
        }
    }

    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: ServerConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Apply `REDIS_KEYSPACE_*` overrides, then re-validate.
    pub fn apply_env(mut self) -> Result<Self, ConfigError> {
        if let Ok(v) = std::env::var("REDIS_KEYSPACE_DATABASES") {
            self.databases = v.parse().map_err(|_| ConfigError::Invalid {
                field: "databases",
                reason: format!("'{}' is not a number", v),
            })?;
        }
        if let Ok(v) = std::env::var("REDIS_KEYSPACE_HZ") {
            self.hz = v.parse().map_err(|_| ConfigError::Invalid {
                field: "hz",
                reason: format!("'{}' is not a number", v),
            })?;
        }
        if let Ok(v) = std::env::var("REDIS_KEYSPACE_REQUIREPASS") {
            self.requirepass = if v.is_empty() { None } else { Some(v) };
        }
        if let Ok(v) = std::env::var("REDIS_KEYSPACE_NOTIFY") {
            self.notify_keyspace_events = v;
        }
        if let Ok(v) = std::env::var("REDIS_KEYSPACE_LOGLEVEL") {
            self.loglevel = v;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.databases == 0 {
            return Err(ConfigError::Invalid {
                field: "databases",
                reason: "must be at least 1".to_string(),
            });
        }
        if !(1..=500).contains(&self.hz) {
            return Err(ConfigError::Invalid {
                field: "hz",
                reason: format!("{} is outside 1..=500", self.hz),
            });
        }
        if !(1..=100).contains(&self.active_expire.slow_time_perc) {
            return Err(ConfigError::Invalid {
                field: "active_expire.slow_time_perc",
                reason: format!("{} is outside 1..=100", self.active_expire.slow_time_perc),
            });
        }
        if self.active_expire.lookups_per_loop == 0 {
            return Err(ConfigError::Invalid {
                field: "active_expire.lookups_per_loop",
                reason: "must be at least 1".to_string(),
            });
        }
        if let Some(pass) = &self.requirepass {
            if pass.len() > AUTHPASS_MAX_LEN {
                return Err(ConfigError::Invalid {
                    field: "requirepass",
                    reason: format!("longer than {} bytes", AUTHPASS_MAX_LEN),
                });
            }
        }
        self.notify_flags()?;
        Ok(())
    }

    pub fn notify_flags(&self) -> Result<NotifyFlags, ConfigError> {
        NotifyFlags::parse(&self.notify_keyspace_events).map_err(|c| ConfigError::Invalid {
            field: "notify_keyspace_events",
            reason: format!("unknown event class '{}'", c),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.databases, 16);
        assert_eq!(config.hz, 10);
        assert_eq!(config.active_expire.lookups_per_loop, 20);
        assert_eq!(config.active_expire.fast_duration_us, 1000);
        assert_eq!(config.slowlog.max_len, 128);
        assert_eq!(config.save_points.len(), 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = ServerConfig::from_toml_str(
            r#"
            databases = 4
            notify_keyspace_events = "KEA"

            [active_expire]
            slow_time_perc = 50

            [rename_commands]
            flushall = ""
            "#,
        )
        .unwrap();
        assert_eq!(config.databases, 4);
        assert_eq!(config.hz, 10);
        assert_eq!(config.active_expire.slow_time_perc, 50);
        assert_eq!(config.active_expire.lookups_per_loop, 20);
        assert_eq!(config.rename_commands.get("flushall").map(String::as_str), Some(""));
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(matches!(
            ServerConfig::from_toml_str("databases = 0"),
            Err(ConfigError::Invalid { field: "databases", .. })
        ));
        assert!(matches!(
            ServerConfig::from_toml_str("hz = 0"),
            Err(ConfigError::Invalid { field: "hz", .. })
        ));
        assert!(matches!(
            ServerConfig::from_toml_str("notify_keyspace_events = \"Kq\""),
            Err(ConfigError::Invalid { field: "notify_keyspace_events", .. })
        ));
        assert!(matches!(
            ServerConfig::from_toml_str("databases = \"many\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "hz = 100").unwrap();
        writeln!(file, "requirepass = \"secret\"").unwrap();
        let config = ServerConfig::from_file(file.path()).unwrap();
        assert_eq!(config.hz, 100);
        assert_eq!(config.requirepass.as_deref(), Some("secret"));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = ServerConfig::from_file(dir.path().join("absent.toml"));
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }
}
