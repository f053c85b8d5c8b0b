//! Configuration module for probewatch
//!
//! Settings are layered explicitly: built-in defaults, then an optional JSON
//! file named by `PROBEWATCH_CONFIG`, then command-line flags.

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::DEFAULT_TIMEOUT;
use crate::error::ConfigError;

/// Environment variable holding the configuration-file path
pub const CONFIG_ENV: &str = "PROBEWATCH_CONFIG";

/// Port used when the queue host omits one
pub const DEFAULT_REDIS_PORT: u16 = 6379;

/// Main settings structure shared by every subcommand
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Queue address as `host:port`
    #[serde(rename = "RedisHost")]
    pub redis_host: String,

    /// Unix socket path; takes precedence over the host when set
    #[serde(rename = "RedisSocket")]
    pub redis_socket: String,

    #[serde(rename = "RedisPassword")]
    pub redis_password: String,

    /// Database index on the queue server
    #[serde(rename = "RedisDB")]
    pub redis_db: i64,

    /// Timeout for dialling the queue and for each queue command
    ///
    /// Written in seconds (`5` or `2.5`). Values above one day are rejected,
    /// since they are almost always nanosecond counts such as `5000000000`.
    #[serde(rename = "RedisDialTimeout", with = "duration_secs")]
    pub redis_timeout: Duration,

    /// Deadline for each probe run, in seconds
    #[serde(rename = "Timeout", with = "duration_secs")]
    pub timeout: Duration,

    /// Run resolving probes against IPv4 addresses
    #[serde(rename = "IPv4")]
    pub ipv4: bool,

    /// Run resolving probes against IPv6 addresses
    #[serde(rename = "IPv6")]
    pub ipv6: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            redis_host: format!("localhost:{}", DEFAULT_REDIS_PORT),
            redis_socket: String::new(),
            redis_password: String::new(),
            redis_db: 0,
            redis_timeout: Duration::from_secs(5),
            timeout: DEFAULT_TIMEOUT,
            ipv4: true,
            ipv6: true,
        }
    }
}

/// Values given on the command line; `None` keeps the lower layer
#[derive(Debug, Clone, Default)]
pub struct SettingsOverrides {
    pub redis_host: Option<String>,
    pub redis_socket: Option<String>,
    pub redis_password: Option<String>,
    pub redis_db: Option<i64>,
    pub redis_timeout: Option<Duration>,
    pub timeout: Option<Duration>,
    pub ipv4: Option<bool>,
    pub ipv6: Option<bool>,
}

/// Where the job queue lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueEndpoint {
    Tcp { host: String, port: u16 },
    Unix(PathBuf),
}

impl Settings {
    /// Load settings from a JSON file, missing keys keeping their defaults
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_str = path.as_ref().display().to_string();
        let content = fs::read_to_string(&path).map_err(|error| ConfigError::Read {
            path: path_str.clone(),
            error,
        })?;

        serde_json::from_str(&content).map_err(|error| ConfigError::Parse { path: path_str, error })
    }

    /// Defaults overlaid with the file named by `config_path`, if any
    ///
    /// An unreadable or malformed file does not abort: the defaults are used
    /// and the problem is handed back so the caller can show it.
    pub fn load(config_path: Option<&str>) -> (Self, Option<ConfigError>) {
        match config_path.filter(|p| !p.is_empty()) {
            Some(path) => match Self::from_json_file(path) {
                Ok(settings) => {
                    debug!("Loaded configuration from {}", path);
                    (settings, None)
                }
                Err(e) => {
                    warn!("{}; using defaults", e);
                    (Self::default(), Some(e))
                }
            },
            None => (Self::default(), None),
        }
    }

    /// Defaults overlaid with the file named by the environment
    pub fn load_from_env() -> (Self, Option<ConfigError>) {
        let path = std::env::var(CONFIG_ENV).ok();
        Self::load(path.as_deref())
    }

    /// Apply the command-line layer
    pub fn apply(mut self, overrides: SettingsOverrides) -> Self {
        if let Some(host) = overrides.redis_host {
            self.redis_host = host;
        }
        if let Some(socket) = overrides.redis_socket {
            self.redis_socket = socket;
        }
        if let Some(password) = overrides.redis_password {
            self.redis_password = password;
        }
        if let Some(db) = overrides.redis_db {
            self.redis_db = db;
        }
        if let Some(timeout) = overrides.redis_timeout {
            self.redis_timeout = timeout;
        }
        if let Some(timeout) = overrides.timeout {
            self.timeout = timeout;
        }
        if let Some(ipv4) = overrides.ipv4 {
            self.ipv4 = ipv4;
        }
        if let Some(ipv6) = overrides.ipv6 {
            self.ipv6 = ipv6;
        }
        self
    }

    /// Resolve the queue address, preferring the socket path
    pub fn queue_endpoint(&self) -> Result<QueueEndpoint, ConfigError> {
        if !self.redis_socket.is_empty() {
            return Ok(QueueEndpoint::Unix(PathBuf::from(&self.redis_socket)));
        }

        let invalid = |message: String| ConfigError::InvalidValue {
            flag: "redis-host".to_string(),
            message,
        };

        let (host, port) = match self.redis_host.rsplit_once(':') {
            // A bare IPv6 literal has colons but no port
            Some((host, _)) if host.contains(':') && !host.ends_with(']') => {
                (self.redis_host.as_str(), DEFAULT_REDIS_PORT)
            }
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|e| invalid(format!("bad port '{}': {}", port, e)))?;
                (host, port)
            }
            None => (self.redis_host.as_str(), DEFAULT_REDIS_PORT),
        };

        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(invalid(format!("no host in '{}'", self.redis_host)));
        }

        Ok(QueueEndpoint::Tcp {
            host: host.to_string(),
            port,
        })
    }
}

/// Parse a duration such as `500ms`, `5s`, `2m`, `1h`, or a bare number of seconds
pub fn parse_duration(value: &str) -> Result<Duration, ConfigError> {
    let value = value.trim();
    let invalid = || ConfigError::InvalidValue {
        flag: "duration".to_string(),
        message: format!("cannot parse '{}' (try 500ms, 5s or 2m)", value),
    };

    let split = value.find(|c: char| !(c.is_ascii_digit() || c == '.')).unwrap_or(value.len());
    let (number, unit) = value.split_at(split);
    let number: f64 = number.parse().map_err(|_| invalid())?;

    let seconds = match unit {
        "" | "s" => number,
        "ms" => number / 1000.0,
        "m" => number * 60.0,
        "h" => number * 3600.0,
        _ => return Err(invalid()),
    };

    Duration::try_from_secs_f64(seconds).map_err(|_| invalid())
}

/// Durations in the JSON file are written as (fractional) seconds
mod duration_secs {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    /// One day; anything longer is taken to be a unit mistake
    const MAX_SECS: f64 = 86_400.0;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        if secs > MAX_SECS {
            return Err(D::Error::custom(format!(
                "duration of {} seconds is too large (durations are in seconds, not nanoseconds)",
                secs
            )));
        }
        Duration::try_from_secs_f64(secs).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.redis_host, "localhost:6379");
        assert_eq!(settings.redis_db, 0);
        assert_eq!(settings.redis_timeout, Duration::from_secs(5));
        assert_eq!(settings.timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"RedisHost": "queue.internal:6380", "RedisDB": 3, "RedisDialTimeout": 2.5}}"#).unwrap();

        let settings = Settings::from_json_file(file.path()).unwrap();
        assert_eq!(settings.redis_host, "queue.internal:6380");
        assert_eq!(settings.redis_db, 3);
        assert_eq!(settings.redis_timeout, Duration::from_millis(2500));
        assert_eq!(settings.redis_password, "");
    }

    #[test]
    fn test_malformed_file_falls_back_to_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();

        let path = file.path().to_str().unwrap().to_string();
        assert!(matches!(Settings::from_json_file(&path), Err(ConfigError::Parse { .. })));
        let (settings, problem) = Settings::load(Some(path.as_str()));
        assert_eq!(settings, Settings::default());
        assert!(matches!(problem, Some(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_nanosecond_duration_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"RedisDialTimeout": 5000000000}}"#).unwrap();

        let err = Settings::from_json_file(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("not nanoseconds"));
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let (settings, problem) = Settings::load(Some("/nonexistent/probewatch.json"));
        assert_eq!(settings, Settings::default());
        assert!(matches!(problem, Some(ConfigError::Read { .. })));

        let (settings, problem) = Settings::load(None);
        assert_eq!(settings, Settings::default());
        assert!(problem.is_none());
    }

    #[test]
    fn test_flags_override_file() {
        let file_layer = Settings {
            redis_host: "file-host:7000".to_string(),
            redis_db: 2,
            ..Settings::default()
        };
        let settings = file_layer.apply(SettingsOverrides {
            redis_db: Some(5),
            ..SettingsOverrides::default()
        });
        assert_eq!(settings.redis_host, "file-host:7000");
        assert_eq!(settings.redis_db, 5);
    }

    #[test]
    fn test_queue_endpoint() {
        let mut settings = Settings::default();
        assert_eq!(
            settings.queue_endpoint().unwrap(),
            QueueEndpoint::Tcp { host: "localhost".to_string(), port: 6379 }
        );

        settings.redis_host = "[::1]:6380".to_string();
        assert_eq!(
            settings.queue_endpoint().unwrap(),
            QueueEndpoint::Tcp { host: "::1".to_string(), port: 6380 }
        );

        settings.redis_host = "queue.internal".to_string();
        assert_eq!(
            settings.queue_endpoint().unwrap(),
            QueueEndpoint::Tcp { host: "queue.internal".to_string(), port: 6379 }
        );

        settings.redis_host = "queue.internal:http".to_string();
        assert!(settings.queue_endpoint().is_err());

        settings.redis_socket = "/run/redis.sock".to_string();
        assert_eq!(
            settings.queue_endpoint().unwrap(),
            QueueEndpoint::Unix(PathBuf::from("/run/redis.sock"))
        );
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("5s").unwrap(), Duration::from_secs(5));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("3").unwrap(), Duration::from_secs(3));
        assert_eq!(parse_duration("1.5s").unwrap(), Duration::from_millis(1500));
        assert!(parse_duration("soon").is_err());
        assert!(parse_duration("5 parsecs").is_err());
    }
}
