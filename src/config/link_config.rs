use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::bluetooth::{ConnectOptions, RetryBudget};
use crate::error::ConfigError;

/// Log verbosity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        };
        f.write_str(name)
    }
}

/// Connection and polling configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Timeout of one connection attempt, `None` waits indefinitely
    #[serde(with = "optional_millis")]
    pub connect_timeout: Option<Duration>,

    /// Connection timeouts tolerated before giving up, `None` for unlimited
    pub timeout_retries: Option<u32>,

    /// Disconnects tolerated before giving up, `None` for unlimited
    pub disconnect_retries: Option<u32>,

    /// Timeout of service discovery
    #[serde(with = "optional_millis")]
    pub discovery_timeout: Option<Duration>,

    /// Interval between RSSI reads while polling
    #[serde(with = "millis")]
    pub rssi_poll_interval: Duration,

    /// How long the demo binary scans before picking a peripheral
    #[serde(with = "millis")]
    pub scan_duration: Duration,

    /// Log verbosity
    pub log_level: LogLevel,

    /// Optional log file
    pub log_file: Option<PathBuf>,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Some(Duration::from_secs(10)),
            timeout_retries: Some(3),
            disconnect_retries: Some(3),
            discovery_timeout: Some(Duration::from_secs(10)),
            rssi_poll_interval: Duration::from_secs(10),
            scan_duration: Duration::from_secs(5),
            log_level: LogLevel::Info,
            log_file: None,
        }
    }
}

impl LinkConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the connection attempt timeout
    pub fn with_connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the timeout retry budget
    pub fn with_timeout_retries(mut self, retries: Option<u32>) -> Self {
        self.timeout_retries = retries;
        self
    }

    /// Set the disconnect retry budget
    pub fn with_disconnect_retries(mut self, retries: Option<u32>) -> Self {
        self.disconnect_retries = retries;
        self
    }

    /// Set the service discovery timeout
    pub fn with_discovery_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.discovery_timeout = timeout;
        self
    }

    /// Set the RSSI polling interval
    pub fn with_rssi_poll_interval(mut self, interval: Duration) -> Self {
        self.rssi_poll_interval = interval;
        self
    }

    /// Set the scan duration
    pub fn with_scan_duration(mut self, duration: Duration) -> Self {
        self.scan_duration = duration;
        self
    }

    /// Set the log level
    pub fn with_log_level(mut self, level: LogLevel) -> Self {
        self.log_level = level;
        self
    }

    /// Convert to options for `Peripheral::connect`
    pub fn to_connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            timeout: self.connect_timeout,
            timeout_retries: RetryBudget::from(self.timeout_retries),
            disconnect_retries: RetryBudget::from(self.disconnect_retries),
        }
    }

    /// Reject values the peripheral cannot work with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rssi_poll_interval.is_zero() {
            return Err(ConfigError::Invalid {
                field: "rssi_poll_interval",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.scan_duration.is_zero() {
            return Err(ConfigError::Invalid {
                field: "scan_duration",
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }

    /// Load and validate configuration from a JSON file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&contents)?;
        config.validate()?;
        log::debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Load from `path` if it exists, defaults otherwise
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration as pretty JSON, creating parent directories
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }
        let contents = serde_json::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// Default location of the configuration file
    pub fn default_path() -> PathBuf {
        dirs_next::config_dir()
            .map(|config_dir| config_dir.join("blelink").join("config.json"))
            .unwrap_or_else(|| PathBuf::from("blelink.json"))
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

mod optional_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(duration) => serializer.serialize_some(&(duration.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<u64>::deserialize(deserializer).map(|millis| millis.map(Duration::from_millis))
    }
}
