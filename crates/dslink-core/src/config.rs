//! Agent properties and the drone config store.
//!
//! Two JSON documents:
//! - `properties.json`: tunables (addresses, intervals, launcher). Every field
//!   has a default and a missing file means "all defaults".
//! - `config.json`: credentials and drone metadata. Required at startup and
//!   rewritten whenever the monitor pushes new drone metadata.

use std::{
    path::{Path, PathBuf},
    sync::RwLock,
    time::Duration,
};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, info};

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("cannot write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("cannot parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("config store lock poisoned")]
    Poisoned,
}

/// Remote monitor endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorAddr {
    pub host: String,
    pub port: u16,
}

impl Default for MonitorAddr {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 4002,
        }
    }
}

impl MonitorAddr {
    /// `host:port`, suitable for DNS lookup.
    #[must_use]
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Job launcher settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct JobProperties {
    /// Interpreter command line, split shell-style (`"python3 -u"` works).
    pub launcher: String,
    /// Script handed to the launcher before `--code`/`--id`.
    pub exec_path: PathBuf,
}

impl Default for JobProperties {
    fn default() -> Self {
        Self {
            launcher: "python".into(),
            exec_path: PathBuf::from("exec.py"),
        }
    }
}

/// Built-in telemetry frame decoders.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecoderKind {
    /// Relay each frame as opaque base64.
    #[default]
    Raw,
    /// Frames are already JSON `{header, data}` messages.
    Json,
}

/// Agent tunables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AgentProperties {
    /// Local telemetry listen address.
    pub mavlink: String,
    /// Remote monitor endpoint.
    pub monitor: MonitorAddr,
    /// Path of the drone config store.
    pub config: PathBuf,
    /// Session tick period.
    pub tick_interval_secs: f64,
    /// Consecutive silent ticks tolerated before the session is dropped.
    pub liveness_threshold: u32,
    /// Pause between a fault and the next initialisation.
    pub restart_backoff_secs: f64,
    /// Give up after this many consecutive restarts. `None` retries forever.
    pub restart_limit: Option<u32>,
    pub job: JobProperties,
    pub decoder: DecoderKind,
    /// Buffered job events between the job supervisor and the uplink.
    pub job_channel_capacity: usize,
}

impl Default for AgentProperties {
    fn default() -> Self {
        Self {
            mavlink: "127.0.0.1:14550".into(),
            monitor: MonitorAddr::default(),
            config: PathBuf::from("config.json"),
            tick_interval_secs: 1.0,
            liveness_threshold: 5,
            restart_backoff_secs: 10.0,
            restart_limit: None,
            job: JobProperties::default(),
            decoder: DecoderKind::default(),
            job_channel_capacity: 256,
        }
    }
}

impl AgentProperties {
    /// Loads properties from a JSON file.
    ///
    /// A missing file yields the defaults.
    ///
    /// # Errors
    /// Returns error if the file exists but cannot be read, parsed or validated.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            info!(path = %path.display(), "Properties file not found, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let props: Self = serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        props.validate()?;

        info!(path = %path.display(), "Properties loaded");
        Ok(props)
    }

    /// Checks value ranges.
    ///
    /// # Errors
    /// Returns every problem found, joined into one message.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if self.monitor.host.trim().is_empty() {
            errors.push("monitor.host must not be empty".to_string());
        }
        if self.monitor.port == 0 {
            errors.push("monitor.port must not be 0".to_string());
        }
        if !(0.01..=60.0).contains(&self.tick_interval_secs) {
            errors.push(format!(
                "tickIntervalSecs out of range: {} (0.01-60)",
                self.tick_interval_secs
            ));
        }
        if self.liveness_threshold == 0 {
            errors.push("livenessThreshold must be at least 1".to_string());
        }
        if !(0.0..=3600.0).contains(&self.restart_backoff_secs) {
            errors.push(format!(
                "restartBackoffSecs out of range: {} (0-3600)",
                self.restart_backoff_secs
            ));
        }
        if self.job.launcher.trim().is_empty() {
            errors.push("job.launcher must not be empty".to_string());
        }
        if self.job_channel_capacity == 0 {
            errors.push("jobChannelCapacity must be at least 1".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(errors.join("; ")))
        }
    }

    #[must_use]
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs_f64(self.tick_interval_secs)
    }

    #[must_use]
    pub fn restart_backoff(&self) -> Duration {
        Duration::from_secs_f64(self.restart_backoff_secs)
    }
}

/// Contents of the drone config store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DroneConfig {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub serial_id: String,
    /// Metadata assigned by the monitor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drone: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_flight_cnt: Option<u64>,
    /// Fields this agent does not interpret, preserved on rewrite.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Credentials offered while the session is unbound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub email: String,
    pub password: String,
    pub serial_id: String,
}

/// Read-through cache over `config.json`.
pub struct ConfigStore {
    path: PathBuf,
    doc: RwLock<DroneConfig>,
}

impl ConfigStore {
    /// Opens the store, reading the file once.
    ///
    /// # Errors
    /// Returns error if the file is missing, unreadable or not valid JSON.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let doc = read_drone_config(&path)?;
        info!(path = %path.display(), serial_id = %doc.serial_id, "Drone config loaded");
        Ok(Self {
            path,
            doc: RwLock::new(doc),
        })
    }

    /// Current credentials.
    ///
    /// # Errors
    /// Returns error if the cache lock is poisoned.
    pub fn credentials(&self) -> Result<Credentials, ConfigError> {
        let doc = self.doc.read().map_err(|_| ConfigError::Poisoned)?;
        Ok(Credentials {
            email: doc.email.clone(),
            password: doc.password.clone(),
            serial_id: doc.serial_id.clone(),
        })
    }

    /// Persists drone metadata pushed by the monitor.
    ///
    /// The file is re-read first so edits made by other tools survive.
    /// Writing identical metadata is a no-op.
    ///
    /// # Errors
    /// Returns error if the file cannot be read, parsed or written.
    pub fn update_drone(&self, drone: Value) -> Result<(), ConfigError> {
        let mut doc = self.doc.write().map_err(|_| ConfigError::Poisoned)?;

        let mut fresh = read_drone_config(&self.path)?;
        if fresh.drone.as_ref() == Some(&drone) {
            debug!("Drone metadata unchanged");
            *doc = fresh;
            return Ok(());
        }

        fresh.drone = Some(drone);
        let content = serde_json::to_string_pretty(&fresh).map_err(|source| ConfigError::Parse {
            path: self.path.clone(),
            source,
        })?;
        std::fs::write(&self.path, content).map_err(|source| ConfigError::Write {
            path: self.path.clone(),
            source,
        })?;

        info!(path = %self.path.display(), "Drone metadata updated");
        *doc = fresh;
        Ok(())
    }
}

fn read_drone_config(path: &Path) -> Result<DroneConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tokio_test::{assert_err, assert_ok};

    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("dslink-{}-{name}", uuid::Uuid::new_v4()))
    }

    #[test]
    fn default_properties_are_valid() {
        assert_ok!(AgentProperties::default().validate());
    }

    #[test]
    fn partial_properties_use_defaults() {
        let props: AgentProperties =
            serde_json::from_value(json!({"monitor": {"host": "monitor.example.com"}})).unwrap();
        assert_eq!(props.monitor.host, "monitor.example.com");
        assert_eq!(props.monitor.port, 4002);
        assert_eq!(props.liveness_threshold, 5);
        assert_eq!(props.restart_backoff(), Duration::from_secs(10));
        assert_eq!(props.job.launcher, "python");
    }

    #[test]
    fn validation_collects_all_problems() {
        let props = AgentProperties {
            tick_interval_secs: 0.0,
            liveness_threshold: 0,
            ..AgentProperties::default()
        };
        let err = assert_err!(props.validate());
        let msg = err.to_string();
        assert!(msg.contains("tickIntervalSecs"));
        assert!(msg.contains("livenessThreshold"));
    }

    #[test]
    fn missing_properties_file_means_defaults() {
        let props = assert_ok!(AgentProperties::load(&temp_path("absent.json")));
        assert_eq!(props, AgentProperties::default());
    }

    #[test]
    fn unparsable_properties_file_is_an_error() {
        let path = temp_path("props.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            AgentProperties::load(&path),
            Err(ConfigError::Parse { .. })
        ));
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn missing_config_store_is_an_error() {
        assert!(matches!(
            ConfigStore::open(temp_path("config.json")),
            Err(ConfigError::Read { .. })
        ));
    }

    #[test]
    fn update_drone_rewrites_file_and_keeps_unknown_fields() {
        let path = temp_path("config.json");
        std::fs::write(
            &path,
            r#"{"email":"a@b.c","password":"pw","serialId":"1-rust","tempFlightCnt":3,"wifi":"on"}"#,
        )
        .unwrap();

        let store = assert_ok!(ConfigStore::open(&path));
        assert_eq!(assert_ok!(store.credentials()).serial_id, "1-rust");
        assert_ok!(store.update_drone(json!({"name": "hexa", "id": 7})));

        let on_disk: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(on_disk["drone"], json!({"name": "hexa", "id": 7}));
        assert_eq!(on_disk["wifi"], "on");
        assert_eq!(on_disk["tempFlightCnt"], 3);
        assert_eq!(on_disk["serialId"], "1-rust");

        let _ = std::fs::remove_file(path);
    }
}
