//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase", default)]` so a partial
//! JSON file only needs the keys it overrides.

use std::path::PathBuf;
use std::time::Duration;

use courier_core::LogFormat;
use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings type.
///
/// # JSON Format
///
/// ```json
/// {
///   "messaging": { "rateLimit": 20, "rateWindowSecs": 60 },
///   "logging": { "level": "debug", "format": "json" }
/// }
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CourierSettings {
    /// Settings schema version.
    pub version: String,
    /// Application name.
    pub name: String,
    /// Outgoing message throttling.
    pub messaging: MessagingSettings,
    /// Where conversation trees are persisted.
    pub storage: StorageSettings,
    /// Log output.
    pub logging: LoggingSettings,
    /// Agent session limits.
    pub sessions: SessionSettings,
}

impl Default for CourierSettings {
    fn default() -> Self {
        Self {
            version: "0.1.0".to_string(),
            name: "courier".to_string(),
            messaging: MessagingSettings::default(),
            storage: StorageSettings::default(),
            logging: LoggingSettings::default(),
            sessions: SessionSettings::default(),
        }
    }
}

impl CourierSettings {
    /// Reject values the rest of the system cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.messaging.rate_limit == 0 {
            return Err(SettingsError::InvalidValue(
                "messaging.rateLimit must be at least 1".into(),
            ));
        }
        if !(self.messaging.rate_window_secs.is_finite() && self.messaging.rate_window_secs > 0.0) {
            return Err(SettingsError::InvalidValue(format!(
                "messaging.rateWindowSecs must be positive, got {}",
                self.messaging.rate_window_secs
            )));
        }
        if self.sessions.max_sessions == 0 {
            return Err(SettingsError::InvalidValue(
                "sessions.maxSessions must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Outgoing message throttling.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MessagingSettings {
    /// Maximum dispatches per window.
    pub rate_limit: u32,
    /// Window length in seconds.
    pub rate_window_secs: f64,
    /// Pause applied when a throttle error carries no explicit wait.
    pub default_flood_wait_secs: u64,
}

impl Default for MessagingSettings {
    fn default() -> Self {
        Self {
            rate_limit: 1,
            rate_window_secs: 2.0,
            default_flood_wait_secs: 30,
        }
    }
}

impl MessagingSettings {
    /// Window length as a [`Duration`].
    pub fn rate_window(&self) -> Duration {
        Duration::from_secs_f64(self.rate_window_secs.max(0.001))
    }

    /// Default flood wait as a [`Duration`].
    pub fn default_flood_wait(&self) -> Duration {
        Duration::from_secs(self.default_flood_wait_secs)
    }
}

/// Persistence locations.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StorageSettings {
    /// Directory for all persisted state.
    pub data_dir: String,
    /// File name, inside `data_dir`, of the tree snapshot.
    pub trees_file: String,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir().to_string_lossy().into_owned(),
            trees_file: "trees.json".to_string(),
        }
    }
}

impl StorageSettings {
    /// Full path of the tree snapshot file.
    pub fn trees_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join(&self.trees_file)
    }
}

/// Log output.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter directive; `RUST_LOG` wins when set.
    pub level: String,
    /// Output format.
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Compact,
        }
    }
}

/// Agent session limits.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionSettings {
    /// Maximum concurrently running agent sessions.
    pub max_sessions: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self { max_sessions: 10 }
    }
}

/// `~/.courier`, or `/tmp/.courier` when `HOME` is unset.
pub fn default_data_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".courier")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_fills_defaults() {
        let json = r#"{"messaging": {"rateLimit": 20}}"#;
        let settings: CourierSettings = serde_json::from_str(json).unwrap();
        assert_eq!(settings.messaging.rate_limit, 20);
        assert!((settings.messaging.rate_window_secs - 2.0).abs() < f64::EPSILON);
        assert_eq!(settings.storage.trees_file, "trees.json");
    }

    #[test]
    fn serializes_camel_case() {
        let json = serde_json::to_value(CourierSettings::default()).unwrap();
        assert_eq!(json["messaging"]["rateWindowSecs"], 2.0);
        assert_eq!(json["messaging"]["defaultFloodWaitSecs"], 30);
        assert_eq!(json["logging"]["format"], "compact");
        assert_eq!(json["sessions"]["maxSessions"], 10);
    }

    #[test]
    fn durations() {
        let m = MessagingSettings {
            rate_window_secs: 0.5,
            default_flood_wait_secs: 7,
            ..Default::default()
        };
        assert_eq!(m.rate_window(), Duration::from_millis(500));
        assert_eq!(m.default_flood_wait(), Duration::from_secs(7));
    }

    #[test]
    fn trees_path_joins_dir_and_file() {
        let storage = StorageSettings {
            data_dir: "/var/lib/courier".into(),
            trees_file: "t.json".into(),
        };
        assert_eq!(storage.trees_path(), PathBuf::from("/var/lib/courier/t.json"));
    }

    #[test]
    fn validate_rejects_zero_rate() {
        let mut settings = CourierSettings::default();
        settings.messaging.rate_limit = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn validate_rejects_non_positive_window() {
        let mut settings = CourierSettings::default();
        settings.messaging.rate_window_secs = 0.0;
        assert!(settings.validate().is_err());
        settings.messaging.rate_window_secs = f64::NAN;
        assert!(settings.validate().is_err());
    }
}
