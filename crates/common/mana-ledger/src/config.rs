use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;
use crate::streak::LinearStreakReward;
use crate::types::{Millis, MILLIS_PER_DAY};

/// Configuration for a mana ledger deployment, usually read from a TOML file.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct ManaConfig {
    /// Directory of the sled database.
    pub storage_path: PathBuf,

    /// Age in milliseconds after which a unit decays.
    pub rot_time_ms: Millis,

    /// Seconds between decay sweeps.
    pub decay_interval_secs: u64,

    /// Width of a transfer-log bucket in milliseconds.
    pub transfer_log_bucket_ms: Millis,

    /// Parameters of the default login reward curve.
    pub reward: LinearStreakReward,

    /// Optional log filter (e.g. "info", "mana_ledger=debug").
    pub log_level: Option<String>,
}

impl Default for ManaConfig {
    fn default() -> Self {
        Self {
            storage_path: PathBuf::from("data/mana"),
            rot_time_ms: 30 * MILLIS_PER_DAY,
            decay_interval_secs: 300,
            transfer_log_bucket_ms: 1_000,
            reward: LinearStreakReward::default(),
            log_level: None,
        }
    }
}

impl ManaConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&contents).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.display().to_string(),
                source,
            },
            other => other,
        })
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let config: ManaConfig = toml::from_str(contents).map_err(|source| ConfigError::Parse {
            path: "<inline>".to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rot_time_ms <= 0 {
            return Err(ConfigError::Invalid("rot_time_ms must be positive".into()));
        }
        if self.decay_interval_secs == 0 {
            return Err(ConfigError::Invalid("decay_interval_secs must be positive".into()));
        }
        if self.transfer_log_bucket_ms <= 0 {
            return Err(ConfigError::Invalid("transfer_log_bucket_ms must be positive".into()));
        }
        Ok(())
    }

    pub fn decay_interval(&self) -> Duration {
        Duration::from_secs(self.decay_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let config = ManaConfig::from_toml(
            r#"
            rot_time_ms = 60000
            [reward]
            max = 25
            "#,
        )
        .unwrap();
        assert_eq!(config.rot_time_ms, 60_000);
        assert_eq!(config.reward.max, 25);
        assert_eq!(config.reward.per_streak_day, 1);
        assert_eq!(config.decay_interval_secs, 300);
    }

    #[test]
    fn zero_bucket_is_invalid() {
        let err = ManaConfig::from_toml("transfer_log_bucket_ms = 0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }
}
