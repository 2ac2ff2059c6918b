use std::path::Path;
use std::time::Duration;

use advlock::LockPolicy;
use manio::ManifestOptions;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("configuration error: {0}")]
    Invalid(String),
}

fn default_max_attempts() -> u32 {
    1800
}

fn default_interval_secs() -> u64 {
    2
}

fn default_report_every_secs() -> u64 {
    10
}

fn default_holder_name() -> String {
    advlock::program_name()
}

fn default_entries_per_chunk() -> usize {
    1
}

fn default_sync() -> bool {
    true
}

/// How the global sparse index lock is waited for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Seconds between "still waiting" warnings.
    #[serde(default = "default_report_every_secs")]
    pub report_every_secs: u64,
    /// Recorded in the lock file so a stuck holder can be identified.
    #[serde(default = "default_holder_name")]
    pub holder_name: String,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            interval_secs: default_interval_secs(),
            report_every_secs: default_report_every_secs(),
            holder_name: default_holder_name(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestConfig {
    /// Entries per manifest chunk, and so per hook file.
    #[serde(default = "default_entries_per_chunk")]
    pub entries_per_chunk: usize,
    /// fsync finished chunks, hook files and sparse indexes.
    #[serde(default = "default_sync")]
    pub sync: bool,
}

impl Default for ManifestConfig {
    fn default() -> Self {
        Self {
            entries_per_chunk: default_entries_per_chunk(),
            sync: default_sync(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Phase3Config {
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub manifest: ManifestConfig,
}

impl Phase3Config {
    /// Reads and validates a YAML config file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> Result<Self, ConfigError> {
        // An empty document is all defaults.
        let config: Phase3Config = if raw.trim().is_empty() {
            Phase3Config::default()
        } else {
            serde_yaml::from_str(raw)?
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lock.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "lock.max_attempts must be at least 1".into(),
            ));
        }
        if self.manifest.entries_per_chunk == 0 {
            return Err(ConfigError::Invalid(
                "manifest.entries_per_chunk must be at least 1".into(),
            ));
        }
        if self.lock.holder_name.contains('\n') {
            return Err(ConfigError::Invalid(
                "lock.holder_name must be a single line".into(),
            ));
        }
        Ok(())
    }

    pub fn lock_policy(&self) -> LockPolicy {
        LockPolicy {
            max_attempts: self.lock.max_attempts,
            interval: Duration::from_secs(self.lock.interval_secs),
            report_every: Duration::from_secs(self.lock.report_every_secs),
            holder_name: self.lock.holder_name.clone(),
        }
    }

    pub fn manifest_options(&self) -> ManifestOptions {
        ManifestOptions {
            entries_per_chunk: self.manifest.entries_per_chunk,
            sync: self.manifest.sync,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_policy() {
        let config = Phase3Config::default();
        let policy = config.lock_policy();
        assert_eq!(policy.max_attempts, 1800);
        assert_eq!(policy.interval, Duration::from_secs(2));
        assert_eq!(policy.report_every, Duration::from_secs(10));
        assert_eq!(config.manifest_options().entries_per_chunk, 1);
        assert!(config.manifest_options().sync);
    }

    #[test]
    fn partial_yaml_keeps_other_defaults() -> Result<(), ConfigError> {
        let config = Phase3Config::from_yaml(
            "lock:\n  max_attempts: 5\n  holder_name: nightly\nmanifest:\n  sync: false\n",
        )?;
        assert_eq!(config.lock.max_attempts, 5);
        assert_eq!(config.lock.interval_secs, 2);
        assert_eq!(config.lock.holder_name, "nightly");
        assert_eq!(config.manifest.entries_per_chunk, 1);
        assert!(!config.manifest.sync);
        Ok(())
    }

    #[test]
    fn empty_document_is_default() -> Result<(), ConfigError> {
        assert_eq!(Phase3Config::from_yaml("")?, Phase3Config::default());
        assert_eq!(Phase3Config::from_yaml("{}")?, Phase3Config::default());
        Ok(())
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(matches!(
            Phase3Config::from_yaml("lock:\n  max_attempts: 0\n"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            Phase3Config::from_yaml("manifest:\n  entries_per_chunk: 0\n"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            Phase3Config::from_yaml("lock: [1, 2]\n"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn load_reports_missing_file() {
        let err = Phase3Config::load("/nonexistent/phase3.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
