//! Runtime configuration.
//!
//! Configuration comes from a JSON document, the process environment, or
//! both: `KYROLINK_CONFIG` names a JSON file that is loaded first, then the
//! individual variables below override it.
//!
//! | Variable                    | Field             |
//! |-----------------------------|-------------------|
//! | `KYROLINK_MERGE_THRESHOLD`  | `merge_threshold` |
//! | `KYROLINK_DATA_DIR`         | `data_dir`        |
//! | `KYROLINK_SYNC_ON_WRITE`    | `sync_on_write`   |
//! | `KYROLINK_MAX_WAL_SIZE`     | `max_wal_size`    |
//! | `KYROLINK_WEIGHT_<KIND>`    | `weights[KIND]`   |
//!
//! Empty values are ignored.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::engine::MERGE_THRESHOLD;
use crate::error::ValidationError;
use crate::kind::AttributeKind;
use crate::weights::WeightTable;

const ENV_CONFIG: &str = "KYROLINK_CONFIG";
const ENV_THRESHOLD: &str = "KYROLINK_MERGE_THRESHOLD";
const ENV_DATA_DIR: &str = "KYROLINK_DATA_DIR";
const ENV_SYNC: &str = "KYROLINK_SYNC_ON_WRITE";
const ENV_MAX_WAL: &str = "KYROLINK_MAX_WAL_SIZE";
const ENV_WEIGHT_PREFIX: &str = "KYROLINK_WEIGHT_";

const DEFAULT_MAX_WAL_SIZE: u64 = 64 * 1024 * 1024;

/// Engine and storage settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LinkConfig {
    /// Score at or above which a candidate joins the incoming feature set.
    pub merge_threshold: f64,
    /// Weight overrides by kind token, applied over the built-in defaults.
    pub weights: BTreeMap<String, f64>,
    /// Data directory. `None` keeps everything in memory.
    pub data_dir: Option<PathBuf>,
    /// Fsync after every WAL append.
    pub sync_on_write: bool,
    /// WAL size that triggers compaction.
    pub max_wal_size: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            merge_threshold: MERGE_THRESHOLD,
            weights: BTreeMap::new(),
            data_dir: None,
            sync_on_write: true,
            max_wal_size: DEFAULT_MAX_WAL_SIZE,
        }
    }
}

impl LinkConfig {
    /// Parses a JSON document. Missing fields take their defaults.
    ///
    /// # Errors
    /// `InvalidConfig` for malformed JSON or unknown fields.
    pub fn from_json_str(raw: &str) -> Result<Self, ValidationError> {
        serde_json::from_str(raw).map_err(|e| ValidationError::InvalidConfig {
            reason: format!("malformed configuration: {e}"),
        })
    }

    /// Loads a JSON configuration file.
    ///
    /// # Errors
    /// `InvalidConfig` if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self, ValidationError> {
        let raw = fs::read_to_string(path).map_err(|e| ValidationError::InvalidConfig {
            reason: format!("cannot read {}: {e}", path.display()),
        })?;
        Self::from_json_str(&raw).map_err(|e| ValidationError::InvalidConfig {
            reason: format!("{}: {e}", path.display()),
        })
    }

    /// Reads the process environment.
    ///
    /// # Errors
    /// `InvalidConfig` for unparsable values.
    pub fn from_env() -> Result<Self, ValidationError> {
        Self::from_vars(std::env::vars())
    }

    /// Builds a configuration from `(name, value)` pairs laid out like the
    /// process environment. Unrelated names are ignored.
    ///
    /// # Errors
    /// `InvalidConfig` for unparsable values or an unreadable config file.
    pub fn from_vars<I, K, V>(vars: I) -> Result<Self, ValidationError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let vars: BTreeMap<String, String> = vars
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .filter(|(k, v)| k.starts_with("KYROLINK_") && !v.trim().is_empty())
            .collect();

        let mut config = match vars.get(ENV_CONFIG) {
            Some(path) => Self::from_file(Path::new(path.trim()))?,
            None => Self::default(),
        };

        if let Some(raw) = vars.get(ENV_THRESHOLD) {
            config.merge_threshold = parse_var(ENV_THRESHOLD, raw)?;
        }
        if let Some(raw) = vars.get(ENV_DATA_DIR) {
            config.data_dir = Some(PathBuf::from(raw.trim()));
        }
        if let Some(raw) = vars.get(ENV_SYNC) {
            config.sync_on_write = parse_bool(ENV_SYNC, raw)?;
        }
        if let Some(raw) = vars.get(ENV_MAX_WAL) {
            config.max_wal_size = parse_var(ENV_MAX_WAL, raw)?;
        }
        for (name, raw) in &vars {
            if let Some(token) = name.strip_prefix(ENV_WEIGHT_PREFIX) {
                let kind = AttributeKind::parse(token)?;
                config
                    .weights
                    .insert(kind.as_str().to_string(), parse_var(name, raw)?);
            }
        }
        Ok(config)
    }

    /// Checks the threshold and every weight override.
    ///
    /// # Errors
    /// `ThresholdOutOfRange`, `WeightOutOfRange`, `EmptyAttributeKind` or
    /// `InvalidConfig` for the first problem found.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !self.merge_threshold.is_finite() || self.merge_threshold <= 0.0 {
            return Err(ValidationError::ThresholdOutOfRange {
                value: self.merge_threshold,
            });
        }
        self.weight_table()?;
        #[cfg(feature = "persistent")]
        self.persistent_config().validate()?;
        Ok(())
    }

    /// The built-in weights with this configuration's overrides applied.
    ///
    /// # Errors
    /// Range errors for bad weights, `EmptyAttributeKind` for blank tokens.
    pub fn weight_table(&self) -> Result<WeightTable, ValidationError> {
        self.weights_over(WeightTable::default())
    }

    /// `base` with this configuration's overrides applied.
    ///
    /// # Errors
    /// Same as [`weight_table`](Self::weight_table).
    pub fn weights_over(&self, mut base: WeightTable) -> Result<WeightTable, ValidationError> {
        for (token, weight) in &self.weights {
            base.set(AttributeKind::parse(token)?, *weight)?;
        }
        Ok(base)
    }

    /// Settings for the durable backend.
    #[cfg(feature = "persistent")]
    #[must_use]
    pub fn persistent_config(&self) -> crate::storage::PersistentConfig {
        crate::storage::PersistentConfig {
            max_wal_size: self.max_wal_size,
            sync_on_write: self.sync_on_write,
        }
    }

    /// Logs the effective configuration.
    pub fn log_summary(&self) {
        let data_dir = self
            .data_dir
            .as_deref()
            .map_or_else(|| "(in-memory)".to_string(), |p| p.display().to_string());
        tracing::info!(
            merge_threshold = self.merge_threshold,
            data_dir = %data_dir,
            sync_on_write = self.sync_on_write,
            max_wal_size = self.max_wal_size,
            "configuration loaded"
        );
        for (kind, weight) in &self.weights {
            tracing::info!(kind = %kind, weight, "weight override");
        }
    }
}

fn parse_var<T>(name: &str, raw: &str) -> Result<T, ValidationError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e| ValidationError::InvalidConfig {
        reason: format!("{name}={raw}: {e}"),
    })
}

fn parse_bool(name: &str, raw: &str) -> Result<bool, ValidationError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ValidationError::InvalidConfig {
            reason: format!("{name}={raw}: expected a boolean"),
        }),
    }
}
