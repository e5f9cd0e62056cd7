//! Configuration schema (bqlink.toml)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Key file expected inside the credentials directory
pub const DEFAULT_KEY_FILE: &str = "keyfile.json";

/// Job polling settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSettings {
    /// Delay between job status polls
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_poll_interval_ms() -> u64 {
    1000
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

/// Streaming insert settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InsertSettings {
    /// Maximum rows per insert request
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Insert the valid rows of a request even if some rows are rejected
    #[serde(default)]
    pub skip_invalid_rows: bool,

    /// Accept row fields that are not in the table schema
    #[serde(default)]
    pub ignore_unknown_values: bool,
}

fn default_batch_size() -> usize {
    500
}

impl Default for InsertSettings {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            skip_invalid_rows: false,
            ignore_unknown_values: false,
        }
    }
}

/// CSV load job settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadSettings {
    /// Accept rows that are missing trailing optional columns
    #[serde(default = "default_true")]
    pub allow_jagged_rows: bool,

    /// Number of leading rows to skip (e.g. a header)
    #[serde(default)]
    pub skip_leading_rows: u32,

    #[serde(default = "default_delimiter")]
    pub field_delimiter: String,
}

impl Default for LoadSettings {
    fn default() -> Self {
        Self {
            allow_jagged_rows: true,
            skip_leading_rows: 0,
            field_delimiter: default_delimiter(),
        }
    }
}

/// CSV extract job settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractSettings {
    #[serde(default = "default_delimiter")]
    pub field_delimiter: String,

    /// Write a header row
    #[serde(default)]
    pub print_header: bool,
}

impl Default for ExtractSettings {
    fn default() -> Self {
        Self {
            field_delimiter: default_delimiter(),
            print_header: false,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_delimiter() -> String {
    ",".to_string()
}

fn default_key_file() -> String {
    DEFAULT_KEY_FILE.to_string()
}

/// Main configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectorConfig {
    /// Warehouse project id
    pub project_id: String,

    /// Directory holding the service account key file
    #[serde(default)]
    pub credentials_dir: Option<PathBuf>,

    /// Key file name inside `credentials_dir`
    #[serde(default = "default_key_file")]
    pub key_file: String,

    /// Location for new datasets and for job lookups (e.g. "US", "EU")
    #[serde(default)]
    pub location: Option<String>,

    #[serde(default)]
    pub job: JobSettings,

    #[serde(default)]
    pub insert: InsertSettings,

    #[serde(default)]
    pub load: LoadSettings,

    #[serde(default)]
    pub extract: ExtractSettings,
}

impl ConnectorConfig {
    /// Create a config with default settings
    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            credentials_dir: None,
            key_file: default_key_file(),
            location: None,
            job: JobSettings::default(),
            insert: InsertSettings::default(),
            load: LoadSettings::default(),
            extract: ExtractSettings::default(),
        }
    }

    /// Set the credentials directory
    pub fn with_credentials_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.credentials_dir = Some(dir.into());
        self
    }

    /// Set the location
    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    /// Full path of the key file, if a credentials directory is configured
    pub fn key_path(&self) -> Option<PathBuf> {
        self.credentials_dir
            .as_ref()
            .map(|dir| dir.join(&self.key_file))
    }

    /// Load config from TOML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(e.to_string()))?;

        let mut config = Self::from_toml(&contents)?;

        // Relative credential paths are relative to the config file
        if let (Some(dir), Some(parent)) = (&config.credentials_dir, path.parent()) {
            if dir.is_relative() {
                config.credentials_dir = Some(parent.join(dir));
            }
        }

        Ok(config)
    }

    /// Load config from TOML string
    pub fn from_toml(toml: &str) -> Result<Self, ConfigError> {
        let config: ConnectorConfig = toml::from_str(toml)
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to TOML file
    pub fn save_to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let toml = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        std::fs::write(path, toml)
            .map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }

    /// Check settings that the warehouse would otherwise reject late
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.project_id.trim().is_empty() {
            return Err(ConfigError::Invalid("project_id must not be empty".to_string()));
        }
        if self.key_file.trim().is_empty() {
            return Err(ConfigError::Invalid("key_file must not be empty".to_string()));
        }
        if !(1..=10_000).contains(&self.insert.batch_size) {
            return Err(ConfigError::Invalid(format!(
                "insert.batch_size must be between 1 and 10000, got {}",
                self.insert.batch_size
            )));
        }
        if self.job.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("job.poll_interval_ms must be positive".to_string()));
        }
        for (name, delimiter) in [
            ("load.field_delimiter", &self.load.field_delimiter),
            ("extract.field_delimiter", &self.extract.field_delimiter),
        ] {
            if delimiter.len() != 1 {
                return Err(ConfigError::Invalid(format!(
                    "{} must be a single ASCII character, got '{}'",
                    name, delimiter
                )));
            }
        }
        Ok(())
    }
}

/// Config error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
