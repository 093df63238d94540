//! Configuration loading and management.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::db::import::ConflictMode;
use crate::db::import::writer::DEFAULT_BATCH_SIZE;

/// Config file looked up in the working directory when none is given.
pub const DEFAULT_CONFIG_FILE: &str = "chat-import.yaml";

/// Importer configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub import: ImportConfig,
}

/// Store location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from(".chat-import/store.db")
}

/// Import defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportConfig {
    /// Rows per insert statement.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Conflict mode used when `--mode` is not given.
    #[serde(default)]
    pub default_mode: ConflictMode,

    /// Owner used when `--owner` is not given.
    #[serde(default)]
    pub owner: Option<String>,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            default_mode: ConflictMode::default(),
            owner: None,
        }
    }
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

impl Config {
    /// Load configuration from file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("invalid config {}", path.display()))?;
        Ok(config)
    }

    /// Load the given file, else `chat-import.yaml` if present, else defaults;
    /// then apply environment overrides.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::load(path)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => Self::load(DEFAULT_CONFIG_FILE)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Apply `CHAT_IMPORT_*` overrides read through `var`.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(db_path) = var("CHAT_IMPORT_DB_PATH") {
            self.database.path = PathBuf::from(db_path);
        }

        if let Some(size) = var("CHAT_IMPORT_BATCH_SIZE") {
            if let Ok(size) = size.parse::<usize>() {
                if size > 0 {
                    self.import.batch_size = size;
                }
            }
        }

        if let Some(owner) = var("CHAT_IMPORT_OWNER") {
            if !owner.trim().is_empty() {
                self.import.owner = Some(owner);
            }
        }
    }

    /// Ensure the database directory exists.
    pub fn ensure_db_dir(&self) -> Result<()> {
        if let Some(parent) = self.database.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(())
    }
}
