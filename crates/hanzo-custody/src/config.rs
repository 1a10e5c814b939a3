//! Configuration for Hanzo Custody

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{CustodyError, Result};

/// Main configuration for a custody instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CustodyConfig {
    /// Where secret bytes live
    pub store: StoreBackend,
    /// Key metadata persistence
    pub metadata: MetadataConfig,
    /// Seed derivation for `execute_with_seed`
    pub seed: SeedDerivation,
    /// Audit trail
    pub audit: AuditConfig,
}

impl CustodyConfig {
    /// Everything in memory, nothing persisted
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Secrets and metadata under one directory
    pub fn on_disk(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            store: StoreBackend::File {
                path: dir.join("secrets"),
            },
            metadata: MetadataConfig {
                path: Some(dir.join("keys.json")),
                persist_on_write: true,
            },
            ..Default::default()
        }
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|e| CustodyError::Config(e.to_string()))
    }

    /// Load config from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let contents = fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&contents)
    }

    /// Save config as TOML, creating parent directories
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let contents =
            toml::to_string_pretty(self).map_err(|e| CustodyError::Config(e.to_string()))?;
        fs::write(path, contents)?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreBackend {
    #[default]
    Memory,
    File { path: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct MetadataConfig {
    /// JSON file holding the record sequence; `None` keeps metadata in memory
    pub path: Option<PathBuf>,
    /// Write the record sequence after every save or delete
    pub persist_on_write: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SeedDerivation {
    /// Private key bytes are the seed
    #[default]
    Raw,
    Blake3 { context: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    pub enabled: bool,
    /// Oldest entries are dropped past this count
    pub max_entries: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: 10_000,
        }
    }
}
