//! Durable storage for key metadata.
//!
//! Only [`KeyRecord`] sequences are written here. Secret bytes go through
//! [`SecureByteStore`](crate::store::SecureByteStore) and never reach this
//! layer.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::{CustodyError, Result};
use crate::types::KeyRecord;

#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Stored record sequence; empty when nothing usable is stored
    async fn load(&self) -> Result<Vec<KeyRecord>>;

    /// Replace the stored sequence
    async fn save(&self, records: &[KeyRecord]) -> Result<()>;
}

/// Record sequence as a JSON array in a single file
pub struct JsonFileMetadataStore {
    path: PathBuf,
}

impl JsonFileMetadataStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl MetadataStore for JsonFileMetadataStore {
    async fn load(&self) -> Result<Vec<KeyRecord>> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        // A damaged file must not keep the service from starting
        match serde_json::from_str::<Vec<KeyRecord>>(&contents) {
            Ok(records) => {
                debug!(count = records.len(), path = %self.path.display(), "Loaded key metadata");
                Ok(records)
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Key metadata unreadable, starting empty");
                Ok(Vec::new())
            }
        }
    }

    async fn save(&self, records: &[KeyRecord]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let json = serde_json::to_vec_pretty(records)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| CustodyError::Persistence(format!("{}: {}", self.path.display(), e)))?;

        Ok(())
    }
}

/// Keeps the last saved sequence in memory
#[derive(Default)]
pub struct MemoryMetadataStore {
    records: RwLock<Vec<KeyRecord>>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: Vec<KeyRecord>) -> Self {
        Self {
            records: RwLock::new(records),
        }
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn load(&self) -> Result<Vec<KeyRecord>> {
        Ok(self.records.read().await.clone())
    }

    async fn save(&self, records: &[KeyRecord]) -> Result<()> {
        *self.records.write().await = records.to_vec();
        Ok(())
    }
}
