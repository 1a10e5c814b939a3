//! # Hanzo Custody
//!
//! Key custody core for Hanzo wallets and agents: tracks key metadata,
//! decides which domains may touch private material, and lends secret bytes
//! to callers for the duration of a single handler only.
//!
//! - **KeyRegistry**: in-memory catalog of [`KeyRecord`]s with lazy expiry
//! - **AccessGate**: per-domain permission checks against a record's ACL
//! - **KeyCustodian**: scoped access to private keys and seeds, wiped after use
//! - **KeyLifecycleManager**: saves and deletes metadata and secrets together
//! - **MetadataStore**: persists records (never secrets) across restarts
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use hanzo_custody::{CustodyConfig, KeyCustody, KeyRecord, KeyType};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let custody = KeyCustody::from_config(CustodyConfig::on_disk("/var/lib/hanzo/custody")).await?;
//!
//!     let record = custody
//!         .lifecycle()
//!         .save_key(KeyRecord::new(KeyType::hd_wallet_derived(), "02ab..."), &[7u8; 32])
//!         .await?;
//!
//!     let len = custody
//!         .custodian()
//!         .execute_with_key(&record.id, "wallet", |key| {
//!             Box::pin(async move { Ok(key.len()) })
//!         })
//!         .await?;
//!     println!("signed with a {}-byte key", len);
//!
//!     Ok(())
//! }
//! ```

pub mod access;
pub mod audit;
pub mod config;
pub mod custodian;
pub mod error;
pub mod lifecycle;
pub mod persistence;
pub mod registry;
pub mod seed;
pub mod store;
pub mod types;

use std::sync::Arc;

use tracing::info;

pub use access::AccessGate;
pub use audit::{AuditEntry, AuditFilter, AuditLog, AuditOperation};
pub use config::{AuditConfig, CustodyConfig, MetadataConfig, SeedDerivation, StoreBackend};
pub use custodian::{HandlerFuture, KeyCustodian};
pub use error::{CustodyError, Result};
pub use lifecycle::KeyLifecycleManager;
pub use persistence::{JsonFileMetadataStore, MemoryMetadataStore, MetadataStore};
pub use registry::KeyRegistry;
pub use seed::{Blake3Seed, RawSeed, Seed, SeedDeriver};
pub use store::{FileByteStore, MemoryByteStore, SecureByteStore};
pub use types::*;

/// Registry, custodian and lifecycle manager wired over one store
pub struct KeyCustody {
    registry: Arc<KeyRegistry>,
    custodian: KeyCustodian,
    lifecycle: KeyLifecycleManager,
    audit: Arc<AuditLog>,
}

impl KeyCustody {
    /// Build every component from `config`, rehydrating the registry from
    /// the metadata file when one is configured. Records that expired while
    /// the process was down are purged along with their secrets.
    pub async fn from_config(config: CustodyConfig) -> Result<Self> {
        let store: Arc<dyn SecureByteStore> = match config.store {
            StoreBackend::Memory => Arc::new(MemoryByteStore::new()),
            StoreBackend::File { ref path } => Arc::new(FileByteStore::new(path)),
        };

        let metadata: Arc<dyn MetadataStore> = match config.metadata.path {
            Some(ref path) => Arc::new(JsonFileMetadataStore::new(path)),
            None => Arc::new(MemoryMetadataStore::new()),
        };

        let seed_deriver: Arc<dyn SeedDeriver> = match config.seed {
            SeedDerivation::Raw => Arc::new(RawSeed),
            SeedDerivation::Blake3 { ref context } => Arc::new(Blake3Seed::new(context.clone())),
        };

        let registry = Arc::new(KeyRegistry::load_from(metadata.as_ref()).await?);
        let audit = Arc::new(AuditLog::new(config.audit.clone()));

        info!(
            keys = registry.len(),
            store = ?config.store,
            metadata = ?config.metadata.path,
            "Key custody ready"
        );

        let custody = Self::new(registry, store, metadata, seed_deriver, audit, config.metadata.persist_on_write);
        custody.lifecycle.purge_expired().await?;
        Ok(custody)
    }

    pub fn new(
        registry: Arc<KeyRegistry>,
        store: Arc<dyn SecureByteStore>,
        metadata: Arc<dyn MetadataStore>,
        seed_deriver: Arc<dyn SeedDeriver>,
        audit: Arc<AuditLog>,
        persist_on_write: bool,
    ) -> Self {
        let custodian = KeyCustodian::new(registry.clone(), store.clone())
            .with_seed_deriver(seed_deriver)
            .with_audit(audit.clone());
        let lifecycle = KeyLifecycleManager::new(registry.clone(), store)
            .with_metadata(metadata, persist_on_write)
            .with_audit(audit.clone());

        Self {
            registry,
            custodian,
            lifecycle,
            audit,
        }
    }

    pub fn registry(&self) -> &KeyRegistry {
        &self.registry
    }

    pub fn custodian(&self) -> &KeyCustodian {
        &self.custodian
    }

    pub fn lifecycle(&self) -> &KeyLifecycleManager {
        &self.lifecycle
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }
}

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::access::AccessGate;
    pub use crate::config::CustodyConfig;
    pub use crate::custodian::KeyCustodian;
    pub use crate::error::{CustodyError, Result};
    pub use crate::lifecycle::KeyLifecycleManager;
    pub use crate::registry::KeyRegistry;
    pub use crate::store::SecureByteStore;
    pub use crate::types::*;
    pub use crate::KeyCustody;
}
