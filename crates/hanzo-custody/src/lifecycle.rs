//! Creation and destruction of keys, metadata and secret bytes together

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::audit::{AuditLog, AuditOperation};
use crate::error::Result;
use crate::persistence::MetadataStore;
use crate::registry::KeyRegistry;
use crate::store::SecureByteStore;
use crate::types::{generate_key_id, KeyRecord};

pub struct KeyLifecycleManager {
    registry: Arc<KeyRegistry>,
    store: Arc<dyn SecureByteStore>,
    metadata: Option<Arc<dyn MetadataStore>>,
    persist_on_write: bool,
    audit: Arc<AuditLog>,
}

impl KeyLifecycleManager {
    pub fn new(registry: Arc<KeyRegistry>, store: Arc<dyn SecureByteStore>) -> Self {
        Self {
            registry,
            store,
            metadata: None,
            persist_on_write: false,
            audit: Arc::new(AuditLog::default()),
        }
    }

    /// Write the record sequence to `metadata`, after every change when
    /// `persist_on_write` is set and otherwise only on [`persist`](Self::persist)
    pub fn with_metadata(mut self, metadata: Arc<dyn MetadataStore>, persist_on_write: bool) -> Self {
        self.metadata = Some(metadata);
        self.persist_on_write = persist_on_write;
        self
    }

    pub fn with_audit(mut self, audit: Arc<AuditLog>) -> Self {
        self.audit = audit;
        self
    }

    /// Store `secret` and publish `record`, returning the finalized record.
    ///
    /// Assigns an id when the record has none, derives the storage handle
    /// and stamps `created_at`. The secret is written before the record
    /// becomes visible in the registry; a failed write leaves the registry
    /// untouched.
    ///
    /// A live record already holding the same storage handle is replaced:
    /// an id-less record takes over its id, otherwise the old record is
    /// dropped from the registry.
    pub async fn save_key(&self, mut record: KeyRecord, secret: &[u8]) -> Result<KeyRecord> {
        if record.id.is_empty() {
            let handle = KeyRecord::storage_key_for(&record.key_type, &record.public_key, "");
            record.id = match self.registry.find_by_storage_key(&handle) {
                Some(owner) if !record.public_key.is_empty() => owner.id,
                _ => generate_key_id(),
            };
        }

        let storage_key = KeyRecord::storage_key_for(&record.key_type, &record.public_key, &record.id);
        let owner = self.registry.find_by_storage_key(&storage_key);
        record.private_data_storage_key = Some(storage_key.clone());
        record.created_at = Utc::now();

        if let Err(e) = self.store.set(&storage_key, secret).await {
            self.audit
                .record(AuditOperation::Create, &record.id, None, false);
            return Err(e);
        }

        if let Some(owner) = owner.filter(|owner| owner.id != record.id) {
            self.registry.remove_key(&owner.id);
            info!(key_id = %owner.id, replaced_by = %record.id, "Key replaced under shared storage handle");
        }

        self.registry.add_key(record.clone());
        info!(key_id = %record.id, key_type = %record.key_type, storage_key = %storage_key, "Saved key");

        reap_evicted(&self.registry, self.store.as_ref(), &self.audit).await;
        self.persist_if_enabled().await;
        self.audit
            .record(AuditOperation::Create, &record.id, None, true);

        Ok(record)
    }

    /// Remove a key's secret bytes and its record. Unknown ids are ignored
    /// without touching the store; an expired id only has its secret bytes
    /// reaped.
    pub async fn delete_key(&self, id: &str) -> Result<()> {
        let Some(record) = self.registry.get_key(id) else {
            debug!(key_id = id, "Delete of unknown key ignored");
            if reap_evicted(&self.registry, self.store.as_ref(), &self.audit).await > 0 {
                self.persist_if_enabled().await;
            }
            return Ok(());
        };

        if let Some(ref storage_key) = record.private_data_storage_key {
            self.store.remove(storage_key).await?;
        }
        self.registry.remove_key(id);
        info!(key_id = id, "Deleted key");

        self.persist_if_enabled().await;
        self.audit.record(AuditOperation::Delete, id, None, true);

        Ok(())
    }

    /// Drop every expired record together with its secret bytes, including
    /// records already evicted by lookups. Returns the number purged.
    ///
    /// Records whose secret bytes could not be removed stay queued and are
    /// retried on the next purge.
    pub async fn purge_expired(&self) -> Result<usize> {
        for record in self.registry.sweep_expired() {
            self.registry.requeue_evicted(record);
        }

        let purged = reap_evicted(&self.registry, self.store.as_ref(), &self.audit).await;
        if purged > 0 {
            info!(count = purged, "Purged expired keys");
            self.persist_if_enabled().await;
        }

        Ok(purged)
    }

    /// Live records ordered by creation time
    pub fn list_keys(&self) -> Vec<KeyRecord> {
        self.registry.list_keys()
    }

    /// Write the current record sequence to the metadata store, if any
    pub async fn persist(&self) -> Result<()> {
        if let Some(ref metadata) = self.metadata {
            metadata.save(&self.registry.snapshot()).await?;
            debug!(count = self.registry.len(), "Persisted key metadata");
        }
        Ok(())
    }

    // The registry stays authoritative when a write fails; the next write
    // stores the full snapshot again.
    async fn persist_if_enabled(&self) {
        if !self.persist_on_write {
            return;
        }
        if let Err(e) = self.persist().await {
            warn!(error = %e, "Key metadata not persisted");
        }
    }
}

/// Remove the secret bytes of records evicted by expiry. A handle that a
/// live record owns again is left alone. Returns the number of records
/// reaped; failures are logged and requeued.
pub(crate) async fn reap_evicted(
    registry: &KeyRegistry,
    store: &dyn SecureByteStore,
    audit: &AuditLog,
) -> usize {
    let mut reaped = 0;

    for record in registry.drain_evicted() {
        if let Some(ref storage_key) = record.private_data_storage_key {
            if registry.find_by_storage_key(storage_key).is_none() {
                if let Err(e) = store.remove(storage_key).await {
                    warn!(key_id = %record.id, error = %e, "Could not remove secret of expired key");
                    registry.requeue_evicted(record);
                    continue;
                }
            }
        }

        debug!(key_id = %record.id, "Reaped expired key");
        audit.record(AuditOperation::Expire, &record.id, None, true);
        reaped += 1;
    }

    reaped
}
