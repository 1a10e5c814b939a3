//! In-memory catalog of key metadata.
//!
//! The registry maps record ids to [`KeyRecord`]s and never touches secret
//! bytes. Expiration is enforced lazily: a lookup that finds an expired record
//! evicts it and reports the key as absent. Evicted records are parked in a
//! queue so the lifecycle layer can drop their secret bytes as well.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::debug;

use crate::error::Result;
use crate::persistence::MetadataStore;
use crate::types::KeyRecord;

#[derive(Debug, Default)]
pub struct KeyRegistry {
    records: DashMap<String, KeyRecord>,
    /// Records evicted by lookups, waiting for their secrets to be removed
    evicted: DashMap<String, KeyRecord>,
}

impl KeyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from a persisted record sequence
    pub fn from_records(records: impl IntoIterator<Item = KeyRecord>) -> Self {
        let registry = Self::new();
        for (id, record) in Self::rehydrate(records) {
            registry.records.insert(id, record);
        }
        registry
    }

    /// Rebuild the registry from a metadata store
    pub async fn load_from(store: &dyn MetadataStore) -> Result<Self> {
        let records = store.load().await?;
        let registry = Self::from_records(records);
        debug!(count = registry.len(), "Rehydrated key registry");
        Ok(registry)
    }

    /// Turn a stored sequence into the id mapping. A later record wins over
    /// an earlier one with the same id.
    pub fn rehydrate(records: impl IntoIterator<Item = KeyRecord>) -> HashMap<String, KeyRecord> {
        records
            .into_iter()
            .map(|record| (record.id.clone(), record))
            .collect()
    }

    /// Live record for `id`. An expired record is evicted and reported absent.
    pub fn get_key(&self, id: &str) -> Option<KeyRecord> {
        let now = Utc::now();
        let record = self.records.get(id)?.value().clone();

        if record.is_expired_at(now) {
            self.evict(id, now);
            return None;
        }

        Some(record)
    }

    /// Insert or overwrite by id
    pub fn add_key(&self, record: KeyRecord) {
        self.records.insert(record.id.clone(), record);
    }

    /// Remove the record; absent ids are ignored
    pub fn remove_key(&self, id: &str) -> Option<KeyRecord> {
        self.records.remove(id).map(|(_, record)| record)
    }

    /// Live records ordered by creation time
    pub fn list_keys(&self) -> Vec<KeyRecord> {
        let now = Utc::now();
        let mut live = Vec::with_capacity(self.records.len());
        let mut expired = Vec::new();

        for entry in self.records.iter() {
            if entry.is_expired_at(now) {
                expired.push(entry.key().clone());
            } else {
                live.push(entry.value().clone());
            }
        }

        for id in expired {
            self.evict(&id, now);
        }

        live.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        live
    }

    /// Remove every expired record now and return them
    pub fn sweep_expired(&self) -> Vec<KeyRecord> {
        let now = Utc::now();
        let expired: Vec<String> = self
            .records
            .iter()
            .filter(|entry| entry.is_expired_at(now))
            .map(|entry| entry.key().clone())
            .collect();

        expired
            .iter()
            .filter_map(|id| self.records.remove_if(id, |_, record| record.is_expired_at(now)))
            .map(|(_, record)| record)
            .collect()
    }

    /// Take the records evicted by lookups since the last drain
    pub fn drain_evicted(&self) -> Vec<KeyRecord> {
        let ids: Vec<String> = self.evicted.iter().map(|entry| entry.key().clone()).collect();
        ids.iter()
            .filter_map(|id| self.evicted.remove(id))
            .map(|(_, record)| record)
            .collect()
    }

    /// Put a record back on the eviction queue, for when removing its
    /// secret bytes failed
    pub fn requeue_evicted(&self, record: KeyRecord) {
        self.evicted.insert(record.id.clone(), record);
    }

    /// Live record whose secret bytes sit under `storage_key`
    pub fn find_by_storage_key(&self, storage_key: &str) -> Option<KeyRecord> {
        let now = Utc::now();
        self.records
            .iter()
            .find(|entry| {
                !entry.is_expired_at(now)
                    && entry.private_data_storage_key.as_deref() == Some(storage_key)
            })
            .map(|entry| entry.value().clone())
    }

    /// Every record for persistence, including evicted records whose secret
    /// bytes have not been removed yet. They rehydrate as expired and are
    /// purged again after a restart.
    pub fn snapshot(&self) -> Vec<KeyRecord> {
        let mut records: Vec<KeyRecord> =
            self.records.iter().map(|entry| entry.value().clone()).collect();
        records.extend(
            self.evicted
                .iter()
                .filter(|entry| !self.records.contains_key(entry.key()))
                .map(|entry| entry.value().clone()),
        );
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    // Only removes the entry if it is still expired, so a record written
    // under the same id in the meantime survives.
    fn evict(&self, id: &str, now: DateTime<Utc>) {
        if let Some((id, record)) = self.records.remove_if(id, |_, record| record.is_expired_at(now)) {
            debug!(key_id = %id, "Evicted expired key record");
            self.evicted.insert(id, record);
        }
    }
}
