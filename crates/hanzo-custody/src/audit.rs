//! Audit trail of custody operations

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::config::AuditConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuditOperation {
    Create,
    Access,
    Delete,
    Expire,
}

/// One custody event. Carries no key material and no denial cause.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub operation: AuditOperation,
    pub key_id: String,
    pub domain: Option<String>,
    pub success: bool,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct AuditFilter {
    pub key_ids: Option<Vec<String>>,
    pub operations: Option<Vec<AuditOperation>>,
    pub success_only: Option<bool>,
}

impl AuditFilter {
    fn keep(&self, entry: &AuditEntry) -> bool {
        let mut keep = true;

        if let Some(ref key_ids) = self.key_ids {
            keep &= key_ids.contains(&entry.key_id);
        }

        if let Some(ref ops) = self.operations {
            keep &= ops.contains(&entry.operation);
        }

        if let Some(success) = self.success_only {
            keep &= entry.success == success;
        }

        keep
    }
}

/// Bounded, append-only log. Entries are kept in recording order and the
/// oldest are dropped once `max_entries` is exceeded.
pub struct AuditLog {
    config: AuditConfig,
    entries: Mutex<VecDeque<AuditEntry>>,
}

impl AuditLog {
    pub fn new(config: AuditConfig) -> Self {
        Self {
            config,
            entries: Mutex::new(VecDeque::new()),
        }
    }

    // Every critical section leaves the deque consistent, so poisoning is ignored
    fn lock(&self) -> MutexGuard<'_, VecDeque<AuditEntry>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn record(
        &self,
        operation: AuditOperation,
        key_id: &str,
        domain: Option<&str>,
        success: bool,
    ) {
        if !self.config.enabled {
            return;
        }

        let entry = AuditEntry {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            operation,
            key_id: key_id.to_string(),
            domain: domain.map(str::to_string),
            success,
        };

        info!(
            operation = ?entry.operation,
            key_id = %entry.key_id,
            domain = ?entry.domain,
            success = entry.success,
            "Custody audit"
        );

        let mut entries = self.lock();
        entries.push_back(entry);
        while entries.len() > self.config.max_entries {
            entries.pop_front();
        }
    }

    /// Entries in `[start, end]`, oldest first
    pub fn entries(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        filter: Option<&AuditFilter>,
    ) -> Vec<AuditEntry> {
        self.lock()
            .iter()
            .filter(|entry| entry.timestamp >= start && entry.timestamp <= end)
            .filter(|entry| filter.map_or(true, |f| f.keep(entry)))
            .cloned()
            .collect()
    }

    /// Everything recorded so far, oldest first
    pub fn all(&self) -> Vec<AuditEntry> {
        self.entries(DateTime::<Utc>::MIN_UTC, DateTime::<Utc>::MAX_UTC, None)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new(AuditConfig::default())
    }
}
