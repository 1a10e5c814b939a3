//! Core types for Hanzo Custody

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use zeroize::Zeroizing;

/// Raw private key or seed bytes. Wiped when dropped.
pub type SecretBytes = Zeroizing<Vec<u8>>;

/// Cryptographic role of a key.
///
/// The set of roles belongs to the wallet layer; custody only needs a stable
/// string form to build storage handles, so the value is kept opaque.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyType(String);

impl KeyType {
    pub const HD_WALLET_DERIVED: &'static str = "hdwallet-derived-key";
    pub const IMPORTED_LEGACY: &'static str = "imported-legacy-key";

    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn hd_wallet_derived() -> Self {
        Self::new(Self::HD_WALLET_DERIVED)
    }

    pub fn imported_legacy() -> Self {
        Self::new(Self::IMPORTED_LEGACY)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for KeyType {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Capability checked against access control entries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    ReadPrivate,
    ReadPublic,
}

/// Grants `permissions` to every domain in `domains`
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AccessControlEntry {
    pub domains: BTreeSet<String>,
    pub permissions: BTreeSet<Permission>,
}

impl AccessControlEntry {
    pub fn new<D, P>(domains: D, permissions: P) -> Self
    where
        D: IntoIterator,
        D::Item: Into<String>,
        P: IntoIterator<Item = Permission>,
    {
        Self {
            domains: domains.into_iter().map(Into::into).collect(),
            permissions: permissions.into_iter().collect(),
        }
    }

    pub fn matches(&self, domain: &str, permission: Permission) -> bool {
        self.domains.contains(domain) && self.permissions.contains(&permission)
    }
}

/// Metadata about one key. Never holds secret bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyRecord {
    /// Empty until assigned by `KeyLifecycleManager::save_key`
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub public_key: String,
    pub key_type: KeyType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_data_storage_key: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acl: Option<Vec<AccessControlEntry>>,
}

impl KeyRecord {
    /// A record ready to be handed to `save_key`
    pub fn new(key_type: KeyType, public_key: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            public_key: public_key.into(),
            key_type,
            private_data_storage_key: None,
            created_at: Utc::now(),
            expires_at: None,
            acl: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn with_acl(mut self, acl: Vec<AccessControlEntry>) -> Self {
        self.acl = Some(acl);
        self
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Handle for the secret bytes: `{keyType}-{publicKey}`, or
    /// `{keyType}-{id}` when the key has no public component.
    pub fn storage_key_for(key_type: &KeyType, public_key: &str, id: &str) -> String {
        if public_key.is_empty() {
            format!("{}-{}", key_type, id)
        } else {
            format!("{}-{}", key_type, public_key)
        }
    }
}

/// Fresh record identifier
pub fn generate_key_id() -> String {
    Uuid::new_v4().to_string()
}
