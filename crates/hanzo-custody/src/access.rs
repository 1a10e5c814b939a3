//! Access control over private key material

use crate::types::{KeyRecord, Permission};

/// Decides whether a calling domain may use a record's material.
pub struct AccessGate;

impl AccessGate {
    /// Records without an ACL (or with an empty one) predate scoped keys and
    /// stay open to every domain. Otherwise some entry must name both the
    /// domain and the permission.
    pub fn authorize(record: &KeyRecord, domain: &str, permission: Permission) -> bool {
        match record.acl.as_deref() {
            None | Some([]) => true,
            Some(entries) => entries
                .iter()
                .any(|entry| entry.matches(domain, permission)),
        }
    }
}
