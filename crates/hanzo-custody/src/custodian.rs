//! Scoped access to private key material.
//!
//! [`KeyCustodian`] is the only way to reach plaintext key bytes. Each call
//! fetches its own copy from the [`SecureByteStore`], lends it to the caller's
//! handler, and wipes it before returning. The wipe is tied to a drop guard,
//! so it also runs when the handler fails, panics, or the call is cancelled.

use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::debug;
use zeroize::Zeroize;

use crate::access::AccessGate;
use crate::audit::{AuditLog, AuditOperation};
use crate::error::{CustodyError, Result};
use crate::lifecycle::reap_evicted;
use crate::registry::KeyRegistry;
use crate::seed::{RawSeed, SeedDeriver};
use crate::store::SecureByteStore;
use crate::types::Permission;

/// Future returned by key and seed handlers, borrowing the secret for `'a`
pub type HandlerFuture<'a, T> = BoxFuture<'a, anyhow::Result<T>>;

pub struct KeyCustodian {
    registry: Arc<KeyRegistry>,
    store: Arc<dyn SecureByteStore>,
    seed_deriver: Arc<dyn SeedDeriver>,
    audit: Arc<AuditLog>,
}

impl KeyCustodian {
    pub fn new(registry: Arc<KeyRegistry>, store: Arc<dyn SecureByteStore>) -> Self {
        Self {
            registry,
            store,
            seed_deriver: Arc::new(RawSeed),
            audit: Arc::new(AuditLog::default()),
        }
    }

    pub fn with_seed_deriver(mut self, seed_deriver: Arc<dyn SeedDeriver>) -> Self {
        self.seed_deriver = seed_deriver;
        self
    }

    pub fn with_audit(mut self, audit: Arc<AuditLog>) -> Self {
        self.audit = audit;
        self
    }

    /// Run `handler` with the private key bytes of `key_id`.
    ///
    /// Fails with `KeyNotFound` when no live record exists and with
    /// `KeyAccessDenied` when `domain` lacks `ReadPrivate`, the record has no
    /// storage key, or the store has no bytes. Handler errors other than
    /// those two kinds come back as `KeyAccessDenied` with the original error
    /// as its source.
    ///
    /// ```ignore
    /// let signature = custodian
    ///     .execute_with_key(&key_id, "wallet", |key| {
    ///         Box::pin(async move { Ok(sign(key, &payload)) })
    ///     })
    ///     .await?;
    /// ```
    pub async fn execute_with_key<T, F>(&self, key_id: &str, domain: &str, handler: F) -> Result<T>
    where
        F: for<'a> FnOnce(&'a [u8]) -> HandlerFuture<'a, T> + Send,
        T: Send,
    {
        let result = self.run_with_key(key_id, domain, handler).await;
        self.audit
            .record(AuditOperation::Access, key_id, Some(domain), result.is_ok());
        result
    }

    /// Run `handler` with the seed derived from the private key of `key_id`.
    ///
    /// Same checks and error mapping as [`execute_with_key`](Self::execute_with_key).
    /// A derived seed buffer is wiped once the handler settles; the private
    /// key buffer is wiped by the underlying key call.
    pub async fn execute_with_seed<T, F>(&self, key_id: &str, domain: &str, handler: F) -> Result<T>
    where
        F: for<'a> FnOnce(&'a [u8]) -> HandlerFuture<'a, T> + Send + 'static,
        T: Send + 'static,
    {
        let deriver = Arc::clone(&self.seed_deriver);

        self.execute_with_key(key_id, domain, move |private_key| {
            Box::pin(async move {
                let mut seed = deriver.derive(private_key)?;
                let outcome = handler(seed.as_bytes()).await;
                seed.scrub();
                outcome
            })
        })
        .await
    }

    async fn run_with_key<T, F>(&self, key_id: &str, domain: &str, handler: F) -> Result<T>
    where
        F: for<'a> FnOnce(&'a [u8]) -> HandlerFuture<'a, T> + Send,
        T: Send,
    {
        let Some(record) = self.registry.get_key(key_id) else {
            reap_evicted(&self.registry, self.store.as_ref(), &self.audit).await;
            return Err(CustodyError::KeyNotFound(key_id.to_string()));
        };

        if !AccessGate::authorize(&record, domain, Permission::ReadPrivate) {
            debug!(key_id, domain, "Domain lacks read_private on key");
            return Err(CustodyError::denied());
        }

        let Some(storage_key) = record.private_data_storage_key.as_deref() else {
            debug!(key_id, "Key record has no storage key");
            return Err(CustodyError::denied());
        };

        let mut secret = match self.store.get(storage_key).await {
            Ok(Some(secret)) => secret,
            Ok(None) => {
                debug!(key_id, storage_key, "No secret bytes for key");
                return Err(CustodyError::denied());
            }
            Err(e) => return Err(CustodyError::denied_by(e)),
        };

        let outcome = with_scrubbed(secret.as_mut_slice(), handler).await;
        drop(secret);

        outcome.map_err(classify)
    }
}

/// Lend `secret` to `handler`, zeroing it once the handler settles or the
/// returned future is dropped.
pub(crate) async fn with_scrubbed<T, F>(secret: &mut [u8], handler: F) -> anyhow::Result<T>
where
    F: for<'a> FnOnce(&'a [u8]) -> HandlerFuture<'a, T>,
{
    let guard = ScrubGuard { bytes: secret };
    let outcome = handler(&*guard.bytes).await;
    drop(guard);
    outcome
}

struct ScrubGuard<'a> {
    bytes: &'a mut [u8],
}

impl Drop for ScrubGuard<'_> {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

/// Only `KeyNotFound` and `KeyAccessDenied` leave the custodian; anything
/// else a handler raised is folded into `KeyAccessDenied`.
fn classify(err: anyhow::Error) -> CustodyError {
    match err.downcast::<CustodyError>() {
        Ok(err) if err.is_classified() => err,
        Ok(err) => CustodyError::denied_by(err),
        Err(err) => CustodyError::denied_by(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryByteStore;
    use crate::types::{AccessControlEntry, KeyRecord, KeyType};
    use chrono::{Duration, Utc};
    use futures::FutureExt;
    use std::error::Error as _;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn test_scrubbed_after_success() {
        let mut buffer = vec![0xAB; 32];
        let sum = with_scrubbed(&mut buffer, |key| {
            Box::pin(async move { Ok(key.iter().map(|b| *b as u32).sum::<u32>()) })
        })
        .await
        .unwrap();

        assert_eq!(sum, 0xAB * 32);
        assert!(buffer.iter().all(|b| *b == 0));
    }

    #[tokio::test]
    async fn test_scrubbed_after_error() {
        let mut buffer = vec![0x11; 16];
        let result: anyhow::Result<()> = with_scrubbed(&mut buffer, |_key| {
            Box::pin(async move { Err(anyhow::anyhow!("signer rejected payload")) })
        })
        .await;

        assert!(result.is_err());
        assert!(buffer.iter().all(|b| *b == 0));
    }

    #[tokio::test]
    async fn test_scrubbed_after_panic() {
        let mut buffer = vec![0x22; 16];
        let result = std::panic::AssertUnwindSafe(with_scrubbed(&mut buffer, |key| {
            Box::pin(async move {
                if !key.is_empty() {
                    panic!("handler bug");
                }
                Ok::<(), anyhow::Error>(())
            })
        }))
        .catch_unwind()
        .await;

        assert!(result.is_err());
        assert!(buffer.iter().all(|b| *b == 0));
    }

    #[tokio::test]
    async fn test_scrubbed_after_cancellation() {
        let mut buffer = vec![0x33; 16];
        let result = tokio::time::timeout(
            std::time::Duration::from_millis(10),
            with_scrubbed(&mut buffer, |_key| {
                Box::pin(futures::future::pending::<anyhow::Result<()>>())
            }),
        )
        .await;

        assert!(result.is_err());
        assert!(buffer.iter().all(|b| *b == 0));
    }

    async fn custodian_with(record: KeyRecord, secret: &[u8]) -> (KeyCustodian, Arc<MemoryByteStore>) {
        let registry = Arc::new(KeyRegistry::new());
        let store = Arc::new(MemoryByteStore::new());
        if let Some(ref handle) = record.private_data_storage_key {
            store.set(handle, secret).await.unwrap();
        }
        registry.add_key(record);
        (KeyCustodian::new(registry, store.clone()), store)
    }

    fn stored_record(id: &str) -> KeyRecord {
        let mut record = KeyRecord::new(KeyType::hd_wallet_derived(), "pub").with_id(id);
        record.private_data_storage_key = Some("hdwallet-derived-key-pub".into());
        record
    }

    #[tokio::test]
    async fn test_execute_with_key_passes_bytes() {
        let (custodian, _) = custodian_with(stored_record("k1"), &[1, 2, 3]).await;
        let bytes = custodian
            .execute_with_key("k1", "wallet", |key| Box::pin(async move { Ok(key.to_vec()) }))
            .await
            .unwrap();
        assert_eq!(bytes, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_missing_key_never_calls_handler() {
        let (custodian, _) = custodian_with(stored_record("k1"), &[1]).await;
        let called = Arc::new(AtomicBool::new(false));
        let flag = called.clone();

        let err = custodian
            .execute_with_key("nope", "wallet", move |_key| {
                Box::pin(async move {
                    flag.store(true, Ordering::SeqCst);
                    Ok(())
                })
            })
            .await
            .unwrap_err();

        assert!(matches!(err, CustodyError::KeyNotFound(ref id) if id == "nope"));
        assert!(!called.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_expired_key_is_not_found() {
        let record = stored_record("old").with_expiry(Utc::now() - Duration::minutes(1));
        let (custodian, store) = custodian_with(record, &[1]).await;

        let err = custodian
            .execute_with_key("old", "wallet", |_key| Box::pin(async move { Ok(()) }))
            .await
            .unwrap_err();
        assert!(matches!(err, CustodyError::KeyNotFound(_)));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_denied_domain_never_calls_handler() {
        let record = stored_record("k1")
            .with_acl(vec![AccessControlEntry::new(["wallet"], [Permission::ReadPrivate])]);
        let (custodian, _) = custodian_with(record, &[1]).await;
        let called = Arc::new(AtomicBool::new(false));
        let flag = called.clone();

        let err = custodian
            .execute_with_key("k1", "browser", move |_key| {
                Box::pin(async move {
                    flag.store(true, Ordering::SeqCst);
                    Ok(())
                })
            })
            .await
            .unwrap_err();

        assert!(matches!(err, CustodyError::KeyAccessDenied { source: None }));
        assert!(!called.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_record_without_storage_key_is_denied() {
        let record = KeyRecord::new(KeyType::imported_legacy(), "").with_id("bare");
        let (custodian, _) = custodian_with(record, &[1]).await;

        let err = custodian
            .execute_with_key("bare", "wallet", |_key| Box::pin(async move { Ok(()) }))
            .await
            .unwrap_err();
        assert!(matches!(err, CustodyError::KeyAccessDenied { .. }));
    }

    #[tokio::test]
    async fn test_missing_secret_is_denied() {
        let (custodian, store) = custodian_with(stored_record("k1"), &[1]).await;
        store.remove("hdwallet-derived-key-pub").await.unwrap();

        let err = custodian
            .execute_with_key("k1", "wallet", |_key| Box::pin(async move { Ok(()) }))
            .await
            .unwrap_err();
        assert!(matches!(err, CustodyError::KeyAccessDenied { source: None }));
    }

    #[tokio::test]
    async fn test_foreign_handler_error_is_wrapped() {
        let (custodian, _) = custodian_with(stored_record("k1"), &[1]).await;

        let err = custodian
            .execute_with_key("k1", "wallet", |_key| {
                Box::pin(async move {
                    let parsed: u32 = "not a number".parse()?;
                    Ok(parsed)
                })
            })
            .await
            .unwrap_err();

        assert!(matches!(err, CustodyError::KeyAccessDenied { source: Some(_) }));
        assert_eq!(err.to_string(), "Key access denied");
        assert!(err.source().is_some());
    }

    #[tokio::test]
    async fn test_classified_handler_error_propagates_unchanged() {
        let (custodian, _) = custodian_with(stored_record("k1"), &[1]).await;

        let err = custodian
            .execute_with_key("k1", "wallet", |_key| {
                Box::pin(async move {
                    Err::<(), _>(CustodyError::KeyNotFound("inner".into()).into())
                })
            })
            .await
            .unwrap_err();

        assert!(matches!(err, CustodyError::KeyNotFound(ref id) if id == "inner"));
    }

    #[tokio::test]
    async fn test_unclassified_custody_error_is_wrapped() {
        let (custodian, _) = custodian_with(stored_record("k1"), &[1]).await;

        let err = custodian
            .execute_with_key("k1", "wallet", |_key| {
                Box::pin(async move { Err::<(), _>(CustodyError::Store("disk".into()).into()) })
            })
            .await
            .unwrap_err();

        assert!(matches!(err, CustodyError::KeyAccessDenied { source: Some(_) }));
    }

    #[tokio::test]
    async fn test_execute_with_seed_raw() {
        let (custodian, _) = custodian_with(stored_record("k1"), &[5; 32]).await;
        let seed = custodian
            .execute_with_seed("k1", "wallet", |seed| Box::pin(async move { Ok(seed.to_vec()) }))
            .await
            .unwrap();
        assert_eq!(seed, vec![5; 32]);
    }

    #[tokio::test]
    async fn test_execute_with_seed_derived() {
        let (custodian, _) = custodian_with(stored_record("k1"), &[5; 32]).await;
        let custodian = custodian.with_seed_deriver(Arc::new(crate::seed::Blake3Seed::new("ctx")));

        let seed = custodian
            .execute_with_seed("k1", "wallet", |seed| Box::pin(async move { Ok(seed.to_vec()) }))
            .await
            .unwrap();
        assert_eq!(seed, blake3::derive_key("ctx", &[5; 32]).to_vec());
    }

    #[tokio::test]
    async fn test_seed_derivation_failure_is_denied() {
        let (custodian, _) = custodian_with(stored_record("k1"), &[]).await;
        let custodian = custodian.with_seed_deriver(Arc::new(crate::seed::Blake3Seed::new("ctx")));

        let err = custodian
            .execute_with_seed("k1", "wallet", |_seed| Box::pin(async move { Ok(()) }))
            .await
            .unwrap_err();
        assert!(matches!(err, CustodyError::KeyAccessDenied { source: Some(_) }));
    }

    #[tokio::test]
    async fn test_access_is_audited() {
        let (custodian, _) = custodian_with(stored_record("k1"), &[1]).await;
        let audit = Arc::new(AuditLog::default());
        let custodian = custodian.with_audit(audit.clone());

        custodian
            .execute_with_key("k1", "wallet", |_key| Box::pin(async move { Ok(()) }))
            .await
            .unwrap();
        let _ = custodian
            .execute_with_key("missing", "wallet", |_key| Box::pin(async move { Ok(()) }))
            .await;

        let entries = audit.all();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.operation == AuditOperation::Access));
        assert_eq!(entries.iter().filter(|e| e.success).count(), 1);
    }
}
