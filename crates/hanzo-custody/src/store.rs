//! Secure byte stores holding private keys and seeds by storage handle

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use zeroize::Zeroizing;

use crate::error::{CustodyError, Result};
use crate::types::SecretBytes;

/// Durable store for raw secret bytes.
///
/// `get` returns `None` for an unknown handle and `remove` ignores one;
/// errors are reserved for the backend itself failing.
#[async_trait]
pub trait SecureByteStore: Send + Sync {
    /// Fetch an independent copy of the bytes under `handle`
    async fn get(&self, handle: &str) -> Result<Option<SecretBytes>>;

    async fn set(&self, handle: &str, value: &[u8]) -> Result<()>;

    async fn remove(&self, handle: &str) -> Result<()>;
}

/// Process-local store, for development and tests
#[derive(Default)]
pub struct MemoryByteStore {
    entries: DashMap<String, SecretBytes>,
}

impl MemoryByteStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, handle: &str) -> bool {
        self.entries.contains_key(handle)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl SecureByteStore for MemoryByteStore {
    async fn get(&self, handle: &str) -> Result<Option<SecretBytes>> {
        Ok(self
            .entries
            .get(handle)
            .map(|bytes| Zeroizing::new(bytes.to_vec())))
    }

    async fn set(&self, handle: &str, value: &[u8]) -> Result<()> {
        // The replaced buffer is wiped when dropped
        self.entries
            .insert(handle.to_string(), Zeroizing::new(value.to_vec()));
        Ok(())
    }

    async fn remove(&self, handle: &str) -> Result<()> {
        self.entries.remove(handle);
        Ok(())
    }
}

/// One file per handle under a base directory.
///
/// File names are the hex encoding of the handle so arbitrary handle strings
/// map to safe, distinct paths. On unix the directory is owner-only (0700)
/// and every secret file is created 0600.
pub struct FileByteStore {
    base_path: PathBuf,
}

#[cfg(unix)]
const MODE_DIR_PRIVATE: u32 = 0o700;
#[cfg(unix)]
const MODE_FILE_PRIVATE: u32 = 0o600;

const WIPE_CHUNK: usize = 4096;

impl FileByteStore {
    pub fn new(base_path: impl AsRef<Path>) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn path_for(&self, handle: &str) -> PathBuf {
        self.base_path.join(format!("{}.key", hex::encode(handle)))
    }

    async fn ensure_private_dir(&self) -> std::io::Result<()> {
        let mut builder = tokio::fs::DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        builder.mode(MODE_DIR_PRIVATE);
        builder.create(&self.base_path).await?;

        // An existing directory keeps its old mode unless tightened here
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(
                &self.base_path,
                std::fs::Permissions::from_mode(MODE_DIR_PRIVATE),
            )
            .await?;
        }
        Ok(())
    }

    async fn write_private(path: &Path, value: &[u8]) -> std::io::Result<()> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        options.mode(MODE_FILE_PRIVATE);

        let mut file = options.open(path).await?;
        file.write_all(value).await?;
        file.sync_all().await
    }
}

/// Overwrite a file's contents with zeros in place, keeping its length, and
/// flush the overwrite to disk.
async fn overwrite_with_zeros(path: &Path) -> std::io::Result<()> {
    let mut file = tokio::fs::OpenOptions::new().write(true).open(path).await?;
    let mut remaining = file.metadata().await?.len();
    let zeros = [0u8; WIPE_CHUNK];

    while remaining > 0 {
        let n = remaining.min(WIPE_CHUNK as u64) as usize;
        file.write_all(&zeros[..n]).await?;
        remaining -= n as u64;
    }
    file.sync_all().await
}

#[async_trait]
impl SecureByteStore for FileByteStore {
    async fn get(&self, handle: &str) -> Result<Option<SecretBytes>> {
        match tokio::fs::read(self.path_for(handle)).await {
            Ok(bytes) => Ok(Some(Zeroizing::new(bytes))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CustodyError::Store(format!("read {}: {}", handle, e))),
        }
    }

    async fn set(&self, handle: &str, value: &[u8]) -> Result<()> {
        self.ensure_private_dir()
            .await
            .map_err(|e| CustodyError::Store(format!("create {}: {}", self.base_path.display(), e)))?;

        let path = self.path_for(handle);
        let tmp = path.with_extension("key.tmp");
        Self::write_private(&tmp, value)
            .await
            .map_err(|e| CustodyError::Store(format!("write {}: {}", handle, e)))?;
        tokio::fs::rename(&tmp, &path).await?;

        debug!(storage_key = handle, "Stored secret bytes");
        Ok(())
    }

    async fn remove(&self, handle: &str) -> Result<()> {
        let path = self.path_for(handle);

        match overwrite_with_zeros(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(CustodyError::Store(format!("wipe {}: {}", handle, e))),
        }

        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CustodyError::Store(format!("remove {}: {}", handle, e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zeroize::Zeroize;

    #[tokio::test]
    async fn test_memory_store_roundtrip() {
        let store = MemoryByteStore::new();
        assert!(store.get("h").await.unwrap().is_none());

        store.set("h", &[1, 2, 3]).await.unwrap();
        assert_eq!(store.get("h").await.unwrap().unwrap().as_slice(), &[1, 2, 3]);

        store.remove("h").await.unwrap();
        assert!(store.get("h").await.unwrap().is_none());
        store.remove("h").await.unwrap();
    }

    #[tokio::test]
    async fn test_memory_store_hands_out_copies() {
        let store = MemoryByteStore::new();
        store.set("h", &[7; 4]).await.unwrap();

        let mut copy = store.get("h").await.unwrap().unwrap();
        copy.zeroize();

        assert_eq!(store.get("h").await.unwrap().unwrap().as_slice(), &[7; 4]);
    }

    #[tokio::test]
    async fn test_file_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileByteStore::new(dir.path().join("secrets"));

        assert!(store.get("hdwallet-derived-key-pub").await.unwrap().is_none());
        store.set("hdwallet-derived-key-pub", b"secret").await.unwrap();
        assert_eq!(
            store.get("hdwallet-derived-key-pub").await.unwrap().unwrap().as_slice(),
            b"secret"
        );

        store.set("hdwallet-derived-key-pub", b"rotated").await.unwrap();
        assert_eq!(
            store.get("hdwallet-derived-key-pub").await.unwrap().unwrap().as_slice(),
            b"rotated"
        );

        store.remove("hdwallet-derived-key-pub").await.unwrap();
        assert!(store.get("hdwallet-derived-key-pub").await.unwrap().is_none());
        store.remove("hdwallet-derived-key-pub").await.unwrap();
    }

    #[tokio::test]
    async fn test_file_store_handles_path_characters() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileByteStore::new(dir.path());

        store.set("../escape/attempt", b"a").await.unwrap();
        store.set("plain", b"b").await.unwrap();

        assert_eq!(store.get("../escape/attempt").await.unwrap().unwrap().as_slice(), b"a");
        assert_eq!(store.get("plain").await.unwrap().unwrap().as_slice(), b"b");
        assert!(!dir.path().join("../escape").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_file_store_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("secrets");
        let store = FileByteStore::new(&base);
        store.set("hdwallet-derived-key-pub", b"secret").await.unwrap();

        let file_mode = std::fs::metadata(store.path_for("hdwallet-derived-key-pub"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(file_mode & 0o777, 0o600);

        let dir_mode = std::fs::metadata(&base).unwrap().permissions().mode();
        assert_eq!(dir_mode & 0o077, 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_file_store_tightens_existing_directory() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        std::fs::set_permissions(dir.path(), std::fs::Permissions::from_mode(0o755)).unwrap();

        let store = FileByteStore::new(dir.path());
        store.set("plain", b"b").await.unwrap();

        let dir_mode = std::fs::metadata(dir.path()).unwrap().permissions().mode();
        assert_eq!(dir_mode & 0o077, 0);
    }

    #[tokio::test]
    async fn test_overwrite_with_zeros_keeps_length() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wipe.key");
        let secret = vec![0xA5u8; WIPE_CHUNK * 2 + 17];
        std::fs::write(&path, &secret).unwrap();

        overwrite_with_zeros(&path).await.unwrap();

        let after = std::fs::read(&path).unwrap();
        assert_eq!(after.len(), secret.len());
        assert!(after.iter().all(|b| *b == 0));
    }

    #[tokio::test]
    async fn test_file_store_remove_wipes_before_unlink() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileByteStore::new(dir.path());
        store.set("h", &[0xA5; 64]).await.unwrap();

        // A second link keeps the inode reachable after the store unlinks its name
        let witness = dir.path().join("witness");
        std::fs::hard_link(store.path_for("h"), &witness).unwrap();

        store.remove("h").await.unwrap();
        assert!(store.get("h").await.unwrap().is_none());

        let leftover = std::fs::read(&witness).unwrap();
        assert_eq!(leftover.len(), 64);
        assert!(leftover.iter().all(|b| *b == 0));
    }
}
