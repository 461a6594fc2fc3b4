//! Local Store Module
//!
//! Persists byte streams under string keys. The replication core only needs
//! [`Store::write`]; [`DiskStore`] is the on-disk implementation used by the
//! node binary.

mod tee;

pub use tee::TeeReader;

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncWriteExt};

use crate::error::{Error, Result};

/// Length of each directory segment in a content-addressed path
const CAS_BLOCK_SIZE: usize = 5;

/// Write-through store consumed by the replication core
#[async_trait]
pub trait Store: Send + Sync {
    /// Persist the full contents of `reader` under `key`, returning the byte count
    async fn write(&self, key: &str, reader: &mut (dyn AsyncRead + Send + Unpin)) -> Result<u64>;
}

/// Mapping from a key to a path relative to the storage root
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PathTransform {
    /// Key is used as the relative path
    #[default]
    Flat,
    /// SHA-1 of the key, split into directory segments
    Cas,
}

impl PathTransform {
    /// Relative path for a key
    pub fn apply(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty() {
            return Err(Error::InvalidKey("key cannot be empty".into()));
        }

        match self {
            PathTransform::Flat => {
                let path = PathBuf::from(key);
                let escapes = path
                    .components()
                    .any(|c| !matches!(c, Component::Normal(_)));
                if escapes {
                    return Err(Error::InvalidKey(format!("{key} escapes the storage root")));
                }
                Ok(path)
            }
            PathTransform::Cas => {
                let digest = hex::encode(Sha1::digest(key.as_bytes()));
                let mut path: PathBuf = digest
                    .as_bytes()
                    .chunks(CAS_BLOCK_SIZE)
                    .map(|block| String::from_utf8_lossy(block).into_owned())
                    .collect();
                path.push(&digest);
                Ok(path)
            }
        }
    }
}

/// File-backed store rooted at a directory
pub struct DiskStore {
    root: PathBuf,
    transform: PathTransform,
}

impl DiskStore {
    /// Create a store rooted at `root`
    pub fn new(root: impl Into<PathBuf>, transform: PathTransform) -> Self {
        Self {
            root: root.into(),
            transform,
        }
    }

    /// Storage root
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute path for a key
    pub fn path_for(&self, key: &str) -> Result<PathBuf> {
        Ok(self.root.join(self.transform.apply(key)?))
    }

    /// Check whether a key is stored
    pub async fn has(&self, key: &str) -> bool {
        match self.path_for(key) {
            Ok(path) => tokio::fs::metadata(path).await.is_ok(),
            Err(_) => false,
        }
    }

    /// Read the full contents stored under a key
    pub async fn read(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::KeyNotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Remove a key
    pub async fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                tracing::debug!("Deleted {} ({})", key, path.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::KeyNotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Remove everything under the storage root
    pub async fn clear(&self) -> Result<()> {
        match tokio::fs::remove_dir_all(&self.root).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl Store for DiskStore {
    async fn write(&self, key: &str, reader: &mut (dyn AsyncRead + Send + Unpin)) -> Result<u64> {
        let path = self.path_for(key)?;
        let to_store_err = |source| Error::StoreWrite { key: key.to_string(), source };

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(to_store_err)?;
        }

        let mut file = tokio::fs::File::create(&path).await.map_err(to_store_err)?;
        let written = tokio::io::copy(reader, &mut file).await.map_err(to_store_err)?;
        file.flush().await.map_err(to_store_err)?;

        tracing::debug!("Wrote {} bytes to {}", written, path.display());
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_cas_transform() {
        let path = PathTransform::Cas.apply("momsbestpicture").unwrap();
        let digest = hex::encode(Sha1::digest(b"momsbestpicture"));

        let segments: Vec<_> = path.iter().map(|s| s.to_string_lossy().into_owned()).collect();
        assert_eq!(segments.len(), 40 / CAS_BLOCK_SIZE + 1);
        assert_eq!(segments.last(), Some(&digest));
        assert_eq!(segments[..segments.len() - 1].concat(), digest);
    }

    #[test]
    fn test_flat_transform_rejects_escape() {
        assert!(PathTransform::Flat.apply("docs/readme").is_ok());
        assert!(PathTransform::Flat.apply("../etc/passwd").is_err());
        assert!(PathTransform::Flat.apply("/etc/passwd").is_err());
        assert!(PathTransform::Flat.apply("").is_err());
    }

    #[tokio::test]
    async fn test_write_read_delete() {
        let dir = tempdir().unwrap();
        let store = DiskStore::new(dir.path(), PathTransform::Cas);

        let mut reader: &[u8] = b"some jpg bytes";
        let written = store.write("picture", &mut reader).await.unwrap();
        assert_eq!(written, 14);
        assert!(store.has("picture").await);
        assert_eq!(store.read("picture").await.unwrap(), b"some jpg bytes");

        store.delete("picture").await.unwrap();
        assert!(!store.has("picture").await);
        assert!(matches!(store.read("picture").await, Err(Error::KeyNotFound(_))));
    }

    #[tokio::test]
    async fn test_write_overwrites_existing_key() {
        let dir = tempdir().unwrap();
        let store = DiskStore::new(dir.path(), PathTransform::Flat);

        let mut first: &[u8] = b"first version";
        store.write("notes/today", &mut first).await.unwrap();
        let mut second: &[u8] = b"v2";
        store.write("notes/today", &mut second).await.unwrap();

        assert_eq!(store.read("notes/today").await.unwrap(), b"v2");
        assert!(dir.path().join("notes").join("today").exists());
    }

    #[tokio::test]
    async fn test_write_failure_is_store_write_error() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"not a directory").unwrap();

        let store = DiskStore::new(&blocker, PathTransform::Flat);
        let mut reader: &[u8] = b"data";
        let err = store.write("key", &mut reader).await.unwrap_err();
        assert!(matches!(err, Error::StoreWrite { ref key, .. } if key == "key"));
    }

    #[tokio::test]
    async fn test_clear() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("root");
        let store = DiskStore::new(&root, PathTransform::Flat);

        let mut reader: &[u8] = b"x";
        store.write("a", &mut reader).await.unwrap();
        store.clear().await.unwrap();
        assert!(!root.exists());
        store.clear().await.unwrap();
    }
}
