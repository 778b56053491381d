//! Object-storage collaborators for raw-image transfer.
//!
//! The pipeline moves raw images between a public source bucket and a working
//! bucket; the transfer itself is an external concern, so only the store
//! contract lives here, with a directory-backed implementation for local
//! mirrors and tests. Keys are `/`-separated relative paths.

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::fsio;

/// Errors raised by object-store operations.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("No object under key {key:?}")]
    MissingKey { key: String },
    #[error("Invalid object key {key:?}")]
    InvalidKey { key: String },
    #[error("Storage I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Minimal object-store contract used by the pipeline.
pub trait ObjectStore {
    /// Keys under `prefix`, sorted.
    fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError>;
    fn get(&self, key: &str) -> Result<Vec<u8>, StorageError>;
    fn put(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError>;
}

/// Directory-backed object store.
#[derive(Debug, Clone)]
pub struct DirStore {
    root: PathBuf,
}

impl DirStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn resolve(&self, key: &str) -> Result<PathBuf, StorageError> {
        if key.is_empty()
            || key.starts_with('/')
            || key
                .split('/')
                .any(|segment| segment.is_empty() || segment == "." || segment == "..")
        {
            return Err(StorageError::InvalidKey {
                key: key.to_string(),
            });
        }
        Ok(self.root.join(key))
    }

    fn collect_keys(
        &self,
        dir: &Path,
        keys: &mut Vec<String>,
    ) -> Result<(), StorageError> {
        let entries = std::fs::read_dir(dir).map_err(|source| StorageError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        for entry in entries {
            let entry = entry.map_err(|source| StorageError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
            let path = entry.path();
            if path.is_dir() {
                self.collect_keys(&path, keys)?;
            } else if let Ok(relative) = path.strip_prefix(&self.root) {
                keys.push(relative.to_string_lossy().replace('\\', "/"));
            }
        }
        Ok(())
    }
}

impl ObjectStore for DirStore {
    fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let mut keys = Vec::new();
        if self.root.is_dir() {
            self.collect_keys(&self.root.clone(), &mut keys)?;
        }
        keys.retain(|key| key.starts_with(prefix));
        keys.sort();
        Ok(keys)
    }

    fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.resolve(key)?;
        std::fs::read(&path).map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                StorageError::MissingKey {
                    key: key.to_string(),
                }
            } else {
                StorageError::Io { path, source }
            }
        })
    }

    fn put(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| StorageError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        fsio::write_atomic(&path, bytes).map_err(|source| StorageError::Io { path, source })
    }
}

/// Copy every object under `prefix` from `src` into `dst`.
pub fn copy_prefix(
    src: &dyn ObjectStore,
    dst: &dyn ObjectStore,
    prefix: &str,
) -> Result<usize, StorageError> {
    let keys = src.list(prefix)?;
    for key in &keys {
        let bytes = src.get(key)?;
        dst.put(key, &bytes)?;
    }
    tracing::info!(objects = keys.len(), prefix, "Copied prefix between stores");
    Ok(keys.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn put_get_round_trip() {
        let dir = tempdir().unwrap();
        let store = DirStore::new(dir.path().to_path_buf());
        store.put("data/img_001.jpg", b"jpeg-bytes").unwrap();
        assert_eq!(store.get("data/img_001.jpg").unwrap(), b"jpeg-bytes");
    }

    #[test]
    fn missing_key_is_distinguished_from_io_failure() {
        let dir = tempdir().unwrap();
        let store = DirStore::new(dir.path().to_path_buf());
        assert!(matches!(
            store.get("data/absent.jpg").unwrap_err(),
            StorageError::MissingKey { .. }
        ));
    }

    #[test]
    fn traversal_keys_are_rejected() {
        let dir = tempdir().unwrap();
        let store = DirStore::new(dir.path().to_path_buf());
        for key in ["/etc/passwd", "../up.jpg", "a//b.jpg", ""] {
            assert!(matches!(
                store.get(key).unwrap_err(),
                StorageError::InvalidKey { .. }
            ));
        }
    }

    #[test]
    fn list_filters_by_prefix_and_sorts() {
        let dir = tempdir().unwrap();
        let store = DirStore::new(dir.path().to_path_buf());
        store.put("data/b.jpg", b"b").unwrap();
        store.put("data/a.jpg", b"a").unwrap();
        store.put("meta/a.json", b"{}").unwrap();
        assert_eq!(
            store.list("data/").unwrap(),
            vec!["data/a.jpg".to_string(), "data/b.jpg".to_string()]
        );
    }

    #[test]
    fn copy_prefix_mirrors_objects() {
        let src_dir = tempdir().unwrap();
        let dst_dir = tempdir().unwrap();
        let src = DirStore::new(src_dir.path().to_path_buf());
        let dst = DirStore::new(dst_dir.path().to_path_buf());
        src.put("data/img_001.jpg", b"one").unwrap();
        src.put("data/img_002.jpg", b"two").unwrap();
        src.put("other/skip.txt", b"no").unwrap();

        let copied = copy_prefix(&src, &dst, "data/").unwrap();
        assert_eq!(copied, 2);
        assert_eq!(dst.get("data/img_001.jpg").unwrap(), b"one");
        assert!(matches!(
            dst.get("other/skip.txt").unwrap_err(),
            StorageError::MissingKey { .. }
        ));
    }
}
