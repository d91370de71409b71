use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use super::upload::normalize_relative_path;
use crate::error::StorageError;

/// Metadata of a stored object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    pub key: String,
    pub size: u64,
    /// Lowercase hex SHA-256 of the content.
    pub sha256: String,
    /// Guessed from the key's extension, `application/octet-stream` otherwise.
    pub content_type: String,
}

/// Minimal S3-style object store.
pub trait ObjectStore: Send + Sync {
    /// Bucket name, used in messages and errors.
    fn bucket(&self) -> &str;
    fn put(&self, key: &str, content: &[u8]) -> Result<(), StorageError>;
    fn get(&self, key: &str) -> Result<Vec<u8>, StorageError>;
    fn head(&self, key: &str) -> Result<Option<ObjectMeta>, StorageError>;
    fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError>;

    fn exists(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.head(key)?.is_some())
    }
}

pub fn sha256_hex(content: &[u8]) -> String {
    format!("{:x}", Sha256::digest(content))
}

/// Object store backed by a local directory. Keys map to relative paths.
pub struct FilesystemBucket {
    name: String,
    root: PathBuf,
}

const PARTIAL_SUFFIX: &str = ".partial";

impl FilesystemBucket {
    pub fn new<P: AsRef<Path>>(name: impl Into<String>, root: P) -> Result<Self, StorageError> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root).map_err(|e| StorageError::CreateDirectory {
            path: root.clone(),
            source: e,
        })?;
        Ok(Self {
            name: name.into(),
            root,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, key: &str) -> Result<(String, PathBuf), StorageError> {
        let key = normalize_relative_path(key)?;
        let path = self.root.join(&key);
        Ok((key, path))
    }

    fn not_found(&self, key: &str) -> StorageError {
        StorageError::NotFound {
            bucket: self.name.clone(),
            key: key.to_string(),
        }
    }
}

impl ObjectStore for FilesystemBucket {
    fn bucket(&self) -> &str {
        &self.name
    }

    fn put(&self, key: &str, content: &[u8]) -> Result<(), StorageError> {
        let (key, path) = self.object_path(key)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::CreateDirectory {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        // Write beside the target and rename so readers never see a partial object.
        let partial = path.with_file_name(format!(
            ".{}{}",
            uuid::Uuid::new_v4(),
            PARTIAL_SUFFIX
        ));
        std::fs::write(&partial, content).map_err(|e| StorageError::WriteObject {
            key: key.clone(),
            source: e,
        })?;
        std::fs::rename(&partial, &path).map_err(|e| {
            let _ = std::fs::remove_file(&partial);
            StorageError::WriteObject {
                key: key.clone(),
                source: e,
            }
        })?;

        log::debug!("Stored {} bytes at {}/{}", content.len(), self.name, key);
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let (key, path) = self.object_path(key)?;
        match std::fs::read(&path) {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == IoErrorKind::NotFound => Err(self.not_found(&key)),
            Err(e) => Err(StorageError::ReadObject { key, source: e }),
        }
    }

    fn head(&self, key: &str) -> Result<Option<ObjectMeta>, StorageError> {
        let (key, path) = self.object_path(key)?;
        if !path.is_file() {
            return Ok(None);
        }
        let content = std::fs::read(&path).map_err(|e| StorageError::ReadObject {
            key: key.clone(),
            source: e,
        })?;
        Ok(Some(ObjectMeta {
            size: content.len() as u64,
            sha256: sha256_hex(&content),
            content_type: mime_guess::from_path(&key)
                .first_or_octet_stream()
                .essence_str()
                .to_string(),
            key,
        }))
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let mut keys = Vec::new();
        for entry in WalkDir::new(&self.root).into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            if entry
                .file_name()
                .to_str()
                .is_some_and(|n| n.ends_with(PARTIAL_SUFFIX))
            {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(&self.root) else {
                continue;
            };
            let key = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            if key.starts_with(prefix) {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }
}
