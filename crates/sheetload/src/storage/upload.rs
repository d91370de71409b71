//! Raw uploads into the bucket: payload validation, key derivation and
//! post-copy integrity checks.

use std::io::{Cursor, Read};
use std::path::Path;

use sha2::{Digest, Sha256};
use zip::ZipArchive;

use super::bucket::{sha256_hex, ObjectStore};
use crate::error::StorageError;

const ZIP_MAGIC: &[&[u8]] = &[b"PK\x03\x04", b"PK\x05\x06"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadKind {
    File,
    Directory,
}

impl UploadKind {
    pub fn parse(value: &str) -> Result<Self, StorageError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "file" => Ok(UploadKind::File),
            "directory" => Ok(UploadKind::Directory),
            _ => Err(StorageError::InvalidPayload(
                "upload_type must be 'file' or 'directory'".to_string(),
            )),
        }
    }
}

/// Checks that a payload can be stored as the given kind: files must be
/// non-empty, directories must arrive as a zip archive.
pub fn validate_upload_payload(content: &[u8], kind: UploadKind) -> Result<(), StorageError> {
    match kind {
        UploadKind::File if content.is_empty() => Err(StorageError::InvalidPayload(
            "Uploaded file is empty".to_string(),
        )),
        UploadKind::File => Ok(()),
        UploadKind::Directory => {
            if ZIP_MAGIC.iter().any(|magic| content.starts_with(magic)) {
                Ok(())
            } else {
                Err(StorageError::InvalidPayload(
                    "Directory uploads must be provided as a .zip archive".to_string(),
                ))
            }
        }
    }
}

/// Normalises a client-supplied relative path into an object key.
///
/// Backslashes become `/`, leading slashes and `.`/empty segments are
/// dropped, and `..` is rejected outright.
pub fn normalize_relative_path(filename: &str) -> Result<String, StorageError> {
    let path = filename.replace('\\', "/");
    let path = path.trim();
    if path.is_empty() {
        return Err(StorageError::InvalidPath(
            "Each file must include a relative path or filename".to_string(),
        ));
    }

    let mut segments = Vec::new();
    for segment in path.trim_start_matches('/').split('/') {
        match segment {
            "" | "." => continue,
            ".." => {
                return Err(StorageError::InvalidPath(
                    "Directory traversal sequences ('..') are not allowed in file paths"
                        .to_string(),
                ))
            }
            s => segments.push(s),
        }
    }

    if segments.is_empty() {
        return Err(StorageError::InvalidPath(format!(
            "Invalid relative path '{}'",
            filename
        )));
    }
    Ok(segments.join("/"))
}

/// One file of a multi-file upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadEntry {
    pub path: String,
    pub content: Vec<u8>,
}

/// Content hash of a set of files, independent of submission order.
///
/// Entries are sorted by path; each contributes its path bytes, its length
/// as an 8-byte big-endian integer, then its content.
pub fn compute_directory_hash(entries: &[UploadEntry]) -> Result<String, StorageError> {
    if entries.is_empty() {
        return Err(StorageError::InvalidPayload(
            "No files provided to compute directory hash".to_string(),
        ));
    }
    let mut sorted: Vec<&UploadEntry> = entries.iter().collect();
    sorted.sort_by(|a, b| a.path.cmp(&b.path));

    let mut hasher = Sha256::new();
    for entry in sorted {
        hasher.update(entry.path.as_bytes());
        hasher.update((entry.content.len() as u64).to_be_bytes());
        hasher.update(&entry.content);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// A validated storage upload, ready to be hashed and written.
#[derive(Debug, Clone)]
pub enum UploadPayload {
    Single { filename: String, content: Vec<u8> },
    /// A `.zip` whose entries are stored under `{archive_stem}/`.
    Archive { filename: String, content: Vec<u8> },
    Files(Vec<UploadEntry>),
}

impl UploadPayload {
    /// Classifies the files of one upload request: one `.zip` is an archive,
    /// one other file is a single upload, several files keep their paths.
    pub fn from_files(mut files: Vec<(String, Vec<u8>)>) -> Result<Self, StorageError> {
        match files.len() {
            0 => Err(StorageError::InvalidPayload(
                "At least one file must be provided".to_string(),
            )),
            1 => {
                let (filename, content) = files.remove(0);
                let filename = base_name(&normalize_relative_path(&filename)?);
                if filename.to_ascii_lowercase().ends_with(".zip") {
                    validate_upload_payload(&content, UploadKind::Directory)?;
                    Ok(UploadPayload::Archive { filename, content })
                } else {
                    validate_upload_payload(&content, UploadKind::File)?;
                    Ok(UploadPayload::Single { filename, content })
                }
            }
            _ => {
                let entries = files
                    .into_iter()
                    .map(|(path, content)| {
                        Ok(UploadEntry {
                            path: normalize_relative_path(&path)?,
                            content,
                        })
                    })
                    .collect::<Result<Vec<_>, StorageError>>()?;
                Ok(UploadPayload::Files(entries))
            }
        }
    }

    /// Content hash used for duplicate detection.
    pub fn content_hash(&self) -> Result<String, StorageError> {
        match self {
            UploadPayload::Single { content, .. } | UploadPayload::Archive { content, .. } => {
                Ok(sha256_hex(content))
            }
            UploadPayload::Files(entries) => compute_directory_hash(entries),
        }
    }

    /// Names recorded on the job: the filename, or every path.
    pub fn file_names(&self) -> Vec<String> {
        match self {
            UploadPayload::Single { filename, .. } | UploadPayload::Archive { filename, .. } => {
                vec![filename.clone()]
            }
            UploadPayload::Files(entries) => entries.iter().map(|e| e.path.clone()).collect(),
        }
    }
}

/// What a storage upload wrote.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadSummary {
    pub keys: Vec<String>,
    pub total_bytes: u64,
}

/// Writes a payload into the bucket, verifying every object after the copy.
///
/// With `preserve_filename = false` a single file is stored as
/// `{uuid}_{filename}`, and archive or multi-file uploads are placed under a
/// `{uuid}/` prefix, so repeated uploads never overwrite each other.
pub fn store_payload(
    store: &dyn ObjectStore,
    payload: &UploadPayload,
    preserve_filename: bool,
) -> Result<UploadSummary, StorageError> {
    let upload_id = uuid::Uuid::new_v4();
    let prefix = if preserve_filename {
        String::new()
    } else {
        format!("{}/", upload_id)
    };

    let mut summary = UploadSummary::default();
    match payload {
        UploadPayload::Single { filename, content } => {
            let key = if preserve_filename {
                filename.clone()
            } else {
                format!("{}_{}", upload_id, filename)
            };
            put_verified(store, &key, content, &mut summary)?;
        }
        UploadPayload::Archive { filename, content } => {
            let stem = Path::new(filename)
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("archive")
                .to_string();
            for (path, data) in archive_entries(content)? {
                let key = format!("{}{}/{}", prefix, stem, path);
                put_verified(store, &key, &data, &mut summary)?;
            }
        }
        UploadPayload::Files(entries) => {
            for entry in entries {
                let key = format!("{}{}", prefix, entry.path);
                put_verified(store, &key, &entry.content, &mut summary)?;
            }
        }
    }
    Ok(summary)
}

fn put_verified(
    store: &dyn ObjectStore,
    key: &str,
    content: &[u8],
    summary: &mut UploadSummary,
) -> Result<(), StorageError> {
    store.put(key, content)?;
    verify_object(store, key, content)?;
    summary.keys.push(key.to_string());
    summary.total_bytes += content.len() as u64;
    Ok(())
}

/// Post-copy integrity validation: the object exists with the expected size
/// and hash.
pub fn verify_object(store: &dyn ObjectStore, key: &str, content: &[u8]) -> Result<(), StorageError> {
    let meta = store
        .head(key)?
        .ok_or_else(|| StorageError::IntegrityCheck {
            key: key.to_string(),
            reason: "object missing after upload".to_string(),
        })?;
    if meta.size != content.len() as u64 {
        return Err(StorageError::IntegrityCheck {
            key: key.to_string(),
            reason: format!("size {} != expected {}", meta.size, content.len()),
        });
    }
    if meta.sha256 != sha256_hex(content) {
        return Err(StorageError::IntegrityCheck {
            key: key.to_string(),
            reason: "content hash mismatch".to_string(),
        });
    }
    Ok(())
}

/// File entries of a zip archive as `(normalised path, content)`.
fn archive_entries(content: &[u8]) -> Result<Vec<(String, Vec<u8>)>, StorageError> {
    let mut archive =
        ZipArchive::new(Cursor::new(content)).map_err(|e| StorageError::Archive(e.to_string()))?;
    let mut entries = Vec::new();
    for i in 0..archive.len() {
        let mut file = archive
            .by_index(i)
            .map_err(|e| StorageError::Archive(e.to_string()))?;
        if file.is_dir() {
            continue;
        }
        let path = normalize_relative_path(file.name())?;
        let mut data = Vec::with_capacity(file.size() as usize);
        file.read_to_end(&mut data)
            .map_err(|e| StorageError::Archive(format!("{}: {}", path, e)))?;
        entries.push((path, data));
    }
    if entries.is_empty() {
        return Err(StorageError::InvalidPayload(
            "Archive contains no files".to_string(),
        ));
    }
    Ok(entries)
}

fn base_name(path: &str) -> String {
    path.rsplit('/').next().unwrap_or(path).to_string()
}
