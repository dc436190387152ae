// Upload file store - local filesystem, id-sharded paths
//
// Layout: {root}/{id[..2]}/{id}.{ext}
// The root lives outside any web-served directory; handlers never build
// paths from client input.

use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// MIME types the upload endpoint accepts
pub const ALLOWED_MIME_TYPES: &[&str] = &[
    "image/png",
    "image/jpeg",
    "image/webp",
    "application/pdf",
];

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("unsupported media type: {0}")]
    UnsupportedMediaType(String),

    #[error("file too large: {size} bytes (limit {limit})")]
    TooLarge { size: u64, limit: u64 },

    #[error("uploaded file is empty")]
    Empty,

    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub struct FileStore {
    root: PathBuf,
    max_bytes: u64,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>, max_bytes: u64) -> Self {
        FileStore {
            root: root.into(),
            max_bytes,
        }
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    /// Type/size checks, run before any byte touches disk
    pub fn validate(&self, mime_type: &str, size: u64) -> Result<(), StorageError> {
        if !ALLOWED_MIME_TYPES.contains(&mime_type) {
            return Err(StorageError::UnsupportedMediaType(mime_type.to_string()));
        }
        if size == 0 {
            return Err(StorageError::Empty);
        }
        if size > self.max_bytes {
            return Err(StorageError::TooLarge {
                size,
                limit: self.max_bytes,
            });
        }
        Ok(())
    }

    /// Shard by the first two id characters to keep directories small
    fn path_for(&self, id: &str, mime_type: &str) -> PathBuf {
        let shard = if id.len() >= 2 { &id[..2] } else { id };
        self.root
            .join(shard)
            .join(format!("{id}.{}", extension_for(mime_type)))
    }

    /// Validate and write the upload. Returns the final path; on any failure
    /// nothing is left behind.
    pub fn store(&self, id: &str, mime_type: &str, bytes: &[u8]) -> Result<PathBuf, StorageError> {
        self.validate(mime_type, bytes.len() as u64)?;

        let path = self.path_for(id, mime_type);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        if let Err(e) = fs::write(&path, bytes) {
            let _ = fs::remove_file(&path);
            return Err(e.into());
        }

        Ok(path)
    }

    pub fn load(&self, path: impl AsRef<Path>) -> Result<Vec<u8>, StorageError> {
        Ok(fs::read(path.as_ref())?)
    }

    /// Remove a stored file, used to clean up when the matching database
    /// insert fails. Missing files are not an error.
    pub fn remove(&self, path: impl AsRef<Path>) -> Result<(), StorageError> {
        match fs::remove_file(path.as_ref()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn extension_for(mime_type: &str) -> &'static str {
    match mime_type {
        "image/png" => "png",
        "image/jpeg" => "jpg",
        "image/webp" => "webp",
        "application/pdf" => "pdf",
        _ => "bin",
    }
}
