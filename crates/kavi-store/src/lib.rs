//! Content-addressed blob store.
//!
//! Blobs are keyed by the lowercase hex SHA-256 of their bytes and laid
//! out in two-nibble shard directories (`ab/abcdef…`). Writes go to a
//! temporary sibling and rename into place, so racing writers of
//! identical content are safe and a crash never leaves a partial blob
//! under its final name. Blobs are never deleted.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use thiserror::Error;

/// Blob store I/O failure. Fatal for the operation that hit it.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {op} {path}: {source}")]
    Unavailable {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("unknown blob {hash}")]
    UnknownBlob { hash: String },
    #[error("invalid blob hash `{hash}`")]
    InvalidHash { hash: String },
}

/// Result of storing bytes: the content hash plus size, ready to be
/// recorded as an artifact row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobRef {
    pub hash: String,
    pub size: u64,
}

/// SHA-256 of a byte slice as lowercase hex.
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// SHA-256 of a file's contents as lowercase hex.
pub fn hash_file(path: &Path) -> Result<String, StoreError> {
    let bytes = fs::read(path).map_err(|source| StoreError::Unavailable {
        op: "read",
        path: path.to_path_buf(),
        source,
    })?;
    Ok(hash_bytes(&bytes))
}

fn hash_is_valid(hash: &str) -> bool {
    hash.len() == 64 && hash.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
}

/// On-disk content-addressed blob directory.
#[derive(Debug, Clone)]
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Sharded path of a blob: `<root>/<first two nibbles>/<hash>`.
    pub fn blob_path(&self, hash: &str) -> Result<PathBuf, StoreError> {
        if !hash_is_valid(hash) {
            return Err(StoreError::InvalidHash {
                hash: hash.to_string(),
            });
        }
        Ok(self.root.join(&hash[..2]).join(hash))
    }

    /// Store bytes, returning their content hash. Idempotent: if the
    /// blob already exists the bytes on disk are left untouched.
    pub fn put(&self, bytes: &[u8]) -> Result<BlobRef, StoreError> {
        let hash = hash_bytes(bytes);
        let shard = self.root.join(&hash[..2]);
        let path = shard.join(&hash);

        if !path.exists() {
            fs::create_dir_all(&shard).map_err(|source| StoreError::Unavailable {
                op: "create shard dir",
                path: shard.clone(),
                source,
            })?;

            let tmp = path.with_extension("tmp");
            {
                let mut f = fs::File::create(&tmp).map_err(|source| StoreError::Unavailable {
                    op: "create tmp blob",
                    path: tmp.clone(),
                    source,
                })?;
                f.write_all(bytes).map_err(|source| StoreError::Unavailable {
                    op: "write tmp blob",
                    path: tmp.clone(),
                    source,
                })?;
                f.sync_all().ok();
            }
            fs::rename(&tmp, &path).map_err(|source| StoreError::Unavailable {
                op: "rename blob",
                path: path.clone(),
                source,
            })?;
        }

        Ok(BlobRef {
            hash,
            size: bytes.len() as u64,
        })
    }

    /// Read a blob back by hash.
    pub fn get(&self, hash: &str) -> Result<Vec<u8>, StoreError> {
        let path = self.blob_path(hash)?;
        if !path.exists() {
            return Err(StoreError::UnknownBlob {
                hash: hash.to_string(),
            });
        }
        fs::read(&path).map_err(|source| StoreError::Unavailable {
            op: "read blob",
            path,
            source,
        })
    }

    pub fn contains(&self, hash: &str) -> bool {
        self.blob_path(hash).map(|p| p.exists()).unwrap_or(false)
    }
}
