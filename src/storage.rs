//! # Content-Addressed Blob Storage
//!
//! Stores OCI manifests and layers by their SHA-256 digest and resolves
//! human-readable references to descriptors.
//!
//! ## Storage Model
//!
//! ```text
//! <root>/blobs/
//! └── sha256/
//!     ├── 2cf24dba5fb0a30e...  (blob content)
//!     └── 9f86d081884c7d65...  (blob content)
//! ```
//!
//! The file name is the hex digest with the algorithm prefix stripped, so
//! the layout is deterministic and inspectable with ordinary tools.
//!
//! ## Security Model
//!
//! ### Digest Verification
//!
//! [`ContentStore::push`] hashes the stream while writing it to a temp file.
//! The temp file only becomes visible under its digest once both the byte
//! count and the hash match the descriptor. Any mismatch deletes the partial
//! file and surfaces [`Error::DigestMismatch`] or [`Error::SizeMismatch`].
//!
//! ### Path Traversal Protection
//!
//! Digests are parsed strictly (`sha256:` followed by 64 lowercase hex
//! characters) before any path is built from them.
//!
//! ## Concurrency
//!
//! Reads proceed in parallel. The tag map and the completed-blob set sit
//! behind reader/writer locks that are only taken for the map update itself,
//! never across I/O.
//!
//! ## Example
//!
//! ```rust,ignore
//! use forge_deployer::{ContentStore, Descriptor};
//! use tokio_util::sync::CancellationToken;
//!
//! let store = ContentStore::open(root)?;
//! let desc = Descriptor::for_bytes("application/octet-stream", b"hello");
//! store.push(&CancellationToken::new(), &desc, &b"hello"[..]).await?;
//! assert!(store.exists(&desc));
//! ```

use crate::constants::BLOBS_DIR;
use crate::error::{Error, ResourceLimitKind, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const COPY_BUFFER: usize = 64 * 1024;

/// The `(mediaType, digest, size)` triple identifying a blob.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub digest: String,
    pub size: u64,
}

impl Descriptor {
    pub fn new(media_type: impl Into<String>, digest: impl Into<String>, size: u64) -> Self {
        Self {
            media_type: media_type.into(),
            digest: digest.into(),
            size,
        }
    }

    /// Builds the descriptor for in-memory content.
    pub fn for_bytes(media_type: impl Into<String>, data: &[u8]) -> Self {
        Self::new(media_type, sha256_digest(data), data.len() as u64)
    }
}

/// Formats the `sha256:<hex>` digest of `data`.
pub fn sha256_digest(data: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(data)))
}

/// Content-addressed blob store with an in-memory tag index.
///
/// Blobs persist on disk across restarts; tags do not.
pub struct ContentStore {
    root: PathBuf,
    tags: RwLock<HashMap<String, Descriptor>>,
    blobs: RwLock<HashSet<String>>,
}

impl ContentStore {
    /// Opens (creating if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let blob_dir = root.join(BLOBS_DIR).join("sha256");
        std::fs::create_dir_all(&blob_dir).map_err(|e| Error::InitFailed {
            path: blob_dir.clone(),
            reason: e.to_string(),
        })?;

        info!("Content store initialized at: {}", root.display());

        Ok(Self {
            root,
            tags: RwLock::new(HashMap::new()),
            blobs: RwLock::new(HashSet::new()),
        })
    }

    /// Returns the store root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the on-disk path for a digest.
    ///
    /// # Security
    ///
    /// Only `sha256:` digests with exactly 64 hex characters are accepted.
    pub fn blob_path(&self, digest: &str) -> Result<PathBuf> {
        let hex = parse_sha256(digest)?;
        Ok(self.root.join(BLOBS_DIR).join("sha256").join(hex))
    }

    /// Streams `reader` into the store under `desc.digest`.
    ///
    /// Fails with [`Error::SizeMismatch`] if the stream length differs from
    /// `desc.size` and [`Error::DigestMismatch`] if the content hash differs.
    /// On failure nothing is left behind and `exists(desc)` stays false.
    pub async fn push<R>(&self, cancel: &CancellationToken, desc: &Descriptor, mut reader: R) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        check_cancelled(cancel, "push")?;

        let path = self.blob_path(&desc.digest)?;
        if self.exists(desc) {
            debug!(digest = %desc.digest, "Blob already present");
            return Ok(());
        }

        let temp_path = path.with_extension(format!("tmp.{}", uuid::Uuid::now_v7()));
        let result = self.copy_verified(cancel, desc, &mut reader, &temp_path).await;

        if let Err(e) = result {
            if let Err(rm) = fs::remove_file(&temp_path).await
                && rm.kind() != std::io::ErrorKind::NotFound
            {
                warn!(path = %temp_path.display(), "Failed to remove partial blob: {}", rm);
            }
            return Err(e);
        }

        if let Err(e) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e.into());
        }

        self.blobs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(desc.digest.clone());

        debug!(digest = %desc.digest, size = desc.size, "Stored blob (verified)");
        Ok(())
    }

    async fn copy_verified<R>(
        &self,
        cancel: &CancellationToken,
        desc: &Descriptor,
        reader: &mut R,
        temp_path: &Path,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let mut file = fs::File::create(temp_path).await?;
        let mut hasher = Sha256::new();
        let mut written = 0u64;
        let mut buf = vec![0u8; COPY_BUFFER];

        loop {
            let n = tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(Error::Cancelled(format!("push {}", desc.digest)));
                }
                n = reader.read(&mut buf) => n?,
            };
            if n == 0 {
                break;
            }

            written += n as u64;
            if written > desc.size {
                return Err(Error::SizeMismatch {
                    subject: desc.digest.clone(),
                    expected: desc.size,
                    actual: written,
                });
            }

            hasher.update(&buf[..n]);
            file.write_all(&buf[..n]).await?;
        }

        file.flush().await?;
        file.sync_all().await?;

        if written != desc.size {
            return Err(Error::SizeMismatch {
                subject: desc.digest.clone(),
                expected: desc.size,
                actual: written,
            });
        }

        let actual = format!("sha256:{}", hex::encode(hasher.finalize()));
        if actual != desc.digest {
            return Err(Error::DigestMismatch {
                expected: desc.digest.clone(),
                actual,
            });
        }

        Ok(())
    }

    /// Opens a stored blob for reading.
    pub async fn fetch(&self, cancel: &CancellationToken, desc: &Descriptor) -> Result<fs::File> {
        check_cancelled(cancel, "fetch")?;

        let path = self.blob_path(&desc.digest)?;
        fs::File::open(&path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::NotFound(format!("blob {}", desc.digest)),
            _ => Error::Io(e),
        })
    }

    /// Reads a whole blob, refusing anything larger than `max` bytes.
    pub async fn read_bounded(&self, cancel: &CancellationToken, desc: &Descriptor, max: u64) -> Result<Vec<u8>> {
        if desc.size > max {
            return Err(Error::ResourceLimit {
                limit: ResourceLimitKind::Manifest,
                size: desc.size,
                max,
            });
        }

        let file = self.fetch(cancel, desc).await?;
        let mut data = Vec::with_capacity(desc.size as usize);
        // One extra byte distinguishes "exactly max" from "more than max".
        file.take(max + 1).read_to_end(&mut data).await?;

        if data.len() as u64 > max {
            return Err(Error::ResourceLimit {
                limit: ResourceLimitKind::Manifest,
                size: data.len() as u64,
                max,
            });
        }

        Ok(data)
    }

    /// Returns true if a verified blob for `desc` is present.
    pub fn exists(&self, desc: &Descriptor) -> bool {
        if self
            .blobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&desc.digest)
        {
            return true;
        }

        self.blob_path(&desc.digest).map(|p| p.is_file()).unwrap_or(false)
    }

    /// Associates a human reference with a descriptor.
    pub fn tag(&self, desc: &Descriptor, reference: &str) -> Result<()> {
        if reference.is_empty() {
            return Err(Error::InvalidRef {
                reference: reference.to_string(),
                reason: "empty reference".to_string(),
            });
        }

        self.tags
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(reference.to_string(), desc.clone());
        Ok(())
    }

    /// Resolves a human reference to its descriptor.
    pub fn resolve(&self, reference: &str) -> Result<Descriptor> {
        self.tags
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(reference)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("reference {}", reference)))
    }

    /// Removes a blob from disk. Eviction policy belongs to the store owner.
    pub async fn remove(&self, desc: &Descriptor) -> Result<()> {
        let path = self.blob_path(&desc.digest)?;
        self.blobs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&desc.digest);

        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Drops the in-memory indexes. Blobs stay on disk.
    pub fn close(&self) {
        self.tags.write().unwrap_or_else(PoisonError::into_inner).clear();
        self.blobs.write().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

fn parse_sha256(digest: &str) -> Result<&str> {
    let hex = digest.strip_prefix("sha256:").ok_or_else(|| Error::InvalidRef {
        reference: digest.to_string(),
        reason: "only sha256 digests are supported".to_string(),
    })?;

    if hex.len() != 64 || !hex.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)) {
        return Err(Error::InvalidRef {
            reference: digest.to_string(),
            reason: "digest must be 64 lowercase hex characters".to_string(),
        });
    }

    Ok(hex)
}

pub(crate) fn check_cancelled(cancel: &CancellationToken, op: &str) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(Error::Cancelled(op.to_string()));
    }
    Ok(())
}
