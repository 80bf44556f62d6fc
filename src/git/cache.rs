//! Deterministic clone cache.
//!
//! Each URL maps to `<root>/<url without scheme or .git>`. The cache does no
//! locking of its own on disk; callers take [`CachedRepos::lock`] for the
//! URL while they use the checkout.

use super::remote::{CloneOptions, GitRemote};
use super::{GitAuth, Repo};
use crate::error::Result;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Cache location for `url` under `root`.
pub fn cache_path(root: &Path, url: &str) -> PathBuf {
    let mut stripped = url;
    for scheme in ["https://", "http://", "git://", "ssh://", "file://"] {
        if let Some(rest) = stripped.strip_prefix(scheme) {
            stripped = rest;
            break;
        }
    }
    let stripped = stripped.strip_suffix(".git").unwrap_or(stripped);
    let stripped = stripped.trim_start_matches('/').replace(':', "/");

    // Drop `..` so a URL can't point the cache outside its root
    let rel: PathBuf = stripped
        .split('/')
        .filter(|p| !p.is_empty() && *p != "." && *p != "..")
        .collect();
    root.join(rel)
}

/// Clone cache shared across reconcile ticks.
pub struct CachedRepos {
    root: PathBuf,
    remote: Arc<dyn GitRemote>,
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl CachedRepos {
    pub fn new(root: impl Into<PathBuf>, remote: Arc<dyn GitRemote>) -> Self {
        Self {
            root: root.into(),
            remote,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn remote(&self) -> &Arc<dyn GitRemote> {
        &self.remote
    }

    pub fn path_for(&self, url: &str) -> PathBuf {
        cache_path(&self.root, url)
    }

    /// Serializes users of the same URL. Different URLs never contend.
    ///
    /// Locks nobody holds or waits on are pruned on the way in, so the map
    /// only tracks URLs in use.
    pub async fn lock(&self, url: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks
                .entry(cache_path(Path::new(""), url).to_string_lossy().into_owned())
                .or_default()
                .clone()
        };
        lock.lock_owned().await
    }

    #[cfg(test)]
    fn tracked_locks(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Opens the cached checkout for `url`, cloning it on first use.
    pub async fn open_or_clone(&self, cancel: &CancellationToken, url: &str, auth: Option<GitAuth>) -> Result<Repo> {
        let path = self.path_for(url);

        if path.join(".git").exists() {
            match Repo::open(&path, self.remote.clone()) {
                Ok(repo) => {
                    debug!(url, path = %path.display(), "Using cached repository");
                    return Ok(repo.with_auth(auth));
                }
                Err(e) => warn!(url, "Cached repository is unusable, recloning: {}", e),
            }
        }

        if path.exists() {
            tokio::fs::remove_dir_all(&path).await?;
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let opts = CloneOptions {
            auth,
            ..Default::default()
        };
        Repo::clone_repo(cancel, url, path, self.remote.clone(), opts).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_path_strips_scheme_and_suffix() {
        let root = Path::new("/cache/forge");
        assert_eq!(
            cache_path(root, "https://github.com/org/deploy.git"),
            PathBuf::from("/cache/forge/github.com/org/deploy")
        );
        assert_eq!(
            cache_path(root, "github.com/org/deploy"),
            PathBuf::from("/cache/forge/github.com/org/deploy")
        );
        assert_eq!(
            cache_path(root, "git://host/../../etc"),
            PathBuf::from("/cache/forge/host/etc")
        );
    }

    #[tokio::test]
    async fn test_lock_is_per_url() {
        let cache = CachedRepos::new("/tmp/unused", Arc::new(super::super::Git2Remote));

        let _a = cache.lock("github.com/org/a").await;
        // Different URL must not block
        let b = tokio::time::timeout(std::time::Duration::from_secs(1), cache.lock("github.com/org/b")).await;
        assert!(b.is_ok());

        let same = tokio::time::timeout(std::time::Duration::from_millis(50), cache.lock("github.com/org/a")).await;
        assert!(same.is_err());
    }

    #[tokio::test]
    async fn test_released_locks_are_pruned() {
        let cache = CachedRepos::new("/tmp/unused", Arc::new(super::super::Git2Remote));

        for i in 0..10 {
            drop(cache.lock(&format!("github.com/org/repo-{}", i)).await);
        }
        let _held = cache.lock("github.com/org/held").await;
        assert_eq!(cache.tracked_locks(), 1);

        let _other = cache.lock("github.com/org/other").await;
        assert_eq!(cache.tracked_locks(), 2);
    }
}
