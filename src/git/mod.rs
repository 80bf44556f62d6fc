//! Git repository handling.
//!
//! - [`Repo`]: worktree handle (checkout, stage, commit, push)
//! - [`GitRemote`]: transport seam, implemented over libgit2 by [`Git2Remote`]
//! - [`CachedRepos`]: deterministic on-disk clone cache with per-URL locks
//!
//! libgit2 is blocking. Network operations run on the blocking pool and
//! race the caller's cancellation token.

mod cache;
mod remote;
mod repo;

pub use cache::{CachedRepos, cache_path};
pub use remote::{CloneOptions, Git2Remote, GitRemote};
pub use repo::{DirEntry, Repo};

use crate::constants::GIT_AUTH_USERNAME;
use crate::error::{Error, Result};
use crate::storage::check_cancelled;
use std::path::Path;
use tokio_util::sync::CancellationToken;

/// Basic auth for HTTPS remotes.
#[derive(Clone, PartialEq, Eq)]
pub struct GitAuth {
    pub username: String,
    pub token: String,
}

impl GitAuth {
    /// Token auth under the fixed `forge` username.
    pub fn token(token: impl Into<String>) -> Self {
        Self {
            username: GIT_AUTH_USERNAME.to_string(),
            token: token.into(),
        }
    }
}

impl std::fmt::Debug for GitAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitAuth")
            .field("username", &self.username)
            .field("token", &"<redacted>")
            .finish()
    }
}

/// Adds `https://` to scheme-less remote URLs. Local paths and scp-style
/// SSH addresses pass through.
pub fn normalize_url(url: &str) -> String {
    if url.contains("://")
        || url.starts_with('/')
        || url.starts_with('.')
        || url.starts_with("git@")
        || Path::new(url).exists()
    {
        url.to_string()
    } else {
        format!("https://{}", url)
    }
}

/// Runs blocking git work off the async runtime, abandoning it on cancellation.
pub(crate) async fn run_blocking<T, F>(cancel: &CancellationToken, op: &str, f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    check_cancelled(cancel, op)?;
    let handle = tokio::task::spawn_blocking(f);

    tokio::select! {
        res = handle => res.map_err(|e| Error::Internal(format!("{} task failed: {}", op, e)))?,
        _ = cancel.cancelled() => Err(Error::Cancelled(op.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_url() {
        assert_eq!(normalize_url("github.com/org/deploy"), "https://github.com/org/deploy");
        assert_eq!(normalize_url("https://github.com/org/deploy"), "https://github.com/org/deploy");
        assert_eq!(normalize_url("/srv/git/deploy.git"), "/srv/git/deploy.git");
        assert_eq!(normalize_url("git@github.com:org/deploy.git"), "git@github.com:org/deploy.git");
    }

    #[test]
    fn test_auth_debug_redacts_token() {
        let auth = GitAuth::token("hunter2");
        let rendered = format!("{:?}", auth);
        assert!(rendered.contains("forge"));
        assert!(!rendered.contains("hunter2"));
    }
}
