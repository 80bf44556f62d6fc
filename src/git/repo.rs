//! Worktree handle.

use super::remote::{CloneOptions, Git2Remote, GitRemote};
use super::{GitAuth, normalize_url, run_blocking};
use crate::constants::{GIT_AUTHOR_EMAIL, GIT_AUTHOR_NAME};
use crate::error::{Error, Result};
use git2::build::CheckoutBuilder;
use git2::{BranchType, ObjectType, Oid, Repository, RepositoryInitOptions, ResetType, Signature};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Directory listing entry.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
}

/// Handle to a git worktree.
///
/// The libgit2 repository is reopened per operation, so the handle is
/// cheap to clone and safe to move across tasks. File paths are relative
/// to the worktree root and may not escape it.
#[derive(Clone)]
pub struct Repo {
    path: PathBuf,
    auth: Option<GitAuth>,
    remote: Arc<dyn GitRemote>,
}

impl std::fmt::Debug for Repo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repo")
            .field("path", &self.path)
            .field("auth", &self.auth)
            .finish()
    }
}

impl Repo {
    /// Initializes an empty repository with `main` as the initial branch.
    pub fn init(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut opts = RepositoryInitOptions::new();
        opts.initial_head("main");
        Repository::init_opts(&path, &opts)?;
        debug!(path = %path.display(), "Initialized repository");
        Ok(Self::new(path, Arc::new(Git2Remote)))
    }

    /// Opens an existing worktree.
    pub fn open(path: impl Into<PathBuf>, remote: Arc<dyn GitRemote>) -> Result<Self> {
        let path = path.into();
        Repository::open(&path).map_err(|e| Error::NotFound(format!("repository at {}: {}", path.display(), e)))?;
        Ok(Self::new(path, remote))
    }

    /// Clones `url` into `dest`.
    pub async fn clone_repo(
        cancel: &CancellationToken,
        url: &str,
        dest: impl Into<PathBuf>,
        remote: Arc<dyn GitRemote>,
        opts: CloneOptions,
    ) -> Result<Self> {
        let dest = dest.into();
        let url = normalize_url(url);
        let auth = opts.auth.clone();

        let transport = remote.clone();
        let target = dest.clone();
        run_blocking(cancel, "clone", move || transport.clone_repo(&url, &target, &opts)).await?;

        Ok(Self { path: dest, auth, remote })
    }

    fn new(path: PathBuf, remote: Arc<dyn GitRemote>) -> Self {
        Self {
            path,
            auth: None,
            remote,
        }
    }

    pub fn with_auth(mut self, auth: Option<GitAuth>) -> Self {
        self.auth = auth;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn repo(&self) -> Result<Repository> {
        Ok(Repository::open(&self.path)?)
    }

    fn resolve(&self, rel: &str) -> Result<PathBuf> {
        let rel_path = Path::new(rel);
        if rel.is_empty() || rel_path.components().any(|c| !matches!(c, Component::Normal(_) | Component::CurDir)) {
            return Err(Error::ValidationFailed(format!("path escapes repository: {}", rel)));
        }
        Ok(self.path.join(rel_path))
    }

    // =========================================================================
    // Checkout
    // =========================================================================

    /// Checks out a commit hash, a branch (local or `origin/`), or a tag.
    pub fn checkout_ref(&self, reference: &str) -> Result<()> {
        let repo = self.repo()?;

        if looks_like_hash(reference)
            && let Ok(commit) = repo.revparse_single(reference).and_then(|o| o.peel_to_commit())
        {
            return self.detach_to(&repo, commit.id());
        }

        if repo.find_branch(reference, BranchType::Local).is_ok() {
            return self.switch_to(&repo, reference);
        }

        let upstream = format!("origin/{}", reference);
        if let Ok(remote_branch) = repo.find_branch(&upstream, BranchType::Remote) {
            let commit = remote_branch.get().peel_to_commit()?;
            let mut local = repo.branch(reference, &commit, false)?;
            local.set_upstream(Some(upstream.as_str()))?;
            return self.switch_to(&repo, reference);
        }

        if let Ok(tag) = repo.find_reference(&format!("refs/tags/{}", reference)) {
            let commit = tag.peel_to_commit()?;
            return self.detach_to(&repo, commit.id());
        }

        Err(Error::RefNotFound(reference.to_string()))
    }

    /// Checks out a commit in detached mode.
    pub fn checkout_commit(&self, hash: &str) -> Result<()> {
        let repo = self.repo()?;
        let commit = repo
            .revparse_single(hash)
            .and_then(|o| o.peel_to_commit())
            .map_err(|_| Error::RefNotFound(hash.to_string()))?;
        self.detach_to(&repo, commit.id())
    }

    /// Creates `name` at HEAD and switches to it. No-op if already current.
    pub fn new_branch(&self, name: &str) -> Result<()> {
        if self.current_branch().ok().as_deref() == Some(name) {
            return Ok(());
        }

        let repo = self.repo()?;
        let head = repo.head()?.peel_to_commit()?;
        repo.branch(name, &head, false)?;
        self.switch_to(&repo, name)
    }

    /// Hard-resets the current branch, index, and worktree to
    /// `origin/<branch>` as last fetched. Unpushed commits and staged
    /// changes are dropped. No-op on a detached HEAD.
    pub fn reset_to_upstream(&self) -> Result<()> {
        let Ok(branch) = self.current_branch() else {
            return Ok(());
        };

        let repo = self.repo()?;
        let upstream = format!("origin/{}", branch);
        let target = repo
            .find_branch(&upstream, BranchType::Remote)
            .map_err(|_| Error::RefNotFound(upstream.clone()))?
            .get()
            .peel_to_commit()?;

        let head = repo.head().ok().and_then(|h| h.target());
        if head != Some(target.id()) {
            warn!(branch, local = ?head, upstream = %target.id(), "Discarding local commits");
        }

        repo.reset(target.as_object(), ResetType::Hard, Some(CheckoutBuilder::new().force()))?;
        debug!(branch, commit = %target.id(), "Reset to upstream");
        Ok(())
    }

    fn switch_to(&self, repo: &Repository, branch: &str) -> Result<()> {
        repo.set_head(&format!("refs/heads/{}", branch))?;
        repo.checkout_head(Some(CheckoutBuilder::new().force()))?;
        debug!(branch, "Checked out branch");
        Ok(())
    }

    fn detach_to(&self, repo: &Repository, oid: Oid) -> Result<()> {
        let object = repo.find_object(oid, Some(ObjectType::Commit))?;
        repo.checkout_tree(&object, Some(CheckoutBuilder::new().force()))?;
        repo.set_head_detached(oid)?;
        debug!(commit = %oid, "Checked out commit");
        Ok(())
    }

    // =========================================================================
    // Remote operations
    // =========================================================================

    /// Fetches from origin. [`Error::NoUpdates`] when nothing moved.
    pub async fn fetch(&self, cancel: &CancellationToken) -> Result<()> {
        let this = self.clone();
        run_blocking(cancel, "fetch", move || {
            let repo = this.repo()?;
            this.remote.fetch(&repo, this.auth.as_ref())
        })
        .await
    }

    /// Fast-forwards the current branch. [`Error::NoUpdates`] when up to date.
    pub async fn pull(&self, cancel: &CancellationToken) -> Result<()> {
        let branch = self.current_branch()?;
        let this = self.clone();
        run_blocking(cancel, "pull", move || {
            let repo = this.repo()?;
            this.remote.pull(&repo, &branch, this.auth.as_ref())
        })
        .await
    }

    /// Pushes the current branch to origin.
    pub async fn push(&self, cancel: &CancellationToken) -> Result<()> {
        let this = self.clone();
        run_blocking(cancel, "push", move || {
            let repo = this.repo()?;
            this.remote.push(&repo, this.auth.as_ref())
        })
        .await
    }

    // =========================================================================
    // Files
    // =========================================================================

    pub fn exists(&self, rel: &str) -> Result<bool> {
        Ok(self.resolve(rel)?.exists())
    }

    pub fn read_file(&self, rel: &str) -> Result<Vec<u8>> {
        let path = self.resolve(rel)?;
        std::fs::read(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::NotFound(rel.to_string()),
            _ => e.into(),
        })
    }

    /// Lists a directory, sorted by name. `.git` is hidden.
    pub fn read_dir(&self, rel: &str) -> Result<Vec<DirEntry>> {
        let path = self.resolve(rel)?;
        let reader = std::fs::read_dir(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::NotFound(rel.to_string()),
            _ => e.into(),
        })?;

        let mut entries = Vec::new();
        for entry in reader {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name == ".git" {
                continue;
            }
            entries.push(DirEntry {
                name,
                is_dir: entry.file_type()?.is_dir(),
            });
        }
        entries.sort();
        Ok(entries)
    }

    pub fn mkdir_all(&self, rel: &str) -> Result<()> {
        std::fs::create_dir_all(self.resolve(rel)?)?;
        Ok(())
    }

    /// Writes a file and stages it.
    pub fn write_file(&self, rel: &str, contents: &[u8]) -> Result<()> {
        let path = self.resolve(rel)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, contents)?;
        self.stage_file(rel)
    }

    /// Removes a file or directory and stages the deletion.
    pub fn remove_file(&self, rel: &str) -> Result<()> {
        let path = self.resolve(rel)?;
        let repo = self.repo()?;
        let mut index = repo.index()?;

        if path.is_dir() {
            std::fs::remove_dir_all(&path)?;
            index.remove_dir(Path::new(rel), 0)?;
        } else {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            if index.get_path(Path::new(rel), 0).is_some() {
                index.remove_path(Path::new(rel))?;
            }
        }

        index.write()?;
        Ok(())
    }

    /// Stages the worktree state of a path: added if present, removed if not.
    pub fn stage_file(&self, rel: &str) -> Result<()> {
        let path = self.resolve(rel)?;
        let repo = self.repo()?;
        let mut index = repo.index()?;

        if path.exists() {
            index.add_path(Path::new(rel))?;
        } else if index.get_path(Path::new(rel), 0).is_some() {
            index.remove_path(Path::new(rel))?;
        }

        index.write()?;
        Ok(())
    }

    // =========================================================================
    // History
    // =========================================================================

    /// True if the index differs from HEAD.
    pub fn has_changes(&self) -> Result<bool> {
        let repo = self.repo()?;
        let head_tree = match repo.head() {
            Ok(head) => Some(head.peel_to_tree()?),
            Err(e) if e.code() == git2::ErrorCode::UnbornBranch => None,
            Err(e) => return Err(e.into()),
        };

        let diff = repo.diff_tree_to_index(head_tree.as_ref(), None, None)?;
        Ok(diff.deltas().len() > 0)
    }

    /// Commits the index as the fixed automation identity and returns the hash.
    pub fn commit(&self, message: &str) -> Result<String> {
        let repo = self.repo()?;
        let sig = Signature::now(GIT_AUTHOR_NAME, GIT_AUTHOR_EMAIL)?;

        let mut index = repo.index()?;
        let tree = repo.find_tree(index.write_tree()?)?;

        let parent = match repo.head() {
            Ok(head) => Some(head.peel_to_commit()?),
            Err(e) if e.code() == git2::ErrorCode::UnbornBranch => None,
            Err(e) => return Err(e.into()),
        };
        let parents: Vec<&git2::Commit<'_>> = parent.iter().collect();

        let oid = repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)?;
        info!(commit = %oid, "Created commit");
        Ok(oid.to_string())
    }

    pub fn head_commit(&self) -> Result<String> {
        let repo = self.repo()?;
        let commit = repo.head()?.peel_to_commit()?;
        Ok(commit.id().to_string())
    }

    /// Current branch name. Fails on a detached HEAD.
    pub fn current_branch(&self) -> Result<String> {
        let repo = self.repo()?;

        match repo.head() {
            Ok(head) if head.is_branch() => head
                .shorthand()
                .map(str::to_string)
                .ok_or_else(|| Error::Git("branch name is not UTF-8".to_string())),
            Ok(_) => Err(Error::Git("HEAD is detached".to_string())),
            Err(e) if e.code() == git2::ErrorCode::UnbornBranch => {
                let head = repo.find_reference("HEAD")?;
                head.symbolic_target()
                    .and_then(|t| t.strip_prefix("refs/heads/"))
                    .map(str::to_string)
                    .ok_or_else(|| Error::Git("HEAD is not a branch".to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Name of an annotated tag pointing at HEAD.
    pub fn current_tag(&self) -> Result<String> {
        let repo = self.repo()?;
        let head = repo.head()?.peel_to_commit()?.id();

        let mut found = None;
        repo.tag_foreach(|oid, _name| {
            if let Ok(tag) = repo.find_tag(oid)
                && tag.target_id() == head
            {
                found = tag.name().map(str::to_string);
                return false;
            }
            true
        })
        .or_else(|e| if found.is_some() { Ok(()) } else { Err(e) })?;

        found.ok_or(Error::TagNotFound)
    }
}

fn looks_like_hash(s: &str) -> bool {
    (4..=40).contains(&s.len()) && s.chars().all(|c| c.is_ascii_hexdigit())
}
