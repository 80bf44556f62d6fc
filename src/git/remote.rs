//! Git transport over libgit2.

use super::GitAuth;
use crate::error::{Error, Result};
use git2::build::{CheckoutBuilder, RepoBuilder};
use git2::{AutotagOption, Cred, FetchOptions, PushOptions, RemoteCallbacks, Repository};
use std::cell::{Cell, RefCell};
use std::path::Path;
use tracing::{debug, info};

const MAX_AUTH_ATTEMPTS: u32 = 3;

/// Options for a fresh clone.
#[derive(Debug, Clone, Default)]
pub struct CloneOptions {
    /// Shallow clone depth. `None` fetches full history.
    pub depth: Option<u32>,
    /// Branch to check out instead of the remote HEAD.
    pub branch: Option<String>,
    pub auth: Option<GitAuth>,
}

/// Network side of a repository.
///
/// Calls block; async callers run them through the blocking pool.
pub trait GitRemote: Send + Sync {
    fn clone_repo(&self, url: &str, dest: &Path, opts: &CloneOptions) -> Result<()>;

    /// Fetches all branches and tags from `origin`. [`Error::NoUpdates`] if
    /// no ref moved.
    fn fetch(&self, repo: &Repository, auth: Option<&GitAuth>) -> Result<()>;

    /// Fetches `branch` and fast-forwards the local branch to it.
    /// [`Error::NoUpdates`] if already up to date.
    fn pull(&self, repo: &Repository, branch: &str, auth: Option<&GitAuth>) -> Result<()>;

    /// Pushes the current branch to `origin`.
    fn push(&self, repo: &Repository, auth: Option<&GitAuth>) -> Result<()>;
}

/// libgit2 transport.
#[derive(Debug, Default, Clone, Copy)]
pub struct Git2Remote;

fn callbacks<'a>(auth: Option<&GitAuth>) -> RemoteCallbacks<'a> {
    let mut cb = RemoteCallbacks::new();
    if let Some(auth) = auth.cloned() {
        let mut attempts = 0;
        cb.credentials(move |_url, _username, _allowed| {
            attempts += 1;
            if attempts > MAX_AUTH_ATTEMPTS {
                return Err(git2::Error::new(
                    git2::ErrorCode::Auth,
                    git2::ErrorClass::Http,
                    "authentication rejected",
                ));
            }
            Cred::userpass_plaintext(&auth.username, &auth.token)
        });
    }
    cb
}

impl GitRemote for Git2Remote {
    fn clone_repo(&self, url: &str, dest: &Path, opts: &CloneOptions) -> Result<()> {
        info!(url, dest = %dest.display(), "Cloning repository");

        let mut fo = FetchOptions::new();
        fo.remote_callbacks(callbacks(opts.auth.as_ref()));
        fo.download_tags(AutotagOption::All);
        if let Some(depth) = opts.depth.filter(|d| *d > 0) {
            fo.depth(depth as i32);
        }

        let mut builder = RepoBuilder::new();
        builder.fetch_options(fo);
        if let Some(branch) = &opts.branch {
            builder.branch(branch);
        }

        builder.clone(url, dest)?;
        Ok(())
    }

    fn fetch(&self, repo: &Repository, auth: Option<&GitAuth>) -> Result<()> {
        let updated = Cell::new(false);
        let mut remote = repo.find_remote("origin")?;

        {
            let mut cb = callbacks(auth);
            cb.update_tips(|refname, _old, _new| {
                debug!(refname, "Ref updated");
                updated.set(true);
                true
            });

            let mut fo = FetchOptions::new();
            fo.remote_callbacks(cb);
            fo.download_tags(AutotagOption::All);
            remote.fetch::<&str>(&[], Some(&mut fo), None)?;
        }

        if updated.get() { Ok(()) } else { Err(Error::NoUpdates) }
    }

    fn pull(&self, repo: &Repository, branch: &str, auth: Option<&GitAuth>) -> Result<()> {
        let mut remote = repo.find_remote("origin")?;
        let mut fo = FetchOptions::new();
        fo.remote_callbacks(callbacks(auth));
        remote.fetch(&[branch], Some(&mut fo), None)?;

        let fetch_head = repo.find_reference("FETCH_HEAD")?;
        let incoming = repo.reference_to_annotated_commit(&fetch_head)?;
        let (analysis, _) = repo.merge_analysis(&[&incoming])?;

        if analysis.is_up_to_date() {
            return Err(Error::NoUpdates);
        }
        if !(analysis.is_fast_forward() || analysis.is_unborn()) {
            return Err(Error::Git(format!("cannot fast-forward {} to origin", branch)));
        }

        let refname = format!("refs/heads/{}", branch);
        match repo.find_reference(&refname) {
            Ok(mut reference) => {
                reference.set_target(incoming.id(), "pull: fast-forward")?;
            }
            Err(_) => {
                repo.reference(&refname, incoming.id(), true, "pull: create branch")?;
            }
        }
        repo.set_head(&refname)?;
        repo.checkout_head(Some(CheckoutBuilder::new().force()))?;

        debug!(branch, commit = %incoming.id(), "Fast-forwarded");
        Ok(())
    }

    fn push(&self, repo: &Repository, auth: Option<&GitAuth>) -> Result<()> {
        let head = repo.head()?;
        let refname = head
            .name()
            .filter(|_| head.is_branch())
            .ok_or_else(|| Error::Git("cannot push a detached HEAD".to_string()))?
            .to_string();

        let rejection = RefCell::new(None::<String>);
        let mut remote = repo.find_remote("origin")?;

        {
            let mut cb = callbacks(auth);
            cb.push_update_reference(|reference, status| {
                if let Some(msg) = status {
                    *rejection.borrow_mut() = Some(format!("{}: {}", reference, msg));
                }
                Ok(())
            });

            let mut po = PushOptions::new();
            po.remote_callbacks(cb);
            remote.push(&[format!("{}:{}", refname, refname)], Some(&mut po))?;
        }

        if let Some(reason) = rejection.into_inner() {
            return Err(Error::Git(format!("push rejected: {}", reason)));
        }

        info!(refname, "Pushed");
        Ok(())
    }
}
