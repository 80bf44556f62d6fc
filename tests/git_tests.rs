//! Tests for repository plumbing against on-disk remotes.
//!
//! Covers the clone cache, fetch and pull signalling, push, and the git
//! module generator end to end.

mod common;

use common::{bare_remote, remote_head};
use forge_deployer::error::ErrorKind;
use forge_deployer::generator::GitGenerator;
use forge_deployer::git::CloneOptions;
use forge_deployer::{CachedRepos, Git2Remote, ManifestGenerator, Module, Repo};
use std::sync::Arc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

async fn clone(cancel: &CancellationToken, url: &str, dest: &std::path::Path) -> Repo {
    Repo::clone_repo(cancel, url, dest, Arc::new(Git2Remote), CloneOptions::default())
        .await
        .unwrap()
}

// =============================================================================
// Cache
// =============================================================================

#[tokio::test]
async fn test_cache_clones_once_then_reuses() {
    let temp = TempDir::new().unwrap();
    let remote = bare_remote(temp.path(), "src", &[("a.txt", b"a")]);
    let cache = CachedRepos::new(temp.path().join("cache"), Arc::new(Git2Remote));
    let cancel = CancellationToken::new();

    let first = cache.open_or_clone(&cancel, &remote.url(), None).await.unwrap();
    assert_eq!(first.path(), cache.path_for(&remote.url()));
    assert_eq!(first.read_file("a.txt").unwrap(), b"a");

    // A marker in the worktree survives a second open
    std::fs::write(first.path().join("marker"), b"1").unwrap();
    let second = cache.open_or_clone(&cancel, &remote.url(), None).await.unwrap();
    assert!(second.path().join("marker").exists());
}

#[tokio::test]
async fn test_cache_reclones_broken_checkout() {
    let temp = TempDir::new().unwrap();
    let remote = bare_remote(temp.path(), "src", &[("a.txt", b"a")]);
    let cache = CachedRepos::new(temp.path().join("cache"), Arc::new(Git2Remote));
    let cancel = CancellationToken::new();

    let path = cache.path_for(&remote.url());
    std::fs::create_dir_all(&path).unwrap();
    std::fs::write(path.join("junk"), b"not a repo").unwrap();

    let repo = cache.open_or_clone(&cancel, &remote.url(), None).await.unwrap();
    assert_eq!(repo.head_commit().unwrap(), remote.head);
    assert!(!path.join("junk").exists());
}

// =============================================================================
// Fetch, Pull, Push
// =============================================================================

#[tokio::test]
async fn test_fetch_and_pull_report_no_updates() {
    let temp = TempDir::new().unwrap();
    let remote = bare_remote(temp.path(), "deploy", &[("a.txt", b"a")]);
    let cancel = CancellationToken::new();

    let repo = clone(&cancel, &remote.url(), &temp.path().join("work")).await;
    assert_eq!(repo.fetch(&cancel).await.unwrap_err().kind(), ErrorKind::NoUpdates);
    assert_eq!(repo.pull(&cancel).await.unwrap_err().kind(), ErrorKind::NoUpdates);
}

#[tokio::test]
async fn test_push_then_pull_elsewhere() {
    let temp = TempDir::new().unwrap();
    let remote = bare_remote(temp.path(), "deploy", &[("a.txt", b"a")]);
    let cancel = CancellationToken::new();

    let writer = clone(&cancel, &remote.url(), &temp.path().join("writer")).await;
    let reader = clone(&cancel, &remote.url(), &temp.path().join("reader")).await;

    writer.write_file("b.txt", b"b").unwrap();
    let hash = writer.commit("add b").unwrap();
    writer.push(&cancel).await.unwrap();
    assert_eq!(remote_head(&remote.path, "main"), hash);

    reader.pull(&cancel).await.unwrap();
    assert_eq!(reader.head_commit().unwrap(), hash);
    assert_eq!(reader.read_file("b.txt").unwrap(), b"b");
}

#[tokio::test]
async fn test_reset_to_upstream_drops_unpushed_commit() {
    let temp = TempDir::new().unwrap();
    let remote = bare_remote(temp.path(), "deploy", &[("a.txt", b"a")]);
    let cancel = CancellationToken::new();

    let stale = clone(&cancel, &remote.url(), &temp.path().join("stale")).await;
    stale.write_file("local.txt", b"never pushed").unwrap();
    stale.commit("local only").unwrap();

    // Origin moves on independently
    let other = clone(&cancel, &remote.url(), &temp.path().join("other")).await;
    other.write_file("b.txt", b"b").unwrap();
    let upstream = other.commit("add b").unwrap();
    other.push(&cancel).await.unwrap();

    // A diverged branch cannot be pulled
    assert_eq!(stale.pull(&cancel).await.unwrap_err().kind(), ErrorKind::Git);

    stale.fetch(&cancel).await.ok();
    stale.reset_to_upstream().unwrap();

    assert_eq!(stale.head_commit().unwrap(), upstream);
    assert_eq!(stale.current_branch().unwrap(), "main");
    assert!(!stale.exists("local.txt").unwrap());
    assert_eq!(stale.read_file("b.txt").unwrap(), b"b");
    assert!(!stale.has_changes().unwrap());
}

#[tokio::test]
async fn test_reset_to_upstream_detached_is_noop() {
    let temp = TempDir::new().unwrap();
    let remote = bare_remote(temp.path(), "src", &[("a.txt", b"a")]);
    let cancel = CancellationToken::new();

    let repo = clone(&cancel, &remote.url(), &temp.path().join("work")).await;
    repo.checkout_commit(&remote.head).unwrap();
    repo.reset_to_upstream().unwrap();
    assert_eq!(repo.head_commit().unwrap(), remote.head);
}

#[tokio::test]
async fn test_checkout_pinned_commit() {
    let temp = TempDir::new().unwrap();
    let remote = bare_remote(temp.path(), "src", &[("a.txt", b"v1")]);
    let cancel = CancellationToken::new();

    let repo = clone(&cancel, &remote.url(), &temp.path().join("work")).await;
    repo.write_file("a.txt", b"v2").unwrap();
    repo.commit("v2").unwrap();

    repo.checkout_commit(&remote.head).unwrap();
    assert_eq!(repo.read_file("a.txt").unwrap(), b"v1");
    assert!(repo.current_branch().is_err());

    let err = repo.checkout_commit("0123456789abcdef0123456789abcdef01234567").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RefNotFound);
}

// =============================================================================
// Git Generator
// =============================================================================

fn git_module(url: &str, paths: &[&str]) -> Module {
    Module {
        name: "manifests".into(),
        registry: url.into(),
        module_type: "git".into(),
        version: "main".into(),
        values: serde_json::json!({ "paths": paths }),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_git_generator_concatenates_paths() {
    let temp = TempDir::new().unwrap();
    let remote = bare_remote(
        temp.path(),
        "manifests",
        &[
            ("deploy/a.yaml", b"kind: A\n"),
            ("deploy/b.yaml", b"---\nkind: B\n"),
        ],
    );
    let work = temp.path().join("scratch");
    let generator = GitGenerator::new(Arc::new(Git2Remote), &work);

    let module = git_module(&remote.url(), &["deploy/a.yaml", "deploy/b.yaml"]);
    let out = generator
        .generate(&CancellationToken::new(), &module, "test")
        .await
        .unwrap();

    assert_eq!(out, b"kind: A\n\n---\nkind: B\n");
    // Scratch clones are removed
    assert_eq!(std::fs::read_dir(&work).unwrap().count(), 0);
}

#[tokio::test]
async fn test_git_generator_missing_path() {
    let temp = TempDir::new().unwrap();
    let remote = bare_remote(temp.path(), "manifests", &[("deploy/a.yaml", b"kind: A\n")]);
    let generator = GitGenerator::new(Arc::new(Git2Remote), &temp.path().join("scratch"));

    let module = git_module(&remote.url(), &["deploy/missing.yaml"]);
    let err = generator
        .generate(&CancellationToken::new(), &module, "test")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PathNotFound);
}

#[tokio::test]
async fn test_git_generator_unknown_version() {
    let temp = TempDir::new().unwrap();
    let remote = bare_remote(temp.path(), "manifests", &[("deploy/a.yaml", b"kind: A\n")]);
    let generator = GitGenerator::new(Arc::new(Git2Remote), &temp.path().join("scratch"));

    let mut module = git_module(&remote.url(), &["deploy/a.yaml"]);
    module.version = "v9.9.9".into();
    let err = generator
        .generate(&CancellationToken::new(), &module, "test")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RefNotFound);
}
