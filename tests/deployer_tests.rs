//! Tests for the Bundle Engine against real repositories.
//!
//! Each test clones a bare remote, stages a deployment, and inspects what
//! reached the remote.

mod common;

use async_trait::async_trait;
use common::{BLUEPRINT, MANIFEST_YAML, bare_remote, commit_count, remote_file, remote_head};
use forge_deployer::deployer::DeploymentPayload;
use forge_deployer::error::{Error, ErrorKind, Result};
use forge_deployer::git::CloneOptions;
use forge_deployer::{
    Blueprint, CreateOptions, Deployer, Git2Remote, GeneratorRegistry, ManifestGenerator, Module, ModuleBundle, Repo,
    StaticGenerator,
};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const PROJECT_DIR: &str = "root/test/p";

/// Emits a module's values as JSON, so overlays are observable.
struct ValuesGenerator;

#[async_trait]
impl ManifestGenerator for ValuesGenerator {
    async fn generate(&self, _cancel: &CancellationToken, module: &Module, env: &str) -> Result<Vec<u8>> {
        let doc = serde_json::json!({ "env": env, "values": module.values });
        Ok(serde_json::to_vec(&doc)?)
    }
}

struct FailingGenerator;

#[async_trait]
impl ManifestGenerator for FailingGenerator {
    async fn generate(&self, _cancel: &CancellationToken, module: &Module, _env: &str) -> Result<Vec<u8>> {
        Err(Error::Command {
            program: "kcl".to_string(),
            status: "exit status: 1".to_string(),
            stderr: format!("kcl run failed for {}", module.name),
        })
    }
}

fn static_deployer() -> Deployer {
    let mut registry = GeneratorRegistry::new();
    registry.register("kcl", || Box::new(StaticGenerator::new(MANIFEST_YAML)));
    Deployer::new(Arc::new(registry), "root")
}

fn deployer_with(generator: fn() -> Box<dyn ManifestGenerator>) -> Deployer {
    let mut registry = GeneratorRegistry::new();
    registry.register("kcl", generator);
    Deployer::new(Arc::new(registry), "root")
}

fn bundle() -> ModuleBundle {
    Blueprint::parse(BLUEPRINT).unwrap().bundle().unwrap()
}

fn options() -> CreateOptions {
    let mut metadata = BTreeMap::new();
    metadata.insert("release_id".to_string(), "p-1".to_string());
    CreateOptions {
        id: "p-1-xyz".into(),
        metadata,
    }
}

async fn clone(cancel: &CancellationToken, url: &str, dest: &Path) -> Repo {
    Repo::clone_repo(cancel, url, dest, Arc::new(Git2Remote), CloneOptions::default())
        .await
        .unwrap()
}

// =============================================================================
// Create and Commit
// =============================================================================

#[tokio::test]
async fn test_deployment_reaches_remote() {
    let temp = TempDir::new().unwrap();
    let remote = bare_remote(temp.path(), "deploy", &[("README.md", b"deploy\n")]);
    let cancel = CancellationToken::new();

    let repo = clone(&cancel, &remote.url(), &temp.path().join("work")).await;
    let deployment = static_deployer()
        .create_deployment(&cancel, repo, "p", &bundle(), options())
        .await
        .unwrap();

    assert_eq!(deployment.path(), PROJECT_DIR);
    assert_eq!(deployment.id(), "p-1-xyz");
    assert!(deployment.has_changes().unwrap());

    let hash = deployment.commit(&cancel).await.unwrap();
    assert_eq!(remote_head(&remote.path, "main"), hash);

    let source = remote_file(&remote.path, "main", "root/test/p/bundle.cue").unwrap();
    assert_eq!(String::from_utf8(source).unwrap(), bundle().encode().unwrap());

    let manifest = remote_file(&remote.path, "main", "root/test/p/main.yaml").unwrap();
    assert_eq!(manifest, MANIFEST_YAML);

    let raw = remote_file(&remote.path, "main", "root/test/p/deployment.json").unwrap();
    let payload: DeploymentPayload = serde_json::from_slice(&raw).unwrap();
    assert_eq!(payload.id, "p-1-xyz");
    assert_eq!(payload.project, "p");
    assert_eq!(payload.metadata["release_id"], "p-1");

    assert!(remote_file(&remote.path, "main", "README.md").is_some());
}

#[tokio::test]
async fn test_identical_inputs_yield_no_changes() {
    let temp = TempDir::new().unwrap();
    let remote = bare_remote(temp.path(), "deploy", &[("README.md", b"deploy\n")]);
    let cancel = CancellationToken::new();
    let deployer = static_deployer();

    let first = clone(&cancel, &remote.url(), &temp.path().join("first")).await;
    deployer
        .create_deployment(&cancel, first, "p", &bundle(), options())
        .await
        .unwrap()
        .commit(&cancel)
        .await
        .unwrap();
    let commits = commit_count(&remote.path, "main");

    let second = clone(&cancel, &remote.url(), &temp.path().join("second")).await;
    let deployment = deployer
        .create_deployment(&cancel, second, "p", &bundle(), options())
        .await
        .unwrap();

    assert!(!deployment.has_changes().unwrap());
    let err = deployment.commit(&cancel).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NoChanges);
    assert_eq!(commit_count(&remote.path, "main"), commits);
}

// =============================================================================
// Project Directory Handling
// =============================================================================

#[tokio::test]
async fn test_clears_stale_files_but_keeps_env() {
    let temp = TempDir::new().unwrap();
    let env = b"modules: main: values: replicas: 2\n";
    let remote = bare_remote(
        temp.path(),
        "deploy",
        &[
            ("root/test/p/env.mod.cue", env),
            ("root/test/p/old.yaml", b"kind: Stale\n"),
            ("root/test/other/main.yaml", b"kind: Other\n"),
        ],
    );
    let cancel = CancellationToken::new();

    let repo = clone(&cancel, &remote.url(), &temp.path().join("work")).await;
    let deployment = deployer_with(|| Box::new(ValuesGenerator))
        .create_deployment(&cancel, repo, "p", &bundle(), options())
        .await
        .unwrap();
    deployment.commit(&cancel).await.unwrap();

    assert!(remote_file(&remote.path, "main", "root/test/p/old.yaml").is_none());
    assert_eq!(remote_file(&remote.path, "main", "root/test/p/env.mod.cue").unwrap(), env);
    assert!(remote_file(&remote.path, "main", "root/test/other/main.yaml").is_some());

    // Manifests see the overlay; bundle.cue does not
    let manifest = remote_file(&remote.path, "main", "root/test/p/main.yaml").unwrap();
    let doc: serde_json::Value = serde_json::from_slice(&manifest).unwrap();
    assert_eq!(doc["env"], "test");
    assert_eq!(doc["values"], serde_json::json!({"foo": "bar", "replicas": 2}));

    let source = String::from_utf8(remote_file(&remote.path, "main", "root/test/p/bundle.cue").unwrap()).unwrap();
    assert!(!source.contains("replicas"));
}

#[tokio::test]
async fn test_env_conflict_fails_before_staging() {
    let temp = TempDir::new().unwrap();
    let remote = bare_remote(
        temp.path(),
        "deploy",
        &[
            ("root/test/p/env.mod.cue", b"modules: main: values: foo: \"baz\"\n"),
            ("root/test/p/old.yaml", b"kind: Stale\n"),
        ],
    );
    let cancel = CancellationToken::new();
    let work = temp.path().join("work");

    let repo = clone(&cancel, &remote.url(), &work).await;
    let err = static_deployer()
        .create_deployment(&cancel, repo, "p", &bundle(), options())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::ValidationFailed);
    assert!(work.join("root/test/p/old.yaml").exists());
}

#[tokio::test]
async fn test_generator_failure_leaves_worktree() {
    let temp = TempDir::new().unwrap();
    let remote = bare_remote(temp.path(), "deploy", &[("root/test/p/old.yaml", b"kind: Stale\n")]);
    let cancel = CancellationToken::new();
    let work = temp.path().join("work");

    let repo = clone(&cancel, &remote.url(), &work).await;
    let err = deployer_with(|| Box::new(FailingGenerator))
        .create_deployment(&cancel, repo, "p", &bundle(), options())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Command);
    assert!(work.join("root/test/p/old.yaml").exists());
    assert!(!work.join("root/test/p/bundle.cue").exists());

    let check = Repo::open(&work, Arc::new(Git2Remote)).unwrap();
    assert!(!check.has_changes().unwrap());
}

#[tokio::test]
async fn test_unknown_module_type() {
    let temp = TempDir::new().unwrap();
    let remote = bare_remote(temp.path(), "deploy", &[("README.md", b"deploy\n")]);
    let cancel = CancellationToken::new();

    let mut bundle = bundle();
    if let Some(main) = bundle.modules.get_mut("main") {
        main.module_type = "jsonnet".into();
    }

    let repo = clone(&cancel, &remote.url(), &temp.path().join("work")).await;
    let err = static_deployer()
        .create_deployment(&cancel, repo, "p", &bundle, options())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ValidationFailed);
}
