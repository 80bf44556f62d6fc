//! # forge-deployer
//!
//! **GitOps Deployment Engine and ReleaseDeployment Operator**
//!
//! Turns a project's declarative module bundle into rendered Kubernetes
//! manifests, commits them to a GitOps repository, and drives each
//! `ReleaseDeployment` custom resource to a terminal state. Remote modules
//! are OCI artifacts fetched through a hardened puller.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                        forge-deployer                               │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────────────────────────────────────────────────┐    │
//! │  │          Controller ─► Reconciler (one tick per CR)         │    │
//! │  │   ResourceClient (cluster)   DeploymentHandler (Foundry)    │    │
//! │  └──────────────────────────────┬──────────────────────────────┘    │
//! │                                 │                                   │
//! │  ┌──────────────────────────────┼──────────────────────────────┐    │
//! │  │                        Bundle Engine                        │    │
//! │  │  Blueprint → ModuleBundle → GeneratorRegistry → Repo stage  │    │
//! │  │     kcl │ git │ helm            bundle.cue + <key>.yaml     │    │
//! │  └──────────────────────────────┬──────────────────────────────┘    │
//! │                                 │                                   │
//! │  ┌──────────────────────┐  ┌────┴─────────────────────────────┐     │
//! │  │   Repo / CachedRepos │  │            OCI Puller            │     │
//! │  │ libgit2, per-URL lock│  │ copy → verify → bounded extract  │     │
//! │  └──────────────────────┘  └────┬─────────────────────────────┘     │
//! │                                 │                                   │
//! │                   ┌─────────────┴───────────────┐                   │
//! │                   │  Content-Addressed Storage  │                   │
//! │                   │  digest verified, atomic    │                   │
//! │                   └─────────────────────────────┘                   │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # ReleaseDeployment Lifecycle
//!
//! ```text
//!   ┌─────────┐  tick   ┌─────────┐  ok    ┌───────────┐  TTL   ┌─────────┐
//!   │ Pending │ ──────► │ Running │ ─────► │ Succeeded │ ─────► │ deleted │
//!   └─────────┘         └────┬────┘        └───────────┘        └─────────┘
//!                            │ error       ┌───────────┐  TTL        ▲
//!                            └───────────► │  Failed   │ ────────────┘
//!                                          └───────────┘
//! ```
//!
//! Terminal states are final. The Foundry API record is authoritative; the
//! custom resource mirrors it.
//!
//! # Security Model
//!
//! - **Path Traversal Protection**: every tar entry is cleaned and checked
//!   against the destination before anything is created
//!   (see [`extract::extract_layer`]).
//! - **Size Limits**: manifest size, per-file size, total bytes and file
//!   count are bounded per pull (see [`constants`]).
//! - **Digest Verification**: blobs become visible only after their SHA-256
//!   matches (see [`storage::ContentStore::push`]).
//! - **Signatures**: an optional [`verify::Verifier`] gates extraction.
//! - **Timeouts**: registry calls are bounded by `PULL_TIMEOUT`; reconcile
//!   ticks by the configured tick timeout.
//!
//! # Example
//!
//! ```rust,ignore
//! use forge_deployer::{Deployer, GeneratorRegistry, ModuleBundle, Repo};
//!
//! let deployer = Deployer::new(Arc::new(registry), "root");
//! let bundle = ModuleBundle::parse(&std::fs::read_to_string("bundle.cue")?)?;
//! let deployment = deployer
//!     .create_deployment(&cancel, repo, "my-project", &bundle, Default::default())
//!     .await?;
//! deployment.commit(&cancel).await?;
//! ```

pub mod api;
pub mod clock;
pub mod config;
pub mod constants;
pub mod controller;
pub mod credentials;
pub mod crd;
pub mod cue;
pub mod deployer;
pub mod error;
pub mod exec;
pub mod extract;
pub mod generator;
pub mod git;
pub mod handler;
pub mod logs;
pub mod module;
pub mod reconciler;
pub mod registry;
pub mod resources;
pub mod secrets;
pub mod storage;
pub mod verify;

// Re-exports
pub use api::{DeploymentStatus, HttpReleaseApi, MemoryReleaseApi, Release, ReleaseApi};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::OperatorConfig;
pub use crd::{DeploymentState, ReleaseDeployment, ReleaseDeploymentSpec, ReleaseDeploymentStatus};
pub use deployer::{CreateOptions, Deployer, Deployment, RenderedBundle};
pub use error::{Error, ErrorKind, Result};
pub use generator::{GeneratorDeps, GeneratorRegistry, ManifestGenerator, StaticGenerator};
pub use git::{CachedRepos, Git2Remote, GitAuth, GitRemote, Repo};
pub use module::{Blueprint, Module, ModuleBundle};
pub use reconciler::{DeployTarget, Outcome, Reconciler};
pub use registry::{ArtifactSource, OciPuller, Puller, RemoteRegistry};
pub use resources::{KubeResources, MemoryResources, ResourceClient};
pub use storage::{ContentStore, Descriptor};
