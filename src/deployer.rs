//! # Bundle Engine
//!
//! Renders a [`ModuleBundle`] into manifests and stages them into a GitOps
//! repository at `<root>/<env>/<project>`.
//!
//! ## Flow
//!
//! ```text
//! validate ─► load env.mod.cue ─► render every module ─► clear project dir
//!                                   (unified bundle)      (keep env.mod.cue)
//!                                                              │
//!        Deployment ◄── stage: bundle.cue, deployment.json, <key>.yaml (sorted)
//!             │
//!             └─► commit() ─► NoChanges | commit + push
//! ```
//!
//! Rendering happens before the directory is touched, so a generator
//! failure leaves the worktree as it was. Output is a pure function of the
//! bundle, the overlay and the generators; an already synchronized
//! repository yields [`Error::NoChanges`] on commit.

use crate::constants::{BUNDLE_FILENAME, ENV_FILENAME, PAYLOAD_FILENAME, commit_message};
use crate::cue::{self, Value};
use crate::error::{Error, Result};
use crate::generator::GeneratorRegistry;
use crate::git::Repo;
use crate::module::{ModuleBundle, check_segment};
use crate::storage::check_cancelled;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Contents of `deployment.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentPayload {
    pub id: String,
    pub metadata: BTreeMap<String, String>,
    pub project: String,
}

/// Per-deployment inputs beyond the bundle.
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    pub id: String,
    pub metadata: BTreeMap<String, String>,
}

/// Rendered bytes for one bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedBundle {
    /// Canonical `bundle.cue`.
    pub source: String,
    /// `<key>.yaml` contents by module key.
    pub manifests: BTreeMap<String, Vec<u8>>,
}

pub struct Deployer {
    generators: Arc<GeneratorRegistry>,
    root_dir: String,
}

impl Deployer {
    pub fn new(generators: Arc<GeneratorRegistry>, root_dir: impl Into<String>) -> Self {
        Self {
            generators,
            root_dir: root_dir.into(),
        }
    }

    /// `<root>/<env>/<project>`
    pub fn project_path(&self, project: &str, bundle: &ModuleBundle) -> Result<String> {
        check_segment("project", project)?;
        check_segment("env", &bundle.env)?;
        Ok(format!("{}/{}/{}", self.root_dir.trim_matches('/'), bundle.env, project))
    }

    /// Reads the environment overlay next to the project's manifests.
    pub fn load_env(&self, repo: &Repo, project_path: &str) -> Result<Option<Value>> {
        let env_path = format!("{}/{}", project_path, ENV_FILENAME);
        if !repo.exists(&env_path)? {
            return Ok(None);
        }

        info!(path = %env_path, "Loading environment file");
        let raw = repo.read_file(&env_path)?;
        let src = String::from_utf8(raw).map_err(|e| Error::ValidationFailed(format!("{}: {}", env_path, e)))?;
        Ok(Some(cue::parse(&src)?))
    }

    /// Renders a bundle without touching any repository.
    ///
    /// `bundle.cue` is the bundle as given; manifests are generated from the
    /// bundle unified with `env`.
    pub async fn render(
        &self,
        cancel: &CancellationToken,
        bundle: &ModuleBundle,
        env: Option<&Value>,
    ) -> Result<RenderedBundle> {
        bundle.validate()?;
        let source = bundle.encode()?;

        let effective = match env {
            Some(overlay) => {
                let unified = cue::unify(bundle.to_value()?, overlay.clone())
                    .map_err(|e| Error::ValidationFailed(format!("failed to unify bundle with environment: {}", e)))?;
                let merged = ModuleBundle::from_value(&unified)?;
                merged.validate()?;
                merged
            }
            None => bundle.clone(),
        };

        let mut manifests = BTreeMap::new();
        for (key, module) in &effective.modules {
            check_cancelled(cancel, "render")?;
            debug!(module = %key, "Generating module");

            let output = self
                .generators
                .generate(cancel, module, &effective.env)
                .await
                .map_err(|e| match e {
                    Error::ValidationFailed(msg) => Error::ValidationFailed(format!("module {}: {}", key, msg)),
                    other => other,
                })?;
            manifests.insert(key.clone(), output);
        }

        Ok(RenderedBundle { source, manifests })
    }

    /// Renders `bundle` and stages it into `repo`.
    pub async fn create_deployment(
        &self,
        cancel: &CancellationToken,
        repo: Repo,
        project: &str,
        bundle: &ModuleBundle,
        opts: CreateOptions,
    ) -> Result<Deployment> {
        let path = self.project_path(project, bundle)?;

        if !repo.exists(&path)? {
            info!(path = %path, "Creating project path");
            repo.mkdir_all(&path)?;
        }

        let env = self.load_env(&repo, &path)?;
        let rendered = self.render(cancel, bundle, env.as_ref()).await?;
        check_cancelled(cancel, "create deployment")?;

        info!(path = %path, "Clearing project path");
        for entry in repo.read_dir(&path)? {
            if entry.name == ENV_FILENAME {
                continue;
            }
            debug!(file = %entry.name, "Removing stale file");
            repo.remove_file(&format!("{}/{}", path, entry.name))?;
        }

        let bundle_path = format!("{}/{}", path, BUNDLE_FILENAME);
        repo.write_file(&bundle_path, rendered.source.as_bytes())?;

        let payload = DeploymentPayload {
            id: opts.id.clone(),
            metadata: opts.metadata,
            project: project.to_string(),
        };
        let payload_path = format!("{}/{}", path, PAYLOAD_FILENAME);
        repo.write_file(&payload_path, &serde_json::to_vec_pretty(&payload)?)?;

        for (key, manifest) in &rendered.manifests {
            let manifest_path = format!("{}/{}.yaml", path, key);
            debug!(path = %manifest_path, "Writing manifest");
            repo.write_file(&manifest_path, manifest)?;
        }

        Ok(Deployment {
            repo,
            id: opts.id,
            project: project.to_string(),
            path,
            rendered,
        })
    }
}

/// A staged deployment, bound to its repository. Single use.
#[derive(Debug)]
pub struct Deployment {
    repo: Repo,
    id: String,
    project: String,
    path: String,
    rendered: RenderedBundle,
}

impl Deployment {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    /// Project directory inside the repository.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn rendered(&self) -> &RenderedBundle {
        &self.rendered
    }

    pub fn has_changes(&self) -> Result<bool> {
        self.repo.has_changes()
    }

    /// Commits as the automation identity and pushes.
    ///
    /// Returns the commit hash, or [`Error::NoChanges`] if nothing is staged.
    pub async fn commit(self, cancel: &CancellationToken) -> Result<String> {
        if !self.repo.has_changes()? {
            info!(project = %self.project, "No changes to commit");
            return Err(Error::NoChanges);
        }
        check_cancelled(cancel, "commit")?;

        let hash = self.repo.commit(&commit_message(&self.project))?;
        info!(project = %self.project, commit = %hash, "Pushing deployment");
        self.repo.push(cancel).await?;
        Ok(hash)
    }
}
