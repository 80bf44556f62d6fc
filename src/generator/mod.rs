//! # Manifest Generators
//!
//! Each module type tag (`kcl`, `git`, `helm`) maps to a constructor in a
//! [`GeneratorRegistry`]. The Bundle Engine validates a module, looks up its
//! generator by tag, and writes whatever bytes come back.
//!
//! ```rust,ignore
//! let mut registry = GeneratorRegistry::new();
//! registry.register("static", || Box::new(StaticGenerator::new(b"kind: List")));
//! let yaml = registry.generate(&cancel, &module, "prod").await?;
//! ```

mod git;
mod helm;
mod kcl;

pub use git::GitGenerator;
pub use helm::HelmGenerator;
pub use kcl::{KclGenerator, oci_reference};

use crate::error::{Error, Result};
use crate::exec::CommandRunner;
use crate::git::{GitAuth, GitRemote};
use crate::module::Module;
use crate::registry::Puller;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Renders one module to manifest bytes.
#[async_trait]
pub trait ManifestGenerator: Send + Sync {
    async fn generate(&self, cancel: &CancellationToken, module: &Module, env: &str) -> Result<Vec<u8>>;
}

type GeneratorFactory = Arc<dyn Fn() -> Box<dyn ManifestGenerator> + Send + Sync>;

/// Collaborators shared by the built-in generators.
#[derive(Clone)]
pub struct GeneratorDeps {
    pub runner: Arc<dyn CommandRunner>,
    pub puller: Arc<dyn Puller>,
    pub git_remote: Arc<dyn GitRemote>,
    pub git_auth: Option<GitAuth>,
    pub kcl_binary: String,
    pub kcl_cache: PathBuf,
    pub helm_binary: String,
    /// Scratch space for clones and value files.
    pub work_dir: PathBuf,
}

/// Tag-to-constructor map.
#[derive(Default, Clone)]
pub struct GeneratorRegistry {
    factories: HashMap<String, GeneratorFactory>,
}

impl GeneratorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with `kcl`, `git` and `helm`.
    pub fn default_providers(deps: GeneratorDeps) -> Self {
        let mut registry = Self::new();

        let d = deps.clone();
        registry.register("kcl", move || {
            Box::new(KclGenerator::new(d.runner.clone(), d.puller.clone(), &d.kcl_binary, &d.kcl_cache))
        });

        let d = deps.clone();
        registry.register("git", move || {
            Box::new(GitGenerator::new(d.git_remote.clone(), &d.work_dir).with_auth(d.git_auth.clone()))
        });

        let d = deps;
        registry.register("helm", move || {
            Box::new(HelmGenerator::new(d.runner.clone(), &d.helm_binary, &d.work_dir))
        });

        registry
    }

    /// Registers `tag`, replacing any previous constructor.
    pub fn register<F>(&mut self, tag: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn ManifestGenerator> + Send + Sync + 'static,
    {
        self.factories.insert(tag.into(), Arc::new(factory));
    }

    pub fn has(&self, tag: &str) -> bool {
        self.factories.contains_key(tag)
    }

    pub fn get(&self, tag: &str) -> Result<Box<dyn ManifestGenerator>> {
        self.factories
            .get(tag)
            .map(|factory| factory())
            .ok_or_else(|| Error::ValidationFailed(format!("unknown module type: {}", tag)))
    }

    /// Validates `module` and renders it with its generator.
    pub async fn generate(&self, cancel: &CancellationToken, module: &Module, env: &str) -> Result<Vec<u8>> {
        module.validate()?;
        let generator = self.get(module.generator())?;

        debug!(module = %module.name, kind = module.generator(), env, "Generating manifests");
        generator.generate(cancel, module, env).await
    }
}

/// Returns fixed bytes for every module. Used for dry runs and tests.
#[derive(Debug, Clone)]
pub struct StaticGenerator {
    output: Vec<u8>,
}

impl StaticGenerator {
    pub fn new(output: impl Into<Vec<u8>>) -> Self {
        Self { output: output.into() }
    }
}

#[async_trait]
impl ManifestGenerator for StaticGenerator {
    async fn generate(&self, _cancel: &CancellationToken, _module: &Module, _env: &str) -> Result<Vec<u8>> {
        Ok(self.output.clone())
    }
}
