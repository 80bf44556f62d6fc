//! Git module generator.
//!
//! Clones the module's registry URL into a scratch directory, checks out its
//! version, and concatenates the files named in `values.paths` as a single
//! multi-document YAML stream.

use super::ManifestGenerator;
use crate::error::{Error, Result};
use crate::git::{CloneOptions, GitAuth, GitRemote, Repo};
use crate::module::Module;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

const DOCUMENT_SEPARATOR: &str = "\n---\n";

pub struct GitGenerator {
    remote: Arc<dyn GitRemote>,
    work_dir: PathBuf,
    auth: Option<GitAuth>,
}

impl GitGenerator {
    pub fn new(remote: Arc<dyn GitRemote>, work_dir: &Path) -> Self {
        Self {
            remote,
            work_dir: work_dir.to_path_buf(),
            auth: None,
        }
    }

    pub fn with_auth(mut self, auth: Option<GitAuth>) -> Self {
        self.auth = auth;
        self
    }

    async fn render(&self, cancel: &CancellationToken, module: &Module, paths: &[String], scratch: &Path) -> Result<Vec<u8>> {
        let opts = CloneOptions {
            auth: self.auth.clone(),
            ..Default::default()
        };
        let repo = Repo::clone_repo(cancel, &module.registry, scratch, self.remote.clone(), opts).await?;
        repo.checkout_ref(&module.version)?;

        concat_files(&repo, paths)
    }
}

/// Reads `values.paths` as a list of strings.
fn module_paths(module: &Module) -> Result<Vec<String>> {
    let paths: Vec<String> = module
        .values
        .get("paths")
        .and_then(|v| v.as_array())
        .map(|items| items.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
        .unwrap_or_default();

    if paths.is_empty() {
        return Err(Error::NoPaths(module.name.clone()));
    }
    Ok(paths)
}

/// Joins files with `\n---\n`, dropping a leading `---\n` from each.
pub(crate) fn concat_files(repo: &Repo, paths: &[String]) -> Result<Vec<u8>> {
    let mut documents = Vec::with_capacity(paths.len());

    for path in paths {
        let contents = repo.read_file(path).map_err(|e| match e {
            Error::NotFound(_) => Error::PathNotFound(path.clone()),
            other => other,
        })?;
        let mut text = String::from_utf8_lossy(&contents).into_owned();
        if text.starts_with("---\n") {
            text.replace_range(..4, "");
        }
        documents.push(text);
    }

    Ok(documents.join(DOCUMENT_SEPARATOR).into_bytes())
}

#[async_trait]
impl ManifestGenerator for GitGenerator {
    async fn generate(&self, cancel: &CancellationToken, module: &Module, _env: &str) -> Result<Vec<u8>> {
        let paths = module_paths(module)?;
        if module.registry.is_empty() {
            return Err(Error::ValidationFailed(format!(
                "git module {} has no registry URL",
                module.name
            )));
        }

        tokio::fs::create_dir_all(&self.work_dir).await?;
        let scratch = self.work_dir.join(format!("git-{}", Uuid::now_v7()));
        debug!(url = %module.registry, scratch = %scratch.display(), "Rendering git module");

        let result = self.render(cancel, module, &paths, &scratch).await;

        if let Err(e) = tokio::fs::remove_dir_all(&scratch).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(scratch = %scratch.display(), "Failed to remove scratch clone: {}", e);
        }

        result
    }
}
