//! Helm chart generator.

use super::ManifestGenerator;
use crate::error::{Error, Result};
use crate::exec::CommandRunner;
use crate::module::Module;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

/// Runs `helm template` against a chart repository.
pub struct HelmGenerator {
    runner: Arc<dyn CommandRunner>,
    binary: String,
    work_dir: PathBuf,
}

impl HelmGenerator {
    pub fn new(runner: Arc<dyn CommandRunner>, binary: &str, work_dir: &Path) -> Self {
        Self {
            runner,
            binary: binary.to_string(),
            work_dir: work_dir.to_path_buf(),
        }
    }

    fn args(module: &Module, values_file: &Path) -> Vec<String> {
        let namespace = if module.namespace.is_empty() {
            "default"
        } else {
            &module.namespace
        };

        vec![
            "template".to_string(),
            module.instance_name().to_string(),
            module.name.clone(),
            "--repo".to_string(),
            module.registry.clone(),
            "--version".to_string(),
            module.version.clone(),
            "--namespace".to_string(),
            namespace.to_string(),
            "--values".to_string(),
            values_file.to_string_lossy().into_owned(),
        ]
    }
}

#[async_trait]
impl ManifestGenerator for HelmGenerator {
    async fn generate(&self, _cancel: &CancellationToken, module: &Module, _env: &str) -> Result<Vec<u8>> {
        if module.registry.is_empty() {
            return Err(Error::ValidationFailed(format!(
                "helm module {} has no chart repository",
                module.name
            )));
        }

        let values = match &module.values {
            serde_json::Value::Null => serde_json::json!({}),
            other => other.clone(),
        };

        tokio::fs::create_dir_all(&self.work_dir).await?;
        let values_file = self.work_dir.join(format!("helm-values-{}.json", Uuid::now_v7()));
        tokio::fs::write(&values_file, serde_json::to_vec(&values)?).await?;

        let result = self.runner.run(&self.binary, &Self::args(module, &values_file)).await;

        if let Err(e) = tokio::fs::remove_file(&values_file).await {
            warn!(path = %values_file.display(), "Failed to remove values file: {}", e);
        }

        result
    }
}
