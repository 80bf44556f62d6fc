//! KCL module generator.
//!
//! Remote modules are OCI artifacts pulled once into a content-addressed
//! cache directory; local modules are run in place.

use super::ManifestGenerator;
use crate::error::{Error, Result};
use crate::exec::CommandRunner;
use crate::module::Module;
use crate::registry::Puller;
use crate::storage::sha256_digest;
use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const KCL_MOD_FILE: &str = "kcl.mod";

#[derive(Debug, Deserialize)]
struct KclMod {
    package: KclPackage,
}

#[derive(Debug, Deserialize)]
struct KclPackage {
    name: String,
    #[serde(default)]
    version: String,
}

/// `oci://<registry>/<name>?tag=<version>`
pub fn oci_reference(module: &Module) -> String {
    format!(
        "oci://{}/{}?tag={}",
        module.registry.trim_end_matches('/'),
        module.name,
        module.version
    )
}

/// Converts `oci://host/repo?tag=v` to the pullable `host/repo:v`.
fn pull_reference(oci: &str) -> Result<String> {
    let rest = oci.strip_prefix("oci://").ok_or_else(|| Error::InvalidRef {
        reference: oci.to_string(),
        reason: "missing oci:// scheme".to_string(),
    })?;

    match rest.split_once("?tag=") {
        Some((repo, tag)) if !tag.is_empty() => Ok(format!("{}:{}", repo, tag)),
        _ => Err(Error::InvalidRef {
            reference: oci.to_string(),
            reason: "missing tag".to_string(),
        }),
    }
}

pub struct KclGenerator {
    runner: Arc<dyn CommandRunner>,
    puller: Arc<dyn Puller>,
    binary: String,
    cache_dir: PathBuf,
}

impl KclGenerator {
    pub fn new(runner: Arc<dyn CommandRunner>, puller: Arc<dyn Puller>, binary: &str, cache_dir: &Path) -> Self {
        Self {
            runner,
            puller,
            binary: binary.to_string(),
            cache_dir: cache_dir.to_path_buf(),
        }
    }

    /// Resolves the module directory and its effective name and version.
    async fn module_dir(&self, cancel: &CancellationToken, module: &Module) -> Result<(PathBuf, String, String)> {
        if let Some(path) = module.path.as_deref().filter(|p| !p.is_empty()) {
            let dir = PathBuf::from(path);
            let raw = tokio::fs::read_to_string(dir.join(KCL_MOD_FILE))
                .await
                .map_err(|e| Error::ValidationFailed(format!("failed to read {}/{}: {}", path, KCL_MOD_FILE, e)))?;
            let manifest: KclMod = toml::from_str(&raw)
                .map_err(|e| Error::ValidationFailed(format!("invalid {}/{}: {}", path, KCL_MOD_FILE, e)))?;
            return Ok((dir, manifest.package.name, manifest.package.version));
        }

        let oci = oci_reference(module);
        let digest = sha256_digest(oci.as_bytes());
        let dir = self.cache_dir.join(digest.trim_start_matches("sha256:"));

        if dir.exists() {
            debug!(module = %oci, "Using cached KCL module");
        } else {
            info!(module = %oci, "Pulling KCL module");
            // Only a complete pull may become the cache entry
            let partial = dir.with_extension("partial");
            if partial.exists() {
                tokio::fs::remove_dir_all(&partial).await?;
            }
            if let Err(e) = self.puller.pull(cancel, &pull_reference(&oci)?, &partial).await {
                if let Err(cleanup) = tokio::fs::remove_dir_all(&partial).await {
                    warn!(path = %partial.display(), "Failed to remove partial module: {}", cleanup);
                }
                return Err(e);
            }
            tokio::fs::rename(&partial, &dir).await?;
        }

        Ok((dir, module.name.clone(), module.version.clone()))
    }

    fn args(dir: &Path, module: &Module, env: &str, name: &str, version: &str) -> Result<Vec<String>> {
        let values = serde_json::to_string(&module.values)?;
        let define = |k: &str, v: &str| ["-D".to_string(), format!("{}={}", k, v)];

        let mut args = vec!["run".to_string(), dir.to_string_lossy().into_owned()];
        args.extend(define("env", env));
        args.extend(define("instance", module.instance_name()));
        args.extend(define("name", name));
        args.extend(define("namespace", &module.namespace));
        args.extend(define("version", version));
        args.extend(define("values", &values));
        Ok(args)
    }
}

#[async_trait]
impl ManifestGenerator for KclGenerator {
    async fn generate(&self, cancel: &CancellationToken, module: &Module, env: &str) -> Result<Vec<u8>> {
        let (dir, name, version) = self.module_dir(cancel, module).await?;
        let args = Self::args(&dir, module, env, &name, &version)?;
        self.runner.run(&self.binary, &args).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct FakePuller {
        pulled: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Puller for FakePuller {
        async fn pull(&self, _cancel: &CancellationToken, image_ref: &str, dest: &Path) -> Result<()> {
            self.pulled.lock().unwrap().push(image_ref.to_string());
            std::fs::create_dir_all(dest)?;
            Ok(())
        }
    }

    #[derive(Default)]
    struct EchoArgs {
        calls: Mutex<Vec<Vec<String>>>,
    }

    #[async_trait]
    impl CommandRunner for EchoArgs {
        async fn run(&self, _program: &str, args: &[String]) -> Result<Vec<u8>> {
            self.calls.lock().unwrap().push(args.to_vec());
            Ok(b"kind: Deployment".to_vec())
        }
    }

    fn module() -> Module {
        Module {
            instance: "web".into(),
            name: "module".into(),
            namespace: "default".into(),
            registry: "registry.com/mods".into(),
            version: "v1.0.0".into(),
            values: serde_json::json!({"foo": "bar"}),
            ..Default::default()
        }
    }

    #[test]
    fn test_reference_conversion() {
        let oci = oci_reference(&module());
        assert_eq!(oci, "oci://registry.com/mods/module?tag=v1.0.0");
        assert_eq!(pull_reference(&oci).unwrap(), "registry.com/mods/module:v1.0.0");
        assert!(pull_reference("registry.com/x").is_err());
    }

    #[tokio::test]
    async fn test_pulls_once_then_caches() {
        let temp = TempDir::new().unwrap();
        let puller = Arc::new(FakePuller::default());
        let runner = Arc::new(EchoArgs::default());
        let generator = KclGenerator::new(runner.clone(), puller.clone(), "kcl", temp.path());
        let cancel = CancellationToken::new();

        let out = generator.generate(&cancel, &module(), "prod").await.unwrap();
        generator.generate(&cancel, &module(), "prod").await.unwrap();

        assert_eq!(out, b"kind: Deployment");
        assert_eq!(puller.pulled.lock().unwrap().len(), 1);

        let args = &runner.calls.lock().unwrap()[0];
        assert_eq!(args[0], "run");
        assert!(args.contains(&"env=prod".to_string()));
        assert!(args.contains(&"instance=web".to_string()));
        assert!(args.contains(&r#"values={"foo":"bar"}"#.to_string()));
    }

    struct HalfPuller;

    #[async_trait]
    impl Puller for HalfPuller {
        async fn pull(&self, _cancel: &CancellationToken, image_ref: &str, dest: &Path) -> Result<()> {
            std::fs::create_dir_all(dest)?;
            std::fs::write(dest.join("partial.k"), b"a = 1")?;
            Err(Error::NoTarLayers(image_ref.to_string()))
        }
    }

    #[tokio::test]
    async fn test_failed_pull_is_not_cached() {
        let temp = TempDir::new().unwrap();
        let runner = Arc::new(EchoArgs::default());
        let generator = KclGenerator::new(runner.clone(), Arc::new(HalfPuller), "kcl", temp.path());

        let err = generator
            .generate(&CancellationToken::new(), &module(), "prod")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoTarLayers(_)));
        assert_eq!(std::fs::read_dir(temp.path()).unwrap().count(), 0);
        assert!(runner.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_local_path_reads_kcl_mod() {
        let temp = TempDir::new().unwrap();
        std::fs::write(
            temp.path().join(KCL_MOD_FILE),
            "[package]\nname = \"local-mod\"\nversion = \"0.2.0\"\n",
        )
        .unwrap();

        let runner = Arc::new(EchoArgs::default());
        let puller = Arc::new(FakePuller::default());
        let generator = KclGenerator::new(runner.clone(), puller.clone(), "kcl", temp.path());
        let local = Module {
            path: Some(temp.path().to_string_lossy().into_owned()),
            ..Default::default()
        };

        generator.generate(&CancellationToken::new(), &local, "dev").await.unwrap();

        let args = &runner.calls.lock().unwrap()[0];
        assert!(args.contains(&"name=local-mod".to_string()));
        assert!(args.contains(&"version=0.2.0".to_string()));
        assert!(puller.pulled.lock().unwrap().is_empty());
    }
}
