//! Artifact signature verification.
//!
//! The puller calls a [`Verifier`] after the manifest is in the content
//! store and before anything is extracted. Verifiers are looked up by tag in
//! a [`VerifierRegistry`], so new schemes slot in by registering.

use crate::constants::DEFAULT_REKOR_URL;
use crate::error::{Error, Result};
use crate::exec::CommandRunner;
use crate::storage::Descriptor;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Verifies a pulled artifact's signature.
#[async_trait]
pub trait Verifier: Send + Sync {
    async fn verify(&self, image_ref: &str, manifest: &Descriptor) -> Result<()>;
}

/// Keyless verification settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CosignOptions {
    /// OIDC issuer that minted the signing certificate.
    pub issuer: String,
    /// Certificate identity (subject) expected on the signature.
    pub subject: String,
    #[serde(default)]
    pub rekor_url: Option<String>,
    /// Skip the transparency log check.
    #[serde(default)]
    pub skip_tlog: bool,
}

/// Sigstore keyless verifier backed by the `cosign` CLI.
pub struct CosignVerifier {
    issuer: String,
    subject: String,
    rekor_url: String,
    skip_tlog: bool,
    binary: String,
    runner: Arc<dyn CommandRunner>,
}

impl CosignVerifier {
    pub fn new(opts: CosignOptions, runner: Arc<dyn CommandRunner>) -> Result<Self> {
        if opts.issuer.is_empty() {
            return Err(Error::Config("OIDC issuer cannot be empty".to_string()));
        }
        if opts.subject.is_empty() {
            return Err(Error::Config("OIDC subject cannot be empty".to_string()));
        }

        Ok(Self {
            issuer: opts.issuer,
            subject: opts.subject,
            rekor_url: opts.rekor_url.unwrap_or_else(|| DEFAULT_REKOR_URL.to_string()),
            skip_tlog: opts.skip_tlog,
            binary: "cosign".to_string(),
            runner,
        })
    }

    /// Overrides the `cosign` executable.
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    fn args(&self, image_ref: &str, manifest: &Descriptor) -> Vec<String> {
        let mut args = vec![
            "verify".to_string(),
            "--certificate-oidc-issuer".to_string(),
            self.issuer.clone(),
            "--certificate-identity".to_string(),
            self.subject.clone(),
        ];

        if self.skip_tlog {
            args.push("--insecure-ignore-tlog".to_string());
        } else {
            args.push("--rekor-url".to_string());
            args.push(self.rekor_url.clone());
        }

        // Pin to the digest that was actually pulled
        let base = image_ref.split('@').next().unwrap_or(image_ref);
        args.push(format!("{}@{}", strip_tag(base), manifest.digest));
        args
    }
}

#[async_trait]
impl Verifier for CosignVerifier {
    async fn verify(&self, image_ref: &str, manifest: &Descriptor) -> Result<()> {
        debug!(image_ref, digest = %manifest.digest, "Verifying signature");

        self.runner
            .run(&self.binary, &self.args(image_ref, manifest))
            .await
            .map_err(|e| Error::SigVerification {
                reference: image_ref.to_string(),
                reason: e.to_string(),
            })?;

        info!(image_ref, "Signature verified");
        Ok(())
    }
}

/// Removes a trailing `:tag` without touching a registry port.
fn strip_tag(reference: &str) -> &str {
    match reference.rfind(':') {
        Some(idx) if !reference[idx..].contains('/') => &reference[..idx],
        _ => reference,
    }
}

type VerifierFactory = Arc<dyn Fn() -> Result<Arc<dyn Verifier>> + Send + Sync>;

/// Tag-to-constructor registry for verifiers.
#[derive(Default, Clone)]
pub struct VerifierRegistry {
    factories: HashMap<String, VerifierFactory>,
}

impl VerifierRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a constructor under `tag`, replacing any previous one.
    pub fn register<F>(&mut self, tag: impl Into<String>, factory: F)
    where
        F: Fn() -> Result<Arc<dyn Verifier>> + Send + Sync + 'static,
    {
        self.factories.insert(tag.into(), Arc::new(factory));
    }

    /// Builds the verifier registered under `tag`.
    pub fn build(&self, tag: &str) -> Result<Arc<dyn Verifier>> {
        let factory = self
            .factories
            .get(tag)
            .ok_or_else(|| Error::Config(format!("unknown verifier: {}", tag)))?;
        factory()
    }

    /// Registry with `cosign` bound to the given options.
    pub fn with_cosign(opts: CosignOptions, runner: Arc<dyn CommandRunner>) -> Self {
        let mut registry = Self::new();
        registry.register("cosign", move || {
            Ok(Arc::new(CosignVerifier::new(opts.clone(), runner.clone())?) as Arc<dyn Verifier>)
        });
        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingRunner {
        calls: Mutex<Vec<(String, Vec<String>)>>,
        fail: bool,
    }

    #[async_trait]
    impl CommandRunner for RecordingRunner {
        async fn run(&self, program: &str, args: &[String]) -> Result<Vec<u8>> {
            self.calls.lock().unwrap().push((program.to_string(), args.to_vec()));
            if self.fail {
                return Err(Error::Command {
                    program: program.to_string(),
                    status: "exit status: 1".to_string(),
                    stderr: "no matching signatures".to_string(),
                });
            }
            Ok(Vec::new())
        }
    }

    fn opts(skip_tlog: bool) -> CosignOptions {
        CosignOptions {
            issuer: "https://token.actions.githubusercontent.com".to_string(),
            subject: "https://github.com/org/repo/.github/workflows/release.yml@refs/heads/main".to_string(),
            rekor_url: None,
            skip_tlog,
        }
    }

    #[test]
    fn test_rejects_empty_identity() {
        let runner = Arc::new(RecordingRunner::default());
        let err = CosignVerifier::new(CosignOptions::default(), runner).err().unwrap();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn test_verify_pins_digest() {
        let runner = Arc::new(RecordingRunner::default());
        let verifier = CosignVerifier::new(opts(false), runner.clone()).unwrap();
        let desc = Descriptor::for_bytes("application/vnd.oci.image.manifest.v1+json", b"{}");

        verifier.verify("registry.io:5000/mods/app:v1", &desc).await.unwrap();

        let calls = runner.calls.lock().unwrap();
        let args = &calls[0].1;
        assert_eq!(calls[0].0, "cosign");
        assert!(args.contains(&"--rekor-url".to_string()));
        assert_eq!(args.last().unwrap(), &format!("registry.io:5000/mods/app@{}", desc.digest));
    }

    #[tokio::test]
    async fn test_failure_maps_to_sig_verification() {
        let runner = Arc::new(RecordingRunner {
            fail: true,
            ..Default::default()
        });
        let verifier = CosignVerifier::new(opts(true), runner.clone()).unwrap();
        let desc = Descriptor::for_bytes("application/json", b"{}");

        let err = verifier.verify("ghcr.io/org/mod:v1", &desc).await.unwrap_err();

        assert!(matches!(err, Error::SigVerification { .. }));
        assert!(runner.calls.lock().unwrap()[0].1.contains(&"--insecure-ignore-tlog".to_string()));
    }

    #[test]
    fn test_registry_unknown_tag() {
        let registry = VerifierRegistry::new();
        assert!(registry.build("notary").is_err());
    }
}
