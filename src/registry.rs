//! # OCI Artifact Pull Pipeline
//!
//! Copies an artifact from a registry into the [`ContentStore`], optionally
//! verifies its signature, then extracts its tar layers through the bounded
//! extractor.
//!
//! ## Pipeline
//!
//! ```text
//! parse ref ─► docker creds ─► copy manifest + layers ─► verify? ─► read manifest
//!                                   (ContentStore)                    (bounded)
//!                                                                        │
//!                              dest/ ◄── extract tar layers (running totals)
//! ```
//!
//! ## Security Model
//!
//! - References are length- and charset-checked before parsing.
//! - Every blob is verified by the store against its digest and size.
//! - The manifest is read through [`ContentStore::read_bounded`].
//! - Extraction totals are shared by all layers of one pull.
//! - Each registry request is bounded by [`PULL_TIMEOUT`].
//!
//! ## Example
//!
//! ```rust,ignore
//! let store = Arc::new(ContentStore::open(cache.join("oci"))?);
//! let puller = OciPuller::new(store, Arc::new(RemoteRegistry::new()));
//! puller.pull(&cancel, "ghcr.io/org/module:v1.0.0", &dest).await?;
//! ```

use crate::constants::{MANIFEST_MEDIA_TYPES, MAX_IMAGE_REF_LEN, PULL_TIMEOUT, TAR_LAYER_MEDIA_TYPES};
use crate::credentials::DockerCredentials;
use crate::error::{Error, Result};
use crate::extract::{ExtractLimits, ExtractTotals, extract_layer};
use crate::storage::{ContentStore, Descriptor, check_cancelled, sha256_digest};
use crate::verify::Verifier;
use async_trait::async_trait;
use oci_distribution::client::{ClientConfig, ClientProtocol};
use oci_distribution::manifest::OciDescriptor;
use oci_distribution::secrets::RegistryAuth;
use oci_distribution::{Client, Reference};
use serde::Deserialize;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use tokio::io::DuplexStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const INDEX_MEDIA_TYPES: &[&str] = &[
    "application/vnd.oci.image.index.v1+json",
    "application/vnd.docker.distribution.manifest.list.v2+json",
];

/// Minimal view of an image manifest or index.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ManifestDoc {
    #[serde(default)]
    media_type: Option<String>,
    #[serde(default)]
    config: Option<Descriptor>,
    #[serde(default)]
    layers: Vec<Descriptor>,
    #[serde(default)]
    manifests: Vec<IndexEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IndexEntry {
    media_type: String,
    digest: String,
    size: u64,
    #[serde(default)]
    platform: Option<IndexPlatform>,
}

#[derive(Debug, Deserialize)]
struct IndexPlatform {
    os: String,
    architecture: String,
}

/// Parsed OCI image manifest.
#[derive(Debug, Clone)]
pub struct ImageManifest {
    pub config: Option<Descriptor>,
    pub layers: Vec<Descriptor>,
}

impl ImageManifest {
    /// Parses manifest JSON.
    pub fn parse(raw: &[u8]) -> Result<Self> {
        let doc: ManifestDoc = serde_json::from_slice(raw)?;
        Ok(Self {
            config: doc.config,
            layers: doc.layers,
        })
    }
}

/// Where artifacts come from.
///
/// Implementations copy the manifest and every blob it references into the
/// store, tag the manifest with the reference, and return its descriptor.
#[async_trait]
pub trait ArtifactSource: Send + Sync {
    async fn copy(
        &self,
        cancel: &CancellationToken,
        reference: &Reference,
        auth: &RegistryAuth,
        store: &ContentStore,
    ) -> Result<Descriptor>;
}

/// OCI distribution client backed source.
pub struct RemoteRegistry {
    client: Client,
}

impl RemoteRegistry {
    /// Creates a client speaking HTTPS.
    pub fn new() -> Self {
        Self::with_protocol(ClientProtocol::Https)
    }

    /// Creates a client with an explicit protocol (plain HTTP for local registries).
    pub fn with_protocol(protocol: ClientProtocol) -> Self {
        Self {
            client: Client::new(ClientConfig {
                protocol,
                ..Default::default()
            }),
        }
    }

    async fn pull_manifest_bytes(&self, reference: &Reference, auth: &RegistryAuth) -> Result<(Vec<u8>, String)> {
        let (raw, digest) = tokio::time::timeout(PULL_TIMEOUT, async {
            self.client.pull_manifest_raw(reference, auth, MANIFEST_MEDIA_TYPES).await
        })
        .await
        .map_err(|_| Error::Timeout {
            operation: format!("pull manifest for {}", reference),
            duration: PULL_TIMEOUT,
        })?
        .map_err(|e| Error::TransportError(format!("pull manifest for {}: {}", reference, e)))?;

        Ok((raw.to_vec(), digest))
    }

    async fn copy_blob(
        &self,
        cancel: &CancellationToken,
        reference: &Reference,
        desc: &Descriptor,
        store: &ContentStore,
    ) -> Result<()> {
        if store.exists(desc) {
            debug!(digest = %desc.digest, "Blob already cached");
            return Ok(());
        }

        debug!(digest = %desc.digest, size = desc.size, "Pulling blob");

        let oci_desc = OciDescriptor {
            digest: desc.digest.clone(),
            size: desc.size as i64,
            media_type: desc.media_type.clone(),
            urls: None,
            annotations: None,
        };

        let oci_desc = &oci_desc;
        stream_into_store(cancel, desc, store, |writer| async move {
            tokio::time::timeout(PULL_TIMEOUT, self.client.pull_blob(reference, oci_desc, writer))
                .await
                .map_err(|_| Error::Timeout {
                    operation: format!("pull blob {}", desc.digest),
                    duration: PULL_TIMEOUT,
                })?
                .map_err(|e| Error::TransportError(format!("pull blob {}: {}", desc.digest, e)))
        })
        .await
    }
}

/// Streams a download straight into the store through an in-process pipe.
async fn stream_into_store<F, Fut>(
    cancel: &CancellationToken,
    desc: &Descriptor,
    store: &ContentStore,
    download: F,
) -> Result<()>
where
    F: FnOnce(DuplexStream) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let (writer, reader) = tokio::io::duplex(64 * 1024);
    let (downloaded, stored) = tokio::join!(download(writer), store.push(cancel, desc, reader));
    copy_outcome(downloaded, stored)
}

/// The store's verdict decides. A download error is reported only when the
/// store saw a short read.
fn copy_outcome(downloaded: Result<()>, stored: Result<()>) -> Result<()> {
    match (downloaded, stored) {
        (_, Ok(())) => Ok(()),
        (Err(cause), Err(Error::SizeMismatch { expected, actual, .. })) if actual < expected => Err(cause),
        (_, Err(e)) => Err(e),
    }
}

impl Default for RemoteRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ArtifactSource for RemoteRegistry {
    async fn copy(
        &self,
        cancel: &CancellationToken,
        reference: &Reference,
        auth: &RegistryAuth,
        store: &ContentStore,
    ) -> Result<Descriptor> {
        check_cancelled(cancel, "copy")?;

        let (mut raw, mut digest) = self.pull_manifest_bytes(reference, auth).await?;
        let mut doc: ManifestDoc = serde_json::from_slice(&raw)?;

        if doc
            .media_type
            .as_deref()
            .is_some_and(|mt| INDEX_MEDIA_TYPES.contains(&mt))
            || !doc.manifests.is_empty()
        {
            let entry = select_platform(&doc.manifests).ok_or_else(|| {
                Error::TransportError(format!("no usable manifest in index for {}", reference))
            })?;

            let digest_ref: Reference = format!("{}/{}@{}", reference.registry(), reference.repository(), entry.digest)
                .parse()
                .map_err(|e| Error::InvalidRef {
                    reference: reference.to_string(),
                    reason: format!("failed to build digest reference: {}", e),
                })?;

            debug!(digest = %entry.digest, "Resolved index entry");
            (raw, digest) = self.pull_manifest_bytes(&digest_ref, auth).await?;
            doc = serde_json::from_slice(&raw)?;
        }

        if !digest.starts_with("sha256:") {
            digest = sha256_digest(&raw);
        }
        let media_type = doc
            .media_type
            .clone()
            .unwrap_or_else(|| MANIFEST_MEDIA_TYPES[0].to_string());
        let manifest_desc = Descriptor::new(media_type, digest, raw.len() as u64);

        if let Some(config) = &doc.config {
            self.copy_blob(cancel, reference, config, store).await?;
        }
        for layer in &doc.layers {
            check_cancelled(cancel, "copy")?;
            self.copy_blob(cancel, reference, layer, store)
                .await
                .map_err(|e| e.in_layer(&layer.digest))?;
        }

        store.push(cancel, &manifest_desc, &raw[..]).await?;
        store.tag(&manifest_desc, &reference.whole())?;

        Ok(manifest_desc)
    }
}

fn select_platform(entries: &[IndexEntry]) -> Option<&IndexEntry> {
    let arch = match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    };

    entries
        .iter()
        .find(|e| e.platform.as_ref().is_some_and(|p| p.os == "linux" && p.architecture == arch))
        .or_else(|| {
            entries
                .iter()
                .find(|e| e.platform.as_ref().is_some_and(|p| p.os == "linux" && p.architecture == "amd64"))
        })
        .or_else(|| entries.iter().find(|e| !e.media_type.is_empty() && e.size > 0))
}

/// Validates and parses an image reference.
pub fn parse_reference(image_ref: &str) -> Result<Reference> {
    if image_ref.is_empty() {
        return Err(Error::InvalidRef {
            reference: String::new(),
            reason: "image reference cannot be empty".to_string(),
        });
    }

    if image_ref.len() > MAX_IMAGE_REF_LEN {
        return Err(Error::InvalidRef {
            reference: image_ref.to_string(),
            reason: format!("exceeds {} bytes", MAX_IMAGE_REF_LEN),
        });
    }

    if !image_ref
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "/:.-_@".contains(c))
    {
        return Err(Error::InvalidRef {
            reference: image_ref.to_string(),
            reason: "contains invalid characters".to_string(),
        });
    }

    image_ref.parse().map_err(|e| Error::InvalidRef {
        reference: image_ref.to_string(),
        reason: format!("{}", e),
    })
}

/// Pulls artifacts into a directory.
///
/// The trait lets the KCL generator and tests swap in another puller.
#[async_trait]
pub trait Puller: Send + Sync {
    async fn pull(&self, cancel: &CancellationToken, image_ref: &str, dest: &Path) -> Result<()>;
}

/// Registry-to-directory pull pipeline.
pub struct OciPuller {
    store: Arc<ContentStore>,
    source: Arc<dyn ArtifactSource>,
    credentials: Arc<DockerCredentials>,
    verifier: Option<Arc<dyn Verifier>>,
    limits: ExtractLimits,
}

impl OciPuller {
    pub fn new(store: Arc<ContentStore>, source: Arc<dyn ArtifactSource>) -> Self {
        Self {
            store,
            source,
            credentials: Arc::new(DockerCredentials::default()),
            verifier: None,
            limits: ExtractLimits::default(),
        }
    }

    pub fn with_credentials(mut self, credentials: DockerCredentials) -> Self {
        self.credentials = Arc::new(credentials);
        self
    }

    pub fn with_verifier(mut self, verifier: Arc<dyn Verifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    pub fn with_limits(mut self, limits: ExtractLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn store(&self) -> &Arc<ContentStore> {
        &self.store
    }

    async fn extract_artifact(&self, cancel: &CancellationToken, manifest_desc: &Descriptor, dest: &Path) -> Result<()> {
        let raw = self
            .store
            .read_bounded(cancel, manifest_desc, self.limits.max_manifest_bytes)
            .await?;
        let manifest = ImageManifest::parse(&raw)?;

        let mut totals = ExtractTotals::default();
        let mut extracted = 0usize;

        for layer in &manifest.layers {
            if !TAR_LAYER_MEDIA_TYPES.contains(&layer.media_type.as_str()) {
                debug!(digest = %layer.digest, media_type = %layer.media_type, "Skipping non-tar layer");
                continue;
            }
            check_cancelled(cancel, "extract")?;

            let file = self.store.fetch(cancel, layer).await?.into_std().await;
            let dest_owned = dest.to_path_buf();
            let limits = self.limits;
            let layer_cancel = cancel.clone();
            let mut layer_totals = totals;

            totals = tokio::task::spawn_blocking(move || {
                extract_layer(&layer_cancel, file, &dest_owned, &limits, &mut layer_totals).map(|()| layer_totals)
            })
            .await
            .map_err(|e| Error::Internal(format!("extraction task failed: {}", e)))?
            .map_err(|e| e.in_layer(&layer.digest))?;

            extracted += 1;
        }

        if extracted == 0 {
            return Err(Error::NoTarLayers(manifest_desc.digest.clone()));
        }

        tokio::fs::create_dir_all(dest).await?;
        info!(
            layers = extracted,
            files = totals.files,
            bytes = totals.bytes,
            "Extracted artifact to {}",
            dest.display()
        );
        Ok(())
    }
}

#[async_trait]
impl Puller for OciPuller {
    async fn pull(&self, cancel: &CancellationToken, image_ref: &str, dest: &Path) -> Result<()> {
        let reference = parse_reference(image_ref)?;
        if dest.as_os_str().is_empty() {
            return Err(Error::Config("destination path cannot be empty".to_string()));
        }

        info!(image_ref, "Pulling artifact");
        let auth = self.credentials.auth_for(reference.registry());

        check_cancelled(cancel, "pull")?;
        let manifest_desc = self.source.copy(cancel, &reference, &auth, &self.store).await?;

        if let Some(verifier) = &self.verifier {
            check_cancelled(cancel, "verify")?;
            verifier.verify(image_ref, &manifest_desc).await.inspect_err(|e| {
                warn!(image_ref, "Signature verification failed: {}", e);
            })?;
        }

        self.extract_artifact(cancel, &manifest_desc, dest).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_validation() {
        assert!(parse_reference("ghcr.io/org/module:v1.0.0").is_ok());
        assert!(matches!(parse_reference(""), Err(Error::InvalidRef { .. })));
        assert!(matches!(parse_reference("nginx :latest"), Err(Error::InvalidRef { .. })));
        assert!(matches!(
            parse_reference(&"a".repeat(MAX_IMAGE_REF_LEN + 1)),
            Err(Error::InvalidRef { .. })
        ));
    }

    async fn stream_bytes(desc: &Descriptor, body: Vec<u8>, fail_after: bool) -> Result<()> {
        use tokio::io::AsyncWriteExt;

        let temp = tempfile::TempDir::new().unwrap();
        let store = ContentStore::open(temp.path().join("store")).unwrap();
        stream_into_store(&CancellationToken::new(), desc, &store, |mut writer| async move {
            writer
                .write_all(&body)
                .await
                .map_err(|e| Error::TransportError(format!("write: {}", e)))?;
            if fail_after {
                return Err(Error::TransportError("connection reset".into()));
            }
            Ok(())
        })
        .await
    }

    #[tokio::test]
    async fn test_overlong_blob_is_integrity_failure() {
        let desc = Descriptor::for_bytes("application/octet-stream", b"abc");
        let err = stream_bytes(&desc, vec![7u8; 256 * 1024], false).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::SizeMismatch);
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_tampered_blob_is_integrity_failure() {
        let desc = Descriptor::for_bytes("application/octet-stream", b"abc");

        let err = stream_bytes(&desc, b"abd".to_vec(), false).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::DigestMismatch);
    }

    #[tokio::test]
    async fn test_broken_download_reports_transport_cause() {
        let desc = Descriptor::for_bytes("application/octet-stream", b"abc");

        let err = stream_bytes(&desc, b"ab".to_vec(), true).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::TransportError);
        assert!(err.is_transient());

        stream_bytes(&desc, b"abc".to_vec(), false).await.unwrap();
    }

    #[test]
    fn test_manifest_parse() {
        let raw = br#"{
            "schemaVersion": 2,
            "mediaType": "application/vnd.oci.image.manifest.v1+json",
            "config": {"mediaType": "application/vnd.oci.image.config.v1+json", "digest": "sha256:aa", "size": 2},
            "layers": [{"mediaType": "application/vnd.oci.image.layer.v1.tar", "digest": "sha256:bb", "size": 10}]
        }"#;
        let manifest = ImageManifest::parse(raw).unwrap();
        assert_eq!(manifest.layers.len(), 1);
        assert_eq!(manifest.layers[0].size, 10);
    }

    #[test]
    fn test_select_platform_prefers_linux() {
        let entries = vec![
            IndexEntry {
                media_type: "application/vnd.oci.image.manifest.v1+json".into(),
                digest: "sha256:win".into(),
                size: 1,
                platform: Some(IndexPlatform {
                    os: "windows".into(),
                    architecture: "amd64".into(),
                }),
            },
            IndexEntry {
                media_type: "application/vnd.oci.image.manifest.v1+json".into(),
                digest: "sha256:lin".into(),
                size: 1,
                platform: Some(IndexPlatform {
                    os: "linux".into(),
                    architecture: "amd64".into(),
                }),
            },
        ];
        assert_eq!(select_platform(&entries).unwrap().digest, "sha256:lin");
    }
}
