//! Shared fixtures for integration tests.
//!
//! Provides an in-process artifact source, tar/manifest builders, and git
//! repositories seeded on disk behind a bare remote.

#![allow(dead_code)]

use async_trait::async_trait;
use forge_deployer::error::Result;
use forge_deployer::storage::{ContentStore, Descriptor};
use forge_deployer::{ArtifactSource, Repo};
use oci_distribution::Reference;
use oci_distribution::secrets::RegistryAuth;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

pub const LAYER_TAR: &str = "application/vnd.oci.image.layer.v1.tar";
pub const LAYER_TAR_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
pub const MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const CONFIG: &str = "application/vnd.oci.image.config.v1+json";

// =============================================================================
// Tar Builders
// =============================================================================

/// A plain tar with one regular file per `(name, contents)`.
pub fn tar_of(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (name, contents) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        header.set_entry_type(tar::EntryType::Regular);
        builder.append_data(&mut header, name, *contents).unwrap();
    }
    builder.into_inner().unwrap()
}

/// A tar whose single entry carries `name` verbatim, bypassing the
/// builder's own path checks.
pub fn tar_with_raw_name(name: &str, contents: &[u8]) -> Vec<u8> {
    let mut header = tar::Header::new_old();
    {
        let old = header.as_old_mut();
        let bytes = name.as_bytes();
        old.name[..bytes.len()].copy_from_slice(bytes);
    }
    header.set_size(contents.len() as u64);
    header.set_mode(0o644);
    header.set_entry_type(tar::EntryType::Regular);
    header.set_cksum();

    let mut builder = tar::Builder::new(Vec::new());
    builder.append(&header, contents).unwrap();
    builder.into_inner().unwrap()
}

pub fn gzip(data: &[u8]) -> Vec<u8> {
    use std::io::Write;
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

// =============================================================================
// In-Process Artifact Source
// =============================================================================

/// Manifest JSON for `layers`, plus the blobs it references.
pub struct Artifact {
    pub manifest: Vec<u8>,
    pub blobs: Vec<(Descriptor, Vec<u8>)>,
}

impl Artifact {
    /// Builds an artifact from `(media_type, bytes)` layers.
    pub fn new(layers: Vec<(&str, Vec<u8>)>) -> Self {
        let config = b"{}".to_vec();
        let config_desc = Descriptor::for_bytes(CONFIG, &config);

        let mut blobs = vec![(config_desc.clone(), config)];
        let mut layer_descs = Vec::new();
        for (media_type, data) in layers {
            let desc = Descriptor::for_bytes(media_type, &data);
            layer_descs.push(desc.clone());
            blobs.push((desc, data));
        }

        let manifest = serde_json::to_vec(&serde_json::json!({
            "schemaVersion": 2,
            "mediaType": MANIFEST,
            "config": config_desc,
            "layers": layer_descs,
        }))
        .unwrap();

        Self { manifest, blobs }
    }

    /// A single uncompressed tar layer.
    pub fn single_tar(tar: Vec<u8>) -> Self {
        Self::new(vec![(LAYER_TAR, tar)])
    }

    pub fn manifest_descriptor(&self) -> Descriptor {
        Descriptor::for_bytes(MANIFEST, &self.manifest)
    }
}

/// Serves one prebuilt artifact for any reference.
pub struct LocalSource {
    artifact: Artifact,
}

impl LocalSource {
    pub fn new(artifact: Artifact) -> Self {
        Self { artifact }
    }
}

#[async_trait]
impl ArtifactSource for LocalSource {
    async fn copy(
        &self,
        cancel: &CancellationToken,
        reference: &Reference,
        _auth: &RegistryAuth,
        store: &ContentStore,
    ) -> Result<Descriptor> {
        for (desc, data) in &self.artifact.blobs {
            store.push(cancel, desc, data.as_slice()).await?;
        }

        let manifest_desc = self.artifact.manifest_descriptor();
        store
            .push(cancel, &manifest_desc, self.artifact.manifest.as_slice())
            .await?;
        store.tag(&manifest_desc, &reference.whole())?;
        Ok(manifest_desc)
    }
}

// =============================================================================
// Git Fixtures
// =============================================================================

/// A bare remote seeded with one commit.
pub struct BareRemote {
    pub path: PathBuf,
    pub head: String,
}

impl BareRemote {
    pub fn url(&self) -> String {
        self.path.to_string_lossy().into_owned()
    }
}

/// Commits `files` on `main` in a scratch worktree, then bare-clones it to
/// `<dir>/<name>.git`.
pub fn bare_remote(dir: &Path, name: &str, files: &[(&str, &[u8])]) -> BareRemote {
    let work = dir.join(format!("{}-seed", name));
    let repo = Repo::init(&work).unwrap();
    for (rel, contents) in files {
        repo.write_file(rel, contents).unwrap();
    }
    let head = repo.commit("initial commit").unwrap();

    let path = dir.join(format!("{}.git", name));
    git2::build::RepoBuilder::new()
        .bare(true)
        .clone(work.to_str().unwrap(), &path)
        .unwrap();

    BareRemote { path, head }
}

/// Tip of `refs/heads/<branch>` in a bare remote.
pub fn remote_head(bare: &Path, branch: &str) -> String {
    let repo = git2::Repository::open_bare(bare).unwrap();
    let reference = repo.find_reference(&format!("refs/heads/{}", branch)).unwrap();
    reference.peel_to_commit().unwrap().id().to_string()
}

/// Reads a file from the tip of `branch` in a bare remote.
pub fn remote_file(bare: &Path, branch: &str, rel: &str) -> Option<Vec<u8>> {
    let repo = git2::Repository::open_bare(bare).unwrap();
    let tree = repo
        .find_reference(&format!("refs/heads/{}", branch))
        .unwrap()
        .peel_to_tree()
        .unwrap();
    let entry = tree.get_path(Path::new(rel)).ok()?;
    let blob = repo.find_blob(entry.id()).ok()?;
    Some(blob.content().to_vec())
}

/// Number of commits reachable from `branch`.
pub fn commit_count(bare: &Path, branch: &str) -> usize {
    let repo = git2::Repository::open_bare(bare).unwrap();
    let mut walk = repo.revwalk().unwrap();
    walk.push_ref(&format!("refs/heads/{}", branch)).unwrap();
    walk.count()
}

// =============================================================================
// Bundles
// =============================================================================

pub const BLUEPRINT: &str = r#"
version: "1.0"
project: {
	name: "p"
	deployment: {
		bundle: {
			env: "test"
			modules: main: {
				name:    "module"
				version: "v1.0.0"
				values: foo: "bar"
			}
		}
	}
}
global: deployment: registries: modules: "registry.com/modules"
"#;

pub const MANIFEST_YAML: &[u8] = b"kind: Deployment\n";
