//! # Deployment Constants
//!
//! Resource limits, timeouts, fixed commit identity, and on-disk names used
//! throughout the crate. These are the **single source of truth** for
//! security-critical bounds; configuration may override the extraction
//! limits but falls back to the values here.
//!
//! ## Cross-References
//!
//! - [`crate::extract`]: Uses file size, total size, and file count limits
//! - [`crate::registry`]: Uses manifest limit and pull timeout
//! - [`crate::deployer`]: Uses commit identity and file names
//! - [`crate::reconciler`]: Uses TTL and backoff defaults

use std::time::Duration;

// =============================================================================
// Extraction Limits
// =============================================================================
//
// Limits apply to a single pull. Total size and file count are running sums
// across every layer of the artifact, so splitting a payload over many
// layers does not bypass them.
// =============================================================================

/// Maximum manifest size (10 MiB).
///
/// **Security**: Bounds memory used when reading and parsing the manifest
/// blob. Real manifests are a few KiB.
pub const MAX_MANIFEST_BYTES: u64 = 10 * 1024 * 1024;

/// Maximum size of a single extracted file (100 MiB).
///
/// **Security**: Checked against the tar header before the destination file
/// is created, so a rejected entry leaves nothing on disk.
pub const MAX_FILE_BYTES: u64 = 100 * 1024 * 1024;

/// Maximum total extracted bytes across all layers of one pull (1 GiB).
///
/// **Attack Vector**: Compression bombs (small compressed, huge uncompressed).
pub const MAX_TOTAL_EXTRACT_BYTES: u64 = 1024 * 1024 * 1024;

/// Maximum number of extracted entries across all layers of one pull.
///
/// **Attack Vector**: Inode exhaustion through millions of empty files.
pub const MAX_FILE_COUNT: u64 = 10_000;

/// Maximum OCI reference length in bytes.
pub const MAX_IMAGE_REF_LEN: usize = 512;

/// Layer media types the puller extracts. Everything else is ignored.
pub const TAR_LAYER_MEDIA_TYPES: &[&str] = &[
    "application/vnd.oci.image.layer.v1.tar",
    "application/vnd.oci.image.layer.v1.tar+gzip",
    "application/octet-stream",
];

/// Manifest media types accepted from registries.
pub const MANIFEST_MEDIA_TYPES: &[&str] = &[
    "application/vnd.oci.image.manifest.v1+json",
    "application/vnd.docker.distribution.manifest.v2+json",
    "application/vnd.oci.image.index.v1+json",
    "application/vnd.docker.distribution.manifest.list.v2+json",
];

// =============================================================================
// Timeouts
// =============================================================================

/// Bound on any single registry request.
pub const PULL_TIMEOUT: Duration = Duration::from_secs(300);

/// Default bound on one reconcile tick.
pub const DEFAULT_TICK_TIMEOUT: Duration = Duration::from_secs(600);

/// Default TTL for terminal ReleaseDeployments, in seconds.
pub const DEFAULT_TTL_SECONDS: i64 = 300;

/// Default attempt cap per deployment record.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Base delay for error requeues.
pub const DEFAULT_REQUEUE_BASE: Duration = Duration::from_secs(5);

/// Upper bound for error requeues.
pub const DEFAULT_REQUEUE_MAX: Duration = Duration::from_secs(300);

/// Longest wait before a terminal resource is looked at again. Larger TTLs
/// are re-checked in steps of this size.
pub const MAX_TTL_REQUEUE: Duration = Duration::from_secs(24 * 60 * 60);

// =============================================================================
// GitOps Conventions
// =============================================================================

/// Commit author name for automatic deployments.
pub const GIT_AUTHOR_NAME: &str = "Catalyst Forge";

/// Commit author email for automatic deployments.
pub const GIT_AUTHOR_EMAIL: &str = "forge@projectcatalyst.io";

/// Basic-auth username paired with the token from the secret store.
pub const GIT_AUTH_USERNAME: &str = "forge";

/// Canonical bundle file written per project.
pub const BUNDLE_FILENAME: &str = "bundle.cue";

/// Deployment payload file written per project.
pub const PAYLOAD_FILENAME: &str = "deployment.json";

/// Per-environment overlay that survives project clearing.
pub const ENV_FILENAME: &str = "env.mod.cue";

/// Blueprint file inside a project directory.
pub const BLUEPRINT_FILENAME: &str = "blueprint.cue";

/// Builds the commit message for a project.
pub fn commit_message(project: &str) -> String {
    format!("chore: automatic deployment for {}", project)
}

// =============================================================================
// Storage Layout
// =============================================================================

/// Blob directory under a content store root.
pub const BLOBS_DIR: &str = "blobs";

/// Directory under the user cache holding cloned repositories.
pub const CACHE_NAMESPACE: &str = "forge";

/// Default Sigstore transparency log.
pub const DEFAULT_REKOR_URL: &str = "https://rekor.sigstore.dev";
