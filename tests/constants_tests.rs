//! Tests for constants module.
//!
//! Validates that security-critical limits have sane values and that the
//! GitOps conventions match what downstream tooling expects.

use forge_deployer::constants::*;
use std::time::Duration;

// =============================================================================
// Size Limit Tests
// =============================================================================

#[test]
fn test_image_ref_length_reasonable() {
    // "registry.example.com:5000/namespace/module:tag@sha256:abc..."
    assert!(MAX_IMAGE_REF_LEN >= 256, "image ref limit too restrictive");
    assert!(MAX_IMAGE_REF_LEN <= 1024, "image ref limit too permissive");
}

#[test]
fn test_limits_are_ordered() {
    assert!(MAX_MANIFEST_BYTES < MAX_FILE_BYTES);
    assert!(MAX_FILE_BYTES <= MAX_TOTAL_EXTRACT_BYTES);
    assert!(MAX_FILE_COUNT > 0);
}

#[test]
fn test_limits_do_not_overflow_when_summed() {
    // Running totals add one file at a time
    assert!(MAX_TOTAL_EXTRACT_BYTES.checked_add(MAX_FILE_BYTES).is_some());
    assert!(MAX_FILE_COUNT.checked_add(1).is_some());
}

#[test]
fn test_tar_media_types() {
    assert!(TAR_LAYER_MEDIA_TYPES.contains(&"application/vnd.oci.image.layer.v1.tar"));
    assert!(TAR_LAYER_MEDIA_TYPES.contains(&"application/vnd.oci.image.layer.v1.tar+gzip"));
    assert!(!TAR_LAYER_MEDIA_TYPES.iter().any(|m| m.ends_with("+json")));
}

// =============================================================================
// Timing Tests
// =============================================================================

#[test]
fn test_requeue_bounds() {
    assert!(DEFAULT_REQUEUE_BASE < DEFAULT_REQUEUE_MAX);
    assert!(DEFAULT_REQUEUE_BASE >= Duration::from_secs(1));
}

#[test]
fn test_lifecycle_defaults() {
    assert_eq!(DEFAULT_TTL_SECONDS, 300);
    assert_eq!(DEFAULT_MAX_ATTEMPTS, 3);
    assert!(PULL_TIMEOUT <= DEFAULT_TICK_TIMEOUT);
}

// =============================================================================
// GitOps Convention Tests
// =============================================================================

#[test]
fn test_file_names() {
    assert_eq!(BUNDLE_FILENAME, "bundle.cue");
    assert_eq!(PAYLOAD_FILENAME, "deployment.json");
    assert_eq!(ENV_FILENAME, "env.mod.cue");
    assert_eq!(BLUEPRINT_FILENAME, "blueprint.cue");
}

#[test]
fn test_commit_message() {
    assert_eq!(commit_message("p"), "chore: automatic deployment for p");
}

#[test]
fn test_auth_username() {
    assert_eq!(GIT_AUTH_USERNAME, "forge");
}
