//! Error types for the deployment engine, operator, and OCI pull pipeline.
//!
//! Every failure surfaces as a named variant. Callers branch on
//! [`Error::kind`] rather than on rendered messages.

use std::path::PathBuf;
use std::time::Duration;

/// Result type alias for deployment operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur anywhere in the deployment toolchain.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Content Store Errors
    // =========================================================================
    /// Blob, tag, record, or resource not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Content hash did not match the expected digest.
    #[error("digest mismatch: expected {expected}, computed {actual}")]
    DigestMismatch { expected: String, actual: String },

    /// Number of bytes read or written did not match the declared size.
    #[error("size mismatch for {subject}: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        subject: String,
        expected: u64,
        actual: u64,
    },

    // =========================================================================
    // Extraction Errors
    // =========================================================================
    /// Path traversal attempt detected in a tar archive.
    #[error("path traversal detected in layer: {path}")]
    PathTraversal { path: String },

    /// A configured resource limit would be exceeded.
    #[error("{limit} limit exceeded: {size} > {max}")]
    ResourceLimit {
        limit: ResourceLimitKind,
        size: u64,
        max: u64,
    },

    /// Failure while extracting a specific layer.
    #[error("failed to extract layer {digest}: {source}")]
    Layer {
        digest: String,
        #[source]
        source: Box<Error>,
    },

    // =========================================================================
    // OCI Errors
    // =========================================================================
    /// Malformed image reference.
    #[error("invalid reference '{reference}': {reason}")]
    InvalidRef { reference: String, reason: String },

    /// Signature verification rejected the artifact.
    #[error("signature verification failed for {reference}: {reason}")]
    SigVerification { reference: String, reason: String },

    /// The artifact had no extractable tar layers.
    #[error("no tar layers found in OCI artifact {0}")]
    NoTarLayers(String),

    // =========================================================================
    // Git Errors
    // =========================================================================
    /// Reference did not resolve to a commit, branch, or tag.
    #[error("reference not found: {0}")]
    RefNotFound(String),

    /// HEAD is not pointed to by any annotated tag.
    #[error("no annotated tag points at HEAD")]
    TagNotFound,

    /// Remote had nothing new. Non-fatal sentinel.
    #[error("already up to date")]
    NoUpdates,

    /// Nothing staged to commit. Non-fatal sentinel.
    #[error("no changes to commit")]
    NoChanges,

    /// Local git operation failed.
    #[error("git error: {0}")]
    Git(String),

    // =========================================================================
    // Bundle & Generator Errors
    // =========================================================================
    /// Project has no deployment bundle.
    #[error("project does not have a deployment bundle: {0}")]
    NoBundle(String),

    /// Git module declared no `values.paths`.
    #[error("no paths specified for module {0}")]
    NoPaths(String),

    /// A path listed by a module does not exist.
    #[error("path {0} does not exist in git repo")]
    PathNotFound(String),

    /// Module or bundle failed validation.
    #[error("validation failed: {0}")]
    ValidationFailed(String),

    /// Structured source could not be parsed.
    #[error("parse error at line {line}, column {column}: {message}")]
    Parse {
        line: usize,
        column: usize,
        message: String,
    },

    /// External command exited unsuccessfully.
    #[error("command '{program}' failed ({status}): {stderr}")]
    Command {
        program: String,
        status: String,
        stderr: String,
    },

    // =========================================================================
    // Transport & Cluster Errors
    // =========================================================================
    /// Network failure talking to git, the API, or a registry.
    #[error("transport error: {0}")]
    TransportError(String),

    /// Kubernetes API failure.
    #[error("kubernetes error: {0}")]
    Kube(String),

    // =========================================================================
    // Cancellation & Timeout Errors
    // =========================================================================
    /// Operation was cancelled.
    #[error("operation cancelled: {0}")]
    Cancelled(String),

    /// Operation timed out.
    #[error("operation timed out after {duration:?}: {operation}")]
    Timeout {
        operation: String,
        duration: Duration,
    },

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid or unreadable configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Failed to prepare a directory.
    #[error("failed to initialize {path}: {reason}")]
    InitFailed { path: PathBuf, reason: String },

    // =========================================================================
    // I/O Errors
    // =========================================================================
    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Internal error (should not happen).
    #[error("internal error: {0}")]
    Internal(String),
}

/// Which resource limit tripped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceLimitKind {
    Manifest,
    FileSize,
    TotalSize,
    FileCount,
}

impl std::fmt::Display for ResourceLimitKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Manifest => write!(f, "manifest size"),
            Self::FileSize => write!(f, "file size"),
            Self::TotalSize => write!(f, "total extract size"),
            Self::FileCount => write!(f, "file count"),
        }
    }
}

/// Fieldless discriminant of [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    DigestMismatch,
    SizeMismatch,
    PathTraversal,
    ResourceLimit,
    InvalidRef,
    SigVerification,
    NoTarLayers,
    RefNotFound,
    TagNotFound,
    NoUpdates,
    NoChanges,
    Git,
    NoBundle,
    NoPaths,
    PathNotFound,
    ValidationFailed,
    Parse,
    Command,
    TransportError,
    Kube,
    Cancelled,
    Timeout,
    Config,
    Io,
    Serialization,
    Internal,
}

impl Error {
    /// Returns the kind of this error. Layer wrappers report the inner kind.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::DigestMismatch { .. } => ErrorKind::DigestMismatch,
            Self::SizeMismatch { .. } => ErrorKind::SizeMismatch,
            Self::PathTraversal { .. } => ErrorKind::PathTraversal,
            Self::ResourceLimit { .. } => ErrorKind::ResourceLimit,
            Self::Layer { source, .. } => source.kind(),
            Self::InvalidRef { .. } => ErrorKind::InvalidRef,
            Self::SigVerification { .. } => ErrorKind::SigVerification,
            Self::NoTarLayers(_) => ErrorKind::NoTarLayers,
            Self::RefNotFound(_) => ErrorKind::RefNotFound,
            Self::TagNotFound => ErrorKind::TagNotFound,
            Self::NoUpdates => ErrorKind::NoUpdates,
            Self::NoChanges => ErrorKind::NoChanges,
            Self::Git(_) => ErrorKind::Git,
            Self::NoBundle(_) => ErrorKind::NoBundle,
            Self::NoPaths(_) => ErrorKind::NoPaths,
            Self::PathNotFound(_) => ErrorKind::PathNotFound,
            Self::ValidationFailed(_) => ErrorKind::ValidationFailed,
            Self::Parse { .. } => ErrorKind::Parse,
            Self::Command { .. } => ErrorKind::Command,
            Self::TransportError(_) => ErrorKind::TransportError,
            Self::Kube(_) => ErrorKind::Kube,
            Self::Cancelled(_) => ErrorKind::Cancelled,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Config(_) | Self::InitFailed { .. } => ErrorKind::Config,
            Self::Io(_) => ErrorKind::Io,
            Self::Serialization(_) => ErrorKind::Serialization,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// True for failures worth retrying via requeue.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::TransportError | ErrorKind::Timeout | ErrorKind::Cancelled | ErrorKind::Kube
        )
    }

    /// Wraps this error with the digest of the layer being processed.
    pub fn in_layer(self, digest: impl Into<String>) -> Self {
        Self::Layer {
            digest: digest.into(),
            source: Box::new(self),
        }
    }
}

impl From<git2::Error> for Error {
    fn from(e: git2::Error) -> Self {
        match e.class() {
            git2::ErrorClass::Net | git2::ErrorClass::Http | git2::ErrorClass::Ssl | git2::ErrorClass::Ssh => {
                Self::TransportError(e.message().to_string())
            }
            _ if e.code() == git2::ErrorCode::Auth => Self::TransportError(e.message().to_string()),
            _ => Self::Git(e.message().to_string()),
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Self::TransportError(e.to_string())
    }
}

impl From<kube::Error> for Error {
    fn from(e: kube::Error) -> Self {
        match &e {
            kube::Error::Api(resp) if resp.code == 404 => Self::NotFound(resp.message.clone()),
            _ => Self::Kube(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layer_wrapper_reports_inner_kind() {
        let err = Error::PathTraversal {
            path: "../etc/passwd".to_string(),
        }
        .in_layer("sha256:abc");

        assert_eq!(err.kind(), ErrorKind::PathTraversal);
        assert!(err.to_string().contains("sha256:abc"));
    }

    #[test]
    fn test_transient_classification() {
        assert!(Error::TransportError("reset".into()).is_transient());
        assert!(
            Error::Timeout {
                operation: "pull".into(),
                duration: Duration::from_secs(1)
            }
            .is_transient()
        );
        assert!(!Error::NoBundle("p".into()).is_transient());
        assert!(!Error::NoChanges.is_transient());
    }

    #[test]
    fn test_resource_limit_display() {
        let err = Error::ResourceLimit {
            limit: ResourceLimitKind::FileCount,
            size: 10_001,
            max: 10_000,
        };
        assert_eq!(err.to_string(), "file count limit exceeded: 10001 > 10000");
    }
}
