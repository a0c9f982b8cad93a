//! Error types for the container engine core.
//!
//! Every fallible operation in the crate returns [`Result`]. Pipelines that
//! end in a terminal `Error` state carry the cause as an `Arc<Error>` so the
//! same failure can be observed by every subscriber.
//!
//! Callers that only need to branch on the broad category use
//! [`Error::kind`]:
//!
//! | Kind | Typical trigger |
//! |------|-----------------|
//! | `NotFound` | unknown image, container, registry or layer id |
//! | `Conflict` | duplicate container name, layer still referenced |
//! | `Integrity` | downloaded blob hash differs from its digest |
//! | `Registry` | manifest/config/layer fetch failed |
//! | `Filesystem` | extraction failure, path traversal, I/O |
//! | `Cancelled` | explicit cancel of a pull or create |

use std::path::PathBuf;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the engine core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Lookup Errors
    // =========================================================================
    /// Image not present in the metadata store.
    #[error("image not found: {0}")]
    ImageNotFound(String),

    /// Container not present in the metadata store.
    #[error("container not found: {0}")]
    ContainerNotFound(String),

    /// Registry id not configured.
    #[error("registry not found: {0}")]
    RegistryNotFound(String),

    /// Layer row or cached layer file missing.
    #[error("layer not found: {0}")]
    LayerNotFound(String),

    // =========================================================================
    // Conflict Errors
    // =========================================================================
    /// A container with this name already exists.
    #[error("container name already in use: {0}")]
    NameConflict(String),

    /// Layer is still referenced by at least one image.
    #[error("layer {0} is still referenced by an image")]
    LayerInUse(String),

    /// Image is still used by at least one container.
    #[error("image {image} is used by container {container}")]
    ImageInUse { image: String, container: String },

    /// Built-in registries cannot be removed.
    #[error("registry {0} is built in and cannot be removed")]
    BuiltinRegistry(String),

    // =========================================================================
    // Integrity Errors
    // =========================================================================
    /// Blob content hash differs from the expected digest.
    #[error("digest mismatch for {digest}: computed {computed}")]
    DigestMismatch { digest: String, computed: String },

    /// Layer exceeds the per-layer size limit.
    #[error("layer {digest} exceeds size limit: {size} > {limit} bytes")]
    LayerTooLarge { digest: String, size: u64, limit: u64 },

    // =========================================================================
    // Registry Errors
    // =========================================================================
    /// Registry answered with an unexpected status.
    #[error("registry {url} returned {status}: {message}")]
    Registry {
        url: String,
        status: u16,
        message: String,
    },

    /// Transport-level failure talking to a registry.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Manifest could not be interpreted.
    #[error("invalid manifest for '{reference}': {reason}")]
    Manifest { reference: String, reason: String },

    // =========================================================================
    // Filesystem Errors
    // =========================================================================
    /// Path traversal attempt detected in tar archive.
    #[error("path traversal detected in layer: {path}")]
    PathTraversal { path: String },

    /// Layer extraction failed.
    #[error("failed to extract layer {digest}: {reason}")]
    Extraction { digest: String, reason: String },

    /// Extracted rootfs exceeded the size limit.
    #[error("root filesystem exceeds size limit: {size} > {limit} bytes")]
    RootfsTooLarge { size: u64, limit: u64 },

    /// Storage directory could not be prepared.
    #[error("failed to initialize storage at {path}: {reason}")]
    StorageInit { path: PathBuf, reason: String },

    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // =========================================================================
    // Cancellation
    // =========================================================================
    /// Operation was cancelled by its owner.
    #[error("{0} cancelled")]
    Cancelled(String),

    // =========================================================================
    // Store Errors
    // =========================================================================
    /// Relational store failure.
    #[error("metadata store error: {0}")]
    Store(#[from] rusqlite::Error),

    // =========================================================================
    // Validation Errors
    // =========================================================================
    /// Failed to parse image reference.
    #[error("invalid image reference '{reference}': {reason}")]
    InvalidImageReference { reference: String, reason: String },

    /// Container name does not match the allowed pattern.
    #[error("invalid container name '{0}'")]
    InvalidName(String),

    /// Registry URL is not an http(s) URL.
    #[error("invalid registry url '{0}'")]
    InvalidRegistryUrl(String),

    /// Empty or oversized search query.
    #[error("invalid search query '{0}'")]
    InvalidSearchQuery(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // =========================================================================
    // Timeout Errors
    // =========================================================================
    /// Operation timed out.
    #[error("operation timed out after {duration:?}: {operation}")]
    Timeout {
        operation: String,
        duration: std::time::Duration,
    },

    // =========================================================================
    // Pipeline Errors
    // =========================================================================
    /// Terminal error of a pipeline, shared by all of its observers.
    #[error(transparent)]
    Shared(std::sync::Arc<Error>),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Internal error (should not happen).
    #[error("internal error: {0}")]
    Internal(String),
}

/// Broad category of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Conflict,
    Integrity,
    Registry,
    Filesystem,
    Cancelled,
    Store,
    InvalidInput,
    Internal,
}

impl Error {
    /// Returns the category this error belongs to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::ImageNotFound(_)
            | Error::ContainerNotFound(_)
            | Error::RegistryNotFound(_)
            | Error::LayerNotFound(_) => ErrorKind::NotFound,
            Error::NameConflict(_)
            | Error::LayerInUse(_)
            | Error::ImageInUse { .. }
            | Error::BuiltinRegistry(_) => ErrorKind::Conflict,
            Error::DigestMismatch { .. } | Error::LayerTooLarge { .. } => ErrorKind::Integrity,
            Error::Registry { .. } | Error::Http(_) | Error::Manifest { .. } | Error::Timeout { .. } => {
                ErrorKind::Registry
            }
            Error::PathTraversal { .. }
            | Error::Extraction { .. }
            | Error::RootfsTooLarge { .. }
            | Error::StorageInit { .. }
            | Error::Io(_) => ErrorKind::Filesystem,
            Error::Cancelled(_) => ErrorKind::Cancelled,
            Error::Store(_) => ErrorKind::Store,
            Error::InvalidImageReference { .. }
            | Error::InvalidName(_)
            | Error::InvalidRegistryUrl(_)
            | Error::InvalidSearchQuery(_)
            | Error::Serialization(_) => ErrorKind::InvalidInput,
            Error::Shared(inner) => inner.kind(),
            Error::Internal(_) => ErrorKind::Internal,
        }
    }

    /// True when the error came from an explicit cancel.
    pub fn is_cancelled(&self) -> bool {
        self.kind() == ErrorKind::Cancelled
    }
}
