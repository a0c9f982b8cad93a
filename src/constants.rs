//! # Engine Constants
//!
//! Resource limits, timeouts, media types and built-in registry identities.
//! These constants are the **single source of truth** for security-relevant
//! bounds throughout the codebase; runtime-tunable values live in
//! [`crate::config::EngineConfig`] and take their defaults from here.
//!
//! ## Cross-References
//!
//! - [`crate::rootfs`]: size limits for layer extraction
//! - [`crate::registry`]: media types, probe timeouts, built-in registries
//! - [`crate::pull`]: layer count and size limits
//! - [`crate::create`]: container name validation and name generation

use std::time::Duration;

// =============================================================================
// Size Limits
// =============================================================================
//
// These limits prevent disk exhaustion and memory exhaustion from malicious
// or malformed images. The cumulative worst case is:
//   MAX_LAYERS × MAX_LAYER_SIZE = 128 × 2 GiB (compressed)
// MAX_ROOTFS_SIZE provides the actual extraction bound.
// =============================================================================

/// Maximum image reference length in bytes.
///
/// **Security**: Prevents injection via overly long image names. Registry
/// implementations may have lower limits.
pub const MAX_IMAGE_REF_LEN: usize = 512;

/// Maximum size of a single compressed layer (2 GiB).
///
/// **Security**: A registry could serve an unbounded body. Downloads are
/// aborted as soon as the received byte count passes this limit.
pub const MAX_LAYER_SIZE: u64 = 2 * 1024 * 1024 * 1024;

/// Maximum total extracted rootfs size (8 GiB).
///
/// **Security**: Enforced during tar extraction, accumulated across all
/// layers of one container.
///
/// **Attack Vector**: Compression bombs (small compressed, huge uncompressed).
pub const MAX_ROOTFS_SIZE: u64 = 8 * 1024 * 1024 * 1024;

/// Maximum number of layers in an image.
pub const MAX_LAYERS: usize = 128;

/// Maximum manifest size (4 MiB).
pub const MAX_MANIFEST_SIZE: usize = 4 * 1024 * 1024;

/// Maximum config blob size (4 MiB).
pub const MAX_CONFIG_SIZE: usize = 4 * 1024 * 1024;

/// Maximum body of a tag list or search page (4 MiB).
pub const MAX_LISTING_SIZE: usize = 4 * 1024 * 1024;

// =============================================================================
// Timeouts and Intervals
// =============================================================================

/// Interval between periodic registry health probes (5 minutes).
pub const DEFAULT_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(300);

/// Timeout for a single `GET /v2/` health probe.
///
/// A probe that does not answer within this window counts as a failure.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Consecutive probe failures before a registry is demoted to unhealthy.
pub const DEFAULT_UNHEALTHY_THRESHOLD: u32 = 3;

/// Timeout for a whole image pull (30 minutes).
///
/// **Security**: Prevents indefinite hangs from unresponsive registries.
/// Covers manifest resolution and every layer download.
pub const DEFAULT_PULL_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Lifetime assumed for a bearer token when the token endpoint omits
/// `expires_in`.
pub const DEFAULT_TOKEN_LIFETIME: Duration = Duration::from_secs(60);

/// Upper bound on parallel layer downloads within a single pull.
pub const DEFAULT_MAX_CONCURRENT_DOWNLOADS: usize = 4;

// =============================================================================
// Registries
// =============================================================================

/// Canonical Docker Hub upstream, used when no mirror is healthy.
pub const DEFAULT_REGISTRY_URL: &str = "https://registry-1.docker.io";

/// Logical registry name used by image references without a host.
pub const DOCKER_HUB_REGISTRY: &str = "docker.io";

/// Id of the built-in Docker Hub registry row.
pub const DOCKER_HUB_REGISTRY_ID: &str = "c0d1e2f3-4567-49ab-cdef-0123456789ab";

/// Id of the built-in DaoCloud mirror row.
pub const DAOCLOUD_MIRROR_ID: &str = "3f8e7d6c-5b4a-4876-80fe-dcba98765432";

/// URL of the built-in DaoCloud mirror.
pub const DAOCLOUD_MIRROR_URL: &str = "https://docker.m.daocloud.io";

/// Priority assigned to built-in registries.
pub const BUILTIN_REGISTRY_PRIORITY: i32 = 100;

/// Priority assigned to custom mirrors when the caller gives none.
pub const DEFAULT_CUSTOM_PRIORITY: i32 = 50;

/// Docker Hub repository search endpoint.
pub const DOCKER_HUB_SEARCH_URL: &str = "https://hub.docker.com/v2/search/repositories/";

/// Tags requested per page when the caller gives no size.
pub const DEFAULT_TAG_PAGE_SIZE: u32 = 50;

/// Results requested per search page when the caller gives no size.
pub const DEFAULT_SEARCH_PAGE_SIZE: u32 = 25;

/// Docker Hub rejects larger search pages.
pub const MAX_SEARCH_PAGE_SIZE: u32 = 100;

// =============================================================================
// Storage Layout
// =============================================================================

/// Directory name under the engine root for the application data.
pub const APP_DIR: &str = "burrow";

/// SQLite database file name.
pub const DATABASE_FILE: &str = "burrow.db";

/// Subdirectory for cached layer archives (`<hex>.tar.gz`).
pub const LAYERS_DIR: &str = "layers";

/// Subdirectory holding one rootfs directory per container id.
pub const CONTAINERS_DIR: &str = "containers";

/// File suffix of a cached layer archive.
pub const LAYER_FILE_SUFFIX: &str = ".tar.gz";

// =============================================================================
// OCI / Docker Media Types
// =============================================================================
//
// Reference: <https://github.com/opencontainers/image-spec/blob/main/media-types.md>
// =============================================================================

/// OCI Image Manifest media type (single-platform image).
pub const OCI_IMAGE_MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";

/// OCI Image Index media type (multi-platform manifest list).
pub const OCI_IMAGE_INDEX_MEDIA_TYPE: &str = "application/vnd.oci.image.index.v1+json";

/// Docker v2 schema 2 manifest.
pub const DOCKER_MANIFEST_MEDIA_TYPE: &str = "application/vnd.docker.distribution.manifest.v2+json";

/// Docker v2 manifest list.
pub const DOCKER_MANIFEST_LIST_MEDIA_TYPE: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";

/// OCI Layer media type (gzip-compressed tar archive).
pub const OCI_LAYER_MEDIA_TYPE_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";

/// Accept header sent with every manifest request, lists first.
pub const MANIFEST_ACCEPT: &str = "application/vnd.docker.distribution.manifest.list.v2+json, \
     application/vnd.oci.image.index.v1+json, \
     application/vnd.docker.distribution.manifest.v2+json, \
     application/vnd.oci.image.manifest.v1+json";

// =============================================================================
// Container Defaults
// =============================================================================
//
// Sentinel values of `ContainerConfig`. A field still holding its sentinel
// after the caller is done is replaced by the image's value during merge.
// =============================================================================

/// Default command when neither caller nor image supplies one.
pub const DEFAULT_CMD: &str = "/bin/sh";

/// Default working directory.
pub const DEFAULT_WORKING_DIR: &str = "/";

/// Default user.
pub const DEFAULT_USER: &str = "root";

/// Default hostname inside the container.
pub const DEFAULT_HOSTNAME: &str = "localhost";

// =============================================================================
// Validation Patterns
// =============================================================================
//
// All validation is allowlist-based (only listed characters permitted).
// =============================================================================

/// Valid characters for image references.
///
/// The `@` is for digest references like `nginx@sha256:abc...`.
/// The `:` is for tag references like `nginx:latest`.
pub const IMAGE_REF_VALID_CHARS: &str =
    "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789-_./:@";

/// Valid characters for container names.
///
/// **Security**: Excludes `/` so a name can never become a path component
/// that escapes the containers directory.
pub const CONTAINER_NAME_VALID_CHARS: &str =
    "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789-_.";

/// Maximum container name length.
pub const MAX_CONTAINER_NAME_LEN: usize = 128;

/// Adjectives used by generated container names.
pub const NAME_ADJECTIVES: &[&str] = &[
    "brave", "calm", "eager", "fancy", "gentle", "happy", "jolly", "kind", "lively", "merry",
    "nimble", "proud", "quiet", "silly", "swift", "witty", "zealous", "bold", "clever", "daring",
];

/// Nouns used by generated container names.
pub const NAME_NOUNS: &[&str] = &[
    "otter", "badger", "falcon", "heron", "lynx", "marten", "newt", "owl", "panda", "quokka",
    "raven", "seal", "tapir", "urchin", "vole", "walrus", "yak", "zebra", "beaver", "koala",
];

// =============================================================================
// Validation Helpers
// =============================================================================

/// Validates an image reference string before it is parsed.
#[must_use = "validation result must be checked"]
pub fn validate_image_reference(reference: &str) -> std::result::Result<(), &'static str> {
    if reference.is_empty() {
        return Err("image reference cannot be empty");
    }
    if reference.len() > MAX_IMAGE_REF_LEN {
        return Err("image reference exceeds maximum length");
    }
    if !reference.chars().all(|c| IMAGE_REF_VALID_CHARS.contains(c)) {
        return Err("image reference contains invalid characters");
    }
    Ok(())
}

/// Validates a user-supplied container name.
///
/// # Security
///
/// Names must start with an alphanumeric character so `.` and `..` are
/// never accepted.
#[inline]
#[must_use = "validation result must be checked"]
pub fn validate_container_name(name: &str) -> std::result::Result<(), &'static str> {
    if name.is_empty() {
        return Err("container name cannot be empty");
    }
    if name.len() > MAX_CONTAINER_NAME_LEN {
        return Err("container name exceeds maximum length");
    }
    if !name.starts_with(|c: char| c.is_ascii_alphanumeric()) {
        return Err("container name must start with a letter or digit");
    }
    if !name.chars().all(|c| CONTAINER_NAME_VALID_CHARS.contains(c)) {
        return Err("container name contains invalid characters");
    }
    Ok(())
}
