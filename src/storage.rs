//! # Layer Cache and Container Directories
//!
//! On-disk half of the blob & metadata store. The relational half lives in
//! [`crate::store`].
//!
//! ## Storage Model
//!
//! ```text
//! <root>/
//! ├── layers/
//! │   ├── 3f4e...a1.tar.gz     (one file per unique layer, named by sha256 hex)
//! │   └── 9b2c...07.tar.gz
//! └── containers/
//!     ├── 0192f0c4-...         (extracted rootfs of one container)
//!     └── 0192f0c5-...
//! ```
//!
//! Layer files are content addressed: the file name is the sha256 of the
//! compressed bytes, so identical layers across images share one file.
//!
//! ## Security Model
//!
//! ### Digest Verification
//!
//! A layer is only ever placed at its final path by [`LayerCache::commit`],
//! which hashes the downloaded temp file and refuses to rename it when the
//! hash differs from the id. [`LayerCache::verify`] re-checks size and hash
//! before a cached file is trusted again, so a truncated or corrupted cache
//! entry is detected and re-downloaded.
//!
//! ### Path Traversal Protection
//!
//! Layer ids and container ids are sanitised before they become path
//! components; invalid ids return paths that won't exist.
//!
//! ### Atomic Writes
//!
//! Downloads stream into `<hex>.tar.gz.tmp.<uuid>` and are renamed into
//! place after verification. Concurrent writers use distinct temp names and
//! the final rename is atomic.

use crate::constants::LAYER_FILE_SUFFIX;
use crate::error::{Error, Result};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Strips an optional `sha256:` prefix from a digest.
pub fn digest_hex(digest: &str) -> &str {
    digest.strip_prefix("sha256:").unwrap_or(digest)
}

/// Computes the sha256 hex of a file by streaming it.
pub fn hash_file(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

/// Content-addressed cache of compressed layer archives.
///
/// ## Thread Safety
///
/// Each operation is independent. Writers of the same layer are serialised
/// by the pull pipeline's per-digest lock; even without it, atomic renames
/// of identical content keep the cache consistent.
#[derive(Debug, Clone)]
pub struct LayerCache {
    /// Directory holding `<hex>.tar.gz` files.
    base_dir: PathBuf,
}

impl LayerCache {
    /// Creates a layer cache at the specified path.
    pub fn with_path(base_dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&base_dir).map_err(|e| Error::StorageInit {
            path: base_dir.clone(),
            reason: e.to_string(),
        })?;

        info!("Layer cache initialized at: {}", base_dir.display());

        Ok(Self { base_dir })
    }

    /// Returns the base directory.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Path of the cached archive for a layer id (hex, prefix optional).
    ///
    /// # Security
    ///
    /// Only hexadecimal characters survive into the file name.
    pub fn layer_path(&self, id: &str) -> PathBuf {
        let hash = digest_hex(id);
        let safe_hash: String = hash.chars().filter(|c| c.is_ascii_hexdigit()).collect();

        if safe_hash.len() != hash.len() {
            warn!(
                "Layer id contained non-hex characters, sanitized: {} -> {}",
                hash, safe_hash
            );
        }

        if safe_hash.is_empty() {
            return self.base_dir.join("invalid").join("empty");
        }

        self.base_dir.join(format!("{safe_hash}{LAYER_FILE_SUFFIX}"))
    }

    /// Fresh temp path a download of `id` can stream into.
    pub fn temp_path(&self, id: &str) -> PathBuf {
        let path = self.layer_path(id);
        let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        name.push(format!(".tmp.{}", uuid::Uuid::now_v7()));
        path.with_file_name(name)
    }

    /// Checks if a cached file exists, without verifying it.
    pub fn has_layer(&self, id: &str) -> bool {
        self.layer_path(id).is_file()
    }

    /// Returns true only if the cached file exists, has `expected_size`
    /// bytes and hashes to `id`.
    pub fn verify(&self, id: &str, expected_size: u64) -> Result<bool> {
        let path = self.layer_path(id);
        let meta = match fs::metadata(&path) {
            Ok(meta) if meta.is_file() => meta,
            Ok(_) => return Ok(false),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };

        if meta.len() != expected_size {
            warn!(
                layer = %digest_hex(id),
                expected = expected_size,
                actual = meta.len(),
                "cached layer has wrong size"
            );
            return Ok(false);
        }

        let computed = hash_file(&path)?;
        if computed != digest_hex(id) {
            warn!(layer = %digest_hex(id), %computed, "cached layer hash mismatch");
            return Ok(false);
        }

        Ok(true)
    }

    /// Verifies a downloaded temp file and moves it to the layer's path.
    ///
    /// # Security
    ///
    /// The temp file is deleted on mismatch; the final path is never
    /// written with unverified content.
    pub fn commit(&self, id: &str, temp_path: &Path) -> Result<u64> {
        let expected = digest_hex(id);
        let computed = match hash_file(temp_path) {
            Ok(hash) => hash,
            Err(e) => {
                let _ = fs::remove_file(temp_path);
                return Err(e);
            }
        };

        if computed != expected {
            let _ = fs::remove_file(temp_path);
            return Err(Error::DigestMismatch {
                digest: format!("sha256:{expected}"),
                computed: format!("sha256:{computed}"),
            });
        }

        let path = self.layer_path(id);
        fs::rename(temp_path, &path).inspect_err(|_| {
            let _ = fs::remove_file(temp_path);
        })?;

        let size = fs::metadata(&path)?.len();
        debug!("Stored layer {} ({} bytes, verified)", expected, size);
        Ok(size)
    }

    /// Removes a cached layer file; missing files are not an error.
    pub fn remove_layer(&self, id: &str) -> Result<()> {
        let path = self.layer_path(id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Lists the ids (sha256 hex) of all cached layers.
    pub fn list_layers(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.base_dir)? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str()
                && let Some(id) = name.strip_suffix(LAYER_FILE_SUFFIX)
            {
                ids.push(id.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Returns the total size of all cached files.
    pub fn total_size(&self) -> Result<u64> {
        let mut total = 0u64;
        for entry in fs::read_dir(&self.base_dir)? {
            let meta = entry?.metadata()?;
            if meta.is_file() {
                total += meta.len();
            }
        }
        Ok(total)
    }

    /// Deletes cached layers not in `keep` and any leftover temp files.
    ///
    /// **Warning**: not safe during concurrent pulls; a layer downloaded but
    /// not yet committed to the store would be removed.
    pub fn prune(&self, keep: &HashSet<String>) -> Result<GcStats> {
        let mut removed = 0u64;
        let mut freed = 0u64;

        for entry in fs::read_dir(&self.base_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };

            let orphan = match name.strip_suffix(LAYER_FILE_SUFFIX) {
                Some(id) => !keep.contains(id),
                None => name.contains(".tmp."),
            };

            if orphan && let Ok(meta) = entry.metadata() {
                freed += meta.len();
                removed += 1;
                let _ = fs::remove_file(entry.path());
            }
        }

        info!("Prune: removed {} files, freed {} bytes", removed, freed);
        Ok(GcStats {
            removed_count: removed,
            freed_bytes: freed,
        })
    }
}

/// Statistics from a cache prune.
#[derive(Debug, Clone, Default)]
pub struct GcStats {
    /// Number of files removed.
    pub removed_count: u64,
    /// Bytes freed.
    pub freed_bytes: u64,
}

/// The `containers/` directory, one rootfs per container id.
#[derive(Debug, Clone)]
pub struct ContainerDirs {
    base_dir: PathBuf,
}

impl ContainerDirs {
    pub fn with_path(base_dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&base_dir).map_err(|e| Error::StorageInit {
            path: base_dir.clone(),
            reason: e.to_string(),
        })?;
        Ok(Self { base_dir })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Root filesystem directory of a container.
    pub fn rootfs_path(&self, id: &str) -> PathBuf {
        let safe_id: String = id
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
            .collect();
        if safe_id.is_empty() {
            return self.base_dir.join("invalid").join("empty");
        }
        self.base_dir.join(safe_id)
    }

    /// Creates an empty rootfs directory; fails if one already exists.
    pub fn create_rootfs(&self, id: &str) -> Result<PathBuf> {
        let path = self.rootfs_path(id);
        fs::create_dir(&path)?;
        Ok(path)
    }

    /// Deletes a rootfs directory and everything under it.
    pub fn remove_rootfs(&self, id: &str) -> Result<()> {
        let path = self.rootfs_path(id);
        match fs::remove_dir_all(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn has_rootfs(&self, id: &str) -> bool {
        self.rootfs_path(id).is_dir()
    }
}
