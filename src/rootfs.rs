//! Layer extraction into a container root filesystem.
//!
//! Layers are applied one after another, base layer first. A later layer
//! overwrites what earlier layers wrote and can delete it through whiteout
//! entries, so the result depends on the order the layer ids are given in.
//!
//! ## Security
//!
//! Every entry path must be relative and free of `..`. Before anything is
//! written, the deepest existing ancestor of the destination is resolved
//! and must still lie inside the rootfs; this stops an earlier symlink
//! entry from redirecting a later write outside the tree. Failing entries
//! abort the whole extraction with [`Error::PathTraversal`].
//!
//! Symlink targets are stored as-is: they are interpreted inside the
//! container, never followed during extraction. Hard links must point at a
//! path inside the rootfs and are created with the native link call.
//!
//! ## Whiteouts
//!
//! | Entry | Effect |
//! |-------|--------|
//! | `dir/.wh.name` | removes `dir/name` left by lower layers |
//! | `dir/.wh..wh..opq` | empties `dir` of lower-layer content |
//!
//! An opaque marker may come after entries of its own layer in the same
//! directory; those entries are kept. Whiteouts that name no entry (`.wh.`,
//! `.wh..`) are ignored.

use crate::constants::MAX_ROOTFS_SIZE;
use crate::error::{Error, Result};
use crate::storage::{LayerCache, digest_hex};
use flate2::read::GzDecoder;
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use tar::{Archive, EntryType};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const WHITEOUT_PREFIX: &str = ".wh.";
const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

/// Totals of one extraction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtractStats {
    pub layers: usize,
    pub entries: u64,
    pub bytes: u64,
}

/// Extracts cached layers over `rootfs` in the given order.
///
/// Blocking; run it on the blocking pool. `cancel` is checked between
/// layers and periodically between entries.
pub fn extract_layers(
    cache: &LayerCache,
    layer_ids: &[String],
    rootfs: &Path,
    cancel: &CancellationToken,
) -> Result<ExtractStats> {
    let root = fs::canonicalize(rootfs)?;
    let mut stats = ExtractStats::default();

    for id in layer_ids {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled("layer extraction".to_string()));
        }

        let archive = cache.layer_path(id);
        if !archive.is_file() {
            return Err(Error::LayerNotFound(digest_hex(id).to_string()));
        }

        debug!(layer = %digest_hex(id), "Extracting layer");
        extract_layer(&archive, id, &root, &mut stats, cancel)?;
        stats.layers += 1;
    }

    info!(
        layers = stats.layers,
        entries = stats.entries,
        bytes = stats.bytes,
        "Root filesystem extracted"
    );
    Ok(stats)
}

/// Applies one gzipped tar archive over an already-canonical `root`.
pub fn extract_layer(
    archive_path: &Path,
    layer_id: &str,
    root: &Path,
    stats: &mut ExtractStats,
    cancel: &CancellationToken,
) -> Result<()> {
    let failed = |reason: String| Error::Extraction {
        digest: digest_hex(layer_id).to_string(),
        reason,
    };

    let file = fs::File::open(archive_path)?;
    let mut archive = Archive::new(GzDecoder::new(io::BufReader::new(file)));
    archive.set_overwrite(true);
    archive.set_preserve_permissions(true);

    // Paths this layer has unpacked so far, with their ancestors.
    let mut written: HashSet<PathBuf> = HashSet::new();

    for entry in archive.entries().map_err(|e| failed(e.to_string()))? {
        let mut entry = entry.map_err(|e| failed(e.to_string()))?;
        stats.entries += 1;
        if stats.entries % 256 == 0 && cancel.is_cancelled() {
            return Err(Error::Cancelled("layer extraction".to_string()));
        }

        let raw_path = entry.path().map_err(|e| failed(e.to_string()))?.into_owned();
        let Some(relative) = sanitize_entry_path(&raw_path)? else {
            // "." or "./": the root itself
            continue;
        };
        let target = root.join(&relative);
        ensure_inside(root, &target)?;

        let file_name = relative.file_name().and_then(|n| n.to_str()).unwrap_or("");
        if file_name == OPAQUE_WHITEOUT {
            let dir = relative.parent().unwrap_or(Path::new(""));
            clear_lower_entries(&root.join(dir), dir, &written)?;
            continue;
        }
        if let Some(hidden) = file_name.strip_prefix(WHITEOUT_PREFIX) {
            if hidden.is_empty() || hidden == "." || hidden == ".." {
                warn!(path = %relative.display(), "Ignoring whiteout without a target name");
                continue;
            }
            remove_path(&target.with_file_name(hidden))?;
            continue;
        }

        let kind = entry.header().entry_type();
        match kind {
            EntryType::Char | EntryType::Block | EntryType::Fifo => {
                debug!(path = %relative.display(), "Skipping device node");
                continue;
            }
            EntryType::Link => {
                let link = entry
                    .link_name()
                    .map_err(|e| failed(e.to_string()))?
                    .ok_or_else(|| failed(format!("hard link {} has no target", relative.display())))?
                    .into_owned();
                let source = sanitize_entry_path(&link)?
                    .map(|p| root.join(p))
                    .ok_or_else(|| Error::PathTraversal {
                        path: link.display().to_string(),
                    })?;
                ensure_inside(root, &source)?;
                if fs::symlink_metadata(&source).is_err() {
                    return Err(failed(format!(
                        "hard link {} points at missing {}",
                        relative.display(),
                        link.display()
                    )));
                }
            }
            _ => {}
        }

        stats.bytes = stats.bytes.saturating_add(entry.size());
        if stats.bytes > MAX_ROOTFS_SIZE {
            return Err(Error::RootfsTooLarge {
                size: stats.bytes,
                limit: MAX_ROOTFS_SIZE,
            });
        }

        replace_mismatched(&target, kind == EntryType::Directory)?;

        let unpacked = entry.unpack_in(root).map_err(|e| failed(e.to_string()))?;
        if !unpacked {
            return Err(Error::PathTraversal {
                path: raw_path.display().to_string(),
            });
        }

        if kind == EntryType::Directory {
            keep_directory_writable(&target)?;
        }
        written.extend(relative.ancestors().filter(|p| !p.as_os_str().is_empty()).map(Path::to_path_buf));
    }

    Ok(())
}

/// Normalises an archive path to a relative path without `.` components.
///
/// Returns `None` for the archive root and rejects absolute paths and `..`.
pub fn sanitize_entry_path(path: &Path) -> Result<Option<PathBuf>> {
    let mut clean = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(Error::PathTraversal {
                    path: path.display().to_string(),
                });
            }
        }
    }
    Ok((!clean.as_os_str().is_empty()).then_some(clean))
}

/// Checks that writing `target` cannot land outside `root`.
///
/// The deepest ancestor that exists (symlinks included, dangling or not)
/// is resolved; it must resolve and stay under `root`.
fn ensure_inside(root: &Path, target: &Path) -> Result<()> {
    let escape = || Error::PathTraversal {
        path: target.display().to_string(),
    };

    let mut ancestor = target.parent();
    while let Some(dir) = ancestor {
        if !dir.starts_with(root) {
            return Err(escape());
        }
        match fs::symlink_metadata(dir) {
            Ok(_) => {
                let real = fs::canonicalize(dir).map_err(|_| escape())?;
                return if real.starts_with(root) { Ok(()) } else { Err(escape()) };
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => ancestor = dir.parent(),
            Err(e) => return Err(e.into()),
        }
    }
    Err(escape())
}

/// Removes a file, link or directory tree; absent paths are fine.
fn remove_path(path: &Path) -> Result<()> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    if meta.is_dir() {
        fs::remove_dir_all(path)?;
    } else {
        fs::remove_file(path)?;
    }
    Ok(())
}

/// Empties `dir` (at `rel` inside the rootfs) except for what the current
/// layer has already written below it.
fn clear_lower_entries(dir: &Path, rel: &Path, written: &HashSet<PathBuf>) -> Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let entry = entry?;
        let child = rel.join(entry.file_name());
        if !written.contains(&child) {
            remove_path(&entry.path())?;
        } else if entry.file_type()?.is_dir() {
            clear_lower_entries(&entry.path(), &child, written)?;
        }
    }
    Ok(())
}

/// A directory entry replaces a non-directory and vice versa. An existing
/// symlink is always removed so the new entry is never written through it.
fn replace_mismatched(target: &Path, want_dir: bool) -> Result<()> {
    match fs::symlink_metadata(target) {
        Ok(meta) if meta.file_type().is_symlink() => {
            fs::remove_file(target)?;
        }
        Ok(meta) if meta.is_dir() && !want_dir => {
            fs::remove_dir_all(target)?;
        }
        Ok(meta) if !meta.is_dir() && want_dir => {
            fs::remove_file(target)?;
        }
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

/// Later layers must still be able to write into directories that an
/// image ships read-only.
#[cfg(unix)]
fn keep_directory_writable(dir: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let meta = fs::symlink_metadata(dir)?;
    if !meta.is_dir() {
        return Ok(());
    }
    let mode = meta.permissions().mode();
    if mode & 0o700 != 0o700
        && let Err(e) = fs::set_permissions(dir, fs::Permissions::from_mode(mode | 0o700))
    {
        warn!(path = %dir.display(), error = %e, "Cannot make directory writable");
    }
    Ok(())
}

#[cfg(not(unix))]
fn keep_directory_writable(_dir: &Path) -> Result<()> {
    Ok(())
}
