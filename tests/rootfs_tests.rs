//! Tests for layer extraction.
//!
//! Validates overlay ordering, whiteouts, links, and path traversal
//! protection when building a container root filesystem.

mod common;

use burrow::rootfs::extract_layers;
use burrow::{Error, ErrorKind, LayerCache};
use common::{LayerBuilder, store_layer};
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

struct Fixture {
    _temp_dir: TempDir,
    cache: LayerCache,
    rootfs: PathBuf,
}

fn fixture() -> Fixture {
    let temp_dir = TempDir::new().unwrap();
    let cache = LayerCache::with_path(temp_dir.path().join("layers")).unwrap();
    let rootfs = temp_dir.path().join("rootfs");
    fs::create_dir(&rootfs).unwrap();
    Fixture {
        _temp_dir: temp_dir,
        cache,
        rootfs,
    }
}

fn extract(fx: &Fixture, layers: &[String]) -> burrow::Result<burrow::rootfs::ExtractStats> {
    extract_layers(&fx.cache, layers, &fx.rootfs, &CancellationToken::new())
}

// =============================================================================
// Ordering
// =============================================================================

#[test]
fn test_extraction_order_matters() {
    let lower = LayerBuilder::new().dir("etc").file("etc/version", b"1").build();
    let upper = LayerBuilder::new().dir("etc").file("etc/version", b"2").build();

    let forward = fixture();
    let ids = vec![store_layer(&forward.cache, &lower), store_layer(&forward.cache, &upper)];
    extract(&forward, &ids).unwrap();
    assert_eq!(fs::read(forward.rootfs.join("etc/version")).unwrap(), b"2");

    let reverse = fixture();
    let mut reversed = vec![store_layer(&reverse.cache, &lower), store_layer(&reverse.cache, &upper)];
    reversed.reverse();
    extract(&reverse, &reversed).unwrap();
    assert_eq!(
        fs::read(reverse.rootfs.join("etc/version")).unwrap(),
        b"1",
        "reverse order yields a different tree"
    );
}

#[test]
fn test_stats_count_layers_and_bytes() {
    let fx = fixture();
    let layer = LayerBuilder::new().file("a", b"12345").file("b", b"678").build();
    let id = store_layer(&fx.cache, &layer);

    let stats = extract(&fx, &[id]).unwrap();
    assert_eq!(stats.layers, 1);
    assert_eq!(stats.entries, 2);
    assert_eq!(stats.bytes, 8);
}

// =============================================================================
// Whiteouts
// =============================================================================

#[test]
fn test_whiteout_removes_lower_file() {
    let fx = fixture();
    let lower = LayerBuilder::new()
        .dir("etc")
        .file("etc/keep", b"k")
        .file("etc/drop", b"d")
        .build();
    let upper = LayerBuilder::new().dir("etc").file("etc/.wh.drop", b"").build();
    let ids = vec![store_layer(&fx.cache, &lower), store_layer(&fx.cache, &upper)];

    extract(&fx, &ids).unwrap();

    assert!(fx.rootfs.join("etc/keep").exists());
    assert!(!fx.rootfs.join("etc/drop").exists());
    assert!(!fx.rootfs.join("etc/.wh.drop").exists(), "whiteout marker is not materialised");
}

#[test]
fn test_opaque_whiteout_clears_directory() {
    let fx = fixture();
    let lower = LayerBuilder::new()
        .dir("var")
        .dir("var/cache")
        .file("var/cache/old", b"o")
        .build();
    let upper = LayerBuilder::new()
        .dir("var/cache")
        .file("var/cache/.wh..wh..opq", b"")
        .file("var/cache/new", b"n")
        .build();
    let ids = vec![store_layer(&fx.cache, &lower), store_layer(&fx.cache, &upper)];

    extract(&fx, &ids).unwrap();

    assert!(!fx.rootfs.join("var/cache/old").exists());
    assert!(fx.rootfs.join("var/cache/new").exists());
}

#[test]
fn test_opaque_whiteout_keeps_entries_of_its_own_layer() {
    let fx = fixture();
    let lower = LayerBuilder::new()
        .dir("var")
        .dir("var/cache")
        .file("var/cache/old", b"o")
        .dir("var/cache/sub")
        .file("var/cache/sub/lower", b"l")
        .build();
    // The marker comes after entries this layer already wrote
    let upper = LayerBuilder::new()
        .file("var/cache/new", b"n")
        .file("var/cache/sub/mine", b"m")
        .file("var/cache/.wh..wh..opq", b"")
        .file("var/cache/after", b"a")
        .build();
    let ids = vec![store_layer(&fx.cache, &lower), store_layer(&fx.cache, &upper)];

    extract(&fx, &ids).unwrap();

    let cache = fx.rootfs.join("var/cache");
    assert!(!cache.join("old").exists(), "lower file hidden");
    assert!(!cache.join("sub/lower").exists(), "lower file in a kept directory hidden");
    assert!(cache.join("new").exists(), "earlier entry of the same layer kept");
    assert!(cache.join("sub/mine").exists());
    assert!(cache.join("after").exists());
}

#[test]
fn test_whiteout_without_name_is_ignored() {
    let fx = fixture();
    let lower = LayerBuilder::new()
        .dir("etc")
        .file("etc/hostname", b"box")
        .file("motd", b"hi")
        .build();
    let upper = LayerBuilder::new()
        .file(".wh.", b"")
        .file("etc/.wh.", b"")
        .file("etc/.wh..", b"")
        .build();
    let ids = vec![store_layer(&fx.cache, &lower), store_layer(&fx.cache, &upper)];

    extract(&fx, &ids).unwrap();

    assert!(fx.rootfs.is_dir(), "rootfs itself must survive");
    assert!(fx.rootfs.join("motd").exists());
    assert!(fx.rootfs.join("etc/hostname").exists());
}

// =============================================================================
// Links
// =============================================================================

#[cfg(unix)]
#[test]
fn test_symlinks_are_stored_verbatim() {
    let fx = fixture();
    let layer = LayerBuilder::new()
        .dir("bin")
        .file("bin/busybox", b"bb")
        .symlink("bin/sh", "busybox")
        .symlink("etc-host", "/etc")
        .build();
    let id = store_layer(&fx.cache, &layer);

    extract(&fx, &[id]).unwrap();

    assert_eq!(fs::read_link(fx.rootfs.join("bin/sh")).unwrap(), PathBuf::from("busybox"));
    assert_eq!(fs::read_link(fx.rootfs.join("etc-host")).unwrap(), PathBuf::from("/etc"));
}

#[cfg(unix)]
#[test]
fn test_hardlink_shares_inode() {
    use std::os::unix::fs::MetadataExt;

    let fx = fixture();
    let layer = LayerBuilder::new()
        .dir("usr")
        .file("usr/original", b"data")
        .hardlink("usr/linked", "usr/original")
        .build();
    let id = store_layer(&fx.cache, &layer);

    extract(&fx, &[id]).unwrap();

    let a = fs::metadata(fx.rootfs.join("usr/original")).unwrap();
    let b = fs::metadata(fx.rootfs.join("usr/linked")).unwrap();
    assert_eq!(a.ino(), b.ino(), "hard link must point at the same inode");
}

#[cfg(unix)]
#[test]
fn test_later_file_replaces_symlink_instead_of_following_it() {
    let fx = fixture();
    let outside = TempDir::new().unwrap();
    let victim = outside.path().join("victim");
    fs::write(&victim, b"untouched").unwrap();

    let lower = LayerBuilder::new()
        .symlink("config", victim.to_str().unwrap())
        .build();
    let upper = LayerBuilder::new().file("config", b"overwritten").build();
    let ids = vec![store_layer(&fx.cache, &lower), store_layer(&fx.cache, &upper)];

    extract(&fx, &ids).unwrap();

    assert_eq!(fs::read(&victim).unwrap(), b"untouched");
    assert_eq!(fs::read(fx.rootfs.join("config")).unwrap(), b"overwritten");
}

// =============================================================================
// Path Traversal Protection
// =============================================================================

#[test]
fn test_parent_dir_entry_rejected() {
    let fx = fixture();
    let layer = LayerBuilder::new().raw_file("../escape", b"x").build();
    let id = store_layer(&fx.cache, &layer);

    let err = extract(&fx, &[id]).unwrap_err();
    assert!(matches!(err, Error::PathTraversal { .. }), "unexpected error: {err}");
    assert!(!fx.rootfs.parent().unwrap().join("escape").exists());
}

#[test]
fn test_absolute_entry_rejected() {
    let fx = fixture();
    let layer = LayerBuilder::new().raw_file("/tmp/burrow-absolute", b"x").build();
    let id = store_layer(&fx.cache, &layer);

    let err = extract(&fx, &[id]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Filesystem);
}

#[cfg(unix)]
#[test]
fn test_write_through_symlinked_dir_rejected() {
    let fx = fixture();
    let outside = TempDir::new().unwrap();

    let lower = LayerBuilder::new()
        .symlink("escape", outside.path().to_str().unwrap())
        .build();
    let upper = LayerBuilder::new().file("escape/pwned", b"x").build();
    let ids = vec![store_layer(&fx.cache, &lower), store_layer(&fx.cache, &upper)];

    let err = extract(&fx, &ids).unwrap_err();
    assert!(matches!(err, Error::PathTraversal { .. }), "unexpected error: {err}");
    assert!(!outside.path().join("pwned").exists());
}

#[test]
fn test_hardlink_outside_rootfs_rejected() {
    let fx = fixture();
    let layer = LayerBuilder::new().hardlink("passwd", "../../etc/passwd").build();
    let id = store_layer(&fx.cache, &layer);

    let err = extract(&fx, &[id]).unwrap_err();
    assert!(matches!(err, Error::PathTraversal { .. }), "unexpected error: {err}");
}

// =============================================================================
// Errors
// =============================================================================

#[test]
fn test_missing_layer_is_not_found() {
    let fx = fixture();
    let err = extract(&fx, &["0".repeat(64)]).unwrap_err();
    assert!(matches!(err, Error::LayerNotFound(_)));
}

#[test]
fn test_cancelled_before_start() {
    let fx = fixture();
    let id = store_layer(&fx.cache, &LayerBuilder::new().file("a", b"a").build());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = extract_layers(&fx.cache, &[id], &fx.rootfs, &cancel).unwrap_err();
    assert!(err.is_cancelled());
}

#[test]
fn test_garbage_archive_fails() {
    let fx = fixture();
    let bytes = b"definitely not gzip".to_vec();
    let id = store_layer(&fx.cache, &bytes);

    let err = extract(&fx, &[id]).unwrap_err();
    assert!(matches!(err, Error::Extraction { .. }), "unexpected error: {err}");
}
