//! Shared fixtures for integration tests.
//!
//! [`FakeRegistry`] implements [`RegistryApi`] in memory: images are
//! registered as raw manifest/config/layer bytes, every request is counted,
//! and individual blobs can be delayed or served corrupted.

#![allow(dead_code)]

use async_trait::async_trait;
use burrow::registry::{ProgressFn, RegistryApi, TagPage, parse_manifest};
use burrow::{Arch, Engine, EngineConfig, Error, LayerCache, Os, Platform, Result};
use flate2::Compression;
use flate2::write::GzEncoder;
use oci_distribution::manifest::OciManifest;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tar::{EntryType, Header};

/// URL the engine falls back to when no mirror is healthy.
pub const TEST_REGISTRY_URL: &str = "http://registry.test";

const MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";
const INDEX_MEDIA_TYPE: &str = "application/vnd.oci.image.index.v1+json";
const CONFIG_MEDIA_TYPE: &str = "application/vnd.oci.image.config.v1+json";
const LAYER_MEDIA_TYPE: &str = "application/vnd.oci.image.layer.v1.tar+gzip";

// =============================================================================
// Digests
// =============================================================================

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

pub fn digest_of(bytes: &[u8]) -> String {
    format!("sha256:{}", sha256_hex(bytes))
}

// =============================================================================
// Layer archives
// =============================================================================

/// Builds a gzipped tar layer.
pub struct LayerBuilder {
    builder: tar::Builder<Vec<u8>>,
}

impl Default for LayerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl LayerBuilder {
    pub fn new() -> Self {
        Self {
            builder: tar::Builder::new(Vec::new()),
        }
    }

    pub fn dir(mut self, path: &str) -> Self {
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Directory);
        header.set_mode(0o755);
        header.set_size(0);
        self.builder.append_data(&mut header, path, std::io::empty()).unwrap();
        self
    }

    pub fn file(mut self, path: &str, contents: &[u8]) -> Self {
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Regular);
        header.set_mode(0o644);
        header.set_size(contents.len() as u64);
        self.builder.append_data(&mut header, path, contents).unwrap();
        self
    }

    pub fn symlink(mut self, path: &str, target: &str) -> Self {
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Symlink);
        header.set_mode(0o777);
        header.set_size(0);
        header.set_link_name(target).unwrap();
        self.builder.append_data(&mut header, path, std::io::empty()).unwrap();
        self
    }

    pub fn hardlink(mut self, path: &str, target: &str) -> Self {
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Link);
        header.set_mode(0o644);
        header.set_size(0);
        header.set_link_name(target).unwrap();
        self.builder.append_data(&mut header, path, std::io::empty()).unwrap();
        self
    }

    /// Writes the entry name verbatim, bypassing the tar crate's own path
    /// checks, so hostile archives can be built.
    pub fn raw_file(mut self, name: &str, contents: &[u8]) -> Self {
        let mut header = Header::new_old();
        header.set_entry_type(EntryType::Regular);
        header.set_mode(0o644);
        header.set_size(contents.len() as u64);
        let bytes = name.as_bytes();
        header.as_old_mut().name[..bytes.len()].copy_from_slice(bytes);
        header.set_cksum();
        self.builder.append(&header, contents).unwrap();
        self
    }

    pub fn build(self) -> Vec<u8> {
        let tar = self.builder.into_inner().unwrap();
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&tar).unwrap();
        encoder.finish().unwrap()
    }
}

/// Puts layer bytes straight into a cache and returns the layer id.
pub fn store_layer(cache: &LayerCache, bytes: &[u8]) -> String {
    let id = sha256_hex(bytes);
    std::fs::write(cache.layer_path(&id), bytes).unwrap();
    id
}

// =============================================================================
// Fake registry
// =============================================================================

/// Digests of a registered image.
#[derive(Debug, Clone)]
pub struct TestImage {
    pub repository: String,
    pub tag: String,
    pub manifest_digest: String,
    pub config_digest: String,
    pub layer_digests: Vec<String>,
}

impl TestImage {
    /// Image id the engine derives: config digest without prefix.
    pub fn id(&self) -> String {
        self.config_digest.trim_start_matches("sha256:").to_string()
    }

    pub fn layer_ids(&self) -> Vec<String> {
        self.layer_digests
            .iter()
            .map(|d| d.trim_start_matches("sha256:").to_string())
            .collect()
    }
}

#[derive(Default)]
pub struct FakeRegistry {
    /// `repository:reference` to (content type, body).
    manifests: Mutex<HashMap<String, (String, Vec<u8>)>>,
    blobs: Mutex<HashMap<String, Vec<u8>>>,
    delays: Mutex<HashMap<String, Duration>>,
    corrupt: Mutex<HashSet<String>>,
    failing_probes: Mutex<HashSet<String>>,
    /// Blob digests in the order their downloads finished.
    completed: Mutex<Vec<String>>,
    /// Registry URLs that tag listings were sent to.
    tag_requests: Mutex<Vec<String>>,
    pub probes: AtomicUsize,
    pub manifest_requests: AtomicUsize,
    pub config_requests: AtomicUsize,
    pub blob_requests: AtomicUsize,
}

impl FakeRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Manifest, config and blob requests; probes are not counted.
    pub fn pull_requests(&self) -> usize {
        self.manifest_requests.load(Ordering::SeqCst)
            + self.config_requests.load(Ordering::SeqCst)
            + self.blob_requests.load(Ordering::SeqCst)
    }

    pub fn blob_downloads(&self, digest: &str) -> usize {
        self.completed
            .lock()
            .unwrap()
            .iter()
            .filter(|d| d.as_str() == digest)
            .count()
    }

    pub fn tag_requests(&self) -> Vec<String> {
        self.tag_requests.lock().unwrap().clone()
    }

    pub fn completion_order(&self) -> Vec<String> {
        self.completed.lock().unwrap().clone()
    }

    pub fn add_blob(&self, bytes: Vec<u8>) -> String {
        let digest = digest_of(&bytes);
        self.blobs.lock().unwrap().insert(digest.clone(), bytes);
        digest
    }

    pub fn delay_blob(&self, digest: &str, delay: Duration) {
        self.delays.lock().unwrap().insert(digest.to_string(), delay);
    }

    /// Serves `digest` with its first byte flipped.
    pub fn corrupt_blob(&self, digest: &str) {
        self.corrupt.lock().unwrap().insert(digest.to_string());
    }

    pub fn heal_blob(&self, digest: &str) {
        self.corrupt.lock().unwrap().remove(digest);
    }

    pub fn fail_probes(&self, url: &str, fail: bool) {
        let mut failing = self.failing_probes.lock().unwrap();
        if fail {
            failing.insert(url.to_string());
        } else {
            failing.remove(url);
        }
    }

    /// Registers an image manifest under `repository:tag` and its digest.
    pub fn add_image(
        &self,
        repository: &str,
        tag: &str,
        config: serde_json::Value,
        layers: Vec<Vec<u8>>,
    ) -> TestImage {
        self.add_image_for(repository, tag, "amd64", config, layers)
    }

    pub fn add_image_for(
        &self,
        repository: &str,
        tag: &str,
        architecture: &str,
        config: serde_json::Value,
        layers: Vec<Vec<u8>>,
    ) -> TestImage {
        let mut descriptors = Vec::new();
        let mut layer_digests = Vec::new();
        for layer in layers {
            let size = layer.len();
            let digest = self.add_blob(layer);
            descriptors.push(json!({
                "mediaType": LAYER_MEDIA_TYPE,
                "digest": digest,
                "size": size,
            }));
            layer_digests.push(digest);
        }

        // The layer list makes the config, and so the image id, unique per image.
        let config_blob = serde_json::to_vec(&json!({
            "architecture": architecture,
            "os": "linux",
            "config": config,
            "rootfs": {"type": "layers", "diff_ids": layer_digests},
        }))
        .unwrap();
        let config_size = config_blob.len();
        let config_digest = self.add_blob(config_blob);

        let manifest = serde_json::to_vec(&json!({
            "schemaVersion": 2,
            "mediaType": MANIFEST_MEDIA_TYPE,
            "config": {
                "mediaType": CONFIG_MEDIA_TYPE,
                "digest": config_digest,
                "size": config_size,
            },
            "layers": descriptors,
        }))
        .unwrap();
        let manifest_digest = digest_of(&manifest);

        let mut manifests = self.manifests.lock().unwrap();
        manifests.insert(
            format!("{repository}:{tag}"),
            (MANIFEST_MEDIA_TYPE.to_string(), manifest.clone()),
        );
        manifests.insert(
            format!("{repository}:{manifest_digest}"),
            (MANIFEST_MEDIA_TYPE.to_string(), manifest),
        );

        TestImage {
            repository: repository.to_string(),
            tag: tag.to_string(),
            manifest_digest,
            config_digest,
            layer_digests,
        }
    }

    /// Registers a manifest list under `repository:tag`.
    pub fn add_index(&self, repository: &str, tag: &str, entries: &[(&str, &TestImage)]) {
        let manifests: Vec<serde_json::Value> = entries
            .iter()
            .map(|(architecture, image)| {
                json!({
                    "mediaType": MANIFEST_MEDIA_TYPE,
                    "digest": image.manifest_digest,
                    "size": 512,
                    "platform": {"architecture": architecture, "os": "linux"},
                })
            })
            .collect();
        let index = serde_json::to_vec(&json!({
            "schemaVersion": 2,
            "mediaType": INDEX_MEDIA_TYPE,
            "manifests": manifests,
        }))
        .unwrap();

        self.manifests
            .lock()
            .unwrap()
            .insert(format!("{repository}:{tag}"), (INDEX_MEDIA_TYPE.to_string(), index));
    }

    fn blob(&self, url: &str, digest: &str) -> Result<Vec<u8>> {
        let mut bytes = self
            .blobs
            .lock()
            .unwrap()
            .get(digest)
            .cloned()
            .ok_or_else(|| Error::Registry {
                url: url.to_string(),
                status: 404,
                message: format!("blob {digest} unknown"),
            })?;
        if self.corrupt.lock().unwrap().contains(digest)
            && let Some(first) = bytes.first_mut()
        {
            *first ^= 0xff;
        }
        Ok(bytes)
    }
}

#[async_trait]
impl RegistryApi for FakeRegistry {
    async fn probe(&self, registry_url: &str) -> Result<()> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        if self.failing_probes.lock().unwrap().contains(registry_url) {
            return Err(Error::Registry {
                url: registry_url.to_string(),
                status: 503,
                message: "unavailable".to_string(),
            });
        }
        Ok(())
    }

    async fn fetch_manifest(&self, registry_url: &str, repository: &str, reference: &str) -> Result<OciManifest> {
        self.manifest_requests.fetch_add(1, Ordering::SeqCst);
        let key = format!("{repository}:{reference}");
        let found = self.manifests.lock().unwrap().get(&key).cloned();
        let (content_type, body) = found.ok_or_else(|| Error::Registry {
            url: registry_url.to_string(),
            status: 404,
            message: format!("manifest {key} unknown"),
        })?;
        parse_manifest(&key, Some(&content_type), &body)
    }

    async fn fetch_config(&self, registry_url: &str, _repository: &str, digest: &str) -> Result<Vec<u8>> {
        self.config_requests.fetch_add(1, Ordering::SeqCst);
        self.blob(registry_url, digest)
    }

    async fn download_blob(
        &self,
        registry_url: &str,
        _repository: &str,
        digest: &str,
        dest: &Path,
        progress: ProgressFn<'_>,
    ) -> Result<u64> {
        self.blob_requests.fetch_add(1, Ordering::SeqCst);
        let delay = self.delays.lock().unwrap().get(digest).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let bytes = self.blob(registry_url, digest)?;
        let half = bytes.len() / 2;
        progress(half as u64);
        tokio::fs::write(dest, &bytes).await?;
        progress(bytes.len() as u64);

        self.completed.lock().unwrap().push(digest.to_string());
        Ok(bytes.len() as u64)
    }

    async fn list_tags(&self, registry_url: &str, repository: &str, page_size: u32, last: Option<&str>) -> Result<TagPage> {
        self.tag_requests.lock().unwrap().push(registry_url.to_string());
        let prefix = format!("{repository}:");
        let mut tags: Vec<String> = self
            .manifests
            .lock()
            .unwrap()
            .keys()
            .filter_map(|key| key.strip_prefix(&prefix))
            .filter(|tag| !tag.starts_with("sha256:"))
            .map(str::to_string)
            .collect();
        if tags.is_empty() {
            return Err(Error::Registry {
                url: registry_url.to_string(),
                status: 404,
                message: format!("repository {repository} unknown"),
            });
        }
        tags.sort();

        let page: Vec<String> = tags
            .into_iter()
            .filter(|tag| last.is_none_or(|last| tag.as_str() > last))
            .take(page_size as usize)
            .collect();
        Ok(TagPage::new(page, page_size))
    }
}

// =============================================================================
// Engine
// =============================================================================

/// Config for an isolated engine: no built-in mirrors, fixed platform.
pub fn test_config(root: &Path) -> EngineConfig {
    let mut config = EngineConfig::with_root(root);
    config.builtin_registries = false;
    config.default_registry = TEST_REGISTRY_URL.to_string();
    config.health_check_interval = Duration::from_secs(3600);
    config.probe_timeout = Duration::from_secs(5);
    config.pull_timeout = Duration::from_secs(30);
    config.platform = Platform::new(Os::Linux, Arch::Amd64);
    config
}

pub fn open_engine(registry: &Arc<FakeRegistry>, root: &Path) -> Engine {
    Engine::open_with_client(test_config(root), Arc::clone(registry) as Arc<dyn RegistryApi>).unwrap()
}

/// Two small layers that both write `etc/motd`.
pub fn alpine_layers() -> (Vec<u8>, Vec<u8>) {
    let base = LayerBuilder::new()
        .dir("bin")
        .file("bin/busybox", b"#!busybox")
        .dir("etc")
        .file("etc/motd", b"base layer\n")
        .build();
    let top = LayerBuilder::new()
        .dir("etc")
        .file("etc/motd", b"top layer\n")
        .file("etc/os-release", b"ID=alpine\n")
        .build();
    (base, top)
}

pub fn alpine_config() -> serde_json::Value {
    json!({
        "Cmd": ["/bin/ash", "-l"],
        "Env": ["PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin", "LANG=C.UTF-8"],
        "WorkingDir": "/home/app",
        "User": "app",
    })
}

/// Registers `library/alpine:latest` with [`alpine_layers`].
pub fn add_alpine(registry: &FakeRegistry) -> TestImage {
    let (base, top) = alpine_layers();
    registry.add_image("library/alpine", "latest", alpine_config(), vec![base, top])
}
