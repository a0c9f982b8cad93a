//! # Image Download Pipeline
//!
//! Turns an image reference into a committed [`ImageRecord`] whose layers
//! are all present and verified in the [`LayerCache`].
//!
//! ## Pipeline
//!
//! ```text
//! reference ──► (IfMissing: already tagged, layers intact?) ──yes──► Done
//!     │
//!     ▼
//! best_url_for(registry) ──► manifest ──► [index? pick platform, refetch]
//!     │
//!     ▼
//! config digest known, layers intact? ──yes──► Done
//!     │
//!     ▼
//! config blob (sha256 checked) ──► layers in parallel ──► commit_image
//! ```
//!
//! ## Progress
//!
//! Every pull exposes an ordered list of named steps, each a `watch`
//! channel carrying a fraction in `[0, 1]`. Steps are registered in a fixed
//! order: `"manifest"`, `"config"`, then one step per layer id in manifest
//! order. Layer steps are registered before any download starts, so the
//! step order never depends on which download finishes first.
//!
//! ## Layer Integrity
//!
//! | Situation | Action |
//! |-----------|--------|
//! | cached file with right size and hash | reused, no network |
//! | committed image with a damaged layer | layer fetched again, image re-committed |
//! | cached file missing, short or corrupt | downloaded again |
//! | downloaded bytes hash to another digest | pull fails, temp file deleted |
//!
//! Two pulls that need the same layer at the same time share one download:
//! a per-layer async lock serialises them and the second one finds the
//! verified file when it gets the lock.
//!
//! A layer is pinned from the moment a pull takes its lock until that pull
//! has committed its image or failed. Deleting another image that used the
//! layer drops its row but leaves a pinned file alone, and the pull's
//! commit writes the row back ([`ImagePuller::discard_layers`]).
//!
//! ## Cancellation
//!
//! [`PullHandle::cancel`] stops the pipeline and every in-flight layer
//! download. Nothing is committed for a cancelled pull; layers that already
//! finished stay in the cache for the next attempt.

use crate::config::EngineConfig;
use crate::constants::MAX_LAYER_SIZE;
use crate::error::{Error, Result};
use crate::platform::Platform;
use crate::reference::ImageReference;
use crate::registry::manifest::{ConfigBlob, manifest_media_type, select_platform_entry};
use crate::registry::{RegistryApi, RegistryManager};
use crate::storage::{LayerCache, digest_hex};
use crate::store::{ImageRecord, LayerRecord, MetadataStore};
use chrono::Utc;
use oci_distribution::manifest::{OciDescriptor, OciImageManifest, OciManifest};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{Semaphore, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

/// Progress step name for the manifest fetch.
pub const MANIFEST_STEP: &str = "manifest";

/// Progress step name for the config fetch.
pub const CONFIG_STEP: &str = "config";

// =============================================================================
// Public state types
// =============================================================================

/// Whether a pull may be answered from the local store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PullPolicy {
    /// Skip the network when the tag is already present with all layers
    /// cached.
    #[default]
    IfMissing,
    /// Always resolve the manifest against the registry.
    Always,
}

/// Lifecycle of one pull.
#[derive(Debug, Clone)]
pub enum PullState {
    Downloading { reference: ImageReference },
    Done { reference: ImageReference, image_id: String },
    Error { reference: ImageReference, error: Arc<Error> },
}

impl PullState {
    pub fn reference(&self) -> &ImageReference {
        match self {
            PullState::Downloading { reference }
            | PullState::Done { reference, .. }
            | PullState::Error { reference, .. } => reference,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, PullState::Downloading { .. })
    }
}

/// One named progress step.
#[derive(Debug)]
struct ProgressStep {
    name: String,
    fraction: Arc<watch::Sender<f64>>,
}

/// Writer side of a single step.
#[derive(Clone)]
pub struct StepHandle {
    fraction: Arc<watch::Sender<f64>>,
}

impl StepHandle {
    /// Publishes a fraction, clamped to `[0, 1]`.
    pub fn set(&self, fraction: f64) {
        let fraction = if fraction.is_nan() { 0.0 } else { fraction.clamp(0.0, 1.0) };
        self.fraction.send_replace(fraction);
    }

    pub fn complete(&self) {
        self.set(1.0);
    }
}

/// Ordered, named progress steps of a pull.
#[derive(Debug)]
pub struct PullProgress {
    steps: Mutex<Vec<ProgressStep>>,
    /// Bumped every time a step is registered.
    registered: watch::Sender<usize>,
}

impl Default for PullProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl PullProgress {
    pub fn new() -> Self {
        let (registered, _) = watch::channel(0);
        Self {
            steps: Mutex::new(Vec::new()),
            registered,
        }
    }

    fn steps(&self) -> std::sync::MutexGuard<'_, Vec<ProgressStep>> {
        self.steps.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Adds a step at 0.0, or returns the existing one with that name.
    pub fn register(&self, name: &str) -> StepHandle {
        let mut steps = self.steps();
        if let Some(step) = steps.iter().find(|s| s.name == name) {
            return StepHandle {
                fraction: Arc::clone(&step.fraction),
            };
        }

        let (tx, _) = watch::channel(0.0);
        let fraction = Arc::new(tx);
        steps.push(ProgressStep {
            name: name.to_string(),
            fraction: Arc::clone(&fraction),
        });
        let count = steps.len();
        drop(steps);

        self.registered.send_replace(count);
        StepHandle { fraction }
    }

    /// Step names in registration order.
    pub fn step_names(&self) -> Vec<String> {
        self.steps().iter().map(|s| s.name.clone()).collect()
    }

    /// Every step with its current fraction.
    pub fn snapshot(&self) -> Vec<(String, f64)> {
        self.steps()
            .iter()
            .map(|s| (s.name.clone(), *s.fraction.borrow()))
            .collect()
    }

    pub fn fraction(&self, name: &str) -> Option<f64> {
        self.steps()
            .iter()
            .find(|s| s.name == name)
            .map(|s| *s.fraction.borrow())
    }

    /// Watches one step's fraction.
    pub fn subscribe(&self, name: &str) -> Option<watch::Receiver<f64>> {
        self.steps()
            .iter()
            .find(|s| s.name == name)
            .map(|s| s.fraction.subscribe())
    }

    /// Watches the number of registered steps.
    pub fn watch_steps(&self) -> watch::Receiver<usize> {
        self.registered.subscribe()
    }
}

/// Caller's view of a running pull.
#[derive(Debug)]
pub struct PullHandle {
    reference: ImageReference,
    state: watch::Receiver<PullState>,
    progress: Arc<PullProgress>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl PullHandle {
    pub fn reference(&self) -> &ImageReference {
        &self.reference
    }

    /// Current state.
    pub fn state(&self) -> PullState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PullState> {
        self.state.clone()
    }

    pub fn progress(&self) -> &Arc<PullProgress> {
        &self.progress
    }

    /// Requests cancellation; the state becomes `Error(Cancelled)`.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Waits for a terminal state and returns the image id.
    pub async fn wait(&self) -> Result<String> {
        let mut rx = self.state.clone();
        let state = rx
            .wait_for(PullState::is_terminal)
            .await
            .map_err(|_| Error::Internal("pull task ended without a result".to_string()))?
            .clone();

        match state {
            PullState::Done { image_id, .. } => Ok(image_id),
            PullState::Error { error, .. } => Err(Error::Shared(error)),
            PullState::Downloading { .. } => Err(Error::Internal("pull still running".to_string())),
        }
    }
}

// =============================================================================
// Single-flight layer locks
// =============================================================================

/// One async lock per layer id that is being fetched, plus the layers that
/// running pulls have verified but not committed yet.
#[derive(Default)]
struct LayerLocks {
    locks: Mutex<HashMap<String, Weak<tokio::sync::Mutex<()>>>>,
    pins: Mutex<HashMap<String, usize>>,
}

/// Keeps a layer's cache file from being discarded until dropped.
struct LayerPin {
    locks: Arc<LayerLocks>,
    id: String,
}

impl Drop for LayerPin {
    fn drop(&mut self) {
        let mut pins = self.locks.pins();
        if let Some(count) = pins.get_mut(&self.id) {
            *count -= 1;
            if *count == 0 {
                pins.remove(&self.id);
            }
        }
    }
}

impl LayerLocks {
    fn pins(&self) -> std::sync::MutexGuard<'_, HashMap<String, usize>> {
        self.pins.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn pin(self: &Arc<Self>, id: &str) -> LayerPin {
        *self.pins().entry(id.to_string()).or_insert(0) += 1;
        LayerPin {
            locks: Arc::clone(self),
            id: id.to_string(),
        }
    }

    fn lock_for(&self, id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(existing) = locks.get(id).and_then(Weak::upgrade) {
            return existing;
        }
        locks.retain(|_, weak| weak.strong_count() > 0);
        let lock = Arc::new(tokio::sync::Mutex::new(()));
        locks.insert(id.to_string(), Arc::downgrade(&lock));
        lock
    }
}

// =============================================================================
// Puller
// =============================================================================

/// Starts pulls and owns what they share.
#[derive(Clone)]
pub struct ImagePuller {
    client: Arc<dyn RegistryApi>,
    registries: Arc<RegistryManager>,
    store: Arc<MetadataStore>,
    cache: LayerCache,
    platform: Platform,
    max_concurrent_downloads: usize,
    pull_timeout: Duration,
    layer_locks: Arc<LayerLocks>,
    /// Pulls that have not reached a terminal state.
    active: Arc<AtomicUsize>,
    /// Parent of every pull's token.
    cancel: CancellationToken,
}

/// Decrements the active-pull count when a pull task ends.
struct ActivePull(Arc<AtomicUsize>);

impl ActivePull {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for ActivePull {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Everything one pull needs once the manifest is resolved.
struct ResolvedImage {
    registry_url: String,
    manifest: OciImageManifest,
    os: String,
    architecture: String,
}

impl ImagePuller {
    pub fn new(
        client: Arc<dyn RegistryApi>,
        registries: Arc<RegistryManager>,
        store: Arc<MetadataStore>,
        cache: LayerCache,
        config: &EngineConfig,
        parent: &CancellationToken,
    ) -> Self {
        Self {
            client,
            registries,
            store,
            cache,
            platform: config.platform,
            max_concurrent_downloads: config.max_concurrent_downloads.max(1),
            pull_timeout: config.pull_timeout,
            layer_locks: Arc::new(LayerLocks::default()),
            active: Arc::new(AtomicUsize::new(0)),
            cancel: parent.child_token(),
        }
    }

    /// Validates `reference` and starts pulling it in the background.
    ///
    /// Must be called inside a tokio runtime.
    pub fn pull(&self, reference: &str, policy: PullPolicy) -> Result<PullHandle> {
        let reference = ImageReference::parse(reference)?;
        let (state_tx, state_rx) = watch::channel(PullState::Downloading {
            reference: reference.clone(),
        });
        let progress = Arc::new(PullProgress::new());
        let cancel = self.cancel.child_token();
        let active = ActivePull::enter(&self.active);

        let span = info_span!("pull", image = %reference);
        let puller = self.clone();
        let task = tokio::spawn(
            {
                let reference = reference.clone();
                let progress = Arc::clone(&progress);
                let cancel = cancel.clone();
                async move { puller.run(reference, policy, state_tx, progress, cancel, active).await }
            }
            .instrument(span),
        );

        Ok(PullHandle {
            reference,
            state: state_rx,
            progress,
            cancel,
            task,
        })
    }

    /// Number of pulls still running.
    pub fn active_pulls(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Removes the cache files of `ids` unless a running pull has them
    /// pinned or a pull committed since has written their rows back, and
    /// returns the ids whose files were removed.
    ///
    /// Called after the layer rows are gone. The pin table stays locked
    /// while files are removed, so a pull either pins a layer first and
    /// keeps its file, or pins it afterwards and finds it missing.
    pub fn discard_layers(&self, ids: &[String]) -> Result<Vec<String>> {
        let pins = self.layer_locks.pins();
        let mut removed = Vec::with_capacity(ids.len());
        for id in ids {
            if pins.contains_key(id) {
                debug!(layer = %id, "Layer pinned by a running pull, file kept");
                continue;
            }
            if self.store.get_layer(id)?.is_some() {
                debug!(layer = %id, "Layer committed again, file kept");
                continue;
            }
            match self.cache.remove_layer(id) {
                Ok(()) => removed.push(id.clone()),
                Err(e) => warn!(layer = %id, error = %e, "Failed to remove cached layer file"),
            }
        }
        Ok(removed)
    }

    /// Cancels every running pull.
    pub fn cancel_all(&self) {
        self.cancel.cancel();
    }

    async fn run(
        self,
        reference: ImageReference,
        policy: PullPolicy,
        state: watch::Sender<PullState>,
        progress: Arc<PullProgress>,
        cancel: CancellationToken,
        active: ActivePull,
    ) {
        info!("Pulling image");

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled(format!("pull of {reference}"))),
            outcome = tokio::time::timeout(
                self.pull_timeout,
                self.execute(&reference, policy, &progress, &cancel),
            ) => outcome.unwrap_or_else(|_| Err(Error::Timeout {
                operation: format!("pull of {reference}"),
                duration: self.pull_timeout,
            })),
        };
        // Stops layer downloads still running after a timeout or failure.
        cancel.cancel();

        let next = match result {
            Ok(image_id) => {
                info!(image_id = %image_id, "Pull complete");
                PullState::Done {
                    reference,
                    image_id,
                }
            }
            Err(error) => {
                if error.is_cancelled() {
                    info!("Pull cancelled");
                } else {
                    warn!(error = %error, "Pull failed");
                    self.registries.check_all();
                }
                PullState::Error {
                    reference,
                    error: Arc::new(error),
                }
            }
        };
        // Waiters must not observe a terminal state while still counted active.
        drop(active);
        state.send_replace(next);
    }

    async fn execute(
        &self,
        reference: &ImageReference,
        policy: PullPolicy,
        progress: &PullProgress,
        cancel: &CancellationToken,
    ) -> Result<String> {
        if policy == PullPolicy::IfMissing
            && let Some(image_id) = self.local_image(reference).await?
        {
            info!(image_id = %image_id, "Image already present, skipping registry");
            return Ok(image_id);
        }

        let manifest_step = progress.register(MANIFEST_STEP);
        let resolved = self.resolve(reference).await?;
        manifest_step.complete();

        let config_digest = resolved.manifest.config.digest.clone();
        let image_id = digest_hex(&config_digest).to_string();
        if let Some(existing) = self.store.get_image(&image_id)? {
            if self.layers_intact(&existing).await? {
                info!(image_id = %image_id, "Image already committed");
                return Ok(image_id);
            }
            warn!(image_id = %image_id, "Committed image has missing or corrupt layers, repairing");
        }

        let config_step = progress.register(CONFIG_STEP);
        let config = self.fetch_config(&resolved.registry_url, reference, &config_digest).await?;
        config_step.complete();

        let layers = resolved.manifest.layers.clone();
        for layer in &layers {
            check_layer_size(layer)?;
        }
        // All steps exist before the first download starts.
        let steps: Vec<StepHandle> = layers
            .iter()
            .map(|layer| progress.register(digest_hex(&layer.digest)))
            .collect();

        // Pins are held until the commit below has run.
        let (records, _pins): (Vec<LayerRecord>, Vec<LayerPin>) = self
            .download_layers(&resolved.registry_url, &reference.repository, layers, steps, cancel)
            .await?
            .into_iter()
            .unzip();

        if cancel.is_cancelled() {
            return Err(Error::Cancelled(format!("pull of {reference}")));
        }

        let image = ImageRecord {
            id: image_id.clone(),
            registry: reference.registry.clone(),
            repository: reference.repository.clone(),
            tag: reference.tag.clone(),
            architecture: config.architecture.unwrap_or(resolved.architecture),
            os: config.os.unwrap_or(resolved.os),
            size: records.iter().map(|l| l.size).sum(),
            layer_ids: records.iter().map(|l| l.id.clone()).collect(),
            config: config.config.unwrap_or_default(),
            created: Utc::now(),
        };
        self.store.commit_image(&image, &records)?;

        Ok(image_id)
    }

    /// Image already tagged `reference` with every layer intact.
    async fn local_image(&self, reference: &ImageReference) -> Result<Option<String>> {
        if reference.digest.is_some() {
            return Ok(None);
        }
        let Some(image) = self
            .store
            .find_image(&reference.registry, &reference.repository, &reference.tag)?
        else {
            return Ok(None);
        };

        if !self.layers_intact(&image).await? {
            debug!(image_id = %image.id, "Cached layers incomplete, going to the registry");
            return Ok(None);
        }
        Ok(Some(image.id))
    }

    /// True when every layer of `image` has a row and a cached file with the
    /// recorded size and hash. Reads only.
    async fn layers_intact(&self, image: &ImageRecord) -> Result<bool> {
        let mut expected = Vec::with_capacity(image.layer_ids.len());
        for id in &image.layer_ids {
            match self.store.get_layer(id)? {
                Some(layer) => expected.push((layer.id, layer.size)),
                None => return Ok(false),
            }
        }

        let cache = self.cache.clone();
        tokio::task::spawn_blocking(move || -> Result<bool> {
            for (id, size) in expected {
                if !cache.verify(&id, size)? {
                    return Ok(false);
                }
            }
            Ok(true)
        })
        .await
        .map_err(|e| Error::Internal(format!("layer verification task failed: {e}")))?
    }

    /// Fetches the manifest, following a manifest list to this platform.
    async fn resolve(&self, reference: &ImageReference) -> Result<ResolvedImage> {
        let registry_url = self.registries.best_url_for(&reference.registry);
        debug!(registry_url = %registry_url, "Resolving manifest");

        let manifest = self
            .client
            .fetch_manifest(&registry_url, &reference.repository, reference.manifest_reference())
            .await?;

        let (manifest, os, architecture) = match manifest {
            OciManifest::Image(manifest) => (
                manifest,
                self.platform.oci_os().to_string(),
                self.platform.oci_arch().to_string(),
            ),
            OciManifest::ImageIndex(index) => {
                let entry = select_platform_entry(&index, &self.platform).ok_or_else(|| Error::Manifest {
                    reference: reference.to_string(),
                    reason: "manifest list has no entries".to_string(),
                })?;
                let (os, architecture) = entry
                    .platform
                    .as_ref()
                    .map(|p| (p.os.clone(), p.architecture.clone()))
                    .unwrap_or_else(|| {
                        (
                            self.platform.oci_os().to_string(),
                            self.platform.oci_arch().to_string(),
                        )
                    });
                debug!(digest = %entry.digest, %os, %architecture, "Selected platform manifest");

                match self
                    .client
                    .fetch_manifest(&registry_url, &reference.repository, &entry.digest)
                    .await?
                {
                    OciManifest::Image(manifest) => (manifest, os, architecture),
                    OciManifest::ImageIndex(_) => {
                        return Err(Error::Manifest {
                            reference: reference.to_string(),
                            reason: "nested manifest list".to_string(),
                        });
                    }
                }
            }
        };

        debug!(
            media_type = manifest_media_type(&manifest),
            layers = manifest.layers.len(),
            "Resolved image manifest"
        );

        Ok(ResolvedImage {
            registry_url,
            manifest,
            os,
            architecture,
        })
    }

    /// Fetches the config blob and checks it against its digest.
    async fn fetch_config(&self, registry_url: &str, reference: &ImageReference, digest: &str) -> Result<ConfigBlob> {
        let bytes = self
            .client
            .fetch_config(registry_url, &reference.repository, digest)
            .await?;

        let computed = hex::encode(Sha256::digest(&bytes));
        if computed != digest_hex(digest) {
            return Err(Error::DigestMismatch {
                digest: digest.to_string(),
                computed: format!("sha256:{computed}"),
            });
        }

        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Fetches every layer concurrently; records come back in manifest order.
    async fn download_layers(
        &self,
        registry_url: &str,
        repository: &str,
        layers: Vec<OciDescriptor>,
        steps: Vec<StepHandle>,
        cancel: &CancellationToken,
    ) -> Result<Vec<(LayerRecord, LayerPin)>> {
        let limit = Arc::new(Semaphore::new(self.max_concurrent_downloads));
        let layer_cancel = cancel.child_token();
        let mut tasks = JoinSet::new();

        for (index, (layer, step)) in layers.into_iter().zip(steps).enumerate() {
            let puller = self.clone();
            let registry_url = registry_url.to_string();
            let repository = repository.to_string();
            let limit = Arc::clone(&limit);
            let cancel = layer_cancel.clone();

            tasks.spawn(async move {
                let record = puller
                    .fetch_layer(&registry_url, &repository, layer, step, limit, cancel)
                    .await;
                (index, record)
            });
        }

        let mut records: Vec<Option<(LayerRecord, LayerPin)>> = (0..tasks.len()).map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            let outcome = match joined {
                Ok((index, Ok(record))) => {
                    records[index] = Some(record);
                    continue;
                }
                Ok((_, Err(e))) => e,
                Err(e) => Error::Internal(format!("layer task failed: {e}")),
            };
            layer_cancel.cancel();
            tasks.abort_all();
            return Err(outcome);
        }

        records
            .into_iter()
            .map(|r| r.ok_or_else(|| Error::Internal("layer download produced no record".to_string())))
            .collect()
    }

    /// Makes one layer present and verified in the cache, and pins it.
    async fn fetch_layer(
        &self,
        registry_url: &str,
        repository: &str,
        layer: OciDescriptor,
        step: StepHandle,
        limit: Arc<Semaphore>,
        cancel: CancellationToken,
    ) -> Result<(LayerRecord, LayerPin)> {
        let id = digest_hex(&layer.digest).to_string();
        let size = u64::try_from(layer.size).unwrap_or(0);
        let cancelled = || Error::Cancelled(format!("download of layer {id}"));

        let _permit = tokio::select! {
            _ = cancel.cancelled() => return Err(cancelled()),
            permit = limit.acquire_owned() => permit
                .map_err(|_| Error::Internal("download limiter closed".to_string()))?,
        };

        let lock = self.layer_locks.lock_for(&id);
        let _guard = tokio::select! {
            _ = cancel.cancelled() => return Err(cancelled()),
            guard = lock.lock_owned() => guard,
        };
        let pin = self.layer_locks.pin(&id);

        let record = LayerRecord {
            id: id.clone(),
            size,
            media_type: layer.media_type.clone(),
            downloaded: true,
        };

        let cache = self.cache.clone();
        let verify_id = id.clone();
        let cached = tokio::task::spawn_blocking(move || cache.verify(&verify_id, size))
            .await
            .map_err(|e| Error::Internal(format!("layer verification task failed: {e}")))??;
        if cached {
            debug!(layer = %id, "Layer already cached");
            step.complete();
            return Ok((record, pin));
        }

        let temp = self.cache.temp_path(&id);
        let report = |received: u64| {
            if size > 0 {
                step.set(received as f64 / size as f64);
            }
        };

        let downloaded = tokio::select! {
            _ = cancel.cancelled() => Err(cancelled()),
            result = self.client.download_blob(registry_url, repository, &layer.digest, &temp, &report) => result,
        };
        if let Err(e) = downloaded {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(e);
        }

        let cache = self.cache.clone();
        let commit_id = id.clone();
        let stored = tokio::task::spawn_blocking(move || cache.commit(&commit_id, &temp))
            .await
            .map_err(|e| Error::Internal(format!("layer commit task failed: {e}")))??;

        debug!(layer = %id, bytes = stored, "Layer downloaded and verified");
        step.complete();
        Ok((LayerRecord { size: stored, ..record }, pin))
    }
}

/// Rejects descriptors that declare an impossible or oversized layer.
fn check_layer_size(layer: &OciDescriptor) -> Result<()> {
    let size = u64::try_from(layer.size).map_err(|_| Error::Manifest {
        reference: layer.digest.clone(),
        reason: format!("negative layer size {}", layer.size),
    })?;
    if size > MAX_LAYER_SIZE {
        return Err(Error::LayerTooLarge {
            digest: layer.digest.clone(),
            size,
            limit: MAX_LAYER_SIZE,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_register_is_idempotent() {
        let progress = PullProgress::new();
        progress.register("manifest");
        progress.register("config");
        progress.register("manifest").complete();

        assert_eq!(progress.step_names(), vec!["manifest", "config"]);
        assert_eq!(progress.fraction("manifest"), Some(1.0));
        assert_eq!(progress.fraction("config"), Some(0.0));
    }

    #[test]
    fn test_step_fraction_clamped() {
        let progress = PullProgress::new();
        let step = progress.register("layer");
        step.set(3.5);
        assert_eq!(progress.fraction("layer"), Some(1.0));
        step.set(-1.0);
        assert_eq!(progress.fraction("layer"), Some(0.0));
        step.set(f64::NAN);
        assert_eq!(progress.fraction("layer"), Some(0.0));
    }

    #[test]
    fn test_watch_steps_counts_registrations() {
        let progress = PullProgress::new();
        let rx = progress.watch_steps();
        progress.register("a");
        progress.register("b");
        progress.register("a");
        assert_eq!(*rx.borrow(), 2);
    }

    #[test]
    fn test_layer_locks_shared_while_held() {
        let locks = LayerLocks::default();
        let first = locks.lock_for("abc");
        let second = locks.lock_for("abc");
        assert!(Arc::ptr_eq(&first, &second));

        drop(first);
        drop(second);
        let third = locks.lock_for("abc");
        assert_eq!(Arc::strong_count(&third), 1);
    }

    #[test]
    fn test_layer_pins_are_counted() {
        let locks = Arc::new(LayerLocks::default());
        let first = locks.pin("abc");
        let second = locks.pin("abc");
        assert_eq!(locks.pins().get("abc"), Some(&2));

        drop(first);
        assert_eq!(locks.pins().get("abc"), Some(&1));
        drop(second);
        assert!(locks.pins().is_empty(), "last pin removes the entry");
    }

    #[test]
    fn test_check_layer_size() {
        let mut layer = OciDescriptor {
            digest: "sha256:00".to_string(),
            size: 10,
            ..Default::default()
        };
        assert!(check_layer_size(&layer).is_ok());

        layer.size = -1;
        assert!(check_layer_size(&layer).is_err());

        layer.size = i64::try_from(MAX_LAYER_SIZE).unwrap() + 1;
        assert!(matches!(check_layer_size(&layer), Err(Error::LayerTooLarge { .. })));
    }
}
