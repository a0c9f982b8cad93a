//! # Image Service
//!
//! Facade over committed images: pull (delegated to [`ImagePuller`]),
//! list, look up, delete, and cache maintenance.
//!
//! ## Deleting Images
//!
//! ```text
//! delete(id)
//!   ├── container uses image?  ──► ImageInUse
//!   ├── one transaction: image row, its references (cascade),
//!   │   every layer row left unreferenced
//!   └── remove the cache files of those layers, except layers a
//!       running pull has pinned
//! ```
//!
//! Layer files shared with another image are never touched because their
//! rows still have references. A layer that an in-flight pull has already
//! verified keeps its file; that pull's commit restores the row.

use crate::error::{Error, Result};
use crate::pull::{ImagePuller, PullHandle, PullPolicy};
use crate::reference::ImageReference;
use crate::storage::{GcStats, LayerCache};
use crate::store::{ImageRecord, MetadataStore};
use std::sync::Arc;
use tracing::{info, warn};

/// Shortest id prefix accepted by [`ImageService::resolve`].
const MIN_ID_PREFIX: usize = 12;

pub struct ImageService {
    store: Arc<MetadataStore>,
    cache: LayerCache,
    puller: ImagePuller,
}

impl ImageService {
    pub fn new(store: Arc<MetadataStore>, cache: LayerCache, puller: ImagePuller) -> Self {
        Self { store, cache, puller }
    }

    pub fn puller(&self) -> &ImagePuller {
        &self.puller
    }

    /// Starts pulling `reference`.
    pub fn pull(&self, reference: &str, policy: PullPolicy) -> Result<PullHandle> {
        self.puller.pull(reference, policy)
    }

    /// All images, newest first.
    pub fn list(&self) -> Result<Vec<ImageRecord>> {
        self.store.list_images()
    }

    pub fn get(&self, id: &str) -> Result<ImageRecord> {
        self.store
            .get_image(id)?
            .ok_or_else(|| Error::ImageNotFound(id.to_string()))
    }

    /// Image currently tagged as `reference`.
    pub fn find(&self, reference: &str) -> Result<Option<ImageRecord>> {
        let reference = ImageReference::parse(reference)?;
        self.store
            .find_image(&reference.registry, &reference.repository, &reference.tag)
    }

    /// Accepts a full id, an unambiguous id prefix, or a reference.
    pub fn resolve(&self, id_or_reference: &str) -> Result<ImageRecord> {
        if let Some(image) = self.store.get_image(id_or_reference)? {
            return Ok(image);
        }

        let is_hex = id_or_reference.chars().all(|c| c.is_ascii_hexdigit());
        if is_hex && id_or_reference.len() >= MIN_ID_PREFIX {
            let mut matches: Vec<ImageRecord> = self
                .store
                .list_images()?
                .into_iter()
                .filter(|image| image.id.starts_with(id_or_reference))
                .collect();
            if matches.len() == 1 {
                return Ok(matches.remove(0));
            }
        }

        self.find(id_or_reference)?
            .ok_or_else(|| Error::ImageNotFound(id_or_reference.to_string()))
    }

    /// Deletes an image and the cache files of layers only it used.
    ///
    /// Returns the ids of the layers whose files were removed.
    pub fn delete(&self, id: &str) -> Result<Vec<String>> {
        let unreferenced = self.store.delete_image(id)?;
        let removed = self.puller.discard_layers(&unreferenced)?;
        info!(
            image = %id,
            layers = removed.len(),
            kept = unreferenced.len() - removed.len(),
            "Image deleted"
        );
        Ok(removed)
    }

    /// Removes cache files that no layer row accounts for.
    ///
    /// Skipped while pulls are running, since their downloads are not
    /// committed yet.
    pub fn prune_cache(&self) -> Result<GcStats> {
        let running = self.puller.active_pulls();
        if running > 0 {
            warn!(running, "Pulls in progress, cache prune skipped");
            return Ok(GcStats::default());
        }
        let keep = self.store.layer_ids()?;
        self.cache.prune(&keep)
    }

    /// Bytes used by the layer cache.
    pub fn cache_size(&self) -> Result<u64> {
        self.cache.total_size()
    }
}
