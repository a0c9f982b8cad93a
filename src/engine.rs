//! Engine wiring.
//!
//! [`Engine::open`] builds every collaborator from an [`EngineConfig`] and
//! hands each one the pieces it needs explicitly. All long-lived tasks
//! (registry health loops, pulls, creates) hang off one root
//! `CancellationToken`, so [`Engine::shutdown`] stops everything.

use crate::config::EngineConfig;
use crate::container::ContainerManager;
use crate::create::{ContainerCreator, CreateHandle};
use crate::error::Result;
use crate::image::ImageService;
use crate::pull::{ImagePuller, PullHandle, PullPolicy};
use crate::reference::ImageReference;
use crate::registry::{
    HealthSettings, HttpRegistryClient, RegistryApi, RegistryManager, SearchClient, SearchPage, TagPage,
};
use crate::storage::{ContainerDirs, LayerCache};
use crate::store::{ContainerConfig, MetadataStore};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub struct Engine {
    config: EngineConfig,
    store: Arc<MetadataStore>,
    registries: Arc<RegistryManager>,
    images: ImageService,
    containers: Arc<ContainerManager>,
    creator: ContainerCreator,
    client: Arc<dyn RegistryApi>,
    search: SearchClient,
    cancel: CancellationToken,
}

impl Engine {
    /// Opens the engine with the HTTP registry client.
    ///
    /// Must be called inside a tokio runtime.
    pub fn open(config: EngineConfig) -> Result<Self> {
        let store = Arc::new(MetadataStore::open(&config.database_path())?);
        let client = Arc::new(HttpRegistryClient::new(Arc::clone(&store), config.probe_timeout)?);
        Self::assemble(config, store, client)
    }

    /// Opens the engine against any [`RegistryApi`] implementation.
    pub fn open_with_client(config: EngineConfig, client: Arc<dyn RegistryApi>) -> Result<Self> {
        let store = Arc::new(MetadataStore::open(&config.database_path())?);
        Self::assemble(config, store, client)
    }

    fn assemble(config: EngineConfig, store: Arc<MetadataStore>, client: Arc<dyn RegistryApi>) -> Result<Self> {
        let cancel = CancellationToken::new();
        let cache = LayerCache::with_path(config.layers_dir())?;
        let dirs = ContainerDirs::with_path(config.containers_dir())?;

        let registries = RegistryManager::start(
            Arc::clone(&client),
            Arc::clone(&store),
            HealthSettings {
                interval: config.health_check_interval,
                probe_timeout: config.probe_timeout,
                unhealthy_threshold: config.unhealthy_threshold,
            },
            config.default_registry.clone(),
            config.builtin_registries,
            &cancel,
        )?;

        let puller = ImagePuller::new(
            Arc::clone(&client),
            Arc::clone(&registries),
            Arc::clone(&store),
            cache.clone(),
            &config,
            &cancel,
        );
        let images = ImageService::new(Arc::clone(&store), cache.clone(), puller);

        let containers = Arc::new(ContainerManager::load(Arc::clone(&store), dirs)?);
        let creator = ContainerCreator::new(Arc::clone(&store), cache, Arc::clone(&containers), &cancel);
        let search = SearchClient::new(config.search_url.clone())?;

        info!(root = %config.root().display(), platform = %config.platform, "Engine ready");

        Ok(Self {
            config,
            store,
            registries,
            images,
            containers,
            creator,
            client,
            search,
            cancel,
        })
    }

    /// Starts a pull, answered locally when the image is already present.
    pub fn start_pull(&self, reference: &str) -> Result<PullHandle> {
        self.images.pull(reference, PullPolicy::IfMissing)
    }

    pub fn start_pull_with(&self, reference: &str, policy: PullPolicy) -> Result<PullHandle> {
        self.images.pull(reference, policy)
    }

    /// Starts creating a container from a committed image.
    pub fn create_container(&self, image_id: &str, name: Option<String>, config: ContainerConfig) -> CreateHandle {
        self.creator.create(image_id, name, config)
    }

    /// Registry URL to use for `logical_registry`; never fails.
    pub fn best_registry_url(&self, logical_registry: &str) -> String {
        self.registries.best_url_for(logical_registry)
    }

    /// One page of tags for the repository named by `image`.
    ///
    /// Any tag or digest in `image` is ignored. The request goes to the
    /// best registry for the image's logical registry.
    pub async fn list_tags(&self, image: &str, page_size: u32, last: Option<&str>) -> Result<TagPage> {
        let reference = ImageReference::parse(image)?;
        let url = self.registries.best_url_for(&reference.registry);
        debug!(registry = %url, repository = %reference.repository, "listing tags");
        self.client
            .list_tags(&url, &reference.repository, page_size.max(1), last)
            .await
    }

    /// First page of repositories matching `query`.
    pub async fn search(&self, query: &str, page_size: u32) -> Result<SearchPage> {
        self.search.search(query, page_size).await
    }

    /// Follows a `next` or `previous` link from an earlier search page.
    pub async fn search_page(&self, url: &str) -> Result<SearchPage> {
        self.search.page(url).await
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<MetadataStore> {
        &self.store
    }

    pub fn registries(&self) -> &Arc<RegistryManager> {
        &self.registries
    }

    pub fn images(&self) -> &ImageService {
        &self.images
    }

    pub fn containers(&self) -> &Arc<ContainerManager> {
        &self.containers
    }

    /// Cancels every pull and create and stops the health tasks.
    pub async fn shutdown(&self) {
        info!("Shutting down engine");
        self.cancel.cancel();
        self.registries.shutdown().await;
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
