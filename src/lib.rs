//! # burrow
//!
//! **On-Device Container Engine Core**
//!
//! Resolves image references against OCI/Docker v2 registries and their
//! mirrors, downloads and verifies layers into a content-addressed cache,
//! extracts them into per-container root filesystems, and tracks image and
//! container state. No daemon and no root privileges are needed.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                              Engine                                 │
//! │   start_pull(ref)      create_container(image, name?, config)       │
//! │   best_registry_url(registry)                                       │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────────────┐          ┌──────────────────────────┐     │
//! │  │  Image Download      │          │  Container Create        │     │
//! │  │  Pipeline (pull)     │          │  Pipeline (create)       │     │
//! │  │  manifest → config → │          │  name check → rootfs →   │     │
//! │  │  layers ∥ → commit   │          │  layers in order → merge │     │
//! │  └─────────┬────────────┘          └────────────┬─────────────┘     │
//! │            │                                    │                   │
//! │  ┌─────────┴────────────┐          ┌────────────┴─────────────┐     │
//! │  │  Registry Manager    │          │  Container Manager       │     │
//! │  │  health task per     │          │  handles, name           │     │
//! │  │  mirror, ranking     │          │  reservations            │     │
//! │  └─────────┬────────────┘          └────────────┬─────────────┘     │
//! │            │                                    │                   │
//! ├────────────┴────────────────────────────────────┴───────────────────┤
//! │  Registry Client (reqwest)  │  Metadata Store (SQLite)              │
//! │  bearer token exchange      │  Layer Cache  <hex>.tar.gz            │
//! │                             │  containers/<id>/ rootfs              │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Pipeline States
//!
//! ```text
//! pull:    Downloading ──► Done(image id)
//!                     └──► Error(cause)
//!
//! create:  Creating ──► Done(container)
//!                  └──► Error(cause)          partial rootfs deleted
//!
//! registry health:
//!          Checking ──► Healthy(latency, failures) ──► Checking ...
//!                  └──► Unhealthy ──► Checking ...
//!          any ──► Removing ──► Removed
//! ```
//!
//! # Security Model
//!
//! - **Digest Verification**: every layer and config blob is hashed before
//!   it is trusted; cached layers are re-verified before reuse (see
//!   [`storage::LayerCache::verify`]).
//! - **Path Traversal Protection**: tar entries with `..`, absolute paths or
//!   symlinked parents leading outside the rootfs are rejected (see
//!   [`rootfs::extract_layers`]).
//! - **Size Limits**: `MAX_LAYER_SIZE` per layer, `MAX_ROOTFS_SIZE` per
//!   container, `MAX_LAYERS` per image.
//! - **Timeouts**: health probes are bounded by the probe timeout and whole
//!   pulls by the pull timeout.
//!
//! # Example
//!
//! ```rust,ignore
//! use burrow::{ContainerConfig, Engine, EngineConfig};
//!
//! #[tokio::main]
//! async fn main() -> burrow::Result<()> {
//!     let engine = Engine::open(EngineConfig::from_env())?;
//!
//!     let pull = engine.start_pull("alpine:latest")?;
//!     let image_id = pull.wait().await?;
//!
//!     let create = engine.create_container(&image_id, Some("c1".into()), ContainerConfig::default());
//!     let container = create.wait().await?;
//!     println!("{} -> {}", container.name, container.id);
//!
//!     engine.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod constants;
pub mod container;
pub mod create;
pub mod engine;
pub mod error;
pub mod image;
pub mod platform;
pub mod pull;
pub mod reference;
pub mod registry;
pub mod rootfs;
pub mod storage;
pub mod store;

// Re-exports
pub use config::EngineConfig;
pub use container::{Container, ContainerManager, ContainerStatus};
pub use create::{ContainerCreator, CreateHandle, CreateState, merge_config};
pub use engine::Engine;
pub use error::{Error, ErrorKind, Result};
pub use image::ImageService;
pub use platform::{Arch, Os, Platform};
pub use pull::{ImagePuller, PullHandle, PullPolicy, PullProgress, PullState};
pub use reference::ImageReference;
pub use registry::{
    HttpRegistryClient, RankedRegistry, RegistryApi, RegistryHealth, RegistryManager,
    SearchClient, SearchPage, SearchResult, TagPage,
};
pub use storage::{ContainerDirs, LayerCache};
pub use store::{
    ContainerConfig, ContainerRecord, ImageConfig, ImageRecord, LayerRecord, MetadataStore,
    RegistryKind, RegistryServer, VolumeBinding,
};
