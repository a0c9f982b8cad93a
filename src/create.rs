//! # Container Create Pipeline
//!
//! Builds a container from an image that is already in the store:
//!
//! 1. look up the image (`ImageNotFound` otherwise),
//! 2. claim the name, generated if none was given (`NameConflict` before
//!    any filesystem change),
//! 3. create `containers/<id>`,
//! 4. extract the image layers into it, base layer first,
//! 5. merge the caller's config with the image defaults,
//! 6. persist the record and register it with the [`ContainerManager`].
//!
//! Any failure after step 3, cancellation included, deletes the partially
//! populated directory before the pipeline reports `Error`.
//!
//! ## Config Merge
//!
//! [`ContainerConfig::default`] uses sentinel values. A field still equal
//! to its sentinel takes the image's value:
//!
//! | Field | Caller sentinel | Image source |
//! |-------|-----------------|--------------|
//! | `cmd` | `["/bin/sh"]` | `Cmd` |
//! | `working_dir` | `/` | `WorkingDir` (non-empty) |
//! | `user` | `root` | `User` (non-empty) |
//! | `entrypoint` | `None` | `Entrypoint` |
//!
//! Environment variables merge as a map: image `KEY=VALUE` entries first,
//! caller entries on top.

use crate::constants::{NAME_ADJECTIVES, NAME_NOUNS, validate_container_name};
use crate::container::{ContainerManager, NameReservation};
use crate::error::{Error, Result};
use crate::rootfs::extract_layers;
use crate::storage::LayerCache;
use crate::store::{ContainerConfig, ContainerRecord, ImageConfig, ImageRecord, MetadataStore};
use chrono::Utc;
use rand::Rng;
use rand::seq::IndexedRandom;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

/// Attempts at finding an unused generated name.
const NAME_ATTEMPTS: usize = 32;

/// Lifecycle of one create.
#[derive(Debug, Clone)]
pub enum CreateState {
    Creating {
        id: String,
        image_id: String,
        name: Option<String>,
        config: ContainerConfig,
    },
    Done(ContainerRecord),
    Error {
        id: String,
        error: Arc<Error>,
    },
}

impl CreateState {
    pub fn id(&self) -> &str {
        match self {
            CreateState::Creating { id, .. } | CreateState::Error { id, .. } => id,
            CreateState::Done(record) => &record.id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, CreateState::Creating { .. })
    }
}

/// Merges caller settings with the image's embedded defaults.
pub fn merge_config(caller: ContainerConfig, image: &ImageConfig) -> ContainerConfig {
    let mut merged = caller;

    if merged.is_default_cmd()
        && let Some(cmd) = image.cmd.as_ref().filter(|c| !c.is_empty())
    {
        merged.cmd = cmd.clone();
    }

    if merged.entrypoint.is_none() {
        merged.entrypoint = image.entrypoint.clone().filter(|e| !e.is_empty());
    }

    if merged.is_default_working_dir()
        && let Some(dir) = image.working_dir.as_ref().filter(|d| !d.is_empty())
    {
        merged.working_dir = dir.clone();
    }

    if merged.is_default_user()
        && let Some(user) = image.user.as_ref().filter(|u| !u.is_empty())
    {
        merged.user = user.clone();
    }

    let mut env: std::collections::BTreeMap<String, String> = image
        .env
        .iter()
        .flatten()
        .filter_map(|entry| {
            let (key, value) = entry.split_once('=').unwrap_or((entry.as_str(), ""));
            (!key.is_empty()).then(|| (key.to_string(), value.to_string()))
        })
        .collect();
    env.extend(std::mem::take(&mut merged.env));
    merged.env = env;

    merged
}

/// Random `adjective_noun_NNNN` name.
pub fn generate_name<R: Rng + ?Sized>(rng: &mut R) -> String {
    let adjective = NAME_ADJECTIVES.choose(rng).copied().unwrap_or("quiet");
    let noun = NAME_NOUNS.choose(rng).copied().unwrap_or("burrow");
    let suffix: u16 = rng.random_range(1000..=9999);
    format!("{adjective}_{noun}_{suffix}")
}

/// Caller's view of a running create.
pub struct CreateHandle {
    id: String,
    state: watch::Receiver<CreateState>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl CreateHandle {
    /// Id allocated for the new container.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> CreateState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<CreateState> {
        self.state.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Waits for a terminal state and returns the container record.
    pub async fn wait(&self) -> Result<ContainerRecord> {
        let mut rx = self.state.clone();
        let state = rx
            .wait_for(CreateState::is_terminal)
            .await
            .map_err(|_| Error::Internal("create task ended without a result".to_string()))?
            .clone();

        match state {
            CreateState::Done(record) => Ok(record),
            CreateState::Error { error, .. } => Err(Error::Shared(error)),
            CreateState::Creating { .. } => Err(Error::Internal("create still running".to_string())),
        }
    }
}

/// Starts create pipelines.
#[derive(Clone)]
pub struct ContainerCreator {
    store: Arc<MetadataStore>,
    cache: LayerCache,
    containers: Arc<ContainerManager>,
    cancel: CancellationToken,
}

impl ContainerCreator {
    pub fn new(
        store: Arc<MetadataStore>,
        cache: LayerCache,
        containers: Arc<ContainerManager>,
        parent: &CancellationToken,
    ) -> Self {
        Self {
            store,
            cache,
            containers,
            cancel: parent.child_token(),
        }
    }

    /// Starts creating a container from `image_id` in the background.
    ///
    /// Must be called inside a tokio runtime.
    pub fn create(&self, image_id: &str, name: Option<String>, config: ContainerConfig) -> CreateHandle {
        let id = uuid::Uuid::now_v7().to_string();
        let (state_tx, state_rx) = watch::channel(CreateState::Creating {
            id: id.clone(),
            image_id: image_id.to_string(),
            name: name.clone(),
            config: config.clone(),
        });
        let cancel = self.cancel.child_token();

        let span = info_span!("create", container = %id, image = %image_id);
        let task = tokio::spawn(
            self.clone()
                .run(id.clone(), image_id.to_string(), name, config, state_tx, cancel.clone())
                .instrument(span),
        );

        CreateHandle {
            id,
            state: state_rx,
            cancel,
            task,
        }
    }

    async fn run(
        self,
        id: String,
        image_id: String,
        name: Option<String>,
        config: ContainerConfig,
        state: watch::Sender<CreateState>,
        cancel: CancellationToken,
    ) {
        let next = match self.execute(&id, &image_id, name, config, &cancel).await {
            Ok(record) => {
                info!(name = %record.name, "Container created");
                CreateState::Done(record)
            }
            Err(error) => {
                if error.is_cancelled() {
                    info!("Create cancelled");
                } else {
                    warn!(error = %error, "Create failed");
                }
                CreateState::Error {
                    id,
                    error: Arc::new(error),
                }
            }
        };
        state.send_replace(next);
    }

    async fn execute(
        &self,
        id: &str,
        image_id: &str,
        name: Option<String>,
        config: ContainerConfig,
        cancel: &CancellationToken,
    ) -> Result<ContainerRecord> {
        let image = self
            .store
            .get_image(image_id)?
            .ok_or_else(|| Error::ImageNotFound(image_id.to_string()))?;

        let reservation = match name {
            Some(name) => {
                validate_container_name(&name).map_err(|_| Error::InvalidName(name.clone()))?;
                self.containers.reserve_name(&name)?
            }
            None => self.reserve_generated_name()?,
        };

        if cancel.is_cancelled() {
            return Err(Error::Cancelled("container create".to_string()));
        }

        let rootfs = self.containers.dirs().create_rootfs(id)?;
        match self.populate(id, &image, rootfs, config, reservation, cancel).await {
            Ok(record) => Ok(record),
            Err(e) => {
                if let Err(cleanup) = self.containers.dirs().remove_rootfs(id) {
                    warn!(error = %cleanup, "Failed to remove partial root filesystem");
                }
                Err(e)
            }
        }
    }

    /// Steps that run once the rootfs directory exists.
    async fn populate(
        &self,
        id: &str,
        image: &ImageRecord,
        rootfs: PathBuf,
        config: ContainerConfig,
        reservation: NameReservation,
        cancel: &CancellationToken,
    ) -> Result<ContainerRecord> {
        let cache = self.cache.clone();
        let layer_ids = image.layer_ids.clone();
        let token = cancel.clone();
        let stats = tokio::task::spawn_blocking(move || extract_layers(&cache, &layer_ids, &rootfs, &token))
            .await
            .map_err(|e| Error::Internal(format!("extraction task failed: {e}")))??;
        debug!(layers = stats.layers, bytes = stats.bytes, "Layers extracted");

        if cancel.is_cancelled() {
            return Err(Error::Cancelled("container create".to_string()));
        }

        let record = ContainerRecord {
            id: id.to_string(),
            name: reservation.name().to_string(),
            image_id: image.id.clone(),
            image_name: image.short_name(),
            created_at: Utc::now(),
            config: merge_config(config, &image.config),
            last_run_at: None,
        };

        self.containers.register(record.clone(), reservation)?;
        Ok(record)
    }

    fn reserve_generated_name(&self) -> Result<NameReservation> {
        let mut rng = rand::rng();
        for _ in 0..NAME_ATTEMPTS {
            let candidate = generate_name(&mut rng);
            match self.containers.reserve_name(&candidate) {
                Ok(reservation) => return Ok(reservation),
                Err(Error::NameConflict(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(Error::Internal("no unused container name found".to_string()))
    }
}
