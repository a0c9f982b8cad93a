//! # Container Manager
//!
//! In-memory registry of created containers, backed by the metadata store
//! and the `containers/<id>` rootfs directories.
//!
//! ## Name Reservation
//!
//! A create pipeline reserves its name here before touching the
//! filesystem. The reservation covers the window between the name check and
//! the row insert, so two concurrent creates of `c1` cannot both pass the
//! check. The store's `UNIQUE` constraint still backs this up.
//!
//! ## Status
//!
//! Every [`Container`] carries a `watch` channel of its [`ContainerStatus`].
//! The engine core only ever produces `Created`; the process runner moves a
//! container to `Running` and `Exited` through [`Container::set_status`].

use crate::error::{Error, Result};
use crate::storage::ContainerDirs;
use crate::store::{ContainerRecord, MetadataStore};
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Lifecycle status of a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerStatus {
    Created,
    Running,
    Exited { exit_code: Option<i32> },
}

impl ContainerStatus {
    pub fn label(&self) -> &'static str {
        match self {
            ContainerStatus::Created => "created",
            ContainerStatus::Running => "running",
            ContainerStatus::Exited { .. } => "exited",
        }
    }
}

/// Handle to one created container.
pub struct Container {
    record: Mutex<ContainerRecord>,
    status: watch::Sender<ContainerStatus>,
}

impl Container {
    fn new(record: ContainerRecord) -> Self {
        let (status, _) = watch::channel(ContainerStatus::Created);
        Self {
            record: Mutex::new(record),
            status,
        }
    }

    fn locked(&self) -> MutexGuard<'_, ContainerRecord> {
        self.record.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn id(&self) -> String {
        self.locked().id.clone()
    }

    pub fn name(&self) -> String {
        self.locked().name.clone()
    }

    /// Snapshot of the persisted record.
    pub fn record(&self) -> ContainerRecord {
        self.locked().clone()
    }

    pub fn status(&self) -> ContainerStatus {
        *self.status.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ContainerStatus> {
        self.status.subscribe()
    }

    pub fn set_status(&self, status: ContainerStatus) {
        self.status.send_replace(status);
    }
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let record = self.locked();
        f.debug_struct("Container")
            .field("id", &record.id)
            .field("name", &record.name)
            .field("image", &record.image_name)
            .field("status", &self.status())
            .finish()
    }
}

/// A held container name; released on drop unless the container was
/// registered under it.
#[derive(Debug)]
pub struct NameReservation {
    name: String,
    reserved: Arc<Mutex<HashSet<String>>>,
}

impl NameReservation {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for NameReservation {
    fn drop(&mut self) {
        self.reserved
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&self.name);
    }
}

pub struct ContainerManager {
    store: Arc<MetadataStore>,
    dirs: ContainerDirs,
    containers: Mutex<HashMap<String, Arc<Container>>>,
    reserved: Arc<Mutex<HashSet<String>>>,
}

impl ContainerManager {
    /// Restores a handle for every persisted container.
    pub fn load(store: Arc<MetadataStore>, dirs: ContainerDirs) -> Result<Self> {
        let records = store.list_containers()?;
        let mut containers = HashMap::with_capacity(records.len());
        for record in records {
            if !dirs.has_rootfs(&record.id) {
                warn!(container = %record.id, "Root filesystem missing for container");
            }
            containers.insert(record.id.clone(), Arc::new(Container::new(record)));
        }
        info!(count = containers.len(), "Loaded containers");

        Ok(Self {
            store,
            dirs,
            containers: Mutex::new(containers),
            reserved: Arc::new(Mutex::new(HashSet::new())),
        })
    }

    fn containers(&self) -> MutexGuard<'_, HashMap<String, Arc<Container>>> {
        self.containers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn dirs(&self) -> &ContainerDirs {
        &self.dirs
    }

    pub fn rootfs_path(&self, id: &str) -> PathBuf {
        self.dirs.rootfs_path(id)
    }

    /// True if a container has the name or a create is holding it.
    pub fn is_name_taken(&self, name: &str) -> Result<bool> {
        let reserved = self.reserved.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(reserved.contains(name) || self.store.container_name_exists(name)?)
    }

    /// Claims `name` for a create in progress.
    pub fn reserve_name(&self, name: &str) -> Result<NameReservation> {
        let mut reserved = self.reserved.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if reserved.contains(name) || self.store.container_name_exists(name)? {
            return Err(Error::NameConflict(name.to_string()));
        }
        reserved.insert(name.to_string());
        Ok(NameReservation {
            name: name.to_string(),
            reserved: Arc::clone(&self.reserved),
        })
    }

    /// Persists a new container and starts tracking it.
    pub fn register(&self, record: ContainerRecord, reservation: NameReservation) -> Result<Arc<Container>> {
        debug_assert_eq!(record.name, reservation.name);
        self.store.insert_container(&record)?;
        let container = Arc::new(Container::new(record));
        self.containers()
            .insert(container.id(), Arc::clone(&container));
        drop(reservation);
        Ok(container)
    }

    pub fn get(&self, id: &str) -> Option<Arc<Container>> {
        self.containers().get(id).cloned()
    }

    pub fn get_by_name(&self, name: &str) -> Option<Arc<Container>> {
        self.containers()
            .values()
            .find(|c| c.name() == name)
            .cloned()
    }

    /// Every container, oldest first.
    pub fn list(&self) -> Vec<Arc<Container>> {
        let mut all: Vec<_> = self.containers().values().cloned().collect();
        all.sort_by_key(|c| c.record().created_at);
        all
    }

    /// Deletes the container row and its root filesystem.
    pub fn remove(&self, id: &str) -> Result<()> {
        let tracked = self.containers().remove(id);
        let deleted = self.store.delete_container(id)?;
        if tracked.is_none() && !deleted {
            return Err(Error::ContainerNotFound(id.to_string()));
        }
        if let Some(container) = &tracked
            && container.status() == ContainerStatus::Running
        {
            warn!(container = %id, "Removing a running container");
        }

        self.dirs.remove_rootfs(id)?;
        info!(container = %id, "Container removed");
        Ok(())
    }

    /// Records that the container was just started.
    pub fn mark_run(&self, id: &str) -> Result<()> {
        let now = Utc::now();
        self.store.set_container_last_run(id, now)?;
        if let Some(container) = self.get(id) {
            container.locked().last_run_at = Some(now);
        }
        debug!(container = %id, "Container run recorded");
        Ok(())
    }
}
