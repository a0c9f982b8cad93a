//! Registry mirror manager.
//!
//! Owns one [`HealthTask`] per configured registry, keeps a mutex-guarded
//! map of their live health, and ranks healthy registries on every read.
//!
//! ## Ranking
//!
//! Healthy registries are ordered by:
//!
//! | # | Key | Order |
//! |---|-----|-------|
//! | 1 | latency | ascending |
//! | 2 | consecutive failures | ascending |
//! | 3 | priority | descending |
//! | 4 | kind | built-in before custom |
//! | 5 | id | ascending (determinism) |
//!
//! [`RegistryManager::best_url_for`] never fails: with no healthy registry
//! it returns the configured default upstream.

use super::client::RegistryApi;
use super::health::{HealthCommand, HealthSettings, HealthTask, RegistryHealth, request_remove};
use crate::constants::{
    BUILTIN_REGISTRY_PRIORITY, DAOCLOUD_MIRROR_ID, DAOCLOUD_MIRROR_URL, DEFAULT_CUSTOM_PRIORITY,
    DEFAULT_REGISTRY_URL, DOCKER_HUB_REGISTRY_ID,
};
use crate::error::{Error, Result};
use crate::reference::is_docker_hub_host;
use crate::store::{MetadataStore, RegistryKind, RegistryServer};
use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info, info_span, warn};

/// Command queue depth per health task.
const COMMAND_CHANNEL_CAPACITY: usize = 8;

/// A healthy registry with the figures it was ranked by.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RankedRegistry {
    pub server: RegistryServer,
    pub latency_ms: u64,
    pub failures: u32,
}

/// Orders healthy registries best first; unhealthy, checking and removed
/// entries are left out.
pub fn rank(entries: impl IntoIterator<Item = (RegistryServer, RegistryHealth)>) -> Vec<RankedRegistry> {
    let mut ranked: Vec<RankedRegistry> = entries
        .into_iter()
        .filter_map(|(server, health)| match health {
            RegistryHealth::Healthy {
                latency_ms,
                failures,
            } => Some(RankedRegistry {
                server,
                latency_ms,
                failures,
            }),
            _ => None,
        })
        .collect();

    ranked.sort_by(|a, b| {
        let key = |r: &RankedRegistry| {
            (
                r.latency_ms,
                r.failures,
                Reverse(r.server.priority),
                r.server.kind != RegistryKind::Builtin,
            )
        };
        key(a).cmp(&key(b)).then_with(|| a.server.id.cmp(&b.server.id))
    });
    ranked
}

/// The registries shipped with the engine.
pub fn builtin_registries() -> Vec<RegistryServer> {
    vec![
        RegistryServer {
            id: DOCKER_HUB_REGISTRY_ID.to_string(),
            url: DEFAULT_REGISTRY_URL.to_string(),
            name: "Docker Hub".to_string(),
            bearer_token: None,
            kind: RegistryKind::Builtin,
            priority: BUILTIN_REGISTRY_PRIORITY,
        },
        RegistryServer {
            id: DAOCLOUD_MIRROR_ID.to_string(),
            url: DAOCLOUD_MIRROR_URL.to_string(),
            name: "DaoCloud".to_string(),
            bearer_token: None,
            kind: RegistryKind::Builtin,
            priority: BUILTIN_REGISTRY_PRIORITY,
        },
    ]
}

/// Bookkeeping for one registry's health task.
struct ManagedRegistry {
    server: RegistryServer,
    health: watch::Receiver<RegistryHealth>,
    commands: mpsc::Sender<HealthCommand>,
    task: JoinHandle<()>,
    cancel: CancellationToken,
}

pub struct RegistryManager {
    client: Arc<dyn RegistryApi>,
    store: Arc<MetadataStore>,
    settings: HealthSettings,
    default_registry: String,
    registries: Mutex<HashMap<String, ManagedRegistry>>,
    /// Parent of every health task's token.
    cancel: CancellationToken,
}

impl RegistryManager {
    /// Loads every registry row and spawns its health task.
    ///
    /// With `provision_builtins`, the built-in registries are inserted
    /// first if missing. Must be called inside a tokio runtime.
    pub fn start(
        client: Arc<dyn RegistryApi>,
        store: Arc<MetadataStore>,
        settings: HealthSettings,
        default_registry: impl Into<String>,
        provision_builtins: bool,
        parent: &CancellationToken,
    ) -> Result<Arc<Self>> {
        if provision_builtins {
            for registry in builtin_registries() {
                if store.ensure_registry(&registry)? {
                    info!(registry = %registry.url, "provisioned built-in registry");
                }
            }
        }

        let manager = Arc::new(Self {
            client,
            store,
            settings,
            default_registry: default_registry.into(),
            registries: Mutex::new(HashMap::new()),
            cancel: parent.child_token(),
        });

        let rows = manager.store.list_registries()?;
        info!(count = rows.len(), "starting registry health tasks");
        for server in rows {
            manager.spawn_health_task(server);
        }

        Ok(manager)
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, ManagedRegistry>> {
        self.registries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn spawn_health_task(&self, server: RegistryServer) {
        let (tx, rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let cancel = self.cancel.child_token();
        let (task, health) = HealthTask::new(
            server.clone(),
            Arc::clone(&self.client),
            Arc::clone(&self.store),
            self.settings,
            rx,
            cancel.clone(),
        );

        let span = info_span!("registry_health", registry = %server.url);
        let handle = tokio::spawn(task.run().instrument(span));

        self.entries().insert(
            server.id.clone(),
            ManagedRegistry {
                server,
                health,
                commands: tx,
                task: handle,
                cancel,
            },
        );
    }

    /// URL to pull from for a logical registry.
    ///
    /// Docker Hub names resolve to the best healthy mirror (or the default
    /// upstream); explicit URLs pass through; other hosts get `https://`.
    pub fn best_url_for(&self, logical_registry: &str) -> String {
        if is_docker_hub_host(logical_registry) {
            return self
                .ranked()
                .into_iter()
                .next()
                .map(|r| r.server.url)
                .unwrap_or_else(|| self.default_registry.clone());
        }

        if logical_registry.starts_with("http://") || logical_registry.starts_with("https://") {
            logical_registry.trim_end_matches('/').to_string()
        } else {
            format!("https://{}", logical_registry.trim_end_matches('/'))
        }
    }

    /// Current ranking of healthy registries.
    pub fn ranked(&self) -> Vec<RankedRegistry> {
        rank(self.snapshot())
    }

    /// Every registry with its current health.
    pub fn snapshot(&self) -> Vec<(RegistryServer, RegistryHealth)> {
        let entries = self.entries();
        let mut all: Vec<_> = entries
            .values()
            .map(|m| (m.server.clone(), *m.health.borrow()))
            .collect();
        all.sort_by(|a, b| a.0.id.cmp(&b.0.id));
        all
    }

    pub fn health(&self, id: &str) -> Option<RegistryHealth> {
        self.entries().get(id).map(|m| *m.health.borrow())
    }

    /// Watches one registry's health.
    pub fn subscribe(&self, id: &str) -> Option<watch::Receiver<RegistryHealth>> {
        self.entries().get(id).map(|m| m.health.clone())
    }

    /// Adds a user mirror and starts tracking it.
    pub fn add_custom_mirror(
        &self,
        name: &str,
        url: &str,
        bearer_token: Option<String>,
        priority: Option<i32>,
    ) -> Result<RegistryServer> {
        let url = url.trim().trim_end_matches('/');
        if !(url.starts_with("http://") || url.starts_with("https://")) || url.len() <= "https://".len() {
            return Err(Error::InvalidRegistryUrl(url.to_string()));
        }

        let server = RegistryServer {
            id: uuid::Uuid::new_v4().to_string(),
            url: url.to_string(),
            name: name.trim().to_string(),
            bearer_token: bearer_token.filter(|t| !t.is_empty()),
            kind: RegistryKind::Custom,
            priority: priority.unwrap_or(DEFAULT_CUSTOM_PRIORITY),
        };

        self.store.insert_registry(&server)?;
        info!(registry = %server.url, id = %server.id, "custom mirror added");
        self.spawn_health_task(server.clone());
        Ok(server)
    }

    /// Removes a custom mirror: its task deletes the row and stops.
    pub async fn remove(&self, id: &str) -> Result<()> {
        let commands = {
            let entries = self.entries();
            let managed = entries
                .get(id)
                .ok_or_else(|| Error::RegistryNotFound(id.to_string()))?;
            if managed.server.is_builtin() {
                return Err(Error::BuiltinRegistry(id.to_string()));
            }
            managed.commands.clone()
        };

        request_remove(&commands).await?;

        let removed = self.entries().remove(id);
        if let Some(managed) = removed
            && tokio::time::timeout(Duration::from_secs(5), managed.task).await.is_err()
        {
            warn!(id, "health task did not stop in time");
            managed.cancel.cancel();
        }
        Ok(())
    }

    pub fn set_token(&self, id: &str, token: Option<String>) -> Result<()> {
        let token = token.filter(|t| !t.is_empty());
        self.store.set_registry_token(id, token.as_deref())?;
        if let Some(managed) = self.entries().get_mut(id) {
            managed.server.bearer_token = token;
        }
        Ok(())
    }

    pub fn set_priority(&self, id: &str, priority: i32) -> Result<()> {
        self.store.set_registry_priority(id, priority)?;
        if let Some(managed) = self.entries().get_mut(id) {
            managed.server.priority = priority;
        }
        Ok(())
    }

    /// Asks every health task to probe now without waiting.
    pub fn check_all(&self) {
        for managed in self.entries().values() {
            if managed.commands.try_send(HealthCommand::Check(None)).is_err() {
                warn!(registry = %managed.server.url, "health task busy, check skipped");
            }
        }
    }

    /// Probes every registry and waits for all results.
    pub async fn check_all_and_wait(&self) -> Vec<(RegistryServer, RegistryHealth)> {
        let pending: Vec<_> = {
            let entries = self.entries();
            entries
                .values()
                .map(|m| (m.server.clone(), m.commands.clone()))
                .collect()
        };

        let checks = pending.into_iter().map(|(server, commands)| async move {
            let (tx, rx) = oneshot::channel();
            if commands.send(HealthCommand::Check(Some(tx))).await.is_err() {
                return (server, RegistryHealth::Removed);
            }
            let state = rx.await.unwrap_or(RegistryHealth::Removed);
            (server, state)
        });

        let mut results = futures::future::join_all(checks).await;
        results.sort_by(|a, b| a.0.id.cmp(&b.0.id));
        results
    }

    /// Stops every health task.
    pub async fn shutdown(&self) {
        info!("Shutting down registry manager");
        self.cancel.cancel();

        let drained: Vec<ManagedRegistry> = self.entries().drain().map(|(_, m)| m).collect();
        for managed in drained {
            let _ = tokio::time::timeout(Duration::from_secs(5), managed.task).await;
        }
    }
}

impl Drop for RegistryManager {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
