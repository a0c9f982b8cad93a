//! Per-registry health tracking.
//!
//! Each configured registry gets one long-lived [`HealthTask`]. The task is
//! the only writer of that registry's [`RegistryHealth`]; everyone else
//! observes it through a `watch` receiver.
//!
//! ```text
//!            tick / Check              probe ok
//!   ┌──────────────────────────┐   ┌──────────────► Healthy{latency, 0}
//!   │                          ▼   │
//! Healthy ──────────────► Checking ┤  probe failed, failures+1 < threshold
//! Unhealthy ─────────────►         ├──────────────► Healthy{last latency, failures+1}
//!                                  │  probe failed, failures+1 >= threshold
//!                                  └──────────────► Unhealthy
//!
//! Remove: any ──► Removing ──(row deleted)──► Removed (task exits)
//! ```

use super::client::RegistryApi;
use crate::error::{Error, Result};
use crate::store::{MetadataStore, RegistryServer};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Health of one registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryHealth {
    /// A probe is in flight; carries the failure count going into it.
    Checking { failures: u32 },
    /// Reachable, or not yet failed often enough to be demoted.
    Healthy { latency_ms: u64, failures: u32 },
    Unhealthy,
    Removing,
    Removed,
}

impl RegistryHealth {
    /// State entered when a check starts.
    ///
    /// An unhealthy registry re-enters with `threshold` failures so that a
    /// single success promotes it and a single failure keeps it demoted.
    pub fn begin_check(self, threshold: u32) -> Self {
        match self {
            RegistryHealth::Checking { failures } | RegistryHealth::Healthy { failures, .. } => {
                RegistryHealth::Checking { failures }
            }
            RegistryHealth::Unhealthy => RegistryHealth::Checking { failures: threshold },
            RegistryHealth::Removing | RegistryHealth::Removed => self,
        }
    }

    /// State after a probe finished.
    pub fn after_probe(
        self,
        outcome: std::result::Result<u64, ()>,
        last_latency: Option<u64>,
        threshold: u32,
    ) -> Self {
        let failures = match self {
            RegistryHealth::Checking { failures } | RegistryHealth::Healthy { failures, .. } => failures,
            RegistryHealth::Unhealthy => threshold,
            RegistryHealth::Removing | RegistryHealth::Removed => return self,
        };

        match outcome {
            Ok(latency_ms) => RegistryHealth::Healthy {
                latency_ms,
                failures: 0,
            },
            Err(()) => {
                let failures = failures.saturating_add(1);
                if failures >= threshold {
                    RegistryHealth::Unhealthy
                } else {
                    RegistryHealth::Healthy {
                        latency_ms: last_latency.unwrap_or(u64::MAX),
                        failures,
                    }
                }
            }
        }
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self, RegistryHealth::Healthy { .. })
    }

    pub fn is_checking(&self) -> bool {
        matches!(self, RegistryHealth::Checking { .. })
    }

    /// Short label for display.
    pub fn label(&self) -> &'static str {
        match self {
            RegistryHealth::Checking { .. } => "checking",
            RegistryHealth::Healthy { .. } => "healthy",
            RegistryHealth::Unhealthy => "unhealthy",
            RegistryHealth::Removing => "removing",
            RegistryHealth::Removed => "removed",
        }
    }
}

/// Requests sent to a health task.
#[derive(Debug)]
pub(crate) enum HealthCommand {
    /// Probe now; the sender, if any, receives the resulting state.
    Check(Option<oneshot::Sender<RegistryHealth>>),
    /// Delete the registry row and stop.
    Remove(oneshot::Sender<Result<()>>),
}

/// Probe scheduling parameters.
#[derive(Debug, Clone, Copy)]
pub struct HealthSettings {
    pub interval: Duration,
    pub probe_timeout: Duration,
    pub unhealthy_threshold: u32,
}

/// Long-lived health loop of one registry.
pub(crate) struct HealthTask {
    registry: RegistryServer,
    client: Arc<dyn RegistryApi>,
    store: Arc<MetadataStore>,
    settings: HealthSettings,
    state: watch::Sender<RegistryHealth>,
    commands: mpsc::Receiver<HealthCommand>,
    cancel: CancellationToken,
    last_latency: Option<u64>,
}

impl HealthTask {
    pub(crate) fn new(
        registry: RegistryServer,
        client: Arc<dyn RegistryApi>,
        store: Arc<MetadataStore>,
        settings: HealthSettings,
        commands: mpsc::Receiver<HealthCommand>,
        cancel: CancellationToken,
    ) -> (Self, watch::Receiver<RegistryHealth>) {
        let (state, rx) = watch::channel(RegistryHealth::Checking { failures: 0 });
        let task = Self {
            registry,
            client,
            store,
            settings,
            state,
            commands,
            cancel,
            last_latency: None,
        };
        (task, rx)
    }

    pub(crate) async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!(registry = %self.registry.url, "health task cancelled");
                    break;
                }
                _ = ticker.tick() => {
                    if !self.check().await {
                        break;
                    }
                }
                command = self.commands.recv() => match command {
                    Some(HealthCommand::Check(reply)) => {
                        let alive = self.check().await;
                        if let Some(reply) = reply {
                            let _ = reply.send(*self.state.borrow());
                        }
                        if !alive {
                            break;
                        }
                        ticker.reset();
                    }
                    Some(HealthCommand::Remove(reply)) => {
                        if self.remove(reply) {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
    }

    /// Runs one probe. Returns false when the task should stop.
    async fn check(&mut self) -> bool {
        let current = *self.state.borrow();
        if matches!(current, RegistryHealth::Removing | RegistryHealth::Removed) {
            return false;
        }

        match self.store.get_registry(&self.registry.id) {
            Ok(Some(_)) => {}
            Ok(None) => {
                info!(registry = %self.registry.url, "registry row gone, stopping health task");
                self.state.send_replace(RegistryHealth::Removed);
                return false;
            }
            Err(e) => warn!(registry = %self.registry.url, error = %e, "cannot read registry row"),
        }

        let threshold = self.settings.unhealthy_threshold;
        let checking = current.begin_check(threshold);
        self.state.send_replace(checking);

        let started = Instant::now();
        let outcome = match tokio::time::timeout(
            self.settings.probe_timeout,
            self.client.probe(&self.registry.url),
        )
        .await
        {
            Ok(Ok(())) => {
                let latency = started.elapsed().as_millis() as u64;
                self.last_latency = Some(latency);
                Ok(latency)
            }
            Ok(Err(e)) => {
                warn!(registry = %self.registry.url, error = %e, "registry probe failed");
                Err(())
            }
            Err(_) => {
                warn!(
                    registry = %self.registry.url,
                    timeout = ?self.settings.probe_timeout,
                    "registry probe timed out"
                );
                Err(())
            }
        };

        let next = checking.after_probe(outcome, self.last_latency, threshold);
        if next != current {
            debug!(registry = %self.registry.url, state = ?next, "registry health changed");
        }
        self.state.send_replace(next);
        true
    }

    /// Returns true when the registry is gone and the task should stop.
    fn remove(&mut self, reply: oneshot::Sender<Result<()>>) -> bool {
        let previous = self.state.send_replace(RegistryHealth::Removing);

        match self.store.delete_registry(&self.registry.id) {
            Ok(_) => {
                self.state.send_replace(RegistryHealth::Removed);
                info!(registry = %self.registry.url, "registry removed");
                let _ = reply.send(Ok(()));
                true
            }
            Err(e) => {
                self.state.send_replace(previous);
                let _ = reply.send(Err(e));
                false
            }
        }
    }
}

/// Sends a remove command and waits for the task's answer.
pub(crate) async fn request_remove(commands: &mpsc::Sender<HealthCommand>) -> Result<()> {
    let (tx, rx) = oneshot::channel();
    commands
        .send(HealthCommand::Remove(tx))
        .await
        .map_err(|_| Error::Internal("health task stopped".to_string()))?;
    rx.await
        .map_err(|_| Error::Internal("health task dropped remove request".to_string()))?
}
