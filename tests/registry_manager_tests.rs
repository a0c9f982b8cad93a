//! Tests for mirror health tracking and selection.
//!
//! Validates ranking order, health state transitions driven by probes,
//! `best_url_for` fallbacks, and custom mirror management.

mod common;

use burrow::constants::{DAOCLOUD_MIRROR_ID, DOCKER_HUB_REGISTRY_ID};
use burrow::registry::{HealthSettings, RegistryApi, rank};
use burrow::{ErrorKind, MetadataStore, RegistryHealth, RegistryKind, RegistryManager, RegistryServer};
use common::{FakeRegistry, TEST_REGISTRY_URL};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const THRESHOLD: u32 = 3;

fn settings() -> HealthSettings {
    HealthSettings {
        interval: Duration::from_secs(3600),
        probe_timeout: Duration::from_secs(2),
        unhealthy_threshold: THRESHOLD,
    }
}

fn start(registry: &Arc<FakeRegistry>, store: &Arc<MetadataStore>, builtins: bool) -> Arc<RegistryManager> {
    RegistryManager::start(
        Arc::clone(registry) as Arc<dyn RegistryApi>,
        Arc::clone(store),
        settings(),
        TEST_REGISTRY_URL,
        builtins,
        &CancellationToken::new(),
    )
    .unwrap()
}

/// Waits until the registry's first probe has finished.
async fn settled(manager: &RegistryManager, id: &str) -> RegistryHealth {
    let mut rx = manager.subscribe(id).unwrap();
    let state = tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|h| !h.is_checking()))
        .await
        .expect("probe should finish")
        .unwrap();
    *state
}

fn server(id: &str, priority: i32) -> RegistryServer {
    RegistryServer {
        id: id.to_string(),
        url: format!("https://{id}.mirror.test"),
        name: id.to_string(),
        bearer_token: None,
        kind: RegistryKind::Custom,
        priority,
    }
}

// =============================================================================
// Ranking
// =============================================================================

#[test]
fn test_ranking_latency_then_failures_then_priority() {
    let ranked = rank(vec![
        (
            server("A", 5),
            RegistryHealth::Healthy {
                latency_ms: 10,
                failures: 0,
            },
        ),
        (
            server("B", 9),
            RegistryHealth::Healthy {
                latency_ms: 10,
                failures: 1,
            },
        ),
        (
            server("C", 1),
            RegistryHealth::Healthy {
                latency_ms: 5,
                failures: 0,
            },
        ),
    ]);

    let order: Vec<&str> = ranked.iter().map(|r| r.server.id.as_str()).collect();
    assert_eq!(order, vec!["C", "A", "B"]);
}

#[test]
fn test_ranking_is_deterministic_on_full_ties() {
    let healthy = RegistryHealth::Healthy {
        latency_ms: 7,
        failures: 0,
    };
    let forward = rank(vec![(server("x", 1), healthy), (server("y", 1), healthy)]);
    let backward = rank(vec![(server("y", 1), healthy), (server("x", 1), healthy)]);
    assert_eq!(forward, backward);
    assert_eq!(forward[0].server.id, "x");
}

// =============================================================================
// best_url_for
// =============================================================================

#[tokio::test]
async fn test_best_url_falls_back_to_default() {
    let registry = FakeRegistry::new();
    let store = Arc::new(MetadataStore::open_in_memory().unwrap());
    let manager = start(&registry, &store, false);

    assert_eq!(manager.best_url_for("docker.io"), TEST_REGISTRY_URL);
    assert_eq!(manager.best_url_for("ghcr.io"), "https://ghcr.io");
    assert_eq!(manager.best_url_for("http://localhost:5000/"), "http://localhost:5000");
}

#[tokio::test]
async fn test_best_url_prefers_higher_priority_mirror() {
    let registry = FakeRegistry::new();
    let store = Arc::new(MetadataStore::open_in_memory().unwrap());
    let manager = start(&registry, &store, false);

    let low = manager
        .add_custom_mirror("low", "https://low.mirror.test", None, Some(10))
        .unwrap();
    let high = manager
        .add_custom_mirror("high", "https://high.mirror.test/", None, Some(90))
        .unwrap();
    assert_eq!(high.url, "https://high.mirror.test", "trailing slash trimmed");

    settled(&manager, &low.id).await;
    settled(&manager, &high.id).await;

    // Fake probes answer instantly, so both measure 0ms and priority decides
    assert_eq!(manager.best_url_for("docker.io"), "https://high.mirror.test");
    assert_eq!(manager.best_url_for("ghcr.io"), "https://ghcr.io", "non-hub hosts bypass mirrors");
}

// =============================================================================
// Health Transitions
// =============================================================================

#[tokio::test]
async fn test_failures_demote_then_success_promotes() {
    let registry = FakeRegistry::new();
    let store = Arc::new(MetadataStore::open_in_memory().unwrap());
    let manager = start(&registry, &store, false);

    let url = "https://flaky.mirror.test";
    registry.fail_probes(url, true);
    let mirror = manager.add_custom_mirror("flaky", url, None, None).unwrap();

    assert_eq!(
        settled(&manager, &mirror.id).await,
        RegistryHealth::Healthy {
            latency_ms: u64::MAX,
            failures: 1
        },
        "one failure keeps the mirror in rotation"
    );

    manager.check_all_and_wait().await;
    assert_eq!(
        manager.health(&mirror.id),
        Some(RegistryHealth::Healthy {
            latency_ms: u64::MAX,
            failures: 2
        })
    );

    manager.check_all_and_wait().await;
    assert_eq!(manager.health(&mirror.id), Some(RegistryHealth::Unhealthy));
    assert!(manager.ranked().is_empty());
    assert_eq!(manager.best_url_for("docker.io"), TEST_REGISTRY_URL);

    registry.fail_probes(url, false);
    let results = manager.check_all_and_wait().await;
    assert_eq!(results.len(), 1);
    assert!(results[0].1.is_healthy());
    assert_eq!(manager.best_url_for("docker.io"), url);
}

#[tokio::test]
async fn test_failing_mirror_ranks_below_healthy_one() {
    let registry = FakeRegistry::new();
    let store = Arc::new(MetadataStore::open_in_memory().unwrap());
    let manager = start(&registry, &store, false);

    let bad_url = "https://bad.mirror.test";
    registry.fail_probes(bad_url, true);
    let bad = manager.add_custom_mirror("bad", bad_url, None, Some(100)).unwrap();
    let good = manager
        .add_custom_mirror("good", "https://good.mirror.test", None, Some(1))
        .unwrap();
    settled(&manager, &bad.id).await;
    settled(&manager, &good.id).await;

    let ranked = manager.ranked();
    assert_eq!(ranked.len(), 2);
    assert_eq!(ranked[0].server.id, good.id);
    assert_eq!(ranked[1].failures, 1);
}

// =============================================================================
// Mirror Management
// =============================================================================

#[tokio::test]
async fn test_builtins_provisioned_and_protected() {
    let registry = FakeRegistry::new();
    let store = Arc::new(MetadataStore::open_in_memory().unwrap());
    let manager = start(&registry, &store, true);

    let ids: Vec<String> = manager.snapshot().into_iter().map(|(s, _)| s.id).collect();
    assert!(ids.contains(&DOCKER_HUB_REGISTRY_ID.to_string()));
    assert!(ids.contains(&DAOCLOUD_MIRROR_ID.to_string()));

    let err = manager.remove(DOCKER_HUB_REGISTRY_ID).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert!(store.get_registry(DOCKER_HUB_REGISTRY_ID).unwrap().is_some());
}

#[tokio::test]
async fn test_remove_custom_mirror() {
    let registry = FakeRegistry::new();
    let store = Arc::new(MetadataStore::open_in_memory().unwrap());
    let manager = start(&registry, &store, false);

    let mirror = manager
        .add_custom_mirror("temp", "https://temp.mirror.test", Some("secret".into()), None)
        .unwrap();
    let mut health = manager.subscribe(&mirror.id).unwrap();
    assert_eq!(store.get_registry(&mirror.id).unwrap().unwrap().bearer_token.as_deref(), Some("secret"));

    manager.remove(&mirror.id).await.unwrap();

    assert!(store.get_registry(&mirror.id).unwrap().is_none());
    assert!(manager.health(&mirror.id).is_none());
    health
        .wait_for(|h| *h == RegistryHealth::Removed)
        .await
        .expect("task publishes Removed before exiting");

    let err = manager.remove(&mirror.id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_invalid_mirror_url_rejected() {
    let registry = FakeRegistry::new();
    let store = Arc::new(MetadataStore::open_in_memory().unwrap());
    let manager = start(&registry, &store, false);

    for url in ["ftp://mirror.test", "mirror.test", "https://"] {
        let err = manager.add_custom_mirror("bad", url, None, None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput, "url {url:?} should be rejected");
    }
    assert!(manager.snapshot().is_empty());
}

#[tokio::test]
async fn test_mirrors_reload_on_restart() {
    let registry = FakeRegistry::new();
    let store = Arc::new(MetadataStore::open_in_memory().unwrap());

    let first = start(&registry, &store, false);
    let mirror = first
        .add_custom_mirror("kept", "https://kept.mirror.test", None, Some(70))
        .unwrap();
    first.set_priority(&mirror.id, 80).unwrap();
    first.shutdown().await;

    let second = start(&registry, &store, false);
    let snapshot = second.snapshot();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].0.url, "https://kept.mirror.test");
    assert_eq!(snapshot[0].0.priority, 80);
    second.shutdown().await;
}
