//! Engine configuration.
//!
//! [`EngineConfig::default`] gives a working setup rooted in the user's
//! local data directory; [`EngineConfig::from_env`] layers `BURROW_*`
//! environment overrides on top.

use crate::constants::{
    APP_DIR, CONTAINERS_DIR, DATABASE_FILE, DEFAULT_HEALTH_CHECK_INTERVAL,
    DEFAULT_MAX_CONCURRENT_DOWNLOADS, DEFAULT_PROBE_TIMEOUT, DEFAULT_PULL_TIMEOUT,
    DEFAULT_REGISTRY_URL, DEFAULT_UNHEALTHY_THRESHOLD, DOCKER_HUB_SEARCH_URL, LAYERS_DIR,
};
use crate::platform::Platform;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Root directory holding the database, layer cache and rootfs trees.
    pub root: PathBuf,

    // Registry health
    pub health_check_interval: Duration,
    pub probe_timeout: Duration,
    pub unhealthy_threshold: u32,
    /// Upstream used when no mirror is healthy.
    pub default_registry: String,
    /// Provision the built-in registries on startup.
    pub builtin_registries: bool,
    /// Repository search endpoint.
    pub search_url: String,

    // Pulls
    pub max_concurrent_downloads: usize,
    pub pull_timeout: Duration,
    /// Platform used to pick an entry from manifest lists.
    pub platform: Platform,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            root: Self::default_root(),
            health_check_interval: DEFAULT_HEALTH_CHECK_INTERVAL,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            unhealthy_threshold: DEFAULT_UNHEALTHY_THRESHOLD,
            default_registry: DEFAULT_REGISTRY_URL.to_string(),
            builtin_registries: true,
            search_url: DOCKER_HUB_SEARCH_URL.to_string(),
            max_concurrent_downloads: DEFAULT_MAX_CONCURRENT_DOWNLOADS,
            pull_timeout: DEFAULT_PULL_TIMEOUT,
            platform: Platform::detect(),
        }
    }
}

impl EngineConfig {
    /// Configuration rooted at `root` with every other value defaulted.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    /// Reads overrides from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Reads overrides through `lookup`, which returns the raw value for a
    /// variable name.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(root) = lookup("BURROW_ROOT") {
            config.root = PathBuf::from(root);
        }

        if let Some(registry) = lookup("BURROW_DEFAULT_REGISTRY") {
            config.default_registry = registry.trim_end_matches('/').to_string();
        }

        if let Some(url) = lookup("BURROW_SEARCH_URL") {
            config.search_url = url;
        }

        let health_secs = parse_or("BURROW_HEALTH_INTERVAL_SECS", &lookup, config.health_check_interval.as_secs());
        config.health_check_interval = Duration::from_secs(health_secs.max(1));

        let probe_secs = parse_or("BURROW_PROBE_TIMEOUT_SECS", &lookup, config.probe_timeout.as_secs());
        config.probe_timeout = Duration::from_secs(probe_secs.max(1));

        config.unhealthy_threshold =
            parse_or("BURROW_UNHEALTHY_THRESHOLD", &lookup, config.unhealthy_threshold).max(1);

        config.max_concurrent_downloads =
            parse_or("BURROW_MAX_CONCURRENT_DOWNLOADS", &lookup, config.max_concurrent_downloads)
                .max(1);

        let pull_secs = parse_or("BURROW_PULL_TIMEOUT_SECS", &lookup, config.pull_timeout.as_secs());
        config.pull_timeout = Duration::from_secs(pull_secs.max(1));

        if let Some(flag) = lookup("BURROW_BUILTIN_REGISTRIES") {
            config.builtin_registries = !matches!(flag.as_str(), "0" | "false" | "no");
        }

        config
    }

    fn default_root() -> PathBuf {
        if let Some(data) = dirs::data_local_dir() {
            data.join(APP_DIR)
        } else {
            PathBuf::from(format!(".{APP_DIR}"))
        }
    }

    pub fn database_path(&self) -> PathBuf {
        self.root.join(DATABASE_FILE)
    }

    pub fn layers_dir(&self) -> PathBuf {
        self.root.join(LAYERS_DIR)
    }

    pub fn containers_dir(&self) -> PathBuf {
        self.root.join(CONTAINERS_DIR)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

fn parse_or<T>(key: &str, lookup: &impl Fn(&str) -> Option<String>, default: T) -> T
where
    T: std::str::FromStr,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(key, value = %raw, "ignoring unparsable configuration value");
            default
        }),
        None => default,
    }
}
