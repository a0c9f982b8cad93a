//! Rows of the metadata store and the value types embedded in them.

use crate::constants::{DEFAULT_CMD, DEFAULT_HOSTNAME, DEFAULT_USER, DEFAULT_WORKING_DIR};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// =============================================================================
// Registries
// =============================================================================

/// Whether a registry ships with the engine or was added by the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistryKind {
    Builtin,
    Custom,
}

impl RegistryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RegistryKind::Builtin => "builtin",
            RegistryKind::Custom => "custom",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "builtin" => Some(RegistryKind::Builtin),
            "custom" => Some(RegistryKind::Custom),
            _ => None,
        }
    }
}

/// A configured registry or mirror.
///
/// Only `bearer_token` and `priority` change after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryServer {
    pub id: String,
    /// Base URL without trailing slash, e.g. `https://mirror.example.com`.
    pub url: String,
    pub name: String,
    pub bearer_token: Option<String>,
    pub kind: RegistryKind,
    /// Higher wins when latency and failure counts tie.
    pub priority: i32,
}

impl RegistryServer {
    pub fn is_builtin(&self) -> bool {
        self.kind == RegistryKind::Builtin
    }
}

// =============================================================================
// Layers and images
// =============================================================================

/// A verified layer in the cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerRecord {
    /// sha256 hex of the compressed archive, no algorithm prefix.
    pub id: String,
    pub size: u64,
    pub media_type: String,
    pub downloaded: bool,
}

/// Runtime defaults an image declares in its config blob.
///
/// Field names follow the Docker/OCI `config` object so the blob section
/// deserializes directly.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ImageConfig {
    pub cmd: Option<Vec<String>>,
    pub entrypoint: Option<Vec<String>>,
    /// `KEY=VALUE` entries in declaration order.
    pub env: Option<Vec<String>>,
    pub working_dir: Option<String>,
    pub user: Option<String>,
    pub exposed_ports: Option<BTreeMap<String, serde_json::Value>>,
    pub labels: Option<BTreeMap<String, String>>,
}

/// A fully downloaded image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRecord {
    /// sha256 hex of the config blob.
    pub id: String,
    pub registry: String,
    pub repository: String,
    pub tag: String,
    pub architecture: String,
    pub os: String,
    /// Sum of compressed layer sizes.
    pub size: u64,
    /// Layer ids, base layer first.
    pub layer_ids: Vec<String>,
    pub config: ImageConfig,
    pub created: DateTime<Utc>,
}

impl ImageRecord {
    /// `repository:tag`.
    pub fn short_name(&self) -> String {
        format!("{}:{}", self.repository, self.tag)
    }
}

// =============================================================================
// Containers
// =============================================================================

/// A host path bound into the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeBinding {
    pub host_path: String,
    pub container_path: String,
    #[serde(default)]
    pub read_only: bool,
}

/// Container settings supplied by the caller.
///
/// `Default` yields the sentinel values `cmd = ["/bin/sh"]`,
/// `working_dir = "/"` and `user = "root"`. A field still equal to its
/// sentinel at create time is treated as "not overridden" and replaced by
/// the image's value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    pub cmd: Vec<String>,
    pub entrypoint: Option<Vec<String>>,
    pub env: BTreeMap<String, String>,
    pub working_dir: String,
    pub user: String,
    pub hostname: String,
    pub binds: Vec<VolumeBinding>,
    /// Container port (`80/tcp`) to host port.
    pub port_bindings: BTreeMap<String, String>,
    pub network_enabled: bool,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            cmd: vec![DEFAULT_CMD.to_string()],
            entrypoint: None,
            env: BTreeMap::new(),
            working_dir: DEFAULT_WORKING_DIR.to_string(),
            user: DEFAULT_USER.to_string(),
            hostname: DEFAULT_HOSTNAME.to_string(),
            binds: Vec::new(),
            port_bindings: BTreeMap::new(),
            network_enabled: false,
        }
    }
}

impl ContainerConfig {
    pub fn is_default_cmd(&self) -> bool {
        self.cmd.len() == 1 && self.cmd[0] == DEFAULT_CMD
    }

    pub fn is_default_working_dir(&self) -> bool {
        self.working_dir == DEFAULT_WORKING_DIR
    }

    pub fn is_default_user(&self) -> bool {
        self.user == DEFAULT_USER
    }
}

/// A created container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerRecord {
    pub id: String,
    pub name: String,
    pub image_id: String,
    /// `repository:tag` of the image at create time.
    pub image_name: String,
    pub created_at: DateTime<Utc>,
    /// Config after merging with the image defaults.
    pub config: ContainerConfig,
    pub last_run_at: Option<DateTime<Utc>>,
}
