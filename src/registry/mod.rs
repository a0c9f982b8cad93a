//! # Registry Access
//!
//! Everything that talks to OCI/Docker v2 registries:
//!
//! - [`client`]: the [`RegistryApi`] seam and its `reqwest` implementation
//!   with bearer-token exchange.
//! - [`manifest`]: manifest/manifest-list decoding and platform selection.
//! - [`health`]: the per-registry health state machine and task.
//! - [`manager`]: mirror ranking and `best_url_for`.
//! - [`search`]: Docker Hub repository search.
//!
//! ## Registry Endpoints Used
//!
//! | Request | Purpose |
//! |---------|---------|
//! | `GET /v2/` | health probe (200 or 401 = reachable) |
//! | `GET /v2/<repo>/manifests/<tag\|digest>` | manifest or manifest list |
//! | `GET /v2/<repo>/blobs/<digest>` | config blob and layer blobs |
//! | `GET /v2/<repo>/tags/list?n=..&last=..` | one page of tags |
//! | `GET <realm>?service=..&scope=repository:<repo>:pull` | bearer token |

pub mod client;
pub mod health;
pub mod manager;
pub mod manifest;
pub mod search;

pub use client::{BearerChallenge, HttpRegistryClient, ProgressFn, RegistryApi, TagPage};
pub use health::{HealthSettings, RegistryHealth};
pub use manager::{RankedRegistry, RegistryManager, builtin_registries, rank};
pub use manifest::{ConfigBlob, parse_manifest, select_platform_entry};
pub use search::{SearchClient, SearchPage, SearchResult};
