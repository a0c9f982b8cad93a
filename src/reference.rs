//! Image reference parsing.
//!
//! Normalises user input such as `alpine`, `alpine:3.19`,
//! `ghcr.io/org/app@sha256:...` into an [`ImageReference`] using the
//! `oci-distribution` reference grammar (which applies the Docker Hub
//! `library/` convention).

use crate::constants::{DOCKER_HUB_REGISTRY, validate_image_reference};
use crate::error::{Error, Result};
use oci_distribution::Reference;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Tag assumed when a reference names none.
pub const DEFAULT_TAG: &str = "latest";

/// A parsed image reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageReference {
    /// Logical registry host, e.g. `docker.io` or `ghcr.io`.
    pub registry: String,
    /// Repository path, e.g. `library/alpine`.
    pub repository: String,
    /// Tag, `latest` when none was given.
    pub tag: String,
    /// Pinned manifest digest, if the reference carried one.
    pub digest: Option<String>,
}

impl ImageReference {
    /// Parses and validates a reference string.
    pub fn parse(input: &str) -> Result<Self> {
        validate_image_reference(input).map_err(|reason| Error::InvalidImageReference {
            reference: input.to_string(),
            reason: reason.to_string(),
        })?;

        let parsed = Reference::from_str(input).map_err(|e| Error::InvalidImageReference {
            reference: input.to_string(),
            reason: e.to_string(),
        })?;

        Ok(Self {
            registry: normalize_registry(parsed.registry()),
            repository: parsed.repository().to_string(),
            tag: parsed.tag().unwrap_or(DEFAULT_TAG).to_string(),
            digest: parsed.digest().map(str::to_string),
        })
    }

    /// Tag or digest to request from `/v2/<repo>/manifests/<reference>`.
    pub fn manifest_reference(&self) -> &str {
        self.digest.as_deref().unwrap_or(&self.tag)
    }

    /// `repository:tag`, the short name shown for images and containers.
    pub fn short_name(&self) -> String {
        format!("{}:{}", self.repository, self.tag)
    }

    /// True for references served by Docker Hub or its mirrors.
    pub fn is_docker_hub(&self) -> bool {
        is_docker_hub_host(&self.registry)
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)?;
        match &self.digest {
            Some(digest) => write!(f, "@{digest}"),
            None => write!(f, ":{}", self.tag),
        }
    }
}

impl FromStr for ImageReference {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// True when `host` names Docker Hub under any of its aliases.
pub fn is_docker_hub_host(host: &str) -> bool {
    let host = host
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .trim_end_matches('/');
    host == DOCKER_HUB_REGISTRY
        || host == "index.docker.io"
        || host == "registry-1.docker.io"
        || host.ends_with(".docker.io")
}

fn normalize_registry(registry: &str) -> String {
    if is_docker_hub_host(registry) {
        DOCKER_HUB_REGISTRY.to_string()
    } else {
        registry.to_string()
    }
}
