//! Wire-format manifest handling.
//!
//! Manifests are decoded into the `oci-distribution` manifest model. Docker
//! v2 manifests and manifest lists share the OCI JSON shape closely enough
//! that the same types cover both.

use crate::constants::{MAX_LAYERS, OCI_IMAGE_MANIFEST_MEDIA_TYPE};
use crate::error::{Error, Result};
use crate::platform::Platform;
use crate::store::ImageConfig;
use oci_distribution::manifest::{ImageIndexEntry, OciImageIndex, OciImageManifest, OciManifest};
use serde::{Deserialize, Serialize};

/// The image config blob (`application/vnd.oci.image.config.v1+json`).
///
/// Only the parts the engine persists are decoded.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigBlob {
    pub architecture: Option<String>,
    pub os: Option<String>,
    pub created: Option<String>,
    pub config: Option<ImageConfig>,
}

/// Decodes a manifest response.
///
/// The `Content-Type` decides between a manifest list/index and a single
/// image manifest; when the header is missing or generic the body is
/// inspected for a `manifests` array.
pub fn parse_manifest(reference: &str, content_type: Option<&str>, body: &[u8]) -> Result<OciManifest> {
    let invalid = |reason: String| Error::Manifest {
        reference: reference.to_string(),
        reason,
    };

    let is_list = match content_type {
        Some(ct) if ct.contains("manifest.list") || ct.contains("image.index") => true,
        Some(ct) if ct.contains("manifest") => false,
        _ => {
            let value: serde_json::Value =
                serde_json::from_slice(body).map_err(|e| invalid(e.to_string()))?;
            value.get("manifests").is_some()
        }
    };

    if is_list {
        let index: OciImageIndex = serde_json::from_slice(body).map_err(|e| invalid(e.to_string()))?;
        if index.manifests.is_empty() {
            return Err(invalid("manifest list has no entries".to_string()));
        }
        Ok(OciManifest::ImageIndex(index))
    } else {
        let manifest: OciImageManifest =
            serde_json::from_slice(body).map_err(|e| invalid(e.to_string()))?;
        if manifest.layers.len() > MAX_LAYERS {
            return Err(invalid(format!(
                "image has {} layers, limit is {}",
                manifest.layers.len(),
                MAX_LAYERS
            )));
        }
        Ok(OciManifest::Image(manifest))
    }
}

/// Picks the manifest-list entry for `platform`.
///
/// Falls back to the first entry when nothing matches; returns `None` only
/// for an empty list.
pub fn select_platform_entry<'a>(index: &'a OciImageIndex, platform: &Platform) -> Option<&'a ImageIndexEntry> {
    index
        .manifests
        .iter()
        .find(|entry| {
            entry
                .platform
                .as_ref()
                .is_some_and(|p| platform.matches(&p.os, &p.architecture))
        })
        .or_else(|| index.manifests.first())
}

/// Media type of a manifest, defaulting to the OCI image manifest type.
pub fn manifest_media_type(manifest: &OciImageManifest) -> &str {
    manifest
        .media_type
        .as_deref()
        .unwrap_or(OCI_IMAGE_MANIFEST_MEDIA_TYPE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{Arch, Os};

    const DIGEST_A: &str = "sha256:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
    const DIGEST_B: &str = "sha256:bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";

    fn index_json() -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "schemaVersion": 2,
            "mediaType": "application/vnd.docker.distribution.manifest.list.v2+json",
            "manifests": [
                {
                    "mediaType": "application/vnd.docker.distribution.manifest.v2+json",
                    "digest": DIGEST_A,
                    "size": 528,
                    "platform": {"architecture": "amd64", "os": "linux"}
                },
                {
                    "mediaType": "application/vnd.docker.distribution.manifest.v2+json",
                    "digest": DIGEST_B,
                    "size": 528,
                    "platform": {"architecture": "arm64", "os": "linux", "variant": "v8"}
                }
            ]
        }))
        .unwrap()
    }

    #[test]
    fn test_parse_list_by_content_type() {
        let manifest = parse_manifest(
            "alpine",
            Some("application/vnd.docker.distribution.manifest.list.v2+json"),
            &index_json(),
        )
        .unwrap();
        assert!(matches!(manifest, OciManifest::ImageIndex(_)));
    }

    #[test]
    fn test_parse_list_by_body_shape() {
        let manifest = parse_manifest("alpine", Some("application/json"), &index_json()).unwrap();
        assert!(matches!(manifest, OciManifest::ImageIndex(_)));
    }

    #[test]
    fn test_select_platform_entry() {
        let OciManifest::ImageIndex(index) = parse_manifest("alpine", None, &index_json()).unwrap() else {
            panic!("expected index");
        };

        let arm = Platform::new(Os::Linux, Arch::Arm64);
        assert_eq!(select_platform_entry(&index, &arm).unwrap().digest, DIGEST_B);

        // No arm/v7 entry: first entry wins
        let arm32 = Platform::new(Os::Linux, Arch::Arm);
        assert_eq!(select_platform_entry(&index, &arm32).unwrap().digest, DIGEST_A);
    }

    #[test]
    fn test_parse_image_manifest() {
        let body = serde_json::to_vec(&serde_json::json!({
            "schemaVersion": 2,
            "mediaType": "application/vnd.oci.image.manifest.v1+json",
            "config": {"mediaType": "application/vnd.oci.image.config.v1+json", "digest": DIGEST_A, "size": 10},
            "layers": [
                {"mediaType": "application/vnd.oci.image.layer.v1.tar+gzip", "digest": DIGEST_B, "size": 20}
            ]
        }))
        .unwrap();

        let OciManifest::Image(image) =
            parse_manifest("alpine", Some("application/vnd.oci.image.manifest.v1+json"), &body).unwrap()
        else {
            panic!("expected image manifest");
        };
        assert_eq!(image.config.digest, DIGEST_A);
        assert_eq!(image.layers[0].size, 20);
    }

    #[test]
    fn test_config_blob_decodes() {
        let blob: ConfigBlob = serde_json::from_str(
            r#"{"architecture":"arm64","os":"linux","config":{"Cmd":["/bin/sh"],"WorkingDir":"/"},"rootfs":{"type":"layers"}}"#,
        )
        .unwrap();
        assert_eq!(blob.architecture.as_deref(), Some("arm64"));
        assert_eq!(blob.config.unwrap().working_dir.as_deref(), Some("/"));
    }
}
