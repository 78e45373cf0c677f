//! OCI content model: digests, references, descriptors and media types

pub mod digest;
pub mod reference;

pub use digest::{Algorithm, Digest, DigestVerifier};
pub use reference::{ImageName, ObjectKind, Reference, RegistryPath};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// OCI media types for manifest negotiation.
pub mod media_types {
    pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
    pub const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
    pub const DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
    pub const DOCKER_MANIFEST_LIST: &str =
        "application/vnd.docker.distribution.manifest.list.v2+json";
    pub const OCTET_STREAM: &str = "application/octet-stream";

    /// Media types accepted when fetching manifests from peers
    pub const MANIFEST_ACCEPT: &str = "application/vnd.oci.image.manifest.v1+json, \
        application/vnd.oci.image.index.v1+json, \
        application/vnd.docker.distribution.manifest.v2+json, \
        application/vnd.docker.distribution.manifest.list.v2+json";

    pub fn is_manifest(media_type: &str) -> bool {
        matches!(
            media_type,
            OCI_MANIFEST | OCI_INDEX | DOCKER_MANIFEST | DOCKER_MANIFEST_LIST
        )
    }
}

/// Annotation carrying the full image name of an index entry (containerd convention)
pub const ANNOTATION_IMAGE_NAME: &str = "io.containerd.image.name";
/// Annotation carrying the tag of an index entry (OCI image-layout convention)
pub const ANNOTATION_REF_NAME: &str = "org.opencontainers.image.ref.name";

/// Content descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub digest: Digest,
    pub size: u64,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub annotations: HashMap<String, String>,
}

/// OCI Image Index, also the shape of an image layout's `index.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageIndex {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(default)]
    pub manifests: Vec<Descriptor>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub annotations: HashMap<String, String>,
}

impl Default for ImageIndex {
    fn default() -> Self {
        Self {
            schema_version: 2,
            media_type: Some(media_types::OCI_INDEX.to_owned()),
            manifests: Vec::new(),
            annotations: HashMap::new(),
        }
    }
}

/// Only the field needed to label a stored manifest.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MediaTypeHint {
    #[serde(default)]
    media_type: Option<String>,
    #[serde(default)]
    manifests: Option<serde_json::Value>,
}

/// Determine the media type of a manifest document.
///
/// Returns `None` when the bytes are not a JSON manifest or index.
pub fn manifest_media_type(data: &[u8]) -> Option<String> {
    let hint: MediaTypeHint = serde_json::from_slice(data).ok()?;
    match hint.media_type {
        Some(media_type) if media_types::is_manifest(&media_type) => Some(media_type),
        Some(_) => None,
        None if hint.manifests.is_some() => Some(media_types::OCI_INDEX.to_owned()),
        None => Some(media_types::OCI_MANIFEST.to_owned()),
    }
}
