//! Image names and OCI Distribution API paths

use super::digest::Digest;
use crate::{Error, Result};
use std::fmt;

/// Registry assumed when a name carries no explicit host
pub const DEFAULT_REGISTRY: &str = "docker.io";

/// Tags that are expected to move and are re-resolved when configured to
pub fn is_latest_tag(tag: &str) -> bool {
    tag == "latest"
}

/// Routing key for a tag reference (`registry/repository:tag`)
pub fn tag_key(registry: &str, repository: &str, tag: &str) -> String {
    format!("{registry}/{repository}:{tag}")
}

/// A manifest reference: either a mutable tag or an immutable digest
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Reference {
    Tag(String),
    Digest(Digest),
}

impl Reference {
    /// Parse the `<reference>` segment of a manifest path
    pub fn parse(s: &str) -> Result<Self> {
        if s.contains(':') {
            return Ok(Reference::Digest(s.parse()?));
        }
        if !is_valid_tag(s) {
            return Err(Error::InvalidReference(format!("invalid tag: {s}")));
        }
        Ok(Reference::Tag(s.to_owned()))
    }

    pub fn digest(&self) -> Option<&Digest> {
        match self {
            Reference::Digest(d) => Some(d),
            Reference::Tag(_) => None,
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reference::Tag(t) => f.write_str(t),
            Reference::Digest(d) => write!(f, "{d}"),
        }
    }
}

/// Parsed image name, e.g. `docker.io/library/alpine:3.18`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageName {
    /// Registry host (e.g., "docker.io", "ghcr.io", "localhost:5000")
    pub registry: String,
    /// Repository path (e.g., "library/alpine")
    pub repository: String,
    /// Tag, if the name carries one
    pub tag: Option<String>,
    /// Digest, if the name is pinned
    pub digest: Option<Digest>,
}

impl ImageName {
    /// Parse an image name string.
    ///
    /// Handles formats like:
    /// - `alpine` -> docker.io/library/alpine (no tag)
    /// - `alpine:3.18` -> docker.io/library/alpine:3.18
    /// - `ghcr.io/owner/repo:tag` -> ghcr.io/owner/repo:tag
    /// - `localhost:5000/foo@sha256:...` -> localhost:5000/foo@sha256:...
    pub fn parse(image: &str) -> Result<Self> {
        let image = image.trim();
        if image.is_empty() {
            return Err(Error::InvalidReference("empty image name".to_owned()));
        }

        let (rest, digest) = match image.rsplit_once('@') {
            Some((rest, digest)) => (rest, Some(digest.parse::<Digest>()?)),
            None => (image, None),
        };

        // A colon after the last slash separates the tag; earlier colons belong to a port
        let (name, tag) = match rest.rfind(':') {
            Some(idx) if !rest[idx..].contains('/') => {
                (&rest[..idx], Some(rest[idx + 1..].to_owned()))
            }
            _ => (rest, None),
        };

        let (registry, repository) = match name.split_once('/') {
            Some((host, repo))
                if host.contains('.') || host.contains(':') || host == "localhost" =>
            {
                (host.to_owned(), repo.to_owned())
            }
            Some(_) => (DEFAULT_REGISTRY.to_owned(), name.to_owned()),
            None => (DEFAULT_REGISTRY.to_owned(), format!("library/{name}")),
        };

        if !is_valid_repository(&repository) {
            return Err(Error::InvalidReference(format!("invalid repository: {repository}")));
        }
        if let Some(tag) = &tag {
            if !is_valid_tag(tag) {
                return Err(Error::InvalidReference(format!("invalid tag: {tag}")));
            }
        }

        Ok(Self {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// Routing key for the tag of this name, if it has one
    pub fn tag_key(&self) -> Option<String> {
        self.tag
            .as_deref()
            .map(|tag| tag_key(&self.registry, &self.repository, tag))
    }
}

impl fmt::Display for ImageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{tag}")?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")?;
        }
        Ok(())
    }
}

/// Kind of object addressed by a registry path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Manifest,
    Blob,
}

impl ObjectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::Manifest => "manifests",
            ObjectKind::Blob => "blobs",
        }
    }
}

/// A parsed `/v2/<name>/(manifests|blobs)/<reference>` request path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryPath {
    pub repository: String,
    pub kind: ObjectKind,
    pub reference: Reference,
}

impl RegistryPath {
    /// Parse the part of the path following `/v2/`
    pub fn parse(path: &str) -> Result<Self> {
        let path = path.trim_matches('/');

        let (repository, kind, reference) = if let Some((repo, reference)) =
            path.rsplit_once("/manifests/")
        {
            (repo, ObjectKind::Manifest, Reference::parse(reference)?)
        } else if let Some((repo, reference)) = path.rsplit_once("/blobs/") {
            let digest = reference.parse::<Digest>().map_err(|_| {
                Error::InvalidDigest(format!("blobs must be addressed by digest: {reference}"))
            })?;
            (repo, ObjectKind::Blob, Reference::Digest(digest))
        } else {
            return Err(Error::Unsupported(format!("unsupported registry path: /v2/{path}")));
        };

        if !is_valid_repository(repository) {
            return Err(Error::InvalidReference(format!("invalid repository: {repository}")));
        }

        Ok(Self {
            repository: repository.to_owned(),
            kind,
            reference,
        })
    }

    /// Path of this object on a peer registry
    pub fn to_path(&self) -> String {
        format!("/v2/{}/{}/{}", self.repository, self.kind.as_str(), self.reference)
    }
}

fn is_valid_repository(repository: &str) -> bool {
    !repository.is_empty()
        && repository.split('/').all(|component| {
            let bytes = component.as_bytes();
            !bytes.is_empty()
                && bytes[0].is_ascii_alphanumeric()
                && bytes[bytes.len() - 1].is_ascii_alphanumeric()
                && component.chars().all(|c| {
                    c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-')
                })
        })
}

fn is_valid_tag(tag: &str) -> bool {
    let mut chars = tag.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphanumeric() || first == '_' => {}
        _ => return false,
    }
    tag.len() <= 128 && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}
