//! Content store backed by an OCI image-layout directory

use super::{ContentEvent, ContentStore, Image};
use crate::oci::{
    self, Algorithm, Descriptor, Digest, ImageIndex, ImageName,
    ANNOTATION_IMAGE_NAME, ANNOTATION_REF_NAME,
};
use crate::throttle::ByteStream;
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{broadcast, Mutex};
use tokio_util::io::ReaderStream;

const INDEX_FILE: &str = "index.json";
const LAYOUT_FILE: &str = "oci-layout";
const LAYOUT_VERSION: &str = r#"{"imageLayoutVersion":"1.0.0"}"#;
const TMP_PREFIX: &str = ".tmp-";
const EVENT_CAPACITY: usize = 256;

/// Reads `index.json` and `blobs/<alg>/<hex>` from an image-layout directory.
///
/// Image names come from the `io.containerd.image.name` annotation, or from
/// `org.opencontainers.image.ref.name` when it holds a full name.
pub struct OciLayoutStore {
    root: PathBuf,
    /// Serializes rewrites of index.json
    index_lock: Mutex<()>,
    events: broadcast::Sender<ContentEvent>,
    tmp_counter: AtomicU64,
}

impl OciLayoutStore {
    /// Open an existing layout. Nothing is read until the first call.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            root: root.into(),
            index_lock: Mutex::new(()),
            events,
            tmp_counter: AtomicU64::new(0),
        }
    }

    /// Create an empty layout at `root` (or reuse one that exists)
    pub async fn create(root: impl Into<PathBuf>) -> Result<Self> {
        let store = Self::new(root);
        tokio::fs::create_dir_all(store.root.join("blobs").join(Algorithm::Sha256.as_str()))
            .await?;

        let layout = store.root.join(LAYOUT_FILE);
        if tokio::fs::metadata(&layout).await.is_err() {
            tokio::fs::write(&layout, LAYOUT_VERSION).await?;
        }
        let index = store.root.join(INDEX_FILE);
        if tokio::fs::metadata(&index).await.is_err() {
            store.write_index(&ImageIndex::default()).await?;
        }
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.root
            .join("blobs")
            .join(digest.algorithm().as_str())
            .join(digest.encoded())
    }

    /// Store `data` under its sha256 digest
    pub async fn import_blob(&self, data: &[u8]) -> Result<Digest> {
        let digest = Digest::sha256_of(data);
        self.write_blob(&digest, data).await?;
        Ok(digest)
    }

    /// Store `data` after checking it against `digest`
    pub async fn import_verified(&self, digest: &Digest, data: &[u8]) -> Result<()> {
        digest.verify(data)?;
        self.write_blob(digest, data).await
    }

    async fn write_blob(&self, digest: &Digest, data: &[u8]) -> Result<()> {
        let path = self.blob_path(digest);
        if tokio::fs::metadata(&path).await.is_ok() {
            return Ok(());
        }

        let dir = path
            .parent()
            .ok_or_else(|| Error::store(format!("invalid blob path {}", path.display())))?;
        tokio::fs::create_dir_all(dir).await?;

        // Write then rename so readers never observe a partial blob
        let tmp = dir.join(format!(
            "{TMP_PREFIX}{}-{}",
            digest.encoded(),
            self.tmp_counter.fetch_add(1, Ordering::Relaxed)
        ));
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, &path).await?;

        tracing::debug!(digest = %digest, bytes = data.len(), "imported blob");
        let _ = self.events.send(ContentEvent::Created(digest.clone()));
        Ok(())
    }

    /// Bind an image name to a stored manifest
    pub async fn tag_image(&self, name: &ImageName, digest: &Digest) -> Result<()> {
        let manifest = self.read(digest).await?;
        let media_type = oci::manifest_media_type(&manifest)
            .ok_or_else(|| Error::store(format!("{digest} is not a manifest")))?;
        let full_name = name.to_string();

        let _guard = self.index_lock.lock().await;
        let mut index = self.read_index().await?;
        index
            .manifests
            .retain(|d| d.annotations.get(ANNOTATION_IMAGE_NAME) != Some(&full_name));

        let mut descriptor = Descriptor {
            media_type,
            digest: digest.clone(),
            size: manifest.len() as u64,
            annotations: Default::default(),
        };
        descriptor
            .annotations
            .insert(ANNOTATION_IMAGE_NAME.to_owned(), full_name);
        if let Some(tag) = &name.tag {
            descriptor
                .annotations
                .insert(ANNOTATION_REF_NAME.to_owned(), tag.clone());
        }
        index.manifests.push(descriptor);
        self.write_index(&index).await?;

        tracing::debug!(image = %name, digest = %digest, "tagged image");
        let _ = self.events.send(ContentEvent::Tagged(Image {
            name: name.clone(),
            digest: digest.clone(),
        }));
        Ok(())
    }

    /// Remove a stored object and any index entries pointing at it
    pub async fn delete(&self, digest: &Digest) -> Result<()> {
        {
            let _guard = self.index_lock.lock().await;
            let mut index = self.read_index().await?;
            let before = index.manifests.len();
            index.manifests.retain(|d| &d.digest != digest);
            if index.manifests.len() != before {
                self.write_index(&index).await?;
            }
        }

        match tokio::fs::remove_file(self.blob_path(digest)).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        }
        let _ = self.events.send(ContentEvent::Deleted(digest.clone()));
        Ok(())
    }

    async fn read_index(&self) -> Result<ImageIndex> {
        match tokio::fs::read(self.root.join(INDEX_FILE)).await {
            Ok(data) => Ok(serde_json::from_slice(&data)?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(ImageIndex::default()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_index(&self, index: &ImageIndex) -> Result<()> {
        let data = serde_json::to_vec_pretty(index)?;
        let tmp = self.root.join(format!(
            "{TMP_PREFIX}index-{}",
            self.tmp_counter.fetch_add(1, Ordering::Relaxed)
        ));
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, self.root.join(INDEX_FILE)).await?;
        Ok(())
    }
}

fn image_name(descriptor: &Descriptor) -> Option<ImageName> {
    if let Some(name) = descriptor.annotations.get(ANNOTATION_IMAGE_NAME) {
        return ImageName::parse(name).ok();
    }
    // A bare tag carries no repository and cannot be routed
    descriptor
        .annotations
        .get(ANNOTATION_REF_NAME)
        .filter(|r| r.contains('/'))
        .and_then(|r| ImageName::parse(r).ok())
}

#[async_trait]
impl ContentStore for OciLayoutStore {
    async fn verify(&self) -> Result<()> {
        let layout = tokio::fs::read(self.root.join(LAYOUT_FILE))
            .await
            .map_err(|e| {
                Error::store(format!(
                    "no OCI image layout at {}: {e}",
                    self.root.display()
                ))
            })?;
        let value: serde_json::Value = serde_json::from_slice(&layout)?;
        if value.get("imageLayoutVersion").is_none() {
            return Err(Error::store(format!(
                "{} is missing imageLayoutVersion",
                self.root.join(LAYOUT_FILE).display()
            )));
        }
        self.read_index().await?;
        Ok(())
    }

    async fn list_images(&self) -> Result<Vec<Image>> {
        let index = self.read_index().await?;
        let images = index
            .manifests
            .iter()
            .filter_map(|descriptor| {
                let name = image_name(descriptor)?;
                name.tag.as_ref()?;
                Some(Image {
                    name,
                    digest: descriptor.digest.clone(),
                })
            })
            .collect();
        Ok(images)
    }

    async fn list_content(&self) -> Result<Vec<Digest>> {
        let mut digests = Vec::new();
        for algorithm in [Algorithm::Sha256, Algorithm::Sha512] {
            let dir = self.root.join("blobs").join(algorithm.as_str());
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let file_name = entry.file_name();
                let Some(encoded) = file_name.to_str() else {
                    continue;
                };
                if encoded.starts_with(TMP_PREFIX) {
                    continue;
                }
                match format!("{}:{encoded}", algorithm.as_str()).parse::<Digest>() {
                    Ok(digest) => digests.push(digest),
                    Err(_) => tracing::debug!(file = %entry.path().display(), "skipping non-blob file"),
                }
            }
        }
        digests.sort();
        Ok(digests)
    }

    async fn resolve(&self, name: &ImageName) -> Result<Option<Digest>> {
        let images = self.list_images().await?;
        Ok(images
            .into_iter()
            .find(|image| {
                image.name.registry == name.registry
                    && image.name.repository == name.repository
                    && image.name.tag == name.tag
            })
            .map(|image| image.digest))
    }

    async fn stat(&self, digest: &Digest) -> Result<Option<u64>> {
        match tokio::fs::metadata(self.blob_path(digest)).await {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn read(&self, digest: &Digest) -> Result<Bytes> {
        match tokio::fs::read(self.blob_path(digest)).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(Error::not_found(digest.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn open(&self, digest: &Digest) -> Result<ByteStream> {
        match tokio::fs::File::open(self.blob_path(digest)).await {
            Ok(file) => Ok(ReaderStream::new(file).boxed()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(Error::not_found(digest.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<ContentEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oci::media_types;

    fn manifest(layer: &Digest) -> Vec<u8> {
        serde_json::json!({
            "schemaVersion": 2,
            "mediaType": media_types::OCI_MANIFEST,
            "config": {
                "mediaType": "application/vnd.oci.image.config.v1+json",
                "digest": layer.to_string(),
                "size": 5
            },
            "layers": []
        })
        .to_string()
        .into_bytes()
    }

    #[tokio::test]
    async fn test_import_tag_and_resolve() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = OciLayoutStore::create(dir.path()).await?;
        store.verify().await?;
        let mut events = store.subscribe();

        let layer = store.import_blob(b"layer").await?;
        let manifest_digest = store.import_blob(&manifest(&layer)).await?;
        let name = ImageName::parse("docker.io/library/alpine:3.18")?;
        store.tag_image(&name, &manifest_digest).await?;

        assert_eq!(events.recv().await.ok(), Some(ContentEvent::Created(layer.clone())));
        assert_eq!(
            events.recv().await.ok(),
            Some(ContentEvent::Created(manifest_digest.clone()))
        );
        assert!(matches!(events.recv().await, Ok(ContentEvent::Tagged(_))));

        let content = store.list_content().await?;
        assert_eq!(content.len(), 2);
        assert!(content.contains(&layer));

        let images = store.list_images().await?;
        assert_eq!(images.len(), 1);
        assert_eq!(
            images[0].tag_key().as_deref(),
            Some("docker.io/library/alpine:3.18")
        );
        assert_eq!(store.resolve(&name).await?, Some(manifest_digest.clone()));
        assert_eq!(store.stat(&layer).await?, Some(5));

        let body: Vec<Bytes> = store
            .open(&layer)
            .await?
            .map(|c| c.map_err(Error::from))
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .collect::<Result<_>>()?;
        assert_eq!(body.concat(), b"layer");
        Ok(())
    }

    #[tokio::test]
    async fn test_retag_replaces_binding() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = OciLayoutStore::create(dir.path()).await?;
        let layer = store.import_blob(b"layer").await?;
        let first = store.import_blob(&manifest(&layer)).await?;
        let other = store.import_blob(b"other").await?;
        let second = store.import_blob(&manifest(&other)).await?;

        let name = ImageName::parse("ghcr.io/org/app:latest")?;
        store.tag_image(&name, &first).await?;
        store.tag_image(&name, &second).await?;

        assert_eq!(store.list_images().await?.len(), 1);
        assert_eq!(store.resolve(&name).await?, Some(second));
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_content() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = OciLayoutStore::create(dir.path()).await?;
        let digest = Digest::sha256_of(b"absent");

        assert_eq!(store.stat(&digest).await?, None);
        assert!(store.read(&digest).await.is_err_and(|e| e.is_not_found()));
        assert!(store.open(&digest).await.is_err_and(|e| e.is_not_found()));

        let name = ImageName::parse("alpine:edge")?;
        assert_eq!(store.resolve(&name).await?, None);

        // Tagging requires a stored manifest
        let blob = store.import_blob(b"not json").await?;
        assert!(store.tag_image(&name, &blob).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_delete_removes_content_and_tags() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = OciLayoutStore::create(dir.path()).await?;
        let layer = store.import_blob(b"layer").await?;
        let manifest_digest = store.import_blob(&manifest(&layer)).await?;
        store
            .tag_image(&ImageName::parse("alpine:3.18")?, &manifest_digest)
            .await?;

        store.delete(&manifest_digest).await?;
        assert!(store.list_images().await?.is_empty());
        assert_eq!(store.list_content().await?, vec![layer]);
        // Deleting again is a no-op
        store.delete(&manifest_digest).await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_verify_fails_without_layout() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = OciLayoutStore::new(dir.path().join("missing"));
        assert!(matches!(store.verify().await, Err(Error::Store(_))));
        Ok(())
    }
}
