//! Local content source
//!
//! The mirror never owns image content. It reads whatever the node's container
//! runtime keeps on disk through [`ContentStore`], and learns about changes
//! through the store's event channel.

mod layout;

pub use layout::OciLayoutStore;

use crate::oci::{Digest, ImageName};
use crate::throttle::ByteStream;
use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::broadcast;

/// A tagged image known to the local store
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Image {
    pub name: ImageName,
    /// Digest of the manifest (or index) the name points to
    pub digest: Digest,
}

impl Image {
    /// Routing key of the image's tag, if it has one
    pub fn tag_key(&self) -> Option<String> {
        self.name.tag_key()
    }
}

/// Change notification emitted by a store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentEvent {
    /// A blob or manifest became available
    Created(Digest),
    /// An image name was bound to a manifest digest
    Tagged(Image),
    /// A blob or manifest was removed
    Deleted(Digest),
}

/// Access to the node's local image content
#[async_trait]
pub trait ContentStore: Send + Sync + 'static {
    /// Check that the store is reachable; failure is fatal at startup
    async fn verify(&self) -> Result<()>;

    /// All tagged images
    async fn list_images(&self) -> Result<Vec<Image>>;

    /// Digests of every manifest and blob that can be served right now
    async fn list_content(&self) -> Result<Vec<Digest>>;

    /// Current digest of a tagged image name, `None` if the tag is unknown
    async fn resolve(&self, name: &ImageName) -> Result<Option<Digest>>;

    /// Size of a stored object, `None` if it is absent
    async fn stat(&self, digest: &Digest) -> Result<Option<u64>>;

    /// Read a whole object into memory (manifests)
    async fn read(&self, digest: &Digest) -> Result<Bytes>;

    /// Stream an object (blobs)
    async fn open(&self, digest: &Digest) -> Result<ByteStream>;

    /// Subscribe to change notifications
    fn subscribe(&self) -> broadcast::Receiver<ContentEvent>;
}
