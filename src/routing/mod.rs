//! Content routing: which peers hold which content keys
//!
//! [`ContentRouter`] is the narrow contract the rest of the mirror depends on.
//! [`P2pRouter`] implements it over a libp2p Kademlia overlay; [`MemoryRouter`]
//! implements it over a shared in-process table.

pub mod behaviour;
pub mod bootstrap;
mod memory;
mod p2p;
pub mod storage;

pub use behaviour::MirrorBehaviour;
pub use bootstrap::Bootstrapper;
pub use memory::{MemoryOverlay, MemoryRouter};
pub use p2p::{P2pConfig, P2pRouter};
pub use storage::ProviderStore;

use crate::Result;
use async_trait::async_trait;
use std::fmt;

/// A peer that can serve content, and where its registry listens
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerRecord {
    /// Overlay identity of the peer
    pub id: String,
    /// Host (IP or DNS name) of the peer's registry endpoint
    pub host: String,
    /// Port of the peer's registry endpoint
    pub port: u16,
}

impl PeerRecord {
    pub fn new(id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            id: id.into(),
            host: host.into(),
            port,
        }
    }

    /// `host:port`, with IPv6 hosts bracketed
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Base URL of the peer's registry endpoint
    pub fn base_url(&self) -> String {
        format!("http://{}", self.authority())
    }
}

impl fmt::Display for PeerRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.authority())
    }
}

/// Advertisement and lookup of content keys in the overlay.
///
/// Keys are digest strings (`sha256:...`) or tag keys (`registry/repo:tag`).
#[async_trait]
pub trait ContentRouter: Send + Sync + 'static {
    /// Publish that this node serves `key`. Calling it again refreshes the TTL.
    async fn advertise(&self, key: &str) -> Result<()>;

    /// Up to `max_peers` current providers of `key`, never including this node.
    ///
    /// An empty result means no provider is currently known.
    async fn lookup(&self, key: &str, max_peers: usize) -> Result<Vec<PeerRecord>>;

    /// Whether the router has joined the overlay
    fn is_ready(&self) -> bool;
}
