//! Bootstrapping: finding the first peers to join the overlay through
//!
//! Every strategy answers the same question, "which addresses should this node
//! dial first?", and may keep a registration alive so that other nodes can
//! find this one.

mod http;
mod lease;

pub use http::HttpBootstrapper;
pub use lease::{LeaseBootstrapper, LeaseRecord, LeaseState, LeaseStore, MemoryLeaseStore};

use crate::Result;
use async_trait::async_trait;
use libp2p::multiaddr::Protocol;
use libp2p::{Multiaddr, PeerId};
use tokio_util::sync::CancellationToken;

/// Source of seed peers for the overlay
#[async_trait]
pub trait Bootstrapper: Send + Sync + 'static {
    /// Keep this node discoverable as a seed until `cancel` fires.
    ///
    /// `self_addr` is this node's overlay address including its `/p2p/` id.
    /// Returns `Ok(())` on cancellation.
    async fn run(&self, cancel: CancellationToken, self_addr: Multiaddr) -> Result<()>;

    /// Addresses to dial when joining. Called once at startup; an error is fatal.
    ///
    /// An empty list means this node is the first one.
    async fn seed_peers(
        &self,
        cancel: CancellationToken,
        self_addr: &Multiaddr,
    ) -> Result<Vec<Multiaddr>>;
}

/// Peer id embedded in a multiaddr, if any
pub fn peer_id_of(addr: &Multiaddr) -> Option<PeerId> {
    addr.iter().find_map(|protocol| match protocol {
        Protocol::P2p(peer_id) => Some(peer_id),
        _ => None,
    })
}

/// Remove addresses that point back at this node
pub(crate) fn without_self(peers: Vec<Multiaddr>, self_addr: &Multiaddr) -> Vec<Multiaddr> {
    let self_id = peer_id_of(self_addr);
    peers
        .into_iter()
        .filter(|addr| addr != self_addr && (self_id.is_none() || peer_id_of(addr) != self_id))
        .collect()
}

/// A fixed list of seed addresses
#[derive(Debug, Clone, Default)]
pub struct StaticBootstrapper {
    peers: Vec<Multiaddr>,
}

impl StaticBootstrapper {
    pub fn new(peers: Vec<Multiaddr>) -> Self {
        Self { peers }
    }
}

#[async_trait]
impl Bootstrapper for StaticBootstrapper {
    async fn run(&self, cancel: CancellationToken, _self_addr: Multiaddr) -> Result<()> {
        cancel.cancelled().await;
        Ok(())
    }

    async fn seed_peers(
        &self,
        _cancel: CancellationToken,
        self_addr: &Multiaddr,
    ) -> Result<Vec<Multiaddr>> {
        Ok(without_self(self.peers.clone(), self_addr))
    }
}
