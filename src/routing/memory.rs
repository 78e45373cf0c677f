//! In-process overlay with the same advertisement semantics as the DHT

use super::{ContentRouter, PeerRecord};
use crate::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Shared provider table. Every [`MemoryRouter`] attached to the same overlay
/// sees the same advertisements, each expiring after the overlay's TTL.
#[derive(Debug)]
pub struct MemoryOverlay {
    ttl: Duration,
    providers: Mutex<HashMap<String, HashMap<String, (PeerRecord, Instant)>>>,
}

impl MemoryOverlay {
    pub fn new(ttl: Duration) -> Arc<Self> {
        Arc::new(Self {
            ttl,
            providers: Mutex::new(HashMap::new()),
        })
    }

    /// Attach a node to the overlay
    pub fn router(self: &Arc<Self>, local: PeerRecord) -> MemoryRouter {
        MemoryRouter {
            overlay: self.clone(),
            local,
        }
    }

    /// Number of live advertisements for `key`
    pub fn provider_count(&self, key: &str) -> usize {
        let now = Instant::now();
        self.providers
            .lock()
            .get(key)
            .map(|peers| peers.values().filter(|(_, expires)| *expires > now).count())
            .unwrap_or(0)
    }
}

/// One node's view of a [`MemoryOverlay`]
#[derive(Debug, Clone)]
pub struct MemoryRouter {
    overlay: Arc<MemoryOverlay>,
    local: PeerRecord,
}

impl MemoryRouter {
    pub fn local(&self) -> &PeerRecord {
        &self.local
    }
}

#[async_trait]
impl ContentRouter for MemoryRouter {
    async fn advertise(&self, key: &str) -> Result<()> {
        let expires = Instant::now() + self.overlay.ttl;
        self.overlay
            .providers
            .lock()
            .entry(key.to_owned())
            .or_default()
            .insert(self.local.id.clone(), (self.local.clone(), expires));
        Ok(())
    }

    async fn lookup(&self, key: &str, max_peers: usize) -> Result<Vec<PeerRecord>> {
        let now = Instant::now();
        let mut providers = self.overlay.providers.lock();
        let Some(peers) = providers.get_mut(key) else {
            return Ok(Vec::new());
        };
        peers.retain(|_, (_, expires)| *expires > now);

        let mut live: Vec<&(PeerRecord, Instant)> = peers
            .values()
            .filter(|(peer, _)| peer.id != self.local.id)
            .collect();
        // Most recently refreshed first
        live.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.id.cmp(&b.0.id)));

        Ok(live
            .into_iter()
            .take(max_peers)
            .map(|(peer, _)| peer.clone())
            .collect())
    }

    fn is_ready(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_advertisements_expire_after_ttl() -> Result<()> {
        let overlay = MemoryOverlay::new(Duration::from_secs(60));
        let a = overlay.router(PeerRecord::new("a", "10.0.0.1", 5000));
        let b = overlay.router(PeerRecord::new("b", "10.0.0.2", 5000));

        a.advertise("sha256:aaa").await?;
        assert_eq!(b.lookup("sha256:aaa", 3).await?, vec![a.local().clone()]);

        tokio::time::advance(Duration::from_secs(30)).await;
        a.advertise("sha256:aaa").await?;
        tokio::time::advance(Duration::from_secs(45)).await;
        // Refreshed at t=30, so still live at t=75
        assert_eq!(b.lookup("sha256:aaa", 3).await?.len(), 1);

        tokio::time::advance(Duration::from_secs(20)).await;
        assert!(b.lookup("sha256:aaa", 3).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_lookup_excludes_self_and_deduplicates() -> Result<()> {
        let overlay = MemoryOverlay::new(Duration::from_secs(60));
        let a = overlay.router(PeerRecord::new("a", "10.0.0.1", 5000));
        let b = overlay.router(PeerRecord::new("b", "10.0.0.2", 5000));

        for _ in 0..5 {
            a.advertise("sha256:aaa").await?;
        }
        b.advertise("sha256:aaa").await?;

        assert_eq!(overlay.provider_count("sha256:aaa"), 2);
        assert_eq!(a.lookup("sha256:aaa", 10).await?, vec![b.local().clone()]);
        assert_eq!(b.lookup("sha256:aaa", 10).await?, vec![a.local().clone()]);
        assert!(b.lookup("sha256:missing", 10).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_lookup_respects_max_peers() -> Result<()> {
        let overlay = MemoryOverlay::new(Duration::from_secs(60));
        for i in 0..5 {
            overlay
                .router(PeerRecord::new(format!("p{i}"), "10.0.0.1", 5000 + i))
                .advertise("k")
                .await?;
        }
        let me = overlay.router(PeerRecord::new("me", "10.0.0.9", 5000));
        assert_eq!(me.lookup("k", 3).await?.len(), 3);
        Ok(())
    }
}
