//! Tag to digest bindings

use crate::oci::reference::is_latest_tag;
use crate::oci::{Digest, ImageName};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct TagBinding {
    digest: Digest,
    resolved_at: Instant,
}

/// Cache of tag resolutions consulted before a tag is looked up in the overlay.
///
/// Tags are treated as immutable and kept until replaced, except "latest"
/// tags when `resolve_latest` is on: those go stale after `latest_ttl` and
/// must be resolved again.
#[derive(Debug)]
pub struct TagCache {
    resolve_latest: bool,
    latest_ttl: Duration,
    bindings: RwLock<HashMap<String, TagBinding>>,
}

impl TagCache {
    pub fn new(resolve_latest: bool, latest_ttl: Duration) -> Self {
        Self {
            resolve_latest,
            latest_ttl,
            bindings: RwLock::new(HashMap::new()),
        }
    }

    /// Whether bindings of `tag` expire
    pub fn is_volatile(&self, tag: &str) -> bool {
        self.resolve_latest && is_latest_tag(tag)
    }

    /// Cached digest for a tagged name, if still fresh
    pub fn get(&self, name: &ImageName) -> Option<Digest> {
        let tag = name.tag.as_deref()?;
        let key = name.tag_key()?;
        let bindings = self.bindings.read();
        let binding = bindings.get(&key)?;
        if self.is_volatile(tag) && binding.resolved_at.elapsed() >= self.latest_ttl {
            return None;
        }
        Some(binding.digest.clone())
    }

    /// Record a resolution; returns true when the binding changed
    pub fn insert(&self, name: &ImageName, digest: Digest) -> bool {
        let Some(key) = name.tag_key() else {
            return false;
        };
        let mut bindings = self.bindings.write();
        let changed = bindings.get(&key).map_or(true, |b| b.digest != digest);
        bindings.insert(
            key,
            TagBinding {
                digest,
                resolved_at: Instant::now(),
            },
        );
        changed
    }

    /// Record a binding read from the local store.
    ///
    /// A "latest" tag that is not re-resolved keeps its first binding.
    pub fn refresh(&self, name: &ImageName, digest: Digest) -> bool {
        let pinned = name
            .tag
            .as_deref()
            .is_some_and(|tag| is_latest_tag(tag) && !self.resolve_latest);
        if pinned {
            if let Some(key) = name.tag_key() {
                if self.bindings.read().contains_key(&key) {
                    return false;
                }
            }
        }
        self.insert(name, digest)
    }

    pub fn remove(&self, tag_key: &str) {
        self.bindings.write().remove(tag_key);
    }

    pub fn len(&self) -> usize {
        self.bindings.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Result;

    #[tokio::test(start_paused = true)]
    async fn test_latest_goes_stale_when_resolving() -> Result<()> {
        let cache = TagCache::new(true, Duration::from_secs(60));
        let latest = ImageName::parse("alpine:latest")?;
        let pinned = ImageName::parse("alpine:3.18")?;

        cache.insert(&latest, Digest::sha256_of(b"one"));
        cache.insert(&pinned, Digest::sha256_of(b"two"));
        assert!(cache.get(&latest).is_some());

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(cache.get(&latest), None);
        assert_eq!(cache.get(&pinned), Some(Digest::sha256_of(b"two")));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_latest_is_static_when_not_resolving() -> Result<()> {
        let cache = TagCache::new(false, Duration::from_secs(60));
        let latest = ImageName::parse("myimage:latest")?;
        cache.insert(&latest, Digest::sha256_of(b"first"));

        tokio::time::advance(Duration::from_secs(3600)).await;
        assert_eq!(cache.get(&latest), Some(Digest::sha256_of(b"first")));
        assert!(!cache.is_volatile("latest"));

        // Local retags do not move a pinned latest binding
        assert!(!cache.refresh(&latest, Digest::sha256_of(b"second")));
        assert_eq!(cache.get(&latest), Some(Digest::sha256_of(b"first")));
        Ok(())
    }

    #[test]
    fn test_insert_reports_changes() -> Result<()> {
        let cache = TagCache::new(true, Duration::from_secs(60));
        let name = ImageName::parse("ghcr.io/org/app:v1")?;
        assert!(cache.insert(&name, Digest::sha256_of(b"a")));
        assert!(!cache.insert(&name, Digest::sha256_of(b"a")));
        assert!(cache.insert(&name, Digest::sha256_of(b"b")));

        // Untagged names are never cached
        assert!(!cache.insert(&ImageName::parse("alpine")?, Digest::sha256_of(b"c")));
        assert_eq!(cache.len(), 1);

        cache.remove("ghcr.io/org/app:v1");
        assert!(cache.is_empty());
        Ok(())
    }
}
