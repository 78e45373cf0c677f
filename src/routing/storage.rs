//! Kademlia record store tuned for content advertisements

use libp2p::kad::store::{Error as StoreError, RecordStore, Result as StoreResult};
use libp2p::kad::{ProviderRecord, Record, RecordKey};
use libp2p::PeerId;
use std::borrow::Cow;
use std::collections::HashMap;
use std::time::Instant;

/// Provider-focused record store.
///
/// Provider entries expire at their record's deadline and are filtered out on
/// read, so a node that stops advertising disappears within one TTL. Plain
/// values are accepted but bounded, since the mirror only publishes providers.
pub struct ProviderStore {
    local_peer_id: PeerId,
    /// Store for value records
    records: HashMap<RecordKey, Record>,
    /// Store for provider records, keyed by content key then provider
    providers: HashMap<RecordKey, HashMap<PeerId, ProviderRecord>>,
    /// Maximum number of value records to store
    max_records: usize,
    /// Maximum number of distinct keys with providers
    max_provider_keys: usize,
    /// Maximum number of providers per key
    max_providers_per_key: usize,
}

impl ProviderStore {
    pub fn new(local_peer_id: PeerId) -> Self {
        Self::with_limits(local_peer_id, 1_024, 100_000, 64)
    }

    /// Create with custom limits
    pub fn with_limits(
        local_peer_id: PeerId,
        max_records: usize,
        max_provider_keys: usize,
        max_providers_per_key: usize,
    ) -> Self {
        Self {
            local_peer_id,
            records: HashMap::new(),
            providers: HashMap::new(),
            max_records,
            max_provider_keys,
            max_providers_per_key,
        }
    }

    /// Drop expired provider and value records
    pub fn prune_expired(&mut self) -> usize {
        let now = Instant::now();
        let mut removed = 0;

        self.providers.retain(|_, providers| {
            let before = providers.len();
            providers.retain(|_, record| !record.is_expired(now));
            removed += before - providers.len();
            !providers.is_empty()
        });

        let before = self.records.len();
        self.records.retain(|_, record| !record.is_expired(now));
        removed += before - self.records.len();

        if removed > 0 {
            tracing::debug!(removed, "pruned expired routing records");
        }
        removed
    }

    /// Statistics about the store
    pub fn stats(&self) -> ProviderStoreStats {
        ProviderStoreStats {
            record_count: self.records.len(),
            provider_keys: self.providers.len(),
            provider_count: self.providers.values().map(HashMap::len).sum(),
            provided_count: self.provided().count(),
        }
    }
}

/// Statistics about the provider store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderStoreStats {
    pub record_count: usize,
    pub provider_keys: usize,
    pub provider_count: usize,
    /// Keys this node itself provides
    pub provided_count: usize,
}

impl RecordStore for ProviderStore {
    type RecordsIter<'a> = std::vec::IntoIter<Cow<'a, Record>>;

    type ProvidedIter<'a> = std::vec::IntoIter<Cow<'a, ProviderRecord>>;

    fn get(&self, key: &RecordKey) -> Option<Cow<'_, Record>> {
        self.records
            .get(key)
            .filter(|record| !record.is_expired(Instant::now()))
            .map(Cow::Borrowed)
    }

    fn put(&mut self, record: Record) -> StoreResult<()> {
        if self.records.len() >= self.max_records && !self.records.contains_key(&record.key) {
            self.prune_expired();
            if self.records.len() >= self.max_records {
                return Err(StoreError::MaxRecords);
            }
        }
        self.records.insert(record.key.clone(), record);
        Ok(())
    }

    fn remove(&mut self, key: &RecordKey) {
        self.records.remove(key);
    }

    fn records(&self) -> Self::RecordsIter<'_> {
        self.records
            .values()
            .map(Cow::Borrowed)
            .collect::<Vec<_>>()
            .into_iter()
    }

    fn add_provider(&mut self, record: ProviderRecord) -> StoreResult<()> {
        if !self.providers.contains_key(&record.key)
            && self.providers.len() >= self.max_provider_keys
        {
            self.prune_expired();
            if self.providers.len() >= self.max_provider_keys {
                return Err(StoreError::MaxProvidedKeys);
            }
        }

        let providers = self.providers.entry(record.key.clone()).or_default();

        if providers.len() >= self.max_providers_per_key && !providers.contains_key(&record.provider) {
            // Evict the entry closest to expiry, never our own
            let local = self.local_peer_id;
            let evict = providers
                .values()
                .filter(|p| p.provider != local)
                .min_by_key(|p| p.expires)
                .map(|p| p.provider);
            match evict {
                Some(peer) => {
                    providers.remove(&peer);
                    tracing::debug!(%peer, "evicted provider to make space");
                }
                None => return Err(StoreError::MaxProvidedKeys),
            }
        }

        // Re-adding the same provider only refreshes its entry
        providers.insert(record.provider, record);
        Ok(())
    }

    fn providers(&self, key: &RecordKey) -> Vec<ProviderRecord> {
        let now = Instant::now();
        let mut providers: Vec<ProviderRecord> = self
            .providers
            .get(key)
            .map(|providers| {
                providers
                    .values()
                    .filter(|record| !record.is_expired(now))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        // Most recently refreshed first
        providers.sort_by(|a, b| b.expires.cmp(&a.expires));
        providers
    }

    fn provided(&self) -> Self::ProvidedIter<'_> {
        self.providers
            .values()
            .filter_map(|providers| providers.get(&self.local_peer_id))
            .map(Cow::Borrowed)
            .collect::<Vec<_>>()
            .into_iter()
    }

    fn remove_provider(&mut self, key: &RecordKey, provider: &PeerId) {
        if let Some(providers) = self.providers.get_mut(key) {
            providers.remove(provider);
            if providers.is_empty() {
                self.providers.remove(key);
            }
        }
    }
}
