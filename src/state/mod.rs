//! Keeps the overlay's view of this node in line with the local store.
//!
//! Every cycle the tracker enumerates the store, diffs the result against
//! what it advertised last time, and publishes the difference. Advertisements
//! are never withdrawn explicitly: keys that disappear locally are simply not
//! refreshed and expire from the overlay after their TTL. Store events trigger
//! an early reconcile so new content becomes discoverable without waiting for
//! the next tick.

mod tags;

pub use tags::TagCache;

use crate::routing::ContentRouter;
use crate::store::{ContentEvent, ContentStore};
use crate::Result;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;

/// How much of the current set a reconcile publishes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileMode {
    /// Advertise every key, refreshing TTLs
    Full,
    /// Advertise only keys not advertised before
    Changed,
}

/// Outcome of one reconcile cycle
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub added: usize,
    pub refreshed: usize,
    pub removed: usize,
    pub failed: usize,
}

/// Difference between two advertised sets
#[derive(Debug, Default, PartialEq, Eq)]
pub struct KeyDiff {
    pub added: Vec<String>,
    pub retained: Vec<String>,
    pub removed: Vec<String>,
}

/// Compare the previously advertised keys with the current ones
pub fn diff_keys(previous: &HashSet<String>, current: &BTreeSet<String>) -> KeyDiff {
    let mut diff = KeyDiff::default();
    for key in current {
        if previous.contains(key) {
            diff.retained.push(key.clone());
        } else {
            diff.added.push(key.clone());
        }
    }
    let mut removed: Vec<String> = previous
        .iter()
        .filter(|key| !current.contains(*key))
        .cloned()
        .collect();
    removed.sort();
    diff.removed = removed;
    diff
}

pub struct Tracker {
    store: Arc<dyn ContentStore>,
    router: Arc<dyn ContentRouter>,
    tags: Arc<TagCache>,
    interval: Duration,
    advertised: Mutex<HashSet<String>>,
}

impl Tracker {
    pub fn new(
        store: Arc<dyn ContentStore>,
        router: Arc<dyn ContentRouter>,
        tags: Arc<TagCache>,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            router,
            tags,
            interval,
            advertised: Mutex::new(HashSet::new()),
        }
    }

    pub fn tags(&self) -> &Arc<TagCache> {
        &self.tags
    }

    /// Keys the last reconcile left advertised
    pub fn advertised(&self) -> BTreeSet<String> {
        self.advertised.lock().iter().cloned().collect()
    }

    /// Keys this node could serve right now: every stored digest plus the tag
    /// key of each image whose manifest is present.
    async fn current_keys(&self) -> Result<BTreeSet<String>> {
        let content: HashSet<_> = self.store.list_content().await?.into_iter().collect();
        let images = self.store.list_images().await?;

        let mut keys: BTreeSet<String> = content.iter().map(|d| d.to_string()).collect();
        for image in images {
            if !content.contains(&image.digest) {
                tracing::debug!(image = %image.name, "skipping image with missing manifest");
                continue;
            }
            if let Some(key) = image.tag_key() {
                if self.tags.refresh(&image.name, image.digest.clone()) {
                    tracing::debug!(tag = %key, digest = %image.digest, "tag binding updated");
                }
                keys.insert(key);
            }
        }
        Ok(keys)
    }

    /// Run one diff-and-publish cycle.
    ///
    /// Fails only when the store cannot be enumerated; individual advertise
    /// failures are counted and retried next cycle.
    pub async fn reconcile(&self, mode: ReconcileMode) -> Result<ReconcileReport> {
        let current = self.current_keys().await?;
        let previous = self.advertised.lock().clone();
        let diff = diff_keys(&previous, &current);

        let mut report = ReconcileReport {
            removed: diff.removed.len(),
            ..Default::default()
        };
        let mut next: HashSet<String> = diff.retained.iter().cloned().collect();

        for key in &diff.added {
            match self.router.advertise(key).await {
                Ok(()) => {
                    report.added += 1;
                    next.insert(key.clone());
                }
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(key = %key, error = %e, "failed to advertise key");
                }
            }
        }

        if mode == ReconcileMode::Full {
            for key in &diff.retained {
                match self.router.advertise(key).await {
                    Ok(()) => report.refreshed += 1,
                    Err(e) => {
                        report.failed += 1;
                        tracing::warn!(key = %key, error = %e, "failed to refresh key");
                    }
                }
            }
        }

        for key in &diff.removed {
            // Tag keys always carry a registry path, digests never do
            if key.contains('/') {
                self.tags.remove(key);
            }
            tracing::debug!(key = %key, "no longer advertising key");
        }

        *self.advertised.lock() = next;
        Ok(report)
    }

    /// Reconcile on every tick and on store events until cancelled.
    ///
    /// Errors are logged and never end the loop.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let mut events = Some(self.store.subscribe());
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        tracing::info!(interval_secs = self.interval.as_secs(), "state tracker started");
        loop {
            let mode = tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => ReconcileMode::Full,
                event = next_event(events.as_mut()) => match event {
                    Ok(event) => {
                        tracing::trace!(?event, "content event");
                        ReconcileMode::Changed
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "content events lagged");
                        ReconcileMode::Changed
                    }
                    Err(RecvError::Closed) => {
                        tracing::warn!("content event channel closed, relying on periodic reconcile");
                        events = None;
                        continue;
                    }
                },
            };

            match self.reconcile(mode).await {
                Ok(report) => {
                    if report.added + report.removed + report.failed > 0 {
                        tracing::info!(
                            added = report.added,
                            refreshed = report.refreshed,
                            removed = report.removed,
                            failed = report.failed,
                            "reconciled advertisements"
                        );
                    } else {
                        tracing::debug!(refreshed = report.refreshed, "reconciled advertisements");
                    }
                }
                Err(e) => tracing::warn!(error = %e, "reconcile failed"),
            }
        }

        tracing::info!("state tracker stopped");
        Ok(())
    }
}

async fn next_event(
    events: Option<&mut broadcast::Receiver<ContentEvent>>,
) -> std::result::Result<ContentEvent, RecvError> {
    match events {
        Some(events) => events.recv().await,
        None => std::future::pending().await,
    }
}
