//! Mirror measurements

use crate::Error;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for mirror requests. Exposition is left to the embedding process.
#[derive(Debug, Default)]
pub struct MirrorMetrics {
    requests: AtomicU64,
    local_hits: AtomicU64,
    peer_hits: AtomicU64,
    not_found: AtomicU64,
    unavailable: AtomicU64,
    errors: AtomicU64,
    peer_attempts: AtomicU64,
    peer_failures: AtomicU64,
    blob_bytes: AtomicU64,
}

/// Point-in-time copy of [`MirrorMetrics`]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub requests: u64,
    pub local_hits: u64,
    pub peer_hits: u64,
    pub not_found: u64,
    pub unavailable: u64,
    pub errors: u64,
    pub peer_attempts: u64,
    pub peer_failures: u64,
    pub blob_bytes: u64,
}

impl MirrorMetrics {
    pub fn request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn local_hit(&self) {
        self.local_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn peer_hit(&self) {
        self.peer_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn peer_attempt(&self) {
        self.peer_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn peer_failure(&self) {
        self.peer_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn blob_bytes(&self, bytes: usize) {
        self.blob_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Count a failed request under its outcome
    pub fn failure(&self, err: &Error) {
        let counter = match err {
            Error::NotFound(_) => &self.not_found,
            Error::UpstreamUnavailable { .. } | Error::DeadlineExceeded { .. } => &self.unavailable,
            _ => &self.errors,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            local_hits: self.local_hits.load(Ordering::Relaxed),
            peer_hits: self.peer_hits.load(Ordering::Relaxed),
            not_found: self.not_found.load(Ordering::Relaxed),
            unavailable: self.unavailable.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            peer_attempts: self.peer_attempts.load(Ordering::Relaxed),
            peer_failures: self.peer_failures.load(Ordering::Relaxed),
            blob_bytes: self.blob_bytes.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failures_are_classified() {
        let metrics = MirrorMetrics::default();
        metrics.failure(&Error::not_found("sha256:aaa"));
        metrics.failure(&Error::DeadlineExceeded {
            key: "k".into(),
            attempts: 2,
            timeout_ms: 5000,
        });
        metrics.failure(&Error::store("disk gone"));
        metrics.blob_bytes(10);
        metrics.blob_bytes(5);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.not_found, 1);
        assert_eq!(snapshot.unavailable, 1);
        assert_eq!(snapshot.errors, 1);
        assert_eq!(snapshot.blob_bytes, 15);
    }
}
