//! Bootstrap through a leader-elected rendezvous record
//!
//! All nodes compete for one named lease in a shared coordination store. The
//! holder writes its overlay address into the lease and keeps renewing it;
//! every node, holder included, reads the lease to learn whom to dial.

use super::{without_self, Bootstrapper};
use crate::{Error, Result};
use async_trait::async_trait;
use libp2p::Multiaddr;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Current rendezvous record of a lease
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseRecord {
    /// Candidate holding the lease
    pub holder: String,
    /// Overlay address published by the holder
    pub value: String,
}

/// Lease primitives of a coordination store
#[async_trait]
pub trait LeaseStore: Send + Sync + 'static {
    /// The unexpired record of `name`, if any
    async fn get(&self, name: &str) -> Result<Option<LeaseRecord>>;

    /// Acquire `name` for `holder`, or renew it if `holder` already has it.
    ///
    /// Returns `false` when another candidate holds an unexpired lease.
    async fn try_acquire(&self, name: &str, holder: &str, value: &str, ttl: Duration)
        -> Result<bool>;

    /// Give up `name` if `holder` holds it
    async fn release(&self, name: &str, holder: &str) -> Result<()>;
}

/// In-process lease store, for single-host clusters and tests
#[derive(Debug, Default)]
pub struct MemoryLeaseStore {
    leases: Mutex<HashMap<String, (LeaseRecord, Instant)>>,
}

impl MemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    async fn get(&self, name: &str) -> Result<Option<LeaseRecord>> {
        let leases = self.leases.lock();
        Ok(leases
            .get(name)
            .filter(|(_, expires)| *expires > Instant::now())
            .map(|(record, _)| record.clone()))
    }

    async fn try_acquire(
        &self,
        name: &str,
        holder: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool> {
        let now = Instant::now();
        let mut leases = self.leases.lock();
        if let Some((record, expires)) = leases.get(name) {
            if record.holder != holder && *expires > now {
                return Ok(false);
            }
        }
        leases.insert(
            name.to_owned(),
            (
                LeaseRecord {
                    holder: holder.to_owned(),
                    value: value.to_owned(),
                },
                now + ttl,
            ),
        );
        Ok(true)
    }

    async fn release(&self, name: &str, holder: &str) -> Result<()> {
        let mut leases = self.leases.lock();
        if leases.get(name).is_some_and(|(record, _)| record.holder == holder) {
            leases.remove(name);
        }
        Ok(())
    }
}

/// Leadership state of this node for the rendezvous lease
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseState {
    /// Another node (or nobody) holds the lease
    Follower,
    /// This node holds the lease and keeps it refreshed
    Leading,
    /// This node held the lease and failed to keep it
    LeaseLost,
}

/// Bootstrapper backed by a [`LeaseStore`]
pub struct LeaseBootstrapper {
    store: Arc<dyn LeaseStore>,
    name: String,
    lease_duration: Duration,
    startup_timeout: Duration,
    state: watch::Sender<LeaseState>,
}

impl LeaseBootstrapper {
    pub fn new(
        store: Arc<dyn LeaseStore>,
        name: impl Into<String>,
        lease_duration: Duration,
        startup_timeout: Duration,
    ) -> Self {
        let (state, _) = watch::channel(LeaseState::Follower);
        Self {
            store,
            name: name.into(),
            lease_duration,
            startup_timeout,
            state,
        }
    }

    /// Subscribe to leadership state changes
    pub fn subscribe(&self) -> watch::Receiver<LeaseState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> LeaseState {
        *self.state.borrow()
    }

    fn renew_interval(&self) -> Duration {
        self.lease_duration / 3
    }

    fn transition(&self, next: LeaseState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(lease = %self.name, ?previous, ?next, "lease state changed");
        }
    }
}

#[async_trait]
impl Bootstrapper for LeaseBootstrapper {
    async fn run(&self, cancel: CancellationToken, self_addr: Multiaddr) -> Result<()> {
        let holder = self_addr.to_string();
        let mut last_renewed: Option<Instant> = None;

        loop {
            match self
                .store
                .try_acquire(&self.name, &holder, &holder, self.lease_duration)
                .await
            {
                Ok(true) => {
                    if self.state() != LeaseState::Leading {
                        info!(lease = %self.name, "acquired rendezvous lease");
                    }
                    last_renewed = Some(Instant::now());
                    self.transition(LeaseState::Leading);
                }
                Ok(false) => {
                    if self.state() == LeaseState::Leading {
                        warn!(lease = %self.name, "rendezvous lease taken over by another node");
                        self.transition(LeaseState::LeaseLost);
                    }
                    last_renewed = None;
                    self.transition(LeaseState::Follower);
                }
                Err(e) => {
                    warn!(lease = %self.name, error = %e, "failed to renew rendezvous lease");
                    // The store may still hold our record until it expires
                    let expired = last_renewed
                        .map_or(true, |at| at.elapsed() >= self.lease_duration);
                    if expired && self.state() == LeaseState::Leading {
                        self.transition(LeaseState::LeaseLost);
                        self.transition(LeaseState::Follower);
                        last_renewed = None;
                    }
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.renew_interval()) => {}
            }
        }

        if self.state() == LeaseState::Leading {
            if let Err(e) = self.store.release(&self.name, &holder).await {
                warn!(lease = %self.name, error = %e, "failed to release rendezvous lease");
            }
            info!(lease = %self.name, "released rendezvous lease");
        }
        self.transition(LeaseState::Follower);
        Ok(())
    }

    async fn seed_peers(
        &self,
        cancel: CancellationToken,
        self_addr: &Multiaddr,
    ) -> Result<Vec<Multiaddr>> {
        let deadline = Instant::now() + self.startup_timeout;
        let mut backoff = Duration::from_millis(100);

        loop {
            match self.store.get(&self.name).await {
                Ok(Some(record)) => {
                    let addr: Multiaddr = record.value.parse().map_err(|e| {
                        Error::bootstrap(format!(
                            "rendezvous record holds an invalid address {:?}: {e}",
                            record.value
                        ))
                    })?;
                    debug!(lease = %self.name, holder = %record.holder, "found rendezvous record");
                    return Ok(without_self(vec![addr], self_addr));
                }
                Ok(None) => debug!(lease = %self.name, "no rendezvous holder yet"),
                Err(e) => warn!(lease = %self.name, error = %e, "failed to read rendezvous record"),
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(Error::bootstrap(format!(
                    "no rendezvous holder for lease {} within {:?}",
                    self.name, self.startup_timeout
                )));
            }

            let wait = backoff.min(deadline - now);
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(Error::bootstrap("cancelled while waiting for a rendezvous holder"));
                }
                _ = tokio::time::sleep(wait) => {}
            }
            backoff = (backoff * 2).min(Duration::from_secs(2));
        }
    }
}
