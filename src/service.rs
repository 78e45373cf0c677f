//! Process wiring: builds every component from a [`MirrorConfig`] and
//! supervises the long-running loops.
//!
//! The content router, the state tracker, and the registry endpoint run as
//! sibling tasks under one cancellation token. The first task to fail cancels
//! the rest; tasks still running after the shutdown timeout are aborted.

use crate::config::{BootstrapConfig, BootstrapKind, MirrorConfig};
use crate::registry::{self, MirrorMetrics, Resolver, ResolverConfig};
use crate::routing::bootstrap::{
    Bootstrapper, HttpBootstrapper, LeaseBootstrapper, LeaseStore, StaticBootstrapper,
};
use crate::routing::{ContentRouter, P2pConfig, P2pRouter};
use crate::state::{TagCache, Tracker};
use crate::store::{ContentStore, OciLayoutStore};
use crate::throttle::Limiter;
use crate::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// A configured mirror node
pub struct MirrorService {
    config: MirrorConfig,
    store: Arc<dyn ContentStore>,
    lease_store: Option<Arc<dyn LeaseStore>>,
    metrics: Arc<MirrorMetrics>,
    cancel: CancellationToken,
}

impl MirrorService {
    /// Mirror backed by the OCI layout at `config.content_dir`
    pub fn new(config: MirrorConfig) -> Self {
        let store = Arc::new(OciLayoutStore::new(config.content_dir.clone()));
        Self::with_store(config, store)
    }

    pub fn with_store(config: MirrorConfig, store: Arc<dyn ContentStore>) -> Self {
        Self {
            config,
            store,
            lease_store: None,
            metrics: Arc::new(MirrorMetrics::default()),
            cancel: CancellationToken::new(),
        }
    }

    /// Coordination store shared by all nodes, required by the lease strategy
    pub fn with_lease_store(mut self, lease_store: Arc<dyn LeaseStore>) -> Self {
        self.lease_store = Some(lease_store);
        self
    }

    /// Token that stops the service when cancelled
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn metrics(&self) -> &Arc<MirrorMetrics> {
        &self.metrics
    }

    /// Run until cancelled or until a component fails
    pub async fn run(&self) -> Result<()> {
        let config = &self.config;
        config.validate_for(self.lease_store.is_some())?;
        self.store
            .verify()
            .await
            .map_err(|e| Error::store(format!("local content store is unusable: {e}")))?;

        let listener = TcpListener::bind(config.registry_addr).await?;
        let (registry_host, registry_port) =
            registry_endpoint(config.local_addr.as_deref(), listener.local_addr()?.port());

        let bootstrapper = build_bootstrapper(
            &config.bootstrap,
            config.seed_multiaddrs()?,
            self.lease_store.clone(),
        )?;
        let mut p2p = P2pConfig::new(config.router_multiaddr()?, registry_port);
        p2p.registry_host = registry_host;
        p2p.provider_ttl = config.advertise_ttl();
        p2p.lookup_timeout = config.resolve_timeout();
        let router = Arc::new(P2pRouter::new(p2p, bootstrapper).await?);
        let content_router: Arc<dyn ContentRouter> = router.clone();

        let tags = Arc::new(TagCache::new(
            config.resolve_latest_tag,
            config.advertise_interval(),
        ));
        let tracker = Arc::new(Tracker::new(
            self.store.clone(),
            content_router.clone(),
            tags.clone(),
            config.advertise_interval(),
        ));

        let limiter = config.blob_speed.and_then(Limiter::new);
        if let Some(limiter) = &limiter {
            info!(rate = %limiter.rate(), "blob bandwidth limited");
        }
        let resolver = Arc::new(
            Resolver::new(
                self.store.clone(),
                content_router,
                tags,
                ResolverConfig::from_config(config),
            )?
            .with_limiter(limiter)
            .with_metrics(self.metrics.clone()),
        );

        info!(
            peer_id = %router.local_peer_id(),
            registry = %config.registry_addr,
            router = %config.router_addr,
            "mirror starting"
        );

        let mut tasks: JoinSet<(&'static str, Result<()>)> = JoinSet::new();
        {
            let router = router.clone();
            let cancel = self.cancel.clone();
            tasks.spawn(async move { ("router", router.run(cancel).await) });
        }
        {
            let tracker = tracker.clone();
            let cancel = self.cancel.clone();
            tasks.spawn(async move { ("tracker", tracker.run(cancel).await) });
        }
        {
            let cancel = self.cancel.clone();
            tasks.spawn(async move { ("registry", registry::serve(listener, resolver, cancel).await) });
        }

        let mut outcome = Ok(());
        tokio::select! {
            _ = self.cancel.cancelled() => info!("shutdown requested"),
            Some(joined) = tasks.join_next() => record_exit(joined, &mut outcome),
        }
        self.cancel.cancel();

        let deadline = Instant::now() + config.shutdown_timeout();
        loop {
            match tokio::time::timeout_at(deadline, tasks.join_next()).await {
                Ok(Some(joined)) => record_exit(joined, &mut outcome),
                Ok(None) => break,
                Err(_) => {
                    warn!(remaining = tasks.len(), "shutdown timed out, aborting tasks");
                    tasks.abort_all();
                    break;
                }
            }
        }

        router.close()?;
        info!("mirror stopped");
        outcome
    }
}

fn record_exit(
    joined: std::result::Result<(&'static str, Result<()>), tokio::task::JoinError>,
    outcome: &mut Result<()>,
) {
    let failure = match joined {
        Ok((task, Ok(()))) => {
            info!(task, "task exited");
            None
        }
        Ok((task, Err(e))) => {
            error!(task, error = %e, "task failed");
            Some(e)
        }
        Err(e) => {
            error!(error = %e, "task panicked");
            Some(Error::other(format!("task panicked: {e}")))
        }
    };
    if let Some(e) = failure {
        if outcome.is_ok() {
            *outcome = Err(e);
        }
    }
}

/// Host and port peers should use to reach this node's registry.
///
/// An explicit `local_addr` wins; otherwise the host is learned from the
/// overlay connection and the bound port is used.
pub fn registry_endpoint(local_addr: Option<&str>, bound_port: u16) -> (Option<String>, u16) {
    let Some((host, port)) = local_addr.and_then(|addr| addr.rsplit_once(':')) else {
        return (None, bound_port);
    };
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let port = port.parse().unwrap_or(bound_port);
    if host.is_empty() {
        (None, port)
    } else {
        (Some(host.to_owned()), port)
    }
}

/// Build the configured bootstrap strategy.
///
/// The lease strategy elects its rendezvous holder in `lease_store`, which
/// every node of the cluster must share.
pub fn build_bootstrapper(
    config: &BootstrapConfig,
    seeds: Vec<libp2p::Multiaddr>,
    lease_store: Option<Arc<dyn LeaseStore>>,
) -> Result<Arc<dyn Bootstrapper>> {
    let bootstrapper: Arc<dyn Bootstrapper> = match config.kind {
        BootstrapKind::Static => Arc::new(StaticBootstrapper::new(seeds)),
        BootstrapKind::Http => Arc::new(HttpBootstrapper::new(
            config.http_addr,
            config.http_peer.clone(),
            Duration::from_secs(config.http_timeout_secs),
        )?),
        BootstrapKind::Lease => Arc::new(LeaseBootstrapper::new(
            lease_store.ok_or_else(|| {
                Error::config("lease bootstrap requires a lease store shared by all nodes")
            })?,
            config.lease_name.clone(),
            Duration::from_secs(config.lease_duration_secs),
            Duration::from_secs(config.startup_timeout_secs),
        )),
    };
    Ok(bootstrapper)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::bootstrap::MemoryLeaseStore;

    #[test]
    fn test_registry_endpoint() {
        assert_eq!(registry_endpoint(None, 5000), (None, 5000));
        assert_eq!(
            registry_endpoint(Some("10.0.0.7:30020"), 5000),
            (Some("10.0.0.7".to_owned()), 30020)
        );
        assert_eq!(
            registry_endpoint(Some("[fd00::7]:5000"), 4000),
            (Some("fd00::7".to_owned()), 5000)
        );
        assert_eq!(registry_endpoint(Some(":5001"), 4000), (None, 5001));
    }

    fn node_addr(host: &str) -> Result<libp2p::Multiaddr> {
        Ok(format!("/ip4/{host}/tcp/5001/p2p/{}", libp2p::PeerId::random()).parse()?)
    }

    #[tokio::test]
    async fn test_lease_nodes_share_one_rendezvous() -> Result<()> {
        let config = BootstrapConfig {
            kind: BootstrapKind::Lease,
            ..Default::default()
        };
        assert!(matches!(
            build_bootstrapper(&config, Vec::new(), None),
            Err(Error::Config(_))
        ));

        let shared: Arc<dyn LeaseStore> = Arc::new(MemoryLeaseStore::new());
        let a = build_bootstrapper(&config, Vec::new(), Some(shared.clone()))?;
        let b = build_bootstrapper(&config, Vec::new(), Some(shared))?;
        let addr_a = node_addr("10.0.0.1")?;
        let addr_b = node_addr("10.0.0.2")?;
        let cancel = CancellationToken::new();

        let leader = {
            let (a, cancel, addr) = (a.clone(), cancel.clone(), addr_a.clone());
            tokio::spawn(async move { a.run(cancel, addr).await })
        };
        // The holder finds its own record and starts a new overlay
        assert!(a.seed_peers(cancel.clone(), &addr_a).await?.is_empty());

        let follower = {
            let (b, cancel, addr) = (b.clone(), cancel.clone(), addr_b.clone());
            tokio::spawn(async move { b.run(cancel, addr).await })
        };
        assert_eq!(b.seed_peers(cancel.clone(), &addr_b).await?, vec![addr_a]);

        cancel.cancel();
        for task in [leader, follower] {
            task.await.map_err(|e| Error::other(e.to_string()))??;
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_unusable_store_is_fatal() {
        let dir = tempfile::tempdir().unwrap_or_else(|e| panic!("tempdir: {e}"));
        let config = MirrorConfig {
            content_dir: dir.path().join("missing"),
            registry_addr: std::net::SocketAddr::from(([127, 0, 0, 1], 0)),
            router_addr: "/ip4/127.0.0.1/tcp/0".to_owned(),
            ..Default::default()
        };
        let service = MirrorService::new(config);
        assert!(matches!(service.run().await, Err(Error::Store(_))));
    }

    #[tokio::test]
    async fn test_run_until_cancelled() -> Result<()> {
        let dir = tempfile::tempdir()?;
        OciLayoutStore::create(dir.path()).await?;
        let config = MirrorConfig {
            content_dir: dir.path().to_path_buf(),
            registry_addr: std::net::SocketAddr::from(([127, 0, 0, 1], 0)),
            router_addr: "/ip4/127.0.0.1/tcp/0".to_owned(),
            shutdown_timeout_secs: 5,
            ..Default::default()
        };
        let service = Arc::new(MirrorService::new(config));
        let cancel = service.cancellation_token();
        let task = {
            let service = service.clone();
            tokio::spawn(async move { service.run().await })
        };

        tokio::time::sleep(Duration::from_millis(300)).await;
        cancel.cancel();
        task.await.map_err(|e| Error::other(e.to_string()))??;
        Ok(())
    }
}
