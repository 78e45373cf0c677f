//! Content router over a libp2p Kademlia overlay

use super::behaviour::{parse_agent_version, MirrorBehaviour, MirrorBehaviourEvent};
use super::bootstrap::{peer_id_of, Bootstrapper};
use super::{ContentRouter, PeerRecord};
use crate::{Error, Result};
use async_trait::async_trait;
use futures::stream::StreamExt;
use libp2p::{
    identify,
    kad::{self, GetProvidersOk, QueryId, QueryResult, RecordKey},
    multiaddr::Protocol,
    swarm::{Swarm, SwarmEvent},
    Multiaddr, PeerId,
};
use multihash::Multihash;
use parking_lot::Mutex;
use sha2::{Digest as _, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Multihash code of SHA2-256
const SHA2_256: u64 = 0x12;

/// Overlay settings
#[derive(Debug, Clone)]
pub struct P2pConfig {
    /// Multiaddr the overlay listens on
    pub listen: Multiaddr,
    /// Explicit registry host announced to peers
    pub registry_host: Option<String>,
    /// Port of this node's registry endpoint
    pub registry_port: u16,
    /// Lifetime of an advertisement without refresh
    pub provider_ttl: Duration,
    /// Upper bound on one provider lookup
    pub lookup_timeout: Duration,
    /// Identity of this node; a fresh one is generated when unset
    pub keypair: Option<libp2p::identity::Keypair>,
}

impl P2pConfig {
    pub fn new(listen: Multiaddr, registry_port: u16) -> Self {
        Self {
            listen,
            registry_host: None,
            registry_port,
            provider_ttl: Duration::from_secs(600),
            lookup_timeout: Duration::from_secs(5),
            keypair: None,
        }
    }
}

/// Hash an arbitrary content key into a DHT record key
pub fn record_key(key: &str) -> Result<RecordKey> {
    let multihash: Multihash<64> = Multihash::wrap(SHA2_256, &Sha256::digest(key.as_bytes()))
        .map_err(|e| Error::router(format!("failed to hash key {key}: {e}")))?;
    Ok(RecordKey::new(&multihash.to_bytes()))
}

/// Router command for async operations
#[derive(Debug)]
enum RouterCommand {
    /// Announce as provider for a key
    Provide {
        key: RecordKey,
        response: oneshot::Sender<Result<()>>,
    },
    /// Find providers for a key
    GetProviders {
        key: RecordKey,
        limit: usize,
        response: oneshot::Sender<Result<Vec<PeerRecord>>>,
    },
    /// Current listen addresses
    ListenAddrs {
        response: oneshot::Sender<Vec<Multiaddr>>,
    },
}

/// Results of the bootstrap tasks, fed back into the event loop
#[derive(Debug)]
enum BootstrapEvent {
    Seeds(Result<Vec<Multiaddr>>),
    RegistrationEnded(Result<()>),
}

/// Provider lookup in progress
#[derive(Debug)]
struct PendingLookup {
    limit: usize,
    found: Vec<PeerRecord>,
    seen: HashSet<PeerId>,
    response: Option<oneshot::Sender<Result<Vec<PeerRecord>>>>,
}

impl PendingLookup {
    fn reply(&mut self) {
        if let Some(response) = self.response.take() {
            let _ = response.send(Ok(std::mem::take(&mut self.found)));
        }
    }
}

/// What is known about a peer's registry endpoint
#[derive(Debug, Default, Clone)]
struct PeerEntry {
    /// Host observed on the connection
    observed_host: Option<String>,
    /// Registry endpoint announced through identify
    registry: Option<(Option<String>, u16)>,
}

impl PeerEntry {
    fn record(&self, peer: &PeerId) -> Option<PeerRecord> {
        let (announced, port) = self.registry.clone()?;
        let host = announced.or_else(|| self.observed_host.clone())?;
        Some(PeerRecord::new(peer.to_string(), host, port))
    }
}

/// Registry endpoints of the peers this node can currently reach
#[derive(Debug, Default)]
struct PeerTable {
    entries: HashMap<PeerId, PeerEntry>,
}

impl PeerTable {
    /// A connection came up; the remote address replaces any older observation
    fn connected(&mut self, peer: PeerId, host: Option<String>) {
        let entry = self.entries.entry(peer).or_default();
        if host.is_some() {
            entry.observed_host = host;
        }
    }

    /// Identify reported the peer's registry endpoint
    fn identified(&mut self, peer: PeerId, registry: (Option<String>, u16), listen_addrs: &[Multiaddr]) {
        let entry = self.entries.entry(peer).or_default();
        entry.registry = Some(registry);
        if entry.observed_host.is_none() {
            entry.observed_host = listen_addrs
                .iter()
                .find(|a| !is_loopback(a))
                .or_else(|| listen_addrs.first())
                .and_then(host_of);
        }
    }

    /// Drop a peer the overlay no longer reaches
    fn forget(&mut self, peer: &PeerId) -> bool {
        self.entries.remove(peer).is_some()
    }

    fn record(&self, peer: &PeerId) -> Option<PeerRecord> {
        self.entries.get(peer).and_then(|entry| entry.record(peer))
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// First IP or DNS component of a multiaddr
fn host_of(addr: &Multiaddr) -> Option<String> {
    addr.iter().find_map(|protocol| match protocol {
        Protocol::Ip4(ip) => Some(ip.to_string()),
        Protocol::Ip6(ip) => Some(ip.to_string()),
        Protocol::Dns(name) | Protocol::Dns4(name) | Protocol::Dns6(name) => Some(name.to_string()),
        _ => None,
    })
}

fn is_loopback(addr: &Multiaddr) -> bool {
    addr.iter().any(|protocol| match protocol {
        Protocol::Ip4(ip) => ip.is_loopback(),
        Protocol::Ip6(ip) => ip.is_loopback(),
        _ => false,
    })
}

/// State owned by the running event loop
struct EventLoop {
    swarm: Swarm<MirrorBehaviour>,
    command_rx: mpsc::UnboundedReceiver<RouterCommand>,
    bootstrap_tx: mpsc::UnboundedSender<BootstrapEvent>,
    bootstrap_rx: mpsc::UnboundedReceiver<BootstrapEvent>,
    bootstrapper: Arc<dyn Bootstrapper>,
    listen: Multiaddr,
    listen_addrs: Vec<Multiaddr>,
    peers: PeerTable,
    pending: HashMap<QueryId, PendingLookup>,
    bootstrap_tasks: Vec<JoinHandle<()>>,
    ready: Arc<AtomicBool>,
}

/// Content router backed by libp2p Kademlia.
///
/// The swarm runs on a dedicated event loop started by [`P2pRouter::run`];
/// `advertise` and `lookup` talk to it over a command channel.
pub struct P2pRouter {
    local_peer_id: PeerId,
    command_tx: mpsc::UnboundedSender<RouterCommand>,
    event_loop: Mutex<Option<EventLoop>>,
    lookup_timeout: Duration,
    ready: Arc<AtomicBool>,
    shutdown: CancellationToken,
}

impl P2pRouter {
    /// Create the swarm and start listening. Nothing is dialed until `run`.
    pub async fn new(config: P2pConfig, bootstrapper: Arc<dyn Bootstrapper>) -> Result<Self> {
        let keypair = config
            .keypair
            .clone()
            .unwrap_or_else(libp2p::identity::Keypair::generate_ed25519);

        let registry_host = config.registry_host.clone();
        let registry_port = config.registry_port;
        let provider_ttl = config.provider_ttl;
        let query_timeout = config.lookup_timeout;

        let mut swarm = libp2p::SwarmBuilder::with_existing_identity(keypair)
            .with_tokio()
            .with_tcp(
                libp2p::tcp::Config::default().nodelay(true),
                libp2p::noise::Config::new,
                libp2p::yamux::Config::default,
            )?
            .with_behaviour(|key| {
                MirrorBehaviour::new(
                    key,
                    registry_host.as_deref(),
                    registry_port,
                    provider_ttl,
                    query_timeout,
                )
            })?
            // Endpoints are forgotten on disconnect; keep idle peers for a provider lifetime
            .with_swarm_config(|c| c.with_idle_connection_timeout(provider_ttl))
            .build();

        let local_peer_id = *swarm.local_peer_id();
        info!(peer_id = %local_peer_id, "starting content router");
        swarm.listen_on(config.listen.clone())?;

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (bootstrap_tx, bootstrap_rx) = mpsc::unbounded_channel();
        let ready = Arc::new(AtomicBool::new(false));

        let event_loop = EventLoop {
            swarm,
            command_rx,
            bootstrap_tx,
            bootstrap_rx,
            bootstrapper,
            listen: config.listen,
            listen_addrs: Vec::new(),
            peers: PeerTable::default(),
            pending: HashMap::new(),
            bootstrap_tasks: Vec::new(),
            ready: ready.clone(),
        };

        Ok(Self {
            local_peer_id,
            command_tx,
            event_loop: Mutex::new(Some(event_loop)),
            lookup_timeout: config.lookup_timeout,
            ready,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    /// Service overlay traffic until `cancel` fires or the router is closed.
    ///
    /// Returns `Ok(())` on cancellation and an error when the transport or the
    /// bootstrapper fails.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let event_loop = self
            .event_loop
            .lock()
            .take()
            .ok_or_else(|| Error::router("content router is already running or closed"))?;
        event_loop.run(cancel, self.shutdown.clone()).await
    }

    /// Release sockets and in-flight state. Safe to call more than once.
    pub fn close(&self) -> Result<()> {
        self.shutdown.cancel();
        // A loop that never ran still owns the listening socket
        drop(self.event_loop.lock().take());
        self.ready.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Addresses the overlay is listening on, with this node's `/p2p/` id
    pub async fn listen_addrs(&self) -> Result<Vec<Multiaddr>> {
        let (tx, rx) = oneshot::channel();
        self.command_tx.send(RouterCommand::ListenAddrs { response: tx })?;
        Ok(rx.await?)
    }
}

#[async_trait]
impl ContentRouter for P2pRouter {
    async fn advertise(&self, key: &str) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.command_tx.send(RouterCommand::Provide {
            key: record_key(key)?,
            response: tx,
        })?;
        rx.await?
    }

    async fn lookup(&self, key: &str, max_peers: usize) -> Result<Vec<PeerRecord>> {
        if max_peers == 0 {
            return Ok(Vec::new());
        }
        let (tx, rx) = oneshot::channel();
        self.command_tx.send(RouterCommand::GetProviders {
            key: record_key(key)?,
            limit: max_peers,
            response: tx,
        })?;

        // The query itself times out inside Kademlia; this guards the channel
        match tokio::time::timeout(self.lookup_timeout + Duration::from_secs(1), rx).await {
            Ok(result) => result?,
            Err(_) => {
                warn!(key, "provider lookup timed out");
                Ok(Vec::new())
            }
        }
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

impl Drop for P2pRouter {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl EventLoop {
    async fn run(mut self, cancel: CancellationToken, shutdown: CancellationToken) -> Result<()> {
        let bootstrap_cancel = cancel.child_token();
        let result = loop {
            tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                _ = shutdown.cancelled() => break Ok(()),
                event = self.swarm.select_next_some() => {
                    if let Err(e) = self.handle_swarm_event(event, &bootstrap_cancel) {
                        break Err(e);
                    }
                }
                Some(command) = self.command_rx.recv() => self.handle_command(command),
                Some(event) = self.bootstrap_rx.recv() => {
                    if let Err(e) = self.handle_bootstrap_event(event) {
                        break Err(e);
                    }
                }
            }
        };

        bootstrap_cancel.cancel();
        for task in self.bootstrap_tasks.drain(..) {
            task.abort();
        }
        for (_, mut pending) in self.pending.drain() {
            pending.reply();
        }
        self.ready.store(false, Ordering::SeqCst);
        info!("content router stopped");
        result
    }

    fn handle_swarm_event(
        &mut self,
        event: SwarmEvent<MirrorBehaviourEvent>,
        bootstrap_cancel: &CancellationToken,
    ) -> Result<()> {
        match event {
            SwarmEvent::NewListenAddr { address, .. } => {
                info!(%address, "overlay listening");
                let address = address.with(Protocol::P2p(*self.swarm.local_peer_id()));
                self.listen_addrs.push(address.clone());

                // Advertise a routable address unless we only listen on loopback
                let usable = !is_loopback(&address) || is_loopback(&self.listen);
                if self.bootstrap_tasks.is_empty() && usable {
                    self.start_bootstrap(address, bootstrap_cancel);
                }
            }
            SwarmEvent::ListenerClosed { reason: Err(e), .. } => {
                return Err(Error::Libp2p(format!("overlay listener failed: {e}")));
            }
            SwarmEvent::ListenerError { error, .. } => {
                warn!(error = %error, "overlay listener error");
            }
            SwarmEvent::ConnectionEstablished { peer_id, endpoint, .. } => {
                debug!(%peer_id, "connected to peer");
                self.peers
                    .connected(peer_id, host_of(endpoint.get_remote_address()));
            }
            SwarmEvent::ConnectionClosed {
                peer_id,
                num_established,
                ..
            } => {
                debug!(%peer_id, remaining = num_established, "connection to peer closed");
                if num_established == 0 && self.peers.forget(&peer_id) {
                    debug!(%peer_id, known = self.peers.len(), "forgot disconnected peer");
                }
            }
            SwarmEvent::OutgoingConnectionError { peer_id, error, .. } => {
                debug!(?peer_id, error = %error, "outgoing connection failed");
                if let Some(peer_id) = peer_id {
                    if !self.swarm.is_connected(&peer_id) {
                        self.peers.forget(&peer_id);
                    }
                }
            }
            SwarmEvent::Behaviour(MirrorBehaviourEvent::Identify(identify::Event::Received {
                peer_id,
                info,
                ..
            })) => {
                let Some(registry) = parse_agent_version(&info.agent_version) else {
                    debug!(%peer_id, agent = %info.agent_version, "ignoring non-mirror peer");
                    return Ok(());
                };
                debug!(%peer_id, port = registry.1, "identified mirror peer");
                self.peers.identified(peer_id, registry, &info.listen_addrs);
                for addr in info.listen_addrs {
                    self.swarm.behaviour_mut().kademlia.add_address(&peer_id, addr);
                }
            }
            SwarmEvent::Behaviour(MirrorBehaviourEvent::Identify(identify::Event::Error {
                peer_id,
                error,
                ..
            })) => {
                debug!(%peer_id, error = %error, "identify failed");
            }
            SwarmEvent::Behaviour(MirrorBehaviourEvent::Kademlia(event)) => {
                self.handle_kad_event(event);
            }
            _ => {}
        }
        Ok(())
    }

    fn handle_kad_event(&mut self, event: kad::Event) {
        match event {
            kad::Event::RoutingUpdated { peer, old_peer, .. } => {
                debug!(%peer, "routing table updated");
                if let Some(evicted) = old_peer {
                    self.peers.forget(&evicted);
                }
                if !self.ready.swap(true, Ordering::SeqCst) {
                    info!("content router joined the overlay");
                }
            }
            kad::Event::UnroutablePeer { peer } => {
                debug!(%peer, "peer is unroutable");
                self.peers.forget(&peer);
            }
            kad::Event::OutboundQueryProgressed { id, result, step, .. } => match result {
                QueryResult::GetProviders(Ok(GetProvidersOk::FoundProviders { providers, .. })) => {
                    let local = *self.swarm.local_peer_id();
                    let mut unknown = Vec::new();
                    let mut done = false;

                    if let Some(pending) = self.pending.get_mut(&id) {
                        for peer in providers {
                            if peer == local || !pending.seen.insert(peer) {
                                continue;
                            }
                            match self.peers.record(&peer) {
                                Some(record) => pending.found.push(record),
                                None => unknown.push(peer),
                            }
                        }
                        if pending.found.len() >= pending.limit {
                            pending.found.truncate(pending.limit);
                            pending.reply();
                            done = true;
                        }
                    }

                    // Connecting triggers identify so the next lookup can use them
                    for peer in unknown {
                        debug!(%peer, "provider has no known registry endpoint yet");
                        let _ = self.swarm.dial(peer);
                    }
                    if done {
                        if let Some(mut query) = self.swarm.behaviour_mut().kademlia.query_mut(&id) {
                            query.finish();
                        }
                    }
                    if step.last {
                        self.finish_lookup(&id);
                    }
                }
                QueryResult::GetProviders(Ok(GetProvidersOk::FinishedWithNoAdditionalRecord { .. })) => {
                    self.finish_lookup(&id);
                }
                QueryResult::GetProviders(Err(e)) => {
                    debug!(error = %e, "provider query ended with error");
                    self.finish_lookup(&id);
                }
                QueryResult::StartProviding(Err(e)) => {
                    debug!(error = %e, "advertisement could not reach peers");
                }
                QueryResult::Bootstrap(Ok(ok)) => {
                    debug!(remaining = ok.num_remaining, "bootstrap progressed");
                }
                QueryResult::Bootstrap(Err(e)) => {
                    warn!(error = %e, "overlay bootstrap failed");
                }
                _ => {}
            },
            other => debug!(event = ?other, "kademlia event"),
        }
    }

    fn finish_lookup(&mut self, id: &QueryId) {
        if let Some(mut pending) = self.pending.remove(id) {
            pending.reply();
        }
    }

    fn handle_command(&mut self, command: RouterCommand) {
        match command {
            RouterCommand::Provide { key, response } => {
                let result = self
                    .swarm
                    .behaviour_mut()
                    .kademlia
                    .start_providing(key)
                    .map(|_| ())
                    .map_err(Error::from);
                let _ = response.send(result);
            }
            RouterCommand::GetProviders { key, limit, response } => {
                let query_id = self.swarm.behaviour_mut().kademlia.get_providers(key);
                self.pending.insert(
                    query_id,
                    PendingLookup {
                        limit,
                        found: Vec::new(),
                        seen: HashSet::new(),
                        response: Some(response),
                    },
                );
            }
            RouterCommand::ListenAddrs { response } => {
                let _ = response.send(self.listen_addrs.clone());
            }
        }
    }

    fn start_bootstrap(&mut self, self_addr: Multiaddr, cancel: &CancellationToken) {
        info!(%self_addr, "bootstrapping overlay");

        let registration = {
            let bootstrapper = self.bootstrapper.clone();
            let events = self.bootstrap_tx.clone();
            let cancel = cancel.clone();
            let self_addr = self_addr.clone();
            tokio::spawn(async move {
                let result = bootstrapper.run(cancel, self_addr).await;
                let _ = events.send(BootstrapEvent::RegistrationEnded(result));
            })
        };

        let seeding = {
            let bootstrapper = self.bootstrapper.clone();
            let events = self.bootstrap_tx.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let result = bootstrapper.seed_peers(cancel, &self_addr).await;
                let _ = events.send(BootstrapEvent::Seeds(result));
            })
        };

        self.bootstrap_tasks.push(registration);
        self.bootstrap_tasks.push(seeding);
    }

    fn handle_bootstrap_event(&mut self, event: BootstrapEvent) -> Result<()> {
        match event {
            BootstrapEvent::Seeds(Err(e)) => Err(e),
            BootstrapEvent::Seeds(Ok(seeds)) => {
                if seeds.is_empty() {
                    info!("no seed peers, starting a new overlay");
                    self.ready.store(true, Ordering::SeqCst);
                    return Ok(());
                }

                let mut added = 0;
                for addr in seeds {
                    match peer_id_of(&addr) {
                        Some(peer_id) => {
                            let mut without_p2p = addr.clone();
                            without_p2p.pop();
                            self.swarm
                                .behaviour_mut()
                                .kademlia
                                .add_address(&peer_id, without_p2p);
                            added += 1;
                        }
                        None => warn!(%addr, "seed address has no peer id, dialing anyway"),
                    }
                    if let Err(e) = self.swarm.dial(addr.clone()) {
                        warn!(%addr, error = %e, "failed to dial seed peer");
                    } else {
                        info!(%addr, "dialing seed peer");
                    }
                }

                if added > 0 {
                    if let Err(e) = self.swarm.behaviour_mut().kademlia.bootstrap() {
                        warn!(error = %e, "could not start overlay bootstrap");
                    }
                }
                Ok(())
            }
            BootstrapEvent::RegistrationEnded(Ok(())) => Ok(()),
            BootstrapEvent::RegistrationEnded(Err(e)) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_key_is_stable() -> Result<()> {
        let a = record_key("sha256:aaa")?;
        let b = record_key("sha256:aaa")?;
        let c = record_key("sha256:bbb")?;
        assert_eq!(a, b);
        assert_ne!(a, c);
        // multihash prefix: sha2-256 code, 32-byte length
        assert_eq!(&a.to_vec()[..2], &[0x12, 0x20]);
        Ok(())
    }

    #[test]
    fn test_peer_entry_prefers_announced_host() {
        let peer = PeerId::random();
        let mut entry = PeerEntry {
            observed_host: Some("10.0.0.3".to_owned()),
            registry: None,
        };
        assert_eq!(entry.record(&peer), None);

        entry.registry = Some((None, 5000));
        assert_eq!(
            entry.record(&peer).map(|r| r.authority()),
            Some("10.0.0.3:5000".to_owned())
        );

        entry.registry = Some((Some("node-3.cluster.local".to_owned()), 5000));
        assert_eq!(
            entry.record(&peer).map(|r| r.host),
            Some("node-3.cluster.local".to_owned())
        );
    }

    #[test]
    fn test_peer_table_forgets_unreachable_peers() -> Result<()> {
        let mut table = PeerTable::default();
        let a = PeerId::random();
        let b = PeerId::random();

        table.connected(a, Some("10.0.0.3".to_owned()));
        table.identified(a, (None, 5000), &[]);
        let listen: Multiaddr = "/ip4/10.0.0.4/tcp/5001".parse()?;
        table.identified(b, (None, 5000), &[listen]);
        assert_eq!(table.len(), 2);
        assert_eq!(table.record(&a).map(|r| r.host), Some("10.0.0.3".to_owned()));
        assert_eq!(table.record(&b).map(|r| r.host), Some("10.0.0.4".to_owned()));

        assert!(table.forget(&a));
        assert!(!table.forget(&a));
        assert_eq!(table.record(&a), None);
        assert_eq!(table.len(), 1);

        // A reconnect from a new address is not shadowed by the old observation
        table.connected(b, Some("10.0.0.9".to_owned()));
        assert_eq!(table.record(&b).map(|r| r.host), Some("10.0.0.9".to_owned()));
        Ok(())
    }

    #[test]
    fn test_host_of_multiaddr() -> Result<()> {
        let addr: Multiaddr = "/ip4/10.1.2.3/tcp/5001".parse()?;
        assert_eq!(host_of(&addr).as_deref(), Some("10.1.2.3"));
        assert!(!is_loopback(&addr));

        let addr: Multiaddr = "/ip6/::1/tcp/5001".parse()?;
        assert!(is_loopback(&addr));
        Ok(())
    }
}
