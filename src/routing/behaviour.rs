//! libp2p behaviour for the mirror overlay

use super::storage::ProviderStore;
use libp2p::{identify, kad, swarm::NetworkBehaviour, PeerId, StreamProtocol};
use std::time::Duration;

/// Kademlia protocol name; keeps mirror overlays apart from other DHTs
pub const KAD_PROTOCOL: StreamProtocol = StreamProtocol::new("/hyprmirror/kad/1.0.0");
/// Identify protocol name
pub const IDENTIFY_PROTOCOL: &str = "/hyprmirror/id/1.0.0";
/// Prefix of the identify agent version announced by mirror nodes
pub const AGENT_PREFIX: &str = "hyprmirror/";

/// Combined behaviour for the mirror overlay
#[derive(NetworkBehaviour)]
pub struct MirrorBehaviour {
    pub kademlia: kad::Behaviour<ProviderStore>,
    pub identify: identify::Behaviour,
}

impl MirrorBehaviour {
    /// Create the behaviour.
    ///
    /// `registry` is announced through identify so peers can reach this node's
    /// registry endpoint: `Some(host)` for an explicit address, otherwise peers
    /// use the address they see this node connect from.
    pub fn new(
        keypair: &libp2p::identity::Keypair,
        registry_host: Option<&str>,
        registry_port: u16,
        provider_ttl: Duration,
        query_timeout: Duration,
    ) -> Self {
        let local_peer_id = PeerId::from(keypair.public());
        let store = ProviderStore::new(local_peer_id);

        let mut kad_config = kad::Config::new(KAD_PROTOCOL);
        kad_config.set_query_timeout(query_timeout);
        kad_config.set_provider_record_ttl(Some(provider_ttl));
        // The state tracker refreshes advertisements itself
        kad_config.set_provider_publication_interval(None);

        let mut kademlia = kad::Behaviour::with_config(local_peer_id, store, kad_config);
        // Every mirror node answers queries; nodes share a cluster network
        kademlia.set_mode(Some(kad::Mode::Server));

        let identify = identify::Behaviour::new(
            identify::Config::new(IDENTIFY_PROTOCOL.to_owned(), keypair.public())
                .with_agent_version(agent_version(registry_host, registry_port)),
        );

        Self { kademlia, identify }
    }
}

/// Agent version carrying the registry endpoint, e.g. `hyprmirror/0.1.0 registry=:5000`
pub fn agent_version(registry_host: Option<&str>, registry_port: u16) -> String {
    format!(
        "{AGENT_PREFIX}{} registry={}:{registry_port}",
        crate::VERSION,
        registry_host.unwrap_or_default()
    )
}

/// Parse the registry endpoint out of a peer's agent version.
///
/// Returns `None` for peers that are not mirror nodes.
pub fn parse_agent_version(agent: &str) -> Option<(Option<String>, u16)> {
    if !agent.starts_with(AGENT_PREFIX) {
        return None;
    }
    let endpoint = agent
        .split_whitespace()
        .find_map(|part| part.strip_prefix("registry="))?;
    let (host, port) = endpoint.rsplit_once(':')?;
    let port = port.parse().ok()?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let host = (!host.is_empty()).then(|| host.to_owned());
    Some((host, port))
}
