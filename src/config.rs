//! Configuration management for the mirror.
//!
//! Configuration is layered, later sources overriding earlier ones:
//! 1. Built-in defaults
//! 2. System-wide configuration file (`/etc/hyprmirror/config.toml`)
//! 3. User-specified configuration file
//! 4. Environment variables (prefixed with `HYPRMIRROR_`, nested keys joined by `__`)
//! 5. Command-line arguments
//!
//! # Environment Variables
//! - `HYPRMIRROR_REGISTRY_ADDR` - Address the registry endpoint listens on
//! - `HYPRMIRROR_ROUTER_ADDR` - Multiaddr the overlay listens on
//! - `HYPRMIRROR_RESOLVE_RETRIES` - Maximum candidate peers tried per request
//! - `HYPRMIRROR_BLOB_SPEED` - Blob bandwidth cap, e.g. `10MBps`
//! - `HYPRMIRROR_BOOTSTRAP__KIND` - `static`, `http` or `lease`

use crate::throttle::ByteRate;
use crate::{Error, Result};
use clap::Args;
use libp2p::Multiaddr;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

const SYSTEM_CONFIG_FILE: &str = "/etc/hyprmirror/config.toml";

/// Command-line overrides for the registry service
#[derive(Debug, Default, Clone, Args)]
pub struct RegistryArgs {
    /// Configuration file path
    #[arg(short, long, env = "HYPRMIRROR_CONFIG")]
    pub config: Option<PathBuf>,

    /// Address the registry endpoint listens on
    #[arg(long)]
    pub registry_addr: Option<SocketAddr>,

    /// Multiaddr the overlay listens on
    #[arg(long)]
    pub router_addr: Option<String>,

    /// Address other peers use to reach this registry (host:port)
    #[arg(long)]
    pub local_addr: Option<String>,

    /// OCI image layout directory holding local content
    #[arg(long)]
    pub content_dir: Option<PathBuf>,

    /// Re-resolve "latest" tags instead of caching them
    #[arg(long)]
    pub resolve_latest_tag: Option<bool>,

    /// Maximum candidate peers tried per request
    #[arg(long)]
    pub resolve_retries: Option<usize>,

    /// Aggregate deadline for resolving one request, in milliseconds
    #[arg(long)]
    pub resolve_timeout_ms: Option<u64>,

    /// Maximum blob serving speed, integer followed by Bps, KBps, MBps, GBps or TBps
    #[arg(long)]
    pub blob_speed: Option<ByteRate>,

    /// Bootstrap strategy (static or http; lease needs an embedded lease store)
    #[arg(long)]
    pub bootstrap_kind: Option<BootstrapKind>,

    /// Seed multiaddr for the static strategy (repeatable)
    #[arg(long = "bootstrap-peer")]
    pub bootstrap_peers: Vec<String>,

    /// Address the HTTP bootstrap endpoint listens on
    #[arg(long)]
    pub bootstrap_http_addr: Option<SocketAddr>,

    /// Peer bootstrap endpoint to fetch a seed address from
    #[arg(long)]
    pub bootstrap_http_peer: Option<String>,

    /// Log level used when RUST_LOG is not set
    #[arg(long)]
    pub log_level: Option<String>,
}

/// Bootstrap strategy selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BootstrapKind {
    /// Fixed list of seed addresses
    Static,
    /// Exchange one peer's address over HTTP
    Http,
    /// Elect a rendezvous holder through a lease store
    Lease,
}

/// Bootstrap configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapConfig {
    pub kind: BootstrapKind,
    /// Seed multiaddrs for the static strategy
    pub peers: Vec<String>,
    /// Where this node serves its own address (http strategy)
    pub http_addr: Option<SocketAddr>,
    /// Peer bootstrap endpoint to fetch from, e.g. `http://10.0.0.2:5002/id`
    pub http_peer: Option<String>,
    pub http_timeout_secs: u64,
    /// Lease name shared by all nodes of one cluster (lease strategy)
    pub lease_name: String,
    pub lease_duration_secs: u64,
    /// Give up waiting for a rendezvous record after this long
    pub startup_timeout_secs: u64,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            kind: BootstrapKind::Static,
            peers: Vec::new(),
            http_addr: None,
            http_peer: None,
            http_timeout_secs: 10,
            lease_name: "hyprmirror-leader".to_owned(),
            lease_duration_secs: 15,
            startup_timeout_secs: 60,
        }
    }
}

/// Mirror service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MirrorConfig {
    /// Address the registry endpoint listens on
    pub registry_addr: SocketAddr,
    /// Multiaddr the overlay listens on
    pub router_addr: String,
    /// Address other peers should use to reach this registry (host:port).
    /// When unset, peers use the address they observe plus the registry port.
    pub local_addr: Option<String>,
    /// OCI image layout directory holding local content
    pub content_dir: PathBuf,
    pub resolve_latest_tag: bool,
    pub resolve_retries: usize,
    /// Aggregate deadline across all attempts of one request
    pub resolve_timeout_ms: u64,
    /// Per-candidate fetch timeout (bounded by the aggregate deadline)
    pub resolve_attempt_timeout_ms: u64,
    /// Bound on downloading one blob body from a peer
    pub resolve_body_timeout_secs: u64,
    pub blob_speed: Option<ByteRate>,
    pub advertise_interval_secs: u64,
    pub advertise_ttl_secs: u64,
    pub shutdown_timeout_secs: u64,
    pub log_level: String,
    pub bootstrap: BootstrapConfig,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            registry_addr: SocketAddr::from(([0, 0, 0, 0], 5000)),
            router_addr: "/ip4/0.0.0.0/tcp/5001".to_owned(),
            local_addr: None,
            content_dir: PathBuf::from("/var/lib/hyprmirror/content"),
            resolve_latest_tag: true,
            resolve_retries: 3,
            resolve_timeout_ms: 5_000,
            resolve_attempt_timeout_ms: 2_000,
            resolve_body_timeout_secs: 600,
            blob_speed: None,
            advertise_interval_secs: 540,
            advertise_ttl_secs: 600,
            shutdown_timeout_secs: 30,
            log_level: "info".to_owned(),
            bootstrap: BootstrapConfig::default(),
        }
    }
}

impl MirrorConfig {
    /// Create a configuration builder with the standard priority stack
    ///
    /// The returned builder can be extended with additional sources or
    /// `set_override` calls before building.
    pub fn builder(
        config_file: Option<&Path>,
    ) -> Result<config::ConfigBuilder<config::builder::DefaultState>> {
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&Self::default())?)
            .add_source(config::File::with_name(SYSTEM_CONFIG_FILE).required(false));

        if let Some(path) = config_file {
            builder = builder.add_source(config::File::from(path));
        }

        Ok(builder.add_source(
            config::Environment::with_prefix("HYPRMIRROR")
                .prefix_separator("_")
                .separator("__"),
        ))
    }

    /// Load configuration from all sources, applying command-line overrides last
    pub fn load(args: &RegistryArgs) -> Result<Self> {
        let mut config: MirrorConfig = Self::builder(args.config.as_deref())?
            .build()?
            .try_deserialize()?;
        config.apply_args(args);
        config.validate()?;
        Ok(config)
    }

    fn apply_args(&mut self, args: &RegistryArgs) {
        if let Some(addr) = args.registry_addr {
            self.registry_addr = addr;
        }
        if let Some(addr) = &args.router_addr {
            self.router_addr = addr.clone();
        }
        if let Some(addr) = &args.local_addr {
            self.local_addr = Some(addr.clone());
        }
        if let Some(dir) = &args.content_dir {
            self.content_dir = dir.clone();
        }
        if let Some(resolve) = args.resolve_latest_tag {
            self.resolve_latest_tag = resolve;
        }
        if let Some(retries) = args.resolve_retries {
            self.resolve_retries = retries;
        }
        if let Some(timeout) = args.resolve_timeout_ms {
            self.resolve_timeout_ms = timeout;
        }
        if let Some(speed) = args.blob_speed {
            self.blob_speed = Some(speed);
        }
        if let Some(kind) = args.bootstrap_kind {
            self.bootstrap.kind = kind;
        }
        if !args.bootstrap_peers.is_empty() {
            self.bootstrap.peers = args.bootstrap_peers.clone();
        }
        if let Some(addr) = args.bootstrap_http_addr {
            self.bootstrap.http_addr = Some(addr);
        }
        if let Some(peer) = &args.bootstrap_http_peer {
            self.bootstrap.http_peer = Some(peer.clone());
        }
        if let Some(level) = &args.log_level {
            self.log_level = level.clone();
        }
    }

    /// Reject configurations the service cannot run with.
    ///
    /// The lease strategy is rejected here: it needs a lease store shared by
    /// every node, which only an embedder can supply (see
    /// [`MirrorService::with_lease_store`](crate::MirrorService::with_lease_store)).
    pub fn validate(&self) -> Result<()> {
        self.validate_for(false)
    }

    /// [`validate`](Self::validate), accepting the lease strategy when a
    /// shared lease store is available
    pub fn validate_for(&self, has_lease_store: bool) -> Result<()> {
        if self.resolve_retries == 0 {
            return Err(Error::config("resolve_retries must be at least 1"));
        }
        if self.resolve_timeout_ms == 0
            || self.resolve_attempt_timeout_ms == 0
            || self.resolve_body_timeout_secs == 0
        {
            return Err(Error::config("resolve timeouts must be greater than zero"));
        }
        if self.advertise_interval_secs == 0 {
            return Err(Error::config("advertise_interval_secs must be greater than zero"));
        }
        if self.advertise_interval_secs >= self.advertise_ttl_secs {
            return Err(Error::config(format!(
                "advertise_interval_secs ({}) must be shorter than advertise_ttl_secs ({})",
                self.advertise_interval_secs, self.advertise_ttl_secs
            )));
        }
        self.router_multiaddr()?;
        self.seed_multiaddrs()?;

        if let Some(local) = &self.local_addr {
            if local.rsplit_once(':').and_then(|(_, p)| p.parse::<u16>().ok()).is_none() {
                return Err(Error::config(format!("local_addr {local:?} must be host:port")));
            }
        }

        if self.bootstrap.kind == BootstrapKind::Http
            && self.bootstrap.http_addr.is_none()
            && self.bootstrap.http_peer.is_none()
        {
            return Err(Error::config(
                "http bootstrap requires http_addr, http_peer, or both",
            ));
        }
        if self.bootstrap.kind == BootstrapKind::Lease && !has_lease_store {
            return Err(Error::config(
                "lease bootstrap requires a lease store shared by all nodes",
            ));
        }
        Ok(())
    }

    pub fn router_multiaddr(&self) -> Result<Multiaddr> {
        self.router_addr
            .parse()
            .map_err(|e| Error::config(format!("invalid router_addr {:?}: {e}", self.router_addr)))
    }

    pub fn seed_multiaddrs(&self) -> Result<Vec<Multiaddr>> {
        self.bootstrap
            .peers
            .iter()
            .map(|p| {
                p.parse()
                    .map_err(|e| Error::config(format!("invalid bootstrap peer {p:?}: {e}")))
            })
            .collect()
    }

    pub fn resolve_timeout(&self) -> Duration {
        Duration::from_millis(self.resolve_timeout_ms)
    }

    pub fn resolve_attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.resolve_attempt_timeout_ms)
    }

    pub fn resolve_body_timeout(&self) -> Duration {
        Duration::from_secs(self.resolve_body_timeout_secs)
    }

    pub fn advertise_interval(&self) -> Duration {
        Duration::from_secs(self.advertise_interval_secs)
    }

    pub fn advertise_ttl(&self) -> Duration {
        Duration::from_secs(self.advertise_ttl_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_config_defaults() -> Result<()> {
        let config = MirrorConfig::load(&RegistryArgs::default())?;
        assert!(config.resolve_latest_tag);
        assert_eq!(config.resolve_retries, 3);
        assert_eq!(config.resolve_timeout(), Duration::from_secs(5));
        assert_eq!(config.advertise_ttl(), Duration::from_secs(600));
        assert_eq!(config.bootstrap.kind, BootstrapKind::Static);
        assert!(config.blob_speed.is_none());
        Ok(())
    }

    #[test]
    fn test_file_and_args_layering() -> Result<()> {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile()?;
        writeln!(
            file,
            r#"
resolve_retries = 5
blob_speed = "2MBps"

[bootstrap]
kind = "http"
http_peer = "http://10.0.0.2:5002/id"
"#
        )?;

        let args = RegistryArgs {
            config: Some(file.path().to_path_buf()),
            resolve_retries: Some(7),
            ..Default::default()
        };
        let config = MirrorConfig::load(&args)?;
        assert_eq!(config.resolve_retries, 7);
        assert_eq!(config.blob_speed.map(|r| r.as_u64()), Some(2 << 20));
        assert_eq!(config.bootstrap.kind, BootstrapKind::Http);
        assert_eq!(config.bootstrap.http_timeout_secs, 10);
        Ok(())
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = MirrorConfig {
            resolve_retries: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        config.resolve_retries = 3;
        config.advertise_interval_secs = 600;
        assert!(config.validate().is_err());

        config.advertise_interval_secs = 60;
        config.bootstrap.kind = BootstrapKind::Http;
        assert!(config.validate().is_err());

        config.bootstrap.http_addr = Some(SocketAddr::from(([127, 0, 0, 1], 5002)));
        assert!(config.validate().is_ok());

        config.router_addr = "not a multiaddr".to_owned();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_lease_bootstrap_needs_shared_store() {
        let mut config = MirrorConfig::default();
        config.bootstrap.kind = BootstrapKind::Lease;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
        assert!(config.validate_for(true).is_ok());
    }
}
