//! Shared fixtures for the integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use axum::{
    extract::State,
    http::{Method, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use bytes::Bytes;
use hyprmirror_core::oci::Digest;
use hyprmirror_core::registry::{self, Resolver, ResolverConfig, CONTENT_DIGEST_HEADER};
use hyprmirror_core::routing::{ContentRouter, MemoryOverlay, PeerRecord};
use hyprmirror_core::state::{TagCache, Tracker};
use hyprmirror_core::store::OciLayoutStore;
use hyprmirror_core::throttle::Limiter;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";

/// A small, valid OCI manifest document; `marker` makes its digest unique
pub fn manifest(marker: &str) -> Vec<u8> {
    format!(
        r#"{{"schemaVersion":2,"mediaType":"{OCI_MANIFEST}","config":{{}},"layers":[],"annotations":{{"marker":"{marker}"}}}}"#
    )
    .into_bytes()
}

/// Resolver settings short enough for tests
pub fn fast_resolver_config() -> ResolverConfig {
    ResolverConfig {
        retries: 3,
        timeout: Duration::from_secs(3),
        attempt_timeout: Duration::from_millis(500),
        body_timeout: Duration::from_secs(5),
    }
}

/// A mirror node wired to an in-process overlay and serving HTTP on loopback
pub struct Node {
    pub dir: TempDir,
    pub store: Arc<OciLayoutStore>,
    pub tags: Arc<TagCache>,
    pub tracker: Arc<Tracker>,
    pub resolver: Arc<Resolver>,
    pub addr: SocketAddr,
    pub cancel: CancellationToken,
}

impl Node {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

pub struct NodeOptions {
    pub resolver: ResolverConfig,
    pub resolve_latest_tag: bool,
    /// How long a re-resolvable "latest" binding stays fresh
    pub latest_ttl: Duration,
    pub limiter: Option<Arc<Limiter>>,
}

impl Default for NodeOptions {
    fn default() -> Self {
        Self {
            resolver: fast_resolver_config(),
            resolve_latest_tag: true,
            latest_ttl: Duration::from_secs(60),
            limiter: None,
        }
    }
}

/// Start a node on `overlay` under `id`
pub async fn spawn_node(
    overlay: &Arc<MemoryOverlay>,
    id: &str,
    options: NodeOptions,
) -> anyhow::Result<Node> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let router = Arc::new(overlay.router(PeerRecord::new(id, "127.0.0.1", addr.port())));
    spawn_node_with_router(listener, router, options).await
}

/// Start a node whose lookups are answered by `router`
pub async fn spawn_node_with_router(
    listener: TcpListener,
    router: Arc<dyn ContentRouter>,
    options: NodeOptions,
) -> anyhow::Result<Node> {
    let addr = listener.local_addr()?;
    let dir = tempfile::tempdir()?;
    let store = Arc::new(OciLayoutStore::create(dir.path()).await?);
    let tags = Arc::new(TagCache::new(options.resolve_latest_tag, options.latest_ttl));
    let tracker = Arc::new(Tracker::new(
        store.clone(),
        router.clone(),
        tags.clone(),
        Duration::from_secs(60),
    ));
    let resolver = Arc::new(
        Resolver::new(store.clone(), router, tags.clone(), options.resolver)?
            .with_limiter(options.limiter),
    );

    let cancel = CancellationToken::new();
    tokio::spawn(registry::serve(listener, resolver.clone(), cancel.clone()));

    Ok(Node {
        dir,
        store,
        tags,
        tracker,
        resolver,
        addr,
        cancel,
    })
}

/// Router double returning a fixed candidate list, in order
pub struct FixedRouter {
    pub peers: Vec<PeerRecord>,
    pub lookups: AtomicUsize,
    pub advertised: Mutex<Vec<String>>,
}

impl FixedRouter {
    pub fn new(peers: Vec<PeerRecord>) -> Arc<Self> {
        Arc::new(Self {
            peers,
            lookups: AtomicUsize::new(0),
            advertised: Mutex::new(Vec::new()),
        })
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ContentRouter for FixedRouter {
    async fn advertise(&self, key: &str) -> hyprmirror_core::Result<()> {
        self.advertised.lock().push(key.to_owned());
        Ok(())
    }

    async fn lookup(&self, _key: &str, max_peers: usize) -> hyprmirror_core::Result<Vec<PeerRecord>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self.peers.iter().take(max_peers).cloned().collect())
    }

    fn is_ready(&self) -> bool {
        true
    }
}

/// How a fake peer answers content requests
#[derive(Clone)]
pub enum PeerBehaviour {
    /// Serve the bytes with their real digest
    Serve(Bytes),
    /// Wait, then serve
    Delay(Duration, Bytes),
    /// Answer with a bare status
    Status(StatusCode),
    /// Serve the bytes while claiming a different digest
    Corrupt { body: Bytes, claimed: Digest },
}

#[derive(Clone)]
struct FakePeerState {
    name: String,
    behaviour: PeerBehaviour,
    hits: Arc<AtomicUsize>,
    mirrored: Arc<AtomicUsize>,
    order: Arc<Mutex<Vec<String>>>,
}

/// A registry double reachable over loopback
pub struct FakePeer {
    pub record: PeerRecord,
    pub hits: Arc<AtomicUsize>,
    pub mirrored: Arc<AtomicUsize>,
    cancel: CancellationToken,
}

impl FakePeer {
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

impl Drop for FakePeer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn fake_content(
    State(state): State<FakePeerState>,
    method: Method,
    headers: axum::http::HeaderMap,
) -> Response {
    state.hits.fetch_add(1, Ordering::SeqCst);
    state.order.lock().push(state.name.clone());
    if headers.contains_key(registry::MIRRORED_HEADER) {
        state.mirrored.fetch_add(1, Ordering::SeqCst);
    }

    let (body, digest) = match state.behaviour {
        PeerBehaviour::Serve(body) => {
            let digest = Digest::sha256_of(&body);
            (body, digest)
        }
        PeerBehaviour::Delay(delay, body) => {
            tokio::time::sleep(delay).await;
            let digest = Digest::sha256_of(&body);
            (body, digest)
        }
        PeerBehaviour::Status(status) => return status.into_response(),
        PeerBehaviour::Corrupt { body, claimed } => (body, claimed),
    };

    let headers = [(CONTENT_DIGEST_HEADER, digest.to_string())];
    if method == Method::HEAD {
        (StatusCode::OK, headers).into_response()
    } else {
        (StatusCode::OK, headers, body).into_response()
    }
}

/// Start a fake peer; every request it receives is appended to `order`
pub async fn spawn_fake_peer(
    name: &str,
    behaviour: PeerBehaviour,
    order: Arc<Mutex<Vec<String>>>,
) -> anyhow::Result<FakePeer> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let hits = Arc::new(AtomicUsize::new(0));
    let mirrored = Arc::new(AtomicUsize::new(0));
    let state = FakePeerState {
        name: name.to_owned(),
        behaviour,
        hits: hits.clone(),
        mirrored: mirrored.clone(),
        order,
    };

    let app = Router::new()
        .route("/v2/*path", get(fake_content).head(fake_content))
        .with_state(state);
    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await;
    });

    Ok(FakePeer {
        record: PeerRecord::new(name, "127.0.0.1", addr.port()),
        hits,
        mirrored,
        cancel,
    })
}
