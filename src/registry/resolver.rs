//! Resolution of manifests and blobs from local content or from peers.
//!
//! Content present in the local store is served directly. Otherwise the
//! resolver asks the router for up to `retries` providers and tries them in
//! order. Each attempt is bounded by the per-attempt timeout and by one
//! aggregate deadline shared by the whole resolution, whichever comes first.
//! Peers are contacted with the mirrored header set, so they answer from their
//! own store and never resolve further.
//!
//! Nothing a peer sends reaches the caller before it is verified. Manifests
//! are buffered; blob bodies are spooled to an anonymous temporary file while
//! being hashed and served from that file once the digest matches. A peer
//! whose content does not match is treated like any other failed candidate.

use super::metrics::MirrorMetrics;
use crate::config::MirrorConfig;
use crate::oci::{manifest_media_type, media_types, Digest, ImageName, Reference, RegistryPath};
use crate::routing::{ContentRouter, PeerRecord};
use crate::state::TagCache;
use crate::store::ContentStore;
use crate::throttle::{self, ByteStream, Limiter};
use crate::{Error, Result};
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use reqwest::header::{HeaderMap, ACCEPT, CONTENT_LENGTH};
use reqwest::{Method, StatusCode};
use std::fmt;
use std::future::Future;
use std::io::SeekFrom;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::time::Instant;
use tokio_util::io::ReaderStream;

/// Set on every peer-to-peer request; such requests are served from local content only
pub const MIRRORED_HEADER: &str = "X-Hyprmirror-Mirrored";
/// Digest of the returned content
pub const CONTENT_DIGEST_HEADER: &str = "Docker-Content-Digest";
/// Largest object served or fetched as a manifest
pub const MAX_MANIFEST_SIZE: u64 = 4 << 20;

#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Maximum number of candidate peers tried
    pub retries: usize,
    /// Aggregate deadline across lookup and all attempts
    pub timeout: Duration,
    /// Bound on a single candidate attempt up to its response headers
    pub attempt_timeout: Duration,
    /// Bound on downloading one accepted blob body
    pub body_timeout: Duration,
}

impl ResolverConfig {
    pub fn from_config(config: &MirrorConfig) -> Self {
        Self {
            retries: config.resolve_retries,
            timeout: config.resolve_timeout(),
            attempt_timeout: config.resolve_attempt_timeout(),
            body_timeout: config.resolve_body_timeout(),
        }
    }
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            retries: 3,
            timeout: Duration::from_secs(5),
            attempt_timeout: Duration::from_secs(2),
            body_timeout: Duration::from_secs(600),
        }
    }
}

/// A manifest or blob request as received by the registry endpoint
#[derive(Debug, Clone)]
pub struct ContentRequest {
    /// Upstream registry host the runtime is mirroring
    pub registry: String,
    pub path: RegistryPath,
    /// Headers only
    pub head: bool,
    /// Request came from another mirror
    pub mirrored: bool,
}

impl ContentRequest {
    pub fn new(registry: impl Into<String>, path: RegistryPath) -> Self {
        Self {
            registry: registry.into(),
            path,
            head: false,
            mirrored: false,
        }
    }

    fn image_name(&self, tag: &str) -> ImageName {
        ImageName {
            registry: self.registry.clone(),
            repository: self.path.repository.clone(),
            tag: Some(tag.to_owned()),
            digest: None,
        }
    }

    fn peer_url(&self, peer: &PeerRecord, reference: Reference) -> String {
        let path = RegistryPath {
            repository: self.path.repository.clone(),
            kind: self.path.kind,
            reference,
        };
        format!("{}{}?ns={}", peer.base_url(), path.to_path(), self.registry)
    }
}

/// Where the content came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    Local,
    Peer(PeerRecord),
}

pub enum Body {
    Empty,
    Full(Bytes),
    Stream(ByteStream),
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Body::Empty => f.write_str("Empty"),
            Body::Full(bytes) => write!(f, "Full({} bytes)", bytes.len()),
            Body::Stream(_) => f.write_str("Stream"),
        }
    }
}

#[derive(Debug)]
pub struct ContentResponse {
    pub digest: Digest,
    pub media_type: String,
    pub size: Option<u64>,
    pub source: Source,
    pub body: Body,
}

enum TagResolution {
    Digest(Digest),
    Fetched(ContentResponse),
}

pub struct Resolver {
    store: Arc<dyn ContentStore>,
    router: Arc<dyn ContentRouter>,
    tags: Arc<TagCache>,
    limiter: Option<Arc<Limiter>>,
    metrics: Arc<MirrorMetrics>,
    client: reqwest::Client,
    config: ResolverConfig,
}

impl Resolver {
    pub fn new(
        store: Arc<dyn ContentStore>,
        router: Arc<dyn ContentRouter>,
        tags: Arc<TagCache>,
        config: ResolverConfig,
    ) -> Result<Self> {
        // Attempts and bodies carry their own bounds
        let client = reqwest::Client::builder()
            .connect_timeout(config.attempt_timeout)
            .build()?;
        Ok(Self {
            store,
            router,
            tags,
            limiter: None,
            metrics: Arc::new(MirrorMetrics::default()),
            client,
            config,
        })
    }

    /// Pace blob bodies through a shared limiter
    pub fn with_limiter(mut self, limiter: Option<Arc<Limiter>>) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MirrorMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn metrics(&self) -> &Arc<MirrorMetrics> {
        &self.metrics
    }

    pub fn router(&self) -> &Arc<dyn ContentRouter> {
        &self.router
    }

    /// Resolve a manifest by tag or digest
    pub async fn manifest(&self, request: &ContentRequest) -> Result<ContentResponse> {
        let digest = match &request.path.reference {
            Reference::Digest(digest) => digest.clone(),
            Reference::Tag(tag) => {
                let name = request.image_name(tag);
                match self.resolve_tag(request, &name).await? {
                    TagResolution::Digest(digest) => digest,
                    TagResolution::Fetched(response) => return Ok(response),
                }
            }
        };

        if let Some(response) = self.local_manifest(&digest, request.head).await? {
            self.metrics.local_hit();
            return Ok(response);
        }
        if request.mirrored {
            return Err(Error::NotFound(format!("manifest unknown: {digest}")));
        }

        let key = digest.to_string();
        let response = self
            .from_peers(&key, |peer, deadline| {
                self.fetch_manifest(peer, request, &digest, deadline)
            })
            .await?;
        self.metrics.peer_hit();
        Ok(response)
    }

    /// Resolve a blob by digest
    pub async fn blob(&self, request: &ContentRequest) -> Result<ContentResponse> {
        let Reference::Digest(digest) = &request.path.reference else {
            return Err(Error::InvalidDigest(format!(
                "blobs must be addressed by digest: {}",
                request.path.reference
            )));
        };

        let mut response = match self.local_blob(digest, request.head).await? {
            Some(response) => {
                self.metrics.local_hit();
                response
            }
            None if request.mirrored => {
                return Err(Error::NotFound(format!("blob unknown: {digest}")));
            }
            None => {
                let key = digest.to_string();
                let response = self
                    .from_peers(&key, |peer, deadline| {
                        self.fetch_blob(peer, request, digest, deadline)
                    })
                    .await?;
                self.metrics.peer_hit();
                response
            }
        };

        if let Body::Stream(stream) = response.body {
            let metrics = self.metrics.clone();
            let stream = stream.inspect_ok(move |chunk| metrics.blob_bytes(chunk.len()));
            response.body = match &self.limiter {
                Some(limiter) => Body::Stream(throttle::throttled(limiter.clone(), stream).boxed()),
                None => Body::Stream(stream.boxed()),
            };
        }
        Ok(response)
    }

    async fn resolve_tag(&self, request: &ContentRequest, name: &ImageName) -> Result<TagResolution> {
        if let Some(digest) = self.tags.get(name) {
            tracing::trace!(image = %name, digest = %digest, "tag resolved from cache");
            return Ok(TagResolution::Digest(digest));
        }
        if let Some(digest) = self.store.resolve(name).await? {
            self.tags.insert(name, digest.clone());
            return Ok(TagResolution::Digest(digest));
        }
        if request.mirrored {
            return Err(Error::NotFound(format!("manifest unknown: {name}")));
        }

        let Some(key) = name.tag_key() else {
            return Err(Error::InvalidReference(format!("not a tag reference: {name}")));
        };
        let response = self
            .from_peers(&key, |peer, deadline| {
                self.fetch_tagged_manifest(peer, request, deadline)
            })
            .await?;
        self.metrics.peer_hit();
        if self.tags.insert(name, response.digest.clone()) {
            tracing::debug!(image = %name, digest = %response.digest, "tag resolved from peer");
        }
        Ok(TagResolution::Fetched(response))
    }

    async fn local_manifest(&self, digest: &Digest, head: bool) -> Result<Option<ContentResponse>> {
        let Some(size) = self.store.stat(digest).await? else {
            return Ok(None);
        };
        if size > MAX_MANIFEST_SIZE {
            return Err(Error::NotFound(format!(
                "{digest} is not a manifest ({size} bytes)"
            )));
        }
        let data = match self.store.read(digest).await {
            Ok(data) => data,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e),
        };
        if let Err(e) = digest.verify(&data) {
            tracing::warn!(digest = %digest, error = %e, "local manifest is corrupt, ignoring");
            return Ok(None);
        }
        Ok(Some(manifest_response(digest.clone(), data, Source::Local, head)))
    }

    async fn local_blob(&self, digest: &Digest, head: bool) -> Result<Option<ContentResponse>> {
        let Some(size) = self.store.stat(digest).await? else {
            return Ok(None);
        };
        let body = if head {
            Body::Empty
        } else {
            match self.store.open(digest).await {
                Ok(stream) => Body::Stream(throttle::verified(digest.clone(), stream).boxed()),
                Err(e) if e.is_not_found() => return Ok(None),
                Err(e) => return Err(e),
            }
        };
        Ok(Some(ContentResponse {
            digest: digest.clone(),
            media_type: media_types::OCTET_STREAM.to_owned(),
            size: Some(size),
            source: Source::Local,
            body,
        }))
    }

    async fn fetch_manifest(
        &self,
        peer: PeerRecord,
        request: &ContentRequest,
        digest: &Digest,
        deadline: Instant,
    ) -> Result<ContentResponse> {
        let url = request.peer_url(&peer, Reference::Digest(digest.clone()));
        let data = before(deadline, &peer, async {
            let response = self.send(Method::GET, &url, true).await?;
            if let Some(reported) = header_digest(response.headers())? {
                ensure_digest(digest, &reported)?;
            }
            read_manifest(response).await
        })
        .await?;
        digest.verify(&data)?;
        Ok(manifest_response(digest.clone(), data, Source::Peer(peer), request.head))
    }

    /// Fetch a manifest by tag; the digest the peer reports is verified against the body
    async fn fetch_tagged_manifest(
        &self,
        peer: PeerRecord,
        request: &ContentRequest,
        deadline: Instant,
    ) -> Result<ContentResponse> {
        let url = request.peer_url(&peer, request.path.reference.clone());
        let (digest, data) = before(deadline, &peer, async {
            let response = self.send(Method::GET, &url, true).await?;
            let digest = header_digest(response.headers())?.ok_or_else(|| {
                Error::other(format!("peer {peer} did not report a digest for {url}"))
            })?;
            Ok::<_, Error>((digest, read_manifest(response).await?))
        })
        .await?;
        digest.verify(&data)?;
        Ok(manifest_response(digest, data, Source::Peer(peer), request.head))
    }

    /// Fetch a blob; the body is verified in full before it is handed back
    async fn fetch_blob(
        &self,
        peer: PeerRecord,
        request: &ContentRequest,
        digest: &Digest,
        deadline: Instant,
    ) -> Result<ContentResponse> {
        let url = request.peer_url(&peer, Reference::Digest(digest.clone()));
        let method = if request.head { Method::HEAD } else { Method::GET };
        let response = before(deadline, &peer, self.send(method, &url, false)).await?;
        if let Some(reported) = header_digest(response.headers())? {
            ensure_digest(digest, &reported)?;
        }

        let (size, body) = if request.head {
            (header_length(response.headers()), Body::Empty)
        } else {
            let timeout = self.config.body_timeout;
            let (size, stream) = tokio::time::timeout(timeout, spool(digest, response))
                .await
                .map_err(|_| {
                    Error::other(format!("peer {peer} did not deliver {digest} within {timeout:?}"))
                })??;
            (Some(size), Body::Stream(stream))
        };
        Ok(ContentResponse {
            digest: digest.clone(),
            media_type: media_types::OCTET_STREAM.to_owned(),
            size,
            source: Source::Peer(peer),
            body,
        })
    }

    async fn send(&self, method: Method, url: &str, manifest: bool) -> Result<reqwest::Response> {
        let mut builder = self
            .client
            .request(method, url)
            .header(MIRRORED_HEADER, "true");
        if manifest {
            builder = builder.header(ACCEPT, media_types::MANIFEST_ACCEPT);
        }
        let response = builder.send().await?;
        match response.status() {
            StatusCode::OK => Ok(response),
            StatusCode::NOT_FOUND => Err(Error::NotFound(format!("peer has no {url}"))),
            status => Err(Error::other(format!("peer responded {status} for {url}"))),
        }
    }

    /// Try candidates for `key` in lookup order under the retry budget and deadline.
    ///
    /// Each attempt receives the instant its response headers must arrive by
    /// and reports missing it as [`Error::Timeout`].
    async fn from_peers<T, F, Fut>(&self, key: &str, mut attempt: F) -> Result<T>
    where
        F: FnMut(PeerRecord, Instant) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let deadline = Instant::now() + self.config.timeout;
        let exceeded = |attempts: usize| Error::DeadlineExceeded {
            key: key.to_owned(),
            attempts,
            timeout_ms: self.config.timeout.as_millis() as u64,
        };

        let lookup = self.router.lookup(key, self.config.retries);
        let candidates = match tokio::time::timeout_at(deadline, lookup).await {
            Err(_) => return Err(exceeded(0)),
            Ok(Err(e)) => {
                return Err(Error::UpstreamUnavailable {
                    key: key.to_owned(),
                    attempts: 0,
                    reason: format!("lookup failed: {e}"),
                })
            }
            Ok(Ok(candidates)) => candidates,
        };
        if candidates.is_empty() {
            tracing::debug!(key, "no peer provides key");
            return Err(Error::NotFound(format!("no peer provides {key}")));
        }

        let mut attempts = 0;
        let mut last_error = String::new();
        for peer in candidates.into_iter().take(self.config.retries) {
            let now = Instant::now();
            if now >= deadline {
                tracing::warn!(key, attempts, "resolution deadline exceeded");
                return Err(exceeded(attempts));
            }
            let attempt_deadline = (now + self.config.attempt_timeout).min(deadline);
            attempts += 1;
            self.metrics.peer_attempt();

            match attempt(peer.clone(), attempt_deadline).await {
                Ok(value) => {
                    tracing::debug!(key, peer = %peer, attempts, "resolved from peer");
                    return Ok(value);
                }
                Err(Error::Timeout(_)) if attempt_deadline >= deadline => {
                    self.metrics.peer_failure();
                    tracing::warn!(key, peer = %peer, attempts, "resolution deadline exceeded");
                    return Err(exceeded(attempts));
                }
                Err(Error::Timeout(reason)) => {
                    tracing::debug!(key, peer = %peer, "peer attempt timed out");
                    last_error = reason;
                }
                Err(e @ Error::DigestMismatch { .. }) => {
                    tracing::warn!(key, peer = %peer, error = %e, "peer served mismatched content");
                    last_error = e.to_string();
                }
                Err(e) => {
                    tracing::debug!(key, peer = %peer, error = %e, "peer attempt failed");
                    last_error = e.to_string();
                }
            }
            self.metrics.peer_failure();
        }

        tracing::warn!(key, attempts, reason = %last_error, "all candidate peers failed");
        Err(Error::UpstreamUnavailable {
            key: key.to_owned(),
            attempts,
            reason: last_error,
        })
    }
}

/// Run a peer request until `deadline`, reporting expiry as a timeout
async fn before<T>(
    deadline: Instant,
    peer: &PeerRecord,
    request: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::time::timeout_at(deadline, request)
        .await
        .map_err(|_| Error::timeout(format!("peer {peer} timed out")))?
}

/// Buffer a manifest body, refusing anything larger than a manifest can be
async fn read_manifest(response: reqwest::Response) -> Result<Bytes> {
    if header_length(response.headers()).is_some_and(|len| len > MAX_MANIFEST_SIZE) {
        return Err(Error::other(format!(
            "manifest from {} exceeds {MAX_MANIFEST_SIZE} bytes",
            response.url()
        )));
    }
    Ok(response.bytes().await?)
}

/// Download a peer body into an anonymous temporary file, hashing it on the
/// way, and stream it back from the start once the digest matches.
async fn spool(digest: &Digest, response: reqwest::Response) -> Result<(u64, ByteStream)> {
    let mut file = tokio::fs::File::from_std(tempfile::tempfile()?);
    let mut verifier = digest.verifier();
    let mut body = response.bytes_stream();
    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        verifier.update(&chunk);
        file.write_all(&chunk).await?;
    }

    let size = verifier.bytes();
    verifier.finish()?;
    file.flush().await?;
    file.seek(SeekFrom::Start(0)).await?;
    Ok((size, ReaderStream::new(file).boxed()))
}

fn manifest_response(digest: Digest, data: Bytes, source: Source, head: bool) -> ContentResponse {
    let media_type = manifest_media_type(&data).unwrap_or_else(|| media_types::OCTET_STREAM.to_owned());
    ContentResponse {
        digest,
        media_type,
        size: Some(data.len() as u64),
        source,
        body: if head { Body::Empty } else { Body::Full(data) },
    }
}

fn header_digest(headers: &HeaderMap) -> Result<Option<Digest>> {
    headers
        .get(CONTENT_DIGEST_HEADER)
        .map(|value| {
            value
                .to_str()
                .map_err(|e| Error::InvalidDigest(e.to_string()))?
                .parse::<Digest>()
        })
        .transpose()
}

fn header_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse().ok())
}

fn ensure_digest(expected: &Digest, reported: &Digest) -> Result<()> {
    if expected != reported {
        return Err(Error::DigestMismatch {
            expected: expected.to_string(),
            actual: reported.to_string(),
        });
    }
    Ok(())
}
