//! Bootstrap by exchanging one overlay address over HTTP

use super::{without_self, Bootstrapper};
use crate::{Error, Result};
use async_trait::async_trait;
use axum::{extract::State, routing::get, Router};
use libp2p::Multiaddr;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Serves this node's address at `GET /id` and fetches a configured peer's.
///
/// Fetching has a timeout and no retries: if the peer cannot be reached the
/// node does not start.
pub struct HttpBootstrapper {
    serve_addr: Option<SocketAddr>,
    peer_url: Option<String>,
    client: reqwest::Client,
    bound: watch::Sender<Option<SocketAddr>>,
}

impl HttpBootstrapper {
    pub fn new(
        serve_addr: Option<SocketAddr>,
        peer_url: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()?;
        let (bound, _) = watch::channel(None);
        Ok(Self {
            serve_addr,
            peer_url,
            client,
            bound,
        })
    }

    /// Address the `/id` endpoint is listening on, once it is
    pub fn bound_addr(&self) -> watch::Receiver<Option<SocketAddr>> {
        self.bound.subscribe()
    }
}

async fn serve_id(State(self_addr): State<Arc<String>>) -> String {
    self_addr.as_str().to_owned()
}

#[async_trait]
impl Bootstrapper for HttpBootstrapper {
    async fn run(&self, cancel: CancellationToken, self_addr: Multiaddr) -> Result<()> {
        let Some(addr) = self.serve_addr else {
            cancel.cancelled().await;
            return Ok(());
        };

        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| Error::bootstrap(format!("failed to bind bootstrap endpoint {addr}: {e}")))?;
        let local = listener.local_addr()?;
        self.bound.send_replace(Some(local));
        tracing::info!(addr = %local, self_addr = %self_addr, "serving bootstrap address");

        let app = Router::new()
            .route("/id", get(serve_id))
            .with_state(Arc::new(self_addr.to_string()));

        axum::serve(listener, app)
            .with_graceful_shutdown(cancel.cancelled_owned())
            .await
            .map_err(|e| Error::bootstrap(format!("bootstrap endpoint failed: {e}")))
    }

    async fn seed_peers(
        &self,
        cancel: CancellationToken,
        self_addr: &Multiaddr,
    ) -> Result<Vec<Multiaddr>> {
        let Some(url) = &self.peer_url else {
            return Ok(Vec::new());
        };

        let fetch = async {
            let response = self.client.get(url).send().await?.error_for_status()?;
            let body = response.text().await?;
            body.trim().parse::<Multiaddr>().map_err(|e| {
                Error::bootstrap(format!("peer {url} returned an invalid address {body:?}: {e}"))
            })
        };

        let addr = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::bootstrap("cancelled while fetching seed peer")),
            result = fetch => result.map_err(|e| match e {
                Error::Bootstrap(_) => e,
                other => Error::bootstrap(format!("failed to fetch seed peer from {url}: {other}")),
            })?,
        };

        tracing::info!(peer = %addr, "fetched seed peer");
        Ok(without_self(vec![addr], self_addr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use libp2p::PeerId;

    #[tokio::test]
    async fn test_serve_and_fetch() -> Result<()> {
        let self_addr: Multiaddr = format!("/ip4/127.0.0.1/tcp/5001/p2p/{}", PeerId::random())
            .parse()
            .map_err(|e| Error::other(format!("{e}")))?;

        let server = Arc::new(HttpBootstrapper::new(
            Some(SocketAddr::from(([127, 0, 0, 1], 0))),
            None,
            Duration::from_secs(2),
        )?);
        let mut bound = server.bound_addr();
        let cancel = CancellationToken::new();
        let task = {
            let server = server.clone();
            let cancel = cancel.clone();
            let self_addr = self_addr.clone();
            tokio::spawn(async move { server.run(cancel, self_addr).await })
        };

        let addr = loop {
            if let Some(addr) = *bound.borrow_and_update() {
                break addr;
            }
            bound
                .changed()
                .await
                .map_err(|e| Error::other(e.to_string()))?;
        };

        let client = HttpBootstrapper::new(
            None,
            Some(format!("http://{addr}/id")),
            Duration::from_secs(2),
        )?;
        let other: Multiaddr = format!("/ip4/127.0.0.1/tcp/6001/p2p/{}", PeerId::random())
            .parse()
            .map_err(|e| Error::other(format!("{e}")))?;
        let seeds = client.seed_peers(CancellationToken::new(), &other).await?;
        assert_eq!(seeds, vec![self_addr.clone()]);

        // The server itself filters out its own address
        let own = client.seed_peers(CancellationToken::new(), &self_addr).await?;
        assert!(own.is_empty());

        cancel.cancel();
        task.await.map_err(|e| Error::other(e.to_string()))??;
        Ok(())
    }

    #[tokio::test]
    async fn test_unreachable_peer_is_fatal() -> Result<()> {
        let client = HttpBootstrapper::new(
            None,
            Some("http://127.0.0.1:9/id".to_owned()),
            Duration::from_millis(500),
        )?;
        let result = client
            .seed_peers(CancellationToken::new(), &Multiaddr::empty())
            .await;
        assert!(matches!(result, Err(Error::Bootstrap(_))));
        Ok(())
    }

    #[tokio::test]
    async fn test_no_peer_means_first_node() -> Result<()> {
        let client = HttpBootstrapper::new(None, None, Duration::from_secs(1))?;
        let seeds = client
            .seed_peers(CancellationToken::new(), &Multiaddr::empty())
            .await?;
        assert!(seeds.is_empty());
        Ok(())
    }
}
