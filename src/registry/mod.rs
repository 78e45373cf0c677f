//! OCI Distribution API endpoint.
//!
//! Serves the subset container runtimes use when pulling through a mirror:
//! manifests by tag or digest and blobs by digest, with GET and HEAD.

pub mod handlers;
pub mod metrics;
pub mod resolver;

pub use handlers::RegistryState;
pub use metrics::{MetricsSnapshot, MirrorMetrics};
pub use resolver::{
    Body, ContentRequest, ContentResponse, Resolver, ResolverConfig, Source,
    CONTENT_DIGEST_HEADER, MIRRORED_HEADER,
};

use crate::Result;
use axum::{routing::get, Router};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

/// Create the registry router
pub fn create_router(resolver: Arc<Resolver>) -> Router {
    Router::new()
        .route("/v2", get(handlers::api_version))
        .route("/v2/", get(handlers::api_version))
        .route(
            "/v2/*path",
            get(handlers::serve_content).head(handlers::serve_content),
        )
        .route("/healthz", get(handlers::healthz))
        .layer(TraceLayer::new_for_http())
        .with_state(RegistryState { resolver })
}

/// Serve the registry on `listener` until `cancel` fires
pub async fn serve(
    listener: TcpListener,
    resolver: Arc<Resolver>,
    cancel: CancellationToken,
) -> Result<()> {
    let addr = listener.local_addr()?;
    tracing::info!(%addr, "registry listening");
    axum::serve(listener, create_router(resolver))
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await?;
    tracing::info!("registry stopped");
    Ok(())
}
