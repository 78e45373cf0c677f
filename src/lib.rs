//! hyprmirror - cluster-local peer-to-peer mirror for container image content
//!
//! Every node runs one instance. Instances find each other through a Kademlia
//! overlay, advertise the image manifests and layers they hold, and serve an
//! OCI Distribution API endpoint that pulls content from peers instead of the
//! external registry.

pub mod config;
pub mod error;
pub mod oci;
pub mod registry;
pub mod routing;
pub mod service;
pub mod state;
pub mod store;
pub mod throttle;

// Re-export commonly used types
pub use config::MirrorConfig;
pub use error::{Error, Result};
pub use oci::Digest;
pub use routing::{ContentRouter, PeerRecord};
pub use service::MirrorService;
pub use store::ContentStore;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize tracing for the library.
///
/// `RUST_LOG` takes precedence over `default_level`.
pub fn init_tracing(default_level: &str) -> Result<()> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("hyprmirror_core={default_level},hyprmirror={default_level}").into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .try_init()
        .map_err(|_| Error::other("Tracing already initialized"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
