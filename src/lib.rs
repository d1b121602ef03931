pub mod api;
pub mod client;
pub mod config;
pub mod crane;
pub mod digest;
pub mod error;
pub mod manager;
pub mod manifest;
pub mod media_type;
pub mod publish;
pub mod repository;
pub mod resolve;
pub mod schema;
pub mod server;
pub mod storage;
pub mod sync;
pub mod tasks;
pub mod upstream;

pub use client::{ApiClient, CraneClient};
pub use config::{ServerConfig, StorageBackend};
pub use error::{ClientError, RegistryError, Result, ServerError};
pub use manifest::{Manifest, ManifestList, Platform};
pub use media_type::ManifestKind;
pub use repository::{Distributor, RepositoryCreate};
pub use server::ContentServer;
pub use upstream::{UpstreamCatalog, UpstreamRegistry};

/// Installs a compact `fmt` subscriber filtered by `RUST_LOG`, defaulting to
/// `crane_testkit=info`. Safe to call more than once.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("crane_testkit=info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .with_target(true)
        .compact()
        .try_init();
}
