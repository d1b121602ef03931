//! In-process content server: the management API and Crane on separate
//! listeners.

use crate::api;
use crate::config::ServerConfig;
use crate::crane::Crane;
use crate::error::Result;
use crate::manager::ContentManager;
use crate::storage::create_storage;
use crate::sync::SyncEngine;
use crate::tasks::TaskManager;
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

/// The content server.
///
/// Repositories are managed, synced and published through the REST API at
/// [`ContentServer::url`]; published repositories are pulled from Crane at
/// [`ContentServer::crane_url`] once Crane has been reloaded.
pub struct ContentServer {
    api_addr: SocketAddr,
    crane_addr: SocketAddr,
    crane: Arc<Crane>,
    _api_handle: tokio::task::JoinHandle<()>,
    _crane_handle: tokio::task::JoinHandle<()>,
}

impl ContentServer {
    /// Creates and starts a new content server with the given configuration.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use crane_testkit::{ContentServer, ServerConfig};
    ///
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// let server = ContentServer::new(ServerConfig::memory()).await?;
    /// println!("API at {}, Crane at {}", server.url(), server.crane_url());
    /// # Ok(())
    /// # }
    /// ```
    pub async fn new(config: ServerConfig) -> Result<Self> {
        let storage = create_storage(&config.storage).await?;
        let crane = Arc::new(Crane::new(Arc::clone(&storage)));
        let sync = SyncEngine::new(Arc::clone(&storage), config.upstream_timeout)?;
        let manager = Arc::new(ContentManager::new(
            storage,
            sync,
            Arc::clone(&crane),
            config.crane_auto_reload,
        ));
        let tasks = Arc::new(TaskManager::new(config.worker_concurrency));

        let (api_addr, api_handle) = serve(
            &config.bind_addr(config.api_port),
            api::router(manager, tasks),
        )
        .await?;
        info!("API listening on {}", api_addr);

        crane.reload().await?;
        let (crane_addr, crane_handle) = serve(
            &config.bind_addr(config.crane_port),
            Arc::clone(&crane).router(),
        )
        .await?;
        info!("Crane listening on {}", crane_addr);

        Ok(Self {
            api_addr,
            crane_addr,
            crane,
            _api_handle: api_handle,
            _crane_handle: crane_handle,
        })
    }

    /// Returns the address the management API is bound to.
    pub fn addr(&self) -> SocketAddr {
        self.api_addr
    }

    /// Returns the full URL of the management API.
    pub fn url(&self) -> String {
        format!("http://{}", self.api_addr)
    }

    /// Returns the address Crane is bound to.
    pub fn crane_addr(&self) -> SocketAddr {
        self.crane_addr
    }

    /// Returns the full URL of Crane.
    pub fn crane_url(&self) -> String {
        format!("http://{}", self.crane_addr)
    }

    /// Makes Crane re-read published metadata. Returns the number of
    /// repositories it now serves.
    pub async fn reload_crane(&self) -> Result<usize> {
        self.crane.reload().await
    }
}

pub(crate) async fn serve(
    bind_addr: &str,
    app: Router,
) -> Result<(SocketAddr, tokio::task::JoinHandle<()>)> {
    let listener = TcpListener::bind(bind_addr).await?;
    let addr = listener.local_addr()?;
    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });
    Ok((addr, handle))
}
