use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub enum StorageBackend {
    Memory,
    TempDir,
    Directory(PathBuf),
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub storage: StorageBackend,
    pub host: String,
    pub api_port: Option<u16>,
    pub crane_port: Option<u16>,
    /// Number of tasks allowed to run at once.
    pub worker_concurrency: usize,
    /// Reload Crane after every publish and repository delete.
    pub crane_auto_reload: bool,
    /// Timeout for requests made to upstream feeds.
    pub upstream_timeout: Duration,
}

impl ServerConfig {
    pub fn new(storage: StorageBackend) -> Self {
        Self {
            storage,
            host: "127.0.0.1".to_string(),
            api_port: None,
            crane_port: None,
            worker_concurrency: 4,
            crane_auto_reload: false,
            upstream_timeout: Duration::from_secs(30),
        }
    }

    pub fn memory() -> Self {
        Self::new(StorageBackend::Memory)
    }

    pub fn temp_dir() -> Self {
        Self::new(StorageBackend::TempDir)
    }

    pub fn directory(path: PathBuf) -> Self {
        Self::new(StorageBackend::Directory(path))
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_api_port(mut self, port: u16) -> Self {
        self.api_port = Some(port);
        self
    }

    pub fn with_crane_port(mut self, port: u16) -> Self {
        self.crane_port = Some(port);
        self
    }

    pub fn with_worker_concurrency(mut self, workers: usize) -> Self {
        self.worker_concurrency = workers.max(1);
        self
    }

    pub fn with_crane_auto_reload(mut self, enabled: bool) -> Self {
        self.crane_auto_reload = enabled;
        self
    }

    pub fn with_upstream_timeout(mut self, timeout: Duration) -> Self {
        self.upstream_timeout = timeout;
        self
    }

    pub(crate) fn bind_addr(&self, port: Option<u16>) -> String {
        format!("{}:{}", self.host, port.unwrap_or(0))
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::memory()
    }
}
