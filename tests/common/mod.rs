#![allow(dead_code)]

use crane_testkit::{
    ApiClient, ContentServer, CraneClient, Distributor, Platform, RepositoryCreate, ServerConfig,
    UpstreamCatalog, UpstreamRegistry,
};

/// Multi-arch image with an amd64/linux build and a schema 1 manifest.
pub const MANIFEST_LIST_TEST: &str = "dmage/manifest-list-test";
/// Holds `fake-arm-only`, a list with no amd64/linux build.
pub const ARM_ONLY: &str = "dmage/busybox";

/// The images tests sync from, laid out like the Docker Hub repositories the
/// compatibility suite was written against.
pub fn docker_hub() -> UpstreamCatalog {
    let amd64 = Platform::new("amd64", "linux");
    let arm = Platform::new("arm", "linux").with_variant("v7");
    let mut catalog = UpstreamCatalog::new();
    catalog
        .add_manifest_list(
            MANIFEST_LIST_TEST,
            "latest",
            &[amd64.clone(), arm.clone()],
            Some(amd64.clone()),
        )
        .add_image(MANIFEST_LIST_TEST, "amd64", amd64.clone())
        .add_manifest_list(ARM_ONLY, "fake-arm-only", &[arm.clone()], Some(arm))
        .add_image("library/busybox", "latest", amd64);
    catalog
}

pub struct Deployment {
    pub upstream: UpstreamRegistry,
    pub server: ContentServer,
    pub api: ApiClient,
    pub crane: CraneClient,
}

impl Deployment {
    pub async fn start(config: ServerConfig) -> Self {
        crane_testkit::init_tracing();
        let upstream = UpstreamRegistry::start(docker_hub()).await.unwrap();
        let server = ContentServer::new(config.with_api_port(0).with_crane_port(0))
            .await
            .unwrap();
        let api = ApiClient::new(server.url());
        let crane = CraneClient::new(server.crane_url());
        Self {
            upstream,
            server,
            api,
            crane,
        }
    }

    pub async fn memory() -> Self {
        Self::start(ServerConfig::memory()).await
    }

    /// A docker repository fed from the upstream registry, with one
    /// distributor.
    pub fn repository(&self, upstream_name: &str) -> RepositoryCreate {
        RepositoryCreate::docker()
            .with_feed(self.upstream.url(), upstream_name)
            .with_schemas(false, true)
            .with_distributor(Distributor::docker())
    }

    /// Creates, syncs and publishes `body` through its first distributor,
    /// without reloading Crane. Returns the repository id.
    pub async fn sync_and_publish(&self, body: RepositoryCreate) -> String {
        let distributor_id = body.distributors[0].distributor_id.clone();
        let created = self.api.create_repository(&body).await.unwrap();
        let id = created["id"].as_str().unwrap().to_string();
        self.api.sync_repository(&id).await.unwrap();
        self.api.publish_repository(&id, &distributor_id).await.unwrap();
        id
    }

    /// [`Deployment::sync_and_publish`], then makes Crane read the result.
    pub async fn publish_to_crane(&self, body: RepositoryCreate) -> String {
        let id = self.sync_and_publish(body).await;
        self.server.reload_crane().await.unwrap();
        id
    }
}
