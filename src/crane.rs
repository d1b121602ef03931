//! Crane: the registry front end for published repositories.
//!
//! Crane only knows what it loaded from published metadata at the last
//! [`Crane::reload`]; publishing alone does not change what it serves.

use crate::digest;
use crate::error::{RegistryError, Result, ServerError};
use crate::manifest::ManifestList;
use crate::media_type::{ManifestKind, MANIFEST_LIST_V2};
use crate::publish::PublishedRepository;
use crate::resolve::resolve;
use crate::storage::SharedStorage;
use axum::{
    extract::{Path, State},
    http::{header::ACCEPT, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

type RegistryResult<T> = std::result::Result<T, RegistryError>;

const API_VERSION_HEADER: &str = "Docker-Distribution-API-Version";
const API_VERSION: &str = "registry/2.0";

fn strip_leading_slash(s: &str) -> &str {
    s.strip_prefix('/').unwrap_or(s)
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum RegistryPath<'a> {
    Manifest { name: &'a str, reference: &'a str },
    Blob { name: &'a str, digest: &'a str },
    Tags { name: &'a str },
}

/// Splits `/v2/<name>/<endpoint>` paths; `<name>` may contain slashes.
pub(crate) fn parse_registry_path(path: &str) -> Option<RegistryPath<'_>> {
    let path = strip_leading_slash(path);
    let parsed = if let Some(name) = path.strip_suffix("/tags/list") {
        RegistryPath::Tags { name }
    } else if let Some((name, reference)) = path.rsplit_once("/manifests/") {
        RegistryPath::Manifest { name, reference }
    } else if let Some((name, digest)) = path.rsplit_once("/blobs/") {
        RegistryPath::Blob { name, digest }
    } else {
        return None;
    };

    let (name, leaf) = match &parsed {
        RegistryPath::Manifest { name, reference } => (*name, *reference),
        RegistryPath::Blob { name, digest } => (*name, *digest),
        RegistryPath::Tags { name } => (*name, "list"),
    };
    if name.is_empty() || leaf.is_empty() || leaf.contains('/') {
        return None;
    }
    Some(parsed)
}

/// Every `Accept` value of a request as one comma-separated list. Clients
/// such as the Docker daemon send each media type on its own line.
pub(crate) fn accept_header(headers: &HeaderMap) -> Option<String> {
    let values: Vec<&str> = headers
        .get_all(ACCEPT)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect();
    if values.is_empty() {
        None
    } else {
        Some(values.join(", "))
    }
}

pub struct Crane {
    storage: SharedStorage,
    catalog: RwLock<BTreeMap<String, PublishedRepository>>,
}

impl Crane {
    pub fn new(storage: SharedStorage) -> Self {
        Self {
            storage,
            catalog: RwLock::new(BTreeMap::new()),
        }
    }

    /// Re-reads every published metadata document and returns how many
    /// repositories Crane now serves.
    pub async fn reload(&self) -> Result<usize> {
        let mut catalog: BTreeMap<String, PublishedRepository> = BTreeMap::new();
        for document in self.storage.load_metadata().await? {
            let repository = match serde_json::from_slice::<PublishedRepository>(&document) {
                Ok(repository) => repository,
                Err(e) => {
                    warn!("Skipping unreadable metadata document: {}", e);
                    continue;
                }
            };
            match catalog.get(&repository.repo_registry_id) {
                Some(current) if current.supersedes(&repository) => {
                    warn!(
                        "{} is published by both {} and {}; serving {}",
                        repository.repo_registry_id,
                        current.repository,
                        repository.repository,
                        current.repository
                    );
                }
                _ => {
                    catalog.insert(repository.repo_registry_id.clone(), repository);
                }
            }
        }
        let count = catalog.len();
        *self.catalog.write().await = catalog;
        info!("Crane loaded {} repositories", count);
        Ok(count)
    }

    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route("/crane/repositories", get(list_v1_repositories))
            .route("/crane/repositories/v1", get(list_v1_repositories))
            .route("/crane/repositories/v2", get(list_v2_repositories))
            .route("/v2/", get(api_version))
            .route("/v2/{*path}", get(registry_get))
            .layer(tower::ServiceBuilder::new().layer(TraceLayer::new_for_http()))
            .with_state(self)
    }

    async fn repository(&self, name: &str) -> RegistryResult<PublishedRepository> {
        self.catalog
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::NameUnknown(name.to_string()))
    }

    async fn get_manifest(
        &self,
        name: &str,
        reference: &str,
        accept: Option<&str>,
    ) -> RegistryResult<Response> {
        let repository = self.repository(name).await?;
        let unknown = || RegistryError::ManifestUnknown(format!("{name}:{reference}"));

        if digest::is_digest(reference) {
            if !repository.manifests.contains(reference) {
                return Err(unknown());
            }
            let entry = self
                .storage
                .get_manifest(reference)
                .await?
                .ok_or_else(unknown)?;
            return Ok(manifest_response(reference, entry.content_type, entry.data));
        }

        let tag = repository.tags.get(reference).ok_or_else(unknown)?;
        let list = match &tag.list {
            Some(list_digest) => {
                if !repository.manifests.contains(list_digest) {
                    return Err(unknown());
                }
                let entry = self
                    .storage
                    .get_manifest(list_digest)
                    .await?
                    .ok_or_else(unknown)?;
                Some(
                    serde_json::from_slice::<ManifestList>(&entry.data)
                        .map_err(ServerError::from)?,
                )
            }
            None => None,
        };

        let requested = ManifestKind::from_accept(accept);
        let selected = resolve(tag, list.as_ref(), requested).map_err(|reason| {
            info!("No {} manifest for {}:{}: {}", requested, name, reference, reason);
            unknown()
        })?;
        if !repository.manifests.contains(&selected.digest) {
            return Err(unknown());
        }
        debug!(
            "Serving {} manifest {} for {}:{}",
            selected.kind, selected.digest, name, reference
        );

        let entry = self
            .storage
            .get_manifest(&selected.digest)
            .await?
            .ok_or_else(unknown)?;
        let content_type = match selected.kind {
            ManifestKind::List => MANIFEST_LIST_V2.to_string(),
            _ => entry.content_type,
        };
        Ok(manifest_response(&selected.digest, content_type, entry.data))
    }

    async fn get_blob(
        &self,
        name: &str,
        blob_digest: &str,
    ) -> RegistryResult<Response> {
        let repository = self.repository(name).await?;
        let unknown = || RegistryError::BlobUnknown(blob_digest.to_string());
        if !repository.blobs.contains(blob_digest) {
            return Err(unknown());
        }
        let blob = self
            .storage
            .get_blob(blob_digest)
            .await?
            .ok_or_else(unknown)?;
        Ok((
            StatusCode::OK,
            [
                ("Content-Type", "application/octet-stream".to_string()),
                ("Docker-Content-Digest", blob_digest.to_string()),
            ],
            blob,
        )
            .into_response())
    }

    async fn list_tags(&self, name: &str) -> RegistryResult<Response> {
        let repository = self.repository(name).await?;
        let tags: Vec<&String> = repository.tags.keys().collect();
        Ok(Json(json!({"name": name, "tags": tags})).into_response())
    }
}

fn manifest_response(digest: &str, content_type: String, data: Vec<u8>) -> Response {
    (
        StatusCode::OK,
        [
            ("Content-Type", content_type),
            ("Docker-Content-Digest", digest.to_string()),
            (API_VERSION_HEADER, API_VERSION.to_string()),
        ],
        data,
    )
        .into_response()
}

async fn api_version() -> impl IntoResponse {
    ([(API_VERSION_HEADER, API_VERSION)], Json(json!({})))
}

async fn registry_get(
    State(crane): State<Arc<Crane>>,
    Path(path): Path<String>,
    headers: HeaderMap,
) -> RegistryResult<Response> {
    match parse_registry_path(&path) {
        Some(RegistryPath::Manifest { name, reference }) => {
            let accept = accept_header(&headers);
            info!("Getting manifest: {}/{} (accept: {:?})", name, reference, accept);
            crane.get_manifest(name, reference, accept.as_deref()).await
        }
        Some(RegistryPath::Blob { name, digest }) => {
            info!("Getting blob: {}/{}", name, digest);
            crane.get_blob(name, digest).await
        }
        Some(RegistryPath::Tags { name }) => crane.list_tags(name).await,
        None => Err(RegistryError::NameUnknown(path.clone())),
    }
}

async fn list_v1_repositories(State(crane): State<Arc<Crane>>) -> Json<Value> {
    let catalog = crane.catalog.read().await;
    let listing: Map<String, Value> = catalog
        .values()
        .filter(|r| r.has_v1())
        .map(|r| {
            (
                r.repo_registry_id.clone(),
                json!({
                    "protected": r.protected,
                    "image_ids": r.image_ids,
                    "tags": r.v1_tags,
                }),
            )
        })
        .collect();
    Json(Value::Object(listing))
}

async fn list_v2_repositories(State(crane): State<Arc<Crane>>) -> Json<Value> {
    let catalog = crane.catalog.read().await;
    let listing: Map<String, Value> = catalog
        .values()
        .filter(|r| r.has_v2())
        .map(|r| {
            let tags: Vec<&String> = r.tags.keys().collect();
            (
                r.repo_registry_id.clone(),
                json!({
                    "protected": r.protected,
                    "tags": tags,
                }),
            )
        })
        .collect();
    Json(Value::Object(listing))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("busybox/manifests/latest", Some(RegistryPath::Manifest { name: "busybox", reference: "latest" }))]
    #[case("/a/b/c/manifests/latest", Some(RegistryPath::Manifest { name: "a/b/c", reference: "latest" }))]
    #[case("a/b/blobs/sha256:00", Some(RegistryPath::Blob { name: "a/b", digest: "sha256:00" }))]
    #[case("a/b/c/d/tags/list", Some(RegistryPath::Tags { name: "a/b/c/d" }))]
    #[case("manifests/latest", None)]
    #[case("a/manifests/", None)]
    #[case("a/catalog", None)]
    fn registry_paths(#[case] path: &str, #[case] expected: Option<RegistryPath<'static>>) {
        assert_eq!(parse_registry_path(path), expected);
    }

    #[tokio::test]
    async fn reload_skips_unreadable_documents() {
        let storage: SharedStorage = Arc::new(crate::storage::MemoryStorage::new());
        let published = PublishedRepository {
            repo_registry_id: "a/b".to_string(),
            repository: "repo".to_string(),
            ..Default::default()
        };
        storage
            .store_metadata("a/b", serde_json::to_vec(&published).unwrap())
            .await
            .unwrap();
        storage
            .store_metadata("broken", b"not json".to_vec())
            .await
            .unwrap();

        let crane = Crane::new(storage);
        assert_eq!(crane.reload().await.unwrap(), 1);
        assert!(crane.repository("a/b").await.is_ok());
        assert!(matches!(
            crane.repository("broken").await,
            Err(RegistryError::NameUnknown(_))
        ));
    }

    #[test]
    fn accept_lines_are_combined() {
        let mut headers = HeaderMap::new();
        assert_eq!(accept_header(&headers), None);

        for value in [
            crate::media_type::MANIFEST_V1_SIGNED,
            crate::media_type::MANIFEST_V2,
            MANIFEST_LIST_V2,
        ] {
            headers.append(ACCEPT, value.parse().unwrap());
        }
        let accept = accept_header(&headers);
        assert_eq!(
            ManifestKind::from_accept(accept.as_deref()),
            ManifestKind::List
        );
    }

    #[tokio::test]
    async fn tags_only_resolve_to_published_manifests() {
        let storage: SharedStorage = Arc::new(crate::storage::MemoryStorage::new());
        let body = br#"{"schemaVersion":2}"#.to_vec();
        let manifest = digest::sha256_digest(&body);
        storage
            .store_manifest(
                manifest.clone(),
                crate::storage::ManifestEntry {
                    data: body,
                    content_type: crate::media_type::MANIFEST_V2.to_string(),
                },
            )
            .await
            .unwrap();

        let mut published = PublishedRepository {
            repo_registry_id: "a/b".to_string(),
            repository: "repo".to_string(),
            ..Default::default()
        };
        published.tags.insert(
            "latest".to_string(),
            crate::resolve::TagContent {
                schema2: Some(manifest.clone()),
                ..Default::default()
            },
        );
        storage
            .store_metadata("repo/dist", serde_json::to_vec(&published).unwrap())
            .await
            .unwrap();

        let crane = Crane::new(Arc::clone(&storage));
        crane.reload().await.unwrap();
        let accept = Some(crate::media_type::MANIFEST_V2);
        assert!(matches!(
            crane.get_manifest("a/b", "latest", accept).await,
            Err(RegistryError::ManifestUnknown(_))
        ));

        published.manifests.insert(manifest);
        storage
            .store_metadata("repo/dist", serde_json::to_vec(&published).unwrap())
            .await
            .unwrap();
        crane.reload().await.unwrap();
        let response = crane.get_manifest("a/b", "latest", accept).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
