//! An upstream registry to sync from.
//!
//! Images are generated from their name, tag and platform, so the same
//! catalog always produces the same digests. Negotiation follows Docker Hub:
//! schema 1 manifests are handed to every legacy client that asks for one,
//! everything else goes through [`crate::resolve::resolve`].

use crate::crane::{accept_header, parse_registry_path, RegistryPath};
use crate::digest::{self, sha256_digest};
use crate::error::{RegistryError, Result};
use crate::manifest::{
    Descriptor, FsLayer, Jwk, ManifestList, ManifestListEntry, ManifestV1, ManifestV2, Platform,
    Signature, SignatureHeader, V1History,
};
use crate::media_type::{self, ManifestKind};
use crate::resolve::{resolve, TagContent};
use crate::storage::ManifestEntry;
use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tower_http::trace::TraceLayer;
use tracing::info;

#[derive(Debug, Clone, Default)]
struct UpstreamRepository {
    tags: BTreeMap<String, TagContent>,
    manifests: HashMap<String, ManifestEntry>,
    blobs: HashMap<String, Vec<u8>>,
}

impl UpstreamRepository {
    fn put_manifest(&mut self, kind: ManifestKind, data: Vec<u8>) -> String {
        let digest = sha256_digest(&data);
        self.manifests.insert(
            digest.clone(),
            ManifestEntry {
                data,
                content_type: kind.media_type().to_string(),
            },
        );
        digest
    }

    fn put_blob(&mut self, data: Vec<u8>) -> Descriptor {
        let digest = sha256_digest(&data);
        let size = data.len() as u64;
        self.blobs.insert(digest.clone(), data);
        Descriptor {
            media_type: media_type::IMAGE_LAYER.to_string(),
            size,
            digest,
            urls: None,
        }
    }

    /// Stores a schema 2 image and returns its manifest digest and size.
    fn put_v2_image(&mut self, name: &str, tag: &str, platform: &Platform) -> (String, u64) {
        let mut config = self.put_blob(
            serde_json::to_vec(&json!({
                "architecture": platform.architecture,
                "os": platform.os,
                "variant": platform.variant,
            }))
            .unwrap_or_default(),
        );
        config.media_type = media_type::IMAGE_CONFIG.to_string();
        let layer = self.put_blob(layer_bytes(name, tag, platform));

        let manifest = ManifestV2 {
            schema_version: 2,
            media_type: media_type::MANIFEST_V2.to_string(),
            config,
            layers: vec![layer],
        };
        let data = serde_json::to_vec_pretty(&manifest).unwrap_or_default();
        let size = data.len() as u64;
        (self.put_manifest(ManifestKind::V2, data), size)
    }

    fn put_schema1_image(&mut self, name: &str, tag: &str, platform: &Platform) -> String {
        let layer = self.put_blob(layer_bytes(name, tag, platform));
        let image_id = sha256_digest(format!("{name}:{tag}:{}", platform_key(platform)).as_bytes());
        let image_id = image_id.trim_start_matches("sha256:").to_string();

        let manifest = ManifestV1 {
            schema_version: 1,
            name: name.to_string(),
            tag: tag.to_string(),
            architecture: platform.architecture.clone(),
            fs_layers: vec![FsLayer {
                blob_sum: layer.digest,
            }],
            history: vec![V1History {
                v1_compatibility: json!({
                    "id": image_id,
                    "architecture": platform.architecture,
                    "os": platform.os,
                })
                .to_string(),
            }],
            signatures: vec![Signature {
                header: SignatureHeader {
                    jwk: Jwk {
                        crv: "P-256".to_string(),
                        kid: "UPST:REAM:TEST:KEY0".to_string(),
                        kty: "EC".to_string(),
                        x: "x".to_string(),
                        y: "y".to_string(),
                    },
                    alg: "ES256".to_string(),
                },
                protected: "e30".to_string(),
                signature: "c2lnbmF0dXJl".to_string(),
            }],
        };
        let data = serde_json::to_vec_pretty(&manifest).unwrap_or_default();
        self.put_manifest(ManifestKind::V1, data)
    }
}

fn platform_key(platform: &Platform) -> String {
    match &platform.variant {
        Some(variant) => format!("{}/{}/{}", platform.os, platform.architecture, variant),
        None => format!("{}/{}", platform.os, platform.architecture),
    }
}

fn layer_bytes(name: &str, tag: &str, platform: &Platform) -> Vec<u8> {
    format!("layer of {name}:{tag} for {}", platform_key(platform)).into_bytes()
}

/// The repositories an [`UpstreamRegistry`] serves.
#[derive(Debug, Clone, Default)]
pub struct UpstreamCatalog {
    repositories: BTreeMap<String, UpstreamRepository>,
}

impl UpstreamCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// A single-platform tag with both a schema 2 and a schema 1 manifest.
    pub fn add_image(&mut self, name: &str, tag: &str, platform: Platform) -> &mut Self {
        let repository = self.repositories.entry(name.to_string()).or_default();
        let (schema2, _) = repository.put_v2_image(name, tag, &platform);
        let schema1 = repository.put_schema1_image(name, tag, &platform);
        repository.tags.insert(
            tag.to_string(),
            TagContent {
                schema1: Some(schema1),
                schema2: Some(schema2),
                list: None,
            },
        );
        self
    }

    /// A tag served only as a schema 1 manifest, like a v1-only registry.
    pub fn add_schema1_image(&mut self, name: &str, tag: &str, platform: Platform) -> &mut Self {
        let repository = self.repositories.entry(name.to_string()).or_default();
        let schema1 = repository.put_schema1_image(name, tag, &platform);
        repository.tags.insert(
            tag.to_string(),
            TagContent {
                schema1: Some(schema1),
                ..Default::default()
            },
        );
        self
    }

    /// A multi-platform tag. When `schema1` is given, legacy clients get a
    /// schema 1 manifest built for that platform, whether or not the list
    /// contains it.
    pub fn add_manifest_list(
        &mut self,
        name: &str,
        tag: &str,
        platforms: &[Platform],
        schema1: Option<Platform>,
    ) -> &mut Self {
        let repository = self.repositories.entry(name.to_string()).or_default();
        let manifests = platforms
            .iter()
            .map(|platform| {
                let (digest, size) = repository.put_v2_image(name, tag, platform);
                ManifestListEntry {
                    media_type: media_type::MANIFEST_V2.to_string(),
                    size,
                    digest,
                    platform: platform.clone(),
                }
            })
            .collect();
        let list = ManifestList {
            schema_version: 2,
            media_type: media_type::MANIFEST_LIST_V2.to_string(),
            manifests,
        };
        let list = repository.put_manifest(
            ManifestKind::List,
            serde_json::to_vec_pretty(&list).unwrap_or_default(),
        );
        let schema1 = schema1.map(|platform| repository.put_schema1_image(name, tag, &platform));
        repository.tags.insert(
            tag.to_string(),
            TagContent {
                schema1,
                schema2: None,
                list: Some(list),
            },
        );
        self
    }

    /// Removes a tag. Its manifests stay reachable by digest.
    pub fn remove_tag(&mut self, name: &str, tag: &str) -> &mut Self {
        if let Some(repository) = self.repositories.get_mut(name) {
            repository.tags.remove(tag);
        }
        self
    }

    /// The digest of the manifest stored for `tag` in the given form.
    pub fn tag_digest(&self, name: &str, tag: &str, kind: ManifestKind) -> Option<String> {
        let tag = self.repositories.get(name)?.tags.get(tag)?;
        match kind {
            ManifestKind::V1 => tag.schema1.clone(),
            ManifestKind::V2 => tag.schema2.clone(),
            ManifestKind::List => tag.list.clone(),
        }
    }

    fn manifest_for(
        &self,
        name: &str,
        reference: &str,
        accept: Option<&str>,
    ) -> std::result::Result<(String, ManifestEntry), RegistryError> {
        let repository = self
            .repositories
            .get(name)
            .ok_or_else(|| RegistryError::NameUnknown(name.to_string()))?;
        let unknown = || RegistryError::ManifestUnknown(format!("{name}:{reference}"));
        let lookup = |digest: &str| {
            repository
                .manifests
                .get(digest)
                .cloned()
                .map(|entry| (digest.to_string(), entry))
                .ok_or_else(unknown)
        };

        if digest::is_digest(reference) {
            return lookup(reference);
        }

        let tag = repository.tags.get(reference).ok_or_else(unknown)?;
        let requested = ManifestKind::from_accept(accept);
        if requested == ManifestKind::V1 {
            if let Some(schema1) = &tag.schema1 {
                return lookup(schema1);
            }
        }

        let list = match &tag.list {
            Some(digest) => {
                let (_, entry) = lookup(digest)?;
                Some(
                    serde_json::from_slice::<ManifestList>(&entry.data)
                        .map_err(crate::error::ServerError::from)?,
                )
            }
            None => None,
        };
        let selected = resolve(tag, list.as_ref(), requested).map_err(|_| unknown())?;
        lookup(&selected.digest)
    }
}

type SharedCatalog = Arc<RwLock<UpstreamCatalog>>;

/// A running upstream registry.
pub struct UpstreamRegistry {
    addr: SocketAddr,
    catalog: SharedCatalog,
    _handle: tokio::task::JoinHandle<()>,
}

impl UpstreamRegistry {
    /// Starts serving `catalog` on an ephemeral localhost port.
    pub async fn start(catalog: UpstreamCatalog) -> Result<Self> {
        let catalog: SharedCatalog = Arc::new(RwLock::new(catalog));
        let app = Router::new()
            .route("/v2/", get(api_version))
            .route("/v2/{*path}", get(registry_get))
            .layer(tower::ServiceBuilder::new().layer(TraceLayer::new_for_http()))
            .with_state(Arc::clone(&catalog));

        let (addr, handle) = crate::server::serve("127.0.0.1:0", app).await?;
        info!("Upstream registry listening on {}", addr);

        Ok(Self {
            addr,
            catalog,
            _handle: handle,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// The feed URL importers should point at.
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Changes what the registry serves from now on.
    pub async fn update<R>(&self, change: impl FnOnce(&mut UpstreamCatalog) -> R) -> R {
        change(&mut *self.catalog.write().await)
    }

    pub async fn tag_digest(&self, name: &str, tag: &str, kind: ManifestKind) -> Option<String> {
        self.catalog.read().await.tag_digest(name, tag, kind)
    }
}

async fn api_version() -> impl IntoResponse {
    Json(json!({}))
}

async fn registry_get(
    State(catalog): State<SharedCatalog>,
    Path(path): Path<String>,
    headers: HeaderMap,
) -> std::result::Result<Response, RegistryError> {
    let catalog = catalog.read().await;
    match parse_registry_path(&path) {
        Some(RegistryPath::Manifest { name, reference }) => {
            let accept = accept_header(&headers);
            let (digest, entry) = catalog.manifest_for(name, reference, accept.as_deref())?;
            Ok((
                StatusCode::OK,
                [
                    ("Content-Type", entry.content_type),
                    ("Docker-Content-Digest", digest),
                ],
                entry.data,
            )
                .into_response())
        }
        Some(RegistryPath::Blob { name, digest }) => {
            let blob = catalog
                .repositories
                .get(name)
                .and_then(|r| r.blobs.get(digest))
                .cloned()
                .ok_or_else(|| RegistryError::BlobUnknown(digest.to_string()))?;
            Ok((StatusCode::OK, blob).into_response())
        }
        Some(RegistryPath::Tags { name }) => {
            let repository = catalog
                .repositories
                .get(name)
                .ok_or_else(|| RegistryError::NameUnknown(name.to_string()))?;
            let tags: Vec<&String> = repository.tags.keys().collect();
            Ok(Json(json!({"name": name, "tags": tags})).into_response())
        }
        None => Err(RegistryError::NameUnknown(path.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_is_deterministic() {
        let build = || {
            let mut catalog = UpstreamCatalog::new();
            catalog.add_manifest_list(
                "dmage/busybox",
                "latest",
                &[Platform::new("amd64", "linux"), Platform::new("arm", "linux")],
                Some(Platform::new("amd64", "linux")),
            );
            catalog
        };
        let first = build().tag_digest("dmage/busybox", "latest", ManifestKind::List);
        let second = build().tag_digest("dmage/busybox", "latest", ManifestKind::List);
        assert!(first.is_some());
        assert_eq!(first, second);
    }

    #[test]
    fn legacy_clients_get_schema1_even_without_default_platform() {
        let mut catalog = UpstreamCatalog::new();
        catalog.add_manifest_list(
            "dmage/busybox",
            "fake-arm-only",
            &[Platform::new("arm", "linux")],
            Some(Platform::new("arm", "linux")),
        );

        let (digest, entry) = catalog
            .manifest_for("dmage/busybox", "fake-arm-only", None)
            .unwrap();
        assert_eq!(entry.content_type, media_type::MANIFEST_V1_SIGNED);
        assert_eq!(
            Some(digest),
            catalog.tag_digest("dmage/busybox", "fake-arm-only", ManifestKind::V1)
        );

        assert!(matches!(
            catalog.manifest_for("dmage/busybox", "fake-arm-only", Some(media_type::MANIFEST_V2)),
            Err(RegistryError::ManifestUnknown(_))
        ));
    }
}
