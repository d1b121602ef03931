//! Fetches tags, manifests and blobs from an upstream v2 registry.

use crate::digest::{self, sha256_digest};
use crate::error::{Result, ServerError};
use crate::manifest::{Manifest, ManifestV1};
use crate::media_type::{self, ManifestKind};
use crate::repository::{ImporterConfig, RepositoryContent};
use crate::resolve::TagContent;
use crate::storage::{ManifestEntry, SharedStorage};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Upstream names without a namespace live under `library/`.
pub fn normalize_upstream_name(name: &str) -> String {
    if name.contains('/') {
        name.to_string()
    } else {
        format!("library/{name}")
    }
}

/// Records the v1 image ids of a schema 1 manifest; the top image is the
/// one the tag points at.
fn record_images(content: &mut RepositoryContent, tag: &str, schema1: &ManifestV1) {
    let ids = schema1.image_ids();
    if let Some(top) = ids.first() {
        content.v1_tags.insert(tag.to_string(), top.clone());
    }
    for id in ids {
        if !content.image_ids.contains(&id) {
            content.image_ids.push(id);
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncReport {
    pub tags: usize,
    pub manifests: usize,
    pub manifest_lists: usize,
    pub blobs_downloaded: usize,
    pub image_ids: usize,
}

#[derive(Deserialize)]
struct TagList {
    #[serde(default)]
    tags: Option<Vec<String>>,
}

struct Fetched {
    digest: String,
    manifest: Manifest,
    entry: ManifestEntry,
}

pub struct SyncEngine {
    http: reqwest::Client,
    storage: SharedStorage,
}

/// The upstream repository a sync reads from.
struct Feed<'a> {
    base: &'a str,
    name: String,
}

impl Feed<'_> {
    fn url(&self, suffix: &str) -> String {
        format!("{}/v2/{}/{}", self.base, self.name, suffix)
    }
}

impl SyncEngine {
    pub fn new(storage: SharedStorage, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { http, storage })
    }

    /// Downloads everything the importer config points at and returns the
    /// content the repository should now be associated with.
    pub async fn sync(&self, importer: &ImporterConfig) -> Result<(RepositoryContent, SyncReport)> {
        if !importer.enable_v1 && !importer.enable_v2 {
            return Err(ServerError::InvalidInput(
                "at least one of enable_v1 and enable_v2 must be set".to_string(),
            ));
        }
        let base = importer
            .feed
            .as_deref()
            .ok_or_else(|| ServerError::InvalidInput("importer has no feed".to_string()))?;
        let upstream_name = importer.upstream_name.as_deref().ok_or_else(|| {
            ServerError::InvalidInput("importer has no upstream_name".to_string())
        })?;
        let feed = Feed {
            base: base.trim_end_matches('/'),
            name: normalize_upstream_name(upstream_name),
        };
        info!("Syncing {} from {}", feed.name, feed.base);

        let mut content = RepositoryContent::default();
        let mut report = SyncReport::default();

        for tag in self.list_tags(&feed).await? {
            let mut tag_content = TagContent::default();

            if importer.enable_v2 {
                let accept = [media_type::MANIFEST_LIST_V2, media_type::MANIFEST_V2].join(", ");
                if let Some(fetched) = self.fetch_manifest(&feed, &tag, &accept).await? {
                    match fetched.manifest.kind() {
                        ManifestKind::List => {
                            for child in fetched.manifest.referenced_manifests() {
                                let child = self
                                    .fetch_manifest(&feed, &child, media_type::MANIFEST_V2)
                                    .await?
                                    .ok_or_else(|| {
                                        ServerError::Upstream(format!(
                                            "{}:{} lists {} which upstream does not have",
                                            feed.name, tag, child
                                        ))
                                    })?;
                                self.store(&feed, child, &mut content, &mut report).await?;
                            }
                            tag_content.list = Some(fetched.digest.clone());
                        }
                        ManifestKind::V2 => tag_content.schema2 = Some(fetched.digest.clone()),
                        ManifestKind::V1 => tag_content.schema1 = Some(fetched.digest.clone()),
                    }
                    self.store(&feed, fetched, &mut content, &mut report).await?;
                }
            }

            if tag_content.schema1.is_none() {
                let accept = media_type::MANIFEST_V1_SIGNED;
                match self.fetch_manifest(&feed, &tag, accept).await? {
                    Some(fetched) if fetched.manifest.kind() == ManifestKind::V1 => {
                        if importer.enable_v1 {
                            if let Manifest::V1(schema1) = &fetched.manifest {
                                record_images(&mut content, &tag, schema1);
                            }
                        }
                        tag_content.schema1 = Some(fetched.digest.clone());
                        self.store(&feed, fetched, &mut content, &mut report).await?;
                    }
                    Some(fetched) => {
                        debug!(
                            "{}:{} has no schema 1 manifest (got {})",
                            feed.name,
                            tag,
                            fetched.manifest.kind()
                        );
                    }
                    None => {}
                }
            }

            if tag_content.is_empty() {
                warn!("{}:{} has no manifest this importer can use", feed.name, tag);
                continue;
            }
            content.tags.insert(tag, tag_content);
        }

        report.tags = content.tags.len();
        report.manifests = content.manifests.len();
        report.manifest_lists = content.manifest_lists.len();
        report.image_ids = content.image_ids.len();
        info!(
            "Synced {}: {} tags, {} manifests, {} lists, {} new blobs",
            feed.name, report.tags, report.manifests, report.manifest_lists, report.blobs_downloaded
        );
        Ok((content, report))
    }

    async fn list_tags(&self, feed: &Feed<'_>) -> Result<Vec<String>> {
        let response = self.http.get(feed.url("tags/list")).send().await?;
        if !response.status().is_success() {
            return Err(ServerError::Upstream(format!(
                "listing tags of {} returned {}",
                feed.name,
                response.status()
            )));
        }
        let tags: TagList = response.json().await?;
        let mut tags = tags.tags.unwrap_or_default();
        tags.sort();
        Ok(tags)
    }

    async fn fetch_manifest(
        &self,
        feed: &Feed<'_>,
        reference: &str,
        accept: &str,
    ) -> Result<Option<Fetched>> {
        let response = self
            .http
            .get(feed.url(&format!("manifests/{reference}")))
            .header(ACCEPT, accept)
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(ServerError::Upstream(format!(
                "fetching manifest {}:{} returned {}",
                feed.name,
                reference,
                response.status()
            )));
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let advertised = response
            .headers()
            .get("Docker-Content-Digest")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let data = response.bytes().await?.to_vec();

        let manifest = Manifest::parse(&data, content_type.as_deref())?;
        let digest = sha256_digest(&data);

        // Schema 1 digests are computed over the unsigned payload upstream.
        if manifest.kind() != ManifestKind::V1 {
            if let Some(advertised) = advertised.filter(|d| *d != digest) {
                return Err(ServerError::DigestMismatch {
                    expected: advertised,
                    actual: digest,
                });
            }
        }
        if digest::is_digest(reference) && manifest.kind() != ManifestKind::V1 && reference != digest
        {
            return Err(ServerError::DigestMismatch {
                expected: reference.to_string(),
                actual: digest,
            });
        }

        let content_type = manifest.kind().media_type().to_string();
        Ok(Some(Fetched {
            digest,
            manifest,
            entry: ManifestEntry { data, content_type },
        }))
    }

    async fn store(
        &self,
        feed: &Feed<'_>,
        fetched: Fetched,
        content: &mut RepositoryContent,
        report: &mut SyncReport,
    ) -> Result<()> {
        for blob in fetched.manifest.referenced_blobs() {
            if self.fetch_blob(feed, &blob).await? {
                report.blobs_downloaded += 1;
            }
            content.blobs.insert(blob);
        }

        match fetched.manifest.kind() {
            ManifestKind::List => content.manifest_lists.insert(fetched.digest.clone()),
            _ => content.manifests.insert(fetched.digest.clone()),
        };
        self.storage
            .store_manifest(fetched.digest, fetched.entry)
            .await
    }

    /// Returns whether the blob had to be downloaded.
    async fn fetch_blob(&self, feed: &Feed<'_>, blob_digest: &str) -> Result<bool> {
        if self.storage.has_blob(blob_digest).await? {
            return Ok(false);
        }

        let response = self
            .http
            .get(feed.url(&format!("blobs/{blob_digest}")))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(ServerError::Upstream(format!(
                "fetching blob {} of {} returned {}",
                blob_digest,
                feed.name,
                response.status()
            )));
        }
        let data = response.bytes().await?.to_vec();
        if !digest::verify(blob_digest, &data) {
            return Err(ServerError::DigestMismatch {
                expected: blob_digest.to_string(),
                actual: sha256_digest(&data),
            });
        }

        debug!("Downloaded blob {} ({} bytes)", blob_digest, data.len());
        self.storage.store_blob(blob_digest.to_string(), data).await?;
        Ok(true)
    }
}
