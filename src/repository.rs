//! Repository records: importer configuration, distributors and the content
//! each repository is associated with.

use crate::error::{Result, ServerError};
use crate::resolve::TagContent;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tokio::sync::RwLock;

pub const REPOSITORY_PATH: &str = "/pulp/api/v2/repositories/";
pub const DOCKER_IMPORTER: &str = "docker_importer";
pub const DOCKER_DISTRIBUTOR: &str = "docker_distributor_web";

fn default_true() -> bool {
    true
}

fn docker_importer() -> String {
    DOCKER_IMPORTER.to_string()
}

fn docker_distributor() -> String {
    DOCKER_DISTRIBUTOR.to_string()
}

pub fn repository_href(id: &str) -> String {
    format!("{REPOSITORY_PATH}{id}/")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImporterConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feed: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream_name: Option<String>,
    #[serde(default)]
    pub enable_v1: bool,
    #[serde(default = "default_true")]
    pub enable_v2: bool,
}

impl Default for ImporterConfig {
    fn default() -> Self {
        Self {
            feed: None,
            upstream_name: None,
            enable_v1: false,
            enable_v2: true,
        }
    }
}

/// Partial importer update; absent fields keep their value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImporterConfigDelta {
    pub feed: Option<String>,
    pub upstream_name: Option<String>,
    pub enable_v1: Option<bool>,
    pub enable_v2: Option<bool>,
}

impl ImporterConfig {
    fn apply(&mut self, delta: ImporterConfigDelta) {
        if let Some(feed) = delta.feed {
            self.feed = Some(feed);
        }
        if let Some(name) = delta.upstream_name {
            self.upstream_name = Some(name);
        }
        if let Some(v1) = delta.enable_v1 {
            self.enable_v1 = v1;
        }
        if let Some(v2) = delta.enable_v2 {
            self.enable_v2 = v2;
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DistributorConfig {
    #[serde(
        rename = "repo-registry-id",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub repo_registry_id: Option<String>,
    #[serde(default)]
    pub protected: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DistributorConfigDelta {
    #[serde(rename = "repo-registry-id")]
    pub repo_registry_id: Option<String>,
    pub protected: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Distributor {
    pub distributor_id: String,
    #[serde(default = "docker_distributor")]
    pub distributor_type_id: String,
    #[serde(default)]
    pub auto_publish: bool,
    #[serde(default)]
    pub distributor_config: DistributorConfig,
}

impl Distributor {
    /// A web distributor with a random id.
    pub fn docker() -> Self {
        Self {
            distributor_id: uuid::Uuid::new_v4().to_string(),
            distributor_type_id: docker_distributor(),
            auto_publish: false,
            distributor_config: DistributorConfig::default(),
        }
    }

    /// The name clients use to pull from this distributor's publication.
    pub fn registry_id<'a>(&'a self, repository_id: &'a str) -> &'a str {
        self.distributor_config
            .repo_registry_id
            .as_deref()
            .unwrap_or(repository_id)
    }
}

/// Body of a repository create request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryCreate {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default = "docker_importer")]
    pub importer_type_id: String,
    #[serde(default)]
    pub importer_config: ImporterConfig,
    #[serde(default)]
    pub distributors: Vec<Distributor>,
}

impl RepositoryCreate {
    /// A docker repository with a random id, no feed and no distributors.
    pub fn docker() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            display_name: None,
            importer_type_id: docker_importer(),
            importer_config: ImporterConfig::default(),
            distributors: Vec::new(),
        }
    }

    pub fn with_feed(mut self, feed: impl Into<String>, upstream_name: impl Into<String>) -> Self {
        self.importer_config.feed = Some(feed.into());
        self.importer_config.upstream_name = Some(upstream_name.into());
        self
    }

    pub fn with_schemas(mut self, enable_v1: bool, enable_v2: bool) -> Self {
        self.importer_config.enable_v1 = enable_v1;
        self.importer_config.enable_v2 = enable_v2;
        self
    }

    pub fn with_distributor(mut self, distributor: Distributor) -> Self {
        self.distributors.push(distributor);
        self
    }
}

/// Body of a repository update request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RepositoryUpdate {
    #[serde(default)]
    pub delta: Option<RepositoryDelta>,
    #[serde(default)]
    pub importer_config: Option<ImporterConfigDelta>,
    #[serde(default)]
    pub distributor_configs: Option<HashMap<String, DistributorConfigDelta>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RepositoryDelta {
    pub display_name: Option<String>,
}

/// Content associated with a repository by its last sync.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RepositoryContent {
    pub tags: BTreeMap<String, TagContent>,
    pub manifests: BTreeSet<String>,
    pub manifest_lists: BTreeSet<String>,
    pub blobs: BTreeSet<String>,
    pub image_ids: Vec<String>,
    pub v1_tags: BTreeMap<String, String>,
}

impl RepositoryContent {
    pub fn unit_counts(&self) -> BTreeMap<&'static str, usize> {
        let counts = [
            ("docker_tag", self.tags.len()),
            ("docker_manifest", self.manifests.len()),
            ("docker_manifest_list", self.manifest_lists.len()),
            ("docker_blob", self.blobs.len()),
            ("docker_image", self.image_ids.len()),
        ];
        counts.into_iter().filter(|(_, n)| *n > 0).collect()
    }

    /// Associated units in the shape returned by unit search.
    pub fn units(&self) -> Vec<serde_json::Value> {
        let tags = self.tags.iter().map(|(name, tag)| {
            json!({
                "unit_type_id": "docker_tag",
                "metadata": {"name": name, "manifests": tag},
            })
        });
        let manifests = self.manifests.iter().map(|digest| {
            json!({"unit_type_id": "docker_manifest", "metadata": {"digest": digest}})
        });
        let lists = self.manifest_lists.iter().map(|digest| {
            json!({"unit_type_id": "docker_manifest_list", "metadata": {"digest": digest}})
        });
        let blobs = self.blobs.iter().map(|digest| {
            json!({"unit_type_id": "docker_blob", "metadata": {"digest": digest}})
        });
        let images = self.image_ids.iter().map(|id| {
            json!({"unit_type_id": "docker_image", "metadata": {"image_id": id}})
        });
        tags.chain(manifests)
            .chain(lists)
            .chain(blobs)
            .chain(images)
            .collect()
    }

    /// Every manifest digest, list or not.
    pub fn all_manifests(&self) -> impl Iterator<Item = &String> {
        self.manifests.iter().chain(self.manifest_lists.iter())
    }
}

#[derive(Debug, Clone)]
pub struct Repository {
    pub id: String,
    pub display_name: String,
    pub importer_type_id: String,
    pub importer_config: ImporterConfig,
    pub distributors: Vec<Distributor>,
    pub content: RepositoryContent,
    /// Registry id each distributor last published under.
    pub published: BTreeMap<String, String>,
}

impl Repository {
    pub fn href(&self) -> String {
        repository_href(&self.id)
    }

    pub fn distributor(&self, distributor_id: &str) -> Result<&Distributor> {
        self.distributors
            .iter()
            .find(|d| d.distributor_id == distributor_id)
            .ok_or_else(|| ServerError::DistributorNotFound {
                repository: self.id.clone(),
                distributor: distributor_id.to_string(),
            })
    }

    /// The JSON representation served by the REST API.
    pub fn to_json(&self, details: bool) -> serde_json::Value {
        let mut body = json!({
            "_href": self.href(),
            "id": self.id,
            "display_name": self.display_name,
            "content_unit_counts": self.content.unit_counts(),
        });
        if details {
            body["importers"] = json!([{
                "importer_type_id": self.importer_type_id,
                "repo_id": self.id,
                "config": self.importer_config,
            }]);
            body["distributors"] = self
                .distributors
                .iter()
                .map(|d| {
                    json!({
                        "id": d.distributor_id,
                        "distributor_type_id": d.distributor_type_id,
                        "auto_publish": d.auto_publish,
                        "repo_id": self.id,
                        "config": d.distributor_config,
                    })
                })
                .collect();
        }
        body
    }
}

fn validate_registry_id(registry_id: &str) -> Result<()> {
    let valid = !registry_id.is_empty()
        && registry_id.split('/').all(|segment| {
            !segment.is_empty()
                && segment
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "._-".contains(c))
        });
    if valid {
        Ok(())
    } else {
        Err(ServerError::InvalidInput(format!(
            "invalid repo-registry-id: {registry_id}"
        )))
    }
}

fn validate_id(id: &str) -> Result<()> {
    let valid = !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "._-".contains(c));
    if valid {
        Ok(())
    } else {
        Err(ServerError::InvalidInput(format!("invalid repository id: {id}")))
    }
}

fn validate_distributors(repository_id: &str, distributors: &[Distributor]) -> Result<()> {
    let mut seen = BTreeSet::new();
    for distributor in distributors {
        if !seen.insert(distributor.distributor_id.as_str()) {
            return Err(ServerError::InvalidInput(format!(
                "duplicate distributor id: {}",
                distributor.distributor_id
            )));
        }
        if distributor.distributor_type_id != DOCKER_DISTRIBUTOR {
            return Err(ServerError::InvalidInput(format!(
                "unsupported distributor type: {}",
                distributor.distributor_type_id
            )));
        }
        validate_registry_id(distributor.registry_id(repository_id))?;
    }
    Ok(())
}

#[derive(Default)]
pub struct RepositoryStore {
    repositories: RwLock<BTreeMap<String, Repository>>,
}

impl RepositoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create(&self, body: RepositoryCreate) -> Result<Repository> {
        validate_id(&body.id)?;
        if body.importer_type_id != DOCKER_IMPORTER {
            return Err(ServerError::InvalidInput(format!(
                "unsupported importer type: {}",
                body.importer_type_id
            )));
        }
        validate_distributors(&body.id, &body.distributors)?;

        let mut repositories = self.repositories.write().await;
        if repositories.contains_key(&body.id) {
            return Err(ServerError::RepositoryExists(body.id));
        }

        let repository = Repository {
            display_name: body.display_name.unwrap_or_else(|| body.id.clone()),
            id: body.id,
            importer_type_id: body.importer_type_id,
            importer_config: body.importer_config,
            distributors: body.distributors,
            content: RepositoryContent::default(),
            published: BTreeMap::new(),
        };
        repositories.insert(repository.id.clone(), repository.clone());
        Ok(repository)
    }

    pub async fn get(&self, id: &str) -> Result<Repository> {
        self.repositories
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| ServerError::RepositoryNotFound(id.to_string()))
    }

    pub async fn list(&self) -> Vec<Repository> {
        self.repositories.read().await.values().cloned().collect()
    }

    pub async fn update(&self, id: &str, update: RepositoryUpdate) -> Result<Repository> {
        let mut repositories = self.repositories.write().await;
        let repository = repositories
            .get_mut(id)
            .ok_or_else(|| ServerError::RepositoryNotFound(id.to_string()))?;

        let mut distributors = repository.distributors.clone();
        for (distributor_id, delta) in update.distributor_configs.unwrap_or_default() {
            let distributor = distributors
                .iter_mut()
                .find(|d| d.distributor_id == distributor_id)
                .ok_or_else(|| ServerError::DistributorNotFound {
                    repository: id.to_string(),
                    distributor: distributor_id.clone(),
                })?;
            if let Some(registry_id) = delta.repo_registry_id {
                distributor.distributor_config.repo_registry_id = Some(registry_id);
            }
            if let Some(protected) = delta.protected {
                distributor.distributor_config.protected = protected;
            }
        }
        validate_distributors(id, &distributors)?;

        repository.distributors = distributors;
        if let Some(delta) = update.importer_config {
            repository.importer_config.apply(delta);
        }
        if let Some(display_name) = update.delta.and_then(|d| d.display_name) {
            repository.display_name = display_name;
        }
        Ok(repository.clone())
    }

    pub async fn set_content(&self, id: &str, content: RepositoryContent) -> Result<()> {
        let mut repositories = self.repositories.write().await;
        let repository = repositories
            .get_mut(id)
            .ok_or_else(|| ServerError::RepositoryNotFound(id.to_string()))?;
        repository.content = content;
        Ok(())
    }

    /// Records the registry id a distributor published under and returns the
    /// one it replaces, if it changed.
    pub async fn set_published(
        &self,
        id: &str,
        distributor_id: &str,
        registry_id: &str,
    ) -> Result<Option<String>> {
        let mut repositories = self.repositories.write().await;
        let repository = repositories
            .get_mut(id)
            .ok_or_else(|| ServerError::RepositoryNotFound(id.to_string()))?;
        let previous = repository
            .published
            .insert(distributor_id.to_string(), registry_id.to_string());
        Ok(previous.filter(|p| p != registry_id))
    }

    pub async fn remove(&self, id: &str) -> Result<Repository> {
        self.repositories
            .write()
            .await
            .remove(id)
            .ok_or_else(|| ServerError::RepositoryNotFound(id.to_string()))
    }

    /// Manifest and blob digests referenced by any repository.
    pub async fn referenced_units(&self) -> (BTreeSet<String>, BTreeSet<String>) {
        let repositories = self.repositories.read().await;
        let manifests = repositories
            .values()
            .flat_map(|r| r.content.all_manifests().cloned())
            .collect();
        let blobs = repositories
            .values()
            .flat_map(|r| r.content.blobs.iter().cloned())
            .collect();
        (manifests, blobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[tokio::test]
    async fn create_rejects_duplicates() {
        let store = RepositoryStore::new();
        let body = RepositoryCreate::docker();
        store.create(body.clone()).await.unwrap();
        assert!(matches!(
            store.create(body).await,
            Err(ServerError::RepositoryExists(_))
        ));
    }

    #[tokio::test]
    async fn update_merges_deltas() {
        let store = RepositoryStore::new();
        let distributor = Distributor::docker();
        let body = RepositoryCreate::docker()
            .with_feed("https://registry-1.docker.io", "library/busybox")
            .with_distributor(distributor.clone());
        let id = body.id.clone();
        store.create(body).await.unwrap();

        let key = distributor.distributor_id.clone();
        let update: RepositoryUpdate = serde_json::from_value(json!({
            "importer_config": {"feed": "http://localhost:5001"},
            "distributor_configs": {
                key: {"repo-registry-id": "a/b"}
            }
        }))
        .unwrap();
        let repository = store.update(&id, update).await.unwrap();

        assert_eq!(
            repository.importer_config.feed.as_deref(),
            Some("http://localhost:5001")
        );
        assert_eq!(
            repository.importer_config.upstream_name.as_deref(),
            Some("library/busybox")
        );
        assert_eq!(repository.distributors[0].registry_id(&id), "a/b");
    }

    #[tokio::test]
    async fn details_include_importer_and_distributors() {
        let store = RepositoryStore::new();
        let body = RepositoryCreate::docker().with_distributor(Distributor::docker());
        let repository = store.create(body).await.unwrap();

        let brief = repository.to_json(false);
        assert!(brief.get("importers").is_none());
        let details = repository.to_json(true);
        assert_eq!(details["importers"][0]["importer_type_id"], DOCKER_IMPORTER);
        assert_eq!(details["distributors"][0]["distributor_type_id"], DOCKER_DISTRIBUTOR);
        assert_eq!(details["_href"], repository.href());
    }

    #[tokio::test]
    async fn default_registry_id_must_be_valid() {
        let store = RepositoryStore::new();
        let mut body = RepositoryCreate::docker().with_distributor(Distributor::docker());
        body.id = "MyRepo".to_string();
        assert!(matches!(
            store.create(body.clone()).await,
            Err(ServerError::InvalidInput(_))
        ));

        body.distributors[0].distributor_config.repo_registry_id = Some("my/repo".to_string());
        let repository = store.create(body).await.unwrap();
        assert_eq!(repository.distributors[0].registry_id(&repository.id), "my/repo");

        let key = repository.distributors[0].distributor_id.clone();
        let update: RepositoryUpdate = serde_json::from_value(json!({
            "distributor_configs": {key: {"repo-registry-id": "Not/Valid"}}
        }))
        .unwrap();
        assert!(matches!(
            store.update("MyRepo", update).await,
            Err(ServerError::InvalidInput(_))
        ));
    }

    #[rstest]
    #[case("busybox", true)]
    #[case("a/b", true)]
    #[case("a/b/c/d", true)]
    #[case("", false)]
    #[case("a//b", false)]
    #[case("/a", false)]
    #[case("Upper/case", false)]
    fn registry_ids(#[case] registry_id: &str, #[case] valid: bool) {
        assert_eq!(validate_registry_id(registry_id).is_ok(), valid);
    }
}
