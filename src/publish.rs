//! Renders repository content into the metadata documents Crane serves.

use crate::error::Result;
use crate::repository::Repository;
use crate::resolve::TagContent;
use crate::storage::SharedStorage;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::info;

/// The storage key of the document one distributor of one repository
/// publishes. Registry ids are not unique across repositories, so they do not
/// name documents.
pub fn metadata_key(repository_id: &str, distributor_id: &str) -> String {
    format!("{repository_id}/{distributor_id}")
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// One published repository, as written by a distributor and read by Crane.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PublishedRepository {
    pub repo_registry_id: String,
    pub repository: String,
    pub protected: bool,
    pub tags: BTreeMap<String, TagContent>,
    #[serde(default)]
    pub manifests: BTreeSet<String>,
    #[serde(default)]
    pub blobs: BTreeSet<String>,
    #[serde(default)]
    pub image_ids: Vec<String>,
    #[serde(default)]
    pub v1_tags: BTreeMap<String, String>,
    /// Milliseconds since the epoch.
    #[serde(default)]
    pub published_at: u64,
}

impl PublishedRepository {
    pub fn has_v1(&self) -> bool {
        !self.image_ids.is_empty()
    }

    pub fn has_v2(&self) -> bool {
        self.tags.values().any(TagContent::has_v2)
    }

    /// Whether this document wins over `other` for the same registry id: the
    /// later publication does, ties go to the lower repository id.
    pub fn supersedes(&self, other: &PublishedRepository) -> bool {
        (self.published_at, &other.repository) > (other.published_at, &self.repository)
    }
}

/// Publishes `repository` through one of its distributors and returns the
/// document written.
pub async fn publish(
    storage: &SharedStorage,
    repository: &Repository,
    distributor_id: &str,
) -> Result<PublishedRepository> {
    let distributor = repository.distributor(distributor_id)?;
    let content = &repository.content;

    let published = PublishedRepository {
        repo_registry_id: distributor.registry_id(&repository.id).to_string(),
        repository: repository.id.clone(),
        protected: distributor.distributor_config.protected,
        tags: content.tags.clone(),
        manifests: content.all_manifests().cloned().collect(),
        blobs: content.blobs.clone(),
        image_ids: content.image_ids.clone(),
        v1_tags: content.v1_tags.clone(),
        published_at: now_millis(),
    };

    storage
        .store_metadata(
            &metadata_key(&repository.id, distributor_id),
            serde_json::to_vec(&published)?,
        )
        .await?;
    info!(
        "Published {} as {} ({} tags)",
        repository.id,
        published.repo_registry_id,
        published.tags.len()
    );
    Ok(published)
}

/// Removes every document `repository` has published.
pub async fn unpublish(storage: &SharedStorage, repository: &Repository) -> Result<usize> {
    let mut removed = 0;
    for (distributor_id, registry_id) in &repository.published {
        if storage
            .remove_metadata(&metadata_key(&repository.id, distributor_id))
            .await?
        {
            info!("Unpublished {} ({})", registry_id, repository.id);
            removed += 1;
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ServerError;
    use crate::repository::{Distributor, RepositoryCreate, RepositoryStore};
    use crate::storage::MemoryStorage;
    use std::sync::Arc;

    #[tokio::test]
    async fn publish_uses_registry_id() {
        let storage: SharedStorage = Arc::new(MemoryStorage::new());
        let store = RepositoryStore::new();
        let mut distributor = Distributor::docker();
        distributor.distributor_config.repo_registry_id = Some("a/b/c".to_string());
        let distributor_id = distributor.distributor_id.clone();
        let repository = store
            .create(RepositoryCreate::docker().with_distributor(distributor))
            .await
            .unwrap();

        let published = publish(&storage, &repository, &distributor_id).await.unwrap();
        assert_eq!(published.repo_registry_id, "a/b/c");
        assert!(!published.protected);

        let documents = storage.load_metadata().await.unwrap();
        let loaded: PublishedRepository = serde_json::from_slice(&documents[0]).unwrap();
        assert_eq!(loaded, published);
    }

    #[tokio::test]
    async fn publish_with_unknown_distributor() {
        let storage: SharedStorage = Arc::new(MemoryStorage::new());
        let store = RepositoryStore::new();
        let repository = store.create(RepositoryCreate::docker()).await.unwrap();
        assert!(matches!(
            publish(&storage, &repository, "missing").await,
            Err(ServerError::DistributorNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn shared_registry_id_keeps_one_document_per_repository() {
        let storage: SharedStorage = Arc::new(MemoryStorage::new());
        let store = RepositoryStore::new();
        let mut ids = Vec::new();
        for _ in 0..2 {
            let mut distributor = Distributor::docker();
            distributor.distributor_config.repo_registry_id = Some("shared/image".to_string());
            let distributor_id = distributor.distributor_id.clone();
            let repository = store
                .create(RepositoryCreate::docker().with_distributor(distributor))
                .await
                .unwrap();
            publish(&storage, &repository, &distributor_id).await.unwrap();
            store
                .set_published(&repository.id, &distributor_id, "shared/image")
                .await
                .unwrap();
            ids.push(repository.id);
        }
        assert_eq!(storage.load_metadata().await.unwrap().len(), 2);

        let first = store.remove(&ids[0]).await.unwrap();
        assert_eq!(unpublish(&storage, &first).await.unwrap(), 1);

        let documents = storage.load_metadata().await.unwrap();
        assert_eq!(documents.len(), 1);
        let remaining: PublishedRepository = serde_json::from_slice(&documents[0]).unwrap();
        assert_eq!(remaining.repository, ids[1]);
    }

    #[test]
    fn later_publication_supersedes() {
        let older = PublishedRepository {
            repo_registry_id: "shared/image".to_string(),
            repository: "b".to_string(),
            published_at: 1,
            ..Default::default()
        };
        let newer = PublishedRepository {
            repository: "c".to_string(),
            published_at: 2,
            ..older.clone()
        };
        assert!(newer.supersedes(&older));
        assert!(!older.supersedes(&newer));

        let tie = PublishedRepository {
            repository: "a".to_string(),
            ..newer.clone()
        };
        assert!(tie.supersedes(&newer));
        assert!(!newer.supersedes(&tie));
    }
}
