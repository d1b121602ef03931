//! Repository operations that run as tasks: sync, publish, delete and
//! orphan removal.

use crate::crane::Crane;
use crate::error::Result;
use crate::publish::{self, PublishedRepository};
use crate::repository::RepositoryStore;
use crate::storage::SharedStorage;
use crate::sync::SyncEngine;
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::{RwLock, RwLockReadGuard};
use tracing::info;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OrphanReport {
    pub docker_manifest: usize,
    pub docker_blob: usize,
}

pub struct ContentManager {
    repositories: RepositoryStore,
    storage: SharedStorage,
    sync: SyncEngine,
    crane: Arc<Crane>,
    crane_auto_reload: bool,
    /// Held shared while units are stored but not yet associated, and
    /// exclusively while orphans are removed.
    content: RwLock<()>,
}

impl ContentManager {
    pub fn new(
        storage: SharedStorage,
        sync: SyncEngine,
        crane: Arc<Crane>,
        crane_auto_reload: bool,
    ) -> Self {
        Self {
            repositories: RepositoryStore::new(),
            storage,
            sync,
            crane,
            crane_auto_reload,
            content: RwLock::new(()),
        }
    }

    pub fn repositories(&self) -> &RepositoryStore {
        &self.repositories
    }

    /// Syncs from the importer's feed, replaces the repository's content and
    /// publishes through every `auto_publish` distributor.
    pub async fn sync_repository(&self, id: &str) -> Result<serde_json::Value> {
        let repository = self.repositories.get(id).await?;
        let reservation = self.reserve_content().await;
        let (content, report) = self.sync.sync(&repository.importer_config).await?;
        self.repositories.set_content(id, content).await?;
        drop(reservation);

        let mut auto_published = Vec::new();
        for distributor in repository.distributors.iter().filter(|d| d.auto_publish) {
            let published = self
                .publish_repository(id, &distributor.distributor_id)
                .await?;
            auto_published.push(published.repo_registry_id);
        }

        Ok(json!({
            "importer_type_id": repository.importer_type_id,
            "summary": report,
            "auto_published": auto_published,
        }))
    }

    pub async fn publish_repository(
        &self,
        id: &str,
        distributor_id: &str,
    ) -> Result<PublishedRepository> {
        let repository = self.repositories.get(id).await?;
        let published = publish::publish(&self.storage, &repository, distributor_id).await?;

        let replaced = self
            .repositories
            .set_published(id, distributor_id, &published.repo_registry_id)
            .await?;
        if let Some(previous) = replaced {
            info!(
                "{} moved from {} to {}",
                id, previous, published.repo_registry_id
            );
        }
        self.crane_changed().await?;
        Ok(published)
    }

    /// Deletes the repository and its publications. Its content units stay
    /// in storage as orphans.
    pub async fn delete_repository(&self, id: &str) -> Result<()> {
        let repository = self.repositories.remove(id).await?;
        publish::unpublish(&self.storage, &repository).await?;
        info!("Deleted repository {}", id);
        self.crane_changed().await
    }

    /// Stored manifests and blobs no repository references.
    async fn orphaned(&self) -> Result<(Vec<String>, Vec<String>)> {
        let (manifests, blobs) = self.repositories.referenced_units().await;
        let orphan_manifests = unreferenced(self.storage.list_manifests().await?, &manifests);
        let orphan_blobs = unreferenced(self.storage.list_blobs().await?, &blobs);
        Ok((orphan_manifests, orphan_blobs))
    }

    pub async fn orphan_counts(&self) -> Result<OrphanReport> {
        let (manifests, blobs) = self.orphaned().await?;
        Ok(OrphanReport {
            docker_manifest: manifests.len(),
            docker_blob: blobs.len(),
        })
    }

    /// Keeps orphan removal from running until the guard is dropped.
    pub async fn reserve_content(&self) -> RwLockReadGuard<'_, ()> {
        self.content.read().await
    }

    pub async fn delete_orphans(&self) -> Result<OrphanReport> {
        let _exclusive = self.content.write().await;
        let (manifests, blobs) = self.orphaned().await?;
        let mut report = OrphanReport::default();
        for digest in &manifests {
            if self.storage.remove_manifest(digest).await? {
                report.docker_manifest += 1;
            }
        }
        for digest in &blobs {
            if self.storage.remove_blob(digest).await? {
                report.docker_blob += 1;
            }
        }
        info!(
            "Removed {} orphaned manifests and {} orphaned blobs",
            report.docker_manifest, report.docker_blob
        );
        Ok(report)
    }

    async fn crane_changed(&self) -> Result<()> {
        if self.crane_auto_reload {
            self.crane.reload().await?;
        }
        Ok(())
    }
}

fn unreferenced(stored: Vec<String>, referenced: &BTreeSet<String>) -> Vec<String> {
    stored
        .into_iter()
        .filter(|digest| !referenced.contains(digest))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::sha256_digest;
    use crate::storage::{ManifestEntry, MemoryStorage};
    use std::time::Duration;

    fn manager() -> (Arc<ContentManager>, SharedStorage) {
        let storage: SharedStorage = Arc::new(MemoryStorage::new());
        let sync = SyncEngine::new(Arc::clone(&storage), Duration::from_secs(5)).unwrap();
        let crane = Arc::new(Crane::new(Arc::clone(&storage)));
        let manager = ContentManager::new(Arc::clone(&storage), sync, crane, false);
        (Arc::new(manager), storage)
    }

    #[tokio::test]
    async fn orphan_removal_waits_for_reserved_content() {
        let (manager, storage) = manager();
        let body = br#"{"schemaVersion":2}"#.to_vec();
        let digest = sha256_digest(&body);
        storage
            .store_manifest(
                digest.clone(),
                ManifestEntry {
                    data: body,
                    content_type: crate::media_type::MANIFEST_V2.to_string(),
                },
            )
            .await
            .unwrap();

        let reservation = manager.reserve_content().await;
        let removal = tokio::spawn({
            let manager = Arc::clone(&manager);
            async move { manager.delete_orphans().await }
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!removal.is_finished());
        assert!(storage.get_manifest(&digest).await.unwrap().is_some());

        drop(reservation);
        let report = removal.await.unwrap().unwrap();
        assert_eq!(report.docker_manifest, 1);
        assert!(storage.get_manifest(&digest).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn orphan_counts_ignore_referenced_units() {
        let (manager, storage) = manager();
        storage
            .store_blob(sha256_digest(b"layer"), b"layer".to_vec())
            .await
            .unwrap();
        assert_eq!(
            manager.orphan_counts().await.unwrap(),
            OrphanReport {
                docker_manifest: 0,
                docker_blob: 1,
            }
        );
    }
}
