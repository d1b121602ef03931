use crate::config::StorageBackend;
use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::RwLock;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub data: Vec<u8>,
    pub content_type: String,
}

/// Content units keyed by digest, plus the metadata documents Crane serves.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn store_manifest(&self, digest: String, entry: ManifestEntry) -> Result<()>;
    async fn get_manifest(&self, digest: &str) -> Result<Option<ManifestEntry>>;
    async fn remove_manifest(&self, digest: &str) -> Result<bool>;
    async fn list_manifests(&self) -> Result<Vec<String>>;

    async fn store_blob(&self, digest: String, data: Vec<u8>) -> Result<()>;
    async fn get_blob(&self, digest: &str) -> Result<Option<Vec<u8>>>;
    async fn has_blob(&self, digest: &str) -> Result<bool>;
    async fn remove_blob(&self, digest: &str) -> Result<bool>;
    async fn list_blobs(&self) -> Result<Vec<String>>;

    async fn store_metadata(&self, key: &str, data: Vec<u8>) -> Result<()>;
    async fn remove_metadata(&self, key: &str) -> Result<bool>;
    async fn load_metadata(&self) -> Result<Vec<Vec<u8>>>;
}

pub type SharedStorage = Arc<dyn Storage>;

#[derive(Default)]
pub struct MemoryStorage {
    manifests: RwLock<HashMap<String, ManifestEntry>>,
    blobs: RwLock<HashMap<String, Vec<u8>>>,
    metadata: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn store_manifest(&self, digest: String, entry: ManifestEntry) -> Result<()> {
        self.manifests.write().await.insert(digest, entry);
        Ok(())
    }

    async fn get_manifest(&self, digest: &str) -> Result<Option<ManifestEntry>> {
        Ok(self.manifests.read().await.get(digest).cloned())
    }

    async fn remove_manifest(&self, digest: &str) -> Result<bool> {
        Ok(self.manifests.write().await.remove(digest).is_some())
    }

    async fn list_manifests(&self) -> Result<Vec<String>> {
        Ok(self.manifests.read().await.keys().cloned().collect())
    }

    async fn store_blob(&self, digest: String, data: Vec<u8>) -> Result<()> {
        self.blobs.write().await.insert(digest, data);
        Ok(())
    }

    async fn get_blob(&self, digest: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.blobs.read().await.get(digest).cloned())
    }

    async fn has_blob(&self, digest: &str) -> Result<bool> {
        Ok(self.blobs.read().await.contains_key(digest))
    }

    async fn remove_blob(&self, digest: &str) -> Result<bool> {
        Ok(self.blobs.write().await.remove(digest).is_some())
    }

    async fn list_blobs(&self) -> Result<Vec<String>> {
        Ok(self.blobs.read().await.keys().cloned().collect())
    }

    async fn store_metadata(&self, key: &str, data: Vec<u8>) -> Result<()> {
        self.metadata
            .write()
            .await
            .insert(key.to_string(), data);
        Ok(())
    }

    async fn remove_metadata(&self, key: &str) -> Result<bool> {
        Ok(self.metadata.write().await.remove(key).is_some())
    }

    async fn load_metadata(&self) -> Result<Vec<Vec<u8>>> {
        Ok(self.metadata.read().await.values().cloned().collect())
    }
}

/// Stores units as files: `manifests/<digest>.json` with a `.meta` file
/// holding the content type, `blobs/<digest>`, and one
/// `published/<hex key>.json` per published document.
pub struct DiskStorage {
    base_path: PathBuf,
    _temp_dir: Option<tempfile::TempDir>,
}

impl DiskStorage {
    pub async fn new(path: PathBuf) -> Result<Self> {
        Self::create_layout(&path).await?;

        Ok(Self {
            base_path: path,
            _temp_dir: None,
        })
    }

    pub async fn temp() -> Result<Self> {
        let temp_dir = tempfile::tempdir()?;
        let path = temp_dir.path().to_path_buf();
        Self::create_layout(&path).await?;

        Ok(Self {
            base_path: path,
            _temp_dir: Some(temp_dir),
        })
    }

    async fn create_layout(path: &Path) -> Result<()> {
        fs::create_dir_all(path.join("manifests")).await?;
        fs::create_dir_all(path.join("blobs")).await?;
        fs::create_dir_all(path.join("published")).await?;
        Ok(())
    }

    fn manifest_path(&self, digest: &str) -> PathBuf {
        self.base_path
            .join("manifests")
            .join(format!("{}.json", file_key(digest)))
    }

    fn manifest_meta_path(&self, digest: &str) -> PathBuf {
        self.base_path
            .join("manifests")
            .join(format!("{}.meta", file_key(digest)))
    }

    fn blob_path(&self, digest: &str) -> PathBuf {
        self.base_path.join("blobs").join(file_key(digest))
    }

    fn metadata_path(&self, key: &str) -> PathBuf {
        self.base_path
            .join("published")
            .join(format!("{}.json", hex::encode(key)))
    }

    async fn list_dir(&self, dir: &str, suffix: &str) -> Result<Vec<String>> {
        let mut entries = fs::read_dir(self.base_path.join(dir)).await?;
        let mut digests = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if let Some(key) = name.strip_suffix(suffix) {
                digests.push(digest_from_key(key));
            }
        }
        Ok(digests)
    }
}

/// Digests are `algorithm:hex`; the colon is not portable in file names.
fn file_key(digest: &str) -> String {
    digest.replace(['/', ':'], "_")
}

fn digest_from_key(key: &str) -> String {
    key.replacen('_', ":", 1)
}

async fn remove_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl Storage for DiskStorage {
    async fn store_manifest(&self, digest: String, entry: ManifestEntry) -> Result<()> {
        fs::write(self.manifest_path(&digest), &entry.data).await?;
        fs::write(self.manifest_meta_path(&digest), &entry.content_type).await?;
        Ok(())
    }

    async fn get_manifest(&self, digest: &str) -> Result<Option<ManifestEntry>> {
        let manifest_path = self.manifest_path(digest);

        if !fs::try_exists(&manifest_path).await? {
            return Ok(None);
        }

        let data = fs::read(&manifest_path).await?;
        let content_type = fs::read_to_string(self.manifest_meta_path(digest)).await?;

        Ok(Some(ManifestEntry { data, content_type }))
    }

    async fn remove_manifest(&self, digest: &str) -> Result<bool> {
        let removed = remove_if_exists(&self.manifest_path(digest)).await?;
        remove_if_exists(&self.manifest_meta_path(digest)).await?;
        Ok(removed)
    }

    async fn list_manifests(&self) -> Result<Vec<String>> {
        self.list_dir("manifests", ".json").await
    }

    async fn store_blob(&self, digest: String, data: Vec<u8>) -> Result<()> {
        fs::write(self.blob_path(&digest), &data).await?;
        Ok(())
    }

    async fn get_blob(&self, digest: &str) -> Result<Option<Vec<u8>>> {
        let blob_path = self.blob_path(digest);

        if !fs::try_exists(&blob_path).await? {
            return Ok(None);
        }

        Ok(Some(fs::read(&blob_path).await?))
    }

    async fn has_blob(&self, digest: &str) -> Result<bool> {
        Ok(fs::try_exists(self.blob_path(digest)).await?)
    }

    async fn remove_blob(&self, digest: &str) -> Result<bool> {
        remove_if_exists(&self.blob_path(digest)).await
    }

    async fn list_blobs(&self) -> Result<Vec<String>> {
        self.list_dir("blobs", "").await
    }

    async fn store_metadata(&self, key: &str, data: Vec<u8>) -> Result<()> {
        fs::write(self.metadata_path(key), &data).await?;
        Ok(())
    }

    async fn remove_metadata(&self, key: &str) -> Result<bool> {
        remove_if_exists(&self.metadata_path(key)).await
    }

    async fn load_metadata(&self) -> Result<Vec<Vec<u8>>> {
        let mut entries = fs::read_dir(self.base_path.join("published")).await?;
        let mut documents = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            documents.push(fs::read(entry.path()).await?);
        }
        Ok(documents)
    }
}

pub async fn create_storage(backend: &StorageBackend) -> Result<SharedStorage> {
    match backend {
        StorageBackend::Memory => Ok(Arc::new(MemoryStorage::new())),
        StorageBackend::TempDir => Ok(Arc::new(DiskStorage::temp().await?)),
        StorageBackend::Directory(path) => Ok(Arc::new(DiskStorage::new(path.clone()).await?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::sha256_digest;
    use crate::media_type::MANIFEST_V2;

    async fn exercise(storage: SharedStorage) {
        let body = br#"{"schemaVersion":2}"#.to_vec();
        let digest = sha256_digest(&body);
        storage
            .store_manifest(
                digest.clone(),
                ManifestEntry {
                    data: body.clone(),
                    content_type: MANIFEST_V2.to_string(),
                },
            )
            .await
            .unwrap();

        let entry = storage.get_manifest(&digest).await.unwrap().unwrap();
        assert_eq!(entry.data, body);
        assert_eq!(entry.content_type, MANIFEST_V2);
        assert_eq!(storage.list_manifests().await.unwrap(), vec![digest.clone()]);

        let blob_digest = sha256_digest(b"layer");
        storage
            .store_blob(blob_digest.clone(), b"layer".to_vec())
            .await
            .unwrap();
        assert!(storage.has_blob(&blob_digest).await.unwrap());
        assert_eq!(storage.list_blobs().await.unwrap(), vec![blob_digest.clone()]);

        storage
            .store_metadata("a/b/c", b"{}".to_vec())
            .await
            .unwrap();
        assert_eq!(storage.load_metadata().await.unwrap(), vec![b"{}".to_vec()]);

        assert!(storage.remove_manifest(&digest).await.unwrap());
        assert!(!storage.remove_manifest(&digest).await.unwrap());
        assert!(storage.get_manifest(&digest).await.unwrap().is_none());
        assert!(storage.remove_blob(&blob_digest).await.unwrap());
        assert!(!storage.has_blob(&blob_digest).await.unwrap());
        assert!(storage.remove_metadata("a/b/c").await.unwrap());
        assert!(storage.load_metadata().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn memory_storage() {
        exercise(create_storage(&StorageBackend::Memory).await.unwrap()).await;
    }

    #[tokio::test]
    async fn temp_dir_storage() {
        exercise(create_storage(&StorageBackend::TempDir).await.unwrap()).await;
    }

    #[tokio::test]
    async fn directory_storage_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let first = DiskStorage::new(dir.path().to_path_buf()).await.unwrap();
        first.store_metadata("busybox", b"{}".to_vec()).await.unwrap();
        drop(first);

        let second = DiskStorage::new(dir.path().to_path_buf()).await.unwrap();
        assert_eq!(second.load_metadata().await.unwrap().len(), 1);
    }
}
