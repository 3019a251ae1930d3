use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use crate::error::Result;
use crate::{validate_key, BlobStorage, StoredObject};

/// Files under a local directory, served by the gateway at `url_prefix`.
pub struct LocalBlobStorage {
    root: PathBuf,
    url_prefix: String,
}

impl LocalBlobStorage {
    pub fn new(root: impl AsRef<Path>, url_prefix: impl Into<String>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            url_prefix: url_prefix.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl BlobStorage for LocalBlobStorage {
    async fn upload(&self, key: &str, bytes: Vec<u8>, _mime: &str) -> Result<StoredObject> {
        validate_key(key)?;
        let path = self.root.join(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        debug!(key, size = bytes.len(), "writing local blob");
        tokio::fs::write(&path, bytes).await?;
        Ok(StoredObject {
            key: key.to_string(),
            url: self.read_url(key).await?,
        })
    }

    async fn read_url(&self, key: &str) -> Result<String> {
        validate_key(key)?;
        Ok(format!("{}/{}", self.url_prefix, key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upload_writes_under_root() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalBlobStorage::new(dir.path(), "http://localhost:8000/files/");

        let obj = store.upload("t1/chart.png", b"png!".to_vec(), "image/png").await.unwrap();
        assert_eq!(obj.url, "http://localhost:8000/files/t1/chart.png");
        assert_eq!(std::fs::read(dir.path().join("t1/chart.png")).unwrap(), b"png!");
    }

    #[tokio::test]
    async fn traversal_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalBlobStorage::new(dir.path(), "/files");
        assert!(store.upload("../escape", vec![1], "x").await.is_err());
        assert!(!dir.path().parent().unwrap().join("escape").exists());
    }
}
