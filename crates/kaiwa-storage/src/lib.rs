//! Blob storage for uploaded files and assistant-generated artifacts.

pub mod azure;
pub mod error;
pub mod local;

use std::sync::Arc;

use async_trait::async_trait;
use kaiwa_core::config::{StorageBackend, StorageConfig};

pub use azure::AzureBlobStorage;
pub use error::{Result, StorageError};
pub use local::LocalBlobStorage;

/// Where an uploaded object ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub key: String,
    pub url: String,
}

#[async_trait]
pub trait BlobStorage: Send + Sync {
    async fn upload(&self, key: &str, bytes: Vec<u8>, mime: &str) -> Result<StoredObject>;

    /// A URL the browser can fetch the object from.
    async fn read_url(&self, key: &str) -> Result<String>;
}

/// Build the configured backend. `public_url` prefixes local file links.
pub fn from_config(cfg: &StorageConfig, public_url: Option<&str>) -> Result<Arc<dyn BlobStorage>> {
    match cfg.backend {
        StorageBackend::Local => Ok(Arc::new(LocalBlobStorage::new(
            &cfg.local_dir,
            format!("{}/files", public_url.unwrap_or("").trim_end_matches('/')),
        ))),
        StorageBackend::Azure => Ok(Arc::new(AzureBlobStorage::from_config(cfg)?)),
    }
}

/// Object key for a file attached to a thread:
/// `{thread_id}/{random id}/{file name}`.
///
/// The random segment keeps two uploads with the same name apart. The name
/// is reduced to characters that need no escaping in a URL.
pub fn object_key(thread_id: &str, file_name: &str) -> String {
    let cleaned: String = file_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    let name = if cleaned.is_empty() { "file" } else { cleaned };
    format!("{thread_id}/{}/{name}", uuid::Uuid::new_v4().simple())
}

/// Reject keys that could escape the container or the storage root.
pub(crate) fn validate_key(key: &str) -> Result<()> {
    let bad = key.is_empty()
        || key.starts_with('/')
        || key.contains('\\')
        || key.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..");
    if bad {
        return Err(StorageError::InvalidKey(key.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_part(key: &str) -> &str {
        key.rsplit('/').next().unwrap()
    }

    #[test]
    fn object_keys_are_url_safe() {
        assert_eq!(file_part(&object_key("t1", "sales report (v2).csv")), "sales_report__v2_.csv");
        assert_eq!(file_part(&object_key("t1", "../../etc/passwd")), "_.._etc_passwd");
        assert_eq!(file_part(&object_key("t1", "")), "file");
        assert!(validate_key(&object_key("t1", "..")).is_ok());
    }

    #[test]
    fn same_name_gets_distinct_keys() {
        let a = object_key("t1", "chart.png");
        let b = object_key("t1", "chart.png");
        assert_ne!(a, b);
        for key in [&a, &b] {
            let parts: Vec<&str> = key.split('/').collect();
            assert_eq!(parts.len(), 3);
            assert_eq!(parts[0], "t1");
            assert_eq!(parts[2], "chart.png");
        }
    }

    #[test]
    fn traversal_keys_are_rejected() {
        for key in ["", "/abs", "a/../b", "a//b", "a\\b", "./x"] {
            assert!(validate_key(key).is_err(), "{key}");
        }
        assert!(validate_key("t1/chart.png").is_ok());
    }
}
