use std::path::Component;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};

mod fs;
mod http;

pub use fs::FsObjectStore;
pub use http::HttpObjectStore;

/// One stored object as reported by a listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectEntry {
    pub key: String,
    /// Last modification, epoch milliseconds.
    pub updated_at: i64,
}

/// Remote object storage capability. Keys are `/`-separated and bucket-relative.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// All objects whose key starts with `prefix`.
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectEntry>>;

    /// Read an object. `Ok(None)` when it does not exist.
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Create or overwrite an object.
    async fn write(&self, key: &str, data: Vec<u8>) -> Result<()>;

    /// Delete an object. Deleting a missing object succeeds.
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Build a backend from a location string: `http(s)://…` for the REST
/// backend, `file://…` or a plain path for the filesystem backend.
pub fn store_from_url(url: &str, token: Option<&str>) -> Result<Arc<dyn ObjectStore>> {
    if url.starts_with("http://") || url.starts_with("https://") {
        return Ok(Arc::new(HttpObjectStore::new(url, token)?));
    }
    let path = url.strip_prefix("file://").unwrap_or(url);
    if path.is_empty() {
        return Err(SyncError::Other("empty storage location".into()));
    }
    Ok(Arc::new(FsObjectStore::new(path)))
}

/// Append a bucket name to a location string understood by [`store_from_url`].
pub fn bucket_url(base: &str, bucket: &str) -> String {
    format!("{}/{bucket}", base.trim_end_matches('/'))
}

/// Reject ids that cannot be used as a single key segment.
pub fn validate_segment(segment: &str) -> Result<()> {
    if segment.is_empty() {
        return Err(SyncError::InvalidKey("empty key segment".into()));
    }
    if segment.contains('/') || segment.contains('\\') || segment == "." || segment == ".." {
        return Err(SyncError::InvalidKey(format!(
            "'{segment}' cannot be used as a key segment"
        )));
    }
    Ok(())
}

/// Reject storage keys that could escape a backend root.
pub(crate) fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(SyncError::InvalidKey("empty".into()));
    }
    if key.starts_with('/') || key.contains('\\') {
        return Err(SyncError::InvalidKey(format!("'{key}' is not bucket-relative")));
    }
    if std::path::Path::new(key)
        .components()
        .any(|c| c == Component::ParentDir)
    {
        return Err(SyncError::InvalidKey(format!("parent traversal in '{key}'")));
    }
    Ok(())
}
