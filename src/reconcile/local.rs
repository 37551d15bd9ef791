use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::fs;

use crate::error::{Result, SyncError};
use crate::model::{PatternDoc, ProgressRecord, SyncMeta};
use crate::storage::validate_segment;

/// Device-local persistence for patterns, progress and sync bookkeeping.
#[async_trait]
pub trait LocalStore: Send + Sync {
    async fn load_pattern(&self, pattern_id: &str) -> Result<Option<PatternDoc>>;
    async fn save_pattern(&self, pattern: &PatternDoc) -> Result<()>;
    async fn delete_pattern(&self, pattern_id: &str) -> Result<()>;

    async fn load_progress(&self, pattern_id: &str) -> Result<Option<ProgressRecord>>;
    async fn save_progress(&self, progress: &ProgressRecord) -> Result<()>;
    async fn delete_progress(&self, pattern_id: &str) -> Result<()>;

    async fn load_sync_meta(&self, pattern_id: &str) -> Result<Option<SyncMeta>>;
    async fn save_sync_meta(&self, meta: &SyncMeta) -> Result<()>;
    async fn delete_sync_meta(&self, pattern_id: &str) -> Result<()>;

    /// Ids with a local pattern definition or progress record.
    async fn list_all_pattern_ids(&self) -> Result<Vec<String>>;
}

const PATTERNS_DIR: &str = "patterns";
const PROGRESS_DIR: &str = "progress";
const SYNC_DIR: &str = "sync";

/// One JSON file per record under `<root>/{patterns,progress,sync}/<id>.json`.
pub struct FsLocalStore {
    root: PathBuf,
}

impl FsLocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn progress_path(&self, pattern_id: &str) -> Result<PathBuf> {
        self.record_path(PROGRESS_DIR, pattern_id)
    }

    fn record_path(&self, dir: &str, pattern_id: &str) -> Result<PathBuf> {
        validate_segment(pattern_id)?;
        Ok(self.root.join(dir).join(format!("{pattern_id}.json")))
    }

    async fn ids_in(&self, dir: &str) -> Result<Vec<String>> {
        let mut read_dir = match fs::read_dir(self.root.join(dir)).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut ids = Vec::new();
        while let Some(entry) = read_dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            if let Some(id) = name.strip_suffix(".json") {
                ids.push(id.to_string());
            }
        }
        Ok(ids)
    }
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| SyncError::Format(format!("failed to parse {}: {e}", path.display())))
}

async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| SyncError::Other(format!("path has no parent: {}", path.display())))?;
    fs::create_dir_all(parent).await?;
    let bytes = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, bytes).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}

async fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl LocalStore for FsLocalStore {
    async fn load_pattern(&self, pattern_id: &str) -> Result<Option<PatternDoc>> {
        read_json(&self.record_path(PATTERNS_DIR, pattern_id)?).await
    }

    async fn save_pattern(&self, pattern: &PatternDoc) -> Result<()> {
        write_json_atomic(&self.record_path(PATTERNS_DIR, &pattern.id)?, pattern).await
    }

    async fn delete_pattern(&self, pattern_id: &str) -> Result<()> {
        remove_if_exists(&self.record_path(PATTERNS_DIR, pattern_id)?).await
    }

    async fn load_progress(&self, pattern_id: &str) -> Result<Option<ProgressRecord>> {
        read_json(&self.progress_path(pattern_id)?).await
    }

    async fn save_progress(&self, progress: &ProgressRecord) -> Result<()> {
        write_json_atomic(&self.progress_path(&progress.pattern_id)?, progress).await
    }

    async fn delete_progress(&self, pattern_id: &str) -> Result<()> {
        remove_if_exists(&self.progress_path(pattern_id)?).await
    }

    async fn load_sync_meta(&self, pattern_id: &str) -> Result<Option<SyncMeta>> {
        read_json(&self.record_path(SYNC_DIR, pattern_id)?).await
    }

    async fn save_sync_meta(&self, meta: &SyncMeta) -> Result<()> {
        write_json_atomic(&self.record_path(SYNC_DIR, &meta.pattern_id)?, meta).await
    }

    async fn delete_sync_meta(&self, pattern_id: &str) -> Result<()> {
        remove_if_exists(&self.record_path(SYNC_DIR, pattern_id)?).await
    }

    async fn list_all_pattern_ids(&self) -> Result<Vec<String>> {
        let mut ids = self.ids_in(PATTERNS_DIR).await?;
        ids.extend(self.ids_in(PROGRESS_DIR).await?);
        ids.sort();
        ids.dedup();
        Ok(ids)
    }
}
