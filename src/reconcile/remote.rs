use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};
use crate::model::{epoch_millis, PatternDoc, ProgressRecord};
use crate::storage::{validate_segment, ObjectStore};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemotePatternRow {
    pub pattern_id: String,
    pub account_id: String,
    pub pattern: PatternDoc,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteProgressRow {
    pub pattern_id: String,
    pub account_id: String,
    pub progress: ProgressRecord,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Remote rows keyed by `(pattern_id, account_id)`.
#[async_trait]
pub trait RemoteRecords: Send + Sync {
    /// Ids with a remote pattern or progress row.
    async fn list_pattern_ids(&self, account_id: &str) -> Result<Vec<String>>;

    async fn fetch_pattern(&self, account_id: &str, pattern_id: &str) -> Result<Option<RemotePatternRow>>;
    async fn upsert_pattern(&self, account_id: &str, pattern: &PatternDoc) -> Result<RemotePatternRow>;

    async fn fetch_progress(&self, account_id: &str, pattern_id: &str) -> Result<Option<RemoteProgressRow>>;
    async fn upsert_progress(&self, account_id: &str, progress: &ProgressRecord) -> Result<RemoteProgressRow>;
}

const PATTERNS: &str = "patterns";
const PROGRESS: &str = "progress";

/// Rows stored as JSON objects at `<account>/{patterns,progress}/<id>.json`.
#[derive(Clone)]
pub struct ObjectRecordStore {
    store: Arc<dyn ObjectStore>,
}

impl ObjectRecordStore {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    fn key(kind: &str, account_id: &str, pattern_id: &str) -> Result<String> {
        validate_segment(account_id)?;
        validate_segment(pattern_id)?;
        Ok(format!("{account_id}/{kind}/{pattern_id}.json"))
    }

    async fn ids(&self, kind: &str, account_id: &str) -> Result<Vec<String>> {
        validate_segment(account_id)?;
        let prefix = format!("{account_id}/{kind}/");
        Ok(self
            .store
            .list(&prefix)
            .await?
            .into_iter()
            .filter_map(|entry| {
                let name = entry.key.strip_prefix(&prefix)?;
                let id = name.strip_suffix(".json")?;
                (!id.is_empty() && !id.contains('/')).then(|| id.to_string())
            })
            .collect())
    }

    async fn fetch<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.store.read(key).await? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| SyncError::Format(format!("malformed remote row {key}: {e}"))),
            None => Ok(None),
        }
    }

    /// Keep the original `created_at` across upserts.
    async fn created_at(&self, key: &str, now: i64) -> Result<i64> {
        #[derive(Deserialize)]
        struct Stamp {
            created_at: i64,
        }
        match self.fetch::<Stamp>(key).await {
            Ok(Some(stamp)) => Ok(stamp.created_at),
            Ok(None) | Err(SyncError::Format(_)) => Ok(now),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl RemoteRecords for ObjectRecordStore {
    async fn list_pattern_ids(&self, account_id: &str) -> Result<Vec<String>> {
        let mut ids: BTreeSet<String> = self.ids(PATTERNS, account_id).await?.into_iter().collect();
        ids.extend(self.ids(PROGRESS, account_id).await?);
        Ok(ids.into_iter().collect())
    }

    async fn fetch_pattern(&self, account_id: &str, pattern_id: &str) -> Result<Option<RemotePatternRow>> {
        self.fetch(&Self::key(PATTERNS, account_id, pattern_id)?).await
    }

    async fn upsert_pattern(&self, account_id: &str, pattern: &PatternDoc) -> Result<RemotePatternRow> {
        let key = Self::key(PATTERNS, account_id, &pattern.id)?;
        let now = epoch_millis();
        let row = RemotePatternRow {
            pattern_id: pattern.id.clone(),
            account_id: account_id.to_string(),
            pattern: pattern.clone(),
            created_at: self.created_at(&key, now).await?,
            updated_at: now,
        };
        self.store.write(&key, serde_json::to_vec(&row)?).await?;
        Ok(row)
    }

    async fn fetch_progress(&self, account_id: &str, pattern_id: &str) -> Result<Option<RemoteProgressRow>> {
        self.fetch(&Self::key(PROGRESS, account_id, pattern_id)?).await
    }

    async fn upsert_progress(&self, account_id: &str, progress: &ProgressRecord) -> Result<RemoteProgressRow> {
        let key = Self::key(PROGRESS, account_id, &progress.pattern_id)?;
        let now = epoch_millis();
        let row = RemoteProgressRow {
            pattern_id: progress.pattern_id.clone(),
            account_id: account_id.to_string(),
            progress: progress.clone(),
            created_at: self.created_at(&key, now).await?,
            updated_at: now,
        };
        self.store.write(&key, serde_json::to_vec(&row)?).await?;
        Ok(row)
    }
}
