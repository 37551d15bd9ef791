//! Bidirectional reconciliation of pattern definitions and progress between
//! this device and the account's remote rows.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::auth::AccountProvider;
use crate::error::{Result, SyncError};
use crate::model::{epoch_millis, SyncMeta};

mod local;
mod remote;

pub use local::{FsLocalStore, LocalStore};
pub use remote::{ObjectRecordStore, RemotePatternRow, RemoteProgressRow, RemoteRecords};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Upload,
    Download,
    None,
}

/// Decide how a pattern definition moves. `remote_updated_at` is the remote
/// row's timestamp when one exists.
pub fn decide_pattern(
    local_present: bool,
    remote_updated_at: Option<i64>,
    meta: Option<&SyncMeta>,
) -> Direction {
    match (local_present, remote_updated_at) {
        (false, None) => Direction::None,
        (false, Some(_)) => Direction::Download,
        (true, None) => Direction::Upload,
        (true, Some(remote_at)) => match meta {
            // Both copies exist but this device never recorded a sync.
            None => Direction::Download,
            Some(meta) if meta.needs_upload => Direction::Upload,
            Some(meta) if remote_at > meta.remote_updated_at.unwrap_or(meta.local_updated_at) => {
                Direction::Download
            }
            Some(_) => Direction::None,
        },
    }
}

/// Progress always prefers the local copy when both exist.
pub fn decide_progress(local_present: bool, remote_present: bool) -> Direction {
    match (local_present, remote_present) {
        (true, _) => Direction::Upload,
        (false, true) => Direction::Download,
        (false, false) => Direction::None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PatternOutcome {
    pub pattern_id: String,
    pub definition: Direction,
    pub progress: Direction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PatternFailure {
    pub pattern_id: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileReport {
    pub outcomes: Vec<PatternOutcome>,
    pub failures: Vec<PatternFailure>,
}

impl ReconcileReport {
    pub fn total(&self) -> usize {
        self.outcomes.len() + self.failures.len()
    }

    fn count(&self, direction: Direction) -> usize {
        self.outcomes
            .iter()
            .map(|o| {
                usize::from(o.definition == direction) + usize::from(o.progress == direction)
            })
            .sum()
    }

    pub fn uploads(&self) -> usize {
        self.count(Direction::Upload)
    }

    pub fn downloads(&self) -> usize {
        self.count(Direction::Download)
    }

    pub fn into_result(self) -> Result<Self> {
        if self.failures.is_empty() {
            return Ok(self);
        }
        Err(SyncError::PartialBatch {
            failed: self.failures.len(),
            total: self.total(),
        })
    }
}

pub struct SyncReconciler {
    local: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteRecords>,
    accounts: Arc<dyn AccountProvider>,
}

impl SyncReconciler {
    pub fn new(
        local: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteRecords>,
        accounts: Arc<dyn AccountProvider>,
    ) -> Self {
        Self {
            local,
            remote,
            accounts,
        }
    }

    /// Reconcile every pattern known locally or remotely. A failure on one
    /// pattern is recorded and the batch continues.
    pub async fn reconcile_all(&self) -> Result<ReconcileReport> {
        let Some(account_id) = self.accounts.current_account_id() else {
            debug!("no account, skipping reconcile");
            return Ok(ReconcileReport::default());
        };

        let mut ids: BTreeSet<String> = self.local.list_all_pattern_ids().await?.into_iter().collect();
        ids.extend(self.remote.list_pattern_ids(&account_id).await?);

        let mut report = ReconcileReport::default();
        for pattern_id in ids {
            match self.reconcile_one(&account_id, &pattern_id).await {
                Ok(outcome) => report.outcomes.push(outcome),
                Err(err) => {
                    warn!(pattern = %pattern_id, error = %err, "reconcile failed");
                    report.failures.push(PatternFailure {
                        pattern_id,
                        error: err.to_string(),
                    });
                }
            }
        }
        info!(
            patterns = report.total(),
            uploads = report.uploads(),
            downloads = report.downloads(),
            failed = report.failures.len(),
            "reconcile finished"
        );
        Ok(report)
    }

    /// Reconcile a single pattern. `Ok(None)` when signed out.
    pub async fn reconcile_pattern(&self, pattern_id: &str) -> Result<Option<PatternOutcome>> {
        match self.accounts.current_account_id() {
            Some(account_id) => Ok(Some(self.reconcile_one(&account_id, pattern_id).await?)),
            None => Ok(None),
        }
    }

    async fn reconcile_one(&self, account_id: &str, pattern_id: &str) -> Result<PatternOutcome> {
        let local_pattern = self.local.load_pattern(pattern_id).await?;
        let meta = self.local.load_sync_meta(pattern_id).await?;
        let remote_pattern = self.remote.fetch_pattern(account_id, pattern_id).await?;
        let local_progress = self.local.load_progress(pattern_id).await?;
        let remote_progress = self.remote.fetch_progress(account_id, pattern_id).await?;

        let definition = decide_pattern(
            local_pattern.is_some(),
            remote_pattern.as_ref().map(|row| row.updated_at),
            meta.as_ref(),
        );
        let progress = decide_progress(local_progress.is_some(), remote_progress.is_some());
        debug!(pattern = pattern_id, ?definition, ?progress, "reconcile decision");

        let mut next = meta
            .clone()
            .unwrap_or_else(|| SyncMeta {
                needs_upload: false,
                ..SyncMeta::dirty(pattern_id, epoch_millis())
            });

        match (definition, local_pattern, remote_pattern) {
            (Direction::Upload, Some(pattern), _) => {
                let row = self.remote.upsert_pattern(account_id, &pattern).await?;
                next.remote_updated_at = Some(row.updated_at);
                next.needs_upload = false;
            }
            (Direction::Download, _, Some(row)) => {
                self.local.save_pattern(&row.pattern).await?;
                next.remote_updated_at = Some(row.updated_at);
                next.local_updated_at = row.updated_at;
            }
            _ => {}
        }

        match (progress, local_progress, remote_progress) {
            (Direction::Upload, Some(record), _) => {
                self.remote.upsert_progress(account_id, &record).await?;
            }
            (Direction::Download, _, Some(row)) => {
                self.local.save_progress(&row.progress).await?;
            }
            _ => {}
        }

        // Written only once every transfer above has succeeded.
        let transferred = definition != Direction::None || progress != Direction::None;
        if transferred && meta.as_ref() != Some(&next) {
            self.local.save_sync_meta(&next).await?;
        }

        Ok(PatternOutcome {
            pattern_id: pattern_id.to_string(),
            definition,
            progress,
        })
    }
}

/// Record a local edit so the next reconcile uploads the definition.
pub async fn mark_local_change(local: &dyn LocalStore, pattern_id: &str) -> Result<SyncMeta> {
    let now = epoch_millis();
    let meta = match local.load_sync_meta(pattern_id).await? {
        Some(meta) => SyncMeta {
            local_updated_at: now,
            needs_upload: true,
            ..meta
        },
        None => SyncMeta::dirty(pattern_id, now),
    };
    local.save_sync_meta(&meta).await?;
    Ok(meta)
}

/// Remove a pattern from this device together with its progress and
/// sync bookkeeping. Remote rows are left alone.
pub async fn forget(local: &dyn LocalStore, pattern_id: &str) -> Result<()> {
    local.delete_progress(pattern_id).await?;
    local.delete_pattern(pattern_id).await?;
    local.delete_sync_meta(pattern_id).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticAccount;
    use crate::model::{sample_pattern, ProgressRecord};
    use crate::testutil::{FlakyStore, MemoryLocalStore, MemoryObjectStore};
    use std::sync::atomic::Ordering;

    fn meta(needs_upload: bool, local: i64, remote: Option<i64>) -> SyncMeta {
        SyncMeta {
            pattern_id: "p".into(),
            local_updated_at: local,
            remote_updated_at: remote,
            needs_upload,
        }
    }

    #[test]
    fn pattern_decision_table() {
        assert_eq!(decide_pattern(false, None, None), Direction::None);
        assert_eq!(decide_pattern(false, Some(10), None), Direction::Download);
        assert_eq!(decide_pattern(true, None, None), Direction::Upload);
        assert_eq!(
            decide_pattern(true, Some(10), Some(&meta(true, 50, Some(90)))),
            Direction::Upload
        );
        assert_eq!(
            decide_pattern(true, Some(100), Some(&meta(false, 50, Some(90)))),
            Direction::Download
        );
        assert_eq!(
            decide_pattern(true, Some(90), Some(&meta(false, 50, Some(90)))),
            Direction::None
        );
        // Without a recorded remote timestamp the local one is the baseline.
        assert_eq!(
            decide_pattern(true, Some(40), Some(&meta(false, 50, None))),
            Direction::None
        );
        assert_eq!(decide_pattern(true, Some(40), None), Direction::Download);
    }

    #[test]
    fn progress_prefers_local() {
        assert_eq!(decide_progress(true, true), Direction::Upload);
        assert_eq!(decide_progress(true, false), Direction::Upload);
        assert_eq!(decide_progress(false, true), Direction::Download);
        assert_eq!(decide_progress(false, false), Direction::None);
    }

    struct Fixture {
        local: Arc<MemoryLocalStore>,
        remote_mem: Arc<MemoryObjectStore>,
        remote_io: Arc<FlakyStore>,
        reconciler: SyncReconciler,
    }

    fn fixture(local: MemoryLocalStore, account: Option<&str>) -> Fixture {
        let local = Arc::new(local);
        let remote_mem = Arc::new(MemoryObjectStore::new());
        let remote_io = Arc::new(FlakyStore::new(remote_mem.clone()));
        let reconciler = SyncReconciler::new(
            local.clone(),
            Arc::new(ObjectRecordStore::new(remote_io.clone())),
            Arc::new(StaticAccount::new(account.map(str::to_string))),
        );
        Fixture {
            local,
            remote_mem,
            remote_io,
            reconciler,
        }
    }

    /// Seed remote rows directly so the seeding writes are not counted.
    async fn seed_remote(f: &Fixture, id: &str, with_progress: bool) -> i64 {
        let records = ObjectRecordStore::new(f.remote_mem.clone());
        let pattern = sample_pattern(id);
        let row = records.upsert_pattern("acct", &pattern).await.unwrap();
        if with_progress {
            records
                .upsert_progress("acct", &ProgressRecord::fresh(&pattern))
                .await
                .unwrap();
        }
        row.updated_at
    }

    #[tokio::test]
    async fn remote_only_pattern_downloads_without_uploading() {
        let f = fixture(MemoryLocalStore::new(), Some("acct"));
        seed_remote(&f, "p", true).await;

        let report = f.reconciler.reconcile_all().await.unwrap();
        assert_eq!(
            report.outcomes,
            vec![PatternOutcome {
                pattern_id: "p".into(),
                definition: Direction::Download,
                progress: Direction::Download,
            }]
        );
        assert_eq!(f.local.pattern_saves.load(Ordering::SeqCst), 1);
        assert_eq!(f.local.progress_saves.load(Ordering::SeqCst), 1);
        assert!(f.remote_io.written().is_empty());

        let meta = f.local.meta("p").unwrap();
        assert!(!meta.needs_upload);
        assert!(meta.remote_updated_at.is_some());
    }

    #[tokio::test]
    async fn both_progress_present_uploads_once() {
        let pattern = sample_pattern("p");
        let f = fixture(
            MemoryLocalStore::new()
                .with_pattern(pattern.clone())
                .with_progress(ProgressRecord::fresh(&pattern)),
            Some("acct"),
        );
        let remote_at = seed_remote(&f, "p", true).await;
        f.local
            .save_sync_meta(&SyncMeta {
                pattern_id: "p".into(),
                local_updated_at: remote_at,
                remote_updated_at: Some(remote_at),
                needs_upload: false,
            })
            .await
            .unwrap();

        let report = f.reconciler.reconcile_all().await.unwrap();
        assert_eq!(report.outcomes[0].definition, Direction::None);
        assert_eq!(report.outcomes[0].progress, Direction::Upload);
        assert_eq!(f.remote_io.written(), vec!["acct/progress/p.json".to_string()]);
        assert_eq!(f.local.progress_saves.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn dirty_local_pattern_uploads_and_clears_flag() {
        let pattern = sample_pattern("p");
        let f = fixture(MemoryLocalStore::new().with_pattern(pattern), Some("acct"));
        seed_remote(&f, "p", false).await;
        mark_local_change(f.local.as_ref(), "p").await.unwrap();
        assert!(f.local.meta("p").unwrap().needs_upload);

        let outcome = f.reconciler.reconcile_pattern("p").await.unwrap().unwrap();
        assert_eq!(outcome.definition, Direction::Upload);
        assert_eq!(outcome.progress, Direction::None);
        assert!(!f.local.meta("p").unwrap().needs_upload);
        assert_eq!(f.remote_io.written(), vec!["acct/patterns/p.json".to_string()]);

        // A second pass has nothing left to move for the definition.
        let again = f.reconciler.reconcile_pattern("p").await.unwrap().unwrap();
        assert_eq!(again.definition, Direction::None);
    }

    #[tokio::test]
    async fn one_failing_pattern_does_not_stop_the_batch() {
        let local = MemoryLocalStore::new()
            .with_pattern(sample_pattern("a"))
            .with_pattern(sample_pattern("b"))
            .with_pattern(sample_pattern("c"));
        local.fail_on("b");
        let f = fixture(local, Some("acct"));

        let report = f.reconciler.reconcile_all().await.unwrap();
        assert_eq!(report.outcomes.len(), 2);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].pattern_id, "b");
        assert_eq!(report.uploads(), 2);

        let err = report.into_result().unwrap_err();
        assert!(matches!(err, SyncError::PartialBatch { failed: 1, total: 3 }));
    }

    #[tokio::test]
    async fn failed_upload_leaves_meta_dirty() {
        let pattern = sample_pattern("p");
        let f = fixture(MemoryLocalStore::new().with_pattern(pattern), Some("acct"));
        mark_local_change(f.local.as_ref(), "p").await.unwrap();
        f.remote_io.fail_all_writes(true);

        let report = f.reconciler.reconcile_all().await.unwrap();
        assert_eq!(report.failures.len(), 1);
        assert!(f.local.meta("p").unwrap().needs_upload);
    }

    #[tokio::test]
    async fn signed_out_reconcile_is_a_no_op() {
        let f = fixture(
            MemoryLocalStore::new().with_pattern(sample_pattern("p")),
            None,
        );
        let report = f.reconciler.reconcile_all().await.unwrap();
        assert_eq!(report.total(), 0);
        assert!(f.reconciler.reconcile_pattern("p").await.unwrap().is_none());
        assert!(f.remote_io.written().is_empty());
    }

    #[tokio::test]
    async fn forget_removes_local_records_together() {
        let pattern = sample_pattern("p");
        let local = MemoryLocalStore::new()
            .with_pattern(pattern.clone())
            .with_progress(ProgressRecord::fresh(&pattern))
            .with_meta(SyncMeta::dirty("p", 1));
        forget(&local, "p").await.unwrap();
        assert!(!local.has_pattern("p"));
        assert!(local.meta("p").is_none());
        assert!(local.list_all_pattern_ids().await.unwrap().is_empty());
    }
}
