//! In-memory doubles shared by unit tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::error::{Result, SyncError};
use crate::model::{PatternDoc, ProgressRecord, SyncMeta};
use crate::reconcile::LocalStore;
use crate::storage::{ObjectEntry, ObjectStore};

/// Object store with a logical clock so listings carry deterministic timestamps.
pub struct MemoryObjectStore {
    objects: Mutex<BTreeMap<String, (Vec<u8>, i64)>>,
    clock: AtomicI64,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self {
            objects: Mutex::new(BTreeMap::new()),
            clock: AtomicI64::new(1_000),
        }
    }

    pub fn insert_at(&self, key: &str, data: Vec<u8>, updated_at: i64) {
        self.objects
            .lock()
            .unwrap()
            .insert(key.to_string(), (data, updated_at));
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.lock().unwrap().get(key).map(|(d, _)| d.clone())
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects.lock().unwrap().keys().cloned().collect()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectEntry>> {
        Ok(self
            .objects
            .lock()
            .unwrap()
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, (_, t))| ObjectEntry {
                key: k.clone(),
                updated_at: *t,
            })
            .collect())
    }

    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.get(key))
    }

    async fn write(&self, key: &str, data: Vec<u8>) -> Result<()> {
        let now = self.clock.fetch_add(1, Ordering::SeqCst);
        self.insert_at(key, data, now);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.objects.lock().unwrap().remove(key);
        Ok(())
    }
}

/// Wraps a store to inject write failures and record the timing and
/// concurrency of write attempts.
pub struct FlakyStore {
    inner: Arc<dyn ObjectStore>,
    fail_writes: AtomicUsize,
    fail_always: AtomicBool,
    write_delay: Mutex<Duration>,
    attempts: Mutex<Vec<Instant>>,
    written: Mutex<Vec<String>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl FlakyStore {
    pub fn new(inner: Arc<dyn ObjectStore>) -> Self {
        Self {
            inner,
            fail_writes: AtomicUsize::new(0),
            fail_always: AtomicBool::new(false),
            write_delay: Mutex::new(Duration::ZERO),
            attempts: Mutex::new(Vec::new()),
            written: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        }
    }

    pub fn fail_next_writes(&self, n: usize) {
        self.fail_writes.store(n, Ordering::SeqCst);
    }

    pub fn fail_all_writes(&self, fail: bool) {
        self.fail_always.store(fail, Ordering::SeqCst);
    }

    pub fn set_write_delay(&self, delay: Duration) {
        *self.write_delay.lock().unwrap() = delay;
    }

    pub fn attempts(&self) -> Vec<Instant> {
        self.attempts.lock().unwrap().clone()
    }

    /// Keys of writes that reached the inner store.
    pub fn written(&self) -> Vec<String> {
        self.written.lock().unwrap().clone()
    }

    pub fn max_concurrent_writes(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    fn should_fail(&self) -> bool {
        if self.fail_always.load(Ordering::SeqCst) {
            return true;
        }
        self.fail_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl ObjectStore for FlakyStore {
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectEntry>> {
        self.inner.list(prefix).await
    }

    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.inner.read(key).await
    }

    async fn write(&self, key: &str, data: Vec<u8>) -> Result<()> {
        self.attempts.lock().unwrap().push(Instant::now());
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);

        let delay = *self.write_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let result = if self.should_fail() {
            Err(SyncError::Network(format!("injected failure writing {key}")))
        } else {
            self.inner.write(key, data).await
        };
        if result.is_ok() {
            self.written.lock().unwrap().push(key.to_string());
        }
        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.inner.delete(key).await
    }
}

#[derive(Default)]
struct LocalState {
    patterns: HashMap<String, PatternDoc>,
    progress: HashMap<String, ProgressRecord>,
    meta: HashMap<String, SyncMeta>,
}

/// Local store double counting the writes that downloads perform.
#[derive(Default)]
pub struct MemoryLocalStore {
    state: Mutex<LocalState>,
    failing: Mutex<HashSet<String>>,
    pub pattern_saves: AtomicUsize,
    pub progress_saves: AtomicUsize,
}

impl MemoryLocalStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pattern(self, pattern: PatternDoc) -> Self {
        self.state
            .lock()
            .unwrap()
            .patterns
            .insert(pattern.id.clone(), pattern);
        self
    }

    pub fn with_progress(self, progress: ProgressRecord) -> Self {
        self.state
            .lock()
            .unwrap()
            .progress
            .insert(progress.pattern_id.clone(), progress);
        self
    }

    pub fn with_meta(self, meta: SyncMeta) -> Self {
        self.state
            .lock()
            .unwrap()
            .meta
            .insert(meta.pattern_id.clone(), meta);
        self
    }

    /// Make every local operation on `pattern_id` fail.
    pub fn fail_on(&self, pattern_id: &str) {
        self.failing.lock().unwrap().insert(pattern_id.to_string());
    }

    pub fn meta(&self, pattern_id: &str) -> Option<SyncMeta> {
        self.state.lock().unwrap().meta.get(pattern_id).cloned()
    }

    pub fn has_pattern(&self, pattern_id: &str) -> bool {
        self.state.lock().unwrap().patterns.contains_key(pattern_id)
    }

    fn check(&self, pattern_id: &str) -> Result<()> {
        if self.failing.lock().unwrap().contains(pattern_id) {
            return Err(SyncError::Storage(format!("local store unavailable for {pattern_id}")));
        }
        Ok(())
    }
}

#[async_trait]
impl LocalStore for MemoryLocalStore {
    async fn load_pattern(&self, pattern_id: &str) -> Result<Option<PatternDoc>> {
        self.check(pattern_id)?;
        Ok(self.state.lock().unwrap().patterns.get(pattern_id).cloned())
    }

    async fn save_pattern(&self, pattern: &PatternDoc) -> Result<()> {
        self.check(&pattern.id)?;
        self.pattern_saves.fetch_add(1, Ordering::SeqCst);
        self.state
            .lock()
            .unwrap()
            .patterns
            .insert(pattern.id.clone(), pattern.clone());
        Ok(())
    }

    async fn delete_pattern(&self, pattern_id: &str) -> Result<()> {
        self.state.lock().unwrap().patterns.remove(pattern_id);
        Ok(())
    }

    async fn load_progress(&self, pattern_id: &str) -> Result<Option<ProgressRecord>> {
        self.check(pattern_id)?;
        Ok(self.state.lock().unwrap().progress.get(pattern_id).cloned())
    }

    async fn save_progress(&self, progress: &ProgressRecord) -> Result<()> {
        self.check(&progress.pattern_id)?;
        self.progress_saves.fetch_add(1, Ordering::SeqCst);
        self.state
            .lock()
            .unwrap()
            .progress
            .insert(progress.pattern_id.clone(), progress.clone());
        Ok(())
    }

    async fn delete_progress(&self, pattern_id: &str) -> Result<()> {
        self.state.lock().unwrap().progress.remove(pattern_id);
        Ok(())
    }

    async fn load_sync_meta(&self, pattern_id: &str) -> Result<Option<SyncMeta>> {
        self.check(pattern_id)?;
        Ok(self.meta(pattern_id))
    }

    async fn save_sync_meta(&self, meta: &SyncMeta) -> Result<()> {
        self.check(&meta.pattern_id)?;
        self.state
            .lock()
            .unwrap()
            .meta
            .insert(meta.pattern_id.clone(), meta.clone());
        Ok(())
    }

    async fn delete_sync_meta(&self, pattern_id: &str) -> Result<()> {
        self.state.lock().unwrap().meta.remove(pattern_id);
        Ok(())
    }

    async fn list_all_pattern_ids(&self) -> Result<Vec<String>> {
        let state = self.state.lock().unwrap();
        let ids: std::collections::BTreeSet<String> = state
            .patterns
            .keys()
            .chain(state.progress.keys())
            .cloned()
            .collect();
        Ok(ids.into_iter().collect())
    }
}
