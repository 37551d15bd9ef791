use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};

use regex::Regex;
use serde::Serialize;
use tracing::debug;

use crate::error::Result;
use crate::model::epoch_millis;
use crate::storage::{validate_segment, ObjectStore};

/// Snapshot history is capped at this many slots per pattern.
pub const MAX_SLOTS: usize = 9;
pub const SLOT_EXTENSION: &str = "json.gz";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteSlot {
    pub slot_index: usize,
    pub path: String,
    pub updated_at: i64,
}

fn slot_name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^slot-(0|[1-9][0-9]*)\.[A-Za-z0-9]+(?:\.[A-Za-z0-9]+)*$")
            .expect("slot name pattern is valid")
    })
}

/// Slot index for a canonical `slot-<N>.<ext>` file name within range.
pub fn parse_slot_index(name: &str) -> Option<usize> {
    let caps = slot_name_regex().captures(name)?;
    let index: usize = caps.get(1)?.as_str().parse().ok()?;
    (index < MAX_SLOTS).then_some(index)
}

pub fn slot_prefix(account_id: &str, pattern_id: &str) -> Result<String> {
    validate_segment(account_id)?;
    validate_segment(pattern_id)?;
    Ok(format!("{account_id}/{pattern_id}/"))
}

pub fn slot_path(account_id: &str, pattern_id: &str, index: usize) -> Result<String> {
    Ok(format!(
        "{}slot-{index}.{SLOT_EXTENSION}",
        slot_prefix(account_id, pattern_id)?
    ))
}

/// Lowest unused index while the ring has room, otherwise the slot with the
/// oldest `updated_at` (lowest index on ties).
pub fn pick_slot_to_write(existing: &[RemoteSlot]) -> usize {
    if existing.len() < MAX_SLOTS {
        return (0..MAX_SLOTS)
            .find(|i| !existing.iter().any(|s| s.slot_index == *i))
            .unwrap_or(0);
    }
    existing
        .iter()
        .min_by_key(|s| (s.updated_at, s.slot_index))
        .map(|s| s.slot_index)
        .unwrap_or(0)
}

/// Fixed-capacity ring of snapshots per (account, pattern).
///
/// There is no cross-process lock: two writers may pick the same oldest slot
/// and one of them wins. Loss is bounded to that one slot.
#[derive(Clone)]
pub struct RollingSnapshotStore {
    store: Arc<dyn ObjectStore>,
}

impl RollingSnapshotStore {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    pub async fn list_slots(&self, account_id: &str, pattern_id: &str) -> Result<Vec<RemoteSlot>> {
        let prefix = slot_prefix(account_id, pattern_id)?;
        let mut by_index: BTreeMap<usize, RemoteSlot> = BTreeMap::new();
        for entry in self.store.list(&prefix).await? {
            let Some(name) = entry.key.strip_prefix(&prefix) else {
                continue;
            };
            if name.contains('/') {
                continue;
            }
            let Some(slot_index) = parse_slot_index(name) else {
                continue;
            };
            let slot = RemoteSlot {
                slot_index,
                path: entry.key.clone(),
                updated_at: entry.updated_at,
            };
            match by_index.get(&slot_index) {
                Some(existing) if existing.updated_at >= slot.updated_at => {}
                _ => {
                    by_index.insert(slot_index, slot);
                }
            }
        }
        Ok(by_index.into_values().collect())
    }

    pub async fn write(&self, account_id: &str, pattern_id: &str, bytes: Vec<u8>) -> Result<RemoteSlot> {
        let existing = self.list_slots(account_id, pattern_id).await?;
        let slot_index = pick_slot_to_write(&existing);
        let path = slot_path(account_id, pattern_id, slot_index)?;
        debug!(
            pattern = pattern_id,
            slot = slot_index,
            existing = existing.len(),
            "writing snapshot slot"
        );
        self.store.write(&path, bytes).await?;

        // Report the store's own timestamp so it orders with later listings.
        let listed = match self.list_slots(account_id, pattern_id).await {
            Ok(slots) => slots
                .into_iter()
                .find(|s| s.slot_index == slot_index)
                .map(|s| s.updated_at),
            Err(err) => {
                debug!(pattern = pattern_id, error = %err, "could not re-list slots after write");
                None
            }
        };
        Ok(RemoteSlot {
            slot_index,
            path,
            updated_at: listed.unwrap_or_else(epoch_millis),
        })
    }

    pub async fn read_latest(&self, account_id: &str, pattern_id: &str) -> Result<Option<Vec<u8>>> {
        let slots = self.list_slots(account_id, pattern_id).await?;
        let Some(latest) = slots.iter().max_by_key(|s| (s.updated_at, s.slot_index)) else {
            return Ok(None);
        };
        self.store.read(&latest.path).await
    }

    pub async fn read_slot(
        &self,
        account_id: &str,
        pattern_id: &str,
        slot_index: usize,
    ) -> Result<Option<Vec<u8>>> {
        let slots = self.list_slots(account_id, pattern_id).await?;
        match slots.iter().find(|s| s.slot_index == slot_index) {
            Some(slot) => self.store.read(&slot.path).await,
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use crate::testutil::{FlakyStore, MemoryObjectStore};

    fn slot(slot_index: usize, updated_at: i64) -> RemoteSlot {
        RemoteSlot {
            slot_index,
            path: format!("a/p/slot-{slot_index}.json.gz"),
            updated_at,
        }
    }

    #[test]
    fn slot_names_must_be_canonical() {
        assert_eq!(parse_slot_index("slot-0.json.gz"), Some(0));
        assert_eq!(parse_slot_index("slot-8.json"), Some(8));
        assert_eq!(parse_slot_index("slot-9.json.gz"), None);
        assert_eq!(parse_slot_index("slot-01.json.gz"), None);
        assert_eq!(parse_slot_index("slot-3"), None);
        assert_eq!(parse_slot_index("slot-x.json.gz"), None);
        assert_eq!(parse_slot_index("backup-1.json.gz"), None);
        assert_eq!(parse_slot_index("slot-99999999999999999999999.json.gz"), None);
    }

    #[test]
    fn pick_lowest_unused_when_not_full() {
        assert_eq!(pick_slot_to_write(&[]), 0);
        assert_eq!(pick_slot_to_write(&[slot(0, 5), slot(1, 6), slot(3, 7)]), 2);
        let eight: Vec<RemoteSlot> = (0..8).map(|i| slot(i, 100 - i as i64)).collect();
        assert_eq!(pick_slot_to_write(&eight), 8);
    }

    #[test]
    fn pick_oldest_when_full() {
        // updated_at 10..90, with the oldest placed at index 4.
        let order = [50, 60, 70, 80, 10, 20, 30, 40, 90];
        let full: Vec<RemoteSlot> = order
            .iter()
            .enumerate()
            .map(|(i, &t)| slot(i, t))
            .collect();
        assert_eq!(pick_slot_to_write(&full), 4);
    }

    #[tokio::test]
    async fn list_skips_malformed_and_nested_names() {
        let mem = Arc::new(MemoryObjectStore::new());
        for key in [
            "a/p/slot-0.json.gz",
            "a/p/slot-2.json.gz",
            "a/p/slot-9.json.gz",
            "a/p/slot-x.json.gz",
            "a/p/notes.txt",
            "a/p/old/slot-1.json.gz",
            "a/p2/slot-1.json.gz",
        ] {
            mem.insert_at(key, vec![0], 1);
        }
        let store = RollingSnapshotStore::new(mem);
        let slots = store.list_slots("a", "p").await.unwrap();
        let indices: Vec<usize> = slots.iter().map(|s| s.slot_index).collect();
        assert_eq!(indices, vec![0, 2]);
    }

    #[tokio::test]
    async fn full_ring_overwrites_oldest_slot() {
        let mem = Arc::new(MemoryObjectStore::new());
        for i in 0..MAX_SLOTS {
            mem.insert_at(
                &format!("a/p/slot-{i}.json.gz"),
                vec![i as u8],
                10 * (i as i64 + 1),
            );
        }
        let store = RollingSnapshotStore::new(mem.clone());
        let written = store.write("a", "p", b"new".to_vec()).await.unwrap();
        assert_eq!(written.slot_index, 0);
        assert_eq!(mem.get("a/p/slot-0.json.gz"), Some(b"new".to_vec()));
        assert_eq!(store.list_slots("a", "p").await.unwrap().len(), MAX_SLOTS);
    }

    #[tokio::test]
    async fn ring_never_exceeds_capacity() {
        let mem = Arc::new(MemoryObjectStore::new());
        let store = RollingSnapshotStore::new(mem.clone());
        let mut written = Vec::new();
        for n in 0..(MAX_SLOTS * 2 + 3) {
            written.push(store.write("a", "p", vec![n as u8]).await.unwrap().slot_index);
        }
        assert_eq!(store.list_slots("a", "p").await.unwrap().len(), MAX_SLOTS);
        // Fills 0..9 in order, then rotates through the same order.
        assert_eq!(&written[..MAX_SLOTS], &(0..MAX_SLOTS).collect::<Vec<_>>()[..]);
        assert_eq!(written[MAX_SLOTS], 0);
        assert_eq!(written[MAX_SLOTS + 1], 1);
    }

    #[tokio::test]
    async fn written_slot_carries_store_timestamp() {
        let mem = Arc::new(MemoryObjectStore::new());
        let store = RollingSnapshotStore::new(mem);
        let first = store.write("a", "p", vec![1]).await.unwrap();
        let second = store.write("a", "p", vec![2]).await.unwrap();
        assert_eq!(first.updated_at, 1_000);
        assert_eq!(second.updated_at, 1_001);

        let listed = store.list_slots("a", "p").await.unwrap();
        assert_eq!(listed, vec![first, second]);
    }

    #[tokio::test]
    async fn read_latest_picks_newest_slot() {
        let mem = Arc::new(MemoryObjectStore::new());
        mem.insert_at("a/p/slot-0.json.gz", b"old".to_vec(), 10);
        mem.insert_at("a/p/slot-1.json.gz", b"newest".to_vec(), 30);
        mem.insert_at("a/p/slot-2.json.gz", b"middle".to_vec(), 20);
        let store = RollingSnapshotStore::new(mem);

        assert_eq!(
            store.read_latest("a", "p").await.unwrap(),
            Some(b"newest".to_vec())
        );
        assert_eq!(store.read_latest("a", "other").await.unwrap(), None);
        assert_eq!(
            store.read_slot("a", "p", 2).await.unwrap(),
            Some(b"middle".to_vec())
        );
        assert_eq!(store.read_slot("a", "p", 5).await.unwrap(), None);
    }

    #[tokio::test]
    async fn storage_errors_propagate() {
        let flaky = Arc::new(FlakyStore::new(Arc::new(MemoryObjectStore::new())));
        flaky.fail_next_writes(1);
        let store = RollingSnapshotStore::new(flaky.clone());
        let err = store.write("a", "p", vec![1]).await.unwrap_err();
        assert!(matches!(err, SyncError::Network(_)));
        assert!(store.write("a", "p", vec![1]).await.is_ok());
    }

    #[tokio::test]
    async fn ids_with_separators_are_rejected() {
        let store = RollingSnapshotStore::new(Arc::new(MemoryObjectStore::new()));
        assert!(matches!(
            store.write("a/b", "p", vec![1]).await,
            Err(SyncError::InvalidKey(_))
        ));
    }
}
