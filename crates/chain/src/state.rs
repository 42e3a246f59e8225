//! Snapshot-capable state overlay.
//!
//! Block execution never writes to disk directly. It mutates a [`StateStore`]
//! overlay on top of the persisted state; on success the overlay yields the
//! forward writes (for the commit batch) and the reverse diff (persisted per
//! height so `delete_last_block` can undo the block exactly).

use crate::storage::ChainStorage;
use meridian_types::Hash;
use std::collections::BTreeMap;

/// Build the composite state key for a (module, key) pair.
///
/// The module name is length-prefixed so distinct pairs can never collide.
pub fn state_key(module: &str, key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + module.len() + key.len());
    out.extend_from_slice(&(module.len() as u16).to_be_bytes());
    out.extend_from_slice(module.as_bytes());
    out.extend_from_slice(key);
    out
}

/// One forward write produced by executing a block.
#[derive(Debug, Clone, PartialEq, Eq, sbor::prelude::BasicSbor)]
pub struct StateWrite {
    pub key: Vec<u8>,
    /// `None` deletes the key.
    pub value: Option<Vec<u8>>,
}

/// One reverse entry: the value the key held before the block.
#[derive(Debug, Clone, PartialEq, Eq, sbor::prelude::BasicSbor)]
pub struct DiffEntry {
    pub key: Vec<u8>,
    /// `None` means the key did not exist before.
    pub previous: Option<Vec<u8>>,
}

/// The reverse diff of one block, persisted at its height.
#[derive(Debug, Clone, PartialEq, Eq, Default, sbor::prelude::BasicSbor)]
pub struct StateDiff {
    pub entries: Vec<DiffEntry>,
}

/// Read-through overlay over the persisted state.
///
/// Supports a single snapshot level: the tie-break path snapshots the tip,
/// attempts the swap, and restores on failure.
pub struct StateStore<'a> {
    storage: &'a ChainStorage,
    writes: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
    snapshot: Option<BTreeMap<Vec<u8>, Option<Vec<u8>>>>,
}

impl<'a> StateStore<'a> {
    pub fn new(storage: &'a ChainStorage) -> Self {
        Self {
            storage,
            writes: BTreeMap::new(),
            snapshot: None,
        }
    }

    /// Read a key, seeing uncommitted overlay writes first.
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        match self.writes.get(key) {
            Some(value) => value.clone(),
            None => self.storage.get_state(key),
        }
    }

    pub fn set(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.writes.insert(key, Some(value));
    }

    pub fn delete(&mut self, key: Vec<u8>) {
        self.writes.insert(key, None);
    }

    /// Record the current overlay so a later [`restore`](Self::restore) can
    /// roll back to it.
    pub fn snapshot(&mut self) {
        self.snapshot = Some(self.writes.clone());
    }

    /// Roll the overlay back to the last snapshot (or to empty if none was
    /// taken).
    pub fn restore(&mut self) {
        self.writes = self.snapshot.take().unwrap_or_default();
    }

    /// Discard all overlay writes.
    pub fn discard(&mut self) {
        self.writes.clear();
        self.snapshot = None;
    }

    /// The deterministic state root: SHA-256 folded over the sorted merged
    /// key/value set of the persisted state plus this overlay.
    pub fn state_root(&self) -> Hash {
        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> = self.storage.iter_state().collect();
        for (key, value) in &self.writes {
            match value {
                Some(v) => {
                    merged.insert(key.clone(), v.clone());
                }
                None => {
                    merged.remove(key);
                }
            }
        }
        let mut buf = Vec::new();
        for (key, value) in &merged {
            buf.extend_from_slice(&(key.len() as u32).to_be_bytes());
            buf.extend_from_slice(key);
            buf.extend_from_slice(&(value.len() as u32).to_be_bytes());
            buf.extend_from_slice(value);
        }
        Hash::digest(&buf)
    }

    /// Consume the overlay into the forward writes and the reverse diff.
    pub fn into_changes(self) -> (Vec<StateWrite>, StateDiff) {
        let mut writes = Vec::with_capacity(self.writes.len());
        let mut entries = Vec::with_capacity(self.writes.len());
        for (key, value) in self.writes {
            let previous = self.storage.get_state(&key);
            // Unchanged keys produce no write and no diff entry.
            if previous == value {
                continue;
            }
            entries.push(DiffEntry {
                key: key.clone(),
                previous,
            });
            writes.push(StateWrite { key, value });
        }
        (writes, StateDiff { entries })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_storage(dir: &TempDir) -> ChainStorage {
        ChainStorage::open(dir.path()).unwrap()
    }

    #[test]
    fn overlay_reads_through_to_storage() {
        let dir = TempDir::new().unwrap();
        let storage = open_storage(&dir);
        storage.apply_state_writes_for_test(&[StateWrite {
            key: b"k".to_vec(),
            value: Some(b"base".to_vec()),
        }]);

        let mut store = StateStore::new(&storage);
        assert_eq!(store.get(b"k"), Some(b"base".to_vec()));
        store.set(b"k".to_vec(), b"new".to_vec());
        assert_eq!(store.get(b"k"), Some(b"new".to_vec()));
        store.delete(b"k".to_vec());
        assert_eq!(store.get(b"k"), None);
    }

    #[test]
    fn snapshot_restore_rolls_back() {
        let dir = TempDir::new().unwrap();
        let storage = open_storage(&dir);

        let mut store = StateStore::new(&storage);
        store.set(b"a".to_vec(), vec![1]);
        store.snapshot();
        store.set(b"a".to_vec(), vec![2]);
        store.set(b"b".to_vec(), vec![3]);
        store.restore();
        assert_eq!(store.get(b"a"), Some(vec![1]));
        assert_eq!(store.get(b"b"), None);
    }

    #[test]
    fn diff_records_previous_values() {
        let dir = TempDir::new().unwrap();
        let storage = open_storage(&dir);
        storage.apply_state_writes_for_test(&[StateWrite {
            key: b"existing".to_vec(),
            value: Some(vec![9]),
        }]);

        let mut store = StateStore::new(&storage);
        store.set(b"existing".to_vec(), vec![1]);
        store.set(b"fresh".to_vec(), vec![2]);
        let (writes, diff) = store.into_changes();

        assert_eq!(writes.len(), 2);
        let existing = diff
            .entries
            .iter()
            .find(|e| e.key == b"existing".to_vec())
            .unwrap();
        assert_eq!(existing.previous, Some(vec![9]));
        let fresh = diff
            .entries
            .iter()
            .find(|e| e.key == b"fresh".to_vec())
            .unwrap();
        assert_eq!(fresh.previous, None);
    }

    #[test]
    fn unchanged_writes_produce_no_diff() {
        let dir = TempDir::new().unwrap();
        let storage = open_storage(&dir);
        storage.apply_state_writes_for_test(&[StateWrite {
            key: b"same".to_vec(),
            value: Some(vec![7]),
        }]);

        let mut store = StateStore::new(&storage);
        store.set(b"same".to_vec(), vec![7]);
        let (writes, diff) = store.into_changes();
        assert!(writes.is_empty());
        assert!(diff.entries.is_empty());
    }

    #[test]
    fn state_root_is_order_independent() {
        let dir = TempDir::new().unwrap();
        let storage = open_storage(&dir);

        let mut a = StateStore::new(&storage);
        a.set(b"x".to_vec(), vec![1]);
        a.set(b"y".to_vec(), vec![2]);

        let mut b = StateStore::new(&storage);
        b.set(b"y".to_vec(), vec![2]);
        b.set(b"x".to_vec(), vec![1]);

        assert_eq!(a.state_root(), b.state_root());
    }

    #[test]
    fn composite_keys_cannot_collide() {
        assert_ne!(state_key("ab", b"c"), state_key("a", b"bc"));
    }
}
