//! A JSON object on disk, shared by many concurrent writers.
//!
//! Writes are staged and renamed, and before each write the on-disk copy is
//! re-read when its mtime diverges from the last one seen. Combined with the
//! add-into-the-current-value merge this makes concurrent counter updates from
//! parallel compiler processes commutative.

use crate::{
    error::Result,
    lock::{CacheLock, STORE_LOCK_TIMEOUT},
    utils,
};
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    time::SystemTime,
};

#[derive(Debug)]
pub struct PersistentJsonMap {
    path: PathBuf,
    lock: CacheLock,
    map: BTreeMap<String, i64>,
    mtime: Option<SystemTime>,
}

impl PersistentJsonMap {
    /// Opens (or prepares to create) the store; a broken or missing file
    /// starts out empty and is healed on the next save.
    pub fn new(path: PathBuf, locks_dir: &Path) -> Self {
        let name = path.file_name().unwrap_or_default().to_string_lossy().into_owned();
        let lock = CacheLock::new(locks_dir, &name, STORE_LOCK_TIMEOUT);
        let mut this = Self { path, lock, map: BTreeMap::new(), mtime: None };
        if let Ok(_guard) = this.lock.acquire() {
            this.load();
        }
        this
    }

    fn load(&mut self) {
        let Ok(meta) = fs::metadata(&self.path) else { return };
        self.mtime = meta.modified().ok();
        if let Ok(map) = utils::read_json_file::<BTreeMap<String, i64>>(&self.path) {
            for (key, value) in map {
                self.map.insert(key, value);
            }
        }
    }

    pub fn get(&self, key: &str) -> i64 {
        self.map.get(key).copied().unwrap_or(0)
    }

    pub fn insert(&mut self, key: &str, value: i64) {
        self.map.insert(key.to_string(), value);
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.map.contains_key(key)
    }

    pub fn as_map(&self) -> &BTreeMap<String, i64> {
        &self.map
    }

    pub fn save(&mut self) -> Result<()> {
        self.save_with(|_| {})
    }

    /// Saves after applying `apply`, merging in concurrent on-disk updates
    /// first.
    pub fn save_with(&mut self, apply: impl FnOnce(&mut BTreeMap<String, i64>)) -> Result<()> {
        let _guard = self.lock.acquire()?;

        let disk_mtime = fs::metadata(&self.path).ok().and_then(|meta| meta.modified().ok());
        if disk_mtime.is_some() && disk_mtime != self.mtime {
            self.load();
        }

        apply(&mut self.map);
        utils::write_json_file(&self.map, &self.path)?;
        self.mtime = fs::metadata(&self.path).ok().and_then(|meta| meta.modified().ok());
        Ok(())
    }

    /// Adds the caller's counters into the on-disk counters. A no-op when
    /// there is nothing to add.
    pub fn save_combined(&mut self, other: &BTreeMap<String, i64>) -> Result<()> {
        if other.values().all(|value| *value == 0) {
            return Ok(());
        }
        self.save_with(|map| {
            for (key, value) in other {
                *map.entry(key.clone()).or_insert(0) += value;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn concurrent_updates_merge_instead_of_clobbering() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stats.txt");
        let locks = dir.path().join("locks");

        let mut first = PersistentJsonMap::new(path.clone(), &locks);
        let mut second = PersistentJsonMap::new(path.clone(), &locks);

        first.save_combined(&BTreeMap::from([("CacheHits".to_string(), 2)])).unwrap();
        // `second` was opened before `first` saved; its save must pick up the
        // on-disk value instead of overwriting it.
        std::thread::sleep(std::time::Duration::from_millis(20));
        second.save_combined(&BTreeMap::from([("CacheHits".to_string(), 3)])).unwrap();

        let reread = PersistentJsonMap::new(path, &locks);
        assert_eq!(reread.get("CacheHits"), 5);
    }

    #[test]
    fn zero_deltas_do_not_touch_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stats.txt");
        let mut store = PersistentJsonMap::new(path.clone(), &dir.path().join("locks"));
        store.save_combined(&BTreeMap::from([("CacheHits".to_string(), 0)])).unwrap();
        assert!(!path.exists());
    }
}
