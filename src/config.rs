//! Cache configuration, persisted as `config.txt` in the cache root.

use crate::{error::Result, jsonstore::PersistentJsonMap};
use std::path::{Path, PathBuf};

const MAXIMUM_CACHE_SIZE: &str = "MaximumCacheSize";

/// 40 GB.
const DEFAULT_MAXIMUM_CACHE_SIZE: i64 = 40_737_418_240;

#[derive(Debug)]
pub struct Configuration {
    map: PersistentJsonMap,
}

impl Configuration {
    pub fn new(path: PathBuf, locks_dir: &Path) -> Self {
        let mut map = PersistentJsonMap::new(path, locks_dir);
        if !map.contains_key(MAXIMUM_CACHE_SIZE) {
            map.insert(MAXIMUM_CACHE_SIZE, DEFAULT_MAXIMUM_CACHE_SIZE);
        }
        Self { map }
    }

    pub fn max_cache_size(&self) -> u64 {
        self.map.get(MAXIMUM_CACHE_SIZE).max(0) as u64
    }

    pub fn set_max_cache_size(&mut self, size: u64) -> Result<()> {
        self.map.insert(MAXIMUM_CACHE_SIZE, size as i64);
        self.map.save()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn default_size_applies_until_configured() {
        let dir = tempfile::tempdir().unwrap();
        let locks = dir.path().join("locks");
        let mut config = Configuration::new(dir.path().join("config.txt"), &locks);
        assert_eq!(config.max_cache_size(), DEFAULT_MAXIMUM_CACHE_SIZE as u64);

        config.set_max_cache_size(1024).unwrap();
        let reread = Configuration::new(dir.path().join("config.txt"), &locks);
        assert_eq!(reread.max_cache_size(), 1024);
    }
}
