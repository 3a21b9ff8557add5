//! Cache statistics.
//!
//! Counters are accumulated in-process and merged into the persistent
//! `stats.txt` on shutdown, using the mtime-aware merge of
//! [`PersistentJsonMap`] so parallel compilers never lose each other's
//! increments.

use crate::{error::Result, jsonstore::PersistentJsonMap, AnalyzerError};
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Mutex,
};

/// Why an invocation could not be served from the cache. Each reason is one
/// counter in `stats.txt`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MissReason {
    HeaderChanged,
    SourceChanged,
    InvalidArgument,
    NoSourceFile,
    MultipleSourceFiles,
    Pch,
    Linking,
    ExternalDebugInfo,
    Preprocessing,
    CacheFailure,
    RemoteCacheHit,
}

impl MissReason {
    pub const ALL: &'static [MissReason] = &[
        MissReason::HeaderChanged,
        MissReason::SourceChanged,
        MissReason::InvalidArgument,
        MissReason::NoSourceFile,
        MissReason::MultipleSourceFiles,
        MissReason::Pch,
        MissReason::Linking,
        MissReason::ExternalDebugInfo,
        MissReason::Preprocessing,
        MissReason::CacheFailure,
        MissReason::RemoteCacheHit,
    ];

    /// The counter key in `stats.txt`.
    pub fn key(&self) -> &'static str {
        match self {
            MissReason::HeaderChanged => "HeaderChangedMisses",
            MissReason::SourceChanged => "SourceChangedMisses",
            MissReason::InvalidArgument => "CallsWithInvalidArgument",
            MissReason::NoSourceFile => "CallsWithoutSourceFile",
            MissReason::MultipleSourceFiles => "CallsWithMultipleSourceFiles",
            MissReason::Pch => "CallsWithPch",
            MissReason::Linking => "CallsForLinking",
            MissReason::ExternalDebugInfo => "CallsForExternalDebugInfo",
            MissReason::Preprocessing => "CallsForPreprocessing",
            MissReason::CacheFailure => "CacheFailures",
            MissReason::RemoteCacheHit => "RemoteCacheHits",
        }
    }
}

impl From<&AnalyzerError> for MissReason {
    fn from(err: &AnalyzerError) -> Self {
        match err {
            AnalyzerError::InvalidArgument(_) => MissReason::InvalidArgument,
            AnalyzerError::NoSourceFile => MissReason::NoSourceFile,
            AnalyzerError::MultipleSourceFiles => MissReason::MultipleSourceFiles,
            AnalyzerError::Preprocessing => MissReason::Preprocessing,
            AnalyzerError::ExternalDebugInfo => MissReason::ExternalDebugInfo,
            AnalyzerError::PrecompiledHeaders => MissReason::Pch,
            AnalyzerError::Linking => MissReason::Linking,
            AnalyzerError::JsonOutput | AnalyzerError::NoOutputFile => MissReason::CacheFailure,
        }
    }
}

const CACHE_HITS: &str = "CacheHits";
const CACHE_ENTRIES: &str = "CacheEntries";
const CACHE_SIZE: &str = "CacheSize";

/// In-process counters, shared across worker threads.
#[derive(Debug, Default)]
pub struct Stats {
    counters: Mutex<BTreeMap<String, i64>>,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    fn add(&self, key: &str, delta: i64) {
        let mut counters = self.counters.lock().unwrap_or_else(|err| err.into_inner());
        *counters.entry(key.to_string()).or_insert(0) += delta;
    }

    pub fn record_cache_miss(&self, reason: MissReason) {
        self.add(reason.key(), 1);
    }

    pub fn record_cache_hit(&self) {
        self.add(CACHE_HITS, 1);
    }

    /// Registers a newly created cache entry together with its miss reason.
    pub fn register_cache_entry(&self, reason: MissReason) {
        self.add(CACHE_ENTRIES, 1);
        self.add(reason.key(), 1);
    }

    pub fn register_cache_entry_size(&self, size: i64) {
        self.add(CACHE_SIZE, size);
    }

    pub fn cache_size(&self) -> i64 {
        self.counters.lock().unwrap_or_else(|err| err.into_inner()).get(CACHE_SIZE).copied().unwrap_or(0)
    }

    pub fn clear_cache_size(&self) {
        self.counters.lock().unwrap_or_else(|err| err.into_inner()).insert(CACHE_SIZE.into(), 0);
    }

    pub fn clear_cache_entries(&self) {
        self.counters.lock().unwrap_or_else(|err| err.into_inner()).insert(CACHE_ENTRIES.into(), 0);
    }

    pub fn snapshot(&self) -> BTreeMap<String, i64> {
        self.counters.lock().unwrap_or_else(|err| err.into_inner()).clone()
    }
}

/// The persistent merge sink behind `stats.txt`.
#[derive(Debug)]
pub struct PersistentStats {
    map: PersistentJsonMap,
}

impl PersistentStats {
    pub fn new(path: PathBuf, locks_dir: &Path) -> Self {
        Self { map: PersistentJsonMap::new(path, locks_dir) }
    }

    pub fn save_combined(&mut self, stats: &Stats) -> Result<()> {
        self.map.save_combined(&stats.snapshot())
    }

    pub fn get(&self, key: &str) -> i64 {
        self.map.get(key)
    }

    pub fn total_cache_hits(&self) -> i64 {
        self.map.get(CACHE_HITS)
    }

    pub fn total_cache_misses(&self) -> i64 {
        MissReason::ALL.iter().map(|reason| self.map.get(reason.key())).sum::<i64>()
            - self.map.get(MissReason::RemoteCacheHit.key())
    }

    pub fn cache_size(&self) -> i64 {
        self.map.get(CACHE_SIZE)
    }

    pub fn cache_entries(&self) -> i64 {
        self.map.get(CACHE_ENTRIES)
    }

    /// Overwrites size and entry count after a cleanup pass.
    pub fn set_cache_size_and_entries(&mut self, size: i64, entries: i64) -> Result<()> {
        self.map.save_with(|map| {
            map.insert(CACHE_SIZE.to_string(), size);
            map.insert(CACHE_ENTRIES.to_string(), entries);
        })
    }

    pub fn reset(&mut self) -> Result<()> {
        self.map.save_with(|map| {
            for reason in MissReason::ALL {
                map.insert(reason.key().to_string(), 0);
            }
            map.insert(CACHE_HITS.to_string(), 0);
        })
    }

    /// The human-readable statistics report printed by `--stats`.
    pub fn report(&self, cache_dir: &Path, max_cache_size: u64) -> String {
        let hits = self.total_cache_hits();
        let misses = self.total_cache_misses();
        let total = hits + misses;
        let percent = |part: i64| if total != 0 { 100.0 * part as f64 / total as f64 } else { 0.0 };
        let remote_hits = self.get(MissReason::RemoteCacheHit.key());
        format!(
            "clcache statistics:\n\
             \x20 current cache dir            : {}\n\
             \x20 cache size                   : {:.1} MB\n\
             \x20 maximum cache size           : {:.0} GB\n\
             \x20 cache entries                : {}\n\
             \x20 cache hits (total)           : {} ({:.0}%)\n\
             \x20 cache hits (remote)          : {} ({:.0}%)\n\
             \x20 cache misses                 : {} ({:.0}%)\n\
             \x20   header changed             : {}\n\
             \x20   source changed             : {}\n\
             \x20   cache failure              : {}\n\
             \x20   called w/ invalid argument : {}\n\
             \x20   called for preprocessing   : {}\n\
             \x20   called for linking         : {}\n\
             \x20   called for external debug  : {}\n\
             \x20   called w/o source          : {}\n\
             \x20   called w/ multiple sources : {}\n\
             \x20   called w/ PCH              : {}",
            cache_dir.display(),
            self.cache_size() as f64 / 1024.0 / 1024.0,
            max_cache_size as f64 / 1024.0 / 1024.0 / 1024.0,
            self.cache_entries(),
            hits,
            percent(hits),
            remote_hits,
            percent(remote_hits),
            misses,
            percent(misses),
            self.get(MissReason::HeaderChanged.key()),
            self.get(MissReason::SourceChanged.key()),
            self.get(MissReason::CacheFailure.key()),
            self.get(MissReason::InvalidArgument.key()),
            self.get(MissReason::Preprocessing.key()),
            self.get(MissReason::Linking.key()),
            self.get(MissReason::ExternalDebugInfo.key()),
            self.get(MissReason::NoSourceFile.key()),
            self.get(MissReason::MultipleSourceFiles.key()),
            self.get(MissReason::Pch.key()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn entry_registration_counts_entries_and_reason() {
        let stats = Stats::new();
        stats.register_cache_entry(MissReason::SourceChanged);
        stats.register_cache_entry_size(1024);
        let snapshot = stats.snapshot();
        assert_eq!(snapshot["CacheEntries"], 1);
        assert_eq!(snapshot["SourceChangedMisses"], 1);
        assert_eq!(snapshot["CacheSize"], 1024);
    }

    #[test]
    fn persistent_stats_merge_and_reset() {
        let dir = tempfile::tempdir().unwrap();
        let locks = dir.path().join("locks");
        let mut persistent = PersistentStats::new(dir.path().join("stats.txt"), &locks);

        let stats = Stats::new();
        stats.record_cache_hit();
        stats.record_cache_miss(MissReason::HeaderChanged);
        persistent.save_combined(&stats).unwrap();

        assert_eq!(persistent.total_cache_hits(), 1);
        assert_eq!(persistent.total_cache_misses(), 1);

        persistent.reset().unwrap();
        assert_eq!(persistent.total_cache_hits(), 0);
        assert_eq!(persistent.total_cache_misses(), 0);
    }
}
