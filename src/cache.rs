//! The cache facade: stores, configuration and statistics behind one handle.

use crate::{
    artifacts::{ArtifactStore, CompilerArtifacts, CopyFilter},
    config::Configuration,
    error::Result,
    lock::{CacheLock, JobSlots, LockGuard},
    manifest::{Manifest, ManifestStore},
    stats::{MissReason, PersistentStats, Stats},
    utils, Environment,
};
use std::{
    path::{Path, PathBuf},
    sync::Mutex,
};

/// Fraction of the configured maximum a cleanup shrinks to; the slack keeps
/// back-to-back compiles from re-triggering eviction immediately.
const CLEANUP_TARGET_RATIO: f64 = 0.9;

/// Share of the cleanup target reserved for manifests; the rest goes to
/// artifacts.
const MANIFEST_SHARE: f64 = 0.1;

#[derive(Debug)]
pub struct Cache {
    pub dir: PathBuf,
    pub manifests: ManifestStore,
    pub artifacts: ArtifactStore,
    pub configuration: Mutex<Configuration>,
    pub persistent_stats: Mutex<PersistentStats>,
    /// In-process counters, merged into `stats.txt` on shutdown.
    pub stats: Stats,
    /// Per-manifest-hash single-flight across this process' worker threads.
    pub job_slots: JobSlots,
}

impl Cache {
    pub fn new(cache_dir: &Path) -> Result<Self> {
        utils::ensure_dir_exists(cache_dir)?;
        let locks_dir = cache_dir.join("locks");
        Ok(Self {
            dir: cache_dir.to_path_buf(),
            manifests: ManifestStore::new(cache_dir.join("manifests"), locks_dir.clone())?,
            artifacts: ArtifactStore::new(cache_dir.join("objects"), locks_dir.clone())?,
            configuration: Mutex::new(Configuration::new(cache_dir.join("config.txt"), &locks_dir)),
            persistent_stats: Mutex::new(PersistentStats::new(
                cache_dir.join("stats.txt"),
                &locks_dir,
            )),
            stats: Stats::new(),
            job_slots: JobSlots::new(),
        })
    }

    /// The shard lock guarding the manifest of the given hash.
    pub fn manifest_lock_for(&self, manifest_hash: &str) -> CacheLock {
        self.manifests.section(manifest_hash).lock.clone()
    }

    /// The shard lock guarding the artifact of the given key.
    pub fn lock_for(&self, key: &str) -> CacheLock {
        self.artifacts.section(key).lock.clone()
    }

    pub fn get_manifest(&self, manifest_hash: &str) -> Option<(Manifest, u64)> {
        self.manifests.section(manifest_hash).get_manifest(manifest_hash)
    }

    pub fn set_manifest(&self, manifest_hash: &str, manifest: &Manifest) -> Result<u64> {
        self.manifests.section(manifest_hash).set_manifest(manifest_hash, manifest)
    }

    pub fn has_entry(&self, key: &str) -> bool {
        self.artifacts.section(key).has_entry(key)
    }

    pub fn get_entry(&self, key: &str) -> Result<CompilerArtifacts> {
        self.artifacts.section(key).get_entry(key)
    }

    pub fn max_cache_size(&self) -> u64 {
        self.configuration.lock().unwrap_or_else(|err| err.into_inner()).max_cache_size()
    }

    /// Acquires every existing shard lock, manifests before artifacts, each
    /// group in sorted shard order. This is the whole-cache lock used by
    /// cleanup.
    pub fn lock_all(&self) -> Result<Vec<LockGuard>> {
        let mut guards = Vec::new();
        for section in self.manifests.sections() {
            guards.push(section.lock.acquire()?);
        }
        for section in self.artifacts.sections() {
            guards.push(section.lock.acquire()?);
        }
        Ok(guards)
    }

    /// Whether the tracked size exceeds the configured maximum.
    pub fn is_cleanup_required(&self) -> bool {
        let persistent = self.persistent_stats.lock().unwrap_or_else(|err| err.into_inner());
        let tracked = persistent.cache_size() + self.stats.cache_size();
        tracked.max(0) as u64 > self.max_cache_size()
    }

    /// Shrinks the cache below the configured maximum.
    pub fn clean(&self) -> Result<()> {
        self.clean_to(self.max_cache_size())
    }

    /// Removes everything.
    pub fn clear(&self) -> Result<()> {
        self.clean_to(0)
    }

    fn clean_to(&self, max_size: u64) -> Result<()> {
        {
            let persistent = self.persistent_stats.lock().unwrap_or_else(|err| err.into_inner());
            let tracked = (persistent.cache_size() + self.stats.cache_size()).max(0) as u64;
            if tracked < max_size {
                return Ok(());
            }
        }

        let target = max_size as f64 * CLEANUP_TARGET_RATIO;
        let max_manifests_size = target * MANIFEST_SHARE;
        let max_objects_size = target - max_manifests_size;

        let kept_manifests_size = self.manifests.clean(max_manifests_size as u64);
        let (kept_entries, kept_objects_size) = self.artifacts.clean(max_objects_size as u64);

        self.persistent_stats
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .set_cache_size_and_entries(
                (kept_objects_size + kept_manifests_size) as i64,
                kept_entries as i64,
            )?;
        self.stats.clear_cache_size();
        self.stats.clear_cache_entries();
        Ok(())
    }

    /// Merges the in-process counters into `stats.txt` and drops a secondary
    /// copy into the build directory so CI can attribute cache behavior to a
    /// build.
    pub fn shutdown(&self, env: &Environment, program_name: &str) {
        if let Err(err) = self
            .persistent_stats
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .save_combined(&self.stats)
        {
            warn!("failed to persist statistics: {err}");
        }

        let build_stats_path = env.build_dir.join(format!("{program_name}.json"));
        let mut build_stats =
            PersistentStats::new(build_stats_path, &self.dir.join("locks"));
        if let Err(err) = build_stats.save_combined(&self.stats) {
            trace!("failed to write build statistics: {err}");
        }
    }
}

/// Commits the compiler's outputs under the object key, if the compiler
/// succeeded and actually produced the object file.
///
/// The captured streams must already be canonicalized. `post_commit` runs
/// after the artifact commit (manifest updates go there) and contributes its
/// size delta; it runs even when the artifact already existed, since the
/// manifest may still be missing its entry. Artifact and manifest writes are
/// independently atomic: if either fails the other remains valid.
pub fn ensure_artifacts_exist<F>(
    cache: &Cache,
    key: &str,
    reason: MissReason,
    obj_file: &Path,
    exit_code: i32,
    stdout: String,
    stderr: String,
    copy_filter: Option<CopyFilter>,
    post_commit: Option<F>,
) -> Result<()>
where
    F: FnOnce() -> Result<i64>,
{
    if exit_code != 0 || !obj_file.exists() {
        trace!("not caching for key {key}: compiler failed or object missing");
        return Ok(());
    }

    let artifacts = CompilerArtifacts {
        payload_path: obj_file.to_path_buf(),
        stdout,
        stderr,
        copy_filter,
    };

    let mut size: i64 = 0;
    {
        let _lock = cache.lock_for(key).acquire()?;
        if !cache.has_entry(key) {
            cache.stats.register_cache_entry(reason);
            let (entry_size, _) = cache.artifacts.section(key).set_entry(key, &artifacts)?;
            size = entry_size as i64;
        }
    }

    if let Some(action) = post_commit {
        size += action()?;
    }
    cache.stats.register_cache_entry_size(size);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::fs;

    #[test]
    fn commit_is_idempotent_per_key() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::new(&dir.path().join("cache")).unwrap();
        let obj = dir.path().join("a.obj");
        fs::write(&obj, b"OBJ").unwrap();

        let key = "2badc0de00000000000000000000beef";
        for _ in 0..3 {
            ensure_artifacts_exist(
                &cache,
                key,
                MissReason::SourceChanged,
                &obj,
                0,
                String::new(),
                String::new(),
                None,
                None::<fn() -> crate::Result<i64>>,
            )
            .unwrap();
        }

        assert!(cache.has_entry(key));
        assert_eq!(cache.stats.snapshot()["CacheEntries"], 1);
    }

    #[test]
    fn failed_compiles_are_not_committed() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::new(&dir.path().join("cache")).unwrap();
        let obj = dir.path().join("a.obj");
        fs::write(&obj, b"OBJ").unwrap();

        let key = "3badc0de00000000000000000000beef";
        ensure_artifacts_exist(
            &cache,
            key,
            MissReason::SourceChanged,
            &obj,
            2,
            String::new(),
            String::new(),
            None,
            None::<fn() -> crate::Result<i64>>,
        )
        .unwrap();
        assert!(!cache.has_entry(key));

        // object file missing behaves the same
        ensure_artifacts_exist(
            &cache,
            key,
            MissReason::SourceChanged,
            &dir.path().join("missing.obj"),
            0,
            String::new(),
            String::new(),
            None,
            None::<fn() -> crate::Result<i64>>,
        )
        .unwrap();
        assert!(!cache.has_entry(key));
    }

    #[test]
    fn clear_removes_all_entries() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::new(&dir.path().join("cache")).unwrap();
        let obj = dir.path().join("a.obj");
        fs::write(&obj, b"OBJ").unwrap();

        let key = "4badc0de00000000000000000000beef";
        ensure_artifacts_exist(
            &cache,
            key,
            MissReason::SourceChanged,
            &obj,
            0,
            String::new(),
            String::new(),
            None,
            None::<fn() -> crate::Result<i64>>,
        )
        .unwrap();
        assert!(cache.has_entry(key));

        {
            let _guards = cache.lock_all().unwrap();
            cache.clear().unwrap();
        }
        assert!(!cache.has_entry(key));
        let persistent = cache.persistent_stats.lock().unwrap();
        assert_eq!(persistent.cache_size(), 0);
    }
}
