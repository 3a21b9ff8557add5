//! Manifests: one file per manifest hash, listing the header sets observed
//! for that (source, compiler, options) tuple.
//!
//! The head entry is the most recently used one. Schema changes bump the
//! format version constants, which are folded into the manifest hash itself,
//! so files written by an older format simply stop being referenced and age
//! out through the regular cleanup.

use crate::{
    artifacts::ArtifactStore,
    canon::CanonPath,
    error::Result,
    hash,
    lock::{CacheLock, STORE_LOCK_TIMEOUT},
    utils, Environment,
};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};

pub const CL_FORMAT_VERSION: u32 = 6;
pub const MOC_FORMAT_VERSION: u32 = 8;

/// A manifest holds at most this many header sets; the LRU tail is dropped.
pub const MAX_MANIFEST_ENTRIES: usize = 100;

const SET_MANIFEST_ATTEMPTS: usize = 10;
const SET_MANIFEST_RETRY_DELAY: Duration = Duration::from_millis(500);

/// One observed header set of a manifest.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestEntry {
    /// Canonicalized include paths this source pulled in.
    pub include_files: Vec<CanonPath>,
    /// Digest over the ordered content hashes of `include_files`.
    pub includes_content_hash: String,
    /// H(manifest hash ‖ includes content hash); the artifact store key.
    pub object_hash: String,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    entries: Vec<ManifestEntry>,
}

impl Manifest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[ManifestEntry] {
        &self.entries
    }

    /// Prepends the entry, replacing any previous entry with the same
    /// includes content hash.
    pub fn add_entry(&mut self, entry: ManifestEntry) {
        self.entries.retain(|e| e.includes_content_hash != entry.includes_content_hash);
        self.entries.insert(0, entry);
        self.entries.truncate(MAX_MANIFEST_ENTRIES);
    }

    /// Moves the entry with the given object hash to the head.
    pub fn touch_entry(&mut self, object_hash: &str) {
        if self.entries.is_empty() {
            return;
        }
        let index =
            self.entries.iter().position(|e| e.object_hash == object_hash).unwrap_or(0);
        let entry = self.entries.remove(index);
        self.entries.insert(0, entry);
    }

    /// Collapses duplicate entries, keeping the earliest occurrence.
    fn dedup(&mut self) {
        let mut seen = HashSet::new();
        self.entries.retain(|e| seen.insert(e.includes_content_hash.clone()));
    }
}

/// Builds a manifest entry for the observed include set: hashes the files,
/// canonicalizes their paths and derives the object hash.
pub fn create_manifest_entry(
    env: &Environment,
    manifest_hash: &str,
    include_paths: &[PathBuf],
) -> Result<ManifestEntry> {
    let mut sorted: Vec<PathBuf> = include_paths.to_vec();
    sorted.sort();
    sorted.dedup();

    let include_hashes = hash::file_hashes(env, &sorted)?;
    let include_files = sorted.iter().map(|path| env.canonicalize_path(path)).collect();
    let includes_content_hash = hash::includes_content_hash_for_hashes(&include_hashes);
    let object_hash = ArtifactStore::compute_key(manifest_hash, &includes_content_hash);

    Ok(ManifestEntry { include_files, includes_content_hash, object_hash })
}

/// One of the 256 shard directories below `manifests/`.
#[derive(Debug)]
pub struct ManifestSection {
    dir: PathBuf,
    pub lock: CacheLock,
}

impl ManifestSection {
    fn new(dir: PathBuf, locks_dir: &Path) -> Self {
        let shard = dir.file_name().unwrap_or_default().to_string_lossy();
        let lock = CacheLock::new(locks_dir, &format!("manifests-{shard}"), STORE_LOCK_TIMEOUT);
        Self { dir, lock }
    }

    pub fn manifest_path(&self, manifest_hash: &str) -> PathBuf {
        self.dir.join(format!("{manifest_hash}.json"))
    }

    pub fn manifest_files(&self) -> Vec<PathBuf> {
        utils::files_beneath(&self.dir)
    }

    /// Reads the manifest and refreshes its mtime so it keeps its LRU
    /// position. Returns the manifest and its file size; a broken file is
    /// treated as absent and will be overwritten by the next commit.
    pub fn get_manifest(&self, manifest_hash: &str) -> Option<(Manifest, u64)> {
        let path = self.manifest_path(manifest_hash);
        if !path.exists() {
            return None;
        }
        let _ = utils::touch(&path);
        let size = fs::metadata(&path).ok()?.len();
        match utils::read_json_file::<Manifest>(&path) {
            Ok(mut manifest) => {
                manifest.dedup();
                Some((manifest, size))
            }
            Err(err) => {
                error!("manifest file \"{}\" was broken: {err}", path.display());
                None
            }
        }
    }

    /// Writes the manifest atomically, retrying transient I/O failures, and
    /// returns the resulting file size.
    pub fn set_manifest(&self, manifest_hash: &str, manifest: &Manifest) -> Result<u64> {
        let path = self.manifest_path(manifest_hash);
        trace!("writing manifest {manifest_hash} to \"{}\"", path.display());
        utils::ensure_dir_exists(&self.dir)?;

        let mut attempt = 0;
        loop {
            match utils::write_json_file(manifest, &path) {
                Ok(()) => {
                    return fs::metadata(&path)
                        .map(|meta| meta.len())
                        .map_err(|err| crate::CacheError::io(err, &path));
                }
                Err(err) if attempt + 1 < SET_MANIFEST_ATTEMPTS => {
                    warn!("failed to write manifest file \"{}\": {err} (retrying)", path.display());
                    attempt += 1;
                    std::thread::sleep(SET_MANIFEST_RETRY_DELAY);
                }
                Err(err) => {
                    error!("failed to write manifest file \"{}\": {err}", path.display());
                    return Err(err);
                }
            }
        }
    }
}

/// The on-disk manifest store, sharded by the first two hex characters of the
/// manifest hash.
#[derive(Debug)]
pub struct ManifestStore {
    root: PathBuf,
    locks_dir: PathBuf,
}

impl ManifestStore {
    pub fn new(root: PathBuf, locks_dir: PathBuf) -> Result<Self> {
        utils::ensure_dir_exists(&root)?;
        Ok(Self { root, locks_dir })
    }

    pub fn section(&self, manifest_hash: &str) -> ManifestSection {
        ManifestSection::new(self.root.join(&manifest_hash[..2]), &self.locks_dir)
    }

    /// Sections that exist on disk.
    pub fn sections(&self) -> Vec<ManifestSection> {
        let mut dirs = utils::child_dirs(&self.root);
        dirs.sort();
        dirs.into_iter().map(|dir| ManifestSection::new(dir, &self.locks_dir)).collect()
    }

    /// Deletes manifests, oldest first by mtime, until the remaining files
    /// fit into `max_bytes`; returns the retained size.
    pub fn clean(&self, max_bytes: u64) -> u64 {
        let mut infos: Vec<(SystemTime, u64, PathBuf)> = Vec::new();
        for section in self.sections() {
            for path in section.manifest_files() {
                if let Ok(meta) = fs::metadata(&path) {
                    let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
                    infos.push((mtime, meta.len(), path));
                }
            }
        }
        infos.sort_by(|a, b| b.0.cmp(&a.0));

        let mut remaining = 0u64;
        for (_, size, path) in infos {
            if remaining + size <= max_bytes {
                remaining += size;
            } else {
                let _ = fs::remove_file(&path);
            }
        }
        remaining
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn entry(tag: &str) -> ManifestEntry {
        ManifestEntry {
            include_files: vec![CanonPath::from(format!("<BASE_DIR>/{tag}.h"))],
            includes_content_hash: format!("{tag}-includes"),
            object_hash: format!("{tag}-object"),
        }
    }

    #[test]
    fn add_entry_deduplicates_and_prepends() {
        let mut manifest = Manifest::new();
        manifest.add_entry(entry("a"));
        manifest.add_entry(entry("b"));
        manifest.add_entry(entry("a"));
        let hashes: Vec<_> =
            manifest.entries().iter().map(|e| e.includes_content_hash.as_str()).collect();
        assert_eq!(hashes, vec!["a-includes", "b-includes"]);
    }

    #[test]
    fn touch_entry_moves_match_to_head() {
        let mut manifest = Manifest::new();
        manifest.add_entry(entry("a"));
        manifest.add_entry(entry("b"));
        manifest.touch_entry("a-object");
        assert_eq!(manifest.entries()[0].object_hash, "a-object");
        assert_eq!(manifest.entries().len(), 2);
    }

    #[test]
    fn entries_are_capped() {
        let mut manifest = Manifest::new();
        for i in 0..(MAX_MANIFEST_ENTRIES + 10) {
            manifest.add_entry(entry(&format!("e{i}")));
        }
        assert_eq!(manifest.entries().len(), MAX_MANIFEST_ENTRIES);
        assert_eq!(
            manifest.entries()[0].includes_content_hash,
            format!("e{}-includes", MAX_MANIFEST_ENTRIES + 9)
        );
    }

    #[test]
    fn manifest_file_format_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let store =
            ManifestStore::new(dir.path().join("manifests"), dir.path().join("locks")).unwrap();

        let hash = "0123456789abcdef0123456789abcdef";
        let mut manifest = Manifest::new();
        manifest.add_entry(entry("a"));

        let section = store.section(hash);
        let size = section.set_manifest(hash, &manifest).unwrap();
        let (read, read_size) = section.get_manifest(hash).unwrap();
        assert_eq!(read, manifest);
        assert_eq!(read_size, size);

        // the wire format uses camelCase keys
        let raw = std::fs::read_to_string(section.manifest_path(hash)).unwrap();
        assert!(raw.contains("\"includeFiles\""), "{raw}");
        assert!(raw.contains("\"includesContentHash\""), "{raw}");
        assert!(raw.contains("\"objectHash\""), "{raw}");
    }

    #[test]
    fn broken_manifest_reads_as_absent() {
        let dir = tempfile::tempdir().unwrap();
        let store =
            ManifestStore::new(dir.path().join("manifests"), dir.path().join("locks")).unwrap();
        let hash = "ff23456789abcdef0123456789abcdef";
        let section = store.section(hash);
        utils::ensure_dir_exists(dir.path().join("manifests/ff")).unwrap();
        std::fs::write(section.manifest_path(hash), b"{ not json").unwrap();
        assert!(section.get_manifest(hash).is_none());
    }

    #[test]
    fn clean_keeps_newest_manifests() {
        let dir = tempfile::tempdir().unwrap();
        let store =
            ManifestStore::new(dir.path().join("manifests"), dir.path().join("locks")).unwrap();
        let mut manifest = Manifest::new();
        manifest.add_entry(entry("a"));

        let old_hash = "aa23456789abcdef0123456789abcdef";
        let new_hash = "bb23456789abcdef0123456789abcdef";
        store.section(old_hash).set_manifest(old_hash, &manifest).unwrap();
        store.section(new_hash).set_manifest(new_hash, &manifest).unwrap();

        let old_path = store.section(old_hash).manifest_path(old_hash);
        let past = filetime::FileTime::from_unix_time(1_000_000, 0);
        filetime::set_file_mtime(&old_path, past).unwrap();

        let size = fs::metadata(&old_path).unwrap().len();
        let kept = store.clean(size);
        assert_eq!(kept, size);
        assert!(!old_path.exists());
        assert!(store.section(new_hash).manifest_path(new_hash).exists());
    }
}
