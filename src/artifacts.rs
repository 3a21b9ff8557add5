//! The content-addressed artifact store below `objects/`.
//!
//! Every committed compilation owns one directory named by its object hash,
//! holding the LZ4-frame-compressed object file plus the captured (already
//! canonicalized) stdout and stderr. Commits assemble a `<key>.new` staging
//! directory and rename it into place, so readers observe either the previous
//! artifact or the complete new one.

use crate::{
    error::{CacheError, Result},
    hash,
    lock::{CacheLock, STORE_LOCK_TIMEOUT},
    utils,
};
use lz4_flex::frame::{FrameDecoder, FrameEncoder};
use std::{
    fs,
    io::{self, BufReader, BufWriter, Read, Write},
    path::{Path, PathBuf},
    time::SystemTime,
};

pub const PAYLOAD_FILE: &str = "object";
pub const STDOUT_FILE: &str = "output.txt";
pub const STDERR_FILE: &str = "stderr.txt";

/// Transforms payload bytes while they are copied into or out of the cache;
/// used by the moc front-end to rewrite embedded include paths.
pub type CopyFilter = Box<dyn Fn(&[u8]) -> Vec<u8> + Send + Sync>;

/// The artifact set produced by one compiler invocation.
pub struct CompilerArtifacts {
    /// Uncompressed payload location. Inside the cache this is the base name
    /// next to which the `.lz4` sibling lives.
    pub payload_path: PathBuf,
    pub stdout: String,
    pub stderr: String,
    pub copy_filter: Option<CopyFilter>,
}

impl std::fmt::Debug for CompilerArtifacts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompilerArtifacts")
            .field("payload_path", &self.payload_path)
            .field("stdout", &self.stdout.len())
            .field("stderr", &self.stderr.len())
            .finish()
    }
}

/// Compresses a file into the cache as `<dst>.lz4`; returns the compressed
/// size.
pub fn copy_to_cache(src: &Path, dst: &Path, filter: Option<&CopyFilter>) -> Result<u64> {
    utils::create_parent_dir_all(dst)?;
    let compressed = compressed_sibling(dst);

    let file_in = fs::File::open(src).map_err(|err| CacheError::io(err, src))?;
    let file_out = fs::File::create(&compressed).map_err(|err| CacheError::io(err, &compressed))?;
    let mut encoder = FrameEncoder::new(BufWriter::new(file_out));
    match filter {
        Some(filter) => {
            let mut content = Vec::new();
            BufReader::new(file_in)
                .read_to_end(&mut content)
                .map_err(|err| CacheError::io(err, src))?;
            encoder
                .write_all(&filter(&content))
                .map_err(|err| CacheError::io(err, &compressed))?;
        }
        None => {
            io::copy(&mut BufReader::new(file_in), &mut encoder)
                .map_err(|err| CacheError::io(err, &compressed))?;
        }
    }
    let mut writer = encoder.finish().map_err(CacheError::msg)?;
    writer.flush().map_err(|err| CacheError::io(err, &compressed))?;
    drop(writer);

    fs::metadata(&compressed)
        .map(|meta| meta.len())
        .map_err(|err| CacheError::io(err, &compressed))
}

/// Decompresses `<src>.lz4` out of the cache to `dst`, staging through a
/// `.tmp` sibling.
pub fn copy_from_cache(src: &Path, dst: &Path, filter: Option<&CopyFilter>) -> Result<()> {
    utils::create_parent_dir_all(dst)?;
    let tmp = utils::tmp_sibling(dst);
    let compressed = compressed_sibling(src);

    if compressed.exists() {
        let file_in =
            fs::File::open(&compressed).map_err(|err| CacheError::io(err, &compressed))?;
        let mut decoder = FrameDecoder::new(BufReader::new(file_in));
        match filter {
            Some(filter) => {
                let mut content = Vec::new();
                decoder.read_to_end(&mut content).map_err(|err| CacheError::io(err, &compressed))?;
                fs::write(&tmp, filter(&content)).map_err(|err| CacheError::io(err, &tmp))?;
            }
            None => {
                let mut file_out =
                    fs::File::create(&tmp).map_err(|err| CacheError::io(err, &tmp))?;
                io::copy(&mut decoder, &mut file_out).map_err(|err| CacheError::io(err, &tmp))?;
            }
        }
    } else {
        fs::copy(src, &tmp).map_err(|err| CacheError::io(err, src))?;
    }

    fs::rename(&tmp, dst).map_err(|err| CacheError::io(err, dst))?;
    Ok(())
}

fn compressed_sibling(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".lz4");
    path.with_file_name(name)
}

/// One of the 256 shard directories below `objects/`.
#[derive(Debug)]
pub struct ArtifactsSection {
    dir: PathBuf,
    pub lock: CacheLock,
}

impl ArtifactsSection {
    fn new(dir: PathBuf, locks_dir: &Path) -> Self {
        let shard = dir.file_name().unwrap_or_default().to_string_lossy();
        let lock = CacheLock::new(locks_dir, &format!("objects-{shard}"), STORE_LOCK_TIMEOUT);
        Self { dir, lock }
    }

    pub fn entry_dir(&self, key: &str) -> PathBuf {
        self.dir.join(key)
    }

    /// Keys of the committed entries in this section. Staging directories are
    /// not keys.
    pub fn entries(&self) -> Vec<String> {
        utils::child_dirs(&self.dir)
            .into_iter()
            .filter_map(|dir| dir.file_name().map(|name| name.to_string_lossy().into_owned()))
            .filter(|name| !name.ends_with(".new"))
            .collect()
    }

    /// Paths of the payload files present for the key.
    pub fn cached_objects(&self, key: &str) -> Vec<PathBuf> {
        let base = self.entry_dir(key).join(PAYLOAD_FILE);
        let mut paths = Vec::new();
        if base.exists() {
            paths.push(base.clone());
        }
        let compressed = compressed_sibling(&base);
        if compressed.exists() {
            paths.push(compressed);
        }
        paths
    }

    pub fn has_entry(&self, key: &str) -> bool {
        let dir = self.entry_dir(key);
        dir.is_dir() && dir.read_dir().map(|mut it| it.next().is_some()).unwrap_or(false)
    }

    /// Commits the artifact set under the key.
    ///
    /// Returns the entry size in bytes and the path of the compressed payload.
    pub fn set_entry(
        &self,
        key: &str,
        artifacts: &CompilerArtifacts,
    ) -> Result<(u64, Option<PathBuf>)> {
        let entry_dir = self.entry_dir(key);
        let staging = self.dir.join(format!("{key}.new"));

        let commit = || -> Result<(u64, Option<PathBuf>)> {
            utils::remove_and_recreate_dir(&staging)?;

            let mut size = copy_to_cache(
                &artifacts.payload_path,
                &staging.join(PAYLOAD_FILE),
                artifacts.copy_filter.as_ref(),
            )?;
            let compressed_path = compressed_sibling(&entry_dir.join(PAYLOAD_FILE));

            let stdout_path = staging.join(STDOUT_FILE);
            fs::write(&stdout_path, artifacts.stdout.as_bytes())
                .map_err(|err| CacheError::io(err, &stdout_path))?;
            size += artifacts.stdout.len() as u64;

            if !artifacts.stderr.is_empty() {
                let stderr_path = staging.join(STDERR_FILE);
                fs::write(&stderr_path, artifacts.stderr.as_bytes())
                    .map_err(|err| CacheError::io(err, &stderr_path))?;
                size += artifacts.stderr.len() as u64;
            }

            if entry_dir.exists() {
                let _ = fs::remove_dir_all(&entry_dir);
            }
            fs::rename(&staging, &entry_dir).map_err(|err| CacheError::io(err, &entry_dir))?;
            Ok((size, Some(compressed_path)))
        };

        let result = commit();
        if staging.exists() {
            let _ = fs::remove_dir_all(&staging);
        }
        result
    }

    /// Fetches the artifact set, refreshing the payload's mtime so the entry
    /// keeps its LRU position.
    pub fn get_entry(&self, key: &str) -> Result<CompilerArtifacts> {
        let entry_dir = self.entry_dir(key);
        if !self.has_entry(key) {
            return Err(CacheError::msg(format!("no artifact for key {key}")));
        }

        let payload = entry_dir.join(PAYLOAD_FILE);
        let compressed = compressed_sibling(&payload);
        let _ = utils::touch(if compressed.exists() { &compressed } else { &payload });

        Ok(CompilerArtifacts {
            payload_path: payload,
            stdout: fs::read_to_string(entry_dir.join(STDOUT_FILE)).unwrap_or_default(),
            stderr: fs::read_to_string(entry_dir.join(STDERR_FILE)).unwrap_or_default(),
            copy_filter: None,
        })
    }
}

/// The on-disk artifact store, sharded by the first two hex characters of the
/// object hash.
#[derive(Debug)]
pub struct ArtifactStore {
    root: PathBuf,
    locks_dir: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: PathBuf, locks_dir: PathBuf) -> Result<Self> {
        utils::ensure_dir_exists(&root)?;
        Ok(Self { root, locks_dir })
    }

    /// The artifact store key: manifest hash and includes content hash folded
    /// together, so identical include sets of different sources cannot
    /// collide.
    pub fn compute_key(manifest_hash: &str, includes_content_hash: &str) -> String {
        hash::string_hash(&format!("{manifest_hash}{includes_content_hash}"))
    }

    pub fn section(&self, key: &str) -> ArtifactsSection {
        ArtifactsSection::new(self.root.join(&key[..2]), &self.locks_dir)
    }

    pub fn sections(&self) -> Vec<ArtifactsSection> {
        let mut dirs = utils::child_dirs(&self.root);
        dirs.sort();
        dirs.into_iter().map(|dir| ArtifactsSection::new(dir, &self.locks_dir)).collect()
    }

    pub fn remove_entry(&self, key: &str) {
        let _ = fs::remove_dir_all(self.section(key).entry_dir(key));
    }

    /// Evicts artifacts, oldest first by mtime, until the total size is below
    /// `max_bytes`; returns the kept entry count and size.
    pub fn clean(&self, max_bytes: u64) -> (usize, u64) {
        let mut infos: Vec<(SystemTime, u64, String)> = Vec::new();
        for section in self.sections() {
            for key in section.entries() {
                let objects = section.cached_objects(&key);
                if objects.is_empty() {
                    continue;
                }
                let stats: Vec<_> =
                    objects.iter().filter_map(|path| fs::metadata(path).ok()).collect();
                if stats.is_empty() {
                    continue;
                }
                let mtime = stats
                    .iter()
                    .map(|meta| meta.modified().unwrap_or(SystemTime::UNIX_EPOCH))
                    .min()
                    .unwrap();
                let size = stats.iter().map(|meta| meta.len()).sum();
                infos.push((mtime, size, key));
            }
        }
        infos.sort_by(|a, b| a.0.cmp(&b.0));

        let mut current_size: u64 = infos.iter().map(|(_, size, _)| size).sum();
        let mut removed = 0usize;
        for (_, size, key) in &infos {
            if current_size < max_bytes {
                break;
            }
            self.remove_entry(key);
            removed += 1;
            current_size -= size;
        }
        (infos.len() - removed, current_size)
    }
}
