//! Content hashing.
//!
//! All fingerprints are 128-bit MD5 hex digests. File hashing is chunked;
//! files below the build directory are first passed through the base-dir
//! substitution (see [`Environment::subst_base_dir`]) so machine-pinned paths
//! in generated code do not leak into the hash.

use crate::{
    error::{CacheError, Result},
    server, Environment,
};
use md5::{Digest, Md5};
use std::{
    fs,
    io::Read,
    path::{Path, PathBuf},
    time::UNIX_EPOCH,
};

/// Bumped whenever a change invalidates previously cached entries wholesale;
/// folded into the compiler hash.
pub const CACHE_VERSION: &str = "9";

/// 128 hash blocks per read.
const CHUNK_SIZE: usize = 128 * 64;

pub fn string_hash(data: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(data.as_bytes());
    hex::encode(hasher.finalize())
}

/// Hash identifying the compiler binary, derived from its modification time,
/// size and [`CACHE_VERSION`]. Reading the whole binary would cost more than
/// it protects against.
pub fn compiler_hash(compiler_path: &Path) -> Result<String> {
    let meta =
        fs::metadata(compiler_path).map_err(|err| CacheError::io(err, compiler_path))?;
    let mtime = meta
        .modified()
        .map_err(|err| CacheError::io(err, compiler_path))?
        .duration_since(UNIX_EPOCH)
        .map_err(CacheError::msg)?;
    let data = format!("{}.{:09}|{}|{}", mtime.as_secs(), mtime.subsec_nanos(), meta.len(), CACHE_VERSION);
    Ok(string_hash(&data))
}

/// Digest of the ordered per-file hashes of an include set.
pub fn includes_content_hash_for_hashes(hashes: &[String]) -> String {
    string_hash(&hashes.join(","))
}

/// Hashes the include set, preferring the hash server for files outside the
/// build directory.
pub fn includes_content_hash_for_files(
    env: &Environment,
    includes: &[PathBuf],
) -> Result<String> {
    let hashes = file_hashes(env, includes)?;
    Ok(includes_content_hash_for_hashes(&hashes))
}

impl Environment {
    /// Returns the hash of the given file, memoized for the process lifetime.
    ///
    /// `toolset_data` is additional data mixed into the digest; the manifest
    /// hash is the source file hash combined with the toolset description.
    pub fn file_hash(&self, path: &Path, toolset_data: Option<&str>) -> Result<String> {
        let key = (path.to_path_buf(), toolset_data.map(str::to_string));
        if let Some(hit) = self.hash_cache.lock().unwrap().get(&key) {
            return Ok(hit.clone());
        }

        let mut hasher = Md5::new();
        if self.is_in_build_dir(path) {
            // Generated files may embed references into the base directory;
            // hash the substituted content so the digest is location-free.
            let content = fs::read(path).map_err(|err| CacheError::io(err, path))?;
            let src_dir = path.parent().unwrap_or_else(|| Path::new(""));
            hasher.update(self.subst_base_dir(&content, src_dir));
        } else {
            let mut file = fs::File::open(path).map_err(|err| CacheError::io(err, path))?;
            let mut buf = vec![0u8; CHUNK_SIZE];
            loop {
                let n = file.read(&mut buf).map_err(|err| CacheError::io(err, path))?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
            }
        }
        if let Some(toolset_data) = toolset_data {
            hasher.update(toolset_data.as_bytes());
        }

        let digest = hex::encode(hasher.finalize());
        self.hash_cache.lock().unwrap().insert(key, digest.clone());
        Ok(digest)
    }
}

/// Hashes of the given files, in input order.
///
/// Files under the build directory are always hashed in-process so the
/// base-dir substitution applies; the rest is delegated to the hash server
/// when it is enabled. Any server failure degrades silently to in-process
/// hashing. A missing file surfaces as [`CacheError::IncludeNotFound`].
pub fn file_hashes(env: &Environment, paths: &[PathBuf]) -> Result<Vec<String>> {
    let mut hashes: Vec<Option<String>> = vec![None; paths.len()];
    let mut remote: Vec<usize> = Vec::new();

    for (idx, path) in paths.iter().enumerate() {
        if env.server_timeout.is_some() && !env.is_in_build_dir(path) {
            remote.push(idx);
        } else {
            hashes[idx] = Some(local_file_hash(env, path)?);
        }
    }

    if !remote.is_empty() {
        let remote_paths: Vec<PathBuf> = remote.iter().map(|idx| paths[*idx].clone()).collect();
        match server::file_hashes(env, &remote_paths) {
            Ok(served) if served.len() == remote_paths.len() => {
                for (idx, hash) in remote.iter().zip(served) {
                    hashes[*idx] = Some(hash);
                }
            }
            Ok(served) => {
                warn!(
                    "hash server returned {} hashes for {} paths, hashing in-process",
                    served.len(),
                    remote_paths.len()
                );
            }
            Err(err) => {
                warn!("failed to use hash server: {err}");
            }
        }
        // fall back for whatever the server did not deliver
        for idx in remote {
            if hashes[idx].is_none() {
                hashes[idx] = Some(local_file_hash(env, &paths[idx])?);
            }
        }
    }

    Ok(hashes.into_iter().map(|hash| hash.unwrap()).collect())
}

fn local_file_hash(env: &Environment, path: &Path) -> Result<String> {
    env.file_hash(path, None).map_err(|err| match err {
        CacheError::Io(io) if io.source().kind() == std::io::ErrorKind::NotFound => {
            CacheError::IncludeNotFound(io.path().to_path_buf())
        }
        other => other,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::fs;

    #[test]
    fn string_hash_is_md5() {
        assert_eq!(string_hash(""), "d41d8cd98f00b204e9800998ecf8427e");
    }

    #[test]
    fn file_hash_mixes_in_toolset_data() {
        let dir = tempfile::tempdir().unwrap();
        let env = Environment::new(dir.path().join("cache"), dir.path().join("build"), None);
        let file = dir.path().join("a.h");
        fs::write(&file, b"int a;").unwrap();

        let plain = env.file_hash(&file, None).unwrap();
        let with_toolset = env.file_hash(&file, Some("cl|/c|6")).unwrap();
        assert_ne!(plain, with_toolset);
        // memoized
        assert_eq!(env.file_hash(&file, None).unwrap(), plain);
    }

    #[test]
    fn build_dir_file_hash_is_location_independent() {
        let make_tree = |root: &Path| {
            let base = root.join("src");
            let build = base.join("out");
            fs::create_dir_all(&build).unwrap();
            fs::write(base.join("w.h"), "struct W;").unwrap();
            let gen = build.join("unity_0_cxx.cxx");
            fs::write(&gen, format!("#include \"{}\"\n", base.join("w.h").display())).unwrap();
            let env = Environment::new(root.join("cache"), build, Some(base));
            env.file_hash(&gen, None).unwrap()
        };

        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        assert_eq!(make_tree(a.path()), make_tree(b.path()));
    }

    #[test]
    fn missing_include_is_reported_as_such() {
        let dir = tempfile::tempdir().unwrap();
        let env = Environment::new(dir.path().join("cache"), dir.path().join("build"), None);
        let missing = dir.path().join("gone.h");
        let err = file_hashes(&env, &[missing.clone()]).unwrap_err();
        assert!(matches!(err, CacheError::IncludeNotFound(p) if p == missing));
    }
}
