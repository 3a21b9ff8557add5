//! Utility functions

use crate::error::{CacheError, Result};
use once_cell::sync::Lazy;
use serde::{de::DeserializeOwned, Serialize};
use std::{
    fs,
    io::Write,
    path::{Component, Path, PathBuf},
    sync::Mutex,
};

/// Serializes output of concurrent compile jobs.
static OUTPUT_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

/// Reads the json file and deserializes it into the provided type.
pub fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let file = fs::File::open(path).map_err(|err| CacheError::io(err, path))?;
    Ok(serde_json::from_reader(std::io::BufReader::new(file))?)
}

/// Writes serializes the provided value to JSON and writes it to the file,
/// staging through a `.tmp` sibling so a reader never observes a torn file.
pub fn write_json_file<T: Serialize>(value: &T, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let tmp = tmp_sibling(path);
    let file = fs::File::create(&tmp).map_err(|err| CacheError::io(err, &tmp))?;
    let mut writer = std::io::BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, value)?;
    writer.flush().map_err(|err| CacheError::io(err, &tmp))?;
    drop(writer);
    fs::rename(&tmp, path).map_err(|err| CacheError::io(err, path))?;
    Ok(())
}

/// Returns the `<name>.tmp` sibling used to stage an atomic replace.
pub fn tmp_sibling(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Creates the parent directory of the given file path.
pub fn create_parent_dir_all(path: impl AsRef<Path>) -> Result<()> {
    if let Some(parent) = path.as_ref().parent() {
        fs::create_dir_all(parent).map_err(|err| CacheError::io(err, parent))?;
    }
    Ok(())
}

pub fn ensure_dir_exists(path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    fs::create_dir_all(path).map_err(|err| CacheError::io(err, path))
}

/// Removes the directory if it exists and creates a fresh one.
pub fn remove_and_recreate_dir(path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let _ = fs::remove_dir_all(path);
    ensure_dir_exists(path)
}

/// Refreshes the modification time of the file, which is the LRU signal for
/// both manifests and artifacts.
pub fn touch(path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let now = filetime::FileTime::now();
    filetime::set_file_times(path, now, now).map_err(|err| CacheError::io(err, path))
}

/// Unlinks a file, retrying for a bounded time; antivirus scanners and
/// indexers keep freshly written build outputs open on Windows.
pub fn safe_unlink(path: &Path) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }
    for _ in 0..60 {
        match fs::remove_file(path) {
            Ok(()) => return Ok(()),
            Err(_) => {
                warn!("failed to delete file \"{}\", retrying", path.display());
                std::thread::sleep(std::time::Duration::from_secs(1));
            }
        }
    }
    fs::remove_file(path).map_err(|err| CacheError::io(err, path))
}

/// All files beneath `dir`, recursively.
pub fn files_beneath(dir: impl AsRef<Path>) -> Vec<PathBuf> {
    walkdir::WalkDir::new(dir.as_ref())
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .collect()
}

/// Immediate child directories of `dir`.
pub fn child_dirs(dir: impl AsRef<Path>) -> Vec<PathBuf> {
    let Ok(read) = fs::read_dir(dir.as_ref()) else { return Vec::new() };
    read.filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .map(|entry| entry.path())
        .collect()
}

/// Lexically normalizes a path, resolving `.` and `..` components without
/// touching the filesystem.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut components = path.components().peekable();
    let mut ret = if let Some(c @ Component::Prefix(..)) = components.peek().copied() {
        components.next();
        PathBuf::from(c.as_os_str())
    } else {
        PathBuf::new()
    };
    for component in components {
        match component {
            Component::Prefix(..) => unreachable!(),
            Component::RootDir => ret.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                ret.pop();
            }
            Component::Normal(c) => ret.push(c),
        }
    }
    ret
}

/// Makes a path absolute against the current working directory and normalizes
/// it. Unlike `fs::canonicalize` this never touches the filesystem.
pub fn absolute_path(path: &Path) -> PathBuf {
    if path.is_absolute() {
        normalize_path(path)
    } else {
        let cwd = std::env::current_dir().unwrap_or_default();
        normalize_path(&cwd.join(path))
    }
}

/// Resolves symlinks, preferring non-UNC representations on Windows. Falls
/// back to the input when the path cannot be resolved.
pub fn resolve(path: &Path) -> PathBuf {
    dunce::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Writes captured compiler output to the console, both streams under a
/// process-wide lock so concurrent jobs do not interleave.
pub fn print_stdout_and_stderr(stdout: &str, stderr: &str) {
    let _guard = OUTPUT_LOCK.lock().unwrap_or_else(|err| err.into_inner());
    let mut out = std::io::stdout().lock();
    let _ = out.write_all(stdout.as_bytes());
    let _ = out.flush();
    let mut err = std::io::stderr().lock();
    let _ = err.write_all(stderr.as_bytes());
    let _ = err.flush();
}

/// Searches `PATH` for an executable with the given name.
pub fn find_in_path(name: &str) -> Option<PathBuf> {
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths).map(|dir| dir.join(name)).find(|candidate| candidate.is_file())
}

/// Locates the real compiler binary: `CLCACHE_CL` takes precedence (searched
/// on `PATH` when it is a bare file name), then `cl.exe` from `PATH`.
pub fn find_compiler_binary() -> Option<PathBuf> {
    if let Ok(value) = std::env::var("CLCACHE_CL") {
        let path = PathBuf::from(&value);
        let path = if path.components().count() == 1 {
            find_in_path(&value).unwrap_or(path)
        } else {
            path
        };
        return path.exists().then_some(path);
    }
    find_in_path("cl.exe")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn normalizes_dot_segments() {
        assert_eq!(normalize_path(Path::new("/a/b/../c/./d")), PathBuf::from("/a/c/d"));
        assert_eq!(normalize_path(Path::new("a/./b")), PathBuf::from("a/b"));
    }

    #[test]
    fn tmp_sibling_appends_suffix() {
        assert_eq!(tmp_sibling(Path::new("/x/stats.txt")), PathBuf::from("/x/stats.txt.tmp"));
    }

    #[test]
    fn json_roundtrip_is_atomic_by_rename() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("value.json");
        write_json_file(&serde_json::json!({"a": 1}), &path).unwrap();
        let value: serde_json::Value = read_json_file(&path).unwrap();
        assert_eq!(value["a"], 1);
        assert!(!tmp_sibling(&path).exists());
    }
}
