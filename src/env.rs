//! The process-wide [`Environment`], latched once at startup.
//!
//! Everything path canonicalization depends on lives here: the build and base
//! directories, the toolchain roots taken from well-known environment
//! variables, and the lazily latched Qt/LLVM/Conan roots. The engine threads a
//! shared reference through every component instead of reaching for global
//! state.

use crate::{canon::CanonPath, utils};
use once_cell::sync::OnceCell;
use regex::Regex;
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Mutex,
    time::Duration,
};

/// Default idle timeout of the hash server, overridable via
/// `CLCACHE_SERVER_TIMEOUT_MINUTES` (0 disables the server entirely).
pub const DEFAULT_SERVER_TIMEOUT: Duration = Duration::from_secs(180);

/// A toolchain root directory taken from an environment variable.
///
/// Both the literal and the symlink-resolved form are indexed so that paths
/// reported by the compiler match no matter which spelling it used.
#[derive(Clone, Debug)]
pub(crate) struct ToolchainRoot {
    /// Placeholder name, e.g. `VCINSTALLDIR` or `NETFXSDKDir/..`.
    pub var: String,
    /// Lowercased absolute root.
    pub long: String,
    /// Lowercased resolved root, when it differs from `long`.
    pub resolved: Option<String>,
}

/// Mutable Conan lookup state, latched on first use.
#[derive(Debug, Default)]
pub(crate) struct ConanState {
    pub initialized: bool,
    pub found_venv: bool,
    pub home: Option<PathBuf>,
    /// Lowercased home used for prefix matching.
    pub home_prefix: Option<String>,
    pub short_re: Option<Regex>,
}

#[derive(Debug)]
pub struct Environment {
    /// Cache root (`CLCACHE_DIR`, default `~/clcache`).
    pub cache_dir: PathBuf,
    /// Where the compiler runs (`CLCACHE_BUILDDIR`, default cwd).
    pub build_dir: PathBuf,
    pub(crate) build_dir_str: String,
    pub(crate) build_dir_resolved: Option<String>,
    /// Source base (`CLCACHE_BASEDIR` or `CMAKE_HOME_DIRECTORY` from
    /// `CMakeCache.txt`); canonicalization of source paths is disabled when
    /// this is unset.
    pub base_dir: Option<PathBuf>,
    pub(crate) base_dir_str: Option<String>,
    pub(crate) base_dir_resolved: Option<String>,
    pub(crate) venv_dir_str: Option<String>,
    pub(crate) venv_dir_resolved: Option<String>,
    pub(crate) toolchain_roots: Vec<ToolchainRoot>,
    pub(crate) conan: Mutex<ConanState>,
    pub(crate) conan_home_env: Option<PathBuf>,
    pub(crate) conan_short_env: Option<PathBuf>,
    pub(crate) qt_dir: OnceCell<String>,
    /// LLVM root derived from a `…\bin\clang-cl.exe` compiler path; literal
    /// and resolved spelling.
    pub(crate) llvm_dir: OnceCell<(String, Option<String>)>,
    pub(crate) canon_cache: Mutex<HashMap<PathBuf, CanonPath>>,
    pub(crate) expand_cache: Mutex<HashMap<String, PathBuf>>,
    pub(crate) hash_cache: Mutex<HashMap<(PathBuf, Option<String>), String>>,
    pub(crate) conan_link_cache: Mutex<HashMap<PathBuf, Option<PathBuf>>>,
    /// `None` disables the hash server and hashes in-process.
    pub server_timeout: Option<Duration>,
    /// `CLCACHE_DISABLE`: bypass the cache entirely.
    pub disabled: bool,
    /// `CLCACHE_SINGLEFILE`: force sequential compilation.
    pub single_file: bool,
}

impl Environment {
    /// Minimal environment over explicit directories. Toolchain roots and the
    /// hash server are left unconfigured; [`Environment::from_env`] is the
    /// production entry point.
    pub fn new(cache_dir: PathBuf, build_dir: PathBuf, base_dir: Option<PathBuf>) -> Self {
        let build_dir = utils::absolute_path(&build_dir);
        let build_dir_str = lower_str(&build_dir);
        let build_dir_resolved = resolved_lower(&build_dir, &build_dir_str);
        let base_dir = base_dir.map(|dir| utils::absolute_path(&dir));
        let base_dir_str = base_dir.as_deref().map(lower_str);
        let base_dir_resolved = match (&base_dir, &base_dir_str) {
            (Some(dir), Some(s)) => resolved_lower(dir, s),
            _ => None,
        };
        Self {
            cache_dir,
            build_dir,
            build_dir_str,
            build_dir_resolved,
            base_dir,
            base_dir_str,
            base_dir_resolved,
            venv_dir_str: None,
            venv_dir_resolved: None,
            toolchain_roots: Vec::new(),
            conan: Mutex::new(ConanState::default()),
            conan_home_env: None,
            conan_short_env: None,
            qt_dir: OnceCell::new(),
            llvm_dir: OnceCell::new(),
            canon_cache: Mutex::new(HashMap::new()),
            expand_cache: Mutex::new(HashMap::new()),
            hash_cache: Mutex::new(HashMap::new()),
            conan_link_cache: Mutex::new(HashMap::new()),
            server_timeout: None,
            disabled: false,
            single_file: false,
        }
    }

    /// Builds the environment from the process environment.
    pub fn from_env() -> Self {
        let build_dir = std::env::var_os("CLCACHE_BUILDDIR")
            .map(PathBuf::from)
            .filter(|dir| dir.is_dir())
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_default());
        let cache_dir = std::env::var_os("CLCACHE_DIR").map(PathBuf::from).unwrap_or_else(|| {
            home::home_dir().unwrap_or_else(|| PathBuf::from(".")).join("clcache")
        });
        let base_dir = base_dir_from(&build_dir);

        let mut env = Self::new(cache_dir, build_dir, base_dir);

        if let Some(venv) = venv_dir_from(&env.build_dir, env.base_dir.as_deref()) {
            let venv_str = lower_str(&venv);
            env.venv_dir_resolved = resolved_lower(&venv, &venv_str);
            env.venv_dir_str = Some(venv_str);
        }

        env.toolchain_roots = toolchain_roots_from_env();
        env.conan_home_env = std::env::var_os("CONAN_USER_HOME").map(PathBuf::from);
        env.conan_short_env = std::env::var_os("CONAN_USER_HOME_SHORT").map(PathBuf::from);
        env.server_timeout = server_timeout_from_env();
        env.disabled = std::env::var_os("CLCACHE_DISABLE").is_some();
        env.single_file = std::env::var_os("CLCACHE_SINGLEFILE").is_some();
        env
    }

    /// Latches the LLVM installation root from the compiler path, once.
    pub fn set_llvm_dir(&self, compiler_path: &Path) {
        self.llvm_dir.get_or_init(|| {
            let re = Regex::new(r"(?i)^(.*)[\\/]bin[\\/]clang-cl(\.exe)?$").unwrap();
            let literal = lower_str(compiler_path);
            let long = re.captures(&literal).map(|caps| caps[1].to_string());
            let resolved_path = utils::resolve(compiler_path);
            let resolved = re.captures(&lower_str(&resolved_path)).map(|caps| caps[1].to_string());
            match (long, resolved) {
                (Some(long), resolved) => {
                    let resolved = resolved.filter(|r| *r != long);
                    (long, resolved)
                }
                (None, Some(resolved)) => (resolved, None),
                (None, None) => (String::new(), None),
            }
        });
    }
}

pub(crate) fn lower_str(path: &Path) -> String {
    path.to_string_lossy().to_lowercase()
}

/// Lowercased resolved form of a directory, when it differs from the literal.
fn resolved_lower(dir: &Path, literal: &str) -> Option<String> {
    let resolved = utils::resolve(dir);
    let resolved = lower_str(&resolved);
    (resolved != literal).then_some(resolved)
}

/// `CLCACHE_BASEDIR`, else `CMAKE_HOME_DIRECTORY` from the build tree's
/// `CMakeCache.txt`.
fn base_dir_from(build_dir: &Path) -> Option<PathBuf> {
    if let Some(value) = std::env::var_os("CLCACHE_BASEDIR") {
        let dir = PathBuf::from(value);
        if dir.exists() {
            return Some(dir);
        }
    }

    let cmake_cache = build_dir.join("CMakeCache.txt");
    let content = std::fs::read_to_string(cmake_cache).ok()?;
    for line in content.lines() {
        let line = line.trim();
        if line.starts_with('#') || line.is_empty() {
            continue;
        }
        let (name_and_type, value) = line.split_once('=')?;
        let name = name_and_type.split(':').next().unwrap_or(name_and_type);
        if name == "CMAKE_HOME_DIRECTORY" {
            let path = PathBuf::from(value);
            return path.exists().then_some(path);
        }
    }
    None
}

/// The Python virtualenv root: `GM_VENV_HOME`, else `gm-venv` under the common
/// ancestor of build and base directory.
fn venv_dir_from(build_dir: &Path, base_dir: Option<&Path>) -> Option<PathBuf> {
    if let Some(value) = std::env::var_os("GM_VENV_HOME") {
        let dir = utils::normalize_path(Path::new(&value));
        if dir.is_dir() {
            return Some(dir);
        }
    }

    let base_dir = base_dir?;
    let common = common_ancestor(base_dir, build_dir)?;
    let venv = utils::normalize_path(&common.join("gm-venv"));
    venv.is_dir().then_some(venv)
}

fn common_ancestor(a: &Path, b: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for (ca, cb) in a.components().zip(b.components()) {
        if ca != cb {
            break;
        }
        out.push(ca.as_os_str());
    }
    (out.components().count() > 0).then_some(out)
}

/// The toolchain roots recognized in compiler output, most specific first.
/// Order matters: the first matching root wins.
const TOOLCHAIN_ENV_VARS: &[&str] = &[
    "VCINSTALLDIR",
    "WindowsSdkDir",
    "ExtensionSdkDir",
    "VSINSTALLDIR",
    "NETFXSDKDir/..",
    "UniversalCRTSdkDir",
    "CommonProgramFiles",
    "CommonProgramFiles(x86)",
    "ProgramFiles",
    "ProgramFiles(x86)",
    "ProgramData",
    "USERPROFILE",
    "SystemRoot",
    "SystemDrive",
];

fn toolchain_roots_from_env() -> Vec<ToolchainRoot> {
    let mut roots = Vec::new();
    for name in TOOLCHAIN_ENV_VARS {
        let (var, suffix) = match name.split_once('/') {
            Some((var, suffix)) => (var, suffix),
            None => (*name, "."),
        };
        let Some(value) = std::env::var_os(var) else { continue };
        let joined = utils::normalize_path(&Path::new(&value).join(suffix));
        let long = lower_str(&joined);
        let resolved = {
            let r = lower_str(&utils::resolve(&joined));
            (r != long).then_some(r)
        };
        roots.push(ToolchainRoot { var: name.to_string(), long, resolved });
    }
    roots
}

fn server_timeout_from_env() -> Option<Duration> {
    match std::env::var("CLCACHE_SERVER_TIMEOUT_MINUTES") {
        Ok(value) => match value.trim().parse::<u64>() {
            Ok(minutes) if minutes > 0 => Some(Duration::from_secs(minutes * 60)),
            _ => None,
        },
        Err(_) => Some(DEFAULT_SERVER_TIMEOUT),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn common_ancestor_of_disjoint_paths_is_none_or_root() {
        let shared = common_ancestor(Path::new("/opt/src/app"), Path::new("/opt/build/app"));
        assert_eq!(shared, Some(PathBuf::from("/opt")));
    }

    #[test]
    fn new_latches_lowercased_build_dir() {
        let dir = tempfile::tempdir().unwrap();
        let env =
            Environment::new(dir.path().join("cache"), dir.path().to_path_buf(), None);
        assert_eq!(env.build_dir_str, env.build_dir.to_string_lossy().to_lowercase());
        assert!(env.base_dir.is_none());
    }
}
