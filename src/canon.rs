//! Path canonicalization.
//!
//! Cache keys must be portable across developer machines, so every absolute
//! path that ends up in a hash or in a stored artifact is rewritten into a
//! *placeholder form*: well-known roots (build dir, source base, Conan home,
//! Qt/LLVM installs, toolchain env vars) are substituted by fixed strings such
//! as `<BASE_DIR>`. Expansion reverses the substitution on the local machine.
//!
//! Canonicalization is total: when no placeholder applies the lower-cased
//! original path is returned with a warning. Expansion of an unknown string
//! returns the string as a path unchanged.

use crate::{
    env::{lower_str, Environment},
    error::{CacheError, Result},
    utils,
};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    path::{Path, PathBuf},
};

pub const BASEDIR_REPLACEMENT: &str = "<BASE_DIR>";
pub const BUILDDIR_REPLACEMENT: &str = "<BUILD_DIR>";
pub const CONANDIR_REPLACEMENT: &str = "<CONAN_USER_HOME>";
pub const QTDIR_REPLACEMENT: &str = "<QT_DIR>";
pub const LLVMDIR_REPLACEMENT: &str = "<LLVM_DIR>";
pub const VENVDIR_REPLACEMENT: &str = "<GM_VENV_DIR>";

/// Windows `MAX_PATH`; longer display paths are normalized before printing.
pub const MAX_PATH: usize = 260;

/// Which captured compiler stream a rewrite applies to. The two streams carry
/// paths in different formats and use different recognizers.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StdStream {
    Stdout,
    Stderr,
}

/// A path in placeholder form. The only way to obtain one is
/// [`Environment::canonicalize_path`], and the only way back is
/// [`Environment::expand_path`].
#[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CanonPath(String);

impl CanonPath {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CanonPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for CanonPath {
    fn from(s: String) -> Self {
        CanonPath(s)
    }
}

/// Recognizes `note: including file: <path>` style lines, in any localization.
pub(crate) static RE_STDOUT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(\w+:\s[\s\w]+:\s+)(\S.*?)\r?$").unwrap());

/// Recognizes `<path>(12,3): error …` style diagnostics. The original uses a
/// lookahead for the location suffix; here the suffix is a plain group and the
/// line is re-assembled from the end of the path capture.
pub(crate) static RE_STDERR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?i)^((?:In file included from\s+)?)((?:[A-Z]:|[^\s:]|<[^>]+>)[^:<>|?*"]*?)((?:\d+(?::\d+)?|\(\d+(?:,\d+)?\)|\s\+\d+(?::\d+)?|):)"#,
    )
    .unwrap()
});

/// Matches the `<env:NAME>` placeholder at the start of a canonicalized path.
static RE_ENV: Lazy<Regex> = Lazy::new(|| Regex::new(r"^<env:([^>]+)>").unwrap());

/// Latches the Qt install root: first `…/Qt/<M>.<N>.<P>/` seen in a path.
static RE_QT_DIR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(.*[\\/]qt)[\\/]\d+\.\d+\.\d+[\\/]").unwrap());

/// Latches the Conan user home from a venv-provisioned conan directory.
static RE_CONAN_VENV: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(.*[\\/]gm-venv[\\/]conan_[0-9a-f]+)[\\/]").unwrap());

static INCLUDE_RE: Lazy<regex::bytes::Regex> = Lazy::new(|| {
    regex::bytes::Regex::new(r#"(?i)^\s*#\s*include\s*"((?:[A-Z]:)?[^:<>|?*"]+)""#).unwrap()
});

static COMMENT_RE: Lazy<regex::bytes::Regex> =
    Lazy::new(|| regex::bytes::Regex::new(r#"(?i)^\s*//\s*((?:[A-Z]:)?[^:<>|?*"]+?)\r?$"#).unwrap());

fn subst_with_placeholder(
    path_str: &str,
    prefix: Option<&str>,
    placeholder: &str,
) -> Option<String> {
    let prefix = prefix.filter(|p| !p.is_empty())?;
    if path_str == prefix {
        return Some(placeholder.to_string());
    }
    let rest = path_str.strip_prefix(prefix)?;
    rest.starts_with(['/', '\\']).then(|| format!("{placeholder}{rest}"))
}

/// True when `canon` begins with `placeholder` followed by a separator or
/// nothing at all; a placeholder glued to other characters is a broken key.
fn starts_with_placeholder(canon: &str, placeholder: &str) -> Result<bool> {
    if !canon.starts_with(placeholder) {
        return Ok(false);
    }
    match canon.as_bytes().get(placeholder.len()) {
        None | Some(b'/') | Some(b'\\') => Ok(true),
        Some(_) => Err(CacheError::Placeholder(format!("invalid canonicalized path: {canon}"))),
    }
}

impl Environment {
    /// Canonicalizes an absolute path into placeholder form.
    ///
    /// Matching order is fixed: build dir, base dir, Conan home, Qt root,
    /// LLVM root, toolchain roots, venv root. This never fails; unknown paths
    /// come back lower-cased as-is.
    pub fn canonicalize_path(&self, path: &Path) -> CanonPath {
        if let Some(hit) = self.canon_cache.lock().unwrap().get(path) {
            return hit.clone();
        }
        let path_str = lower_str(path);
        let canon = self
            .canon_build_dir(&path_str)
            .or_else(|| self.canon_base_dir(&path_str))
            .or_else(|| self.canon_conan_dir(&path_str))
            .or_else(|| self.canon_qt_dir(&path_str))
            .or_else(|| self.canon_llvm_dir(&path_str))
            .or_else(|| self.canon_toolchain_dirs(&path_str))
            .or_else(|| self.canon_venv_dir(&path_str))
            .unwrap_or_else(|| {
                warn!("unable to canonicalize path: {path_str}");
                path_str.clone()
            });
        let canon = CanonPath(canon);
        self.canon_cache.lock().unwrap().insert(path.to_path_buf(), canon.clone());
        canon
    }

    /// Expands a canonicalized path back into an absolute path on this host.
    pub fn expand_path(&self, canon: &str) -> Result<PathBuf> {
        if let Some(hit) = self.expand_cache.lock().unwrap().get(canon) {
            return Ok(hit.clone());
        }
        let expanded = self.expand_path_uncached(canon)?;
        self.expand_cache.lock().unwrap().insert(canon.to_string(), expanded.clone());
        Ok(expanded)
    }

    fn expand_path_uncached(&self, canon: &str) -> Result<PathBuf> {
        if canon.starts_with(BASEDIR_REPLACEMENT) {
            let Some(base_dir) = &self.base_dir else {
                return Err(CacheError::Placeholder(format!(
                    "no base directory set, but found relative path {canon}"
                )));
            };
            return Ok(PathBuf::from(canon.replacen(
                BASEDIR_REPLACEMENT,
                &base_dir.to_string_lossy(),
                1,
            )));
        }
        if starts_with_placeholder(canon, BUILDDIR_REPLACEMENT)? {
            return Ok(PathBuf::from(canon.replacen(
                BUILDDIR_REPLACEMENT,
                &self.build_dir.to_string_lossy(),
                1,
            )));
        }
        if let Some(home) = self.conan_home_lazy() {
            if starts_with_placeholder(canon, CONANDIR_REPLACEMENT)? {
                return Ok(self.expand_conan_placeholder(&home, canon));
            }
        }
        if let Some(venv) = &self.venv_dir_str {
            if starts_with_placeholder(canon, VENVDIR_REPLACEMENT)? {
                return Ok(PathBuf::from(canon.replacen(VENVDIR_REPLACEMENT, venv, 1)));
            }
        }
        if let Some(qt) = self.qt_dir.get() {
            if starts_with_placeholder(canon, QTDIR_REPLACEMENT)? {
                return Ok(PathBuf::from(canon.replacen(QTDIR_REPLACEMENT, qt, 1)));
            }
        }
        if let Some((llvm, _)) = self.llvm_dir.get().filter(|(long, _)| !long.is_empty()) {
            if starts_with_placeholder(canon, LLVMDIR_REPLACEMENT)? {
                return Ok(PathBuf::from(canon.replacen(LLVMDIR_REPLACEMENT, llvm, 1)));
            }
        }
        if let Some(caps) = RE_ENV.captures(canon) {
            let placeholder = caps.get(0).unwrap();
            if starts_with_placeholder(canon, placeholder.as_str())? {
                let Some(root) = env_var_path(&caps[1]) else {
                    return Err(CacheError::Placeholder(format!(
                        "unable to resolve environment variable {}",
                        placeholder.as_str()
                    )));
                };
                let rest = &canon[(placeholder.end() + 1).min(canon.len())..];
                return Ok(root.join(rest));
            }
        }
        Ok(PathBuf::from(canon))
    }

    fn canon_build_dir(&self, path_str: &str) -> Option<String> {
        subst_with_placeholder(path_str, Some(&self.build_dir_str), BUILDDIR_REPLACEMENT).or_else(
            || {
                subst_with_placeholder(
                    path_str,
                    self.build_dir_resolved.as_deref(),
                    BUILDDIR_REPLACEMENT,
                )
            },
        )
    }

    fn canon_base_dir(&self, path_str: &str) -> Option<String> {
        subst_with_placeholder(path_str, self.base_dir_str.as_deref(), BASEDIR_REPLACEMENT)
            .or_else(|| {
                subst_with_placeholder(
                    path_str,
                    self.base_dir_resolved.as_deref(),
                    BASEDIR_REPLACEMENT,
                )
            })
    }

    fn canon_venv_dir(&self, path_str: &str) -> Option<String> {
        subst_with_placeholder(path_str, self.venv_dir_str.as_deref(), VENVDIR_REPLACEMENT)
            .or_else(|| {
                subst_with_placeholder(
                    path_str,
                    self.venv_dir_resolved.as_deref(),
                    VENVDIR_REPLACEMENT,
                )
            })
    }

    fn canon_qt_dir(&self, path_str: &str) -> Option<String> {
        let qt = self.qt_dir.get_or_try_init(|| {
            match RE_QT_DIR.captures(path_str) {
                Some(caps) => Ok(caps[1].to_string()),
                // Not latched yet; try again on the next path.
                None => Err(()),
            }
        });
        let qt = qt.ok()?;
        path_str
            .starts_with(qt.as_str())
            .then(|| path_str.replacen(qt.as_str(), QTDIR_REPLACEMENT, 1))
    }

    fn canon_llvm_dir(&self, path_str: &str) -> Option<String> {
        let (long, resolved) = self.llvm_dir.get()?;
        if !long.is_empty() && path_str.starts_with(long.as_str()) {
            return Some(path_str.replacen(long.as_str(), LLVMDIR_REPLACEMENT, 1));
        }
        if let Some(resolved) = resolved {
            if path_str.starts_with(resolved.as_str()) {
                return Some(path_str.replacen(resolved.as_str(), LLVMDIR_REPLACEMENT, 1));
            }
        }
        None
    }

    fn canon_toolchain_dirs(&self, path_str: &str) -> Option<String> {
        for root in &self.toolchain_roots {
            for prefix in
                std::iter::once(root.long.as_str()).chain(root.resolved.as_deref())
            {
                if let Some(rest) = path_str.strip_prefix(prefix) {
                    if rest.starts_with(['/', '\\']) {
                        return Some(format!("<env:{}>{}", root.var, rest));
                    }
                }
            }
        }
        None
    }

    /// Conan home, latching the default lookup state on first use.
    fn conan_home_lazy(&self) -> Option<PathBuf> {
        let mut state = self.conan.lock().unwrap();
        if !state.initialized {
            state.initialized = true;
            let home = conan_user_home(self.conan_home_env.clone());
            state.home_prefix = home.as_deref().map(lower_str);
            state.home = home;
            state.short_re = conan_short_re(self.conan_short_env.as_deref());
        }
        state.home.clone()
    }

    fn canon_conan_dir(&self, path_str: &str) -> Option<String> {
        let mut state = self.conan.lock().unwrap();
        if !state.found_venv {
            if let Some(caps) = RE_CONAN_VENV.captures(path_str) {
                state.found_venv = true;
                let home = conan_user_home(Some(PathBuf::from(&caps[1])));
                state.home_prefix = home.as_deref().map(lower_str);
                state.home = home;
                state.short_re = conan_short_re(self.conan_short_env.as_deref());
                state.initialized = true;
            }
        }
        if !state.initialized {
            state.initialized = true;
            let home = conan_user_home(self.conan_home_env.clone());
            state.home_prefix = home.as_deref().map(lower_str);
            state.home = home;
            state.short_re = conan_short_re(self.conan_short_env.as_deref());
        }

        let mut path_str = path_str.to_string();

        // A path below the Conan "short path" root is first rewritten to its
        // long form via the recorded real_path.txt indirection.
        if let Some(short_re) = &state.short_re {
            if let Some(m) = short_re.captures(&path_str).and_then(|caps| caps.get(1)) {
                let short_dir = Path::new(m.as_str()).parent().map(Path::to_path_buf);
                if let Some(short_dir) = short_dir {
                    let real_path_file = short_dir.join("real_path.txt");
                    if let Ok(content) = std::fs::read_to_string(&real_path_file) {
                        if let Some(real) = content.lines().next() {
                            let rest = &path_str[(m.end() + 1).min(path_str.len())..];
                            path_str = lower_str(&Path::new(real.trim()).join(rest));
                        }
                    }
                }
            }
        }

        let home_prefix = state.home_prefix.as_deref()?;
        let rest = path_str.strip_prefix(home_prefix)?;
        let is_conan = rest.strip_prefix(['/', '\\']).is_some_and(|r| r.starts_with(".conan"));
        is_conan.then(|| format!("{CONANDIR_REPLACEMENT}{rest}"))
    }

    fn expand_conan_placeholder(&self, home: &Path, canon: &str) -> PathBuf {
        // The short-path indirection: the package directory may carry a
        // .conan_link file holding the real (short) location.
        let parts: Vec<&str> = canon.split(['/', '\\']).collect();
        if parts.len() > 9 {
            let mut link_dir = home.to_path_buf();
            for part in &parts[1..9] {
                link_dir.push(part);
            }
            let link_file = link_dir.join(".conan_link");

            let mut cache = self.conan_link_cache.lock().unwrap();
            let short = cache.entry(link_file.clone()).or_insert_with(|| {
                std::fs::read_to_string(&link_file)
                    .ok()
                    .and_then(|content| {
                        content.lines().next().map(|line| {
                            utils::normalize_path(Path::new(line.trim()))
                        })
                    })
            });
            if let Some(short) = short {
                let mut out = short.clone();
                for part in &parts[9..] {
                    out.push(part);
                }
                return out;
            }
        }
        PathBuf::from(canon.replacen(CONANDIR_REPLACEMENT, &home.to_string_lossy(), 1))
    }

    /// Canonicalizes paths appearing in captured compiler output.
    pub fn canonicalize_output(&self, output: &str, stream: StdStream) -> String {
        let re = stream_re(stream);
        rewrite_lines(output, |content| {
            let caps = re.captures(content)?;
            let path = caps.get(2).unwrap();
            let orig = utils::absolute_path(&utils::normalize_path(Path::new(path.as_str())));
            let canon = self.canonicalize_path(&orig);
            Some(format!("{}{}{}", &caps[1], canon, &content[path.end()..]))
        })
    }

    /// Expands canonicalized paths in stored compiler output back into local
    /// absolute paths before printing.
    pub fn expand_output(&self, output: &str, stream: StdStream) -> String {
        let re = stream_re(stream);
        rewrite_lines(output, |content| {
            let caps = re.captures(content)?;
            let path = caps.get(2).unwrap();
            let expanded = self.expand_path(path.as_str()).ok()?;
            let mut text = expanded.to_string_lossy().into_owned();
            if text.len() > MAX_PATH - 10 {
                text = utils::normalize_path(&expanded).to_string_lossy().into_owned();
            }
            Some(format!("{}{}{}", &caps[1], text, &content[path.end()..]))
        })
    }

    /// Canonicalizes include statements and path comments referring into the
    /// base directory inside generated source code.
    ///
    /// Unity-build sources and moc output embed absolute paths of the tree
    /// that generated them; substituting those with `<BASE_DIR>` makes the
    /// content hash of such files stable across checkouts at different
    /// locations.
    pub fn subst_base_dir(&self, src_code: &[u8], src_dir: &Path) -> Vec<u8> {
        let mut result = Vec::with_capacity(src_code.len());
        for line in split_lines_bytes(src_code) {
            let (content, terminator) = match line.last() {
                Some(b'\n') => line.split_at(line.len() - 1),
                _ => (line, &b""[..]),
            };
            let matched = INCLUDE_RE
                .captures(content)
                .or_else(|| COMMENT_RE.captures(content))
                .and_then(|caps| caps.get(1).map(|m| (m.start(), m.end())));
            let mut replaced = false;
            if let Some((start, end)) = matched {
                if let Ok(path_str) = std::str::from_utf8(&content[start..end]) {
                    let path = Path::new(path_str);
                    let path = if path.is_absolute() {
                        utils::normalize_path(path)
                    } else {
                        utils::normalize_path(&src_dir.join(path))
                    };
                    if path.is_file() {
                        if let Some(rel) = self.relative_to_base_dir(&path) {
                            result.extend_from_slice(&content[..start]);
                            result
                                .extend_from_slice(format!("{BASEDIR_REPLACEMENT}/{rel}").as_bytes());
                            result.extend_from_slice(&content[end..]);
                            result.extend_from_slice(terminator);
                            replaced = true;
                        }
                    }
                }
            }
            if !replaced {
                result.extend_from_slice(line);
            }
        }
        result
    }

    /// Forward-slashed path relative to the base dir, matched against both
    /// the literal and resolved base spelling, case-insensitively.
    fn relative_to_base_dir(&self, path: &Path) -> Option<String> {
        let path_str = lower_str(path);
        let prefix_len = [self.base_dir_str.as_deref(), self.base_dir_resolved.as_deref()]
            .into_iter()
            .flatten()
            .find_map(|prefix| {
                let rest = path_str.strip_prefix(prefix)?;
                rest.starts_with(['/', '\\']).then(|| prefix.len() + 1)
            })?;
        let rel = path.to_string_lossy().get(prefix_len..)?.to_string();
        Some(rel.replace('\\', "/"))
    }

    pub fn is_in_build_dir(&self, path: &Path) -> bool {
        let path_str = lower_str(path);
        path_str.starts_with(&self.build_dir_str)
            || self
                .build_dir_resolved
                .as_deref()
                .is_some_and(|resolved| path_str.starts_with(resolved))
    }

    pub fn is_in_base_dir(&self, path: &Path) -> bool {
        let path_str = lower_str(path);
        self.base_dir_str.as_deref().is_some_and(|base| path_str.starts_with(base))
            || self
                .base_dir_resolved
                .as_deref()
                .is_some_and(|resolved| path_str.starts_with(resolved))
    }
}

fn stream_re(stream: StdStream) -> &'static Regex {
    match stream {
        StdStream::Stdout => &RE_STDOUT,
        StdStream::Stderr => &RE_STDERR,
    }
}

/// Applies `rewrite` per line, preserving line terminators; lines the closure
/// declines are copied through untouched.
fn rewrite_lines(output: &str, mut rewrite: impl FnMut(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(output.len());
    for line in output.split_inclusive('\n') {
        let (content, terminator) = match line.strip_suffix('\n') {
            Some(content) => (content, "\n"),
            None => (line, ""),
        };
        match rewrite(content) {
            Some(rewritten) => {
                out.push_str(&rewritten);
                out.push_str(terminator);
            }
            None => out.push_str(line),
        }
    }
    out
}

fn split_lines_bytes(bytes: &[u8]) -> impl Iterator<Item = &[u8]> {
    bytes.split_inclusive(|b| *b == b'\n')
}

/// Conan user home: explicit hint, else `USERPROFILE`, else the home dir.
fn conan_user_home(hint: Option<PathBuf>) -> Option<PathBuf> {
    hint.or_else(|| std::env::var_os("USERPROFILE").map(PathBuf::from))
        .or_else(home::home_dir)
        .map(|dir| utils::absolute_path(&dir))
}

fn conan_short_re(hint: Option<&Path>) -> Option<Regex> {
    let re_str = match hint {
        Some(path) => regex::escape(&lower_str(path)),
        None => r"[a-z]:\\\.conan".to_string(),
    };
    Regex::new(&format!(r"(?i)^({re_str}[\\/][0-9a-f]+[\\/]1)[\\/]")).ok()
}

fn env_var_path(name: &str) -> Option<PathBuf> {
    let (var, suffix) = match name.split_once('/') {
        Some((var, suffix)) => (var, suffix),
        None => (name, "."),
    };
    let value = std::env::var_os(var)?;
    Some(utils::resolve(&utils::normalize_path(&Path::new(&value).join(suffix))))
}
