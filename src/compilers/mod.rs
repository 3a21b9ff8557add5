//! Compiler front-ends.
//!
//! The cache core is front-end agnostic; everything `cl.exe` and `moc.exe`
//! specific (option tables, invocation classification, include discovery and
//! artifact rewriting) sits behind [`CompilerFrontend`]. The dispatcher picks
//! the implementation from the executable name.

use crate::{
    artifacts::CopyFilter,
    error::{AnalyzerError, CacheError, Result},
    manifest::ManifestEntry,
    Environment,
};
use std::{
    io::Write,
    path::{Path, PathBuf},
    process::{Command, Stdio},
    sync::Arc,
};

pub mod cl;
pub mod moc;

pub use cl::ClFrontend;
pub use moc::MocFrontend;

/// Command lines beyond this length go through a response file; the platform
/// limit is 32767 with some safety margin kept.
const MAX_CMDLINE_LEN: usize = 32_000;

/// Exit code and captured streams of a real compiler run.
#[derive(Clone, Debug)]
pub struct CompilerResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// A dependency file to regenerate on a cache hit.
#[derive(Clone, Debug)]
pub struct DepFile {
    pub path: PathBuf,
    pub rule: PathBuf,
}

/// One (source, output) unit of work.
#[derive(Clone, Debug)]
pub struct Job {
    /// Complete command line for compiling just this source.
    pub cmdline: Vec<String>,
    pub src_file: PathBuf,
    pub output_file: PathBuf,
    /// Present when the caller asked for a dependency file.
    pub dep_file: Option<DepFile>,
}

/// The classified shape of a cacheable invocation.
#[derive(Debug)]
pub struct Invocation {
    pub jobs: Vec<Job>,
    /// Upper bound on parallel jobs (`/MP`); 1 means sequential.
    pub job_count: usize,
}

/// Everything the engine needs to know about one compiler kind.
pub trait CompilerFrontend: Send + Sync {
    fn name(&self) -> &'static str;

    /// The manifest format version folded into the manifest hash.
    fn format_version(&self) -> u32;

    /// Classifies the invocation and derives the job list. Uncacheable
    /// shapes are reported as [`AnalyzerError`]s.
    fn analyze(
        &self,
        env: &Environment,
        cmdline: &[String],
    ) -> Result<Invocation, AnalyzerError>;

    /// The manifest hash of one job: source content, compiler identity and
    /// the sorted canonicalized options.
    fn manifest_hash(
        &self,
        env: &Environment,
        compiler: &Path,
        cmdline: &[String],
        src_file: &Path,
    ) -> Result<String>;

    /// Forces include discovery onto the command line. Returns `true` when
    /// the discovery output must be stripped before forwarding because the
    /// caller did not ask for it.
    fn inject_include_dump(&self, cmdline: &mut Vec<String>) -> bool;

    /// Extracts the include set after a real compile. Returns the includes
    /// and the stdout to forward (with dump lines stripped when requested).
    fn extract_includes(
        &self,
        env: &Environment,
        result: &CompilerResult,
        job: &Job,
        strip: bool,
    ) -> Result<(Vec<PathBuf>, String)>;

    /// Rewrites captured output into canonical form before it is stored.
    fn canonicalize_streams(&self, env: &Environment, stdout: &str, stderr: &str)
        -> (String, String);

    /// Expands stored output back for printing on a hit.
    fn expand_streams(&self, env: &Environment, stdout: &str, stderr: &str) -> (String, String);

    /// Post-capture fixup of stdout before it is parsed or forwarded.
    fn postprocess_stdout(&self, stdout: String) -> String {
        stdout
    }

    /// Payload rewrite applied while the artifact is stored.
    fn store_filter(&self, env: &Arc<Environment>, job: &Job) -> Option<CopyFilter> {
        let _ = (env, job);
        None
    }

    /// Payload rewrite applied while the artifact is copied out.
    fn fetch_filter(&self, env: &Arc<Environment>, job: &Job) -> Option<CopyFilter> {
        let _ = (env, job);
        None
    }

    /// Front-end bookkeeping after a confirmed hit (dep-file regeneration).
    fn after_hit(&self, env: &Environment, job: &Job, entry: &ManifestEntry) -> Result<()> {
        let _ = (env, job, entry);
        Ok(())
    }
}

/// Picks the front-end from the compiler executable name.
pub fn frontend_for(compiler: &Path) -> Box<dyn CompilerFrontend> {
    let stem = compiler
        .file_stem()
        .map(|stem| stem.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    if stem == "moc" {
        Box::new(MocFrontend::new())
    } else {
        Box::new(ClFrontend::new())
    }
}

/// Renders options and inputs into the canonical command-line form hashed
/// into the manifest hash: option names sorted, unified options deduplicated
/// or path-canonicalized, inputs canonicalized.
pub(crate) fn canonicalized_cmdline(
    env: &Environment,
    unify_and_sort: &std::collections::BTreeMap<&'static str, bool>,
    options: &crate::args::Options,
    input_files: &[PathBuf],
) -> Vec<String> {
    let canon_arg = |value: &str| {
        env.canonicalize_path(&crate::utils::absolute_path(Path::new(value))).to_string()
    };

    // Only option names are sorted; value order may change the compiler
    // result and is preserved.
    let mut canon_cmd: Vec<String> = Vec::new();
    for (name, values) in options {
        match unify_and_sort.get(name.as_str()) {
            Some(true) => {
                canon_cmd.extend(values.iter().map(|v| format!("/{name}{}", canon_arg(v))));
            }
            Some(false) => {
                let mut seen = std::collections::HashSet::new();
                for value in values {
                    if seen.insert(value.as_str()) {
                        canon_cmd.push(format!("/{name}{value}"));
                    }
                }
            }
            None => {
                canon_cmd.extend(values.iter().map(|v| format!("/{name}{v}")));
            }
        }
    }
    canon_cmd.extend(input_files.iter().map(|file| canon_arg(&file.to_string_lossy())));
    canon_cmd
}

fn prepare_env(env_vars: &[(String, String)]) -> Vec<(String, String)> {
    // VS_UNICODE_OUTPUT makes cl.exe write to a named pipe instead of stdout;
    // it must be gone for the capture to see anything.
    env_vars.iter().filter(|(key, _)| key != "VS_UNICODE_OUTPUT").cloned().collect()
}

/// Invokes the real compiler with inherited stdio; used for invocations the
/// cache refuses to touch.
pub fn forward_compiler(
    compiler: &Path,
    cmdline: &[String],
    env_vars: &[(String, String)],
) -> Result<i32> {
    debug!("invoking compiler: {} {}", compiler.display(), cmdline.join(" "));
    let status = Command::new(compiler)
        .args(cmdline)
        .env_clear()
        .envs(prepare_env(env_vars).into_iter())
        .status()
        .map_err(|err| CacheError::io(err, compiler))?;
    Ok(status.code().unwrap_or(-1))
}

/// Invokes the real compiler and captures its streams, switching to a
/// response file when the command line grows past the platform limit.
pub fn capture_compiler(
    compiler: &Path,
    cmdline: &[String],
    env_vars: &[(String, String)],
) -> Result<CompilerResult> {
    let joined_len: usize =
        compiler.as_os_str().len() + cmdline.iter().map(|arg| arg.len() + 1).sum::<usize>();
    if joined_len >= MAX_CMDLINE_LEN {
        let mut rsp = tempfile::Builder::new()
            .suffix(".rsp")
            .tempfile()
            .map_err(|err| CacheError::io(err, compiler))?;
        writeln!(rsp, "{}", cmdline.join(" ")).map_err(|err| CacheError::io(err, rsp.path()))?;
        rsp.flush().map_err(|err| CacheError::io(err, rsp.path()))?;
        let rsp_arg = format!("@{}", rsp.path().display());
        return capture_compiler_raw(compiler, &[rsp_arg], env_vars);
    }
    capture_compiler_raw(compiler, cmdline, env_vars)
}

fn capture_compiler_raw(
    compiler: &Path,
    cmdline: &[String],
    env_vars: &[(String, String)],
) -> Result<CompilerResult> {
    debug!("invoking compiler: {} {}", compiler.display(), cmdline.join(" "));
    let output = Command::new(compiler)
        .args(cmdline)
        .env_clear()
        .envs(prepare_env(env_vars).into_iter())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .map_err(|err| CacheError::io(err, compiler))?;

    let exit_code = output.status.code().unwrap_or(-1);
    trace!("real compiler returned code {exit_code}");
    Ok(CompilerResult {
        exit_code,
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_is_by_executable_stem() {
        assert_eq!(frontend_for(Path::new("C:/Qt/bin/moc.exe")).name(), "moc");
        assert_eq!(frontend_for(Path::new("cl.exe")).name(), "cl");
        assert_eq!(frontend_for(Path::new("/opt/llvm/bin/clang-cl.exe")).name(), "cl");
    }
}
