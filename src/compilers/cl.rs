//! The `cl.exe` front-end.

use super::{CompilerFrontend, CompilerResult, Invocation, Job};
use crate::{
    args::{CommandLineAnalyzer, OptSpec},
    canon::{StdStream, MAX_PATH, RE_STDOUT},
    error::{AnalyzerError, CacheError, Result},
    hash, manifest, utils, Environment,
};
use once_cell::sync::Lazy;
use regex::Regex;
use std::{
    collections::{BTreeSet, HashSet},
    path::{Path, PathBuf},
};

static RE_MP: Lazy<Regex> = Lazy::new(|| Regex::new(r"^/MP(\d+)?$").unwrap());

/// Matches the `Note: including file: <path>` lines `/showIncludes` emits, in
/// any localization: one word, colon, a phrase of words, colon, the path.
static RE_INCLUDE_NOTE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\w+: [ \w]+: +(\S.*?)\r?$").unwrap());

pub struct ClFrontend {
    analyzer: CommandLineAnalyzer,
}

impl Default for ClFrontend {
    fn default() -> Self {
        Self::new()
    }
}

impl ClFrontend {
    pub fn new() -> Self {
        let specs = vec![
            // /NAMEparameter
            OptSpec::glued_required("Ob"),
            OptSpec::glued_required("Yl"),
            OptSpec::glued_required("Zm"),
            // /NAME[parameter]
            OptSpec::glued_optional("doc"),
            OptSpec::glued_optional("FA"),
            OptSpec::glued_optional("FR"),
            OptSpec::glued_optional("Fr"),
            OptSpec::glued_optional("Gs"),
            OptSpec::glued_optional("MP"),
            OptSpec::glued_optional("Yc"),
            OptSpec::glued_optional("Yu"),
            OptSpec::glued_optional("Zp"),
            OptSpec::glued_optional("Fa"),
            OptSpec::glued_optional("Fd"),
            OptSpec::glued_optional("Fe"),
            OptSpec::glued_optional("Fi"),
            OptSpec::glued_optional("Fm"),
            OptSpec::glued_optional("Fo"),
            OptSpec::glued_optional("Fp"),
            OptSpec::glued_optional("Wv"),
            OptSpec::glued_optional("experimental:external"),
            OptSpec::glued_optional("external:anglebrackets"),
            OptSpec::glued_optional("external:W"),
            OptSpec::glued_optional("external:templates"),
            // /NAME[ ]parameter
            OptSpec::glued_or_separate("AI"),
            OptSpec::glued_or_separate("D"),
            OptSpec::glued_or_separate("Tc"),
            OptSpec::glued_or_separate("Tp"),
            OptSpec::glued_or_separate("FI"),
            OptSpec::glued_or_separate("U"),
            OptSpec::glued_or_separate("I"),
            OptSpec::glued_or_separate("F"),
            OptSpec::glued_or_separate("FU"),
            OptSpec::glued_or_separate("w1"),
            OptSpec::glued_or_separate("w2"),
            OptSpec::glued_or_separate("w3"),
            OptSpec::glued_or_separate("w4"),
            OptSpec::glued_or_separate("wd"),
            OptSpec::glued_or_separate("we"),
            OptSpec::glued_or_separate("wo"),
            OptSpec::glued_or_separate("W"),
            OptSpec::glued_or_separate("V"),
            OptSpec::glued_or_separate("imsvc").aliased("I"),
            OptSpec::glued_or_separate("external:I").aliased("I"),
            OptSpec::glued_or_separate("external:env:").aliased("I").env_values(),
            // /NAME parameter
            OptSpec::separate("Xclang"),
        ];
        // Options participating in the manifest hash with unified order;
        // `true` marks path values that get canonicalized too.
        let unify_and_sort = [
            ("AI", true),
            ("I", true),
            ("FU", true),
            ("Fd", true),
            ("Tp", true),
            ("Tc", true),
            ("Fo", true),
            ("TP", false),
            ("TC", false),
            ("D", false),
            ("MD", false),
            ("MT", false),
            ("Z7", false),
            ("nologo", false),
            ("showIncludes", false),
        ];
        Self { analyzer: CommandLineAnalyzer::new(specs, &unify_and_sort) }
    }

    /// Parallelism from `/MP[N]`: the last occurrence wins, a bare `/MP`
    /// means one job per logical CPU, no `/MP` means sequential.
    pub fn job_count(cmdline: &[String]) -> usize {
        let Some(arg) = cmdline.iter().filter(|arg| RE_MP.is_match(arg)).next_back() else {
            return 1;
        };
        match RE_MP.captures(arg).and_then(|caps| caps.get(1)) {
            Some(count) => count.as_str().parse().unwrap_or(1),
            None => num_cpus::get(),
        }
    }
}

impl CompilerFrontend for ClFrontend {
    fn name(&self) -> &'static str {
        "cl"
    }

    fn format_version(&self) -> u32 {
        manifest::CL_FORMAT_VERSION
    }

    fn analyze(
        &self,
        _env: &Environment,
        cmdline: &[String],
    ) -> Result<Invocation, AnalyzerError> {
        let (options, orig_inputs) = self.analyzer.parse(cmdline)?;

        // Sources named via /Tp or /Tc shadow plain positional inputs.
        let mut inputs: Vec<(PathBuf, String)> =
            orig_inputs.into_iter().map(|file| (file, String::new())).collect();
        let mut complex = false;
        for (opt, lang) in [("Tp", "/Tp"), ("Tc", "/Tc")] {
            if let Some(values) = options.get(opt) {
                complex = true;
                for value in values {
                    let path = PathBuf::from(value);
                    match inputs.iter_mut().find(|(file, _)| *file == path) {
                        Some(slot) => slot.1 = lang.to_string(),
                        None => inputs.push((path, lang.to_string())),
                    }
                }
            }
        }
        if inputs.is_empty() {
            return Err(AnalyzerError::NoSourceFile);
        }

        for opt in ["E", "EP", "P"] {
            if options.contains_key(opt) {
                return Err(AnalyzerError::Preprocessing);
            }
        }
        // Supporting /Zi would mean copying .pdb files into and out of the
        // cache; they are written concurrently by parallel compilers.
        if options.contains_key("Zi") {
            return Err(AnalyzerError::ExternalDebugInfo);
        }
        if options.contains_key("Yc") || options.contains_key("Yu") {
            return Err(AnalyzerError::PrecompiledHeaders);
        }
        if options.contains_key("link") || !options.contains_key("c") {
            return Err(AnalyzerError::Linking);
        }
        if inputs.len() > 1 && complex {
            return Err(AnalyzerError::MultipleSourceFiles);
        }

        let mut obj_files: Option<Vec<PathBuf>> = None;
        let mut output_folder = PathBuf::new();
        if let Some(fo) =
            options.get("Fo").and_then(|values| values.first()).filter(|v| !v.is_empty())
        {
            let path = PathBuf::from(fo);
            if path.is_dir() {
                output_folder = path;
            } else if inputs.len() == 1 {
                obj_files = Some(vec![path]);
            }
        }
        let obj_files = obj_files.unwrap_or_else(|| {
            inputs
                .iter()
                .map(|(file, _)| output_folder.join(file).with_extension("obj"))
                .collect()
        });

        debug!(
            "input files: {}; output files: {}",
            inputs.iter().map(|(f, _)| f.display().to_string()).collect::<Vec<_>>().join(";"),
            obj_files.iter().map(|f| f.display().to_string()).collect::<Vec<_>>().join(";")
        );

        let sources: HashSet<&str> =
            inputs.iter().filter_map(|(file, _)| file.to_str()).collect();
        let base_cmdline: Vec<String> = cmdline
            .iter()
            .filter(|arg| {
                !sources.contains(arg.as_str())
                    && !["/Tc", "/Tp", "-Tp", "-Tc"].iter().any(|p| arg.starts_with(p))
                    && !arg.starts_with("/MP")
            })
            .cloned()
            .collect();

        let job_count = Self::job_count(cmdline);
        let jobs = inputs
            .into_iter()
            .zip(obj_files)
            .map(|((src_file, lang), output_file)| {
                let mut cmdline = base_cmdline.clone();
                cmdline.push(format!("{lang}{}", src_file.display()));
                Job { cmdline, src_file, output_file, dep_file: None }
            })
            .collect();

        Ok(Invocation { jobs, job_count })
    }

    fn manifest_hash(
        &self,
        env: &Environment,
        compiler: &Path,
        cmdline: &[String],
        src_file: &Path,
    ) -> Result<String> {
        let compiler_hash = hash::compiler_hash(compiler)?;
        let (mut options, input_files) =
            self.analyzer.parse(cmdline).map_err(CacheError::msg)?;

        // Fold the INCLUDE environment into /I so that two compilations
        // differing only in their include paths never collide.
        let include_env = std::env::var("INCLUDE").unwrap_or_default();
        options
            .entry("I".to_string())
            .or_default()
            .extend(include_env.split(';').filter(|v| !v.is_empty()).map(str::to_string));

        let canon_cmd = super::canonicalized_cmdline(
            env,
            self.analyzer.args_to_unify_and_sort(),
            &options,
            &input_files,
        );

        let toolset_data =
            format!("{compiler_hash}|{canon_cmd:?}|{}", manifest::CL_FORMAT_VERSION);
        trace!("toolset hash data: {toolset_data}");
        env.file_hash(src_file, Some(&toolset_data))
    }

    fn inject_include_dump(&self, cmdline: &mut Vec<String>) -> bool {
        if cmdline.iter().any(|arg| arg == "/showIncludes") {
            return false;
        }
        cmdline.insert(0, "/showIncludes".to_string());
        true
    }

    fn extract_includes(
        &self,
        _env: &Environment,
        result: &CompilerResult,
        job: &Job,
        strip: bool,
    ) -> Result<(Vec<PathBuf>, String)> {
        let abs_src = utils::absolute_path(&job.src_file);
        let mut includes = BTreeSet::new();
        let mut filtered = String::new();

        for line in result.stdout.split_inclusive('\n') {
            let content = line.strip_suffix('\n').unwrap_or(line);
            if let Some(caps) = RE_INCLUDE_NOTE.captures(content) {
                let path =
                    utils::absolute_path(&utils::normalize_path(Path::new(&caps[1])));
                if path != abs_src {
                    includes.insert(path);
                }
            } else if strip {
                filtered.push_str(line);
            }
        }

        let stdout = if strip { filtered } else { result.stdout.clone() };
        Ok((includes.into_iter().collect(), stdout))
    }

    fn canonicalize_streams(
        &self,
        env: &Environment,
        stdout: &str,
        stderr: &str,
    ) -> (String, String) {
        (
            env.canonicalize_output(stdout, StdStream::Stdout),
            env.canonicalize_output(stderr, StdStream::Stderr),
        )
    }

    fn expand_streams(&self, env: &Environment, stdout: &str, stderr: &str) -> (String, String) {
        (
            env.expand_output(stdout, StdStream::Stdout),
            env.expand_output(stderr, StdStream::Stderr),
        )
    }

    /// Collapses `..` segments in include notes whose path outgrows
    /// `MAX_PATH`, the way the IDE expects them.
    fn postprocess_stdout(&self, stdout: String) -> String {
        let mut out = String::with_capacity(stdout.len());
        for line in stdout.split_inclusive('\n') {
            let content = line.strip_suffix('\n').unwrap_or(line);
            let rewritten = RE_STDOUT.captures(content).and_then(|caps| {
                let path = caps.get(2).unwrap();
                if path.as_str().len() > MAX_PATH - 10 {
                    let normalized = utils::normalize_path(Path::new(path.as_str()));
                    Some(format!(
                        "{}{}{}",
                        &caps[1],
                        normalized.display(),
                        &content[path.end()..]
                    ))
                } else {
                    None
                }
            });
            match rewritten {
                Some(rewritten) => {
                    out.push_str(&rewritten);
                    if line.ends_with('\n') {
                        out.push('\n');
                    }
                }
                None => out.push_str(line),
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn cmdline(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    fn test_env() -> (tempfile::TempDir, Environment) {
        let dir = tempfile::tempdir().unwrap();
        let env = Environment::new(
            dir.path().join("cache"),
            dir.path().join("build"),
            Some(dir.path().to_path_buf()),
        );
        (dir, env)
    }

    #[test]
    fn classifies_uncacheable_shapes() {
        let (_dir, env) = test_env();
        let frontend = ClFrontend::new();

        let check = |args: &[&str], expected: AnalyzerError| {
            let err = frontend.analyze(&env, &cmdline(args)).unwrap_err();
            assert_eq!(err, expected, "{args:?}");
        };

        check(&["/c"], AnalyzerError::NoSourceFile);
        check(&["/c", "/P", "a.cpp"], AnalyzerError::Preprocessing);
        check(&["/c", "/Zi", "a.cpp"], AnalyzerError::ExternalDebugInfo);
        check(&["/c", "/Yupch.h", "a.cpp"], AnalyzerError::PrecompiledHeaders);
        check(&["a.cpp"], AnalyzerError::Linking);
        check(&["/c", "/link", "a.cpp"], AnalyzerError::Linking);
        check(&["/c", "/Tpa.cpp", "/Tpb.cpp"], AnalyzerError::MultipleSourceFiles);
    }

    #[test]
    fn derives_object_paths() {
        let (_dir, env) = test_env();
        let frontend = ClFrontend::new();

        let invocation = frontend.analyze(&env, &cmdline(&["/c", "src/a.cpp"])).unwrap();
        assert_eq!(invocation.jobs[0].output_file, PathBuf::from("src/a.obj"));

        let invocation =
            frontend.analyze(&env, &cmdline(&["/c", "/Foout.obj", "src/a.cpp"])).unwrap();
        assert_eq!(invocation.jobs[0].output_file, PathBuf::from("out.obj"));
    }

    #[test]
    fn job_count_honors_last_mp() {
        assert_eq!(ClFrontend::job_count(&cmdline(&["/c", "a.cpp"])), 1);
        assert_eq!(ClFrontend::job_count(&cmdline(&["/MP4", "/c"])), 4);
        assert_eq!(ClFrontend::job_count(&cmdline(&["/MP4", "/MP2"])), 2);
        assert_eq!(ClFrontend::job_count(&cmdline(&["/MP"])), num_cpus::get());
    }

    #[test]
    fn multi_source_invocations_fan_out() {
        let (_dir, env) = test_env();
        let frontend = ClFrontend::new();
        let invocation =
            frontend.analyze(&env, &cmdline(&["/MP2", "/c", "a.cpp", "b.cpp"])).unwrap();
        assert_eq!(invocation.jobs.len(), 2);
        assert_eq!(invocation.job_count, 2);
        // per-job command lines carry exactly their own source and no /MP
        assert!(invocation.jobs[0].cmdline.contains(&"a.cpp".to_string()));
        assert!(!invocation.jobs[0].cmdline.contains(&"b.cpp".to_string()));
        assert!(!invocation.jobs[0].cmdline.iter().any(|a| a.starts_with("/MP")));
    }

    #[test]
    fn include_notes_are_parsed_and_stripped() {
        let (_dir, env) = test_env();
        let frontend = ClFrontend::new();
        let job = Job {
            cmdline: Vec::new(),
            src_file: PathBuf::from("a.cpp"),
            output_file: PathBuf::from("a.obj"),
            dep_file: None,
        };
        let result = CompilerResult {
            exit_code: 0,
            stdout: "a.cpp\nNote: including file: /usr/include/x.h\nNote: including file:  /usr/include/y.h\n"
                .to_string(),
            stderr: String::new(),
        };

        let (includes, stdout) = frontend.extract_includes(&env, &result, &job, true).unwrap();
        assert_eq!(
            includes,
            vec![PathBuf::from("/usr/include/x.h"), PathBuf::from("/usr/include/y.h")]
        );
        assert_eq!(stdout, "a.cpp\n");

        let (_, unstripped) = frontend.extract_includes(&env, &result, &job, false).unwrap();
        assert_eq!(unstripped, result.stdout);
    }

    #[test]
    fn manifest_hash_is_stable_under_option_reordering() {
        let (dir, env) = test_env();
        let frontend = ClFrontend::new();

        let compiler = dir.path().join("cl.exe");
        std::fs::write(&compiler, b"fake compiler").unwrap();
        let src = dir.path().join("a.cpp");
        std::fs::write(&src, b"int main() { return 0; }").unwrap();

        let one = frontend
            .manifest_hash(&env, &compiler, &cmdline(&["/c", "/Iinc", "/DA=1", "a.cpp"]), &src)
            .unwrap();
        let two = frontend
            .manifest_hash(&env, &compiler, &cmdline(&["/DA=1", "/Iinc", "/c", "a.cpp"]), &src)
            .unwrap();
        assert_eq!(one, two);

        let other = frontend
            .manifest_hash(&env, &compiler, &cmdline(&["/c", "/Iother", "/DA=1", "a.cpp"]), &src)
            .unwrap();
        assert_ne!(one, other);
    }
}
