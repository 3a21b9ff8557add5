//! The `moc.exe` front-end.
//!
//! moc differs from cl in how includes are discovered (a Makefile-style
//! dependency file instead of `/showIncludes` stdout) and in that the
//! generated output itself embeds absolute include paths, which are rewritten
//! to placeholders while the artifact is stored and expanded again on the way
//! out.

use super::{CompilerFrontend, CompilerResult, DepFile, Invocation, Job};
use crate::{
    args::{CommandLineAnalyzer, OptSpec},
    canon::CanonPath,
    error::{AnalyzerError, CacheError, Result},
    hash, manifest,
    manifest::ManifestEntry,
    utils, Environment,
};
use once_cell::sync::Lazy;
use path_slash::PathExt;
use std::{
    fs,
    path::{Component, Path, PathBuf},
    sync::Arc,
};

static RE_MOC_INCLUDE: Lazy<regex::bytes::Regex> =
    Lazy::new(|| regex::bytes::Regex::new(r#"^#include\s+"(.*)""#).unwrap());

/// Everything before this marker is moc preamble whose includes get
/// rewritten; the generated class tables below embed no paths.
const MOC_NAMESPACE_MARKER: &[u8] = b"QT_BEGIN_MOC_NAMESPACE";

static RE_DEP_TARGET: Lazy<regex::Regex> =
    Lazy::new(|| regex::Regex::new(r"^(\s*(?:[a-zA-Z]:)?[^:]*:)").unwrap());

static RE_DEP_CONTINUATION: Lazy<regex::Regex> =
    Lazy::new(|| regex::Regex::new(r"\\\r?\n").unwrap());

pub struct MocFrontend {
    analyzer: CommandLineAnalyzer,
}

impl Default for MocFrontend {
    fn default() -> Self {
        Self::new()
    }
}

impl MocFrontend {
    pub fn new() -> Self {
        let specs = vec![
            // -<NAME>[= ]parameter
            OptSpec::qt_param("n"),
            OptSpec::qt_param("o"),
            OptSpec::qt_param("I"),
            OptSpec::qt_param("F"),
            OptSpec::qt_param("D"),
            OptSpec::qt_param("U"),
            OptSpec::qt_param("M"),
            OptSpec::qt_param("p"),
            OptSpec::qt_param("f"),
            OptSpec::qt_param("b"),
            OptSpec::qt_param_long("compiler-flavor"),
            OptSpec::qt_param_long("include"),
            OptSpec::qt_param_long("dep-file-path"),
            OptSpec::qt_param_long("dep-file-rule-name"),
            OptSpec::qt_param_long("symbol-threshold"),
            // flags
            OptSpec::qt_flag("h"),
            OptSpec::qt_flag("v"),
            OptSpec::qt_flag("E"),
            OptSpec::qt_flag("i"),
            OptSpec::qt_flag_long("version"),
            OptSpec::qt_flag_long("no-notes"),
            OptSpec::qt_flag_long("no-warnings"),
            OptSpec::qt_flag_long("ignore-option-clashes"),
            OptSpec::qt_flag_long("output-json"),
            OptSpec::qt_flag_long("collect-json"),
            OptSpec::qt_flag_long("output-dep-file"),
            OptSpec::qt_flag_long("has-symbol-threshold"),
            OptSpec::qt_flag_long("threshold-error"),
            OptSpec::qt_flag_long("show-include-hierarchy"),
            OptSpec::qt_flag_long("threshold-error-assert"),
            OptSpec::qt_flag_long("show-includes"),
        ];
        let unify_and_sort = [
            ("I", true),
            ("p", true),
            ("f", true),
            ("b", true),
            ("o", true),
            ("include", false),
            ("v", false),
            ("version", false),
            ("E", false),
            ("i", false),
            ("no-notes", false),
            ("no-warnings", false),
            ("ignore-option-clashes", false),
            ("output-json", false),
            ("collect-json", false),
            ("output-dep-file", false),
            ("has-symbol-threshold", false),
            ("threshold-error", false),
            ("show-include-hierarchy", false),
            ("threshold-error-assert", false),
            ("show-includes", false),
            ("n", false),
            ("F", false),
            ("D", false),
            ("U", false),
            ("M", false),
            ("compiler-flavor", false),
            ("dep-file-rule-name", false),
            ("symbol-threshold", false),
        ];
        Self { analyzer: CommandLineAnalyzer::new(specs, &unify_and_sort) }
    }
}

impl CompilerFrontend for MocFrontend {
    fn name(&self) -> &'static str {
        "moc"
    }

    fn format_version(&self) -> u32 {
        manifest::MOC_FORMAT_VERSION
    }

    fn analyze(
        &self,
        _env: &Environment,
        cmdline: &[String],
    ) -> Result<Invocation, AnalyzerError> {
        let (options, input_files) = self.analyzer.parse(cmdline)?;

        let Some(input_file) = input_files.first() else {
            return Err(AnalyzerError::NoSourceFile);
        };
        if options.contains_key("E") {
            return Err(AnalyzerError::Preprocessing);
        }
        if options.contains_key("output-json") || options.contains_key("collect-json") {
            return Err(AnalyzerError::JsonOutput);
        }
        let Some(output_file) =
            options.get("o").and_then(|values| values.first()).filter(|v| !v.is_empty())
        else {
            return Err(AnalyzerError::NoOutputFile);
        };
        let output_file = PathBuf::from(output_file);

        debug!(
            "moc input file: {}; output file: {}",
            input_file.display(),
            output_file.display()
        );

        let dep_file = options.contains_key("output-dep-file").then(|| {
            let rule = options
                .get("dep-file-rule-name")
                .and_then(|values| values.first())
                .map(PathBuf::from)
                .unwrap_or_else(|| output_file.clone());
            DepFile { path: dep_file_path(&output_file), rule }
        });

        let job = Job {
            cmdline: cmdline.to_vec(),
            src_file: input_file.clone(),
            output_file,
            dep_file,
        };
        Ok(Invocation { jobs: vec![job], job_count: 1 })
    }

    fn manifest_hash(
        &self,
        env: &Environment,
        compiler: &Path,
        cmdline: &[String],
        src_file: &Path,
    ) -> Result<String> {
        let compiler_hash = hash::compiler_hash(compiler)?;
        let (options, input_files) = self.analyzer.parse(cmdline).map_err(CacheError::msg)?;
        let inputs: Vec<PathBuf> = input_files.into_iter().take(1).collect();

        let canon_cmd = super::canonicalized_cmdline(
            env,
            self.analyzer.args_to_unify_and_sort(),
            &options,
            &inputs,
        );

        let toolset_data =
            format!("{compiler_hash}|{canon_cmd:?}|{}", manifest::MOC_FORMAT_VERSION);
        trace!("toolset hash data: {toolset_data}");
        env.file_hash(src_file, Some(&toolset_data))
    }

    fn inject_include_dump(&self, cmdline: &mut Vec<String>) -> bool {
        if cmdline.iter().any(|arg| arg == "--output-dep-file") {
            return false;
        }
        cmdline.insert(0, "--output-dep-file".to_string());
        true
    }

    fn extract_includes(
        &self,
        _env: &Environment,
        result: &CompilerResult,
        job: &Job,
        strip: bool,
    ) -> Result<(Vec<PathBuf>, String)> {
        let dep_path = dep_file_path(&job.output_file);
        let includes = parse_dep_file(&dep_path)?;
        if strip {
            // the caller did not ask for the dep file, so it must not remain
            let _ = fs::remove_file(&dep_path);
        }
        Ok((includes, result.stdout.clone()))
    }

    fn canonicalize_streams(
        &self,
        _env: &Environment,
        stdout: &str,
        stderr: &str,
    ) -> (String, String) {
        (stdout.to_string(), stderr.to_string())
    }

    fn expand_streams(&self, _env: &Environment, stdout: &str, stderr: &str) -> (String, String) {
        (stdout.to_string(), stderr.to_string())
    }

    fn store_filter(
        &self,
        env: &Arc<Environment>,
        job: &Job,
    ) -> Option<crate::artifacts::CopyFilter> {
        let env = Arc::clone(env);
        let output_dir = output_dir_of(&job.output_file);
        Some(Box::new(move |bytes| canonicalize_payload(&env, bytes, &output_dir)))
    }

    fn fetch_filter(
        &self,
        env: &Arc<Environment>,
        job: &Job,
    ) -> Option<crate::artifacts::CopyFilter> {
        let env = Arc::clone(env);
        let output_dir = output_dir_of(&job.output_file);
        Some(Box::new(move |bytes| expand_payload(&env, bytes, &output_dir)))
    }

    fn after_hit(&self, env: &Environment, job: &Job, entry: &ManifestEntry) -> Result<()> {
        let Some(dep_file) = &job.dep_file else { return Ok(()) };
        utils::safe_unlink(&dep_file.path)?;
        create_dep_file(env, &dep_file.path, &dep_file.rule, &entry.include_files)
    }
}

fn output_dir_of(output_file: &Path) -> PathBuf {
    match output_file.parent() {
        Some(parent) if parent.as_os_str().is_empty() => PathBuf::from("."),
        Some(parent) => parent.to_path_buf(),
        None => PathBuf::from("."),
    }
}

fn dep_file_path(output_file: &Path) -> PathBuf {
    let mut name = output_file.file_name().unwrap_or_default().to_os_string();
    name.push(".d");
    output_file.with_file_name(name)
}

/// Parses a Makefile-style dependency file into the list of included files.
fn parse_dep_file(path: &Path) -> Result<Vec<PathBuf>> {
    let buf = fs::read_to_string(path).map_err(|err| CacheError::io(err, path))?;

    // skip the rule target, minding drive letters that also carry a colon
    let Some(target) = RE_DEP_TARGET.captures(&buf).and_then(|caps| caps.get(1)) else {
        return Ok(Vec::new());
    };
    let rest = &buf[(target.end() + 1).min(buf.len())..];
    let joined = RE_DEP_CONTINUATION.replace_all(rest, "");

    Ok(split_unescaped_whitespace(&joined)
        .into_iter()
        .map(|entry| {
            let cleaned = entry.replace('\\', "");
            utils::absolute_path(&utils::normalize_path(Path::new(cleaned.trim())))
        })
        .collect())
}

/// Splits at whitespace not preceded by a backslash (escaped spaces belong to
/// the path).
fn split_unescaped_whitespace(s: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut prev_backslash = false;
    for c in s.chars() {
        if c.is_whitespace() && !prev_backslash {
            if !current.is_empty() {
                out.push(std::mem::take(&mut current));
            }
        } else {
            current.push(c);
        }
        prev_backslash = c == '\\';
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

/// Regenerates the dependency file from a manifest entry's include list.
fn create_dep_file(
    env: &Environment,
    path: &Path,
    rule: &Path,
    includes: &[CanonPath],
) -> Result<()> {
    let escape = |p: &Path| p.to_slash_lossy().replace('\\', "\\\\").replace(' ', "\\ ");

    let mut content = format!("{}:", escape(rule));
    for include in includes {
        let expanded = env.expand_path(include.as_str())?;
        content.push_str(&format!(" \\\n  {}", escape(&expanded)));
    }
    content.push('\n');
    fs::write(path, content).map_err(|err| CacheError::io(err, path))
}

/// Canonicalizes the include statements in generated moc output before it is
/// stored.
fn canonicalize_payload(env: &Environment, bytes: &[u8], output_dir: &Path) -> Vec<u8> {
    rewrite_payload_lines(bytes, |content| {
        let m = RE_MOC_INCLUDE.captures(content)?.get(1)?;
        let path_str = std::str::from_utf8(&content[m.start()..m.end()]).ok()?;
        let include_path = Path::new(path_str);
        let absolute = if include_path.is_absolute() {
            include_path.to_path_buf()
        } else {
            output_dir.join(include_path)
        };
        let resolved = utils::resolve(&utils::absolute_path(&absolute));
        let canon = env.canonicalize_path(&resolved);
        let mut line = content[..m.start()].to_vec();
        line.extend_from_slice(canon.as_str().as_bytes());
        line.extend_from_slice(&content[m.end()..]);
        Some(line)
    })
}

/// Expands the stored include statements back into paths relative to the
/// output directory while the artifact is copied out.
fn expand_payload(env: &Environment, bytes: &[u8], output_dir: &Path) -> Vec<u8> {
    rewrite_payload_lines(bytes, |content| {
        let m = RE_MOC_INCLUDE.captures(content)?.get(1)?;
        let path_str = std::str::from_utf8(&content[m.start()..m.end()]).ok()?;
        let expanded = env.expand_path(path_str).ok()?;
        let expanded = utils::resolve(&expanded);
        let rendered = match relative_path(&utils::absolute_path(output_dir), &expanded) {
            Some(relative) => relative,
            None => expanded,
        };
        let mut line = content[..m.start()].to_vec();
        line.extend_from_slice(rendered.to_slash_lossy().as_bytes());
        line.extend_from_slice(&content[m.end()..]);
        Some(line)
    })
}

/// Applies `rewrite` to every line above the moc namespace marker, keeping
/// line terminators intact.
fn rewrite_payload_lines(
    bytes: &[u8],
    mut rewrite: impl FnMut(&[u8]) -> Option<Vec<u8>>,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len());
    let mut rewriting = true;
    for line in bytes.split_inclusive(|b| *b == b'\n') {
        let (content, terminator) = match line.last() {
            Some(b'\n') => line.split_at(line.len() - 1),
            _ => (line, &b""[..]),
        };
        let content_trimmed =
            content.strip_suffix(b"\r").unwrap_or(content);
        if rewriting && content_trimmed == MOC_NAMESPACE_MARKER {
            rewriting = false;
        }
        if rewriting {
            if let Some(rewritten) = rewrite(content) {
                out.extend_from_slice(&rewritten);
                out.extend_from_slice(terminator);
                continue;
            }
        }
        out.extend_from_slice(line);
    }
    out
}

/// `to` relative to the directory `from`, stepping up with `..` as needed.
fn relative_path(from: &Path, to: &Path) -> Option<PathBuf> {
    let mut from_components = from.components().peekable();
    let mut to_components = to.components().peekable();

    // different prefixes (drives) cannot be related
    if let (Some(Component::Prefix(a)), Some(Component::Prefix(b))) =
        (from_components.peek(), to_components.peek())
    {
        if a != b {
            return None;
        }
    }

    while let (Some(a), Some(b)) = (from_components.peek(), to_components.peek()) {
        if a != b {
            break;
        }
        from_components.next();
        to_components.next();
    }

    let mut out = PathBuf::new();
    for _ in from_components {
        out.push("..");
    }
    for component in to_components {
        out.push(component.as_os_str());
    }
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn cmdline(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    fn test_env(dir: &Path) -> Environment {
        Environment::new(
            dir.join("cache"),
            dir.join("build"),
            Some(dir.to_path_buf()),
        )
    }

    #[test]
    fn classifies_moc_invocations() {
        let dir = tempfile::tempdir().unwrap();
        let env = test_env(dir.path());
        let frontend = MocFrontend::new();

        let err = frontend.analyze(&env, &cmdline(&["-o", "out.cpp"])).unwrap_err();
        assert_eq!(err, AnalyzerError::NoSourceFile);

        let err = frontend.analyze(&env, &cmdline(&["-E", "-o", "out.cpp", "a.h"])).unwrap_err();
        assert_eq!(err, AnalyzerError::Preprocessing);

        let err =
            frontend.analyze(&env, &cmdline(&["--output-json", "-o", "o.cpp", "a.h"])).unwrap_err();
        assert_eq!(err, AnalyzerError::JsonOutput);

        let err = frontend.analyze(&env, &cmdline(&["a.h"])).unwrap_err();
        assert_eq!(err, AnalyzerError::NoOutputFile);

        let invocation = frontend
            .analyze(&env, &cmdline(&["--output-dep-file", "-o", "moc_a.cpp", "a.h"]))
            .unwrap();
        let job = &invocation.jobs[0];
        assert_eq!(job.src_file, PathBuf::from("a.h"));
        assert_eq!(job.output_file, PathBuf::from("moc_a.cpp"));
        let dep = job.dep_file.as_ref().unwrap();
        assert_eq!(dep.path, PathBuf::from("moc_a.cpp.d"));
        assert_eq!(dep.rule, PathBuf::from("moc_a.cpp"));
    }

    #[test]
    fn dep_files_parse_with_continuations_and_escapes() {
        let dir = tempfile::tempdir().unwrap();
        let dep = dir.path().join("moc_a.cpp.d");
        fs::write(
            &dep,
            "moc_a.cpp: /src/a.h \\\n  /src/sub\\ dir/b.h \\\n  /src/c.h\n",
        )
        .unwrap();

        let includes = parse_dep_file(&dep).unwrap();
        assert_eq!(
            includes,
            vec![
                PathBuf::from("/src/a.h"),
                PathBuf::from("/src/sub dir/b.h"),
                PathBuf::from("/src/c.h"),
            ]
        );
    }

    #[test]
    fn payload_includes_roundtrip_through_placeholders() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().to_path_buf();
        let out_dir = base.join("build");
        fs::create_dir_all(&out_dir).unwrap();
        fs::write(base.join("widget.h"), "struct W;").unwrap();
        let env = test_env(&base);

        let payload = format!(
            "#include \"{}\"\nQT_BEGIN_MOC_NAMESPACE\n#include \"untouched.h\"\n",
            base.join("widget.h").display()
        );
        let stored = canonicalize_payload(&env, payload.as_bytes(), &out_dir);
        let stored_str = String::from_utf8(stored.clone()).unwrap();
        assert!(stored_str.contains("<BASE_DIR>/widget.h"), "{stored_str}");
        assert!(stored_str.contains("#include \"untouched.h\""), "{stored_str}");

        let fetched = expand_payload(&env, &stored, &out_dir);
        let fetched_str = String::from_utf8(fetched).unwrap();
        assert!(fetched_str.contains("../widget.h"), "{fetched_str}");
    }

    #[test]
    fn dep_file_regeneration_expands_entries() {
        let dir = tempfile::tempdir().unwrap();
        let env = test_env(dir.path());
        let dep_path = dir.path().join("moc_a.cpp.d");

        create_dep_file(
            &env,
            &dep_path,
            Path::new("moc_a.cpp"),
            &[CanonPath::from("<BASE_DIR>/a.h".to_string())],
        )
        .unwrap();

        let content = fs::read_to_string(&dep_path).unwrap();
        assert!(content.starts_with("moc_a.cpp:"), "{content}");
        assert!(content.contains("a.h"), "{content}");
    }

    #[test]
    fn relative_path_steps_up() {
        assert_eq!(
            relative_path(Path::new("/a/b/build"), Path::new("/a/b/src/x.h")),
            Some(PathBuf::from("../src/x.h"))
        );
        assert_eq!(relative_path(Path::new("/a"), Path::new("/a")), Some(PathBuf::from(".")));
    }
}
