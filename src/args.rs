//! Command-line tokenization and option classification.
//!
//! Stage one replays the platform's quoting rules (backslashes only escape a
//! following quote, quoted regions suspend splitting) and expands `@file`
//! response files recursively with BOM-driven encoding detection. Stage two
//! classifies tokens against a declared option table into `name → [values]`
//! plus the list of input files.

use crate::error::{AnalyzerError, CacheError, Result};
use std::{
    collections::BTreeMap,
    fs,
    path::PathBuf,
};

/// Parsed options: canonical option name to the values seen, in order.
/// Valueless options carry an empty string per occurrence.
pub type Options = BTreeMap<String, Vec<String>>;

#[derive(Clone, Copy)]
enum State {
    Initial,
    Unquoted,
    Quoted,
}

/// Splits a command line the way `cl.exe` does.
pub fn split_command_line(content: &str) -> Vec<String> {
    let chars: Vec<char> = content.chars().collect();
    let mut argv = Vec::new();
    let mut token = String::new();
    let mut state = State::Initial;
    let mut pos = 0usize;

    while pos < chars.len() {
        let c = chars[pos];
        state = match state {
            State::Initial => {
                if c.is_whitespace() {
                    State::Initial
                } else if c == '"' {
                    State::Quoted
                } else if c == '\\' {
                    parse_backslashes(&chars, &mut pos, &mut token);
                    State::Unquoted
                } else {
                    token.push(c);
                    State::Unquoted
                }
            }
            State::Unquoted => {
                if c.is_whitespace() {
                    argv.push(std::mem::take(&mut token));
                    State::Initial
                } else if c == '"' {
                    State::Quoted
                } else if c == '\\' {
                    parse_backslashes(&chars, &mut pos, &mut token);
                    State::Unquoted
                } else {
                    token.push(c);
                    State::Unquoted
                }
            }
            State::Quoted => {
                if c == '"' {
                    State::Unquoted
                } else if c == '\\' {
                    parse_backslashes(&chars, &mut pos, &mut token);
                    State::Quoted
                } else {
                    token.push(c);
                    State::Quoted
                }
            }
        };
        pos += 1;
    }
    if !token.is_empty() {
        argv.push(token);
    }
    argv
}

/// A run of backslashes escapes a following quote; otherwise backslashes are
/// ordinary characters.
fn parse_backslashes(chars: &[char], pos: &mut usize, token: &mut String) {
    let mut count = 0;
    while *pos < chars.len() && chars[*pos] == '\\' {
        *pos += 1;
        count += 1;
    }
    let followed_by_quote = *pos < chars.len() && chars[*pos] == '"';
    if followed_by_quote {
        for _ in 0..count / 2 {
            token.push('\\');
        }
        if count % 2 == 0 {
            *pos -= 1;
        } else {
            token.push('"');
        }
    } else {
        for _ in 0..count {
            token.push('\\');
        }
        *pos -= 1;
    }
}

/// Expands `@file` arguments to the contents of the response file,
/// recursively.
pub fn expand_response_files(cmdline: &[String]) -> Result<Vec<String>> {
    let mut ret = Vec::new();
    for arg in cmdline {
        if arg.is_empty() {
            continue;
        }
        if let Some(file) = arg.strip_prefix('@') {
            let raw = fs::read(file).map_err(|err| CacheError::io(err, file))?;
            let content = decode_with_bom(&raw);
            ret.extend(expand_response_files(&split_command_line(content.trim()))?);
        } else {
            ret.push(arg.clone());
        }
    }
    Ok(ret)
}

fn decode_with_bom(raw: &[u8]) -> String {
    if let Some(rest) = raw.strip_prefix(&[0x00, 0x00, 0xFE, 0xFF]) {
        return decode_utf32(rest, u32::from_be_bytes);
    }
    if let Some(rest) = raw.strip_prefix(&[0xFF, 0xFE, 0x00, 0x00]) {
        return decode_utf32(rest, u32::from_le_bytes);
    }
    if let Some(rest) = raw.strip_prefix(&[0xFE, 0xFF]) {
        return decode_utf16(rest, u16::from_be_bytes);
    }
    if let Some(rest) = raw.strip_prefix(&[0xFF, 0xFE]) {
        return decode_utf16(rest, u16::from_le_bytes);
    }
    String::from_utf8_lossy(raw).into_owned()
}

fn decode_utf16(raw: &[u8], from_bytes: fn([u8; 2]) -> u16) -> String {
    let units: Vec<u16> =
        raw.chunks_exact(2).map(|pair| from_bytes([pair[0], pair[1]])).collect();
    char::decode_utf16(units.into_iter())
        .map(|c| c.unwrap_or(char::REPLACEMENT_CHARACTER))
        .collect()
}

fn decode_utf32(raw: &[u8], from_bytes: fn([u8; 4]) -> u32) -> String {
    raw.chunks_exact(4)
        .map(|quad| {
            char::from_u32(from_bytes([quad[0], quad[1], quad[2], quad[3]]))
                .unwrap_or(char::REPLACEMENT_CHARACTER)
        })
        .collect()
}

/// How an option's value is attached to its name.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OptionKind {
    /// `/NAMEparameter`: glued, must not be empty.
    GluedRequired,
    /// `/NAME[parameter]`: glued, may be empty.
    GluedOptional,
    /// `/NAME[ ]parameter`: glued or a separate token.
    GluedOrSeparate,
    /// `/NAME parameter`: always a separate token.
    Separate,
    /// `-name` / `--name` flag without value (moc style).
    QtFlag,
    /// `-name[= ]value` / `--name[= ]value` (moc style).
    QtParam,
}

/// One row of the option table.
#[derive(Clone, Debug)]
pub struct OptSpec {
    pub name: &'static str,
    pub kind: OptionKind,
    /// Canonical option this one aliases, e.g. `imsvc` → `I`.
    pub mapped: Option<&'static str>,
    /// The value names an environment variable whose `;`-separated entries
    /// are the real values (`/external:env:`).
    pub expand_env: bool,
    /// Expects a `--` prefix (moc long options).
    pub long: bool,
}

impl OptSpec {
    pub fn new(name: &'static str, kind: OptionKind) -> Self {
        Self { name, kind, mapped: None, expand_env: false, long: false }
    }

    pub fn glued_required(name: &'static str) -> Self {
        Self::new(name, OptionKind::GluedRequired)
    }

    pub fn glued_optional(name: &'static str) -> Self {
        Self::new(name, OptionKind::GluedOptional)
    }

    pub fn glued_or_separate(name: &'static str) -> Self {
        Self::new(name, OptionKind::GluedOrSeparate)
    }

    pub fn separate(name: &'static str) -> Self {
        Self::new(name, OptionKind::Separate)
    }

    pub fn qt_flag(name: &'static str) -> Self {
        Self::new(name, OptionKind::QtFlag)
    }

    pub fn qt_flag_long(name: &'static str) -> Self {
        let mut spec = Self::new(name, OptionKind::QtFlag);
        spec.long = true;
        spec
    }

    pub fn qt_param(name: &'static str) -> Self {
        Self::new(name, OptionKind::QtParam)
    }

    pub fn qt_param_long(name: &'static str) -> Self {
        let mut spec = Self::new(name, OptionKind::QtParam);
        spec.long = true;
        spec
    }

    pub fn aliased(mut self, mapped: &'static str) -> Self {
        self.mapped = Some(mapped);
        self
    }

    pub fn env_values(mut self) -> Self {
        self.expand_env = true;
        self
    }
}

/// Classifies tokens against an option table.
#[derive(Debug)]
pub struct CommandLineAnalyzer {
    /// Sorted by name length, longest first, so `external:I` wins over `I`.
    specs: Vec<OptSpec>,
    unify_and_sort: BTreeMap<&'static str, bool>,
}

impl CommandLineAnalyzer {
    pub fn new(mut specs: Vec<OptSpec>, unify_and_sort: &[(&'static str, bool)]) -> Self {
        specs.sort_by(|a, b| b.name.len().cmp(&a.name.len()));
        Self { specs, unify_and_sort: unify_and_sort.iter().copied().collect() }
    }

    /// Option names whose values participate in the manifest hash sorted;
    /// `true` marks path-valued options that are canonicalized as well.
    pub fn args_to_unify_and_sort(&self) -> &BTreeMap<&'static str, bool> {
        &self.unify_and_sort
    }

    fn find_spec<'a>(&'a self, arg: &str) -> Option<(&'a OptSpec, usize)> {
        for spec in &self.specs {
            let offset = if spec.long {
                if !arg.starts_with("--") {
                    continue;
                }
                2
            } else {
                1
            };
            if arg.len() > offset && arg[offset..].starts_with(spec.name) {
                return Some((spec, offset + spec.name.len()));
            }
        }
        None
    }

    /// Parses the command line into options and input files.
    pub fn parse(
        &self,
        cmdline: &[String],
    ) -> Result<(Options, Vec<PathBuf>), AnalyzerError> {
        let mut options = Options::new();
        let mut input_files = Vec::new();

        let mut i = 0;
        while i < cmdline.len() {
            let arg = &cmdline[i];
            if arg.starts_with('/') || arg.starts_with('-') {
                match self.find_spec(arg) {
                    Some((spec, value_start)) => {
                        let glued = &arg[value_start..];
                        let value = match spec.kind {
                            OptionKind::QtFlag => String::new(),
                            OptionKind::QtParam => {
                                if glued.is_empty() {
                                    i += 1;
                                    next_token(cmdline, i, spec.name)?
                                } else if glued.starts_with(['=', ' ', '\t']) {
                                    glued[1..].to_string()
                                } else {
                                    glued.to_string()
                                }
                            }
                            OptionKind::GluedRequired => {
                                if glued.is_empty() {
                                    return Err(AnalyzerError::InvalidArgument(format!(
                                        "parameter for /{} must not be empty",
                                        spec.name
                                    )));
                                }
                                glued.to_string()
                            }
                            OptionKind::GluedOptional => glued.to_string(),
                            OptionKind::GluedOrSeparate => {
                                if glued.is_empty() {
                                    i += 1;
                                    next_token(cmdline, i, spec.name)?
                                } else if glued.starts_with([' ', '\t']) {
                                    glued[1..].to_string()
                                } else {
                                    glued.to_string()
                                }
                            }
                            OptionKind::Separate => {
                                i += 1;
                                next_token(cmdline, i, spec.name)?
                            }
                        };

                        let name = spec.mapped.unwrap_or(spec.name);
                        let values = options.entry(name.to_string()).or_default();
                        if spec.expand_env {
                            let expanded = std::env::var(&value).unwrap_or_default();
                            values.extend(expanded.split(';').map(str::to_string));
                        } else {
                            values.push(value);
                        }
                    }
                    None => {
                        // a flag we do not model; recorded by bare name
                        options.entry(arg[1..].to_string()).or_default().push(String::new());
                    }
                }
            } else if arg.starts_with('@') {
                return Err(AnalyzerError::InvalidArgument(
                    "unexpanded response file argument".to_string(),
                ));
            } else {
                input_files.push(PathBuf::from(arg));
            }
            i += 1;
        }

        Ok((options, input_files))
    }
}

fn next_token(cmdline: &[String], i: usize, name: &str) -> Result<String, AnalyzerError> {
    cmdline
        .get(i)
        .cloned()
        .ok_or_else(|| AnalyzerError::InvalidArgument(format!("missing parameter for /{name}")))
}

/// Prepends the `CL` and appends the `_CL_` environment variables to the
/// command line, matching the compiler's own convention, and returns the
/// environment to run the compiler with (without those variables).
pub fn extend_cmdline_from_env(cmdline: Vec<String>) -> (Vec<String>, Vec<(String, String)>) {
    let mut env: Vec<(String, String)> = Vec::new();
    let mut prefix = None;
    let mut postfix = None;
    for (key, value) in std::env::vars() {
        match key.as_str() {
            "CL" => prefix = Some(value),
            "_CL_" => postfix = Some(value),
            _ => env.push((key, value)),
        }
    }

    let mut extended = Vec::new();
    if let Some(prefix) = prefix {
        extended.extend(split_command_line(prefix.trim()));
    }
    extended.extend(cmdline);
    if let Some(postfix) = postfix {
        extended.extend(split_command_line(postfix.trim()));
    }
    (extended, env)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn split(s: &str) -> Vec<String> {
        split_command_line(s)
    }

    #[test]
    fn splits_on_whitespace() {
        assert_eq!(split("/c  foo.cpp\tbar.cpp"), vec!["/c", "foo.cpp", "bar.cpp"]);
    }

    #[test]
    fn quotes_suspend_splitting() {
        assert_eq!(split(r#""a b" c"#), vec!["a b", "c"]);
        // an escaped quote does not end the quoted region
        assert_eq!(split(r#"/Fo"out dir\" a""#), vec![r#"/Foout dir" a"#]);
    }

    #[test]
    fn backslashes_only_escape_quotes() {
        assert_eq!(split(r"C:\foo\bar.cpp"), vec![r"C:\foo\bar.cpp"]);
        assert_eq!(split(r#"a\"b"#), vec![r#"a"b"#]);
        assert_eq!(split(r#"a\\"b c""#), vec![r"a\b c"]);
    }

    #[test]
    fn response_files_expand_recursively_with_bom() {
        let dir = tempfile::tempdir().unwrap();
        let inner = dir.path().join("inner.rsp");
        // UTF-16 LE with BOM
        let mut utf16: Vec<u8> = vec![0xFF, 0xFE];
        for unit in "/O2 /c".encode_utf16() {
            utf16.extend_from_slice(&unit.to_le_bytes());
        }
        std::fs::write(&inner, utf16).unwrap();

        let outer = dir.path().join("outer.rsp");
        std::fs::write(&outer, format!("@{} foo.cpp", inner.display())).unwrap();

        let expanded =
            expand_response_files(&[format!("@{}", outer.display())]).unwrap();
        assert_eq!(expanded, vec!["/O2", "/c", "foo.cpp"]);
    }

    fn analyzer() -> CommandLineAnalyzer {
        CommandLineAnalyzer::new(
            vec![
                OptSpec::glued_required("Ob"),
                OptSpec::glued_optional("Fo"),
                OptSpec::glued_or_separate("I"),
                OptSpec::glued_or_separate("imsvc").aliased("I"),
                OptSpec::glued_or_separate("external:I").aliased("I"),
                OptSpec::separate("Xclang"),
            ],
            &[("I", true)],
        )
    }

    #[test]
    fn classifies_option_shapes() {
        let cmdline: Vec<String> =
            ["/Ob2", "/Foout\\", "/I", "inc", "/Iinc2", "/Xclang", "-fno-x", "/c", "main.cpp"]
                .iter()
                .map(|s| s.to_string())
                .collect();
        let (options, inputs) = analyzer().parse(&cmdline).unwrap();

        assert_eq!(options["Ob"], vec!["2"]);
        assert_eq!(options["Fo"], vec!["out\\"]);
        assert_eq!(options["I"], vec!["inc", "inc2"]);
        assert_eq!(options["Xclang"], vec!["-fno-x"]);
        assert_eq!(options["c"], vec![""]);
        assert_eq!(inputs, vec![PathBuf::from("main.cpp")]);
    }

    #[test]
    fn aliases_collapse_into_canonical_name() {
        let cmdline: Vec<String> = ["/imsvc", "sys", "/external:Iext", "/Imy"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let (options, _) = analyzer().parse(&cmdline).unwrap();
        assert_eq!(options["I"], vec!["sys", "ext", "my"]);
    }

    #[test]
    fn empty_required_parameter_is_invalid() {
        let cmdline = vec!["/Ob".to_string()];
        let err = analyzer().parse(&cmdline).unwrap_err();
        assert!(matches!(err, AnalyzerError::InvalidArgument(_)));
    }

    #[test]
    fn qt_long_options_take_equals_or_separate_values() {
        let analyzer = CommandLineAnalyzer::new(
            vec![
                OptSpec::qt_param("o"),
                OptSpec::qt_param_long("dep-file-path"),
                OptSpec::qt_flag_long("output-dep-file"),
            ],
            &[],
        );
        let cmdline: Vec<String> =
            ["--output-dep-file", "--dep-file-path=x.d", "-o", "moc_a.cpp", "a.h"]
                .iter()
                .map(|s| s.to_string())
                .collect();
        let (options, inputs) = analyzer.parse(&cmdline).unwrap();
        assert_eq!(options["output-dep-file"], vec![""]);
        assert_eq!(options["dep-file-path"], vec!["x.d"]);
        assert_eq!(options["o"], vec!["moc_a.cpp"]);
        assert_eq!(inputs, vec![PathBuf::from("a.h")]);
    }
}
