//! End-to-end engine scenarios against stub compilers.
//!
//! The stubs replay the observable behavior the engine relies on: cl prints
//! `Note: including file:` lines for every header named in a `<src>.inc`
//! control file, moc writes a generated file with an embedded include plus a
//! dependency file. Every real invocation appends to a calls file, so the
//! tests can count how often the stub actually ran.

#![cfg(unix)]

use clcache::{
    compilers::{frontend_for, CompilerFrontend},
    process_compile_request, Cache, Environment,
};
use pretty_assertions::assert_eq;
use std::{
    fs,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    sync::Arc,
};

struct TestBuild {
    #[allow(dead_code)]
    root: tempfile::TempDir,
    base_dir: PathBuf,
    build_dir: PathBuf,
    compiler: PathBuf,
    calls_file: PathBuf,
    env: Arc<Environment>,
    cache: Cache,
    frontend: Box<dyn CompilerFrontend>,
}

impl TestBuild {
    fn new_cl() -> Self {
        Self::with_stub("cl.exe", CL_STUB)
    }

    fn new_moc() -> Self {
        Self::with_stub("moc.exe", MOC_STUB)
    }

    fn with_stub(compiler_name: &str, stub: &str) -> Self {
        let root = tempfile::tempdir().unwrap();
        let base_dir = root.path().join("src");
        let build_dir = root.path().join("build");
        fs::create_dir_all(&base_dir).unwrap();
        fs::create_dir_all(&build_dir).unwrap();

        let calls_file = root.path().join("calls.log");
        let compiler = root.path().join(compiler_name);
        fs::write(&compiler, stub.replace("@CALLS@", &calls_file.display().to_string()))
            .unwrap();
        fs::set_permissions(&compiler, fs::Permissions::from_mode(0o755)).unwrap();

        let cache_dir = root.path().join("cache");
        let env = Arc::new(Environment::new(
            cache_dir.clone(),
            build_dir.clone(),
            Some(base_dir.clone()),
        ));
        let cache = Cache::new(&cache_dir).unwrap();
        let frontend = frontend_for(&compiler);

        Self { root, base_dir, build_dir, compiler, calls_file, env, cache, frontend }
    }

    /// Each compile models one wrapper process: a fresh environment with
    /// empty memo caches, the way production spawns the wrapper per
    /// invocation. The cache itself is shared.
    fn fresh_env(&self) -> Arc<Environment> {
        Arc::new(Environment::new(
            self.env.cache_dir.clone(),
            self.build_dir.clone(),
            Some(self.base_dir.clone()),
        ))
    }

    fn compile(&self, args: &[String]) -> i32 {
        process_compile_request(
            &self.cache,
            &self.fresh_env(),
            self.frontend.as_ref(),
            &self.compiler,
            args,
        )
    }

    fn real_invocations(&self) -> usize {
        fs::read_to_string(&self.calls_file).map(|s| s.lines().count()).unwrap_or(0)
    }

    fn counter(&self, key: &str) -> i64 {
        self.cache.stats.snapshot().get(key).copied().unwrap_or(0)
    }

    fn object_count(&self) -> usize {
        self.cache.artifacts.sections().iter().map(|s| s.entries().len()).sum()
    }
}

const CL_STUB: &str = r#"#!/bin/sh
obj=""
src=""
for arg in "$@"; do
  case "$arg" in
    /Fo*) obj="${arg#/Fo}" ;;
    /*) ;;
    *) src="$arg" ;;
  esac
done
echo "run" >> "@CALLS@"
echo "$(basename "$src")"
rm -f "$obj.tmp"
if [ -f "$src.inc" ]; then
  while IFS= read -r header; do
    echo "Note: including file: $header"
    cat "$header" >> "$obj.tmp"
  done < "$src.inc"
fi
cat "$src" >> "$obj.tmp"
mv "$obj.tmp" "$obj"
echo "stub stderr output" 1>&2
exit 0
"#;

const MOC_STUB: &str = r#"#!/bin/sh
dep=0
out=""
src=""
prev=""
for arg in "$@"; do
  if [ "$prev" = "-o" ]; then out="$arg"; prev=""; continue; fi
  case "$arg" in
    --output-dep-file) dep=1 ;;
    -o) prev="-o" ;;
    -*) ;;
    *) src="$arg" ;;
  esac
done
echo "run" >> "@CALLS@"
header="$(head -n 1 "$src.dep")"
printf '#include "%s"\nQT_BEGIN_MOC_NAMESPACE\nint moc_data;\n' "$header" > "$out"
if [ "$dep" = "1" ]; then
  printf '%s: %s\n' "$out" "$header" > "$out.d"
fi
exit 0
"#;

fn write_source(build: &TestBuild, name: &str, content: &str, headers: &[&Path]) -> PathBuf {
    let src = build.base_dir.join(name);
    fs::write(&src, content).unwrap();
    if !headers.is_empty() {
        let inc_list =
            headers.iter().map(|h| h.display().to_string()).collect::<Vec<_>>().join("\n");
        fs::write(build.base_dir.join(format!("{name}.inc")), format!("{inc_list}\n")).unwrap();
    }
    src
}

/// Positional compiler arguments must not start with `/` or they read as
/// options; sources are passed relative to the test process working
/// directory instead.
fn rel(path: &Path) -> PathBuf {
    let cwd = std::env::current_dir().unwrap();
    let mut cwd_components = cwd.components().peekable();
    let mut path_components = path.components().peekable();
    while let (Some(a), Some(b)) = (cwd_components.peek(), path_components.peek()) {
        if a != b {
            break;
        }
        cwd_components.next();
        path_components.next();
    }
    let mut out = PathBuf::new();
    for _ in cwd_components {
        out.push("..");
    }
    for component in path_components {
        out.push(component.as_os_str());
    }
    out
}

fn cl_args(src: &Path, obj: &Path) -> Vec<String> {
    vec![
        "/c".to_string(),
        format!("/Fo{}", obj.display()),
        rel(src).display().to_string(),
    ]
}

#[test]
fn cold_compile_then_clean_hit() {
    let build = TestBuild::new_cl();
    let header = build.base_dir.join("a.h");
    fs::write(&header, "struct A;\n").unwrap();
    let src = write_source(&build, "a.cpp", "int a;\n", &[&header]);
    let obj = build.build_dir.join("a.obj");

    assert_eq!(build.compile(&cl_args(&src, &obj)), 0);
    assert_eq!(build.real_invocations(), 1);
    assert_eq!(build.counter("SourceChangedMisses"), 1);
    assert_eq!(build.counter("CacheHits"), 0);
    assert_eq!(build.object_count(), 1);
    let first_obj = fs::read(&obj).unwrap();

    // identical inputs: served from cache, object byte-identical
    assert_eq!(build.compile(&cl_args(&src, &obj)), 0);
    assert_eq!(build.real_invocations(), 1);
    assert_eq!(build.counter("CacheHits"), 1);
    assert_eq!(build.counter("SourceChangedMisses"), 1);
    assert_eq!(fs::read(&obj).unwrap(), first_obj);
}

#[test]
fn header_edit_is_a_header_changed_miss() {
    let build = TestBuild::new_cl();
    let header = build.base_dir.join("bar.h");
    fs::write(&header, "int bar = 1;\n").unwrap();
    let src = write_source(&build, "foo.cpp", "int foo;\n", &[&header]);
    let obj = build.build_dir.join("foo.obj");

    assert_eq!(build.compile(&cl_args(&src, &obj)), 0);
    assert_eq!(build.counter("SourceChangedMisses"), 1);

    fs::write(&header, "int bar = 2;\n").unwrap();
    assert_eq!(build.compile(&cl_args(&src, &obj)), 0);
    assert_eq!(build.real_invocations(), 2);
    assert_eq!(build.counter("HeaderChangedMisses"), 1);
    assert_eq!(build.object_count(), 2);

    // the manifest accumulated both header states under one hash
    let manifest_hash = build
        .frontend
        .manifest_hash(&build.env, &build.compiler, &cl_args(&src, &obj), &src)
        .unwrap();
    let (manifest, _) = build.cache.get_manifest(&manifest_hash).unwrap();
    assert_eq!(manifest.entries().len(), 2);

    // reverting the header hits the older entry and moves it back to the head
    fs::write(&header, "int bar = 1;\n").unwrap();
    assert_eq!(build.compile(&cl_args(&src, &obj)), 0);
    assert_eq!(build.real_invocations(), 2);
    assert_eq!(build.counter("CacheHits"), 1);
    let (manifest_after, _) = build.cache.get_manifest(&manifest_hash).unwrap();
    assert_eq!(manifest_after.entries().len(), 2);
    assert_ne!(
        manifest_after.entries()[0].object_hash,
        manifest.entries()[0].object_hash
    );
}

#[test]
fn zi_invocations_bypass_the_cache() {
    let build = TestBuild::new_cl();
    let src = write_source(&build, "dbg.cpp", "int dbg;\n", &[]);
    let obj = build.build_dir.join("dbg.obj");

    let mut args = cl_args(&src, &obj);
    args.insert(1, "/Zi".to_string());
    assert_eq!(build.compile(&args), 0);

    assert_eq!(build.real_invocations(), 1);
    assert_eq!(build.counter("CallsForExternalDebugInfo"), 1);
    assert_eq!(build.object_count(), 0);
}

#[test]
fn evicted_artifact_is_repaired_without_a_new_manifest_entry() {
    let build = TestBuild::new_cl();
    let header = build.base_dir.join("r.h");
    fs::write(&header, "int r;\n").unwrap();
    let src = write_source(&build, "r.cpp", "int rr;\n", &[&header]);
    let obj = build.build_dir.join("r.obj");

    assert_eq!(build.compile(&cl_args(&src, &obj)), 0);
    let manifest_hash = build
        .frontend
        .manifest_hash(&build.env, &build.compiler, &cl_args(&src, &obj), &src)
        .unwrap();
    let (manifest, _) = build.cache.get_manifest(&manifest_hash).unwrap();
    let key = manifest.entries()[0].object_hash.clone();

    // simulate eviction of the artifact while the manifest row survives
    build.cache.artifacts.remove_entry(&key);
    assert!(!build.cache.has_entry(&key));

    assert_eq!(build.compile(&cl_args(&src, &obj)), 0);
    assert_eq!(build.real_invocations(), 2);
    assert!(build.cache.has_entry(&key));
    let (manifest_after, _) = build.cache.get_manifest(&manifest_hash).unwrap();
    assert_eq!(manifest_after.entries().len(), 1);

    // and the repaired artifact serves hits again
    assert_eq!(build.compile(&cl_args(&src, &obj)), 0);
    assert_eq!(build.real_invocations(), 2);
    assert_eq!(build.counter("CacheHits"), 1);
}

#[test]
fn concurrent_identical_compiles_run_the_compiler_once() {
    let build = Arc::new(TestBuild::new_cl());
    let header = build.base_dir.join("p.h");
    fs::write(&header, "int p;\n").unwrap();
    let src = write_source(&build, "p.cpp", "int pp;\n", &[&header]);
    let obj = build.build_dir.join("p.obj");
    let args = cl_args(&src, &obj);

    std::thread::scope(|scope| {
        for _ in 0..4 {
            let build = Arc::clone(&build);
            let args = args.clone();
            scope.spawn(move || {
                assert_eq!(build.compile(&args), 0);
            });
        }
    });

    assert_eq!(build.real_invocations(), 1);
    assert_eq!(build.counter("CacheHits"), 3);
    assert_eq!(build.object_count(), 1);
}

#[test]
fn moc_output_is_cached_and_relocated() {
    let build = TestBuild::new_moc();
    let header = build.base_dir.join("widget.h");
    fs::write(&header, "struct W;\n").unwrap();
    let src = build.base_dir.join("widget.h");
    fs::write(build.base_dir.join("widget.h.dep"), format!("{}\n", header.display()))
        .unwrap();

    let out = build.build_dir.join("moc_widget.cpp");
    let args =
        vec!["-o".to_string(), out.display().to_string(), rel(&src).display().to_string()];

    assert_eq!(build.compile(&args), 0);
    assert_eq!(build.real_invocations(), 1);
    assert_eq!(build.counter("SourceChangedMisses"), 1);
    // the injected dep file must not survive, the user did not ask for it
    assert!(!build.build_dir.join("moc_widget.cpp.d").exists());

    // the stored payload refers to the header through a placeholder
    let key = {
        let manifest_hash = build
            .frontend
            .manifest_hash(&build.env, &build.compiler, &args, &src)
            .unwrap();
        let (manifest, _) = build.cache.get_manifest(&manifest_hash).unwrap();
        manifest.entries()[0].object_hash.clone()
    };
    let stored = build.cache.artifacts.section(&key).entry_dir(&key).join("object.lz4");
    assert!(stored.exists());

    fs::remove_file(&out).unwrap();
    assert_eq!(build.compile(&args), 0);
    assert_eq!(build.real_invocations(), 1);
    assert_eq!(build.counter("CacheHits"), 1);

    let regenerated = fs::read_to_string(&out).unwrap();
    // the placeholder is gone and the include resolves on this machine again
    assert!(!regenerated.contains("<BASE_DIR>"), "{regenerated}");
    assert!(regenerated.contains("src/widget.h"), "{regenerated}");
    assert!(regenerated.contains("QT_BEGIN_MOC_NAMESPACE"), "{regenerated}");
}

#[test]
fn moc_dep_file_is_regenerated_on_hit() {
    let build = TestBuild::new_moc();
    let header = build.base_dir.join("obj.h");
    fs::write(&header, "struct O;\n").unwrap();
    fs::write(build.base_dir.join("obj.h.dep"), format!("{}\n", header.display())).unwrap();

    let out = build.build_dir.join("moc_obj.cpp");
    let args = vec![
        "--output-dep-file".to_string(),
        "-o".to_string(),
        out.display().to_string(),
        rel(&build.base_dir.join("obj.h")).display().to_string(),
    ];

    assert_eq!(build.compile(&args), 0);
    let dep_path = build.build_dir.join("moc_obj.cpp.d");
    assert!(dep_path.exists());
    fs::remove_file(&dep_path).unwrap();

    assert_eq!(build.compile(&args), 0);
    assert_eq!(build.counter("CacheHits"), 1);
    let dep = fs::read_to_string(&dep_path).unwrap();
    assert!(dep.contains("obj.h"), "{dep}");
}

#[test]
fn parallel_sources_compile_through_one_invocation() {
    let build = TestBuild::new_cl();
    let a = write_source(&build, "one.cpp", "int one;\n", &[]);
    let b = write_source(&build, "two.cpp", "int two;\n", &[]);

    let args = vec![
        "/MP2".to_string(),
        "/c".to_string(),
        format!("/Fo{}/", build.build_dir.display()),
        rel(&a).display().to_string(),
        rel(&b).display().to_string(),
    ];
    assert_eq!(build.compile(&args), 0);
    assert_eq!(build.real_invocations(), 2);
    assert_eq!(build.object_count(), 2);
    // inputs given with a directory keep that directory for the object file
    assert!(build.base_dir.join("one.obj").exists());
    assert!(build.base_dir.join("two.obj").exists());

    // the whole batch hits on the second run
    assert_eq!(build.compile(&args), 0);
    assert_eq!(build.real_invocations(), 2);
    assert_eq!(build.counter("CacheHits"), 2);
}
