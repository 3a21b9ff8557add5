//! The cache engine: manifest lookup, compiler invocation, single-flight and
//! commit.

use crate::{
    args,
    cache::{ensure_artifacts_exist, Cache},
    compilers::{capture_compiler, forward_compiler, CompilerFrontend, Invocation, Job},
    error::{CacheError, Result},
    hash,
    manifest::{create_manifest_entry, Manifest},
    stats::MissReason,
    utils, Environment,
};
use std::{
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc,
    },
};

/// Processes one compile request end to end and returns the exit code to
/// forward to the caller.
pub fn process_compile_request(
    cache: &Cache,
    env: &Arc<Environment>,
    frontend: &dyn CompilerFrontend,
    compiler: &Path,
    args_in: &[String],
) -> i32 {
    debug!("command line: '{}'", args_in.join(" "));
    env.set_llvm_dir(compiler);

    let (cmdline, child_env) = args::extend_cmdline_from_env(args_in.to_vec());

    let expanded = match args::expand_response_files(&cmdline) {
        Ok(expanded) => expanded,
        Err(err) => {
            warn!("failed to expand response files: {err}");
            cache.stats.record_cache_miss(MissReason::CacheFailure);
            return forward_or_fail(compiler, args_in, &child_env);
        }
    };
    trace!("expanded command line: '{}'", expanded.join(" "));

    match frontend.analyze(env, &expanded) {
        Ok(invocation) => schedule_jobs(cache, env, frontend, compiler, invocation, &child_env),
        Err(err) => {
            debug!("cannot cache invocation: {err}");
            cache.stats.record_cache_miss((&err).into());
            forward_or_fail(compiler, args_in, &child_env)
        }
    }
}

fn forward_or_fail(compiler: &Path, args: &[String], env_vars: &[(String, String)]) -> i32 {
    forward_compiler(compiler, args, env_vars).unwrap_or_else(|err| {
        error!("failed to run compiler \"{}\": {err}", compiler.display());
        1
    })
}

/// Runs the jobs of one invocation, bounded by its `/MP` job count. An error
/// in one source stops scheduling of queued sources but lets running ones
/// finish.
fn schedule_jobs(
    cache: &Cache,
    env: &Arc<Environment>,
    frontend: &dyn CompilerFrontend,
    compiler: &Path,
    invocation: Invocation,
    child_env: &[(String, String)],
) -> i32 {
    let Invocation { jobs, job_count } = invocation;

    if jobs.len() == 1 || job_count <= 1 || env.single_file {
        let mut exit_code = 0;
        for job in &jobs {
            let (code, stdout, stderr) =
                process_single_source(cache, env, frontend, compiler, job, child_env);
            debug!("finished \"{}\", exit code {code}", job.src_file.display());
            utils::print_stdout_and_stderr(&stdout, &stderr);
            if code != 0 {
                exit_code = code;
                break;
            }
        }
        return exit_code;
    }

    let pool = match rayon::ThreadPoolBuilder::new()
        .num_threads(job_count.min(jobs.len()))
        .build()
    {
        Ok(pool) => pool,
        Err(err) => {
            warn!("failed to build worker pool: {err}");
            return schedule_jobs(
                cache,
                env,
                frontend,
                compiler,
                Invocation { jobs, job_count: 1 },
                child_env,
            );
        }
    };

    let cancelled = AtomicBool::new(false);
    let (tx, rx) = mpsc::channel();
    let mut exit_code = 0;

    pool.in_place_scope(|scope| {
        for job in &jobs {
            let tx = tx.clone();
            let cancelled = &cancelled;
            scope.spawn(move |_| {
                if cancelled.load(Ordering::SeqCst) {
                    return;
                }
                let result = process_single_source(cache, env, frontend, compiler, job, child_env);
                if result.0 != 0 {
                    cancelled.store(true, Ordering::SeqCst);
                }
                let _ = tx.send((job.src_file.clone(), result));
            });
        }
        drop(tx);

        for (src_file, (code, stdout, stderr)) in rx {
            debug!("finished \"{}\", exit code {code}", src_file.display());
            utils::print_stdout_and_stderr(&stdout, &stderr);
            if code != 0 {
                exit_code = code;
            }
        }
    });
    exit_code
}

/// Processes a single source; any cache error degrades into a plain captured
/// compiler run.
fn process_single_source(
    cache: &Cache,
    env: &Arc<Environment>,
    frontend: &dyn CompilerFrontend,
    compiler: &Path,
    job: &Job,
    child_env: &[(String, String)],
) -> (i32, String, String) {
    match process(cache, env, frontend, compiler, job, child_env) {
        Ok(result) => result,
        Err(err) => {
            error!("cache error for \"{}\": {err}", job.src_file.display());
            match capture_compiler(compiler, &job.cmdline, child_env) {
                Ok(result) => {
                    (result.exit_code, frontend.postprocess_stdout(result.stdout), result.stderr)
                }
                Err(err) => {
                    error!("failed to run compiler \"{}\": {err}", compiler.display());
                    (1, String::new(), format!("clcache: failed to run compiler: {err}\n"))
                }
            }
        }
    }
}

/// Outcome of probing the manifest under its shard lock.
enum Probe {
    /// Confirmed hit, fully served.
    Hit((i32, String, String)),
    /// No usable artifact. When an entry matched but its artifact is gone,
    /// the known object key is carried along for the repair commit.
    Miss { known_key: Option<String>, reason: MissReason },
}

fn process(
    cache: &Cache,
    env: &Arc<Environment>,
    frontend: &dyn CompilerFrontend,
    compiler: &Path,
    job: &Job,
    child_env: &[(String, String)],
) -> Result<(i32, String, String)> {
    let manifest_hash = frontend.manifest_hash(env, compiler, &job.cmdline, &job.src_file)?;

    // Serialize workers that schedule the same source concurrently; the
    // second worker waits and then finds the first worker's fresh entry.
    let _slot = cache.job_slots.acquire(&manifest_hash);

    let outcome = {
        let _manifest_guard = cache.manifest_lock_for(&manifest_hash).acquire()?;
        match probe_manifest(cache, env, frontend, job, &manifest_hash) {
            Ok(outcome) => outcome,
            Err(err) => {
                cache.stats.record_cache_miss(MissReason::CacheFailure);
                return Err(err);
            }
        }
    };

    match outcome {
        Probe::Hit(result) => Ok(result),
        Probe::Miss { known_key: Some(cache_key), reason } => {
            debug!("manifest entry hit, but no object file found in cache");
            let result = capture_compiler(compiler, &job.cmdline, child_env)?;
            let stdout = frontend.postprocess_stdout(result.stdout);
            let (canonical_stdout, canonical_stderr) =
                frontend.canonicalize_streams(env, &stdout, &result.stderr);
            {
                let _manifest_guard = cache.manifest_lock_for(&manifest_hash).acquire()?;
                ensure_artifacts_exist(
                    cache,
                    &cache_key,
                    reason,
                    &job.output_file,
                    result.exit_code,
                    canonical_stdout,
                    canonical_stderr,
                    frontend.store_filter(env, job),
                    None::<fn() -> Result<i64>>,
                )?;
            }
            Ok((result.exit_code, stdout, result.stderr))
        }
        Probe::Miss { known_key: None, reason } => {
            debug!("manifest entry miss, invoking real compiler");
            let mut cmdline = job.cmdline.clone();
            let strip = frontend.inject_include_dump(&mut cmdline);

            let mut result = capture_compiler(compiler, &cmdline, child_env)?;
            result.stdout = frontend.postprocess_stdout(std::mem::take(&mut result.stdout));
            let (include_paths, forwarded_stdout) =
                frontend.extract_includes(env, &result, job, strip)?;

            if result.exit_code != 0 || !job.output_file.exists() {
                return Ok((result.exit_code, forwarded_stdout, result.stderr));
            }

            let entry = create_manifest_entry(env, &manifest_hash, &include_paths)?;
            let cache_key = entry.object_hash.clone();
            let (canonical_stdout, canonical_stderr) =
                frontend.canonicalize_streams(env, &forwarded_stdout, &result.stderr);

            let add_manifest = || -> Result<i64> {
                let _manifest_guard = cache.manifest_lock_for(&manifest_hash).acquire()?;
                let (mut manifest, old_size) =
                    cache.get_manifest(&manifest_hash).unwrap_or((Manifest::new(), 0));
                manifest.add_entry(entry.clone());
                let new_size = cache.set_manifest(&manifest_hash, &manifest)?;
                Ok(new_size as i64 - old_size as i64)
            };

            ensure_artifacts_exist(
                cache,
                &cache_key,
                reason,
                &job.output_file,
                result.exit_code,
                canonical_stdout,
                canonical_stderr,
                frontend.store_filter(env, job),
                Some(add_manifest),
            )?;
            Ok((result.exit_code, forwarded_stdout, result.stderr))
        }
    }
}

/// Walks the manifest entries from most recent to least recent, re-hashing
/// each entry's include set until one matches the current header state. The
/// caller holds the manifest shard lock.
fn probe_manifest(
    cache: &Cache,
    env: &Arc<Environment>,
    frontend: &dyn CompilerFrontend,
    job: &Job,
    manifest_hash: &str,
) -> Result<Probe> {
    let Some((mut manifest, _size)) = cache.get_manifest(manifest_hash) else {
        return Ok(Probe::Miss { known_key: None, reason: MissReason::SourceChanged });
    };

    let mut known_key = None;
    for index in 0..manifest.entries().len() {
        let entry = manifest.entries()[index].clone();

        let mut include_paths = Vec::with_capacity(entry.include_files.len());
        for canon in &entry.include_files {
            include_paths.push(env.expand_path(canon.as_str())?);
        }

        // command line options are already part of the manifest hash; only
        // the header contents decide between entries
        let includes_content_hash = match hash::includes_content_hash_for_files(env, &include_paths)
        {
            Ok(digest) => digest,
            Err(CacheError::IncludeNotFound(path)) => {
                trace!("include file vanished, skipping entry: \"{}\"", path.display());
                continue;
            }
            Err(err) => return Err(err),
        };
        if entry.includes_content_hash != includes_content_hash {
            continue;
        }

        // header set matches; the artifact decides between hit and repair
        known_key = Some(entry.object_hash.clone());

        let _object_guard = cache.lock_for(&entry.object_hash).acquire()?;
        if cache.has_entry(&entry.object_hash) {
            // Only a confirmed hit refreshes the LRU position.
            if index > 0 {
                trace!("moving manifest entry to top of manifest");
                manifest.touch_entry(&entry.object_hash);
                cache.set_manifest(manifest_hash, &manifest)?;
            }
            let result = process_cache_hit(cache, env, frontend, job, &entry.object_hash)?;
            frontend.after_hit(env, job, &entry)?;
            return Ok(Probe::Hit(result));
        }
    }

    Ok(Probe::Miss { known_key, reason: MissReason::HeaderChanged })
}

/// Serves a confirmed hit: unlinks the stale output, decompresses the cached
/// object into place and expands the stored streams. The caller holds the
/// object shard lock.
fn process_cache_hit(
    cache: &Cache,
    env: &Arc<Environment>,
    frontend: &dyn CompilerFrontend,
    job: &Job,
    cache_key: &str,
) -> Result<(i32, String, String)> {
    trace!(
        "reusing cached object for key {cache_key} for \"{}\"",
        job.output_file.display()
    );
    cache.stats.record_cache_hit();

    utils::safe_unlink(&job.output_file)?;
    let cached = cache.get_entry(cache_key)?;
    crate::artifacts::copy_from_cache(
        &cached.payload_path,
        &job.output_file,
        frontend.fetch_filter(env, job).as_ref(),
    )?;

    let (stdout, stderr) = frontend.expand_streams(env, &cached.stdout, &cached.stderr);
    Ok((0, stdout, stderr))
}
