//! The `clcache` command line driver.
//!
//! Invoked either in an administrative mode (statistics, cleanup, sizing,
//! hash server) or as a compiler wrapper, in which case the first positional
//! argument is the compiler and everything after it is forwarded.

use clap::Parser;
use clcache::{
    compilers::{self, forward_compiler, CompilerFrontend},
    process_compile_request, server, utils, Cache, Environment,
};
use std::{path::PathBuf, process::ExitCode, sync::Arc, time::Duration};

#[derive(Parser, Debug)]
#[command(
    name = "clcache",
    version,
    about = "Compiler cache for MSVC cl.exe and Qt moc.exe",
    group = clap::ArgGroup::new("admin").multiple(false)
)]
struct Cli {
    /// Print cache statistics
    #[arg(short = 's', long = "stats", group = "admin")]
    show_stats: bool,

    /// Clean the cache down to the configured maximum size
    #[arg(short = 'c', long = "clean", group = "admin")]
    clean_cache: bool,

    /// Clear the cache entirely
    #[arg(short = 'C', long = "clear", group = "admin")]
    clear_cache: bool,

    /// Reset cache statistics
    #[arg(short = 'z', long = "reset", group = "admin")]
    reset_stats: bool,

    /// Set maximum cache size (in bytes)
    #[arg(short = 'M', long = "set-size", value_name = "BYTES", group = "admin")]
    cache_size: Option<u64>,

    /// Set maximum cache size (in GB)
    #[arg(long = "set-size-gb", value_name = "GB", group = "admin")]
    cache_size_gb: Option<u64>,

    /// Run the hash server with the given idle timeout in seconds
    #[arg(long = "run-server", value_name = "SECONDS", group = "admin")]
    run_server: Option<u64>,

    /// Path to the compiler executable; defaults to CLCACHE_CL or cl.exe
    /// from PATH
    compiler: Option<PathBuf>,

    /// Arguments forwarded to the compiler
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

fn main() -> ExitCode {
    init_logging();
    ExitCode::from(run().clamp(0, u8::MAX as i32) as u8)
}

fn init_logging() {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_env("CLCACHE_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn run() -> i32 {
    let cli = Cli::parse();

    if let Some(seconds) = cli.run_server {
        return match server::run_server(Duration::from_secs(seconds)) {
            Ok(code) => code,
            Err(err) => {
                eprintln!("clcache: {err}");
                1
            }
        };
    }

    let env = Arc::new(Environment::from_env());
    let cache = match Cache::new(&env.cache_dir) {
        Ok(cache) => cache,
        Err(err) => {
            eprintln!("clcache: {err}");
            return 1;
        }
    };

    if let Some(exit_code) = handle_admin_command(&cli, &cache) {
        return exit_code;
    }

    let Some(compiler) = cli.compiler.clone().or_else(utils::find_compiler_binary) else {
        eprintln!(
            "clcache: failed to locate compiler; pass one explicitly or set CLCACHE_CL"
        );
        return 1;
    };
    if !compiler.exists() {
        eprintln!("clcache: compiler \"{}\" does not exist", compiler.display());
        return 1;
    }

    let frontend = compilers::frontend_for(&compiler);

    if env.disabled {
        let env_vars: Vec<(String, String)> = std::env::vars().collect();
        return forward_compiler(&compiler, &cli.args, &env_vars).unwrap_or_else(|err| {
            eprintln!("clcache: {err}");
            1
        });
    }

    let exit_code = process_compile_request(&cache, &env, frontend.as_ref(), &compiler, &cli.args);

    if cache.is_cleanup_required() {
        match cache.lock_all() {
            Ok(_guards) => {
                if let Err(err) = cache.clean() {
                    warn_to_stderr(&format!("cache cleanup failed: {err}"));
                }
            }
            Err(err) => warn_to_stderr(&format!("cache cleanup skipped: {err}")),
        }
    }

    let program_name = if frontend.name() == "moc" { "moccache" } else { "clcache" };
    cache.shutdown(&env, program_name);
    exit_code
}

fn warn_to_stderr(message: &str) {
    eprintln!("clcache: {message}");
}

fn print_statistics(cache: &Cache) {
    let persistent = cache.persistent_stats.lock().unwrap_or_else(|err| err.into_inner());
    println!("{}", persistent.report(&cache.dir, cache.max_cache_size()));
}

/// Runs the selected administrative mode, if any. Returns its exit code.
fn handle_admin_command(cli: &Cli, cache: &Cache) -> Option<i32> {
    if cli.show_stats {
        print_statistics(cache);
        return Some(0);
    }

    if cli.clean_cache {
        let code = match cache.lock_all().and_then(|_guards| cache.clean()) {
            Ok(()) => {
                println!("Cache cleaned");
                0
            }
            Err(err) => {
                eprintln!("clcache: {err}");
                1
            }
        };
        return Some(code);
    }

    if cli.clear_cache {
        let code = match cache.lock_all().and_then(|_guards| cache.clear()) {
            Ok(()) => {
                println!("Cache cleared");
                print_statistics(cache);
                0
            }
            Err(err) => {
                eprintln!("clcache: {err}");
                1
            }
        };
        return Some(code);
    }

    if cli.reset_stats {
        let mut persistent = cache.persistent_stats.lock().unwrap_or_else(|err| err.into_inner());
        return Some(match persistent.reset() {
            Ok(()) => {
                drop(persistent);
                println!("Statistics reset");
                print_statistics(cache);
                0
            }
            Err(err) => {
                eprintln!("clcache: {err}");
                1
            }
        });
    }

    let new_size = cli.cache_size.or(cli.cache_size_gb.map(|gb| gb * 1024 * 1024 * 1024));
    if let Some(new_size) = new_size {
        if new_size < 1 {
            eprintln!("Max size argument must be greater than 0.");
            return Some(1);
        }
        let mut configuration = cache.configuration.lock().unwrap_or_else(|err| err.into_inner());
        return Some(match configuration.set_max_cache_size(new_size) {
            Ok(()) => {
                drop(configuration);
                print_statistics(cache);
                0
            }
            Err(err) => {
                eprintln!("clcache: {err}");
                1
            }
        });
    }

    None
}
