//! Support for caching compilations of MSVC `cl.exe` and Qt's `moc.exe`.
//!
//! The cache works in *direct mode*: instead of re-running the preprocessor it
//! fingerprints a compilation by a two-level hash. The *manifest hash*
//! identifies the (source, compiler, options) tuple and maps to a list of
//! previously observed header sets; re-hashing those headers yields the
//! *object hash* under which the artifacts (object file plus captured
//! stdout/stderr) are stored.

#![warn(rustdoc::all)]
#![deny(unused_must_use, rust_2018_idioms)]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

#[macro_use]
extern crate tracing;

pub mod error;
pub use error::{AnalyzerError, CacheError, Result};

pub mod utils;

mod env;
pub use env::Environment;

pub mod canon;
pub use canon::{CanonPath, StdStream};

pub mod hash;

pub mod lock;

pub mod jsonstore;

pub mod stats;

pub mod config;

pub mod manifest;
pub use manifest::{Manifest, ManifestEntry};

pub mod artifacts;
pub use artifacts::CompilerArtifacts;

pub mod cache;
pub use cache::Cache;

pub mod args;

pub mod server;

pub mod compilers;

mod compile;
pub use compile::process_compile_request;
