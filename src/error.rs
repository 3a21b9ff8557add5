//! Error types the cache core recognizes.

use std::{
    fmt, io,
    path::{Path, PathBuf},
};
use thiserror::Error;

pub type Result<T, E = CacheError> = std::result::Result<T, E>;

/// An I/O error paired with the path on which it occurred.
#[derive(Debug, Error)]
#[error("{path:?}: {source}")]
pub struct CacheIoError {
    #[source]
    source: io::Error,
    path: PathBuf,
}

impl CacheIoError {
    pub fn new(source: io::Error, path: impl Into<PathBuf>) -> Self {
        Self { source, path: path.into() }
    }

    /// The path at which this error occurred
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The underlying `io::Error`
    pub fn source(&self) -> &io::Error {
        &self.source
    }
}

impl From<CacheIoError> for io::Error {
    fn from(err: CacheIoError) -> Self {
        err.source
    }
}

/// Various errors that can occur inside the cache core.
///
/// Every variant is terminal for the current compile job: the engine maps it
/// to a cache-failure miss and falls back to the real compiler.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error(transparent)]
    Io(#[from] CacheIoError),
    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),
    /// A manifest entry references an include file that no longer exists.
    #[error("include file vanished: {0:?}")]
    IncludeNotFound(PathBuf),
    /// A shard lock could not be acquired within its timeout.
    #[error("failed to acquire lock \"{name}\" after {timeout_ms} ms")]
    LockTimeout { name: String, timeout_ms: u64 },
    /// A canonicalized path could not be expanded back to an absolute path.
    #[error("invalid canonicalized path: {0}")]
    Placeholder(String),
    /// The hash server could not be reached or replied with an error.
    #[error("hash server: {0}")]
    HashServer(String),
    #[error("no compiler executable found; pass one or set CLCACHE_CL")]
    CompilerNotFound,
    #[error("{0}")]
    Message(String),
}

impl CacheError {
    pub fn io(err: io::Error, path: impl Into<PathBuf>) -> Self {
        CacheIoError::new(err, path).into()
    }

    pub fn msg(msg: impl fmt::Display) -> Self {
        CacheError::Message(msg.to_string())
    }
}

/// Classification of a compiler invocation the cache refuses to handle.
///
/// Each shape corresponds to one miss-reason counter; the invocation is
/// forwarded to the real compiler untouched.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum AnalyzerError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("no source file given")]
    NoSourceFile,
    #[error("multiple source files with explicit /Tc or /Tp")]
    MultipleSourceFiles,
    #[error("called for preprocessing")]
    Preprocessing,
    #[error("external debug information (/Zi) is not supported")]
    ExternalDebugInfo,
    #[error("precompiled headers in use")]
    PrecompiledHeaders,
    #[error("called for linking")]
    Linking,
    #[error("called for JSON output")]
    JsonOutput,
    #[error("called without output file")]
    NoOutputFile,
}
