//! The hash server: a detached single-instance daemon memoizing file hashes.
//!
//! Compilations re-hash the same headers thousands of times per build; the
//! server keeps a `directory → (file → hash)` map, invalidated by filesystem
//! change notifications, and serves lookups over a local socket. The wire
//! protocol is newline-separated UTF-8 paths terminated by a NUL byte; the
//! reply is one hash per line terminated by NUL, or `!` followed by an error
//! description.
//!
//! Clients are synchronous and treat every failure as non-fatal: the caller
//! falls back to in-process hashing.

use crate::{
    error::{CacheError, Result},
    lock::CacheLock,
    Environment,
};
use interprocess::local_socket::{
    self,
    traits::{tokio::Listener as _, Stream as _},
    GenericNamespaced, ListenerOptions, ToNsName,
};
use md5::{Digest, Md5};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::{
    collections::HashMap,
    ffi::OsString,
    io::{Read, Write},
    path::{Path, PathBuf},
    process::{Command, Stdio},
    time::{Duration, Instant},
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Not the cache version: bumped when the wire protocol changes, so old and
/// new clients never share a socket.
const SERVER_VERSION: &str = "2";
const SERVER_ID: &str = "626763c0-bebe-11ed-a901-0800200c9a66";

const BUFFER_SIZE: usize = 65536;

/// How long a client waits for a freshly spawned server to come up.
const SPAWN_WAIT: Duration = Duration::from_secs(10);

fn socket_name() -> String {
    format!("clcache-{SERVER_ID}-{SERVER_VERSION}.sock")
}

fn connect() -> std::io::Result<local_socket::Stream> {
    let name = socket_name().to_ns_name::<GenericNamespaced>()?;
    local_socket::Stream::connect(name)
}

/// Whether a server instance is currently accepting connections.
pub fn is_running() -> bool {
    connect().is_ok()
}

/// Requests hashes for the given paths, starting the server on demand.
pub fn file_hashes(env: &Environment, paths: &[PathBuf]) -> Result<Vec<String>> {
    let Some(idle_timeout) = env.server_timeout else {
        return Err(CacheError::HashServer("server disabled".to_string()));
    };
    if !spawn_server(idle_timeout)? {
        return Err(CacheError::HashServer("server did not start in time".to_string()));
    }
    request_hashes(paths)
}

fn request_hashes(paths: &[PathBuf]) -> Result<Vec<String>> {
    // a busy server refuses briefly while its backlog is full; retry before
    // giving up and letting the caller hash in-process
    let mut stream = None;
    for attempt in 0..10 {
        match connect() {
            Ok(connected) => {
                stream = Some(connected);
                break;
            }
            Err(err)
                if attempt < 9
                    && matches!(
                        err.kind(),
                        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::ConnectionRefused
                    ) =>
            {
                std::thread::sleep(Duration::from_millis(20));
            }
            Err(err) => {
                return Err(CacheError::HashServer(format!("connect failed: {err}")));
            }
        }
    }
    let Some(mut stream) = stream else {
        return Err(CacheError::HashServer("server busy".to_string()));
    };

    let request = encode_request(paths);
    stream
        .write_all(&request)
        .map_err(|err| CacheError::HashServer(format!("send failed: {err}")))?;

    let mut response = Vec::new();
    stream
        .read_to_end(&mut response)
        .map_err(|err| CacheError::HashServer(format!("receive failed: {err}")))?;
    decode_response(&response)
}

fn encode_request(paths: &[PathBuf]) -> Vec<u8> {
    let mut request = paths
        .iter()
        .map(|path| path.to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("\n")
        .into_bytes();
    request.push(0);
    request
}

fn decode_response(response: &[u8]) -> Result<Vec<String>> {
    let body = response.strip_suffix(&[0]).unwrap_or(response);
    if let Some(error) = body.strip_prefix(b"!") {
        return Err(CacheError::HashServer(String::from_utf8_lossy(error).into_owned()));
    }
    Ok(String::from_utf8_lossy(body).lines().map(str::to_string).collect())
}

/// Starts the server process unless one is already accepting connections.
/// Double-checked under a launch lock so racing clients spawn one instance.
pub fn spawn_server(idle_timeout: Duration) -> Result<bool> {
    if is_running() {
        return Ok(true);
    }

    let launch_lock = CacheLock::new(
        &std::env::temp_dir(),
        &format!("clcache-launch-{SERVER_ID}-{SERVER_VERSION}"),
        Duration::from_secs(10),
    );
    let _guard = launch_lock.acquire()?;
    if is_running() {
        return Ok(true);
    }

    let exe = std::env::current_exe()
        .map_err(|err| CacheError::HashServer(format!("cannot locate own executable: {err}")))?;
    Command::new(exe)
        .arg(format!("--run-server={}", idle_timeout.as_secs()))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|err| CacheError::HashServer(format!("failed to spawn server: {err}")))?;

    let deadline = Instant::now() + SPAWN_WAIT;
    while Instant::now() < deadline {
        if is_running() {
            debug!("started hash server with timeout {} seconds", idle_timeout.as_secs());
            return Ok(true);
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    warn!("failed to start hash server");
    Ok(false)
}

/// Runs the server event loop on the current thread until it has been idle
/// for `idle_timeout`. Returns the process exit code.
pub fn run_server(idle_timeout: Duration) -> Result<i32> {
    if is_running() {
        return Ok(0);
    }
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|err| CacheError::HashServer(format!("failed to build runtime: {err}")))?;
    runtime.block_on(serve(idle_timeout))
}

async fn serve(idle_timeout: Duration) -> Result<i32> {
    let name = socket_name()
        .to_ns_name::<GenericNamespaced>()
        .map_err(|err| CacheError::HashServer(format!("bad socket name: {err}")))?;
    let listener = match ListenerOptions::new().name(name).create_tokio() {
        Ok(listener) => listener,
        Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => {
            // lost the race against another instance
            return Ok(0);
        }
        Err(err) => {
            return Err(CacheError::HashServer(format!("failed to bind socket: {err}")));
        }
    };

    let (event_tx, mut event_rx) = tokio::sync::mpsc::unbounded_channel();
    let mut watcher =
        notify::recommended_watcher(move |event: notify::Result<notify::Event>| {
            if let Ok(event) = event {
                let _ = event_tx.send(event);
            }
        })
        .map_err(|err| CacheError::HashServer(format!("failed to create watcher: {err}")))?;

    let mut cache = HashCache::default();
    let mut deadline = tokio::time::Instant::now() + idle_timeout;

    info!("hash server started, idle timeout {} seconds", idle_timeout.as_secs());
    loop {
        tokio::select! {
            conn = listener.accept() => {
                match conn {
                    Ok(stream) => {
                        handle_connection(stream, &mut cache, &mut watcher).await;
                        deadline = tokio::time::Instant::now() + idle_timeout;
                    }
                    Err(err) => warn!("failed to accept connection: {err}"),
                }
            }
            Some(event) = event_rx.recv() => {
                cache.invalidate(&event, &mut watcher);
            }
            _ = tokio::time::sleep_until(deadline) => {
                info!("hash server idle, exiting");
                break;
            }
        }
    }
    Ok(0)
}

async fn handle_connection(
    mut stream: local_socket::tokio::Stream,
    cache: &mut HashCache,
    watcher: &mut RecommendedWatcher,
) {
    let mut request = Vec::new();
    let mut chunk = vec![0u8; BUFFER_SIZE];
    loop {
        match stream.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                request.extend_from_slice(&chunk[..n]);
                if request.ends_with(&[0]) {
                    break;
                }
            }
            Err(err) => {
                warn!("failed to read request: {err}");
                return;
            }
        }
    }

    let body = request.strip_suffix(&[0]).unwrap_or(&request);
    let text = String::from_utf8_lossy(body);
    trace!("received request to hash {} paths", text.lines().count());

    let mut response = Vec::new();
    let mut hashes = Vec::new();
    for line in text.lines() {
        match cache.file_hash(Path::new(line), watcher) {
            Ok(digest) => hashes.push(digest),
            Err(err) => {
                response.push(b'!');
                response.extend_from_slice(format!("{line}: {err}").as_bytes());
                break;
            }
        }
    }
    if response.is_empty() {
        response = hashes.join("\n").into_bytes();
    }
    response.push(0);

    if let Err(err) = stream.write_all(&response).await {
        warn!("failed to write response: {err}");
    }
}

/// The memoized hashes, grouped by directory so one change notification can
/// invalidate exactly one entry.
#[derive(Default)]
struct HashCache {
    dirs: HashMap<PathBuf, HashMap<OsString, String>>,
}

impl HashCache {
    fn file_hash(
        &mut self,
        path: &Path,
        watcher: &mut RecommendedWatcher,
    ) -> std::io::Result<String> {
        let dir = path.parent().unwrap_or_else(|| Path::new("")).to_path_buf();
        let name = path.file_name().unwrap_or_default().to_os_string();

        if let Some(digest) = self.dirs.get(&dir).and_then(|entries| entries.get(&name)) {
            trace!("using cached hash for \"{}\"", path.display());
            return Ok(digest.clone());
        }

        let mut hasher = Md5::new();
        let mut file = std::fs::File::open(path)?;
        let mut buf = vec![0u8; BUFFER_SIZE];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        let digest = hex::encode(hasher.finalize());

        if !self.dirs.contains_key(&dir) {
            trace!("starting to watch directory \"{}\"", dir.display());
            if let Err(err) = watcher.watch(&dir, RecursiveMode::NonRecursive) {
                warn!("failed to watch \"{}\": {err}", dir.display());
            }
        }
        self.dirs.entry(dir).or_default().insert(name, digest.clone());
        Ok(digest)
    }

    /// Drops the memoized hash of every file the event names; a directory
    /// whose last entry is gone stops being watched.
    fn invalidate(&mut self, event: &notify::Event, watcher: &mut RecommendedWatcher) {
        for path in &event.paths {
            let Some(dir) = path.parent() else { continue };
            let Some(name) = path.file_name() else { continue };
            let Some(entries) = self.dirs.get_mut(dir) else { continue };
            if entries.remove(name).is_some() {
                trace!("invalidated cached hash for \"{}\"", path.display());
                if entries.is_empty() {
                    let _ = watcher.unwatch(dir);
                    self.dirs.remove(dir);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn request_is_newline_separated_and_nul_terminated() {
        let request =
            encode_request(&[PathBuf::from("/a/b.h"), PathBuf::from("/a/c.h")]);
        assert_eq!(request, b"/a/b.h\n/a/c.h\0");
    }

    #[test]
    fn response_decodes_hashes_or_error() {
        let hashes = decode_response(b"aaaa\nbbbb\0").unwrap();
        assert_eq!(hashes, vec!["aaaa", "bbbb"]);

        let err = decode_response(b"!no such file\0").unwrap_err();
        assert!(matches!(err, CacheError::HashServer(msg) if msg.contains("no such file")));
    }
}
