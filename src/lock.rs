//! Cross-process and in-process locking.
//!
//! On-disk stores are guarded per shard by advisory file locks under
//! `<cache>/locks/`. Lock acquisition polls with a bounded timeout; a holder
//! that dies simply drops its OS lock, so a waiter proceeds as if the lock had
//! been released normally. That is safe because every on-disk mutation is
//! staged and renamed: whatever a dead holder left behind is either invisible
//! staging state or a complete commit.

use crate::{
    error::{CacheError, Result},
    utils,
};
use fs2::FileExt;
use std::{
    collections::HashSet,
    fs::{File, OpenOptions},
    path::{Path, PathBuf},
    sync::{Condvar, Mutex},
    time::{Duration, Instant},
};

/// Default timeout for store shard locks.
pub const STORE_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A named cross-process lock.
#[derive(Clone, Debug)]
pub struct CacheLock {
    path: PathBuf,
    name: String,
    timeout: Duration,
}

impl CacheLock {
    pub fn new(locks_dir: &Path, name: &str, timeout: Duration) -> Self {
        let mangled: String = name
            .chars()
            .map(|c| if c == ':' || c == '/' || c == '\\' { '-' } else { c })
            .collect();
        Self { path: locks_dir.join(format!("{mangled}.lock")), name: mangled, timeout }
    }

    /// Blocks until the lock is held or the timeout elapses.
    pub fn acquire(&self) -> Result<LockGuard> {
        utils::create_parent_dir_all(&self.path)?;
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&self.path)
            .map_err(|err| CacheError::io(err, &self.path))?;

        let contended = fs2::lock_contended_error();
        let start = Instant::now();
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => break,
                Err(err) if err.raw_os_error() == contended.raw_os_error() => {
                    if start.elapsed() >= self.timeout {
                        return Err(CacheError::LockTimeout {
                            name: self.name.clone(),
                            timeout_ms: self.timeout.as_millis() as u64,
                        });
                    }
                    std::thread::sleep(POLL_INTERVAL);
                }
                Err(err) => return Err(CacheError::io(err, &self.path)),
            }
        }

        let waited = start.elapsed();
        if waited > Duration::from_secs(2) {
            trace!("waited for lock {} during {:.1} s", self.name, waited.as_secs_f64());
        }
        Ok(LockGuard { file, name: self.name.clone(), acquired: Instant::now() })
    }
}

/// Holds a [`CacheLock`] until dropped.
#[derive(Debug)]
pub struct LockGuard {
    file: File,
    name: String,
    acquired: Instant,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = self.file.unlock();
        let held = self.acquired.elapsed();
        if held > Duration::from_secs(2) {
            trace!("held lock {} during {:.1} s", self.name, held.as_secs_f64());
        }
    }
}

/// In-process single-flight over full manifest hashes.
///
/// Two worker threads scheduling the same source at the same time is common on
/// CI; the second worker waits here until the first has committed, then finds
/// a fresh manifest entry and turns its duplicate compile into a hit. There is
/// deliberately no timeout: waiting for the peer compiler is always cheaper
/// than compiling twice.
#[derive(Debug, Default)]
pub struct JobSlots {
    busy: Mutex<HashSet<String>>,
    released: Condvar,
}

impl JobSlots {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self, key: &str) -> JobSlot<'_> {
        let mut busy = self.busy.lock().unwrap_or_else(|err| err.into_inner());
        while busy.contains(key) {
            busy = self.released.wait(busy).unwrap_or_else(|err| err.into_inner());
        }
        busy.insert(key.to_string());
        JobSlot { slots: self, key: key.to_string() }
    }
}

#[derive(Debug)]
pub struct JobSlot<'a> {
    slots: &'a JobSlots,
    key: String,
}

impl Drop for JobSlot<'_> {
    fn drop(&mut self) {
        let mut busy = self.slots.busy.lock().unwrap_or_else(|err| err.into_inner());
        busy.remove(&self.key);
        self.slots.released.notify_all();
    }
}
