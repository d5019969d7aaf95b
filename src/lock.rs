//! Store write lock.
//!
//! A reentrant mutex that also holds an exclusive `flock` on the store's
//! `write.lock` file while held, so mutations are serialized across threads
//! and across processes. The thread holding the lock may obtain it again;
//! it is released when every obtain has been matched by a release.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use fs2::FileExt;
use parking_lot::Mutex;

use crate::error::{Error, Result};

/// File name of the lock file within the data directory.
pub const LOCK_FILE_NAME: &str = "write.lock";

#[derive(Debug, Default)]
struct LockState {
    owner: Option<ThreadId>,
    depth: usize,
}

/// Reentrant, cross-process write lock.
#[derive(Debug)]
pub struct WriteLock {
    path: PathBuf,
    file: File,
    poll_interval: Duration,
    state: Mutex<LockState>,
}

impl WriteLock {
    /// Opens the lock file of the store in `dir`, creating it if needed.
    pub fn open(dir: &Path, poll_interval: Duration) -> Result<Self> {
        let path = dir.join(LOCK_FILE_NAME);
        let file =
            OpenOptions::new().create(true).read(true).write(true).truncate(false).open(&path)?;
        Ok(Self { path, file, poll_interval, state: Mutex::new(LockState::default()) })
    }

    /// Path of the lock file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Attempts to obtain the lock without blocking.
    ///
    /// Returns `Ok(false)` if another thread or process holds it.
    pub fn obtain(&self) -> Result<bool> {
        let me = thread::current().id();
        let mut state = self.state.lock();
        match state.owner {
            Some(owner) if owner == me => {
                state.depth += 1;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => match FileExt::try_lock_exclusive(&self.file) {
                Ok(()) => {
                    state.owner = Some(me);
                    state.depth = 1;
                    Ok(true)
                }
                Err(e) if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() => {
                    Ok(false)
                }
                Err(e) => Err(Error::Io(e)),
            },
        }
    }

    /// Obtains the lock, polling until `timeout` elapses. `None` waits forever.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockTimeout`] if the lock was not obtained in time.
    pub fn obtain_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        let start = Instant::now();
        loop {
            if self.obtain()? {
                return Ok(());
            }
            let pause = match timeout {
                Some(limit) => {
                    let elapsed = start.elapsed();
                    if elapsed >= limit {
                        return Err(Error::LockTimeout(limit));
                    }
                    self.poll_interval.min(limit - elapsed)
                }
                None => self.poll_interval,
            };
            thread::sleep(pause);
        }
    }

    /// Releases one level of the lock.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if the calling thread does not hold it.
    pub fn release(&self) -> Result<()> {
        let me = thread::current().id();
        let mut state = self.state.lock();
        if state.owner != Some(me) {
            return Err(Error::invalid_state(
                "write lock released by a thread that does not hold it",
            ));
        }
        state.depth -= 1;
        if state.depth == 0 {
            state.owner = None;
            FileExt::unlock(&self.file)?;
        }
        Ok(())
    }

    /// Returns true if the calling thread holds the lock.
    pub fn is_held_by_current_thread(&self) -> bool {
        self.state.lock().owner == Some(thread::current().id())
    }

    /// Obtains the lock and returns a guard that releases it on drop.
    pub fn lock(&self, timeout: Option<Duration>) -> Result<WriteLockGuard<'_>> {
        self.obtain_timeout(timeout)?;
        Ok(WriteLockGuard { lock: self })
    }

    /// Runs `f` while holding the lock. The lock is released whether `f`
    /// succeeds or fails.
    pub fn with<T, F>(&self, timeout: Option<Duration>, f: F) -> Result<T>
    where
        F: FnOnce() -> Result<T>,
    {
        let _guard = self.lock(timeout)?;
        f()
    }
}

/// Holds one level of a [`WriteLock`] until dropped.
#[derive(Debug)]
pub struct WriteLockGuard<'a> {
    lock: &'a WriteLock,
}

impl Drop for WriteLockGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.lock.release() {
            log::warn!("Failed to release write lock {}: {}", self.lock.path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    const POLL: Duration = Duration::from_millis(5);

    #[test]
    fn test_reentrant_obtain() {
        let dir = TempDir::new().unwrap();
        let lock = WriteLock::open(dir.path(), POLL).unwrap();

        assert!(lock.obtain().unwrap());
        assert!(lock.obtain().unwrap());
        assert!(lock.is_held_by_current_thread());

        lock.release().unwrap();
        assert!(lock.is_held_by_current_thread());
        lock.release().unwrap();
        assert!(!lock.is_held_by_current_thread());

        assert!(matches!(lock.release(), Err(Error::InvalidState(_))));
    }

    #[test]
    fn test_contended_timeout() {
        let dir = TempDir::new().unwrap();
        let lock = Arc::new(WriteLock::open(dir.path(), POLL).unwrap());
        let guard = lock.lock(None).unwrap();

        let other = Arc::clone(&lock);
        let result = thread::spawn(move || {
            assert!(!other.obtain().unwrap());
            assert!(matches!(other.release(), Err(Error::InvalidState(_))));
            other.obtain_timeout(Some(Duration::from_millis(30)))
        })
        .join()
        .unwrap();
        assert!(matches!(result, Err(Error::LockTimeout(_))));

        drop(guard);
        let other = Arc::clone(&lock);
        let obtained = thread::spawn(move || {
            let _guard = other.lock(Some(Duration::from_secs(1))).unwrap();
            other.is_held_by_current_thread()
        })
        .join()
        .unwrap();
        assert!(obtained);
    }

    #[test]
    fn test_excludes_second_lock_file_handle() {
        let dir = TempDir::new().unwrap();
        let first = WriteLock::open(dir.path(), POLL).unwrap();
        let second = WriteLock::open(dir.path(), POLL).unwrap();

        assert!(first.obtain().unwrap());
        assert!(!second.obtain().unwrap());
        first.release().unwrap();
        assert!(second.obtain().unwrap());
        second.release().unwrap();
    }

    #[test]
    fn test_with_releases_on_error() {
        let dir = TempDir::new().unwrap();
        let lock = WriteLock::open(dir.path(), POLL).unwrap();

        let result: Result<()> =
            lock.with(None, || Err(Error::invalid_argument("fail inside the lock")));
        assert!(result.is_err());
        assert!(!lock.is_held_by_current_thread());

        let value = lock.with(None, || Ok(lock.is_held_by_current_thread())).unwrap();
        assert!(value);
        assert!(!lock.is_held_by_current_thread());
    }
}
