//! Bounded pool of accessors.
//!
//! At most `max_active_accessors` accessors are checked out at once; a
//! checkout beyond that blocks for up to `accessor_wait_ms`. Returned
//! accessors are kept open for reuse, up to `max_idle_accessors`, and closed
//! once they have been idle for `accessor_idle_eviction_ms`.

use std::ops::{Deref, DerefMut};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;

use crate::accessor::Accessor;
use crate::config::Options;
use crate::error::{Error, Result};
use crate::lock::WriteLock;

struct IdleAccessor {
    accessor: Accessor,
    since: Instant,
}

/// Pool of [`Accessor`]s over one store.
pub struct AccessorPool {
    dir: PathBuf,
    options: Arc<Options>,
    lock: Arc<WriteLock>,
    permits_tx: Sender<()>,
    permits_rx: Receiver<()>,
    idle: Mutex<Vec<IdleAccessor>>,
}

impl AccessorPool {
    /// Create a new pool
    pub fn new(dir: PathBuf, options: Arc<Options>, lock: Arc<WriteLock>) -> Self {
        let max_active = options.max_active_accessors;
        let (permits_tx, permits_rx) = channel::bounded(max_active);
        for _ in 0..max_active {
            if let Err(e) = permits_tx.try_send(()) {
                log::warn!("Failed to seed accessor pool permit: {}", e);
            }
        }
        Self { dir, options, lock, permits_tx, permits_rx, idle: Mutex::new(Vec::new()) }
    }

    /// Checks out an accessor, blocking while the pool is exhausted.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PoolExhausted`] if no accessor became available
    /// within the configured wait.
    pub fn checkout(&self) -> Result<PooledAccessor<'_>> {
        let wait = Duration::from_millis(self.options.accessor_wait_ms);
        self.permits_rx.recv_timeout(wait).map_err(|_| Error::PoolExhausted(wait))?;

        let reused = {
            let mut idle = self.idle.lock();
            self.evict_expired(&mut idle);
            idle.pop().map(|entry| entry.accessor)
        };
        let accessor = match reused {
            Some(accessor) => accessor,
            None => {
                let opened =
                    Accessor::open(&self.dir, Arc::clone(&self.options), Arc::clone(&self.lock));
                match opened {
                    Ok(accessor) => accessor,
                    Err(e) => {
                        self.release_permit();
                        return Err(e);
                    }
                }
            }
        };
        Ok(PooledAccessor { pool: self, accessor: Some(accessor) })
    }

    fn checkin(&self, accessor: Accessor) {
        {
            let mut idle = self.idle.lock();
            self.evict_expired(&mut idle);
            if idle.len() < self.options.max_idle_accessors {
                idle.push(IdleAccessor { accessor, since: Instant::now() });
            } else {
                log::debug!("Closing accessor, {} already idle", idle.len());
            }
        }
        self.release_permit();
    }

    fn release_permit(&self) {
        if self.permits_tx.try_send(()).is_err() {
            log::warn!("Accessor pool permit returned twice");
        }
    }

    fn evict_expired(&self, idle: &mut Vec<IdleAccessor>) {
        let max_age = Duration::from_millis(self.options.accessor_idle_eviction_ms);
        let before = idle.len();
        idle.retain(|entry| entry.since.elapsed() < max_age);
        if idle.len() < before {
            log::debug!("Evicted {} idle accessors", before - idle.len());
        }
    }

    /// Number of accessors currently checked out.
    pub fn active(&self) -> usize {
        self.options.max_active_accessors - self.permits_rx.len()
    }

    /// Number of idle accessors kept open.
    pub fn idle(&self) -> usize {
        self.idle.lock().len()
    }

    /// Closes every idle accessor, syncing its files first.
    pub fn clear(&self) -> Result<()> {
        let drained: Vec<IdleAccessor> = self.idle.lock().drain(..).collect();
        for mut entry in drained {
            entry.accessor.sync()?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for AccessorPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessorPool")
            .field("dir", &self.dir)
            .field("active", &self.active())
            .field("idle", &self.idle())
            .finish()
    }
}

/// An accessor checked out of an [`AccessorPool`]. Returned to the pool
/// when dropped.
pub struct PooledAccessor<'a> {
    pool: &'a AccessorPool,
    accessor: Option<Accessor>,
}

impl Deref for PooledAccessor<'_> {
    type Target = Accessor;

    fn deref(&self) -> &Accessor {
        self.accessor.as_ref().expect("accessor is only taken on drop")
    }
}

impl DerefMut for PooledAccessor<'_> {
    fn deref_mut(&mut self) -> &mut Accessor {
        self.accessor.as_mut().expect("accessor is only taken on drop")
    }
}

impl Drop for PooledAccessor<'_> {
    fn drop(&mut self) {
        if let Some(accessor) = self.accessor.take() {
            self.pool.checkin(accessor);
        }
    }
}

impl std::fmt::Debug for PooledAccessor<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PooledAccessor").field(&self.accessor).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn pool(dir: &TempDir, options: Options) -> AccessorPool {
        let lock = Arc::new(WriteLock::open(dir.path(), Duration::from_millis(5)).unwrap());
        AccessorPool::new(dir.path().to_path_buf(), Arc::new(options), lock)
    }

    #[test]
    fn test_checkout_and_reuse() {
        let dir = TempDir::new().unwrap();
        let pool = pool(&dir, Options::default().initial_capacity(16).accessor_pool(4, 1));

        let a = pool.checkout().unwrap();
        let b = pool.checkout().unwrap();
        assert_eq!(pool.active(), 2);
        assert_eq!(pool.idle(), 0);

        drop(a);
        drop(b);
        assert_eq!(pool.active(), 0);
        assert_eq!(pool.idle(), 1);

        let _c = pool.checkout().unwrap();
        assert_eq!(pool.idle(), 0);
        assert_eq!(pool.active(), 1);
    }

    #[test]
    fn test_exhausted() {
        let dir = TempDir::new().unwrap();
        let options = Options::default()
            .initial_capacity(16)
            .accessor_pool(1, 1)
            .accessor_wait(Duration::from_millis(20));
        let pool = pool(&dir, options);

        let held = pool.checkout().unwrap();
        let err = pool.checkout().unwrap_err();
        assert!(matches!(err, Error::PoolExhausted(_)));
        assert!(err.is_retryable());

        drop(held);
        assert!(pool.checkout().is_ok());
    }

    #[test]
    fn test_permits_return_exactly_once() {
        let dir = TempDir::new().unwrap();
        let options = Options::default()
            .initial_capacity(16)
            .accessor_pool(3, 1)
            .accessor_wait(Duration::from_millis(20));
        let pool = pool(&dir, options);
        assert_eq!(pool.active(), 0);

        for _ in 0..10 {
            let held: Vec<_> = (0..3).map(|_| pool.checkout().unwrap()).collect();
            assert_eq!(pool.active(), 3);
            assert!(matches!(pool.checkout(), Err(Error::PoolExhausted(_))));
            drop(held);
            assert_eq!(pool.active(), 0);
            assert_eq!(pool.idle(), 1);
        }
    }

    #[test]
    fn test_idle_eviction() {
        let dir = TempDir::new().unwrap();
        let mut options = Options::default().initial_capacity(16).accessor_pool(2, 2);
        options.accessor_idle_eviction_ms = 0;
        let pool = pool(&dir, options);

        drop(pool.checkout().unwrap());
        // Anything idle for zero time or more is already expired.
        let _again = pool.checkout().unwrap();
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn test_pooled_accessor_derefs() {
        let dir = TempDir::new().unwrap();
        let pool = pool(&dir, Options::default().initial_capacity(16));

        let mut acc = pool.checkout().unwrap();
        assert_eq!(acc.increase_store_revision().unwrap(), 1);
        drop(acc);

        let mut acc = pool.checkout().unwrap();
        assert_eq!(acc.store_revision().unwrap(), 1);
        pool.clear().unwrap();
    }
}
