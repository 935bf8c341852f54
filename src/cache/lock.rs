//! Per-path reader/writer locks for cache entries.
//!
//! Locks are created on first use and dropped from the table as soon as no
//! guard or waiter refers to them, so the table only ever holds paths that are
//! in use. The table's own shard locks are held for lookup-or-create and for
//! the eviction check, never while a caller holds a path lock.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;

use crate::cancel::{CancelToken, Interrupt};

/// Upper bound on a single condvar wait, so cancellation is noticed promptly.
const WAIT_SLICE: Duration = Duration::from_millis(50);

/// Errors returned while waiting for a path lock.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum LockError {
    #[error("lock wait was cancelled")]
    Cancelled,
    #[error("lock wait timed out")]
    TimedOut,
}

impl From<Interrupt> for LockError {
    fn from(interrupt: Interrupt) -> Self {
        match interrupt {
            Interrupt::Cancelled => LockError::Cancelled,
            Interrupt::DeadlineExceeded => LockError::TimedOut,
        }
    }
}

#[derive(Debug, Default)]
struct LockState {
    readers: usize,
    writer: bool,
    /// Writers blocked in `acquire_exclusive`. New readers queue behind them.
    waiting_writers: usize,
}

#[derive(Debug, Default)]
struct PathLock {
    state: Mutex<LockState>,
    changed: Condvar,
}

impl PathLock {
    fn state(&self) -> MutexGuard<'_, LockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Blocks until `try_take` succeeds or `cancel` fires. `on_abort` undoes
    /// any bookkeeping done before waiting.
    fn wait_for(
        &self,
        cancel: &CancelToken,
        mut try_take: impl FnMut(&mut LockState) -> bool,
        on_abort: impl FnOnce(&mut LockState),
    ) -> Result<(), LockError> {
        let mut state = self.state();
        loop {
            if try_take(&mut *state) {
                return Ok(());
            }
            if let Some(interrupt) = cancel.interrupted() {
                on_abort(&mut *state);
                drop(state);
                self.changed.notify_all();
                return Err(interrupt.into());
            }
            let slice = cancel.wait_slice(WAIT_SLICE);
            let (next, _) = self
                .changed
                .wait_timeout(state, slice)
                .unwrap_or_else(PoisonError::into_inner);
            state = next;
        }
    }
}

/// Table of per-path shared/exclusive locks.
#[derive(Debug, Default)]
pub struct PathLockRegistry {
    locks: DashMap<PathBuf, Arc<PathLock>>,
}

impl PathLockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of paths that currently have a lock entry.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    fn lock_for(&self, path: &Path) -> Arc<PathLock> {
        Arc::clone(self.locks.entry(path.to_path_buf()).or_default().value())
    }

    /// Drops the table entry for `path` if the table holds the only reference.
    fn evict_if_unused(&self, path: &Path) {
        self.locks
            .remove_if(path, |_, lock| Arc::strong_count(lock) == 1);
    }

    /// Acquire a shared lock on `path`. Many shared holders may coexist; a
    /// shared acquire waits while an exclusive holder or waiter exists.
    ///
    /// Not reentrant: acquiring a path the caller already holds may deadlock
    /// once a writer queues behind it.
    pub fn acquire_shared(
        &self,
        path: &Path,
        cancel: &CancelToken,
    ) -> Result<SharedGuard<'_>, LockError> {
        let lock = self.lock_for(path);
        let result = lock.wait_for(
            cancel,
            |state| {
                if state.writer || state.waiting_writers > 0 {
                    return false;
                }
                state.readers += 1;
                true
            },
            |_| {},
        );

        match result {
            Ok(()) => Ok(SharedGuard {
                inner: GuardInner::new(self, path, lock),
            }),
            Err(err) => {
                drop(lock);
                self.evict_if_unused(path);
                Err(err)
            }
        }
    }

    /// Acquire an exclusive lock on `path`, waiting for every shared holder to
    /// release first.
    pub fn acquire_exclusive(
        &self,
        path: &Path,
        cancel: &CancelToken,
    ) -> Result<ExclusiveGuard<'_>, LockError> {
        let lock = self.lock_for(path);
        lock.state().waiting_writers += 1;

        let result = lock.wait_for(
            cancel,
            |state| {
                if state.writer || state.readers > 0 {
                    return false;
                }
                state.waiting_writers -= 1;
                state.writer = true;
                true
            },
            |state| state.waiting_writers -= 1,
        );

        match result {
            Ok(()) => Ok(ExclusiveGuard {
                inner: GuardInner::new(self, path, lock),
            }),
            Err(err) => {
                drop(lock);
                self.evict_if_unused(path);
                Err(err)
            }
        }
    }
}

#[derive(Debug)]
struct GuardInner<'a> {
    registry: &'a PathLockRegistry,
    path: PathBuf,
    lock: Option<Arc<PathLock>>,
}

impl<'a> GuardInner<'a> {
    fn new(registry: &'a PathLockRegistry, path: &Path, lock: Arc<PathLock>) -> Self {
        Self {
            registry,
            path: path.to_path_buf(),
            lock: Some(lock),
        }
    }

    fn release(&mut self, update: impl FnOnce(&mut LockState)) {
        if let Some(lock) = self.lock.take() {
            update(&mut *lock.state());
            lock.changed.notify_all();
            drop(lock);
            self.registry.evict_if_unused(&self.path);
        }
    }
}

/// Shared hold on a path. Released on drop.
#[derive(Debug)]
pub struct SharedGuard<'a> {
    inner: GuardInner<'a>,
}

impl SharedGuard<'_> {
    pub fn path(&self) -> &Path {
        &self.inner.path
    }
}

impl Drop for SharedGuard<'_> {
    fn drop(&mut self) {
        self.inner.release(|state| state.readers -= 1);
    }
}

/// Exclusive hold on a path. Released on drop.
#[derive(Debug)]
pub struct ExclusiveGuard<'a> {
    inner: GuardInner<'a>,
}

impl ExclusiveGuard<'_> {
    pub fn path(&self) -> &Path {
        &self.inner.path
    }
}

impl Drop for ExclusiveGuard<'_> {
    fn drop(&mut self) {
        self.inner.release(|state| state.writer = false);
    }
}
