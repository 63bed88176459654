//! Read/write locking with an atomic write-to-read downgrade.
//!
//! [`SharedLock`] tracks which threads hold it so that misuse surfaces as a
//! [`DowngradeLockError`] instead of a deadlock. [`LockManager`] pairs it
//! with the data it protects.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::thread::{self, ThreadId};

use parking_lot::{Condvar, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;
use tracing::error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DowngradeLockError {
    #[error("downgrade requires holding the write lock")]
    NotWriter,
    #[error("write lock requested while holding a read lock")]
    HoldingRead,
    #[error("read lock requested while holding the write lock")]
    HoldingWrite,
    #[error("write lock is already held by this thread")]
    AlreadyWriting,
    #[error("read lock released by a thread that does not hold it")]
    NotReader,
}

#[derive(Debug, Default)]
struct LockState {
    readers: HashMap<ThreadId, usize>,
    writer: Option<ThreadId>,
    waiting_writers: usize,
}

/// Many readers or one writer. Read locks are reentrant per thread; the
/// write lock is not. Waiting writers hold back readers from other threads.
#[derive(Debug, Default)]
pub struct SharedLock {
    state: Mutex<LockState>,
    cond: Condvar,
}

impl SharedLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire_read(&self) -> Result<(), DowngradeLockError> {
        let me = thread::current().id();
        let mut state = self.state.lock();
        if state.writer == Some(me) {
            return Err(DowngradeLockError::HoldingWrite);
        }
        if let Some(count) = state.readers.get_mut(&me) {
            *count += 1;
            return Ok(());
        }
        while state.writer.is_some() || state.waiting_writers > 0 {
            self.cond.wait(&mut state);
        }
        state.readers.insert(me, 1);
        Ok(())
    }

    pub fn release_read(&self) -> Result<(), DowngradeLockError> {
        let me = thread::current().id();
        let mut state = self.state.lock();
        let count = state
            .readers
            .get_mut(&me)
            .ok_or(DowngradeLockError::NotReader)?;
        *count -= 1;
        if *count == 0 {
            state.readers.remove(&me);
            if state.readers.is_empty() {
                self.cond.notify_all();
            }
        }
        Ok(())
    }

    pub fn acquire_write(&self) -> Result<(), DowngradeLockError> {
        let me = thread::current().id();
        let mut state = self.state.lock();
        if state.writer == Some(me) {
            return Err(DowngradeLockError::AlreadyWriting);
        }
        if state.readers.contains_key(&me) {
            return Err(DowngradeLockError::HoldingRead);
        }
        state.waiting_writers += 1;
        while state.writer.is_some() || !state.readers.is_empty() {
            self.cond.wait(&mut state);
        }
        state.waiting_writers -= 1;
        state.writer = Some(me);
        Ok(())
    }

    pub fn release_write(&self) -> Result<(), DowngradeLockError> {
        let me = thread::current().id();
        let mut state = self.state.lock();
        if state.writer != Some(me) {
            return Err(DowngradeLockError::NotWriter);
        }
        state.writer = None;
        self.cond.notify_all();
        Ok(())
    }

    /// Turns the calling thread's write lock into a read lock. No other
    /// writer can get in between.
    pub fn downgrade(&self) -> Result<(), DowngradeLockError> {
        let me = thread::current().id();
        let mut state = self.state.lock();
        if state.writer != Some(me) {
            return Err(DowngradeLockError::NotWriter);
        }
        state.writer = None;
        state.readers.insert(me, 1);
        self.cond.notify_all();
        Ok(())
    }

    pub fn held_for_write(&self) -> bool {
        self.state.lock().writer == Some(thread::current().id())
    }

    pub fn held_for_read(&self) -> bool {
        self.state
            .lock()
            .readers
            .contains_key(&thread::current().id())
    }
}

struct ReadRelease<'a>(&'a SharedLock);

impl Drop for ReadRelease<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.0.release_read() {
            error!(error = %e, "Failed to release read lock");
        }
    }
}

struct WriteRelease<'a>(&'a SharedLock);

impl Drop for WriteRelease<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.0.release_write() {
            error!(error = %e, "Failed to release write lock");
        }
    }
}

/// Owns a value and hands out tracked read and write guards to it.
#[derive(Debug)]
pub struct LockManager<T> {
    lock: SharedLock,
    data: RwLock<T>,
}

impl<T> LockManager<T> {
    pub fn new(data: T) -> Self {
        Self {
            lock: SharedLock::new(),
            data: RwLock::new(data),
        }
    }

    pub fn read(&self) -> Result<ReadGuard<'_, T>, DowngradeLockError> {
        self.lock.acquire_read()?;
        Ok(ReadGuard {
            guard: self.data.read_recursive(),
            _release: ReadRelease(&self.lock),
        })
    }

    pub fn write(&self) -> Result<WriteGuard<'_, T>, DowngradeLockError> {
        self.lock.acquire_write()?;
        Ok(WriteGuard {
            guard: self.data.write(),
            release: WriteRelease(&self.lock),
        })
    }

    pub fn shared_lock(&self) -> &SharedLock {
        &self.lock
    }
}

// Field order matters: the data guard drops before the lock is released.
pub struct ReadGuard<'a, T> {
    guard: RwLockReadGuard<'a, T>,
    _release: ReadRelease<'a>,
}

impl<T> Deref for ReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

pub struct WriteGuard<'a, T> {
    guard: RwLockWriteGuard<'a, T>,
    release: WriteRelease<'a>,
}

impl<'a, T> WriteGuard<'a, T> {
    pub fn downgrade(self) -> Result<ReadGuard<'a, T>, DowngradeLockError> {
        let WriteGuard { guard, release } = self;
        let lock = release.0;
        lock.downgrade()?;
        std::mem::forget(release);
        Ok(ReadGuard {
            guard: RwLockWriteGuard::downgrade(guard),
            _release: ReadRelease(lock),
        })
    }
}

impl<T> Deref for WriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for WriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn downgrade_without_write_lock_fails() {
        let lock = SharedLock::new();
        assert_eq!(lock.downgrade(), Err(DowngradeLockError::NotWriter));
        lock.acquire_read().unwrap();
        assert_eq!(lock.downgrade(), Err(DowngradeLockError::NotWriter));
        lock.release_read().unwrap();
    }

    #[test]
    fn write_while_reading_fails() {
        let manager = LockManager::new(5);
        let guard = manager.read().unwrap();
        assert!(matches!(manager.write(), Err(DowngradeLockError::HoldingRead)));
        assert_eq!(*guard, 5);
    }

    #[test]
    fn read_while_writing_fails() {
        let manager = LockManager::new(5);
        let mut guard = manager.write().unwrap();
        *guard = 6;
        assert!(matches!(manager.read(), Err(DowngradeLockError::HoldingWrite)));
        let guard = guard.downgrade().unwrap();
        assert_eq!(*guard, 6);
        assert!(manager.shared_lock().held_for_read());
        assert!(!manager.shared_lock().held_for_write());
    }

    #[test]
    fn reads_are_reentrant() {
        let manager = LockManager::new(String::from("x"));
        let a = manager.read().unwrap();
        let b = manager.read().unwrap();
        assert_eq!(*a, *b);
        drop(a);
        drop(b);
        assert!(!manager.shared_lock().held_for_read());
        assert!(manager.write().is_ok());
    }
}
