//! Periodic metadata backup of dirtied titles.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use shelfmark_core::MainId;
use tracing::{debug, error, info, instrument, warn};

use crate::error::CacheError;
use crate::library::{Library, WeakLibrary};

/// Interruptible sleep shared between a worker and its owner.
#[derive(Debug, Default)]
pub struct StopSignal {
    stopped: Mutex<bool>,
    cond: Condvar,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        *self.stopped.lock() = true;
        self.cond.notify_all();
    }

    pub fn is_triggered(&self) -> bool {
        *self.stopped.lock()
    }

    /// Sleeps up to `timeout`; returns true as soon as the signal fires.
    pub fn wait(&self, timeout: Duration) -> bool {
        let mut stopped = self.stopped.lock();
        if !*stopped {
            self.cond.wait_for(&mut stopped, timeout);
        }
        *stopped
    }
}

/// Outcome of one backup step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupStep {
    /// Nothing was dirtied.
    Idle,
    /// The title's backup was written (or was already identical) and its
    /// mark cleared.
    Saved(MainId),
    /// The title changed again while it was being dumped; it stays dirtied.
    Stale(MainId),
    /// The title vanished between being picked and being dumped.
    Gone(MainId),
}

fn retry_once<T>(
    what: &str,
    id: MainId,
    mut f: impl FnMut() -> Result<T, CacheError>,
) -> Result<T, CacheError> {
    match f() {
        Ok(value) => Ok(value),
        Err(e) => {
            warn!(%id, error = %e, "Backup {what} failed, retrying");
            f()
        }
    }
}

/// Backs up one randomly chosen dirtied title.
#[instrument(skip_all)]
pub fn backup_one(library: &Library) -> Result<BackupStep, CacheError> {
    let Some(id) = library.get_a_dirtied_book()? else {
        return Ok(BackupStep::Idle);
    };
    let Some((metadata, sequence)) = retry_once("fetch", id, || library.get_metadata_for_dump(id))?
    else {
        return Ok(BackupStep::Gone(id));
    };
    let payload = metadata.to_msgpack()?;
    let written = retry_once("write", id, || library.write_backup(id, &payload))?;
    if !library.clear_dirtied(id, sequence)? {
        return Ok(BackupStep::Stale(id));
    }
    debug!(%id, sequence, written, bytes = payload.len(), "Backed up title");
    Ok(BackupStep::Saved(id))
}

/// Backs up dirtied titles until none are left or `limit` steps have run.
/// Returns the number of titles saved.
pub fn backup_all(library: &Library, limit: usize) -> Result<usize, CacheError> {
    let mut saved = 0;
    for _ in 0..limit {
        match backup_one(library)? {
            BackupStep::Idle => break,
            BackupStep::Saved(_) => saved += 1,
            BackupStep::Stale(_) | BackupStep::Gone(_) => {}
        }
    }
    Ok(saved)
}

/// Background thread running [`backup_one`] every interval.
pub struct MetadataBackup {
    stop: Arc<StopSignal>,
    handle: Option<JoinHandle<()>>,
}

impl MetadataBackup {
    pub fn spawn(library: &Library, interval: Duration) -> Result<Self, CacheError> {
        let stop = Arc::new(StopSignal::new());
        let worker_stop = Arc::clone(&stop);
        let weak = library.downgrade();
        let handle = thread::Builder::new()
            .name("metadata-backup".to_string())
            .spawn(move || run(weak, worker_stop, interval))
            .map_err(|e| CacheError::Worker(e.to_string()))?;
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    pub fn stop(&self) {
        self.stop.trigger();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(JoinHandle::is_finished)
    }

    pub fn join(mut self) {
        self.stop.trigger();
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            error!("Metadata backup thread panicked");
        }
    }
}

fn run(library: WeakLibrary, stop: Arc<StopSignal>, interval: Duration) {
    info!(interval_ms = interval.as_millis() as u64, "Metadata backup started");
    while !stop.wait(interval) {
        let Some(owner) = library.upgrade() else {
            break;
        };
        if let Err(e) = backup_one(&owner) {
            warn!(error = %e, "Metadata backup step failed");
        }
    }
    info!("Metadata backup stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_signal_interrupts_wait() {
        let signal = Arc::new(StopSignal::new());
        assert!(!signal.wait(Duration::from_millis(1)));
        let remote = Arc::clone(&signal);
        let waiter = thread::spawn(move || remote.wait(Duration::from_secs(30)));
        thread::sleep(Duration::from_millis(20));
        signal.trigger();
        assert!(waiter.join().unwrap());
        assert!(signal.is_triggered());
    }
}
