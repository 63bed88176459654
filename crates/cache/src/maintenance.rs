//! Reconciliation of store writes that bypassed the cache tables.
//!
//! The store reports such writes through [`StoreListener`]; the
//! [`MaintenanceQueue`] collects them, coalescing duplicates, and the
//! [`MaintenanceBot`] replays each against the cache under the write lock.
//! Handlers are idempotent, so a notification delivered twice is harmless.

use std::collections::{BTreeSet, HashSet, VecDeque};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use shelfmark_core::{AuxId, MainId, naming::MAIN_TABLE};
use shelfmark_storage::{DriverWrapper, LinkChange, StoreListener};
use tracing::{debug, error, info, warn};

use crate::cache::Cache;
use crate::config::LibraryConfig;
use crate::error::CacheError;
use crate::library::{Library, WeakLibrary};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Task {
    Record {
        table: String,
        row_id: i64,
    },
    Interlink {
        change: LinkChange,
        table1: String,
        table2: String,
        id1: i64,
        id2: i64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BotState {
    Idle,
    Queued,
    Processing,
    Stopped,
}

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<Task>,
    queued: HashSet<Task>,
    processing: bool,
    stopped: bool,
}

pub(crate) enum Next {
    Task(Task),
    Idle,
    Stopped,
}

/// Pending reconciliation work, in arrival order.
#[derive(Debug, Default)]
pub struct MaintenanceQueue {
    state: Mutex<QueueState>,
    cond: Condvar,
}

impl MaintenanceQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `task` unless an identical one is already waiting. Returns
    /// whether it was added.
    pub fn enqueue(&self, task: Task) -> Result<bool, CacheError> {
        let mut state = self.state.lock();
        if state.stopped {
            return Err(CacheError::MaintenanceStopped);
        }
        if !state.queued.insert(task.clone()) {
            return Ok(false);
        }
        state.pending.push_back(task);
        self.cond.notify_one();
        Ok(true)
    }

    pub fn stop(&self) {
        let mut state = self.state.lock();
        state.stopped = true;
        state.pending.clear();
        state.queued.clear();
        self.cond.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        self.state.lock().stopped
    }

    pub fn len(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn state(&self) -> BotState {
        let state = self.state.lock();
        if state.stopped {
            BotState::Stopped
        } else if state.processing {
            BotState::Processing
        } else if !state.pending.is_empty() {
            BotState::Queued
        } else {
            BotState::Idle
        }
    }

    fn pop(state: &mut QueueState) -> Option<Task> {
        let task = state.pending.pop_front()?;
        state.queued.remove(&task);
        state.processing = true;
        Some(task)
    }

    /// Waits up to `timeout` for a task.
    pub(crate) fn next(&self, timeout: Duration) -> Next {
        let mut state = self.state.lock();
        loop {
            if state.stopped {
                return Next::Stopped;
            }
            if let Some(task) = Self::pop(&mut state) {
                return Next::Task(task);
            }
            if self.cond.wait_for(&mut state, timeout).timed_out() {
                if state.stopped {
                    return Next::Stopped;
                }
                return Self::pop(&mut state).map_or(Next::Idle, Next::Task);
            }
        }
    }

    pub(crate) fn try_next(&self) -> Option<Task> {
        let mut state = self.state.lock();
        if state.stopped {
            return None;
        }
        Self::pop(&mut state)
    }

    pub(crate) fn finish(&self) {
        self.state.lock().processing = false;
    }
}

impl StoreListener for MaintenanceQueue {
    fn dirty_record(&self, table: &str, row_id: i64) {
        let task = Task::Record {
            table: table.to_string(),
            row_id,
        };
        if let Err(e) = self.enqueue(task) {
            debug!(table, row_id, error = %e, "Record notification ignored");
        }
    }

    fn dirty_interlink_record(
        &self,
        change: LinkChange,
        table1: &str,
        table2: &str,
        id1: i64,
        id2: i64,
    ) {
        let task = Task::Interlink {
            change,
            table1: table1.to_string(),
            table2: table2.to_string(),
            id1,
            id2,
        };
        if let Err(e) = self.enqueue(task) {
            debug!(table1, table2, error = %e, "Link notification ignored");
        }
    }
}

/// Something that can replay a task.
pub trait Reconciler {
    fn reconcile(&self, task: &Task) -> Result<(), CacheError>;
}

/// Runs `task`, retrying once. A second failure is logged and the task
/// dropped. Returns whether it succeeded.
pub fn process_with_retry<R: Reconciler + ?Sized>(reconciler: &R, task: &Task) -> bool {
    for attempt in 1..=2 {
        match reconciler.reconcile(task) {
            Ok(()) => return true,
            Err(e) if attempt == 1 => {
                warn!(?task, error = %e, "Reconciliation failed, retrying");
            }
            Err(e) => {
                error!(?task, error = %e, "Reconciliation failed twice, dropping task");
            }
        }
    }
    false
}

/// Brings the cache in line with one bypassing write. The caller holds the
/// cache write lock and the store.
pub fn reconcile(
    cache: &mut Cache,
    store: &mut dyn DriverWrapper,
    config: &LibraryConfig,
    task: &Task,
) -> Result<(), CacheError> {
    match task {
        Task::Record { table, row_id } if table == MAIN_TABLE => {
            let id = MainId::new(*row_id);
            if cache.refresh_title(id, &*store)? {
                cache.mark_dirty(&[id], store)?;
                cache.recompute_aggregates(id, store)?;
            }
            Ok(())
        }
        Task::Record { table, row_id } => {
            if cache.fields_for_table(table).is_empty() {
                debug!(table = %table, "Record in a table without a field ignored");
                return Ok(());
            }
            let id = AuxId::new(*row_id);
            let owners: Vec<MainId> = cache.resync_item(table, id, &*store)?.into_iter().collect();
            cache.mark_dirty(&owners, store)?;
            for owner in &owners {
                cache.recompute_aggregates(*owner, store)?;
            }
            if config.merge_case_duplicates {
                merge_case_duplicates(cache, store, table, id)?;
            }
            Ok(())
        }
        Task::Interlink {
            table1,
            table2,
            id1,
            ..
        } if table1 == MAIN_TABLE && table2 == MAIN_TABLE => {
            cache.reload_intralinks(&*store)?;
            let id = MainId::new(*id1);
            cache.mark_dirty(&[id], store)
        }
        Task::Interlink {
            change,
            table1,
            table2,
            id1,
            id2,
        } => {
            let (table, main, item) = if table1 == MAIN_TABLE {
                (table2, *id1, *id2)
            } else if table2 == MAIN_TABLE {
                (table1, *id2, *id1)
            } else {
                return Err(CacheError::invalid(format!(
                    "link between {table1} and {table2} does not involve titles"
                )));
            };
            let main = MainId::new(main);
            cache.resync_link(table, main, &*store)?;
            cache.mark_dirty(&[main], store)?;
            cache.recompute_aggregates(main, store)?;
            if *change == LinkChange::Remove && config.auto_cleans(table) {
                cache.clean(table, &[AuxId::new(item)], store)?;
            }
            Ok(())
        }
    }
}

fn merge_case_duplicates(
    cache: &mut Cache,
    store: &mut dyn DriverWrapper,
    table: &str,
    id: AuxId,
) -> Result<(), CacheError> {
    let mut group = cache.case_duplicates(table, id);
    if group.is_empty() {
        return Ok(());
    }
    group.push(id);
    group.sort();
    let keep = group[0];
    let mut touched = BTreeSet::new();
    for discard in &group[1..] {
        touched.extend(cache.merge_items(table, keep, *discard, store)?);
    }
    for main in touched {
        cache.recompute_aggregates(main, store)?;
    }
    debug!(table, %keep, merged = group.len() - 1, "Merged case duplicates");
    Ok(())
}

/// Worker that drains the library's maintenance queue.
pub struct MaintenanceBot {
    queue: Arc<MaintenanceQueue>,
    library: WeakLibrary,
    handle: Option<JoinHandle<()>>,
}

impl MaintenanceBot {
    /// A bot without a thread; work runs only through
    /// [`MaintenanceBot::run_pending`].
    pub fn attach(library: &Library) -> Self {
        Self {
            queue: library.maintenance_queue(),
            library: library.downgrade(),
            handle: None,
        }
    }

    pub fn spawn(library: &Library) -> Result<Self, CacheError> {
        let mut bot = Self::attach(library);
        let queue = Arc::clone(&bot.queue);
        let weak = bot.library.clone();
        let poll = library.config().maintenance_poll();
        let handle = thread::Builder::new()
            .name("maintenance-bot".to_string())
            .spawn(move || run(queue, weak, poll))
            .map_err(|e| CacheError::Worker(e.to_string()))?;
        bot.handle = Some(handle);
        Ok(bot)
    }

    fn library(&self) -> Result<Library, CacheError> {
        self.library.upgrade().ok_or(CacheError::LibraryClosed)
    }

    pub fn dirty_record(&self, table: &str, row_id: i64) -> Result<bool, CacheError> {
        self.queue.enqueue(Task::Record {
            table: table.to_string(),
            row_id,
        })
    }

    pub fn dirty_interlink_record(
        &self,
        change: LinkChange,
        table1: &str,
        table2: &str,
        id1: i64,
        id2: i64,
    ) -> Result<bool, CacheError> {
        self.queue.enqueue(Task::Interlink {
            change,
            table1: table1.to_string(),
            table2: table2.to_string(),
            id1,
            id2,
        })
    }

    /// Deletes the given items of `table` that no title links to.
    pub fn clean(&self, table: &str, ids: &[AuxId]) -> Result<BTreeSet<AuxId>, CacheError> {
        if self.queue.is_stopped() {
            return Err(CacheError::MaintenanceStopped);
        }
        self.library()?.clean(table, ids)
    }

    /// Folds item `discard` into `keep` across every field on `table`.
    pub fn merge(
        &self,
        table: &str,
        keep: AuxId,
        discard: AuxId,
    ) -> Result<BTreeSet<MainId>, CacheError> {
        if self.queue.is_stopped() {
            return Err(CacheError::MaintenanceStopped);
        }
        self.library()?.merge_items(table, keep, discard)
    }

    /// Processes everything queued on the calling thread. Returns the number
    /// of tasks handled.
    pub fn run_pending(&self) -> Result<usize, CacheError> {
        let library = self.library()?;
        let mut handled = 0;
        while let Some(task) = self.queue.try_next() {
            process_with_retry(&library, &task);
            self.queue.finish();
            handled += 1;
        }
        Ok(handled)
    }

    pub fn state(&self) -> BotState {
        self.queue.state()
    }

    pub fn stop(&self) {
        self.queue.stop();
    }

    /// Stops the queue and waits for the thread, if any.
    pub fn join(mut self) {
        self.queue.stop();
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            error!("Maintenance bot thread panicked");
        }
    }
}

fn run(queue: Arc<MaintenanceQueue>, library: WeakLibrary, poll: Duration) {
    info!("Maintenance bot started");
    loop {
        match queue.next(poll) {
            Next::Stopped => break,
            Next::Idle => {
                if !library.is_alive() {
                    break;
                }
            }
            Next::Task(task) => {
                let Some(owner) = library.upgrade() else {
                    queue.finish();
                    break;
                };
                process_with_retry(&owner, &task);
                queue.finish();
            }
        }
    }
    info!("Maintenance bot stopped");
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    fn record(row_id: i64) -> Task {
        Task::Record {
            table: "tags".to_string(),
            row_id,
        }
    }

    struct Flaky {
        failures: Cell<usize>,
        calls: Cell<usize>,
    }

    impl Reconciler for Flaky {
        fn reconcile(&self, _task: &Task) -> Result<(), CacheError> {
            self.calls.set(self.calls.get() + 1);
            if self.failures.get() > 0 {
                self.failures.set(self.failures.get() - 1);
                return Err(CacheError::invalid("transient"));
            }
            Ok(())
        }
    }

    #[test]
    fn duplicate_notifications_coalesce() {
        let queue = MaintenanceQueue::new();
        assert!(queue.enqueue(record(5)).unwrap());
        assert!(!queue.enqueue(record(5)).unwrap());
        assert!(queue.enqueue(record(6)).unwrap());
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.state(), BotState::Queued);

        assert_eq!(queue.try_next(), Some(record(5)));
        assert_eq!(queue.state(), BotState::Processing);
        // Once taken, the same record can be queued again.
        assert!(queue.enqueue(record(5)).unwrap());
        queue.finish();
    }

    #[test]
    fn stopped_queue_rejects_work() {
        let queue = MaintenanceQueue::new();
        queue.enqueue(record(1)).unwrap();
        queue.stop();
        assert_eq!(queue.state(), BotState::Stopped);
        assert!(matches!(
            queue.enqueue(record(2)),
            Err(CacheError::MaintenanceStopped)
        ));
        assert!(matches!(queue.next(Duration::from_millis(1)), Next::Stopped));
    }

    #[test]
    fn empty_queue_times_out_idle() {
        let queue = MaintenanceQueue::new();
        assert!(matches!(queue.next(Duration::from_millis(5)), Next::Idle));
        assert_eq!(queue.state(), BotState::Idle);
    }

    #[test]
    fn failed_task_is_retried_once() {
        let flaky = Flaky {
            failures: Cell::new(1),
            calls: Cell::new(0),
        };
        assert!(process_with_retry(&flaky, &record(1)));
        assert_eq!(flaky.calls.get(), 2);

        let broken = Flaky {
            failures: Cell::new(5),
            calls: Cell::new(0),
        };
        assert!(!process_with_retry(&broken, &record(1)));
        assert_eq!(broken.calls.get(), 2);
    }
}
