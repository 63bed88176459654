//! Thread-safe handle to one library: the cache behind its lock manager, the
//! store behind a mutex, the maintenance queue and the background workers.
//!
//! Every method takes the cache lock first and the store second.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use shelfmark_core::{
    AuxId, FieldValue, LibraryId, MainId,
    shape::{TableShape, ValueKind},
};
use shelfmark_storage::{DriverWrapper, SqliteStore, StorageError};
use tracing::info;

use crate::backup::MetadataBackup;
use crate::cache::Cache;
use crate::config::LibraryConfig;
use crate::error::CacheError;
use crate::fingerprint::{self, Fingerprint};
use crate::locking::{LockManager, ReadGuard};
use crate::maintenance::{self, BotState, MaintenanceBot, MaintenanceQueue, Reconciler, Task};
use crate::metadata::BookMetadata;
use crate::table::{IdMap, UpdateMap, UpdateOutcome};

#[derive(Default)]
struct Workers {
    bot: Option<MaintenanceBot>,
    backup: Option<MetadataBackup>,
}

pub(crate) struct LibraryInner {
    cache: LockManager<Cache>,
    store: Mutex<SqliteStore>,
    queue: Arc<MaintenanceQueue>,
    config: LibraryConfig,
    workers: Mutex<Workers>,
}

impl Drop for LibraryInner {
    fn drop(&mut self) {
        self.queue.stop();
        if let Some(backup) = &self.workers.get_mut().backup {
            backup.stop();
        }
    }
}

#[derive(Clone)]
pub struct Library {
    inner: Arc<LibraryInner>,
}

/// Non-owning handle held by background workers.
#[derive(Clone)]
pub struct WeakLibrary(Weak<LibraryInner>);

impl WeakLibrary {
    pub fn upgrade(&self) -> Option<Library> {
        self.0.upgrade().map(|inner| Library { inner })
    }

    pub fn is_alive(&self) -> bool {
        self.0.strong_count() > 0
    }
}

impl Library {
    pub fn open(path: &str, config: LibraryConfig) -> Result<Self, CacheError> {
        let queue = Arc::new(MaintenanceQueue::new());
        let store = SqliteStore::open_with_listener(path, queue.clone())?;
        Self::from_store(store, queue, config)
    }

    pub fn open_in_memory(config: LibraryConfig) -> Result<Self, CacheError> {
        let queue = Arc::new(MaintenanceQueue::new());
        let store = SqliteStore::open_in_memory_with_listener(queue.clone())?;
        Self::from_store(store, queue, config)
    }

    fn from_store(
        store: SqliteStore,
        queue: Arc<MaintenanceQueue>,
        config: LibraryConfig,
    ) -> Result<Self, CacheError> {
        let cache = Cache::load(&store)?;
        let start_workers = config.start_workers;
        let library = Self {
            inner: Arc::new(LibraryInner {
                cache: LockManager::new(cache),
                store: Mutex::new(store),
                queue,
                config,
                workers: Mutex::new(Workers::default()),
            }),
        };
        if start_workers {
            library.start_workers()?;
        }
        Ok(library)
    }

    /// Starts the maintenance bot and backup threads if not yet running.
    pub fn start_workers(&self) -> Result<(), CacheError> {
        let mut workers = self.inner.workers.lock();
        if workers.bot.is_none() {
            workers.bot = Some(MaintenanceBot::spawn(self)?);
        }
        if workers.backup.is_none() {
            workers.backup = Some(MetadataBackup::spawn(self, self.inner.config.backup_interval())?);
        }
        info!(library_id = %self.library_id(), "Library workers started");
        Ok(())
    }

    /// Stops the workers and waits for them to exit.
    pub fn close(self) {
        self.inner.queue.stop();
        let workers = std::mem::take(&mut *self.inner.workers.lock());
        if let Some(backup) = workers.backup {
            backup.join();
        }
        if let Some(bot) = workers.bot {
            bot.join();
        }
        info!("Library closed");
    }

    pub fn downgrade(&self) -> WeakLibrary {
        WeakLibrary(Arc::downgrade(&self.inner))
    }

    pub fn config(&self) -> &LibraryConfig {
        &self.inner.config
    }

    pub fn library_id(&self) -> LibraryId {
        self.inner.store.lock().library_id()
    }

    pub(crate) fn maintenance_queue(&self) -> Arc<MaintenanceQueue> {
        Arc::clone(&self.inner.queue)
    }

    // ===== Locking =====

    /// Shared access to the cache.
    pub fn read(&self) -> Result<ReadGuard<'_, Cache>, CacheError> {
        Ok(self.inner.cache.read()?)
    }

    fn with_read<R>(&self, f: impl FnOnce(&Cache) -> R) -> Result<R, CacheError> {
        let cache = self.inner.cache.read()?;
        Ok(f(&*cache))
    }

    fn with_write<R>(
        &self,
        f: impl FnOnce(&mut Cache, &mut SqliteStore) -> Result<R, CacheError>,
    ) -> Result<R, CacheError> {
        let mut cache = self.inner.cache.write()?;
        let mut store = self.inner.store.lock();
        f(&mut *cache, &mut *store)
    }

    /// Runs `f` under the write lock, then downgrades to a read lock with no
    /// window for another writer.
    pub fn write_and_downgrade(
        &self,
        f: impl FnOnce(&mut Cache, &mut SqliteStore) -> Result<(), CacheError>,
    ) -> Result<ReadGuard<'_, Cache>, CacheError> {
        let mut cache = self.inner.cache.write()?;
        {
            let mut store = self.inner.store.lock();
            f(&mut *cache, &mut *store)?;
        }
        Ok(cache.downgrade()?)
    }

    /// Direct store access for writes that bypass the cache. The store
    /// reports them to the maintenance queue.
    pub fn with_raw_store<R>(
        &self,
        f: impl FnOnce(&mut SqliteStore) -> Result<R, StorageError>,
    ) -> Result<R, CacheError> {
        let _cache = self.inner.cache.write()?;
        let mut store = self.inner.store.lock();
        Ok(f(&mut *store)?)
    }

    // ===== Titles =====

    pub fn create_title(&self, title: &str) -> Result<MainId, CacheError> {
        self.with_write(|cache, store| cache.create_title(title, store))
    }

    pub fn set_title(&self, id: MainId, title: &str) -> Result<(), CacheError> {
        self.with_write(|cache, store| cache.set_title(id, title, store))
    }

    pub fn remove_titles(
        &self,
        ids: &[MainId],
    ) -> Result<BTreeMap<String, BTreeSet<AuxId>>, CacheError> {
        self.with_write(|cache, store| cache.remove_titles(ids, store))
    }

    pub fn all_title_ids(&self) -> Result<Vec<MainId>, CacheError> {
        self.with_read(Cache::all_title_ids)
    }

    pub fn add_intralink(
        &self,
        primary: MainId,
        secondary: MainId,
        link_type: &str,
    ) -> Result<(), CacheError> {
        self.with_write(|cache, store| cache.add_intralink(primary, secondary, link_type, store))
    }

    // ===== Fields =====

    pub fn field_ids_for(&self, field: &str, main: MainId) -> Result<Vec<AuxId>, CacheError> {
        self.with_read(|cache| cache.field_ids_for(field, main))?
    }

    pub fn books_for_field(&self, field: &str, item: AuxId) -> Result<Vec<MainId>, CacheError> {
        self.with_read(|cache| cache.books_for_field(field, item))?
    }

    pub fn set_field(
        &self,
        field: &str,
        updates: &UpdateMap,
        id_map: &IdMap,
        allow_case_change: bool,
    ) -> Result<UpdateOutcome, CacheError> {
        self.with_write(|cache, store| {
            cache.set_field(field, updates, id_map, allow_case_change, store)
        })
    }

    pub fn link_values(
        &self,
        field: &str,
        main: MainId,
        values: &[FieldValue],
        allow_case_change: bool,
    ) -> Result<Vec<AuxId>, CacheError> {
        self.with_write(|cache, store| {
            cache.link_values(field, main, values, allow_case_change, store)
        })
    }

    pub fn link_typed_values(
        &self,
        field: &str,
        main: MainId,
        link_type: &str,
        values: &[FieldValue],
        allow_case_change: bool,
    ) -> Result<Vec<AuxId>, CacheError> {
        self.with_write(|cache, store| {
            cache.link_typed_values(field, main, link_type, values, allow_case_change, store)
        })
    }

    pub fn remove_items(
        &self,
        field: &str,
        ids: &[AuxId],
        restrict_to_book_ids: Option<&[MainId]>,
    ) -> Result<BTreeSet<MainId>, CacheError> {
        self.with_write(|cache, store| cache.remove_items(field, ids, restrict_to_book_ids, store))
    }

    pub fn rename_item(
        &self,
        field: &str,
        id: AuxId,
        new_value: FieldValue,
    ) -> Result<AuxId, CacheError> {
        self.with_write(|cache, store| cache.rename_item(field, id, new_value, store))
    }

    pub fn merge_items(
        &self,
        table: &str,
        keep: AuxId,
        discard: AuxId,
    ) -> Result<BTreeSet<MainId>, CacheError> {
        self.with_write(|cache, store| cache.merge_items(table, keep, discard, store))
    }

    pub fn clean(&self, table: &str, ids: &[AuxId]) -> Result<BTreeSet<AuxId>, CacheError> {
        self.with_write(|cache, store| cache.clean(table, ids, store))
    }

    pub fn set_link_attribute(
        &self,
        field: &str,
        attribute: &str,
        main: MainId,
        item: AuxId,
        value: FieldValue,
    ) -> Result<(), CacheError> {
        self.with_write(|cache, store| {
            cache.set_link_attribute(field, attribute, main, item, value, store)
        })
    }

    /// Creates a custom field and loads it. Returns the link table created.
    pub fn create_custom_column(
        &self,
        label: &str,
        shape: TableShape,
        value_kind: ValueKind,
    ) -> Result<String, CacheError> {
        self.with_write(|cache, store| {
            cache
                .create_custom_column(label, shape, value_kind, store)
                .map(|record| record.link_table)
        })
    }

    // ===== Dirtied titles and backups =====

    pub fn mark_dirty(&self, ids: &[MainId]) -> Result<(), CacheError> {
        self.with_write(|cache, store| cache.mark_dirty(ids, store))
    }

    pub fn get_a_dirtied_book(&self) -> Result<Option<MainId>, CacheError> {
        self.with_read(Cache::get_a_dirtied_book)
    }

    pub fn get_metadata_for_dump(
        &self,
        id: MainId,
    ) -> Result<Option<(BookMetadata, u64)>, CacheError> {
        self.with_read(|cache| cache.get_metadata_for_dump(id))
    }

    pub fn write_backup(&self, id: MainId, payload: &[u8]) -> Result<bool, CacheError> {
        self.with_write(|cache, store| cache.write_backup(id, payload, store))
    }

    pub fn clear_dirtied(&self, id: MainId, sequence: u64) -> Result<bool, CacheError> {
        self.with_write(|cache, store| cache.clear_dirtied(id, sequence, store))
    }

    pub fn read_backup(&self, id: MainId) -> Result<Option<BookMetadata>, CacheError> {
        let cache = self.inner.cache.read()?;
        let store = self.inner.store.lock();
        cache.read_backup(id, &*store)
    }

    pub fn book_metadata(&self, id: MainId) -> Result<Option<BookMetadata>, CacheError> {
        self.with_read(|cache| cache.book_metadata(id))
    }

    // ===== Duplicates =====

    pub fn fingerprint(&self, id: MainId) -> Result<Fingerprint, CacheError> {
        self.with_read(|cache| fingerprint::fingerprint(cache, id))?
    }

    pub fn probable_duplicates(
        &self,
        id: MainId,
        threshold: f64,
    ) -> Result<Vec<(MainId, f64)>, CacheError> {
        self.with_read(|cache| fingerprint::probable_duplicates(cache, id, threshold))?
    }

    // ===== Maintenance =====

    /// Handles every queued reconciliation task on the calling thread.
    pub fn run_maintenance(&self) -> Result<usize, CacheError> {
        MaintenanceBot::attach(self).run_pending()
    }

    pub fn maintenance_state(&self) -> BotState {
        self.inner.queue.state()
    }
}

impl Reconciler for Library {
    fn reconcile(&self, task: &Task) -> Result<(), CacheError> {
        let config = &self.inner.config;
        self.with_write(|cache, store| maintenance::reconcile(cache, store, config, task))
    }
}
