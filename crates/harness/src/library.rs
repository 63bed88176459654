use std::error::Error;
use std::ops::Deref;
use std::path::PathBuf;

use shelfmark_cache::{CacheError, Library, LibraryConfig, TableSnapshot};
use shelfmark_core::{AuxId, FieldValue, MainId};
use tempfile::TempDir;

/// A library with no background workers, in memory or in a temporary
/// directory.
pub struct TestLibrary {
    pub library: Library,
    path: Option<PathBuf>,
    _dir: Option<TempDir>,
}

impl Deref for TestLibrary {
    type Target = Library;

    fn deref(&self) -> &Library {
        &self.library
    }
}

impl TestLibrary {
    pub fn new() -> Result<Self, CacheError> {
        Self::with_config(LibraryConfig::manual())
    }

    pub fn with_config(config: LibraryConfig) -> Result<Self, CacheError> {
        Ok(Self {
            library: Library::open_in_memory(config)?,
            path: None,
            _dir: None,
        })
    }

    /// A library backed by a file, so it can be reopened.
    pub fn on_disk() -> Result<Self, Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("library.db");
        let library = Library::open(path_str(&path)?, LibraryConfig::manual())?;
        Ok(Self {
            library,
            path: Some(path),
            _dir: Some(dir),
        })
    }

    /// Opens a second, freshly loaded library on the same file.
    pub fn reopen(&self) -> Result<Library, Box<dyn Error>> {
        let path = self.path.as_ref().ok_or("in-memory library cannot be reopened")?;
        Ok(Library::open(path_str(path)?, LibraryConfig::manual())?)
    }

    pub fn titles(&self, names: &[&str]) -> Result<Vec<MainId>, CacheError> {
        names.iter().map(|name| self.create_title(name)).collect()
    }

    /// Replaces a title's links in `field` by display value.
    pub fn link(&self, field: &str, main: MainId, values: &[&str]) -> Result<Vec<AuxId>, CacheError> {
        self.link_values(field, main, &text_values(values), false)
    }

    pub fn link_typed(
        &self,
        field: &str,
        main: MainId,
        link_type: &str,
        values: &[&str],
    ) -> Result<Vec<AuxId>, CacheError> {
        self.link_typed_values(field, main, link_type, &text_values(values), false)
    }

    /// Display values of a title's links, in link order.
    pub fn names(&self, field: &str, main: MainId) -> Result<Vec<String>, CacheError> {
        let cache = self.read()?;
        let table = cache.table(field)?;
        Ok(table
            .main_links(main)
            .into_iter()
            .filter_map(|item| table.item_value(item).map(FieldValue::display))
            .collect())
    }

    pub fn snapshot(&self, field: &str) -> Result<TableSnapshot, CacheError> {
        Ok(self.read()?.table(field)?.snapshot())
    }

    pub fn item_value(&self, field: &str, item: AuxId) -> Result<Option<FieldValue>, CacheError> {
        Ok(self.read()?.table(field)?.item_value(item).cloned())
    }

    /// Inserts an item behind the cache's back.
    pub fn raw_item(&self, table: &str, value: &str) -> Result<AuxId, CacheError> {
        let id = self.with_raw_store(|store| store.insert_item(table, &FieldValue::from(value)))?;
        Ok(AuxId::new(id))
    }

    /// Inserts a link behind the cache's back.
    pub fn raw_link(
        &self,
        table: &str,
        main: MainId,
        item: AuxId,
        priority: Option<i64>,
        link_type: Option<&str>,
    ) -> Result<(), CacheError> {
        self.with_raw_store(|store| {
            store.insert_link(table, main.get(), item.get(), priority, link_type)
        })
    }
}

pub fn text_values(values: &[&str]) -> Vec<FieldValue> {
    values.iter().map(|v| FieldValue::from(*v)).collect()
}

fn path_str(path: &std::path::Path) -> Result<&str, Box<dyn Error>> {
    path.to_str().ok_or_else(|| "non-UTF-8 temp path".into())
}
