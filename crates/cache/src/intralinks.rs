use std::collections::{BTreeMap, BTreeSet, HashMap};

use shelfmark_core::{
    FieldValue, MainId,
    naming::{ColumnType, MAIN_TABLE},
};
use shelfmark_storage::{DriverWrapper, Statement};

use crate::error::CacheError;

/// Title-to-title links (translations, omnibus contents, alternate editions).
pub struct Intralinks {
    link_table: String,
    primary_col: String,
    secondary_col: String,
    type_col: String,
    outgoing: HashMap<MainId, BTreeMap<MainId, String>>,
    incoming: HashMap<MainId, BTreeSet<MainId>>,
}

impl Intralinks {
    pub fn new(store: &dyn DriverWrapper) -> Result<Self, CacheError> {
        let column = |ct: ColumnType| store.get_interlink_column(MAIN_TABLE, MAIN_TABLE, &ct);
        Ok(Self {
            link_table: store.get_link_table_name(MAIN_TABLE, MAIN_TABLE)?,
            primary_col: column(ColumnType::Primary)?,
            secondary_col: column(ColumnType::Secondary)?,
            type_col: column(ColumnType::Type)?,
            outgoing: HashMap::new(),
            incoming: HashMap::new(),
        })
    }

    pub fn read(&mut self, store: &dyn DriverWrapper) -> Result<(), CacheError> {
        self.outgoing.clear();
        self.incoming.clear();
        let rows = store.execute(&Statement::new(format!(
            "SELECT {}, {}, {} FROM {}",
            self.primary_col, self.secondary_col, self.type_col, self.link_table
        )))?;
        for row in rows {
            let id = |i: usize| {
                row.get(i)
                    .and_then(FieldValue::as_integer)
                    .map(MainId::new)
                    .ok_or_else(|| CacheError::integrity("non-integer title id in intralinks"))
            };
            let link_type = row.get(2).and_then(FieldValue::as_text).unwrap_or_default();
            self.insert(id(0)?, id(1)?, link_type);
        }
        Ok(())
    }

    fn insert(&mut self, primary: MainId, secondary: MainId, link_type: &str) {
        self.outgoing
            .entry(primary)
            .or_default()
            .insert(secondary, link_type.to_string());
        self.incoming.entry(secondary).or_default().insert(primary);
    }

    /// Titles linked to `main` in either direction.
    pub fn linked(&self, main: MainId) -> BTreeSet<MainId> {
        let mut out: BTreeSet<MainId> = self
            .outgoing
            .get(&main)
            .map(|m| m.keys().copied().collect())
            .unwrap_or_default();
        if let Some(incoming) = self.incoming.get(&main) {
            out.extend(incoming.iter().copied());
        }
        out
    }

    pub fn link_type(&self, primary: MainId, secondary: MainId) -> Option<&str> {
        self.outgoing.get(&primary)?.get(&secondary).map(String::as_str)
    }

    pub(crate) fn plan_insert(
        &self,
        primary: MainId,
        secondary: MainId,
        link_type: &str,
    ) -> Result<Statement, CacheError> {
        if primary == secondary {
            return Err(CacheError::invalid(format!("title {primary} cannot link to itself")));
        }
        if self.linked(primary).contains(&secondary) {
            return Err(CacheError::invalid(format!(
                "titles {primary} and {secondary} are already linked"
            )));
        }
        Ok(Statement::new(format!(
            "INSERT INTO {} ({}, {}, {}) VALUES (?1, ?2, ?3)",
            self.link_table, self.primary_col, self.secondary_col, self.type_col
        ))
        .bind(primary.get())
        .bind(secondary.get())
        .bind(link_type))
    }

    pub(crate) fn apply_insert(&mut self, primary: MainId, secondary: MainId, link_type: &str) {
        self.insert(primary, secondary, link_type);
    }

    pub(crate) fn remove_statements(&self, ids: &[MainId]) -> Vec<Statement> {
        ids.iter()
            .map(|id| {
                Statement::new(format!(
                    "DELETE FROM {} WHERE {} = ?1 OR {} = ?1",
                    self.link_table, self.primary_col, self.secondary_col
                ))
                .bind(id.get())
            })
            .collect()
    }

    pub(crate) fn apply_remove(&mut self, ids: &[MainId]) {
        for id in ids {
            if let Some(targets) = self.outgoing.remove(id) {
                for target in targets.keys() {
                    if let Some(sources) = self.incoming.get_mut(target) {
                        sources.remove(id);
                    }
                }
            }
            if let Some(sources) = self.incoming.remove(id) {
                for source in sources {
                    if let Some(targets) = self.outgoing.get_mut(&source) {
                        targets.remove(id);
                    }
                }
            }
        }
    }
}
