//! Scalar attributes stored on link rows, such as a title's position within
//! a series.

use std::collections::HashMap;

use shelfmark_core::{
    AuxId, FieldValue, MainId,
    naming::{ColumnType, MAIN_TABLE},
};
use shelfmark_storage::{DriverWrapper, Statement};
use tracing::debug;

use crate::error::CacheError;
use crate::table::CacheTable;
use crate::table::writer::priority_for;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributeSort {
    /// By the attribute value itself.
    Attribute,
    /// By the link's priority column, highest first.
    Priority,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkAttributeKind {
    Plain,
    PrioritySortable,
}

pub struct LinkAttributeTable {
    field: String,
    attribute: String,
    kind: LinkAttributeKind,
    link_table: String,
    main_col: String,
    item_col: String,
    value_col: String,
    priority_col: Option<String>,
    by_main: HashMap<MainId, HashMap<AuxId, FieldValue>>,
    by_aux: HashMap<AuxId, HashMap<MainId, FieldValue>>,
    priorities: HashMap<(MainId, AuxId), i64>,
}

impl LinkAttributeTable {
    /// Picks the variant matching the backing table's shape.
    pub fn for_table(
        table: &CacheTable,
        attribute: &str,
        store: &dyn DriverWrapper,
    ) -> Result<Self, CacheError> {
        let kind = if table.shape().priority {
            LinkAttributeKind::PrioritySortable
        } else {
            LinkAttributeKind::Plain
        };
        let columns = table.columns();
        let value_col = store.get_interlink_column(
            MAIN_TABLE,
            table.table(),
            &ColumnType::attribute(attribute),
        )?;
        Ok(Self {
            field: table.field().to_string(),
            attribute: attribute.to_string(),
            kind,
            link_table: columns.link_table.clone(),
            main_col: columns.main.clone(),
            item_col: columns.item.clone(),
            value_col,
            priority_col: columns.priority.clone(),
            by_main: HashMap::new(),
            by_aux: HashMap::new(),
            priorities: HashMap::new(),
        })
    }

    pub fn field(&self) -> &str {
        &self.field
    }

    pub fn attribute(&self) -> &str {
        &self.attribute
    }

    pub fn kind(&self) -> LinkAttributeKind {
        self.kind
    }

    pub fn read(&mut self, store: &dyn DriverWrapper) -> Result<(), CacheError> {
        let mut select = vec![
            self.value_col.as_str(),
            self.main_col.as_str(),
            self.item_col.as_str(),
        ];
        if let Some(priority_col) = &self.priority_col {
            select.push(priority_col);
        }
        let sql = format!(
            "SELECT {} FROM {} WHERE {} IS NOT NULL",
            select.join(", "),
            self.link_table,
            self.value_col
        );

        self.by_main.clear();
        self.by_aux.clear();
        self.priorities.clear();
        for row in store.execute(&Statement::new(sql))? {
            let id_at = |i: usize| {
                row.get(i).and_then(FieldValue::as_integer).ok_or_else(|| {
                    CacheError::integrity(format!("non-integer id in {}", self.link_table))
                })
            };
            let main = MainId::new(id_at(1)?);
            let item = AuxId::new(id_at(2)?);
            if self.priority_col.is_some() {
                self.priorities.insert((main, item), id_at(3)?);
            }
            let value = row.first().cloned().unwrap_or(FieldValue::Null);
            self.insert(main, item, value);
        }
        debug!(field = %self.field, attribute = %self.attribute, titles = self.by_main.len(), "Link attributes loaded");
        Ok(())
    }

    fn insert(&mut self, main: MainId, item: AuxId, value: FieldValue) {
        self.by_main.entry(main).or_default().insert(item, value.clone());
        self.by_aux.entry(item).or_default().insert(main, value);
    }

    fn remove(&mut self, main: MainId, item: AuxId) {
        if let Some(values) = self.by_main.get_mut(&main) {
            values.remove(&item);
            if values.is_empty() {
                self.by_main.remove(&main);
            }
        }
        if let Some(values) = self.by_aux.get_mut(&item) {
            values.remove(&main);
            if values.is_empty() {
                self.by_aux.remove(&item);
            }
        }
        self.priorities.remove(&(main, item));
    }

    // ===== Lookups =====

    pub fn get_property(&self, main: MainId, item: AuxId) -> Option<FieldValue> {
        self.by_main.get(&main)?.get(&item).cloned()
    }

    pub fn get_main_val_dict(&self, main: MainId) -> HashMap<AuxId, FieldValue> {
        self.by_main.get(&main).cloned().unwrap_or_default()
    }

    pub fn get_auxiliary_val_dict(&self, item: AuxId) -> HashMap<MainId, FieldValue> {
        self.by_aux.get(&item).cloned().unwrap_or_default()
    }

    /// Titles carrying the attribute on their link to `item`.
    pub fn get_sorted_main_values(
        &self,
        item: AuxId,
        sort: AttributeSort,
    ) -> Result<Vec<MainId>, CacheError> {
        let values = self.by_aux.get(&item);
        let mut mains: Vec<MainId> = values.map(|v| v.keys().copied().collect()).unwrap_or_default();
        match sort {
            AttributeSort::Attribute => mains.sort_by(|a, b| {
                let (va, vb) = values
                    .map(|v| (v.get(a), v.get(b)))
                    .unwrap_or((None, None));
                cmp_values(va, vb).then(a.cmp(b))
            }),
            AttributeSort::Priority => {
                self.require_priority()?;
                mains.sort_by(|a, b| {
                    let pa = self.priorities.get(&(*a, item));
                    let pb = self.priorities.get(&(*b, item));
                    pb.cmp(&pa).then(a.cmp(b))
                });
            }
        }
        Ok(mains)
    }

    /// Items whose link from `main` carries the attribute.
    pub fn get_sorted_auxiliary_values(
        &self,
        main: MainId,
        sort: AttributeSort,
    ) -> Result<Vec<AuxId>, CacheError> {
        let values = self.by_main.get(&main);
        let mut items: Vec<AuxId> = values.map(|v| v.keys().copied().collect()).unwrap_or_default();
        match sort {
            AttributeSort::Attribute => items.sort_by(|a, b| {
                let (va, vb) = values
                    .map(|v| (v.get(a), v.get(b)))
                    .unwrap_or((None, None));
                cmp_values(va, vb).then(a.cmp(b))
            }),
            AttributeSort::Priority => {
                self.require_priority()?;
                items.sort_by(|a, b| {
                    let pa = self.priorities.get(&(main, *a));
                    let pb = self.priorities.get(&(main, *b));
                    pb.cmp(&pa).then(a.cmp(b))
                });
            }
        }
        Ok(items)
    }

    fn require_priority(&self) -> Result<(), CacheError> {
        match self.kind {
            LinkAttributeKind::PrioritySortable => Ok(()),
            LinkAttributeKind::Plain => Err(CacheError::NotImplemented(format!(
                "priority sort on {}.{}: field has no priority",
                self.field, self.attribute
            ))),
        }
    }

    // ===== Writes =====

    pub(crate) fn set_statement(&self, main: MainId, item: AuxId, value: &FieldValue) -> Statement {
        Statement::new(format!(
            "UPDATE {} SET {} = ?1 WHERE {} = ?2 AND {} = ?3",
            self.link_table, self.value_col, self.main_col, self.item_col
        ))
        .bind(value.clone())
        .bind(main.get())
        .bind(item.get())
    }

    /// Records a value already written to the store. Null clears it.
    pub(crate) fn apply_set(&mut self, table: &CacheTable, main: MainId, item: AuxId, value: FieldValue) {
        if value.is_null() {
            self.remove(main, item);
            return;
        }
        if self.kind == LinkAttributeKind::PrioritySortable
            && let Some((_, pos)) = table.link_position(main, item)
        {
            self.priorities.insert((main, item), priority_for(pos));
        }
        self.insert(main, item, value);
    }

    /// Values that must move to `keep` when `discard` is merged into it.
    pub(crate) fn merge_carry(&self, keep: AuxId, discard: AuxId) -> Vec<(MainId, FieldValue)> {
        let mut carried: Vec<(MainId, FieldValue)> = self
            .get_auxiliary_val_dict(discard)
            .into_iter()
            .filter(|(main, _)| self.get_property(*main, keep).is_none())
            .collect();
        carried.sort_by_key(|(main, _)| *main);
        carried
    }

    /// Drops values for unlinked pairs and refreshes priorities after the
    /// backing table changed.
    pub(crate) fn sync_with_table(&mut self, table: &CacheTable) {
        let stale: Vec<(MainId, AuxId)> = self
            .by_main
            .iter()
            .flat_map(|(main, values)| values.keys().map(move |item| (*main, *item)))
            .filter(|(main, item)| table.link_position(*main, *item).is_none())
            .collect();
        for (main, item) in stale {
            self.remove(main, item);
        }
        if self.kind == LinkAttributeKind::PrioritySortable {
            for (main, values) in &self.by_main {
                for item in values.keys() {
                    if let Some((_, pos)) = table.link_position(*main, *item) {
                        self.priorities.insert((*main, *item), priority_for(pos));
                    }
                }
            }
        }
    }
}

fn cmp_values(a: Option<&FieldValue>, b: Option<&FieldValue>) -> std::cmp::Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.sort_cmp(b),
        (a, b) => a.is_some().cmp(&b.is_some()),
    }
}
