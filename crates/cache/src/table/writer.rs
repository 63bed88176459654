use std::collections::HashMap;

use shelfmark_core::{
    AuxId, MainId,
    naming::{ColumnType, MAIN_TABLE},
    shape::TableShape,
};
use shelfmark_storage::{DriverWrapper, Statement, StorageError};

use crate::table::Plan;
use crate::table::strategy::Groups;

/// Physical names behind one field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkColumns {
    pub item_table: String,
    pub item_id: String,
    pub item_value: String,
    pub link_table: String,
    pub main: String,
    pub item: String,
    pub priority: Option<String>,
    pub link_type: Option<String>,
}

impl LinkColumns {
    pub fn resolve(
        table: &str,
        shape: TableShape,
        store: &dyn DriverWrapper,
    ) -> Result<Self, StorageError> {
        let column = |ct: ColumnType| store.get_interlink_column(MAIN_TABLE, table, &ct);
        Ok(Self {
            item_table: table.to_string(),
            item_id: store.get_id_column(table)?,
            item_value: store.get_value_column(table)?,
            link_table: store.get_link_table_name(MAIN_TABLE, table)?,
            main: column(ColumnType::id(MAIN_TABLE))?,
            item: column(ColumnType::id(table))?,
            priority: shape
                .priority
                .then(|| column(ColumnType::Priority))
                .transpose()?,
            link_type: shape.typed.then(|| column(ColumnType::Type)).transpose()?,
        })
    }
}

fn positions(groups: &Groups<AuxId>) -> HashMap<AuxId, (&str, usize)> {
    groups
        .iter()
        .flat_map(|(key, ids)| {
            ids.iter()
                .enumerate()
                .map(move |(pos, id)| (*id, (key.as_str(), pos)))
        })
        .collect()
}

/// Persisted priority for a sequence position; 1 is the favoured link.
pub(crate) fn priority_for(pos: usize) -> i64 {
    pos as i64 + 1
}

/// Turns a plan into the statements that make the store match it. Bound to
/// one table's columns; optional columns select the shape.
#[derive(Debug, Clone)]
pub(crate) struct LinkWriter {
    columns: LinkColumns,
}

impl LinkWriter {
    pub(crate) fn new(columns: LinkColumns) -> Self {
        Self { columns }
    }

    pub(crate) fn statements(
        &self,
        current: &HashMap<MainId, Groups<AuxId>>,
        plan: &Plan,
    ) -> Vec<Statement> {
        let c = &self.columns;
        let empty = Groups::new();
        let mut items = Vec::new();
        let mut deletes = Vec::new();
        let mut updates = Vec::new();
        let mut inserts = Vec::new();

        for (id, value) in &plan.new_items {
            items.push(
                Statement::new(format!(
                    "INSERT INTO {} ({}, {}) VALUES (?1, ?2)",
                    c.item_table, c.item_id, c.item_value
                ))
                .bind(id.get())
                .bind(value.clone()),
            );
        }
        for (id, value) in &plan.renamed_items {
            items.push(
                Statement::new(format!(
                    "UPDATE {} SET {} = ?1 WHERE {} = ?2",
                    c.item_table, c.item_value, c.item_id
                ))
                .bind(value.clone())
                .bind(id.get()),
            );
        }

        for (main, new_state) in &plan.states {
            let old = positions(current.get(main).unwrap_or(&empty));
            let new = positions(new_state);

            for item in old.keys().filter(|item| !new.contains_key(item)) {
                deletes.push(self.delete_link(*main, *item));
            }
            for (item, (key, pos)) in &new {
                match old.get(item) {
                    None => inserts.push(self.insert_link(*main, *item, key, *pos)),
                    Some((old_key, old_pos)) => {
                        if let Some(type_col) = &c.link_type
                            && old_key != key
                        {
                            updates.push(self.update_link(*main, *item, type_col, (*key).into()));
                        }
                        if let Some(priority_col) = &c.priority
                            && old_pos != pos
                        {
                            updates.push(self.update_link(
                                *main,
                                *item,
                                priority_col,
                                priority_for(*pos).into(),
                            ));
                        }
                    }
                }
            }
        }

        let mut statements = items;
        statements.append(&mut deletes);
        for item in &plan.deleted_items {
            statements.push(
                Statement::new(format!("DELETE FROM {} WHERE {} = ?1", c.link_table, c.item))
                    .bind(item.get()),
            );
            statements.push(
                Statement::new(format!("DELETE FROM {} WHERE {} = ?1", c.item_table, c.item_id))
                    .bind(item.get()),
            );
        }
        statements.append(&mut updates);
        statements.append(&mut inserts);
        statements
    }

    pub(crate) fn remove_books(&self, ids: &[MainId]) -> Vec<Statement> {
        ids.iter()
            .map(|id| {
                Statement::new(format!(
                    "DELETE FROM {} WHERE {} = ?1",
                    self.columns.link_table, self.columns.main
                ))
                .bind(id.get())
            })
            .collect()
    }

    fn delete_link(&self, main: MainId, item: AuxId) -> Statement {
        Statement::new(format!(
            "DELETE FROM {} WHERE {} = ?1 AND {} = ?2",
            self.columns.link_table, self.columns.main, self.columns.item
        ))
        .bind(main.get())
        .bind(item.get())
    }

    fn update_link(
        &self,
        main: MainId,
        item: AuxId,
        column: &str,
        value: shelfmark_core::FieldValue,
    ) -> Statement {
        Statement::new(format!(
            "UPDATE {} SET {column} = ?1 WHERE {} = ?2 AND {} = ?3",
            self.columns.link_table, self.columns.main, self.columns.item
        ))
        .bind(value)
        .bind(main.get())
        .bind(item.get())
    }

    fn insert_link(&self, main: MainId, item: AuxId, key: &str, pos: usize) -> Statement {
        let c = &self.columns;
        let mut cols = vec![c.main.as_str(), c.item.as_str()];
        let mut statement = Statement::new("").bind(main.get()).bind(item.get());
        if let Some(priority_col) = &c.priority {
            cols.push(priority_col);
            statement = statement.bind(priority_for(pos));
        }
        if let Some(type_col) = &c.link_type {
            cols.push(type_col);
            statement = statement.bind(key);
        }
        let placeholders = (1..=cols.len())
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ");
        statement.sql = format!(
            "INSERT INTO {} ({}) VALUES ({placeholders})",
            c.link_table,
            cols.join(", ")
        );
        statement
    }
}
