use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use rusqlite::{
    Connection,
    types::{Value, ValueRef},
};
use tracing::{debug, info};

use shelfmark_core::{
    field_value::FieldValue,
    ids::LibraryId,
    naming::{self, ColumnType, MAIN_TABLE},
    shape::{Cardinality, TableShape, ValueKind},
};

use crate::error::StorageError;
use crate::schema;
use crate::traits::{CustomFieldRecord, DriverWrapper, LinkChange, Row, Statement, StoreListener};

const LIBRARY_ID_KEY: &str = "library_id";

fn to_array<const N: usize>(v: Vec<u8>, label: &str) -> Result<[u8; N], StorageError> {
    v.try_into()
        .map_err(|_| StorageError::Serialization(format!("invalid {label} length")))
}

fn to_sql(value: &FieldValue) -> Value {
    match value {
        FieldValue::Null => Value::Null,
        FieldValue::Text(s) => Value::Text(s.clone()),
        FieldValue::Integer(n) => Value::Integer(*n),
        FieldValue::Float(n) => Value::Real(*n),
        FieldValue::Bytes(b) => Value::Blob(b.clone()),
    }
}

fn from_sql(value: ValueRef<'_>) -> FieldValue {
    match value {
        ValueRef::Null => FieldValue::Null,
        ValueRef::Integer(n) => FieldValue::Integer(n),
        ValueRef::Real(n) => FieldValue::Float(n),
        ValueRef::Text(t) => FieldValue::Text(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => FieldValue::Bytes(b.to_vec()),
    }
}

fn run(conn: &Connection, statement: &Statement) -> Result<Vec<Row>, StorageError> {
    let mut stmt = conn.prepare(&statement.sql)?;
    let params = rusqlite::params_from_iter(statement.params.iter().map(to_sql));
    let width = stmt.column_count();
    if width == 0 {
        stmt.execute(params)?;
        return Ok(Vec::new());
    }
    let mut rows = stmt.query(params)?;
    let mut result = Vec::new();
    while let Some(row) = rows.next()? {
        let mut values = Vec::with_capacity(width);
        for i in 0..width {
            values.push(from_sql(row.get_ref(i)?));
        }
        result.push(values);
    }
    Ok(result)
}

fn valid_label(label: &str) -> bool {
    !label.is_empty()
        && label
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

/// SQLite-backed library store.
///
/// Writes made through the `insert_*`, `update_*` and `delete_*` helpers
/// bypass every cache table and are reported to the registered
/// [`StoreListener`].
pub struct SqliteStore {
    conn: Connection,
    library_id: LibraryId,
    columns: HashMap<String, HashSet<String>>,
    listener: Option<Arc<dyn StoreListener>>,
}

impl SqliteStore {
    pub fn open(path: &str) -> Result<Self, StorageError> {
        Self::from_connection(Connection::open(path)?, None)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::from_connection(Connection::open_in_memory()?, None)
    }

    pub fn open_with_listener(
        path: &str,
        listener: Arc<dyn StoreListener>,
    ) -> Result<Self, StorageError> {
        Self::from_connection(Connection::open(path)?, Some(listener))
    }

    pub fn open_in_memory_with_listener(
        listener: Arc<dyn StoreListener>,
    ) -> Result<Self, StorageError> {
        Self::from_connection(Connection::open_in_memory()?, Some(listener))
    }

    fn from_connection(
        conn: Connection,
        listener: Option<Arc<dyn StoreListener>>,
    ) -> Result<Self, StorageError> {
        schema::init_schema(&conn)?;
        let library_id = Self::load_library_id(&conn)?;
        let mut store = Self {
            conn,
            library_id,
            columns: HashMap::new(),
            listener,
        };
        store.refresh_columns()?;
        info!(library_id = %library_id, tables = store.columns.len(), "Opened library store");
        Ok(store)
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    fn load_library_id(conn: &Connection) -> Result<LibraryId, StorageError> {
        let existing: Option<Vec<u8>> = conn
            .query_row(
                "SELECT value FROM library_info WHERE key = ?1",
                [LIBRARY_ID_KEY],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                e => Err(e),
            })?;
        if let Some(bytes) = existing {
            return Ok(LibraryId::from_bytes(to_array::<16>(bytes, "library_id")?));
        }
        let id = LibraryId::new();
        conn.execute(
            "INSERT INTO library_info (key, value) VALUES (?1, ?2)",
            rusqlite::params![LIBRARY_ID_KEY, id.as_bytes().as_slice()],
        )?;
        Ok(id)
    }

    /// Re-reads the physical table layout used for name resolution.
    fn refresh_columns(&mut self) -> Result<(), StorageError> {
        let mut stmt = self
            .conn
            .prepare("SELECT name FROM sqlite_master WHERE type = 'table'")?;
        let tables = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        let mut columns = HashMap::new();
        for table in tables {
            let mut info = self
                .conn
                .prepare("SELECT name FROM pragma_table_info(?1)")?;
            let names = info
                .query_map([&table], |row| row.get::<_, String>(0))?
                .collect::<Result<HashSet<_>, _>>()?;
            columns.insert(table, names);
        }
        self.columns = columns;
        Ok(())
    }

    fn require_column(&self, table: &str, column: String) -> Result<String, StorageError> {
        match self.columns.get(table) {
            None => Err(StorageError::DatabaseIntegrity(format!(
                "table {table} does not exist"
            ))),
            Some(cols) if !cols.contains(&column) => Err(StorageError::DatabaseIntegrity(
                format!("table {table} has no column {column}"),
            )),
            Some(_) => Ok(column),
        }
    }

    fn notify_record(&self, table: &str, row_id: i64) {
        if let Some(listener) = &self.listener {
            listener.dirty_record(table, row_id);
        }
    }

    fn notify_link(&self, change: LinkChange, table: &str, title_id: i64, item_id: i64) {
        if let Some(listener) = &self.listener {
            listener.dirty_interlink_record(change, MAIN_TABLE, table, title_id, item_id);
        }
    }

    // ===== Writes outside the cache =====

    pub fn insert_title(&mut self, title: &str) -> Result<i64, StorageError> {
        self.conn
            .execute("INSERT INTO titles (title, sort) VALUES (?1, ?1)", [title])?;
        let id = self.conn.last_insert_rowid();
        self.notify_record(MAIN_TABLE, id);
        Ok(id)
    }

    pub fn update_title(&mut self, title_id: i64, title: &str) -> Result<(), StorageError> {
        let changed = self.conn.execute(
            "UPDATE titles SET title = ?1 WHERE title_id = ?2",
            rusqlite::params![title, title_id],
        )?;
        if changed == 0 {
            return Err(StorageError::NotFound(format!("title {title_id}")));
        }
        self.notify_record(MAIN_TABLE, title_id);
        Ok(())
    }

    pub fn insert_item(&mut self, table: &str, value: &FieldValue) -> Result<i64, StorageError> {
        let value_col = self.get_value_column(table)?;
        self.conn.execute(
            &format!("INSERT INTO {table} ({value_col}) VALUES (?1)"),
            [to_sql(value)],
        )?;
        let id = self.conn.last_insert_rowid();
        self.notify_record(table, id);
        Ok(id)
    }

    pub fn update_item(
        &mut self,
        table: &str,
        item_id: i64,
        value: &FieldValue,
    ) -> Result<(), StorageError> {
        let id_col = self.get_id_column(table)?;
        let value_col = self.get_value_column(table)?;
        let changed = self.conn.execute(
            &format!("UPDATE {table} SET {value_col} = ?1 WHERE {id_col} = ?2"),
            rusqlite::params![to_sql(value), item_id],
        )?;
        if changed == 0 {
            return Err(StorageError::NotFound(format!("{table} row {item_id}")));
        }
        self.notify_record(table, item_id);
        Ok(())
    }

    pub fn delete_item(&mut self, table: &str, item_id: i64) -> Result<(), StorageError> {
        let id_col = self.get_id_column(table)?;
        self.conn.execute(
            &format!("DELETE FROM {table} WHERE {id_col} = ?1"),
            [item_id],
        )?;
        self.notify_record(table, item_id);
        Ok(())
    }

    pub fn insert_link(
        &mut self,
        table: &str,
        title_id: i64,
        item_id: i64,
        priority: Option<i64>,
        link_type: Option<&str>,
    ) -> Result<(), StorageError> {
        let link = self.get_link_table_name(MAIN_TABLE, table)?;
        let mut cols = vec![
            self.get_interlink_column(MAIN_TABLE, table, &ColumnType::id(MAIN_TABLE))?,
            self.get_interlink_column(MAIN_TABLE, table, &ColumnType::id(table))?,
        ];
        let mut statement = Statement::new("").bind(title_id).bind(item_id);
        if let Some(priority) = priority {
            cols.push(self.get_interlink_column(MAIN_TABLE, table, &ColumnType::Priority)?);
            statement = statement.bind(priority);
        }
        if let Some(link_type) = link_type {
            cols.push(self.get_interlink_column(MAIN_TABLE, table, &ColumnType::Type)?);
            statement = statement.bind(link_type);
        }
        let placeholders = (1..=cols.len())
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ");
        statement.sql = format!(
            "INSERT INTO {link} ({}) VALUES ({placeholders})",
            cols.join(", ")
        );
        run(&self.conn, &statement)?;
        self.notify_link(LinkChange::Add, table, title_id, item_id);
        Ok(())
    }

    pub fn set_link_priority(
        &mut self,
        table: &str,
        title_id: i64,
        item_id: i64,
        priority: i64,
    ) -> Result<(), StorageError> {
        let link = self.get_link_table_name(MAIN_TABLE, table)?;
        let main_col = self.get_interlink_column(MAIN_TABLE, table, &ColumnType::id(MAIN_TABLE))?;
        let item_col = self.get_interlink_column(MAIN_TABLE, table, &ColumnType::id(table))?;
        let priority_col = self.get_interlink_column(MAIN_TABLE, table, &ColumnType::Priority)?;
        self.conn.execute(
            &format!("UPDATE {link} SET {priority_col} = ?1 WHERE {main_col} = ?2 AND {item_col} = ?3"),
            rusqlite::params![priority, title_id, item_id],
        )?;
        self.notify_link(LinkChange::Modify, table, title_id, item_id);
        Ok(())
    }

    pub fn delete_link(
        &mut self,
        table: &str,
        title_id: i64,
        item_id: i64,
    ) -> Result<(), StorageError> {
        let link = self.get_link_table_name(MAIN_TABLE, table)?;
        let main_col = self.get_interlink_column(MAIN_TABLE, table, &ColumnType::id(MAIN_TABLE))?;
        let item_col = self.get_interlink_column(MAIN_TABLE, table, &ColumnType::id(table))?;
        self.conn.execute(
            &format!("DELETE FROM {link} WHERE {main_col} = ?1 AND {item_col} = ?2"),
            rusqlite::params![title_id, item_id],
        )?;
        self.notify_link(LinkChange::Remove, table, title_id, item_id);
        Ok(())
    }
}

impl DriverWrapper for SqliteStore {
    fn library_id(&self) -> LibraryId {
        self.library_id
    }

    fn has_table(&self, table: &str) -> bool {
        self.columns.contains_key(table)
    }

    fn get_id_column(&self, table: &str) -> Result<String, StorageError> {
        self.require_column(table, naming::id_column(table))
    }

    fn get_value_column(&self, table: &str) -> Result<String, StorageError> {
        self.require_column(table, naming::value_column(table))
    }

    fn get_link_table_name(&self, table1: &str, table2: &str) -> Result<String, StorageError> {
        let link = naming::link_table_name(table1, table2);
        if !self.has_table(&link) {
            return Err(StorageError::DatabaseIntegrity(format!(
                "no link table between {table1} and {table2}"
            )));
        }
        Ok(link)
    }

    fn get_interlink_column(
        &self,
        table1: &str,
        table2: &str,
        column_type: &ColumnType,
    ) -> Result<String, StorageError> {
        let link = self.get_link_table_name(table1, table2)?;
        let column = naming::link_column(&link, column_type);
        self.require_column(&link, column)
    }

    fn next_id(&self, table: &str) -> Result<i64, StorageError> {
        let id_col = self.get_id_column(table)?;
        let next: i64 = self.conn.query_row(
            &format!("SELECT COALESCE(MAX({id_col}), 0) + 1 FROM {table}"),
            [],
            |row| row.get(0),
        )?;
        Ok(next)
    }

    fn execute(&self, statement: &Statement) -> Result<Vec<Row>, StorageError> {
        run(&self.conn, statement)
    }

    fn execute_atomic(&mut self, statements: &[Statement]) -> Result<(), StorageError> {
        let tx = self.conn.transaction()?;
        for statement in statements {
            run(&tx, statement)?;
        }
        tx.commit()?;
        Ok(())
    }

    fn custom_fields(&self) -> Result<Vec<CustomFieldRecord>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT label, item_table, link_table, cardinality, priority, typed, value_kind FROM custom_fields ORDER BY custom_field_id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, bool>(4)?,
                row.get::<_, bool>(5)?,
                row.get::<_, String>(6)?,
            ))
        })?;

        let mut result = Vec::new();
        for row in rows {
            let (label, table, link_table, cardinality, priority, typed, value_kind) = row?;
            let mut shape = TableShape::new(Cardinality::parse(&cardinality)?);
            shape.priority = priority;
            shape.typed = typed;
            result.push(CustomFieldRecord {
                label,
                table,
                link_table,
                shape,
                value_kind: ValueKind::parse(&value_kind)?,
            });
        }
        Ok(result)
    }

    fn create_custom_field(
        &mut self,
        label: &str,
        shape: TableShape,
        value_kind: ValueKind,
    ) -> Result<CustomFieldRecord, StorageError> {
        if !valid_label(label) {
            return Err(StorageError::ConstraintViolation(format!(
                "invalid custom field label: {label:?}"
            )));
        }
        let number: i64 = self.conn.query_row(
            "SELECT COALESCE(MAX(custom_field_id), 0) + 1 FROM custom_fields",
            [],
            |row| row.get(0),
        )?;
        let table = format!("custom_column_{number}");
        let link_table = naming::link_table_name(MAIN_TABLE, &table);

        let tx = self.conn.transaction()?;
        let inserted = tx.execute(
            "INSERT INTO custom_fields (custom_field_id, label, item_table, link_table, cardinality, priority, typed, value_kind) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            rusqlite::params![
                number,
                label,
                table,
                link_table,
                shape.cardinality.as_str(),
                shape.priority,
                shape.typed,
                value_kind.as_str(),
            ],
        );
        match inserted {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                return Err(StorageError::ConstraintViolation(format!(
                    "custom field {label} already exists"
                )));
            }
            Err(e) => return Err(StorageError::Sqlite(e)),
        }
        tx.execute_batch(&schema::item_table_ddl(&table, value_kind))?;
        tx.execute_batch(&schema::link_table_ddl(&table, shape, &[]))?;
        tx.commit()?;
        self.refresh_columns()?;

        debug!(label, table = %table, link_table = %link_table, "Created custom field");
        Ok(CustomFieldRecord {
            label: label.to_string(),
            table,
            link_table,
            shape,
            value_kind,
        })
    }
}
