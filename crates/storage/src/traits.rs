use shelfmark_core::{
    field_value::FieldValue,
    ids::LibraryId,
    naming::ColumnType,
    shape::{TableShape, ValueKind},
};

use crate::error::StorageError;

pub type Row = Vec<FieldValue>;

/// One SQL statement with positional parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<FieldValue>,
}

impl Statement {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    pub fn bind(mut self, value: impl Into<FieldValue>) -> Self {
        self.params.push(value.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkChange {
    Add,
    Remove,
    Modify,
}

impl LinkChange {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Remove => "remove",
            Self::Modify => "modify",
        }
    }
}

/// Receives notifications for store writes that did not go through a cache
/// table's own write path.
pub trait StoreListener: Send + Sync {
    fn dirty_record(&self, table: &str, row_id: i64);

    fn dirty_interlink_record(
        &self,
        change: LinkChange,
        table1: &str,
        table2: &str,
        id1: i64,
        id2: i64,
    );
}

#[derive(Debug, Clone, PartialEq)]
pub struct CustomFieldRecord {
    pub label: String,
    pub table: String,
    pub link_table: String,
    pub shape: TableShape,
    pub value_kind: ValueKind,
}

impl CustomFieldRecord {
    /// Field name the column is addressed by, e.g. `#genre_detail`.
    pub fn field_name(&self) -> String {
        format!("#{}", self.label)
    }
}

/// Name resolution and statement execution against a library store.
pub trait DriverWrapper {
    fn library_id(&self) -> LibraryId;

    fn has_table(&self, table: &str) -> bool;

    fn get_id_column(&self, table: &str) -> Result<String, StorageError>;

    fn get_value_column(&self, table: &str) -> Result<String, StorageError>;

    fn get_link_table_name(&self, table1: &str, table2: &str) -> Result<String, StorageError>;

    /// Fails with [`StorageError::DatabaseIntegrity`] when the link table has
    /// no column for `column_type`.
    fn get_interlink_column(
        &self,
        table1: &str,
        table2: &str,
        column_type: &ColumnType,
    ) -> Result<String, StorageError>;

    /// Next unused row id; valid until the next write.
    fn next_id(&self, table: &str) -> Result<i64, StorageError>;

    fn execute(&self, statement: &Statement) -> Result<Vec<Row>, StorageError>;

    /// Runs all statements in one transaction.
    fn execute_atomic(&mut self, statements: &[Statement]) -> Result<(), StorageError>;

    fn custom_fields(&self) -> Result<Vec<CustomFieldRecord>, StorageError>;

    /// Creates the item table and link table for a new custom field.
    fn create_custom_field(
        &mut self,
        label: &str,
        shape: TableShape,
        value_kind: ValueKind,
    ) -> Result<CustomFieldRecord, StorageError>;
}
