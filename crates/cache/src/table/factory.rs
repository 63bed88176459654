use shelfmark_core::{
    naming::MAIN_TABLE,
    shape::{BUILTIN_FIELDS, FieldSpec, TableShape, ValueKind},
};
use shelfmark_storage::{CustomFieldRecord, DriverWrapper};
use tracing::debug;

use crate::error::CacheError;
use crate::table::CacheTable;

/// Everything needed to build the cache table for one field.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDefinition {
    pub field: String,
    pub table: String,
    pub shape: TableShape,
    pub value_kind: ValueKind,
    pub attributes: Vec<String>,
    pub custom: bool,
}

impl From<&FieldSpec> for FieldDefinition {
    fn from(spec: &FieldSpec) -> Self {
        Self {
            field: spec.field.to_string(),
            table: spec.table.to_string(),
            shape: spec.shape,
            value_kind: spec.value_kind,
            attributes: spec.attributes.iter().map(|(n, _)| n.to_string()).collect(),
            custom: false,
        }
    }
}

impl From<&CustomFieldRecord> for FieldDefinition {
    fn from(record: &CustomFieldRecord) -> Self {
        Self {
            field: record.field_name(),
            table: record.table.clone(),
            shape: record.shape,
            value_kind: record.value_kind,
            attributes: Vec::new(),
            custom: true,
        }
    }
}

/// Definitions for every field the store can serve: built-in fields whose
/// link table exists, then registered custom fields.
pub fn field_definitions(store: &dyn DriverWrapper) -> Result<Vec<FieldDefinition>, CacheError> {
    let mut definitions = Vec::new();
    for spec in BUILTIN_FIELDS {
        if store.get_link_table_name(MAIN_TABLE, spec.table).is_ok() {
            definitions.push(FieldDefinition::from(spec));
        } else {
            debug!(field = spec.field, "No link table; field skipped");
        }
    }
    for record in store.custom_fields()? {
        definitions.push(FieldDefinition::from(&record));
    }
    Ok(definitions)
}

/// Builds an empty table for `definition`. Column names are resolved now;
/// nothing is read until [`CacheTable::read`].
pub fn create_table(
    definition: FieldDefinition,
    store: &dyn DriverWrapper,
) -> Result<CacheTable, CacheError> {
    CacheTable::new(definition, store)
}
