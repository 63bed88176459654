use rusqlite::Connection;

use shelfmark_core::{
    naming::{self, ColumnType, MAIN_TABLE},
    shape::{BUILTIN_FIELDS, TableShape, ValueKind},
};

use crate::error::StorageError;

pub const SCHEMA_VERSION: i32 = 1;

pub fn init_schema(conn: &Connection) -> Result<(), StorageError> {
    conn.execute_batch(
        "
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA foreign_keys = ON;
        PRAGMA cache_size = -32000;
        PRAGMA mmap_size = 268435456;
        PRAGMA busy_timeout = 5000;
    ",
    )?;
    conn.execute_batch(SCHEMA_SQL)?;
    for spec in BUILTIN_FIELDS {
        conn.execute_batch(&item_table_ddl(spec.table, spec.value_kind))?;
        conn.execute_batch(&link_table_ddl(spec.table, spec.shape, spec.attributes))?;
    }
    Ok(())
}

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at INTEGER NOT NULL
);
INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (1, unixepoch());

CREATE TABLE IF NOT EXISTS library_info (
    key TEXT PRIMARY KEY,
    value BLOB NOT NULL
);

CREATE TABLE IF NOT EXISTS titles (
    title_id INTEGER PRIMARY KEY,
    title TEXT NOT NULL,
    sort TEXT,
    added_at INTEGER NOT NULL DEFAULT (unixepoch())
);

CREATE TABLE IF NOT EXISTS title_title_intralinks (
    title_title_intralink_id INTEGER PRIMARY KEY,
    title_title_intralink_primary_id INTEGER NOT NULL REFERENCES titles (title_id) ON DELETE CASCADE,
    title_title_intralink_secondary_id INTEGER NOT NULL REFERENCES titles (title_id) ON DELETE CASCADE,
    title_title_intralink_type TEXT NOT NULL DEFAULT '',
    UNIQUE (title_title_intralink_primary_id, title_title_intralink_secondary_id),
    CHECK (title_title_intralink_primary_id <> title_title_intralink_secondary_id)
);

CREATE TABLE IF NOT EXISTS title_aggregates (
    title_id INTEGER NOT NULL REFERENCES titles (title_id) ON DELETE CASCADE,
    field TEXT NOT NULL,
    value TEXT NOT NULL,
    PRIMARY KEY (title_id, field)
);

CREATE TABLE IF NOT EXISTS dirtied_titles (
    title_id INTEGER PRIMARY KEY REFERENCES titles (title_id) ON DELETE CASCADE,
    sequence INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS title_backups (
    title_id INTEGER PRIMARY KEY REFERENCES titles (title_id) ON DELETE CASCADE,
    payload BLOB NOT NULL,
    digest BLOB NOT NULL CHECK (length(digest) = 32),
    written_at INTEGER NOT NULL DEFAULT (unixepoch())
);

CREATE TABLE IF NOT EXISTS custom_fields (
    custom_field_id INTEGER PRIMARY KEY,
    label TEXT NOT NULL UNIQUE,
    item_table TEXT NOT NULL UNIQUE,
    link_table TEXT NOT NULL UNIQUE,
    cardinality TEXT NOT NULL,
    priority INTEGER NOT NULL,
    typed INTEGER NOT NULL,
    value_kind TEXT NOT NULL
);
";

pub fn item_table_ddl(table: &str, value_kind: ValueKind) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {table} (\n    {id} INTEGER PRIMARY KEY,\n    {value} {ty} NOT NULL\n);",
        id = naming::id_column(table),
        value = naming::value_column(table),
        ty = value_kind.sql_type(),
    )
}

/// DDL for the link table between `titles` and `table`. Single-valued sides
/// of the cardinality become unique constraints.
pub fn link_table_ddl(table: &str, shape: TableShape, attributes: &[(&str, ValueKind)]) -> String {
    let link = naming::link_table_name(MAIN_TABLE, table);
    let col = |ct: &ColumnType| naming::link_column(&link, ct);
    let main_col = col(&ColumnType::id(MAIN_TABLE));
    let item_col = col(&ColumnType::id(table));

    let mut lines = vec![
        format!("{} INTEGER PRIMARY KEY", naming::id_column(&link)),
        format!(
            "{main_col} INTEGER NOT NULL REFERENCES {MAIN_TABLE} ({}) ON DELETE CASCADE",
            naming::id_column(MAIN_TABLE)
        ),
        format!(
            "{item_col} INTEGER NOT NULL REFERENCES {table} ({}) ON DELETE CASCADE",
            naming::id_column(table)
        ),
    ];
    if shape.priority {
        lines.push(format!("{} INTEGER NOT NULL DEFAULT 1", col(&ColumnType::Priority)));
    }
    if shape.typed {
        lines.push(format!("{} TEXT NOT NULL DEFAULT ''", col(&ColumnType::Type)));
    }
    for (name, kind) in attributes {
        lines.push(format!("{} {}", col(&ColumnType::attribute(name)), kind.sql_type()));
    }
    lines.push(format!("UNIQUE ({main_col}, {item_col})"));
    if shape.cardinality.forward_single() {
        lines.push(format!("UNIQUE ({main_col})"));
    }
    if shape.cardinality.reverse_single() {
        lines.push(format!("UNIQUE ({item_col})"));
    }

    format!(
        "CREATE TABLE IF NOT EXISTS {link} (\n    {}\n);\nCREATE INDEX IF NOT EXISTS idx_{link}_item ON {link} ({item_col});",
        lines.join(",\n    ")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use shelfmark_core::shape::Cardinality;

    #[test]
    fn link_ddl_carries_shape_columns() {
        let ddl = link_table_ddl(
            "series",
            TableShape::new(Cardinality::ManyToMany).prioritized(),
            &[("index", ValueKind::Real)],
        );
        assert!(ddl.contains("CREATE TABLE IF NOT EXISTS series_title_links"));
        assert!(ddl.contains("series_title_link_priority INTEGER NOT NULL DEFAULT 1"));
        assert!(ddl.contains("series_title_link_index REAL"));
        assert!(!ddl.contains("series_title_link_type"));
        assert!(!ddl.contains("UNIQUE (series_title_link_title_id)"));
    }

    #[test]
    fn single_sides_become_unique_constraints() {
        let ddl = link_table_ddl("ratings", TableShape::new(Cardinality::ManyToOne), &[]);
        assert!(ddl.contains("UNIQUE (rating_title_link_title_id)"));
        assert!(!ddl.contains("UNIQUE (rating_title_link_rating_id)"));
    }

    #[test]
    fn schema_initializes_on_fresh_connection() -> Result<(), StorageError> {
        let conn = Connection::open_in_memory()?;
        init_schema(&conn)?;
        init_schema(&conn)?;
        let count: i64 = conn.query_row(
            "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name LIKE '%_title_links'",
            [],
            |row| row.get(0),
        )?;
        assert_eq!(count as usize, BUILTIN_FIELDS.len());
        Ok(())
    }
}
