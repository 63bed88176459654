//! Physical naming convention for the library schema.
//!
//! Every physical name is derived from logical table names, so the cache
//! never needs to hard-code link-table layouts.

use std::fmt;

/// Logical name of the main table.
pub const MAIN_TABLE: &str = "titles";

const SINGULAR_EXCEPTIONS: &[(&str, &str)] = &[("series", "series"), ("synopses", "synopsis")];

/// Column roles inside a link table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ColumnType {
    /// Foreign key to the named participating table.
    Id(String),
    /// First endpoint of an intralink.
    Primary,
    /// Second endpoint of an intralink.
    Secondary,
    Priority,
    Type,
    /// A scalar attribute stored on the link row.
    Attribute(String),
}

impl ColumnType {
    pub fn id(table: &str) -> Self {
        Self::Id(table.to_string())
    }

    pub fn attribute(name: &str) -> Self {
        Self::Attribute(name.to_string())
    }

    fn suffix(&self) -> String {
        match self {
            Self::Id(table) => id_column(table),
            Self::Primary => "primary_id".to_string(),
            Self::Secondary => "secondary_id".to_string(),
            Self::Priority => "priority".to_string(),
            Self::Type => "type".to_string(),
            Self::Attribute(name) => name.clone(),
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.suffix())
    }
}

pub fn singular(table: &str) -> String {
    if let Some((_, s)) = SINGULAR_EXCEPTIONS.iter().find(|(p, _)| *p == table) {
        return (*s).to_string();
    }
    table.strip_suffix('s').unwrap_or(table).to_string()
}

/// `creators` -> `creator_id`
pub fn id_column(table: &str) -> String {
    format!("{}_id", singular(table))
}

/// `creators` -> `creator`
pub fn value_column(table: &str) -> String {
    singular(table)
}

/// Link table between two tables; the argument order does not matter.
pub fn link_table_name(table1: &str, table2: &str) -> String {
    if table1 == table2 {
        let s = singular(table1);
        return format!("{s}_{s}_intralinks");
    }
    let mut names = [singular(table1), singular(table2)];
    names.sort();
    format!("{}_{}_links", names[0], names[1])
}

pub fn link_column(link_table: &str, column_type: &ColumnType) -> String {
    format!("{}_{}", singular(link_table), column_type.suffix())
}
