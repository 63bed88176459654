use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Relationship between titles (the main side) and the items of one
/// auxiliary table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Cardinality {
    OneToOne,
    OneToMany,
    ManyToOne,
    ManyToMany,
}

impl Cardinality {
    /// A title links to at most one item.
    pub const fn forward_single(&self) -> bool {
        matches!(self, Self::OneToOne | Self::ManyToOne)
    }

    /// An item links to at most one title.
    pub const fn reverse_single(&self) -> bool {
        matches!(self, Self::OneToOne | Self::OneToMany)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OneToOne => "one_to_one",
            Self::OneToMany => "one_to_many",
            Self::ManyToOne => "many_to_one",
            Self::ManyToMany => "many_to_many",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "one_to_one" => Ok(Self::OneToOne),
            "one_to_many" => Ok(Self::OneToMany),
            "many_to_one" => Ok(Self::ManyToOne),
            "many_to_many" => Ok(Self::ManyToMany),
            other => Err(CoreError::UnknownCardinality(other.to_string())),
        }
    }
}

/// The three orthogonal flags that fix how a field's links behave.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableShape {
    pub cardinality: Cardinality,
    pub priority: bool,
    pub typed: bool,
}

impl TableShape {
    pub const fn new(cardinality: Cardinality) -> Self {
        Self {
            cardinality,
            priority: false,
            typed: false,
        }
    }

    pub const fn prioritized(mut self) -> Self {
        self.priority = true;
        self
    }

    pub const fn typed(mut self) -> Self {
        self.typed = true;
        self
    }
}

/// Storage class of an item's display value or of a link attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueKind {
    Text,
    Integer,
    Real,
}

impl ValueKind {
    pub fn sql_type(&self) -> &'static str {
        match self {
            Self::Text => "TEXT",
            Self::Integer => "INTEGER",
            Self::Real => "REAL",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Integer => "integer",
            Self::Real => "real",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "text" => Ok(Self::Text),
            "integer" => Ok(Self::Integer),
            "real" => Ok(Self::Real),
            other => Err(CoreError::InvalidData(format!("unknown value kind: {other}"))),
        }
    }
}

/// Static description of a built-in field.
#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub field: &'static str,
    pub table: &'static str,
    pub shape: TableShape,
    pub value_kind: ValueKind,
    pub attributes: &'static [(&'static str, ValueKind)],
}

pub const BUILTIN_FIELDS: &[FieldSpec] = &[
    FieldSpec {
        field: "authors",
        table: "creators",
        shape: TableShape::new(Cardinality::ManyToMany).prioritized().typed(),
        value_kind: ValueKind::Text,
        attributes: &[],
    },
    FieldSpec {
        field: "tags",
        table: "tags",
        shape: TableShape::new(Cardinality::ManyToMany),
        value_kind: ValueKind::Text,
        attributes: &[],
    },
    FieldSpec {
        field: "series",
        table: "series",
        shape: TableShape::new(Cardinality::ManyToMany).prioritized(),
        value_kind: ValueKind::Text,
        attributes: &[("index", ValueKind::Real)],
    },
    FieldSpec {
        field: "publishers",
        table: "publishers",
        shape: TableShape::new(Cardinality::ManyToMany).prioritized(),
        value_kind: ValueKind::Text,
        attributes: &[],
    },
    FieldSpec {
        field: "languages",
        table: "languages",
        shape: TableShape::new(Cardinality::ManyToMany).typed(),
        value_kind: ValueKind::Text,
        attributes: &[],
    },
    FieldSpec {
        field: "identifiers",
        table: "identifiers",
        shape: TableShape::new(Cardinality::OneToMany).typed(),
        value_kind: ValueKind::Text,
        attributes: &[],
    },
    FieldSpec {
        field: "comments",
        table: "comments",
        shape: TableShape::new(Cardinality::OneToMany).prioritized(),
        value_kind: ValueKind::Text,
        attributes: &[],
    },
    FieldSpec {
        field: "rating",
        table: "ratings",
        shape: TableShape::new(Cardinality::ManyToOne),
        value_kind: ValueKind::Integer,
        attributes: &[],
    },
    FieldSpec {
        field: "genre",
        table: "genres",
        shape: TableShape::new(Cardinality::ManyToOne),
        value_kind: ValueKind::Text,
        attributes: &[],
    },
    FieldSpec {
        field: "cover",
        table: "covers",
        shape: TableShape::new(Cardinality::OneToOne),
        value_kind: ValueKind::Text,
        attributes: &[],
    },
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_sides_follow_cardinality() {
        assert!(Cardinality::OneToOne.forward_single());
        assert!(Cardinality::OneToOne.reverse_single());
        assert!(Cardinality::ManyToOne.forward_single());
        assert!(!Cardinality::ManyToOne.reverse_single());
        assert!(!Cardinality::OneToMany.forward_single());
        assert!(Cardinality::OneToMany.reverse_single());
        assert!(!Cardinality::ManyToMany.forward_single());
    }

    #[test]
    fn cardinality_names_parse_back() -> Result<(), CoreError> {
        for c in [
            Cardinality::OneToOne,
            Cardinality::OneToMany,
            Cardinality::ManyToOne,
            Cardinality::ManyToMany,
        ] {
            assert_eq!(Cardinality::parse(c.as_str())?, c);
        }
        assert!(Cardinality::parse("sideways").is_err());
        Ok(())
    }
}
