pub mod error;
pub mod field_value;
pub mod ids;
pub mod naming;
pub mod shape;

pub use error::CoreError;
pub use field_value::FieldValue;
pub use ids::*;
pub use shape::{BUILTIN_FIELDS, Cardinality, FieldSpec, TableShape, ValueKind};
