use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use shelfmark_core::{FieldValue, MainId};

use crate::error::CacheError;

/// Everything known about one title, as written to its backup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookMetadata {
    pub id: MainId,
    pub title: String,
    pub sort: String,
    /// Untyped fields: item display values, favoured first on priority
    /// fields.
    pub fields: BTreeMap<String, Vec<String>>,
    /// Typed fields, keyed by link type.
    pub typed_fields: BTreeMap<String, BTreeMap<String, Vec<String>>>,
    /// `field.attribute` to item display value to attribute value.
    pub link_attributes: BTreeMap<String, BTreeMap<String, FieldValue>>,
    pub intralinks: Vec<MainId>,
}

impl BookMetadata {
    pub fn to_msgpack(&self) -> Result<Vec<u8>, CacheError> {
        rmp_serde::to_vec_named(self).map_err(|e| CacheError::Serialization(e.to_string()))
    }

    pub fn from_msgpack(bytes: &[u8]) -> Result<Self, CacheError> {
        rmp_serde::from_slice(bytes).map_err(|e| CacheError::Serialization(e.to_string()))
    }
}
