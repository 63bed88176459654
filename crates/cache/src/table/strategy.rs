//! Ordering and grouping behaviour, composed per table from its shape.

use std::collections::BTreeMap;

use crate::error::CacheError;
use crate::table::FieldUpdate;

/// Group key used by untyped tables.
pub const UNTYPED: &str = "";

/// Links of one title, keyed by link type.
pub type Groups<T> = BTreeMap<String, Vec<T>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderingStrategy {
    /// Sequence order is persisted; the front is the favoured link.
    Priority,
    /// Kept sorted by id.
    Unordered,
}

impl OrderingStrategy {
    /// Links one id. Priority promotes it to the front; returns whether the
    /// sequence changed.
    pub fn link<T: Ord + Copy>(&self, links: &mut Vec<T>, id: T) -> bool {
        match self {
            Self::Priority => {
                if links.first() == Some(&id) {
                    return false;
                }
                links.retain(|x| *x != id);
                links.insert(0, id);
                true
            }
            Self::Unordered => match links.binary_search(&id) {
                Ok(_) => false,
                Err(pos) => {
                    links.insert(pos, id);
                    true
                }
            },
        }
    }

    /// Normalizes a full replacement sequence.
    pub fn replace<T: Ord + Copy>(&self, ids: &[T]) -> Result<Vec<T>, T> {
        match self {
            Self::Priority => {
                let mut seen = Vec::with_capacity(ids.len());
                for id in ids {
                    if seen.contains(id) {
                        return Err(*id);
                    }
                    seen.push(*id);
                }
                Ok(seen)
            }
            Self::Unordered => {
                let mut out = ids.to_vec();
                out.sort();
                out.dedup();
                Ok(out)
            }
        }
    }

    /// Places a row coming back from the store. Priority rows arrive least
    /// favoured first, so each is prepended.
    pub fn place_loaded<T: Ord + Copy>(&self, links: &mut Vec<T>, id: T) {
        match self {
            Self::Priority => {
                if !links.contains(&id) {
                    links.insert(0, id);
                }
            }
            Self::Unordered => {
                self.link(links, id);
            }
        }
    }
}

/// Which groups an update value touches.
#[derive(Debug, Clone, PartialEq)]
pub enum GroupEdit<'a> {
    ClearAll,
    Group(&'a str, &'a FieldUpdate),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupingStrategy {
    Untyped,
    Typed,
}

impl GroupingStrategy {
    pub fn expand<'a>(&self, update: &'a FieldUpdate) -> Result<Vec<GroupEdit<'a>>, CacheError> {
        match (self, update) {
            (_, FieldUpdate::Remove) => Ok(vec![GroupEdit::ClearAll]),
            (Self::Untyped, FieldUpdate::Typed(_)) => Err(CacheError::invalid(
                "typed value given for an untyped field",
            )),
            (Self::Untyped, value) => Ok(vec![GroupEdit::Group(UNTYPED, value)]),
            (Self::Typed, FieldUpdate::Typed(by_type)) => by_type
                .iter()
                .map(|(link_type, value)| {
                    if link_type.is_empty() {
                        return Err(CacheError::invalid("link type must not be empty"));
                    }
                    if matches!(value, FieldUpdate::Typed(_)) {
                        return Err(CacheError::invalid("link types cannot be nested"));
                    }
                    Ok(GroupEdit::Group(link_type.as_str(), value))
                })
                .collect(),
            (Self::Typed, _) => Err(CacheError::invalid(
                "typed field needs values keyed by link type",
            )),
        }
    }

    /// Group key for a row read from the store.
    pub fn loaded_key(&self, link_type: Option<&str>) -> String {
        match self {
            Self::Untyped => UNTYPED.to_string(),
            Self::Typed => link_type.unwrap_or(UNTYPED).to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_link_promotes_to_front() {
        let mut links = vec![1, 2, 3];
        assert!(OrderingStrategy::Priority.link(&mut links, 2));
        assert_eq!(links, vec![2, 1, 3]);
        assert!(!OrderingStrategy::Priority.link(&mut links, 2));
        assert!(OrderingStrategy::Priority.link(&mut links, 9));
        assert_eq!(links, vec![9, 2, 1, 3]);
    }

    #[test]
    fn unordered_link_keeps_sorted_set() {
        let mut links = vec![1, 5];
        assert!(OrderingStrategy::Unordered.link(&mut links, 3));
        assert!(!OrderingStrategy::Unordered.link(&mut links, 5));
        assert_eq!(links, vec![1, 3, 5]);
    }

    #[test]
    fn priority_replace_rejects_duplicates() {
        assert_eq!(OrderingStrategy::Priority.replace(&[3, 1, 3]), Err(3));
        assert_eq!(OrderingStrategy::Priority.replace(&[3, 1]), Ok(vec![3, 1]));
        assert_eq!(OrderingStrategy::Unordered.replace(&[3, 1, 3]), Ok(vec![1, 3]));
    }

    #[test]
    fn loaded_priority_rows_are_prepended() {
        let mut links = Vec::new();
        OrderingStrategy::Priority.place_loaded(&mut links, 10);
        OrderingStrategy::Priority.place_loaded(&mut links, 11);
        assert_eq!(links, vec![11, 10]);
    }

    #[test]
    fn typed_grouping_requires_type_keys() {
        let single = FieldUpdate::Single(shelfmark_core::AuxId::new(1));
        assert!(GroupingStrategy::Typed.expand(&single).is_err());
        assert_eq!(
            GroupingStrategy::Untyped.expand(&single).unwrap(),
            vec![GroupEdit::Group(UNTYPED, &single)]
        );
        let typed = FieldUpdate::Typed(BTreeMap::from([("isbn".to_string(), single.clone())]));
        assert!(GroupingStrategy::Untyped.expand(&typed).is_err());
        assert_eq!(GroupingStrategy::Typed.expand(&typed).unwrap().len(), 1);
    }
}
