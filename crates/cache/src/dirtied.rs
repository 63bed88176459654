//! Titles whose metadata changed since their last backup.
//!
//! Every mark carries a fresh sequence number. A backup clears the mark only
//! if the sequence it dumped is still current, so a dump taken from stale
//! data never hides a newer change.

use std::collections::HashMap;

use rand::seq::IteratorRandom;
use shelfmark_core::{FieldValue, MainId};
use shelfmark_storage::{DriverWrapper, Statement};

use crate::error::CacheError;

#[derive(Debug, Default)]
pub struct DirtiedTitles {
    entries: HashMap<MainId, u64>,
    next_sequence: u64,
}

impl DirtiedTitles {
    pub fn read(store: &dyn DriverWrapper) -> Result<Self, CacheError> {
        let rows = store.execute(&Statement::new(
            "SELECT title_id, sequence FROM dirtied_titles",
        ))?;
        let mut dirtied = Self {
            entries: HashMap::new(),
            next_sequence: 1,
        };
        for row in rows {
            let (Some(id), Some(sequence)) = (
                row.first().and_then(FieldValue::as_integer),
                row.get(1).and_then(FieldValue::as_integer),
            ) else {
                return Err(CacheError::integrity("malformed dirtied_titles row"));
            };
            let sequence = sequence as u64;
            dirtied.entries.insert(MainId::new(id), sequence);
            dirtied.next_sequence = dirtied.next_sequence.max(sequence + 1);
        }
        Ok(dirtied)
    }

    /// Statements and new sequences for marking `ids`; nothing changes until
    /// [`DirtiedTitles::apply_marks`].
    pub(crate) fn plan_marks(&self, ids: &[MainId]) -> (Vec<Statement>, Vec<(MainId, u64)>) {
        let mut statements = Vec::with_capacity(ids.len());
        let mut marks = Vec::with_capacity(ids.len());
        for (offset, id) in ids.iter().enumerate() {
            let sequence = self.next_sequence + offset as u64;
            statements.push(
                Statement::new(
                    "INSERT OR REPLACE INTO dirtied_titles (title_id, sequence) VALUES (?1, ?2)",
                )
                .bind(id.get())
                .bind(sequence as i64),
            );
            marks.push((*id, sequence));
        }
        (statements, marks)
    }

    pub(crate) fn apply_marks(&mut self, marks: Vec<(MainId, u64)>) {
        for (id, sequence) in marks {
            self.entries.insert(id, sequence);
            self.next_sequence = self.next_sequence.max(sequence + 1);
        }
    }

    /// Clears the mark on `id` if `sequence` is still its latest. Returns
    /// whether it was cleared.
    pub fn clear(
        &mut self,
        id: MainId,
        sequence: u64,
        store: &mut dyn DriverWrapper,
    ) -> Result<bool, CacheError> {
        if self.entries.get(&id) != Some(&sequence) {
            return Ok(false);
        }
        store.execute_atomic(&[Statement::new(
            "DELETE FROM dirtied_titles WHERE title_id = ?1 AND sequence = ?2",
        )
        .bind(id.get())
        .bind(sequence as i64)])?;
        self.entries.remove(&id);
        Ok(true)
    }

    pub(crate) fn forget(&mut self, ids: &[MainId]) {
        for id in ids {
            self.entries.remove(id);
        }
    }

    pub fn random(&self) -> Option<MainId> {
        self.entries.keys().copied().choose(&mut rand::thread_rng())
    }

    pub fn sequence(&self, id: MainId) -> Option<u64> {
        self.entries.get(&id).copied()
    }

    pub fn is_dirty(&self, id: MainId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
