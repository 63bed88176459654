//! Every cache table of one library, plus the title records, link
//! attributes, intralinks and dirtied marks that hang off them.
//!
//! Each write builds its statements from validated plans, runs them in one
//! store transaction together with the dirtied marks it causes, and only
//! then touches memory. The caller holds the library's write lock.

use std::collections::{BTreeMap, BTreeSet};

use shelfmark_core::{
    AuxId, FieldValue, LibraryId, MainId,
    naming::MAIN_TABLE,
    shape::{TableShape, ValueKind},
};
use shelfmark_storage::{CustomFieldRecord, DriverWrapper, Statement};
use tracing::{debug, info, instrument};

use crate::dirtied::DirtiedTitles;
use crate::error::CacheError;
use crate::intralinks::Intralinks;
use crate::link_attr::LinkAttributeTable;
use crate::metadata::BookMetadata;
use crate::table::{
    CacheTable, FieldDefinition, FieldUpdate, IdMap, Plan, UpdateMap, UpdateOutcome, factory,
};

const ARTICLES: &[&str] = &["the", "a", "an"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TitleRecord {
    pub id: MainId,
    pub title: String,
    pub sort: String,
}

/// Sort key for a title: a leading article moves to the end.
pub fn title_sort(title: &str) -> String {
    let trimmed = title.trim();
    if let Some((first, rest)) = trimmed.split_once(' ')
        && ARTICLES.contains(&first.to_lowercase().as_str())
        && !rest.trim().is_empty()
    {
        return format!("{}, {first}", rest.trim());
    }
    trimmed.to_string()
}

pub struct Cache {
    library_id: LibraryId,
    titles: BTreeMap<MainId, TitleRecord>,
    tables: BTreeMap<String, CacheTable>,
    link_attributes: BTreeMap<(String, String), LinkAttributeTable>,
    intralinks: Intralinks,
    dirtied: DirtiedTitles,
}

impl Cache {
    #[instrument(skip_all)]
    pub fn load(store: &dyn DriverWrapper) -> Result<Self, CacheError> {
        let mut cache = Self {
            library_id: store.library_id(),
            titles: read_titles(store)?,
            tables: BTreeMap::new(),
            link_attributes: BTreeMap::new(),
            intralinks: Intralinks::new(store)?,
            dirtied: DirtiedTitles::read(store)?,
        };
        for definition in factory::field_definitions(store)? {
            cache.add_field(definition, store)?;
        }
        cache.intralinks.read(store)?;
        info!(
            library_id = %cache.library_id,
            titles = cache.titles.len(),
            fields = cache.tables.len(),
            dirtied = cache.dirtied.len(),
            "Cache loaded"
        );
        Ok(cache)
    }

    fn add_field(
        &mut self,
        definition: FieldDefinition,
        store: &dyn DriverWrapper,
    ) -> Result<(), CacheError> {
        let mut table = factory::create_table(definition, store)?;
        table.read(store)?;
        for attribute in &table.definition().attributes {
            let mut values = LinkAttributeTable::for_table(&table, attribute, store)?;
            values.read(store)?;
            self.link_attributes
                .insert((table.field().to_string(), attribute.clone()), values);
        }
        self.tables.insert(table.field().to_string(), table);
        Ok(())
    }

    fn check_store(&self, store: &dyn DriverWrapper) -> Result<(), CacheError> {
        if store.library_id() != self.library_id {
            return Err(CacheError::integrity(format!(
                "cache belongs to library {} but store is {}",
                self.library_id,
                store.library_id()
            )));
        }
        Ok(())
    }

    fn require_title(&self, id: MainId) -> Result<&TitleRecord, CacheError> {
        self.titles.get(&id).ok_or(CacheError::UnknownTitle(id))
    }

    /// Runs `statements` plus dirtied marks for `touched` in one transaction.
    /// The marks are applied to memory once the store has committed.
    fn commit(
        &mut self,
        mut statements: Vec<Statement>,
        touched: &[MainId],
        store: &mut dyn DriverWrapper,
    ) -> Result<(), CacheError> {
        let (marks, sequences) = self.dirtied.plan_marks(touched);
        statements.extend(marks);
        if statements.is_empty() {
            return Ok(());
        }
        store.execute_atomic(&statements)?;
        self.dirtied.apply_marks(sequences);
        Ok(())
    }

    fn sync_attributes(&mut self, field: &str) {
        let Some(table) = self.tables.get(field) else {
            return;
        };
        for ((owner, _), values) in self.link_attributes.iter_mut() {
            if owner == field {
                values.sync_with_table(table);
            }
        }
    }

    // ===== Titles =====

    pub fn library_id(&self) -> LibraryId {
        self.library_id
    }

    pub fn title(&self, id: MainId) -> Option<&TitleRecord> {
        self.titles.get(&id)
    }

    pub fn all_title_ids(&self) -> Vec<MainId> {
        self.titles.keys().copied().collect()
    }

    pub fn contains_title(&self, id: MainId) -> bool {
        self.titles.contains_key(&id)
    }

    pub fn create_title(
        &mut self,
        title: &str,
        store: &mut dyn DriverWrapper,
    ) -> Result<MainId, CacheError> {
        self.check_store(store)?;
        let id = MainId::new(store.next_id(MAIN_TABLE)?);
        let sort = title_sort(title);
        let insert = Statement::new(format!(
            "INSERT INTO {MAIN_TABLE} ({}, {}, sort) VALUES (?1, ?2, ?3)",
            store.get_id_column(MAIN_TABLE)?,
            store.get_value_column(MAIN_TABLE)?
        ))
        .bind(id.get())
        .bind(title)
        .bind(sort.as_str());
        self.commit(vec![insert], &[id], store)?;

        self.titles.insert(
            id,
            TitleRecord {
                id,
                title: title.to_string(),
                sort,
            },
        );
        for table in self.tables.values_mut() {
            table.add_main(id);
        }
        debug!(%id, title, "Created title");
        Ok(id)
    }

    pub fn set_title(
        &mut self,
        id: MainId,
        title: &str,
        store: &mut dyn DriverWrapper,
    ) -> Result<(), CacheError> {
        self.check_store(store)?;
        self.require_title(id)?;
        let sort = title_sort(title);
        let update = Statement::new(format!(
            "UPDATE {MAIN_TABLE} SET {} = ?1, sort = ?2 WHERE {} = ?3",
            store.get_value_column(MAIN_TABLE)?,
            store.get_id_column(MAIN_TABLE)?
        ))
        .bind(title)
        .bind(sort.as_str())
        .bind(id.get());
        self.commit(vec![update], &[id], store)?;
        self.titles.insert(
            id,
            TitleRecord {
                id,
                title: title.to_string(),
                sort,
            },
        );
        Ok(())
    }

    /// Deletes titles and all their links. Returns, per field, the items
    /// left with no titles.
    pub fn remove_titles(
        &mut self,
        ids: &[MainId],
        store: &mut dyn DriverWrapper,
    ) -> Result<BTreeMap<String, BTreeSet<AuxId>>, CacheError> {
        self.check_store(store)?;
        let ids: Vec<MainId> = ids.iter().copied().collect::<BTreeSet<_>>().into_iter().collect();
        for id in &ids {
            self.require_title(*id)?;
        }

        let mut statements: Vec<Statement> = self
            .tables
            .values()
            .flat_map(|table| table.remove_books_statements(&ids))
            .collect();
        statements.extend(self.intralinks.remove_statements(&ids));
        let id_col = store.get_id_column(MAIN_TABLE)?;
        for id in &ids {
            statements.push(
                Statement::new(format!("DELETE FROM {MAIN_TABLE} WHERE {id_col} = ?1"))
                    .bind(id.get()),
            );
        }
        store.execute_atomic(&statements)?;

        let mut orphans = BTreeMap::new();
        let fields: Vec<String> = self.tables.keys().cloned().collect();
        for field in fields {
            if let Some(table) = self.tables.get_mut(&field) {
                let left = table.apply_remove_books(&ids);
                if !left.is_empty() {
                    orphans.insert(field.clone(), left);
                }
            }
            self.sync_attributes(&field);
        }
        self.intralinks.apply_remove(&ids);
        self.dirtied.forget(&ids);
        for id in &ids {
            self.titles.remove(id);
        }
        info!(titles = ids.len(), "Removed titles");
        Ok(orphans)
    }

    // ===== Fields =====

    pub fn table(&self, field: &str) -> Result<&CacheTable, CacheError> {
        self.tables
            .get(field)
            .ok_or_else(|| CacheError::UnknownField(field.to_string()))
    }

    fn table_mut(&mut self, field: &str) -> Result<&mut CacheTable, CacheError> {
        self.tables
            .get_mut(field)
            .ok_or_else(|| CacheError::UnknownField(field.to_string()))
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }

    pub fn tables(&self) -> impl Iterator<Item = &CacheTable> {
        self.tables.values()
    }

    /// Fields backed by the item table `table`.
    pub fn fields_for_table(&self, table: &str) -> Vec<String> {
        self.tables
            .values()
            .filter(|t| t.table() == table)
            .map(|t| t.field().to_string())
            .collect()
    }

    pub fn create_custom_column(
        &mut self,
        label: &str,
        shape: TableShape,
        value_kind: ValueKind,
        store: &mut dyn DriverWrapper,
    ) -> Result<CustomFieldRecord, CacheError> {
        self.check_store(store)?;
        let record = store.create_custom_field(label, shape, value_kind)?;
        self.add_field(FieldDefinition::from(&record), &*store)?;
        info!(field = %record.field_name(), table = %record.table, "Custom column added");
        Ok(record)
    }

    /// Item ids linked to a title, type groups concatenated.
    pub fn field_ids_for(&self, field: &str, main: MainId) -> Result<Vec<AuxId>, CacheError> {
        Ok(self.table(field)?.main_links(main))
    }

    pub fn books_for_field(&self, field: &str, item: AuxId) -> Result<Vec<MainId>, CacheError> {
        Ok(self.table(field)?.aux_links(item))
    }

    /// Id-level update of one field.
    pub fn set_field(
        &mut self,
        field: &str,
        updates: &UpdateMap,
        id_map: &IdMap,
        allow_case_change: bool,
        store: &mut dyn DriverWrapper,
    ) -> Result<UpdateOutcome, CacheError> {
        self.check_store(store)?;
        let table = self.table(field)?;
        let plan = table.plan_update(updates, id_map)?;
        CacheTable::check_case_changes(&plan, allow_case_change)?;
        let statements = table.plan_statements(&plan);
        if statements.is_empty() {
            return Ok(UpdateOutcome::default());
        }
        let touched = touched_titles(table, &plan);
        self.commit(statements, &touched, store)?;

        let outcome = self.table_mut(field)?.apply(plan);
        self.sync_attributes(field);
        Ok(outcome)
    }

    /// Links `main` to items by display value, creating missing items.
    /// Replaces the title's current links in this field and returns the ids
    /// in the order given.
    pub fn link_values(
        &mut self,
        field: &str,
        main: MainId,
        values: &[FieldValue],
        allow_case_change: bool,
        store: &mut dyn DriverWrapper,
    ) -> Result<Vec<AuxId>, CacheError> {
        let table = self.table(field)?;
        let (ids, id_map) = resolve_values(table, values, allow_case_change, &*store)?;
        let update = sequence_update(table, &ids)?;
        self.set_field(
            field,
            &UpdateMap::from([(main, update)]),
            &id_map,
            allow_case_change,
            store,
        )?;
        Ok(ids)
    }

    /// As [`Cache::link_values`], for one link type of a typed field.
    pub fn link_typed_values(
        &mut self,
        field: &str,
        main: MainId,
        link_type: &str,
        values: &[FieldValue],
        allow_case_change: bool,
        store: &mut dyn DriverWrapper,
    ) -> Result<Vec<AuxId>, CacheError> {
        let table = self.table(field)?;
        let (ids, id_map) = resolve_values(table, values, allow_case_change, &*store)?;
        let update = FieldUpdate::typed(link_type, sequence_update(table, &ids)?);
        self.set_field(
            field,
            &UpdateMap::from([(main, update)]),
            &id_map,
            allow_case_change,
            store,
        )?;
        Ok(ids)
    }

    pub fn remove_items(
        &mut self,
        field: &str,
        ids: &[AuxId],
        restrict_to_book_ids: Option<&[MainId]>,
        store: &mut dyn DriverWrapper,
    ) -> Result<BTreeSet<MainId>, CacheError> {
        self.check_store(store)?;
        let table = self.table(field)?;
        let plan = table.plan_remove_items(ids, restrict_to_book_ids)?;
        let statements = table.plan_statements(&plan);
        let touched = touched_titles(table, &plan);
        self.commit(statements, &touched, store)?;

        let changed = self.table_mut(field)?.apply(plan).changed;
        self.sync_attributes(field);
        Ok(changed)
    }

    /// Renames an item. When another item already carries the new name the
    /// two are merged and the existing one survives. Returns the surviving id.
    pub fn rename_item(
        &mut self,
        field: &str,
        id: AuxId,
        new_value: FieldValue,
        store: &mut dyn DriverWrapper,
    ) -> Result<AuxId, CacheError> {
        self.check_store(store)?;
        if new_value.is_null() {
            return Err(CacheError::invalid("item value must not be null"));
        }
        let table = self.table(field)?;
        if table.item_value(id).is_none() {
            return Err(CacheError::invalid(format!("unknown {field} item {id}")));
        }
        let collision = table.all_item_ids().into_iter().find(|other| {
            *other != id
                && table
                    .item_value(*other)
                    .is_some_and(|v| v.eq_ignore_case(&new_value))
        });
        if let Some(existing) = collision {
            let aux_table = table.table().to_string();
            self.merge_items(&aux_table, existing, id, store)?;
            return Ok(existing);
        }

        let fields = self.fields_for_table(table.table());
        let mut plans = Vec::with_capacity(fields.len());
        let mut statements = Vec::new();
        let mut touched = BTreeSet::new();
        for name in &fields {
            let table = self.table(name)?;
            let plan = table.plan_rename(id, new_value.clone())?;
            statements.extend(table.plan_statements(&plan));
            touched.extend(table.aux_links(id));
            plans.push((name.clone(), plan));
        }
        let touched: Vec<MainId> = touched.into_iter().collect();
        self.commit(statements, &touched, store)?;
        for (name, plan) in plans {
            self.table_mut(&name)?.apply(plan);
        }
        debug!(field, %id, "Renamed item");
        Ok(id)
    }

    /// Folds `discard` into `keep` in every field backed by `table`, carrying
    /// link attributes across, all in one transaction. Returns the titles
    /// touched.
    #[instrument(skip(self, store))]
    pub fn merge_items(
        &mut self,
        table: &str,
        keep: AuxId,
        discard: AuxId,
        store: &mut dyn DriverWrapper,
    ) -> Result<BTreeSet<MainId>, CacheError> {
        self.check_store(store)?;
        let fields = self.fields_for_table(table);
        if fields.is_empty() {
            return Err(CacheError::UnknownField(table.to_string()));
        }

        let mut plans = Vec::with_capacity(fields.len());
        let mut statements = Vec::new();
        let mut touched = BTreeSet::new();
        for field in &fields {
            let cache_table = self.table(field)?;
            let plan = cache_table.plan_merge(keep, discard)?;
            touched.extend(plan.states.keys().copied());
            statements.extend(cache_table.plan_statements(&plan));
            plans.push((field.clone(), plan));
        }
        let mut carried = Vec::new();
        for ((field, attribute), values) in &self.link_attributes {
            if !fields.contains(field) {
                continue;
            }
            for (main, value) in values.merge_carry(keep, discard) {
                statements.push(values.set_statement(main, keep, &value));
                carried.push((field.clone(), attribute.clone(), main, value));
            }
        }
        let touched_list: Vec<MainId> = touched.iter().copied().collect();
        self.commit(statements, &touched_list, store)?;

        for (field, plan) in plans {
            self.table_mut(&field)?.apply(plan);
            self.sync_attributes(&field);
        }
        for (field, attribute, main, value) in carried {
            if let (Some(cache_table), Some(values)) = (
                self.tables.get(&field),
                self.link_attributes.get_mut(&(field.clone(), attribute)),
            ) {
                values.apply_set(cache_table, main, keep, value);
            }
        }
        info!(table, %keep, %discard, titles = touched.len(), "Merged items");
        Ok(touched)
    }

    /// Deletes the given items of `table` that no title links to. Returns
    /// the ids deleted.
    pub fn clean(
        &mut self,
        table: &str,
        ids: &[AuxId],
        store: &mut dyn DriverWrapper,
    ) -> Result<BTreeSet<AuxId>, CacheError> {
        self.check_store(store)?;
        let fields = self.fields_for_table(table);
        if fields.is_empty() {
            return Err(CacheError::UnknownField(table.to_string()));
        }
        let orphans: BTreeSet<AuxId> = ids
            .iter()
            .copied()
            .filter(|id| {
                fields.iter().all(|field| {
                    self.tables.get(field).is_some_and(|t| {
                        t.item_value(*id).is_some() && t.usage_count(*id) == 0
                    })
                })
            })
            .collect();
        if orphans.is_empty() {
            return Ok(orphans);
        }

        let mut plans = Vec::with_capacity(fields.len());
        let mut statements = Vec::new();
        for field in &fields {
            let plan = Plan {
                deleted_items: orphans.clone(),
                ..Plan::default()
            };
            statements.extend(self.table(field)?.plan_statements(&plan));
            plans.push((field.clone(), plan));
        }
        store.execute_atomic(&statements)?;
        for (field, plan) in plans {
            self.table_mut(&field)?.apply(plan);
        }
        debug!(table, deleted = orphans.len(), "Cleaned unused items");
        Ok(orphans)
    }

    // ===== Link attributes =====

    pub fn link_attribute(
        &self,
        field: &str,
        attribute: &str,
    ) -> Result<&LinkAttributeTable, CacheError> {
        self.link_attributes
            .get(&(field.to_string(), attribute.to_string()))
            .ok_or_else(|| CacheError::UnknownField(format!("{field}.{attribute}")))
    }

    /// Sets the attribute on an existing link; null clears it.
    pub fn set_link_attribute(
        &mut self,
        field: &str,
        attribute: &str,
        main: MainId,
        item: AuxId,
        value: FieldValue,
        store: &mut dyn DriverWrapper,
    ) -> Result<(), CacheError> {
        self.check_store(store)?;
        if self.table(field)?.link_position(main, item).is_none() {
            return Err(CacheError::invalid(format!(
                "title {main} is not linked to {field} item {item}"
            )));
        }
        let statement = self
            .link_attribute(field, attribute)?
            .set_statement(main, item, &value);
        self.commit(vec![statement], &[main], store)?;

        let key = (field.to_string(), attribute.to_string());
        if let (Some(table), Some(values)) =
            (self.tables.get(field), self.link_attributes.get_mut(&key))
        {
            values.apply_set(table, main, item, value);
        }
        Ok(())
    }

    // ===== Intralinks =====

    pub fn intralinks(&self) -> &Intralinks {
        &self.intralinks
    }

    pub fn add_intralink(
        &mut self,
        primary: MainId,
        secondary: MainId,
        link_type: &str,
        store: &mut dyn DriverWrapper,
    ) -> Result<(), CacheError> {
        self.check_store(store)?;
        self.require_title(primary)?;
        self.require_title(secondary)?;
        let statement = self.intralinks.plan_insert(primary, secondary, link_type)?;
        self.commit(vec![statement], &[primary, secondary], store)?;
        self.intralinks.apply_insert(primary, secondary, link_type);
        Ok(())
    }

    pub fn reload_intralinks(&mut self, store: &dyn DriverWrapper) -> Result<(), CacheError> {
        self.intralinks.read(store)
    }

    // ===== Dirtied titles and backups =====

    pub fn dirtied(&self) -> &DirtiedTitles {
        &self.dirtied
    }

    pub fn mark_dirty(
        &mut self,
        ids: &[MainId],
        store: &mut dyn DriverWrapper,
    ) -> Result<(), CacheError> {
        self.check_store(store)?;
        let known: Vec<MainId> = ids
            .iter()
            .copied()
            .filter(|id| self.titles.contains_key(id))
            .collect();
        self.commit(Vec::new(), &known, store)
    }

    pub fn get_a_dirtied_book(&self) -> Option<MainId> {
        self.dirtied.random()
    }

    /// Current metadata of a dirtied title with the sequence it was dumped
    /// at.
    pub fn get_metadata_for_dump(&self, id: MainId) -> Option<(BookMetadata, u64)> {
        let sequence = self.dirtied.sequence(id)?;
        Some((self.book_metadata(id)?, sequence))
    }

    pub fn clear_dirtied(
        &mut self,
        id: MainId,
        sequence: u64,
        store: &mut dyn DriverWrapper,
    ) -> Result<bool, CacheError> {
        self.check_store(store)?;
        self.dirtied.clear(id, sequence, store)
    }

    /// Stores a title's backup. Returns false when the stored backup already
    /// has the same content.
    pub fn write_backup(
        &self,
        id: MainId,
        payload: &[u8],
        store: &mut dyn DriverWrapper,
    ) -> Result<bool, CacheError> {
        self.check_store(store)?;
        self.require_title(id)?;
        let digest = blake3::hash(payload);
        let stored = store.execute(
            &Statement::new("SELECT digest FROM title_backups WHERE title_id = ?1").bind(id.get()),
        )?;
        if let Some(FieldValue::Bytes(existing)) = stored.first().and_then(|row| row.first())
            && existing.as_slice() == digest.as_bytes()
        {
            return Ok(false);
        }
        store.execute_atomic(&[Statement::new(
            "INSERT OR REPLACE INTO title_backups (title_id, payload, digest) VALUES (?1, ?2, ?3)",
        )
        .bind(id.get())
        .bind(FieldValue::Bytes(payload.to_vec()))
        .bind(FieldValue::Bytes(digest.as_bytes().to_vec()))])?;
        Ok(true)
    }

    pub fn read_backup(
        &self,
        id: MainId,
        store: &dyn DriverWrapper,
    ) -> Result<Option<BookMetadata>, CacheError> {
        let rows = store.execute(
            &Statement::new("SELECT payload FROM title_backups WHERE title_id = ?1").bind(id.get()),
        )?;
        match rows.first().and_then(|row| row.first()) {
            Some(FieldValue::Bytes(payload)) => Ok(Some(BookMetadata::from_msgpack(payload)?)),
            Some(_) => Err(CacheError::integrity(format!("backup of title {id} is not a blob"))),
            None => Ok(None),
        }
    }

    pub fn book_metadata(&self, id: MainId) -> Option<BookMetadata> {
        let record = self.titles.get(&id)?;
        let mut fields = BTreeMap::new();
        let mut typed_fields = BTreeMap::new();
        for table in self.tables.values() {
            let groups = table.typed_main_links(id);
            if groups.is_empty() {
                continue;
            }
            let names = |ids: &[AuxId]| -> Vec<String> {
                ids.iter()
                    .filter_map(|item| table.item_value(*item))
                    .map(FieldValue::display)
                    .collect()
            };
            if table.shape().typed {
                let by_type: BTreeMap<String, Vec<String>> = groups
                    .iter()
                    .map(|(link_type, ids)| (link_type.clone(), names(ids)))
                    .collect();
                typed_fields.insert(table.field().to_string(), by_type);
            } else {
                let values: Vec<String> = groups.values().flat_map(|ids| names(ids)).collect();
                fields.insert(table.field().to_string(), values);
            }
        }

        let mut link_attributes = BTreeMap::new();
        for ((field, attribute), values) in &self.link_attributes {
            let Some(table) = self.tables.get(field) else {
                continue;
            };
            let by_item: BTreeMap<String, FieldValue> = values
                .get_main_val_dict(id)
                .into_iter()
                .filter_map(|(item, value)| table.item_value(item).map(|name| (name.display(), value)))
                .collect();
            if !by_item.is_empty() {
                link_attributes.insert(format!("{field}.{attribute}"), by_item);
            }
        }

        Some(BookMetadata {
            id,
            title: record.title.clone(),
            sort: record.sort.clone(),
            fields,
            typed_fields,
            link_attributes,
            intralinks: self.intralinks.linked(id).into_iter().collect(),
        })
    }

    // ===== Reconciling writes made behind the cache =====

    /// Re-reads a title row. A title gone from the store is dropped from
    /// every table. Returns whether the title still exists.
    pub fn refresh_title(
        &mut self,
        id: MainId,
        store: &dyn DriverWrapper,
    ) -> Result<bool, CacheError> {
        self.check_store(store)?;
        let rows = store.execute(
            &Statement::new(format!(
                "SELECT {}, sort FROM {MAIN_TABLE} WHERE {} = ?1",
                store.get_value_column(MAIN_TABLE)?,
                store.get_id_column(MAIN_TABLE)?
            ))
            .bind(id.get()),
        )?;
        if let Some(row) = rows.first() {
            let title = row.first().map(FieldValue::display).unwrap_or_default();
            let sort = row
                .get(1)
                .and_then(FieldValue::as_text)
                .map(str::to_string)
                .unwrap_or_else(|| title_sort(&title));
            self.titles.insert(id, TitleRecord { id, title, sort });
            for table in self.tables.values_mut() {
                table.add_main(id);
            }
            return Ok(true);
        }

        if self.titles.remove(&id).is_some() {
            let fields: Vec<String> = self.tables.keys().cloned().collect();
            for field in fields {
                if let Some(table) = self.tables.get_mut(&field) {
                    table.apply_remove_books(&[id]);
                }
                self.sync_attributes(&field);
            }
            self.intralinks.apply_remove(&[id]);
            self.dirtied.forget(&[id]);
            debug!(%id, "Dropped title deleted behind the cache");
        }
        Ok(false)
    }

    /// Re-reads one title's links in every field backed by `table`.
    pub fn resync_link(
        &mut self,
        table: &str,
        main: MainId,
        store: &dyn DriverWrapper,
    ) -> Result<(), CacheError> {
        if !self.titles.contains_key(&main) && !self.refresh_title(main, store)? {
            return Ok(());
        }
        for field in self.fields_for_table(table) {
            self.table_mut(&field)?.resync_main(main, store)?;
            for ((owner, _), values) in self.link_attributes.iter_mut() {
                if *owner == field {
                    values.read(store)?;
                }
            }
            self.sync_attributes(&field);
        }
        Ok(())
    }

    /// Re-reads one item row, and the links the store holds to it, in every
    /// field backed by `table`. Returns the titles linked to it.
    pub fn resync_item(
        &mut self,
        table: &str,
        id: AuxId,
        store: &dyn DriverWrapper,
    ) -> Result<BTreeSet<MainId>, CacheError> {
        let fields = self.fields_for_table(table);
        let mut linked = BTreeSet::new();
        for field in &fields {
            linked.extend(self.table(field)?.stored_links(id, store)?);
        }
        for main in &linked {
            self.resync_link(table, *main, store)?;
        }

        let mut owners = BTreeSet::new();
        for field in fields {
            owners.extend(self.table_mut(&field)?.resync_item(id, store)?);
            self.sync_attributes(&field);
        }
        Ok(owners)
    }

    /// Items of `table` whose value matches `id`'s ignoring case.
    pub fn case_duplicates(&self, table: &str, id: AuxId) -> Vec<AuxId> {
        let Some(cache_table) = self.tables.values().find(|t| t.table() == table) else {
            return Vec::new();
        };
        let Some(value) = cache_table.item_value(id) else {
            return Vec::new();
        };
        cache_table
            .all_item_ids()
            .into_iter()
            .filter(|other| {
                *other != id
                    && cache_table
                        .item_value(*other)
                        .is_some_and(|v| v.eq_ignore_case(value))
            })
            .collect()
    }

    /// Rewrites the denormalized per-title display values.
    pub fn recompute_aggregates(
        &self,
        id: MainId,
        store: &mut dyn DriverWrapper,
    ) -> Result<(), CacheError> {
        self.check_store(store)?;
        let mut statements = vec![
            Statement::new("DELETE FROM title_aggregates WHERE title_id = ?1").bind(id.get()),
        ];
        if self.titles.contains_key(&id) {
            for table in self.tables.values() {
                let names: Vec<String> = table
                    .main_links(id)
                    .into_iter()
                    .filter_map(|item| table.item_value(item).map(FieldValue::display))
                    .collect();
                if names.is_empty() {
                    continue;
                }
                statements.push(
                    Statement::new(
                        "INSERT INTO title_aggregates (title_id, field, value) VALUES (?1, ?2, ?3)",
                    )
                    .bind(id.get())
                    .bind(table.field())
                    .bind(names.join("; ")),
                );
            }
        }
        store.execute_atomic(&statements)?;
        Ok(())
    }

    /// Whether every table's forward and reverse maps agree.
    pub fn is_consistent(&self) -> bool {
        self.tables.values().all(CacheTable::is_consistent)
    }
}

fn read_titles(store: &dyn DriverWrapper) -> Result<BTreeMap<MainId, TitleRecord>, CacheError> {
    let rows = store.execute(&Statement::new(format!(
        "SELECT {}, {}, sort FROM {MAIN_TABLE}",
        store.get_id_column(MAIN_TABLE)?,
        store.get_value_column(MAIN_TABLE)?
    )))?;
    let mut titles = BTreeMap::new();
    for row in rows {
        let id = row
            .first()
            .and_then(FieldValue::as_integer)
            .map(MainId::new)
            .ok_or_else(|| CacheError::integrity("non-integer title id"))?;
        let title = row.get(1).map(FieldValue::display).unwrap_or_default();
        let sort = row
            .get(2)
            .and_then(FieldValue::as_text)
            .map(str::to_string)
            .unwrap_or_else(|| title_sort(&title));
        titles.insert(id, TitleRecord { id, title, sort });
    }
    Ok(titles)
}

/// Titles whose metadata a plan changes: new link states and owners of
/// renamed items.
fn touched_titles(table: &CacheTable, plan: &Plan) -> Vec<MainId> {
    let mut touched: BTreeSet<MainId> = plan
        .states
        .iter()
        .filter(|(main, state)| table.typed_main_links(**main) != **state)
        .map(|(main, _)| *main)
        .collect();
    for item in plan.renamed_items.keys().chain(plan.deleted_items.iter()) {
        touched.extend(table.aux_links(*item));
    }
    touched.into_iter().collect()
}

/// Maps display values to item ids. Unknown values get consecutive new ids;
/// a repeated value links once.
fn resolve_values(
    table: &CacheTable,
    values: &[FieldValue],
    allow_case_change: bool,
    store: &dyn DriverWrapper,
) -> Result<(Vec<AuxId>, IdMap), CacheError> {
    let mut ids = Vec::with_capacity(values.len());
    let mut id_map = IdMap::new();
    let mut next_id: Option<i64> = None;
    for value in values {
        if value.is_null() {
            return Err(CacheError::invalid("item value must not be null"));
        }
        let pending = id_map
            .iter()
            .find(|(id, v)| table.item_value(**id).is_none() && v.eq_ignore_case(value))
            .map(|(id, _)| *id);
        let id = match pending.or_else(|| table.item_id_for_value(value)) {
            Some(id) => {
                if allow_case_change
                    && table.item_value(id).is_some_and(|current| current != value)
                {
                    id_map.insert(id, value.clone());
                }
                id
            }
            None => {
                let raw = match next_id {
                    Some(raw) => raw,
                    None => store.next_id(table.table())?,
                };
                next_id = Some(raw + 1);
                let id = AuxId::new(raw);
                id_map.insert(id, value.clone());
                id
            }
        };
        if !ids.contains(&id) {
            ids.push(id);
        }
    }
    Ok((ids, id_map))
}

fn sequence_update(table: &CacheTable, ids: &[AuxId]) -> Result<FieldUpdate, CacheError> {
    if table.shape().cardinality.forward_single() {
        return match ids {
            [] => Ok(FieldUpdate::Remove),
            [id] => Ok(FieldUpdate::Single(*id)),
            _ => Err(CacheError::invalid(format!(
                "{} takes a single value per title",
                table.field()
            ))),
        };
    }
    if ids.is_empty() {
        Ok(FieldUpdate::Remove)
    } else {
        Ok(FieldUpdate::Many(ids.to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn title_sort_moves_leading_article() {
        assert_eq!(title_sort("The Hobbit"), "Hobbit, The");
        assert_eq!(title_sort("an Unexpected Party"), "Unexpected Party, an");
        assert_eq!(title_sort("Theory of Games"), "Theory of Games");
        assert_eq!(title_sort("The"), "The");
    }
}
