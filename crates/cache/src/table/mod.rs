//! In-memory mirror of one title/item relation.
//!
//! A [`CacheTable`] holds a forward map (title to items, grouped by link type)
//! and a reverse map (item to titles). Every write is planned and validated
//! against the current maps first, then persisted, then applied, so a failed
//! call leaves both the maps and the store untouched.
//!
//! Tables never lock. Callers hold the cache lock around every call.

pub mod factory;
pub mod strategy;
pub mod writer;

use std::collections::{BTreeMap, BTreeSet, HashMap};

use shelfmark_core::{
    AuxId, FieldValue, LibraryId, MainId,
    naming::MAIN_TABLE,
    shape::TableShape,
};
use shelfmark_storage::{DriverWrapper, Row, Statement};
use tracing::{debug, instrument, warn};

use crate::error::CacheError;

pub use factory::FieldDefinition;
pub use strategy::{Groups, GroupingStrategy, OrderingStrategy, UNTYPED};
pub use writer::LinkColumns;

use writer::LinkWriter;

/// New link state for one title.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldUpdate {
    /// Drop the links (all of them, or one link type's).
    Remove,
    /// Link one item: replaces on single-valued fields, adds otherwise and
    /// promotes to the front on priority fields.
    Single(AuxId),
    /// Replace the whole sequence.
    Many(Vec<AuxId>),
    /// Per link type values for typed fields.
    Typed(BTreeMap<String, FieldUpdate>),
}

impl FieldUpdate {
    pub fn typed(link_type: &str, value: FieldUpdate) -> Self {
        FieldUpdate::Typed(BTreeMap::from([(link_type.to_string(), value)]))
    }
}

pub type UpdateMap = BTreeMap<MainId, FieldUpdate>;

/// Display values for item ids, typically rows created in the same write.
pub type IdMap = BTreeMap<AuxId, FieldValue>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateOutcome {
    /// Titles whose links changed.
    pub changed: BTreeSet<MainId>,
    /// Titles left with no links in this field.
    pub removed: BTreeSet<MainId>,
}

/// A validated change, ready to be written and applied.
#[derive(Debug, Default)]
pub(crate) struct Plan {
    pub(crate) states: BTreeMap<MainId, Groups<AuxId>>,
    pub(crate) new_items: IdMap,
    pub(crate) renamed_items: IdMap,
    pub(crate) deleted_items: BTreeSet<AuxId>,
}

/// Comparable copy of a table's maps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSnapshot {
    pub forward: BTreeMap<MainId, Groups<AuxId>>,
    pub reverse: BTreeMap<AuxId, Vec<MainId>>,
}

fn contains(groups: &Groups<AuxId>, id: AuxId) -> bool {
    groups.values().any(|ids| ids.contains(&id))
}

fn strip(groups: &mut Groups<AuxId>, id: AuxId) {
    for ids in groups.values_mut() {
        ids.retain(|x| *x != id);
    }
    groups.retain(|_, ids| !ids.is_empty());
}

fn flatten(groups: &Groups<AuxId>) -> Vec<AuxId> {
    groups.values().flatten().copied().collect()
}

fn int_at(row: &Row, index: usize, what: &str) -> Result<i64, CacheError> {
    row.get(index)
        .and_then(FieldValue::as_integer)
        .ok_or_else(|| CacheError::integrity(format!("expected integer {what} in column {index}")))
}

pub struct CacheTable {
    definition: FieldDefinition,
    library_id: LibraryId,
    ordering: OrderingStrategy,
    grouping: GroupingStrategy,
    columns: LinkColumns,
    writer: LinkWriter,
    forward: HashMap<MainId, Groups<AuxId>>,
    reverse: HashMap<AuxId, Vec<MainId>>,
    items: HashMap<AuxId, FieldValue>,
}

impl CacheTable {
    pub fn new(definition: FieldDefinition, store: &dyn DriverWrapper) -> Result<Self, CacheError> {
        let columns = LinkColumns::resolve(&definition.table, definition.shape, store)?;
        let ordering = if definition.shape.priority {
            OrderingStrategy::Priority
        } else {
            OrderingStrategy::Unordered
        };
        let grouping = if definition.shape.typed {
            GroupingStrategy::Typed
        } else {
            GroupingStrategy::Untyped
        };
        Ok(Self {
            definition,
            library_id: store.library_id(),
            ordering,
            grouping,
            writer: LinkWriter::new(columns.clone()),
            columns,
            forward: HashMap::new(),
            reverse: HashMap::new(),
            items: HashMap::new(),
        })
    }

    pub fn field(&self) -> &str {
        &self.definition.field
    }

    pub fn table(&self) -> &str {
        &self.definition.table
    }

    pub fn shape(&self) -> TableShape {
        self.definition.shape
    }

    pub fn definition(&self) -> &FieldDefinition {
        &self.definition
    }

    pub fn columns(&self) -> &LinkColumns {
        &self.columns
    }

    fn check_store(&self, store: &dyn DriverWrapper) -> Result<(), CacheError> {
        if store.library_id() != self.library_id {
            return Err(CacheError::integrity(format!(
                "{} table belongs to library {} but store is {}",
                self.definition.field,
                self.library_id,
                store.library_id()
            )));
        }
        Ok(())
    }

    // ===== Loading =====

    /// Loads titles, items and links from the store, replacing the maps.
    #[instrument(skip_all, fields(field = %self.definition.field))]
    pub fn read(&mut self, store: &dyn DriverWrapper) -> Result<(), CacheError> {
        self.check_store(store)?;
        let c = &self.columns;
        let shape = self.definition.shape;

        let mut forward = HashMap::new();
        let main_id_col = store.get_id_column(MAIN_TABLE)?;
        for row in store.execute(&Statement::new(format!("SELECT {main_id_col} FROM {MAIN_TABLE}")))? {
            forward.insert(MainId::new(int_at(&row, 0, "title id")?), Groups::new());
        }

        let mut items = HashMap::new();
        for row in store.execute(&Statement::new(format!(
            "SELECT {}, {} FROM {}",
            c.item_id, c.item_value, c.item_table
        )))? {
            let value = row.get(1).cloned().unwrap_or(FieldValue::Null);
            items.insert(AuxId::new(int_at(&row, 0, "item id")?), value);
        }

        let mut select = vec![c.main.clone(), c.item.clone()];
        select.extend(c.link_type.iter().cloned());
        let mut sql = format!("SELECT {} FROM {}", select.join(", "), c.link_table);
        if let Some(priority_col) = &c.priority {
            sql.push_str(&format!(" ORDER BY {priority_col} DESC"));
        }

        let mut reverse: HashMap<AuxId, Vec<MainId>> = HashMap::new();
        let mut links = 0usize;
        for row in store.execute(&Statement::new(sql))? {
            let main = MainId::new(int_at(&row, 0, "title id")?);
            let item = AuxId::new(int_at(&row, 1, "item id")?);
            let link_type = c.link_type.as_ref().and_then(|_| row.get(2)).and_then(FieldValue::as_text);
            let Some(groups) = forward.get_mut(&main) else {
                warn!(%main, %item, "Link to a missing title skipped");
                continue;
            };
            if !items.contains_key(&item) {
                warn!(%main, %item, "Link to a missing item skipped");
                continue;
            }
            if shape.cardinality.forward_single() && groups.values().any(|g| !g.is_empty()) {
                return Err(CacheError::integrity(format!(
                    "title {main} has more than one {} link",
                    self.definition.field
                )));
            }
            let key = self.grouping.loaded_key(link_type);
            self.ordering.place_loaded(groups.entry(key).or_default(), item);

            let owners = reverse.entry(item).or_default();
            OrderingStrategy::Unordered.link(owners, main);
            if shape.cardinality.reverse_single() && owners.len() > 1 {
                return Err(CacheError::integrity(format!(
                    "{} item {item} is linked to more than one title",
                    self.definition.field
                )));
            }
            links += 1;
        }

        debug!(titles = forward.len(), items = items.len(), links, "Cache table loaded");
        self.forward = forward;
        self.reverse = reverse;
        self.items = items;
        Ok(())
    }

    /// Makes a newly created title known to the table.
    pub fn add_main(&mut self, main: MainId) {
        self.forward.entry(main).or_default();
    }

    // ===== Updates =====

    /// Applies `updates` to the maps only. The store must already hold the
    /// same change.
    pub fn update_cache(
        &mut self,
        updates: &UpdateMap,
        id_map: &IdMap,
    ) -> Result<UpdateOutcome, CacheError> {
        let plan = self.plan_update(updates, id_map)?;
        Ok(self.apply(plan))
    }

    /// Persists `updates` without touching the maps. Returns whether anything
    /// was written.
    pub fn update_db(
        &self,
        updates: &UpdateMap,
        id_map: &IdMap,
        store: &mut dyn DriverWrapper,
        allow_case_change: bool,
    ) -> Result<bool, CacheError> {
        let plan = self.plan_update(updates, id_map)?;
        Self::check_case_changes(&plan, allow_case_change)?;
        self.write_plan(&plan, store)
    }

    /// Validates, persists, then applies `updates`.
    pub fn update(
        &mut self,
        updates: &UpdateMap,
        id_map: &IdMap,
        store: &mut dyn DriverWrapper,
        allow_case_change: bool,
    ) -> Result<UpdateOutcome, CacheError> {
        let plan = self.plan_update(updates, id_map)?;
        Self::check_case_changes(&plan, allow_case_change)?;
        self.write_plan(&plan, store)?;
        Ok(self.apply(plan))
    }

    pub(crate) fn check_case_changes(plan: &Plan, allow_case_change: bool) -> Result<(), CacheError> {
        match plan.renamed_items.keys().next() {
            Some(id) if !allow_case_change => Err(CacheError::invalid(format!(
                "changing the case of item {id} is not allowed"
            ))),
            _ => Ok(()),
        }
    }

    pub(crate) fn plan_update(
        &self,
        updates: &UpdateMap,
        id_map: &IdMap,
    ) -> Result<Plan, CacheError> {
        let mut plan = Plan::default();
        for (id, value) in id_map {
            match self.items.get(id) {
                None => {
                    plan.new_items.insert(*id, value.clone());
                }
                Some(old) if old == value => {}
                Some(old) if old.eq_ignore_case(value) => {
                    plan.renamed_items.insert(*id, value.clone());
                }
                Some(old) => {
                    return Err(CacheError::invalid(format!(
                        "item {id} already holds {old:?}; rename it instead"
                    )));
                }
            }
        }

        let forward_single = self.definition.shape.cardinality.forward_single();
        for (main, update) in updates {
            let mut state = self
                .forward
                .get(main)
                .cloned()
                .ok_or_else(|| CacheError::invalid(format!("unknown title {main}")))?;
            for edit in self.grouping.expand(update)? {
                let strategy::GroupEdit::Group(key, value) = edit else {
                    state.clear();
                    continue;
                };
                match value {
                    FieldUpdate::Remove => {
                        state.remove(key);
                    }
                    FieldUpdate::Single(id) => {
                        self.require_item(*id, &plan)?;
                        if forward_single {
                            state.clear();
                            state.insert(key.to_string(), vec![*id]);
                        } else {
                            self.ordering.link(state.entry(key.to_string()).or_default(), *id);
                        }
                    }
                    FieldUpdate::Many(ids) => {
                        if forward_single {
                            return Err(CacheError::invalid(format!(
                                "{} takes a single value per title",
                                self.definition.field
                            )));
                        }
                        for id in ids {
                            self.require_item(*id, &plan)?;
                        }
                        let ids = self.ordering.replace(ids).map_err(|dup| {
                            CacheError::invalid(format!("item {dup} appears twice for title {main}"))
                        })?;
                        if ids.is_empty() {
                            state.remove(key);
                        } else {
                            state.insert(key.to_string(), ids);
                        }
                    }
                    FieldUpdate::Typed(_) => {
                        return Err(CacheError::invalid("link types cannot be nested"));
                    }
                }
            }

            let mut all = flatten(&state);
            let linked = all.len();
            all.sort();
            all.dedup();
            if all.len() != linked {
                return Err(CacheError::invalid(format!(
                    "title {main} would link one item under two link types"
                )));
            }
            plan.states.insert(*main, state);
        }

        self.check_reverse_single(&plan)?;
        Ok(plan)
    }

    fn require_item(&self, id: AuxId, plan: &Plan) -> Result<(), CacheError> {
        if self.items.contains_key(&id) || plan.new_items.contains_key(&id) {
            Ok(())
        } else {
            Err(CacheError::invalid(format!(
                "unknown {} item {id}",
                self.definition.field
            )))
        }
    }

    /// On tables where an item belongs to one title, rejects plans that would
    /// hand an item to a second title without releasing it from the first.
    fn check_reverse_single(&self, plan: &Plan) -> Result<(), CacheError> {
        if !self.definition.shape.cardinality.reverse_single() {
            return Ok(());
        }
        let mut claimed: HashMap<AuxId, MainId> = HashMap::new();
        for (main, state) in &plan.states {
            for item in state.values().flatten() {
                if let Some(other) = claimed.insert(*item, *main) {
                    return Err(CacheError::invalid(format!(
                        "{} item {item} claimed by titles {other} and {main}",
                        self.definition.field
                    )));
                }
                for owner in self.reverse.get(item).into_iter().flatten() {
                    if owner == main {
                        continue;
                    }
                    let released = plan.states.get(owner).is_some_and(|s| !contains(s, *item));
                    if !released {
                        return Err(CacheError::invalid(format!(
                            "{} item {item} already belongs to title {owner}",
                            self.definition.field
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    pub(crate) fn plan_statements(&self, plan: &Plan) -> Vec<Statement> {
        self.writer.statements(&self.forward, plan)
    }

    fn write_plan(&self, plan: &Plan, store: &mut dyn DriverWrapper) -> Result<bool, CacheError> {
        self.check_store(store)?;
        let statements = self.plan_statements(plan);
        if statements.is_empty() {
            return Ok(false);
        }
        store.execute_atomic(&statements)?;
        Ok(true)
    }

    pub(crate) fn apply(&mut self, plan: Plan) -> UpdateOutcome {
        let mut outcome = UpdateOutcome::default();
        for (id, value) in plan.new_items.into_iter().chain(plan.renamed_items) {
            self.items.insert(id, value);
        }
        for (main, state) in plan.states {
            let old = self.forward.insert(main, state.clone()).unwrap_or_default();
            if old == state {
                continue;
            }
            let old_ids = flatten(&old);
            let new_ids = flatten(&state);
            for item in old_ids.iter().filter(|i| !new_ids.contains(i)) {
                if let Some(owners) = self.reverse.get_mut(item) {
                    owners.retain(|m| *m != main);
                    if owners.is_empty() {
                        self.reverse.remove(item);
                    }
                }
            }
            for item in new_ids.iter().filter(|i| !old_ids.contains(i)) {
                OrderingStrategy::Unordered.link(self.reverse.entry(*item).or_default(), main);
            }
            outcome.changed.insert(main);
            if !old.is_empty() && state.is_empty() {
                outcome.removed.insert(main);
            }
        }
        for item in plan.deleted_items {
            self.items.remove(&item);
            self.reverse.remove(&item);
        }
        debug!(
            field = %self.definition.field,
            changed = outcome.changed.len(),
            removed = outcome.removed.len(),
            "Cache table updated"
        );
        outcome
    }

    // ===== Removal =====

    /// Drops every link of the given titles. Returns items left with no
    /// titles at all.
    pub fn remove_books(
        &mut self,
        ids: &[MainId],
        store: &mut dyn DriverWrapper,
    ) -> Result<BTreeSet<AuxId>, CacheError> {
        self.check_store(store)?;
        store.execute_atomic(&self.remove_books_statements(ids))?;
        Ok(self.apply_remove_books(ids))
    }

    pub(crate) fn remove_books_statements(&self, ids: &[MainId]) -> Vec<Statement> {
        self.writer.remove_books(ids)
    }

    pub(crate) fn apply_remove_books(&mut self, ids: &[MainId]) -> BTreeSet<AuxId> {
        let mut orphans = BTreeSet::new();
        for main in ids {
            let Some(groups) = self.forward.remove(main) else {
                continue;
            };
            for item in groups.values().flatten() {
                if let Some(owners) = self.reverse.get_mut(item) {
                    owners.retain(|m| m != main);
                    if owners.is_empty() {
                        self.reverse.remove(item);
                        orphans.insert(*item);
                    }
                }
            }
        }
        orphans
    }

    /// Unlinks items and deletes their rows. With `restrict_to_book_ids`
    /// only those titles are unlinked, and a row is deleted only once nothing
    /// links to it. Returns the titles whose links changed.
    pub fn remove_items(
        &mut self,
        ids: &[AuxId],
        store: &mut dyn DriverWrapper,
        restrict_to_book_ids: Option<&[MainId]>,
    ) -> Result<BTreeSet<MainId>, CacheError> {
        let plan = self.plan_remove_items(ids, restrict_to_book_ids)?;
        self.write_plan(&plan, store)?;
        Ok(self.apply(plan).changed)
    }

    pub(crate) fn plan_remove_items(
        &self,
        ids: &[AuxId],
        restrict_to_book_ids: Option<&[MainId]>,
    ) -> Result<Plan, CacheError> {
        let mut plan = Plan::default();
        for id in ids {
            if !self.items.contains_key(id) {
                return Err(CacheError::invalid(format!(
                    "unknown {} item {id}",
                    self.definition.field
                )));
            }
            let mut still_linked = false;
            for main in self.reverse.get(id).into_iter().flatten() {
                if restrict_to_book_ids.is_some_and(|books| !books.contains(main)) {
                    still_linked = true;
                    continue;
                }
                let state = plan
                    .states
                    .entry(*main)
                    .or_insert_with(|| self.forward.get(main).cloned().unwrap_or_default());
                strip(state, *id);
            }
            if !still_linked {
                plan.deleted_items.insert(*id);
            }
        }
        Ok(plan)
    }

    // ===== Items =====

    /// Changes an item's display value; links are untouched.
    pub fn rename_item(
        &mut self,
        id: AuxId,
        new_value: FieldValue,
        store: &mut dyn DriverWrapper,
    ) -> Result<(), CacheError> {
        let plan = self.plan_rename(id, new_value)?;
        self.write_plan(&plan, store)?;
        self.apply(plan);
        Ok(())
    }

    pub(crate) fn plan_rename(&self, id: AuxId, new_value: FieldValue) -> Result<Plan, CacheError> {
        if !self.items.contains_key(&id) {
            return Err(CacheError::invalid(format!(
                "unknown {} item {id}",
                self.definition.field
            )));
        }
        let mut plan = Plan::default();
        plan.renamed_items.insert(id, new_value);
        Ok(plan)
    }

    /// Repoints every link at `discard` to `keep`, keeping each link's
    /// position, then deletes `discard`. Returns the titles touched.
    pub fn merge_items(
        &mut self,
        keep: AuxId,
        discard: AuxId,
        store: &mut dyn DriverWrapper,
    ) -> Result<BTreeSet<MainId>, CacheError> {
        let plan = self.plan_merge(keep, discard)?;
        self.write_plan(&plan, store)?;
        Ok(self.apply(plan).changed)
    }

    pub(crate) fn plan_merge(&self, keep: AuxId, discard: AuxId) -> Result<Plan, CacheError> {
        if keep == discard {
            return Err(CacheError::invalid(format!("cannot merge item {keep} into itself")));
        }
        for id in [keep, discard] {
            if !self.items.contains_key(&id) {
                return Err(CacheError::invalid(format!(
                    "unknown {} item {id}",
                    self.definition.field
                )));
            }
        }
        let mut plan = Plan::default();
        for main in self.reverse.get(&discard).into_iter().flatten() {
            let mut state = self.forward.get(main).cloned().unwrap_or_default();
            if contains(&state, keep) {
                strip(&mut state, discard);
            } else {
                for ids in state.values_mut() {
                    for id in ids.iter_mut().filter(|id| **id == discard) {
                        *id = keep;
                    }
                    if self.ordering == OrderingStrategy::Unordered {
                        ids.sort();
                    }
                }
            }
            plan.states.insert(*main, state);
        }
        plan.deleted_items.insert(discard);
        self.check_reverse_single(&plan)?;
        Ok(plan)
    }

    // ===== Resync =====

    /// Re-reads one title's links from the store after a write that bypassed
    /// this table.
    pub fn resync_main(
        &mut self,
        main: MainId,
        store: &dyn DriverWrapper,
    ) -> Result<UpdateOutcome, CacheError> {
        self.check_store(store)?;
        let c = &self.columns;
        let mut select = vec![c.item.clone()];
        select.extend(c.link_type.iter().cloned());
        let mut sql = format!("SELECT {} FROM {} WHERE {} = ?1", select.join(", "), c.link_table, c.main);
        if let Some(priority_col) = &c.priority {
            sql.push_str(&format!(" ORDER BY {priority_col} DESC"));
        }

        let mut plan = Plan::default();
        let mut groups = Groups::new();
        for row in store.execute(&Statement::new(sql).bind(main.get()))? {
            let item = AuxId::new(int_at(&row, 0, "item id")?);
            let link_type = c.link_type.as_ref().and_then(|_| row.get(1)).and_then(FieldValue::as_text);
            if !self.items.contains_key(&item) {
                match self.fetch_item(item, store)? {
                    Some(value) => {
                        plan.new_items.insert(item, value);
                    }
                    None => continue,
                }
            }
            let key = self.grouping.loaded_key(link_type);
            self.ordering.place_loaded(groups.entry(key).or_default(), item);
        }

        if self.definition.shape.cardinality.reverse_single() {
            for item in flatten(&groups) {
                for owner in self.reverse.get(&item).into_iter().flatten() {
                    if *owner != main {
                        let state = plan
                            .states
                            .entry(*owner)
                            .or_insert_with(|| self.forward.get(owner).cloned().unwrap_or_default());
                        strip(state, item);
                    }
                }
            }
        }
        plan.states.insert(main, groups);
        Ok(self.apply(plan))
    }

    /// Re-reads one item's display value. An item gone from the store is
    /// dropped from every title. Returns the titles linked to it.
    pub fn resync_item(
        &mut self,
        id: AuxId,
        store: &dyn DriverWrapper,
    ) -> Result<BTreeSet<MainId>, CacheError> {
        self.check_store(store)?;
        let owners: BTreeSet<MainId> = self.aux_links(id).into_iter().collect();
        match self.fetch_item(id, store)? {
            Some(value) => {
                self.items.insert(id, value);
                Ok(owners)
            }
            None => {
                let mut plan = Plan::default();
                for main in &owners {
                    let mut state = self.forward.get(main).cloned().unwrap_or_default();
                    strip(&mut state, id);
                    plan.states.insert(*main, state);
                }
                plan.deleted_items.insert(id);
                self.apply(plan);
                Ok(owners)
            }
        }
    }

    /// Titles the store links to `id`, which may not match the cached links.
    pub(crate) fn stored_links(
        &self,
        id: AuxId,
        store: &dyn DriverWrapper,
    ) -> Result<BTreeSet<MainId>, CacheError> {
        let c = &self.columns;
        let rows = store.execute(
            &Statement::new(format!(
                "SELECT {} FROM {} WHERE {} = ?1",
                c.main, c.link_table, c.item
            ))
            .bind(id.get()),
        )?;
        rows.iter()
            .map(|row| int_at(row, 0, "title id").map(MainId::new))
            .collect()
    }

    fn fetch_item(
        &self,
        id: AuxId,
        store: &dyn DriverWrapper,
    ) -> Result<Option<FieldValue>, CacheError> {
        let c = &self.columns;
        let rows = store.execute(
            &Statement::new(format!(
                "SELECT {} FROM {} WHERE {} = ?1",
                c.item_value, c.item_table, c.item_id
            ))
            .bind(id.get()),
        )?;
        Ok(rows.into_iter().next().and_then(|row| row.into_iter().next()))
    }

    // ===== Lookups =====

    pub fn has_main(&self, main: MainId) -> bool {
        self.forward.contains_key(&main)
    }

    pub fn main_ids(&self) -> BTreeSet<MainId> {
        self.forward.keys().copied().collect()
    }

    /// Items linked to a title, type groups concatenated in type order.
    pub fn main_links(&self, main: MainId) -> Vec<AuxId> {
        self.forward.get(&main).map(flatten).unwrap_or_default()
    }

    /// The favoured (or only) item linked to a title.
    pub fn main_link(&self, main: MainId) -> Option<AuxId> {
        self.main_links(main).first().copied()
    }

    pub fn typed_main_links(&self, main: MainId) -> Groups<AuxId> {
        self.forward.get(&main).cloned().unwrap_or_default()
    }

    pub fn aux_links(&self, id: AuxId) -> Vec<MainId> {
        self.reverse.get(&id).cloned().unwrap_or_default()
    }

    /// Every link type currently used by at least one title.
    pub fn known_types(&self) -> BTreeSet<String> {
        self.forward
            .values()
            .flat_map(|groups| groups.keys())
            .filter(|key| key.as_str() != UNTYPED)
            .cloned()
            .collect()
    }

    pub fn link_position(&self, main: MainId, id: AuxId) -> Option<(&str, usize)> {
        self.forward.get(&main)?.iter().find_map(|(key, ids)| {
            ids.iter().position(|x| *x == id).map(|pos| (key.as_str(), pos))
        })
    }

    pub fn item_value(&self, id: AuxId) -> Option<&FieldValue> {
        self.items.get(&id)
    }

    /// Case-insensitive lookup; the lowest id wins when several match.
    pub fn item_id_for_value(&self, value: &FieldValue) -> Option<AuxId> {
        self.items
            .iter()
            .filter(|(_, v)| v.eq_ignore_case(value))
            .map(|(id, _)| *id)
            .min()
    }

    pub fn usage_count(&self, id: AuxId) -> usize {
        self.reverse.get(&id).map_or(0, Vec::len)
    }

    pub fn all_item_ids(&self) -> BTreeSet<AuxId> {
        self.items.keys().copied().collect()
    }

    pub fn snapshot(&self) -> TableSnapshot {
        TableSnapshot {
            forward: self
                .forward
                .iter()
                .map(|(main, groups)| (*main, groups.clone()))
                .collect(),
            reverse: self
                .reverse
                .iter()
                .map(|(item, mains)| (*item, mains.clone()))
                .collect(),
        }
    }

    /// Whether every pair appears in both maps.
    pub fn is_consistent(&self) -> bool {
        let forward_ok = self.forward.iter().all(|(main, groups)| {
            groups
                .values()
                .flatten()
                .all(|item| self.reverse.get(item).is_some_and(|m| m.contains(main)))
        });
        let reverse_ok = self.reverse.iter().all(|(item, mains)| {
            !mains.is_empty()
                && mains.iter().all(|main| {
                    self.forward.get(main).is_some_and(|g| contains(g, *item))
                })
        });
        forward_ok && reverse_ok
    }
}
