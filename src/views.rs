/// Materialized views maintained incrementally from document events.
///
/// A view groups the documents of one collection by a group-key expression
/// and keeps one set of [`CachedAccumulator`]s per group. Views are:
///
/// - **Created** from a [`ViewDefinition`] (state `Loading`)
/// - **Loaded** by replaying documents or seeding from snapshot rows
/// - **Maintained** through `add_document` / `update_document` /
///   `delete_document` as change events arrive
/// - **Rendered** as one flat row per group on demand
///
/// # Example
///
/// ```ignore
/// use viewcache::views::{ViewDefinition, ViewManager};
/// use viewcache::accumulator::AccumulatorDefinition;
/// use viewcache::expression::Expression;
/// use viewcache::Namespace;
///
/// let definition = ViewDefinition::new("scores_by_genre", Namespace::new("db", "movies"), Expression::field("genre"))
///     .with_accumulator(AccumulatorDefinition::sum("total", Expression::field("score")));
///
/// let manager = ViewManager::new();
/// manager.create_view(definition)?;
/// let view = manager.get_view("scores_by_genre")?;
/// view.add_document(&json!({"genre": "action", "score": 10}))?;
/// let rows = view.get_view(false);
/// ```
use crate::accumulator::{AccumulatorDefinition, CachedAccumulator, CachedValue};
use crate::error::{CacheError, CacheResult};
use crate::expression::Expression;
use crate::types::{ContentHash, Namespace, OrderedValue, canonical_key, canonical_value, get_path};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

/// Definition of a materialized view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViewDefinition {
    /// Unique name of the view.
    pub name: String,
    /// Source collection.
    pub namespace: Namespace,
    /// Group key expression.
    pub group_by: Expression,
    /// Accumulators maintained per group, in output order.
    pub accumulators: Vec<AccumulatorDefinition>,
    /// When this view was defined.
    pub created_at: DateTime<Utc>,
    /// Optional description.
    pub description: Option<String>,
}

impl ViewDefinition {
    /// Create a new view definition without accumulators.
    pub fn new(name: impl Into<String>, namespace: Namespace, group_by: Expression) -> Self {
        Self {
            name: name.into(),
            namespace,
            group_by,
            accumulators: Vec::new(),
            created_at: Utc::now(),
            description: None,
        }
    }

    /// Add an accumulator.
    pub fn with_accumulator(mut self, accumulator: AccumulatorDefinition) -> Self {
        self.accumulators.push(accumulator);
        self
    }

    /// Set the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Lifecycle of a view as exposed to the admin surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ViewState {
    /// Created, not yet bootstrapped.
    Loading,
    /// Servable.
    Loaded,
    /// Integrity problem detected; must be rebuilt before serving again.
    Stale,
}

impl ViewState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ViewState::Loading,
            1 => ViewState::Loaded,
            _ => ViewState::Stale,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            ViewState::Loading => 0,
            ViewState::Loaded => 1,
            ViewState::Stale => 2,
        }
    }
}

impl fmt::Display for ViewState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ViewState::Loading => "LOADING",
            ViewState::Loaded => "LOADED",
            ViewState::Stale => "STALE",
        })
    }
}

/// Information about a view (for listing).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViewInfo {
    /// Name of the view.
    pub name: String,
    /// Source collection.
    pub namespace: Namespace,
    /// Lifecycle state.
    pub state: ViewState,
    /// Number of groups currently tracked.
    pub group_count: usize,
    /// Number of accumulators per group.
    pub accumulator_count: usize,
    /// Description if available.
    pub description: Option<String>,
    /// When created.
    pub created_at: DateTime<Utc>,
}

impl From<&MaterializedView> for ViewInfo {
    fn from(view: &MaterializedView) -> Self {
        Self {
            name: view.definition.name.clone(),
            namespace: view.definition.namespace.clone(),
            state: view.state(),
            group_count: view.group_count(),
            accumulator_count: view.accumulator_defs.len(),
            description: view.definition.description.clone(),
            created_at: view.definition.created_at,
        }
    }
}

/// Per-group state.
#[derive(Debug)]
struct Group {
    /// Evaluated group key as rendered in `_id`.
    key: JsonValue,
    /// Net number of documents added.
    documents: u64,
    /// Seeded from a snapshot; the document count is unknown.
    seeded: bool,
    accumulators: Vec<CachedAccumulator>,
}

/// An incrementally maintained group-by aggregation.
///
/// The group map is sharded; all accumulators of one group are updated under
/// that group's write lock, so readers never see a torn row.
pub struct MaterializedView {
    definition: ViewDefinition,
    accumulator_defs: Vec<Arc<AccumulatorDefinition>>,
    accumulator_hashes: Vec<ContentHash>,
    group_hash: ContentHash,
    groups: DashMap<String, Group>,
    state: AtomicU8,
}

impl fmt::Debug for MaterializedView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MaterializedView")
            .field("name", &self.definition.name)
            .field("namespace", &self.definition.namespace)
            .field("state", &self.state())
            .field("groups", &self.groups.len())
            .finish()
    }
}

impl MaterializedView {
    /// Create an empty view in the `Loading` state.
    ///
    /// Two accumulators with the same output name, or with the same
    /// operator and expression, are rejected.
    pub fn new(definition: ViewDefinition) -> CacheResult<Self> {
        let mut outputs = HashSet::new();
        let mut hashes = HashSet::new();
        let mut accumulator_hashes = Vec::with_capacity(definition.accumulators.len());
        for accumulator in &definition.accumulators {
            let hash = accumulator.hash();
            if !outputs.insert(accumulator.output.as_str()) || !hashes.insert(hash) {
                return Err(CacheError::DuplicateDefinition {
                    kind: "accumulator",
                    name: format!("{}.{}", definition.name, accumulator.output),
                });
            }
            accumulator_hashes.push(hash);
        }

        Ok(Self {
            accumulator_defs: definition
                .accumulators
                .iter()
                .cloned()
                .map(Arc::new)
                .collect(),
            accumulator_hashes,
            group_hash: definition.group_by.hash(),
            definition,
            groups: DashMap::new(),
            state: AtomicU8::new(ViewState::Loading.as_u8()),
        })
    }

    /// The view definition.
    pub fn definition(&self) -> &ViewDefinition {
        &self.definition
    }

    /// View name.
    pub fn name(&self) -> &str {
        &self.definition.name
    }

    /// Source collection.
    pub fn namespace(&self) -> &Namespace {
        &self.definition.namespace
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ViewState {
        ViewState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Set the lifecycle state.
    pub fn set_state(&self, state: ViewState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    /// Whether query answers may be derived from this view.
    pub fn is_servable(&self) -> bool {
        self.state() == ViewState::Loaded
    }

    /// Number of groups currently tracked.
    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    /// Content hashes of the maintained accumulators, in definition order.
    pub fn get_accumulator_hashes(&self) -> &[ContentHash] {
        &self.accumulator_hashes
    }

    /// The group key expression.
    pub fn get_group_expression(&self) -> &Expression {
        &self.definition.group_by
    }

    /// Content hash of the group key expression.
    pub fn group_hash(&self) -> ContentHash {
        self.group_hash
    }

    /// Route a new document into its group.
    pub fn add_document(&self, doc: &JsonValue) -> CacheResult<()> {
        let (key, key_value) = self.group_key(doc)?;
        let values = self.evaluate_inputs(doc)?;

        let mut group = self
            .groups
            .entry(key)
            .or_insert_with(|| self.new_group(key_value));
        for (accumulator, value) in group.accumulators.iter_mut().zip(&values) {
            accumulator.add_value(value.as_ref());
        }
        group.documents += 1;
        let faulty = group.accumulators.iter().any(CachedAccumulator::is_faulty);
        drop(group);

        if faulty {
            self.flag_stale("add on a seeded accumulator");
        }
        Ok(())
    }

    /// Remove a document from its group.
    ///
    /// Deleting from an untracked group is a no-op. Integrity warnings are
    /// returned after every accumulator of the group has been updated.
    pub fn delete_document(&self, doc: &JsonValue) -> CacheResult<()> {
        let (key, _) = self.group_key(doc)?;
        let values = self.evaluate_inputs(doc)?;

        let outcome = {
            let Some(mut group) = self.groups.get_mut(&key) else {
                tracing::trace!(view = %self.definition.name, group = %key, "delete from untracked group");
                return Ok(());
            };
            let mut outcome = Ok(());
            for (accumulator, value) in group.accumulators.iter_mut().zip(&values) {
                if let Err(e) = accumulator.delete_value(value.as_ref()) {
                    if outcome.is_ok() {
                        outcome = Err(e);
                    }
                }
            }
            group.documents = group.documents.saturating_sub(1);
            if group.accumulators.iter().any(CachedAccumulator::is_faulty) && outcome.is_ok() {
                outcome = Err(CacheError::AccumulatorIntegrity {
                    accumulator: self.definition.name.clone(),
                    value: key.clone(),
                });
            }
            outcome
        };

        self.groups
            .remove_if(&key, |_, group| group.documents == 0 && !group.seeded);
        self.report(outcome)
    }

    /// Replace `old` by `new`.
    ///
    /// Within one group each accumulator deletes the old value and adds the
    /// new one under a single lock; across groups this is a delete from the
    /// old group followed by an add to the new one.
    pub fn update_document(&self, old: &JsonValue, new: &JsonValue) -> CacheResult<()> {
        let (old_key, _) = self.group_key(old)?;
        let (new_key, _) = self.group_key(new)?;
        if old_key != new_key {
            let deleted = self.delete_document(old);
            self.add_document(new)?;
            return deleted;
        }

        let old_values = self.evaluate_inputs(old)?;
        let new_values = self.evaluate_inputs(new)?;
        let outcome = {
            let Some(mut group) = self.groups.get_mut(&old_key) else {
                return self.add_document(new);
            };
            let mut outcome = Ok(());
            for ((accumulator, old_value), new_value) in group
                .accumulators
                .iter_mut()
                .zip(&old_values)
                .zip(&new_values)
            {
                if let Err(e) = accumulator.delete_value(old_value.as_ref()) {
                    if outcome.is_ok() {
                        outcome = Err(e);
                    }
                }
                accumulator.add_value(new_value.as_ref());
            }
            if group.accumulators.iter().any(CachedAccumulator::is_faulty) && outcome.is_ok() {
                outcome = Err(CacheError::AccumulatorIntegrity {
                    accumulator: self.definition.name.clone(),
                    value: old_key.clone(),
                });
            }
            outcome
        };
        self.report(outcome)
    }

    /// Seed state from previously computed rows instead of replaying
    /// documents.
    ///
    /// Each row holds `_id` plus one field per accumulator, keyed by output
    /// name or by content hash. Existing groups are discarded and the view
    /// becomes `Loaded`.
    pub fn initialize(&self, rows: &[JsonValue]) -> CacheResult<()> {
        self.groups.clear();
        for row in rows {
            let key_value = get_path(row, "_id").map_or(JsonValue::Null, canonical_value);
            let key = canonical_key(Some(&key_value));
            let mut group = self.new_group(key_value);
            group.seeded = true;
            for ((accumulator, definition), hash) in group
                .accumulators
                .iter_mut()
                .zip(&self.accumulator_defs)
                .zip(&self.accumulator_hashes)
            {
                let value = row
                    .get(&definition.output)
                    .or_else(|| row.get(hash.to_hex()))
                    .unwrap_or(&JsonValue::Null);
                accumulator.seed(value);
            }
            if self.groups.insert(key.clone(), group).is_some() {
                return Err(CacheError::DuplicateDefinition {
                    kind: "group",
                    name: format!("{}/{}", self.definition.name, key),
                });
            }
        }
        self.set_state(ViewState::Loaded);
        tracing::debug!(view = %self.definition.name, groups = rows.len(), "view seeded from snapshot");
        Ok(())
    }

    /// Discard all groups and replay `docs`, leaving the view `Loaded`.
    ///
    /// Evaluation errors abort the rebuild and leave the view `Stale`.
    pub fn rebuild<'a, I>(&self, docs: I) -> CacheResult<()>
    where
        I: IntoIterator<Item = &'a JsonValue>,
    {
        self.set_state(ViewState::Loading);
        self.groups.clear();
        let mut count = 0usize;
        for doc in docs {
            if let Err(e) = self.add_document(doc) {
                self.set_state(ViewState::Stale);
                return Err(e);
            }
            count += 1;
        }
        if self.state() == ViewState::Loading {
            self.set_state(ViewState::Loaded);
        }
        tracing::debug!(view = %self.definition.name, documents = count, groups = self.groups.len(), "view rebuilt");
        Ok(())
    }

    /// Drop every group; the view reflects an empty collection.
    pub fn clear(&self) {
        self.groups.clear();
    }

    /// Whether any accumulator is faulty.
    pub fn is_faulty(&self) -> bool {
        self.groups
            .iter()
            .any(|group| group.accumulators.iter().any(CachedAccumulator::is_faulty))
    }

    /// Render one row per group, ordered by group key.
    ///
    /// Accumulator fields are keyed by content hash when `use_field_hashes`
    /// is set, otherwise by output name.
    pub fn get_view(&self, use_field_hashes: bool) -> Vec<JsonValue> {
        let mut rows: Vec<(OrderedValue, JsonValue)> = self
            .groups
            .iter()
            .map(|group| {
                let mut row = Map::new();
                row.insert("_id".to_string(), group.key.clone());
                for ((accumulator, definition), hash) in group
                    .accumulators
                    .iter()
                    .zip(&self.accumulator_defs)
                    .zip(&self.accumulator_hashes)
                {
                    let field = if use_field_hashes {
                        hash.to_hex()
                    } else {
                        definition.output.clone()
                    };
                    row.insert(field, accumulator.get_cached_value().to_json());
                }
                (OrderedValue(group.key.clone()), JsonValue::Object(row))
            })
            .collect();
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        rows.into_iter().map(|(_, row)| row).collect()
    }

    /// Current value of one accumulator in one group.
    pub fn get_value(&self, group_key: &JsonValue, output: &str) -> CacheResult<CachedValue> {
        let index = self
            .accumulator_defs
            .iter()
            .position(|d| d.output == output)
            .ok_or_else(|| CacheError::NotFound {
                kind: "accumulator",
                name: format!("{}.{}", self.definition.name, output),
            })?;
        let group = self
            .groups
            .get(&canonical_key(Some(group_key)))
            .ok_or_else(|| CacheError::NotFound {
                kind: "group",
                name: format!("{}/{}", self.definition.name, group_key),
            })?;
        Ok(group.accumulators[index].get_cached_value())
    }

    fn group_key(&self, doc: &JsonValue) -> CacheResult<(String, JsonValue)> {
        let value = self.definition.group_by.evaluate(doc)?;
        let key = canonical_key(value.as_ref());
        let rendered = value.as_ref().map_or(JsonValue::Null, canonical_value);
        Ok((key, rendered))
    }

    /// Evaluate every accumulator input before touching state, so an
    /// evaluation error cannot leave a group half-updated.
    fn evaluate_inputs(&self, doc: &JsonValue) -> CacheResult<Vec<Option<JsonValue>>> {
        self.accumulator_defs
            .iter()
            .map(|d| d.expression.evaluate(doc))
            .collect()
    }

    fn new_group(&self, key: JsonValue) -> Group {
        Group {
            key,
            documents: 0,
            seeded: false,
            accumulators: self
                .accumulator_defs
                .iter()
                .map(|d| CachedAccumulator::new(Arc::clone(d)))
                .collect(),
        }
    }

    fn report(&self, outcome: CacheResult<()>) -> CacheResult<()> {
        if let Err(e) = &outcome {
            if e.is_integrity_warning() {
                self.flag_stale(&e.to_string());
            }
        }
        outcome
    }

    fn flag_stale(&self, reason: &str) {
        if self.state() != ViewState::Stale {
            tracing::warn!(view = %self.definition.name, reason, "view flagged stale");
        }
        self.set_state(ViewState::Stale);
    }
}

/// Registry of live views.
///
/// Handles creation, lookup and removal of views by name.
pub struct ViewManager {
    views: DashMap<String, Arc<MaterializedView>>,
}

impl Default for ViewManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ViewManager {
    /// Create an empty view manager.
    pub fn new() -> Self {
        Self {
            views: DashMap::new(),
        }
    }

    /// Register a new view in the `Loading` state.
    pub fn create_view(&self, definition: ViewDefinition) -> CacheResult<Arc<MaterializedView>> {
        let name = definition.name.clone();
        match self.views.entry(name.clone()) {
            Entry::Occupied(_) => Err(CacheError::DuplicateDefinition { kind: "view", name }),
            Entry::Vacant(slot) => {
                let view = Arc::new(MaterializedView::new(definition)?);
                slot.insert(Arc::clone(&view));
                tracing::debug!(view = %name, namespace = %view.namespace(), "view created");
                Ok(view)
            }
        }
    }

    /// Get a view by name.
    pub fn get_view(&self, name: &str) -> CacheResult<Arc<MaterializedView>> {
        self.views
            .get(name)
            .map(|v| Arc::clone(v.value()))
            .ok_or_else(|| CacheError::NotFound {
                kind: "view",
                name: name.to_string(),
            })
    }

    /// List all views, ordered by name.
    pub fn list_views(&self) -> Vec<ViewInfo> {
        let mut infos: Vec<ViewInfo> = self
            .views
            .iter()
            .map(|entry| ViewInfo::from(entry.value().as_ref()))
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    /// Remove a view.
    pub fn drop_view(&self, name: &str) -> CacheResult<()> {
        self.views.remove(name).ok_or_else(|| CacheError::NotFound {
            kind: "view",
            name: name.to_string(),
        })?;
        tracing::debug!(view = %name, "view dropped");
        Ok(())
    }

    /// Views over one collection, ordered by name.
    pub fn views_for(&self, namespace: &Namespace) -> Vec<Arc<MaterializedView>> {
        let mut views: Vec<Arc<MaterializedView>> = self
            .views
            .iter()
            .filter(|entry| entry.value().namespace() == namespace)
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        views.sort_by(|a, b| a.name().cmp(b.name()));
        views
    }

    /// Every view, ordered by name.
    pub fn all(&self) -> Vec<Arc<MaterializedView>> {
        let mut views: Vec<Arc<MaterializedView>> =
            self.views.iter().map(|e| Arc::clone(e.value())).collect();
        views.sort_by(|a, b| a.name().cmp(b.name()));
        views
    }

    /// Check if a view exists.
    pub fn view_exists(&self, name: &str) -> bool {
        self.views.contains_key(name)
    }

    /// Get the number of views.
    pub fn view_count(&self) -> usize {
        self.views.len()
    }
}
