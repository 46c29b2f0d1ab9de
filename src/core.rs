/// The view cache engine.
///
/// This module ties the pieces together behind one facade:
///
/// - **Query path**: a pipeline is answered from a loaded, eligible view,
///   then from the result cache, or reported as a miss for the host to run
///   against the source database
/// - **Change path**: change events are resolved into view mutations and
///   cache invalidations
/// - **Admin path**: views are created, loaded, rebuilt, listed and dropped
///
/// The engine performs no I/O. Documents for loading views and results for
/// cache misses come from the host.
use crate::accumulator::{Accumulator, AccumulatorDefinition};
use crate::cache::{CacheStats, ResultCache};
use crate::changes::{ChangeEvent, DocumentShadow, Mutation, OperationType};
use crate::config::EngineConfig;
use crate::eligibility::{filter_on_group_key, is_eligible};
use crate::error::{CacheError, CacheResult};
use crate::expression::Expression;
use crate::parser::{parse_filter, parse_pipeline};
use crate::pipeline::{
    GroupStage, Pipeline, Stage, StageDefinition, create_pipeline, execute_stages, matches_all,
};
use crate::views::{MaterializedView, ViewDefinition, ViewInfo, ViewManager, ViewState};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::sync::Arc;

/// Outcome of the query path.
#[derive(Debug, Clone, PartialEq)]
pub enum Answer {
    /// Derived from a maintained view.
    View { view: String, rows: Vec<JsonValue> },
    /// Served from the result cache.
    Cached(Vec<JsonValue>),
    /// Neither applies; run the pipeline against the source.
    Miss,
}

impl Answer {
    /// The rows, unless this is a miss.
    pub fn into_rows(self) -> Option<Vec<JsonValue>> {
        match self {
            Answer::View { rows, .. } | Answer::Cached(rows) => Some(rows),
            Answer::Miss => None,
        }
    }

    /// Whether the source must be consulted.
    pub fn is_miss(&self) -> bool {
        matches!(self, Answer::Miss)
    }
}

/// What one change event did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSummary {
    /// Views the event was applied to cleanly.
    pub views_updated: usize,
    /// Views flagged stale by the event.
    pub views_flagged: usize,
    /// Views emptied by a drop.
    pub views_cleared: usize,
    /// Cache entries removed.
    pub cache_invalidated: usize,
}

/// Engine-wide statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineStats {
    /// Number of registered views.
    pub views: usize,
    /// Views that are not servable because they are stale.
    pub stale_views: usize,
    /// Documents remembered for change resolution.
    pub tracked_documents: usize,
    /// Result cache counters.
    pub cache: CacheStats,
}

/// Query and change processing over materialized views and a result cache.
///
/// Cloning is cheap and clones share all state.
///
/// # Example
///
/// ```ignore
/// use viewcache::prelude::*;
/// use serde_json::json;
///
/// let engine = ViewCache::new(EngineConfig::default());
/// engine.create_view(
///     ViewDefinition::new("by_genre", Namespace::new("db", "movies"), Expression::field("genre"))
///         .with_accumulator(AccumulatorDefinition::sum("total", Expression::field("score"))),
/// )?;
/// engine.load_view("by_genre", &current_documents)?;
///
/// engine.apply_change(&ChangeEvent::insert(
///     Namespace::new("db", "movies"),
///     json!({"_id": 9, "genre": "drama", "score": 4}),
/// ));
///
/// let pipeline = QueryRequest::aggregate(1, "db", "movies", json!([
///     {"$group": {"_id": "$genre", "total": {"$sum": "$score"}}}
/// ])).to_pipeline()?;
/// let rows = engine.answer_or_else(&pipeline, |p| run_against_source(p))?;
/// ```
#[derive(Clone)]
pub struct ViewCache {
    config: EngineConfig,
    views: Arc<ViewManager>,
    cache: Arc<ResultCache<Vec<JsonValue>>>,
    shadow: Arc<DocumentShadow>,
}

impl Default for ViewCache {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl ViewCache {
    /// Create an engine with no views and an empty cache.
    pub fn new(config: EngineConfig) -> Self {
        Self {
            cache: Arc::new(ResultCache::new(config.cache.clone())),
            views: Arc::new(ViewManager::new()),
            shadow: Arc::new(DocumentShadow::new()),
            config,
        }
    }

    /// The engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The view registry.
    pub fn view_manager(&self) -> &Arc<ViewManager> {
        &self.views
    }

    /// The result cache.
    pub fn cache(&self) -> &Arc<ResultCache<Vec<JsonValue>>> {
        &self.cache
    }

    /// Engine statistics.
    pub fn stats(&self) -> EngineStats {
        let views = self.views.all();
        EngineStats {
            views: views.len(),
            stale_views: views
                .iter()
                .filter(|v| v.state() == ViewState::Stale)
                .count(),
            tracked_documents: self.shadow.len(),
            cache: self.cache.stats(),
        }
    }

    // ========================================================================
    // Admin path
    // ========================================================================

    /// Register a view. It serves queries once loaded or initialized.
    pub fn create_view(&self, definition: ViewDefinition) -> CacheResult<ViewInfo> {
        let view = self.views.create_view(definition)?;
        Ok(ViewInfo::from(view.as_ref()))
    }

    /// Bootstrap a view by replaying the collection's current documents.
    pub fn load_view(&self, name: &str, docs: &[JsonValue]) -> CacheResult<ViewInfo> {
        self.replay(name, docs)
    }

    /// Seed a view from previously computed `{_id, field: value}` rows.
    ///
    /// Documents are not replayed, so later updates and deletes need
    /// pre-images (or must have been seen as inserts) to resolve.
    pub fn initialize_view(&self, name: &str, rows: &[JsonValue]) -> CacheResult<ViewInfo> {
        let view = self.views.get_view(name)?;
        view.initialize(rows)?;
        self.cache
            .invalidate_collection(&view.namespace().collection, &view.namespace().db);
        Ok(ViewInfo::from(view.as_ref()))
    }

    /// Discard a view's state and replay the collection's current documents.
    /// This is how a stale view is recovered.
    pub fn rebuild_view(&self, name: &str, docs: &[JsonValue]) -> CacheResult<ViewInfo> {
        self.replay(name, docs)
    }

    fn replay(&self, name: &str, docs: &[JsonValue]) -> CacheResult<ViewInfo> {
        let view = self.views.get_view(name)?;
        view.rebuild(docs)?;
        if self.config.track_documents {
            self.shadow.clear_namespace(view.namespace());
            self.shadow.seed(view.namespace(), docs);
        }
        tracing::debug!(view = %name, documents = docs.len(), state = %view.state(), "view loaded");
        Ok(ViewInfo::from(view.as_ref()))
    }

    /// Remove a view. Document tracking for its collection stops once no
    /// view reads it.
    pub fn drop_view(&self, name: &str) -> CacheResult<()> {
        let view = self.views.get_view(name)?;
        self.views.drop_view(name)?;
        if self.views.views_for(view.namespace()).is_empty() {
            self.shadow.clear_namespace(view.namespace());
        }
        Ok(())
    }

    /// List all views.
    pub fn list_views(&self) -> Vec<ViewInfo> {
        self.views.list_views()
    }

    /// Render a view's rows, keyed as configured by `use_field_hashes`.
    pub fn view_rows(&self, name: &str) -> CacheResult<Vec<JsonValue>> {
        Ok(self.views.get_view(name)?.get_view(self.config.use_field_hashes))
    }

    // ========================================================================
    // Query path
    // ========================================================================

    /// Answer from a view or the cache, or report a miss.
    ///
    /// Only `Loaded` views are considered. Evaluation errors while deriving
    /// an answer from a view are returned; they indicate a malformed query.
    pub fn answer(&self, pipeline: &Pipeline) -> CacheResult<Answer> {
        if let Some((group_index, group)) = pipeline.first_group() {
            for view in self.views.views_for(pipeline.namespace()) {
                if view.is_servable() && is_eligible(pipeline, &view) {
                    let rows = answer_from_view(pipeline, group_index, group, &view)?;
                    tracing::debug!(view = %view.name(), rows = rows.len(), "answered from view");
                    return Ok(Answer::View {
                        view: view.name().to_string(),
                        rows,
                    });
                }
            }
        }

        let ns = pipeline.namespace();
        let query = pipeline.to_query_value()?;
        match self.cache.get(&query, &ns.collection, &ns.db) {
            Some(rows) => {
                tracing::debug!(namespace = %ns, rows = rows.len(), "answered from cache");
                Ok(Answer::Cached(rows))
            }
            None => Ok(Answer::Miss),
        }
    }

    /// Cache the source's result for `pipeline`. Returns whether it was stored.
    pub fn store(&self, pipeline: &Pipeline, rows: Vec<JsonValue>) -> CacheResult<bool> {
        let ns = pipeline.namespace();
        self.cache
            .set(&pipeline.to_query_value()?, &ns.collection, &ns.db, rows)
    }

    /// Answer, falling back to `source` on a miss and caching its result.
    pub fn answer_or_else<F>(&self, pipeline: &Pipeline, source: F) -> CacheResult<Vec<JsonValue>>
    where
        F: FnOnce(&Pipeline) -> CacheResult<Vec<JsonValue>>,
    {
        if let Some(rows) = self.answer(pipeline)?.into_rows() {
            return Ok(rows);
        }
        let rows = source(pipeline)?;
        self.store(pipeline, rows.clone())?;
        Ok(rows)
    }

    /// Serve one client request.
    pub fn handle<F>(&self, request: &QueryRequest, source: F) -> CacheResult<QueryResponse>
    where
        F: FnOnce(&Pipeline) -> CacheResult<Vec<JsonValue>>,
    {
        let pipeline = request.to_pipeline()?;
        let documents = self.answer_or_else(&pipeline, source)?;
        Ok(QueryResponse {
            response_to: request.request_id,
            documents,
        })
    }

    // ========================================================================
    // Change path
    // ========================================================================

    /// Apply one change event to the views and the cache.
    ///
    /// Never fails: problems with individual views are logged and the views
    /// flagged stale so they stop serving until rebuilt.
    pub fn apply_change(&self, event: &ChangeEvent) -> ChangeSummary {
        let ns = &event.ns;
        let mut summary = ChangeSummary::default();
        match event.operation_type {
            OperationType::Drop => {
                for view in self.views.views_for(ns) {
                    view.clear();
                    summary.views_cleared += 1;
                }
                self.shadow.clear_namespace(ns);
                summary.cache_invalidated = self.cache.invalidate_collection(&ns.collection, &ns.db);
            }
            OperationType::DropDatabase => {
                for view in self.views.all() {
                    if view.namespace().db == ns.db {
                        view.clear();
                        summary.views_cleared += 1;
                    }
                }
                self.shadow.clear_database(&ns.db);
                summary.cache_invalidated = self.cache.invalidate_database(&ns.db);
            }
            OperationType::Invalidate => {
                for view in self.views.all() {
                    view.set_state(ViewState::Stale);
                    summary.views_flagged += 1;
                }
                self.shadow.clear();
                summary.cache_invalidated = self.cache.invalidate_all();
                tracing::warn!(views = summary.views_flagged, "change stream invalidated");
            }
            _ => {
                summary.cache_invalidated = self.cache.invalidate_collection(&ns.collection, &ns.db);
                let views = self.views.views_for(ns);
                if views.is_empty() {
                    return summary;
                }
                let (updated, flagged) = if self.config.track_documents {
                    self.shadow
                        .process(event, |mutation| apply_mutation(&views, mutation))
                } else {
                    apply_mutation(&views, &Mutation::resolve(event, None).0)
                };
                summary.views_updated = updated;
                summary.views_flagged = flagged;
            }
        }
        tracing::trace!(
            operation = ?event.operation_type,
            namespace = %ns,
            updated = summary.views_updated,
            flagged = summary.views_flagged,
            "change applied"
        );
        summary
    }
}

/// Apply a resolved mutation to every view; returns (updated, flagged).
fn apply_mutation(views: &[Arc<MaterializedView>], mutation: &Mutation) -> (usize, usize) {
    if let Mutation::Unresolvable(reason) = mutation {
        for view in views {
            view.set_state(ViewState::Stale);
        }
        tracing::warn!(views = views.len(), reason = %reason, "unresolvable change event");
        return (0, views.len());
    }

    let mut updated = 0;
    let mut flagged = 0;
    for view in views {
        match mutation.apply_to(view) {
            Ok(()) => updated += 1,
            // The view has already flagged itself.
            Err(e) if e.is_integrity_warning() => flagged += 1,
            Err(e) => {
                view.set_state(ViewState::Stale);
                tracing::warn!(view = %view.name(), error = %e, "change could not be applied");
                flagged += 1;
            }
        }
    }
    (updated, flagged)
}

/// Run a pipeline against a view's maintained state.
///
/// Pre-group filters select groups by `_id`, maintained values are renamed
/// to the query's output names, and stages after the group run as usual.
fn answer_from_view(
    pipeline: &Pipeline,
    group_index: usize,
    group: &GroupStage,
    view: &MaterializedView,
) -> CacheResult<Vec<JsonValue>> {
    let group_hash = view.group_hash();
    let filters: Vec<Expression> = pipeline.stages()[..group_index]
        .iter()
        .filter_map(|stage| match stage {
            Stage::Match(m) => Some(m.filters()),
            _ => None,
        })
        .flatten()
        .map(|f| filter_on_group_key(f, &group_hash))
        .collect();

    let outputs: Vec<(String, String)> = group
        .accumulators()
        .iter()
        .map(|a| (a.hash().to_hex(), a.definition().output.clone()))
        .collect();

    let mut rows = Vec::new();
    for row in view.get_view(true) {
        if !matches_all(&filters, &row)? {
            continue;
        }
        let mut renamed = Map::new();
        renamed.insert(
            "_id".to_string(),
            row.get("_id").cloned().unwrap_or(JsonValue::Null),
        );
        for (hash, output) in &outputs {
            renamed.insert(
                output.clone(),
                row.get(hash).cloned().unwrap_or(JsonValue::Null),
            );
        }
        rows.push(JsonValue::Object(renamed));
    }

    execute_stages(&pipeline.stages()[group_index + 1..], rows)
}

/// Shape of a client request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "camelCase")]
pub enum QueryCommand {
    /// `find(filter).limit(n)`
    Find {
        #[serde(default)]
        filter: JsonValue,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit: Option<JsonValue>,
    },
    /// `aggregate(pipeline)`
    Aggregate { pipeline: JsonValue },
    /// `count(filter)`
    Count {
        #[serde(default)]
        filter: JsonValue,
    },
}

/// A decoded client request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRequest {
    /// Correlation id echoed in the response.
    pub request_id: i64,
    pub db: String,
    pub collection: String,
    #[serde(flatten)]
    pub command: QueryCommand,
}

impl QueryRequest {
    fn new(request_id: i64, db: impl Into<String>, collection: impl Into<String>, command: QueryCommand) -> Self {
        Self {
            request_id,
            db: db.into(),
            collection: collection.into(),
            command,
        }
    }

    /// A `find` request.
    pub fn find(request_id: i64, db: impl Into<String>, collection: impl Into<String>, filter: JsonValue) -> Self {
        Self::new(
            request_id,
            db,
            collection,
            QueryCommand::Find {
                filter,
                limit: None,
            },
        )
    }

    /// An `aggregate` request.
    pub fn aggregate(request_id: i64, db: impl Into<String>, collection: impl Into<String>, pipeline: JsonValue) -> Self {
        Self::new(request_id, db, collection, QueryCommand::Aggregate { pipeline })
    }

    /// A `count` request.
    pub fn count(request_id: i64, db: impl Into<String>, collection: impl Into<String>, filter: JsonValue) -> Self {
        Self::new(request_id, db, collection, QueryCommand::Count { filter })
    }

    /// Limit a `find` request. No effect on other commands.
    pub fn with_limit(mut self, n: u64) -> Self {
        if let QueryCommand::Find { limit, .. } = &mut self.command {
            *limit = Some(JsonValue::from(n));
        }
        self
    }

    /// Translate into a pipeline.
    ///
    /// `find` becomes match (+ limit); `count` becomes match + a group on
    /// `null` counting documents into `n`.
    pub fn to_pipeline(&self) -> CacheResult<Pipeline> {
        let stages = match &self.command {
            QueryCommand::Find { filter, limit } => {
                let mut stages = vec![StageDefinition::filter(filters_of(filter)?)];
                if let Some(limit) = limit {
                    stages.push(StageDefinition::limit(limit.clone()));
                }
                stages
            }
            QueryCommand::Aggregate { pipeline } => parse_pipeline(pipeline)?,
            QueryCommand::Count { filter } => vec![
                StageDefinition::filter(filters_of(filter)?),
                StageDefinition::group(
                    Expression::literal(JsonValue::Null),
                    vec![AccumulatorDefinition::count("n", Expression::literal(1))],
                ),
            ],
        };
        create_pipeline(self.db.clone(), self.collection.clone(), stages)
    }
}

fn filters_of(filter: &JsonValue) -> CacheResult<Vec<Expression>> {
    if filter.is_null() {
        return Ok(Vec::new());
    }
    parse_filter(filter).map_err(|e| match e {
        CacheError::InvalidStageArgument { reason, .. } => CacheError::invalid_stage("filter", reason),
        other => other,
    })
}

/// Result documents for one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResponse {
    /// The request id this answers.
    pub response_to: i64,
    pub documents: Vec<JsonValue>,
}
