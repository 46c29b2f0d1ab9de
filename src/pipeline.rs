/// Pipeline engine for uncached aggregation.
///
/// A pipeline is an ordered list of pure stages over one collection:
///
/// - **Match**: keep documents for which every filter is truthy
/// - **Group**: partition by a key expression and reduce each partition
/// - **Limit**: keep the first `n` documents
///
/// Stage *i*'s output is stage *i+1*'s input. Stages know nothing about
/// materialized views; the [`eligibility`](crate::eligibility) module decides
/// when a view can stand in for the first part of a pipeline.
///
/// # Example
///
/// ```ignore
/// use viewcache::pipeline::{StageDefinition, create_pipeline, execute_pipeline};
///
/// let pipeline = create_pipeline("db", "movies", vec![
///     StageDefinition::group(Expression::field("genre"), vec![
///         AccumulatorDefinition::sum("total", Expression::field("score")),
///     ]),
///     StageDefinition::limit(10),
/// ])?;
/// let rows = execute_pipeline(&pipeline, docs)?;
/// ```
use crate::accumulator::{Accumulator, AccumulatorDefinition, BasicAccumulator};
use crate::error::{CacheError, CacheResult};
use crate::expression::{Expression, resolve_fields_by_hash};
use crate::types::{ContentHash, Namespace, canonical_key, canonical_value, is_truthy, total_cmp};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::collections::HashMap;
use std::fmt;

/// Declarative description of one stage, as produced by a query parser.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StageDefinition {
    /// Keep documents matching every filter.
    Match {
        filters: Vec<Expression>,
        /// Narrow filters onto hash-named fields present in the batch.
        #[serde(default)]
        resolve_field_hashes: bool,
    },
    /// Group by `group_by` and reduce each group.
    Group {
        group_by: Expression,
        accumulators: Vec<AccumulatorDefinition>,
    },
    /// Keep the first `limit` documents. Validated when the pipeline is built.
    Limit { limit: JsonValue },
}

impl StageDefinition {
    /// A match stage over the given filters.
    pub fn filter(filters: Vec<Expression>) -> Self {
        Self::Match {
            filters,
            resolve_field_hashes: false,
        }
    }

    /// A group stage.
    pub fn group(group_by: Expression, accumulators: Vec<AccumulatorDefinition>) -> Self {
        Self::Group {
            group_by,
            accumulators,
        }
    }

    /// A limit stage.
    pub fn limit(limit: impl Into<JsonValue>) -> Self {
        Self::Limit {
            limit: limit.into(),
        }
    }
}

/// Stage tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    Match,
    Group,
    Limit,
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StageKind::Match => "match",
            StageKind::Group => "group",
            StageKind::Limit => "limit",
        })
    }
}

/// Filters documents.
#[derive(Debug, Clone)]
pub struct MatchStage {
    filters: Vec<Expression>,
    resolve_field_hashes: bool,
}

impl MatchStage {
    /// Create a match stage. No filters keeps every document.
    pub fn new(filters: Vec<Expression>) -> Self {
        Self {
            filters,
            resolve_field_hashes: false,
        }
    }

    /// Enable narrowing of filters via [`resolve_fields_by_hash`].
    pub fn with_field_hash_resolution(mut self) -> Self {
        self.resolve_field_hashes = true;
        self
    }

    /// The filter expressions.
    pub fn filters(&self) -> &[Expression] {
        &self.filters
    }

    /// Keep documents for which every filter is truthy.
    pub fn execute(&self, docs: Vec<JsonValue>) -> CacheResult<Vec<JsonValue>> {
        if self.filters.is_empty() {
            return Ok(docs);
        }
        let resolved;
        let filters = if self.resolve_field_hashes {
            resolved = resolve_fields_by_hash(&self.filters, &docs);
            &resolved
        } else {
            &self.filters
        };

        let mut kept = Vec::with_capacity(docs.len());
        for doc in docs {
            if matches_all(filters, &doc)? {
                kept.push(doc);
            }
        }
        Ok(kept)
    }
}

/// Whether every filter evaluates truthily against `doc`.
pub(crate) fn matches_all(filters: &[Expression], doc: &JsonValue) -> CacheResult<bool> {
    for filter in filters {
        if !is_truthy(filter.evaluate(doc)?.as_ref()) {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Groups documents and reduces each group with basic accumulators.
#[derive(Debug, Clone)]
pub struct GroupStage {
    group_by: Expression,
    accumulators: Vec<BasicAccumulator>,
}

impl GroupStage {
    /// Create a group stage.
    pub fn new(group_by: Expression, accumulators: Vec<AccumulatorDefinition>) -> Self {
        Self {
            group_by,
            accumulators: accumulators.into_iter().map(BasicAccumulator::new).collect(),
        }
    }

    /// The group key expression.
    pub fn group_by(&self) -> &Expression {
        &self.group_by
    }

    /// The requested accumulators, in output order.
    pub fn accumulators(&self) -> &[BasicAccumulator] {
        &self.accumulators
    }

    /// Content hashes of the requested accumulators.
    pub fn accumulator_hashes(&self) -> Vec<ContentHash> {
        self.accumulators.iter().map(|a| a.hash()).collect()
    }

    /// One row per distinct group value, ordered by group value.
    ///
    /// Group values are compared by canonical JSON, so `1` and `1.0` share a
    /// group (rendered as `1`) while `1` and `"1"` do not. A missing key
    /// groups with `null`. Rows come out in the same order a materialized
    /// view renders them.
    pub fn execute(&self, docs: Vec<JsonValue>) -> CacheResult<Vec<JsonValue>> {
        let mut index: HashMap<String, usize> = HashMap::new();
        let mut groups: Vec<(JsonValue, Vec<&JsonValue>)> = Vec::new();
        for doc in &docs {
            let value = self.group_by.evaluate(doc)?;
            let key = canonical_key(value.as_ref());
            let slot = *index.entry(key).or_insert_with(|| {
                groups.push((value.as_ref().map_or(JsonValue::Null, canonical_value), Vec::new()));
                groups.len() - 1
            });
            groups[slot].1.push(doc);
        }
        groups.sort_by(|a, b| total_cmp(&a.0, &b.0));

        groups
            .into_iter()
            .map(|(key, members)| {
                let mut row = Map::new();
                row.insert("_id".to_string(), key);
                for accumulator in &self.accumulators {
                    let value = accumulator.evaluate(&members)?;
                    row.insert(
                        accumulator.definition().output.clone(),
                        value.unwrap_or(JsonValue::Null),
                    );
                }
                Ok(JsonValue::Object(row))
            })
            .collect()
    }
}

/// Truncates the batch.
#[derive(Debug, Clone, Copy)]
pub struct LimitStage {
    limit: usize,
}

impl LimitStage {
    /// Validate `limit`: it must be a non-negative integer.
    pub fn new(limit: &JsonValue) -> CacheResult<Self> {
        let limit = limit
            .as_u64()
            .or_else(|| {
                limit
                    .as_f64()
                    .filter(|f| *f >= 0.0 && f.fract() == 0.0 && *f <= u64::MAX as f64)
                    .map(|f| f as u64)
            })
            .ok_or_else(|| {
                CacheError::invalid_stage(
                    "limit",
                    format!("expected a non-negative integer, got {limit}"),
                )
            })?;
        Ok(Self {
            limit: usize::try_from(limit).unwrap_or(usize::MAX),
        })
    }

    /// The validated limit.
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Keep the first `limit` documents.
    pub fn execute(&self, mut docs: Vec<JsonValue>) -> Vec<JsonValue> {
        docs.truncate(self.limit);
        docs
    }
}

/// An executable stage.
#[derive(Debug, Clone)]
pub enum Stage {
    Match(MatchStage),
    Group(GroupStage),
    Limit(LimitStage),
}

impl Stage {
    /// Build a stage from its definition.
    pub fn from_definition(definition: &StageDefinition) -> CacheResult<Self> {
        Ok(match definition {
            StageDefinition::Match {
                filters,
                resolve_field_hashes,
            } => {
                let stage = MatchStage::new(filters.clone());
                Stage::Match(if *resolve_field_hashes {
                    stage.with_field_hash_resolution()
                } else {
                    stage
                })
            }
            StageDefinition::Group {
                group_by,
                accumulators,
            } => Stage::Group(GroupStage::new(group_by.clone(), accumulators.clone())),
            StageDefinition::Limit { limit } => Stage::Limit(LimitStage::new(limit)?),
        })
    }

    /// The stage tag.
    pub fn kind(&self) -> StageKind {
        match self {
            Stage::Match(_) => StageKind::Match,
            Stage::Group(_) => StageKind::Group,
            Stage::Limit(_) => StageKind::Limit,
        }
    }

    /// Run the stage over a batch.
    pub fn execute(&self, docs: Vec<JsonValue>) -> CacheResult<Vec<JsonValue>> {
        match self {
            Stage::Match(stage) => stage.execute(docs),
            Stage::Group(stage) => stage.execute(docs),
            Stage::Limit(stage) => Ok(stage.execute(docs)),
        }
    }
}

/// A validated pipeline over one collection.
#[derive(Debug, Clone)]
pub struct Pipeline {
    namespace: Namespace,
    definitions: Vec<StageDefinition>,
    stages: Vec<Stage>,
}

impl Pipeline {
    /// Source collection.
    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// Stages in execution order.
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// The definitions the pipeline was built from.
    pub fn definitions(&self) -> &[StageDefinition] {
        &self.definitions
    }

    /// Index and stage of the first group stage, if any.
    pub fn first_group(&self) -> Option<(usize, &GroupStage)> {
        self.stages.iter().enumerate().find_map(|(i, stage)| match stage {
            Stage::Group(group) => Some((i, group)),
            _ => None,
        })
    }

    /// Whether the pipeline has no stages.
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Deterministic JSON form of the stage list, used as the cache query.
    pub fn to_query_value(&self) -> CacheResult<JsonValue> {
        Ok(serde_json::to_value(&self.definitions)?)
    }
}

/// Build a pipeline, validating every stage.
pub fn create_pipeline(
    db: impl Into<String>,
    collection: impl Into<String>,
    definitions: Vec<StageDefinition>,
) -> CacheResult<Pipeline> {
    let stages = definitions
        .iter()
        .map(Stage::from_definition)
        .collect::<CacheResult<Vec<_>>>()?;
    Ok(Pipeline {
        namespace: Namespace::new(db, collection),
        definitions,
        stages,
    })
}

/// Run `docs` through every stage in order.
pub fn execute_pipeline(pipeline: &Pipeline, docs: Vec<JsonValue>) -> CacheResult<Vec<JsonValue>> {
    execute_stages(&pipeline.stages, docs)
}

/// Run `docs` through a slice of stages.
pub(crate) fn execute_stages(stages: &[Stage], docs: Vec<JsonValue>) -> CacheResult<Vec<JsonValue>> {
    stages
        .iter()
        .try_fold(docs, |batch, stage| stage.execute(batch))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::Operator;
    use serde_json::json;

    fn movies() -> Vec<JsonValue> {
        vec![
            json!({"genre": "action", "score": 10}),
            json!({"genre": "action", "score": 20}),
            json!({"genre": "action", "score": 30}),
            json!({"genre": "marvel", "score": -100}),
        ]
    }

    #[test]
    fn test_group_stage() {
        let plus_ten = Expression::op(
            Operator::Add,
            vec![Expression::field("score"), Expression::literal(10)],
        );
        let pipeline = create_pipeline(
            "db",
            "movies",
            vec![StageDefinition::group(
                Expression::field("genre"),
                vec![
                    AccumulatorDefinition::sum("sum", Expression::field("score")),
                    AccumulatorDefinition::sum("sumPlus10", plus_ten),
                ],
            )],
        )
        .unwrap();

        let rows = execute_pipeline(&pipeline, movies()).unwrap();
        assert_eq!(
            rows,
            vec![
                json!({"_id": "action", "sum": 60, "sumPlus10": 90}),
                json!({"_id": "marvel", "sum": -100, "sumPlus10": -90}),
            ]
        );
    }

    #[test]
    fn test_group_keys_do_not_collide_across_types() {
        let stage = GroupStage::new(
            Expression::field("k"),
            vec![AccumulatorDefinition::count("n", Expression::literal(1))],
        );
        let rows = stage
            .execute(vec![
                json!({"k": 1.0}),
                json!({"k": "1"}),
                json!({"k": 1}),
                json!({}),
                json!({"k": null}),
            ])
            .unwrap();
        // 1.0 was seen first but renders canonically as 1.
        assert_eq!(
            rows,
            vec![
                json!({"_id": null, "n": 2}),
                json!({"_id": 1, "n": 2}),
                json!({"_id": "1", "n": 1}),
            ]
        );
    }

    #[test]
    fn test_group_rows_are_ordered_by_key() {
        let pipeline = create_pipeline(
            "db",
            "letters",
            vec![
                StageDefinition::group(
                    Expression::field("g"),
                    vec![AccumulatorDefinition::count("n", Expression::literal(1))],
                ),
                StageDefinition::limit(1),
            ],
        )
        .unwrap();
        let rows = execute_pipeline(&pipeline, vec![json!({"g": "z"}), json!({"g": "a"})]).unwrap();
        assert_eq!(rows, vec![json!({"_id": "a", "n": 1})]);
    }

    #[test]
    fn test_match_requires_every_filter() {
        let stage = MatchStage::new(vec![
            Expression::op(
                Operator::Eq,
                vec![Expression::field("genre"), Expression::literal("action")],
            ),
            Expression::op(
                Operator::Gt,
                vec![Expression::field("score"), Expression::literal(15)],
            ),
        ]);
        let kept = stage.execute(movies()).unwrap();
        assert_eq!(kept.len(), 2);
        assert!(MatchStage::new(vec![]).execute(movies()).unwrap().len() == 4);
    }

    #[test]
    fn test_match_with_field_hash_resolution() {
        let sum_expr = Expression::op(
            Operator::Add,
            vec![Expression::field("score"), Expression::literal(10)],
        );
        let hash = sum_expr.hash().to_hex();
        let filter = Expression::op(Operator::Gt, vec![sum_expr, Expression::literal(50)]);
        let docs = vec![json!({hash.clone(): 90}), json!({hash.clone(): 20})];

        let plain = MatchStage::new(vec![filter.clone()]);
        assert!(plain.execute(docs.clone()).unwrap().is_empty());

        let resolved = MatchStage::new(vec![filter]).with_field_hash_resolution();
        assert_eq!(resolved.execute(docs).unwrap(), vec![json!({hash: 90})]);
    }

    #[test]
    fn test_limit_validation() {
        assert_eq!(LimitStage::new(&json!(2)).unwrap().limit(), 2);
        assert_eq!(LimitStage::new(&json!(3.0)).unwrap().limit(), 3);
        assert_eq!(LimitStage::new(&json!(0)).unwrap().limit(), 0);
        for bad in [json!(-1), json!(1.5), json!("3"), json!(null)] {
            assert!(matches!(
                LimitStage::new(&bad),
                Err(CacheError::InvalidStageArgument { .. })
            ));
        }
        let err = create_pipeline("db", "c", vec![StageDefinition::limit(-2)]).unwrap_err();
        assert!(matches!(err, CacheError::InvalidStageArgument { .. }));
    }

    #[test]
    fn test_stages_chain_in_order() {
        let pipeline = create_pipeline(
            "db",
            "movies",
            vec![
                StageDefinition::filter(vec![Expression::op(
                    Operator::Gte,
                    vec![Expression::field("score"), Expression::literal(0)],
                )]),
                StageDefinition::limit(2),
            ],
        )
        .unwrap();
        let out = execute_pipeline(&pipeline, movies()).unwrap();
        assert_eq!(out, movies()[..2].to_vec());
        assert_eq!(pipeline.stages()[1].kind(), StageKind::Limit);
        assert!(pipeline.first_group().is_none());
    }

    #[test]
    fn test_evaluation_errors_propagate() {
        let pipeline = create_pipeline(
            "db",
            "movies",
            vec![StageDefinition::filter(vec![Expression::op(
                Operator::Not,
                vec![],
            )])],
        )
        .unwrap();
        assert!(matches!(
            execute_pipeline(&pipeline, movies()),
            Err(CacheError::InvalidExpression { .. })
        ));
    }

    #[test]
    fn test_query_value_is_deterministic() {
        let build = || {
            create_pipeline(
                "db",
                "movies",
                vec![StageDefinition::group(
                    Expression::field("genre"),
                    vec![AccumulatorDefinition::max("top", Expression::field("score"))],
                )],
            )
            .unwrap()
        };
        assert_eq!(
            build().to_query_value().unwrap(),
            build().to_query_value().unwrap()
        );
    }
}
