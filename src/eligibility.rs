/// Decides whether a pipeline can be answered from a materialized view.
///
/// The check is conservative: anything it cannot prove resolves to "not
/// eligible", and the caller falls back to the cache or the source.
use crate::expression::Expression;
use crate::pipeline::{Pipeline, Stage};
use crate::types::ContentHash;
use crate::views::MaterializedView;
use serde_json::Value as JsonValue;

/// Whether `pipeline` can be answered from `view`'s maintained state.
///
/// Stages are scanned up to and including the first group stage:
///
/// - an empty pipeline, or one without a group stage, is not eligible
/// - the pipeline and view must read the same collection
/// - only match stages may precede the group stage, and every one of their
///   filters must depend on nothing but the view's group expression
/// - the group stage must group by the view's group expression and request
///   only accumulators the view maintains
///
/// Stages after the group stage run over the grouped rows and do not affect
/// eligibility.
pub fn is_eligible(pipeline: &Pipeline, view: &MaterializedView) -> bool {
    if pipeline.is_empty() || pipeline.namespace() != view.namespace() {
        return false;
    }
    let Some((group_index, group)) = pipeline.first_group() else {
        return false;
    };

    let group_hash = view.group_hash();
    for stage in &pipeline.stages()[..group_index] {
        let Stage::Match(filter) = stage else {
            return false;
        };
        if !filter
            .filters()
            .iter()
            .all(|f| depends_only_on(f, &group_hash))
        {
            return false;
        }
    }

    if group.group_by().hash() != group_hash {
        return false;
    }
    let maintained = view.get_accumulator_hashes();
    group
        .accumulator_hashes()
        .iter()
        .all(|hash| maintained.contains(hash))
}

/// Whether `filter` references no field outside occurrences of the
/// expression hashed as `group_hash`.
fn depends_only_on(filter: &Expression, group_hash: &ContentHash) -> bool {
    filter
        .replace_by_hash(group_hash, &Expression::literal(JsonValue::Null))
        .field_paths()
        .is_empty()
}

/// Rewrite a pre-group filter to run against a view row, where the group
/// value lives in `_id`.
pub(crate) fn filter_on_group_key(filter: &Expression, group_hash: &ContentHash) -> Expression {
    filter.replace_by_hash(group_hash, &Expression::field("_id"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accumulator::AccumulatorDefinition;
    use crate::expression::Operator;
    use crate::pipeline::{StageDefinition, create_pipeline};
    use crate::types::Namespace;
    use crate::views::ViewDefinition;

    fn view_on(field: &str) -> MaterializedView {
        MaterializedView::new(
            ViewDefinition::new("v", Namespace::new("db", "people"), Expression::field(field))
                .with_accumulator(AccumulatorDefinition::sum("total", Expression::field("age")))
                .with_accumulator(AccumulatorDefinition::count("n", Expression::literal(1))),
        )
        .unwrap()
    }

    fn group_on(field: &str, accumulators: Vec<AccumulatorDefinition>) -> StageDefinition {
        StageDefinition::group(Expression::field(field), accumulators)
    }

    fn eq(field: &str, value: &str) -> Expression {
        Expression::op(
            Operator::Eq,
            vec![Expression::field(field), Expression::literal(value)],
        )
    }

    #[test]
    fn test_empty_pipeline_is_not_eligible() {
        let pipeline = create_pipeline("db", "people", vec![]).unwrap();
        assert!(!is_eligible(&pipeline, &view_on("name")));
    }

    #[test]
    fn test_exact_accumulators_are_eligible() {
        let pipeline = create_pipeline(
            "db",
            "people",
            vec![group_on(
                "name",
                vec![AccumulatorDefinition::sum("whatever", Expression::field("age"))],
            )],
        )
        .unwrap();
        assert!(is_eligible(&pipeline, &view_on("name")));
    }

    #[test]
    fn test_different_group_or_accumulator_is_not_eligible() {
        let by_age = create_pipeline(
            "db",
            "people",
            vec![group_on(
                "age",
                vec![AccumulatorDefinition::sum("total", Expression::field("age"))],
            )],
        )
        .unwrap();
        assert!(!is_eligible(&by_age, &view_on("name")));

        let other_acc = create_pipeline(
            "db",
            "people",
            vec![group_on(
                "name",
                vec![AccumulatorDefinition::max("total", Expression::field("age"))],
            )],
        )
        .unwrap();
        assert!(!is_eligible(&other_acc, &view_on("name")));

        let other_collection = create_pipeline(
            "db",
            "pets",
            vec![group_on("name", vec![])],
        )
        .unwrap();
        assert!(!is_eligible(&other_collection, &view_on("name")));
    }

    #[test]
    fn test_every_filter_must_constrain_only_the_group_key() {
        let acc = || vec![AccumulatorDefinition::count("n", Expression::literal(1))];
        let on_key = create_pipeline(
            "db",
            "people",
            vec![
                StageDefinition::filter(vec![eq("name", "ada")]),
                group_on("name", acc()),
            ],
        )
        .unwrap();
        assert!(is_eligible(&on_key, &view_on("name")));

        // The second condition touches a non-key field.
        let mixed = create_pipeline(
            "db",
            "people",
            vec![
                StageDefinition::filter(vec![eq("name", "ada"), eq("city", "paris")]),
                group_on("name", acc()),
            ],
        )
        .unwrap();
        assert!(!is_eligible(&mixed, &view_on("name")));

        let limit_first = create_pipeline(
            "db",
            "people",
            vec![StageDefinition::limit(1), group_on("name", acc())],
        )
        .unwrap();
        assert!(!is_eligible(&limit_first, &view_on("name")));
    }

    #[test]
    fn test_stages_after_group_are_ignored() {
        let pipeline = create_pipeline(
            "db",
            "people",
            vec![
                group_on("name", vec![]),
                StageDefinition::limit(3),
                StageDefinition::filter(vec![eq("anything", "x")]),
            ],
        )
        .unwrap();
        assert!(is_eligible(&pipeline, &view_on("name")));
    }

    #[test]
    fn test_filter_rewrite_targets_id() {
        let view = view_on("name");
        let rewritten = filter_on_group_key(&eq("name", "ada"), &view.group_hash());
        assert_eq!(rewritten, eq("_id", "ada"));
    }
}
