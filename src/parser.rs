/// Decoder for the JSON aggregation syntax spoken by database clients.
///
/// Expressions:
///
/// - `"$a.b"` is a field reference, any other scalar is a literal
/// - `{"$literal": v}` is the literal `v`, even if `v` starts with `$`
/// - `{"$op": [operands]}` or `{"$op": operand}` is an operator node
/// - `{"$cond": {"if": c, "then": t, "else": e}}` is the object form of `$cond`
///
/// Stages are `$match`, `$group` and `$limit`.
///
/// # Example
///
/// ```ignore
/// use viewcache::parser::parse_pipeline;
/// use serde_json::json;
///
/// let stages = parse_pipeline(&json!([
///     {"$match": {"genre": "action"}},
///     {"$group": {"_id": "$genre", "total": {"$sum": "$score"}}},
///     {"$limit": 5},
/// ]))?;
/// ```
use crate::accumulator::{AccumulatorDefinition, AccumulatorKind};
use crate::error::{CacheError, CacheResult};
use crate::expression::{Expression, Operator};
use crate::pipeline::StageDefinition;
use serde_json::{Map, Value as JsonValue};

/// Decode one expression.
pub fn parse_expression(value: &JsonValue) -> CacheResult<Expression> {
    match value {
        JsonValue::String(s) => match s.strip_prefix('$') {
            Some("") => Err(CacheError::invalid_expression("empty field path")),
            Some(path) => Ok(Expression::field(path)),
            None => Ok(Expression::literal(value.clone())),
        },
        JsonValue::Object(map) => parse_operator(map),
        JsonValue::Array(items) => {
            // Arrays are literal only when every element is.
            let parsed = items
                .iter()
                .map(parse_expression)
                .collect::<CacheResult<Vec<_>>>()?;
            let literals = parsed
                .into_iter()
                .map(|e| match e {
                    Expression::Literal(v) => Ok(v),
                    _ => Err(CacheError::invalid_expression(
                        "array literals cannot contain field references or operators",
                    )),
                })
                .collect::<CacheResult<Vec<_>>>()?;
            Ok(Expression::literal(JsonValue::Array(literals)))
        }
        other => Ok(Expression::literal(other.clone())),
    }
}

fn parse_operator(map: &Map<String, JsonValue>) -> CacheResult<Expression> {
    let mut entries = map.iter();
    let (tag, argument) = match (entries.next(), entries.next()) {
        (Some(entry), None) => entry,
        (None, _) => return Err(CacheError::invalid_expression("empty expression object")),
        (Some(_), Some(_)) => {
            return Err(CacheError::invalid_expression(format!(
                "expression object must have exactly one operator, got {}",
                map.len()
            )));
        }
    };

    if tag == "$literal" {
        return Ok(Expression::literal(argument.clone()));
    }
    if !tag.starts_with('$') {
        return Err(CacheError::invalid_expression(format!(
            "expected an operator, got key '{tag}'"
        )));
    }
    let operator: Operator = tag.parse()?;

    let operands = match (operator, argument) {
        (Operator::Cond, JsonValue::Object(branches)) => ["if", "then", "else"]
            .iter()
            .map(|branch| {
                branches
                    .get(*branch)
                    .ok_or_else(|| {
                        CacheError::invalid_expression(format!("$cond is missing '{branch}'"))
                    })
                    .and_then(parse_expression)
            })
            .collect::<CacheResult<Vec<_>>>()?,
        (_, JsonValue::Array(items)) => items
            .iter()
            .map(parse_expression)
            .collect::<CacheResult<Vec<_>>>()?,
        (_, single) => vec![parse_expression(single)?],
    };
    Ok(Expression::op(operator, operands))
}

/// Decode a pipeline given as an array of single-key stage objects.
pub fn parse_pipeline(value: &JsonValue) -> CacheResult<Vec<StageDefinition>> {
    let stages = value.as_array().ok_or_else(|| {
        CacheError::invalid_stage("pipeline", "expected an array of stage objects")
    })?;
    stages.iter().map(parse_stage).collect()
}

/// Decode one `{"$stage": argument}` object.
pub fn parse_stage(value: &JsonValue) -> CacheResult<StageDefinition> {
    let map = value
        .as_object()
        .filter(|m| m.len() == 1)
        .ok_or_else(|| CacheError::invalid_stage("pipeline", "each stage must be an object with one key"))?;
    let Some((name, argument)) = map.iter().next() else {
        return Err(CacheError::invalid_stage("pipeline", "empty stage"));
    };

    match name.as_str() {
        "$match" => parse_match(argument),
        "$group" => parse_group(argument),
        "$limit" => Ok(StageDefinition::limit(argument.clone())),
        other => Err(CacheError::invalid_stage(
            other.trim_start_matches('$'),
            "unsupported stage",
        )),
    }
}

/// Decode a find-style filter document into match filters.
pub fn parse_filter(argument: &JsonValue) -> CacheResult<Vec<Expression>> {
    match argument {
        JsonValue::Array(items) => items.iter().map(parse_expression).collect(),
        JsonValue::Object(map) => {
            if let Some(expr) = map.get("$expr") {
                if map.len() != 1 {
                    return Err(CacheError::invalid_stage(
                        "match",
                        "$expr cannot be combined with field conditions",
                    ));
                }
                return Ok(vec![parse_expression(expr)?]);
            }
            map.iter()
                .map(|(field, value)| {
                    if field.starts_with('$') {
                        return Err(CacheError::invalid_stage(
                            "match",
                            format!("unsupported query operator '{field}'"),
                        ));
                    }
                    Ok(Expression::op(
                        Operator::Eq,
                        vec![Expression::field(field.clone()), Expression::literal(value.clone())],
                    ))
                })
                .collect()
        }
        _ => Err(CacheError::invalid_stage(
            "match",
            "expected a filter object or a list of expressions",
        )),
    }
}

fn parse_match(argument: &JsonValue) -> CacheResult<StageDefinition> {
    Ok(StageDefinition::filter(parse_filter(argument)?))
}

fn parse_group(argument: &JsonValue) -> CacheResult<StageDefinition> {
    let map = argument
        .as_object()
        .ok_or_else(|| CacheError::invalid_stage("group", "expected an object"))?;
    let group_by = map
        .get("_id")
        .ok_or_else(|| CacheError::invalid_stage("group", "missing '_id'"))
        .and_then(parse_expression)?;

    let mut accumulators = Vec::with_capacity(map.len().saturating_sub(1));
    for (output, raw) in map.iter().filter(|(k, _)| k.as_str() != "_id") {
        let accumulator = raw
            .as_object()
            .filter(|s| s.len() == 1)
            .ok_or_else(|| {
                CacheError::invalid_stage(
                    "group",
                    format!("field '{output}' must be a single accumulator object"),
                )
            })?;
        let Some((tag, expr)) = accumulator.iter().next() else {
            continue;
        };
        let kind: AccumulatorKind = tag.parse()?;
        accumulators.push(AccumulatorDefinition::new(
            kind,
            parse_expression(expr)?,
            output.clone(),
        ));
    }
    Ok(StageDefinition::group(group_by, accumulators))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_field_and_literals() {
        assert_eq!(parse_expression(&json!("$a.b")).unwrap(), Expression::field("a.b"));
        assert_eq!(parse_expression(&json!("plain")).unwrap(), Expression::literal("plain"));
        assert_eq!(parse_expression(&json!(5)).unwrap(), Expression::literal(5));
        assert_eq!(
            parse_expression(&json!({"$literal": "$notafield"})).unwrap(),
            Expression::literal("$notafield")
        );
        assert!(parse_expression(&json!("$")).is_err());
    }

    #[test]
    fn test_parse_operators() {
        let expr = parse_expression(&json!({"$add": ["$score", 10]})).unwrap();
        assert_eq!(
            expr,
            Expression::op(
                Operator::Add,
                vec![Expression::field("score"), Expression::literal(10)]
            )
        );
        assert_eq!(
            expr.evaluate(&json!({"score": 5})).unwrap(),
            Some(json!(15))
        );

        let upper = parse_expression(&json!({"$toUpper": "$name"})).unwrap();
        assert_eq!(
            upper.evaluate(&json!({"name": "ada"})).unwrap(),
            Some(json!("ADA"))
        );
    }

    #[test]
    fn test_parse_cond_object_form() {
        let object = parse_expression(&json!({
            "$cond": {"if": {"$gt": ["$x", 0]}, "then": "pos", "else": "neg"}
        }))
        .unwrap();
        let array = parse_expression(&json!({"$cond": [{"$gt": ["$x", 0]}, "pos", "neg"]})).unwrap();
        assert_eq!(object.hash(), array.hash());
        assert!(parse_expression(&json!({"$cond": {"if": true, "then": 1}})).is_err());
    }

    #[test]
    fn test_parse_rejects_malformed_objects() {
        assert!(matches!(
            parse_expression(&json!({"$frobnicate": [1]})),
            Err(CacheError::UnknownOperator { .. })
        ));
        assert!(matches!(
            parse_expression(&json!({})),
            Err(CacheError::InvalidExpression { .. })
        ));
        assert!(matches!(
            parse_expression(&json!({"$add": [1, 2], "$subtract": [1, 2]})),
            Err(CacheError::InvalidExpression { .. })
        ));
    }

    #[test]
    fn test_parse_pipeline() {
        let stages = parse_pipeline(&json!([
            {"$match": {"genre": "action"}},
            {"$group": {"_id": "$genre", "total": {"$sum": "$score"}, "n": {"$count": 1}}},
            {"$limit": 5}
        ]))
        .unwrap();
        assert_eq!(stages.len(), 3);
        assert_eq!(
            stages[0],
            StageDefinition::filter(vec![Expression::op(
                Operator::Eq,
                vec![Expression::field("genre"), Expression::literal("action")]
            )])
        );
        match &stages[1] {
            StageDefinition::Group {
                group_by,
                accumulators,
            } => {
                assert_eq!(group_by, &Expression::field("genre"));
                // Object keys iterate in sorted order.
                assert_eq!(accumulators[0], AccumulatorDefinition::count("n", Expression::literal(1)));
                assert_eq!(
                    accumulators[1],
                    AccumulatorDefinition::sum("total", Expression::field("score"))
                );
            }
            other => panic!("expected group stage, got {other:?}"),
        }
        assert_eq!(stages[2], StageDefinition::limit(5));
    }

    #[test]
    fn test_parse_match_forms() {
        let expr = parse_filter(&json!({"$expr": {"$gt": ["$x", 1]}})).unwrap();
        assert_eq!(expr.len(), 1);
        let list = parse_filter(&json!([{"$gt": ["$x", 1]}, {"$lt": ["$x", 9]}])).unwrap();
        assert_eq!(list.len(), 2);
        assert!(parse_filter(&json!({"$or": []})).is_err());
        assert!(parse_filter(&json!(3)).is_err());
    }

    #[test]
    fn test_parse_rejects_unknown_stage_and_accumulator() {
        assert!(matches!(
            parse_stage(&json!({"$lookup": {}})),
            Err(CacheError::InvalidStageArgument { .. })
        ));
        assert!(matches!(
            parse_stage(&json!({"$group": {"_id": "$g", "x": {"$median": "$v"}}})),
            Err(CacheError::UnknownOperator { .. })
        ));
        assert!(parse_stage(&json!({"$group": {"x": {"$sum": 1}}})).is_err());
        assert!(parse_pipeline(&json!({"$limit": 1})).is_err());
    }
}
