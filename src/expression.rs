/// Expression language for filters, group keys and accumulator inputs.
///
/// Expressions are immutable trees of three node kinds:
///
/// - **Field**: a dotted path into the document (`"user.age"`)
/// - **Literal**: a constant JSON value
/// - **Operator**: an [`Operator`] applied to operand expressions
///
/// Every expression has a content hash that depends only on its structure.
/// Two independently built but identical trees hash identically, which is
/// how a query's ad-hoc accumulator is matched to a maintained one.
///
/// # Example
///
/// ```ignore
/// use viewcache::expression::{Expression, Operator};
/// use serde_json::json;
///
/// let plus_ten = Expression::op(Operator::Add, vec![
///     Expression::field("score"),
///     Expression::literal(10),
/// ]);
/// assert_eq!(plus_ten.evaluate(&json!({"score": 5}))?, Some(json!(15)));
/// ```
use crate::error::{CacheError, CacheResult};
use crate::types::{
    ContentHash, canonical_value, compare_values, get_path, is_truthy, number_value, total_cmp,
};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Operators understood by the evaluator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Operator {
    Add,
    Subtract,
    Multiply,
    /// Division by zero has no JSON form and yields `null`, so every
    /// ordering comparison against it is false.
    Divide,
    Mod,
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    And,
    Or,
    Not,
    Concat,
    ToUpper,
    ToLower,
    /// `cond(if, then, else)`
    Cond,
}

impl Operator {
    /// The operator tag as written in pipeline syntax (without the `$`).
    pub fn name(&self) -> &'static str {
        match self {
            Operator::Add => "add",
            Operator::Subtract => "subtract",
            Operator::Multiply => "multiply",
            Operator::Divide => "divide",
            Operator::Mod => "mod",
            Operator::Eq => "eq",
            Operator::Ne => "ne",
            Operator::Gt => "gt",
            Operator::Gte => "gte",
            Operator::Lt => "lt",
            Operator::Lte => "lte",
            Operator::And => "and",
            Operator::Or => "or",
            Operator::Not => "not",
            Operator::Concat => "concat",
            Operator::ToUpper => "toUpper",
            Operator::ToLower => "toLower",
            Operator::Cond => "cond",
        }
    }

    /// Number of operands accepted; `None` means variadic.
    fn arity(&self) -> Option<usize> {
        match self {
            Operator::Add | Operator::Multiply | Operator::And | Operator::Or | Operator::Concat => {
                None
            }
            Operator::Not | Operator::ToUpper | Operator::ToLower => Some(1),
            Operator::Cond => Some(3),
            _ => Some(2),
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Operator {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let op = match s.strip_prefix('$').unwrap_or(s) {
            "add" => Operator::Add,
            "subtract" => Operator::Subtract,
            "multiply" => Operator::Multiply,
            "divide" => Operator::Divide,
            "mod" => Operator::Mod,
            "eq" => Operator::Eq,
            "ne" => Operator::Ne,
            "gt" => Operator::Gt,
            "gte" => Operator::Gte,
            "lt" => Operator::Lt,
            "lte" => Operator::Lte,
            "and" => Operator::And,
            "or" => Operator::Or,
            "not" => Operator::Not,
            "concat" => Operator::Concat,
            "toUpper" => Operator::ToUpper,
            "toLower" => Operator::ToLower,
            "cond" => Operator::Cond,
            _ => {
                return Err(CacheError::UnknownOperator {
                    operator: s.to_string(),
                });
            }
        };
        Ok(op)
    }
}

/// An expression tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Expression {
    /// Dotted path into the document.
    Field(String),
    /// Constant value.
    Literal(JsonValue),
    /// Operator applied to operands.
    Operator {
        operator: Operator,
        operands: Vec<Expression>,
    },
}

impl Expression {
    /// Create a field reference.
    pub fn field(path: impl Into<String>) -> Self {
        Self::Field(path.into())
    }

    /// Create a literal.
    pub fn literal(value: impl Into<JsonValue>) -> Self {
        Self::Literal(value.into())
    }

    /// Create an operator node.
    pub fn op(operator: Operator, operands: Vec<Expression>) -> Self {
        Self::Operator { operator, operands }
    }

    /// Evaluate against a document. `Ok(None)` is "undefined".
    pub fn evaluate(&self, doc: &JsonValue) -> CacheResult<Option<JsonValue>> {
        match self {
            Expression::Field(path) => Ok(get_path(doc, path).cloned()),
            Expression::Literal(value) => Ok(Some(value.clone())),
            Expression::Operator { operator, operands } => {
                if let Some(arity) = operator.arity() {
                    if operands.len() != arity {
                        return Err(CacheError::invalid_expression(format!(
                            "operator '{}' takes {} operand(s), got {}",
                            operator,
                            arity,
                            operands.len()
                        )));
                    }
                }

                // Only the selected branch of a conditional is evaluated.
                if *operator == Operator::Cond {
                    let condition = operands[0].evaluate(doc)?;
                    let branch = if is_truthy(condition.as_ref()) { 1 } else { 2 };
                    return operands[branch].evaluate(doc);
                }

                // Operators see a missing value as `null`, the same way group
                // keys do, so no filter can tell the two apart.
                let values = operands
                    .iter()
                    .map(|operand| Ok(operand.evaluate(doc)?.unwrap_or(JsonValue::Null)))
                    .collect::<CacheResult<Vec<_>>>()?;
                Ok(apply(*operator, &values))
            }
        }
    }

    /// Structural content hash.
    ///
    /// Field names, literal values, operators and operand order all
    /// contribute; numerically equal literals (`1` and `1.0`) hash alike.
    pub fn hash(&self) -> ContentHash {
        match self {
            Expression::Field(path) => ContentHash::of(format!("field\0{path}")),
            Expression::Literal(value) => {
                ContentHash::of(format!("literal\0{}", canonical_value(value)))
            }
            Expression::Operator { operator, operands } => {
                let children: Vec<String> = operands.iter().map(|o| o.hash().to_hex()).collect();
                ContentHash::of(format!("op\0{}\0{}", operator.name(), children.join(",")))
            }
        }
    }

    /// Number of nodes in the tree.
    pub fn size(&self) -> usize {
        match self {
            Expression::Operator { operands, .. } => {
                1 + operands.iter().map(Expression::size).sum::<usize>()
            }
            _ => 1,
        }
    }

    /// All field paths referenced anywhere in the tree.
    pub fn field_paths(&self) -> BTreeSet<&str> {
        let mut paths = BTreeSet::new();
        self.collect_paths(&mut paths);
        paths
    }

    fn collect_paths<'a>(&'a self, paths: &mut BTreeSet<&'a str>) {
        match self {
            Expression::Field(path) => {
                paths.insert(path.as_str());
            }
            Expression::Literal(_) => {}
            Expression::Operator { operands, .. } => {
                for operand in operands {
                    operand.collect_paths(paths);
                }
            }
        }
    }

    /// Replace every outermost subexpression whose hash equals `target`.
    pub fn replace_by_hash(&self, target: &ContentHash, replacement: &Expression) -> Expression {
        self.rewrite(&mut |hash: &ContentHash| (hash == target).then(|| replacement.clone()))
            .0
    }

    /// Bottom-up rewrite. `substitute` sees each node's original hash and
    /// may return a replacement; the outermost replacement wins.
    fn rewrite<F>(&self, substitute: &mut F) -> (Expression, ContentHash)
    where
        F: FnMut(&ContentHash) -> Option<Expression>,
    {
        let (rewritten, hash) = match self {
            Expression::Operator { operator, operands } => {
                let mut children = Vec::with_capacity(operands.len());
                let mut child_hashes = Vec::with_capacity(operands.len());
                for operand in operands {
                    let (child, child_hash) = operand.rewrite(substitute);
                    children.push(child);
                    child_hashes.push(child_hash.to_hex());
                }
                let hash = ContentHash::of(format!(
                    "op\0{}\0{}",
                    operator.name(),
                    child_hashes.join(",")
                ));
                (Expression::op(*operator, children), hash)
            }
            leaf => (leaf.clone(), leaf.hash()),
        };
        match substitute(&hash) {
            Some(replacement) => (replacement, hash),
            None => (rewritten, hash),
        }
    }
}

/// Collapse filter expressions onto fields present in every document.
///
/// Documents rendered by a view carry fields named after the content hash of
/// the expression that produced them. Any subexpression whose hash equals
/// such a field name is replaced by a reference to that field. With nested
/// matches the outermost one wins, giving the smallest tree; candidate
/// fields are considered in lexical order.
pub fn resolve_fields_by_hash(exprs: &[Expression], docs: &[JsonValue]) -> Vec<Expression> {
    let mut common: Option<BTreeSet<&str>> = None;
    for doc in docs {
        let keys: BTreeSet<&str> = match doc {
            JsonValue::Object(map) => map.keys().map(String::as_str).collect(),
            _ => BTreeSet::new(),
        };
        common = Some(match common {
            Some(existing) => existing.intersection(&keys).copied().collect(),
            None => keys,
        });
    }
    let candidates = common.unwrap_or_default();
    if candidates.is_empty() {
        return exprs.to_vec();
    }

    exprs
        .iter()
        .map(|expr| {
            expr.rewrite(&mut |hash: &ContentHash| {
                candidates
                    .get(hash.to_hex().as_str())
                    .map(|key| Expression::field(*key))
            })
            .0
        })
        .collect()
}

/// Apply an operator to already-evaluated operands.
fn apply(operator: Operator, values: &[JsonValue]) -> Option<JsonValue> {
    match operator {
        Operator::Add => fold_numbers(values, 0.0, |a, b| a + b),
        Operator::Multiply => fold_numbers(values, 1.0, |a, b| a * b),
        Operator::Subtract => binary_numbers(values, |a, b| a - b),
        Operator::Divide => binary_numbers(values, |a, b| a / b),
        Operator::Mod => binary_numbers(values, |a, b| a % b),
        Operator::Eq => Some(JsonValue::Bool(total_cmp(&values[0], &values[1]) == Ordering::Equal)),
        Operator::Ne => Some(JsonValue::Bool(total_cmp(&values[0], &values[1]) != Ordering::Equal)),
        Operator::Gt => Some(compare(values, |o| o == Ordering::Greater)),
        Operator::Gte => Some(compare(values, |o| o != Ordering::Less)),
        Operator::Lt => Some(compare(values, |o| o == Ordering::Less)),
        Operator::Lte => Some(compare(values, |o| o != Ordering::Greater)),
        Operator::And => Some(JsonValue::Bool(values.iter().all(|v| is_truthy(Some(v))))),
        Operator::Or => Some(JsonValue::Bool(values.iter().any(|v| is_truthy(Some(v))))),
        Operator::Not => Some(JsonValue::Bool(!is_truthy(Some(&values[0])))),
        Operator::Concat => {
            let mut out = String::new();
            for value in values {
                out.push_str(&display_string(value)?);
            }
            Some(JsonValue::String(out))
        }
        Operator::ToUpper => display_string(&values[0]).map(|s| JsonValue::String(s.to_uppercase())),
        Operator::ToLower => display_string(&values[0]).map(|s| JsonValue::String(s.to_lowercase())),
        // Handled lazily in `Expression::evaluate`.
        Operator::Cond => None,
    }
}

/// Non-numeric or null operands make the result undefined.
fn fold_numbers(values: &[JsonValue], init: f64, f: fn(f64, f64) -> f64) -> Option<JsonValue> {
    let mut acc = init;
    for value in values {
        acc = f(acc, value.as_f64()?);
    }
    Some(number_value(acc))
}

fn binary_numbers(values: &[JsonValue], f: fn(f64, f64) -> f64) -> Option<JsonValue> {
    let a = values[0].as_f64()?;
    let b = values[1].as_f64()?;
    Some(number_value(f(a, b)))
}

fn compare(values: &[JsonValue], test: fn(Ordering) -> bool) -> JsonValue {
    JsonValue::Bool(compare_values(&values[0], &values[1]).is_some_and(test))
}

/// String form used by the string operators; `null` has none.
///
/// Numbers are rendered canonically so `1` and `1.0` give the same text,
/// matching how they group and hash.
fn display_string(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::Null => None,
        JsonValue::String(s) => Some(s.clone()),
        other => Some(canonical_value(other).to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn field(p: &str) -> Expression {
        Expression::field(p)
    }

    fn lit(v: JsonValue) -> Expression {
        Expression::Literal(v)
    }

    #[test]
    fn test_field_and_literal() {
        let doc = json!({"a": {"b": 3}});
        assert_eq!(field("a.b").evaluate(&doc).unwrap(), Some(json!(3)));
        assert_eq!(field("a.c").evaluate(&doc).unwrap(), None);
        assert_eq!(lit(json!("x")).evaluate(&doc).unwrap(), Some(json!("x")));
    }

    #[test]
    fn test_arithmetic() {
        let doc = json!({"x": 10, "y": 4});
        let eval = |op, a: Expression, b: Expression| {
            Expression::op(op, vec![a, b]).evaluate(&doc).unwrap()
        };
        assert_eq!(eval(Operator::Add, field("x"), field("y")), Some(json!(14)));
        assert_eq!(eval(Operator::Subtract, field("x"), field("y")), Some(json!(6)));
        assert_eq!(eval(Operator::Multiply, field("x"), field("y")), Some(json!(40)));
        assert_eq!(eval(Operator::Divide, field("x"), field("y")), Some(json!(2.5)));
        assert_eq!(eval(Operator::Mod, field("x"), field("y")), Some(json!(2)));
    }

    #[test]
    fn test_arithmetic_with_undefined_operand() {
        let doc = json!({"x": 1});
        let expr = Expression::op(Operator::Add, vec![field("x"), field("missing")]);
        assert_eq!(expr.evaluate(&doc).unwrap(), None);
    }

    #[test]
    fn test_divide_by_zero_has_no_json_form() {
        let expr = Expression::op(Operator::Divide, vec![lit(json!(1)), lit(json!(0))]);
        assert_eq!(expr.evaluate(&json!({})).unwrap(), Some(json!(null)));
    }

    #[test]
    fn test_ordering_against_divide_by_zero_is_false() {
        let quotient = Expression::op(Operator::Divide, vec![lit(json!(1)), lit(json!(0))]);
        for op in [Operator::Gt, Operator::Lt] {
            let expr = Expression::op(op, vec![quotient.clone(), lit(json!(5))]);
            assert_eq!(expr.evaluate(&json!({})).unwrap(), Some(json!(false)));
        }
    }

    #[test]
    fn test_missing_and_null_are_indistinguishable() {
        let is_null = Expression::op(Operator::Eq, vec![field("g"), lit(json!(null))]);
        let concat = Expression::op(Operator::Concat, vec![field("g")]);
        let upper = Expression::op(Operator::ToUpper, vec![field("g")]);
        for doc in [json!({"g": null}), json!({})] {
            assert_eq!(is_null.evaluate(&doc).unwrap(), Some(json!(true)));
            assert_eq!(concat.evaluate(&doc).unwrap(), None);
            assert_eq!(upper.evaluate(&doc).unwrap(), None);
        }
        assert_eq!(is_null.evaluate(&json!({"g": 0})).unwrap(), Some(json!(false)));
    }

    #[test]
    fn test_numbers_render_canonically_in_strings() {
        let concat = Expression::op(Operator::Concat, vec![field("g"), lit(json!("!"))]);
        assert_eq!(concat.evaluate(&json!({"g": 1})).unwrap(), Some(json!("1!")));
        assert_eq!(concat.evaluate(&json!({"g": 1.0})).unwrap(), Some(json!("1!")));
        assert_eq!(concat.evaluate(&json!({"g": 2.5})).unwrap(), Some(json!("2.5!")));
    }

    #[test]
    fn test_comparisons() {
        let doc = json!({"age": 30, "name": "Ann"});
        let cmp = |op, a: Expression, b: Expression| {
            Expression::op(op, vec![a, b]).evaluate(&doc).unwrap()
        };
        assert_eq!(cmp(Operator::Gt, field("age"), lit(json!(18))), Some(json!(true)));
        assert_eq!(cmp(Operator::Lte, field("age"), lit(json!(29))), Some(json!(false)));
        assert_eq!(cmp(Operator::Eq, field("age"), lit(json!(30.0))), Some(json!(true)));
        assert_eq!(cmp(Operator::Ne, field("name"), lit(json!("Bob"))), Some(json!(true)));
        // Mixed types never order.
        assert_eq!(cmp(Operator::Gt, field("name"), lit(json!(1))), Some(json!(false)));
        assert_eq!(cmp(Operator::Eq, field("nope"), field("nada")), Some(json!(true)));
    }

    #[test]
    fn test_logical_and_strings() {
        let doc = json!({"a": true, "b": 0, "s": "MiXed"});
        let and = Expression::op(Operator::And, vec![field("a"), field("b")]);
        let or = Expression::op(Operator::Or, vec![field("a"), field("b")]);
        let not = Expression::op(Operator::Not, vec![field("b")]);
        assert_eq!(and.evaluate(&doc).unwrap(), Some(json!(false)));
        assert_eq!(or.evaluate(&doc).unwrap(), Some(json!(true)));
        assert_eq!(not.evaluate(&doc).unwrap(), Some(json!(true)));

        let upper = Expression::op(Operator::ToUpper, vec![field("s")]);
        let lower = Expression::op(Operator::ToLower, vec![field("s")]);
        let concat = Expression::op(
            Operator::Concat,
            vec![field("s"), lit(json!("-")), lit(json!(7))],
        );
        assert_eq!(upper.evaluate(&doc).unwrap(), Some(json!("MIXED")));
        assert_eq!(lower.evaluate(&doc).unwrap(), Some(json!("mixed")));
        assert_eq!(concat.evaluate(&doc).unwrap(), Some(json!("MiXed-7")));
    }

    #[test]
    fn test_cond_only_evaluates_selected_branch() {
        // The unselected branch has a bad arity and would fail if evaluated.
        let broken = Expression::op(Operator::Not, vec![]);
        let expr = Expression::op(
            Operator::Cond,
            vec![field("flag"), lit(json!("yes")), broken],
        );
        assert_eq!(expr.evaluate(&json!({"flag": 1})).unwrap(), Some(json!("yes")));
        assert!(expr.evaluate(&json!({"flag": 0})).is_err());
    }

    #[test]
    fn test_bad_arity_is_invalid_expression() {
        let expr = Expression::op(Operator::Subtract, vec![lit(json!(1))]);
        let err = expr.evaluate(&json!({})).unwrap_err();
        assert!(matches!(err, CacheError::InvalidExpression { .. }));
    }

    #[test]
    fn test_unknown_operator() {
        let err = "$pow".parse::<Operator>().unwrap_err();
        assert!(matches!(err, CacheError::UnknownOperator { .. }));
        assert_eq!("$toUpper".parse::<Operator>().unwrap(), Operator::ToUpper);
    }

    #[test]
    fn test_hash_stability() {
        let build = || {
            Expression::op(
                Operator::Add,
                vec![field("score"), lit(json!(10))],
            )
        };
        assert_eq!(build().hash(), build().hash());

        let other_field = Expression::op(Operator::Add, vec![field("points"), lit(json!(10))]);
        let other_literal = Expression::op(Operator::Add, vec![field("score"), lit(json!(11))]);
        let other_op = Expression::op(Operator::Subtract, vec![field("score"), lit(json!(10))]);
        let swapped = Expression::op(Operator::Add, vec![lit(json!(10)), field("score")]);
        for different in [other_field, other_literal, other_op, swapped] {
            assert_ne!(build().hash(), different.hash());
        }
        // A field and a string literal with the same text are different nodes.
        assert_ne!(field("x").hash(), lit(json!("x")).hash());
    }

    #[test]
    fn test_replace_by_hash() {
        let group = field("genre");
        let filter = Expression::op(Operator::Eq, vec![field("genre"), lit(json!("action"))]);
        let rewritten = filter.replace_by_hash(&group.hash(), &field("_id"));
        assert_eq!(
            rewritten,
            Expression::op(Operator::Eq, vec![field("_id"), lit(json!("action"))])
        );
        assert_eq!(rewritten.field_paths().into_iter().collect::<Vec<_>>(), vec!["_id"]);
    }

    #[test]
    fn test_resolve_fields_by_hash() {
        let inner = Expression::op(Operator::Add, vec![field("score"), lit(json!(10))]);
        let key = inner.hash().to_hex();
        let filter = Expression::op(Operator::Gt, vec![inner.clone(), lit(json!(50))]);
        let docs = vec![
            json!({"_id": "a", key.clone(): 60}),
            json!({"_id": "b", key.clone(): 40}),
        ];

        let resolved = resolve_fields_by_hash(std::slice::from_ref(&filter), &docs);
        assert_eq!(
            resolved[0],
            Expression::op(Operator::Gt, vec![field(&key), lit(json!(50))])
        );
        assert!(resolved[0].size() < filter.size());
        assert_eq!(resolved[0].evaluate(&docs[0]).unwrap(), Some(json!(true)));

        // A field missing from one document is not a candidate.
        let partial = vec![json!({key.clone(): 1}), json!({"other": 2})];
        assert_eq!(resolve_fields_by_hash(&[filter.clone()], &partial), vec![filter]);
    }
}
