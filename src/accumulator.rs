/// Accumulators: reductions over the values an expression yields per document.
///
/// Two realizations share one contract ([`Accumulator`]):
///
/// - [`BasicAccumulator`] recomputes its reduction over a whole batch on
///   every call. It backs uncached execution.
/// - [`CachedAccumulator`] keeps running state and is updated one document
///   at a time as documents are added, deleted or updated.
///
/// Identity is a pure function of `(kind, expression)`, so a basic
/// accumulator requested by a query compares equal to the cached one a view
/// maintains for the same reduction.
use crate::error::{CacheError, CacheResult};
use crate::expression::Expression;
use crate::types::{ContentHash, OrderedValue, is_truthy, number_value};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// The reduction an accumulator performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AccumulatorKind {
    /// Running total of numeric values.
    Sum,
    /// Number of truthy values.
    Count,
    /// Mean of numeric values.
    Avg,
    /// Smallest value.
    Min,
    /// Largest value.
    Max,
    /// Number of distinct values.
    CountDistinct,
}

impl AccumulatorKind {
    /// The tag as written in pipeline syntax (without the `$`).
    pub fn name(&self) -> &'static str {
        match self {
            AccumulatorKind::Sum => "sum",
            AccumulatorKind::Count => "count",
            AccumulatorKind::Avg => "avg",
            AccumulatorKind::Min => "min",
            AccumulatorKind::Max => "max",
            AccumulatorKind::CountDistinct => "countDistinct",
        }
    }

    /// Whether a single reported value is enough to resume maintenance.
    fn is_seedable(&self) -> bool {
        matches!(self, AccumulatorKind::Sum | AccumulatorKind::Count)
    }
}

impl fmt::Display for AccumulatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for AccumulatorKind {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.strip_prefix('$').unwrap_or(s) {
            "sum" => Ok(AccumulatorKind::Sum),
            "count" => Ok(AccumulatorKind::Count),
            "avg" => Ok(AccumulatorKind::Avg),
            "min" => Ok(AccumulatorKind::Min),
            "max" => Ok(AccumulatorKind::Max),
            "countDistinct" => Ok(AccumulatorKind::CountDistinct),
            _ => Err(CacheError::UnknownOperator {
                operator: s.to_string(),
            }),
        }
    }
}

/// Definition of one accumulator: what to reduce and where to put it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccumulatorDefinition {
    /// Reduction to apply.
    pub operator: AccumulatorKind,
    /// Expression evaluated per document to produce the input value.
    pub expression: Expression,
    /// User-facing output field name.
    pub output: String,
}

impl AccumulatorDefinition {
    /// Create a new accumulator definition.
    pub fn new(operator: AccumulatorKind, expression: Expression, output: impl Into<String>) -> Self {
        Self {
            operator,
            expression,
            output: output.into(),
        }
    }

    /// `sum(expression) as output`
    pub fn sum(output: impl Into<String>, expression: Expression) -> Self {
        Self::new(AccumulatorKind::Sum, expression, output)
    }

    /// `count(expression) as output`
    pub fn count(output: impl Into<String>, expression: Expression) -> Self {
        Self::new(AccumulatorKind::Count, expression, output)
    }

    /// `avg(expression) as output`
    pub fn avg(output: impl Into<String>, expression: Expression) -> Self {
        Self::new(AccumulatorKind::Avg, expression, output)
    }

    /// `min(expression) as output`
    pub fn min(output: impl Into<String>, expression: Expression) -> Self {
        Self::new(AccumulatorKind::Min, expression, output)
    }

    /// `max(expression) as output`
    pub fn max(output: impl Into<String>, expression: Expression) -> Self {
        Self::new(AccumulatorKind::Max, expression, output)
    }

    /// `countDistinct(expression) as output`
    pub fn count_distinct(output: impl Into<String>, expression: Expression) -> Self {
        Self::new(AccumulatorKind::CountDistinct, expression, output)
    }

    /// Content hash of `(operator, expression)`; the output name is excluded.
    pub fn hash(&self) -> ContentHash {
        ContentHash::of(format!(
            "acc\0{}\0{}",
            self.operator.name(),
            self.expression.hash().to_hex()
        ))
    }

    /// Full identity including the output name.
    pub fn id(&self) -> AccumulatorId {
        AccumulatorId {
            operator: self.operator,
            expression: self.expression.hash(),
            output: self.output.clone(),
        }
    }
}

/// Identity of an accumulator: `(operator, expression hash, output name)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AccumulatorId {
    pub operator: AccumulatorKind,
    pub expression: ContentHash,
    pub output: String,
}

impl fmt::Display for AccumulatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.output,
            self.operator,
            &self.expression.to_hex()[..12]
        )
    }
}

/// The contract shared by basic and cached accumulators.
pub trait Accumulator {
    /// The definition this accumulator was built from.
    fn definition(&self) -> &AccumulatorDefinition;

    /// Content hash of `(operator, expression)`.
    fn hash(&self) -> ContentHash {
        self.definition().hash()
    }

    /// Identity including the output name.
    fn id(&self) -> AccumulatorId {
        self.definition().id()
    }

    /// Same reduction over the same expression, regardless of realization.
    fn equals(&self, other: &dyn Accumulator) -> bool {
        self.hash() == other.hash()
    }
}

/// Value reported by a cached accumulator.
#[derive(Debug, Clone, PartialEq)]
pub enum CachedValue {
    /// Nothing has been added yet (or everything was deleted again).
    Undefined,
    /// The current reduction.
    Value(JsonValue),
    /// The accumulator is faulty; its reduction cannot be trusted.
    Unknown,
}

impl CachedValue {
    /// The reported value, if defined and trustworthy.
    pub fn as_value(&self) -> Option<&JsonValue> {
        match self {
            CachedValue::Value(v) => Some(v),
            _ => None,
        }
    }

    /// Render into a row field. Undefined and unknown become `null`.
    pub fn to_json(&self) -> JsonValue {
        self.as_value().cloned().unwrap_or(JsonValue::Null)
    }
}

impl From<Option<JsonValue>> for CachedValue {
    fn from(value: Option<JsonValue>) -> Self {
        value.map(CachedValue::Value).unwrap_or(CachedValue::Undefined)
    }
}

/// Occurrence counts per distinct value, ordered by value.
#[derive(Debug, Clone, Default)]
struct ValueMultiset {
    counts: BTreeMap<OrderedValue, u64>,
}

impl ValueMultiset {
    fn insert(&mut self, value: &JsonValue) {
        *self.counts.entry(OrderedValue(value.clone())).or_insert(0) += 1;
    }

    /// Returns false if the value was never inserted.
    fn remove(&mut self, value: &JsonValue) -> bool {
        let key = OrderedValue(value.clone());
        let Some(count) = self.counts.get_mut(&key) else {
            return false;
        };
        *count -= 1;
        if *count == 0 {
            self.counts.remove(&key);
        }
        true
    }

    fn first(&self) -> Option<&JsonValue> {
        self.counts.keys().next().map(|v| &v.0)
    }

    fn last(&self) -> Option<&JsonValue> {
        self.counts.keys().next_back().map(|v| &v.0)
    }

    fn distinct(&self) -> usize {
        self.counts.len()
    }
}

/// Numeric total that cancels exactly when a contribution is removed.
///
/// Integers, including integral floats up to 2^64 in magnitude, add into an
/// `i128`. The remaining floats use Neumaier-compensated summation, and the
/// float part is cleared once its last term is removed so no rounding
/// residue outlives the values that produced it.
#[derive(Debug, Clone, Default)]
struct ExactTotal {
    ints: i128,
    floats: f64,
    compensation: f64,
    float_terms: u64,
    /// Set by a seed. The float part then also holds values this total
    /// never saw, so it is never cleared.
    seeded: bool,
}

impl ExactTotal {
    const INTEGRAL_LIMIT: f64 = 18_446_744_073_709_551_616.0;

    fn integral(n: &serde_json::Number) -> Option<i128> {
        if let Some(i) = n.as_i64() {
            return Some(i128::from(i));
        }
        if let Some(u) = n.as_u64() {
            return Some(i128::from(u));
        }
        let f = n.as_f64()?;
        (f.fract() == 0.0 && f.abs() < Self::INTEGRAL_LIMIT).then_some(f as i128)
    }

    fn compensated_add(&mut self, x: f64) {
        let t = self.floats + x;
        if self.floats.abs() >= x.abs() {
            self.compensation += (self.floats - t) + x;
        } else {
            self.compensation += (x - t) + self.floats;
        }
        self.floats = t;
    }

    /// Returns false for non-numeric values, which are not part of the total.
    fn add(&mut self, value: &JsonValue) -> bool {
        let JsonValue::Number(n) = value else {
            return false;
        };
        if let Some(i) = Self::integral(n) {
            self.ints += i;
        } else if let Some(f) = n.as_f64() {
            self.compensated_add(f);
            self.float_terms += 1;
        }
        true
    }

    /// Returns false for non-numeric values, which are not part of the total.
    fn remove(&mut self, value: &JsonValue) -> bool {
        let JsonValue::Number(n) = value else {
            return false;
        };
        if let Some(i) = Self::integral(n) {
            self.ints -= i;
        } else if let Some(f) = n.as_f64() {
            self.compensated_add(-f);
            self.float_terms = self.float_terms.saturating_sub(1);
            if self.float_terms == 0 && !self.seeded {
                self.floats = 0.0;
                self.compensation = 0.0;
            }
        }
        true
    }

    fn seed(&mut self, value: &JsonValue) {
        *self = ExactTotal::default();
        self.add(value);
        self.seeded = true;
    }

    fn has_float_part(&self) -> bool {
        self.floats != 0.0 || self.compensation != 0.0
    }

    fn as_f64(&self) -> f64 {
        self.ints as f64 + (self.floats + self.compensation)
    }

    fn value(&self) -> JsonValue {
        if self.has_float_part() {
            return number_value(self.as_f64());
        }
        if let Ok(i) = i64::try_from(self.ints) {
            return JsonValue::from(i);
        }
        if let Ok(u) = u64::try_from(self.ints) {
            return JsonValue::from(u);
        }
        number_value(self.ints as f64)
    }

    fn mean(&self, count: u64) -> JsonValue {
        if !self.has_float_part() && self.ints % i128::from(count) == 0 {
            let total = ExactTotal {
                ints: self.ints / i128::from(count),
                ..ExactTotal::default()
            };
            return total.value();
        }
        number_value(self.as_f64() / count as f64)
    }
}

/// Running state of one reduction.
#[derive(Debug, Clone)]
enum Reduction {
    Sum {
        total: ExactTotal,
        contributions: i64,
    },
    Count {
        count: u64,
    },
    Avg {
        total: ExactTotal,
        count: u64,
    },
    /// Min, max and distinct-count all keep the full population.
    Multiset(ValueMultiset),
}

impl Reduction {
    fn new(kind: AccumulatorKind) -> Self {
        match kind {
            AccumulatorKind::Sum => Reduction::Sum {
                total: ExactTotal::default(),
                contributions: 0,
            },
            AccumulatorKind::Count => Reduction::Count { count: 0 },
            AccumulatorKind::Avg => Reduction::Avg {
                total: ExactTotal::default(),
                count: 0,
            },
            AccumulatorKind::Min | AccumulatorKind::Max | AccumulatorKind::CountDistinct => {
                Reduction::Multiset(ValueMultiset::default())
            }
        }
    }

    fn add(&mut self, kind: AccumulatorKind, value: &JsonValue) {
        match self {
            Reduction::Sum {
                total,
                contributions,
            } => {
                if total.add(value) {
                    *contributions += 1;
                }
            }
            Reduction::Count { count } => {
                if is_truthy(Some(value)) {
                    *count += 1;
                }
            }
            Reduction::Avg { total, count } => {
                if total.add(value) {
                    *count += 1;
                }
            }
            Reduction::Multiset(values) => {
                if kind == AccumulatorKind::CountDistinct || !value.is_null() {
                    values.insert(value);
                }
            }
        }
    }

    /// Returns false when the value was never recorded.
    fn remove(&mut self, kind: AccumulatorKind, value: &JsonValue) -> bool {
        match self {
            Reduction::Sum {
                total,
                contributions,
            } => {
                if !value.is_number() {
                    return true;
                }
                if *contributions <= 0 && !total.seeded {
                    return false;
                }
                total.remove(value);
                *contributions -= 1;
                if *contributions == 0 && !total.seeded {
                    *total = ExactTotal::default();
                }
                true
            }
            Reduction::Count { count } => {
                if !is_truthy(Some(value)) {
                    return true;
                }
                if *count == 0 {
                    return false;
                }
                *count -= 1;
                true
            }
            Reduction::Avg { total, count } => {
                if !value.is_number() {
                    return true;
                }
                if *count == 0 {
                    return false;
                }
                total.remove(value);
                *count -= 1;
                if *count == 0 {
                    *total = ExactTotal::default();
                }
                true
            }
            Reduction::Multiset(values) => {
                if kind != AccumulatorKind::CountDistinct && value.is_null() {
                    return true;
                }
                values.remove(value)
            }
        }
    }

    fn value(&self, kind: AccumulatorKind) -> Option<JsonValue> {
        match self {
            Reduction::Sum {
                total,
                contributions,
            } => (*contributions != 0 || total.seeded).then(|| total.value()),
            Reduction::Count { count } => Some(JsonValue::from(*count)),
            Reduction::Avg { total, count } => (*count > 0).then(|| total.mean(*count)),
            Reduction::Multiset(values) => match kind {
                AccumulatorKind::Min => values.first().cloned(),
                AccumulatorKind::Max => values.last().cloned(),
                _ => Some(JsonValue::from(values.distinct())),
            },
        }
    }
}

/// Stateless accumulator that reduces a full batch per call.
#[derive(Debug, Clone)]
pub struct BasicAccumulator {
    definition: AccumulatorDefinition,
}

impl BasicAccumulator {
    /// Create a basic accumulator.
    pub fn new(definition: AccumulatorDefinition) -> Self {
        Self { definition }
    }

    /// Reduce every document in `docs`. `Ok(None)` is "undefined".
    pub fn evaluate(&self, docs: &[&JsonValue]) -> CacheResult<Option<JsonValue>> {
        let kind = self.definition.operator;
        let mut reduction = Reduction::new(kind);
        for doc in docs {
            if let Some(value) = self.definition.expression.evaluate(doc)? {
                reduction.add(kind, &value);
            }
        }
        Ok(reduction.value(kind))
    }
}

impl Accumulator for BasicAccumulator {
    fn definition(&self) -> &AccumulatorDefinition {
        &self.definition
    }
}

/// Stateful accumulator maintained incrementally.
///
/// A delete for a value that was never added moves the accumulator into a
/// faulty state: it keeps accepting events but reports
/// [`CachedValue::Unknown`] until [`reset`](Self::reset).
#[derive(Debug, Clone)]
pub struct CachedAccumulator {
    definition: Arc<AccumulatorDefinition>,
    reduction: Reduction,
    /// Value adopted by [`seed`](Self::seed) for kinds that cannot resume.
    seed: Option<JsonValue>,
    faulty: bool,
}

impl CachedAccumulator {
    /// Create an empty cached accumulator.
    pub fn new(definition: Arc<AccumulatorDefinition>) -> Self {
        let reduction = Reduction::new(definition.operator);
        Self {
            definition,
            reduction,
            seed: None,
            faulty: false,
        }
    }

    /// Apply one value. Undefined values are ignored.
    pub fn add_value(&mut self, value: Option<&JsonValue>) {
        let Some(value) = value else {
            return;
        };
        if self.faulty {
            return;
        }
        if self.seed.is_some() {
            self.faulty = true;
            return;
        }
        self.reduction.add(self.definition.operator, value);
    }

    /// Inverse of [`add_value`](Self::add_value).
    ///
    /// Returns [`CacheError::AccumulatorIntegrity`] if the value was never
    /// recorded; the accumulator is faulty from then on.
    pub fn delete_value(&mut self, value: Option<&JsonValue>) -> CacheResult<()> {
        let Some(value) = value else {
            return Ok(());
        };
        if self.faulty {
            return Ok(());
        }
        let recorded = self.seed.is_none() && self.reduction.remove(self.definition.operator, value);
        if recorded {
            return Ok(());
        }
        self.faulty = true;
        Err(CacheError::AccumulatorIntegrity {
            accumulator: self.definition.output.clone(),
            value: value.to_string(),
        })
    }

    /// Evaluate the source expression against `doc` and add the result.
    pub fn add_document(&mut self, doc: &JsonValue) -> CacheResult<()> {
        let value = self.definition.expression.evaluate(doc)?;
        self.add_value(value.as_ref());
        Ok(())
    }

    /// Evaluate the source expression against `doc` and delete the result.
    pub fn delete_document(&mut self, doc: &JsonValue) -> CacheResult<()> {
        let value = self.definition.expression.evaluate(doc)?;
        self.delete_value(value.as_ref())
    }

    /// Delete the old version, then add the new one.
    ///
    /// Both values are evaluated before state changes, so an evaluation
    /// error leaves the accumulator untouched.
    pub fn update_document(&mut self, old: &JsonValue, new: &JsonValue) -> CacheResult<()> {
        let old_value = self.definition.expression.evaluate(old)?;
        let new_value = self.definition.expression.evaluate(new)?;
        let deleted = self.delete_value(old_value.as_ref());
        self.add_value(new_value.as_ref());
        deleted
    }

    /// Adopt a previously computed value without replaying documents.
    ///
    /// `sum` and `count` keep folding later events onto the seed. The other
    /// kinds cannot recover their population from one value: they report the
    /// seed until the next event, which leaves them faulty.
    pub fn seed(&mut self, value: &JsonValue) {
        let kind = self.definition.operator;
        self.reduction = Reduction::new(kind);
        self.seed = None;
        self.faulty = false;
        if value.is_null() {
            return;
        }
        if !kind.is_seedable() {
            self.seed = Some(value.clone());
            return;
        }
        match (&mut self.reduction, value) {
            (Reduction::Sum { total, .. }, JsonValue::Number(_)) => total.seed(value),
            (Reduction::Count { count }, JsonValue::Number(n)) if n.as_u64().is_some() => {
                *count = n.as_u64().unwrap_or(0);
            }
            _ => self.faulty = true,
        }
    }

    /// The current reduction.
    pub fn get_cached_value(&self) -> CachedValue {
        if self.faulty {
            return CachedValue::Unknown;
        }
        if let Some(seed) = &self.seed {
            return CachedValue::Value(seed.clone());
        }
        self.reduction.value(self.definition.operator).into()
    }

    /// Whether a data-integrity problem has been detected.
    pub fn is_faulty(&self) -> bool {
        self.faulty
    }

    /// Drop all state, including a faulty flag.
    pub fn reset(&mut self) {
        self.reduction = Reduction::new(self.definition.operator);
        self.seed = None;
        self.faulty = false;
    }
}

impl Accumulator for CachedAccumulator {
    fn definition(&self) -> &AccumulatorDefinition {
        &self.definition
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cached(def: AccumulatorDefinition) -> CachedAccumulator {
        CachedAccumulator::new(Arc::new(def))
    }

    fn score() -> Expression {
        Expression::field("score")
    }

    #[test]
    fn test_initial_values() {
        assert_eq!(cached(AccumulatorDefinition::sum("s", score())).get_cached_value(), CachedValue::Undefined);
        assert_eq!(cached(AccumulatorDefinition::avg("a", score())).get_cached_value(), CachedValue::Undefined);
        assert_eq!(cached(AccumulatorDefinition::min("m", score())).get_cached_value(), CachedValue::Undefined);
        assert_eq!(
            cached(AccumulatorDefinition::count("c", score())).get_cached_value(),
            CachedValue::Value(json!(0))
        );
        assert_eq!(
            cached(AccumulatorDefinition::count_distinct("d", score())).get_cached_value(),
            CachedValue::Value(json!(0))
        );
    }

    #[test]
    fn test_sum_add_delete() {
        let mut acc = cached(AccumulatorDefinition::sum("total", score()));
        acc.add_value(Some(&json!(10)));
        acc.add_value(Some(&json!(5)));
        acc.add_value(None);
        assert_eq!(acc.get_cached_value(), CachedValue::Value(json!(15)));
        acc.delete_value(Some(&json!(10))).unwrap();
        acc.delete_value(Some(&json!(5))).unwrap();
        assert_eq!(acc.get_cached_value(), CachedValue::Undefined);
    }

    #[test]
    fn test_sum_deleting_large_value_restores_small_one() {
        let mut acc = cached(AccumulatorDefinition::sum("total", score()));
        acc.add_value(Some(&json!(0.1)));
        assert_eq!(acc.get_cached_value(), CachedValue::Value(json!(0.1)));
        acc.add_value(Some(&json!(1e17)));
        acc.delete_value(Some(&json!(1e17))).unwrap();
        assert_eq!(acc.get_cached_value(), CachedValue::Value(json!(0.1)));

        let mut mean = cached(AccumulatorDefinition::avg("mean", score()));
        mean.add_value(Some(&json!(0.5)));
        mean.add_value(Some(&json!(1e17)));
        mean.delete_value(Some(&json!(1e17))).unwrap();
        assert_eq!(mean.get_cached_value(), CachedValue::Value(json!(0.5)));
    }

    #[test]
    fn test_sum_of_large_integers_is_exact() {
        let mut acc = cached(AccumulatorDefinition::sum("total", score()));
        acc.add_value(Some(&json!(i64::MAX)));
        acc.add_value(Some(&json!(1)));
        assert_eq!(
            acc.get_cached_value(),
            CachedValue::Value(json!(i64::MAX as u64 + 1))
        );
        acc.delete_value(Some(&json!(i64::MAX))).unwrap();
        assert_eq!(acc.get_cached_value(), CachedValue::Value(json!(1)));
    }

    #[test]
    fn test_float_residue_cleared_with_last_float() {
        let mut acc = cached(AccumulatorDefinition::sum("total", score()));
        acc.add_value(Some(&json!(3)));
        acc.add_value(Some(&json!(0.1)));
        acc.add_value(Some(&json!(0.2)));
        acc.delete_value(Some(&json!(0.1))).unwrap();
        acc.delete_value(Some(&json!(0.2))).unwrap();
        assert_eq!(acc.get_cached_value(), CachedValue::Value(json!(3)));
    }

    #[test]
    fn test_sum_ignores_non_numeric() {
        let mut acc = cached(AccumulatorDefinition::sum("total", score()));
        acc.add_value(Some(&json!("ten")));
        assert_eq!(acc.get_cached_value(), CachedValue::Undefined);
        acc.delete_value(Some(&json!("ten"))).unwrap();
        assert!(!acc.is_faulty());
    }

    #[test]
    fn test_count_counts_truthy_values() {
        let mut acc = cached(AccumulatorDefinition::count("n", score()));
        for v in [json!(1), json!(0), json!("x"), json!(null), json!(true)] {
            acc.add_value(Some(&v));
        }
        assert_eq!(acc.get_cached_value(), CachedValue::Value(json!(3)));
        acc.delete_value(Some(&json!(0))).unwrap();
        acc.delete_value(Some(&json!(1))).unwrap();
        assert_eq!(acc.get_cached_value(), CachedValue::Value(json!(2)));
    }

    #[test]
    fn test_avg() {
        let mut acc = cached(AccumulatorDefinition::avg("mean", score()));
        for v in [10, 20, 30] {
            acc.add_value(Some(&json!(v)));
        }
        assert_eq!(acc.get_cached_value(), CachedValue::Value(json!(20)));
        acc.delete_value(Some(&json!(30))).unwrap();
        assert_eq!(acc.get_cached_value(), CachedValue::Value(json!(15)));
        acc.delete_value(Some(&json!(10))).unwrap();
        acc.delete_value(Some(&json!(20))).unwrap();
        assert_eq!(acc.get_cached_value(), CachedValue::Undefined);
    }

    #[test]
    fn test_min_max_recompute_after_deleting_extremum() {
        let mut min = cached(AccumulatorDefinition::min("lo", score()));
        let mut max = cached(AccumulatorDefinition::max("hi", score()));
        for v in [5, 1, 9, 1, 7] {
            min.add_value(Some(&json!(v)));
            max.add_value(Some(&json!(v)));
        }
        assert_eq!(min.get_cached_value(), CachedValue::Value(json!(1)));
        assert_eq!(max.get_cached_value(), CachedValue::Value(json!(9)));

        // One of two 1s removed: minimum stays.
        min.delete_value(Some(&json!(1))).unwrap();
        assert_eq!(min.get_cached_value(), CachedValue::Value(json!(1)));
        min.delete_value(Some(&json!(1))).unwrap();
        assert_eq!(min.get_cached_value(), CachedValue::Value(json!(5)));

        max.delete_value(Some(&json!(9))).unwrap();
        assert_eq!(max.get_cached_value(), CachedValue::Value(json!(7)));
    }

    #[test]
    fn test_count_distinct_scenario() {
        let mut acc = cached(AccumulatorDefinition::count_distinct("d", score()));
        for v in [10, 5, 7] {
            acc.add_value(Some(&json!(v)));
        }
        assert_eq!(acc.get_cached_value(), CachedValue::Value(json!(3)));
        acc.add_value(Some(&json!(15)));
        assert_eq!(acc.get_cached_value(), CachedValue::Value(json!(4)));

        // Several duplicates of 10: distinct count holds until the last goes.
        acc.add_value(Some(&json!(10)));
        acc.add_value(Some(&json!(10.0)));
        acc.delete_value(Some(&json!(15))).unwrap();
        assert_eq!(acc.get_cached_value(), CachedValue::Value(json!(3)));
        acc.delete_value(Some(&json!(10))).unwrap();
        acc.delete_value(Some(&json!(10))).unwrap();
        assert_eq!(acc.get_cached_value(), CachedValue::Value(json!(3)));
        acc.delete_value(Some(&json!(10))).unwrap();
        assert_eq!(acc.get_cached_value(), CachedValue::Value(json!(2)));
    }

    #[test]
    fn test_delete_of_unrecorded_value_is_faulty() {
        let mut acc = cached(AccumulatorDefinition::max("hi", score()));
        acc.add_value(Some(&json!(3)));
        let err = acc.delete_value(Some(&json!(4))).unwrap_err();
        assert!(err.is_integrity_warning());
        assert!(acc.is_faulty());
        assert_eq!(acc.get_cached_value(), CachedValue::Unknown);

        // Further events neither crash nor clear the fault.
        acc.add_value(Some(&json!(8)));
        assert!(acc.delete_value(Some(&json!(8))).is_ok());
        assert_eq!(acc.get_cached_value(), CachedValue::Unknown);

        acc.reset();
        assert_eq!(acc.get_cached_value(), CachedValue::Undefined);
    }

    #[test]
    fn test_document_routing_and_update() {
        let expr = Expression::op(
            crate::expression::Operator::Add,
            vec![score(), Expression::literal(10)],
        );
        let mut acc = cached(AccumulatorDefinition::sum("plus10", expr));
        acc.add_document(&json!({"score": 1})).unwrap();
        acc.add_document(&json!({"score": 2})).unwrap();
        assert_eq!(acc.get_cached_value(), CachedValue::Value(json!(23)));
        acc.update_document(&json!({"score": 2}), &json!({"score": 5}))
            .unwrap();
        assert_eq!(acc.get_cached_value(), CachedValue::Value(json!(26)));
        acc.delete_document(&json!({"score": 1})).unwrap();
        assert_eq!(acc.get_cached_value(), CachedValue::Value(json!(15)));
    }

    #[test]
    fn test_seeding() {
        let mut sum = cached(AccumulatorDefinition::sum("s", score()));
        sum.seed(&json!(100));
        sum.add_value(Some(&json!(5)));
        sum.delete_value(Some(&json!(20))).unwrap();
        assert_eq!(sum.get_cached_value(), CachedValue::Value(json!(85)));

        let mut count = cached(AccumulatorDefinition::count("n", score()));
        count.seed(&json!(2));
        count.delete_value(Some(&json!(1))).unwrap();
        assert_eq!(count.get_cached_value(), CachedValue::Value(json!(1)));

        let mut max = cached(AccumulatorDefinition::max("hi", score()));
        max.seed(&json!(9));
        assert_eq!(max.get_cached_value(), CachedValue::Value(json!(9)));
        max.add_value(Some(&json!(3)));
        assert_eq!(max.get_cached_value(), CachedValue::Unknown);
    }

    #[test]
    fn test_basic_and_cached_identity() {
        let basic = BasicAccumulator::new(AccumulatorDefinition::sum("x", score()));
        let maintained = cached(AccumulatorDefinition::sum("renamed", score()));
        let other = cached(AccumulatorDefinition::max("x", score()));
        assert!(basic.equals(&maintained));
        assert!(maintained.equals(&basic));
        assert!(!basic.equals(&other));
        assert_ne!(basic.id(), maintained.id());
    }

    #[test]
    fn test_basic_evaluate_matches_cached() {
        let docs = [json!({"score": 4}), json!({"score": 8}), json!({})];
        let refs: Vec<&JsonValue> = docs.iter().collect();
        for def in [
            AccumulatorDefinition::sum("a", score()),
            AccumulatorDefinition::avg("a", score()),
            AccumulatorDefinition::min("a", score()),
            AccumulatorDefinition::max("a", score()),
            AccumulatorDefinition::count("a", score()),
            AccumulatorDefinition::count_distinct("a", score()),
        ] {
            let mut acc = cached(def.clone());
            for doc in &docs {
                acc.add_document(doc).unwrap();
            }
            let batch = BasicAccumulator::new(def).evaluate(&refs).unwrap();
            assert_eq!(CachedValue::from(batch), acc.get_cached_value());
        }
    }
}
