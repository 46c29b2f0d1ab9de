/// Common types used throughout viewcache.
///
/// Documents are plain JSON objects. A missing field is "undefined" and is
/// modelled as `None`; JSON `null` is a present value. This module also
/// defines the total ordering and numeric normalisation shared by the
/// evaluator, the accumulators and the group key derivation.
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value as JsonValue};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::fmt;

/// A `(db, collection)` pair identifying a source collection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Namespace {
    /// Database name
    pub db: String,
    /// Collection name within the database
    #[serde(rename = "coll")]
    pub collection: String,
}

impl Namespace {
    /// Create a new namespace.
    pub fn new(db: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            db: db.into(),
            collection: collection.into(),
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.db, self.collection)
    }
}

/// A SHA-256 digest identifying an expression or accumulator by structure.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    /// Digest arbitrary bytes.
    pub fn of(bytes: impl AsRef<[u8]>) -> Self {
        Self(Sha256::digest(bytes.as_ref()).into())
    }

    /// Lowercase hex form, used as a field name in rendered view rows.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", &self.to_hex()[..12])
    }
}

impl Serialize for ContentHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

/// Get a field from a JSON document using dot notation.
///
/// Missing intermediate segments yield `None` rather than an error.
pub fn get_path<'a>(value: &'a JsonValue, path: &str) -> Option<&'a JsonValue> {
    let mut current = value;
    for part in path.split('.') {
        match current {
            JsonValue::Object(map) => {
                current = map.get(part)?;
            }
            JsonValue::Array(arr) => {
                let index: usize = part.parse().ok()?;
                current = arr.get(index)?;
            }
            _ => return None,
        }
    }
    Some(current)
}

/// Set a dotted path inside a JSON object, creating intermediate objects.
pub(crate) fn set_path(target: &mut JsonValue, path: &str, value: JsonValue) {
    let mut current = target;
    let mut parts = path.split('.').peekable();
    while let Some(part) = parts.next() {
        if !current.is_object() {
            *current = JsonValue::Object(Map::new());
        }
        let JsonValue::Object(map) = current else {
            return;
        };
        if parts.peek().is_none() {
            map.insert(part.to_string(), value);
            return;
        }
        current = map
            .entry(part.to_string())
            .or_insert_with(|| JsonValue::Object(Map::new()));
    }
}

/// Remove a dotted path from a JSON object, if present.
pub(crate) fn remove_path(target: &mut JsonValue, path: &str) {
    let (parent, leaf) = match path.rsplit_once('.') {
        Some((parent, leaf)) => (Some(parent), leaf),
        None => (None, path),
    };
    let container = match parent {
        Some(parent) => {
            let mut current = target;
            for part in parent.split('.') {
                match current.get_mut(part) {
                    Some(next) => current = next,
                    None => return,
                }
            }
            current
        }
        None => target,
    };
    if let JsonValue::Object(map) = container {
        map.remove(leaf);
    }
}

/// Truthiness of an evaluated value.
///
/// `undefined`, `null`, `false`, zero and the empty string are falsy;
/// everything else, including empty objects and arrays, is truthy.
pub fn is_truthy(value: Option<&JsonValue>) -> bool {
    match value {
        None | Some(JsonValue::Null) => false,
        Some(JsonValue::Bool(b)) => *b,
        Some(JsonValue::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
        Some(JsonValue::String(s)) => !s.is_empty(),
        Some(JsonValue::Array(_) | JsonValue::Object(_)) => true,
    }
}

/// Convert a numeric result back into JSON.
///
/// Integral results are stored as integers so `10 + 20` compares equal to
/// `json!(30)`. Non-finite results have no JSON form and become `null`.
pub fn number_value(f: f64) -> JsonValue {
    const MAX_SAFE: f64 = 9_007_199_254_740_992.0;
    if !f.is_finite() {
        return JsonValue::Null;
    }
    if f.fract() == 0.0 && f.abs() < MAX_SAFE {
        return JsonValue::from(f as i64);
    }
    serde_json::Number::from_f64(f)
        .map(JsonValue::Number)
        .unwrap_or(JsonValue::Null)
}

/// Recursively normalise numbers so that `1` and `1.0` are one value.
pub fn canonical_value(value: &JsonValue) -> JsonValue {
    match value {
        JsonValue::Number(n) => n.as_f64().map(number_value).unwrap_or(JsonValue::Null),
        JsonValue::Array(items) => JsonValue::Array(items.iter().map(canonical_value).collect()),
        JsonValue::Object(map) => JsonValue::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), canonical_value(v)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Stable string form of a (possibly undefined) value, used as a map key.
///
/// `undefined` and `null` share the key `"null"`.
pub fn canonical_key(value: Option<&JsonValue>) -> String {
    match value {
        None => "null".to_string(),
        Some(v) => canonical_value(v).to_string(),
    }
}

/// Rank of a JSON type in the cross-type sort order.
fn type_rank(value: &JsonValue) -> u8 {
    match value {
        JsonValue::Null => 0,
        JsonValue::Number(_) => 1,
        JsonValue::String(_) => 2,
        JsonValue::Object(_) => 3,
        JsonValue::Array(_) => 4,
        JsonValue::Bool(_) => 5,
    }
}

/// Total order over JSON values.
///
/// Values of different types order by type (null, numbers, strings,
/// objects, arrays, booleans); numbers compare numerically.
pub fn total_cmp(a: &JsonValue, b: &JsonValue) -> Ordering {
    match (a, b) {
        (JsonValue::Number(x), JsonValue::Number(y)) => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (JsonValue::String(x), JsonValue::String(y)) => x.cmp(y),
        (JsonValue::Bool(x), JsonValue::Bool(y)) => x.cmp(y),
        (JsonValue::Array(x), JsonValue::Array(y)) => {
            for (l, r) in x.iter().zip(y.iter()) {
                let ord = total_cmp(l, r);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (JsonValue::Object(x), JsonValue::Object(y)) => {
            for ((lk, lv), (rk, rv)) in x.iter().zip(y.iter()) {
                let ord = lk.cmp(rk).then_with(|| total_cmp(lv, rv));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (JsonValue::Null, JsonValue::Null) => Ordering::Equal,
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

/// Compare two values of the same comparable type.
///
/// Returns `None` for mixed types, which makes every ordering comparison
/// between them false.
pub fn compare_values(a: &JsonValue, b: &JsonValue) -> Option<Ordering> {
    match (a, b) {
        (JsonValue::Number(_), JsonValue::Number(_))
        | (JsonValue::String(_), JsonValue::String(_))
        | (JsonValue::Bool(_), JsonValue::Bool(_))
        | (JsonValue::Null, JsonValue::Null) => Some(total_cmp(a, b)),
        _ => None,
    }
}

/// JSON value wrapper ordered by [`total_cmp`], usable as a map key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderedValue(pub JsonValue);

impl PartialEq for OrderedValue {
    fn eq(&self, other: &Self) -> bool {
        total_cmp(&self.0, &other.0) == Ordering::Equal
    }
}

impl Eq for OrderedValue {}

impl PartialOrd for OrderedValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrderedValue {
    fn cmp(&self, other: &Self) -> Ordering {
        total_cmp(&self.0, &other.0)
    }
}
