//! Query descriptors and canonical cache keys
//!
//! A [`QueryDescriptor`] names a remote resource plus an unordered
//! conjunction of filters, an optional single-column ordering and an
//! optional limit. Two descriptors that describe the same logical query
//! always produce the same [`CacheKey`], regardless of the order in which
//! their filters were added or the call site that built them.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

/// A scalar filter operand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Scalar {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn to_json(&self) -> Value {
        match self {
            Self::Null => Value::Null,
            Self::Bool(b) => Value::Bool(*b),
            Self::Int(i) => Value::from(*i),
            Self::Float(f) => Value::from(*f),
            Self::Text(s) => Value::String(s.clone()),
        }
    }

    /// Key form of this operand. Integral floats encode as integers since
    /// they select the same rows.
    fn canonical_json(&self) -> Value {
        match self {
            Self::Float(f) if f.fract() == 0.0 && f.abs() < I64_EXACT_LIMIT => {
                Value::from(*f as i64)
            }
            other => other.to_json(),
        }
    }
}

/// Floats below this magnitude convert to `i64` exactly.
const I64_EXACT_LIMIT: f64 = 9_007_199_254_740_992.0;

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Bool(b) => write!(f, "{}", b),
            Self::Int(i) => write!(f, "{}", i),
            Self::Float(x) => write!(f, "{}", x),
            Self::Text(s) => f.write_str(s),
        }
    }
}

impl From<&str> for Scalar {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for Scalar {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for Scalar {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for Scalar {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<f64> for Scalar {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<bool> for Scalar {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl<T: Into<Scalar>> From<Option<T>> for Scalar {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Self::Null)
    }
}

/// Filter operand: equality against a scalar, or membership in a list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterValue {
    List(Vec<Scalar>),
    Scalar(Scalar),
}

impl FilterValue {
    /// Null-valued filters do not constrain the query.
    pub fn is_absent(&self) -> bool {
        matches!(self, Self::Scalar(Scalar::Null))
    }

    /// Check a row field against this operand.
    pub fn matches(&self, field: &Value) -> bool {
        match self {
            Self::Scalar(s) => json_eq(field, &s.to_json()),
            Self::List(items) => items.iter().any(|s| json_eq(field, &s.to_json())),
        }
    }

    fn canonical(&self) -> Value {
        match self {
            Self::Scalar(s) => s.canonical_json(),
            Self::List(items) => {
                let mut encoded: Vec<(String, Value)> = items
                    .iter()
                    .map(|s| {
                        let v = s.canonical_json();
                        (v.to_string(), v)
                    })
                    .collect();
                encoded.sort_by(|a, b| a.0.cmp(&b.0));
                encoded.dedup_by(|a, b| a.0 == b.0);
                Value::Array(encoded.into_iter().map(|(_, v)| v).collect())
            }
        }
    }
}

/// Single-column ordering. Ties are resolved by the remote service's
/// default order, which is undefined and must not be assumed stable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderBy {
    pub column: String,
    pub ascending: bool,
}

impl OrderBy {
    pub fn asc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            ascending: true,
        }
    }

    pub fn desc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            ascending: false,
        }
    }

    fn direction(&self) -> &'static str {
        if self.ascending {
            "asc"
        } else {
            "desc"
        }
    }
}

/// Description of a remote query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryDescriptor {
    pub resource: String,
    #[serde(default)]
    pub filters: BTreeMap<String, FilterValue>,
    #[serde(default)]
    pub order: Option<OrderBy>,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl QueryDescriptor {
    /// Create a descriptor selecting every row of `resource`.
    pub fn new(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            filters: BTreeMap::new(),
            order: None,
            limit: None,
        }
    }

    /// Add an equality filter. `None`/null operands are kept but skipped.
    pub fn filter(mut self, field: impl Into<String>, value: impl Into<Scalar>) -> Self {
        self.filters
            .insert(field.into(), FilterValue::Scalar(value.into()));
        self
    }

    /// Add a membership filter.
    pub fn filter_in<I, S>(mut self, field: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Scalar>,
    {
        let values = values.into_iter().map(Into::into).collect();
        self.filters.insert(field.into(), FilterValue::List(values));
        self
    }

    pub fn order_by(mut self, order: OrderBy) -> Self {
        self.order = Some(order);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Filters that actually constrain the query (null operands skipped).
    pub fn active_filters(&self) -> impl Iterator<Item = (&str, &FilterValue)> {
        self.filters
            .iter()
            .filter(|(_, v)| !v.is_absent())
            .map(|(k, v)| (k.as_str(), v))
    }

    /// Compute the canonical key for this descriptor.
    ///
    /// Filter order, null-valued filters, and the order of list operands do
    /// not affect the key.
    pub fn cache_key(&self) -> CacheKey {
        let filters: BTreeMap<&str, Value> = self
            .active_filters()
            .map(|(field, value)| (field, value.canonical()))
            .collect();
        let filters = serde_json::to_string(&filters).unwrap_or_default();
        let order = self
            .order
            .as_ref()
            .map(|o| format!("{}.{}", o.column, o.direction()))
            .unwrap_or_default();
        let limit = self.limit.map(|l| l.to_string()).unwrap_or_default();
        CacheKey(format!(
            "{}|{}|{}|{}",
            self.resource, filters, order, limit
        ))
    }

    /// Check whether a row satisfies every active filter.
    pub fn matches(&self, row: &Value) -> bool {
        self.active_filters().all(|(field, value)| {
            let field_value = row.get(field).unwrap_or(&Value::Null);
            value.matches(field_value)
        })
    }

    /// Evaluate this descriptor against in-memory rows.
    ///
    /// Used by in-process accessors; the sort is stable, but remote services
    /// give no such guarantee for ties.
    pub fn evaluate(&self, rows: impl IntoIterator<Item = Value>) -> Vec<Value> {
        let mut selected: Vec<Value> = rows.into_iter().filter(|r| self.matches(r)).collect();
        if let Some(order) = &self.order {
            selected.sort_by(|a, b| {
                let ord = json_cmp(
                    a.get(&order.column).unwrap_or(&Value::Null),
                    b.get(&order.column).unwrap_or(&Value::Null),
                );
                if order.ascending {
                    ord
                } else {
                    ord.reverse()
                }
            });
        }
        if let Some(limit) = self.limit {
            selected.truncate(limit);
        }
        selected
    }
}

/// Canonical cache-slot key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    /// Explicit key override for callers that want descriptor-independent sharing.
    pub fn custom(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&QueryDescriptor> for CacheKey {
    fn from(descriptor: &QueryDescriptor) -> Self {
        descriptor.cache_key()
    }
}

fn json_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn json_cmp(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Less,
        (_, Value::Null) => Ordering::Greater,
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        _ => a.to_string().cmp(&b.to_string()),
    }
}
