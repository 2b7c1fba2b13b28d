//! Stateless query engine over in-memory record sets.
//!
//! Queries arrive as JSON maps; keys of the form `field` or
//! `field__op` (`op` one of `ne`, `lt`, `le`, `gt`, `ge`) are filter
//! terms, while `field`, `limit`, `offset`, `order` and `property` are
//! reserved. Application order is always filter, sort, paginate,
//! project.

use std::cmp::Ordering;

use serde_json::{Map, Value};

/// Query keys that are never treated as filters.
pub const RESERVED_KEYS: &[&str] = &["field", "limit", "offset", "order", "property"];

/// A record as stored and queried: a JSON-shaped field map.
pub type Record = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone)]
struct FilterTerm {
    field: String,
    op: Op,
    value: Value,
}

#[derive(Debug, Clone)]
struct SortKey {
    field: String,
    descending: bool,
}

impl SortKey {
    fn parse(entry: &str) -> Self {
        match entry.strip_prefix('-') {
            Some(field) => Self {
                field: field.to_string(),
                descending: true,
            },
            None => Self {
                field: entry.to_string(),
                descending: false,
            },
        }
    }
}

/// A parsed query: filter terms plus ordering, pagination and
/// projection directives.
#[derive(Debug, Clone, Default)]
pub struct Query {
    filters: Vec<FilterTerm>,
    order: Vec<SortKey>,
    offset: Option<usize>,
    limit: Option<usize>,
    fields: Option<Vec<String>>,
}

impl Query {
    pub fn from_map(map: &Map<String, Value>) -> Self {
        let mut query = Self::default();
        for (key, value) in map {
            match key.as_str() {
                "order" => query.order = parse_order(value),
                "offset" => query.offset = value.as_u64().map(|n| n as usize),
                "limit" => query.limit = value.as_u64().map(|n| n as usize),
                "field" => query.fields = parse_fields(value),
                "property" => {}
                _ => query.push_filter(key, value.clone()),
            }
        }
        query
    }

    /// Add one filter term (used to merge a resolved path's
    /// disambiguating filter into a caller query).
    pub fn push_filter(&mut self, key: &str, value: Value) {
        let (field, op) = match key.split_once("__") {
            Some((field, "ne")) => (field, Op::Ne),
            Some((field, "lt")) => (field, Op::Lt),
            Some((field, "le")) => (field, Op::Le),
            Some((field, "gt")) => (field, Op::Gt),
            Some((field, "ge")) => (field, Op::Ge),
            _ => (key, Op::Eq),
        };
        self.filters.push(FilterTerm {
            field: field.to_string(),
            op,
            value: coerce_boolish(value),
        });
    }

    /// Run the full pipeline: filter, sort, paginate, project.
    pub fn apply(&self, records: Vec<Record>) -> Vec<Record> {
        let filtered = self.filter(records);
        let sorted = self.sort(filtered);
        let page = self.paginate(sorted);
        self.project(page)
    }

    pub fn filter(&self, records: Vec<Record>) -> Vec<Record> {
        records
            .into_iter()
            .filter(|record| self.filters.iter().all(|term| term.matches(record)))
            .collect()
    }

    pub fn sort(&self, mut records: Vec<Record>) -> Vec<Record> {
        if self.order.is_empty() {
            return records;
        }
        records.sort_by(|a, b| {
            for key in &self.order {
                let left = a.get(&key.field).unwrap_or(&Value::Null);
                let right = b.get(&key.field).unwrap_or(&Value::Null);
                let ordering = match compare_values(left, right) {
                    Some(o) => o,
                    None => Ordering::Equal,
                };
                let ordering = if key.descending {
                    ordering.reverse()
                } else {
                    ordering
                };
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            Ordering::Equal
        });
        records
    }

    pub fn paginate(&self, records: Vec<Record>) -> Vec<Record> {
        let offset = self.offset.unwrap_or(0);
        if offset >= records.len() {
            return Vec::new();
        }
        let end = match self.limit {
            Some(limit) if offset + limit < records.len() => offset + limit,
            _ => records.len(),
        };
        records[offset..end].to_vec()
    }

    pub fn project(&self, records: Vec<Record>) -> Vec<Record> {
        let Some(fields) = &self.fields else {
            return records;
        };
        records
            .into_iter()
            .map(|record| {
                record
                    .into_iter()
                    .filter(|(key, _)| fields.iter().any(|f| f == key))
                    .collect()
            })
            .collect()
    }
}

impl FilterTerm {
    fn matches(&self, record: &Record) -> bool {
        match self.op {
            Op::Eq => eq_matches(record, &self.field, &self.value),
            Op::Ne => record.get(&self.field) != Some(&self.value),
            Op::Lt => ordered(record, &self.field, &self.value, Ordering::is_lt),
            Op::Le => ordered(record, &self.field, &self.value, Ordering::is_le),
            Op::Gt => ordered(record, &self.field, &self.value, Ordering::is_gt),
            Op::Ge => ordered(record, &self.field, &self.value, Ordering::is_ge),
        }
    }
}

fn ordered(record: &Record, field: &str, value: &Value, accept: fn(Ordering) -> bool) -> bool {
    match record.get(field).and_then(|rv| compare_values(rv, value)) {
        Some(ordering) => accept(ordering),
        None => false,
    }
}

/// Equality with collection semantics: a record-side array is a
/// membership test, a filter-side array is a value set (empty set means
/// no restriction), and the private `_field` back-reference stands in
/// for `field` when present.
fn eq_matches(record: &Record, field: &str, value: &Value) -> bool {
    let private = format!("_{field}");
    let record_value = match record.get(field) {
        Some(v) => Some(v),
        None => record.get(&private),
    };
    if let Value::Array(set) = value {
        if set.is_empty() {
            return true;
        }
        return match record_value {
            Some(Value::Array(items)) => items.iter().any(|item| set.contains(item)),
            Some(scalar) => set.contains(scalar),
            None => false,
        };
    }
    match record_value {
        Some(Value::Array(items)) => items.contains(value),
        Some(scalar) => scalar == value,
        None => false,
    }
}

/// Boolean-like strings coerce to booleans before comparison.
fn coerce_boolish(value: Value) -> Value {
    match &value {
        Value::String(s) if matches!(s.as_str(), "on" | "true" | "yes") => Value::Bool(true),
        Value::String(s) if matches!(s.as_str(), "off" | "false" | "no") => Value::Bool(false),
        _ => value,
    }
}

fn parse_order(value: &Value) -> Vec<SortKey> {
    match value {
        Value::String(s) => vec![SortKey::parse(s)],
        Value::Array(entries) => entries
            .iter()
            .filter_map(|e| e.as_str())
            .map(SortKey::parse)
            .collect(),
        _ => Vec::new(),
    }
}

fn parse_fields(value: &Value) -> Option<Vec<String>> {
    match value {
        Value::String(s) => Some(vec![s.clone()]),
        Value::Array(entries) => Some(
            entries
                .iter()
                .filter_map(|e| e.as_str())
                .map(str::to_string)
                .collect(),
        ),
        _ => None,
    }
}

fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64().partial_cmp(&y.as_f64()),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        _ => None,
    }
}
