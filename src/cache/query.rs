//! In-memory filter, sort and pagination over a partition's live entries.

use serde_json::Value;
use std::cmp::Ordering;

use super::entry::CacheEntry;

/// Sort direction for [`Query::sort_by`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortOrder {
  #[default]
  Asc,
  Desc,
}

type EntryFilter = Box<dyn Fn(&CacheEntry) -> bool + Send + Sync>;

/// Query over a single partition.
///
/// Steps run in a fixed order: filter, then sort, then offset/limit.
#[derive(Default)]
pub struct Query {
  filter: Option<EntryFilter>,
  sort_by: Option<String>,
  sort_order: SortOrder,
  offset: usize,
  limit: Option<usize>,
}

impl Query {
  pub fn new() -> Self {
    Self::default()
  }

  /// Keep only entries matching the predicate.
  pub fn filter<F>(mut self, f: F) -> Self
  where
    F: Fn(&CacheEntry) -> bool + Send + Sync + 'static,
  {
    self.filter = Some(Box::new(f));
    self
  }

  /// Sort by a payload field. Dotted paths (`"address.city"`) reach into
  /// nested objects. Entries missing the field, or holding `null`, sort last
  /// in both directions.
  pub fn sort_by(mut self, field: impl Into<String>, order: SortOrder) -> Self {
    self.sort_by = Some(field.into());
    self.sort_order = order;
    self
  }

  pub fn offset(mut self, offset: usize) -> Self {
    self.offset = offset;
    self
  }

  pub fn limit(mut self, limit: usize) -> Self {
    self.limit = Some(limit);
    self
  }

  pub(crate) fn apply(&self, entries: Vec<CacheEntry>) -> QueryResult {
    let mut matched: Vec<CacheEntry> = match &self.filter {
      Some(filter) => entries.into_iter().filter(|e| filter(e)).collect(),
      None => entries,
    };

    if let Some(field) = &self.sort_by {
      let order = self.sort_order;
      matched.sort_by(|a, b| {
        compare_field(lookup(&a.data, field), lookup(&b.data, field), order)
      });
    }

    let total = matched.len();
    let items: Vec<CacheEntry> = match self.limit {
      Some(limit) => matched.into_iter().skip(self.offset).take(limit).collect(),
      None => matched.into_iter().skip(self.offset).collect(),
    };
    let has_more = self
      .limit
      .is_some_and(|limit| self.offset.saturating_add(limit) < total);

    QueryResult {
      items,
      total,
      has_more,
    }
  }
}

/// Page of query results.
#[derive(Debug, Clone)]
pub struct QueryResult<T = Value> {
  pub items: Vec<CacheEntry<T>>,
  /// Number of entries that matched the filter, before pagination
  pub total: usize,
  pub has_more: bool,
}

fn lookup<'a>(data: &'a Value, path: &str) -> Option<&'a Value> {
  let mut current = data;
  for part in path.split('.') {
    current = current.get(part)?;
  }
  match current {
    Value::Null => None,
    v => Some(v),
  }
}

fn compare_field(a: Option<&Value>, b: Option<&Value>, order: SortOrder) -> Ordering {
  match (a, b) {
    (None, None) => Ordering::Equal,
    (None, Some(_)) => Ordering::Greater,
    (Some(_), None) => Ordering::Less,
    (Some(a), Some(b)) => {
      let ord = compare_values(a, b);
      match order {
        SortOrder::Asc => ord,
        SortOrder::Desc => ord.reverse(),
      }
    }
  }
}

fn compare_values(a: &Value, b: &Value) -> Ordering {
  match (a, b) {
    (Value::Number(x), Value::Number(y)) => {
      let x = x.as_f64().unwrap_or(f64::NAN);
      let y = y.as_f64().unwrap_or(f64::NAN);
      x.partial_cmp(&y).unwrap_or(Ordering::Equal)
    }
    (Value::String(x), Value::String(y)) => x.cmp(y),
    (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
    // Mixed types: group by kind so the order is at least stable
    _ => type_rank(a).cmp(&type_rank(b)),
  }
}

fn type_rank(v: &Value) -> u8 {
  match v {
    Value::Bool(_) => 0,
    Value::Number(_) => 1,
    Value::String(_) => 2,
    Value::Array(_) => 3,
    Value::Object(_) => 4,
    Value::Null => 5,
  }
}
