//! Response body shapes.
//!
//! Lists come back as `{"data": [...]}`. Older endpoints answer with a bare
//! array or an object holding exactly one array field, so both are accepted.
//! Single records may be wrapped the same way (`{"data": {...}}`).

use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

const TEMP_PREFIX: &str = "temp_";

/// The item list inside a list response, if its shape is recognized.
pub fn extract_list(body: &Value) -> Option<&Vec<Value>> {
  match body {
    Value::Array(items) => {
      debug!("bare array list response");
      Some(items)
    }
    Value::Object(map) => {
      if let Some(Value::Array(items)) = map.get("data") {
        return Some(items);
      }
      let mut arrays = map.iter().filter_map(|(k, v)| v.as_array().map(|a| (k, a)));
      match (arrays.next(), arrays.next()) {
        (Some((field, items)), None) => {
          debug!(field = %field, "list found under non-standard field");
          Some(items)
        }
        _ => None,
      }
    }
    _ => None,
  }
}

/// The record inside a single-record response.
pub fn unwrap_record(body: &Value) -> &Value {
  match body.get("data") {
    Some(inner @ Value::Object(_)) => inner,
    _ => body,
  }
}

/// A string or numeric id as a cache key.
pub fn id_string(value: &Value) -> Option<String> {
  match value {
    Value::String(s) if !s.is_empty() => Some(s.clone()),
    Value::Number(n) => Some(n.to_string()),
    _ => None,
  }
}

/// The `id` field of a record.
pub fn record_id(record: &Value) -> Option<String> {
  record.get("id").and_then(id_string)
}

/// Placeholder id for a record created offline.
pub fn temp_id() -> String {
  format!("{}{}", TEMP_PREFIX, Uuid::new_v4())
}

pub fn is_temp_id(id: &str) -> bool {
  id.starts_with(TEMP_PREFIX)
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_list_shapes() {
    let canonical = json!({"data": [{"id": 1}], "total": 1});
    assert_eq!(extract_list(&canonical).unwrap().len(), 1);

    let bare = json!([{"id": 1}, {"id": 2}]);
    assert_eq!(extract_list(&bare).unwrap().len(), 2);

    let named = json!({"patients": [{"id": 1}], "page": 1});
    assert_eq!(extract_list(&named).unwrap().len(), 1);

    let ambiguous = json!({"patients": [], "drugs": []});
    assert!(extract_list(&ambiguous).is_none());

    assert!(extract_list(&json!({"count": 3})).is_none());
    assert!(extract_list(&json!("nope")).is_none());
  }

  #[test]
  fn test_unwrap_record() {
    let wrapped = json!({"data": {"id": "p1"}});
    assert_eq!(unwrap_record(&wrapped), &json!({"id": "p1"}));

    let plain = json!({"id": "p1", "data": [1, 2]});
    assert_eq!(unwrap_record(&plain), &plain);
  }

  #[test]
  fn test_ids() {
    assert_eq!(record_id(&json!({"id": 42})), Some("42".to_string()));
    assert_eq!(record_id(&json!({"id": "p1"})), Some("p1".to_string()));
    assert_eq!(record_id(&json!({"id": ""})), None);
    assert_eq!(record_id(&json!({"name": "x"})), None);

    let temp = temp_id();
    assert!(is_temp_id(&temp));
    assert_eq!(temp.len(), TEMP_PREFIX.len() + 36);
    assert!(!is_temp_id("p1"));
  }
}
