//! Queued mutation records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::net::{HttpMethod, HttpRequest};

/// Kind of mutation being replayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationType {
  Create,
  Update,
  Delete,
  BulkCreate,
  BulkUpdate,
  BulkDelete,
}

/// Dequeue priority. Higher runs sooner.
#[derive(
  Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
  Low,
  #[default]
  Normal,
  High,
  Critical,
}

/// How a queued write relates to cached records.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationMetadata {
  /// Store partition the record lives in
  pub entity_type: Option<String>,
  /// Cached id the write applies to (a temporary id for creates)
  pub entity_id: Option<String>,
  /// Cached value before the optimistic write
  pub rollback_data: Option<Value>,
}

/// A mutation waiting for network replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedOperation {
  pub id: String,
  #[serde(rename = "type")]
  pub op_type: OperationType,
  pub endpoint: String,
  pub method: HttpMethod,
  pub payload: Option<Value>,
  pub priority: Priority,
  pub attempts: u32,
  pub max_attempts: u32,
  pub created_at: DateTime<Utc>,
  /// Earliest time the next attempt may run
  pub scheduled_at: DateTime<Utc>,
  pub last_attempt_at: Option<DateTime<Utc>>,
  pub error: Option<String>,
  #[serde(default)]
  pub metadata: OperationMetadata,
}

impl QueuedOperation {
  pub fn is_due(&self, now: DateTime<Utc>) -> bool {
    self.scheduled_at <= now
  }

  pub fn attempts_exhausted(&self) -> bool {
    self.attempts >= self.max_attempts
  }

  /// The request this operation replays.
  pub fn to_request(&self) -> HttpRequest {
    HttpRequest::new(self.method, self.endpoint.clone()).with_body(self.payload.clone())
  }
}

/// Caller-supplied part of a [`QueuedOperation`].
#[derive(Debug, Clone, PartialEq)]
pub struct NewOperation {
  pub op_type: OperationType,
  pub endpoint: String,
  pub method: HttpMethod,
  pub payload: Option<Value>,
  pub priority: Priority,
  /// Falls back to the engine default when `None`
  pub max_attempts: Option<u32>,
  pub metadata: OperationMetadata,
}

impl NewOperation {
  pub fn new(op_type: OperationType, method: HttpMethod, endpoint: impl Into<String>) -> Self {
    Self {
      op_type,
      endpoint: endpoint.into(),
      method,
      payload: None,
      priority: Priority::Normal,
      max_attempts: None,
      metadata: OperationMetadata::default(),
    }
  }

  pub fn payload(mut self, payload: Value) -> Self {
    self.payload = Some(payload);
    self
  }

  pub fn priority(mut self, priority: Priority) -> Self {
    self.priority = priority;
    self
  }

  pub fn max_attempts(mut self, max_attempts: u32) -> Self {
    self.max_attempts = Some(max_attempts);
    self
  }

  pub fn entity(mut self, entity_type: impl Into<String>, entity_id: Option<String>) -> Self {
    self.metadata.entity_type = Some(entity_type.into());
    self.metadata.entity_id = entity_id;
    self
  }

  pub fn rollback(mut self, data: Option<Value>) -> Self {
    self.metadata.rollback_data = data;
    self
  }
}

/// How a conflicting server and local version would be reconciled.
///
/// Only [`ConflictStrategy::LastWriteWins`] is applied: the server response
/// always overwrites the cached entry. The other variants are reserved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
  #[default]
  LastWriteWins,
  ServerWins,
  ClientWins,
  Manual,
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_priority_order() {
    assert!(Priority::Critical > Priority::High);
    assert!(Priority::High > Priority::Normal);
    assert!(Priority::Normal > Priority::Low);
    assert_eq!(Priority::default(), Priority::Normal);
  }

  #[test]
  fn test_serialized_shape() {
    let now = Utc::now();
    let op = QueuedOperation {
      id: "op1".into(),
      op_type: OperationType::BulkCreate,
      endpoint: "/api/drugs/bulk".into(),
      method: HttpMethod::Post,
      payload: Some(json!([{"name": "x"}])),
      priority: Priority::High,
      attempts: 0,
      max_attempts: 3,
      created_at: now,
      scheduled_at: now,
      last_attempt_at: None,
      error: None,
      metadata: OperationMetadata::default(),
    };
    let value = serde_json::to_value(&op).unwrap();
    assert_eq!(value["type"], "BULK_CREATE");
    assert_eq!(value["method"], "POST");
    assert_eq!(value["priority"], "HIGH");

    let back: QueuedOperation = serde_json::from_value(value).unwrap();
    assert_eq!(back, op);
  }

  #[test]
  fn test_to_request_carries_body() {
    let now = Utc::now();
    let op = QueuedOperation {
      id: "op1".into(),
      op_type: OperationType::Update,
      endpoint: "/api/patients/7".into(),
      method: HttpMethod::Put,
      payload: Some(json!({"name": "Ann"})),
      priority: Priority::Normal,
      attempts: 2,
      max_attempts: 2,
      created_at: now,
      scheduled_at: now,
      last_attempt_at: None,
      error: None,
      metadata: OperationMetadata::default(),
    };
    let request = op.to_request();
    assert_eq!(request.method, HttpMethod::Put);
    assert_eq!(request.url, "/api/patients/7");
    assert_eq!(request.body, Some(json!({"name": "Ann"})));
    assert!(op.attempts_exhausted());
  }
}
