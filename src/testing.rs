//! Shared helpers for unit tests.

use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::net::{HttpMethod, HttpRequest, HttpResponse, HttpTransport, TransportError};

#[derive(Debug, Clone)]
pub enum MockReply {
  Status(u16, Value),
  Fail(TransportError),
}

/// Scripted transport.
///
/// Replies are queued per (method, url); the last queued reply for a route
/// keeps answering once the others are used up. Unknown routes fail with a
/// network error.
#[derive(Default)]
pub struct MockTransport {
  routes: Mutex<HashMap<(HttpMethod, String), VecDeque<MockReply>>>,
  calls: Mutex<Vec<HttpRequest>>,
  latency: Mutex<Duration>,
  unreachable: AtomicBool,
}

impl MockTransport {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn reply(&self, method: HttpMethod, url: &str, status: u16, body: Value) -> &Self {
    self.push(method, url, MockReply::Status(status, body))
  }

  pub fn fail(&self, method: HttpMethod, url: &str, err: TransportError) -> &Self {
    self.push(method, url, MockReply::Fail(err))
  }

  fn push(&self, method: HttpMethod, url: &str, reply: MockReply) -> &Self {
    self
      .routes
      .lock()
      .unwrap()
      .entry((method, url.to_string()))
      .or_default()
      .push_back(reply);
    self
  }

  /// Replace every reply for a route.
  pub fn reset_route(&self, method: HttpMethod, url: &str) {
    self.routes.lock().unwrap().remove(&(method, url.to_string()));
  }

  pub fn set_latency(&self, latency: Duration) {
    *self.latency.lock().unwrap() = latency;
  }

  /// Make every request fail as if the network were down.
  pub fn set_unreachable(&self, unreachable: bool) {
    self.unreachable.store(unreachable, Ordering::SeqCst);
  }

  pub fn calls(&self) -> Vec<HttpRequest> {
    self.calls.lock().unwrap().clone()
  }

  pub fn calls_to(&self, method: HttpMethod, url: &str) -> usize {
    self
      .calls
      .lock()
      .unwrap()
      .iter()
      .filter(|r| r.method == method && r.url == url)
      .count()
  }

  fn next_reply(&self, request: &HttpRequest) -> MockReply {
    if self.unreachable.load(Ordering::SeqCst) {
      return MockReply::Fail(TransportError::Network("unreachable".into()));
    }
    let mut routes = self.routes.lock().unwrap();
    match routes.get_mut(&(request.method, request.url.clone())) {
      Some(queue) if queue.len() > 1 => queue.pop_front().unwrap(),
      Some(queue) if queue.len() == 1 => queue[0].clone(),
      _ => MockReply::Fail(TransportError::Network(format!(
        "no route for {} {}",
        request.method.as_str(),
        request.url
      ))),
    }
  }
}

impl HttpTransport for MockTransport {
  fn send(&self, request: HttpRequest) -> BoxFuture<'_, Result<HttpResponse, TransportError>> {
    self.calls.lock().unwrap().push(request.clone());
    let reply = self.next_reply(&request);
    let latency = *self.latency.lock().unwrap();
    Box::pin(async move {
      if !latency.is_zero() {
        tokio::time::sleep(latency).await;
      }
      match reply {
        MockReply::Status(status, body) => Ok(HttpResponse::new(status, body)),
        MockReply::Fail(err) => Err(err),
      }
    })
  }
}
