//! HTTP transport abstraction.
//!
//! Provides a trait-based transport layer that enables:
//! - Real HTTP requests through reqwest for production
//! - Scripted transports for unit testing

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use url::Url;

/// Default per-request timeout when a caller does not set one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Error type for transport operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
  /// Connection refused, DNS failure, reset, ...
  #[error("network error: {0}")]
  Network(String),

  #[error("request timed out after {0:?}")]
  Timeout(Duration),

  #[error("invalid url: {0}")]
  InvalidUrl(String),
}

/// HTTP verb of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
  Get,
  Post,
  Put,
  Patch,
  Delete,
}

impl HttpMethod {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::Get => "GET",
      Self::Post => "POST",
      Self::Put => "PUT",
      Self::Patch => "PATCH",
      Self::Delete => "DELETE",
    }
  }
}

/// An outgoing request.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
  pub method: HttpMethod,
  /// Absolute URL, or a path resolved against the transport's base URL
  pub url: String,
  /// Sent as JSON for every method except GET
  pub body: Option<Value>,
  pub headers: Vec<(String, String)>,
  pub timeout: Duration,
}

impl HttpRequest {
  pub fn new(method: HttpMethod, url: impl Into<String>) -> Self {
    Self {
      method,
      url: url.into(),
      body: None,
      headers: Vec::new(),
      timeout: DEFAULT_TIMEOUT,
    }
  }

  pub fn get(url: impl Into<String>) -> Self {
    Self::new(HttpMethod::Get, url)
  }

  pub fn with_body(mut self, body: Option<Value>) -> Self {
    self.body = body;
    self
  }

  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.push((name.into(), value.into()));
    self
  }

  pub fn with_timeout(mut self, timeout: Duration) -> Self {
    self.timeout = timeout;
    self
  }
}

/// A response with its body decoded as JSON.
///
/// An empty body decodes to `Value::Null`; a non-JSON body to a string.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
  pub status: u16,
  pub body: Value,
}

impl HttpResponse {
  pub fn new(status: u16, body: Value) -> Self {
    Self { status, body }
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }
}

/// Anything that can carry an [`HttpRequest`] to the backend.
pub trait HttpTransport: Send + Sync {
  fn send(&self, request: HttpRequest) -> BoxFuture<'_, Result<HttpResponse, TransportError>>;
}

/// Send a request, bounding it by the request's own timeout.
pub async fn send_with_timeout(
  transport: &dyn HttpTransport,
  request: HttpRequest,
) -> Result<HttpResponse, TransportError> {
  let timeout = request.timeout;
  match tokio::time::timeout(timeout, transport.send(request)).await {
    Ok(result) => result,
    Err(_) => Err(TransportError::Timeout(timeout)),
  }
}

/// Transport backed by a shared reqwest client.
#[derive(Clone)]
pub struct ReqwestTransport {
  client: reqwest::Client,
  base_url: Option<Url>,
}

impl ReqwestTransport {
  pub fn new(base_url: Option<&str>) -> Result<Self, TransportError> {
    let base_url = base_url
      .map(|u| Url::parse(u).map_err(|e| TransportError::InvalidUrl(format!("{}: {}", u, e))))
      .transpose()?;
    let client = reqwest::Client::builder()
      .build()
      .map_err(|e| TransportError::Network(e.to_string()))?;
    Ok(Self { client, base_url })
  }

  fn resolve(&self, url: &str) -> Result<Url, TransportError> {
    match Url::parse(url) {
      Ok(absolute) => Ok(absolute),
      Err(url::ParseError::RelativeUrlWithoutBase) => match &self.base_url {
        Some(base) => base
          .join(url)
          .map_err(|e| TransportError::InvalidUrl(format!("{}: {}", url, e))),
        None => Err(TransportError::InvalidUrl(format!(
          "{}: relative url with no base configured",
          url
        ))),
      },
      Err(e) => Err(TransportError::InvalidUrl(format!("{}: {}", url, e))),
    }
  }

  async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
    let url = self.resolve(&request.url)?;
    let method = match request.method {
      HttpMethod::Get => reqwest::Method::GET,
      HttpMethod::Post => reqwest::Method::POST,
      HttpMethod::Put => reqwest::Method::PUT,
      HttpMethod::Patch => reqwest::Method::PATCH,
      HttpMethod::Delete => reqwest::Method::DELETE,
    };

    let mut builder = self
      .client
      .request(method, url)
      .timeout(request.timeout)
      .header(reqwest::header::ACCEPT, "application/json");
    for (name, value) in &request.headers {
      builder = builder.header(name.as_str(), value.as_str());
    }
    if request.method != HttpMethod::Get {
      if let Some(body) = &request.body {
        builder = builder.json(body);
      }
    }

    let response = builder.send().await.map_err(|e| map_error(e, request.timeout))?;
    let status = response.status().as_u16();
    let text = response
      .text()
      .await
      .map_err(|e| map_error(e, request.timeout))?;

    Ok(HttpResponse {
      status,
      body: decode_body(&text),
    })
  }
}

impl HttpTransport for ReqwestTransport {
  fn send(&self, request: HttpRequest) -> BoxFuture<'_, Result<HttpResponse, TransportError>> {
    Box::pin(self.execute(request))
  }
}

fn map_error(e: reqwest::Error, timeout: Duration) -> TransportError {
  if e.is_timeout() {
    TransportError::Timeout(timeout)
  } else {
    TransportError::Network(e.to_string())
  }
}

fn decode_body(text: &str) -> Value {
  if text.trim().is_empty() {
    return Value::Null;
  }
  serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_decode_body_variants() {
    assert_eq!(decode_body(""), Value::Null);
    assert_eq!(decode_body("  \n"), Value::Null);
    assert_eq!(decode_body(r#"{"id": 7}"#), json!({"id": 7}));
    assert_eq!(decode_body("OK"), json!("OK"));
  }

  #[test]
  fn test_resolve_relative_against_base() {
    let transport = ReqwestTransport::new(Some("https://records.example.org/")).unwrap();
    let url = transport.resolve("/api/patients/3").unwrap();
    assert_eq!(url.as_str(), "https://records.example.org/api/patients/3");

    let absolute = transport.resolve("http://other.example.org/x").unwrap();
    assert_eq!(absolute.host_str(), Some("other.example.org"));
  }

  #[test]
  fn test_resolve_relative_without_base_fails() {
    let transport = ReqwestTransport::new(None).unwrap();
    assert!(matches!(
      transport.resolve("/api/patients"),
      Err(TransportError::InvalidUrl(_))
    ));
  }

  #[test]
  fn test_success_range() {
    assert!(HttpResponse::new(204, Value::Null).is_success());
    assert!(!HttpResponse::new(304, Value::Null).is_success());
    assert!(!HttpResponse::new(503, Value::Null).is_success());
  }

  #[tokio::test(start_paused = true)]
  async fn test_send_with_timeout_bounds_slow_transport() {
    struct Stall;
    impl HttpTransport for Stall {
      fn send(&self, _request: HttpRequest) -> BoxFuture<'_, Result<HttpResponse, TransportError>> {
        Box::pin(async {
          tokio::time::sleep(Duration::from_secs(60)).await;
          Ok(HttpResponse::new(200, Value::Null))
        })
      }
    }

    let request = HttpRequest::get("/slow").with_timeout(Duration::from_secs(5));
    let err = send_with_timeout(&Stall, request).await.unwrap_err();
    assert!(matches!(err, TransportError::Timeout(d) if d == Duration::from_secs(5)));
  }
}
