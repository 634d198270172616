//! Network seam between the engine and the backend.

mod transport;

pub use transport::{
  send_with_timeout, HttpMethod, HttpRequest, HttpResponse, HttpTransport, ReqwestTransport,
  TransportError, DEFAULT_TIMEOUT,
};

/// Whether a failed response is worth retrying: server errors and throttling.
pub fn is_recoverable_status(status: u16) -> bool {
  status >= 500 || status == 429
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_recoverable_statuses() {
    assert!(is_recoverable_status(500));
    assert!(is_recoverable_status(503));
    assert!(is_recoverable_status(429));
    assert!(!is_recoverable_status(400));
    assert!(!is_recoverable_status(404));
    assert!(!is_recoverable_status(409));
  }
}
