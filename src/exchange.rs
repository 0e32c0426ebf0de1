//! Per-transaction exchange state handed to interceptors.

use std::net::SocketAddr;
use std::time::{Duration, Instant, SystemTime};

use crate::{Request, Response};

/// Timing marks collected over the lifetime of one exchange.
///
/// Durations are measured from the moment the exchange was created (the
/// request head had been read off the client socket).
#[derive(Debug, Clone)]
pub struct Timings {
  started_at: SystemTime,
  origin: Instant,
  /// set once the request (head and body) is fully received
  request_received: Option<Duration>,
  /// set once the upstream response is fully received
  response_received: Option<Duration>,
  /// set once the response has been written back to the client
  completed: Option<Duration>,
}

impl Timings {
  fn new() -> Self {
    Timings {
      started_at: SystemTime::now(),
      origin: Instant::now(),
      request_received: None,
      response_received: None,
      completed: None,
    }
  }

  /// Wall-clock time at which the exchange started.
  pub fn started_at(&self) -> SystemTime {
    self.started_at
  }
  /// Time from start until the client request was fully received.
  pub fn request_received(&self) -> Option<Duration> {
    self.request_received
  }
  /// Time from start until the upstream response was fully received.
  pub fn response_received(&self) -> Option<Duration> {
    self.response_received
  }
  /// Time from start until the response was written to the client.
  pub fn completed(&self) -> Option<Duration> {
    self.completed
  }
}

/// One intercepted HTTP transaction.
///
/// Holds the client request, the chosen target, and — after forwarding —
/// the upstream response. The exchange lives for the duration of one HTTP
/// transaction and is exclusively owned by the connection worker handling
/// it; interceptors receive a mutable borrow and may rewrite either side
/// through the accessors here. Mutation across the interceptor chain is
/// last-writer-wins by design: no conflict detection is performed.
#[derive(Debug)]
pub struct Exchange {
  client_addr: Option<SocketAddr>,
  request: Request,
  response: Option<Response>,
  timings: Timings,
  bytes_copied: u64,
}

impl Exchange {
  /// Create an exchange for a freshly parsed client request.
  pub fn new(request: Request, client_addr: Option<SocketAddr>) -> Self {
    Exchange {
      client_addr,
      request,
      response: None,
      timings: Timings::new(),
      bytes_copied: 0,
    }
  }

  /// Address of the client that initiated this exchange.
  pub fn client_addr(&self) -> Option<SocketAddr> {
    self.client_addr
  }

  /// The request as it currently stands.
  pub fn request(&self) -> &Request {
    &self.request
  }

  /// Mutable access to the request, for request interceptors.
  pub fn request_mut(&mut self) -> &mut Request {
    &mut self.request
  }

  /// The upstream response.
  ///
  /// `None` until the forwarding engine completes the upstream call — an
  /// interceptor reading response state before that point observes
  /// "not yet available" rather than stale data.
  pub fn response(&self) -> Option<&Response> {
    self.response.as_ref()
  }

  /// Mutable access to the response, for response interceptors.
  pub fn response_mut(&mut self) -> Option<&mut Response> {
    self.response.as_mut()
  }

  pub(crate) fn set_response(&mut self, response: Response) {
    self.response = Some(response);
  }

  /// Timing marks for this exchange.
  pub fn timings(&self) -> &Timings {
    &self.timings
  }

  /// Body bytes copied to the client, recorded after the write completes.
  pub fn bytes_copied(&self) -> u64 {
    self.bytes_copied
  }

  pub(crate) fn mark_request_received(&mut self) {
    self.timings.request_received = Some(self.timings.origin.elapsed());
  }

  pub(crate) fn mark_response_received(&mut self) {
    self.timings.response_received = Some(self.timings.origin.elapsed());
  }

  pub(crate) fn mark_completed(&mut self, bytes_copied: u64) {
    self.bytes_copied = bytes_copied;
    self.timings.completed = Some(self.timings.origin.elapsed());
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn exchange() -> Exchange {
    let request: Request = Request::builder()
      .uri("http://example.com/")
      .body(bytes::Bytes::new())
      .unwrap()
      .into();
    Exchange::new(request, None)
  }

  #[test]
  fn test_response_unset_until_forwarded() {
    let mut exchange = exchange();
    assert!(exchange.response().is_none());
    assert!(exchange.response_mut().is_none());
    exchange.set_response(Response::default());
    assert!(exchange.response().is_some());
  }

  #[test]
  fn test_timing_marks_accumulate() {
    let mut exchange = exchange();
    assert!(exchange.timings().request_received().is_none());
    exchange.mark_request_received();
    exchange.mark_response_received();
    exchange.mark_completed(42);
    assert!(exchange.timings().request_received().is_some());
    assert!(exchange.timings().response_received().is_some());
    assert!(exchange.timings().completed().is_some());
    assert_eq!(exchange.bytes_copied(), 42);
  }
}
