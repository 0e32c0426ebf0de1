//! Capture hooks for HAR assembly.
//!
//! The proxy does not persist anything itself: after the request side of an
//! exchange is final and again after the response has been written, it
//! hands the exchange to a [`CaptureSink`]. The sink owns HAR assembly and
//! persistence; [`ExchangeRecord`] carries the HAR-entry-shaped fields.

use std::io::Read;
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use base64::Engine;
use flate2::read::MultiGzDecoder;

use crate::body::Body;
use crate::exchange::Exchange;

/// Observer of completed exchange phases.
///
/// Both hooks are invoked on the connection worker; implementations should
/// hand off heavy work instead of blocking the exchange.
pub trait CaptureSink: Send + Sync {
  /// Called once per exchange after request interceptors have run, just
  /// before the request is forwarded upstream.
  fn on_request(&self, exchange: &Exchange) {
    let _ = exchange;
  }
  /// Called once per exchange after the response has been written to the
  /// client (or delivery failed), with timing marks and byte counts final.
  fn on_response(&self, exchange: &Exchange) {
    let _ = exchange;
  }
}

/// A sink that drops everything.
#[derive(Debug, Default)]
pub struct NoopSink;

impl CaptureSink for NoopSink {}

/// A recorded body, decoded for capture.
///
/// Gzip-encoded bodies are decompressed; bodies that are not valid UTF-8
/// are carried base64-encoded, as HAR does.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RecordedBody {
  /// body text, possibly base64-encoded
  pub text: String,
  /// whether `text` is base64-encoded raw bytes
  pub base64: bool,
}

impl RecordedBody {
  fn from_body(body: &Body, headers: &http::HeaderMap) -> Self {
    let gzipped = headers
      .get(http::header::CONTENT_ENCODING)
      .and_then(|ce| ce.to_str().ok())
      .map(|ce| ce.eq_ignore_ascii_case("gzip"))
      .unwrap_or(false);
    let bytes = if gzipped {
      let mut decoded = Vec::new();
      let mut decoder = MultiGzDecoder::new(body.as_ref());
      match decoder.read_to_end(&mut decoded) {
        Ok(_) => decoded,
        Err(_) => body.to_vec(),
      }
    } else {
      body.to_vec()
    };
    match String::from_utf8(bytes) {
      Ok(text) => RecordedBody {
        text,
        base64: false,
      },
      Err(err) => RecordedBody {
        text: base64::engine::general_purpose::STANDARD.encode(err.as_bytes()),
        base64: true,
      },
    }
  }
}

/// HAR-entry-shaped record of one exchange.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ExchangeRecord {
  /// request method
  pub method: String,
  /// absolute request URL
  pub url: String,
  /// request headers, in order
  #[cfg_attr(feature = "serde", serde(with = "http_serde::header_map"))]
  pub request_headers: http::HeaderMap,
  /// request body, if any
  pub request_body: Option<RecordedBody>,
  /// response status, when the upstream call completed
  pub status: Option<u16>,
  /// response reason phrase as delivered
  pub reason: Option<String>,
  /// response headers, in order
  #[cfg_attr(feature = "serde", serde(with = "http_serde::header_map"))]
  pub response_headers: http::HeaderMap,
  /// response body, if any
  pub response_body: Option<RecordedBody>,
  /// wall-clock start of the exchange
  pub started_at: SystemTime,
  /// time until the client request was fully received
  pub request_time: Option<Duration>,
  /// time until the upstream response was fully received
  pub response_time: Option<Duration>,
  /// time until the response was written back to the client
  pub total_time: Option<Duration>,
  /// body bytes copied to the client
  pub bytes_copied: u64,
}

impl From<&Exchange> for ExchangeRecord {
  fn from(exchange: &Exchange) -> Self {
    let request = exchange.request();
    let response = exchange.response();
    ExchangeRecord {
      method: request.method().to_string(),
      url: request.uri().to_string(),
      request_headers: request.headers().clone(),
      request_body: request
        .body()
        .map(|b| RecordedBody::from_body(b, request.headers())),
      status: response.map(|r| r.status_code().as_u16()),
      reason: response.map(|r| {
        r.reason()
          .or_else(|| r.status_code().canonical_reason())
          .unwrap_or_default()
          .to_string()
      }),
      response_headers: response.map(|r| r.headers().clone()).unwrap_or_default(),
      response_body: response
        .and_then(|r| r.body().map(|b| RecordedBody::from_body(b, r.headers()))),
      started_at: exchange.timings().started_at(),
      request_time: exchange.timings().request_received(),
      response_time: exchange.timings().response_received(),
      total_time: exchange.timings().completed(),
      bytes_copied: exchange.bytes_copied(),
    }
  }
}

/// A sink that accumulates records in memory, for tests and small runs.
#[derive(Default)]
pub struct MemorySink {
  records: Mutex<Vec<ExchangeRecord>>,
}

impl MemorySink {
  /// Create an empty sink.
  pub fn new() -> Self {
    Self::default()
  }

  /// Snapshot of all records captured so far.
  pub fn records(&self) -> Vec<ExchangeRecord> {
    self.records.lock().expect("capture lock poisoned").clone()
  }
}

impl CaptureSink for MemorySink {
  fn on_response(&self, exchange: &Exchange) {
    let record = ExchangeRecord::from(exchange);
    self.records.lock().expect("capture lock poisoned").push(record);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{Request, Response};
  use std::io::Write;

  #[test]
  fn test_record_from_completed_exchange() {
    let request: Request = Request::builder()
      .method("POST")
      .uri("http://example.com/anyUrl")
      .header("C", "C")
      .body(bytes::Bytes::from_static(b"ping"))
      .unwrap()
      .into();
    let mut exchange = Exchange::new(request, None);
    exchange.mark_request_received();
    let response: Response = Response::builder()
      .status(200)
      .header(http::header::CONTENT_TYPE, "text/plain")
      .body("server-backend")
      .unwrap()
      .into();
    exchange.set_response(response);
    exchange.mark_response_received();
    exchange.mark_completed(14);

    let record = ExchangeRecord::from(&exchange);
    assert_eq!(record.method, "POST");
    assert_eq!(record.url, "http://example.com/anyUrl");
    assert_eq!(record.status, Some(200));
    assert_eq!(record.reason.as_deref(), Some("OK"));
    assert_eq!(record.request_body.as_ref().unwrap().text, "ping");
    assert_eq!(record.response_body.as_ref().unwrap().text, "server-backend");
    assert_eq!(record.bytes_copied, 14);
    assert!(record.total_time.is_some());
  }

  #[test]
  fn test_gzip_body_is_decoded_for_capture() {
    let mut encoder =
      flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(b"compressed payload").unwrap();
    let gzipped = encoder.finish().unwrap();

    let mut headers = http::HeaderMap::new();
    headers.insert(
      http::header::CONTENT_ENCODING,
      http::HeaderValue::from_static("gzip"),
    );
    let recorded = RecordedBody::from_body(&Body::from(gzipped), &headers);
    assert!(!recorded.base64);
    assert_eq!(recorded.text, "compressed payload");
  }

  #[test]
  fn test_binary_body_is_base64_encoded() {
    let recorded = RecordedBody::from_body(
      &Body::from(vec![0xff, 0xfe, 0x00, 0x01]),
      &http::HeaderMap::new(),
    );
    assert!(recorded.base64);
    assert_eq!(
      base64::engine::general_purpose::STANDARD
        .decode(&recorded.text)
        .unwrap(),
      vec![0xff, 0xfe, 0x00, 0x01]
    );
  }

  #[test]
  fn test_memory_sink_collects_records() {
    let sink = MemorySink::new();
    let request: Request = Request::builder()
      .uri("http://example.com/")
      .body(bytes::Bytes::new())
      .unwrap()
      .into();
    let exchange = Exchange::new(request, None);
    sink.on_response(&exchange);
    let records = sink.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, None);
  }
}
