//! The forwarding engine: executes the upstream call for an exchange and
//! writes the (possibly altered) response back to the client.

use std::time::Duration;

use bytes::Bytes;
use http::header::{HeaderName, HeaderValue};
use http::{Method, StatusCode};
use tokio::io::{AsyncWrite, AsyncWriteExt, BufReader};

use crate::connector::Connector;
use crate::errors::{Error, Result};
use crate::exchange::Exchange;
use crate::request::Request;
use crate::response::{Response, ResponseReadConfig, ResponseReader};

/// Leg-by-leg headers that must never be forwarded across the proxy.
const HOP_BY_HOP_HEADERS: [&str; 7] = [
  "proxy-connection",
  "connection",
  "keep-alive",
  "transfer-encoding",
  "te",
  "trailer",
  "upgrade",
];

/// Proxy authentication headers, forwarded only in chained-proxy mode.
const PROXY_AUTH_HEADERS: [&str; 2] = ["proxy-authorization", "proxy-authenticate"];

/// Validators stripped from every proxied response so clients do not cache
/// intercepted content.
const STRIPPED_RESPONSE_HEADERS: [HeaderName; 4] = [
  http::header::DATE,
  http::header::SERVER,
  http::header::ETAG,
  http::header::LAST_MODIFIED,
];

const VIA_VALUE: &str = "1.1 periscope";

/// Executes upstream HTTP calls with proxy header hygiene.
pub(crate) struct ForwardingEngine {
  connector: Connector,
  anonymous: bool,
  control_referer_marker: Option<String>,
  read_timeout: Option<Duration>,
}

impl ForwardingEngine {
  pub(crate) fn new(
    connector: Connector,
    anonymous: bool,
    control_referer_marker: Option<String>,
    read_timeout: Option<Duration>,
  ) -> Self {
    Self {
      connector,
      anonymous,
      control_referer_marker,
      read_timeout,
    }
  }

  pub(crate) fn connector(&self) -> &Connector {
    &self.connector
  }

  /// Build the request that actually goes upstream: the exchange's request
  /// with hop-by-hop and proxy-reserved headers removed and proxy
  /// identification headers added.
  pub(crate) fn build_upstream_request(&self, exchange: &Exchange) -> Request {
    let source = exchange.request();
    let mut upstream = source.clone();
    let headers = upstream.headers_mut();

    // headers named by the Connection header are leg-by-leg as well
    let connection_tokens: Vec<String> = source
      .headers()
      .get(http::header::CONNECTION)
      .and_then(|v| v.to_str().ok())
      .map(|v| v.split(',').map(|t| t.trim().to_ascii_lowercase()).collect())
      .unwrap_or_default();

    let chained = self.connector.is_chained();
    let marker = self.control_referer_marker.as_deref();
    let drop_header = |name: &HeaderName, value: &HeaderValue| -> bool {
      let name = name.as_str();
      if HOP_BY_HOP_HEADERS.contains(&name) {
        return true;
      }
      if !chained && PROXY_AUTH_HEADERS.contains(&name) {
        return true;
      }
      if connection_tokens.iter().any(|t| t == name) {
        return true;
      }
      // never leak a referer that points back at the proxy's own control
      // endpoints, it would loop traffic through the proxy again
      if name == "referer" {
        if let (Some(marker), Ok(value)) = (marker, value.to_str()) {
          if value.contains(marker) {
            return true;
          }
        }
      }
      false
    };

    let names: Vec<HeaderName> = headers.keys().cloned().collect();
    for name in names {
      if let Some(value) = headers.get(&name).cloned() {
        if drop_header(&name, &value) {
          headers.remove(&name);
        }
      }
    }

    if !self.anonymous {
      headers.insert(
        http::header::VIA,
        HeaderValue::from_static(VIA_VALUE),
      );
    }
    if !headers.contains_key("x-forwarded-for") {
      if let Some(addr) = exchange.client_addr() {
        if let Ok(value) = HeaderValue::from_str(&addr.ip().to_string()) {
          headers.insert(HeaderName::from_static("x-forwarded-for"), value);
        }
      }
    }
    upstream
  }

  /// Perform the upstream call for the exchange.
  ///
  /// On success the exchange's response is set (with caching validators
  /// already stripped) and the response-received timing mark recorded.
  /// Nothing has been written to the client yet when this returns, so any
  /// error here can still be converted into a proxy error response.
  pub(crate) async fn call_upstream(&self, exchange: &mut Exchange) -> Result<()> {
    let target = exchange.request().uri().clone();
    match target.scheme_str() {
      Some("http") | Some("https") => {}
      _ => {
        return Err(Error::forbidden(format!(
          "scheme not proxied: {}",
          target
        )))
      }
    }
    let upstream_request = self.build_upstream_request(exchange);
    let mut socket = self.connector.connect(&target).await?;

    // absolute-form only on the plaintext leg of a chained proxy; a CONNECT
    // tunnel through the chain carries origin-form like a direct connection
    let absolute_form =
      self.connector.is_chained() && target.scheme() == Some(&http::uri::Scheme::HTTP);
    let raw: Bytes = upstream_request.to_raw(absolute_form);
    socket.write_all(&raw).await?;
    socket.flush().await?;

    let mut reader = BufReader::new(socket);
    let config = ResponseReadConfig {
      method: upstream_request.method().clone(),
      read_timeout: self.read_timeout,
    };
    let mut response = ResponseReader::new(&mut reader, config).read().await?;

    strip_response_headers(&mut response, self.connector.is_chained());
    exchange.set_response(response);
    exchange.mark_response_received();
    Ok(())
  }

  /// Write the final response to the client.
  ///
  /// Framing headers are normalized to the buffered body before writing:
  /// identity transfer with an exact `Content-Length`, chunked encoding
  /// having been decoded on the way in. Returns the number of body bytes
  /// copied. An error here means the response may be partially committed;
  /// the caller must tear the connection down rather than attempt another
  /// response.
  pub(crate) async fn write_response<W>(
    &self,
    client: &mut W,
    response: &Response,
    request_method: &Method,
  ) -> Result<u64>
  where
    W: AsyncWrite + Unpin,
  {
    let mut finalized = response.clone();
    normalize_framing(&mut finalized, request_method);
    let bytes_copied = finalized.body().map(|b| b.len() as u64).unwrap_or(0);
    client.write_all(&finalized.to_raw()).await?;
    client.flush().await?;
    Ok(bytes_copied)
  }
}

/// Strip hop-by-hop headers, proxy auth (unless chained) and the caching
/// validators from an upstream response before interceptors see it.
pub(crate) fn strip_response_headers(response: &mut Response, chained: bool) {
  let headers = response.headers_mut();
  for name in HOP_BY_HOP_HEADERS {
    headers.remove(name);
  }
  if !chained {
    for name in PROXY_AUTH_HEADERS {
      headers.remove(name);
    }
  }
  for name in STRIPPED_RESPONSE_HEADERS {
    headers.remove(name);
  }
}

/// Fix `Content-Length` and drop `Transfer-Encoding` so the serialized
/// response matches its buffered body.
fn normalize_framing(response: &mut Response, request_method: &Method) {
  let status = response.status_code();
  let body_len = response.body().map(|b| b.len()).unwrap_or(0);
  let headers = response.headers_mut();
  headers.remove(http::header::TRANSFER_ENCODING);
  if body_len > 0 {
    headers.insert(http::header::CONTENT_LENGTH, HeaderValue::from(body_len));
  } else if request_method != Method::HEAD
    && !(status.is_informational()
      || status == StatusCode::NO_CONTENT
      || status == StatusCode::NOT_MODIFIED)
  {
    headers.insert(http::header::CONTENT_LENGTH, HeaderValue::from(0));
  }
}

/// Map a proxying failure to the best-effort error response delivered to
/// the client. Each failure class gets a distinct, human-readable body.
pub(crate) fn error_response(error: &Error) -> Response {
  let (status, reason, title, detail) = match error {
    Error::HostResolution { host, .. } => (
      StatusCode::BAD_REQUEST,
      format!("Host {} not found", host),
      "Server not found",
      format!("The proxy can't find the server at {}. Check the address for typing errors and your network connection.", host),
    ),
    Error::UpstreamConnect { addr, .. } => (
      StatusCode::BAD_REQUEST,
      format!("Couldn't connect to {}", addr),
      "Unable to connect",
      format!("The proxy can't establish a connection to the server at {}. The site could be temporarily unavailable or not listening.", addr),
    ),
    Error::UpstreamTls { host, .. } => (
      StatusCode::INTERNAL_SERVER_ERROR,
      "Upstream TLS handshake failed".to_string(),
      "Secure connection failed",
      format!("The proxy couldn't establish a TLS session with {}. If the server uses a self-signed certificate, enable the trust-upstream-certificates override.", host),
    ),
    Error::Forbidden(detail) => (
      StatusCode::FORBIDDEN,
      "Forbidden for Proxy".to_string(),
      "Forbidden for Proxy",
      detail.clone(),
    ),
    Error::ProtocolViolation(detail) => (
      StatusCode::BAD_REQUEST,
      "Bad Request".to_string(),
      "Malformed request",
      detail.clone(),
    ),
    _ => (
      StatusCode::INTERNAL_SERVER_ERROR,
      "Proxy Error".to_string(),
      "Proxy error",
      error.to_string(),
    ),
  };
  let body = format!(
    "<html><head><title>Problem loading page</title></head><body><h1>{}</h1><p>{}</p></body></html>",
    title, detail
  );
  let mut response: Response = Response::builder()
    .status(status)
    .header(http::header::CONTENT_TYPE, "text/html")
    .header(http::header::CONTENT_LENGTH, body.len())
    .header(http::header::CONNECTION, "close")
    .body(body)
    .expect("static error response")
    .into();
  response.set_reason(reason);
  response
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::net::{IpAddr, Ipv4Addr, SocketAddr};

  fn engine(anonymous: bool, chained: bool, marker: Option<&str>) -> ForwardingEngine {
    let mut builder = Connector::builder();
    if chained {
      builder = builder.upstream_proxy(Some("http://127.0.0.1:3128".parse().unwrap()));
    }
    ForwardingEngine::new(
      builder.build(),
      anonymous,
      marker.map(|m| m.to_string()),
      None,
    )
  }

  fn exchange_with_headers(headers: &[(&str, &str)]) -> Exchange {
    let mut builder = Request::builder().method("GET").uri("http://example.com/");
    for (k, v) in headers {
      builder = builder.header(*k, *v);
    }
    let request: Request = builder.body(bytes::Bytes::new()).unwrap().into();
    Exchange::new(
      request,
      Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 1, 2, 3)), 4444)),
    )
  }

  #[test]
  fn test_hop_by_hop_headers_are_dropped() {
    let engine = engine(false, false, None);
    let exchange = exchange_with_headers(&[
      ("Proxy-Connection", "keep-alive"),
      ("Connection", "keep-alive"),
      ("Keep-Alive", "timeout=5"),
      ("Transfer-Encoding", "chunked"),
      ("TE", "trailers"),
      ("Trailer", "Expires"),
      ("Upgrade", "h2c"),
      ("Accept", "*/*"),
    ]);
    let upstream = engine.build_upstream_request(&exchange);
    for name in HOP_BY_HOP_HEADERS {
      assert!(!upstream.headers().contains_key(name), "{name} survived");
    }
    assert_eq!(upstream.headers().get("accept").unwrap(), "*/*");
  }

  #[test]
  fn test_connection_named_headers_are_dropped() {
    let engine = engine(false, false, None);
    let exchange = exchange_with_headers(&[
      ("Connection", "X-Drop-Me"),
      ("X-Drop-Me", "secret"),
      ("X-Keep-Me", "ok"),
    ]);
    let upstream = engine.build_upstream_request(&exchange);
    assert!(!upstream.headers().contains_key("x-drop-me"));
    assert!(upstream.headers().contains_key("x-keep-me"));
  }

  #[test]
  fn test_proxy_auth_dropped_unless_chained() {
    let exchange = exchange_with_headers(&[("Proxy-Authorization", "Basic Zm9v")]);
    let direct = engine(false, false, None).build_upstream_request(&exchange);
    assert!(!direct.headers().contains_key("proxy-authorization"));
    let chained = engine(false, true, None).build_upstream_request(&exchange);
    assert!(chained.headers().contains_key("proxy-authorization"));
  }

  #[test]
  fn test_via_and_x_forwarded_for_added() {
    let engine = engine(false, false, None);
    let exchange = exchange_with_headers(&[]);
    let upstream = engine.build_upstream_request(&exchange);
    assert_eq!(upstream.headers().get("via").unwrap(), VIA_VALUE);
    assert_eq!(upstream.headers().get("x-forwarded-for").unwrap(), "10.1.2.3");
  }

  #[test]
  fn test_anonymous_mode_suppresses_via() {
    let engine = engine(true, false, None);
    let exchange = exchange_with_headers(&[]);
    let upstream = engine.build_upstream_request(&exchange);
    assert!(!upstream.headers().contains_key("via"));
  }

  #[test]
  fn test_existing_x_forwarded_for_is_kept() {
    let engine = engine(false, false, None);
    let exchange = exchange_with_headers(&[("X-Forwarded-For", "192.0.2.7")]);
    let upstream = engine.build_upstream_request(&exchange);
    assert_eq!(upstream.headers().get("x-forwarded-for").unwrap(), "192.0.2.7");
  }

  #[test]
  fn test_control_referer_is_stripped() {
    let engine = engine(false, false, Some("/periscope-control/"));
    let exchange = exchange_with_headers(&[(
      "Referer",
      "http://proxy.local/periscope-control/dashboard",
    )]);
    let upstream = engine.build_upstream_request(&exchange);
    assert!(!upstream.headers().contains_key("referer"));

    let exchange = exchange_with_headers(&[("Referer", "http://example.com/page")]);
    let upstream = engine.build_upstream_request(&exchange);
    assert!(upstream.headers().contains_key("referer"));
  }

  #[test]
  fn test_response_strips_caching_validators() {
    let mut response: Response = Response::builder()
      .status(200)
      .header(http::header::DATE, "Mon, 01 Jan 2024 00:00:00 GMT")
      .header(http::header::SERVER, "origin/1.0")
      .header(http::header::ETAG, "\"abc\"")
      .header(http::header::LAST_MODIFIED, "Mon, 01 Jan 2024 00:00:00 GMT")
      .header(http::header::CONTENT_TYPE, "text/plain")
      .body("payload")
      .unwrap()
      .into();
    strip_response_headers(&mut response, false);
    assert!(!response.headers().contains_key(http::header::DATE));
    assert!(!response.headers().contains_key(http::header::SERVER));
    assert!(!response.headers().contains_key(http::header::ETAG));
    assert!(!response.headers().contains_key(http::header::LAST_MODIFIED));
    assert!(response.headers().contains_key(http::header::CONTENT_TYPE));
  }

  #[tokio::test]
  async fn test_write_response_normalizes_content_length() {
    let engine = engine(false, false, None);
    let mut response: Response = Response::builder()
      .status(200)
      .header(http::header::CONTENT_LENGTH, "999")
      .body("12345")
      .unwrap()
      .into();
    response.set_reason("OK");
    let mut sink = std::io::Cursor::new(Vec::new());
    let copied = engine
      .write_response(&mut sink, &response, &Method::GET)
      .await
      .unwrap();
    assert_eq!(copied, 5);
    let text = String::from_utf8(sink.into_inner()).unwrap();
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(text.contains("content-length: 5\r\n"));
    assert!(text.ends_with("\r\n\r\n12345"));
  }

  #[test]
  fn test_error_response_classes() {
    let host_error = Error::HostResolution {
      host: "nosuch.example".to_string(),
      source: std::io::Error::new(std::io::ErrorKind::NotFound, "nx"),
    };
    let response = error_response(&host_error);
    assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);
    assert_eq!(response.reason(), Some("Host nosuch.example not found"));
    assert!(response.text().contains("Server not found"));

    let refused = Error::UpstreamConnect {
      addr: "127.0.0.1:9".to_string(),
      source: std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused"),
    };
    let response = error_response(&refused);
    assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);
    assert!(response.text().contains("Unable to connect"));

    let forbidden = Error::Forbidden("port 25 not allowed".to_string());
    let response = error_response(&forbidden);
    assert_eq!(response.status_code(), StatusCode::FORBIDDEN);

    let tls = Error::UpstreamTls {
      host: "example.com".to_string(),
      message: "handshake".to_string(),
    };
    let response = error_response(&tls);
    assert_eq!(response.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(response.text().contains("trust-upstream-certificates"));
  }
}
