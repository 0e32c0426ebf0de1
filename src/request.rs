use std::fmt::{Debug, Formatter};

use bytes::Bytes;
use http::Request as HttpRequest;
use http::{HeaderMap, HeaderValue, Method, Version};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::body::Body;
use crate::errors::{Error, Result};
use crate::response::{parser_headers, read_chunked_body};
use crate::{COLON_SPACE, CR_LF, SPACE};

/// Maximum accepted request-line length.
const MAX_REQUEST_LINE: usize = 8192;
/// Maximum accepted total header size.
const MAX_HEADERS_SIZE: usize = 64 * 1024;

/// A proxied HTTP request.
///
/// Holds the client's request line, headers and (buffered) body. Request
/// interceptors receive a mutable view of this through the exchange and may
/// rewrite the method, target, headers and body before the request is
/// forwarded upstream.
#[derive(Default, Clone)]
pub struct Request {
  uri: http::Uri,
  version: Version,
  method: Method,
  headers: HeaderMap<HeaderValue>,
  body: Option<Body>,
}

impl Debug for Request {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Request")
      .field("uri", &self.uri)
      .field("version", &self.version)
      .field("method", &self.method)
      .field("headers", &self.headers)
      .field("body", &self.body)
      .finish()
  }
}

impl<T> From<HttpRequest<T>> for Request
where
  T: Into<Body>,
{
  fn from(value: HttpRequest<T>) -> Self {
    let (parts, body) = value.into_parts();
    let body = body.into();
    Self {
      uri: parts.uri,
      version: parts.version,
      method: parts.method,
      headers: parts.headers,
      body: if body.is_empty() { None } else { Some(body) },
    }
  }
}

impl Request {
  /// Creates a new builder-style object to manufacture a `Request`
  ///
  /// # Examples
  ///
  /// ```
  /// let request: periscope::Request = http::Request::builder()
  ///     .method("GET")
  ///     .uri("http://httpbin.org/get")
  ///     .header("X-Custom-Foo", "Bar")
  ///     .body(bytes::Bytes::new())
  ///     .unwrap()
  ///     .into();
  /// assert_eq!(request.method(), &http::Method::GET);
  /// ```
  pub fn builder() -> http::request::Builder {
    http::request::Builder::new()
  }

  /// Get the HTTP method of this request.
  #[inline]
  pub fn method(&self) -> &Method {
    &self.method
  }
  /// Get a mutable reference to the HTTP method.
  #[inline]
  pub fn method_mut(&mut self) -> &mut Method {
    &mut self.method
  }
  /// Get the target URI of this request.
  ///
  /// For plaintext proxy requests this is the absolute-form target the
  /// client sent; for intercepted HTTPS requests it is the origin-form
  /// target rebuilt against the CONNECT authority.
  #[inline]
  pub fn uri(&self) -> &http::Uri {
    &self.uri
  }
  /// Get a mutable reference to the target URI.
  ///
  /// Request interceptors use this to redirect an exchange, e.g. to a stub
  /// backend.
  #[inline]
  pub fn uri_mut(&mut self) -> &mut http::Uri {
    &mut self.uri
  }
  /// Get the headers of this request.
  #[inline]
  pub fn headers(&self) -> &HeaderMap {
    &self.headers
  }
  /// Get a mutable reference to the headers.
  #[inline]
  pub fn headers_mut(&mut self) -> &mut HeaderMap {
    &mut self.headers
  }
  /// Get the buffered request body, if any.
  #[inline]
  pub fn body(&self) -> Option<&Body> {
    self.body.as_ref()
  }
  /// Get a mutable reference to the body slot.
  #[inline]
  pub fn body_mut(&mut self) -> &mut Option<Body> {
    &mut self.body
  }
  /// Replace the request body.
  #[inline]
  pub fn set_body<B: Into<Body>>(&mut self, body: B) {
    let body = body.into();
    self.body = if body.is_empty() { None } else { Some(body) };
  }
  /// Returns the associated version.
  #[inline]
  pub fn version(&self) -> Version {
    self.version
  }
  /// Returns a mutable reference to the associated version.
  #[inline]
  pub fn version_mut(&mut self) -> &mut Version {
    &mut self.version
  }

  /// Serialize this request to raw HTTP/1.1 bytes.
  ///
  /// `absolute_form` selects the request target: origin-form (path and
  /// query) for direct upstream connections, absolute-form for requests
  /// relayed through a chained proxy. A `Host` header is inserted from the
  /// URI authority when absent; `Content-Length` is recomputed from the
  /// buffered body and `Transfer-Encoding` dropped, since the serialized
  /// message always uses identity framing.
  pub(crate) fn to_raw(&self, absolute_form: bool) -> Bytes {
    let mut raw = Vec::new();
    raw.extend(self.method.as_str().as_bytes());
    raw.extend(SPACE);
    if absolute_form {
      raw.extend(self.uri.to_string().as_bytes());
    } else {
      let path = self.uri.path();
      raw.extend(if path.is_empty() { "/" } else { path }.as_bytes());
      if let Some(q) = self.uri.query() {
        raw.extend([63]);
        raw.extend(q.as_bytes());
      }
    }
    raw.extend(SPACE);
    raw.extend(format!("{:?}", self.version).as_bytes());
    raw.extend(CR_LF);
    // 如果请求头里面没有主机头就先加主机头
    if self.headers.get(http::header::HOST).is_none() {
      raw.extend(http::header::HOST.as_str().as_bytes());
      raw.extend(COLON_SPACE);
      raw.extend(if let Some(s) = self.uri.authority() {
        s.as_str().as_bytes()
      } else {
        &[]
      });
      raw.extend(CR_LF);
    }
    let mut headers = self.headers.clone();
    headers.remove(http::header::TRANSFER_ENCODING);
    match self.body() {
      Some(b) if !b.is_empty() => {
        headers.insert(http::header::CONTENT_LENGTH, HeaderValue::from(b.len()));
      }
      _ => {
        headers.remove(http::header::CONTENT_LENGTH);
      }
    }
    for (k, v) in headers.iter() {
      raw.extend(k.as_str().as_bytes());
      raw.extend(COLON_SPACE);
      raw.extend(v.as_bytes());
      raw.extend(CR_LF);
    }
    raw.extend(CR_LF);
    if let Some(b) = self.body() {
      if !b.is_empty() {
        raw.extend(b.as_ref());
      }
    }
    Bytes::from(raw)
  }
}

/// Reads one request off a buffered client stream.
///
/// `base_authority` rewrites origin-form targets to absolute `https` URIs
/// against the CONNECT authority, so intercepted requests enter the pipeline
/// addressed like plaintext proxy requests.
pub(crate) struct RequestReader<'a, R> {
  reader: &'a mut R,
  base_authority: Option<&'a str>,
}

impl<'a, R: AsyncBufRead + Unpin> RequestReader<'a, R> {
  pub(crate) fn new(reader: &'a mut R, base_authority: Option<&'a str>) -> Self {
    RequestReader {
      reader,
      base_authority,
    }
  }

  /// Read one request. Returns `Ok(None)` on a clean end of stream before
  /// any request byte, which ends a keep-alive connection.
  pub(crate) async fn read(mut self) -> Result<Option<Request>> {
    let line = match self.read_request_line().await? {
      Some(line) => line,
      None => return Ok(None),
    };
    let mut parts = line.split_whitespace();
    let (method, target, version) = match (parts.next(), parts.next(), parts.next()) {
      (Some(m), Some(t), Some(v)) => (m, t, v),
      _ => return Err(Error::protocol_violation(format!("invalid request line: {line}"))),
    };
    let method = Method::from_bytes(method.as_bytes())
      .map_err(|_| Error::protocol_violation(format!("invalid method: {method}")))?;
    let version = match version {
      "HTTP/1.0" => Version::HTTP_10,
      "HTTP/1.1" => Version::HTTP_11,
      _ => return Err(Error::protocol_violation(format!("unsupported version: {version}"))),
    };
    let uri = self.parse_target(&method, target)?;
    let headers = self.read_headers().await?;
    let body = self.read_body(&method, &headers).await?;
    Ok(Some(Request {
      uri,
      version,
      method,
      headers,
      body,
    }))
  }

  async fn read_request_line(&mut self) -> Result<Option<String>> {
    // tolerate blank lines between keep-alive requests
    loop {
      let mut line = Vec::new();
      let n = self.reader.read_until(b'\n', &mut line).await?;
      if n == 0 {
        return Ok(None);
      }
      if line.len() > MAX_REQUEST_LINE {
        return Err(Error::protocol_violation("request line too long"));
      }
      let line = line.strip_suffix(CR_LF).unwrap_or(line.strip_suffix(b"\n").unwrap_or(&line));
      if !line.is_empty() {
        return Ok(Some(String::from_utf8_lossy(line).to_string()));
      }
    }
  }

  fn parse_target(&self, method: &Method, target: &str) -> Result<http::Uri> {
    let rewritten = if method == Method::CONNECT {
      // authority-form; carry it as an https URI so the tunnel can pull
      // host and port back out of the authority
      format!("https://{target}")
    } else if target.starts_with('/') {
      match self.base_authority {
        Some(authority) => format!("https://{authority}{target}"),
        None => target.to_string(),
      }
    } else {
      target.to_string()
    };
    rewritten
      .parse::<http::Uri>()
      .map_err(|_| Error::protocol_violation(format!("invalid request target: {target}")))
  }

  async fn read_headers(&mut self) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    let mut header_line = Vec::new();
    let mut total = 0usize;
    loop {
      let length = self.reader.read_until(b'\n', &mut header_line).await?;
      if length == 0 {
        return Err(Error::protocol_violation("unexpected end of headers"));
      }
      if header_line == b"\r\n" || header_line == b"\n" {
        break;
      }
      total += length;
      if total > MAX_HEADERS_SIZE {
        return Err(Error::protocol_violation("headers size exceeds maximum allowed"));
      }
      if let Ok((Some(k), Some(v))) = parser_headers(&header_line) {
        if headers.contains_key(&k) {
          headers.append(k, v);
        } else {
          headers.insert(k, v);
        }
      }
      header_line.clear();
    }
    Ok(headers)
  }

  async fn read_body(&mut self, method: &Method, headers: &HeaderMap) -> Result<Option<Body>> {
    if method == Method::CONNECT {
      return Ok(None);
    }
    let chunked = headers
      .get(http::header::TRANSFER_ENCODING)
      .and_then(|te| te.to_str().ok())
      .map(|te| te.to_ascii_lowercase().contains("chunked"))
      .unwrap_or(false);
    if chunked {
      let body = read_chunked_body(self.reader).await?;
      return Ok(if body.is_empty() { None } else { Some(Body::from(body)) });
    }
    let content_length: usize = headers
      .get(http::header::CONTENT_LENGTH)
      .and_then(|x| x.to_str().ok()?.parse().ok())
      .unwrap_or(0);
    if content_length == 0 {
      return Ok(None);
    }
    let mut body = vec![0u8; content_length];
    self.reader.read_exact(&mut body).await?;
    Ok(Some(Body::from(body)))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::io::BufReader;

  #[tokio::test]
  async fn test_read_absolute_form_request() {
    let raw = b"GET http://httpbin.org/get?x=1 HTTP/1.1\r\nHost: httpbin.org\r\nC: C\r\n\r\n";
    let mut reader = BufReader::new(&raw[..]);
    let request = RequestReader::new(&mut reader, None)
      .read()
      .await
      .unwrap()
      .unwrap();
    assert_eq!(request.method(), &Method::GET);
    assert_eq!(request.uri().host(), Some("httpbin.org"));
    assert_eq!(request.uri().query(), Some("x=1"));
    assert_eq!(request.headers().get("C").unwrap(), "C");
    assert!(request.body().is_none());
  }

  #[tokio::test]
  async fn test_read_origin_form_rewrites_against_authority() {
    let raw = b"GET /anyUrl HTTP/1.1\r\nHost: example.com\r\n\r\n";
    let mut reader = BufReader::new(&raw[..]);
    let request = RequestReader::new(&mut reader, Some("example.com:8443"))
      .read()
      .await
      .unwrap()
      .unwrap();
    assert_eq!(request.uri().to_string(), "https://example.com:8443/anyUrl");
  }

  #[tokio::test]
  async fn test_read_chunked_request_body() {
    let raw =
      b"POST /upload HTTP/1.1\r\nHost: h\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n";
    let mut reader = BufReader::new(&raw[..]);
    let request = RequestReader::new(&mut reader, Some("h:443"))
      .read()
      .await
      .unwrap()
      .unwrap();
    assert_eq!(request.body().unwrap().as_ref(), b"Wikipedia");
  }

  #[tokio::test]
  async fn test_eof_yields_none() {
    let raw = b"";
    let mut reader = BufReader::new(&raw[..]);
    let request = RequestReader::new(&mut reader, None).read().await.unwrap();
    assert!(request.is_none());
  }

  #[test]
  fn test_to_raw_inserts_host_and_content_length() {
    let request: Request = Request::builder()
      .method("POST")
      .uri("http://httpbin.org/post")
      .body(bytes::Bytes::from_static(b"payload"))
      .unwrap()
      .into();
    let raw = request.to_raw(false);
    let text = String::from_utf8_lossy(&raw);
    assert!(text.starts_with("POST /post HTTP/1.1\r\n"));
    assert!(text.contains("host: httpbin.org\r\n"));
    assert!(text.contains("content-length: 7\r\n"));
    assert!(text.ends_with("\r\n\r\npayload"));
  }

  #[test]
  fn test_to_raw_absolute_form() {
    let request: Request = Request::builder()
      .uri("http://httpbin.org/get")
      .body(bytes::Bytes::new())
      .unwrap()
      .into();
    let raw = request.to_raw(true);
    assert!(raw.starts_with(b"GET http://httpbin.org/get HTTP/1.1\r\n"));
  }

  #[test]
  fn test_to_raw_recomputes_stale_content_length() {
    let mut request: Request = Request::builder()
      .method("POST")
      .uri("http://h/p")
      .header(http::header::CONTENT_LENGTH, "999")
      .body(bytes::Bytes::new())
      .unwrap()
      .into();
    request.set_body("ab");
    let raw = request.to_raw(false);
    let text = String::from_utf8_lossy(&raw);
    assert!(text.contains("content-length: 2\r\n"));
    assert!(!text.contains("999"));
  }
}
