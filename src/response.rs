use std::time::Duration;

use bytes::Bytes;
use http::{Method, Response as HttpResponse, StatusCode};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::body::Body;
use crate::errors::{new_io_error, Error, Result};
use crate::{COLON_SPACE, CR_LF, SPACE};

/// A response received from the upstream server on behalf of the client.
///
/// The reason phrase from the upstream status line is carried separately
/// from the numeric status, so a response interceptor can alter one without
/// touching the other.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Response {
  version: http::Version,
  status_code: StatusCode,
  reason: Option<String>,
  headers: http::HeaderMap<http::HeaderValue>,
  body: Option<Body>,
}

impl<T> From<HttpResponse<T>> for Response
where
  T: Into<Body>,
{
  fn from(value: HttpResponse<T>) -> Self {
    let (parts, body) = value.into_parts();
    let body = body.into();
    Self {
      version: parts.version,
      status_code: parts.status,
      reason: None,
      headers: parts.headers,
      body: if body.is_empty() { None } else { Some(body) },
    }
  }
}

impl Response {
  /// An HTTP response builder.
  ///
  /// This type can be used to construct an instance of `Response` through a
  /// builder-like pattern.
  pub fn builder() -> http::response::Builder {
    http::response::Builder::new()
  }

  /// Get the `StatusCode` of this `Response`.
  #[inline]
  pub fn status_code(&self) -> StatusCode {
    self.status_code
  }
  /// Get a mutable reference to the numeric status.
  ///
  /// Changing the status leaves the reason phrase untouched.
  #[inline]
  pub fn status_mut(&mut self) -> &mut StatusCode {
    &mut self.status_code
  }
  /// The reason phrase that will be written on the status line.
  ///
  /// This is the phrase received from upstream (or set by an interceptor);
  /// when none was captured, the canonical phrase for the status is used.
  #[inline]
  pub fn reason(&self) -> Option<&str> {
    self.reason.as_deref()
  }
  /// Override the reason phrase without changing the numeric status.
  #[inline]
  pub fn set_reason<S: Into<String>>(&mut self, reason: S) {
    self.reason = Some(reason.into());
  }
  /// Get the HTTP `Version` of this `Response`.
  #[inline]
  pub fn version(&self) -> http::Version {
    self.version
  }
  /// Get the `Headers` of this `Response`.
  #[inline]
  pub fn headers(&self) -> &http::HeaderMap {
    &self.headers
  }
  /// Get a mutable reference to the `Headers` of this `Response`.
  #[inline]
  pub fn headers_mut(&mut self) -> &mut http::HeaderMap {
    &mut self.headers
  }
  /// Get the content-length of the response, if it is known.
  pub fn content_length(&self) -> Option<u64> {
    self
      .headers
      .get(http::header::CONTENT_LENGTH)
      .and_then(|x| x.to_str().ok()?.parse().ok())
  }
  /// Get the buffered response body, if any.
  #[inline]
  pub fn body(&self) -> Option<&Body> {
    self.body.as_ref()
  }
  /// Get a mutable reference to the body slot.
  #[inline]
  pub fn body_mut(&mut self) -> &mut Option<Body> {
    &mut self.body
  }
  /// Replace the response body.
  #[inline]
  pub fn set_body<B: Into<Body>>(&mut self, body: B) {
    let body = body.into();
    self.body = if body.is_empty() { None } else { Some(body) };
  }
  /// Get the response body decoded as UTF-8 text, lossily.
  pub fn text(&self) -> String {
    match self.body() {
      Some(body) => String::from_utf8_lossy(body).to_string(),
      None => String::new(),
    }
  }

  /// Serialize status line and headers followed by the body.
  ///
  /// Headers are written as stored; callers that changed the body are
  /// expected to have fixed the framing headers first (the forwarding
  /// engine does this before every client write).
  pub(crate) fn to_raw(&self) -> Bytes {
    let mut raw = Vec::new();
    raw.extend(format!("{:?}", self.version).as_bytes());
    raw.extend(SPACE);
    raw.extend(self.status_code.as_str().as_bytes());
    raw.extend(SPACE);
    let reason = self
      .reason
      .as_deref()
      .or_else(|| self.status_code.canonical_reason())
      .unwrap_or("Unknown");
    raw.extend(reason.as_bytes());
    raw.extend(CR_LF);
    for (k, v) in self.headers.iter() {
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

/// response read config
#[derive(Debug, Default)]
pub(crate) struct ResponseReadConfig {
  pub(crate) method: Method,
  pub(crate) read_timeout: Option<Duration>,
}

/// Reads a response off a buffered upstream stream.
pub(crate) struct ResponseReader<'a, R> {
  reader: &'a mut R,
  config: ResponseReadConfig,
}

impl<'a, R: AsyncBufRead + Unpin> ResponseReader<'a, R> {
  pub(crate) fn new(reader: &'a mut R, config: ResponseReadConfig) -> Self {
    ResponseReader { reader, config }
  }

  async fn parse_status_line(&mut self) -> Result<(http::Version, StatusCode, Option<String>)> {
    let mut line = Vec::new();
    let n = self.reader.read_until(b'\n', &mut line).await?;
    if n == 0 {
      return Err(new_io_error(
        std::io::ErrorKind::UnexpectedEof,
        "upstream closed before status line",
      ));
    }
    let line = line.strip_suffix(CR_LF).unwrap_or(&line);
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    let mut parts = line.splitn(3, |b| b == &b' ');
    let version = match parts.next() {
      Some(b"HTTP/0.9") => http::Version::HTTP_09,
      Some(b"HTTP/1.0") => http::Version::HTTP_10,
      Some(b"HTTP/1.1") => http::Version::HTTP_11,
      Some(b"HTTP/2.0") => http::Version::HTTP_2,
      _ => return Err(Error::protocol_violation("invalid http version in status line")),
    };
    let status_code = parts
      .next()
      .and_then(|sc| StatusCode::try_from(sc).ok())
      .ok_or_else(|| Error::protocol_violation("invalid status code in status line"))?;
    let reason = parts
      .next()
      .map(|r| String::from_utf8_lossy(r).trim_end().to_string())
      .filter(|r| !r.is_empty());
    Ok((version, status_code, reason))
  }

  async fn read_headers(&mut self) -> http::HeaderMap {
    let mut headers = http::HeaderMap::new();
    let mut header_line = Vec::new();
    while let Ok(length) = self.reader.read_until(b'\n', &mut header_line).await {
      if length == 0 || header_line == b"\r\n" || header_line == b"\n" {
        break;
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
    headers
  }

  async fn read_body(&mut self, status: StatusCode, headers: &http::HeaderMap) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    if matches!(self.config.method, Method::HEAD)
      || status.is_informational()
      || status == StatusCode::NO_CONTENT
      || status == StatusCode::NOT_MODIFIED
    {
      return Ok(body);
    }
    let chunked = headers
      .get(http::header::TRANSFER_ENCODING)
      .and_then(|te| te.to_str().ok())
      .map(|te| te.to_ascii_lowercase().contains("chunked"))
      .unwrap_or(false);
    if chunked {
      return read_chunked_body(self.reader).await;
    }
    if let Some(content_length) = headers
      .get(http::header::CONTENT_LENGTH)
      .and_then(|x| x.to_str().ok()?.parse::<usize>().ok())
    {
      if content_length == 0 {
        return Ok(body);
      }
      body = vec![0u8; content_length];
      match self.config.read_timeout {
        None => self.reader.read_exact(&mut body).await?,
        Some(t) => tokio::time::timeout(t, self.reader.read_exact(&mut body)).await??,
      };
      return Ok(body);
    }
    // no framing headers: read until EOF, a stalled peer ends the body at
    // the read timeout instead of hanging the worker
    let mut buffer = [0u8; 8192];
    loop {
      let size = match self.config.read_timeout {
        None => self.reader.read(&mut buffer).await,
        Some(t) => match tokio::time::timeout(t, self.reader.read(&mut buffer)).await {
          Ok(size) => size,
          Err(_) => break,
        },
      };
      match size {
        Ok(0) => break,
        Ok(n) => body.extend_from_slice(&buffer[..n]),
        Err(_err) => break,
      }
    }
    Ok(body)
  }

  /// Build a `Response` from the wire.
  pub(crate) async fn read(mut self) -> Result<Response> {
    let (version, status_code, reason) = self.parse_status_line().await?;
    let headers = self.read_headers().await;
    let body = self.read_body(status_code, &headers).await?;
    Ok(Response {
      version,
      status_code,
      reason,
      headers,
      body: if body.is_empty() { None } else { Some(Body::from(body)) },
    })
  }
}

pub(crate) fn parser_headers(
  buffer: &[u8],
) -> Result<(Option<http::HeaderName>, Option<http::HeaderValue>)> {
  let mut k = None;
  let mut v = None;
  let buffer = buffer.strip_suffix(CR_LF).unwrap_or(buffer);
  let buffer = buffer.strip_suffix(b"\n").unwrap_or(buffer);
  for (index, h) in buffer.splitn(2, |s| s == &58).enumerate() {
    let h = h.strip_prefix(SPACE).unwrap_or(h);
    match index {
      0 => match http::HeaderName::from_bytes(h) {
        Ok(hk) => k = Some(hk),
        Err(err) => {
          return Err(Error::Http(http::Error::from(err)));
        }
      },
      1 => match http::HeaderValue::from_bytes(h) {
        Ok(hv) => v = Some(hv),
        Err(err) => {
          return Err(Error::Http(http::Error::from(err)));
        }
      },
      _ => {}
    }
  }
  Ok((k, v))
}

/// Decode a chunked body, consuming the terminating chunk and any trailers.
pub(crate) async fn read_chunked_body<R>(reader: &mut R) -> Result<Vec<u8>>
where
  R: AsyncBufRead + Unpin,
{
  let mut body: Vec<u8> = Vec::new();
  loop {
    let mut size_line = Vec::new();
    let n = reader.read_until(b'\n', &mut size_line).await?;
    if n == 0 {
      return Err(Error::protocol_violation("unexpected end of chunked body"));
    }
    let size_line = size_line.strip_suffix(CR_LF).unwrap_or(&size_line);
    let size_text = String::from_utf8_lossy(size_line);
    // chunk extensions after ';' are ignored
    let size_text = size_text.split(';').next().unwrap_or_default().trim();
    let size = usize::from_str_radix(size_text, 16)
      .map_err(|_| Error::protocol_violation(format!("invalid chunk size: {size_text}")))?;
    if size == 0 {
      // drain trailers up to the final empty line
      loop {
        let mut trailer = Vec::new();
        let n = reader.read_until(b'\n', &mut trailer).await?;
        if n == 0 || trailer == b"\r\n" || trailer == b"\n" {
          break;
        }
      }
      break;
    }
    let mut chunk = vec![0u8; size];
    reader.read_exact(&mut chunk).await?;
    body.append(&mut chunk);
    let mut crlf = [0u8; 2];
    reader.read_exact(&mut crlf).await?;
  }
  Ok(body)
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::io::BufReader;

  #[tokio::test]
  async fn test_read_preserves_reason_phrase() {
    let raw = b"HTTP/1.1 200 Totally Fine\r\nContent-Length: 2\r\n\r\nok";
    let mut reader = BufReader::new(&raw[..]);
    let response = ResponseReader::new(&mut reader, ResponseReadConfig::default())
      .read()
      .await
      .unwrap();
    assert_eq!(response.status_code(), StatusCode::OK);
    assert_eq!(response.reason(), Some("Totally Fine"));
    assert_eq!(response.text(), "ok");
  }

  #[tokio::test]
  async fn test_read_chunked_response_body() {
    let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n6\r\nserver\r\n8\r\n-backend\r\n0\r\n\r\n";
    let mut reader = BufReader::new(&raw[..]);
    let response = ResponseReader::new(&mut reader, ResponseReadConfig::default())
      .read()
      .await
      .unwrap();
    assert_eq!(response.text(), "server-backend");
  }

  #[tokio::test]
  async fn test_head_response_has_no_body() {
    let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 14\r\n\r\n";
    let mut reader = BufReader::new(&raw[..]);
    let config = ResponseReadConfig {
      method: Method::HEAD,
      read_timeout: None,
    };
    let response = ResponseReader::new(&mut reader, config).read().await.unwrap();
    assert!(response.body().is_none());
    assert_eq!(response.content_length(), Some(14));
  }

  #[test]
  fn test_to_raw_uses_override_reason() {
    let mut response: Response = Response::builder()
      .status(StatusCode::SERVICE_UNAVAILABLE)
      .body("x")
      .unwrap()
      .into();
    response.set_reason("MITM");
    let raw = response.to_raw();
    assert!(raw.starts_with(b"HTTP/1.1 503 MITM\r\n"));
  }

  #[test]
  fn test_status_change_keeps_captured_reason() {
    let mut response = Response {
      status_code: StatusCode::OK,
      reason: Some("OK".to_string()),
      ..Response::default()
    };
    *response.status_mut() = StatusCode::NOT_FOUND;
    let raw = response.to_raw();
    assert!(raw.starts_with(b"HTTP/1.1 404 OK\r\n"));
  }
}
