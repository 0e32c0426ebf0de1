//! proxy error taxonomy
use std::io::ErrorKind;
use thiserror::Error as ThisError;

/// A `Result` alias where the `Err` case is `periscope::Error`.
pub type Result<T> = std::result::Result<T, Error>;

/// The errors that may occur while proxying an exchange.
///
/// Resolution and connect failures are converted into best-effort HTTP error
/// responses at the forwarding boundary as long as nothing has been written
/// to the client yet; once a response is committed, later failures only tear
/// the connection down.
#[derive(ThisError, Debug)]
pub enum Error {
  /// DNS resolution failed for the target host.
  #[error("host {host} not found: {source}")]
  HostResolution {
    /// the hostname that could not be resolved
    host: String,
    /// underlying resolver error
    #[source]
    source: std::io::Error,
  },
  /// The target resolved but refused or dropped the TCP connection.
  #[error("couldn't connect to {addr}: {source}")]
  UpstreamConnect {
    /// the address that was not listening
    addr: String,
    /// underlying connect error
    #[source]
    source: std::io::Error,
  },
  /// TLS handshake with the real upstream server failed.
  #[error("TLS handshake with upstream {host} failed: {message}")]
  UpstreamTls {
    /// the upstream host
    host: String,
    /// handshake failure detail
    message: String,
  },
  /// TLS handshake with the client failed while impersonating the target.
  #[error("TLS handshake with client failed while impersonating {host}: {message}")]
  ClientTls {
    /// the impersonated host
    host: String,
    /// handshake failure detail
    message: String,
  },
  /// The certificate authority could not issue a leaf certificate.
  #[error("certificate issuance failed: {0}")]
  CertificateIssuance(String),
  /// An interceptor returned an error. Advisory unless the proxy is
  /// configured to abort the exchange on interceptor failure.
  #[error("interceptor failed: {0}")]
  Interceptor(String),
  /// Malformed request or response framing.
  #[error("protocol violation: {0}")]
  ProtocolViolation(String),
  /// The destination is not allowed by proxy policy.
  #[error("forbidden by proxy policy: {0}")]
  Forbidden(String),
  /// IO error
  #[error(transparent)]
  Io(#[from] std::io::Error),
  /// http::Error
  #[error(transparent)]
  Http(http::Error),
}

impl Error {
  /// Create a certificate issuance error and log it.
  pub(crate) fn certificate_issuance(msg: impl Into<String>) -> Self {
    let error = Error::CertificateIssuance(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Create an upstream TLS error and log it.
  pub(crate) fn upstream_tls(host: impl Into<String>, msg: impl Into<String>) -> Self {
    let error = Error::UpstreamTls {
      host: host.into(),
      message: msg.into(),
    };
    tracing::error!("{}", error);
    error
  }

  /// Create a client TLS error and log it.
  pub(crate) fn client_tls(host: impl Into<String>, msg: impl Into<String>) -> Self {
    let error = Error::ClientTls {
      host: host.into(),
      message: msg.into(),
    };
    tracing::error!("{}", error);
    error
  }

  /// Create a protocol violation error and log it.
  pub(crate) fn protocol_violation(msg: impl Into<String>) -> Self {
    let error = Error::ProtocolViolation(msg.into());
    tracing::debug!("{}", error);
    error
  }

  /// Create a policy error and log it.
  pub(crate) fn forbidden(msg: impl Into<String>) -> Self {
    let error = Error::Forbidden(msg.into());
    tracing::debug!("{}", error);
    error
  }
}

impl From<http::Error> for Error {
  fn from(value: http::Error) -> Self {
    Error::Http(value)
  }
}

impl From<tokio::time::error::Elapsed> for Error {
  fn from(value: tokio::time::error::Elapsed) -> Self {
    Error::Io(std::io::Error::new(ErrorKind::TimedOut, value))
  }
}

impl From<http::header::InvalidHeaderValue> for Error {
  fn from(value: http::header::InvalidHeaderValue) -> Self {
    Error::Http(http::Error::from(value))
  }
}

pub(crate) fn new_io_error(error_kind: ErrorKind, msg: &str) -> Error {
  Error::Io(std::io::Error::new(error_kind, msg))
}
