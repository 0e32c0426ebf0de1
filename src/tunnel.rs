//! CONNECT handling: opaque tunnels and upgrade-to-TLS interception.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_rustls::TlsAcceptor;

use crate::errors::{Error, Result};
use crate::forward::error_response;
use crate::proxy::ProxyInner;
use crate::socket::Socket;

/// Per-CONNECT state machine.
///
/// Every CONNECT request walks `AwaitingTarget` to `Closed`; the middle
/// states depend on whether the destination is intercepted
/// (`TlsNegotiating` then `Intercepting`) or opaquely relayed
/// (`TunnelEstablished`). `Closed` always releases both sockets, on every
/// exit path including handshake failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
  /// CONNECT received, target not yet validated or dialed
  AwaitingTarget,
  /// byte-for-byte relay between client and target, no payload parsing
  TunnelEstablished,
  /// 200 sent, TLS server handshake with the client in progress
  TlsNegotiating,
  /// decrypted exchanges flowing through the interceptor pipeline
  Intercepting,
  /// both sockets released
  Closed,
}

/// Establishes tunnels for CONNECT requests.
pub(crate) struct TunnelEstablisher {
  inner: Arc<ProxyInner>,
}

impl TunnelEstablisher {
  pub(crate) fn new(inner: Arc<ProxyInner>) -> Self {
    Self { inner }
  }

  /// Drive one CONNECT request to completion.
  ///
  /// The client socket is consumed; by the time this returns both the
  /// client and any upstream socket have been dropped.
  pub(crate) async fn establish(self, mut client: Socket, target: &http::Uri) -> Result<()> {
    let mut state = TunnelState::AwaitingTarget;
    let (host, port) = match parse_target(target) {
      Ok(pair) => pair,
      Err(err) => {
        let response = error_response(&err);
        client.write_all(&response.to_raw()).await.ok();
        return Ok(());
      }
    };
    tracing::debug!("CONNECT {}:{} ({:?})", host, port, state);

    if !self.inner.config.is_connect_allowed(&host, port) {
      let err = Error::forbidden(format!("CONNECT to {}:{} is not allowed", host, port));
      let response = error_response(&err);
      client.write_all(&response.to_raw()).await.ok();
      return Ok(());
    }

    if !self.inner.config.interception || self.inner.config.is_exempt(&host) {
      return self.relay_opaque(client, &host, port).await;
    }

    // certificate issuance is synchronous on the connection path and must
    // complete before the handshake can start; a failure fails this CONNECT
    let certificate = match self.inner.cache.get_or_create(&host).await {
      Ok(certificate) => certificate,
      Err(err) => {
        let response = error_response(&err);
        client.write_all(&response.to_raw()).await.ok();
        return Err(err);
      }
    };

    client
      .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
      .await?;
    client.flush().await?;

    state = TunnelState::TlsNegotiating;
    tracing::debug!("{}:{} ({:?})", host, port, state);
    let tls_config = certificate.server_config()?;
    let acceptor = TlsAcceptor::from(Arc::new(tls_config));
    let handshake = client.accept_tls(&acceptor);
    let accepted = match self.inner.config.read_timeout {
      None => handshake.await,
      Some(t) => match tokio::time::timeout(t, handshake).await {
        Ok(result) => result,
        Err(elapsed) => Err(std::io::Error::new(std::io::ErrorKind::TimedOut, elapsed)),
      },
    };
    let tls_client = match accepted {
      Ok(socket) => socket,
      Err(err) => {
        // both sockets are released on this path: the client socket was
        // consumed by the failed handshake and no upstream exists yet
        let err = Error::client_tls(&host, err.to_string());
        tracing::debug!("{}:{} ({:?})", host, port, TunnelState::Closed);
        return Err(err);
      }
    };

    state = TunnelState::Intercepting;
    tracing::debug!("{}:{} ({:?})", host, port, state);
    let authority = format!("{}:{}", host, port);
    let result = self.inner.serve_intercepted(tls_client, authority).await;
    tracing::debug!("{}:{} ({:?})", host, port, TunnelState::Closed);
    result
  }

  /// Opaque relay: reply 200, then copy bytes both ways without parsing
  /// the payload, until either side closes or the idle timeout elapses.
  async fn relay_opaque(&self, mut client: Socket, host: &str, port: u16) -> Result<()> {
    let upstream = match self.inner.engine.connector().connect_plain(host, port).await {
      Ok(socket) => socket,
      Err(err) => {
        let response = error_response(&err);
        client.write_all(&response.to_raw()).await.ok();
        return Ok(());
      }
    };
    client
      .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
      .await?;
    client.flush().await?;
    tracing::debug!("{}:{} ({:?})", host, port, TunnelState::TunnelEstablished);
    let idle = self.inner.config.idle_timeout;
    match relay(client, upstream, idle).await {
      Ok((up, down)) => {
        tracing::debug!(
          "tunnel closed: {} bytes client->target, {} bytes target->client",
          up,
          down
        );
      }
      Err(err) => tracing::debug!("tunnel error: {}", err),
    }
    tracing::debug!("{}:{} ({:?})", host, port, TunnelState::Closed);
    Ok(())
  }
}

/// Pull host and port out of a CONNECT target.
pub(crate) fn parse_target(target: &http::Uri) -> Result<(String, u16)> {
  let authority = target
    .authority()
    .ok_or_else(|| Error::protocol_violation(format!("invalid CONNECT target: {}", target)))?;
  let host = authority.host().trim_matches(|c| c == '[' || c == ']').to_string();
  let port = authority
    .port_u16()
    .ok_or_else(|| Error::protocol_violation(format!("CONNECT target without port: {}", target)))?;
  Ok((host, port))
}

/// Copy bytes in both directions until both sides are done.
async fn relay(client: Socket, upstream: Socket, idle: Option<Duration>) -> std::io::Result<(u64, u64)> {
  let (mut client_read, mut client_write) = tokio::io::split(client);
  let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);
  tokio::try_join!(
    copy_until_idle(&mut client_read, &mut upstream_write, idle),
    copy_until_idle(&mut upstream_read, &mut client_write, idle),
  )
}

/// One relay direction. An idle timeout counts as a clean close.
async fn copy_until_idle<R, W>(
  reader: &mut R,
  writer: &mut W,
  idle: Option<Duration>,
) -> std::io::Result<u64>
where
  R: tokio::io::AsyncRead + Unpin,
  W: tokio::io::AsyncWrite + Unpin,
{
  let mut buffer = [0u8; 8192];
  let mut copied = 0u64;
  loop {
    let n = match idle {
      None => reader.read(&mut buffer).await?,
      Some(t) => match tokio::time::timeout(t, reader.read(&mut buffer)).await {
        Ok(read) => read?,
        Err(_elapsed) => break,
      },
    };
    if n == 0 {
      break;
    }
    writer.write_all(&buffer[..n]).await?;
    copied += n as u64;
  }
  let _ = writer.shutdown().await;
  Ok(copied)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_parse_target() {
    let target: http::Uri = "https://example.com:443".parse().unwrap();
    assert_eq!(parse_target(&target).unwrap(), ("example.com".to_string(), 443));
  }

  #[test]
  fn test_parse_target_requires_port() {
    let target: http::Uri = "https://example.com".parse().unwrap();
    assert!(parse_target(&target).is_err());
  }

  #[test]
  fn test_parse_target_ipv6() {
    let target: http::Uri = "https://[::1]:8443".parse().unwrap();
    assert_eq!(parse_target(&target).unwrap(), ("::1".to_string(), 8443));
  }
}
