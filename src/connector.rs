//! Upstream connection establishment.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket as RawSocket, Type};
use tokio::net::{lookup_host, TcpSocket};
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;

use crate::errors::{new_io_error, Error, Result};
use crate::socket::Socket;
use crate::throttle::{PassthroughRegistry, StreamRegistry};
use crate::tls;

/// ConnectorBuilder
pub struct ConnectorBuilder {
  read_timeout: Option<Duration>,
  write_timeout: Option<Duration>,
  connect_timeout: Option<Duration>,
  nodelay: bool,
  keepalive: bool,
  trust_upstream_certs: bool,
  upstream_proxy: Option<http::Uri>,
  registry: Arc<dyn StreamRegistry>,
}

impl Default for ConnectorBuilder {
  fn default() -> Self {
    Self {
      read_timeout: Some(Duration::from_secs(30)),
      write_timeout: Some(Duration::from_secs(30)),
      connect_timeout: Some(Duration::from_secs(10)),
      nodelay: true,
      keepalive: false,
      trust_upstream_certs: false,
      upstream_proxy: None,
      registry: Arc::new(PassthroughRegistry),
    }
  }
}

impl ConnectorBuilder {
  /// Enables a read timeout applied to each read operation.
  ///
  /// Default is 30 seconds.
  pub fn read_timeout(mut self, timeout: Option<Duration>) -> ConnectorBuilder {
    self.read_timeout = timeout;
    self
  }
  /// Enables a write timeout applied to each write operation.
  ///
  /// Default is 30 seconds.
  pub fn write_timeout(mut self, timeout: Option<Duration>) -> ConnectorBuilder {
    self.write_timeout = timeout;
    self
  }
  /// Set a timeout for only the connect phase.
  ///
  /// Default is 10 seconds.
  pub fn connect_timeout(mut self, timeout: Option<Duration>) -> ConnectorBuilder {
    self.connect_timeout = timeout;
    self
  }
  /// Set that all sockets have `SO_NODELAY` set to the supplied value.
  pub fn nodelay(mut self, value: bool) -> ConnectorBuilder {
    self.nodelay = value;
    self
  }
  /// Sets value for the `SO_KEEPALIVE` option on upstream sockets.
  pub fn keepalive(mut self, value: bool) -> ConnectorBuilder {
    self.keepalive = value;
    self
  }
  /// Skip verification of upstream certificate chains.
  ///
  /// # Warning
  ///
  /// Any certificate for any site will be accepted, expired ones included.
  /// Meant for intercepting traffic to servers with self-signed or
  /// otherwise untrusted certificates, as a last resort.
  pub fn trust_upstream_certs(mut self, value: bool) -> ConnectorBuilder {
    self.trust_upstream_certs = value;
    self
  }
  /// Route upstream connections through a chained proxy.
  ///
  /// This is an explicit configuration value; ambient proxy environment
  /// variables are never consulted.
  pub fn upstream_proxy(mut self, proxy: Option<http::Uri>) -> ConnectorBuilder {
    self.upstream_proxy = proxy;
    self
  }
  /// Register every dialed socket through the given stream registry.
  pub fn registry(mut self, registry: Arc<dyn StreamRegistry>) -> ConnectorBuilder {
    self.registry = registry;
    self
  }

  /// Build the `Connector`.
  pub fn build(self) -> Connector {
    let tls = TlsConnector::from(Arc::new(tls::client_config(self.trust_upstream_certs)));
    Connector {
      read_timeout: self.read_timeout,
      write_timeout: self.write_timeout,
      connect_timeout: self.connect_timeout,
      nodelay: self.nodelay,
      keepalive: self.keepalive,
      upstream_proxy: self.upstream_proxy,
      registry: self.registry,
      tls,
    }
  }
}

/// Dials upstream servers on behalf of the forwarding engine and the
/// tunnel establisher, applying the stream registry, timeouts and the
/// optional chained proxy uniformly.
pub struct Connector {
  read_timeout: Option<Duration>,
  write_timeout: Option<Duration>,
  connect_timeout: Option<Duration>,
  nodelay: bool,
  keepalive: bool,
  upstream_proxy: Option<http::Uri>,
  registry: Arc<dyn StreamRegistry>,
  tls: TlsConnector,
}

impl Connector {
  /// Creates a `ConnectorBuilder` to configure a `Connector`.
  pub fn builder() -> ConnectorBuilder {
    ConnectorBuilder::default()
  }

  /// Whether a chained upstream proxy is configured.
  pub fn is_chained(&self) -> bool {
    self.upstream_proxy.is_some()
  }

  /// Connect to a remote endpoint with addr
  async fn connect_with_addr(&self, addr: SocketAddr) -> std::io::Result<Socket> {
    let raw_socket = RawSocket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    raw_socket.set_nonblocking(true)?;
    let socket = TcpSocket::from_std_stream(raw_socket.into());
    if self.nodelay {
      socket.set_nodelay(self.nodelay)?;
    }
    if self.keepalive {
      socket.set_keepalive(self.keepalive)?;
    }
    let stream = match self.connect_timeout {
      None => socket.connect(addr).await?,
      Some(timeout) => tokio::time::timeout(timeout, socket.connect(addr)).await??,
    };
    Ok(Socket::from_tcp(
      stream,
      &self.registry,
      self.read_timeout,
      self.write_timeout,
    ))
  }

  /// Resolve a host and connect to the first reachable address.
  async fn connect_resolved(&self, host: &str, port: u16) -> Result<Socket> {
    let addrs: Vec<SocketAddr> = lookup_host((host, port))
      .await
      .map_err(|source| Error::HostResolution {
        host: host.to_string(),
        source,
      })?
      .collect();
    if addrs.is_empty() {
      return Err(Error::HostResolution {
        host: host.to_string(),
        source: std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses"),
      });
    }
    let mut last_err = None;
    for addr in addrs {
      match self.connect_with_addr(addr).await {
        Ok(socket) => return Ok(socket),
        Err(err) => last_err = Some(err),
      }
    }
    Err(Error::UpstreamConnect {
      addr: format!("{}:{}", host, port),
      source: last_err
        .unwrap_or_else(|| std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "unreachable")),
    })
  }

  /// Open a raw TCP connection to a host and port, without any TLS.
  ///
  /// Used for opaque CONNECT tunnels where the payload is relayed without
  /// parsing. A chained proxy is honored with a CONNECT through the chain.
  pub(crate) async fn connect_plain(&self, host: &str, port: u16) -> Result<Socket> {
    match &self.upstream_proxy {
      Some(proxy) => {
        let proxy_host = proxy
          .host()
          .ok_or_else(|| Error::protocol_violation("chained proxy URI has no host"))?;
        let proxy_port = proxy.port_u16().unwrap_or(8080);
        let mut socket = self.connect_resolved(proxy_host, proxy_port).await?;
        self.connect_through_chain(&mut socket, host, port).await?;
        Ok(socket)
      }
      None => self.connect_resolved(host, port).await,
    }
  }

  /// Open a (possibly TLS) connection to the target of an exchange.
  ///
  /// With a chained proxy configured, the TCP leg goes to the proxy; an
  /// `https` target is then reached with a CONNECT through the chain before
  /// the TLS upgrade. TLS handshake failures surface as
  /// [`Error::UpstreamTls`], distinguishable from generic connect failures
  /// so callers can suggest the trust-override mode.
  pub async fn connect(&self, target: &http::Uri) -> Result<Socket> {
    let host = target
      .host()
      .ok_or_else(|| Error::protocol_violation(format!("target has no host: {}", target)))?
      .trim_matches(|c| c == '[' || c == ']')
      .to_string();
    let https = target.scheme() == Some(&http::uri::Scheme::HTTPS);
    let port = target.port_u16().unwrap_or(if https { 443 } else { 80 });

    let socket = match &self.upstream_proxy {
      Some(proxy) => {
        let proxy_host = proxy
          .host()
          .ok_or_else(|| Error::protocol_violation("chained proxy URI has no host"))?;
        let proxy_port = proxy.port_u16().unwrap_or(8080);
        let mut socket = self.connect_resolved(proxy_host, proxy_port).await?;
        if https {
          self.connect_through_chain(&mut socket, &host, port).await?;
        }
        socket
      }
      None => self.connect_resolved(&host, port).await?,
    };

    if https {
      let domain = ServerName::try_from(host.clone())
        .map_err(|_| Error::upstream_tls(&host, "invalid server name"))?;
      let handshake = socket.connect_tls(&self.tls, domain);
      let upgraded = match self.connect_timeout {
        None => handshake.await,
        Some(t) => match tokio::time::timeout(t, handshake).await {
          Ok(result) => result,
          Err(elapsed) => Err(std::io::Error::new(std::io::ErrorKind::TimedOut, elapsed)),
        },
      };
      upgraded.map_err(|e| Error::upstream_tls(&host, e.to_string()))
    } else {
      Ok(socket)
    }
  }

  /// Issue a CONNECT on an established chained-proxy socket and wait for
  /// the 2xx reply.
  async fn connect_through_chain(&self, socket: &mut Socket, host: &str, port: u16) -> Result<()> {
    let connect = format!(
      "CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n\r\n",
      host = host,
      port = port
    );
    socket.write_all(connect.as_bytes()).await?;
    socket.flush().await?;
    // read the proxy reply head
    let mut reply = Vec::new();
    let mut byte = [0u8; 1];
    loop {
      let n = socket.read(&mut byte).await?;
      if n == 0 {
        return Err(new_io_error(
          std::io::ErrorKind::UnexpectedEof,
          "chained proxy closed during CONNECT",
        ));
      }
      reply.push(byte[0]);
      if reply.ends_with(b"\r\n\r\n") {
        break;
      }
      if reply.len() > 16 * 1024 {
        return Err(Error::protocol_violation("chained proxy CONNECT reply too large"));
      }
    }
    let status_line = String::from_utf8_lossy(&reply);
    let status = status_line
      .split_whitespace()
      .nth(1)
      .and_then(|s| s.parse::<u16>().ok())
      .unwrap_or(0);
    if !(200..300).contains(&status) {
      return Err(Error::UpstreamConnect {
        addr: format!("{}:{}", host, port),
        source: std::io::Error::new(
          std::io::ErrorKind::ConnectionRefused,
          format!("chained proxy refused CONNECT: {}", status),
        ),
      });
    }
    Ok(())
  }
}

impl Default for Connector {
  fn default() -> Self {
    ConnectorBuilder::default().build()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_resolution_failure_is_distinguishable() {
    let connector = Connector::builder()
      .connect_timeout(Some(Duration::from_secs(2)))
      .build();
    let target: http::Uri = "http://host.invalid./".parse().unwrap();
    match connector.connect(&target).await {
      Err(Error::HostResolution { host, .. }) => assert_eq!(host, "host.invalid."),
      other => panic!("expected HostResolution, got {:?}", other.map(|_| ())),
    }
  }

  #[tokio::test]
  async fn test_refused_connection_is_distinguishable() {
    // bind a listener to find a free port, then close it
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    let connector = Connector::builder()
      .connect_timeout(Some(Duration::from_secs(2)))
      .build();
    let target: http::Uri = format!("http://127.0.0.1:{}/", port).parse().unwrap();
    match connector.connect(&target).await {
      Err(Error::UpstreamConnect { addr, .. }) => {
        assert_eq!(addr, format!("127.0.0.1:{}", port))
      }
      other => panic!("expected UpstreamConnect, got {:?}", other.map(|_| ())),
    }
  }
}
