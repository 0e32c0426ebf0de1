//! Proxy configuration and the connection-handling entry points.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::net::{TcpListener, TcpStream};

use crate::ca::{CertificateAuthority, HostCertificateCache};
use crate::capture::{CaptureSink, NoopSink};
use crate::connector::Connector;
use crate::errors::{Error, Result};
use crate::exchange::Exchange;
use crate::forward::{error_response, ForwardingEngine};
use crate::interceptor::{InterceptorPipeline, RequestInterceptor, ResponseInterceptor};
use crate::request::RequestReader;
use crate::socket::Socket;
use crate::throttle::{PassthroughRegistry, StreamRegistry};
use crate::tunnel::TunnelEstablisher;

/// Configuration for the proxy.
///
/// The allow/deny sets are plain values constructed once here and never
/// shared mutably: after [`Proxy::serve`] starts they are read-only.
#[derive(Clone, Debug)]
pub struct ProxyConfig {
  /// Directory where the root CA certificate and key are stored.
  pub ca_storage_path: PathBuf,
  /// Intercept HTTPS CONNECTs instead of relaying them opaquely.
  pub interception: bool,
  /// Suppress the `Via` header on forwarded requests.
  pub anonymous: bool,
  /// Route upstream traffic through a chained proxy. Explicit only;
  /// ambient proxy environment variables are never consulted.
  pub upstream_proxy: Option<http::Uri>,
  /// Accept any certificate on the upstream TLS leg.
  pub trust_upstream_certs: bool,
  /// Timeout for the connect phase of upstream sockets.
  pub connect_timeout: Option<Duration>,
  /// Per-operation read/write timeout on both legs.
  pub read_timeout: Option<Duration>,
  /// How long a keep-alive connection or an opaque tunnel may sit idle.
  pub idle_timeout: Option<Duration>,
  /// Whether response-interceptor mutations are applied to what the client
  /// receives. When off, interceptors still run but the original upstream
  /// response is delivered unchanged.
  pub response_volatile: bool,
  /// Abort an exchange when an interceptor fails, instead of logging and
  /// skipping the failed interceptor.
  pub abort_on_interceptor_error: bool,
  /// Ports a CONNECT may target.
  pub allowed_connect_ports: HashSet<u16>,
  /// Hosts (exact or parent-domain match) that may never be proxied.
  pub denied_hosts: Vec<String>,
  /// CONNECT targets relayed opaquely even with interception on, e.g.
  /// proxy-reserved endpoints.
  pub exempt_hosts: Vec<String>,
  /// Referer values containing this marker are stripped before forwarding,
  /// so links back to the proxy's own control endpoints never loop.
  pub control_referer_marker: Option<String>,
}

impl Default for ProxyConfig {
  fn default() -> Self {
    Self {
      ca_storage_path: PathBuf::from(".periscope"),
      interception: true,
      anonymous: false,
      upstream_proxy: None,
      trust_upstream_certs: false,
      connect_timeout: Some(Duration::from_secs(10)),
      read_timeout: Some(Duration::from_secs(30)),
      idle_timeout: Some(Duration::from_secs(60)),
      response_volatile: false,
      abort_on_interceptor_error: false,
      allowed_connect_ports: [80, 443, 4444, 8000, 8080, 8443, 8888].into_iter().collect(),
      denied_hosts: Vec::new(),
      exempt_hosts: Vec::new(),
      control_referer_marker: None,
    }
  }
}

impl ProxyConfig {
  /// Whether a CONNECT to this host and port is allowed at all.
  pub fn is_connect_allowed(&self, host: &str, port: u16) -> bool {
    self.allowed_connect_ports.contains(&port) && !self.is_denied(host)
  }

  fn is_denied(&self, host: &str) -> bool {
    self
      .denied_hosts
      .iter()
      .any(|denied| host == denied || host.ends_with(&format!(".{denied}")))
  }

  /// Whether an intercepted proxy should relay this host opaquely.
  pub fn is_exempt(&self, host: &str) -> bool {
    self
      .exempt_hosts
      .iter()
      .any(|exempt| host == exempt || host.ends_with(&format!(".{exempt}")))
  }
}

pub(crate) struct ProxyInner {
  pub(crate) config: ProxyConfig,
  pub(crate) cache: HostCertificateCache,
  pub(crate) pipeline: InterceptorPipeline,
  pub(crate) sink: Arc<dyn CaptureSink>,
  pub(crate) registry: Arc<dyn StreamRegistry>,
  pub(crate) engine: ForwardingEngine,
}

/// A programmable man-in-the-middle proxy.
///
/// Interceptors and collaborators are registered during setup; traffic
/// begins when the proxy is handed a listener (or individual accepted
/// connections). The owning process keeps the handle returned by
/// [`Proxy::handler`] (or the task driving [`Proxy::serve`]) and is
/// responsible for orderly shutdown.
///
/// # Example
///
/// ```no_run
/// use periscope::{Proxy, ProxyConfig};
///
/// #[tokio::main(flavor = "multi_thread")]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///   let proxy = Proxy::new(ProxyConfig::default()).await?;
///   let listener = tokio::net::TcpListener::bind("127.0.0.1:8080").await?;
///   proxy.serve(listener).await?;
///   Ok(())
/// }
/// ```
pub struct Proxy {
  config: ProxyConfig,
  ca: Arc<CertificateAuthority>,
  pipeline: InterceptorPipeline,
  sink: Arc<dyn CaptureSink>,
  registry: Arc<dyn StreamRegistry>,
}

impl Proxy {
  /// Create a proxy with the given configuration.
  ///
  /// Loads or generates the root CA; a failure to establish the root is
  /// fatal, since interception would be impossible.
  pub async fn new(config: ProxyConfig) -> Result<Proxy> {
    let ca = Arc::new(CertificateAuthority::new(&config.ca_storage_path).await?);
    Ok(Proxy {
      pipeline: InterceptorPipeline::new(config.abort_on_interceptor_error),
      config,
      ca,
      sink: Arc::new(NoopSink),
      registry: Arc::new(PassthroughRegistry),
    })
  }

  /// Append a request interceptor. Call before serving traffic.
  pub fn add_request_interceptor(&mut self, interceptor: Arc<dyn RequestInterceptor>) {
    self.pipeline.add_request_interceptor(interceptor);
  }

  /// Append a response interceptor. Call before serving traffic.
  pub fn add_response_interceptor(&mut self, interceptor: Arc<dyn ResponseInterceptor>) {
    self.pipeline.add_response_interceptor(interceptor);
  }

  /// Install the capture collaborator fed at the post-request and
  /// post-response hook points.
  pub fn set_capture_sink(&mut self, sink: Arc<dyn CaptureSink>) {
    self.sink = sink;
  }

  /// Install the stream registry every client and upstream socket is
  /// passed through before first use.
  pub fn set_stream_registry(&mut self, registry: Arc<dyn StreamRegistry>) {
    self.registry = registry;
  }

  /// Get the CA certificate in PEM format for client installation.
  pub fn ca_cert_pem(&self) -> Result<String> {
    self.ca.ca_cert_pem()
  }

  /// Get the CA certificate path.
  pub fn ca_cert_path(&self) -> PathBuf {
    self.ca.ca_cert_path()
  }

  /// Number of leaf certificates issued so far, for observability.
  pub fn issued_certificates(&self) -> u64 {
    self.ca.issued_count()
  }

  /// Freeze registrations into a cloneable connection handler for use with
  /// an external listener/acceptor.
  pub fn handler(self) -> ConnectionHandler {
    let connector = Connector::builder()
      .connect_timeout(self.config.connect_timeout)
      .read_timeout(self.config.read_timeout)
      .write_timeout(self.config.read_timeout)
      .trust_upstream_certs(self.config.trust_upstream_certs)
      .upstream_proxy(self.config.upstream_proxy.clone())
      .registry(self.registry.clone())
      .build();
    let engine = ForwardingEngine::new(
      connector,
      self.config.anonymous,
      self.config.control_referer_marker.clone(),
      self.config.read_timeout,
    );
    ConnectionHandler {
      inner: Arc::new(ProxyInner {
        cache: HostCertificateCache::new(self.ca),
        pipeline: self.pipeline,
        sink: self.sink,
        registry: self.registry,
        engine,
        config: self.config,
      }),
    }
  }

  /// Accept connections from the listener forever, spawning one task per
  /// accepted client connection.
  pub async fn serve(self, listener: TcpListener) -> Result<()> {
    let handler = self.handler();
    loop {
      match listener.accept().await {
        Ok((stream, peer_addr)) => {
          let handler = handler.clone();
          tokio::spawn(async move {
            if let Err(e) = handler.handle(stream, peer_addr).await {
              tracing::debug!("connection from {} ended with error: {}", peer_addr, e);
            }
          });
        }
        Err(e) => {
          tracing::error!("failed to accept connection: {}", e);
        }
      }
    }
  }
}

/// Handles accepted connections; cheap to clone across tasks.
#[derive(Clone)]
pub struct ConnectionHandler {
  inner: Arc<ProxyInner>,
}

impl ConnectionHandler {
  /// Drive one accepted client connection to completion.
  ///
  /// Handles sequential keep-alive exchanges; a CONNECT hands the
  /// connection over to the tunnel establisher. Errors abort only this
  /// connection.
  pub async fn handle(&self, stream: TcpStream, peer_addr: SocketAddr) -> Result<()> {
    let socket = Socket::from_tcp(
      stream,
      &self.inner.registry,
      self.inner.config.read_timeout,
      self.inner.config.read_timeout,
    );
    let mut reader = BufReader::new(socket);
    loop {
      let request = match self.inner.read_request(&mut reader, None).await {
        Ok(Some(request)) => request,
        Ok(None) => return Ok(()),
        Err(err) => return self.inner.reject_malformed(&mut reader, err).await,
      };
      if request.method() == http::Method::CONNECT {
        // the client won't send TLS bytes before our 200, so nothing is
        // sitting in the parse buffer; hand the raw socket to the tunnel
        let socket = reader.into_inner();
        let target = request.uri().clone();
        return TunnelEstablisher::new(self.inner.clone())
          .establish(socket, &target)
          .await;
      }
      let keep_alive = self
        .inner
        .handle_exchange(request, Some(peer_addr), &mut reader)
        .await?;
      if !keep_alive {
        return Ok(());
      }
    }
  }
}

impl ProxyInner {
  /// Read the next request off a connection, bounded by the idle timeout.
  /// `Ok(None)` means the connection is done (clean close or idle).
  pub(crate) async fn read_request<R>(
    &self,
    reader: &mut R,
    base_authority: Option<&str>,
  ) -> Result<Option<crate::Request>>
  where
    R: tokio::io::AsyncBufRead + Unpin,
  {
    let read = RequestReader::new(reader, base_authority).read();
    match self.config.idle_timeout {
      None => read.await,
      Some(idle) => match tokio::time::timeout(idle, read).await {
        Ok(result) => result,
        Err(_elapsed) => Ok(None),
      },
    }
  }

  /// Sequential exchanges over an established (decrypted) TLS session.
  pub(crate) async fn serve_intercepted(&self, socket: Socket, authority: String) -> Result<()> {
    let peer_addr = socket.peer_addr();
    let mut reader = BufReader::new(socket);
    loop {
      let request = match self.read_request(&mut reader, Some(&authority)).await {
        Ok(Some(request)) => request,
        Ok(None) => return Ok(()),
        Err(err) => return self.reject_malformed(&mut reader, err).await,
      };
      let keep_alive = self.handle_exchange(request, peer_addr, &mut reader).await?;
      if !keep_alive {
        return Ok(());
      }
    }
  }

  /// Run one exchange: request interceptors, the upstream call, response
  /// interceptors, the volatility decision, and the client write.
  ///
  /// Returns whether the connection may be reused for another exchange.
  pub(crate) async fn handle_exchange<S>(
    &self,
    request: crate::Request,
    peer_addr: Option<SocketAddr>,
    client: &mut S,
  ) -> Result<bool>
  where
    S: AsyncRead + AsyncWrite + Unpin,
  {
    let close_requested = wants_close(request.headers());
    let mut exchange = Exchange::new(request, peer_addr);
    exchange.mark_request_received();

    if let Err(err) = self.pipeline.run_request_interceptors(&mut exchange).await {
      return self.deliver_error(&mut exchange, client, &err).await;
    }
    self.sink.on_request(&exchange);

    if let Err(err) = self.engine.call_upstream(&mut exchange).await {
      return self.deliver_error(&mut exchange, client, &err).await;
    }

    // with volatility off, interceptors observe and may mutate freely, but
    // the pristine upstream response is what the client receives
    let pristine = if self.config.response_volatile {
      None
    } else {
      exchange.response().cloned()
    };
    if let Err(err) = self.pipeline.run_response_interceptors(&mut exchange).await {
      return self.deliver_error(&mut exchange, client, &err).await;
    }
    if let Some(pristine) = pristine {
      exchange.set_response(pristine);
    }

    let method = exchange.request().method().clone();
    let response = exchange
      .response()
      .cloned()
      .unwrap_or_else(|| error_response(&Error::protocol_violation("response went missing")));
    let bytes_copied = self.engine.write_response(client, &response, &method).await?;
    exchange.mark_completed(bytes_copied);
    self.sink.on_response(&exchange);

    let close_response = wants_close(response.headers());
    Ok(!(close_requested || close_response))
  }

  /// Malformed framing gets a best-effort 400 before the connection is
  /// torn down; the error still propagates to the connection task.
  async fn reject_malformed<S>(&self, client: &mut S, error: Error) -> Result<()>
  where
    S: AsyncWrite + Unpin,
  {
    use tokio::io::AsyncWriteExt;
    let response = error_response(&error);
    client.write_all(&response.to_raw()).await.ok();
    client.flush().await.ok();
    Err(error)
  }

  /// Best-effort error response; the exchange is recorded with what the
  /// client actually received, and the connection closes afterwards.
  async fn deliver_error<S>(
    &self,
    exchange: &mut Exchange,
    client: &mut S,
    error: &Error,
  ) -> Result<bool>
  where
    S: AsyncRead + AsyncWrite + Unpin,
  {
    tracing::debug!("exchange for {} failed: {}", exchange.request().uri(), error);
    let response = error_response(error);
    let method = exchange.request().method().clone();
    exchange.set_response(response.clone());
    let bytes_copied = self.engine.write_response(client, &response, &method).await?;
    exchange.mark_completed(bytes_copied);
    self.sink.on_response(exchange);
    Ok(false)
  }
}

fn wants_close(headers: &http::HeaderMap) -> bool {
  headers
    .get(http::header::CONNECTION)
    .and_then(|v| v.to_str().ok())
    .map(|v| v.to_ascii_lowercase().contains("close"))
    .unwrap_or(false)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_default_config() {
    let config = ProxyConfig::default();
    assert!(config.interception);
    assert!(!config.anonymous);
    assert!(!config.response_volatile);
    assert!(config.allowed_connect_ports.contains(&443));
    assert!(!config.allowed_connect_ports.contains(&25));
  }

  #[test]
  fn test_connect_policy() {
    let config = ProxyConfig {
      denied_hosts: vec!["blocked.example".to_string()],
      ..ProxyConfig::default()
    };
    assert!(config.is_connect_allowed("example.com", 443));
    assert!(!config.is_connect_allowed("example.com", 25));
    assert!(!config.is_connect_allowed("blocked.example", 443));
    assert!(!config.is_connect_allowed("deep.blocked.example", 443));
  }

  #[test]
  fn test_exempt_hosts() {
    let config = ProxyConfig {
      exempt_hosts: vec!["management.local".to_string()],
      ..ProxyConfig::default()
    };
    assert!(config.is_exempt("management.local"));
    assert!(config.is_exempt("api.management.local"));
    assert!(!config.is_exempt("example.com"));
  }

  #[tokio::test]
  async fn test_proxy_creation_and_ca_export() {
    let dir = std::env::temp_dir().join("periscope-test-proxy-create");
    if dir.exists() {
      std::fs::remove_dir_all(&dir).ok();
    }
    let config = ProxyConfig {
      ca_storage_path: dir.clone(),
      ..ProxyConfig::default()
    };
    let proxy = Proxy::new(config).await.unwrap();
    let pem = proxy.ca_cert_pem().unwrap();
    assert!(pem.contains("BEGIN CERTIFICATE"));
    assert!(proxy.ca_cert_path().exists());
    std::fs::remove_dir_all(&dir).ok();
  }
}
