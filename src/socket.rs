use std::io::Error;
use std::net::SocketAddr;
use std::ops::{Deref, DerefMut};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::throttle::{BoxedStream, StreamRegistry};

/// A duplex byte stream carried by the proxy, possibly TLS on either leg.
///
/// `ServerTls` is the impersonation leg (the proxy terminating a client's
/// TLS session with a minted certificate); `ClientTls` is the re-originated
/// session to the real upstream server.
#[derive(Debug)]
pub enum MaybeTlsStream {
  /// raw bytes
  Plain(BoxedStream),
  /// TLS terminated by the proxy with a minted certificate
  ServerTls(Box<tokio_rustls::server::TlsStream<BoxedStream>>),
  /// TLS originated by the proxy toward the upstream server
  ClientTls(Box<tokio_rustls::client::TlsStream<BoxedStream>>),
}

/// Socket
///
/// Wraps a registered stream with per-operation read/write timeouts so a
/// stalled peer cannot pin a connection worker forever.
#[derive(Debug)]
pub struct Socket {
  inner: MaybeTlsStream,
  peer_addr: Option<SocketAddr>,
  read_timeout: Option<Duration>,
  write_timeout: Option<Duration>,
}

impl Socket {
  /// Wrap an accepted or dialed TCP stream.
  ///
  /// The stream is passed through the registry hook exactly once, before
  /// first use, so bandwidth shaping stays transparent to the proxying
  /// logic.
  pub fn from_tcp(
    stream: TcpStream,
    registry: &Arc<dyn StreamRegistry>,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
  ) -> Self {
    let peer_addr = stream.peer_addr().ok();
    let registered = registry.register(Box::new(stream));
    Self {
      inner: MaybeTlsStream::Plain(registered),
      peer_addr,
      read_timeout,
      write_timeout,
    }
  }

  /// Remote address of the underlying TCP stream, captured at wrap time.
  pub fn peer_addr(&self) -> Option<SocketAddr> {
    self.peer_addr
  }

  /// Terminate TLS on this socket, impersonating the server.
  ///
  /// Only meaningful on a plain socket; a socket that already carries TLS
  /// is returned unchanged.
  pub(crate) async fn accept_tls(self, acceptor: &TlsAcceptor) -> Result<Self, Error> {
    match self.inner {
      MaybeTlsStream::Plain(stream) => Ok(Self {
        inner: MaybeTlsStream::ServerTls(Box::new(acceptor.accept(stream).await?)),
        peer_addr: self.peer_addr,
        read_timeout: self.read_timeout,
        write_timeout: self.write_timeout,
      }),
      other => Ok(Self {
        inner: other,
        peer_addr: self.peer_addr,
        read_timeout: self.read_timeout,
        write_timeout: self.write_timeout,
      }),
    }
  }

  /// Upgrade this socket to TLS toward the upstream server.
  pub(crate) async fn connect_tls(
    self,
    connector: &TlsConnector,
    domain: ServerName<'static>,
  ) -> Result<Self, Error> {
    match self.inner {
      MaybeTlsStream::Plain(stream) => Ok(Self {
        inner: MaybeTlsStream::ClientTls(Box::new(connector.connect(domain, stream).await?)),
        peer_addr: self.peer_addr,
        read_timeout: self.read_timeout,
        write_timeout: self.write_timeout,
      }),
      other => Ok(Self {
        inner: other,
        peer_addr: self.peer_addr,
        read_timeout: self.read_timeout,
        write_timeout: self.write_timeout,
      }),
    }
  }
}

impl AsyncRead for Socket {
  fn poll_read(
    mut self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<std::io::Result<()>> {
    Pin::new(&mut self.inner).poll_read(cx, buf)
  }
}

impl AsyncWrite for Socket {
  fn poll_write(
    mut self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<Result<usize, Error>> {
    Pin::new(&mut self.inner).poll_write(cx, buf)
  }

  fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
    Pin::new(&mut self.inner).poll_flush(cx)
  }

  fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
    Pin::new(&mut self.inner).poll_shutdown(cx)
  }
}

impl AsyncRead for MaybeTlsStream {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<std::io::Result<()>> {
    match self.get_mut() {
      MaybeTlsStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
      MaybeTlsStream::ServerTls(stream) => Pin::new(stream).poll_read(cx, buf),
      MaybeTlsStream::ClientTls(stream) => Pin::new(stream).poll_read(cx, buf),
    }
  }
}

impl AsyncWrite for MaybeTlsStream {
  fn poll_write(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<Result<usize, Error>> {
    match self.get_mut() {
      MaybeTlsStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
      MaybeTlsStream::ServerTls(stream) => Pin::new(stream).poll_write(cx, buf),
      MaybeTlsStream::ClientTls(stream) => Pin::new(stream).poll_write(cx, buf),
    }
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
    match self.get_mut() {
      MaybeTlsStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
      MaybeTlsStream::ServerTls(stream) => Pin::new(stream).poll_flush(cx),
      MaybeTlsStream::ClientTls(stream) => Pin::new(stream).poll_flush(cx),
    }
  }
  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
    match self.get_mut() {
      MaybeTlsStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
      MaybeTlsStream::ServerTls(stream) => Pin::new(stream).poll_shutdown(cx),
      MaybeTlsStream::ClientTls(stream) => Pin::new(stream).poll_shutdown(cx),
    }
  }
}

impl Socket {
  /// Pulls some bytes from this source into the specified buffer, returning
  /// how many bytes were read.
  pub async fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
    match self.read_timeout {
      None => AsyncReadExt::read(self.deref_mut(), buf).await,
      Some(t) => tokio::time::timeout(t, AsyncReadExt::read(self.deref_mut(), buf)).await?,
    }
  }
  /// Reads the exact number of bytes required to fill buf.
  pub async fn read_exact(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
    match self.read_timeout {
      None => AsyncReadExt::read_exact(self.deref_mut(), buf).await,
      Some(t) => tokio::time::timeout(t, AsyncReadExt::read_exact(self.deref_mut(), buf)).await?,
    }
  }
  /// Attempts to write an entire buffer into this writer.
  pub async fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
    match self.write_timeout {
      None => AsyncWriteExt::write_all(self.deref_mut(), buf).await,
      Some(t) => tokio::time::timeout(t, AsyncWriteExt::write_all(self.deref_mut(), buf)).await?,
    }
  }
  /// Flushes this output stream, ensuring that all intermediately buffered
  /// contents reach their destination.
  pub async fn flush(&mut self) -> std::io::Result<()> {
    match self.write_timeout {
      None => AsyncWriteExt::flush(self.deref_mut()).await,
      Some(t) => tokio::time::timeout(t, AsyncWriteExt::flush(self.deref_mut())).await?,
    }
  }
  /// Shuts down the output stream, ensuring that the value can be dropped
  /// cleanly.
  pub async fn shutdown(&mut self) -> std::io::Result<()> {
    match self.write_timeout {
      None => AsyncWriteExt::shutdown(self.deref_mut()).await,
      Some(t) => tokio::time::timeout(t, AsyncWriteExt::shutdown(self.deref_mut())).await?,
    }
  }
}

impl Deref for Socket {
  type Target = MaybeTlsStream;

  fn deref(&self) -> &Self::Target {
    &self.inner
  }
}

impl DerefMut for Socket {
  fn deref_mut(&mut self) -> &mut Self::Target {
    &mut self.inner
  }
}
