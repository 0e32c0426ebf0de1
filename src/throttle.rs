//! Stream-registration boundary for transparent bandwidth shaping.
//!
//! Every socket the proxy obtains — the accepted client connection and each
//! dialed upstream connection — is passed through a [`StreamRegistry`]
//! exactly once, before first use and beneath any TLS layering. An external
//! throttling collaborator implements the trait by returning a decorated
//! stream; the proxying logic never knows whether shaping is in effect.

use std::fmt::Debug;

use tokio::io::{AsyncRead, AsyncWrite};

/// Object-safe duplex stream bound.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin + Debug {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + Debug> AsyncStream for T {}

/// A boxed duplex stream, as handed to and returned from a registry.
pub type BoxedStream = Box<dyn AsyncStream>;

/// Decorates raw sockets at creation time.
///
/// This replaces instrumentation-by-subclassing: instead of overriding
/// socket methods, the registry returns an explicit wrapper composed around
/// the stream. Implementations must not read from or write to the stream
/// themselves outside of the wrapper they return.
pub trait StreamRegistry: Send + Sync {
  /// Wrap a freshly created duplex stream. Called exactly once per socket,
  /// covering both its read and write sides.
  fn register(&self, stream: BoxedStream) -> BoxedStream;
}

/// The default registry: no shaping, streams pass through untouched.
#[derive(Debug, Default)]
pub struct PassthroughRegistry;

impl StreamRegistry for PassthroughRegistry {
  fn register(&self, stream: BoxedStream) -> BoxedStream {
    stream
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::sync::Arc;

  #[derive(Debug, Default)]
  struct CountingRegistry {
    registered: AtomicUsize,
  }

  impl StreamRegistry for CountingRegistry {
    fn register(&self, stream: BoxedStream) -> BoxedStream {
      self.registered.fetch_add(1, Ordering::SeqCst);
      stream
    }
  }

  #[tokio::test]
  async fn test_registry_called_once_per_socket() {
    let registry: Arc<CountingRegistry> = Arc::new(CountingRegistry::default());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let client = tokio::net::TcpStream::connect(addr);
    let server = listener.accept();
    let (client, server) = tokio::join!(client, server);
    let (server_stream, _) = server.unwrap();

    let registry_dyn: Arc<dyn StreamRegistry> = registry.clone();
    let _a = crate::Socket::from_tcp(client.unwrap(), &registry_dyn, None, None);
    let _b = crate::Socket::from_tcp(server_stream, &registry_dyn, None, None);
    assert_eq!(registry.registered.load(Ordering::SeqCst), 2);
  }
}
