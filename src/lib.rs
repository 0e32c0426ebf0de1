#![deny(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! # periscope
//!
//! The `periscope` crate provides a programmable man-in-the-middle
//! HTTP/HTTPS [`Proxy`].
//!
//! It sits between a client and the open internet, transparently decrypts
//! TLS traffic by impersonating the destination host with a locally-minted
//! certificate, and lets registered observers inspect or rewrite every
//! request and response before it is relayed. It is used for testing,
//! traffic shaping, and HAR-based performance measurement.
//!
//! - Automatic root CA generation and per-host leaf [certificates](ca)
//! - CONNECT handling: opaque tunnels or upgrade-to-TLS [interception](tunnel::TunnelState)
//! - An ordered [interceptor pipeline](interceptor) over mutable exchanges
//! - [Forwarding](Proxy) with proxy header hygiene and streaming bodies
//! - [Capture hooks](capture) shaped for HAR assembly
//! - A [stream registry](throttle) boundary for transparent throttling
//!
//! ## Running a proxy
//!
//! ```no_run
//! use std::sync::Arc;
//! use periscope::{Exchange, Proxy, ProxyConfig, ResponseInterceptor};
//!
//! struct Tag;
//!
//! #[async_trait::async_trait]
//! impl ResponseInterceptor for Tag {
//!   async fn intercept_response(&self, exchange: &mut Exchange) -> periscope::Result<()> {
//!     if let Some(response) = exchange.response_mut() {
//!       response.headers_mut().insert("x-proxied", "1".parse().unwrap());
//!     }
//!     Ok(())
//!   }
//! }
//!
//! #[tokio::main(flavor = "multi_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!   let mut proxy = Proxy::new(ProxyConfig::default()).await?;
//!   proxy.add_response_interceptor(Arc::new(Tag));
//!   let listener = tokio::net::TcpListener::bind("127.0.0.1:8080").await?;
//!   proxy.serve(listener).await?;
//!   Ok(())
//! }
//! ```
//!
//! ## Trusting the proxy
//!
//! Interception only works when the client trusts the proxy's root
//! certificate; export it with [`Proxy::ca_cert_pem`] and install it in the
//! client's trust store.
//!
//! ## Response volatility
//!
//! Response interceptors always run, but whether their mutations reach the
//! client is controlled by [`ProxyConfig::response_volatile`]. With the
//! flag off, interceptors only observe (e.g. to count or record) while the
//! original upstream response is delivered unchanged.

mod body;
/// certificate authority and per-host certificate cache
pub mod ca;
/// capture hooks for HAR assembly
pub mod capture;
mod connector;
mod errors;
mod exchange;
/// traffic interception interfaces
pub mod interceptor;
mod forward;
mod proxy;
mod request;
mod response;
mod socket;
/// stream-registration boundary for bandwidth shaping
pub mod throttle;
mod tls;
/// CONNECT tunnels and TLS interception
pub mod tunnel;

pub use body::Body;
pub use ca::{CertificateAuthority, HostCertificate, HostCertificateCache};
pub use capture::{CaptureSink, ExchangeRecord, MemorySink};
pub use connector::{Connector, ConnectorBuilder};
pub use errors::{Error, Result};
pub use exchange::{Exchange, Timings};
pub use http::header;
pub use http::uri;
pub use http::Method;
pub use http::{StatusCode, Version};
pub use interceptor::{
  InterceptorPipeline, LoggingInterceptor, RequestInterceptor, ResponseInterceptor,
};
pub use proxy::{ConnectionHandler, Proxy, ProxyConfig};
pub use request::Request;
pub use response::Response;
pub use socket::{MaybeTlsStream, Socket};
pub use throttle::{PassthroughRegistry, StreamRegistry};
pub use tunnel::TunnelState;

pub(crate) const CR_LF: &[u8] = &[13, 10];
pub(crate) const SPACE: &[u8] = &[32];
pub(crate) const COLON_SPACE: &[u8] = &[58, 32];
