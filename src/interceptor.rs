//! Traffic interception and modification interfaces.

use std::sync::Arc;

use crate::errors::{Error, Result};
use crate::exchange::Exchange;

/// Trait for inspecting and rewriting requests before they are forwarded.
///
/// Request interceptors may rewrite the method, target URI, headers and
/// body — for example to redirect an exchange to a stub backend.
#[async_trait::async_trait]
pub trait RequestInterceptor: Send + Sync {
  /// Inspect or mutate the exchange before the upstream call.
  ///
  /// The exchange's response is not yet available at this point.
  async fn intercept_request(&self, exchange: &mut Exchange) -> Result<()>;
}

/// Trait for inspecting and rewriting responses after the upstream call.
///
/// Response interceptors may rewrite the status code, reason phrase,
/// headers and body. Whether their mutations reach the client is governed
/// by the proxy's response-volatility flag.
#[async_trait::async_trait]
pub trait ResponseInterceptor: Send + Sync {
  /// Inspect or mutate the exchange after the upstream response arrived.
  async fn intercept_response(&self, exchange: &mut Exchange) -> Result<()>;
}

/// An ordered, append-only pipeline of interceptors.
///
/// Interceptors run synchronously in registration order for every proxied
/// exchange; mutations are last-writer-wins across the chain. Registration
/// happens during setup, before the proxy accepts traffic, so the lists are
/// read-only on the hot path and need no locking.
pub struct InterceptorPipeline {
  request_interceptors: Vec<Arc<dyn RequestInterceptor>>,
  response_interceptors: Vec<Arc<dyn ResponseInterceptor>>,
  /// when set, an interceptor error aborts the exchange instead of being
  /// logged and skipped
  abort_on_error: bool,
}

impl InterceptorPipeline {
  /// Create an empty pipeline.
  pub fn new(abort_on_error: bool) -> Self {
    Self {
      request_interceptors: Vec::new(),
      response_interceptors: Vec::new(),
      abort_on_error,
    }
  }

  /// Append a request interceptor. Ordering is significant and preserved.
  pub fn add_request_interceptor(&mut self, interceptor: Arc<dyn RequestInterceptor>) {
    self.request_interceptors.push(interceptor);
  }

  /// Append a response interceptor. Ordering is significant and preserved.
  pub fn add_response_interceptor(&mut self, interceptor: Arc<dyn ResponseInterceptor>) {
    self.response_interceptors.push(interceptor);
  }

  /// Whether any interceptors are registered.
  pub fn has_interceptors(&self) -> bool {
    !self.request_interceptors.is_empty() || !self.response_interceptors.is_empty()
  }

  /// Run every request interceptor over the exchange, in registration
  /// order.
  ///
  /// A failing interceptor is advisory: it is logged and skipped, and the
  /// rest of the chain still runs — unless the pipeline was built with
  /// abort-on-error, in which case the error is returned and the exchange
  /// fails.
  pub async fn run_request_interceptors(&self, exchange: &mut Exchange) -> Result<()> {
    for interceptor in &self.request_interceptors {
      if let Err(e) = interceptor.intercept_request(exchange).await {
        if self.abort_on_error {
          return Err(Error::Interceptor(e.to_string()));
        }
        tracing::warn!("request interceptor failed, skipping: {}", e);
      }
    }
    Ok(())
  }

  /// Run every response interceptor over the exchange, in registration
  /// order. Failure semantics match [`run_request_interceptors`].
  ///
  /// [`run_request_interceptors`]: InterceptorPipeline::run_request_interceptors
  pub async fn run_response_interceptors(&self, exchange: &mut Exchange) -> Result<()> {
    for interceptor in &self.response_interceptors {
      if let Err(e) = interceptor.intercept_response(exchange).await {
        if self.abort_on_error {
          return Err(Error::Interceptor(e.to_string()));
        }
        tracing::warn!("response interceptor failed, skipping: {}", e);
      }
    }
    Ok(())
  }
}

impl Default for InterceptorPipeline {
  fn default() -> Self {
    Self::new(false)
  }
}

/// An interceptor that logs traffic through `tracing`.
pub struct LoggingInterceptor;

#[async_trait::async_trait]
impl RequestInterceptor for LoggingInterceptor {
  async fn intercept_request(&self, exchange: &mut Exchange) -> Result<()> {
    tracing::info!(
      "request: {} {}",
      exchange.request().method(),
      exchange.request().uri()
    );
    for (name, value) in exchange.request().headers() {
      tracing::debug!("  {}: {:?}", name, value);
    }
    Ok(())
  }
}

#[async_trait::async_trait]
impl ResponseInterceptor for LoggingInterceptor {
  async fn intercept_response(&self, exchange: &mut Exchange) -> Result<()> {
    if let Some(response) = exchange.response() {
      tracing::info!("response: {}", response.status_code());
      for (name, value) in response.headers() {
        tracing::debug!("  {}: {:?}", name, value);
      }
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{Request, Response};
  use std::sync::Mutex;

  struct Tag {
    name: &'static str,
    seen: Arc<Mutex<Vec<&'static str>>>,
  }

  #[async_trait::async_trait]
  impl RequestInterceptor for Tag {
    async fn intercept_request(&self, _exchange: &mut Exchange) -> Result<()> {
      self.seen.lock().unwrap().push(self.name);
      Ok(())
    }
  }

  #[async_trait::async_trait]
  impl ResponseInterceptor for Tag {
    async fn intercept_response(&self, _exchange: &mut Exchange) -> Result<()> {
      self.seen.lock().unwrap().push(self.name);
      Ok(())
    }
  }

  struct Failing;

  #[async_trait::async_trait]
  impl RequestInterceptor for Failing {
    async fn intercept_request(&self, _exchange: &mut Exchange) -> Result<()> {
      Err(Error::Interceptor("boom".to_string()))
    }
  }

  fn exchange() -> Exchange {
    let request: Request = Request::builder()
      .uri("http://example.com/")
      .body(bytes::Bytes::new())
      .unwrap()
      .into();
    let mut exchange = Exchange::new(request, None);
    exchange.set_response(Response::default());
    exchange
  }

  #[tokio::test]
  async fn test_interceptors_run_in_registration_order() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut pipeline = InterceptorPipeline::default();
    pipeline.add_request_interceptor(Arc::new(Tag {
      name: "A",
      seen: seen.clone(),
    }));
    pipeline.add_request_interceptor(Arc::new(Tag {
      name: "B",
      seen: seen.clone(),
    }));
    pipeline.add_response_interceptor(Arc::new(Tag {
      name: "C",
      seen: seen.clone(),
    }));
    pipeline.add_response_interceptor(Arc::new(Tag {
      name: "D",
      seen: seen.clone(),
    }));
    let mut exchange = exchange();
    pipeline.run_request_interceptors(&mut exchange).await.unwrap();
    pipeline.run_response_interceptors(&mut exchange).await.unwrap();
    assert_eq!(*seen.lock().unwrap(), vec!["A", "B", "C", "D"]);
  }

  #[tokio::test]
  async fn test_failing_interceptor_is_skipped_by_default() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut pipeline = InterceptorPipeline::default();
    pipeline.add_request_interceptor(Arc::new(Failing));
    pipeline.add_request_interceptor(Arc::new(Tag {
      name: "after",
      seen: seen.clone(),
    }));
    let mut exchange = exchange();
    pipeline.run_request_interceptors(&mut exchange).await.unwrap();
    assert_eq!(*seen.lock().unwrap(), vec!["after"]);
  }

  #[tokio::test]
  async fn test_failing_interceptor_aborts_when_configured() {
    let mut pipeline = InterceptorPipeline::new(true);
    pipeline.add_request_interceptor(Arc::new(Failing));
    let mut exchange = exchange();
    let result = pipeline.run_request_interceptors(&mut exchange).await;
    assert!(matches!(result, Err(Error::Interceptor(_))));
  }
}
