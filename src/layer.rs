//! Tower middleware that gates a service on a bucket check.
//!
//! The caller supplies a closure mapping each request to a [`CheckRequest`]
//! (bucket, key, and token cost). Rejected requests never reach the inner
//! service.

use crate::engine::AccountingEngine;
use crate::protocol::{CheckRequest, RejectReason};
use futures::future::BoxFuture;
use std::fmt;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower_layer::Layer;
use tower_service::Service;
use tracing::trace;

/// Error returned by [`CheckService`].
#[derive(Debug, Clone, PartialEq)]
pub enum LayerError<E> {
    /// The check failed; `next` is seconds until a retry could pass (-1 if never).
    RateLimited { next: f64, reason: RejectReason },
    /// The inner service failed.
    Inner(E),
}

impl<E: fmt::Display> fmt::Display for LayerError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RateLimited { next, reason } => {
                write!(f, "rate limited ({reason}); next request allowed in {next}s")
            }
            Self::Inner(e) => write!(f, "{e}"),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for LayerError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Inner(e) => Some(e),
            Self::RateLimited { .. } => None,
        }
    }
}

impl<E> LayerError<E> {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }
}

/// Layer producing [`CheckService`]s that share one engine.
pub struct CheckLayer<F> {
    engine: Arc<AccountingEngine>,
    to_request: Arc<F>,
}

impl<F> CheckLayer<F> {
    pub fn new(engine: Arc<AccountingEngine>, to_request: F) -> Self {
        Self { engine, to_request: Arc::new(to_request) }
    }
}

impl<F> Clone for CheckLayer<F> {
    fn clone(&self) -> Self {
        Self { engine: self.engine.clone(), to_request: self.to_request.clone() }
    }
}

impl<F> fmt::Debug for CheckLayer<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CheckLayer").field("engine", &self.engine).finish_non_exhaustive()
    }
}

impl<S, F> Layer<S> for CheckLayer<F> {
    type Service = CheckService<S, F>;

    fn layer(&self, inner: S) -> Self::Service {
        CheckService { inner, engine: self.engine.clone(), to_request: self.to_request.clone() }
    }
}

/// Service that runs a check before forwarding each request.
pub struct CheckService<S, F> {
    inner: S,
    engine: Arc<AccountingEngine>,
    to_request: Arc<F>,
}

impl<S: Clone, F> Clone for CheckService<S, F> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone(), engine: self.engine.clone(), to_request: self.to_request.clone() }
    }
}

impl<S: fmt::Debug, F> fmt::Debug for CheckService<S, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CheckService").field("inner", &self.inner).finish_non_exhaustive()
    }
}

impl<S, F, Req> Service<Req> for CheckService<S, F>
where
    S: Service<Req> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
    F: Fn(&Req) -> CheckRequest + Send + Sync + 'static,
    Req: Send + 'static,
{
    type Response = S::Response;
    type Error = LayerError<S::Error>;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(LayerError::Inner)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let check = (self.to_request)(&req);
        let response = self.engine.check(&check);
        if !response.success {
            trace!(target: "ratekeeper::layer", bucket_id = %check.bucket_id, key = %check.key, "request rejected");
            let err = LayerError::RateLimited {
                next: response.next,
                reason: response.reject_reason.unwrap_or(RejectReason::Error),
            };
            return Box::pin(async move { Err(err) });
        }

        // Forward to the instance that was driven ready.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        Box::pin(async move { inner.call(req).await.map_err(LayerError::Inner) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::BucketDefinition;
    use crate::clock::ManualClock;
    use crate::engine::UsageSnapshot;
    use crate::registry::BucketRegistry;
    use crate::store::MemoryStore;
    use std::convert::Infallible;
    use tower::{service_fn, ServiceBuilder, ServiceExt};

    fn engine(clock: &ManualClock) -> Arc<AccountingEngine> {
        let registry = Arc::new(BucketRegistry::in_memory());
        registry.save("api", BucketDefinition::advanced("API", 2.0, 0.5)).unwrap();
        Arc::new(AccountingEngine::load(registry, MemoryStore::<UsageSnapshot>::new(), Arc::new(clock.clone())))
    }

    fn per_user(user: &String) -> CheckRequest {
        CheckRequest::advanced("api", format!("user:{user}"), 1.0)
    }

    #[tokio::test]
    async fn rejects_after_bucket_drains() {
        let clock = ManualClock::new(1_000);
        let svc = ServiceBuilder::new()
            .layer(CheckLayer::new(engine(&clock), per_user))
            .service(service_fn(|req: String| async move { Ok::<_, Infallible>(req.len()) }));

        assert_eq!(svc.clone().oneshot("ann".to_string()).await.unwrap(), 3);
        assert_eq!(svc.clone().oneshot("ann".to_string()).await.unwrap(), 3);
        let err = svc.clone().oneshot("ann".to_string()).await.unwrap_err();
        assert_eq!(err, LayerError::RateLimited { next: 2.0, reason: RejectReason::RateLimit });

        // Keys are independent.
        assert!(svc.clone().oneshot("bob".to_string()).await.is_ok());

        clock.advance(2_000);
        assert!(svc.oneshot("ann".to_string()).await.is_ok());
    }

    #[tokio::test]
    async fn rejections_can_cross_tasks() {
        let clock = ManualClock::new(1_000);
        let svc = CheckLayer::new(engine(&clock), per_user).layer(service_fn(|req: String| async move {
            Err::<usize, _>(std::io::Error::new(std::io::ErrorKind::Other, req))
        }));
        let mut outcomes = Vec::new();
        for _ in 0..3 {
            let call = svc.clone().oneshot("ann".to_string());
            outcomes.push(tokio::spawn(call).await.unwrap());
        }
        assert!(outcomes[..2].iter().all(|r| matches!(r, Err(LayerError::Inner(_)))));
        assert!(outcomes[2].as_ref().unwrap_err().is_rate_limited());
    }

    #[tokio::test]
    async fn inner_errors_pass_through() {
        let clock = ManualClock::new(1_000);
        let svc = CheckLayer::new(engine(&clock), per_user).layer(service_fn(|_: String| async {
            Err::<(), _>(std::io::Error::new(std::io::ErrorKind::Other, "boom"))
        }));
        let err = svc.oneshot("ann".to_string()).await.unwrap_err();
        assert!(!err.is_rate_limited());
        assert_eq!(err.to_string(), "boom");
    }
}
