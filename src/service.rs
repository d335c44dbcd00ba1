//! tower service wrapping a handler with admission control.

use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::future::BoxFuture;
use http::{Request, Response};
use tower::Service;

use crate::controller::AdmissionController;

/// Admission-controlled wrapper around an inner HTTP service.
///
/// Built by [`SmartQueueLayer`](crate::SmartQueueLayer); clones share the
/// layer's controller and therefore its permit pool, wait queue and probes.
pub struct SmartQueue<S> {
    inner: S,
    controller: Arc<AdmissionController>,
}

impl<S> SmartQueue<S> {
    pub(crate) fn new(inner: S, controller: Arc<AdmissionController>) -> Self {
        Self { inner, controller }
    }

    /// The shared controller, exposing diagnostics and shutdown.
    pub fn controller(&self) -> Arc<AdmissionController> {
        Arc::clone(&self.controller)
    }
}

impl<S, B, RB> Service<Request<B>> for SmartQueue<S>
where
    S: Service<Request<B>, Response = Response<RB>> + Clone + Send + 'static,
    S::Error: Into<crate::Error>,
    S::Future: Send,
    B: Send + 'static,
    RB: From<Bytes> + Send + 'static,
{
    type Response = Response<RB>;
    type Error = crate::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        // Take the service that was polled ready and leave a fresh clone in
        // its place.
        let clone = self.inner.clone();
        let inner = std::mem::replace(&mut self.inner, clone);
        let controller = Arc::clone(&self.controller);

        Box::pin(async move { controller.admit(req, inner).await })
    }
}

impl<S: Clone> Clone for SmartQueue<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            controller: Arc::clone(&self.controller),
        }
    }
}
