//! Per-request admission decisions.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use http::header::HeaderName;
use http::{HeaderValue, Request, Response, StatusCode};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tower::{Service, ServiceExt};

use crate::completion::Completion;
use crate::config::Config;
use crate::dispatcher::Dispatcher;
use crate::permits::PermitPool;
use crate::probe::{CpuProbe, MemoryDetail, MemoryProbe};
use crate::queue::{WaitQueue, WorkItem};

const TIMEOUT_BODY: &str = "Request timed out while waiting in queue";

fn queue_status_header() -> HeaderName {
    HeaderName::from_static("x-smartqueue-status")
}

fn queued_value() -> HeaderValue {
    HeaderValue::from_static("Queued")
}

pub(crate) type ExemptPredicate = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Default exempt rule: health and diagnostics surfaces bypass admission.
pub(crate) fn default_exempt(path: &str) -> bool {
    let path = path.to_ascii_lowercase();

    path.contains("health")
        || path.contains("cpu")
        || path.contains("memory")
        || path.contains("/_")
        || path.starts_with("/swagger")
}

enum Overload {
    Cpu(u32),
    Memory(u32),
}

/// Decides, per request, between direct execution, enqueue-and-wait and
/// rejection. Owns the probes, the permit pool, the wait queue and the
/// dispatcher task; services built from one layer share one controller.
pub struct AdmissionController {
    config: Config,
    exempt: ExemptPredicate,
    cpu: CpuProbe,
    memory: MemoryProbe,
    permits: PermitPool,
    queue: WaitQueue,
    shutdown: CancellationToken,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl AdmissionController {
    pub(crate) fn new(
        config: Config,
        exempt: ExemptPredicate,
        cpu: CpuProbe,
        memory: MemoryProbe,
    ) -> Arc<Self> {
        let (queue, rx) = WaitQueue::new(config.max_queue_size);
        let permits = PermitPool::new(config.max_concurrent_requests);
        let shutdown = CancellationToken::new();

        let dispatcher = Dispatcher::new(rx, shutdown.clone(), config.enable_logs);
        let handle = tokio::spawn(dispatcher.run());

        Arc::new(Self {
            config,
            exempt,
            cpu,
            memory,
            permits,
            queue,
            shutdown,
            dispatcher: Mutex::new(Some(handle)),
        })
    }

    /// The last sampled CPU utilisation, in `[0, 100]`.
    pub fn cpu_percent(&self) -> u32 {
        self.cpu.current_percent()
    }

    /// The last sampled memory utilisation, in `[0, 100]`.
    pub fn memory_percent(&self) -> u32 {
        self.memory.current_percent()
    }

    /// The last sampled memory counters.
    pub fn memory_detail(&self) -> MemoryDetail {
        self.memory.detail()
    }

    /// Requests currently parked in the wait queue.
    pub fn queue_size(&self) -> usize {
        self.queue.size()
    }

    /// Handlers currently executing under a permit.
    pub fn in_flight(&self) -> usize {
        self.permits.in_flight()
    }

    pub fn available_permits(&self) -> usize {
        self.permits.available()
    }

    /// Stop the dispatcher and the probe samplers. Requests already parked
    /// in the queue resolve through their queue deadline.
    pub async fn close(&self) {
        self.shutdown.cancel();
        self.cpu.stop();
        self.memory.stop();

        let handle = self
            .dispatcher
            .lock()
            .expect("dispatcher handle lock poisoned")
            .take();
        if let Some(handle) = handle {
            if timeout(Duration::from_secs(1), handle).await.is_err() {
                warn!(message = "dispatcher did not stop in time");
            }
        }
    }

    fn overload(&self) -> Option<Overload> {
        let cpu = self.cpu.current_percent();
        if cpu >= self.config.cpu_threshold {
            return Some(Overload::Cpu(cpu));
        }

        if self.config.use_memory_monitoring {
            let memory = self.memory.current_percent();
            if memory >= self.config.memory_threshold {
                return Some(Overload::Memory(memory));
            }
        }

        None
    }

    pub(crate) async fn admit<S, B, RB>(&self, req: Request<B>, inner: S) -> crate::Result<Response<RB>>
    where
        S: Service<Request<B>, Response = Response<RB>> + Send + 'static,
        S::Error: Into<crate::Error>,
        S::Future: Send,
        B: Send + 'static,
        RB: From<Bytes> + Send + 'static,
    {
        if (self.exempt)(req.uri().path()) {
            return inner.oneshot(req).await.map_err(Into::into);
        }

        let Some(reason) = self.overload() else {
            let permit = self.permits.acquire().await?;
            let result = inner.oneshot(req).await.map_err(Into::into);
            drop(permit);

            return result;
        };

        let (reason, percent) = match reason {
            Overload::Cpu(value) => ("cpu", value),
            Overload::Memory(value) => ("memory", value),
        };

        // Over threshold: reject when the queue is full, otherwise park the
        // request and wait for the dispatcher or the queue deadline.
        let size = self.queue.size();
        if size >= self.queue.capacity() {
            if self.config.enable_logs {
                warn!(
                    message = "wait queue full, rejecting request",
                    reason,
                    percent,
                    size
                );
            }

            return Ok(self.reject_response());
        }

        if self.config.enable_logs {
            debug!(
                message = "request queued",
                reason,
                percent,
                position = size + 1
            );
        }

        let completion = Completion::new();
        let (tx, mut rx) = oneshot::channel();
        let signal = Arc::clone(&completion);
        let permits = self.permits.clone();
        let work = Box::pin(async move {
            let permit = match permits.acquire().await {
                Ok(permit) => permit,
                Err(err) => {
                    if signal.try_settle() {
                        let _ = tx.send(Err(err));
                    }
                    return;
                }
            };

            signal.start();
            let result = inner.oneshot(req).await.map_err(Into::into);
            if signal.try_settle() {
                let _ = tx.send(result);
            }

            drop(permit);
        });

        self.queue.enqueue(WorkItem::new(work)).await?;

        match timeout(self.config.max_wait(), &mut rx).await {
            Ok(Ok(result)) => Ok(queued_response(result?)),
            Ok(Err(_)) => Err("queued request was dropped before completing".into()),
            Err(_elapsed) => {
                if completion.claim_timeout() {
                    if self.config.enable_logs {
                        warn!(
                            message = "request timed out in wait queue",
                            waited_secs = self.config.max_wait_seconds
                        );
                    }

                    return Ok(timeout_response());
                }

                // The handler won the race: it either finished right at the
                // deadline or is still running. Either way the request is no
                // longer waiting in the queue, so take its outcome.
                match rx.await {
                    Ok(result) => Ok(queued_response(result?)),
                    Err(_) => Err("queued request was dropped before completing".into()),
                }
            }
        }
    }

    fn reject_response<RB: From<Bytes>>(&self) -> Response<RB> {
        Response::builder()
            .status(self.config.reject_status())
            .body(RB::from(Bytes::from(self.config.reject_body.clone())))
            .expect("should build reject response")
    }
}

fn queued_response<RB>(mut resp: Response<RB>) -> Response<RB> {
    resp.headers_mut().insert(queue_status_header(), queued_value());

    resp
}

fn timeout_response<RB: From<Bytes>>() -> Response<RB> {
    let mut resp = Response::builder()
        .status(StatusCode::SERVICE_UNAVAILABLE)
        .body(RB::from(Bytes::from_static(TIMEOUT_BODY.as_bytes())))
        .expect("should build timeout response");
    resp.headers_mut().insert(queue_status_header(), queued_value());

    resp
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exempt_rule_matches_diagnostics_paths() {
        assert!(default_exempt("/health"));
        assert!(default_exempt("/api/HealthCheck"));
        assert!(default_exempt("/metrics/cpu"));
        assert!(default_exempt("/Memory/detail"));
        assert!(default_exempt("/_internal/status"));
        assert!(default_exempt("/swagger/index.html"));
        assert!(default_exempt("/SWAGGER"));

        assert!(!default_exempt("/"));
        assert!(!default_exempt("/api/orders"));
        assert!(!default_exempt("/swag"));
    }
}
