//! Admission-control middleware that sheds load when the host is saturated.
//!
//! When CPU or memory utilisation crosses the configured thresholds, new
//! requests are parked in a bounded FIFO wait queue and dispatched as
//! capacity frees up instead of running immediately. In both cases a global
//! permit pool caps the number of handlers executing downstream. Requests
//! that wait past the queue deadline, or that arrive while the queue is
//! full, are answered with a configurable error response.
//!
//! The middleware is a [`tower::Layer`] / [`tower::Service`] pair, generic
//! over the inner handler service:
//!
//! ```no_run
//! use bytes::Bytes;
//! use http::{Request, Response};
//! use http_body_util::Full;
//! use smartqueue::{Config, SmartQueueLayer};
//! use tower::{service_fn, Layer, ServiceExt};
//!
//! # #[tokio::main]
//! # async fn main() -> smartqueue::Result<()> {
//! let layer = SmartQueueLayer::new(Config::default())?;
//!
//! let service = layer.layer(service_fn(|_req: Request<Full<Bytes>>| async {
//!     Ok::<_, smartqueue::Error>(Response::new(Full::<Bytes>::from(Bytes::from_static(b"hello"))))
//! }));
//!
//! let resp: Response<Full<Bytes>> = service.oneshot(Request::new(Full::<Bytes>::default())).await?;
//! assert!(resp.status().is_success());
//! # Ok(())
//! # }
//! ```

mod completion;
pub mod config;
mod controller;
mod dispatcher;
mod layer;
mod permits;
pub mod probe;
mod queue;
mod service;

pub use config::{Config, ConfigError};
pub use controller::AdmissionController;
pub use layer::SmartQueueLayer;
pub use permits::PermitPool;
pub use probe::{CpuProbe, MemoryDetail, MemoryProbe};
pub use service::SmartQueue;

#[macro_use]
extern crate tracing;

/// Basic error type, dynamically dispatched and safe to send across threads
pub type Error = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Basic result type, defined in terms of [`Error`] and generic over `T`
pub type Result<T> = std::result::Result<T, Error>;
