//! Layer building [`SmartQueue`] services that share one controller.

use std::sync::Arc;

use tower::Layer;

use crate::config::Config;
use crate::controller::{default_exempt, AdmissionController, ExemptPredicate};
use crate::probe::{CpuProbe, MemoryProbe};
use crate::service::SmartQueue;

/// Builds admission-controlled services around inner handlers.
///
/// All services produced by one layer share a single controller: one permit
/// pool, one wait queue, one dispatcher and one pair of probes. Construction
/// validates the configuration and spawns the dispatcher and probe tasks, so
/// it must happen inside a tokio runtime.
#[derive(Clone)]
pub struct SmartQueueLayer {
    controller: Arc<AdmissionController>,
}

impl SmartQueueLayer {
    /// Start the platform probes and the dispatcher.
    pub fn new(config: Config) -> crate::Result<Self> {
        config.validate()?;

        let cpu = CpuProbe::spawn(config.enable_logs);
        let memory = MemoryProbe::spawn(config.enable_logs);

        Ok(Self::build(config, cpu, memory, Arc::new(default_exempt)))
    }

    /// As [`new`](Self::new), but with caller-supplied probes. Their
    /// published values drive admission exactly as the platform samplers
    /// would, which lets tests and embedders pin utilisation to exact
    /// values.
    pub fn with_probes(config: Config, cpu: CpuProbe, memory: MemoryProbe) -> crate::Result<Self> {
        config.validate()?;

        Ok(Self::build(config, cpu, memory, Arc::new(default_exempt)))
    }

    /// As [`new`](Self::new), with a replacement for the default
    /// exempt-path rule.
    pub fn with_exempt<F>(config: Config, exempt: F) -> crate::Result<Self>
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        config.validate()?;

        let cpu = CpuProbe::spawn(config.enable_logs);
        let memory = MemoryProbe::spawn(config.enable_logs);

        Ok(Self::build(config, cpu, memory, Arc::new(exempt)))
    }

    fn build(config: Config, cpu: CpuProbe, memory: MemoryProbe, exempt: ExemptPredicate) -> Self {
        Self {
            controller: AdmissionController::new(config, exempt, cpu, memory),
        }
    }

    /// The shared controller, exposing diagnostics and shutdown.
    pub fn controller(&self) -> Arc<AdmissionController> {
        Arc::clone(&self.controller)
    }
}

impl<S> Layer<S> for SmartQueueLayer {
    type Service = SmartQueue<S>;

    fn layer(&self, inner: S) -> Self::Service {
        SmartQueue::new(inner, Arc::clone(&self.controller))
    }
}
