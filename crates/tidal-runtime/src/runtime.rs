//! Submission entry point.

use std::sync::Arc;

use tidal_core::{Device, Result, TidalError};

use crate::batch::{Batch, BatchCodec, DefaultBatchCodec};
use crate::config::RuntimeConfig;
use crate::handle::{AsyncHandle, HandleOptions};
use crate::model::PipelineModel;
use crate::scheduler::{Scheduler, SchedulerStats};
use crate::transfer::{DeviceBackend, SimulatedDevice};
use crate::value::Value;

/// Per-request options.
#[derive(Clone)]
pub struct SubmitOptions {
    /// Return a handle immediately instead of blocking for the result.
    pub asynchronous: bool,
    pub require_grad: bool,
    /// Where the result is materialized.
    pub output_target: Device,
    /// Microbatch count; the runtime default when `None`.
    pub microbatches: Option<usize>,
    /// Input splitter; [`DefaultBatchCodec`] when `None`.
    pub codec: Option<Arc<dyn BatchCodec>>,
}

impl Default for SubmitOptions {
    fn default() -> Self {
        Self {
            asynchronous: false,
            require_grad: false,
            output_target: Device::Cpu,
            microbatches: None,
            codec: None,
        }
    }
}

impl SubmitOptions {
    pub fn asynchronous(mut self) -> Self {
        self.asynchronous = true;
        self
    }

    pub fn require_grad(mut self, require_grad: bool) -> Self {
        self.require_grad = require_grad;
        self
    }

    pub fn output_target(mut self, device: Device) -> Self {
        self.output_target = device;
        self
    }

    pub fn microbatches(mut self, n: usize) -> Self {
        self.microbatches = Some(n);
        self
    }

    pub fn codec(mut self, codec: Arc<dyn BatchCodec>) -> Self {
        self.codec = Some(codec);
        self
    }
}

impl std::fmt::Debug for SubmitOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubmitOptions")
            .field("asynchronous", &self.asynchronous)
            .field("require_grad", &self.require_grad)
            .field("output_target", &self.output_target)
            .field("microbatches", &self.microbatches)
            .field("custom_codec", &self.codec.is_some())
            .finish()
    }
}

/// What [`Runtime::submit`] hands back.
#[derive(Debug, Clone)]
pub enum Submitted {
    Ready(Value),
    Pending(AsyncHandle),
}

impl Submitted {
    /// The result, blocking if it is still pending.
    pub fn into_value(self) -> Result<Value> {
        match self {
            Submitted::Ready(value) => Ok(value),
            Submitted::Pending(handle) => handle.get_result(),
        }
    }

    pub fn handle(&self) -> Option<&AsyncHandle> {
        match self {
            Submitted::Pending(handle) => Some(handle),
            Submitted::Ready(_) => None,
        }
    }
}

/// Streams models through one accelerator for any number of callers.
///
/// # Example
/// ```
/// use tidal_core::{Device, Tensor};
/// use tidal_runtime::{weights_from_f32, PipelineModel, Runtime, RuntimeConfig, Stage, SubmitOptions};
///
/// let stage = Stage::from_fn("double", weights_from_f32([("w", [0.0f32; 4])]), |_, _, inputs| {
///     Ok(inputs.iter().map(|t| t.map(|v| v * 2.0)).collect())
/// });
/// let model = PipelineModel::sequential("demo", vec![stage]).unwrap();
/// let runtime = Runtime::new(RuntimeConfig::default()).unwrap();
///
/// let out = runtime.run(&model, Tensor::from_f32(&[1.0, 2.0], &[2])).unwrap();
/// assert_eq!(out.as_tensor().unwrap().as_slice(), &[2.0, 4.0]);
/// assert_eq!(out.as_tensor().unwrap().device(), Device::Cpu);
/// ```
#[derive(Debug)]
pub struct Runtime {
    scheduler: Scheduler,
}

impl Runtime {
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        let backend = Arc::new(SimulatedDevice::new(config.simulated_bandwidth));
        Self::with_backend(config, backend)
    }

    pub fn with_backend(config: RuntimeConfig, backend: Arc<dyn DeviceBackend>) -> Result<Self> {
        Ok(Self { scheduler: Scheduler::new(config, backend)? })
    }

    /// A runtime that admits submissions but dispatches nothing until
    /// [`resume`](Self::resume).
    pub fn paused(config: RuntimeConfig, backend: Arc<dyn DeviceBackend>) -> Result<Self> {
        Ok(Self { scheduler: Scheduler::paused(config, backend)? })
    }

    pub fn config(&self) -> &RuntimeConfig {
        self.scheduler.config()
    }

    pub fn resume(&self) {
        self.scheduler.resume();
    }

    pub fn stats(&self) -> SchedulerStats {
        self.scheduler.stats()
    }

    /// Submit one request.
    ///
    /// `input` may contain handles of earlier submissions to this runtime; the
    /// request then runs once they resolve, on their results. Invalid input
    /// fails here; failures while running are reported by the handle.
    pub fn submit(
        &self,
        model: &Arc<PipelineModel>,
        input: impl Into<Value>,
        options: SubmitOptions,
    ) -> Result<Submitted> {
        let config = self.scheduler.config();
        let microbatches = options.microbatches.unwrap_or(config.default_microbatches);
        let codec = options.codec.unwrap_or_else(|| Arc::new(DefaultBatchCodec));
        let batch = Batch::new(input.into(), microbatches, codec)?;

        if let Some(foreign) = batch
            .dependencies()
            .iter()
            .find(|dep| dep.scheduler_id() != self.scheduler.id())
        {
            return Err(TidalError::Configuration(format!(
                "request {} belongs to a different runtime",
                foreign.id()
            )));
        }

        let handle_options = HandleOptions {
            require_grad: options.require_grad,
            output_target: options.output_target,
            compute_device: config.compute_device,
        };
        let handle = AsyncHandle::new(
            self.scheduler.id(),
            model.clone(),
            batch,
            handle_options,
            self.scheduler.commands(),
            self.scheduler.copy_stream(),
            self.scheduler.backend(),
        );
        let boosted = handle.propagate_workload(model.total_footprint() as u64);
        tracing::trace!("submitting {} ({} ancestors boosted)", handle.id(), boosted.len());
        self.scheduler.submit(handle.clone(), boosted)?;

        if options.asynchronous {
            Ok(Submitted::Pending(handle))
        } else {
            handle.get_result().map(Submitted::Ready)
        }
    }

    /// Submit and block for the result.
    pub fn run(&self, model: &Arc<PipelineModel>, input: impl Into<Value>) -> Result<Value> {
        self.submit(model, input, SubmitOptions::default())?.into_value()
    }

    /// Submit and return the handle straight away.
    pub fn submit_async(
        &self,
        model: &Arc<PipelineModel>,
        input: impl Into<Value>,
        options: SubmitOptions,
    ) -> Result<AsyncHandle> {
        match self.submit(model, input, options.asynchronous())? {
            Submitted::Pending(handle) => Ok(handle),
            Submitted::Ready(_) => Err(TidalError::Configuration(
                "asynchronous submission returned a ready value".into(),
            )),
        }
    }

    /// Stop scheduling; unresolved requests fail.
    pub fn shutdown(&mut self) {
        self.scheduler.shutdown();
    }
}
