//! Per-request futures.
//!
//! An [`AsyncHandle`] is created for every submission. The scheduler advances
//! its progress; callers block on it for the result. The completion event and
//! the cached result are the only state shared between those two sides.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;
use tidal_core::{Device, Result, Tensor, TidalError};

use crate::batch::{Batch, BatchCodec, FlatMicrobatch};
use crate::event::Event;
use crate::model::PipelineModel;
use crate::scheduler::Command;
use crate::stream::Stream;
use crate::transfer::DeviceBackend;
use crate::value::{TreeSpec, Value};

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(0);

/// Stable identity of a submission. Ids increase in submission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(u64);

impl HandleId {
    fn next() -> Self {
        HandleId(NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    #[cfg(test)]
    pub(crate) fn from_raw(raw: u64) -> Self {
        HandleId(raw)
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Default)]
struct Workload {
    outstanding: u64,
    completed: u64,
    stage: usize,
    resolved: bool,
}

/// One microbatch's working set.
struct Microbatch {
    /// Activations between stages; the final stage leaves its outputs here.
    tensors: Mutex<Vec<Tensor>>,
    spec: TreeSpec,
    /// Inputs are resident on the compute device.
    uploaded: Event,
    /// Outputs are visible to the host side.
    landed: Event,
}

/// Per-request settings fixed at submission.
#[derive(Debug, Clone, Copy)]
pub(crate) struct HandleOptions {
    pub require_grad: bool,
    pub output_target: Device,
    pub compute_device: Device,
}

struct HandleInner {
    id: HandleId,
    scheduler_id: u64,
    model: Arc<PipelineModel>,
    batch: Mutex<Option<Batch>>,
    dependencies: Mutex<Vec<AsyncHandle>>,
    codec: Arc<dyn BatchCodec>,
    num_microbatches: usize,
    options: HandleOptions,
    workload: Mutex<Workload>,
    microbatches: OnceLock<Vec<Microbatch>>,
    completion: Event,
    result: Mutex<Option<Result<Value>>>,
    commands: Sender<Command>,
    copy: Weak<Stream>,
    backend: Arc<dyn DeviceBackend>,
}

/// Future for one submitted request.
///
/// Cloning is cheap and every clone observes the same request.
#[derive(Clone)]
pub struct AsyncHandle {
    inner: Arc<HandleInner>,
}

impl AsyncHandle {
    pub(crate) fn new(
        scheduler_id: u64,
        model: Arc<PipelineModel>,
        batch: Batch,
        options: HandleOptions,
        commands: Sender<Command>,
        copy: Weak<Stream>,
        backend: Arc<dyn DeviceBackend>,
    ) -> Self {
        let workload = Workload {
            outstanding: model.total_footprint() as u64,
            ..Default::default()
        };
        Self {
            inner: Arc::new(HandleInner {
                id: HandleId::next(),
                scheduler_id,
                dependencies: Mutex::new(batch.dependencies().to_vec()),
                codec: batch.codec().clone(),
                num_microbatches: batch.num_microbatches(),
                batch: Mutex::new(Some(batch)),
                model,
                options,
                workload: Mutex::new(workload),
                microbatches: OnceLock::new(),
                completion: Event::new(),
                result: Mutex::new(None),
                commands,
                copy,
                backend,
            }),
        }
    }

    pub fn id(&self) -> HandleId {
        self.inner.id
    }

    pub fn model(&self) -> &Arc<PipelineModel> {
        &self.inner.model
    }

    pub fn num_microbatches(&self) -> usize {
        self.inner.num_microbatches
    }

    pub fn require_grad(&self) -> bool {
        self.inner.options.require_grad
    }

    /// Where [`get_result`](Self::get_result) materializes the output.
    pub fn output_target(&self) -> Device {
        self.inner.options.output_target
    }

    pub fn compute_device(&self) -> Device {
        self.inner.options.compute_device
    }

    /// Upstream requests still referenced by this one. Empty once resolved.
    pub fn dependencies(&self) -> Vec<AsyncHandle> {
        self.inner.dependencies.lock().clone()
    }

    /// Total workload attributed to this handle, including inherited workload
    /// from downstream requests waiting on it.
    pub fn outstanding_workload(&self) -> u64 {
        self.inner.workload.lock().outstanding
    }

    pub fn completed_workload(&self) -> u64 {
        self.inner.workload.lock().completed
    }

    /// Remaining work; the scheduler runs the smallest value first.
    pub fn priority(&self) -> u64 {
        let w = self.inner.workload.lock();
        if w.resolved {
            return 0;
        }
        w.outstanding.saturating_sub(w.completed)
    }

    /// Index of the first stage not yet finished by every microbatch.
    pub fn current_stage(&self) -> usize {
        self.inner.workload.lock().stage
    }

    pub fn is_resolved(&self) -> bool {
        self.inner.completion.is_settled()
    }

    /// Block until the request resolves, without harvesting the result.
    pub fn wait(&self) -> Result<()> {
        self.inner.completion.wait()
    }

    /// Block for the result.
    ///
    /// The first call harvests the outputs and caches them (or the failure);
    /// later calls return the cached outcome without touching any stream.
    pub fn get_result(&self) -> Result<Value> {
        let mut cached = self.inner.result.lock();
        if let Some(outcome) = cached.as_ref() {
            return outcome.clone();
        }
        let outcome = self.harvest();
        *cached = Some(outcome.clone());
        drop(cached);

        if outcome.is_ok() {
            let _ = self.inner.commands.send(Command::Detach(self.id()));
        }
        outcome
    }

    fn harvest(&self) -> Result<Value> {
        self.inner.completion.wait()?;
        let outputs = self
            .final_outputs()?
            .into_iter()
            .map(|(tensors, spec)| spec.unflatten(self.copy_to_target(tensors)?))
            .collect::<Result<Vec<_>>>()?;
        self.inner.codec.gather(outputs)
    }

    /// The result as it sits on the compute device, for a dependent request.
    ///
    /// Never waits on a stream. Called on the copy stream after this request
    /// resolved, when every output has already landed.
    pub(crate) fn device_output(&self) -> Result<Value> {
        match self.inner.completion.query() {
            Some(outcome) => outcome?,
            None => {
                return Err(TidalError::Configuration(format!(
                    "request {} has not resolved",
                    self.id()
                )))
            }
        }
        let outputs = self
            .final_outputs()?
            .into_iter()
            .map(|(tensors, spec)| spec.unflatten(tensors))
            .collect::<Result<Vec<_>>>()?;
        self.inner.codec.gather(outputs)
    }

    /// Per-microbatch outputs once landed. Outputs stay in place so both the
    /// owner and dependents can read them.
    fn final_outputs(&self) -> Result<Vec<(Vec<Tensor>, &TreeSpec)>> {
        let microbatches = self
            .inner
            .microbatches
            .get()
            .ok_or(TidalError::SchedulerClosed)?;
        microbatches
            .iter()
            .map(|mb| {
                mb.landed.wait()?;
                Ok((mb.tensors.lock().clone(), &mb.spec))
            })
            .collect()
    }

    fn copy_to_target(&self, tensors: Vec<Tensor>) -> Result<Vec<Tensor>> {
        let target = self.output_target();
        if target == self.compute_device() {
            return Ok(tensors);
        }
        let backend = self.inner.backend.clone();
        let Some(copy) = self.inner.copy.upgrade() else {
            return tensors.iter().map(|t| backend.read_back(t, target)).collect();
        };

        let done = Event::new();
        let moved = Arc::new(Mutex::new(Vec::new()));
        {
            let done = done.clone();
            let moved = moved.clone();
            copy.enqueue(move || {
                match tensors.iter().map(|t| backend.read_back(t, target)).collect::<Result<Vec<_>>>() {
                    Ok(tensors) => {
                        *moved.lock() = tensors;
                        done.signal();
                    }
                    Err(e) => {
                        done.fail(e);
                    }
                }
            })?;
        }
        drop(copy);
        done.wait()?;
        let tensors = std::mem::take(&mut *moved.lock());
        Ok(tensors)
    }

    /// Add `amount` to every unresolved ancestor, once each.
    ///
    /// Returns the ids of the ancestors whose workload changed.
    pub(crate) fn propagate_workload(&self, amount: u64) -> Vec<HandleId> {
        let mut visited = HashSet::new();
        let mut changed = Vec::new();
        let mut pending = self.dependencies();
        while let Some(ancestor) = pending.pop() {
            if !visited.insert(ancestor.id()) {
                continue;
            }
            {
                let mut w = ancestor.inner.workload.lock();
                if w.resolved {
                    continue;
                }
                w.outstanding += amount;
            }
            changed.push(ancestor.id());
            pending.extend(ancestor.dependencies());
        }
        changed
    }

    /// Record that every microbatch finished the current stage.
    pub(crate) fn advance_progress(&self, stage_cost: u64) {
        let mut w = self.inner.workload.lock();
        w.completed = (w.completed + stage_cost).min(w.outstanding);
        w.stage += 1;
    }

    pub(crate) fn scheduler_id(&self) -> u64 {
        self.inner.scheduler_id
    }

    /// Take the captured input. Only the first call gets it.
    pub(crate) fn take_batch(&self) -> Option<Batch> {
        self.inner.batch.lock().take()
    }

    pub(crate) fn install_microbatches(&self, parts: Vec<FlatMicrobatch>) -> Result<()> {
        let microbatches = parts
            .into_iter()
            .map(|part| Microbatch {
                tensors: Mutex::new(part.tensors),
                spec: part.spec,
                uploaded: Event::new(),
                landed: Event::new(),
            })
            .collect();
        self.inner.microbatches.set(microbatches).map_err(|_| {
            TidalError::Configuration(format!("request {} was admitted twice", self.id()))
        })
    }

    fn microbatch(&self, index: usize) -> Result<&Microbatch> {
        self.inner
            .microbatches
            .get()
            .and_then(|mbs| mbs.get(index))
            .ok_or_else(|| {
                TidalError::Configuration(format!(
                    "request {} has no microbatch {index}",
                    self.id()
                ))
            })
    }

    /// Move microbatch `index`'s inputs onto `device` and mark them uploaded.
    pub(crate) fn upload(&self, index: usize, device: Device) {
        if let Ok(mb) = self.microbatch(index) {
            let mut tensors = mb.tensors.lock();
            *tensors = tensors.iter().map(|t| t.to_device(device)).collect();
            drop(tensors);
            mb.uploaded.signal();
        }
    }

    pub(crate) fn uploaded(&self, index: usize) -> Result<Event> {
        Ok(self.microbatch(index)?.uploaded.clone())
    }

    pub(crate) fn landed(&self, index: usize) -> Result<Event> {
        Ok(self.microbatch(index)?.landed.clone())
    }

    pub(crate) fn take_activations(&self, index: usize) -> Result<Vec<Tensor>> {
        Ok(std::mem::take(&mut *self.microbatch(index)?.tensors.lock()))
    }

    pub(crate) fn store_activations(&self, index: usize, tensors: Vec<Tensor>) -> Result<()> {
        *self.microbatch(index)?.tensors.lock() = tensors;
        Ok(())
    }

    /// Settle the request. Retires any inherited workload so the priority
    /// reads zero from here on.
    pub(crate) fn resolve(&self, outcome: Result<()>) {
        {
            let mut w = self.inner.workload.lock();
            w.completed = w.outstanding;
            w.resolved = true;
        }
        self.inner.dependencies.lock().clear();
        self.inner.completion.settle(outcome);
    }

    /// Failure recorded on a resolved handle, if any.
    pub(crate) fn failure(&self) -> Option<TidalError> {
        match self.inner.completion.query() {
            Some(Err(e)) => Some(e),
            _ => None,
        }
    }
}

impl PartialEq for AsyncHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for AsyncHandle {}

impl fmt::Debug for AsyncHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let w = self.inner.workload.lock();
        f.debug_struct("AsyncHandle")
            .field("id", &self.inner.id)
            .field("model", &self.inner.model.name())
            .field("stage", &w.stage)
            .field("outstanding", &w.outstanding)
            .field("completed", &w.completed)
            .field("resolved", &w.resolved)
            .finish()
    }
}
