//! The scheduling actor.
//!
//! One thread owns every piece of mutable scheduling state: the ready set,
//! admission counters, device slot tags and the transfer engine. Callers and
//! streams talk to it only through [`Command`]s, so none of that state needs
//! a lock.
//!
//! Per event the actor runs one pump: every runnable request is popped in
//! SRPT order and, for each of its stages with waiting microbatches,
//!
//! 1. claims a device slot holding that stage (staging it if needed),
//! 2. launches as many microbatches as the stage's pipeline depth allows,
//! 3. prefetches the next stage into a free slot.
//!
//! Compute runs on the compute stream and reports back with
//! [`Command::MicrobatchDone`]; copies run on the copy stream and report with
//! [`Command::Landed`]. A request that consumes earlier results reads them on
//! the copy stream, behind the copies that landed them, and comes back as
//! [`Command::Prepared`]. The actor itself never waits on a stream.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tidal_core::{Result, TidalError};

use crate::batch::FlatMicrobatch;
use crate::config::RuntimeConfig;
use crate::event::Event;
use crate::handle::{AsyncHandle, HandleId};
use crate::model::{ModelId, PipelineModel};
use crate::ready::ReadySet;
use crate::stage::{DeviceParams, Stage, StageContext};
use crate::stream::Stream;
use crate::transfer::{DeviceBackend, LandedWaker, SlotLease, TransferEngine, TransferStats};

static NEXT_SCHEDULER_ID: AtomicU64 = AtomicU64::new(0);

/// Messages to the scheduling actor.
pub(crate) enum Command {
    /// A new request. `boosted` lists ancestors whose workload grew.
    Submit { handle: AsyncHandle, boosted: Vec<HandleId> },
    /// One microbatch finished (or failed) one stage.
    MicrobatchDone {
        handle: HandleId,
        stage: usize,
        microbatch: usize,
        slot: usize,
        outcome: Result<()>,
    },
    /// A copy into this device slot settled.
    Landed(usize),
    /// Upstream outputs of a chained request were read and split.
    Prepared {
        handle: AsyncHandle,
        parts: Result<Vec<FlatMicrobatch>>,
    },
    /// A result was harvested; its device tags may go.
    Detach(HandleId),
    Resume,
    Shutdown,
}

/// Scheduler counters, owned by the actor and published after every event.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SchedulerStats {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    /// Requests with work ready to dispatch.
    pub ready: usize,
    /// Requests waiting on unresolved dependencies or on reading their
    /// outputs.
    pub blocked: usize,
    /// Admitted, unresolved requests.
    pub running: usize,
    /// Workload of admitted, unresolved requests. Reset to zero whenever the
    /// scheduler goes idle.
    pub in_flight_workload: u64,
    /// Most microbatches ever in flight at a single stage.
    pub peak_stage_in_flight: usize,
    pub transfer: TransferStats,
}

impl fmt::Display for SchedulerStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Scheduler: {} submitted, {} completed, {} failed, {} running ({} ready, {} blocked), \
             {:.1} MB in flight, peak stage depth {}",
            self.submitted,
            self.completed,
            self.failed,
            self.running,
            self.ready,
            self.blocked,
            self.in_flight_workload as f64 / (1024.0 * 1024.0),
            self.peak_stage_in_flight,
        )
    }
}

/// Handle to the scheduling actor thread.
pub struct Scheduler {
    id: u64,
    config: RuntimeConfig,
    commands: Sender<Command>,
    stats: Arc<Mutex<SchedulerStats>>,
    copy: Arc<Stream>,
    backend: Arc<dyn DeviceBackend>,
    actor: Option<JoinHandle<()>>,
}

impl Scheduler {
    pub fn new(config: RuntimeConfig, backend: Arc<dyn DeviceBackend>) -> Result<Self> {
        Self::start(config, backend, false)
    }

    /// Start without dispatching anything until [`resume`](Self::resume).
    /// Submissions are still admitted.
    pub fn paused(config: RuntimeConfig, backend: Arc<dyn DeviceBackend>) -> Result<Self> {
        Self::start(config, backend, true)
    }

    fn start(config: RuntimeConfig, backend: Arc<dyn DeviceBackend>, paused: bool) -> Result<Self> {
        config.validate()?;
        let id = NEXT_SCHEDULER_ID.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel();

        let copy = Arc::new(Stream::new("copy")?);
        let compute = Stream::new("compute")?;
        let waker: LandedWaker = {
            let tx = tx.clone();
            Arc::new(move |slot| {
                let _ = tx.send(Command::Landed(slot));
            })
        };
        let engine = TransferEngine::new(
            config.compute_device,
            config.device_buffers,
            config.slot_capacity(),
            config.pinned_budget(),
            backend.clone(),
            copy.clone(),
            waker,
        );

        let stats = Arc::new(Mutex::new(SchedulerStats::default()));
        let actor = Actor {
            config: config.clone(),
            paused,
            commands: tx.clone(),
            compute,
            engine,
            ready: ReadySet::new(),
            parked: Vec::new(),
            jobs: HashMap::new(),
            blocked: BTreeMap::new(),
            preparing: BTreeMap::new(),
            in_flight: HashMap::new(),
            stats: SchedulerStats::default(),
            shared: stats.clone(),
        };
        let handle = thread::Builder::new()
            .name("tidal-scheduler".into())
            .spawn(move || actor.run(rx))
            .map_err(|e| TidalError::ResourceExhaustion(format!("failed to spawn scheduler: {e}")))?;

        tracing::info!(
            "scheduler {id} started on {} (depth {}, {} device buffers{})",
            config.compute_device,
            config.pipeline_depth,
            config.device_buffers,
            if paused { ", paused" } else { "" }
        );
        Ok(Self {
            id,
            config,
            commands: tx,
            stats,
            copy,
            backend,
            actor: Some(handle),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Snapshot of the counters as of the last processed event.
    pub fn stats(&self) -> SchedulerStats {
        self.stats.lock().clone()
    }

    /// Start dispatching after [`paused`](Self::paused).
    pub fn resume(&self) {
        let _ = self.commands.send(Command::Resume);
    }

    pub(crate) fn submit(&self, handle: AsyncHandle, boosted: Vec<HandleId>) -> Result<()> {
        if self.actor.is_none() {
            return Err(TidalError::SchedulerClosed);
        }
        self.commands
            .send(Command::Submit { handle, boosted })
            .map_err(|_| TidalError::SchedulerClosed)
    }

    pub(crate) fn commands(&self) -> Sender<Command> {
        self.commands.clone()
    }

    pub(crate) fn copy_stream(&self) -> Weak<Stream> {
        Arc::downgrade(&self.copy)
    }

    pub(crate) fn backend(&self) -> Arc<dyn DeviceBackend> {
        self.backend.clone()
    }

    /// Stop the actor. Unresolved requests fail with
    /// [`TidalError::SchedulerClosed`].
    pub fn shutdown(&mut self) {
        if let Some(actor) = self.actor.take() {
            let _ = self.commands.send(Command::Shutdown);
            if actor.join().is_err() {
                tracing::error!("scheduler {} terminated abnormally", self.id);
            }
            tracing::info!("scheduler {} stopped", self.id);
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("id", &self.id)
            .field("running", &self.actor.is_some())
            .finish()
    }
}

/// Progress of one admitted request.
struct Job {
    handle: AsyncHandle,
    model: Arc<PipelineModel>,
    /// Per stage, microbatches that cleared the previous stage and wait for
    /// this one. Seeded with every microbatch at stage 0.
    waiting: Vec<VecDeque<usize>>,
    /// Per stage, microbatches that finished it.
    finished: Vec<usize>,
    in_flight: usize,
    failure: Option<TidalError>,
}

impl Job {
    fn new(handle: AsyncHandle) -> Self {
        let model = handle.model().clone();
        let stages = model.num_stages();
        let mut waiting = vec![VecDeque::new(); stages];
        waiting[0] = (0..handle.num_microbatches()).collect();
        Self {
            handle,
            model,
            waiting,
            finished: vec![0; stages],
            in_flight: 0,
            failure: None,
        }
    }

    fn id(&self) -> HandleId {
        self.handle.id()
    }

    fn has_waiting(&self) -> bool {
        self.waiting.iter().any(|q| !q.is_empty())
    }

    fn is_done(&self) -> bool {
        self.in_flight == 0
            && (self.failure.is_some()
                || self.finished.last() == Some(&self.handle.num_microbatches()))
    }
}

struct Actor {
    config: RuntimeConfig,
    paused: bool,
    commands: Sender<Command>,
    compute: Stream,
    engine: TransferEngine,
    ready: ReadySet,
    parked: Vec<HandleId>,
    jobs: HashMap<HandleId, Job>,
    blocked: BTreeMap<HandleId, AsyncHandle>,
    /// Admitted requests whose upstream outputs are being read.
    preparing: BTreeMap<HandleId, AsyncHandle>,
    in_flight: HashMap<(ModelId, usize), usize>,
    stats: SchedulerStats,
    shared: Arc<Mutex<SchedulerStats>>,
}

impl Actor {
    fn run(mut self, inbox: Receiver<Command>) {
        while let Ok(command) = inbox.recv() {
            match command {
                Command::Shutdown => break,
                other => self.handle(other),
            }
            self.pump();
            self.publish();
        }
        self.close(inbox);
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Submit { handle, boosted } => {
                self.stats.submitted += 1;
                for id in boosted {
                    self.rekey(id);
                }
                self.accept(handle);
            }
            Command::MicrobatchDone { handle, stage, microbatch, slot, outcome } => {
                self.on_microbatch_done(handle, stage, microbatch, slot, outcome);
            }
            Command::Landed(slot) => {
                if let Some(e) = self.engine.on_landed(slot) {
                    tracing::debug!("slot {slot} is free again after failed copy: {e}");
                }
            }
            Command::Prepared { handle, parts } => {
                if self.preparing.remove(&handle.id()).is_some() {
                    self.begin(handle, parts);
                }
            }
            Command::Detach(id) => {
                let n = self.engine.detach(id);
                if n > 0 {
                    tracing::debug!("detached {n} device slots from {id}");
                }
            }
            Command::Resume => {
                if self.paused {
                    tracing::info!("scheduler resumed with {} ready requests", self.ready.len());
                }
                self.paused = false;
            }
            Command::Shutdown => {}
        }
    }

    fn rekey(&mut self, id: HandleId) {
        if let Some(job) = self.jobs.get(&id) {
            if self.ready.contains(id) {
                self.ready.insert(id, job.handle.priority());
            }
        }
    }

    /// Admit `handle` now, or hold it until its dependencies resolve.
    fn accept(&mut self, handle: AsyncHandle) {
        let deps = handle.dependencies();
        if let Some(e) = deps.iter().find_map(AsyncHandle::failure) {
            tracing::warn!("{} fails with its dependency: {e}", handle.id());
            self.reject(handle, e);
        } else if deps.iter().all(AsyncHandle::is_resolved) {
            self.admit(handle);
        } else {
            tracing::debug!("{} waits on {} dependencies", handle.id(), deps.len());
            self.blocked.insert(handle.id(), handle);
        }
    }

    /// Pin the model's weights and split the input into microbatches.
    ///
    /// Inputs built from earlier results are read on the copy stream, so the
    /// request only starts once [`Command::Prepared`] comes back.
    fn admit(&mut self, handle: AsyncHandle) {
        let batch = self.engine.register(handle.model()).and_then(|()| {
            handle.take_batch().ok_or_else(|| {
                TidalError::Configuration(format!("request {} was submitted twice", handle.id()))
            })
        });
        let batch = match batch {
            Ok(batch) => batch,
            Err(e) => {
                tracing::warn!("{} rejected at admission: {e}", handle.id());
                self.reject(handle, e);
                return;
            }
        };
        if batch.dependencies().is_empty() {
            let parts = batch.materialize();
            self.begin(handle, parts);
            return;
        }

        let tx = self.commands.clone();
        let prepared = handle.clone();
        let queued = self.engine.copy_stream().enqueue(move || {
            let parts = batch.materialize();
            drop(batch);
            let _ = tx.send(Command::Prepared { handle: prepared, parts });
        });
        match queued {
            Ok(()) => {
                tracing::debug!("{} reads its dependencies on the copy stream", handle.id());
                self.preparing.insert(handle.id(), handle);
            }
            Err(e) => self.reject(handle, e),
        }
    }

    fn begin(&mut self, handle: AsyncHandle, parts: Result<Vec<FlatMicrobatch>>) {
        if let Err(e) = parts.and_then(|parts| handle.install_microbatches(parts)) {
            tracing::warn!("{} rejected at admission: {e}", handle.id());
            self.reject(handle, e);
            return;
        }

        let device = self.config.compute_device;
        for mb in 0..handle.num_microbatches() {
            let upload = handle.clone();
            let queued = self.engine.copy_stream().enqueue(move || upload.upload(mb, device));
            if queued.is_err() {
                handle.upload(mb, device);
            }
        }

        let job = Job::new(handle);
        let id = job.id();
        self.stats.in_flight_workload += job.model.total_footprint() as u64;
        self.ready.insert(id, job.handle.priority());
        tracing::debug!(
            "admitted {id} for '{}': {} microbatches, priority {}",
            job.model.name(),
            job.handle.num_microbatches(),
            job.handle.priority()
        );
        self.jobs.insert(id, job);
    }

    /// Resolve a request that never got admitted.
    fn reject(&mut self, handle: AsyncHandle, err: TidalError) {
        drop(handle.take_batch());
        self.stats.failed += 1;
        self.publish();
        handle.resolve(Err(err));
        self.release_dependents();
    }

    /// Move blocked requests whose dependencies have all resolved.
    fn release_dependents(&mut self) {
        loop {
            let unblocked: Vec<HandleId> = self
                .blocked
                .iter()
                .filter(|(_, h)| h.dependencies().iter().all(AsyncHandle::is_resolved))
                .map(|(id, _)| *id)
                .collect();
            if unblocked.is_empty() {
                break;
            }
            for id in unblocked {
                if let Some(handle) = self.blocked.remove(&id) {
                    self.accept(handle);
                }
            }
        }
    }

    fn pump(&mut self) {
        if self.paused {
            return;
        }
        for id in std::mem::take(&mut self.parked) {
            if let Some(job) = self.jobs.get(&id) {
                self.ready.insert(id, job.handle.priority());
            }
        }
        while let Some(id) = self.ready.pop() {
            let Some(mut job) = self.jobs.remove(&id) else {
                continue;
            };
            self.dispatch(&mut job);
            if job.failure.is_none() && job.has_waiting() {
                self.parked.push(id);
            }
            self.settle(job);
        }
    }

    fn dispatch(&mut self, job: &mut Job) {
        let model = job.model.clone();
        let depth = self.config.pipeline_depth;
        for stage in (0..model.num_stages()).rev() {
            if job.waiting[stage].is_empty() {
                continue;
            }
            let busy = self.in_flight.get(&(model.id(), stage)).copied().unwrap_or(0);
            if busy >= depth {
                continue;
            }
            let slot = match self.engine.claim(model.id(), stage, job.id()) {
                Ok(Some(slot)) => slot,
                Ok(None) => continue,
                Err(e) => {
                    self.fail(job, e);
                    return;
                }
            };

            let mut launched = 0;
            for _ in busy..depth {
                let Some(mb) = job.waiting[stage].pop_front() else {
                    break;
                };
                if let Err(e) = self.launch(job, stage, mb, slot) {
                    self.fail(job, e);
                    return;
                }
                launched += 1;
            }
            tracing::debug!(
                "{}: {launched} microbatches of stage {stage} on slot {slot}",
                job.id()
            );
            self.prefetch(&model, stage + 1, job.id());
        }
    }

    fn prefetch(&mut self, model: &PipelineModel, stage: usize, owner: HandleId) {
        if stage >= model.num_stages() || self.engine.resident(model.id(), stage).is_some() {
            return;
        }
        if let Some(slot) = self.engine.free_slot() {
            match self.engine.stage(slot, model.id(), stage, owner) {
                Ok(_) => tracing::debug!("prefetching stage {stage} of {} into slot {slot}", model.id()),
                Err(e) => tracing::warn!("prefetch of stage {stage} failed: {e}"),
            }
        }
    }

    fn launch(&mut self, job: &mut Job, stage: usize, mb: usize, slot: usize) -> Result<()> {
        let layer = job
            .model
            .stage(stage)
            .cloned()
            .ok_or_else(|| TidalError::Configuration(format!("no stage {stage}")))?;
        let uploaded = job.handle.uploaded(mb)?;
        let lease = self.engine.acquire(slot)?;

        let ctx = StageContext {
            stage,
            microbatch: mb,
            require_grad: job.handle.require_grad(),
            device: self.config.compute_device,
        };
        let handle = job.handle.clone();
        let tx = self.commands.clone();
        let queued = self.compute.enqueue(move || {
            let outcome = run_stage(&handle, &layer, &ctx, &lease, &uploaded);
            let _ = tx.send(Command::MicrobatchDone {
                handle: handle.id(),
                stage: ctx.stage,
                microbatch: ctx.microbatch,
                slot,
                outcome,
            });
        });
        if let Err(e) = queued {
            let _ = self.engine.release(slot);
            return Err(e);
        }

        let count = self.in_flight.entry((job.model.id(), stage)).or_default();
        *count += 1;
        self.stats.peak_stage_in_flight = self.stats.peak_stage_in_flight.max(*count);
        job.in_flight += 1;
        tracing::trace!("{}: launched microbatch {mb} at stage {stage}", job.id());
        Ok(())
    }

    fn on_microbatch_done(
        &mut self,
        id: HandleId,
        stage: usize,
        mb: usize,
        slot: usize,
        outcome: Result<()>,
    ) {
        if let Err(e) = self.engine.release(slot) {
            tracing::error!("{e}");
        }
        let Some(mut job) = self.jobs.remove(&id) else {
            return;
        };
        if let Some(count) = self.in_flight.get_mut(&(job.model.id(), stage)) {
            *count = count.saturating_sub(1);
        }
        job.in_flight -= 1;

        match outcome {
            Ok(()) if job.failure.is_none() => {
                tracing::trace!("{id}: microbatch {mb} cleared stage {stage}");
                job.finished[stage] += 1;
                if stage + 1 < job.model.num_stages() {
                    job.waiting[stage + 1].push_back(mb);
                } else {
                    self.signal_landed(&job.handle, mb);
                }
                if job.finished[stage] == job.handle.num_microbatches() {
                    let cost = job.model.stage(stage).map_or(0, Stage::footprint);
                    job.handle.advance_progress(cost as u64);
                }
            }
            Ok(()) => {}
            Err(e) => self.fail(&mut job, e),
        }

        if job.failure.is_none() && job.has_waiting() {
            self.ready.insert(id, job.handle.priority());
        }
        self.settle(job);
    }

    /// Mark the outputs of microbatch `mb` visible once earlier copies drain.
    fn signal_landed(&self, handle: &AsyncHandle, mb: usize) {
        let Ok(landed) = handle.landed(mb) else {
            return;
        };
        if self.engine.copy_stream().record(&landed).is_err() {
            landed.signal();
        }
    }

    fn fail(&mut self, job: &mut Job, err: TidalError) {
        if job.failure.is_some() {
            return;
        }
        tracing::warn!("{} failed: {err}", job.id());
        job.failure = Some(err);
        for queue in &mut job.waiting {
            queue.clear();
        }
        self.ready.remove(job.id());
    }

    /// Resolve `job` if nothing of it is left in flight, else keep tracking it.
    fn settle(&mut self, job: Job) {
        if !job.is_done() {
            self.jobs.insert(job.id(), job);
            return;
        }
        let id = job.id();
        self.ready.remove(id);
        self.stats.in_flight_workload = self
            .stats
            .in_flight_workload
            .saturating_sub(job.model.total_footprint() as u64);
        let outcome = match job.failure {
            Some(e) => {
                self.stats.failed += 1;
                self.engine.detach(id);
                Err(e)
            }
            None => {
                self.stats.completed += 1;
                Ok(())
            }
        };
        if self.jobs.is_empty() && self.blocked.is_empty() && self.preparing.is_empty() {
            self.stats.in_flight_workload = 0;
        }
        tracing::debug!("{id} resolved ({})", if outcome.is_ok() { "ok" } else { "failed" });
        self.publish();
        job.handle.resolve(outcome);
        self.release_dependents();
    }

    fn publish(&mut self) {
        self.stats.ready = self.ready.len();
        self.stats.blocked = self.blocked.len() + self.preparing.len();
        self.stats.running = self.jobs.len();
        self.stats.transfer = self.engine.stats();
        *self.shared.lock() = self.stats.clone();
    }

    fn close(mut self, inbox: Receiver<Command>) {
        let mut orphans: Vec<AsyncHandle> = self.jobs.drain().map(|(_, job)| job.handle).collect();
        orphans.extend(std::mem::take(&mut self.blocked).into_values());
        orphans.extend(std::mem::take(&mut self.preparing).into_values());
        orphans.extend(inbox.try_iter().filter_map(|command| match command {
            Command::Submit { handle, .. } => Some(handle),
            _ => None,
        }));
        self.ready = ReadySet::new();
        self.stats.failed += orphans.len() as u64;
        self.stats.in_flight_workload = 0;
        self.publish();
        if !orphans.is_empty() {
            tracing::warn!("failing {} unresolved requests on shutdown", orphans.len());
        }
        for handle in orphans {
            handle.resolve(Err(TidalError::SchedulerClosed));
        }
        // Compute jobs may still wait on copies, so the compute stream drains first.
        let Actor { compute, engine, .. } = self;
        drop(compute);
        drop(engine);
    }
}

fn run_stage(
    handle: &AsyncHandle,
    stage: &Stage,
    ctx: &StageContext,
    lease: &SlotLease,
    uploaded: &Event,
) -> Result<()> {
    lease.landed.wait()?;
    uploaded.wait()?;
    let inputs = handle.take_activations(ctx.microbatch)?;

    let outputs = {
        let buffer = lease.buffer.read();
        if buffer.contents != Some((handle.model().id(), ctx.stage)) {
            return Err(TidalError::Transfer(format!(
                "device slot no longer holds stage {}",
                ctx.stage
            )));
        }
        let params = DeviceParams::new(&buffer.bytes, &buffer.entries);
        panic::catch_unwind(AssertUnwindSafe(|| stage.executor().execute(ctx, &params, inputs)))
            .map_err(|_| {
                TidalError::compute(ctx.stage, format!("executor of '{}' panicked", stage.name()))
            })?
            .map_err(|e| match e {
                TidalError::Compute { .. } => e,
                other => TidalError::compute(ctx.stage, other.to_string()),
            })?
    };
    handle.store_activations(ctx.microbatch, outputs)
}
