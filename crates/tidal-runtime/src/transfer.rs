//! Host-to-device weight streaming.
//!
//! Every stage of a registered model gets a pinned host staging region. A
//! small pool of device slots receives stage weights on demand; with two slots
//! the next stage's weights are copied while the current stage computes.
//!
//! Each slot carries two events:
//!
//! ```text
//!  stage()            copy lands            acquire()        last release()
//!    |-- Staging -------->|---- Ready ----------->|---- InUse ------>|---- Ready / Idle
//!                      landed                 reusable unset     reusable set
//! ```
//!
//! A slot is only restaged while its reusable event is set, so a buffer is
//! never overwritten between landing and its last consumer finishing.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::RwLock;
use tidal_core::{Device, Result, Tensor, TidalError};

use crate::event::Event;
use crate::handle::HandleId;
use crate::model::{ModelId, PipelineModel};
use crate::stage::{LayerWeights, ParamEntry};
use crate::stream::Stream;

/// Copies bytes into accelerator memory.
pub trait DeviceBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Replace the contents of `dst` (device memory on `device`) with `src`.
    fn copy_to_device(&self, device: Device, src: &[u8], dst: &mut Vec<u8>) -> Result<()>;

    /// Copy a request output off the compute device onto `target`.
    fn read_back(&self, tensor: &Tensor, target: Device) -> Result<Tensor> {
        Ok(tensor.to_device(target))
    }
}

/// Host-memory stand-in for an accelerator, optionally throttled to a fixed
/// bandwidth so copies take realistic time.
#[derive(Debug, Clone, Default)]
pub struct SimulatedDevice {
    bandwidth: Option<u64>,
}

impl SimulatedDevice {
    pub fn new(bandwidth: Option<u64>) -> Self {
        Self { bandwidth }
    }
}

impl DeviceBackend for SimulatedDevice {
    fn name(&self) -> &str {
        "simulated"
    }

    fn copy_to_device(&self, device: Device, src: &[u8], dst: &mut Vec<u8>) -> Result<()> {
        if !device.is_cuda() {
            return Err(TidalError::Transfer(format!("{device} is not an accelerator")));
        }
        if let Some(bps) = self.bandwidth.filter(|&b| b > 0) {
            let secs = src.len() as f64 / bps as f64;
            std::thread::sleep(Duration::from_secs_f64(secs));
        }
        dst.clear();
        dst.extend_from_slice(src);
        Ok(())
    }
}

/// A stage's parameters packed into one contiguous pinned host buffer.
#[derive(Debug)]
pub struct PinnedRegion {
    bytes: Vec<u8>,
    entries: Vec<ParamEntry>,
}

impl PinnedRegion {
    pub fn pack(weights: &LayerWeights) -> Self {
        let mut bytes = Vec::with_capacity(weights.iter().map(|(_, d)| d.len()).sum());
        let mut entries = Vec::with_capacity(weights.len());
        for (name, data) in weights.iter() {
            entries.push(ParamEntry { name: name.clone(), offset: bytes.len(), len: data.len() });
            bytes.extend_from_slice(data);
        }
        Self { bytes, entries }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn entries(&self) -> &[ParamEntry] {
        &self.entries
    }
}

/// Contents of one device slot.
#[derive(Debug, Default)]
pub struct DeviceBuffer {
    pub bytes: Vec<u8>,
    pub entries: Vec<ParamEntry>,
    /// Which stage the bytes belong to; `None` while a copy is rewriting them.
    pub contents: Option<(ModelId, usize)>,
}

/// Which request's stage currently owns a slot's contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceTag {
    pub model: ModelId,
    pub stage: usize,
    pub owner: HandleId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Idle,
    Staging,
    Ready,
    InUse,
}

/// What a compute job needs to read a slot.
#[derive(Clone)]
pub struct SlotLease {
    pub buffer: Arc<RwLock<DeviceBuffer>>,
    pub landed: Event,
}

struct Slot {
    buffer: Arc<RwLock<DeviceBuffer>>,
    tag: Option<DeviceTag>,
    users: usize,
    landed: Event,
    reusable: Event,
    last_used: u64,
}

impl Slot {
    fn new() -> Self {
        Self {
            buffer: Arc::new(RwLock::new(DeviceBuffer::default())),
            tag: None,
            users: 0,
            landed: Event::signaled(),
            reusable: Event::signaled(),
            last_used: 0,
        }
    }

    fn state(&self) -> SlotState {
        if !self.landed.is_settled() {
            SlotState::Staging
        } else if self.users > 0 {
            SlotState::InUse
        } else if self.tag.is_some() {
            SlotState::Ready
        } else {
            SlotState::Idle
        }
    }

    fn is_free(&self) -> bool {
        self.users == 0 && self.reusable.is_set() && self.landed.is_settled()
    }
}

struct Registration {
    model: Weak<PipelineModel>,
    regions: Vec<Arc<PinnedRegion>>,
}

/// Transfer counters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransferStats {
    pub stagings: u64,
    pub bytes_staged: u64,
    pub resident_hits: u64,
    pub failures: u64,
    pub detached: u64,
    pub pinned_bytes: usize,
    pub registered_models: usize,
}

impl fmt::Display for TransferStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Transfers: {} stagings ({:.1} MB), {} resident hits, {} failures, {} detached, \
             {:.1} MB pinned for {} models",
            self.stagings,
            self.bytes_staged as f64 / (1024.0 * 1024.0),
            self.resident_hits,
            self.failures,
            self.detached,
            self.pinned_bytes as f64 / (1024.0 * 1024.0),
            self.registered_models,
        )
    }
}

/// Called on the copy stream with the slot index after each copy settles.
pub type LandedWaker = Arc<dyn Fn(usize) + Send + Sync>;

/// Owns pinned staging regions and the device slot pool.
///
/// Not thread-safe by itself; the scheduler actor is its only user.
pub struct TransferEngine {
    device: Device,
    backend: Arc<dyn DeviceBackend>,
    copy: Arc<Stream>,
    waker: LandedWaker,
    slots: Vec<Slot>,
    slot_capacity: Option<usize>,
    pinned_budget: Option<usize>,
    registry: HashMap<ModelId, Registration>,
    clock: u64,
    stats: TransferStats,
}

impl TransferEngine {
    pub fn new(
        device: Device,
        num_slots: usize,
        slot_capacity: Option<usize>,
        pinned_budget: Option<usize>,
        backend: Arc<dyn DeviceBackend>,
        copy: Arc<Stream>,
        waker: LandedWaker,
    ) -> Self {
        tracing::info!(
            "transfer engine: {} slots on {} via {} backend",
            num_slots,
            device,
            backend.name()
        );
        Self {
            device,
            backend,
            copy,
            waker,
            slots: (0..num_slots).map(|_| Slot::new()).collect(),
            slot_capacity,
            pinned_budget,
            registry: HashMap::new(),
            clock: 0,
            stats: TransferStats::default(),
        }
    }

    pub fn copy_stream(&self) -> &Arc<Stream> {
        &self.copy
    }

    pub fn num_slots(&self) -> usize {
        self.slots.len()
    }

    /// Pin a staging region for every stage of `model`.
    ///
    /// Idempotent. Regions of models that have since been dropped are
    /// released first.
    pub fn register(&mut self, model: &Arc<PipelineModel>) -> Result<()> {
        if self.registry.contains_key(&model.id()) {
            return Ok(());
        }
        self.purge();

        if let Some(cap) = self.slot_capacity {
            if model.max_stage_footprint() > cap {
                return Err(TidalError::ResourceExhaustion(format!(
                    "stage of {} bytes does not fit a {cap}-byte device slot",
                    model.max_stage_footprint()
                )));
            }
        }
        let needed = model.total_footprint();
        if let Some(budget) = self.pinned_budget {
            if self.stats.pinned_bytes + needed > budget {
                return Err(TidalError::ResourceExhaustion(format!(
                    "pinning {needed} bytes for '{}' exceeds the {budget}-byte budget ({} in use)",
                    model.name(),
                    self.stats.pinned_bytes
                )));
            }
        }

        let regions = model
            .stages()
            .iter()
            .map(|stage| Arc::new(PinnedRegion::pack(stage.weights())))
            .collect();
        self.registry.insert(model.id(), Registration { model: Arc::downgrade(model), regions });
        self.stats.pinned_bytes += needed;
        self.stats.registered_models = self.registry.len();
        tracing::info!("registered {} '{}': pinned {} bytes", model.id(), model.name(), needed);
        Ok(())
    }

    fn purge(&mut self) {
        let dead: Vec<ModelId> = self
            .registry
            .iter()
            .filter(|(_, r)| r.model.strong_count() == 0)
            .map(|(id, _)| *id)
            .collect();
        for id in dead {
            if let Some(reg) = self.registry.remove(&id) {
                let freed: usize = reg.regions.iter().map(|r| r.len()).sum();
                self.stats.pinned_bytes = self.stats.pinned_bytes.saturating_sub(freed);
                tracing::debug!("released {freed} pinned bytes of dropped {id}");
            }
            for slot in &mut self.slots {
                if slot.tag.is_some_and(|t| t.model == id) && slot.users == 0 {
                    slot.tag = None;
                }
            }
        }
        self.stats.registered_models = self.registry.len();
    }

    /// Slot already holding (or receiving) `stage` of `model`.
    pub fn resident(&self, model: ModelId, stage: usize) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.tag.is_some_and(|t| t.model == model && t.stage == stage))
    }

    /// A slot with `stage` of `model` in it, staging it into a free slot if
    /// needed. `None` if it is not resident and every slot is busy.
    pub fn claim(&mut self, model: ModelId, stage: usize, owner: HandleId) -> Result<Option<usize>> {
        if let Some(slot) = self.resident(model, stage) {
            self.stats.resident_hits += 1;
            return Ok(Some(slot));
        }
        match self.free_slot() {
            Some(slot) => self.stage(slot, model, stage, owner).map(|_| Some(slot)),
            None => Ok(None),
        }
    }

    /// A slot that may be restaged: untagged slots first, then the least
    /// recently used. Slots with a copy in flight or a pending consumer are
    /// never returned.
    pub fn free_slot(&self) -> Option<usize> {
        let free = || self.slots.iter().enumerate().filter(|(_, s)| s.is_free());
        free()
            .find(|(_, s)| s.tag.is_none())
            .or_else(|| free().min_by_key(|(_, s)| s.last_used))
            .map(|(i, _)| i)
    }

    /// Start copying `stage` of `model` into `slot` on the copy stream.
    pub fn stage(
        &mut self,
        slot: usize,
        model: ModelId,
        stage: usize,
        owner: HandleId,
    ) -> Result<Event> {
        let region = self
            .registry
            .get(&model)
            .and_then(|r| r.regions.get(stage))
            .cloned()
            .ok_or_else(|| {
                TidalError::Configuration(format!("stage {stage} of {model} is not registered"))
            })?;
        let bytes = region.len();
        let backend = self.backend.clone();
        let waker = self.waker.clone();
        let device = self.device;
        self.clock += 1;
        let clock = self.clock;

        let s = self.slot_mut(slot)?;
        if !s.reusable.is_set() || s.users > 0 {
            return Err(TidalError::Transfer(format!(
                "slot {slot} is still being read and cannot be restaged"
            )));
        }
        if !s.landed.is_settled() {
            return Err(TidalError::Transfer(format!("slot {slot} already has a copy in flight")));
        }

        let landed = Event::new();
        s.landed = landed.clone();
        s.tag = Some(DeviceTag { model, stage, owner });
        s.last_used = clock;
        let buffer = s.buffer.clone();

        let job = {
            let landed = landed.clone();
            move || {
                let outcome = {
                    let mut buf = buffer.write();
                    buf.contents = None;
                    let copied = backend.copy_to_device(device, &region.bytes, &mut buf.bytes);
                    if copied.is_ok() {
                        buf.entries = region.entries.clone();
                        buf.contents = Some((model, stage));
                    }
                    copied
                };
                landed.settle(outcome);
                waker(slot);
            }
        };
        if let Err(e) = self.copy.enqueue(job) {
            landed.fail(e.clone());
            return Err(e);
        }

        self.stats.stagings += 1;
        self.stats.bytes_staged += bytes as u64;
        tracing::debug!("staging stage {stage} of {model} into slot {slot} for {owner}");
        Ok(landed)
    }

    /// Register one more consumer of `slot`.
    pub fn acquire(&mut self, slot: usize) -> Result<SlotLease> {
        self.clock += 1;
        let clock = self.clock;
        let s = self.slot_mut(slot)?;
        if s.users == 0 {
            s.reusable = Event::new();
        }
        s.users += 1;
        s.last_used = clock;
        Ok(SlotLease { buffer: s.buffer.clone(), landed: s.landed.clone() })
    }

    /// A consumer of `slot` finished reading. The last one arms the
    /// reusable event.
    pub fn release(&mut self, slot: usize) -> Result<()> {
        let s = self.slot_mut(slot)?;
        if s.users == 0 {
            return Err(TidalError::Transfer(format!("slot {slot} released more often than acquired")));
        }
        s.users -= 1;
        if s.users == 0 {
            s.reusable.signal();
        }
        Ok(())
    }

    /// React to a settled copy. A failed copy leaves the slot untagged.
    ///
    /// Returns the failure, if any.
    pub fn on_landed(&mut self, slot: usize) -> Option<TidalError> {
        let s = self.slots.get_mut(slot)?;
        match s.landed.query() {
            Some(Err(e)) => {
                s.tag = None;
                self.stats.failures += 1;
                tracing::warn!("copy into slot {slot} failed: {e}");
                Some(e)
            }
            _ => None,
        }
    }

    /// Drop every idle tag owned by `owner` so those slots are picked first.
    pub fn detach(&mut self, owner: HandleId) -> usize {
        let mut detached = 0;
        for s in &mut self.slots {
            if s.users == 0 && s.tag.is_some_and(|t| t.owner == owner) {
                s.tag = None;
                detached += 1;
            }
        }
        self.stats.detached += detached as u64;
        detached
    }

    pub fn slot_state(&self, slot: usize) -> Option<SlotState> {
        self.slots.get(slot).map(Slot::state)
    }

    pub fn tag(&self, slot: usize) -> Option<DeviceTag> {
        self.slots.get(slot).and_then(|s| s.tag)
    }

    pub fn stats(&self) -> TransferStats {
        self.stats.clone()
    }

    fn slot_mut(&mut self, slot: usize) -> Result<&mut Slot> {
        let count = self.slots.len();
        self.slots
            .get_mut(slot)
            .ok_or_else(|| TidalError::Configuration(format!("slot {slot} out of range 0..{count}")))
    }
}

impl fmt::Debug for TransferEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferEngine")
            .field("device", &self.device)
            .field("slots", &self.slots.iter().map(Slot::state).collect::<Vec<_>>())
            .field("stats", &self.stats)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::{weights_from_f32, Stage};
    use std::sync::mpsc;

    fn model(stages: usize, floats: usize) -> Arc<PipelineModel> {
        let stages = (0..stages)
            .map(|i| {
                Stage::from_fn(
                    format!("s{i}"),
                    weights_from_f32([("w", vec![i as f32; floats])]),
                    |_, _, inputs| Ok(inputs),
                )
            })
            .collect();
        PipelineModel::sequential("m", stages).unwrap()
    }

    fn engine(slots: usize, capacity: Option<usize>, budget: Option<usize>) -> (TransferEngine, mpsc::Receiver<usize>) {
        let (tx, rx) = mpsc::channel();
        let tx = parking_lot::Mutex::new(tx);
        let waker: LandedWaker = Arc::new(move |slot| {
            let _ = tx.lock().send(slot);
        });
        let copy = Arc::new(Stream::new("test-copy").unwrap());
        let engine = TransferEngine::new(
            Device::Cuda(0),
            slots,
            capacity,
            budget,
            Arc::new(SimulatedDevice::default()),
            copy,
            waker,
        );
        (engine, rx)
    }

    fn owner() -> HandleId {
        HandleId::from_raw(7)
    }

    #[test]
    fn test_stage_and_read() {
        let (mut engine, rx) = engine(2, None, None);
        let m = model(2, 4);
        engine.register(&m).unwrap();

        let slot = engine.free_slot().unwrap();
        let landed = engine.stage(slot, m.id(), 1, owner()).unwrap();
        assert_eq!(landed.wait(), Ok(()));
        assert_eq!(rx.recv().unwrap(), slot);
        assert!(engine.on_landed(slot).is_none());
        assert_eq!(engine.slot_state(slot), Some(SlotState::Ready));
        assert_eq!(engine.resident(m.id(), 1), Some(slot));
        assert_eq!(engine.claim(m.id(), 1, owner()).unwrap(), Some(slot));
        assert_eq!(engine.stats().resident_hits, 1);

        let lease = engine.acquire(slot).unwrap();
        let buf = lease.buffer.read();
        assert_eq!(buf.contents, Some((m.id(), 1)));
        assert_eq!(buf.bytes.len(), 16);
        assert_eq!(buf.entries[0].name, "w");
    }

    #[test]
    fn test_slot_in_use_is_never_restaged() {
        let (mut engine, _rx) = engine(2, None, None);
        let m = model(3, 2);
        engine.register(&m).unwrap();

        let a = engine.free_slot().unwrap();
        engine.stage(a, m.id(), 0, owner()).unwrap().wait().unwrap();
        engine.acquire(a).unwrap();
        assert_eq!(engine.slot_state(a), Some(SlotState::InUse));
        assert!(matches!(engine.stage(a, m.id(), 2, owner()), Err(TidalError::Transfer(_))));

        let b = engine.free_slot().unwrap();
        assert_ne!(a, b);
        engine.stage(b, m.id(), 1, owner()).unwrap().wait().unwrap();
        engine.acquire(b).unwrap();
        assert_eq!(engine.free_slot(), None);

        engine.release(a).unwrap();
        assert_eq!(engine.free_slot(), Some(a));
        engine.stage(a, m.id(), 2, owner()).unwrap().wait().unwrap();
        assert_eq!(engine.tag(a).map(|t| t.stage), Some(2));
        assert!(engine.release(a).is_err());
    }

    #[test]
    fn test_free_slot_prefers_untagged_then_lru() {
        let (mut engine, _rx) = engine(3, None, None);
        let m = model(3, 1);
        engine.register(&m).unwrap();
        for stage in 0..3 {
            let slot = engine.free_slot().unwrap();
            assert!(engine.tag(slot).is_none());
            engine.stage(slot, m.id(), stage, owner()).unwrap().wait().unwrap();
        }
        // everything tagged: oldest first
        assert_eq!(engine.free_slot(), Some(0));
        engine.acquire(0).unwrap();
        engine.release(0).unwrap();
        assert_eq!(engine.free_slot(), Some(1));

        assert_eq!(engine.detach(owner()), 3);
        assert!(engine.tag(2).is_none());
        assert_eq!(engine.slot_state(2), Some(SlotState::Idle));
    }

    #[test]
    fn test_budgets() {
        let m = model(2, 8);
        let (mut tight_device, _rx) = engine(2, Some(16), None);
        assert!(matches!(tight_device.register(&m), Err(TidalError::ResourceExhaustion(_))));

        let (mut tight_pinned, _rx) = engine(2, None, Some(40));
        assert!(matches!(tight_pinned.register(&m), Err(TidalError::ResourceExhaustion(_))));

        let (mut roomy, _rx) = engine(2, Some(32), Some(64));
        roomy.register(&m).unwrap();
        roomy.register(&m).unwrap();
        assert_eq!(roomy.stats().pinned_bytes, 64);
    }

    #[test]
    fn test_dropped_models_are_purged() {
        let (mut engine, _rx) = engine(2, None, Some(64));
        let first = model(1, 16);
        engine.register(&first).unwrap();
        drop(first);
        let second = model(1, 16);
        engine.register(&second).unwrap();
        let stats = engine.stats();
        assert_eq!((stats.registered_models, stats.pinned_bytes), (1, 64));
    }

    struct FailingBackend;

    impl DeviceBackend for FailingBackend {
        fn name(&self) -> &str {
            "failing"
        }

        fn copy_to_device(&self, _: Device, _: &[u8], _: &mut Vec<u8>) -> Result<()> {
            Err(TidalError::Transfer("injected".into()))
        }
    }

    #[test]
    fn test_failed_copy_clears_tag() {
        let copy = Arc::new(Stream::new("test-fail").unwrap());
        let mut engine = TransferEngine::new(
            Device::Cuda(0),
            2,
            None,
            None,
            Arc::new(FailingBackend),
            copy,
            Arc::new(|_| {}),
        );
        let m = model(1, 1);
        engine.register(&m).unwrap();
        let landed = engine.stage(0, m.id(), 0, owner()).unwrap();
        assert!(landed.wait().is_err());
        assert!(engine.on_landed(0).is_some());
        assert!(engine.tag(0).is_none());
        assert_eq!(engine.stats().failures, 1);
    }
}
