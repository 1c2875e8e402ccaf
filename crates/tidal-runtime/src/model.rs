//! Streamed models and how they are cut into stages.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tidal_core::{Result, Tensor, TidalError};

use crate::stage::{DeviceParams, LayerExecutor, LayerWeights, Stage, StageContext};

static NEXT_MODEL_ID: AtomicU64 = AtomicU64::new(0);

/// Stable identity of a [`PipelineModel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModelId(u64);

impl ModelId {
    fn next() -> Self {
        ModelId(NEXT_MODEL_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "model#{}", self.0)
    }
}

/// A model ready to be streamed: an ordered, immutable sequence of stages.
///
/// The wrapped object (if the model came from a [`Partitioner`]) is reachable
/// through [`inner`](Self::inner); nothing is forwarded to it implicitly.
pub struct PipelineModel {
    id: ModelId,
    name: String,
    stages: Vec<Stage>,
    total_footprint: usize,
    inner: Option<Arc<dyn Any + Send + Sync>>,
}

impl PipelineModel {
    /// Wrap already-partitioned stages.
    pub fn sequential(name: impl Into<String>, stages: Vec<Stage>) -> Result<Arc<Self>> {
        Self::build(name.into(), stages, None)
    }

    /// Partition `model` and keep it reachable through [`inner`](Self::inner).
    pub fn partitioned<M, P>(
        name: impl Into<String>,
        model: M,
        partitioner: &P,
        hints: &SplitHints,
    ) -> Result<Arc<Self>>
    where
        M: Any + Send + Sync,
        P: Partitioner<M> + ?Sized,
    {
        let stages = partitioner.partition(&model, hints)?;
        Self::build(name.into(), stages, Some(Arc::new(model)))
    }

    fn build(
        name: String,
        stages: Vec<Stage>,
        inner: Option<Arc<dyn Any + Send + Sync>>,
    ) -> Result<Arc<Self>> {
        if stages.is_empty() {
            return Err(TidalError::Configuration(format!("model '{name}' has no stages")));
        }
        let total_footprint = stages.iter().map(Stage::footprint).sum();
        let model = Self {
            id: ModelId::next(),
            name,
            stages,
            total_footprint,
            inner,
        };
        tracing::debug!(
            "built {} '{}': {} stages, {} bytes",
            model.id,
            model.name,
            model.stages.len(),
            model.total_footprint
        );
        Ok(Arc::new(model))
    }

    pub fn id(&self) -> ModelId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn num_stages(&self) -> usize {
        self.stages.len()
    }

    pub fn stage(&self, index: usize) -> Option<&Stage> {
        self.stages.get(index)
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Parameter bytes across all stages; the workload of one request.
    pub fn total_footprint(&self) -> usize {
        self.total_footprint
    }

    /// Largest single stage, which bounds the size of a device slot.
    pub fn max_stage_footprint(&self) -> usize {
        self.stages.iter().map(Stage::footprint).max().unwrap_or(0)
    }

    /// The wrapped model object, if it is an `M`.
    pub fn inner<M: Any>(&self) -> Option<&M> {
        self.inner.as_ref().and_then(|m| m.downcast_ref::<M>())
    }
}

impl fmt::Debug for PipelineModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineModel")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("stages", &self.stages)
            .finish()
    }
}

/// Where a split is forced relative to a named layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitPoint {
    /// Start a new stage at this layer.
    Beginning,
    /// End the current stage after this layer.
    End,
}

/// User-supplied split points, keyed by layer name.
#[derive(Debug, Clone, Default)]
pub struct SplitHints {
    points: HashMap<String, SplitPoint>,
}

impl SplitHints {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, layer: impl Into<String>, point: SplitPoint) -> Self {
        self.points.insert(layer.into(), point);
        self
    }

    pub fn get(&self, layer: &str) -> Option<SplitPoint> {
        self.points.get(layer).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// Turns a model object into an ordered sequence of stages.
pub trait Partitioner<M> {
    fn partition(&self, model: &M, hints: &SplitHints) -> Result<Vec<Stage>>;
}

/// One named layer of a [`LayerStack`].
#[derive(Clone)]
pub struct Layer {
    name: String,
    weights: LayerWeights,
    executor: Arc<dyn LayerExecutor>,
}

impl Layer {
    pub fn new(
        name: impl Into<String>,
        weights: LayerWeights,
        executor: impl LayerExecutor + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            weights,
            executor: Arc::new(executor),
        }
    }

    pub fn from_fn<F>(name: impl Into<String>, weights: LayerWeights, f: F) -> Self
    where
        F: Fn(&StageContext, &DeviceParams<'_>, Vec<Tensor>) -> Result<Vec<Tensor>>
            + Send
            + Sync
            + 'static,
    {
        Self {
            name: name.into(),
            weights,
            executor: Arc::new(f),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn footprint(&self) -> usize {
        self.weights.iter().map(|(_, data)| data.len()).sum()
    }
}

/// An ordered list of layers, the simplest model a partitioner can cut.
#[derive(Clone, Default)]
pub struct LayerStack {
    layers: Vec<Layer>,
}

impl LayerStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, layer: Layer) {
        self.layers.push(layer);
    }

    pub fn with_layer(mut self, layer: Layer) -> Self {
        self.push(layer);
        self
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }
}

/// Runs a group of consecutive layers as one stage.
struct LayerGroup {
    layers: Vec<(String, Arc<dyn LayerExecutor>)>,
}

impl LayerExecutor for LayerGroup {
    fn execute(
        &self,
        ctx: &StageContext,
        params: &DeviceParams<'_>,
        inputs: Vec<Tensor>,
    ) -> Result<Vec<Tensor>> {
        self.layers.iter().try_fold(inputs, |acts, (name, executor)| {
            executor.execute(ctx, &params.scoped(name), acts)
        })
    }
}

/// Groups consecutive layers of a [`LayerStack`] into `stages` stages of
/// roughly equal parameter size. Split hints always cut, even if that yields
/// more stages than asked for.
#[derive(Debug, Clone, Copy)]
pub struct BalancedPartitioner {
    pub stages: usize,
}

impl BalancedPartitioner {
    pub fn new(stages: usize) -> Self {
        Self { stages }
    }

    fn groups(&self, stack: &LayerStack, hints: &SplitHints) -> Vec<Vec<usize>> {
        let n = stack.len();
        let k = self.stages.min(n).max(1);
        let total: usize = stack.layers.iter().map(Layer::footprint).sum();
        let target = total as f64 / k as f64;

        let mut groups: Vec<Vec<usize>> = Vec::new();
        let mut current = Vec::new();
        let mut consumed = 0usize;
        for (i, layer) in stack.layers.iter().enumerate() {
            if hints.get(&layer.name) == Some(SplitPoint::Beginning) && !current.is_empty() {
                groups.push(std::mem::take(&mut current));
            }
            current.push(i);
            consumed += layer.footprint();

            let layers_left = n - i - 1;
            if layers_left == 0 {
                break;
            }
            let stages_left = k.saturating_sub(groups.len() + 1);
            let forced = hints.get(&layer.name) == Some(SplitPoint::End);
            let balanced = stages_left > 0
                && (consumed as f64 >= target * (groups.len() + 1) as f64
                    || layers_left <= stages_left);
            if forced || balanced {
                groups.push(std::mem::take(&mut current));
            }
        }
        if !current.is_empty() {
            groups.push(current);
        }
        groups
    }
}

impl Partitioner<LayerStack> for BalancedPartitioner {
    fn partition(&self, stack: &LayerStack, hints: &SplitHints) -> Result<Vec<Stage>> {
        if self.stages == 0 {
            return Err(TidalError::Configuration("cannot partition into 0 stages".into()));
        }
        if stack.is_empty() {
            return Err(TidalError::Configuration("cannot partition an empty layer stack".into()));
        }
        if self.stages > stack.len() {
            tracing::warn!(
                "asked for {} stages but the stack has only {} layers",
                self.stages,
                stack.len()
            );
        }

        let stages = self
            .groups(stack, hints)
            .into_iter()
            .map(|group| {
                let layers: Vec<&Layer> = group.iter().map(|&i| &stack.layers[i]).collect();
                let name = match (layers.first(), layers.last()) {
                    (Some(first), Some(last)) if layers.len() > 1 => {
                        format!("{}..{}", first.name, last.name)
                    }
                    (Some(only), _) => only.name.clone(),
                    _ => String::new(),
                };
                let weights: LayerWeights = Arc::new(
                    layers
                        .iter()
                        .flat_map(|layer| {
                            layer
                                .weights
                                .iter()
                                .map(move |(param, data)| (format!("{}.{param}", layer.name), data.clone()))
                        })
                        .collect(),
                );
                let executor = LayerGroup {
                    layers: layers.iter().map(|l| (l.name.clone(), l.executor.clone())).collect(),
                };
                Stage::new(name, weights, executor)
            })
            .collect();
        Ok(stages)
    }
}
