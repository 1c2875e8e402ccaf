//! Stages: one sequential partition of a model.
//!
//! A stage pairs its host-resident parameters with the executor that runs its
//! forward pass. The executor only ever sees parameters through a
//! [`DeviceParams`] view over the device slot they were staged into.

use std::sync::Arc;

use tidal_core::{Device, Result, Tensor};

/// A stage's parameters: parameter name to raw bytes.
///
/// Wrapped in `Arc` so the model, the transfer engine and executors can share
/// the host copy without duplicating it.
pub type LayerWeights = Arc<Vec<(String, Vec<u8>)>>;

/// Build [`LayerWeights`] from named f32 arrays.
pub fn weights_from_f32<S, V>(params: impl IntoIterator<Item = (S, V)>) -> LayerWeights
where
    S: Into<String>,
    V: AsRef<[f32]>,
{
    Arc::new(
        params
            .into_iter()
            .map(|(name, values)| {
                let bytes = values.as_ref().iter().flat_map(|v| v.to_ne_bytes()).collect();
                (name.into(), bytes)
            })
            .collect(),
    )
}

/// Location of one parameter inside a packed staging region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamEntry {
    pub name: String,
    pub offset: usize,
    pub len: usize,
}

/// Read-only view of a stage's parameters as resident on the device.
#[derive(Debug, Clone)]
pub struct DeviceParams<'a> {
    data: &'a [u8],
    entries: &'a [ParamEntry],
    scope: String,
}

impl<'a> DeviceParams<'a> {
    pub fn new(data: &'a [u8], entries: &'a [ParamEntry]) -> Self {
        Self { data, entries, scope: String::new() }
    }

    /// The whole packed buffer.
    pub fn bytes(&self) -> &'a [u8] {
        self.data
    }

    /// Raw bytes of parameter `name` (relative to the current scope).
    pub fn get(&self, name: &str) -> Option<&'a [u8]> {
        let full;
        let key = if self.scope.is_empty() {
            name
        } else {
            full = format!("{}.{}", self.scope, name);
            full.as_str()
        };
        self.entries
            .iter()
            .find(|e| e.name == key)
            .and_then(|e| self.data.get(e.offset..e.offset + e.len))
    }

    /// Parameter `name` decoded as native-endian f32 values.
    pub fn f32(&self, name: &str) -> Option<Vec<f32>> {
        let bytes = self.get(name)?;
        if bytes.len() % 4 != 0 {
            return None;
        }
        Some(
            bytes
                .chunks_exact(4)
                .map(|c| f32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
        )
    }

    /// Parameter names visible in the current scope.
    pub fn names(&self) -> Vec<&'a str> {
        let entries: &'a [ParamEntry] = self.entries;
        if self.scope.is_empty() {
            return entries.iter().map(|e| e.name.as_str()).collect();
        }
        let prefix = format!("{}.", self.scope);
        entries
            .iter()
            .filter_map(|e| e.name.strip_prefix(prefix.as_str()))
            .collect()
    }

    /// Narrow the view to parameters prefixed with `scope.`.
    pub fn scoped(&self, scope: &str) -> DeviceParams<'a> {
        let scope = if self.scope.is_empty() {
            scope.to_string()
        } else {
            format!("{}.{}", self.scope, scope)
        };
        DeviceParams { data: self.data, entries: self.entries, scope }
    }
}

/// Per-invocation facts handed to an executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageContext {
    pub stage: usize,
    pub microbatch: usize,
    pub require_grad: bool,
    pub device: Device,
}

/// Runs one stage's forward pass on one microbatch.
///
/// Called from the compute stream; the parameters are guaranteed resident
/// for the whole call.
pub trait LayerExecutor: Send + Sync {
    fn execute(
        &self,
        ctx: &StageContext,
        params: &DeviceParams<'_>,
        inputs: Vec<Tensor>,
    ) -> Result<Vec<Tensor>>;
}

impl<F> LayerExecutor for F
where
    F: Fn(&StageContext, &DeviceParams<'_>, Vec<Tensor>) -> Result<Vec<Tensor>> + Send + Sync,
{
    fn execute(
        &self,
        ctx: &StageContext,
        params: &DeviceParams<'_>,
        inputs: Vec<Tensor>,
    ) -> Result<Vec<Tensor>> {
        self(ctx, params, inputs)
    }
}

/// One partition of a model.
#[derive(Clone)]
pub struct Stage {
    name: String,
    weights: LayerWeights,
    executor: Arc<dyn LayerExecutor>,
    footprint: usize,
}

impl Stage {
    pub fn new(
        name: impl Into<String>,
        weights: LayerWeights,
        executor: impl LayerExecutor + 'static,
    ) -> Self {
        Self::from_shared(name, weights, Arc::new(executor))
    }

    /// Build a stage from a closure.
    pub fn from_fn<F>(name: impl Into<String>, weights: LayerWeights, f: F) -> Self
    where
        F: Fn(&StageContext, &DeviceParams<'_>, Vec<Tensor>) -> Result<Vec<Tensor>>
            + Send
            + Sync
            + 'static,
    {
        Self::from_shared(name, weights, Arc::new(f))
    }

    pub fn from_shared(
        name: impl Into<String>,
        weights: LayerWeights,
        executor: Arc<dyn LayerExecutor>,
    ) -> Self {
        let footprint = weights.iter().map(|(_, data)| data.len()).sum();
        Self {
            name: name.into(),
            weights,
            executor,
            footprint,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn weights(&self) -> &LayerWeights {
        &self.weights
    }

    pub fn executor(&self) -> &Arc<dyn LayerExecutor> {
        &self.executor
    }

    /// Parameter bytes; this is both the transfer size and the scheduling cost.
    pub fn footprint(&self) -> usize {
        self.footprint
    }
}

impl std::fmt::Debug for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stage")
            .field("name", &self.name)
            .field("params", &self.weights.len())
            .field("footprint", &self.footprint)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packed() -> (Vec<u8>, Vec<ParamEntry>) {
        let weights = weights_from_f32([("fc.weight", vec![1.0f32, 2.0]), ("fc.bias", vec![0.5])]);
        let mut data = Vec::new();
        let mut entries = Vec::new();
        for (name, bytes) in weights.iter() {
            entries.push(ParamEntry { name: name.clone(), offset: data.len(), len: bytes.len() });
            data.extend_from_slice(bytes);
        }
        (data, entries)
    }

    #[test]
    fn test_lookup_and_decode() {
        let (data, entries) = packed();
        let params = DeviceParams::new(&data, &entries);
        assert_eq!(params.f32("fc.weight"), Some(vec![1.0, 2.0]));
        assert_eq!(params.f32("fc.bias"), Some(vec![0.5]));
        assert!(params.get("missing").is_none());
        assert_eq!(params.bytes().len(), 12);
    }

    #[test]
    fn test_scoped_view() {
        let (data, entries) = packed();
        let params = DeviceParams::new(&data, &entries);
        let fc = params.scoped("fc");
        assert_eq!(fc.f32("bias"), Some(vec![0.5]));
        assert_eq!(fc.names(), vec!["weight", "bias"]);
        assert!(params.scoped("other").names().is_empty());
    }

    #[test]
    fn test_closure_executor_and_footprint() {
        let stage = Stage::from_fn("double", weights_from_f32([("w", [0.0f32; 4])]), |_, _, inputs| {
            Ok(inputs.iter().map(|t| t.map(|v| v * 2.0)).collect())
        });
        assert_eq!(stage.footprint(), 16);

        let ctx = StageContext { stage: 0, microbatch: 0, require_grad: false, device: Device::Cuda(0) };
        let out = stage
            .executor()
            .execute(&ctx, &DeviceParams::new(&[], &[]), vec![Tensor::from_f32(&[1.0], &[1])])
            .unwrap();
        assert_eq!(out[0].as_slice(), &[2.0]);
    }
}
