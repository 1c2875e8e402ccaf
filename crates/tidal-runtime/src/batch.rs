//! Splitting request inputs into microbatches and gathering outputs back.

use std::collections::BTreeMap;
use std::sync::Arc;

use tidal_core::{Result, Tensor, TidalError};

use crate::handle::AsyncHandle;
use crate::value::{TreeSpec, Value};

/// One microbatch's tensor leaves plus the spec to rebuild its tree.
#[derive(Debug, Clone)]
pub struct FlatMicrobatch {
    pub tensors: Vec<Tensor>,
    pub spec: TreeSpec,
}

/// Turns a request value into microbatches and outputs back into one value.
pub trait BatchCodec: Send + Sync {
    /// Check at submission time that `input` can be split. Handle leaves are
    /// not known yet and are skipped.
    fn validate(&self, input: &Value, num_microbatches: usize) -> Result<()>;

    /// Split a fully resolved input into `num_microbatches` flattened parts.
    fn flatten(&self, input: &Value, num_microbatches: usize) -> Result<Vec<FlatMicrobatch>>;

    /// Combine per-microbatch outputs into the caller-visible result.
    fn gather(&self, outputs: Vec<Value>) -> Result<Value>;
}

/// Splits every tensor leaf along dim 0 and concatenates outputs along dim 0.
///
/// With more than one microbatch, all tensor leaves must share the same
/// dim-0 size so that microbatch `i` lines up across leaves.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultBatchCodec;

impl BatchCodec for DefaultBatchCodec {
    fn validate(&self, input: &Value, num_microbatches: usize) -> Result<()> {
        if num_microbatches == 0 {
            return Err(TidalError::UnsupportedInput("at least one microbatch is required".into()));
        }
        if num_microbatches == 1 {
            return Ok(());
        }
        let mut batch = None;
        check_rows(input, num_microbatches, &mut batch)
    }

    fn flatten(&self, input: &Value, num_microbatches: usize) -> Result<Vec<FlatMicrobatch>> {
        self.validate(input, num_microbatches)?;
        let parts = if num_microbatches == 1 {
            vec![input.clone()]
        } else {
            split_value(input, num_microbatches)?
        };
        parts
            .iter()
            .map(|part| {
                let (tensors, spec) = TreeSpec::flatten(part)?;
                Ok(FlatMicrobatch { tensors, spec })
            })
            .collect()
    }

    fn gather(&self, outputs: Vec<Value>) -> Result<Value> {
        if outputs.len() <= 1 {
            return Ok(outputs.into_iter().next().unwrap_or_default());
        }
        merge_values(outputs)
    }
}

fn check_rows(value: &Value, n: usize, batch: &mut Option<usize>) -> Result<()> {
    match value {
        Value::Tensor(t) => {
            let rows = t.shape().dim(0).ok_or_else(|| {
                TidalError::UnsupportedInput(format!(
                    "cannot split a 0-dimensional tensor into {n} microbatches"
                ))
            })?;
            if rows < n {
                return Err(TidalError::UnsupportedInput(format!(
                    "batch of {rows} rows cannot be split into {n} microbatches"
                )));
            }
            match *batch {
                Some(expected) if expected != rows => Err(TidalError::UnsupportedInput(format!(
                    "tensor leaves disagree on batch size: {expected} vs {rows}"
                ))),
                _ => {
                    *batch = Some(rows);
                    Ok(())
                }
            }
        }
        Value::List(items) => items.iter().try_for_each(|v| check_rows(v, n, batch)),
        Value::Map(map) => map.values().try_for_each(|v| check_rows(v, n, batch)),
        _ => Ok(()),
    }
}

fn split_value(value: &Value, n: usize) -> Result<Vec<Value>> {
    Ok(match value {
        Value::Tensor(t) => t.chunk(n)?.into_iter().map(Value::Tensor).collect(),
        Value::List(items) => {
            let mut parts = vec![Vec::with_capacity(items.len()); n];
            for item in items {
                for (part, piece) in parts.iter_mut().zip(split_value(item, n)?) {
                    part.push(piece);
                }
            }
            parts.into_iter().map(Value::List).collect()
        }
        Value::Map(map) => {
            let mut parts = vec![BTreeMap::new(); n];
            for (key, item) in map {
                for (part, piece) in parts.iter_mut().zip(split_value(item, n)?) {
                    part.insert(key.clone(), piece);
                }
            }
            parts.into_iter().map(Value::Map).collect()
        }
        other => vec![other.clone(); n],
    })
}

fn merge_values(parts: Vec<Value>) -> Result<Value> {
    let first = parts.first().cloned().unwrap_or_default();
    Ok(match first {
        Value::Tensor(_) => {
            let tensors = parts
                .into_iter()
                .map(|p| match p {
                    Value::Tensor(t) => Ok(t),
                    other => Err(mismatch(&other)),
                })
                .collect::<Result<Vec<_>>>()?;
            Value::Tensor(Tensor::cat(&tensors)?)
        }
        Value::List(ref items) => {
            let width = items.len();
            let mut columns: Vec<Vec<Value>> = vec![Vec::with_capacity(parts.len()); width];
            for part in parts {
                match part {
                    Value::List(items) if items.len() == width => {
                        for (column, item) in columns.iter_mut().zip(items) {
                            column.push(item);
                        }
                    }
                    other => return Err(mismatch(&other)),
                }
            }
            Value::List(columns.into_iter().map(merge_values).collect::<Result<_>>()?)
        }
        Value::Map(ref map) => {
            let mut columns: BTreeMap<String, Vec<Value>> =
                map.keys().map(|k| (k.clone(), Vec::new())).collect();
            for part in parts {
                match part {
                    Value::Map(entries) if entries.len() == columns.len() => {
                        for (key, item) in entries {
                            columns.get_mut(&key).ok_or_else(|| mismatch(&item))?.push(item);
                        }
                    }
                    other => return Err(mismatch(&other)),
                }
            }
            Value::Map(
                columns
                    .into_iter()
                    .map(|(k, column)| -> Result<(String, Value)> { Ok((k, merge_values(column)?)) })
                    .collect::<Result<_>>()?,
            )
        }
        other => other,
    })
}

fn mismatch(found: &Value) -> TidalError {
    TidalError::UnsupportedInput(format!(
        "microbatch outputs disagree in structure near {}",
        match found {
            Value::None => "none",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Text(_) => "text",
            Value::Tensor(_) => "tensor",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Handle(_) => "handle",
        }
    ))
}

/// The captured input of one request.
#[derive(Clone)]
pub struct Batch {
    input: Value,
    num_microbatches: usize,
    codec: Arc<dyn BatchCodec>,
    dependencies: Vec<AsyncHandle>,
}

impl Batch {
    /// Capture `input`, validating it against `codec` immediately.
    pub fn new(input: Value, num_microbatches: usize, codec: Arc<dyn BatchCodec>) -> Result<Self> {
        codec.validate(&input, num_microbatches)?;
        let dependencies = input.handles();
        Ok(Self {
            input,
            num_microbatches,
            codec,
            dependencies,
        })
    }

    pub fn input(&self) -> &Value {
        &self.input
    }

    pub fn num_microbatches(&self) -> usize {
        self.num_microbatches
    }

    pub fn codec(&self) -> &Arc<dyn BatchCodec> {
        &self.codec
    }

    /// Upstream requests whose results feed this input.
    pub fn dependencies(&self) -> &[AsyncHandle] {
        &self.dependencies
    }

    /// Substitute upstream outputs, as they sit on the compute device, and
    /// split into microbatches. Every dependency must have resolved.
    pub(crate) fn materialize(&self) -> Result<Vec<FlatMicrobatch>> {
        let resolved = if self.dependencies.is_empty() {
            self.input.clone()
        } else {
            self.input.resolve_handles(&AsyncHandle::device_output)?
        };
        let parts = self.codec.flatten(&resolved, self.num_microbatches)?;
        if parts.len() != self.num_microbatches {
            return Err(TidalError::UnsupportedInput(format!(
                "codec produced {} microbatches, expected {}",
                parts.len(),
                self.num_microbatches
            )));
        }
        Ok(parts)
    }
}

impl std::fmt::Debug for Batch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Batch")
            .field("num_microbatches", &self.num_microbatches)
            .field("dependencies", &self.dependencies.len())
            .finish()
    }
}
