//! Nested request values and their flattened form.
//!
//! Requests arrive as arbitrary trees of tensors, scalars, lists and maps.
//! Stages only see the ordered tensor leaves; [`TreeSpec`] records the rest of
//! the tree so outputs can be put back into the caller's shape.

use std::collections::{BTreeMap, HashSet};

use tidal_core::{Result, Tensor, TidalError};

use crate::handle::AsyncHandle;

/// A request input or output.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Tensor(Tensor),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    /// The result of an earlier request, not yet substituted.
    Handle(AsyncHandle),
}

impl Value {
    pub fn as_tensor(&self) -> Option<&Tensor> {
        match self {
            Value::Tensor(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Map lookup; `None` for non-maps.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_map().and_then(|m| m.get(key))
    }

    /// Every distinct handle leaf, in depth-first order.
    pub fn handles(&self) -> Vec<AsyncHandle> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        let mut stack = vec![self];
        while let Some(v) = stack.pop() {
            match v {
                Value::Handle(h) => {
                    if seen.insert(h.id()) {
                        out.push(h.clone());
                    }
                }
                Value::List(items) => stack.extend(items.iter().rev()),
                Value::Map(map) => stack.extend(map.values().rev()),
                _ => {}
            }
        }
        out
    }

    /// Replace every handle leaf with `result` of that handle, failing on
    /// the first error.
    pub(crate) fn resolve_handles(&self, result: &dyn Fn(&AsyncHandle) -> Result<Value>) -> Result<Value> {
        Ok(match self {
            Value::Handle(h) => result(h)?,
            Value::List(items) => Value::List(
                items.iter().map(|v| v.resolve_handles(result)).collect::<Result<_>>()?,
            ),
            Value::Map(map) => Value::Map(
                map.iter()
                    .map(|(k, v)| -> Result<(String, Value)> { Ok((k.clone(), v.resolve_handles(result)?)) })
                    .collect::<Result<_>>()?,
            ),
            other => other.clone(),
        })
    }

    /// Same tree shape and leaf kinds, ignoring tensor contents.
    pub fn same_structure(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Tensor(a), Value::Tensor(b)) => a.dims().len() == b.dims().len(),
            (Value::List(a), Value::List(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.same_structure(y))
            }
            (Value::Map(a), Value::Map(b)) => {
                a.len() == b.len()
                    && a.iter()
                        .zip(b)
                        .all(|((ka, va), (kb, vb))| ka == kb && va.same_structure(vb))
            }
            (a, b) => std::mem::discriminant(a) == std::mem::discriminant(b),
        }
    }
}

impl From<Tensor> for Value {
    fn from(t: Tensor) -> Self {
        Value::Tensor(t)
    }
}

impl From<AsyncHandle> for Value {
    fn from(h: AsyncHandle) -> Self {
        Value::Handle(h)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(map: BTreeMap<String, Value>) -> Self {
        Value::Map(map)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

/// Shape of a value tree with its tensor leaves removed.
#[derive(Debug, Clone, PartialEq)]
pub enum TreeSpec {
    /// Slot filled by the next tensor.
    Tensor,
    /// Non-tensor leaf carried through unchanged.
    Const(Value),
    List(Vec<TreeSpec>),
    Map(Vec<(String, TreeSpec)>),
}

impl TreeSpec {
    /// Split `value` into its tensor leaves (depth-first, map keys sorted) and spec.
    ///
    /// Handle leaves must be resolved first.
    pub fn flatten(value: &Value) -> Result<(Vec<Tensor>, TreeSpec)> {
        let mut tensors = Vec::new();
        let spec = Self::flatten_into(value, &mut tensors)?;
        Ok((tensors, spec))
    }

    fn flatten_into(value: &Value, tensors: &mut Vec<Tensor>) -> Result<TreeSpec> {
        Ok(match value {
            Value::Tensor(t) => {
                tensors.push(t.clone());
                TreeSpec::Tensor
            }
            Value::List(items) => TreeSpec::List(
                items
                    .iter()
                    .map(|v| Self::flatten_into(v, tensors))
                    .collect::<Result<_>>()?,
            ),
            Value::Map(map) => TreeSpec::Map(
                map.iter()
                    .map(|(k, v)| -> Result<(String, TreeSpec)> {
                        Ok((k.clone(), Self::flatten_into(v, tensors)?))
                    })
                    .collect::<Result<_>>()?,
            ),
            Value::Handle(h) => {
                return Err(TidalError::UnsupportedInput(format!(
                    "request {} must be resolved before flattening",
                    h.id()
                )))
            }
            other => TreeSpec::Const(other.clone()),
        })
    }

    /// Number of tensor slots.
    pub fn num_tensors(&self) -> usize {
        match self {
            TreeSpec::Tensor => 1,
            TreeSpec::Const(_) => 0,
            TreeSpec::List(items) => items.iter().map(TreeSpec::num_tensors).sum(),
            TreeSpec::Map(entries) => entries.iter().map(|(_, s)| s.num_tensors()).sum(),
        }
    }

    /// Rebuild a value from `tensors`.
    ///
    /// When the stages changed the number of tensors the input tree no
    /// longer applies: a single output comes back as a bare tensor, several
    /// as a flat list.
    pub fn unflatten(&self, tensors: Vec<Tensor>) -> Result<Value> {
        if tensors.len() != self.num_tensors() {
            return Ok(match tensors.len() {
                1 => Value::Tensor(tensors.into_iter().next().unwrap_or_else(|| Tensor::scalar(0.0))),
                _ => Value::List(tensors.into_iter().map(Value::Tensor).collect()),
            });
        }
        let mut iter = tensors.into_iter();
        self.rebuild(&mut iter)
    }

    fn rebuild(&self, tensors: &mut std::vec::IntoIter<Tensor>) -> Result<Value> {
        Ok(match self {
            TreeSpec::Tensor => Value::Tensor(tensors.next().ok_or_else(|| {
                TidalError::UnsupportedInput("ran out of tensors while reassembling".into())
            })?),
            TreeSpec::Const(v) => v.clone(),
            TreeSpec::List(items) => {
                Value::List(items.iter().map(|s| s.rebuild(tensors)).collect::<Result<_>>()?)
            }
            TreeSpec::Map(entries) => Value::Map(
                entries
                    .iter()
                    .map(|(k, s)| -> Result<(String, Value)> { Ok((k.clone(), s.rebuild(tensors)?)) })
                    .collect::<Result<_>>()?,
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Value {
        let mut map = BTreeMap::new();
        map.insert("mask".to_string(), Value::Tensor(Tensor::from_f32(&[1., 0.], &[2])));
        map.insert("scale".to_string(), Value::Float(0.5));
        Value::List(vec![
            Value::Tensor(Tensor::from_f32(&[1., 2., 3., 4.], &[2, 2])),
            Value::Map(map),
            Value::Text("tag".into()),
        ])
    }

    #[test]
    fn test_flatten_orders_leaves() {
        let (tensors, spec) = TreeSpec::flatten(&sample()).unwrap();
        assert_eq!(tensors.len(), 2);
        assert_eq!(tensors[0].dims(), &[2, 2]);
        assert_eq!(tensors[1].dims(), &[2]);
        assert_eq!(spec.num_tensors(), 2);
    }

    #[test]
    fn test_unflatten_restores_tree() {
        let value = sample();
        let (tensors, spec) = TreeSpec::flatten(&value).unwrap();
        let doubled: Vec<Tensor> = tensors.iter().map(|t| t.map(|v| v * 2.0)).collect();
        let rebuilt = spec.unflatten(doubled).unwrap();
        assert!(rebuilt.same_structure(&value));
        let mask = rebuilt.as_list().unwrap()[1].get("mask").unwrap().as_tensor().unwrap();
        assert_eq!(mask.as_slice(), &[2., 0.]);
        assert_eq!(rebuilt.as_list().unwrap()[2], Value::Text("tag".into()));
    }

    #[test]
    fn test_unflatten_with_changed_arity() {
        let (_, spec) = TreeSpec::flatten(&sample()).unwrap();
        let one = spec.unflatten(vec![Tensor::scalar(1.0)]).unwrap();
        assert!(matches!(one, Value::Tensor(_)));
        let three = spec
            .unflatten(vec![Tensor::scalar(1.0), Tensor::scalar(2.0), Tensor::scalar(3.0)])
            .unwrap();
        assert_eq!(three.as_list().map(|l| l.len()), Some(3));
    }

    #[test]
    fn test_same_structure_detects_differences() {
        let a = Value::List(vec![Value::Int(1), Value::Tensor(Tensor::zeros(&[2]))]);
        let b = Value::List(vec![Value::Int(7), Value::Tensor(Tensor::zeros(&[5]))]);
        let c = Value::List(vec![Value::Int(1)]);
        assert!(a.same_structure(&b));
        assert!(!a.same_structure(&c));
    }

    #[test]
    fn test_handles_empty_without_dependencies() {
        assert!(sample().handles().is_empty());
        let unreachable = |_: &AsyncHandle| -> Result<Value> { Err(TidalError::SchedulerClosed) };
        assert_eq!(sample().resolve_handles(&unreachable).unwrap(), sample());
    }
}
