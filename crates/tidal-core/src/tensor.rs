use std::fmt;
use std::sync::Arc;

use crate::device::Device;
use crate::error::TidalError;
use crate::shape::Shape;
use crate::Result;

/// A dense f32 array tagged with the memory space it lives in.
///
/// The element buffer is reference-counted, so cloning a tensor or moving it
/// between streams never copies data; `to_device` produces a fresh buffer,
/// which is what a real transfer would do.
///
/// ```
/// use tidal_core::{Device, Tensor};
///
/// let t = Tensor::from_f32(&[1.0, 2.0, 3.0, 4.0], &[2, 2]);
/// assert_eq!(t.dims(), &[2, 2]);
/// let d = t.to_device(Device::Cuda(0));
/// assert!(d.device().is_cuda());
/// assert_eq!(d.as_slice(), t.as_slice());
/// ```
#[derive(Clone, PartialEq)]
pub struct Tensor {
    data: Arc<Vec<f32>>,
    shape: Shape,
    device: Device,
}

impl Tensor {
    /// Create a host tensor from f32 data with the given shape.
    pub fn from_f32(data: &[f32], shape: &[usize]) -> Self {
        Self::from_vec(data.to_vec(), shape)
    }

    /// Create a host tensor taking ownership of `data`.
    pub fn from_vec(data: Vec<f32>, shape: &[usize]) -> Self {
        let s = Shape::new(shape);
        assert_eq!(
            s.numel(),
            data.len(),
            "Shape {:?} requires {} elements, got {}",
            shape,
            s.numel(),
            data.len()
        );
        Self {
            data: Arc::new(data),
            shape: s,
            device: Device::Cpu,
        }
    }

    /// Zero-dimensional host tensor.
    pub fn scalar(value: f32) -> Self {
        Self {
            data: Arc::new(vec![value]),
            shape: Shape::scalar(),
            device: Device::Cpu,
        }
    }

    /// Host tensor of zeros.
    pub fn zeros(shape: &[usize]) -> Self {
        let s = Shape::new(shape);
        Self::from_vec(vec![0.0; s.numel()], shape)
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn dims(&self) -> &[usize] {
        self.shape.dims()
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }

    /// Size in bytes of the element buffer.
    pub fn nbytes(&self) -> usize {
        self.data.len() * std::mem::size_of::<f32>()
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    /// Copy into `device`. Same-device calls are free and share the buffer.
    pub fn to_device(&self, device: Device) -> Tensor {
        if device == self.device {
            return self.clone();
        }
        Self {
            data: Arc::new(self.data.as_ref().clone()),
            shape: self.shape.clone(),
            device,
        }
    }

    /// Element-wise map, keeping shape and device.
    pub fn map(&self, f: impl Fn(f32) -> f32) -> Tensor {
        Self {
            data: Arc::new(self.data.iter().map(|&v| f(v)).collect()),
            shape: self.shape.clone(),
            device: self.device,
        }
    }

    /// Split along dim 0 into `n` non-empty chunks whose sizes differ by at most one.
    pub fn chunk(&self, n: usize) -> Result<Vec<Tensor>> {
        if n == 0 {
            return Err(TidalError::UnsupportedInput("cannot split into 0 chunks".into()));
        }
        let rows = self.shape.dim(0).ok_or_else(|| {
            TidalError::UnsupportedInput("cannot split a 0-dimensional tensor along dim 0".into())
        })?;
        if rows < n {
            return Err(TidalError::UnsupportedInput(format!(
                "dim 0 has {rows} rows, fewer than {n} microbatches"
            )));
        }

        let row = self.shape.row_numel();
        let base = rows / n;
        let extra = rows % n;
        let mut chunks = Vec::with_capacity(n);
        let mut start = 0;
        for i in 0..n {
            let len = base + usize::from(i < extra);
            let data = self.data[start * row..(start + len) * row].to_vec();
            chunks.push(Tensor {
                data: Arc::new(data),
                shape: self.shape.with_rows(len),
                device: self.device,
            });
            start += len;
        }
        Ok(chunks)
    }

    /// Concatenate along dim 0. All parts must share trailing dims and device.
    pub fn cat(parts: &[Tensor]) -> Result<Tensor> {
        let first = parts
            .first()
            .ok_or_else(|| TidalError::UnsupportedInput("cannot concatenate zero tensors".into()))?;
        if parts.len() == 1 {
            return Ok(first.clone());
        }
        if first.shape.is_scalar() {
            return Err(TidalError::UnsupportedInput(
                "cannot concatenate 0-dimensional tensors".into(),
            ));
        }

        let mut rows = 0;
        let mut data = Vec::with_capacity(parts.iter().map(|t| t.numel()).sum());
        for t in parts {
            if t.device != first.device {
                return Err(TidalError::UnsupportedInput(format!(
                    "cannot concatenate tensors on {} and {}",
                    first.device, t.device
                )));
            }
            if t.dims().get(1..) != first.dims().get(1..) {
                return Err(TidalError::UnsupportedInput(format!(
                    "trailing dims differ: {} vs {}",
                    first.shape, t.shape
                )));
            }
            rows += t.dims()[0];
            data.extend_from_slice(&t.data);
        }
        Ok(Tensor {
            data: Arc::new(data),
            shape: first.shape.with_rows(rows),
            device: first.device,
        })
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tensor(shape={}, device={}", self.shape, self.device)?;
        if self.numel() <= 8 {
            write!(f, ", data={:?}", self.data.as_slice())?;
        }
        write!(f, ")")
    }
}
