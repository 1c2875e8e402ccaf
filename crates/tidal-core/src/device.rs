use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TidalError;

/// Memory space a tensor or buffer lives in.
///
/// Serialized as its display form (`"cpu"`, `"cuda:0"`) so configs stay readable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Device {
    /// Host memory.
    #[default]
    Cpu,
    /// Accelerator memory with device index.
    Cuda(usize),
}

impl Device {
    /// Whether this is host memory.
    pub fn is_cpu(&self) -> bool {
        matches!(self, Device::Cpu)
    }

    /// Whether this is accelerator memory.
    pub fn is_cuda(&self) -> bool {
        matches!(self, Device::Cuda(_))
    }

    /// Get the accelerator index, if applicable.
    pub fn cuda_index(&self) -> Option<usize> {
        match self {
            Device::Cuda(idx) => Some(*idx),
            _ => None,
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Cuda(idx) => write!(f, "cuda:{idx}"),
        }
    }
}

impl FromStr for Device {
    type Err = TidalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        if s == "cpu" {
            return Ok(Device::Cpu);
        }
        if s == "cuda" {
            return Ok(Device::Cuda(0));
        }
        if let Some(idx) = s.strip_prefix("cuda:") {
            return idx
                .parse()
                .map(Device::Cuda)
                .map_err(|_| TidalError::Configuration(format!("invalid device index in '{s}'")));
        }
        Err(TidalError::Configuration(format!("unknown device '{s}'")))
    }
}

impl TryFrom<String> for Device {
    type Error = TidalError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Device> for String {
    fn from(device: Device) -> Self {
        device.to_string()
    }
}
