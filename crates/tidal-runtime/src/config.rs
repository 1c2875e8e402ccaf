//! Configuration for the streaming runtime.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tidal_core::{Device, Result, TidalError};

/// Runtime configuration.
///
/// Controls the accelerator being driven, how deep each stage's pipeline may
/// get, and how much pinned host and device memory the transfer engine may
/// claim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Device every stage computes on.
    pub compute_device: Device,

    /// Maximum microbatches in flight at any one stage.
    pub pipeline_depth: usize,

    /// Number of device weight slots. Two is classic double buffering.
    pub device_buffers: usize,

    /// Device memory available for weight slots (0 = unbounded).
    pub device_memory_bytes: usize,

    /// Pinned host memory for staging regions (0 = derive from `pinned_memory_fraction`).
    pub pinned_memory_bytes: usize,

    /// Fraction of available RAM usable as pinned memory (0.0 = unbounded).
    pub pinned_memory_fraction: f32,

    /// Microbatches per request when the caller does not say.
    pub default_microbatches: usize,

    /// Throttle for the simulated copy engine, in bytes per second.
    pub simulated_bandwidth: Option<u64>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            compute_device: Device::Cuda(0),
            pipeline_depth: 4,
            device_buffers: 2,
            device_memory_bytes: 0,
            pinned_memory_bytes: 0,
            pinned_memory_fraction: 0.0,
            default_microbatches: 1,
            simulated_bandwidth: None,
        }
    }
}

impl RuntimeConfig {
    /// Load a config from a JSON file. Missing fields take their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            TidalError::Configuration(format!("failed to read {}: {e}", path.display()))
        })?;
        let config: Self = serde_json::from_str(&text).map_err(|e| {
            TidalError::Configuration(format!("failed to parse {}: {e}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check field ranges.
    pub fn validate(&self) -> Result<()> {
        if !self.compute_device.is_cuda() {
            return Err(TidalError::Configuration(format!(
                "compute device must be an accelerator, got {}",
                self.compute_device
            )));
        }
        if self.pipeline_depth == 0 {
            return Err(TidalError::Configuration("pipeline_depth must be at least 1".into()));
        }
        if self.device_buffers < 2 {
            return Err(TidalError::Configuration(format!(
                "device_buffers must be at least 2 for double buffering, got {}",
                self.device_buffers
            )));
        }
        if self.default_microbatches == 0 {
            return Err(TidalError::Configuration(
                "default_microbatches must be at least 1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.pinned_memory_fraction) {
            return Err(TidalError::Configuration(format!(
                "pinned_memory_fraction must be within 0.0..=1.0, got {}",
                self.pinned_memory_fraction
            )));
        }
        if self.simulated_bandwidth == Some(0) {
            return Err(TidalError::Configuration("simulated_bandwidth must be non-zero".into()));
        }
        Ok(())
    }

    /// Pinned memory budget in bytes, `None` if unbounded.
    pub fn pinned_budget(&self) -> Option<usize> {
        if self.pinned_memory_bytes > 0 {
            return Some(self.pinned_memory_bytes);
        }
        if self.pinned_memory_fraction > 0.0 {
            let available = available_ram_bytes();
            let budget = (available as f64 * self.pinned_memory_fraction as f64) as usize;
            tracing::info!(
                "pinned memory: {:.1} GB available, budgeting {:.1} GB ({:.0}%)",
                available as f64 / 1e9,
                budget as f64 / 1e9,
                self.pinned_memory_fraction * 100.0,
            );
            return Some(budget);
        }
        None
    }

    /// Capacity of one device slot in bytes, `None` if unbounded.
    pub fn slot_capacity(&self) -> Option<usize> {
        (self.device_memory_bytes > 0).then(|| self.device_memory_bytes / self.device_buffers)
    }
}

fn available_ram_bytes() -> usize {
    let sys = sysinfo::System::new_with_specifics(
        sysinfo::RefreshKind::new().with_memory(sysinfo::MemoryRefreshKind::everything()),
    );
    sys.available_memory() as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = RuntimeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.device_buffers, 2);
        assert_eq!(config.pinned_budget(), None);
        assert_eq!(config.slot_capacity(), None);
    }

    #[test]
    fn test_rejects_bad_values() {
        let bad = [
            RuntimeConfig { pipeline_depth: 0, ..Default::default() },
            RuntimeConfig { device_buffers: 1, ..Default::default() },
            RuntimeConfig { compute_device: Device::Cpu, ..Default::default() },
            RuntimeConfig { pinned_memory_fraction: 1.5, ..Default::default() },
            RuntimeConfig { default_microbatches: 0, ..Default::default() },
            RuntimeConfig { simulated_bandwidth: Some(0), ..Default::default() },
        ];
        for config in bad {
            assert!(matches!(config.validate(), Err(TidalError::Configuration(_))), "{config:?}");
        }
    }

    #[test]
    fn test_slot_capacity_splits_device_memory() {
        let config = RuntimeConfig {
            device_memory_bytes: 1 << 20,
            device_buffers: 4,
            ..Default::default()
        };
        assert_eq!(config.slot_capacity(), Some(1 << 18));
    }

    #[test]
    fn test_json_roundtrip_with_partial_fields() {
        let parsed: RuntimeConfig =
            serde_json::from_str(r#"{ "compute_device": "cuda:1", "pipeline_depth": 8 }"#).unwrap();
        assert_eq!(parsed.compute_device, Device::Cuda(1));
        assert_eq!(parsed.pipeline_depth, 8);
        assert_eq!(parsed.device_buffers, 2);

        let text = serde_json::to_string(&parsed).unwrap();
        assert!(text.contains("\"cuda:1\""));
    }

    #[test]
    fn test_from_json_file() {
        let path = std::env::temp_dir().join(format!("tidal-config-{}.json", std::process::id()));
        std::fs::write(&path, r#"{ "device_buffers": 3 }"#).unwrap();
        let config = RuntimeConfig::from_json_file(&path).unwrap();
        assert_eq!(config.device_buffers, 3);
        std::fs::remove_file(&path).unwrap();

        assert!(matches!(
            RuntimeConfig::from_json_file(&path),
            Err(TidalError::Configuration(_))
        ));
    }
}
