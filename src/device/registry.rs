use crate::config::DeviceConfig;
use crate::device::backend::{detect_gpu_backend, CpuBackend, DeviceBackend, UtilizationReading};
use crate::device::capabilities::{DeviceCapabilities, DeviceType};

/// Discovers and owns the set of compute devices.
///
/// The device set is fixed after `scan`; `refresh` only updates
/// `memory_available_gb`. All other components read immutable snapshots.
pub struct DeviceRegistry {
    cpu_backend: CpuBackend,
    gpu_backend: Box<dyn DeviceBackend>,
    devices: Vec<DeviceCapabilities>,
}

impl DeviceRegistry {
    /// Build a registry with capability-probed backends and scan once.
    /// A failed GPU driver initialization simply yields a CPU-only registry.
    pub fn new(config: &DeviceConfig) -> Self {
        let mut registry = Self {
            cpu_backend: CpuBackend::new(config),
            gpu_backend: detect_gpu_backend(),
            devices: Vec::new(),
        };
        registry.scan(config);
        registry
    }

    /// Registry over a fixed device list, bypassing hardware probing.
    /// Intended for embedders and tests that simulate a device topology.
    pub fn with_devices(devices: Vec<DeviceCapabilities>) -> Self {
        Self {
            cpu_backend: CpuBackend::new(&DeviceConfig::default()),
            gpu_backend: Box::new(crate::device::backend::NoOpBackend),
            devices,
        }
    }

    /// Enumerate devices: the CPU entry first (always present), then each
    /// detected GPU in index order. GPUs under the configured total-memory
    /// limit are excluded entirely, not merely deprioritized.
    pub fn scan(&mut self, config: &DeviceConfig) -> &[DeviceCapabilities] {
        let mut devices = self.cpu_backend.probe(config);
        devices.extend(self.gpu_backend.probe(config));

        tracing::info!(
            "Device scan complete: {:?}",
            devices.iter().map(|d| d.device_id.as_str()).collect::<Vec<_>>()
        );

        self.devices = devices;
        &self.devices
    }

    /// Update `memory_available_gb` for every registered device. Never adds
    /// or removes devices mid-run. `cpu_allocated_gb` is the tracker's sum of
    /// live CPU reservations.
    pub fn refresh(&mut self, cpu_allocated_gb: f64) {
        for device in &mut self.devices {
            match device.device_type {
                DeviceType::Cpu => {
                    device.memory_available_gb =
                        (device.memory_total_gb - cpu_allocated_gb).max(0.0);
                }
                DeviceType::Gpu => self.gpu_backend.refresh(device),
            }
        }
    }

    /// Immutable copy for scorer/monitor use; safe for concurrent reads.
    pub fn snapshot(&self) -> Vec<DeviceCapabilities> {
        self.devices.clone()
    }

    pub fn get(&self, device_id: &str) -> Option<&DeviceCapabilities> {
        self.devices.iter().find(|d| d.device_id == device_id)
    }

    pub fn has_gpu(&self) -> bool {
        self.devices.iter().any(|d| d.is_gpu())
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// Read current utilization for one device via its backend.
    pub fn sample(&self, device: &DeviceCapabilities) -> Option<UtilizationReading> {
        match device.device_type {
            DeviceType::Cpu => self.cpu_backend.sample(device),
            DeviceType::Gpu => self.gpu_backend.sample(device),
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub fn cpu(memory_total_gb: f64) -> DeviceCapabilities {
        DeviceCapabilities {
            device_id: "cpu".into(),
            device_type: DeviceType::Cpu,
            display_name: "CPU (8 cores)".into(),
            memory_total_gb,
            memory_available_gb: memory_total_gb,
            compute_capability: None,
            supports_fp16: false,
            supports_int8: true,
            max_batch_size: 4,
            estimated_performance: 1.0,
        }
    }

    pub fn gpu(index: u32, memory_gb: f64, performance: f64, fp16: bool) -> DeviceCapabilities {
        DeviceCapabilities {
            device_id: compact_str::format_compact!("cuda:{index}"),
            device_type: DeviceType::Gpu,
            display_name: format!("Test GPU {index}"),
            memory_total_gb: memory_gb,
            memory_available_gb: memory_gb,
            compute_capability: Some((7, 5)),
            supports_fp16: fp16,
            supports_int8: true,
            max_batch_size: 8,
            estimated_performance: performance,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{cpu, gpu};
    use super::*;

    #[test]
    fn test_snapshot_is_a_copy() {
        let mut registry = DeviceRegistry::with_devices(vec![cpu(16.0), gpu(0, 8.0, 5.0, true)]);
        let snapshot = registry.snapshot();
        registry.refresh(4.0);
        // Refresh mutated the registry's CPU entry, not the snapshot.
        assert_eq!(snapshot[0].memory_available_gb, 16.0);
        assert_eq!(registry.get("cpu").unwrap().memory_available_gb, 12.0);
    }

    #[test]
    fn test_refresh_keeps_device_set_fixed() {
        let mut registry = DeviceRegistry::with_devices(vec![cpu(16.0), gpu(0, 8.0, 5.0, true)]);
        assert_eq!(registry.device_count(), 2);
        registry.refresh(0.0);
        registry.refresh(20.0);
        assert_eq!(registry.device_count(), 2);
        // Over-allocation clamps to zero rather than going negative.
        assert_eq!(registry.get("cpu").unwrap().memory_available_gb, 0.0);
    }

    #[test]
    fn test_lookup_by_id() {
        let registry = DeviceRegistry::with_devices(vec![cpu(16.0), gpu(1, 8.0, 5.0, true)]);
        assert!(registry.get("cuda:1").is_some());
        assert!(registry.get("cuda:0").is_none());
        assert!(registry.has_gpu());
    }
}
