use crate::config::DeviceConfig;
use crate::device::capabilities::{DeviceCapabilities, DeviceType};
use compact_str::format_compact;
use nvml_wrapper::enum_wrappers::device::TemperatureSensor;
use nvml_wrapper::Nvml;

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// One utilization reading for a device, taken by the performance monitor.
#[derive(Debug, Clone, Copy)]
pub struct UtilizationReading {
    pub utilization_pct: f64,
    pub memory_used_gb: f64,
    pub temperature_c: Option<f64>,
}

/// Native access to one family of compute devices.
///
/// Backends are selected once at startup via capability probing
/// (`detect_gpu_backend`); a missing GPU runtime yields `NoOpBackend`, never
/// an error surfaced to callers.
pub trait DeviceBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Enumerate devices this backend can drive. Devices whose total memory
    /// falls below the configured limit are excluded entirely.
    fn probe(&self, config: &DeviceConfig) -> Vec<DeviceCapabilities>;

    /// Update `memory_available_gb` in place. Transient driver errors leave
    /// the previous value untouched.
    fn refresh(&self, device: &mut DeviceCapabilities);

    /// Read current utilization for one device, if the backend can.
    fn sample(&self, device: &DeviceCapabilities) -> Option<UtilizationReading>;
}

/// The CPU is always present and never excluded. Its memory budget comes from
/// configuration; availability is managed by the registry against the
/// allocation tracker rather than probed from the OS.
pub struct CpuBackend {
    total_memory_gb: f64,
}

impl CpuBackend {
    pub fn new(config: &DeviceConfig) -> Self {
        Self {
            total_memory_gb: config.cpu_memory_gb,
        }
    }
}

impl DeviceBackend for CpuBackend {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn probe(&self, _config: &DeviceConfig) -> Vec<DeviceCapabilities> {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        vec![DeviceCapabilities {
            device_id: "cpu".into(),
            device_type: DeviceType::Cpu,
            display_name: format!("CPU ({cores} cores)"),
            memory_total_gb: self.total_memory_gb,
            memory_available_gb: self.total_memory_gb,
            compute_capability: None,
            supports_fp16: false,
            supports_int8: true,
            max_batch_size: 4,
            estimated_performance: 1.0,
        }]
    }

    fn refresh(&self, _device: &mut DeviceCapabilities) {
        // CPU availability is derived from live allocations by the registry.
    }

    fn sample(&self, _device: &DeviceCapabilities) -> Option<UtilizationReading> {
        None
    }
}

/// NVML-backed CUDA devices.
pub struct CudaBackend {
    nvml: Nvml,
}

impl CudaBackend {
    /// Probe for a usable NVML runtime. `None` means no CUDA GPUs will be
    /// registered; this is the normal path on machines without a driver.
    pub fn probe_runtime() -> Option<Self> {
        match Nvml::init() {
            Ok(nvml) => Some(Self { nvml }),
            Err(e) => {
                tracing::debug!("NVML unavailable: {e}");
                None
            }
        }
    }

    fn device_index(device: &DeviceCapabilities) -> Option<u32> {
        device.device_id.strip_prefix("cuda:")?.parse().ok()
    }

    /// Relative throughput estimate from memory size and architecture
    /// generation, capped at 10x the CPU baseline.
    fn estimate_performance(memory_gb: f64, compute_capability: (u32, u32)) -> f64 {
        let mut score = 2.0;

        // 8GB is the reference card; larger memory scales up to 2x.
        score *= (memory_gb / 8.0).min(2.0);

        let cc = compute_capability.0 * 10 + compute_capability.1;
        if cc >= 75 {
            score *= 1.5; // Turing and newer
        } else if cc >= 70 {
            score *= 1.3; // Volta
        } else if cc >= 60 {
            score *= 1.1; // Pascal
        }

        score.clamp(1.0, 10.0)
    }
}

impl DeviceBackend for CudaBackend {
    fn name(&self) -> &'static str {
        "cuda"
    }

    fn probe(&self, config: &DeviceConfig) -> Vec<DeviceCapabilities> {
        let mut devices = Vec::new();
        let device_count = self.nvml.device_count().unwrap_or(0);

        for i in 0..device_count {
            let Ok(device) = self.nvml.device_by_index(i) else {
                continue;
            };
            let Ok(memory) = device.memory_info() else {
                continue;
            };

            let memory_total_gb = memory.total as f64 / BYTES_PER_GB;
            if memory_total_gb < config.memory_limit_gb {
                tracing::warn!(
                    "Excluding GPU {i}: total memory {memory_total_gb:.1}GB below limit {:.1}GB",
                    config.memory_limit_gb
                );
                continue;
            }

            let memory_available_gb = memory.free as f64 / BYTES_PER_GB;
            let compute_capability = device
                .cuda_compute_capability()
                .ok()
                .map(|cc| (cc.major as u32, cc.minor as u32));
            let display_name = device.name().unwrap_or_else(|_| format!("CUDA device {i}"));

            // Volta for fp16, Pascal (6.1) for int8.
            let supports_fp16 = compute_capability.is_some_and(|cc| cc >= (7, 0));
            let supports_int8 = compute_capability.is_some_and(|cc| cc >= (6, 1));

            devices.push(DeviceCapabilities {
                device_id: format_compact!("cuda:{i}"),
                device_type: DeviceType::Gpu,
                display_name,
                memory_total_gb,
                memory_available_gb,
                compute_capability,
                supports_fp16,
                supports_int8,
                max_batch_size: ((memory_available_gb / 2.0) as usize).clamp(1, 8),
                estimated_performance: Self::estimate_performance(
                    memory_total_gb,
                    compute_capability.unwrap_or((0, 0)),
                ),
            });
        }

        devices
    }

    fn refresh(&self, device: &mut DeviceCapabilities) {
        let Some(index) = Self::device_index(device) else {
            return;
        };
        if let Ok(handle) = self.nvml.device_by_index(index) {
            if let Ok(memory) = handle.memory_info() {
                device.memory_available_gb = memory.free as f64 / BYTES_PER_GB;
            }
        }
    }

    fn sample(&self, device: &DeviceCapabilities) -> Option<UtilizationReading> {
        let index = Self::device_index(device)?;
        let handle = self.nvml.device_by_index(index).ok()?;

        let utilization = handle.utilization_rates().ok()?;
        let memory = handle.memory_info().ok()?;
        let temperature = handle
            .temperature(TemperatureSensor::Gpu)
            .ok()
            .map(f64::from);

        Some(UtilizationReading {
            utilization_pct: f64::from(utilization.gpu),
            memory_used_gb: memory.used as f64 / BYTES_PER_GB,
            temperature_c: temperature,
        })
    }
}

/// Backend for when no GPU runtime is present: contributes no devices and no
/// samples, so the registry degrades to CPU-only without special cases.
pub struct NoOpBackend;

impl DeviceBackend for NoOpBackend {
    fn name(&self) -> &'static str {
        "noop"
    }

    fn probe(&self, _config: &DeviceConfig) -> Vec<DeviceCapabilities> {
        Vec::new()
    }

    fn refresh(&self, _device: &mut DeviceCapabilities) {}

    fn sample(&self, _device: &DeviceCapabilities) -> Option<UtilizationReading> {
        None
    }
}

/// Select the GPU backend once at startup.
pub fn detect_gpu_backend() -> Box<dyn DeviceBackend> {
    match CudaBackend::probe_runtime() {
        Some(backend) => Box::new(backend),
        None => Box::new(NoOpBackend),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_probe_always_present() {
        let config = DeviceConfig::default();
        let backend = CpuBackend::new(&config);
        let devices = backend.probe(&config);
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].device_id, "cpu");
        assert_eq!(devices[0].device_type, DeviceType::Cpu);
        assert!(devices[0].supports_int8);
        assert!(!devices[0].supports_fp16);
    }

    #[test]
    fn test_noop_backend_contributes_nothing() {
        let config = DeviceConfig::default();
        let backend = NoOpBackend;
        assert!(backend.probe(&config).is_empty());
    }

    #[test]
    fn test_performance_estimate_scales_with_architecture() {
        let pascal = CudaBackend::estimate_performance(8.0, (6, 1));
        let turing = CudaBackend::estimate_performance(8.0, (7, 5));
        assert!(turing > pascal);
        assert!(CudaBackend::estimate_performance(48.0, (9, 0)) <= 10.0);
        assert!(CudaBackend::estimate_performance(2.0, (3, 5)) >= 1.0);
    }
}
