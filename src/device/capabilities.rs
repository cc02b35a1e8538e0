use compact_str::CompactString;
use serde::{Deserialize, Serialize};
use strum::Display;

#[derive(Debug, Deserialize, Serialize, PartialEq, Eq, Clone, Copy, Display)]
pub enum DeviceType {
    #[strum(to_string = "cpu")]
    Cpu,
    #[strum(to_string = "gpu")]
    Gpu,
}

#[derive(Debug, Deserialize, Serialize, PartialEq, Eq, Clone, Copy, Display)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    #[strum(to_string = "video_decode")]
    VideoDecode,
    #[strum(to_string = "video_encode")]
    VideoEncode,
    #[strum(to_string = "frame_process")]
    FrameProcess,
    #[strum(to_string = "subtitle_align")]
    SubtitleAlign,
}

#[derive(Debug, Deserialize, Serialize, PartialEq, Eq, Clone, Copy, Display)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    #[strum(to_string = "fp32")]
    Fp32,
    #[strum(to_string = "fp16")]
    Fp16,
    #[strum(to_string = "int8")]
    Int8,
}

#[derive(Debug, Deserialize, Serialize, PartialEq, Eq, Clone, Copy, Display)]
#[serde(rename_all = "lowercase")]
pub enum ComputeIntensity {
    #[strum(to_string = "low")]
    Low,
    #[strum(to_string = "medium")]
    Medium,
    #[strum(to_string = "high")]
    High,
}

/// Static and dynamic capabilities of one compute device.
///
/// Owned exclusively by the `DeviceRegistry`; everything else works on
/// snapshots. `memory_available_gb` is the only field mutated after `scan`,
/// and only by the registry's refresh cycle.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DeviceCapabilities {
    /// `"cpu"` or `"cuda:<index>"`.
    pub device_id: CompactString,
    pub device_type: DeviceType,
    pub display_name: String,
    pub memory_total_gb: f64,
    pub memory_available_gb: f64,
    /// CUDA compute capability (major, minor), GPU only.
    pub compute_capability: Option<(u32, u32)>,
    pub supports_fp16: bool,
    pub supports_int8: bool,
    pub max_batch_size: usize,
    /// Relative throughput score, >= 0. CPU baseline is 1.0.
    pub estimated_performance: f64,
}

impl DeviceCapabilities {
    pub fn is_gpu(&self) -> bool {
        self.device_type == DeviceType::Gpu
    }
}

/// Immutable description of one unit of work's resource and precision needs.
/// Created per job request, never mutated.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct WorkloadProfile {
    pub task_type: TaskType,
    pub resolution: (u32, u32),
    pub batch_size: usize,
    pub precision: Precision,
    pub memory_requirement_gb: f64,
    pub compute_intensity: ComputeIntensity,
}

#[derive(Debug)]
pub struct WorkloadProfileBuilder {
    task_type: TaskType,
    resolution: (u32, u32),
    batch_size: usize,
    precision: Precision,
    memory_requirement_gb: f64,
    compute_intensity: ComputeIntensity,
}

impl WorkloadProfileBuilder {
    pub fn new(task_type: TaskType) -> Self {
        Self {
            task_type,
            resolution: (1920, 1080),
            batch_size: 1,
            precision: Precision::Fp32,
            memory_requirement_gb: 1.0,
            compute_intensity: ComputeIntensity::Medium,
        }
    }

    pub fn resolution(mut self, width: u32, height: u32) -> Self {
        self.resolution = (width, height);
        self
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn precision(mut self, precision: Precision) -> Self {
        self.precision = precision;
        self
    }

    pub fn memory_requirement_gb(mut self, gb: f64) -> Self {
        self.memory_requirement_gb = gb;
        self
    }

    pub fn compute_intensity(mut self, intensity: ComputeIntensity) -> Self {
        self.compute_intensity = intensity;
        self
    }

    pub fn build(self) -> WorkloadProfile {
        WorkloadProfile {
            task_type: self.task_type,
            resolution: self.resolution,
            batch_size: self.batch_size,
            precision: self.precision,
            memory_requirement_gb: self.memory_requirement_gb,
            compute_intensity: self.compute_intensity,
        }
    }
}

impl WorkloadProfile {
    pub fn builder(task_type: TaskType) -> WorkloadProfileBuilder {
        WorkloadProfileBuilder::new(task_type)
    }
}
