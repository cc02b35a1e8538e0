use crate::device::capabilities::{
    DeviceCapabilities, DeviceType, Precision, TaskType, WorkloadProfile,
};
use crate::error::StageError;
use compact_str::CompactString;
use serde::Serialize;

/// Score returned for a device that cannot hold the workload in memory.
pub const DISQUALIFIED: f64 = -1.0;

/// Score one device for one workload. Pure function over a registry snapshot.
///
/// A GPU whose available memory cannot hold the workload is disqualified
/// outright. The CPU is never disqualified here: its memory headroom is
/// system RAM, enforced later by the allocation tracker at reserve time.
pub fn score(device: &DeviceCapabilities, workload: &WorkloadProfile) -> f64 {
    let memory_over = workload.memory_requirement_gb > device.memory_available_gb;
    if memory_over && device.is_gpu() {
        return DISQUALIFIED;
    }

    let mut score = device.estimated_performance * 10.0;

    // Task affinity: GPUs accelerate everything, but by different margins;
    // the CPU stays usable for all of it.
    score += match (workload.task_type, device.device_type) {
        (TaskType::FrameProcess, DeviceType::Gpu) => 30.0,
        (TaskType::FrameProcess, DeviceType::Cpu) => 3.0,
        (TaskType::VideoDecode | TaskType::VideoEncode, DeviceType::Gpu) => 20.0,
        (TaskType::VideoDecode | TaskType::VideoEncode, DeviceType::Cpu) => 5.0,
        (TaskType::SubtitleAlign, DeviceType::Gpu) => 15.0,
        (TaskType::SubtitleAlign, DeviceType::Cpu) => 8.0,
    };

    match workload.precision {
        Precision::Fp16 if device.supports_fp16 => score += 10.0,
        Precision::Int8 if device.supports_int8 => score += 5.0,
        _ => {}
    }

    if device.max_batch_size < workload.batch_size {
        score -= 10.0;
    }

    let memory_ratio = if device.memory_available_gb > 0.0 {
        workload.memory_requirement_gb / device.memory_available_gb
    } else {
        f64::INFINITY
    };
    if memory_ratio < 0.5 {
        score += 5.0;
    } else if memory_ratio > 0.8 {
        score -= 10.0;
    }

    score
}

/// Pick the best device for a workload from a registry snapshot.
///
/// Deterministic: ties break on snapshot order, so the first-discovered
/// device wins. If every device is disqualified the CPU is returned
/// unconditionally; whether system RAM actually holds the workload is decided
/// by the allocation tracker when the pipeline reserves the device.
pub fn select<'a>(
    devices: &'a [DeviceCapabilities],
    workload: &WorkloadProfile,
) -> Result<&'a DeviceCapabilities, StageError> {
    let mut best: Option<(&DeviceCapabilities, f64)> = None;

    for device in devices {
        let device_score = score(device, workload);
        tracing::debug!(
            "Scored {} for {}: {device_score:.2}",
            device.device_id,
            workload.task_type
        );
        match best {
            Some((_, best_score)) if device_score <= best_score => {}
            _ => best = Some((device, device_score)),
        }
    }

    match best {
        Some((device, best_score)) if best_score >= 0.0 => {
            tracing::info!(
                "Selected {} for {} (score {best_score:.2})",
                device.device_id,
                workload.task_type
            );
            Ok(device)
        }
        _ => {
            // Everything disqualified: the CPU is the unconditional fallback.
            let cpu = devices
                .iter()
                .find(|d| d.device_type == DeviceType::Cpu)
                .ok_or_else(|| StageError::DeviceUnavailable("no CPU device registered".into()))?;
            tracing::warn!(
                "All devices disqualified for {}, falling back to CPU",
                workload.task_type
            );
            Ok(cpu)
        }
    }
}

/// Tuning advice derived from device selection.
#[derive(Debug, Clone, Serialize)]
pub struct Recommendations {
    pub optimal_device: CompactString,
    pub suggested_batch_size: usize,
    pub suggested_precision: Precision,
    pub notes: Vec<String>,
}

/// Pure advisory layer on top of `select`.
pub fn recommend(
    devices: &[DeviceCapabilities],
    workload: &WorkloadProfile,
) -> Result<Recommendations, StageError> {
    let device = select(devices, workload)?;

    let suggested_precision = if device.supports_fp16
        && matches!(
            workload.task_type,
            TaskType::FrameProcess | TaskType::SubtitleAlign
        ) {
        Precision::Fp16
    } else if device.supports_int8 {
        Precision::Int8
    } else {
        Precision::Fp32
    };

    let mut notes = Vec::new();
    if device.memory_available_gb < 2.0 {
        notes.push("Low available memory: prefer a smaller batch size".to_string());
    }
    if device.is_gpu() {
        notes.push(format!(
            "GPU acceleration active on {}",
            device.display_name
        ));
        if device.supports_fp16 {
            notes.push("FP16 improves throughput and halves memory use".to_string());
        }
    } else {
        notes.push("Running on CPU: extraction parallelism is the main lever".to_string());
    }

    Ok(Recommendations {
        optimal_device: device.device_id.clone(),
        suggested_batch_size: workload.batch_size.min(device.max_batch_size),
        suggested_precision,
        notes,
    })
}
