use crate::config::Config;
use crate::device::allocation::AllocationTracker;
use crate::device::capabilities::{DeviceCapabilities, WorkloadProfile};
use crate::device::monitor::{PerformanceMonitor, PerformanceSample};
use crate::device::registry::DeviceRegistry;
use crate::device::scorer::{self, Recommendations};
use crate::error::{PipelineFailure, StageError};
use crate::media::{FfmpegConcatenator, FfmpegExtractor, FfmpegProbe, SrtParser};
use crate::pipeline::collaborators::{
    Concatenator, PostProcessor, SegmentExtractor, SubtitleParser, VideoProbe,
};
use crate::pipeline::job::{PipelineJob, PipelineResult};
use crate::pipeline::progress::{CancellationToken, ProgressReporter};
use crate::pipeline::runner::VideoProcessingPipeline;
use compact_str::CompactString;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

/// Combined view over the registry, tracker, and monitor.
#[derive(Debug, Serialize)]
pub struct DeviceStatus {
    pub devices: Vec<DeviceCapabilities>,
    pub allocations: HashMap<CompactString, f64>,
    pub recent_samples: HashMap<CompactString, Vec<PerformanceSample>>,
}

/// Explicitly constructed entry point owning the device registry, allocation
/// tracker, performance monitor, and the pipeline. One scheduler serves any
/// number of concurrent jobs; callers hold it behind an `Arc` and pass it by
/// reference instead of reaching for process-wide globals.
pub struct Scheduler {
    config: Config,
    registry: Arc<tokio::sync::RwLock<DeviceRegistry>>,
    tracker: Arc<AllocationTracker>,
    monitor: Arc<PerformanceMonitor>,
    pipeline: VideoProcessingPipeline,
}

impl Scheduler {
    pub fn builder() -> SchedulerBuilder {
        SchedulerBuilder::default()
    }

    /// Start the background performance monitor. Idempotent.
    pub fn start_monitor(&self) {
        self.monitor.start();
    }

    /// Stop the monitor loop, bounded join. Idempotent.
    pub async fn stop_monitor(&self) {
        self.monitor.stop().await;
    }

    /// Re-read available memory for every device.
    pub async fn refresh_devices(&self) {
        let cpu_allocated = self.tracker.allocated_gb("cpu");
        self.registry.write().await.refresh(cpu_allocated);
    }

    /// Run one job to completion with no progress consumer or cancellation.
    pub async fn run_job(&self, job: PipelineJob) -> Result<PipelineResult, PipelineFailure> {
        self.run_job_with(job, ProgressReporter::sink(), CancellationToken::new())
            .await
    }

    /// Run one job with caller-supplied progress reporting and cancellation.
    pub async fn run_job_with(
        &self,
        job: PipelineJob,
        reporter: ProgressReporter,
        cancel: CancellationToken,
    ) -> Result<PipelineResult, PipelineFailure> {
        self.refresh_devices().await;
        self.pipeline.run(job, reporter, cancel).await
    }

    pub async fn device_status(&self) -> DeviceStatus {
        DeviceStatus {
            devices: self.registry.read().await.snapshot(),
            allocations: self.tracker.totals(),
            recent_samples: self.monitor.snapshot_all(),
        }
    }

    /// Device and tuning advice for a workload against the current registry.
    pub async fn recommendations(
        &self,
        workload: &WorkloadProfile,
    ) -> Result<Recommendations, StageError> {
        let devices = self.registry.read().await.snapshot();
        scorer::recommend(&devices, workload)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

#[derive(Default)]
pub struct SchedulerBuilder {
    config: Option<Config>,
    devices: Option<Vec<DeviceCapabilities>>,
    probe: Option<Arc<dyn VideoProbe>>,
    parser: Option<Arc<dyn SubtitleParser>>,
    extractor: Option<Arc<dyn SegmentExtractor>>,
    concatenator: Option<Arc<dyn Concatenator>>,
    post_processor: Option<Arc<dyn PostProcessor>>,
}

impl SchedulerBuilder {
    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Fixed device topology instead of hardware probing. Used by embedders
    /// and tests that simulate devices.
    pub fn with_devices(mut self, devices: Vec<DeviceCapabilities>) -> Self {
        self.devices = Some(devices);
        self
    }

    pub fn with_probe(mut self, probe: Arc<dyn VideoProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn with_parser(mut self, parser: Arc<dyn SubtitleParser>) -> Self {
        self.parser = Some(parser);
        self
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn SegmentExtractor>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    pub fn with_concatenator(mut self, concatenator: Arc<dyn Concatenator>) -> Self {
        self.concatenator = Some(concatenator);
        self
    }

    pub fn with_post_processor(mut self, post_processor: Arc<dyn PostProcessor>) -> Self {
        self.post_processor = Some(post_processor);
        self
    }

    /// Assemble the scheduler, probing hardware unless a fixed device set was
    /// supplied, and defaulting any missing collaborator to its ffmpeg/SRT
    /// implementation.
    pub fn build(self) -> anyhow::Result<Scheduler> {
        let config = self.config.unwrap_or_default();

        let registry = match self.devices {
            Some(devices) => DeviceRegistry::with_devices(devices),
            None => DeviceRegistry::new(&config.device),
        };
        let registry = Arc::new(tokio::sync::RwLock::new(registry));
        let tracker = Arc::new(AllocationTracker::new());
        let monitor = Arc::new(PerformanceMonitor::new(
            Arc::clone(&registry),
            &config.monitor,
        ));

        let extractor = match self.extractor {
            Some(extractor) => extractor,
            None => Arc::new(FfmpegExtractor::new()?),
        };

        let pipeline = VideoProcessingPipeline::new(
            Arc::clone(&registry),
            Arc::clone(&tracker),
            Some(Arc::clone(&monitor)),
            self.probe.unwrap_or_else(|| Arc::new(FfmpegProbe)),
            self.parser.unwrap_or_else(|| Arc::new(SrtParser)),
            extractor,
            self.concatenator
                .unwrap_or_else(|| Arc::new(FfmpegConcatenator)),
            self.post_processor,
        );

        Ok(Scheduler {
            config,
            registry,
            tracker,
            monitor,
            pipeline,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::capabilities::{Precision, TaskType};
    use crate::device::registry::test_support::{cpu, gpu};

    #[tokio::test]
    async fn test_status_reflects_injected_devices() {
        let scheduler = Scheduler::builder()
            .with_devices(vec![cpu(16.0), gpu(0, 8.0, 5.0, true)])
            .build()
            .unwrap();

        let status = scheduler.device_status().await;
        assert_eq!(status.devices.len(), 2);
        assert!(status.allocations.is_empty());
        assert!(status.recent_samples.is_empty());
    }

    #[tokio::test]
    async fn test_recommendations_prefer_gpu() {
        let scheduler = Scheduler::builder()
            .with_devices(vec![cpu(16.0), gpu(0, 8.0, 5.0, true)])
            .build()
            .unwrap();

        let workload = WorkloadProfile::builder(TaskType::FrameProcess)
            .precision(Precision::Fp16)
            .memory_requirement_gb(2.0)
            .build();
        let rec = scheduler.recommendations(&workload).await.unwrap();
        assert_eq!(rec.optimal_device, "cuda:0");
        assert_eq!(rec.suggested_precision, Precision::Fp16);
    }

    #[tokio::test]
    async fn test_monitor_lifecycle_through_scheduler() {
        let scheduler = Scheduler::builder()
            .with_devices(vec![cpu(16.0)])
            .build()
            .unwrap();

        scheduler.start_monitor();
        scheduler.start_monitor();
        scheduler.stop_monitor().await;
        scheduler.stop_monitor().await;
    }
}
