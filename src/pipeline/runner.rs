use crate::config::ProcessingConfig;
use crate::device::allocation::AllocationTracker;
use crate::device::capabilities::{
    ComputeIntensity, DeviceCapabilities, DeviceType, TaskType, WorkloadProfile,
};
use crate::device::monitor::PerformanceMonitor;
use crate::device::registry::DeviceRegistry;
use crate::device::scorer;
use crate::error::{PipelineFailure, StageError};
use crate::pipeline::collaborators::{
    Concatenator, NoOpPostProcessor, PostProcessor, SegmentExtractor, SubtitleParser, VideoProbe,
};
use crate::pipeline::job::{
    PipelineJob, PipelineResult, PipelineState, Segment, SegmentStatus, VideoInfo,
};
use crate::pipeline::progress::{CancellationToken, ProgressReporter};
use compact_str::{format_compact, CompactString};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinSet;
use uuid::Uuid;

/// Minimum gap enforced between consecutive segments during alignment.
const MIN_SEGMENT_GAP_SECS: f64 = 0.1;

/// Drives one job through the stage chain, reporting progress at fixed
/// milestones and releasing the device reservation exactly once on every exit
/// path. Collaborators do the actual media work; the pipeline owns ordering,
/// admission control, retries, and cleanup.
pub struct VideoProcessingPipeline {
    registry: Arc<tokio::sync::RwLock<DeviceRegistry>>,
    tracker: Arc<AllocationTracker>,
    monitor: Option<Arc<PerformanceMonitor>>,
    probe: Arc<dyn VideoProbe>,
    parser: Arc<dyn SubtitleParser>,
    extractor: Arc<dyn SegmentExtractor>,
    concatenator: Arc<dyn Concatenator>,
    post_processor: Arc<dyn PostProcessor>,
}

/// Releases the reservation when the run scope ends. `release` is idempotent,
/// so double-drop on a panic path stays harmless.
struct ReleaseGuard {
    tracker: Arc<AllocationTracker>,
    device_id: CompactString,
    workload_id: String,
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        self.tracker.release(&self.device_id, &self.workload_id);
    }
}

/// Tracks the current state and last reported milestone for one run.
struct RunProgress {
    reporter: ProgressReporter,
    job_id: Uuid,
    state: PipelineState,
    pct: u8,
}

impl RunProgress {
    fn new(reporter: ProgressReporter, job_id: Uuid) -> Self {
        Self {
            reporter,
            job_id,
            state: PipelineState::Idle,
            pct: 0,
        }
    }

    fn advance(&mut self, next: PipelineState, pct: u8, message: &str) {
        debug_assert!(self.state.can_transition_to(next), "{} -> {next}", self.state);
        tracing::info!("[{}] {} -> {next}: {message}", self.job_id, self.state);
        self.state = next;
        self.bump(pct, message);
    }

    /// Progress within the current stage.
    fn bump(&mut self, pct: u8, message: &str) {
        self.pct = pct;
        self.reporter.report(self.job_id, pct, message);
    }
}

impl VideoProcessingPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<tokio::sync::RwLock<DeviceRegistry>>,
        tracker: Arc<AllocationTracker>,
        monitor: Option<Arc<PerformanceMonitor>>,
        probe: Arc<dyn VideoProbe>,
        parser: Arc<dyn SubtitleParser>,
        extractor: Arc<dyn SegmentExtractor>,
        concatenator: Arc<dyn Concatenator>,
        post_processor: Option<Arc<dyn PostProcessor>>,
    ) -> Self {
        Self {
            registry,
            tracker,
            monitor,
            probe,
            parser,
            extractor,
            concatenator,
            post_processor: post_processor.unwrap_or_else(|| Arc::new(NoOpPostProcessor)),
        }
    }

    /// Run one job to a terminal state. Temp segment files are removed and the
    /// device allocation released on every exit path, including cancellation.
    pub async fn run(
        &self,
        job: PipelineJob,
        reporter: ProgressReporter,
        cancel: CancellationToken,
    ) -> Result<PipelineResult, PipelineFailure> {
        let started = Instant::now();
        let mut progress = RunProgress::new(reporter, job.id);
        let mut segments: Vec<Segment> = Vec::new();

        let outcome = self
            .execute(&job, started, &mut progress, &cancel, &mut segments)
            .await;

        cleanup_temp_files(&mut segments);

        match outcome {
            Ok(result) => Ok(result),
            Err(error) => {
                let terminal = if matches!(error, StageError::Cancelled) {
                    PipelineState::Cancelled
                } else {
                    PipelineState::Failed
                };
                let pct = progress.pct;
                progress.advance(terminal, pct, &format!("{error}"));
                tracing::error!("[{}] job {terminal}: {error}", job.id);
                Err(PipelineFailure::new(error, pct))
            }
        }
    }

    async fn execute(
        &self,
        job: &PipelineJob,
        started: Instant,
        progress: &mut RunProgress,
        cancel: &CancellationToken,
        segments: &mut Vec<Segment>,
    ) -> Result<PipelineResult, StageError> {
        job.config.validate()?;
        check_cancelled(cancel)?;

        let (device, _guard) = self.acquire_device(job).await?;
        let job_id = job.id;

        // Probing: video metadata, then subtitle segments.
        progress.advance(PipelineState::Probing, 10, "Probing video");
        let info = self.probe_video(job).await?;
        check_cancelled(cancel)?;

        *segments = self.parse_subtitles(job).await?;
        if segments.is_empty() {
            return Err(StageError::SubtitleParse(format!(
                "no segments in {}",
                job.subtitle_path.display()
            )));
        }
        progress.bump(20, &format!("Parsed {} segments", segments.len()));
        check_cancelled(cancel)?;

        progress.advance(PipelineState::AligningSubtitles, 30, "Aligning subtitles");
        align_segments(segments, info.duration);
        check_cancelled(cancel)?;

        progress.advance(
            PipelineState::ExtractingSegments,
            50,
            &format!("Extracting {} segments on {}", segments.len(), device.device_id),
        );
        self.extract_segments(job, segments, progress, cancel)
            .await?;

        let completed: Vec<PathBuf> = segments
            .iter()
            .filter(|s| s.status == SegmentStatus::Completed)
            .filter_map(|s| s.temp_file_path.clone())
            .collect();
        let skipped = segments
            .iter()
            .filter(|s| s.status == SegmentStatus::Skipped)
            .count();
        check_cancelled(cancel)?;

        progress.advance(PipelineState::Concatenating, 80, "Concatenating segments");
        self.concatenate(&completed, job).await?;
        progress.bump(95, "Concatenation complete");

        progress.advance(PipelineState::PostProcessing, 95, "Post-processing");
        self.post_process(job).await;

        progress.advance(PipelineState::Completed, 100, "Completed");
        tracing::info!(
            "[{job_id}] completed in {}ms ({} processed, {skipped} skipped)",
            started.elapsed().as_millis(),
            completed.len()
        );

        Ok(PipelineResult {
            output_path: job.output_path.clone(),
            processing_time_ms: started.elapsed().as_millis() as u64,
            segments_processed: completed.len(),
            segments_skipped: skipped,
            device_used: device.device_id.clone(),
            gpu_accelerated: device.is_gpu(),
            video: info,
            performance: self
                .monitor
                .as_ref()
                .map(|m| m.snapshot(&device.device_id))
                .unwrap_or_default(),
        })
    }

    /// Select a device for the job's workload and reserve memory on it,
    /// falling back to CPU when the config allows it.
    async fn acquire_device(
        &self,
        job: &PipelineJob,
    ) -> Result<(DeviceCapabilities, ReleaseGuard), StageError> {
        let registry = self.registry.read().await;
        let devices = registry.snapshot();
        let config = &job.config;

        if config.use_gpu && !config.fallback_to_cpu && !registry.has_gpu() {
            return Err(StageError::Config(
                "use_gpu is set with fallback_to_cpu disabled, but no GPU is available".into(),
            ));
        }
        drop(registry);

        let workload = workload_for(config);
        let device = select_device(&devices, config, &workload)?.clone();
        let workload_id = job.id.to_string();

        let device = if self.tracker.reserve(&device, &workload, &workload_id) {
            device
        } else if device.is_gpu() {
            if !config.fallback_to_cpu {
                // With fallback disabled a refused GPU reservation means the
                // configuration asked for more than the device can hold.
                return Err(StageError::Config(format!(
                    "cannot reserve {:.2}GB on {} and fallback_to_cpu is disabled",
                    workload.memory_requirement_gb, device.device_id
                )));
            }
            tracing::warn!(
                "Reservation on {} failed, falling back to CPU",
                device.device_id
            );
            let cpu = devices
                .iter()
                .find(|d| d.device_type == DeviceType::Cpu)
                .ok_or_else(|| StageError::DeviceUnavailable("no CPU device registered".into()))?;
            if !self.tracker.reserve(cpu, &workload, &workload_id) {
                return Err(StageError::InsufficientMemory {
                    device: cpu.device_id.to_string(),
                    needed_gb: workload.memory_requirement_gb,
                });
            }
            cpu.clone()
        } else {
            // The CPU itself refused: system RAM is genuinely short.
            return Err(StageError::InsufficientMemory {
                device: device.device_id.to_string(),
                needed_gb: workload.memory_requirement_gb,
            });
        };

        let guard = ReleaseGuard {
            tracker: Arc::clone(&self.tracker),
            device_id: device.device_id.clone(),
            workload_id,
        };
        Ok((device, guard))
    }

    async fn probe_video(&self, job: &PipelineJob) -> Result<VideoInfo, StageError> {
        let probe = Arc::clone(&self.probe);
        let video = job.video_path.clone();
        tokio::task::spawn_blocking(move || probe.analyze(&video))
            .await
            .map_err(|e| StageError::VideoProbe(format!("probe task failed: {e}")))?
            .map_err(|e| StageError::VideoProbe(format!("{e:#}")))
    }

    async fn parse_subtitles(&self, job: &PipelineJob) -> Result<Vec<Segment>, StageError> {
        let parser = Arc::clone(&self.parser);
        let path = job.subtitle_path.clone();
        let mut segments = tokio::task::spawn_blocking(move || parser.parse(&path))
            .await
            .map_err(|e| StageError::SubtitleParse(format!("parse task failed: {e}")))?
            .map_err(|e| StageError::SubtitleParse(format!("{e:#}")))?;

        // Index is authoritative for ordering; renumber by file position.
        for (index, segment) in segments.iter_mut().enumerate() {
            segment.index = index;
        }
        Ok(segments)
    }

    /// Fan out extraction to a worker pool bounded at `batch_size`, retry each
    /// failed segment once, then mark it skipped. Fails the stage when more
    /// than 20% of segments end up skipped. Cancellation stops dispatch and
    /// waits for in-flight extractions before returning.
    async fn extract_segments(
        &self,
        job: &PipelineJob,
        segments: &mut [Segment],
        progress: &mut RunProgress,
        cancel: &CancellationToken,
    ) -> Result<(), StageError> {
        let total = segments.len();
        let concurrency = job.config.batch_size.max(1);
        let mut pool: JoinSet<(usize, Result<PathBuf, String>)> = JoinSet::new();
        let mut next = 0;
        let mut finished = 0;
        let mut cancelled = false;

        while next < total || !pool.is_empty() {
            cancelled = cancelled || cancel.is_cancelled();

            while !cancelled && next < total && pool.len() < concurrency {
                let extractor = Arc::clone(&self.extractor);
                let video = job.video_path.clone();
                let (index, start, end) = {
                    let s = &segments[next];
                    (s.index, s.start_time, s.end_time)
                };
                pool.spawn_blocking(move || {
                    let result = match extractor.extract(&video, start, end) {
                        Ok(path) => Ok(path),
                        Err(first) => {
                            tracing::warn!("Segment {index} extraction failed, retrying: {first:#}");
                            extractor
                                .extract(&video, start, end)
                                .map_err(|e| format!("{e:#}"))
                        }
                    };
                    (index, result)
                });
                next += 1;
                cancelled = cancel.is_cancelled();
            }

            // Cancelled with nothing in flight: stop without dispatching more.
            if cancelled && pool.is_empty() {
                break;
            }

            match pool.join_next().await {
                Some(Ok((index, Ok(path)))) => {
                    segments[index].temp_file_path = Some(path);
                    segments[index].status = SegmentStatus::Completed;
                }
                Some(Ok((index, Err(message)))) => {
                    tracing::warn!("Segment {index} skipped after retry: {message}");
                    segments[index].status = SegmentStatus::Skipped;
                }
                Some(Err(join_error)) => {
                    tracing::error!("Extraction worker failed: {join_error}");
                }
                None => continue,
            }
            finished += 1;

            // Sub-progress across the 50..80 band.
            let pct = 50 + (finished * 30 / total) as u8;
            progress.bump(pct, &format!("Extracted {finished}/{total} segments"));
        }

        if cancelled {
            return Err(StageError::Cancelled);
        }

        // A worker that died without reporting leaves its segment pending.
        for segment in segments.iter_mut() {
            if segment.status == SegmentStatus::Pending {
                segment.status = SegmentStatus::Skipped;
            }
        }

        let skipped = segments
            .iter()
            .filter(|s| s.status == SegmentStatus::Skipped)
            .count();
        // Fatal strictly above 20%: 1 of 5 passes, 2 of 5 fails.
        if skipped * 5 > total {
            return Err(StageError::SegmentExtraction { skipped, total });
        }
        if skipped > 0 {
            tracing::warn!("{skipped} of {total} segments skipped, continuing");
        }
        Ok(())
    }

    async fn concatenate(&self, parts: &[PathBuf], job: &PipelineJob) -> Result<(), StageError> {
        if parts.is_empty() {
            return Err(StageError::Concatenation(
                "no segments available to concatenate".into(),
            ));
        }
        let concatenator = Arc::clone(&self.concatenator);
        let parts = parts.to_vec();
        let output = job.output_path.clone();
        tokio::task::spawn_blocking(move || concatenator.join(&parts, &output))
            .await
            .map_err(|e| StageError::Concatenation(format!("concat task failed: {e}")))?
            .map_err(|e| StageError::Concatenation(format!("{e:#}")))
    }

    async fn post_process(&self, job: &PipelineJob) {
        let post = Arc::clone(&self.post_processor);
        let output = job.output_path.clone();
        let result = tokio::task::spawn_blocking(move || post.finish(&output)).await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!("Post-processing failed (ignored): {e:#}"),
            Err(e) => tracing::warn!("Post-processing task failed (ignored): {e}"),
        }
    }
}

/// Workload profile for one job, derived from its processing options.
fn workload_for(config: &ProcessingConfig) -> WorkloadProfile {
    WorkloadProfile::builder(TaskType::FrameProcess)
        .batch_size(config.batch_size)
        .precision(config.precision)
        .memory_requirement_gb(config.memory_limit_gb)
        .compute_intensity(ComputeIntensity::High)
        .build()
}

/// Honor the configured GPU preference when it is registered and qualified;
/// otherwise fall through to scoring. `use_gpu = false` pins the CPU.
fn select_device<'a>(
    devices: &'a [DeviceCapabilities],
    config: &ProcessingConfig,
    workload: &WorkloadProfile,
) -> Result<&'a DeviceCapabilities, StageError> {
    if !config.use_gpu {
        return devices
            .iter()
            .find(|d| d.device_type == DeviceType::Cpu)
            .ok_or_else(|| StageError::DeviceUnavailable("no CPU device registered".into()));
    }

    let preferred = format_compact!("cuda:{}", config.gpu_device_id);
    if let Some(device) = devices.iter().find(|d| d.device_id == preferred) {
        if scorer::score(device, workload) >= 0.0 {
            tracing::info!("Using configured GPU preference {preferred}");
            return Ok(device);
        }
        tracing::warn!("Configured GPU {preferred} is disqualified for this workload");
    }

    scorer::select(devices, workload)
}

/// Map subtitle timestamps onto the video timeline: clamp to `[0, duration]`,
/// stretch degenerate segments to one second, and split any overlap between
/// the two neighbors so the minimum gap sits centered on their midpoint.
/// Never fails; adjustments are logged.
fn align_segments(segments: &mut [Segment], duration: f64) {
    for segment in segments.iter_mut() {
        let original = (segment.start_time, segment.end_time);

        segment.start_time = segment.start_time.clamp(0.0, duration);
        segment.end_time = segment.end_time.clamp(0.0, duration);
        if segment.end_time <= segment.start_time {
            segment.end_time = (segment.start_time + 1.0).min(duration);
        }

        if (segment.start_time, segment.end_time) != original {
            tracing::warn!(
                "Adjusted segment {} timing {:.3}..{:.3} -> {:.3}..{:.3}",
                segment.index,
                original.0,
                original.1,
                segment.start_time,
                segment.end_time
            );
        }
    }

    for i in 1..segments.len() {
        let prev_end = segments[i - 1].end_time;
        let start = segments[i].start_time;
        if start >= prev_end + MIN_SEGMENT_GAP_SECS {
            continue;
        }

        // Each side gives up half the overlap.
        let mid = (start + prev_end) / 2.0;
        segments[i - 1].end_time =
            (mid - MIN_SEGMENT_GAP_SECS / 2.0).max(segments[i - 1].start_time);
        segments[i].start_time = (mid + MIN_SEGMENT_GAP_SECS / 2.0).min(duration);
        if segments[i].end_time <= segments[i].start_time {
            segments[i].end_time = (segments[i].start_time + 1.0).min(duration);
        }
        tracing::warn!(
            "Resolved overlap between segments {} and {}: boundary now {:.3}/{:.3}",
            segments[i - 1].index,
            segments[i].index,
            segments[i - 1].end_time,
            segments[i].start_time
        );
    }
}

fn check_cancelled(cancel: &CancellationToken) -> Result<(), StageError> {
    if cancel.is_cancelled() {
        Err(StageError::Cancelled)
    } else {
        Ok(())
    }
}

/// Remove every temp segment file that still exists. Missing files are fine;
/// anything else is logged and skipped.
fn cleanup_temp_files(segments: &mut [Segment]) {
    for segment in segments.iter_mut() {
        if let Some(path) = segment.temp_file_path.take() {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!("Failed to remove {}: {e}", path.display()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::registry::test_support::{cpu, gpu};

    fn seg(index: usize, start: f64, end: f64) -> Segment {
        Segment::new(index, start, end, format!("line {index}"))
    }

    #[test]
    fn test_align_clamps_out_of_range_timestamps() {
        let mut segments = vec![seg(0, -2.0, 3.0), seg(1, 58.0, 75.0)];
        align_segments(&mut segments, 60.0);
        assert_eq!(segments[0].start_time, 0.0);
        assert_eq!(segments[0].end_time, 3.0);
        assert_eq!(segments[1].end_time, 60.0);
    }

    #[test]
    fn test_align_splits_overlap_between_neighbors() {
        let mut segments = vec![seg(0, 0.0, 5.0), seg(1, 4.5, 9.0)];
        align_segments(&mut segments, 60.0);
        // Overlap midpoint 4.75; each side gives up half, gap centered on it.
        assert!((segments[0].end_time - 4.7).abs() < 1e-9);
        assert!((segments[1].start_time - 4.8).abs() < 1e-9);
        let gap = segments[1].start_time - segments[0].end_time;
        assert!((gap - MIN_SEGMENT_GAP_SECS).abs() < 1e-9);
        assert_eq!(segments[1].end_time, 9.0);
    }

    #[test]
    fn test_align_leaves_spaced_segments_untouched() {
        let mut segments = vec![seg(0, 0.0, 5.0), seg(1, 5.2, 9.0)];
        align_segments(&mut segments, 60.0);
        assert_eq!(segments[0].end_time, 5.0);
        assert_eq!(segments[1].start_time, 5.2);
    }

    #[test]
    fn test_align_stretches_degenerate_segments() {
        let mut segments = vec![seg(0, 10.0, 9.0)];
        align_segments(&mut segments, 60.0);
        assert_eq!(segments[0].start_time, 10.0);
        assert_eq!(segments[0].end_time, 11.0);

        // Near the end of the video the stretch caps at the duration.
        let mut tail = vec![seg(0, 59.8, 59.2)];
        align_segments(&mut tail, 60.0);
        assert_eq!(tail[0].end_time, 60.0);
    }

    #[test]
    fn test_device_preference_honored_when_qualified() {
        let devices = vec![cpu(16.0), gpu(0, 8.0, 5.0, true), gpu(1, 8.0, 9.0, true)];
        let mut config = ProcessingConfig::default();
        config.gpu_device_id = 1;
        let workload = workload_for(&config);

        // cuda:1 wins despite cuda:0 being first in the registry.
        let device = select_device(&devices, &config, &workload).unwrap();
        assert_eq!(device.device_id, "cuda:1");
    }

    #[test]
    fn test_disqualified_preference_falls_through_to_scoring() {
        let devices = vec![cpu(16.0), gpu(0, 4.0, 9.0, true), gpu(1, 8.0, 5.0, true)];
        let mut config = ProcessingConfig::default();
        config.memory_limit_gb = 6.0; // over cuda:0's 4GB
        let workload = workload_for(&config);

        let device = select_device(&devices, &config, &workload).unwrap();
        assert_eq!(device.device_id, "cuda:1");
    }

    #[test]
    fn test_use_gpu_false_pins_cpu() {
        let devices = vec![cpu(16.0), gpu(0, 8.0, 9.0, true)];
        let mut config = ProcessingConfig::default();
        config.use_gpu = false;
        let workload = workload_for(&config);

        let device = select_device(&devices, &config, &workload).unwrap();
        assert_eq!(device.device_id, "cpu");
    }
}
