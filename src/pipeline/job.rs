use crate::config::ProcessingConfig;
use crate::device::monitor::PerformanceSample;
use compact_str::CompactString;
use serde::Serialize;
use std::path::PathBuf;
use strum::Display;
use uuid::Uuid;

/// Stage the pipeline is currently in. `Failed` and `Cancelled` are terminal
/// and reachable from any non-terminal state; everything else advances along
/// one linear chain.
#[derive(Debug, Serialize, PartialEq, Eq, Clone, Copy, Display)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    #[strum(to_string = "idle")]
    Idle,
    #[strum(to_string = "probing")]
    Probing,
    #[strum(to_string = "aligning_subtitles")]
    AligningSubtitles,
    #[strum(to_string = "extracting_segments")]
    ExtractingSegments,
    #[strum(to_string = "concatenating")]
    Concatenating,
    #[strum(to_string = "post_processing")]
    PostProcessing,
    #[strum(to_string = "completed")]
    Completed,
    #[strum(to_string = "failed")]
    Failed,
    #[strum(to_string = "cancelled")]
    Cancelled,
}

impl PipelineState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PipelineState::Completed | PipelineState::Failed | PipelineState::Cancelled
        )
    }

    pub fn can_transition_to(&self, next: PipelineState) -> bool {
        use PipelineState::*;
        if !self.is_terminal() && matches!(next, Failed | Cancelled) {
            return true;
        }
        matches!(
            (self, next),
            (Idle, Probing)
                | (Probing, AligningSubtitles)
                | (AligningSubtitles, ExtractingSegments)
                | (ExtractingSegments, Concatenating)
                | (Concatenating, PostProcessing)
                | (PostProcessing, Completed)
        )
    }
}

#[derive(Debug, Serialize, PartialEq, Eq, Clone, Copy, Display)]
#[serde(rename_all = "snake_case")]
pub enum SegmentStatus {
    #[strum(to_string = "pending")]
    Pending,
    #[strum(to_string = "completed")]
    Completed,
    #[strum(to_string = "skipped")]
    Skipped,
}

/// One subtitle-derived clip. Index is the position in the subtitle file and
/// fixes the concatenation order regardless of extraction completion order.
#[derive(Debug, Clone, Serialize)]
pub struct Segment {
    pub index: usize,
    pub start_time: f64,
    pub end_time: f64,
    pub text: String,
    pub temp_file_path: Option<PathBuf>,
    pub status: SegmentStatus,
}

impl Segment {
    pub fn new(index: usize, start_time: f64, end_time: f64, text: impl Into<String>) -> Self {
        Self {
            index,
            start_time,
            end_time,
            text: text.into(),
            temp_file_path: None,
            status: SegmentStatus::Pending,
        }
    }

    pub fn duration(&self) -> f64 {
        (self.end_time - self.start_time).max(0.0)
    }
}

/// Probe result for the input video.
#[derive(Debug, Clone, Serialize)]
pub struct VideoInfo {
    pub duration: f64,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub codec: String,
}

/// One processing request: input video, subtitle file, output target, and the
/// per-job processing options.
#[derive(Debug, Clone)]
pub struct PipelineJob {
    pub id: Uuid,
    pub video_path: PathBuf,
    pub subtitle_path: PathBuf,
    pub output_path: PathBuf,
    pub config: ProcessingConfig,
}

impl PipelineJob {
    pub fn builder() -> PipelineJobBuilder {
        PipelineJobBuilder::default()
    }
}

#[derive(Debug, Default)]
pub struct PipelineJobBuilder {
    video_path: Option<PathBuf>,
    subtitle_path: Option<PathBuf>,
    output_path: Option<PathBuf>,
    config: Option<ProcessingConfig>,
}

impl PipelineJobBuilder {
    pub fn video(mut self, path: impl Into<PathBuf>) -> Self {
        self.video_path = Some(path.into());
        self
    }

    pub fn subtitles(mut self, path: impl Into<PathBuf>) -> Self {
        self.subtitle_path = Some(path.into());
        self
    }

    pub fn output(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_path = Some(path.into());
        self
    }

    pub fn config(mut self, config: ProcessingConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn build(self) -> anyhow::Result<PipelineJob> {
        Ok(PipelineJob {
            id: Uuid::new_v4(),
            video_path: self
                .video_path
                .ok_or_else(|| anyhow::anyhow!("video path is required"))?,
            subtitle_path: self
                .subtitle_path
                .ok_or_else(|| anyhow::anyhow!("subtitle path is required"))?,
            output_path: self
                .output_path
                .ok_or_else(|| anyhow::anyhow!("output path is required"))?,
            config: self.config.unwrap_or_default(),
        })
    }
}

/// Outcome of a completed run.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineResult {
    pub output_path: PathBuf,
    pub processing_time_ms: u64,
    pub segments_processed: usize,
    pub segments_skipped: usize,
    pub device_used: CompactString,
    pub gpu_accelerated: bool,
    pub video: VideoInfo,
    /// Monitor samples for the selected device, captured at completion.
    /// Empty when the monitor is not running.
    pub performance: Vec<PerformanceSample>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_stage_transitions() {
        use PipelineState::*;
        let chain = [
            Idle,
            Probing,
            AligningSubtitles,
            ExtractingSegments,
            Concatenating,
            PostProcessing,
            Completed,
        ];
        for pair in chain.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
        // No skipping ahead, no going back.
        assert!(!Idle.can_transition_to(ExtractingSegments));
        assert!(!Concatenating.can_transition_to(Probing));
    }

    #[test]
    fn test_terminal_states_reachable_from_any_active_state() {
        use PipelineState::*;
        for state in [Idle, Probing, AligningSubtitles, ExtractingSegments, Concatenating, PostProcessing] {
            assert!(state.can_transition_to(Failed));
            assert!(state.can_transition_to(Cancelled));
        }
        for state in [Completed, Failed, Cancelled] {
            assert!(state.is_terminal());
            assert!(!state.can_transition_to(Failed));
            assert!(!state.can_transition_to(Probing));
        }
    }

    #[test]
    fn test_segment_duration_never_negative() {
        assert_eq!(Segment::new(0, 5.0, 8.5, "a").duration(), 3.5);
        assert_eq!(Segment::new(1, 8.0, 6.0, "b").duration(), 0.0);
    }

    #[test]
    fn test_job_builder_requires_paths() {
        assert!(PipelineJob::builder().build().is_err());
        let job = PipelineJob::builder()
            .video("in.mp4")
            .subtitles("in.srt")
            .output("out.mp4")
            .build()
            .unwrap();
        assert_eq!(job.config.batch_size, 4);
    }
}
