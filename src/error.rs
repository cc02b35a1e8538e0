use thiserror::Error;

/// Error taxonomy for device selection and pipeline stages.
///
/// `SegmentExtraction` is only fatal once the skipped fraction crosses the
/// pipeline's threshold; below that, failed segments are retried once and then
/// skipped. `Concatenation` is always fatal since a partially joined output is
/// not a valid product.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("insufficient memory on {device}: {needed_gb:.2}GB requested")]
    InsufficientMemory { device: String, needed_gb: f64 },

    #[error("video probe failed: {0}")]
    VideoProbe(String),

    #[error("subtitle parse failed: {0}")]
    SubtitleParse(String),

    #[error("segment extraction failed: {skipped} of {total} segments skipped")]
    SegmentExtraction { skipped: usize, total: usize },

    #[error("concatenation failed: {0}")]
    Concatenation(String),

    #[error("invalid processing config: {0}")]
    Config(String),

    #[error("job cancelled")]
    Cancelled,
}

impl StageError {
    /// Stable short name for logs and status payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            StageError::DeviceUnavailable(_) => "device_unavailable",
            StageError::InsufficientMemory { .. } => "insufficient_memory",
            StageError::VideoProbe(_) => "video_probe_error",
            StageError::SubtitleParse(_) => "subtitle_parse_error",
            StageError::SegmentExtraction { .. } => "segment_extraction_error",
            StageError::Concatenation(_) => "concatenation_error",
            StageError::Config(_) => "config_error",
            StageError::Cancelled => "cancelled",
        }
    }
}

/// Terminal pipeline failure: the stage error plus the progress percentage the
/// job had reached, so callers can tell "failed early" from "failed during
/// concatenation".
#[derive(Debug, Error)]
#[error("{error} (at {progress_pct}% progress)")]
pub struct PipelineFailure {
    #[source]
    pub error: StageError,
    pub progress_pct: u8,
}

impl PipelineFailure {
    pub fn new(error: StageError, progress_pct: u8) -> Self {
        Self {
            error,
            progress_pct,
        }
    }
}
