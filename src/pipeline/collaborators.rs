use crate::pipeline::job::{Segment, VideoInfo};
use std::path::{Path, PathBuf};

/// Media inspection for the input video.
pub trait VideoProbe: Send + Sync {
    fn analyze(&self, video: &Path) -> anyhow::Result<VideoInfo>;
}

/// Subtitle-file parsing. Segments come back ordered; index equals the
/// position in the file.
pub trait SubtitleParser: Send + Sync {
    fn parse(&self, path: &Path) -> anyhow::Result<Vec<Segment>>;
}

/// Cuts one time range out of the video into a temp file. Invoked from the
/// pipeline's bounded worker pool; implementations block on the media tool.
pub trait SegmentExtractor: Send + Sync {
    fn extract(&self, video: &Path, start: f64, end: f64) -> anyhow::Result<PathBuf>;
}

/// Joins extracted parts, already in the correct order, into the output file.
pub trait Concatenator: Send + Sync {
    fn join(&self, parts: &[PathBuf], output: &Path) -> anyhow::Result<()>;
}

/// Optional finishing step over the final output. Best-effort: failures are
/// logged by the pipeline, never fatal.
pub trait PostProcessor: Send + Sync {
    fn finish(&self, output: &Path) -> anyhow::Result<()>;
}

pub struct NoOpPostProcessor;

impl PostProcessor for NoOpPostProcessor {
    fn finish(&self, _output: &Path) -> anyhow::Result<()> {
        Ok(())
    }
}
