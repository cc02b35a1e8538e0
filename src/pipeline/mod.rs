pub mod collaborators;
pub mod job;
pub mod progress;
pub mod runner;

pub use job::{PipelineJob, PipelineResult, PipelineState, Segment, SegmentStatus, VideoInfo};
pub use progress::{CancellationToken, ProgressReporter, ProgressUpdate};
pub use runner::VideoProcessingPipeline;
