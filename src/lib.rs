pub mod config;
pub mod device;
pub mod error;
pub mod media;
pub mod pipeline;
pub mod scheduler;

pub use config::{Config, ProcessingConfig};
pub use device::capabilities::{DeviceCapabilities, DeviceType, Precision, TaskType, WorkloadProfile};
pub use error::{PipelineFailure, StageError};
pub use pipeline::job::{PipelineJob, PipelineResult, PipelineState, Segment};
pub use scheduler::{Scheduler, SchedulerBuilder};
