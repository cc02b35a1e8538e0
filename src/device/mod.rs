pub mod allocation;
pub mod backend;
pub mod capabilities;
pub mod monitor;
pub mod registry;
pub mod scorer;

pub use allocation::AllocationTracker;
pub use monitor::PerformanceMonitor;
pub use registry::DeviceRegistry;
