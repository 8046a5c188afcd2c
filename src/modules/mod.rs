pub mod sampler;
pub mod system_info;
pub mod system_monitor;

// Re-export commonly used items
pub use sampler::{SampleSnapshot, SamplingEngine};
pub use system_info::{CpuInfoReport, CpuTopology};
pub use system_monitor::{SystemMonitor, ViewType};
