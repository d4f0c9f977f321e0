pub mod health_monitor;
pub mod ready_queue;
pub mod retry_policy;
pub mod scheduler;
pub mod test_utils;

pub use health_monitor::{HealthMonitor, HealthMonitorConfig};
pub use ready_queue::ReadyQueue;
pub use retry_policy::RetryPolicy;
pub use scheduler::{SchedulerConfig, TaskScheduler};
