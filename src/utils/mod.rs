pub mod clock;
pub mod metrics;

// Re-export commonly used items
pub use clock::{system_clock, Clock, ManualClock, SystemClock};
pub use metrics::{Metrics, MetricsSnapshot};
