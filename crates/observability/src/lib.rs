pub mod event_bus;
pub mod metrics_collector;
pub mod structured_logger;
pub mod task_tracer;

pub use event_bus::{EventBus, EventStats};
pub use metrics_collector::MetricsCollector;
pub use structured_logger::StructuredLogger;
pub use task_tracer::TaskTracer;
