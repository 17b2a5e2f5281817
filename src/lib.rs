pub mod orchestrator;
pub mod shutdown;

pub use orchestrator::{
    CleanupReport, HealthReport, Orchestrator, OrchestratorMetrics, OrchestratorStatus,
};
pub use shutdown::ShutdownManager;

pub use orchestrator_config::AppConfig;
pub use orchestrator_dispatcher::{CronExpression, CronHandler, ScheduledTask};
pub use orchestrator_domain::{
    from_async_fn, from_blocking_fn, Call, EngineEvent, EventKind, Invocable, InvocationContext,
    InvocationError, Task, TaskConfig, TaskPriority, TaskStatus, Workflow, WorkflowStatus,
};
pub use orchestrator_errors::{OrchestratorError, OrchestratorResult};
pub use orchestrator_worker::TaskManager;
pub use orchestrator_workflow::{StepOptions, WorkflowEngine};
