pub mod codec;
pub mod events;
pub mod invocable;
pub mod stats;
pub mod task;
pub mod workflow;

pub use codec::{TaskRecord, TaskResultRecord, TASK_RECORD_VERSION};
pub use events::{CallbackRegistry, EngineEvent, EventCallback, EventKind};
pub use invocable::{
    from_async_fn, from_blocking_fn, invoke_guarded, Call, Invocable, InvocationContext,
    InvocationError, InvocationResult,
};
pub use orchestrator_errors::{OrchestratorError, OrchestratorResult};
pub use stats::{ComponentHealth, CronMetrics, HealthLevel, TaskMetrics, WorkflowMetrics};
pub use task::{Task, TaskConfig, TaskPriority, TaskResult, TaskStatus};
pub use workflow::{
    StepStatus, StepType, Workflow, WorkflowContext, WorkflowStatus, WorkflowStep,
};

pub use tokio_util::sync::CancellationToken;
