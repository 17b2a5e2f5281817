pub struct TaskTracer;

impl TaskTracer {
    pub fn execute_task_span(task_id: &str, task_name: &str, attempt: u32) -> tracing::Span {
        tracing::info_span!(
            "execute_task",
            task.id = task_id,
            task.name = task_name,
            task.attempt = attempt
        )
    }

    pub fn dependency_check_span(task_id: &str, task_name: &str) -> tracing::Span {
        tracing::info_span!(
            "check_dependencies",
            task.id = task_id,
            task.name = task_name
        )
    }

    pub fn workflow_span(workflow_id: &str, workflow_name: &str) -> tracing::Span {
        tracing::info_span!(
            "execute_workflow",
            workflow.id = workflow_id,
            workflow.name = workflow_name
        )
    }

    pub fn step_span(workflow_id: &str, step_id: &str, step_name: &str) -> tracing::Span {
        tracing::info_span!(
            "execute_step",
            workflow.id = workflow_id,
            step.id = step_id,
            step.name = step_name
        )
    }

    pub fn cron_fire_span(entry_id: &str, entry_name: &str) -> tracing::Span {
        tracing::info_span!("cron_fire", cron.id = entry_id, cron.name = entry_name)
    }

    pub fn cleanup_span() -> tracing::Span {
        tracing::info_span!("cleanup")
    }
}
