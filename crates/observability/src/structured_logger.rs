use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

pub struct StructuredLogger;

impl StructuredLogger {
    pub fn log_task_created(task_id: &str, task_name: &str, priority: &str, dependencies: usize) {
        info!(
            event = "task_created",
            task.id = task_id,
            task.name = task_name,
            task.priority = priority,
            task.dependencies = dependencies,
            "Task created"
        );
    }

    pub fn log_task_transition(task_id: &str, task_name: &str, from: &str, to: &str) {
        debug!(
            event = "task_transition",
            task.id = task_id,
            task.name = task_name,
            task.from = from,
            task.to = to,
            "Task status changed"
        );
    }

    pub fn log_task_execution_complete(
        task_id: &str,
        task_name: &str,
        success: bool,
        duration_ms: u64,
        retry_count: u32,
        error_message: Option<&str>,
    ) {
        if success {
            info!(
                event = "task_execution_complete",
                task.id = task_id,
                task.name = task_name,
                task.success = success,
                task.duration_ms = duration_ms,
                task.retry_count = retry_count,
                "Task execution completed"
            );
        } else {
            error!(
                event = "task_execution_failed",
                task.id = task_id,
                task.name = task_name,
                task.success = success,
                task.duration_ms = duration_ms,
                task.retry_count = retry_count,
                error.message = error_message.unwrap_or("unknown"),
                "Task execution failed"
            );
        }
    }

    pub fn log_task_retry(
        task_id: &str,
        task_name: &str,
        retry_count: u32,
        max_retries: u32,
        delay_ms: u64,
        reason: &str,
    ) {
        warn!(
            event = "task_retry",
            task.id = task_id,
            task.name = task_name,
            task.retry_count = retry_count,
            task.max_retries = max_retries,
            task.delay_ms = delay_ms,
            retry.reason = reason,
            "Task scheduled for retry"
        );
    }

    pub fn log_dependency_blocked(task_id: &str, task_name: &str, blocking: &[String]) {
        info!(
            event = "dependency_blocked",
            task.id = task_id,
            task.name = task_name,
            dependencies.blocking = ?blocking,
            "Task dependencies not satisfied"
        );
    }

    pub fn log_workflow_transition(workflow_id: &str, workflow_name: &str, status: &str) {
        info!(
            event = "workflow_transition",
            workflow.id = workflow_id,
            workflow.name = workflow_name,
            workflow.status = status,
            "Workflow status changed"
        );
    }

    pub fn log_step_transition(
        workflow_id: &str,
        step_id: &str,
        step_name: &str,
        status: &str,
        attempt: u32,
    ) {
        debug!(
            event = "step_transition",
            workflow.id = workflow_id,
            step.id = step_id,
            step.name = step_name,
            step.status = status,
            step.attempt = attempt,
            "Workflow step status changed"
        );
    }

    pub fn log_cron_fire(
        entry_id: &str,
        entry_name: &str,
        run_count: u64,
        next_run: Option<DateTime<Utc>>,
    ) {
        info!(
            event = "cron_fire",
            cron.id = entry_id,
            cron.name = entry_name,
            cron.run_count = run_count,
            cron.next_run = ?next_run,
            "Scheduled task fired"
        );
    }

    pub fn log_cron_fire_failed(entry_id: &str, entry_name: &str, error_message: &str) {
        error!(
            event = "cron_fire_failed",
            cron.id = entry_id,
            cron.name = entry_name,
            error.message = error_message,
            "Scheduled task execution failed"
        );
    }

    pub fn log_callback_failure(event_name: &str, entity_id: &str, failures: usize) {
        warn!(
            event = "callback_failure",
            callback.event = event_name,
            entity.id = entity_id,
            callback.failures = failures,
            "Event callbacks reported failures"
        );
    }

    pub fn log_component_status(component: &str, status: &str, message: Option<&str>) {
        info!(
            event = "component_status",
            component = component,
            status = status,
            message = message.unwrap_or(""),
            "Component status changed"
        );
    }
}
