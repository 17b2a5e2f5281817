use metrics::{counter, gauge, histogram, Counter, Gauge, Histogram};
use tracing::{debug, info, warn};

pub struct MetricsCollector {
    // Task metrics
    task_executions_total: Counter,
    task_execution_duration: Histogram,
    task_failures_total: Counter,
    task_timeouts_total: Counter,
    task_retries_total: Counter,
    task_registry_size: Gauge,

    // Workflow metrics
    workflow_runs_total: Counter,
    workflow_failures_total: Counter,
    workflow_duration: Histogram,
    step_executions_total: Counter,
    step_execution_duration: Histogram,
    step_failures_total: Counter,

    // Cron metrics
    cron_fires_total: Counter,
    cron_failures_total: Counter,
    cron_tick_duration: Histogram,
    cron_enabled_entries: Gauge,

    // Orchestrator metrics
    callback_failures_total: Counter,
    cleanup_removed_total: Counter,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            task_executions_total: counter!("orchestrator_task_executions_total"),
            task_execution_duration: histogram!("orchestrator_task_execution_duration_seconds"),
            task_failures_total: counter!("orchestrator_task_failures_total"),
            task_timeouts_total: counter!("orchestrator_task_timeouts_total"),
            task_retries_total: counter!("orchestrator_task_retries_total"),
            task_registry_size: gauge!("orchestrator_task_registry_size"),

            workflow_runs_total: counter!("orchestrator_workflow_runs_total"),
            workflow_failures_total: counter!("orchestrator_workflow_failures_total"),
            workflow_duration: histogram!("orchestrator_workflow_duration_seconds"),
            step_executions_total: counter!("orchestrator_step_executions_total"),
            step_execution_duration: histogram!("orchestrator_step_execution_duration_seconds"),
            step_failures_total: counter!("orchestrator_step_failures_total"),

            cron_fires_total: counter!("orchestrator_cron_fires_total"),
            cron_failures_total: counter!("orchestrator_cron_failures_total"),
            cron_tick_duration: histogram!("orchestrator_cron_tick_duration_seconds"),
            cron_enabled_entries: gauge!("orchestrator_cron_enabled_entries"),

            callback_failures_total: counter!("orchestrator_callback_failures_total"),
            cleanup_removed_total: counter!("orchestrator_cleanup_removed_total"),
        }
    }

    pub fn record_task_execution(&self, task_name: &str, success: bool, duration_seconds: f64) {
        self.task_executions_total.increment(1);
        self.task_execution_duration.record(duration_seconds);
        if !success {
            self.task_failures_total.increment(1);
        }

        debug!(
            task_name = task_name,
            success = success,
            duration_seconds = duration_seconds,
            "Task attempt recorded"
        );
    }

    pub fn record_task_timeout(&self, task_name: &str) {
        self.task_timeouts_total.increment(1);
        warn!(task_name = task_name, "Task attempt timed out");
    }

    pub fn record_task_retry(&self, task_name: &str, retry_count: u32) {
        self.task_retries_total.increment(1);

        info!(
            task_name = task_name,
            retry_count = retry_count,
            "Task retry scheduled"
        );
    }

    pub fn update_task_registry_size(&self, size: usize) {
        self.task_registry_size.set(size as f64);
    }

    pub fn record_workflow_run(&self, workflow_name: &str, success: bool, duration_seconds: f64) {
        self.workflow_runs_total.increment(1);
        self.workflow_duration.record(duration_seconds);
        if !success {
            self.workflow_failures_total.increment(1);
        }

        info!(
            workflow_name = workflow_name,
            success = success,
            duration_seconds = duration_seconds,
            "Workflow run recorded"
        );
    }

    pub fn record_step_execution(&self, step_name: &str, success: bool, duration_seconds: f64) {
        self.step_executions_total.increment(1);
        self.step_execution_duration.record(duration_seconds);
        if !success {
            self.step_failures_total.increment(1);
        }

        debug!(
            step_name = step_name,
            success = success,
            duration_seconds = duration_seconds,
            "Workflow step attempt recorded"
        );
    }

    pub fn record_cron_fire(&self, entry_name: &str, success: bool) {
        self.cron_fires_total.increment(1);
        if !success {
            self.cron_failures_total.increment(1);
        }

        debug!(entry_name = entry_name, success = success, "Cron fire recorded");
    }

    pub fn record_cron_tick(&self, duration_seconds: f64, enabled_entries: usize) {
        self.cron_tick_duration.record(duration_seconds);
        self.cron_enabled_entries.set(enabled_entries as f64);
    }

    /// 按事件名称分别计数
    pub fn record_event(&self, event_name: &'static str) {
        counter!("orchestrator_events_total", "event" => event_name).increment(1);
    }

    pub fn record_callback_failures(&self, count: usize) {
        if count > 0 {
            self.callback_failures_total.increment(count as u64);
        }
    }

    pub fn record_cleanup(&self, removed: usize) {
        self.cleanup_removed_total.increment(removed as u64);
        if removed > 0 {
            info!(removed = removed, "Cleanup sweep removed finished entries");
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_without_recorder_is_noop() {
        // 没有安装全局 recorder 时所有记录都应安全地成为空操作
        let metrics = MetricsCollector::new();
        metrics.record_task_execution("t", true, 0.1);
        metrics.record_task_execution("t", false, 0.2);
        metrics.record_task_timeout("t");
        metrics.record_task_retry("t", 1);
        metrics.record_workflow_run("wf", true, 1.0);
        metrics.record_step_execution("s", false, 0.5);
        metrics.record_cron_fire("c", true);
        metrics.record_cron_tick(0.001, 3);
        metrics.record_event("task.created");
        metrics.record_callback_failures(2);
        metrics.record_cleanup(0);
        metrics.update_task_registry_size(10);
    }
}
