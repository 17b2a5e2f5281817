use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthLevel {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthLevel {
    /// 取两者中较差的级别
    pub fn worst(self, other: HealthLevel) -> HealthLevel {
        use HealthLevel::*;
        match (self, other) {
            (Unhealthy, _) | (_, Unhealthy) => Unhealthy,
            (Degraded, _) | (_, Degraded) => Degraded,
            _ => Healthy,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ComponentHealth {
    pub status: HealthLevel,
    pub running: bool,
    pub message: Option<String>,
    pub details: Value,
}

impl ComponentHealth {
    pub fn healthy(details: Value) -> Self {
        Self {
            status: HealthLevel::Healthy,
            running: true,
            message: None,
            details,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TaskMetrics {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub retrying: usize,
    pub paused: usize,
    pub completed: usize,
    pub failed: usize,
    pub timeout: usize,
    pub cancelled: usize,
    pub total_retries: u64,
}

impl TaskMetrics {
    pub fn terminal(&self) -> usize {
        self.completed + self.failed + self.timeout + self.cancelled
    }

    /// 失败（含超时）占已结束任务的比例，取消的任务不计入
    pub fn failure_ratio(&self) -> f64 {
        let finished = self.completed + self.failed + self.timeout;
        if finished == 0 {
            0.0
        } else {
            (self.failed + self.timeout) as f64 / finished as f64
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct WorkflowMetrics {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub paused: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub total_steps: usize,
    pub completed_steps: usize,
    pub failed_steps: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CronMetrics {
    pub total: usize,
    pub enabled: usize,
    pub disabled: usize,
    pub executing: usize,
    pub total_runs: u64,
    pub failed_runs: u64,
    pub loop_running: bool,
}
