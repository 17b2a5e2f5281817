use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::validation::{ConfigValidator, ValidationUtils};

/// 任务管理器配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TaskManagerConfig {
    /// 任务快照存储目录，每个任务一个 `<id>.json`
    pub storage_dir: PathBuf,
    pub persistence_enabled: bool,
    /// 阻塞型可调用对象的工作池大小
    pub max_blocking_workers: usize,
    pub default_max_retries: u32,
    pub default_retry_delay_ms: u64,
    pub default_retry_backoff: f64,
}

impl Default for TaskManagerConfig {
    fn default() -> Self {
        Self {
            storage_dir: PathBuf::from("data/tasks"),
            persistence_enabled: true,
            max_blocking_workers: 4,
            default_max_retries: 3,
            default_retry_delay_ms: 1000,
            default_retry_backoff: 2.0,
        }
    }
}

impl TaskManagerConfig {
    pub fn default_retry_delay(&self) -> Duration {
        Duration::from_millis(self.default_retry_delay_ms)
    }
}

impl ConfigValidator for TaskManagerConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        if self.persistence_enabled {
            ValidationUtils::validate_not_empty(
                &self.storage_dir.to_string_lossy(),
                "task_manager.storage_dir",
            )?;
        }
        ValidationUtils::validate_count(
            self.max_blocking_workers,
            "task_manager.max_blocking_workers",
            1024,
        )?;
        ValidationUtils::validate_backoff(
            self.default_retry_backoff,
            "task_manager.default_retry_backoff",
        )?;
        Ok(())
    }
}

/// 工作流引擎配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorkflowConfig {
    /// 步骤重试基准间隔，第 n 次重试等待 base × 2^n
    pub step_retry_base_ms: u64,
    pub default_step_max_retries: u32,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            step_retry_base_ms: 1000,
            default_step_max_retries: 3,
        }
    }
}

impl WorkflowConfig {
    pub fn step_retry_base(&self) -> Duration {
        Duration::from_millis(self.step_retry_base_ms)
    }
}

impl ConfigValidator for WorkflowConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        if self.default_step_max_retries > 32 {
            return Err(crate::ConfigError::Validation(
                "workflow.default_step_max_retries must be less than or equal to 32".to_string(),
            ));
        }
        Ok(())
    }
}

/// 定时任务处理器配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CronConfig {
    pub tick_interval_ms: u64,
    /// 计算下次执行时间时的最大扫描步数
    pub max_scan_iterations: usize,
}

impl Default for CronConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1000,
            max_scan_iterations: 10_000,
        }
    }
}

impl CronConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

impl ConfigValidator for CronConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        ValidationUtils::validate_positive(self.tick_interval_ms, "cron.tick_interval_ms")?;
        ValidationUtils::validate_count(
            self.max_scan_iterations,
            "cron.max_scan_iterations",
            1_000_000,
        )?;
        Ok(())
    }
}

/// 编排器配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub cleanup_interval_seconds: u64,
    /// 已结束的任务/工作流保留时长
    pub retention_seconds: u64,
    pub event_history_size: usize,
    /// 失败率超过该值时健康检查报告 degraded
    pub degraded_failure_ratio: f64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            cleanup_interval_seconds: 3600,
            retention_seconds: 86_400,
            event_history_size: 1000,
            degraded_failure_ratio: 0.5,
        }
    }
}

impl OrchestratorConfig {
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_seconds)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_seconds)
    }
}

impl ConfigValidator for OrchestratorConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        ValidationUtils::validate_positive(
            self.cleanup_interval_seconds,
            "orchestrator.cleanup_interval_seconds",
        )?;
        ValidationUtils::validate_count(
            self.event_history_size,
            "orchestrator.event_history_size",
            100_000,
        )?;
        ValidationUtils::validate_ratio(
            self.degraded_failure_ratio,
            "orchestrator.degraded_failure_ratio",
        )?;
        Ok(())
    }
}
