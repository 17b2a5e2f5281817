use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use orchestrator_errors::OrchestratorError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::invocable::Call;

/// 任务状态
///
/// `Pending → Running → {Completed | Failed | Timeout | Cancelled}`，
/// 可恢复的失败经过 `Retrying` 回到 `Running`，显式暂停经过 `Paused`。
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Retrying,
    Paused,
    Completed,
    Failed,
    Timeout,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Retrying => "retrying",
            TaskStatus::Paused => "paused",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Timeout => "timeout",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Timeout | TaskStatus::Cancelled
        )
    }

    /// 正在占用执行资源（包括等待重试）
    pub fn is_active(&self) -> bool {
        matches!(self, TaskStatus::Running | TaskStatus::Retrying)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "retrying" => Ok(TaskStatus::Retrying),
            "paused" => Ok(TaskStatus::Paused),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "timeout" => Ok(TaskStatus::Timeout),
            "cancelled" => Ok(TaskStatus::Cancelled),
            other => Err(OrchestratorError::Serialization(format!(
                "未知的任务状态: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl TaskPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskPriority::Low => "low",
            TaskPriority::Normal => "normal",
            TaskPriority::High => "high",
            TaskPriority::Critical => "critical",
        }
    }
}

impl FromStr for TaskPriority {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(TaskPriority::Low),
            "normal" => Ok(TaskPriority::Normal),
            "high" => Ok(TaskPriority::High),
            "critical" => Ok(TaskPriority::Critical),
            other => Err(OrchestratorError::Serialization(format!(
                "未知的任务优先级: {other}"
            ))),
        }
    }
}

/// 任务执行策略，任务开始运行后不再修改
#[derive(Debug, Clone, PartialEq)]
pub struct TaskConfig {
    pub max_retries: u32,
    pub retry_delay: Duration,
    /// 指数退避倍数，必须 >= 1.0
    pub retry_backoff: f64,
    pub timeout: Option<Duration>,
    pub dependencies: Vec<String>,
    pub priority: TaskPriority,
    pub auto_retry: bool,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            retry_backoff: 2.0,
            timeout: None,
            dependencies: Vec::new(),
            priority: TaskPriority::Normal,
            auto_retry: true,
        }
    }
}

impl TaskConfig {
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_backoff(mut self, backoff: f64) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_dependencies(mut self, dependencies: Vec<String>) -> Self {
        self.dependencies = dependencies;
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_auto_retry(mut self, auto_retry: bool) -> Self {
        self.auto_retry = auto_retry;
        self
    }
}

/// 单次执行尝试的结果
#[derive(Debug, Clone, PartialEq)]
pub struct TaskResult {
    pub success: bool,
    pub data: Option<Value>,
    pub error: Option<String>,
    pub execution_time: Duration,
    pub retry_count: u32,
    pub timestamp: DateTime<Utc>,
}

impl TaskResult {
    pub fn success(data: Value, execution_time: Duration, retry_count: u32) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            execution_time,
            retry_count,
            timestamp: Utc::now(),
        }
    }

    pub fn failure<S: Into<String>>(error: S, execution_time: Duration, retry_count: u32) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
            execution_time,
            retry_count,
            timestamp: Utc::now(),
        }
    }
}

/// 可调度执行的工作单元
#[derive(Debug, Clone)]
pub struct Task {
    pub id: String,
    pub name: String,
    /// 从持久化记录恢复的任务没有可调用对象，只能查询
    pub call: Option<Call>,
    pub status: TaskStatus,
    pub config: TaskConfig,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub result: Option<TaskResult>,
}

impl Task {
    pub fn new(name: impl Into<String>, call: Call, config: TaskConfig) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            call: Some(call),
            status: TaskStatus::Pending,
            config,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            retry_count: 0,
            last_error: None,
            result: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn has_dependencies(&self) -> bool {
        !self.config.dependencies.is_empty()
    }

    pub fn can_retry(&self) -> bool {
        self.config.auto_retry && self.retry_count < self.config.max_retries
    }

    pub fn entity_description(&self) -> String {
        format!("任务 '{}' (ID: {})", self.name, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invocable::{from_async_fn, InvocationContext};

    fn noop_call() -> Call {
        Call::new(from_async_fn("noop", |_ctx: InvocationContext| async {
            Ok(Value::Null)
        }))
    }

    #[test]
    fn test_status_string_mapping() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::Running,
            TaskStatus::Retrying,
            TaskStatus::Paused,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Timeout,
            TaskStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), status);
        }
        assert!("done".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn test_terminal_states() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Timeout.is_terminal());
        assert!(!TaskStatus::Retrying.is_terminal());
        assert!(!TaskStatus::Paused.is_terminal());
    }

    #[test]
    fn test_priority_ordering() {
        assert!(TaskPriority::Critical > TaskPriority::High);
        assert!(TaskPriority::Low < TaskPriority::Normal);
        assert_eq!(TaskPriority::default(), TaskPriority::Normal);
        assert_eq!("high".parse::<TaskPriority>().unwrap(), TaskPriority::High);
    }

    #[test]
    fn test_can_retry_respects_budget() {
        let mut task = Task::new("t", noop_call(), TaskConfig::default().with_max_retries(2));
        assert!(task.can_retry());
        task.retry_count = 2;
        assert!(!task.can_retry());

        let task = Task::new("t", noop_call(), TaskConfig::default().with_auto_retry(false));
        assert!(!task.can_retry());
    }
}
