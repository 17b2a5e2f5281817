//! 任务快照的版本化编解码
//!
//! 每个任务对应一个 JSON 文档。字段列表与枚举字符串映射都是显式的，
//! 未知的版本号、状态或优先级会返回 `Serialization` 错误。

use std::time::Duration;

use chrono::{DateTime, Utc};
use orchestrator_errors::{OrchestratorError, OrchestratorResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::task::{Task, TaskConfig, TaskPriority, TaskResult, TaskStatus};

pub const TASK_RECORD_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct TaskResultRecord {
    pub success: bool,
    pub data: Option<Value>,
    pub error: Option<String>,
    pub execution_time_ms: u64,
    pub retry_count: u32,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct TaskRecord {
    pub format_version: u32,
    pub id: String,
    pub name: String,
    pub status: String,
    pub priority: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub result: Option<TaskResultRecord>,
}

impl TaskRecord {
    pub fn from_task(task: &Task) -> Self {
        Self {
            format_version: TASK_RECORD_VERSION,
            id: task.id.clone(),
            name: task.name.clone(),
            status: task.status.as_str().to_string(),
            priority: task.config.priority.as_str().to_string(),
            created_at: task.created_at,
            started_at: task.started_at,
            completed_at: task.completed_at,
            retry_count: task.retry_count,
            last_error: task.last_error.clone(),
            // 结果只在终态时落盘
            result: task
                .result
                .as_ref()
                .filter(|_| task.is_terminal())
                .map(|r| TaskResultRecord {
                    success: r.success,
                    data: r.data.clone(),
                    error: r.error.clone(),
                    execution_time_ms: r.execution_time.as_millis() as u64,
                    retry_count: r.retry_count,
                    timestamp: r.timestamp,
                }),
        }
    }

    pub fn encode(&self) -> OrchestratorResult<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn decode(bytes: &[u8]) -> OrchestratorResult<Self> {
        let record: TaskRecord = serde_json::from_slice(bytes)?;
        if record.format_version != TASK_RECORD_VERSION {
            return Err(OrchestratorError::Serialization(format!(
                "不支持的任务记录版本: {} (期望 {})",
                record.format_version, TASK_RECORD_VERSION
            )));
        }
        // 提前校验枚举字符串
        record.status.parse::<TaskStatus>()?;
        record.priority.parse::<TaskPriority>()?;
        Ok(record)
    }

    /// 还原为不带可调用对象的任务
    pub fn into_task(self) -> OrchestratorResult<Task> {
        let status = self.status.parse::<TaskStatus>()?;
        let priority = self.priority.parse::<TaskPriority>()?;
        Ok(Task {
            id: self.id,
            name: self.name,
            call: None,
            status,
            config: TaskConfig::default().with_priority(priority),
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            retry_count: self.retry_count,
            last_error: self.last_error,
            result: self.result.map(|r| TaskResult {
                success: r.success,
                data: r.data,
                error: r.error,
                execution_time: Duration::from_millis(r.execution_time_ms),
                retry_count: r.retry_count,
                timestamp: r.timestamp,
            }),
        })
    }
}
