use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::invocable::Call;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum StepType {
    Task,
    Condition,
    Parallel,
    Wait,
    Custom,
}

/// 步骤状态 `Pending → Running → {Completed | Failed | Skipped | Cancelled}`
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
            StepStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Pending => "pending",
            WorkflowStatus::Running => "running",
            WorkflowStatus::Paused => "paused",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Failed => "failed",
            WorkflowStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Cancelled
        )
    }
}

/// DAG 中的一个节点
#[derive(Debug, Clone)]
pub struct WorkflowStep {
    pub id: String,
    pub name: String,
    pub step_type: StepType,
    pub call: Call,
    pub dependencies: Vec<String>,
    pub max_retries: u32,
    pub timeout: Option<Duration>,
    pub status: StepStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowStep {
    pub fn new(name: impl Into<String>, step_type: StepType, call: Call, max_retries: u32) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            step_type,
            call,
            dependencies: Vec::new(),
            max_retries,
            timeout: None,
            status: StepStatus::Pending,
            result: None,
            error: None,
            attempts: 0,
            started_at: None,
            completed_at: None,
        }
    }
}

/// 单次工作流运行的共享状态
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct WorkflowContext {
    pub variables: HashMap<String, Value>,
    pub step_results: HashMap<String, Value>,
    /// 按完成顺序记录的步骤 ID
    pub execution_path: Vec<String>,
}

impl WorkflowContext {
    pub fn with_variables(variables: HashMap<String, Value>) -> Self {
        Self {
            variables,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct Workflow {
    pub id: String,
    pub name: String,
    pub steps: HashMap<String, WorkflowStep>,
    /// 步骤添加顺序，用于稳定的就绪集合排序
    pub step_order: Vec<String>,
    pub dependencies: HashMap<String, Vec<String>>,
    pub status: WorkflowStatus,
    pub context: WorkflowContext,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl Workflow {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            steps: HashMap::new(),
            step_order: Vec::new(),
            dependencies: HashMap::new(),
            status: WorkflowStatus::Pending,
            context: WorkflowContext::default(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error: None,
        }
    }

    pub fn insert_step(&mut self, step: WorkflowStep) {
        self.dependencies
            .insert(step.id.clone(), step.dependencies.clone());
        self.step_order.push(step.id.clone());
        self.steps.insert(step.id.clone(), step);
    }

    /// 状态为 Pending 且所有依赖均已 Completed 的步骤
    pub fn ready_steps(&self) -> Vec<String> {
        self.step_order
            .iter()
            .filter(|id| {
                self.steps.get(*id).is_some_and(|step| {
                    step.status == StepStatus::Pending
                        && step.dependencies.iter().all(|dep| {
                            self.steps
                                .get(dep)
                                .is_some_and(|d| d.status == StepStatus::Completed)
                        })
                })
            })
            .cloned()
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.steps
            .values()
            .all(|step| step.status == StepStatus::Completed)
    }

    pub fn has_failed_step(&self) -> bool {
        self.steps
            .values()
            .any(|step| step.status == StepStatus::Failed)
    }

    pub fn pending_steps(&self) -> Vec<String> {
        self.step_order
            .iter()
            .filter(|id| {
                self.steps
                    .get(*id)
                    .is_some_and(|s| s.status == StepStatus::Pending)
            })
            .cloned()
            .collect()
    }

    /// 把所有 Pending 步骤标记为给定的终态
    pub fn settle_pending(&mut self, status: StepStatus) -> usize {
        let mut count = 0;
        for step in self.steps.values_mut() {
            if step.status == StepStatus::Pending {
                step.status = status;
                count += 1;
            }
        }
        count
    }

    /// 按声明顺序收集依赖步骤的结果
    pub fn dependency_results(&self, step_id: &str) -> Vec<Value> {
        self.steps
            .get(step_id)
            .map(|step| {
                step.dependencies
                    .iter()
                    .map(|dep| {
                        self.context
                            .step_results
                            .get(dep)
                            .cloned()
                            .unwrap_or(Value::Null)
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}
