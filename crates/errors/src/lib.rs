use thiserror::Error;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("无效的CRON表达式: {expr} - {message}")]
    InvalidCronExpression { expr: String, message: String },
    #[error("无效的任务配置: {0}")]
    InvalidTaskConfig(String),
    #[error("任务 {task_id} 的依赖未满足: {blocking:?}")]
    DependencyUnsatisfied {
        task_id: String,
        blocking: Vec<String>,
    },
    #[error("任务执行错误: {0}")]
    TaskExecution(String),
    #[error("任务执行超时 ({timeout_ms}ms)")]
    TaskTimeout { timeout_ms: u64 },
    #[error("工作流步骤 {step_id} 失败: {message}")]
    WorkflowStepFailure { step_id: String, message: String },
    #[error("工作流 {workflow_id} 执行失败: {message}")]
    WorkflowFailed {
        workflow_id: String,
        message: String,
    },
    #[error("任务未找到: {id}")]
    TaskNotFound { id: String },
    #[error("工作流未找到: {id}")]
    WorkflowNotFound { id: String },
    #[error("工作流 {workflow_id} 中的步骤未找到: {step_id}")]
    StepNotFound {
        workflow_id: String,
        step_id: String,
    },
    #[error("定时任务未找到: {id}")]
    ScheduledTaskNotFound { id: String },
    #[error("检测到循环依赖: {0}")]
    CircularDependency(String),
    #[error("无效的状态: {0}")]
    InvalidState(String),
    #[error("持久化错误: {0}")]
    Persistence(String),
    #[error("序列化错误: {0}")]
    Serialization(String),
    #[error("配置错误: {0}")]
    Configuration(String),
    #[error("IO错误: {0}")]
    Io(#[from] std::io::Error),
    #[error("内部错误: {0}")]
    Internal(String),
}

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

impl OrchestratorError {
    pub fn invalid_cron<E: Into<String>, M: Into<String>>(expr: E, message: M) -> Self {
        Self::InvalidCronExpression {
            expr: expr.into(),
            message: message.into(),
        }
    }
    pub fn invalid_config<S: Into<String>>(msg: S) -> Self {
        Self::InvalidTaskConfig(msg.into())
    }
    pub fn task_not_found<S: Into<String>>(id: S) -> Self {
        Self::TaskNotFound { id: id.into() }
    }
    pub fn workflow_not_found<S: Into<String>>(id: S) -> Self {
        Self::WorkflowNotFound { id: id.into() }
    }
    pub fn step_not_found<W: Into<String>, S: Into<String>>(workflow_id: W, step_id: S) -> Self {
        Self::StepNotFound {
            workflow_id: workflow_id.into(),
            step_id: step_id.into(),
        }
    }
    pub fn scheduled_task_not_found<S: Into<String>>(id: S) -> Self {
        Self::ScheduledTaskNotFound { id: id.into() }
    }
    pub fn invalid_state<S: Into<String>>(msg: S) -> Self {
        Self::InvalidState(msg.into())
    }
    pub fn persistence<S: Into<String>>(msg: S) -> Self {
        Self::Persistence(msg.into())
    }
    pub fn config_error<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            OrchestratorError::Internal(_) | OrchestratorError::Configuration(_)
        )
    }
    /// 可以在重试预算内本地恢复的错误
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OrchestratorError::TaskExecution(_)
                | OrchestratorError::TaskTimeout { .. }
                | OrchestratorError::WorkflowStepFailure { .. }
        )
    }
    pub fn is_timeout(&self) -> bool {
        matches!(self, OrchestratorError::TaskTimeout { .. })
    }
    /// 注册阶段同步拒绝的错误
    pub fn is_registration_error(&self) -> bool {
        matches!(
            self,
            OrchestratorError::InvalidCronExpression { .. }
                | OrchestratorError::InvalidTaskConfig(_)
                | OrchestratorError::CircularDependency(_)
        )
    }
}

impl From<serde_json::Error> for OrchestratorError {
    fn from(err: serde_json::Error) -> Self {
        OrchestratorError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for OrchestratorError {
    fn from(err: anyhow::Error) -> Self {
        OrchestratorError::Internal(err.to_string())
    }
}
