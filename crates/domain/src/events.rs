//! 引擎事件与回调注册表
//!
//! 状态转换产生的事件通过回调向外广播。回调中的错误和 panic 都会被捕获并记录，
//! 单个订阅者的异常不会影响任务与工作流的推进。

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use crate::invocable::panic_message;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum EventKind {
    #[serde(rename = "task.created")]
    TaskCreated,
    #[serde(rename = "task.started")]
    TaskStarted,
    #[serde(rename = "task.retrying")]
    TaskRetrying,
    #[serde(rename = "task.completed")]
    TaskCompleted,
    #[serde(rename = "task.failed")]
    TaskFailed,
    #[serde(rename = "task.timeout")]
    TaskTimeout,
    #[serde(rename = "task.cancelled")]
    TaskCancelled,
    #[serde(rename = "task.paused")]
    TaskPaused,
    #[serde(rename = "task.resumed")]
    TaskResumed,
    #[serde(rename = "workflow.started")]
    WorkflowStarted,
    #[serde(rename = "workflow.completed")]
    WorkflowCompleted,
    #[serde(rename = "workflow.failed")]
    WorkflowFailed,
    #[serde(rename = "workflow.cancelled")]
    WorkflowCancelled,
    #[serde(rename = "workflow.paused")]
    WorkflowPaused,
    #[serde(rename = "workflow.resumed")]
    WorkflowResumed,
    #[serde(rename = "step.started")]
    StepStarted,
    #[serde(rename = "step.completed")]
    StepCompleted,
    #[serde(rename = "step.failed")]
    StepFailed,
    #[serde(rename = "scheduledTask.executed")]
    ScheduledTaskExecuted,
    #[serde(rename = "scheduledTask.failed")]
    ScheduledTaskFailed,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::TaskCreated => "task.created",
            EventKind::TaskStarted => "task.started",
            EventKind::TaskRetrying => "task.retrying",
            EventKind::TaskCompleted => "task.completed",
            EventKind::TaskFailed => "task.failed",
            EventKind::TaskTimeout => "task.timeout",
            EventKind::TaskCancelled => "task.cancelled",
            EventKind::TaskPaused => "task.paused",
            EventKind::TaskResumed => "task.resumed",
            EventKind::WorkflowStarted => "workflow.started",
            EventKind::WorkflowCompleted => "workflow.completed",
            EventKind::WorkflowFailed => "workflow.failed",
            EventKind::WorkflowCancelled => "workflow.cancelled",
            EventKind::WorkflowPaused => "workflow.paused",
            EventKind::WorkflowResumed => "workflow.resumed",
            EventKind::StepStarted => "step.started",
            EventKind::StepCompleted => "step.completed",
            EventKind::StepFailed => "step.failed",
            EventKind::ScheduledTaskExecuted => "scheduledTask.executed",
            EventKind::ScheduledTaskFailed => "scheduledTask.failed",
        }
    }

    /// 事件所属组件：task / workflow / step / scheduledTask
    pub fn component(&self) -> &'static str {
        self.as_str().split('.').next().unwrap_or_default()
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineEvent {
    pub id: Uuid,
    pub kind: EventKind,
    /// 任务/工作流/定时任务 ID；步骤事件为步骤 ID
    pub entity_id: String,
    pub name: String,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl EngineEvent {
    pub fn new(
        kind: EventKind,
        entity_id: impl Into<String>,
        name: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            entity_id: entity_id.into(),
            name: name.into(),
            payload,
            timestamp: Utc::now(),
        }
    }
}

pub type EventCallback = Arc<dyn Fn(&EngineEvent) -> Result<(), String> + Send + Sync>;

/// 回调注册表，`None` 表示订阅所有事件
#[derive(Clone, Default)]
pub struct CallbackRegistry {
    callbacks: Arc<RwLock<Vec<(Option<EventKind>, EventCallback)>>>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F>(&self, kind: EventKind, callback: F)
    where
        F: Fn(&EngineEvent) -> Result<(), String> + Send + Sync + 'static,
    {
        self.register(Some(kind), Arc::new(callback));
    }

    pub fn on_any<F>(&self, callback: F)
    where
        F: Fn(&EngineEvent) -> Result<(), String> + Send + Sync + 'static,
    {
        self.register(None, Arc::new(callback));
    }

    fn register(&self, kind: Option<EventKind>, callback: EventCallback) {
        match self.callbacks.write() {
            Ok(mut callbacks) => callbacks.push((kind, callback)),
            Err(poisoned) => poisoned.into_inner().push((kind, callback)),
        }
    }

    pub fn len(&self) -> usize {
        self.callbacks.read().map(|c| c.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 依次调用匹配的回调，返回失败的回调数量
    pub fn emit(&self, event: &EngineEvent) -> usize {
        let matching: Vec<EventCallback> = {
            let callbacks = match self.callbacks.read() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            callbacks
                .iter()
                .filter(|(kind, _)| kind.map_or(true, |k| k == event.kind))
                .map(|(_, cb)| Arc::clone(cb))
                .collect()
        };

        let mut failures = 0;
        for callback in matching {
            match catch_unwind(AssertUnwindSafe(|| callback(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    failures += 1;
                    warn!(
                        event = event.kind.as_str(),
                        entity.id = %event.entity_id,
                        "事件回调返回错误: {}",
                        e
                    );
                }
                Err(panic) => {
                    failures += 1;
                    warn!(
                        event = event.kind.as_str(),
                        entity.id = %event.entity_id,
                        "事件回调发生panic: {}",
                        panic_message(panic.as_ref())
                    );
                }
            }
        }
        failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_event_kind_names() {
        assert_eq!(EventKind::TaskCreated.as_str(), "task.created");
        assert_eq!(EventKind::ScheduledTaskExecuted.as_str(), "scheduledTask.executed");
        assert_eq!(EventKind::StepFailed.component(), "step");
        assert_eq!(
            serde_json::to_value(EventKind::WorkflowCompleted).unwrap(),
            json!("workflow.completed")
        );
    }

    #[test]
    fn test_emit_filters_by_kind() {
        let registry = CallbackRegistry::new();
        let completed = Arc::new(AtomicUsize::new(0));
        let all = Arc::new(AtomicUsize::new(0));

        let c = Arc::clone(&completed);
        registry.on(EventKind::TaskCompleted, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let a = Arc::clone(&all);
        registry.on_any(move |_| {
            a.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        registry.emit(&EngineEvent::new(EventKind::TaskCreated, "1", "t", Value::Null));
        registry.emit(&EngineEvent::new(EventKind::TaskCompleted, "1", "t", Value::Null));

        assert_eq!(completed.load(Ordering::SeqCst), 1);
        assert_eq!(all.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_misbehaving_callbacks_are_isolated() {
        let registry = CallbackRegistry::new();
        let reached = Arc::new(AtomicUsize::new(0));

        registry.on_any(|_| Err("subscriber error".to_string()));
        registry.on_any(|_| panic!("subscriber panic"));
        let r = Arc::clone(&reached);
        registry.on_any(move |_| {
            r.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let failures = registry.emit(&EngineEvent::new(
            EventKind::TaskFailed,
            "1",
            "t",
            json!({"error": "x"}),
        ));
        assert_eq!(failures, 2);
        assert_eq!(reached.load(Ordering::SeqCst), 1);
    }
}
