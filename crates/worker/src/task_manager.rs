//! 任务管理器
//!
//! 持有任务注册表并驱动任务状态机：
//! `Pending → Running → {Completed | Failed | Timeout | Cancelled}`，
//! 可恢复的失败经 `Retrying` 回到 `Running`，显式暂停经 `Paused`。
//!
//! 注册表锁只在状态变更期间持有，绝不跨越可调用对象的 await。
//! 每次派发携带一个 epoch，取消/暂停/恢复都会递增 epoch，
//! 旧 epoch 的执行结果会被直接丢弃。
//!
//! 每次状态变更同时递增任务的 revision，快照按 revision 顺序落盘，
//! 较旧的快照不会覆盖较新的快照。

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use orchestrator_config::TaskManagerConfig;
use orchestrator_domain::{
    invoke_guarded, Call, CallbackRegistry, CancellationToken, ComponentHealth, EngineEvent,
    EventKind, HealthLevel, InvocationError, Task, TaskConfig, TaskMetrics, TaskRecord,
    TaskResult, TaskStatus,
};
use orchestrator_errors::{OrchestratorError, OrchestratorResult};
use orchestrator_observability::{MetricsCollector, StructuredLogger, TaskTracer};
use serde_json::{json, Value};
use tokio::sync::{Mutex, RwLock, Semaphore};
use tracing::{debug, info, warn, Instrument};

use crate::retry::RetryPolicy;
use crate::store::{JsonFileTaskStore, TaskStore};

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(20);
const RESTART_INTERRUPTED: &str = "interrupted by restart";

struct TaskEntry {
    task: Task,
    epoch: u64,
    revision: u64,
    cancellation: CancellationToken,
}

impl TaskEntry {
    fn new(task: Task) -> Self {
        Self {
            task,
            epoch: 0,
            revision: 1,
            cancellation: CancellationToken::new(),
        }
    }

    /// 记录一次状态变更，返回快照及其 revision
    fn snapshot(&mut self) -> (Task, u64) {
        self.revision += 1;
        (self.task.clone(), self.revision)
    }

    /// 使当前派发失效并通知正在运行的可调用对象
    fn invalidate(&mut self) {
        self.epoch += 1;
        self.cancellation.cancel();
    }

    /// 为新的派发准备 epoch 和取消令牌
    fn rearm(&mut self) -> u64 {
        self.epoch += 1;
        self.cancellation = CancellationToken::new();
        self.epoch
    }
}

struct Dispatch {
    name: String,
    call: Call,
    timeout: Option<Duration>,
    attempt: u32,
    cancellation: CancellationToken,
}

enum Next {
    Retry {
        delay: Duration,
        cancellation: CancellationToken,
    },
    Done,
}

#[derive(Clone)]
pub struct TaskManager {
    config: TaskManagerConfig,
    tasks: Arc<RwLock<HashMap<String, TaskEntry>>>,
    store: Option<Arc<dyn TaskStore>>,
    callbacks: CallbackRegistry,
    metrics: Arc<MetricsCollector>,
    blocking_slots: Arc<Semaphore>,
    /// 每个任务最近一次落盘的 revision，同一任务的写入在此串行
    written: Arc<Mutex<HashMap<String, Arc<Mutex<u64>>>>>,
    accepting: Arc<AtomicBool>,
}

impl TaskManager {
    pub fn new(config: TaskManagerConfig, metrics: Arc<MetricsCollector>) -> Self {
        let store: Option<Arc<dyn TaskStore>> = if config.persistence_enabled {
            Some(Arc::new(JsonFileTaskStore::new(config.storage_dir.clone())))
        } else {
            None
        };
        Self::with_store(config, store, metrics)
    }

    pub fn with_store(
        config: TaskManagerConfig,
        store: Option<Arc<dyn TaskStore>>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        let workers = config.max_blocking_workers.max(1);
        Self {
            config,
            tasks: Arc::new(RwLock::new(HashMap::new())),
            store,
            callbacks: CallbackRegistry::new(),
            metrics,
            blocking_slots: Arc::new(Semaphore::new(workers)),
            written: Arc::new(Mutex::new(HashMap::new())),
            accepting: Arc::new(AtomicBool::new(true)),
        }
    }

    /// 按配置默认值构造的任务配置
    pub fn default_task_config(&self) -> TaskConfig {
        TaskConfig::default()
            .with_max_retries(self.config.default_max_retries)
            .with_retry_delay(self.config.default_retry_delay())
            .with_backoff(self.config.default_retry_backoff)
    }

    pub fn on<F>(&self, kind: EventKind, callback: F)
    where
        F: Fn(&EngineEvent) -> Result<(), String> + Send + Sync + 'static,
    {
        self.callbacks.on(kind, callback);
    }

    pub fn on_any<F>(&self, callback: F)
    where
        F: Fn(&EngineEvent) -> Result<(), String> + Send + Sync + 'static,
    {
        self.callbacks.on_any(callback);
    }

    pub fn is_running(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    pub async fn start(&self) {
        self.accepting.store(true, Ordering::SeqCst);
        StructuredLogger::log_component_status("task_manager", "started", None);
    }

    /// 停止接收新任务，并取消所有正在执行或等待重试的任务
    pub async fn stop(&self) {
        self.accepting.store(false, Ordering::SeqCst);

        let cancelled: Vec<(Task, u64)> = {
            let mut tasks = self.tasks.write().await;
            tasks
                .values_mut()
                .filter(|entry| entry.task.status.is_active())
                .map(|entry| {
                    entry.invalidate();
                    let task = &mut entry.task;
                    task.status = TaskStatus::Cancelled;
                    task.completed_at = Some(Utc::now());
                    task.last_error = Some("任务管理器已停止".to_string());
                    task.result = Some(TaskResult::failure(
                        "任务管理器已停止",
                        Self::elapsed_since_start(task),
                        task.retry_count,
                    ));
                    entry.snapshot()
                })
                .collect()
        };

        for (task, revision) in &cancelled {
            self.persist(task, *revision).await;
            self.emit(EventKind::TaskCancelled, task);
        }
        StructuredLogger::log_component_status(
            "task_manager",
            "stopped",
            Some(&format!("取消了 {} 个运行中的任务", cancelled.len())),
        );
    }

    pub async fn create_task(
        &self,
        name: impl Into<String>,
        call: Call,
        config: TaskConfig,
    ) -> OrchestratorResult<String> {
        let task = Task::new(name, call, config);
        self.validate_config(&task).await?;

        let snapshot = task.clone();
        let entry = TaskEntry::new(task);
        let revision = entry.revision;
        {
            let mut tasks = self.tasks.write().await;
            tasks.insert(snapshot.id.clone(), entry);
            self.metrics.update_task_registry_size(tasks.len());
        }

        StructuredLogger::log_task_created(
            &snapshot.id,
            &snapshot.name,
            snapshot.config.priority.as_str(),
            snapshot.config.dependencies.len(),
        );
        self.persist(&snapshot, revision).await;
        self.emit(EventKind::TaskCreated, &snapshot);
        Ok(snapshot.id)
    }

    async fn validate_config(&self, task: &Task) -> OrchestratorResult<()> {
        let config = &task.config;
        if !config.retry_backoff.is_finite() || config.retry_backoff < 1.0 {
            return Err(OrchestratorError::invalid_config(format!(
                "retry_backoff 必须 >= 1.0，当前为 {}",
                config.retry_backoff
            )));
        }
        if config.timeout.is_some_and(|t| t.is_zero()) {
            return Err(OrchestratorError::invalid_config("timeout 不能为 0"));
        }
        if config.dependencies.iter().any(|dep| dep == &task.id) {
            return Err(OrchestratorError::invalid_config(format!(
                "{} 不能依赖自身",
                task.entity_description()
            )));
        }

        let tasks = self.tasks.read().await;
        let unknown: Vec<&String> = config
            .dependencies
            .iter()
            .filter(|dep| !tasks.contains_key(*dep))
            .collect();
        if !unknown.is_empty() {
            return Err(OrchestratorError::invalid_config(format!(
                "未知的依赖任务: {unknown:?}"
            )));
        }
        Ok(())
    }

    fn blocking_dependencies(
        tasks: &HashMap<String, TaskEntry>,
        dependencies: &[String],
    ) -> Vec<String> {
        dependencies
            .iter()
            .filter(|dep| {
                tasks
                    .get(*dep)
                    .map_or(true, |entry| entry.task.status != TaskStatus::Completed)
            })
            .cloned()
            .collect()
    }

    /// 启动任务
    ///
    /// 任务已在运行或已结束（且未指定 `force`）、没有可调用对象、
    /// 管理器已停止或依赖未全部完成时返回 `false`。
    pub async fn start_task(&self, task_id: &str, force: bool) -> OrchestratorResult<bool> {
        if !self.is_running() {
            warn!("任务管理器已停止，拒绝启动任务: {}", task_id);
            return Ok(false);
        }

        let (snapshot, revision, epoch) = {
            let mut tasks = self.tasks.write().await;
            let entry = tasks
                .get(task_id)
                .ok_or_else(|| OrchestratorError::task_not_found(task_id))?;

            if entry.task.call.is_none() {
                debug!("{} 没有可调用对象，无法启动", entry.task.entity_description());
                return Ok(false);
            }
            let status = entry.task.status;
            if !force && status != TaskStatus::Pending {
                debug!(
                    "{} 当前状态为 {}，不能启动",
                    entry.task.entity_description(),
                    status
                );
                return Ok(false);
            }

            if entry.task.has_dependencies() {
                let span = TaskTracer::dependency_check_span(task_id, &entry.task.name);
                let blocking = span.in_scope(|| {
                    Self::blocking_dependencies(&tasks, &entry.task.config.dependencies)
                });
                if !blocking.is_empty() {
                    StructuredLogger::log_dependency_blocked(task_id, &entry.task.name, &blocking);
                    return Ok(false);
                }
            }

            let Some(entry) = tasks.get_mut(task_id) else {
                return Err(OrchestratorError::task_not_found(task_id));
            };
            if force {
                entry.cancellation.cancel();
                let task = &mut entry.task;
                task.retry_count = 0;
                task.last_error = None;
                task.result = None;
                task.completed_at = None;
            }
            let epoch = entry.rearm();
            entry.task.status = TaskStatus::Running;
            entry.task.started_at = Some(Utc::now());
            StructuredLogger::log_task_transition(
                task_id,
                &entry.task.name,
                status.as_str(),
                TaskStatus::Running.as_str(),
            );
            let (snapshot, revision) = entry.snapshot();
            (snapshot, revision, epoch)
        };

        self.persist(&snapshot, revision).await;
        self.emit(EventKind::TaskStarted, &snapshot);
        self.spawn_execution(task_id.to_string(), epoch);
        Ok(true)
    }

    pub async fn cancel_task(&self, task_id: &str) -> OrchestratorResult<bool> {
        let (snapshot, revision) = {
            let mut tasks = self.tasks.write().await;
            let entry = tasks
                .get_mut(task_id)
                .ok_or_else(|| OrchestratorError::task_not_found(task_id))?;
            if entry.task.is_terminal() {
                return Ok(false);
            }

            entry.invalidate();
            let task = &mut entry.task;
            let from = task.status;
            task.status = TaskStatus::Cancelled;
            task.completed_at = Some(Utc::now());
            task.result = Some(TaskResult::failure(
                "任务已取消",
                Self::elapsed_since_start(task),
                task.retry_count,
            ));
            StructuredLogger::log_task_transition(
                task_id,
                &task.name,
                from.as_str(),
                TaskStatus::Cancelled.as_str(),
            );
            entry.snapshot()
        };

        info!("{} 已取消", snapshot.entity_description());
        self.persist(&snapshot, revision).await;
        self.emit(EventKind::TaskCancelled, &snapshot);
        Ok(true)
    }

    pub async fn pause_task(&self, task_id: &str) -> OrchestratorResult<bool> {
        let (snapshot, revision) = {
            let mut tasks = self.tasks.write().await;
            let entry = tasks
                .get_mut(task_id)
                .ok_or_else(|| OrchestratorError::task_not_found(task_id))?;
            if !entry.task.status.is_active() {
                return Ok(false);
            }

            entry.invalidate();
            let from = entry.task.status;
            entry.task.status = TaskStatus::Paused;
            StructuredLogger::log_task_transition(
                task_id,
                &entry.task.name,
                from.as_str(),
                TaskStatus::Paused.as_str(),
            );
            entry.snapshot()
        };

        self.persist(&snapshot, revision).await;
        self.emit(EventKind::TaskPaused, &snapshot);
        Ok(true)
    }

    /// 恢复暂停的任务，以一次全新的执行重新派发
    pub async fn resume_task(&self, task_id: &str) -> OrchestratorResult<bool> {
        if !self.is_running() {
            return Ok(false);
        }

        let (snapshot, revision, epoch) = {
            let mut tasks = self.tasks.write().await;
            let entry = tasks
                .get_mut(task_id)
                .ok_or_else(|| OrchestratorError::task_not_found(task_id))?;
            if entry.task.status != TaskStatus::Paused {
                return Ok(false);
            }

            let epoch = entry.rearm();
            entry.task.status = TaskStatus::Running;
            StructuredLogger::log_task_transition(
                task_id,
                &entry.task.name,
                TaskStatus::Paused.as_str(),
                TaskStatus::Running.as_str(),
            );
            let (snapshot, revision) = entry.snapshot();
            (snapshot, revision, epoch)
        };

        self.persist(&snapshot, revision).await;
        self.emit(EventKind::TaskResumed, &snapshot);
        self.spawn_execution(task_id.to_string(), epoch);
        Ok(true)
    }

    pub async fn get_task(&self, task_id: &str) -> Option<Task> {
        let tasks = self.tasks.read().await;
        tasks.get(task_id).map(|entry| entry.task.clone())
    }

    /// 按创建时间排序的任务快照
    pub async fn list_tasks(&self, status: Option<TaskStatus>) -> Vec<Task> {
        let tasks = self.tasks.read().await;
        let mut list: Vec<Task> = tasks
            .values()
            .filter(|entry| status.map_or(true, |s| entry.task.status == s))
            .map(|entry| entry.task.clone())
            .collect();
        list.sort_by_key(|task| task.created_at);
        list
    }

    pub async fn delete_task(&self, task_id: &str) -> OrchestratorResult<bool> {
        {
            let mut tasks = self.tasks.write().await;
            let Some(entry) = tasks.get(task_id) else {
                return Ok(false);
            };
            if entry.task.status.is_active() {
                return Err(OrchestratorError::invalid_state(format!(
                    "{} 正在运行，不能删除",
                    entry.task.entity_description()
                )));
            }
            if let Some(mut entry) = tasks.remove(task_id) {
                entry.invalidate();
            }
            self.metrics.update_task_registry_size(tasks.len());
        }

        self.remove_snapshot(task_id).await;
        Ok(true)
    }

    /// 轮询直到任务进入终态或超过 `max_wait`，返回最新快照
    pub async fn wait_for_task(&self, task_id: &str, max_wait: Duration) -> OrchestratorResult<Task> {
        let deadline = tokio::time::Instant::now() + max_wait;
        loop {
            let task = self
                .get_task(task_id)
                .await
                .ok_or_else(|| OrchestratorError::task_not_found(task_id))?;
            if task.is_terminal() || tokio::time::Instant::now() >= deadline {
                return Ok(task);
            }
            tokio::time::sleep(WAIT_POLL_INTERVAL).await;
        }
    }

    /// 清理结束时间早于保留窗口的终态任务
    pub async fn cleanup_completed(&self, retention: Duration) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(retention).unwrap_or_else(|_| chrono::Duration::days(36500));

        let removed: Vec<String> = {
            let mut tasks = self.tasks.write().await;
            let expired: Vec<String> = tasks
                .values()
                .filter(|entry| {
                    entry.task.is_terminal()
                        && entry
                            .task
                            .completed_at
                            .unwrap_or(entry.task.created_at)
                            <= cutoff
                })
                .map(|entry| entry.task.id.clone())
                .collect();
            for id in &expired {
                tasks.remove(id);
            }
            self.metrics.update_task_registry_size(tasks.len());
            expired
        };

        for id in &removed {
            self.remove_snapshot(id).await;
        }
        if !removed.is_empty() {
            info!("清理了 {} 个已结束的任务", removed.len());
        }
        removed.len()
    }

    pub async fn metrics(&self) -> TaskMetrics {
        let tasks = self.tasks.read().await;
        let mut metrics = TaskMetrics {
            total: tasks.len(),
            ..Default::default()
        };
        for entry in tasks.values() {
            metrics.total_retries += u64::from(entry.task.retry_count);
            match entry.task.status {
                TaskStatus::Pending => metrics.pending += 1,
                TaskStatus::Running => metrics.running += 1,
                TaskStatus::Retrying => metrics.retrying += 1,
                TaskStatus::Paused => metrics.paused += 1,
                TaskStatus::Completed => metrics.completed += 1,
                TaskStatus::Failed => metrics.failed += 1,
                TaskStatus::Timeout => metrics.timeout += 1,
                TaskStatus::Cancelled => metrics.cancelled += 1,
            }
        }
        metrics
    }

    pub async fn health(&self) -> ComponentHealth {
        let metrics = self.metrics().await;
        let running = self.is_running();
        ComponentHealth {
            status: if running {
                HealthLevel::Healthy
            } else {
                HealthLevel::Unhealthy
            },
            running,
            message: (!running).then(|| "任务管理器已停止".to_string()),
            details: json!({
                "total": metrics.total,
                "active": metrics.running + metrics.retrying,
                "terminal": metrics.terminal(),
                "failure_ratio": metrics.failure_ratio(),
                "available_blocking_workers": self.blocking_slots.available_permits(),
            }),
        }
    }

    /// 从存储中恢复任务历史
    ///
    /// 终态任务作为只读历史重新载入；非终态任务标记为失败并重新落盘。
    /// 损坏的快照会被跳过并记录警告。
    pub async fn restore(&self) -> OrchestratorResult<usize> {
        let Some(store) = &self.store else {
            return Ok(0);
        };

        let mut restored = 0;
        for id in store.list_ids().await? {
            let record = match store.load(&id).await {
                Ok(Some(record)) => record,
                Ok(None) => continue,
                Err(e) => {
                    warn!("跳过无法解析的任务快照 {}: {}", id, e);
                    continue;
                }
            };
            let mut task = match record.into_task() {
                Ok(task) => task,
                Err(e) => {
                    warn!("跳过无法还原的任务快照 {}: {}", id, e);
                    continue;
                }
            };

            let interrupted = !task.is_terminal();
            if interrupted {
                task.status = TaskStatus::Failed;
                task.completed_at = Some(Utc::now());
                task.last_error = Some(RESTART_INTERRUPTED.to_string());
                task.result = Some(TaskResult::failure(
                    RESTART_INTERRUPTED,
                    Duration::ZERO,
                    task.retry_count,
                ));
            }

            let entry = TaskEntry::new(task);
            if interrupted {
                self.persist(&entry.task, entry.revision).await;
            }
            let mut tasks = self.tasks.write().await;
            if !tasks.contains_key(&entry.task.id) {
                tasks.insert(entry.task.id.clone(), entry);
                restored += 1;
            }
        }

        info!("从存储中恢复了 {} 个任务", restored);
        self.metrics
            .update_task_registry_size(self.tasks.read().await.len());
        Ok(restored)
    }

    fn spawn_execution(&self, task_id: String, epoch: u64) {
        let manager = self.clone();
        tokio::spawn(async move { manager.run(task_id, epoch).await });
    }

    /// 单个任务的执行循环，重试严格串行
    async fn run(self, task_id: String, epoch: u64) {
        loop {
            let Some(dispatch) = self.dispatch_snapshot(&task_id, epoch).await else {
                return;
            };

            let span = TaskTracer::execute_task_span(&task_id, &dispatch.name, dispatch.attempt);
            let started = Instant::now();
            let outcome = self.invoke_attempt(&dispatch).instrument(span).await;
            let elapsed = started.elapsed();

            match self.apply_outcome(&task_id, epoch, outcome, elapsed).await {
                Next::Retry {
                    delay,
                    cancellation,
                } => {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancellation.cancelled() => {
                            debug!("任务 {} 的重试等待被中断", task_id);
                            return;
                        }
                    }
                    if !self.resume_after_backoff(&task_id, epoch).await {
                        return;
                    }
                }
                Next::Done => return,
            }
        }
    }

    async fn dispatch_snapshot(&self, task_id: &str, epoch: u64) -> Option<Dispatch> {
        let tasks = self.tasks.read().await;
        let entry = tasks.get(task_id)?;
        if entry.epoch != epoch || entry.task.status != TaskStatus::Running {
            return None;
        }
        Some(Dispatch {
            name: entry.task.name.clone(),
            call: entry.task.call.clone()?,
            timeout: entry.task.config.timeout,
            attempt: entry.task.retry_count,
            cancellation: entry.cancellation.clone(),
        })
    }

    async fn invoke_attempt(&self, dispatch: &Dispatch) -> OrchestratorResult<Value> {
        // 阻塞型调用先占用工作池名额
        let permit = if dispatch.call.invocable.is_blocking() {
            Some(
                Arc::clone(&self.blocking_slots)
                    .acquire_owned()
                    .await
                    .map_err(|e| OrchestratorError::TaskExecution(format!("阻塞工作池不可用: {e}")))?,
            )
        } else {
            None
        };

        let mut ctx = dispatch.call.context(dispatch.cancellation.clone());
        ctx.attempt = dispatch.attempt;
        let invocable = Arc::clone(&dispatch.call.invocable);
        let invocation = async move {
            match permit {
                // 名额随阻塞线程一起释放，超时只放弃等待结果
                Some(permit) => tokio::spawn(async move {
                    let result = invoke_guarded(&invocable, ctx).await;
                    drop(permit);
                    result
                })
                .await
                .unwrap_or_else(|e| Err(InvocationError::new(format!("阻塞调用异常终止: {e}")))),
                None => invoke_guarded(&invocable, ctx).await,
            }
        };

        let result = match dispatch.timeout {
            Some(limit) => match tokio::time::timeout(limit, invocation).await {
                Ok(result) => result,
                Err(_) => {
                    return Err(OrchestratorError::TaskTimeout {
                        timeout_ms: limit.as_millis() as u64,
                    })
                }
            },
            None => invocation.await,
        };
        result.map_err(|e| OrchestratorError::TaskExecution(e.to_string()))
    }

    async fn apply_outcome(
        &self,
        task_id: &str,
        epoch: u64,
        outcome: OrchestratorResult<Value>,
        elapsed: Duration,
    ) -> Next {
        let success = outcome.is_ok();
        let timed_out = outcome.as_ref().err().is_some_and(|e| e.is_timeout());

        let (snapshot, revision, kind, next) = {
            let mut tasks = self.tasks.write().await;
            let Some(entry) = tasks.get_mut(task_id) else {
                return Next::Done;
            };
            if entry.epoch != epoch || entry.task.status != TaskStatus::Running {
                debug!(
                    "丢弃过期的执行结果: {} (状态 {})",
                    entry.task.entity_description(),
                    entry.task.status
                );
                return Next::Done;
            }

            let cancellation = entry.cancellation.clone();
            let task = &mut entry.task;
            let (kind, next) = match outcome {
                Ok(data) => {
                    task.status = TaskStatus::Completed;
                    task.completed_at = Some(Utc::now());
                    task.result = Some(TaskResult::success(data, elapsed, task.retry_count));
                    (EventKind::TaskCompleted, Next::Done)
                }
                Err(err) => {
                    let message = err.to_string();
                    task.last_error = Some(message.clone());
                    if task.can_retry() {
                        let delay = RetryPolicy::from_task_config(&task.config)
                            .delay_for(task.retry_count);
                        task.status = TaskStatus::Retrying;
                        StructuredLogger::log_task_retry(
                            task_id,
                            &task.name,
                            task.retry_count + 1,
                            task.config.max_retries,
                            delay.as_millis() as u64,
                            &message,
                        );
                        (
                            EventKind::TaskRetrying,
                            Next::Retry {
                                delay,
                                cancellation,
                            },
                        )
                    } else {
                        let (status, kind) = if timed_out {
                            (TaskStatus::Timeout, EventKind::TaskTimeout)
                        } else {
                            (TaskStatus::Failed, EventKind::TaskFailed)
                        };
                        task.status = status;
                        task.completed_at = Some(Utc::now());
                        task.result =
                            Some(TaskResult::failure(message, elapsed, task.retry_count));
                        (kind, Next::Done)
                    }
                }
            };
            let (snapshot, revision) = entry.snapshot();
            (snapshot, revision, kind, next)
        };

        self.metrics
            .record_task_execution(&snapshot.name, success, elapsed.as_secs_f64());
        if timed_out {
            self.metrics.record_task_timeout(&snapshot.name);
        }
        if matches!(next, Next::Retry { .. }) {
            self.metrics
                .record_task_retry(&snapshot.name, snapshot.retry_count + 1);
        }
        if snapshot.is_terminal() {
            StructuredLogger::log_task_execution_complete(
                &snapshot.id,
                &snapshot.name,
                success,
                elapsed.as_millis() as u64,
                snapshot.retry_count,
                snapshot.last_error.as_deref(),
            );
        }

        self.persist(&snapshot, revision).await;
        self.emit(kind, &snapshot);
        next
    }

    /// 退避结束后重新检查状态与依赖，返回是否继续执行
    async fn resume_after_backoff(&self, task_id: &str, epoch: u64) -> bool {
        let (snapshot, revision, regressed) = {
            let mut tasks = self.tasks.write().await;
            let Some(entry) = tasks.get(task_id) else {
                return false;
            };
            if entry.epoch != epoch || entry.task.status != TaskStatus::Retrying {
                return false;
            }
            let blocking = Self::blocking_dependencies(&tasks, &entry.task.config.dependencies);

            let Some(entry) = tasks.get_mut(task_id) else {
                return false;
            };
            let task = &mut entry.task;
            task.retry_count += 1;

            let regressed = if blocking.is_empty() {
                task.status = TaskStatus::Running;
                StructuredLogger::log_task_transition(
                    task_id,
                    &task.name,
                    TaskStatus::Retrying.as_str(),
                    TaskStatus::Running.as_str(),
                );
                false
            } else {
                let err = OrchestratorError::DependencyUnsatisfied {
                    task_id: task_id.to_string(),
                    blocking,
                };
                warn!("{} 的依赖已失效，不再重试: {}", task.entity_description(), err);
                task.status = TaskStatus::Failed;
                task.completed_at = Some(Utc::now());
                task.last_error = Some(err.to_string());
                task.result = Some(TaskResult::failure(
                    err.to_string(),
                    Duration::ZERO,
                    task.retry_count,
                ));
                true
            };
            let (snapshot, revision) = entry.snapshot();
            (snapshot, revision, regressed)
        };

        self.persist(&snapshot, revision).await;
        if regressed {
            self.emit(EventKind::TaskFailed, &snapshot);
        }
        !regressed
    }

    fn elapsed_since_start(task: &Task) -> Duration {
        task.started_at
            .and_then(|started| (Utc::now() - started).to_std().ok())
            .unwrap_or_default()
    }

    async fn write_slot(&self, task_id: &str) -> Arc<Mutex<u64>> {
        let mut written = self.written.lock().await;
        Arc::clone(written.entry(task_id.to_string()).or_default())
    }

    /// 按 revision 顺序落盘；比已写入版本旧的快照直接跳过
    async fn persist(&self, task: &Task, revision: u64) {
        let Some(store) = &self.store else {
            return;
        };
        let slot = self.write_slot(&task.id).await;
        let mut last_written = slot.lock().await;
        if *last_written >= revision {
            debug!(
                "跳过过期的任务快照: {} (revision {} <= {})",
                task.entity_description(),
                revision,
                *last_written
            );
            return;
        }
        match store.save(&TaskRecord::from_task(task)).await {
            Ok(()) => *last_written = revision,
            Err(e) => warn!("保存任务快照失败 {}: {}", task.entity_description(), e),
        }
    }

    /// 删除任务快照，并阻止仍在排队的旧写入重新生成文件
    async fn remove_snapshot(&self, task_id: &str) {
        let Some(store) = &self.store else {
            return;
        };
        let slot = self.write_slot(task_id).await;
        let mut last_written = slot.lock().await;
        *last_written = u64::MAX;
        if let Err(e) = store.remove(task_id).await {
            warn!("删除任务快照失败 {}: {}", task_id, e);
        }
        drop(last_written);
        self.written.lock().await.remove(task_id);
    }

    fn emit(&self, kind: EventKind, task: &Task) {
        let event = EngineEvent::new(
            kind,
            &task.id,
            &task.name,
            json!({
                "status": task.status.as_str(),
                "priority": task.config.priority.as_str(),
                "retry_count": task.retry_count,
                "error": task.last_error,
                "data": task.result.as_ref().and_then(|r| r.data.clone()),
            }),
        );
        let failures = self.callbacks.emit(&event);
        if failures > 0 {
            self.metrics.record_callback_failures(failures);
            StructuredLogger::log_callback_failure(kind.as_str(), &task.id, failures);
        }
    }
}
