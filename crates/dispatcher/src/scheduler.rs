//! 定时任务调度
//!
//! `CronHandler` 持有定时任务注册表，每个 tick 把到期的条目派发出去。
//! 单个条目执行失败只通过回调上报，不会中断调度循环。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use orchestrator_config::CronConfig;
use orchestrator_domain::{
    invoke_guarded, Call, CallbackRegistry, CancellationToken, ComponentHealth, CronMetrics,
    EngineEvent, EventKind, HealthLevel,
};
use orchestrator_errors::{OrchestratorError, OrchestratorResult};
use orchestrator_observability::{MetricsCollector, StructuredLogger, TaskTracer};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

use crate::cron_utils::CronExpression;

/// 绑定到 CRON 表达式的可调用对象
#[derive(Debug, Clone)]
pub struct ScheduledTask {
    pub id: String,
    pub name: String,
    pub cron_expression: CronExpression,
    pub call: Call,
    pub enabled: bool,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    pub run_count: u64,
    pub max_runs: Option<u64>,
    pub timeout: Option<Duration>,
    /// 上一次触发仍在执行
    pub running: bool,
    pub failed_runs: u64,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ScheduledTask {
    pub fn runs_exhausted(&self) -> bool {
        self.max_runs.is_some_and(|max| self.run_count >= max)
    }

    fn disable(&mut self) {
        self.enabled = false;
        self.next_run = None;
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct NextRun {
    pub id: String,
    pub name: String,
    pub next_run: DateTime<Utc>,
}

struct Firing {
    id: String,
    name: String,
    call: Call,
    timeout: Option<Duration>,
}

struct LoopHandle {
    shutdown_tx: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

#[derive(Clone)]
pub struct CronHandler {
    config: CronConfig,
    entries: Arc<RwLock<HashMap<String, ScheduledTask>>>,
    callbacks: CallbackRegistry,
    metrics: Arc<MetricsCollector>,
    scheduler_loop: Arc<Mutex<Option<LoopHandle>>>,
}

impl CronHandler {
    pub fn new(config: CronConfig, metrics: Arc<MetricsCollector>) -> Self {
        Self {
            config,
            entries: Arc::new(RwLock::new(HashMap::new())),
            callbacks: CallbackRegistry::new(),
            metrics,
            scheduler_loop: Arc::new(Mutex::new(None)),
        }
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

    fn next_after(&self, expr: &CronExpression, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        expr.next_run_bounded(after, u32::try_from(self.config.max_scan_iterations).unwrap_or(u32::MAX))
    }

    pub async fn add_scheduled_task(
        &self,
        name: impl Into<String>,
        cron_expr: &str,
        call: Call,
        max_runs: Option<u64>,
        timeout: Option<Duration>,
    ) -> OrchestratorResult<String> {
        let name = name.into();
        let cron_expression = CronExpression::parse(cron_expr)?;
        if max_runs == Some(0) {
            return Err(OrchestratorError::invalid_config("max_runs 必须大于0"));
        }
        if timeout.is_some_and(|t| t.is_zero()) {
            return Err(OrchestratorError::invalid_config("timeout 不能为 0"));
        }
        let next_run = self
            .next_after(&cron_expression, Utc::now())
            .ok_or_else(|| OrchestratorError::invalid_cron(cron_expr, "无法计算下次执行时间"))?;

        let entry = ScheduledTask {
            id: Uuid::new_v4().to_string(),
            name,
            cron_expression,
            call,
            enabled: true,
            last_run: None,
            next_run: Some(next_run),
            run_count: 0,
            max_runs,
            timeout,
            running: false,
            failed_runs: 0,
            last_error: None,
            created_at: Utc::now(),
        };
        let id = entry.id.clone();

        info!(
            "添加定时任务 '{}' (ID: {}), 表达式 '{}', 下次执行 {}",
            entry.name,
            id,
            entry.cron_expression,
            next_run.format("%Y-%m-%d %H:%M:%S UTC")
        );
        self.entries.write().await.insert(id.clone(), entry);
        Ok(id)
    }

    /// 启用条目并重新计算下次执行时间；已达到最大执行次数时返回 `false`
    ///
    /// 对已启用的条目同样会从当前时间重新计算。
    pub async fn enable(&self, id: &str) -> OrchestratorResult<bool> {
        let mut entries = self.entries.write().await;
        let entry = entries
            .get_mut(id)
            .ok_or_else(|| OrchestratorError::scheduled_task_not_found(id))?;

        if entry.runs_exhausted() {
            debug!("定时任务 {} 已达到最大执行次数，不能启用", id);
            return Ok(false);
        }
        entry.next_run = self.next_after(&entry.cron_expression, Utc::now());
        entry.enabled = entry.next_run.is_some();
        Ok(entry.enabled)
    }

    /// 禁用条目，重复调用不产生任何变化；返回是否发生了状态变化
    pub async fn disable(&self, id: &str) -> OrchestratorResult<bool> {
        let mut entries = self.entries.write().await;
        let entry = entries
            .get_mut(id)
            .ok_or_else(|| OrchestratorError::scheduled_task_not_found(id))?;

        if !entry.enabled {
            return Ok(false);
        }
        entry.disable();
        Ok(true)
    }

    pub async fn remove_scheduled_task(&self, id: &str) -> bool {
        let removed = self.entries.write().await.remove(id).is_some();
        if removed {
            info!("移除定时任务: {}", id);
        }
        removed
    }

    pub async fn get_scheduled_task(&self, id: &str) -> Option<ScheduledTask> {
        self.entries.read().await.get(id).cloned()
    }

    pub async fn list_scheduled_tasks(&self, enabled_only: bool) -> Vec<ScheduledTask> {
        let entries = self.entries.read().await;
        let mut list: Vec<ScheduledTask> = entries
            .values()
            .filter(|entry| !enabled_only || entry.enabled)
            .cloned()
            .collect();
        list.sort_by_key(|entry| entry.created_at);
        list
    }

    /// 按下次执行时间升序排列的前 `count` 个启用条目
    pub async fn get_next_runs(&self, count: usize) -> Vec<NextRun> {
        let entries = self.entries.read().await;
        let mut runs: Vec<NextRun> = entries
            .values()
            .filter(|entry| entry.enabled)
            .filter_map(|entry| {
                entry.next_run.map(|next_run| NextRun {
                    id: entry.id.clone(),
                    name: entry.name.clone(),
                    next_run,
                })
            })
            .collect();
        runs.sort_by_key(|run| run.next_run);
        runs.truncate(count);
        runs
    }

    /// 立即执行一次，不影响调度时间；返回本次执行是否成功
    pub async fn run_now(&self, id: &str) -> OrchestratorResult<bool> {
        let firing = {
            let mut entries = self.entries.write().await;
            let entry = entries
                .get_mut(id)
                .ok_or_else(|| OrchestratorError::scheduled_task_not_found(id))?;

            if entry.running {
                return Err(OrchestratorError::invalid_state(format!(
                    "定时任务 '{}' 正在执行",
                    entry.name
                )));
            }
            if entry.runs_exhausted() {
                debug!("定时任务 {} 已达到最大执行次数，忽略立即执行", id);
                return Ok(false);
            }
            Self::begin_fire(entry, Utc::now())
        };

        Ok(self.fire(firing).await)
    }

    /// 标记一次触发：计数、记录时间，达到最大次数时禁用
    fn begin_fire(entry: &mut ScheduledTask, now: DateTime<Utc>) -> Firing {
        entry.running = true;
        entry.run_count += 1;
        entry.last_run = Some(now);
        if entry.runs_exhausted() {
            info!(
                "定时任务 '{}' 已执行 {} 次，达到最大执行次数，自动禁用",
                entry.name, entry.run_count
            );
            entry.disable();
        }
        Firing {
            id: entry.id.clone(),
            name: entry.name.clone(),
            call: entry.call.clone(),
            timeout: entry.timeout,
        }
    }

    /// 执行一个调度 tick，返回本次触发的执行句柄
    pub async fn process_due_tasks(&self, now: DateTime<Utc>) -> Vec<JoinHandle<bool>> {
        let started = Instant::now();
        let (firings, enabled) = {
            let mut entries = self.entries.write().await;
            let mut firings = Vec::new();
            for entry in entries.values_mut() {
                if !entry.enabled || entry.running {
                    continue;
                }
                let Some(next_run) = entry.next_run else {
                    continue;
                };
                if next_run > now {
                    continue;
                }
                if entry.runs_exhausted() {
                    entry.disable();
                    continue;
                }

                // 在触发时推进下次执行时间，错过的周期不会补跑
                entry.next_run = self.next_after(&entry.cron_expression, now);
                let firing = Self::begin_fire(entry, now);
                if entry.enabled && entry.next_run.is_none() {
                    warn!("定时任务 '{}' 无法计算下次执行时间，已禁用", entry.name);
                    entry.disable();
                }
                firings.push(firing);
            }
            let enabled = entries.values().filter(|e| e.enabled).count();
            (firings, enabled)
        };

        self.metrics
            .record_cron_tick(started.elapsed().as_secs_f64(), enabled);

        firings
            .into_iter()
            .map(|firing| {
                let handler = self.clone();
                tokio::spawn(async move { handler.fire(firing).await })
            })
            .collect()
    }

    async fn fire(&self, firing: Firing) -> bool {
        let span = TaskTracer::cron_fire_span(&firing.id, &firing.name);
        let outcome = async {
            let ctx = firing.call.context(CancellationToken::new());
            let invocation = invoke_guarded(&firing.call.invocable, ctx);
            match firing.timeout {
                Some(limit) => match tokio::time::timeout(limit, invocation).await {
                    Ok(result) => result.map_err(|e| e.to_string()),
                    Err(_) => Err(OrchestratorError::TaskTimeout {
                        timeout_ms: limit.as_millis() as u64,
                    }
                    .to_string()),
                },
                None => invocation.await.map_err(|e| e.to_string()),
            }
        }
        .instrument(span)
        .await;

        let success = outcome.is_ok();
        let snapshot = {
            let mut entries = self.entries.write().await;
            entries.get_mut(&firing.id).map(|entry| {
                entry.running = false;
                match &outcome {
                    Ok(_) => entry.last_error = None,
                    Err(e) => {
                        entry.failed_runs += 1;
                        entry.last_error = Some(e.clone());
                    }
                }
                (entry.run_count, entry.next_run)
            })
        };
        let (run_count, next_run) = snapshot.unwrap_or((0, None));

        self.metrics.record_cron_fire(&firing.name, success);
        match &outcome {
            Ok(_) => StructuredLogger::log_cron_fire(&firing.id, &firing.name, run_count, next_run),
            Err(e) => StructuredLogger::log_cron_fire_failed(&firing.id, &firing.name, e),
        }

        let (data, error) = match outcome {
            Ok(data) => (data, None),
            Err(e) => (Value::Null, Some(e)),
        };
        let payload = json!({
            "success": success,
            "run_count": run_count,
            "next_run": next_run,
            "data": data,
            "error": error,
        });
        self.emit(EventKind::ScheduledTaskExecuted, &firing, payload.clone());
        if !success {
            self.emit(EventKind::ScheduledTaskFailed, &firing, payload);
        }
        success
    }

    fn emit(&self, kind: EventKind, firing: &Firing, payload: Value) {
        let event = EngineEvent::new(kind, &firing.id, &firing.name, payload);
        let failures = self.callbacks.emit(&event);
        if failures > 0 {
            self.metrics.record_callback_failures(failures);
            StructuredLogger::log_callback_failure(kind.as_str(), &firing.id, failures);
        }
    }

    /// 启动调度循环，重复调用不会启动第二个循环
    pub async fn start(&self) {
        let mut scheduler_loop = self.scheduler_loop.lock().await;
        if scheduler_loop.is_some() {
            debug!("定时任务调度循环已在运行");
            return;
        }

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let handler = self.clone();
        let tick = self.config.tick_interval();

        let handle = tokio::spawn(async move {
            let mut ticker = interval(tick);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        // 触发的执行在后台运行，循环不等待
                        handler.process_due_tasks(Utc::now()).await;
                    }
                    _ = &mut shutdown_rx => {
                        info!("定时任务调度循环收到停止信号");
                        break;
                    }
                }
            }
        });

        *scheduler_loop = Some(LoopHandle {
            shutdown_tx,
            handle,
        });
        StructuredLogger::log_component_status(
            "cron_handler",
            "started",
            Some(&format!("tick 间隔 {}ms", tick.as_millis())),
        );
    }

    pub async fn stop(&self) {
        let Some(LoopHandle {
            shutdown_tx,
            handle,
        }) = self.scheduler_loop.lock().await.take()
        else {
            return;
        };

        let _ = shutdown_tx.send(());
        if let Err(e) = handle.await {
            warn!("等待定时任务调度循环退出时出错: {}", e);
        }
        StructuredLogger::log_component_status("cron_handler", "stopped", None);
    }

    pub async fn is_loop_running(&self) -> bool {
        self.scheduler_loop.lock().await.is_some()
    }

    /// 移除已达到最大执行次数、且最后一次执行早于保留窗口的条目
    pub async fn cleanup_exhausted(&self, retention: Duration) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(retention).unwrap_or_else(|_| chrono::Duration::days(36500));
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| {
            !(entry.runs_exhausted()
                && !entry.running
                && entry.last_run.unwrap_or(entry.created_at) <= cutoff)
        });
        before - entries.len()
    }

    pub async fn metrics(&self) -> CronMetrics {
        let loop_running = self.is_loop_running().await;
        let entries = self.entries.read().await;
        let mut metrics = CronMetrics {
            total: entries.len(),
            loop_running,
            ..Default::default()
        };
        for entry in entries.values() {
            if entry.enabled {
                metrics.enabled += 1;
            } else {
                metrics.disabled += 1;
            }
            if entry.running {
                metrics.executing += 1;
            }
            metrics.total_runs += entry.run_count;
            metrics.failed_runs += entry.failed_runs;
        }
        metrics
    }

    /// 调度循环未运行时为降级状态
    pub async fn health(&self) -> ComponentHealth {
        let metrics = self.metrics().await;
        let next = self.get_next_runs(1).await;
        ComponentHealth {
            status: if metrics.loop_running {
                HealthLevel::Healthy
            } else {
                HealthLevel::Degraded
            },
            running: metrics.loop_running,
            message: (!metrics.loop_running).then(|| "调度循环未运行".to_string()),
            details: json!({
                "total": metrics.total,
                "enabled": metrics.enabled,
                "executing": metrics.executing,
                "next_run": next.first().map(|n| n.next_run),
            }),
        }
    }
}
