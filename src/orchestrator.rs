//! 编排器
//!
//! 持有任务管理器、工作流引擎和定时任务处理器，把三者的事件汇入统一的事件总线，
//! 并负责周期性清理与健康检查。调用方显式构造并持有实例，没有进程级全局状态。

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use orchestrator_config::AppConfig;
use orchestrator_dispatcher::CronHandler;
use orchestrator_domain::{
    from_async_fn, Call, ComponentHealth, CronMetrics, HealthLevel, Invocable, InvocationContext,
    InvocationError, TaskConfig, TaskMetrics, WorkflowMetrics,
};
use orchestrator_errors::{OrchestratorError, OrchestratorResult};
use orchestrator_observability::{EventBus, EventStats, MetricsCollector, StructuredLogger, TaskTracer};
use orchestrator_worker::TaskManager;
use orchestrator_workflow::WorkflowEngine;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn, Instrument};

/// 失败率判定至少需要的终态任务数
const MIN_TERMINAL_FOR_RATIO: usize = 10;

#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorMetrics {
    pub tasks: TaskMetrics,
    pub workflows: WorkflowMetrics,
    pub cron: CronMetrics,
    pub events: EventStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorStatus {
    pub running: bool,
    pub components: BTreeMap<String, ComponentHealth>,
    pub metrics: OrchestratorMetrics,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthLevel,
    pub components: BTreeMap<String, ComponentHealth>,
    pub checked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct CleanupReport {
    pub tasks: usize,
    pub workflows: usize,
    pub scheduled_tasks: usize,
}

impl CleanupReport {
    pub fn total(&self) -> usize {
        self.tasks + self.workflows + self.scheduled_tasks
    }
}

struct CleanupLoop {
    shutdown_tx: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

#[derive(Clone)]
pub struct Orchestrator {
    config: AppConfig,
    metrics: Arc<MetricsCollector>,
    task_manager: TaskManager,
    workflow_engine: WorkflowEngine,
    cron_handler: CronHandler,
    events: EventBus,
    running: Arc<AtomicBool>,
    cleanup_loop: Arc<Mutex<Option<CleanupLoop>>>,
}

impl Orchestrator {
    pub fn new(config: AppConfig) -> Self {
        let metrics = Arc::new(MetricsCollector::new());
        let task_manager = TaskManager::new(config.task_manager.clone(), Arc::clone(&metrics));
        let workflow_engine = WorkflowEngine::new(config.workflow.clone(), Arc::clone(&metrics));
        let cron_handler = CronHandler::new(config.cron.clone(), Arc::clone(&metrics));
        let events = EventBus::new(config.orchestrator.event_history_size, Arc::clone(&metrics));

        let bus = events.clone();
        task_manager.on_any(move |event| {
            bus.publish(event);
            Ok(())
        });
        let bus = events.clone();
        workflow_engine.on_any(move |event| {
            bus.publish(event);
            Ok(())
        });
        let bus = events.clone();
        cron_handler.on_any(move |event| {
            bus.publish(event);
            Ok(())
        });

        Self {
            config,
            metrics,
            task_manager,
            workflow_engine,
            cron_handler,
            events,
            running: Arc::new(AtomicBool::new(false)),
            cleanup_loop: Arc::new(Mutex::new(None)),
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn task_manager(&self) -> &TaskManager {
        &self.task_manager
    }

    pub fn workflow_engine(&self) -> &WorkflowEngine {
        &self.workflow_engine
    }

    pub fn cron_handler(&self) -> &CronHandler {
        &self.cron_handler
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// 恢复持久化的任务并启动各组件，重复调用没有效果
    pub async fn start(&self) -> OrchestratorResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            debug!("编排器已在运行");
            return Ok(());
        }

        info!("启动编排器");
        let restored = match self.task_manager.restore().await {
            Ok(count) => count,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };
        if restored > 0 {
            info!("恢复了 {} 个历史任务", restored);
        }

        self.task_manager.start().await;
        self.cron_handler.start().await;
        self.start_cleanup_loop().await;

        StructuredLogger::log_component_status(
            "orchestrator",
            "started",
            Some(&format!("restored {restored} tasks")),
        );
        Ok(())
    }

    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            debug!("编排器未在运行");
            return;
        }

        info!("停止编排器");
        if let Some(CleanupLoop {
            shutdown_tx,
            handle,
        }) = self.cleanup_loop.lock().await.take()
        {
            let _ = shutdown_tx.send(());
            if let Err(e) = handle.await {
                warn!("等待清理循环退出时出错: {}", e);
            }
        }
        self.cron_handler.stop().await;
        self.task_manager.stop().await;
        StructuredLogger::log_component_status("orchestrator", "stopped", None);
    }

    async fn start_cleanup_loop(&self) {
        let mut cleanup_loop = self.cleanup_loop.lock().await;
        if cleanup_loop.is_some() {
            return;
        }

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let orchestrator = self.clone();
        let period = self.config.orchestrator.cleanup_interval();

        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // 第一次 tick 立即完成，启动时不清理
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        orchestrator.run_cleanup().await;
                    }
                    _ = &mut shutdown_rx => {
                        debug!("清理循环收到停止信号");
                        break;
                    }
                }
            }
        });

        *cleanup_loop = Some(CleanupLoop {
            shutdown_tx,
            handle,
        });
    }

    /// 立即执行一次清理，移除超过保留时长的已结束实体
    pub async fn run_cleanup(&self) -> CleanupReport {
        let retention = self.config.orchestrator.retention();
        async {
            let report = CleanupReport {
                tasks: self.task_manager.cleanup_completed(retention).await,
                workflows: self.workflow_engine.cleanup_completed(retention).await,
                scheduled_tasks: self.cron_handler.cleanup_exhausted(retention).await,
            };
            self.metrics.record_cleanup(report.total());
            if report.total() > 0 {
                info!(
                    "清理完成: 任务 {}, 工作流 {}, 定时任务 {}",
                    report.tasks, report.workflows, report.scheduled_tasks
                );
            }
            report
        }
        .instrument(TaskTracer::cleanup_span())
        .await
    }

    /// 注册定时任务，参数在每次触发时原样传入
    #[allow(clippy::too_many_arguments)]
    pub async fn create_scheduled_task(
        &self,
        name: impl Into<String>,
        cron_expr: &str,
        invocable: Arc<dyn Invocable>,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
        max_runs: Option<u64>,
        timeout: Option<Duration>,
    ) -> OrchestratorResult<String> {
        let call = Call::new(invocable).with_args(args).with_kwargs(kwargs);
        self.cron_handler
            .add_scheduled_task(name, cron_expr, call, max_runs, timeout)
            .await
    }

    /// 创建任务但不启动；未给出配置时使用配置文件中的默认重试策略
    pub async fn create_workflow_task(
        &self,
        name: impl Into<String>,
        invocable: Arc<dyn Invocable>,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
        config: Option<TaskConfig>,
    ) -> OrchestratorResult<String> {
        let call = Call::new(invocable).with_args(args).with_kwargs(kwargs);
        let config = config.unwrap_or_else(|| self.task_manager.default_task_config());
        self.task_manager.create_task(name, call, config).await
    }

    /// 创建并立即启动任务；依赖未满足时任务保持 Pending
    pub async fn submit_task(
        &self,
        name: impl Into<String>,
        invocable: Arc<dyn Invocable>,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
        config: Option<TaskConfig>,
    ) -> OrchestratorResult<String> {
        let task_id = self
            .create_workflow_task(name, invocable, args, kwargs, config)
            .await?;
        if !self.task_manager.start_task(&task_id, false).await? {
            warn!("任务 {} 已创建但未能启动", task_id);
        }
        Ok(task_id)
    }

    pub async fn execute_workflow(
        &self,
        workflow_id: &str,
        variables: Option<HashMap<String, Value>>,
    ) -> OrchestratorResult<bool> {
        self.workflow_engine
            .execute_workflow(workflow_id, variables)
            .await
    }

    /// 按 CRON 表达式周期性运行工作流
    ///
    /// 每次触发从模板复制出新的工作流实例执行，模板本身保持未执行状态。
    pub async fn create_scheduled_workflow(
        &self,
        name: impl Into<String>,
        cron_expr: &str,
        workflow_id: &str,
    ) -> OrchestratorResult<String> {
        if self.workflow_engine.get_workflow(workflow_id).await.is_none() {
            return Err(OrchestratorError::workflow_not_found(workflow_id));
        }

        let engine = self.workflow_engine.clone();
        let template_id = workflow_id.to_string();
        let trigger = from_async_fn(
            format!("workflow:{workflow_id}"),
            move |ctx: InvocationContext| {
                let engine = engine.clone();
                let template_id = template_id.clone();
                async move {
                    let run_id = engine
                        .clone_workflow(&template_id)
                        .await
                        .map_err(|e| InvocationError::new(e.to_string()))?;
                    let variables = (!ctx.variables.is_empty()).then_some(ctx.variables);
                    let success = engine
                        .execute_workflow(&run_id, variables)
                        .await
                        .map_err(|e| InvocationError::new(e.to_string()))?;
                    if !success {
                        return Err(InvocationError::new(format!("工作流运行 {run_id} 未成功完成")));
                    }
                    Ok(json!({ "workflow_id": run_id, "success": success }))
                }
            },
        );

        self.cron_handler
            .add_scheduled_task(name, cron_expr, Call::new(trigger), None, None)
            .await
    }

    pub async fn get_metrics(&self) -> OrchestratorMetrics {
        OrchestratorMetrics {
            tasks: self.task_manager.metrics().await,
            workflows: self.workflow_engine.metrics().await,
            cron: self.cron_handler.metrics().await,
            events: self.events.stats(),
        }
    }

    pub async fn get_status(&self) -> OrchestratorStatus {
        OrchestratorStatus {
            running: self.is_running(),
            components: self.component_health().await,
            metrics: self.get_metrics().await,
        }
    }

    /// 未运行为 unhealthy；任一组件降级为 degraded
    pub async fn health_check(&self) -> HealthReport {
        let components = self.component_health().await;
        let status = if self.is_running() {
            components
                .values()
                .fold(HealthLevel::Healthy, |acc, c| acc.worst(c.status))
        } else {
            HealthLevel::Unhealthy
        };

        HealthReport {
            status,
            components,
            checked_at: Utc::now(),
        }
    }

    async fn component_health(&self) -> BTreeMap<String, ComponentHealth> {
        let mut tasks = self.task_manager.health().await;
        let task_metrics = self.task_manager.metrics().await;
        let ratio = task_metrics.failure_ratio();
        if task_metrics.terminal() >= MIN_TERMINAL_FOR_RATIO
            && ratio > self.config.orchestrator.degraded_failure_ratio
        {
            tasks.status = tasks.status.worst(HealthLevel::Degraded);
            tasks.message = Some(format!("任务失败率过高: {:.0}%", ratio * 100.0));
        }

        let mut components = BTreeMap::new();
        components.insert("task_manager".to_string(), tasks);
        components.insert(
            "workflow_engine".to_string(),
            self.workflow_engine.health().await,
        );
        components.insert("cron_handler".to_string(), self.cron_handler.health().await);
        components
    }
}
