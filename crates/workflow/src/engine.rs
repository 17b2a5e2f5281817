//! 工作流引擎
//!
//! 每轮计算就绪集合（依赖全部完成的 Pending 步骤）并并发执行，
//! 直到所有步骤完成或某个步骤在重试耗尽后失败。
//! 暂停/取消与任务管理器一样通过 epoch 使在途结果失效。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::future::join_all;
use orchestrator_config::WorkflowConfig;
use orchestrator_domain::invocable::sleep;
use orchestrator_domain::{
    invoke_guarded, Call, CallbackRegistry, CancellationToken, ComponentHealth, EngineEvent,
    EventKind, StepStatus, StepType, Workflow, WorkflowContext, WorkflowMetrics, WorkflowStatus,
    WorkflowStep,
};
use orchestrator_errors::{OrchestratorError, OrchestratorResult};
use orchestrator_observability::{MetricsCollector, StructuredLogger, TaskTracer};
use orchestrator_worker::RetryPolicy;
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::{debug, info, warn, Instrument};

use crate::dag;

/// 添加步骤时的可选参数
#[derive(Debug, Clone, Default)]
pub struct StepOptions {
    pub dependencies: Vec<String>,
    /// 为空时使用配置中的默认值
    pub max_retries: Option<u32>,
    pub timeout: Option<Duration>,
}

impl StepOptions {
    pub fn depends_on<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = dependencies.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

struct WorkflowEntry {
    workflow: Workflow,
    epoch: u64,
    cancellation: CancellationToken,
}

impl WorkflowEntry {
    fn invalidate(&mut self) {
        self.epoch += 1;
        self.cancellation.cancel();
    }

    fn rearm(&mut self) -> u64 {
        self.epoch += 1;
        self.cancellation = CancellationToken::new();
        self.epoch
    }
}

struct StepDispatch {
    workflow_id: String,
    step_id: String,
    name: String,
    step_type: StepType,
    call: Call,
    /// 绑定参数之后追加依赖步骤的结果
    args: Vec<Value>,
    variables: HashMap<String, Value>,
    max_retries: u32,
    timeout: Option<Duration>,
    cancellation: CancellationToken,
}

struct StepOutcome {
    step_id: String,
    result: OrchestratorResult<Value>,
    attempts: u32,
}

enum Round {
    Dispatch(Vec<StepDispatch>),
    Finished(bool),
}

#[derive(Clone)]
pub struct WorkflowEngine {
    config: WorkflowConfig,
    workflows: Arc<RwLock<HashMap<String, WorkflowEntry>>>,
    callbacks: CallbackRegistry,
    metrics: Arc<MetricsCollector>,
}

impl WorkflowEngine {
    pub fn new(config: WorkflowConfig, metrics: Arc<MetricsCollector>) -> Self {
        Self {
            config,
            workflows: Arc::new(RwLock::new(HashMap::new())),
            callbacks: CallbackRegistry::new(),
            metrics,
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

    pub async fn create_workflow(&self, name: impl Into<String>) -> String {
        let workflow = Workflow::new(name);
        let id = workflow.id.clone();
        info!("创建工作流 '{}' (ID: {})", workflow.name, id);
        self.workflows.write().await.insert(
            id.clone(),
            WorkflowEntry {
                workflow,
                epoch: 0,
                cancellation: CancellationToken::new(),
            },
        );
        id
    }

    pub async fn add_task_step(
        &self,
        workflow_id: &str,
        name: impl Into<String>,
        call: Call,
        options: StepOptions,
    ) -> OrchestratorResult<String> {
        self.add_step(workflow_id, name.into(), StepType::Task, call, options)
            .await
    }

    /// 条件步骤的可调用对象必须返回布尔值，分支由调用方通过依赖关系组织
    pub async fn add_condition_step(
        &self,
        workflow_id: &str,
        name: impl Into<String>,
        call: Call,
        options: StepOptions,
    ) -> OrchestratorResult<String> {
        self.add_step(workflow_id, name.into(), StepType::Condition, call, options)
            .await
    }

    pub async fn add_wait_step(
        &self,
        workflow_id: &str,
        name: impl Into<String>,
        duration: Duration,
        options: StepOptions,
    ) -> OrchestratorResult<String> {
        self.add_step(
            workflow_id,
            name.into(),
            StepType::Wait,
            Call::new(sleep(duration)),
            options,
        )
        .await
    }

    /// 添加一组共享相同依赖的步骤，它们会在同一轮中并发执行
    pub async fn add_parallel_steps(
        &self,
        workflow_id: &str,
        steps: Vec<(String, Call)>,
        options: StepOptions,
    ) -> OrchestratorResult<Vec<String>> {
        if options.timeout.is_some_and(|t| t.is_zero()) {
            return Err(OrchestratorError::invalid_config("步骤超时不能为 0"));
        }
        let mut workflows = self.workflows.write().await;
        let entry = Self::editable(&mut workflows, workflow_id)?;

        let mut staged = entry.workflow.clone();
        let mut ids = Vec::with_capacity(steps.len());
        for (name, call) in steps {
            let step = self.build_step(name, StepType::Parallel, call, &options);
            ids.push(step.id.clone());
            staged.insert_step(step);
        }
        dag::validate_graph(workflow_id, &staged.step_order, &staged.dependencies)?;

        debug!("工作流 {} 添加了 {} 个并行步骤", workflow_id, ids.len());
        entry.workflow = staged;
        Ok(ids)
    }

    pub async fn add_custom_step(
        &self,
        workflow_id: &str,
        name: impl Into<String>,
        call: Call,
        options: StepOptions,
    ) -> OrchestratorResult<String> {
        self.add_step(workflow_id, name.into(), StepType::Custom, call, options)
            .await
    }

    fn build_step(
        &self,
        name: String,
        step_type: StepType,
        call: Call,
        options: &StepOptions,
    ) -> WorkflowStep {
        let max_retries = options
            .max_retries
            .unwrap_or(self.config.default_step_max_retries);
        let mut step = WorkflowStep::new(name, step_type, call, max_retries);
        step.dependencies = options.dependencies.clone();
        step.timeout = options.timeout;
        step
    }

    async fn add_step(
        &self,
        workflow_id: &str,
        name: String,
        step_type: StepType,
        call: Call,
        options: StepOptions,
    ) -> OrchestratorResult<String> {
        if options.timeout.is_some_and(|t| t.is_zero()) {
            return Err(OrchestratorError::invalid_config("步骤超时不能为 0"));
        }
        let step = self.build_step(name, step_type, call, &options);
        let step_id = step.id.clone();

        let mut workflows = self.workflows.write().await;
        let entry = Self::editable(&mut workflows, workflow_id)?;
        let mut dependencies = entry.workflow.dependencies.clone();
        dependencies.insert(step_id.clone(), step.dependencies.clone());
        let mut order = entry.workflow.step_order.clone();
        order.push(step_id.clone());
        dag::validate_graph(workflow_id, &order, &dependencies)?;

        debug!(
            "工作流 {} 添加步骤 '{}' (ID: {}, 类型 {:?})",
            workflow_id, step.name, step_id, step_type
        );
        entry.workflow.insert_step(step);
        Ok(step_id)
    }

    /// 整体替换给定步骤的依赖，校验失败时工作流保持不变
    pub async fn set_dependencies(
        &self,
        workflow_id: &str,
        dependencies: HashMap<String, Vec<String>>,
    ) -> OrchestratorResult<()> {
        let mut workflows = self.workflows.write().await;
        let entry = Self::editable(&mut workflows, workflow_id)?;
        let workflow = &mut entry.workflow;

        let mut graph = workflow.dependencies.clone();
        for (step_id, deps) in &dependencies {
            if !workflow.steps.contains_key(step_id) {
                return Err(OrchestratorError::step_not_found(workflow_id, step_id));
            }
            graph.insert(step_id.clone(), deps.clone());
        }
        dag::validate_graph(workflow_id, &workflow.step_order, &graph)?;

        for (step_id, deps) in dependencies {
            if let Some(step) = workflow.steps.get_mut(&step_id) {
                step.dependencies = deps;
            }
        }
        workflow.dependencies = graph;
        Ok(())
    }

    /// 只有尚未执行的工作流可以修改结构
    fn editable<'a>(
        workflows: &'a mut HashMap<String, WorkflowEntry>,
        workflow_id: &str,
    ) -> OrchestratorResult<&'a mut WorkflowEntry> {
        let entry = workflows
            .get_mut(workflow_id)
            .ok_or_else(|| OrchestratorError::workflow_not_found(workflow_id))?;
        if entry.workflow.status != WorkflowStatus::Pending {
            return Err(OrchestratorError::invalid_state(format!(
                "工作流 '{}' 当前状态为 {}，不能修改",
                entry.workflow.name,
                entry.workflow.status.as_str()
            )));
        }
        Ok(entry)
    }

    /// 以已有工作流为模板复制出一个新的 Pending 工作流
    ///
    /// 步骤 ID 与依赖关系保持不变，执行状态与步骤结果被重置，变量保留。
    pub async fn clone_workflow(&self, template_id: &str) -> OrchestratorResult<String> {
        let mut workflows = self.workflows.write().await;
        let template = &workflows
            .get(template_id)
            .ok_or_else(|| OrchestratorError::workflow_not_found(template_id))?
            .workflow;

        let mut workflow = Workflow::new(template.name.clone());
        workflow.context = WorkflowContext::with_variables(template.context.variables.clone());
        for step_id in &template.step_order {
            let Some(step) = template.steps.get(step_id) else {
                continue;
            };
            let mut step = step.clone();
            step.status = StepStatus::Pending;
            step.result = None;
            step.error = None;
            step.attempts = 0;
            step.started_at = None;
            step.completed_at = None;
            workflow.insert_step(step);
        }

        let id = workflow.id.clone();
        debug!("从模板 {} 复制工作流 {}", template_id, id);
        workflows.insert(
            id.clone(),
            WorkflowEntry {
                workflow,
                epoch: 0,
                cancellation: CancellationToken::new(),
            },
        );
        Ok(id)
    }

    /// 按依赖关系给出的一种合法执行顺序
    pub async fn execution_order(&self, workflow_id: &str) -> OrchestratorResult<Vec<String>> {
        let workflows = self.workflows.read().await;
        let workflow = &workflows
            .get(workflow_id)
            .ok_or_else(|| OrchestratorError::workflow_not_found(workflow_id))?
            .workflow;
        dag::topological_order(workflow_id, &workflow.step_order, &workflow.dependencies)
    }

    /// 执行工作流并等待其结束
    ///
    /// 所有步骤完成时返回 `true`；失败、被取消或被暂停时返回 `false`，
    /// 暂停的工作流通过 [`resume_workflow`](Self::resume_workflow) 继续。
    pub async fn execute_workflow(
        &self,
        workflow_id: &str,
        variables: Option<HashMap<String, Value>>,
    ) -> OrchestratorResult<bool> {
        let (snapshot, epoch) = {
            let mut workflows = self.workflows.write().await;
            let entry = workflows
                .get_mut(workflow_id)
                .ok_or_else(|| OrchestratorError::workflow_not_found(workflow_id))?;

            match entry.workflow.status {
                WorkflowStatus::Pending => {}
                WorkflowStatus::Paused => {
                    debug!("工作流 {} 已暂停，需要先恢复", workflow_id);
                    return Ok(false);
                }
                status => {
                    return Err(OrchestratorError::invalid_state(format!(
                        "工作流 '{}' 当前状态为 {}，不能执行",
                        entry.workflow.name,
                        status.as_str()
                    )));
                }
            }

            let epoch = entry.rearm();
            let workflow = &mut entry.workflow;
            if let Some(variables) = variables {
                workflow.context.variables.extend(variables);
            }
            workflow.status = WorkflowStatus::Running;
            workflow.started_at = Some(Utc::now());
            (workflow.clone(), epoch)
        };

        StructuredLogger::log_workflow_transition(
            &snapshot.id,
            &snapshot.name,
            WorkflowStatus::Running.as_str(),
        );
        self.emit_workflow(EventKind::WorkflowStarted, &snapshot);

        let span = TaskTracer::workflow_span(&snapshot.id, &snapshot.name);
        Ok(self.drive(workflow_id, epoch).instrument(span).await)
    }

    /// 逐轮推进 DAG，返回工作流是否成功完成
    async fn drive(&self, workflow_id: &str, epoch: u64) -> bool {
        loop {
            let dispatches = match self.plan_round(workflow_id, epoch).await {
                Round::Dispatch(dispatches) => dispatches,
                Round::Finished(success) => return success,
            };

            let outcomes = join_all(dispatches.iter().map(|d| self.run_step(d))).await;
            if let Some(success) = self.apply_round(workflow_id, epoch, outcomes).await {
                return success;
            }
        }
    }

    async fn plan_round(&self, workflow_id: &str, epoch: u64) -> Round {
        let (round, finished) = {
            let mut workflows = self.workflows.write().await;
            let Some(entry) = workflows.get_mut(workflow_id) else {
                return Round::Finished(false);
            };
            if entry.epoch != epoch || entry.workflow.status != WorkflowStatus::Running {
                return Round::Finished(entry.workflow.status == WorkflowStatus::Completed);
            }

            let cancellation = entry.cancellation.clone();
            let workflow = &mut entry.workflow;
            if workflow.is_complete() {
                Self::finish(workflow, WorkflowStatus::Completed, None);
                (Round::Finished(true), Some(workflow.clone()))
            } else {
                let ready = workflow.ready_steps();
                if ready.is_empty() {
                    // 校验过的 DAG 不会出现这种情况，除非依赖步骤未完成就结束了
                    let pending = workflow.pending_steps();
                    workflow.settle_pending(StepStatus::Skipped);
                    Self::finish(
                        workflow,
                        WorkflowStatus::Failed,
                        Some(format!("没有可执行的步骤，剩余 {pending:?}")),
                    );
                    (Round::Finished(false), Some(workflow.clone()))
                } else {
                    let dispatches = ready
                        .iter()
                        .filter_map(|step_id| {
                            let args = workflow.dependency_results(step_id);
                            let variables = workflow.context.variables.clone();
                            let step = workflow.steps.get_mut(step_id)?;
                            let call = step.call.clone();
                            step.status = StepStatus::Running;
                            step.started_at = Some(Utc::now());
                            let mut bound = call.args.clone();
                            bound.extend(args);
                            Some(StepDispatch {
                                workflow_id: workflow_id.to_string(),
                                step_id: step_id.clone(),
                                name: step.name.clone(),
                                step_type: step.step_type,
                                call,
                                args: bound,
                                variables,
                                max_retries: step.max_retries,
                                timeout: step.timeout,
                                cancellation: cancellation.clone(),
                            })
                        })
                        .collect();
                    (Round::Dispatch(dispatches), None)
                }
            }
        };

        if let Some(workflow) = finished {
            self.report_finished(&workflow);
        }
        if let Round::Dispatch(dispatches) = &round {
            for dispatch in dispatches {
                StructuredLogger::log_step_transition(
                    workflow_id,
                    &dispatch.step_id,
                    &dispatch.name,
                    StepStatus::Running.as_str(),
                    0,
                );
                self.emit_step(
                    EventKind::StepStarted,
                    workflow_id,
                    &dispatch.step_id,
                    &dispatch.name,
                    json!({ "step_type": dispatch.step_type, "status": "running" }),
                );
            }
        }
        round
    }

    /// 执行单个步骤，包含超时与重试；第 n 次重试前等待 `base × 2^n`
    ///
    /// 步骤的 `max_retries` 是总尝试次数上限，0 按 1 次计算。
    async fn run_step(&self, dispatch: &StepDispatch) -> StepOutcome {
        let policy = RetryPolicy::for_steps(dispatch.max_retries, self.config.step_retry_base());
        let max_attempts = policy.max_attempts();
        let span = TaskTracer::step_span(&dispatch.workflow_id, &dispatch.step_id, &dispatch.name);
        let mut attempt = 0;

        loop {
            let started = Instant::now();
            let result = self
                .invoke_step(dispatch, attempt)
                .instrument(span.clone())
                .await;
            self.metrics.record_step_execution(
                &dispatch.name,
                result.is_ok(),
                started.elapsed().as_secs_f64(),
            );

            let message = match result {
                Ok(value) => {
                    return StepOutcome {
                        step_id: dispatch.step_id.clone(),
                        result: Ok(value),
                        attempts: attempt + 1,
                    }
                }
                Err(message) => message,
            };

            if attempt + 1 >= max_attempts || dispatch.cancellation.is_cancelled() {
                return StepOutcome {
                    step_id: dispatch.step_id.clone(),
                    result: Err(OrchestratorError::WorkflowStepFailure {
                        step_id: dispatch.step_id.clone(),
                        message,
                    }),
                    attempts: attempt + 1,
                };
            }

            let delay = policy.delay_for(attempt);
            warn!(
                "工作流 {} 的步骤 '{}' 第 {} 次执行失败，{}ms 后重试: {}",
                dispatch.workflow_id,
                dispatch.name,
                attempt + 1,
                delay.as_millis(),
                message
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = dispatch.cancellation.cancelled() => {
                    return StepOutcome {
                        step_id: dispatch.step_id.clone(),
                        result: Err(OrchestratorError::WorkflowStepFailure {
                            step_id: dispatch.step_id.clone(),
                            message: "重试等待被中断".to_string(),
                        }),
                        attempts: attempt + 1,
                    };
                }
            }
            attempt += 1;
        }
    }

    async fn invoke_step(&self, dispatch: &StepDispatch, attempt: u32) -> Result<Value, String> {
        let mut ctx = dispatch.call.context(dispatch.cancellation.clone());
        ctx.args = dispatch.args.clone();
        ctx.variables = dispatch.variables.clone();
        ctx.attempt = attempt;

        let invocation = invoke_guarded(&dispatch.call.invocable, ctx);
        let value = match dispatch.timeout {
            Some(limit) => match tokio::time::timeout(limit, invocation).await {
                Ok(result) => result.map_err(|e| e.to_string())?,
                Err(_) => {
                    return Err(OrchestratorError::TaskTimeout {
                        timeout_ms: limit.as_millis() as u64,
                    }
                    .to_string())
                }
            },
            None => invocation.await.map_err(|e| e.to_string())?,
        };

        if dispatch.step_type == StepType::Condition && !value.is_boolean() {
            return Err(format!("条件步骤必须返回布尔值，实际返回 {value}"));
        }
        Ok(value)
    }

    /// 写回一轮的执行结果；工作流结束时返回其是否成功
    async fn apply_round(
        &self,
        workflow_id: &str,
        epoch: u64,
        outcomes: Vec<StepOutcome>,
    ) -> Option<bool> {
        let (step_events, finished) = {
            let mut workflows = self.workflows.write().await;
            let Some(entry) = workflows.get_mut(workflow_id) else {
                return Some(false);
            };
            if entry.epoch != epoch || entry.workflow.status != WorkflowStatus::Running {
                debug!(
                    "丢弃工作流 {} 的过期步骤结果 (状态 {})",
                    workflow_id,
                    entry.workflow.status.as_str()
                );
                return Some(entry.workflow.status == WorkflowStatus::Completed);
            }

            let workflow = &mut entry.workflow;
            let mut step_events = Vec::with_capacity(outcomes.len());
            let mut first_failure: Option<String> = None;

            for outcome in outcomes {
                let Some(step) = workflow.steps.get_mut(&outcome.step_id) else {
                    continue;
                };
                step.attempts += outcome.attempts;
                step.completed_at = Some(Utc::now());
                match outcome.result {
                    Ok(value) => {
                        step.status = StepStatus::Completed;
                        step.result = Some(value.clone());
                        step.error = None;
                        workflow
                            .context
                            .step_results
                            .insert(outcome.step_id.clone(), value);
                        workflow.context.execution_path.push(outcome.step_id.clone());
                    }
                    Err(err) => {
                        let message = err.to_string();
                        step.status = StepStatus::Failed;
                        step.error = Some(message.clone());
                        first_failure.get_or_insert(message);
                    }
                }
                step_events.push(step.clone());
            }

            let finished = first_failure.map(|message| {
                let skipped = workflow.settle_pending(StepStatus::Skipped);
                debug!("工作流 {} 失败，跳过 {} 个未执行的步骤", workflow_id, skipped);
                let err = OrchestratorError::WorkflowFailed {
                    workflow_id: workflow_id.to_string(),
                    message,
                };
                Self::finish(workflow, WorkflowStatus::Failed, Some(err.to_string()));
                workflow.clone()
            });
            (step_events, finished)
        };

        for step in &step_events {
            let kind = if step.status == StepStatus::Completed {
                EventKind::StepCompleted
            } else {
                EventKind::StepFailed
            };
            StructuredLogger::log_step_transition(
                workflow_id,
                &step.id,
                &step.name,
                step.status.as_str(),
                step.attempts,
            );
            self.emit_step(
                kind,
                workflow_id,
                &step.id,
                &step.name,
                json!({
                    "step_type": step.step_type,
                    "status": step.status.as_str(),
                    "attempts": step.attempts,
                    "result": step.result,
                    "error": step.error,
                }),
            );
        }

        finished.map(|workflow| {
            self.report_finished(&workflow);
            false
        })
    }

    fn finish(workflow: &mut Workflow, status: WorkflowStatus, error: Option<String>) {
        workflow.status = status;
        workflow.completed_at = Some(Utc::now());
        workflow.error = error;
    }

    fn report_finished(&self, workflow: &Workflow) {
        let success = workflow.status == WorkflowStatus::Completed;
        let elapsed = workflow
            .started_at
            .zip(workflow.completed_at)
            .and_then(|(start, end)| (end - start).to_std().ok())
            .unwrap_or_default();
        self.metrics
            .record_workflow_run(&workflow.name, success, elapsed.as_secs_f64());
        StructuredLogger::log_workflow_transition(
            &workflow.id,
            &workflow.name,
            workflow.status.as_str(),
        );
        let kind = if success {
            EventKind::WorkflowCompleted
        } else {
            EventKind::WorkflowFailed
        };
        self.emit_workflow(kind, workflow);
    }

    /// 取消未结束的工作流，运行中与未执行的步骤都标记为 Cancelled
    pub async fn cancel_workflow(&self, workflow_id: &str) -> OrchestratorResult<bool> {
        let snapshot = {
            let mut workflows = self.workflows.write().await;
            let entry = workflows
                .get_mut(workflow_id)
                .ok_or_else(|| OrchestratorError::workflow_not_found(workflow_id))?;
            if entry.workflow.status.is_finished() {
                return Ok(false);
            }

            entry.invalidate();
            let workflow = &mut entry.workflow;
            for step in workflow.steps.values_mut() {
                if step.status == StepStatus::Running {
                    step.status = StepStatus::Cancelled;
                    step.completed_at = Some(Utc::now());
                }
            }
            workflow.settle_pending(StepStatus::Cancelled);
            Self::finish(
                workflow,
                WorkflowStatus::Cancelled,
                Some("工作流已取消".to_string()),
            );
            workflow.clone()
        };

        StructuredLogger::log_workflow_transition(
            &snapshot.id,
            &snapshot.name,
            snapshot.status.as_str(),
        );
        self.emit_workflow(EventKind::WorkflowCancelled, &snapshot);
        Ok(true)
    }

    /// 暂停运行中的工作流；正在执行的步骤结果被丢弃，恢复后重新执行
    pub async fn pause_workflow(&self, workflow_id: &str) -> OrchestratorResult<bool> {
        let snapshot = {
            let mut workflows = self.workflows.write().await;
            let entry = workflows
                .get_mut(workflow_id)
                .ok_or_else(|| OrchestratorError::workflow_not_found(workflow_id))?;
            if entry.workflow.status != WorkflowStatus::Running {
                return Ok(false);
            }

            entry.invalidate();
            let workflow = &mut entry.workflow;
            for step in workflow.steps.values_mut() {
                if step.status == StepStatus::Running {
                    step.status = StepStatus::Pending;
                    step.started_at = None;
                }
            }
            workflow.status = WorkflowStatus::Paused;
            workflow.clone()
        };

        StructuredLogger::log_workflow_transition(
            &snapshot.id,
            &snapshot.name,
            snapshot.status.as_str(),
        );
        self.emit_workflow(EventKind::WorkflowPaused, &snapshot);
        Ok(true)
    }

    /// 恢复暂停的工作流，在后台从当前状态继续推进
    pub async fn resume_workflow(&self, workflow_id: &str) -> OrchestratorResult<bool> {
        let (snapshot, epoch) = {
            let mut workflows = self.workflows.write().await;
            let entry = workflows
                .get_mut(workflow_id)
                .ok_or_else(|| OrchestratorError::workflow_not_found(workflow_id))?;
            if entry.workflow.status != WorkflowStatus::Paused {
                return Ok(false);
            }
            let epoch = entry.rearm();
            entry.workflow.status = WorkflowStatus::Running;
            (entry.workflow.clone(), epoch)
        };

        StructuredLogger::log_workflow_transition(
            &snapshot.id,
            &snapshot.name,
            snapshot.status.as_str(),
        );
        self.emit_workflow(EventKind::WorkflowResumed, &snapshot);

        let engine = self.clone();
        let id = workflow_id.to_string();
        let span = TaskTracer::workflow_span(&snapshot.id, &snapshot.name);
        tokio::spawn(
            async move {
                engine.drive(&id, epoch).await;
            }
            .instrument(span),
        );
        Ok(true)
    }

    pub async fn get_workflow(&self, workflow_id: &str) -> Option<Workflow> {
        self.workflows
            .read()
            .await
            .get(workflow_id)
            .map(|entry| entry.workflow.clone())
    }

    pub async fn get_step(&self, workflow_id: &str, step_id: &str) -> Option<WorkflowStep> {
        self.workflows
            .read()
            .await
            .get(workflow_id)
            .and_then(|entry| entry.workflow.steps.get(step_id).cloned())
    }

    pub async fn list_workflows(&self, status: Option<WorkflowStatus>) -> Vec<Workflow> {
        let workflows = self.workflows.read().await;
        let mut list: Vec<Workflow> = workflows
            .values()
            .filter(|entry| status.map_or(true, |s| entry.workflow.status == s))
            .map(|entry| entry.workflow.clone())
            .collect();
        list.sort_by_key(|workflow| workflow.created_at);
        list
    }

    pub async fn set_variable(
        &self,
        workflow_id: &str,
        key: impl Into<String>,
        value: Value,
    ) -> OrchestratorResult<()> {
        let mut workflows = self.workflows.write().await;
        let entry = workflows
            .get_mut(workflow_id)
            .ok_or_else(|| OrchestratorError::workflow_not_found(workflow_id))?;
        entry.workflow.context.variables.insert(key.into(), value);
        Ok(())
    }

    /// 删除工作流；运行中的工作流需要先取消
    pub async fn delete_workflow(&self, workflow_id: &str) -> OrchestratorResult<bool> {
        let mut workflows = self.workflows.write().await;
        let Some(entry) = workflows.get(workflow_id) else {
            return Ok(false);
        };
        if matches!(
            entry.workflow.status,
            WorkflowStatus::Running | WorkflowStatus::Paused
        ) {
            return Err(OrchestratorError::invalid_state(format!(
                "工作流 '{}' 仍在执行，不能删除",
                entry.workflow.name
            )));
        }
        workflows.remove(workflow_id);
        info!("删除工作流: {}", workflow_id);
        Ok(true)
    }

    /// 移除结束时间早于保留窗口的已结束工作流
    pub async fn cleanup_completed(&self, retention: Duration) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(retention).unwrap_or_else(|_| chrono::Duration::days(36500));
        let mut workflows = self.workflows.write().await;
        let before = workflows.len();
        workflows.retain(|_, entry| {
            let workflow = &entry.workflow;
            !(workflow.status.is_finished()
                && workflow.completed_at.is_some_and(|done| done <= cutoff))
        });
        let removed = before - workflows.len();
        if removed > 0 {
            info!("清理了 {} 个已结束的工作流", removed);
        }
        removed
    }

    pub async fn metrics(&self) -> WorkflowMetrics {
        let workflows = self.workflows.read().await;
        let mut metrics = WorkflowMetrics {
            total: workflows.len(),
            ..Default::default()
        };
        for entry in workflows.values() {
            let workflow = &entry.workflow;
            match workflow.status {
                WorkflowStatus::Pending => metrics.pending += 1,
                WorkflowStatus::Running => metrics.running += 1,
                WorkflowStatus::Paused => metrics.paused += 1,
                WorkflowStatus::Completed => metrics.completed += 1,
                WorkflowStatus::Failed => metrics.failed += 1,
                WorkflowStatus::Cancelled => metrics.cancelled += 1,
            }
            metrics.total_steps += workflow.steps.len();
            for step in workflow.steps.values() {
                match step.status {
                    StepStatus::Completed => metrics.completed_steps += 1,
                    StepStatus::Failed => metrics.failed_steps += 1,
                    _ => {}
                }
            }
        }
        metrics
    }

    pub async fn health(&self) -> ComponentHealth {
        let metrics = self.metrics().await;
        ComponentHealth::healthy(json!({
            "total": metrics.total,
            "running": metrics.running,
            "paused": metrics.paused,
            "failed": metrics.failed,
        }))
    }

    fn emit_workflow(&self, kind: EventKind, workflow: &Workflow) {
        let completed = workflow
            .steps
            .values()
            .filter(|s| s.status == StepStatus::Completed)
            .count();
        let event = EngineEvent::new(
            kind,
            &workflow.id,
            &workflow.name,
            json!({
                "status": workflow.status.as_str(),
                "steps": workflow.steps.len(),
                "completed_steps": completed,
                "execution_path": workflow.context.execution_path,
                "error": workflow.error,
            }),
        );
        self.dispatch_event(&event);
    }

    fn emit_step(
        &self,
        kind: EventKind,
        workflow_id: &str,
        step_id: &str,
        step_name: &str,
        mut payload: Value,
    ) {
        if let Some(fields) = payload.as_object_mut() {
            fields.insert("workflow_id".to_string(), json!(workflow_id));
        }
        let event = EngineEvent::new(kind, step_id, step_name, payload);
        self.dispatch_event(&event);
    }

    fn dispatch_event(&self, event: &EngineEvent) {
        let failures = self.callbacks.emit(event);
        if failures > 0 {
            self.metrics.record_callback_failures(failures);
            StructuredLogger::log_callback_failure(event.kind.as_str(), &event.entity_id, failures);
        }
    }
}
