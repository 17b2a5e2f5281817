//! 可调用对象抽象
//!
//! 任务与工作流步骤所包装的工作单元。引擎只区分"正常返回"与"返回错误/panic"，
//! 返回值作为不透明的 JSON 数据保存。

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;

/// 可调用对象返回的错误
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationError {
    message: String,
}

impl InvocationError {
    pub fn new<S: Into<String>>(message: S) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for InvocationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for InvocationError {}

impl From<String> for InvocationError {
    fn from(message: String) -> Self {
        Self { message }
    }
}

impl From<&str> for InvocationError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

pub type InvocationResult = Result<Value, InvocationError>;

/// 单次调用的上下文
#[derive(Debug, Clone, Default)]
pub struct InvocationContext {
    /// 位置参数；工作流步骤会在末尾追加依赖步骤的结果
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
    /// 工作流变量快照，普通任务为空
    pub variables: HashMap<String, Value>,
    /// 从 0 开始的尝试序号
    pub attempt: u32,
    pub cancellation: CancellationToken,
}

impl InvocationContext {
    pub fn new(args: Vec<Value>, kwargs: Map<String, Value>) -> Self {
        Self {
            args,
            kwargs,
            ..Default::default()
        }
    }

    pub fn arg(&self, index: usize) -> Option<&Value> {
        self.args.get(index)
    }

    pub fn kwarg(&self, key: &str) -> Option<&Value> {
        self.kwargs.get(key)
    }

    pub fn variable(&self, key: &str) -> Option<&Value> {
        self.variables.get(key)
    }

    /// 长时间运行的可调用对象应定期检查此标志
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

#[async_trait]
pub trait Invocable: Send + Sync {
    async fn invoke(&self, ctx: InvocationContext) -> InvocationResult;

    /// 阻塞型调用在有界工作池中执行
    fn is_blocking(&self) -> bool {
        false
    }

    fn describe(&self) -> String {
        "invocable".to_string()
    }
}

pub struct AsyncFnInvocable<F> {
    name: String,
    func: F,
}

#[async_trait]
impl<F, Fut> Invocable for AsyncFnInvocable<F>
where
    F: Fn(InvocationContext) -> Fut + Send + Sync,
    Fut: Future<Output = InvocationResult> + Send + 'static,
{
    async fn invoke(&self, ctx: InvocationContext) -> InvocationResult {
        (self.func)(ctx).await
    }

    fn describe(&self) -> String {
        self.name.clone()
    }
}

pub struct BlockingFnInvocable<F> {
    name: String,
    func: Arc<F>,
}

#[async_trait]
impl<F> Invocable for BlockingFnInvocable<F>
where
    F: Fn(InvocationContext) -> InvocationResult + Send + Sync + 'static,
{
    async fn invoke(&self, ctx: InvocationContext) -> InvocationResult {
        let func = Arc::clone(&self.func);
        tokio::task::spawn_blocking(move || func(ctx))
            .await
            .map_err(|e| InvocationError::new(format!("阻塞调用异常终止: {e}")))?
    }

    fn is_blocking(&self) -> bool {
        true
    }

    fn describe(&self) -> String {
        self.name.clone()
    }
}

/// 等待步骤使用的固定时长休眠
pub struct SleepInvocable {
    duration: Duration,
}

#[async_trait]
impl Invocable for SleepInvocable {
    async fn invoke(&self, ctx: InvocationContext) -> InvocationResult {
        tokio::select! {
            _ = tokio::time::sleep(self.duration) => {
                Ok(json!({ "waited_ms": self.duration.as_millis() as u64 }))
            }
            _ = ctx.cancellation.cancelled() => {
                Err(InvocationError::new("等待被取消"))
            }
        }
    }

    fn describe(&self) -> String {
        format!("sleep({}ms)", self.duration.as_millis())
    }
}

pub fn from_async_fn<F, Fut>(name: impl Into<String>, func: F) -> Arc<dyn Invocable>
where
    F: Fn(InvocationContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = InvocationResult> + Send + 'static,
{
    Arc::new(AsyncFnInvocable {
        name: name.into(),
        func,
    })
}

pub fn from_blocking_fn<F>(name: impl Into<String>, func: F) -> Arc<dyn Invocable>
where
    F: Fn(InvocationContext) -> InvocationResult + Send + Sync + 'static,
{
    Arc::new(BlockingFnInvocable {
        name: name.into(),
        func: Arc::new(func),
    })
}

pub fn sleep(duration: Duration) -> Arc<dyn Invocable> {
    Arc::new(SleepInvocable { duration })
}

/// 执行调用，并把 panic 转换为调用错误
pub async fn invoke_guarded(
    invocable: &Arc<dyn Invocable>,
    ctx: InvocationContext,
) -> InvocationResult {
    match AssertUnwindSafe(invocable.invoke(ctx)).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(InvocationError::new(format!(
            "{} panicked: {}",
            invocable.describe(),
            panic_message(panic.as_ref())
        ))),
    }
}

pub fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// 可调用对象及其绑定的参数
#[derive(Clone)]
pub struct Call {
    pub invocable: Arc<dyn Invocable>,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
}

impl Call {
    pub fn new(invocable: Arc<dyn Invocable>) -> Self {
        Self {
            invocable,
            args: Vec::new(),
            kwargs: Map::new(),
        }
    }

    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    pub fn with_kwargs(mut self, kwargs: Map<String, Value>) -> Self {
        self.kwargs = kwargs;
        self
    }

    pub fn context(&self, cancellation: CancellationToken) -> InvocationContext {
        InvocationContext {
            args: self.args.clone(),
            kwargs: self.kwargs.clone(),
            variables: HashMap::new(),
            attempt: 0,
            cancellation,
        }
    }
}

impl fmt::Debug for Call {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Call")
            .field("invocable", &self.invocable.describe())
            .field("args", &self.args)
            .field("kwargs", &self.kwargs)
            .finish()
    }
}
