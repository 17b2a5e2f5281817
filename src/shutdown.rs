use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, RwLock};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// 默认的优雅关闭等待时间
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// 优雅关闭管理器
#[derive(Clone)]
pub struct ShutdownManager {
    shutdown_tx: Arc<RwLock<Option<broadcast::Sender<()>>>>,
    is_shutdown: Arc<RwLock<bool>>,
    timeout: Duration,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_SHUTDOWN_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        let (shutdown_tx, _) = broadcast::channel(16);

        Self {
            shutdown_tx: Arc::new(RwLock::new(Some(shutdown_tx))),
            is_shutdown: Arc::new(RwLock::new(false)),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// 订阅关闭信号
    pub async fn subscribe(&self) -> broadcast::Receiver<()> {
        let shutdown_tx = self.shutdown_tx.read().await;
        if let Some(ref tx) = *shutdown_tx {
            tx.subscribe()
        } else {
            // 已经关闭，返回一个立即触发的接收器
            let (tx, rx) = broadcast::channel(1);
            let _ = tx.send(());
            rx
        }
    }

    /// 触发关闭
    pub async fn shutdown(&self) {
        let mut is_shutdown = self.is_shutdown.write().await;
        if *is_shutdown {
            debug!("关闭管理器已经触发过关闭");
            return;
        }

        info!("触发系统关闭");
        *is_shutdown = true;

        let mut shutdown_tx = self.shutdown_tx.write().await;
        if let Some(tx) = shutdown_tx.take() {
            debug!("发送关闭信号给 {} 个订阅者", tx.receiver_count());
            // 没有接收者时发送失败，可以忽略
            let _ = tx.send(());
        }
    }

    pub async fn is_shutdown(&self) -> bool {
        *self.is_shutdown.read().await
    }

    /// 触发关闭并在超时时间内等待 `stop` 完成，返回是否按时完成
    pub async fn graceful_stop<F>(&self, stop: F) -> bool
    where
        F: Future<Output = ()>,
    {
        self.shutdown().await;

        match timeout(self.timeout, stop).await {
            Ok(()) => {
                info!("所有组件已优雅关闭");
                true
            }
            Err(_) => {
                warn!("优雅关闭超时（{}秒），强制退出", self.timeout.as_secs());
                false
            }
        }
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn signalled(rx: &mut broadcast::Receiver<()>) -> bool {
        timeout(Duration::from_millis(100), rx.recv()).await.is_ok()
    }

    #[tokio::test]
    async fn test_every_subscriber_is_signalled() {
        let manager = ShutdownManager::default();
        assert!(!manager.is_shutdown().await);
        assert_eq!(manager.timeout(), DEFAULT_SHUTDOWN_TIMEOUT);

        let mut early = manager.subscribe().await;
        let mut other = manager.subscribe().await;
        manager.shutdown().await;
        // 第二次触发不会出错
        manager.shutdown().await;

        assert!(signalled(&mut early).await);
        assert!(signalled(&mut other).await);
        assert!(manager.is_shutdown().await);

        // 关闭后才订阅的接收器同样立即收到信号
        let mut late = manager.subscribe().await;
        assert!(signalled(&mut late).await);
    }

    #[tokio::test]
    async fn test_graceful_stop_completes() {
        let manager = ShutdownManager::with_timeout(Duration::from_secs(1));
        let mut component = manager.subscribe().await;

        let stopped = manager
            .graceful_stop(async move {
                let _ = component.recv().await;
            })
            .await;
        assert!(stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_graceful_stop_times_out() {
        let manager = ShutdownManager::with_timeout(Duration::from_secs(30));
        let stopped = manager
            .graceful_stop(tokio::time::sleep(Duration::from_secs(120)))
            .await;
        assert!(!stopped);
        assert!(manager.is_shutdown().await);
    }
}
