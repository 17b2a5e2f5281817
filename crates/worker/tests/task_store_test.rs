use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use orchestrator_config::TaskManagerConfig;
use orchestrator_domain::{
    from_async_fn, Call, InvocationContext, InvocationError, Task, TaskConfig, TaskRecord,
    TaskStatus,
};
use orchestrator_errors::OrchestratorResult;
use orchestrator_observability::MetricsCollector;
use orchestrator_worker::{JsonFileTaskStore, TaskManager, TaskStore};
use serde_json::{json, Value};
use tempfile::TempDir;

fn persistent_manager(dir: &TempDir) -> TaskManager {
    let config = TaskManagerConfig {
        storage_dir: dir.path().to_path_buf(),
        persistence_enabled: true,
        ..Default::default()
    };
    TaskManager::new(config, Arc::new(MetricsCollector::new()))
}

fn noop_call() -> Call {
    Call::new(from_async_fn("noop", |_ctx: InvocationContext| async {
        Ok(Value::Null)
    }))
}

#[tokio::test]
async fn test_completed_task_survives_restart() {
    let dir = TempDir::new().unwrap();
    let manager = persistent_manager(&dir);

    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    let call = Call::new(from_async_fn("report", move |_ctx: InvocationContext| {
        let counter = Arc::clone(&counter);
        async move {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(InvocationError::new("first attempt fails"));
            }
            Ok(json!({"rows": 42}))
        }
    }));
    let id = manager
        .create_task(
            "report",
            call,
            TaskConfig::default().with_retry_delay(Duration::from_millis(10)),
        )
        .await
        .unwrap();
    manager.start_task(&id, false).await.unwrap();
    let original = manager
        .wait_for_task(&id, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(original.status, TaskStatus::Completed);

    // 内存状态先于快照落盘更新，等待终态快照写完
    let store = JsonFileTaskStore::new(dir.path());
    for _ in 0..100 {
        let record = store.load(&id).await.unwrap().unwrap();
        if record.status == "completed" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let restarted = persistent_manager(&dir);
    assert_eq!(restarted.restore().await.unwrap(), 1);

    let restored = restarted.get_task(&id).await.unwrap();
    assert_eq!(restored.status, original.status);
    assert_eq!(restored.retry_count, 1);
    assert_eq!(
        restored.result.as_ref().and_then(|r| r.data.clone()),
        Some(json!({"rows": 42}))
    );
    // 恢复的历史记录没有可调用对象，不能再次启动
    assert!(restored.call.is_none());
    assert!(!restarted.start_task(&id, true).await.unwrap());
}

#[tokio::test]
async fn test_interrupted_task_marked_failed_on_restore() {
    let dir = TempDir::new().unwrap();
    let store = JsonFileTaskStore::new(dir.path());

    let mut task = Task::new("long-job", noop_call(), TaskConfig::default());
    task.status = TaskStatus::Running;
    task.retry_count = 2;
    store.save(&TaskRecord::from_task(&task)).await.unwrap();

    let manager = persistent_manager(&dir);
    assert_eq!(manager.restore().await.unwrap(), 1);

    let restored = manager.get_task(&task.id).await.unwrap();
    assert_eq!(restored.status, TaskStatus::Failed);
    assert_eq!(restored.retry_count, 2);
    assert_eq!(restored.last_error.as_deref(), Some("interrupted by restart"));

    let record = store.load(&task.id).await.unwrap().unwrap();
    assert_eq!(record.status, "failed");
}

#[tokio::test]
async fn test_corrupt_snapshot_is_skipped() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("broken.json"), b"{ not json").unwrap();
    std::fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();

    let store = JsonFileTaskStore::new(dir.path());
    assert!(store.load("broken").await.is_err());
    assert_eq!(store.list_ids().await.unwrap(), vec!["broken".to_string()]);

    let manager = persistent_manager(&dir);
    assert_eq!(manager.restore().await.unwrap(), 0);
}

#[tokio::test]
async fn test_store_remove_and_missing_entries() {
    let dir = TempDir::new().unwrap();
    let store = JsonFileTaskStore::new(dir.path().join("nested"));

    // 目录不存在时视为空
    assert!(store.list_ids().await.unwrap().is_empty());
    assert!(store.load("absent").await.unwrap().is_none());

    let task = Task::new("t", noop_call(), TaskConfig::default());
    store.save(&TaskRecord::from_task(&task)).await.unwrap();
    assert_eq!(store.list_ids().await.unwrap(), vec![task.id.clone()]);

    store.remove(&task.id).await.unwrap();
    store.remove(&task.id).await.unwrap();
    assert!(store.load(&task.id).await.unwrap().is_none());

    assert!(store.load("../escape").await.is_err());
}

#[tokio::test]
async fn test_delete_task_removes_snapshot() {
    let dir = TempDir::new().unwrap();
    let manager = persistent_manager(&dir);
    let id = manager
        .create_task("ephemeral", noop_call(), TaskConfig::default())
        .await
        .unwrap();
    let path = dir.path().join(format!("{id}.json"));
    assert!(path.exists());

    assert!(manager.delete_task(&id).await.unwrap());
    assert!(!path.exists());
}

/// 写入 `retrying` 快照时故意变慢的存储
struct SlowRetryingStore {
    inner: JsonFileTaskStore,
}

#[async_trait]
impl TaskStore for SlowRetryingStore {
    async fn save(&self, record: &TaskRecord) -> OrchestratorResult<()> {
        if record.status == "retrying" {
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        self.inner.save(record).await
    }

    async fn load(&self, id: &str) -> OrchestratorResult<Option<TaskRecord>> {
        self.inner.load(id).await
    }

    async fn list_ids(&self) -> OrchestratorResult<Vec<String>> {
        self.inner.list_ids().await
    }

    async fn remove(&self, id: &str) -> OrchestratorResult<()> {
        self.inner.remove(id).await
    }
}

#[tokio::test]
async fn test_cancel_during_slow_retry_write_persists_cancelled() {
    let dir = TempDir::new().unwrap();
    let config = TaskManagerConfig {
        storage_dir: dir.path().to_path_buf(),
        persistence_enabled: true,
        ..Default::default()
    };
    let store: Arc<dyn TaskStore> = Arc::new(SlowRetryingStore {
        inner: JsonFileTaskStore::new(dir.path()),
    });
    let manager = TaskManager::with_store(config, Some(store), Arc::new(MetricsCollector::new()));

    let call = Call::new(from_async_fn("flaky", |_ctx: InvocationContext| async {
        Err(InvocationError::new("always fails"))
    }));
    let id = manager
        .create_task(
            "flaky",
            call,
            TaskConfig::default()
                .with_max_retries(3)
                .with_retry_delay(Duration::from_secs(10)),
        )
        .await
        .unwrap();
    manager.start_task(&id, false).await.unwrap();

    for _ in 0..250 {
        if manager.get_task(&id).await.unwrap().status == TaskStatus::Retrying {
            break;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    assert_eq!(manager.get_task(&id).await.unwrap().status, TaskStatus::Retrying);

    // retrying 快照仍在写入时取消
    assert!(manager.cancel_task(&id).await.unwrap());
    assert_eq!(manager.get_task(&id).await.unwrap().status, TaskStatus::Cancelled);

    // 等慢写入结束，确认它没有覆盖取消后的快照
    tokio::time::sleep(Duration::from_millis(300)).await;
    let disk = JsonFileTaskStore::new(dir.path());
    let record = disk.load(&id).await.unwrap().unwrap();
    assert_eq!(record.status, "cancelled");

    let restarted = persistent_manager(&dir);
    assert_eq!(restarted.restore().await.unwrap(), 1);
    let restored = restarted.get_task(&id).await.unwrap();
    assert_eq!(restored.status, TaskStatus::Cancelled);
    assert_ne!(restored.last_error.as_deref(), Some("interrupted by restart"));
}

#[tokio::test]
async fn test_concurrent_saves_use_distinct_temp_files() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(JsonFileTaskStore::new(dir.path()));
    let mut task = Task::new("busy", noop_call(), TaskConfig::default());

    let mut handles = Vec::new();
    for retry_count in 0..16 {
        task.retry_count = retry_count;
        let record = TaskRecord::from_task(&task);
        let store = Arc::clone(&store);
        handles.push(tokio::spawn(async move { store.save(&record).await }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let record = store.load(&task.id).await.unwrap().unwrap();
    assert!(record.retry_count < 16);
    // 没有遗留的临时文件
    let leftovers: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_name().to_string_lossy().ends_with(".tmp"))
        .collect();
    assert!(leftovers.is_empty());
}
