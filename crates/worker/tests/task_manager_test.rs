use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use orchestrator_config::TaskManagerConfig;
use orchestrator_domain::{
    from_async_fn, from_blocking_fn, Call, EventKind, InvocationContext, InvocationError,
    TaskConfig, TaskStatus,
};
use orchestrator_errors::OrchestratorError;
use orchestrator_observability::MetricsCollector;
use orchestrator_worker::TaskManager;
use serde_json::{json, Value};
use tokio::time::Instant;

fn in_memory_manager() -> TaskManager {
    let config = TaskManagerConfig {
        persistence_enabled: false,
        ..Default::default()
    };
    TaskManager::new(config, Arc::new(MetricsCollector::new()))
}

fn ok_call(value: Value) -> Call {
    Call::new(from_async_fn("ok", move |_ctx: InvocationContext| {
        let value = value.clone();
        async move { Ok(value) }
    }))
}

fn failing_call(attempts: Arc<Mutex<Vec<Instant>>>) -> Call {
    Call::new(from_async_fn("always-fails", move |_ctx: InvocationContext| {
        let attempts = Arc::clone(&attempts);
        async move {
            attempts.lock().unwrap().push(Instant::now());
            Err(InvocationError::new("boom"))
        }
    }))
}

#[tokio::test]
async fn test_task_completes_with_result() {
    let manager = in_memory_manager();
    let add = from_async_fn("add", |ctx: InvocationContext| async move {
        let a = ctx.arg(0).and_then(Value::as_i64).unwrap_or_default();
        let b = ctx.kwarg("b").and_then(Value::as_i64).unwrap_or_default();
        Ok(json!(a + b))
    });
    let mut kwargs = serde_json::Map::new();
    kwargs.insert("b".to_string(), json!(5));
    let call = Call::new(add).with_args(vec![json!(2)]).with_kwargs(kwargs);

    let id = manager
        .create_task("add", call, TaskConfig::default())
        .await
        .unwrap();
    assert_eq!(
        manager.get_task(&id).await.unwrap().status,
        TaskStatus::Pending
    );

    assert!(manager.start_task(&id, false).await.unwrap());
    let task = manager
        .wait_for_task(&id, Duration::from_secs(5))
        .await
        .unwrap();

    assert_eq!(task.status, TaskStatus::Completed);
    assert!(task.started_at.is_some());
    assert!(task.completed_at.is_some());
    let result = task.result.unwrap();
    assert!(result.success);
    assert_eq!(result.data, Some(json!(7)));
}

#[tokio::test(start_paused = true)]
async fn test_retry_backoff_delays_and_final_failure() {
    let manager = in_memory_manager();
    let attempts = Arc::new(Mutex::new(Vec::new()));
    let config = TaskConfig::default()
        .with_max_retries(3)
        .with_retry_delay(Duration::from_secs(1))
        .with_backoff(2.0);

    let id = manager
        .create_task("flaky", failing_call(Arc::clone(&attempts)), config)
        .await
        .unwrap();
    assert!(manager.start_task(&id, false).await.unwrap());

    let task = manager
        .wait_for_task(&id, Duration::from_secs(60))
        .await
        .unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.retry_count, 3);
    assert!(task.last_error.unwrap().contains("boom"));
    assert!(!task.result.unwrap().success);

    let attempts = attempts.lock().unwrap().clone();
    assert_eq!(attempts.len(), 4);
    let expected = [1, 2, 4];
    for (i, secs) in expected.iter().enumerate() {
        let gap = attempts[i + 1] - attempts[i];
        let want = Duration::from_secs(*secs);
        assert!(
            gap >= want && gap < want + Duration::from_millis(100),
            "第 {} 次重试间隔为 {:?}",
            i + 1,
            gap
        );
    }
}

#[tokio::test]
async fn test_auto_retry_disabled_fails_immediately() {
    let manager = in_memory_manager();
    let attempts = Arc::new(Mutex::new(Vec::new()));
    let id = manager
        .create_task(
            "once",
            failing_call(Arc::clone(&attempts)),
            TaskConfig::default().with_auto_retry(false),
        )
        .await
        .unwrap();

    manager.start_task(&id, false).await.unwrap();
    let task = manager
        .wait_for_task(&id, Duration::from_secs(5))
        .await
        .unwrap();

    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.retry_count, 0);
    assert_eq!(attempts.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_dependency_gating() {
    let manager = in_memory_manager();
    let a = manager
        .create_task("a", ok_call(json!("a")), TaskConfig::default())
        .await
        .unwrap();
    let b = manager
        .create_task(
            "b",
            ok_call(json!("b")),
            TaskConfig::default().with_dependencies(vec![a.clone()]),
        )
        .await
        .unwrap();

    assert!(!manager.start_task(&b, false).await.unwrap());
    assert_eq!(
        manager.get_task(&b).await.unwrap().status,
        TaskStatus::Pending
    );

    manager.start_task(&a, false).await.unwrap();
    manager
        .wait_for_task(&a, Duration::from_secs(5))
        .await
        .unwrap();

    assert!(manager.start_task(&b, false).await.unwrap());
    let task = manager
        .wait_for_task(&b, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
}

#[tokio::test]
async fn test_invalid_configs_rejected() {
    let manager = in_memory_manager();

    let err = manager
        .create_task(
            "bad-backoff",
            ok_call(Value::Null),
            TaskConfig::default().with_backoff(0.5),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::InvalidTaskConfig(_)));

    let err = manager
        .create_task(
            "unknown-dep",
            ok_call(Value::Null),
            TaskConfig::default().with_dependencies(vec!["missing".to_string()]),
        )
        .await
        .unwrap_err();
    assert!(err.is_registration_error());
    assert!(manager.list_tasks(None).await.is_empty());
}

#[tokio::test]
async fn test_already_running_task_is_not_restarted_without_force() {
    let manager = in_memory_manager();
    let slow = Call::new(from_async_fn("slow", |_ctx: InvocationContext| async {
        tokio::time::sleep(Duration::from_millis(200)).await;
        Ok(json!("slow"))
    }));
    let id = manager
        .create_task("slow", slow, TaskConfig::default())
        .await
        .unwrap();

    assert!(manager.start_task(&id, false).await.unwrap());
    assert!(!manager.start_task(&id, false).await.unwrap());

    manager
        .wait_for_task(&id, Duration::from_secs(5))
        .await
        .unwrap();
    assert!(!manager.start_task(&id, false).await.unwrap());
    assert!(manager.start_task(&id, true).await.unwrap());

    let task = manager
        .wait_for_task(&id, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_reaches_timeout_status() {
    let manager = in_memory_manager();
    let hang = Call::new(from_async_fn("hang", |_ctx: InvocationContext| async {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(Value::Null)
    }));
    let config = TaskConfig::default()
        .with_timeout(Duration::from_millis(100))
        .with_max_retries(1)
        .with_retry_delay(Duration::from_millis(10));

    let id = manager.create_task("hang", hang, config).await.unwrap();
    manager.start_task(&id, false).await.unwrap();

    let task = manager
        .wait_for_task(&id, Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(task.status, TaskStatus::Timeout);
    assert_eq!(task.retry_count, 1);
    assert!(task.last_error.unwrap().contains("100ms"));
}

#[tokio::test(start_paused = true)]
async fn test_cancel_running_task_stops_retries() {
    let manager = in_memory_manager();
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    let call = Call::new(from_async_fn("stubborn", move |_ctx: InvocationContext| {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            // 不检查取消令牌，一秒后失败
            tokio::time::sleep(Duration::from_secs(1)).await;
            Err(InvocationError::new("late failure"))
        }
    }));
    let config = TaskConfig::default()
        .with_max_retries(5)
        .with_retry_delay(Duration::from_millis(10));

    let id = manager.create_task("stubborn", call, config).await.unwrap();
    manager.start_task(&id, false).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    assert!(manager.cancel_task(&id).await.unwrap());
    assert_eq!(
        manager.get_task(&id).await.unwrap().status,
        TaskStatus::Cancelled
    );

    tokio::time::sleep(Duration::from_secs(60)).await;
    let task = manager.get_task(&id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Cancelled);
    assert_eq!(task.retry_count, 0);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    assert!(!manager.cancel_task(&id).await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_backoff() {
    let manager = in_memory_manager();
    let attempts = Arc::new(Mutex::new(Vec::new()));
    let config = TaskConfig::default()
        .with_max_retries(3)
        .with_retry_delay(Duration::from_secs(10));

    let id = manager
        .create_task("backoff", failing_call(Arc::clone(&attempts)), config)
        .await
        .unwrap();
    manager.start_task(&id, false).await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(
        manager.get_task(&id).await.unwrap().status,
        TaskStatus::Retrying
    );

    manager.cancel_task(&id).await.unwrap();
    tokio::time::sleep(Duration::from_secs(120)).await;

    assert_eq!(attempts.lock().unwrap().len(), 1);
    assert_eq!(
        manager.get_task(&id).await.unwrap().status,
        TaskStatus::Cancelled
    );
}

#[tokio::test(start_paused = true)]
async fn test_pause_discards_in_flight_result_and_resume_redispatches() {
    let manager = in_memory_manager();
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    let call = Call::new(from_async_fn("pausable", move |ctx: InvocationContext| {
        let counter = Arc::clone(&counter);
        async move {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                ctx.cancellation.cancelled().await;
                return Err(InvocationError::new("interrupted"));
            }
            Ok(json!("done"))
        }
    }));

    let id = manager
        .create_task("pausable", call, TaskConfig::default())
        .await
        .unwrap();
    manager.start_task(&id, false).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(manager.pause_task(&id).await.unwrap());
    tokio::time::sleep(Duration::from_secs(5)).await;
    let task = manager.get_task(&id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Paused);
    assert_eq!(task.retry_count, 0);
    assert!(!manager.pause_task(&id).await.unwrap());

    assert!(manager.resume_task(&id).await.unwrap());
    let task = manager
        .wait_for_task(&id, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.result.unwrap().data, Some(json!("done")));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_dependency_regression_fails_retry() {
    let manager = in_memory_manager();
    let a = manager
        .create_task("a", ok_call(json!(1)), TaskConfig::default())
        .await
        .unwrap();
    manager.start_task(&a, false).await.unwrap();
    manager
        .wait_for_task(&a, Duration::from_secs(5))
        .await
        .unwrap();

    let attempts = Arc::new(Mutex::new(Vec::new()));
    let b = manager
        .create_task(
            "b",
            failing_call(Arc::clone(&attempts)),
            TaskConfig::default()
                .with_dependencies(vec![a.clone()])
                .with_retry_delay(Duration::from_secs(5)),
        )
        .await
        .unwrap();
    manager.start_task(&b, false).await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;

    // 重试等待期间依赖消失
    assert!(manager.delete_task(&a).await.unwrap());

    let task = manager
        .wait_for_task(&b, Duration::from_secs(30))
        .await
        .unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.last_error.unwrap().contains(&a));
    assert_eq!(attempts.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_blocking_invocable_runs_on_worker_pool() {
    let manager = in_memory_manager();
    let call = Call::new(from_blocking_fn("cpu", |ctx: InvocationContext| {
        std::thread::sleep(Duration::from_millis(10));
        let n = ctx.arg(0).and_then(Value::as_u64).unwrap_or_default();
        Ok(json!((1..=n).sum::<u64>()))
    }))
    .with_args(vec![json!(10)]);

    let id = manager
        .create_task("cpu", call, TaskConfig::default())
        .await
        .unwrap();
    manager.start_task(&id, false).await.unwrap();

    let task = manager
        .wait_for_task(&id, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(task.result.unwrap().data, Some(json!(55)));
}

#[tokio::test]
async fn test_timed_out_blocking_call_keeps_worker_slot() {
    let config = TaskManagerConfig {
        persistence_enabled: false,
        max_blocking_workers: 1,
        ..Default::default()
    };
    let manager = TaskManager::new(config, Arc::new(MetricsCollector::new()));

    let active = Arc::new(AtomicU32::new(0));
    let peak = Arc::new(AtomicU32::new(0));
    let finished = Arc::new(AtomicU32::new(0));
    let mut ids = Vec::new();
    for name in ["slow-a", "slow-b"] {
        let (active, peak, finished) =
            (Arc::clone(&active), Arc::clone(&peak), Arc::clone(&finished));
        let call = Call::new(from_blocking_fn(name, move |_ctx: InvocationContext| {
            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(300));
            active.fetch_sub(1, Ordering::SeqCst);
            finished.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Null)
        }));
        let config = TaskConfig::default()
            .with_max_retries(0)
            .with_timeout(Duration::from_millis(50));
        ids.push(manager.create_task(name, call, config).await.unwrap());
    }
    for id in &ids {
        assert!(manager.start_task(id, false).await.unwrap());
    }

    for id in &ids {
        let task = manager
            .wait_for_task(id, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(task.status, TaskStatus::Timeout);
    }
    for _ in 0..100 {
        if finished.load(Ordering::SeqCst) == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    assert_eq!(finished.load(Ordering::SeqCst), 2);
    // 超时后第一个阻塞调用仍占着唯一名额，第二个只能在它结束后开始
    assert_eq!(peak.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_callbacks_and_misbehaving_subscribers() {
    let manager = in_memory_manager();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    manager.on_any(move |event| {
        sink.lock().unwrap().push(event.kind);
        Ok(())
    });
    manager.on(EventKind::TaskStarted, |_| panic!("subscriber panic"));
    manager.on(EventKind::TaskCompleted, |_| Err("subscriber error".to_string()));

    let id = manager
        .create_task("observed", ok_call(json!(true)), TaskConfig::default())
        .await
        .unwrap();
    manager.start_task(&id, false).await.unwrap();
    let task = manager
        .wait_for_task(&id, Duration::from_secs(5))
        .await
        .unwrap();

    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(
        *seen.lock().unwrap(),
        vec![
            EventKind::TaskCreated,
            EventKind::TaskStarted,
            EventKind::TaskCompleted
        ]
    );
}

#[tokio::test]
async fn test_stop_refuses_new_starts_and_cancels_active() {
    let manager = in_memory_manager();
    let slow = Call::new(from_async_fn("slow", |_ctx: InvocationContext| async {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(Value::Null)
    }));
    let running = manager
        .create_task("slow", slow, TaskConfig::default())
        .await
        .unwrap();
    let pending = manager
        .create_task("later", ok_call(Value::Null), TaskConfig::default())
        .await
        .unwrap();
    manager.start_task(&running, false).await.unwrap();

    manager.stop().await;
    assert!(!manager.is_running());
    assert_eq!(
        manager.get_task(&running).await.unwrap().status,
        TaskStatus::Cancelled
    );
    assert!(!manager.start_task(&pending, false).await.unwrap());

    manager.start().await;
    assert!(manager.start_task(&pending, false).await.unwrap());
}

#[tokio::test]
async fn test_delete_and_cleanup() {
    let manager = in_memory_manager();
    let done = manager
        .create_task("done", ok_call(Value::Null), TaskConfig::default())
        .await
        .unwrap();
    let idle = manager
        .create_task("idle", ok_call(Value::Null), TaskConfig::default())
        .await
        .unwrap();
    manager.start_task(&done, false).await.unwrap();
    manager
        .wait_for_task(&done, Duration::from_secs(5))
        .await
        .unwrap();

    // 保留窗口内的任务不会被清理
    assert_eq!(manager.cleanup_completed(Duration::from_secs(3600)).await, 0);
    assert_eq!(manager.cleanup_completed(Duration::ZERO).await, 1);
    assert!(manager.get_task(&done).await.is_none());
    assert!(manager.get_task(&idle).await.is_some());

    assert!(manager.delete_task(&idle).await.unwrap());
    assert!(!manager.delete_task(&idle).await.unwrap());
    assert_eq!(manager.metrics().await.total, 0);
}

#[tokio::test]
async fn test_metrics_and_health() {
    let manager = in_memory_manager();
    let ok = manager
        .create_task("ok", ok_call(Value::Null), TaskConfig::default())
        .await
        .unwrap();
    manager
        .create_task("waiting", ok_call(Value::Null), TaskConfig::default())
        .await
        .unwrap();
    manager.start_task(&ok, false).await.unwrap();
    manager
        .wait_for_task(&ok, Duration::from_secs(5))
        .await
        .unwrap();

    let metrics = manager.metrics().await;
    assert_eq!(metrics.total, 2);
    assert_eq!(metrics.completed, 1);
    assert_eq!(metrics.pending, 1);

    let health = manager.health().await;
    assert!(health.running);
    assert_eq!(health.details["total"], json!(2));
}
