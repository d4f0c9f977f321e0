//! 调度器集成测试：跑在内存存储与模拟执行器上，
//! 验证容量、公平性、余额守恒、重试上限与孤儿回收等行为。

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;

use gpu_scheduler_dispatcher::test_utils::{
    ExecBehavior, GpuServerBuilder, MockBalanceLedger, MockExecutor, MockTaskRepository,
    MockWorkerRepository, TaskBuilder,
};
use gpu_scheduler_dispatcher::{
    HealthMonitor, HealthMonitorConfig, RetryPolicy, SchedulerConfig, TaskScheduler,
};
use gpu_scheduler_domain::{
    entities::{GpuServerStatus, RechargeCode, Task, TaskStatus, WorkerHeartbeat},
    repositories::{BalanceLedger, TaskRepository, WorkerRepository},
    SchedulerError,
};

struct Harness {
    task_repo: Arc<MockTaskRepository>,
    worker_repo: Arc<MockWorkerRepository>,
    ledger: Arc<MockBalanceLedger>,
    executor: Arc<MockExecutor>,
    scheduler: TaskScheduler,
}

fn harness_with(executor: MockExecutor, max_retries_backoff_zero: bool) -> Harness {
    let task_repo = Arc::new(MockTaskRepository::new());
    let worker_repo = Arc::new(MockWorkerRepository::new());
    let ledger = Arc::new(MockBalanceLedger::new());
    let executor = Arc::new(executor);

    let retry_policy = if max_retries_backoff_zero {
        RetryPolicy {
            base_interval_seconds: 0,
            max_interval_seconds: 0,
            backoff_multiplier: 2.0,
            jitter_factor: 0.0,
        }
    } else {
        RetryPolicy::default()
    };

    let config = SchedulerConfig {
        tick_interval_seconds: 1,
        poll_interval_ms: 10,
        remote_call_timeout_ms: 1000,
        cancel_grace_period_ms: 200,
        max_poll_failures: 3,
    };

    let scheduler = TaskScheduler::new(
        task_repo.clone(),
        worker_repo.clone(),
        ledger.clone(),
        executor.clone(),
        retry_policy,
        config,
    );

    Harness {
        task_repo,
        worker_repo,
        ledger,
        executor,
        scheduler,
    }
}

fn harness() -> Harness {
    harness_with(MockExecutor::default(), true)
}

/// 任务永远停留在running的环境，用于只关心调度决策的测试
fn harness_run_forever() -> Harness {
    harness_with(MockExecutor::new(ExecBehavior::RunForever), true)
}

/// 兜底间隔拉到不可能触发，只有事件通知能唤醒调度循环
fn harness_event_driven() -> Harness {
    let task_repo = Arc::new(MockTaskRepository::new());
    let worker_repo = Arc::new(MockWorkerRepository::new());
    let ledger = Arc::new(MockBalanceLedger::new());
    let executor = Arc::new(MockExecutor::new(ExecBehavior::RunForever));

    let scheduler = TaskScheduler::new(
        task_repo.clone(),
        worker_repo.clone(),
        ledger.clone(),
        executor.clone(),
        RetryPolicy {
            base_interval_seconds: 0,
            max_interval_seconds: 0,
            backoff_multiplier: 2.0,
            jitter_factor: 0.0,
        },
        SchedulerConfig {
            tick_interval_seconds: 3600,
            poll_interval_ms: 10,
            remote_call_timeout_ms: 1000,
            cancel_grace_period_ms: 200,
            max_poll_failures: 3,
        },
    );

    Harness {
        task_repo,
        worker_repo,
        ledger,
        executor,
        scheduler,
    }
}

fn load_snapshot(current_tasks: i32) -> WorkerHeartbeat {
    WorkerHeartbeat {
        current_tasks,
        cpu_usage: None,
        memory_usage: None,
        gpu_usage: None,
        timestamp: Utc::now(),
    }
}

async fn submit_task(h: &Harness, task: &Task) {
    h.task_repo.insert(task.clone());
    h.scheduler.submit(task).await;
}

/// 轮询等待条件成立，超时则失败
async fn wait_for<F, Fut>(description: &str, timeout_ms: u64, condition: F)
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        if condition().await {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("等待超时: {description}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// 等待任务进入目标状态
async fn wait_for_status(h: &Harness, task_id: &str, status: TaskStatus) {
    let repo = h.task_repo.clone();
    let id = task_id.to_string();
    wait_for(&format!("任务进入{status:?}"), 5000, move || {
        let repo = repo.clone();
        let id = id.clone();
        async move {
            repo.get_by_id(&id)
                .await
                .unwrap()
                .map(|t| t.status == status)
                .unwrap_or(false)
        }
    })
    .await;
}

async fn task_status(h: &Harness, task_id: &str) -> TaskStatus {
    h.task_repo
        .get_by_id(task_id)
        .await
        .unwrap()
        .map(|t| t.status)
        .expect("task exists")
}

#[tokio::test(flavor = "multi_thread")]
async fn test_dispatch_and_settle_end_to_end() {
    let h = harness();
    h.ledger.set_balance("user-1", 20.0);
    h.worker_repo.insert(GpuServerBuilder::new().id("gpu-1").build());

    // 预估10，实际7：完成后余额应为 20 - 7 = 13
    let task = TaskBuilder::new().cost_estimate(10.0).build();
    h.executor.set_behavior(
        &task.id,
        ExecBehavior::CompleteAfterPolls {
            polls: 2,
            actual_cost: 7.0,
        },
    );
    submit_task(&h, &task).await;
    tokio::spawn(h.scheduler.clone().run());

    wait_for_status(&h, &task.id, TaskStatus::Completed).await;

    let finished = h.task_repo.get_by_id(&task.id).await.unwrap().unwrap();
    assert_eq!(finished.status, TaskStatus::Completed);
    assert_eq!(finished.cost, 7.0);
    assert_eq!(finished.progress, 100.0);
    assert!(finished.result.is_some());
    assert!(finished.completed_at.is_some());

    // 余额守恒：13余额 + 0预留 + 7结算 = 初始20
    assert_eq!(h.ledger.balance("user-1").await.unwrap(), 13.0);
    assert_eq!(h.ledger.open_reservations(), 0);
    assert_eq!(h.ledger.settled_total(), 7.0);
    // 槽位已归还
    assert_eq!(h.worker_repo.current_tasks("gpu-1"), 0);

    h.scheduler.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_insufficient_balance_fails_without_consuming_slot() {
    let h = harness_run_forever();
    h.ledger.set_balance("user-1", 5.0);
    h.worker_repo.insert(GpuServerBuilder::new().id("gpu-1").build());

    let expensive = TaskBuilder::new().cost_estimate(10.0).priority(9).build();
    let affordable = TaskBuilder::new().cost_estimate(3.0).priority(1).build();
    h.task_repo.insert(expensive.clone());
    h.task_repo.insert(affordable.clone());
    h.scheduler.submit(&expensive).await;
    h.scheduler.submit(&affordable).await;

    let dispatched = h.scheduler.tick().await.unwrap();
    // 高优任务因余额不足被拒绝，但没有占用槽位，低优任务照常下发
    assert_eq!(dispatched, 1);

    let failed = h.task_repo.get_by_id(&expensive.id).await.unwrap().unwrap();
    assert_eq!(failed.status, TaskStatus::Failed);
    assert_eq!(failed.error_message.as_deref(), Some("insufficient_balance"));

    assert_eq!(task_status(&h, &affordable.id).await, TaskStatus::Running);
    // 余额只被低优任务冻结
    assert_eq!(h.ledger.balance("user-1").await.unwrap(), 2.0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_capacity_never_exceeded() {
    let h = harness_run_forever();
    h.ledger.set_balance("user-1", 1000.0);
    h.worker_repo.insert(
        GpuServerBuilder::new()
            .id("gpu-1")
            .max_concurrent_tasks(2)
            .build(),
    );

    let mut tasks = Vec::new();
    for i in 0..8 {
        let task = TaskBuilder::new().title(&format!("task-{i}")).build();
        h.task_repo.insert(task.clone());
        h.scheduler.submit(&task).await;
        tasks.push(task);
    }

    let dispatched = h.scheduler.tick().await.unwrap();
    assert_eq!(dispatched, 2);
    assert_eq!(h.worker_repo.current_tasks("gpu-1"), 2);
    assert_eq!(
        h.task_repo.count_by_status(TaskStatus::Running).await.unwrap(),
        2
    );

    // 再tick一次也不会超额
    let dispatched = h.scheduler.tick().await.unwrap();
    assert_eq!(dispatched, 0);
    assert_eq!(h.worker_repo.current_tasks("gpu-1"), 2);
    assert_eq!(h.scheduler.queue_length(), 6);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_priority_then_fifo_dispatch_order() {
    let h = harness_run_forever();
    h.ledger.set_balance("user-1", 1000.0);
    h.worker_repo.insert(
        GpuServerBuilder::new()
            .id("gpu-1")
            .max_concurrent_tasks(2)
            .build(),
    );

    let t0 = Utc::now();
    let low = TaskBuilder::new().priority(1).created_at(t0).build();
    let high_late = TaskBuilder::new()
        .priority(9)
        .created_at(t0 + chrono::Duration::seconds(2))
        .build();
    let high_early = TaskBuilder::new()
        .priority(9)
        .created_at(t0 + chrono::Duration::seconds(1))
        .build();

    for task in [&low, &high_late, &high_early] {
        h.task_repo.insert((*task).clone());
        h.scheduler.submit(task).await;
    }

    h.scheduler.tick().await.unwrap();

    // 两个高优先级先走，同优先级中较早创建者先被认领
    assert_eq!(task_status(&h, &high_early.id).await, TaskStatus::Running);
    assert_eq!(task_status(&h, &high_late.id).await, TaskStatus::Running);
    assert_eq!(task_status(&h, &low.id).await, TaskStatus::Pending);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_retry_bound_is_max_retries_plus_one() {
    let executor = MockExecutor::new(ExecBehavior::FailExecution {
        after_polls: 1,
        message: "模拟OOM".to_string(),
        retryable: true,
    });
    let h = harness_with(executor, true);
    h.ledger.set_balance("user-1", 100.0);
    h.worker_repo.insert(GpuServerBuilder::new().id("gpu-1").build());

    let task = TaskBuilder::new().max_retries(2).cost_estimate(5.0).build();
    submit_task(&h, &task).await;
    tokio::spawn(h.scheduler.clone().run());

    wait_for_status(&h, &task.id, TaskStatus::Failed).await;

    // max_retries=2 意味着总共 3 次执行尝试
    assert_eq!(h.executor.start_count(&task.id), 3);
    let failed = h.task_repo.get_by_id(&task.id).await.unwrap().unwrap();
    assert_eq!(failed.retry_count, 2);

    // 终态失败全额退还预留，未产生任何扣费
    assert_eq!(h.ledger.balance("user-1").await.unwrap(), 100.0);
    assert_eq!(h.ledger.open_reservations(), 0);
    assert_eq!(h.worker_repo.current_tasks("gpu-1"), 0);

    h.scheduler.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_non_retryable_failure_goes_terminal_immediately() {
    let executor = MockExecutor::new(ExecBehavior::FailExecution {
        after_polls: 1,
        message: "配置无效".to_string(),
        retryable: false,
    });
    let h = harness_with(executor, true);
    h.ledger.set_balance("user-1", 100.0);
    h.worker_repo.insert(GpuServerBuilder::new().id("gpu-1").build());

    let task = TaskBuilder::new().max_retries(3).build();
    submit_task(&h, &task).await;
    tokio::spawn(h.scheduler.clone().run());

    wait_for_status(&h, &task.id, TaskStatus::Failed).await;

    // 不可重试的失败只执行一次
    assert_eq!(h.executor.start_count(&task.id), 1);
    h.scheduler.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_dispatch_failure_consumes_retry_budget() {
    let h = harness();
    h.ledger.set_balance("user-1", 100.0);
    h.worker_repo.insert(GpuServerBuilder::new().id("gpu-1").build());

    // 启动永远失败：耗尽重试额度后进入失败终态
    let task = TaskBuilder::new().max_retries(3).build();
    h.executor.set_behavior(&task.id, ExecBehavior::FailStart);
    submit_task(&h, &task).await;
    tokio::spawn(h.scheduler.clone().run());

    wait_for_status(&h, &task.id, TaskStatus::Failed).await;

    let failed = h.task_repo.get_by_id(&task.id).await.unwrap().unwrap();
    assert_eq!(h.executor.start_count(&task.id), 4);
    assert_eq!(failed.retry_count, 3);
    assert!(failed
        .error_message
        .as_deref()
        .unwrap()
        .starts_with("dispatch_failure"));
    // 每次失败的预留都已退还
    assert_eq!(h.ledger.balance("user-1").await.unwrap(), 100.0);
    assert_eq!(h.worker_repo.current_tasks("gpu-1"), 0);
    h.scheduler.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cancel_pending_task() {
    let h = harness();
    h.ledger.set_balance("user-1", 100.0);

    // 没有可用Worker，任务停留在队列里
    let task = TaskBuilder::new().build();
    submit_task(&h, &task).await;
    assert_eq!(h.scheduler.queue_length(), 1);

    let cancelled = h.scheduler.cancel(&task.id).await.unwrap();
    assert_eq!(cancelled.status, TaskStatus::Cancelled);
    assert_eq!(h.scheduler.queue_length(), 0);

    // 终态任务再取消是非法迁移
    let err = h.scheduler.cancel(&task.id).await.unwrap_err();
    assert!(matches!(err, SchedulerError::InvalidStateTransition { .. }));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cancel_running_task_releases_slot_and_reservation() {
    let executor = MockExecutor::new(ExecBehavior::RunForever);
    let h = harness_with(executor, true);
    h.ledger.set_balance("user-1", 100.0);
    h.worker_repo.insert(GpuServerBuilder::new().id("gpu-1").build());

    let task = TaskBuilder::new().cost_estimate(10.0).build();
    submit_task(&h, &task).await;
    h.scheduler.tick().await.unwrap();
    assert_eq!(task_status(&h, &task.id).await, TaskStatus::Running);
    assert_eq!(h.ledger.balance("user-1").await.unwrap(), 90.0);

    let cancelled = h.scheduler.cancel(&task.id).await.unwrap();
    assert_eq!(cancelled.status, TaskStatus::Cancelled);
    assert!(h.executor.was_cancelled(&task.id));

    // 槽位与预留全部回收，费用为0
    assert_eq!(h.worker_repo.current_tasks("gpu-1"), 0);
    assert_eq!(h.ledger.balance("user-1").await.unwrap(), 100.0);
    assert_eq!(h.ledger.open_reservations(), 0);
    assert_eq!(cancelled.cost, 0.0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_user_retry_rearms_failed_task() {
    let h = harness_run_forever();
    h.ledger.set_balance("user-1", 1.0);
    h.worker_repo.insert(GpuServerBuilder::new().id("gpu-1").build());

    // 余额不足直接进入failed终态
    let task = TaskBuilder::new().cost_estimate(50.0).build();
    submit_task(&h, &task).await;
    h.scheduler.tick().await.unwrap();
    assert_eq!(task_status(&h, &task.id).await, TaskStatus::Failed);

    // 充值后用户主动重试
    h.ledger.set_balance("user-1", 100.0);
    let rearmed = h.scheduler.retry(&task.id).await.unwrap();
    assert_eq!(rearmed.status, TaskStatus::Pending);
    assert_eq!(rearmed.retry_count, 0);
    assert!(rearmed.error_message.is_none());

    h.scheduler.tick().await.unwrap();
    assert_eq!(task_status(&h, &task.id).await, TaskStatus::Running);

    // running状态不允许重试
    let err = h.scheduler.retry(&task.id).await.unwrap_err();
    assert!(matches!(err, SchedulerError::InvalidStateTransition { .. }));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_worker_offline_orphans_are_requeued() {
    let executor = MockExecutor::new(ExecBehavior::RunForever);
    let h = harness_with(executor, true);
    h.ledger.set_balance("user-1", 100.0);
    h.worker_repo.insert(
        GpuServerBuilder::new()
            .id("gpu-1")
            .max_concurrent_tasks(2)
            .build(),
    );

    let t1 = TaskBuilder::new().cost_estimate(5.0).build();
    let t2 = TaskBuilder::new().cost_estimate(5.0).max_retries(0).build();
    submit_task(&h, &t1).await;
    submit_task(&h, &t2).await;
    h.scheduler.tick().await.unwrap();
    assert_eq!(h.ledger.balance("user-1").await.unwrap(), 90.0);

    h.worker_repo
        .update_status("gpu-1", GpuServerStatus::Offline)
        .await
        .unwrap();
    h.scheduler.handle_worker_offline("gpu-1").await.unwrap();

    // 有重试额度的任务回到pending，额度耗尽的进入failed
    let repo = h.task_repo.clone();
    let (id1, id2) = (t1.id.clone(), t2.id.clone());
    wait_for("孤儿任务处理完成", 3000, move || {
        let repo = repo.clone();
        let (id1, id2) = (id1.clone(), id2.clone());
        async move {
            let s1 = repo.get_by_id(&id1).await.unwrap().unwrap().status;
            let s2 = repo.get_by_id(&id2).await.unwrap().unwrap().status;
            s1 == TaskStatus::Pending && s2 == TaskStatus::Failed
        }
    })
    .await;

    // 两个预留都已退还
    assert_eq!(h.ledger.balance("user-1").await.unwrap(), 100.0);
    assert_eq!(h.ledger.open_reservations(), 0);
    assert_eq!(h.worker_repo.current_tasks("gpu-1"), 0);

    let failed = h.task_repo.get_by_id(&t2.id).await.unwrap().unwrap();
    assert!(failed
        .error_message
        .as_deref()
        .unwrap()
        .starts_with("orphaned_task"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_restore_rebuilds_queue_from_pending_tasks() {
    let h = harness_run_forever();
    h.ledger.set_balance("user-1", 100.0);

    // 模拟重启前遗留的pending任务：只写存储，不走submit
    let t1 = TaskBuilder::new().priority(3).build();
    let t2 = TaskBuilder::new().priority(7).build();
    h.task_repo.insert(t1.clone());
    h.task_repo.insert(t2.clone());

    h.scheduler.restore().await.unwrap();
    assert_eq!(h.scheduler.queue_length(), 2);

    h.worker_repo.insert(
        GpuServerBuilder::new()
            .id("gpu-1")
            .max_concurrent_tasks(1)
            .build(),
    );
    h.scheduler.tick().await.unwrap();
    // 高优先级先被恢复调度
    assert_eq!(task_status(&h, &t2.id).await, TaskStatus::Running);
    assert_eq!(task_status(&h, &t1.id).await, TaskStatus::Pending);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_concurrent_reserve_cannot_overdraw() {
    let h = harness();
    h.ledger.set_balance("user-1", 10.0);

    let ledger = h.ledger.clone();
    let attempts: Vec<_> = (0..10)
        .map(|i| {
            let ledger = ledger.clone();
            tokio::spawn(async move {
                ledger.reserve("user-1", &format!("task-{i}"), 7.0).await
            })
        })
        .collect();

    let results = join_all(attempts).await;
    let successes = results
        .iter()
        .filter(|r| r.as_ref().unwrap().is_ok())
        .count();
    // 余额10只够一笔7.0的预留
    assert_eq!(successes, 1);
    assert_eq!(h.ledger.balance("user-1").await.unwrap(), 3.0);
    assert_eq!(h.ledger.total_held("user-1"), 10.0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_concurrent_redeem_respects_max_uses() {
    let h = harness();
    let code = RechargeCode::new(50.0, 1, None, "admin".to_string());
    h.ledger.create_code(&code).await.unwrap();

    let attempts: Vec<_> = (0..10)
        .map(|i| {
            let ledger = h.ledger.clone();
            let code = code.code.clone();
            tokio::spawn(async move { ledger.redeem(&format!("user-{i}"), &code).await })
        })
        .collect();

    let results = join_all(attempts).await;
    let mut successes = 0;
    let mut exhausted = 0;
    for result in results {
        match result.unwrap() {
            Ok(outcome) => {
                successes += 1;
                assert_eq!(outcome.amount, 50.0);
            }
            Err(SchedulerError::CodeExhausted) => exhausted += 1,
            Err(e) => panic!("意外错误: {e}"),
        }
    }
    // max_uses=1，并发兑换恰好一人成功
    assert_eq!(successes, 1);
    assert_eq!(exhausted, 9);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_redeem_expired_code_rejected() {
    let h = harness();
    let expired = RechargeCode::new(
        50.0,
        10,
        Some(Utc::now() - chrono::Duration::hours(1)),
        "admin".to_string(),
    );
    h.ledger.create_code(&expired).await.unwrap();

    let err = h.ledger.redeem("user-1", &expired.code).await.unwrap_err();
    assert!(matches!(err, SchedulerError::CodeExpired));

    let err = h.ledger.redeem("user-1", "NOSUCHCODE").await.unwrap_err();
    assert!(matches!(err, SchedulerError::CodeInvalid));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_health_monitor_marks_stale_workers_offline() {
    let executor = MockExecutor::new(ExecBehavior::RunForever);
    let h = harness_with(executor, true);
    h.ledger.set_balance("user-1", 100.0);

    let stale = GpuServerBuilder::new()
        .id("gpu-stale")
        .last_heartbeat(Some(Utc::now() - chrono::Duration::seconds(120)))
        .build();
    let slow = GpuServerBuilder::new()
        .id("gpu-slow")
        .last_heartbeat(Some(Utc::now() - chrono::Duration::seconds(60)))
        .build();
    let healthy = GpuServerBuilder::new()
        .id("gpu-ok")
        .last_heartbeat(Some(Utc::now()))
        .build();
    h.worker_repo.insert(stale);
    h.worker_repo.insert(slow);
    h.worker_repo.insert(healthy);

    let monitor = HealthMonitor::new(
        h.worker_repo.clone(),
        h.scheduler.clone(),
        HealthMonitorConfig {
            heartbeat_timeout_seconds: 90,
            check_interval_seconds: 1,
        },
    );
    let transitioned = monitor.check_once().await.unwrap();
    assert_eq!(transitioned, 2);

    let status = |id: &str| {
        let repo = h.worker_repo.clone();
        let id = id.to_string();
        async move { repo.get_by_id(&id).await.unwrap().unwrap().status }
    };
    assert_eq!(status("gpu-stale").await, GpuServerStatus::Offline);
    assert_eq!(status("gpu-slow").await, GpuServerStatus::Degraded);
    assert_eq!(status("gpu-ok").await, GpuServerStatus::Online);

    // 心跳恢复后重新上线
    h.worker_repo
        .register_heartbeat("gpu-stale", &load_snapshot(0))
        .await
        .unwrap();
    assert_eq!(status("gpu-stale").await, GpuServerStatus::Online);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_heartbeat_applies_load_snapshot() {
    let h = harness();
    h.worker_repo.insert(
        GpuServerBuilder::new()
            .id("gpu-1")
            .max_concurrent_tasks(4)
            .build(),
    );

    h.worker_repo
        .register_heartbeat("gpu-1", &load_snapshot(3))
        .await
        .unwrap();
    assert_eq!(h.worker_repo.current_tasks("gpu-1"), 3);

    // 越界的上报截断到 0..=max_concurrent_tasks
    h.worker_repo
        .register_heartbeat("gpu-1", &load_snapshot(99))
        .await
        .unwrap();
    assert_eq!(h.worker_repo.current_tasks("gpu-1"), 4);

    h.worker_repo
        .register_heartbeat("gpu-1", &load_snapshot(-2))
        .await
        .unwrap();
    assert_eq!(h.worker_repo.current_tasks("gpu-1"), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_heartbeat_notify_wakes_scheduler_before_fallback_interval() {
    let h = harness_event_driven();
    h.ledger.set_balance("user-1", 100.0);

    let task = TaskBuilder::new().build();
    submit_task(&h, &task).await;
    tokio::spawn(h.scheduler.clone().run());

    // 提交触发的那次tick没有可用Worker，任务留在队列
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(task_status(&h, &task.id).await, TaskStatus::Pending);
    assert_eq!(h.scheduler.queue_length(), 1);

    // 离线的GPU上报心跳恢复在线，通知应立即驱动调度而不等兜底间隔
    h.worker_repo.insert(
        GpuServerBuilder::new()
            .id("gpu-1")
            .status(GpuServerStatus::Offline)
            .build(),
    );
    h.worker_repo
        .register_heartbeat("gpu-1", &load_snapshot(0))
        .await
        .unwrap();
    h.scheduler.notify_tick();

    wait_for_status(&h, &task.id, TaskStatus::Running).await;
    h.scheduler.stop().await;
}
