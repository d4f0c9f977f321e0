use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use gpu_scheduler_domain::{
    entities::{BalanceReservation, GpuServer, Task, TaskStatus},
    executor::{ExecutionReport, RemoteExecutor},
    repositories::{BalanceLedger, TaskRepository, WorkerRepository},
    SchedulerError, SchedulerResult,
};

use crate::ready_queue::ReadyQueue;
use crate::retry_policy::RetryPolicy;

/// 调度循环配置
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// 兜底调度间隔（秒），事件触发之外的固定轮询
    pub tick_interval_seconds: u64,
    /// 执行器进度轮询间隔（毫秒）
    pub poll_interval_ms: u64,
    /// 单次远程调用超时（毫秒）
    pub remote_call_timeout_ms: u64,
    /// 取消确认的宽限期（毫秒），超过后强制置为cancelled
    pub cancel_grace_period_ms: u64,
    /// 连续轮询失败多少次后按执行失败处理
    pub max_poll_failures: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_seconds: 5,
            poll_interval_ms: 1000,
            remote_call_timeout_ms: 10_000,
            cancel_grace_period_ms: 5_000,
            max_poll_failures: 3,
        }
    }
}

struct SchedulerInner {
    task_repo: Arc<dyn TaskRepository>,
    worker_repo: Arc<dyn WorkerRepository>,
    ledger: Arc<dyn BalanceLedger>,
    executor: Arc<dyn RemoteExecutor>,
    retry_policy: RetryPolicy,
    config: SchedulerConfig,
    /// 就绪队列，仅在短临界区内访问，持锁期间不await
    queue: std::sync::Mutex<ReadyQueue>,
    /// 匹配临界区锁：出队+预留余额+占用槽位作为一个串行步骤执行
    dispatch_lock: tokio::sync::Mutex<()>,
    /// 运行中任务持有的余额预留（进程内快路径，重启后从账本回查）
    reservations: std::sync::Mutex<HashMap<String, BalanceReservation>>,
    notify: Notify,
    running: tokio::sync::RwLock<bool>,
}

/// 调度器句柄：唯一的调度权威，clone为廉价的引用复制。
/// 持有就绪队列、Worker注册表与余额账本的引用，由进程构造一次，
/// 提交入口、心跳入口与执行器回调都通过它驱动，不存在全局调度状态。
#[derive(Clone)]
pub struct TaskScheduler {
    inner: Arc<SchedulerInner>,
}

impl TaskScheduler {
    pub fn new(
        task_repo: Arc<dyn TaskRepository>,
        worker_repo: Arc<dyn WorkerRepository>,
        ledger: Arc<dyn BalanceLedger>,
        executor: Arc<dyn RemoteExecutor>,
        retry_policy: RetryPolicy,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                task_repo,
                worker_repo,
                ledger,
                executor,
                retry_policy,
                config,
                queue: std::sync::Mutex::new(ReadyQueue::new()),
                dispatch_lock: tokio::sync::Mutex::new(()),
                reservations: std::sync::Mutex::new(HashMap::new()),
                notify: Notify::new(),
                running: tokio::sync::RwLock::new(false),
            }),
        }
    }

    pub fn queue_length(&self) -> usize {
        self.inner.queue.lock().expect("queue lock poisoned").len()
    }

    /// 崩溃恢复：pending任务重建就绪队列，running任务重新挂上进度监视
    pub async fn restore(&self) -> SchedulerResult<()> {
        let pending = self.inner.task_repo.list_by_status(TaskStatus::Pending).await?;
        let pending_count = pending.len();
        {
            let mut queue = self.inner.queue.lock().expect("queue lock poisoned");
            for task in &pending {
                queue.enqueue(task);
            }
        }

        let running = self.inner.task_repo.list_by_status(TaskStatus::Running).await?;
        let running_count = running.len();
        for task in running {
            let Some(server_id) = task.gpu_server_id.clone() else {
                warn!("running任务 {} 没有关联的GPU服务器，按孤儿处理", task.id);
                self.orphan_task(&task.id, "unknown").await;
                continue;
            };
            match self.inner.worker_repo.get_by_id(&server_id).await? {
                Some(server) => self.spawn_watcher(task.id.clone(), server),
                None => self.orphan_task(&task.id, &server_id).await,
            }
        }

        info!(
            "调度器恢复完成: 重建就绪队列 {} 个任务，重挂监视 {} 个运行中任务",
            pending_count, running_count
        );
        Ok(())
    }

    /// 提交入口：任务已由API层写入存储，此处入队并触发一次调度
    pub async fn submit(&self, task: &Task) {
        {
            let mut queue = self.inner.queue.lock().expect("queue lock poisoned");
            queue.enqueue(task);
        }
        debug!("任务 {} 已入队，优先级 {}", task.id, task.priority);
        self.inner.notify.notify_one();
    }

    /// 外部事件触发一次调度，不等兜底间隔。
    /// 心跳让Worker恢复可用、槽位被释放等时机由调用方驱动。
    pub fn notify_tick(&self) {
        self.inner.notify.notify_one();
    }

    /// 启动调度循环：事件触发与固定间隔兜底轮询
    pub async fn run(self) {
        {
            let mut running = self.inner.running.write().await;
            *running = true;
        }
        info!(
            "调度循环启动，兜底间隔 {} 秒",
            self.inner.config.tick_interval_seconds
        );

        let interval = Duration::from_secs(self.inner.config.tick_interval_seconds);
        loop {
            if !*self.inner.running.read().await {
                info!("收到停止信号，退出调度循环");
                break;
            }

            tokio::select! {
                _ = self.inner.notify.notified() => {}
                _ = tokio::time::sleep(interval) => {}
            }

            if let Err(e) = self.tick().await {
                // 单次tick的失败不能阻塞后续调度
                error!("调度tick出错: {}", e);
            }
        }
    }

    pub async fn stop(&self) {
        let mut running = self.inner.running.write().await;
        *running = false;
        self.inner.notify.notify_one();
    }

    /// 一次调度匹配。出队、预留余额、占用槽位在同一临界区内完成，
    /// 远程启动在临界区外执行，慢启动不阻塞其他调度决策。
    pub async fn tick(&self) -> SchedulerResult<usize> {
        let guard = self.inner.dispatch_lock.lock().await;

        let mut workers = self.inner.worker_repo.list_available().await?;
        if workers.is_empty() {
            return Ok(0);
        }
        // 空闲槽位多者优先，同槽位按id升序保证确定性
        workers.sort_by(|a, b| {
            b.free_slots()
                .cmp(&a.free_slots())
                .then_with(|| a.id.cmp(&b.id))
        });

        let mut plans: Vec<(Task, GpuServer)> = Vec::new();
        'workers: for worker in workers {
            let mut free = worker.free_slots();
            while free > 0 {
                let next = {
                    let mut queue = self.inner.queue.lock().expect("queue lock poisoned");
                    queue.pop()
                };
                let Some(task_id) = next else {
                    break 'workers;
                };

                match self.claim_task(&task_id, &worker).await {
                    Ok(Some(task)) => {
                        free -= 1;
                        plans.push((task, worker.clone()));
                    }
                    // 任务被跳过（已取消/余额不足等），槽位未消耗
                    Ok(None) => continue,
                    Err(e) => {
                        // 存储层故障：任务放回队列，留待下个tick
                        error!("认领任务 {} 失败: {}", task_id, e);
                        self.requeue_by_id(&task_id).await;
                        break 'workers;
                    }
                }
            }
        }
        drop(guard);

        let dispatched = plans.len();
        for (task, server) in plans {
            self.spawn_execution(task, server);
        }

        if dispatched > 0 {
            info!("本次调度下发了 {} 个任务", dispatched);
        }
        Ok(dispatched)
    }

    /// 临界区内的认领步骤：余额预留 + 槽位占用 + 状态置为running。
    /// 返回Ok(None)表示该任务被跳过且未消耗Worker槽位。
    async fn claim_task(
        &self,
        task_id: &str,
        worker: &GpuServer,
    ) -> SchedulerResult<Option<Task>> {
        let Some(mut task) = self.inner.task_repo.get_by_id(task_id).await? else {
            warn!("就绪队列中的任务 {} 已不存在", task_id);
            return Ok(None);
        };
        // 排队期间被取消的任务直接丢弃
        if task.status != TaskStatus::Pending {
            debug!("任务 {} 状态为 {:?}，跳过调度", task.id, task.status);
            return Ok(None);
        }

        let estimate = task.cost_estimate();
        let reservation = match self
            .inner
            .ledger
            .reserve(&task.user_id, &task.id, estimate)
            .await
        {
            Ok(r) => r,
            Err(SchedulerError::InsufficientBalance { .. }) => {
                warn!("任务 {} 余额不足（需要 {}），标记为失败", task.id, estimate);
                self.finalize_failed(&mut task, "insufficient_balance").await?;
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        if !self.inner.worker_repo.try_acquire_slot(&worker.id).await? {
            // 槽位视图过期（并发心跳把负载刷高了），退还预留并放回队列
            debug!("GPU服务器 {} 槽位已满，任务 {} 放回队列", worker.id, task.id);
            self.inner.ledger.release(&reservation.id).await?;
            self.requeue_by_id(&task.id).await;
            return Ok(None);
        }

        task.gpu_server_id = Some(worker.id.clone());
        if let Err((from, to)) = task.transition_to(TaskStatus::Running) {
            // 认领竞争中任务已进入终态，回滚预留与槽位
            self.inner.ledger.release(&reservation.id).await?;
            self.inner.worker_repo.release_slot(&worker.id).await?;
            return Err(SchedulerError::InvalidStateTransition { from, to });
        }
        self.inner.task_repo.update(&task).await?;

        self.inner
            .reservations
            .lock()
            .expect("reservations lock poisoned")
            .insert(task.id.clone(), reservation);

        info!(
            "任务 {} 已分派到GPU服务器 {} (优先级 {})",
            task.id, worker.id, task.priority
        );
        Ok(Some(task))
    }

    /// 远程启动与进度监视，在调度临界区之外执行
    fn spawn_execution(&self, task: Task, server: GpuServer) {
        let scheduler = self.clone();
        tokio::spawn(async move {
            let call_timeout =
                Duration::from_millis(scheduler.inner.config.remote_call_timeout_ms);
            let start_result =
                timeout(call_timeout, scheduler.inner.executor.start(&task, &server)).await;

            match start_result {
                Ok(Ok(())) => {
                    debug!("任务 {} 在 {} 上启动成功", task.id, server.id);
                    scheduler.watch_execution(task.id.clone(), server).await;
                }
                Ok(Err(e)) => {
                    warn!("任务 {} 远程启动失败: {}", task.id, e);
                    scheduler
                        .fail_running_task(&task.id, &format!("dispatch_failure: {e}"), true)
                        .await;
                }
                Err(_) => {
                    warn!("任务 {} 远程启动超时", task.id);
                    scheduler
                        .fail_running_task(&task.id, "dispatch_failure: 启动超时", true)
                        .await;
                }
            }
        });
    }

    fn spawn_watcher(&self, task_id: String, server: GpuServer) {
        let scheduler = self.clone();
        tokio::spawn(async move {
            scheduler.watch_execution(task_id, server).await;
        });
    }

    /// 按固定间隔轮询执行器，把进度与终态折算回任务记录。
    /// 每次远程调用都有超时，连续失败达到上限按执行失败处理。
    async fn watch_execution(&self, task_id: String, server: GpuServer) {
        let poll_interval = Duration::from_millis(self.inner.config.poll_interval_ms);
        let call_timeout = Duration::from_millis(self.inner.config.remote_call_timeout_ms);
        let mut consecutive_failures: u32 = 0;

        loop {
            tokio::time::sleep(poll_interval).await;

            // 任务可能已被取消或强制终结，监视随之退出
            match self.inner.task_repo.get_by_id(&task_id).await {
                Ok(Some(task)) if task.is_running() => {}
                Ok(_) => {
                    debug!("任务 {} 不再处于running状态，停止监视", task_id);
                    return;
                }
                Err(e) => {
                    error!("读取任务 {} 失败: {}", task_id, e);
                    continue;
                }
            }

            let report = match timeout(
                call_timeout,
                self.inner.executor.poll(&task_id, &server),
            )
            .await
            {
                Ok(Ok(report)) => {
                    consecutive_failures = 0;
                    report
                }
                Ok(Err(e)) => {
                    consecutive_failures += 1;
                    warn!(
                        "轮询任务 {} 失败 ({}/{}): {}",
                        task_id, consecutive_failures, self.inner.config.max_poll_failures, e
                    );
                    if consecutive_failures >= self.inner.config.max_poll_failures {
                        self.fail_running_task(
                            &task_id,
                            &format!("execution_failure: 轮询连续失败: {e}"),
                            true,
                        )
                        .await;
                        return;
                    }
                    continue;
                }
                Err(_) => {
                    consecutive_failures += 1;
                    warn!(
                        "轮询任务 {} 超时 ({}/{})",
                        task_id, consecutive_failures, self.inner.config.max_poll_failures
                    );
                    if consecutive_failures >= self.inner.config.max_poll_failures {
                        self.fail_running_task(&task_id, "execution_failure: 轮询超时", true)
                            .await;
                        return;
                    }
                    continue;
                }
            };

            match report {
                ExecutionReport::Running { progress } => {
                    let clamped = progress.clamp(0.0, 100.0);
                    if let Err(e) = self.inner.task_repo.update_progress(&task_id, clamped).await {
                        warn!("更新任务 {} 进度失败: {}", task_id, e);
                    }
                }
                ExecutionReport::Completed {
                    result,
                    actual_cost,
                } => {
                    if let Err(e) = self.complete_task(&task_id, result, actual_cost).await {
                        error!("完结任务 {} 失败: {}", task_id, e);
                    }
                    return;
                }
                ExecutionReport::Failed { message, retryable } => {
                    self.fail_running_task(&task_id, &message, retryable).await;
                    return;
                }
            }
        }
    }

    /// 执行成功：按实际费用结算预留，释放槽位，任务进入completed终态
    async fn complete_task(
        &self,
        task_id: &str,
        result: serde_json::Value,
        actual_cost: f64,
    ) -> SchedulerResult<()> {
        let guard = self.inner.dispatch_lock.lock().await;

        let Some(mut task) = self.inner.task_repo.get_by_id(task_id).await? else {
            return Err(SchedulerError::task_not_found(task_id));
        };
        if !task.is_running() {
            return Ok(());
        }

        let settled = match self.take_reservation(task_id).await? {
            Some(reservation) => self.inner.ledger.settle(&reservation.id, actual_cost).await?,
            None => {
                warn!("任务 {} 没有关联的余额预留，费用记0", task_id);
                0.0
            }
        };

        task.cost = settled;
        task.progress = 100.0;
        task.result = Some(result);
        if let Err((from, to)) = task.transition_to(TaskStatus::Completed) {
            return Err(SchedulerError::InvalidStateTransition { from, to });
        }
        self.inner.task_repo.update(&task).await?;

        if let Some(server_id) = &task.gpu_server_id {
            self.inner.worker_repo.release_slot(server_id).await?;
        }

        info!("任务 {} 执行完成，实际费用 {}", task_id, settled);
        drop(guard);
        self.inner.notify.notify_one();
        Ok(())
    }

    /// 运行中任务的失败处理：释放槽位与预留，按重试策略决定
    /// 重新入队（退避后）还是进入failed终态。错误不跨tick边界传播。
    async fn fail_running_task(&self, task_id: &str, message: &str, retryable: bool) {
        if let Err(e) = self
            .fail_running_task_inner(task_id, message, retryable)
            .await
        {
            error!("处理任务 {} 失败路径时出错: {}", task_id, e);
        }
    }

    async fn fail_running_task_inner(
        &self,
        task_id: &str,
        message: &str,
        retryable: bool,
    ) -> SchedulerResult<()> {
        let guard = self.inner.dispatch_lock.lock().await;

        let Some(mut task) = self.inner.task_repo.get_by_id(task_id).await? else {
            return Err(SchedulerError::task_not_found(task_id));
        };
        if !task.is_running() {
            return Ok(());
        }

        if let Some(server_id) = task.gpu_server_id.take() {
            self.inner.worker_repo.release_slot(&server_id).await?;
        }
        // 执行未产生可计费结果，预留全额退还
        if let Some(reservation) = self.take_reservation(task_id).await? {
            self.inner.ledger.release(&reservation.id).await?;
        }

        if retryable && self.inner.retry_policy.should_retry(&task) {
            task.retry_count += 1;
            task.status = TaskStatus::Pending;
            task.progress = 0.0;
            task.error_message = Some(message.to_string());
            task.updated_at = chrono::Utc::now();
            self.inner.task_repo.update(&task).await?;

            let delay = self.inner.retry_policy.backoff_delay(task.retry_count - 1);
            info!(
                "任务 {} 将在 {:?} 后重试（第 {} 次，上限 {}）",
                task.id, delay, task.retry_count, task.max_retries
            );
            self.enqueue_after(task, delay);
        } else {
            task.error_message = Some(message.to_string());
            if let Err((from, to)) = task.transition_to(TaskStatus::Failed) {
                return Err(SchedulerError::InvalidStateTransition { from, to });
            }
            self.inner.task_repo.update(&task).await?;
            warn!(
                "任务 {} 进入失败终态（重试 {} 次）: {}",
                task.id, task.retry_count, message
            );
        }

        drop(guard);
        self.inner.notify.notify_one();
        Ok(())
    }

    /// 退避结束后再入队，保持原始优先级与创建时间，不插队
    fn enqueue_after(&self, task: Task, delay: Duration) {
        let scheduler = self.clone();
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            {
                let mut queue = scheduler.inner.queue.lock().expect("queue lock poisoned");
                queue.enqueue(&task);
            }
            scheduler.inner.notify.notify_one();
        });
    }

    /// 取消请求入口。pending任务立即出队并终结；running任务给执行器
    /// 一个有限的确认宽限期，超时后强制置为cancelled并回收槽位与预留。
    pub async fn cancel(&self, task_id: &str) -> SchedulerResult<Task> {
        let guard = self.inner.dispatch_lock.lock().await;

        let Some(mut task) = self.inner.task_repo.get_by_id(task_id).await? else {
            return Err(SchedulerError::task_not_found(task_id));
        };

        match task.status {
            TaskStatus::Pending => {
                {
                    let mut queue = self.inner.queue.lock().expect("queue lock poisoned");
                    queue.remove(task_id);
                }
                if let Err((from, to)) = task.transition_to(TaskStatus::Cancelled) {
                    return Err(SchedulerError::InvalidStateTransition { from, to });
                }
                self.inner.task_repo.update(&task).await?;
                info!("排队中的任务 {} 已取消", task_id);
                Ok(task)
            }
            TaskStatus::Running => {
                let server = match &task.gpu_server_id {
                    Some(id) => self.inner.worker_repo.get_by_id(id).await?,
                    None => None,
                };
                // 取消信号在临界区外发送，宽限期不阻塞其他调度
                drop(guard);

                if let Some(server) = &server {
                    let grace = Duration::from_millis(self.inner.config.cancel_grace_period_ms);
                    match timeout(grace, self.inner.executor.cancel(task_id, server)).await {
                        Ok(Ok(())) => debug!("任务 {} 的取消信号已确认", task_id),
                        Ok(Err(e)) => warn!("任务 {} 取消信号发送失败: {}", task_id, e),
                        Err(_) => warn!("任务 {} 取消确认超时，强制取消", task_id),
                    }
                }

                self.force_cancel(task_id).await
            }
            _ => Err(SchedulerError::InvalidStateTransition {
                from: task.status,
                to: TaskStatus::Cancelled,
            }),
        }
    }

    /// 宽限期后的强制取消：无论远端是否确认，回收槽位与预留
    async fn force_cancel(&self, task_id: &str) -> SchedulerResult<Task> {
        let guard = self.inner.dispatch_lock.lock().await;

        let Some(mut task) = self.inner.task_repo.get_by_id(task_id).await? else {
            return Err(SchedulerError::task_not_found(task_id));
        };
        if task.is_finished() {
            return Ok(task);
        }

        if let Some(server_id) = &task.gpu_server_id {
            self.inner.worker_repo.release_slot(server_id).await?;
        }
        if let Some(reservation) = self.take_reservation(task_id).await? {
            self.inner.ledger.release(&reservation.id).await?;
        }

        if let Err((from, to)) = task.transition_to(TaskStatus::Cancelled) {
            return Err(SchedulerError::InvalidStateTransition { from, to });
        }
        self.inner.task_repo.update(&task).await?;
        info!("任务 {} 已取消，槽位与预留已回收", task_id);

        drop(guard);
        self.inner.notify.notify_one();
        Ok(task)
    }

    /// 用户主动重试：failed/cancelled任务重新武装为pending，
    /// 重试计数清零，重新进入就绪队列
    pub async fn retry(&self, task_id: &str) -> SchedulerResult<Task> {
        let guard = self.inner.dispatch_lock.lock().await;

        let Some(mut task) = self.inner.task_repo.get_by_id(task_id).await? else {
            return Err(SchedulerError::task_not_found(task_id));
        };
        if !matches!(task.status, TaskStatus::Failed | TaskStatus::Cancelled) {
            return Err(SchedulerError::InvalidStateTransition {
                from: task.status,
                to: TaskStatus::Pending,
            });
        }

        task.status = TaskStatus::Pending;
        task.progress = 0.0;
        task.retry_count = 0;
        task.gpu_server_id = None;
        task.result = None;
        task.error_message = None;
        task.started_at = None;
        task.completed_at = None;
        task.updated_at = chrono::Utc::now();
        self.inner.task_repo.update(&task).await?;

        {
            let mut queue = self.inner.queue.lock().expect("queue lock poisoned");
            queue.enqueue(&task);
        }
        info!("任务 {} 已重新武装并入队", task_id);

        drop(guard);
        self.inner.notify.notify_one();
        Ok(task)
    }

    /// 健康监控回调：GPU服务器离线后，其上所有running任务走孤儿路径。
    /// 单个任务的处理失败不阻塞其他任务。
    pub async fn handle_worker_offline(&self, worker_id: &str) -> SchedulerResult<()> {
        let tasks = self.inner.task_repo.get_running_by_worker(worker_id).await?;
        if tasks.is_empty() {
            debug!("离线GPU服务器 {} 上没有运行中任务", worker_id);
            return Ok(());
        }

        info!(
            "GPU服务器 {} 离线，回收其上 {} 个运行中任务",
            worker_id,
            tasks.len()
        );
        for task in tasks {
            self.orphan_task(&task.id, worker_id).await;
        }
        Ok(())
    }

    async fn orphan_task(&self, task_id: &str, worker_id: &str) {
        self.fail_running_task(
            task_id,
            &format!("orphaned_task: GPU服务器 {worker_id} 失联"),
            true,
        )
        .await;
    }

    /// 余额不足等准入失败：任务直接进入failed终态，不消耗Worker槽位
    async fn finalize_failed(&self, task: &mut Task, reason: &str) -> SchedulerResult<()> {
        task.error_message = Some(reason.to_string());
        if let Err((from, to)) = task.transition_to(TaskStatus::Failed) {
            return Err(SchedulerError::InvalidStateTransition { from, to });
        }
        self.inner.task_repo.update(task).await
    }

    async fn requeue_by_id(&self, task_id: &str) {
        if let Ok(Some(task)) = self.inner.task_repo.get_by_id(task_id).await {
            if task.status == TaskStatus::Pending {
                let mut queue = self.inner.queue.lock().expect("queue lock poisoned");
                queue.enqueue(&task);
            }
        }
    }

    /// 取出任务持有的预留：优先进程内映射，重启后回查账本
    async fn take_reservation(
        &self,
        task_id: &str,
    ) -> SchedulerResult<Option<BalanceReservation>> {
        let cached = {
            let mut map = self
                .inner
                .reservations
                .lock()
                .expect("reservations lock poisoned");
            map.remove(task_id)
        };
        match cached {
            Some(r) => Ok(Some(r)),
            None => self.inner.ledger.reservation_for_task(task_id).await,
        }
    }
}
