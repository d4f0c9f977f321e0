//! 测试支撑：内存版的存储与执行器实现，以及实体构造器。
//! 调度逻辑的测试不依赖数据库，全部跑在这些内存实现上。

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use uuid::Uuid;

use gpu_scheduler_domain::{
    entities::{
        BalanceReservation, GpuServer, GpuServerStatus, RechargeCode, RechargeRecord, Task,
        TaskStatus, WorkerHeartbeat,
    },
    executor::{ExecutionReport, RemoteExecutor},
    repositories::{BalanceLedger, RedeemOutcome, TaskRepository, WorkerRepository},
    SchedulerError, SchedulerResult,
};

// ============ 任务存储 ============

#[derive(Default)]
pub struct MockTaskRepository {
    tasks: Mutex<HashMap<String, Task>>,
}

impl MockTaskRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, task: Task) {
        self.tasks.lock().unwrap().insert(task.id.clone(), task);
    }
}

#[async_trait]
impl TaskRepository for MockTaskRepository {
    async fn create(&self, task: &Task) -> SchedulerResult<()> {
        self.tasks
            .lock()
            .unwrap()
            .insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn get_by_id(&self, task_id: &str) -> SchedulerResult<Option<Task>> {
        Ok(self.tasks.lock().unwrap().get(task_id).cloned())
    }

    async fn get_by_id_for_user(
        &self,
        task_id: &str,
        user_id: &str,
    ) -> SchedulerResult<Option<Task>> {
        Ok(self
            .tasks
            .lock()
            .unwrap()
            .get(task_id)
            .filter(|t| t.user_id == user_id)
            .cloned())
    }

    async fn list_by_user(
        &self,
        user_id: &str,
        limit: i64,
        offset: i64,
    ) -> SchedulerResult<Vec<Task>> {
        let mut tasks: Vec<Task> = self
            .tasks
            .lock()
            .unwrap()
            .values()
            .filter(|t| t.user_id == user_id)
            .cloned()
            .collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(tasks
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn count_by_user(&self, user_id: &str) -> SchedulerResult<i64> {
        Ok(self
            .tasks
            .lock()
            .unwrap()
            .values()
            .filter(|t| t.user_id == user_id)
            .count() as i64)
    }

    async fn list_by_status(&self, status: TaskStatus) -> SchedulerResult<Vec<Task>> {
        let mut tasks: Vec<Task> = self
            .tasks
            .lock()
            .unwrap()
            .values()
            .filter(|t| t.status == status)
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(tasks)
    }

    async fn get_running_by_worker(&self, worker_id: &str) -> SchedulerResult<Vec<Task>> {
        Ok(self
            .tasks
            .lock()
            .unwrap()
            .values()
            .filter(|t| {
                t.status == TaskStatus::Running && t.gpu_server_id.as_deref() == Some(worker_id)
            })
            .cloned()
            .collect())
    }

    async fn count_by_status(&self, status: TaskStatus) -> SchedulerResult<i64> {
        Ok(self
            .tasks
            .lock()
            .unwrap()
            .values()
            .filter(|t| t.status == status)
            .count() as i64)
    }

    async fn update(&self, task: &Task) -> SchedulerResult<()> {
        let mut tasks = self.tasks.lock().unwrap();
        if !tasks.contains_key(&task.id) {
            return Err(SchedulerError::task_not_found(&task.id));
        }
        tasks.insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn update_progress(&self, task_id: &str, progress: f64) -> SchedulerResult<()> {
        let mut tasks = self.tasks.lock().unwrap();
        let task = tasks
            .get_mut(task_id)
            .ok_or_else(|| SchedulerError::task_not_found(task_id))?;
        task.progress = progress;
        task.updated_at = Utc::now();
        Ok(())
    }
}

// ============ Worker注册表 ============

#[derive(Default)]
pub struct MockWorkerRepository {
    servers: Mutex<HashMap<String, GpuServer>>,
}

impl MockWorkerRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, server: GpuServer) {
        self.servers
            .lock()
            .unwrap()
            .insert(server.id.clone(), server);
    }

    pub fn current_tasks(&self, server_id: &str) -> i32 {
        self.servers
            .lock()
            .unwrap()
            .get(server_id)
            .map(|s| s.current_tasks)
            .unwrap_or(0)
    }
}

#[async_trait]
impl WorkerRepository for MockWorkerRepository {
    async fn register(&self, server: &GpuServer) -> SchedulerResult<()> {
        self.servers
            .lock()
            .unwrap()
            .insert(server.id.clone(), server.clone());
        Ok(())
    }

    async fn get_by_id(&self, server_id: &str) -> SchedulerResult<Option<GpuServer>> {
        Ok(self.servers.lock().unwrap().get(server_id).cloned())
    }

    async fn list(&self) -> SchedulerResult<Vec<GpuServer>> {
        let mut servers: Vec<GpuServer> = self.servers.lock().unwrap().values().cloned().collect();
        servers.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(servers)
    }

    async fn list_available(&self) -> SchedulerResult<Vec<GpuServer>> {
        let mut servers: Vec<GpuServer> = self
            .servers
            .lock()
            .unwrap()
            .values()
            .filter(|s| s.has_capacity())
            .cloned()
            .collect();
        servers.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(servers)
    }

    async fn register_heartbeat(
        &self,
        server_id: &str,
        heartbeat: &WorkerHeartbeat,
    ) -> SchedulerResult<()> {
        let mut servers = self.servers.lock().unwrap();
        let server = servers
            .get_mut(server_id)
            .ok_or_else(|| SchedulerError::worker_not_found(server_id))?;
        server.last_heartbeat = Some(heartbeat.timestamp);
        // 负载快照以上报为准，截断到容量范围内
        server.current_tasks = heartbeat.current_tasks.clamp(0, server.max_concurrent_tasks);
        server.cpu_usage = heartbeat.cpu_usage;
        server.memory_usage = heartbeat.memory_usage;
        server.gpu_usage = heartbeat.gpu_usage;
        server.status = GpuServerStatus::Online;
        Ok(())
    }

    async fn try_acquire_slot(&self, server_id: &str) -> SchedulerResult<bool> {
        // 检查与自增持同一把锁，模拟条件UPDATE的原子性
        let mut servers = self.servers.lock().unwrap();
        let server = servers
            .get_mut(server_id)
            .ok_or_else(|| SchedulerError::worker_not_found(server_id))?;
        if server.current_tasks < server.max_concurrent_tasks {
            server.current_tasks += 1;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn release_slot(&self, server_id: &str) -> SchedulerResult<()> {
        let mut servers = self.servers.lock().unwrap();
        let server = servers
            .get_mut(server_id)
            .ok_or_else(|| SchedulerError::worker_not_found(server_id))?;
        server.current_tasks = (server.current_tasks - 1).max(0);
        Ok(())
    }

    async fn update_status(
        &self,
        server_id: &str,
        status: GpuServerStatus,
    ) -> SchedulerResult<()> {
        let mut servers = self.servers.lock().unwrap();
        let server = servers
            .get_mut(server_id)
            .ok_or_else(|| SchedulerError::worker_not_found(server_id))?;
        server.status = status;
        Ok(())
    }
}

// ============ 余额账本 ============

#[derive(Default)]
struct LedgerState {
    balances: HashMap<String, f64>,
    reservations: HashMap<String, BalanceReservation>,
    codes: HashMap<String, RechargeCode>,
    records: Vec<RechargeRecord>,
    settled_total: f64,
}

/// 内存账本。所有读改写都在同一把锁内完成，
/// 与数据库实现的条件UPDATE具有相同的原子性语义。
#[derive(Default)]
pub struct MockBalanceLedger {
    state: Mutex<LedgerState>,
}

impl MockBalanceLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_balance(&self, user_id: &str, amount: f64) {
        self.state
            .lock()
            .unwrap()
            .balances
            .insert(user_id.to_string(), amount);
    }

    /// 账户余额 + 未结预留之和，守恒性断言用
    pub fn total_held(&self, user_id: &str) -> f64 {
        let state = self.state.lock().unwrap();
        let balance = state.balances.get(user_id).copied().unwrap_or(0.0);
        let reserved: f64 = state
            .reservations
            .values()
            .filter(|r| r.user_id == user_id)
            .map(|r| r.amount)
            .sum();
        balance + reserved
    }

    pub fn settled_total(&self) -> f64 {
        self.state.lock().unwrap().settled_total
    }

    pub fn open_reservations(&self) -> usize {
        self.state.lock().unwrap().reservations.len()
    }
}

#[async_trait]
impl BalanceLedger for MockBalanceLedger {
    async fn reserve(
        &self,
        user_id: &str,
        task_id: &str,
        amount: f64,
    ) -> SchedulerResult<BalanceReservation> {
        let mut state = self.state.lock().unwrap();
        let balance = state.balances.entry(user_id.to_string()).or_insert(0.0);
        if *balance < amount {
            return Err(SchedulerError::InsufficientBalance { required: amount });
        }
        *balance -= amount;
        let reservation = BalanceReservation {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            task_id: task_id.to_string(),
            amount,
            created_at: Utc::now(),
        };
        state
            .reservations
            .insert(reservation.id.clone(), reservation.clone());
        Ok(reservation)
    }

    async fn settle(&self, reservation_id: &str, final_cost: f64) -> SchedulerResult<f64> {
        let mut state = self.state.lock().unwrap();
        let reservation =
            state
                .reservations
                .remove(reservation_id)
                .ok_or_else(|| SchedulerError::ReservationNotFound {
                    id: reservation_id.to_string(),
                })?;
        // 实际扣费封顶为预留额，差额退还账户
        let charged = final_cost.clamp(0.0, reservation.amount);
        let refund = reservation.amount - charged;
        *state
            .balances
            .entry(reservation.user_id.clone())
            .or_insert(0.0) += refund;
        state.settled_total += charged;
        Ok(charged)
    }

    async fn release(&self, reservation_id: &str) -> SchedulerResult<()> {
        let mut state = self.state.lock().unwrap();
        let reservation =
            state
                .reservations
                .remove(reservation_id)
                .ok_or_else(|| SchedulerError::ReservationNotFound {
                    id: reservation_id.to_string(),
                })?;
        *state
            .balances
            .entry(reservation.user_id.clone())
            .or_insert(0.0) += reservation.amount;
        Ok(())
    }

    async fn release_for_task(&self, task_id: &str) -> SchedulerResult<()> {
        let mut state = self.state.lock().unwrap();
        let id = state
            .reservations
            .values()
            .find(|r| r.task_id == task_id)
            .map(|r| r.id.clone());
        if let Some(id) = id {
            let reservation = state.reservations.remove(&id).unwrap();
            *state
                .balances
                .entry(reservation.user_id.clone())
                .or_insert(0.0) += reservation.amount;
        }
        Ok(())
    }

    async fn reservation_for_task(
        &self,
        task_id: &str,
    ) -> SchedulerResult<Option<BalanceReservation>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .reservations
            .values()
            .find(|r| r.task_id == task_id)
            .cloned())
    }

    async fn balance(&self, user_id: &str) -> SchedulerResult<f64> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .balances
            .get(user_id)
            .copied()
            .unwrap_or(0.0))
    }

    async fn redeem(&self, user_id: &str, code: &str) -> SchedulerResult<RedeemOutcome> {
        let mut state = self.state.lock().unwrap();
        let now = Utc::now();

        let (code_id, amount) = {
            let rc = state
                .codes
                .get_mut(code)
                .ok_or(SchedulerError::CodeInvalid)?;
            if rc.is_expired(now) {
                return Err(SchedulerError::CodeExpired);
            }
            // 检查与自增在同一把锁内，并发兑换不会超过上限
            if rc.is_exhausted() {
                return Err(SchedulerError::CodeExhausted);
            }
            rc.used_count += 1;
            (rc.id.clone(), rc.amount)
        };

        let balance = state.balances.entry(user_id.to_string()).or_insert(0.0);
        *balance += amount;
        let new_balance = *balance;

        let record = RechargeRecord {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            recharge_code_id: code_id,
            amount,
            created_at: now,
        };
        let record_id = record.id.clone();
        state.records.push(record);

        Ok(RedeemOutcome {
            amount,
            new_balance,
            recharge_record_id: record_id,
        })
    }

    async fn create_code(&self, code: &RechargeCode) -> SchedulerResult<()> {
        self.state
            .lock()
            .unwrap()
            .codes
            .insert(code.code.clone(), code.clone());
        Ok(())
    }

    async fn recharge_records(&self, user_id: &str) -> SchedulerResult<Vec<RechargeRecord>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .records
            .iter()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect())
    }
}

// ============ 执行器 ============

/// 按任务可配置的执行脚本
#[derive(Debug, Clone)]
pub enum ExecBehavior {
    /// 轮询若干次后报告完成
    CompleteAfterPolls { polls: u32, actual_cost: f64 },
    /// 启动即失败（下发失败路径）
    FailStart,
    /// 轮询若干次后报告执行失败
    FailExecution {
        after_polls: u32,
        message: String,
        retryable: bool,
    },
    /// 永远报告运行中（取消与孤儿场景用）
    RunForever,
}

#[derive(Default)]
struct ExecutorState {
    behaviors: HashMap<String, ExecBehavior>,
    poll_counts: HashMap<String, u32>,
    start_counts: HashMap<String, u32>,
    cancelled: Vec<String>,
}

pub struct MockExecutor {
    state: Mutex<ExecutorState>,
    default_behavior: ExecBehavior,
}

impl Default for MockExecutor {
    fn default() -> Self {
        Self::new(ExecBehavior::CompleteAfterPolls {
            polls: 1,
            actual_cost: 1.0,
        })
    }
}

impl MockExecutor {
    pub fn new(default_behavior: ExecBehavior) -> Self {
        Self {
            state: Mutex::new(ExecutorState::default()),
            default_behavior,
        }
    }

    pub fn set_behavior(&self, task_id: &str, behavior: ExecBehavior) {
        self.state
            .lock()
            .unwrap()
            .behaviors
            .insert(task_id.to_string(), behavior);
    }

    /// 某任务被启动的次数（重试计数断言用）
    pub fn start_count(&self, task_id: &str) -> u32 {
        self.state
            .lock()
            .unwrap()
            .start_counts
            .get(task_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn was_cancelled(&self, task_id: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .cancelled
            .iter()
            .any(|id| id == task_id)
    }

    fn behavior_for(&self, task_id: &str, state: &ExecutorState) -> ExecBehavior {
        state
            .behaviors
            .get(task_id)
            .cloned()
            .unwrap_or_else(|| self.default_behavior.clone())
    }
}

#[async_trait]
impl RemoteExecutor for MockExecutor {
    async fn start(&self, task: &Task, _server: &GpuServer) -> SchedulerResult<()> {
        let mut state = self.state.lock().unwrap();
        *state.start_counts.entry(task.id.clone()).or_insert(0) += 1;
        state.poll_counts.insert(task.id.clone(), 0);

        match self.behavior_for(&task.id, &state) {
            ExecBehavior::FailStart => Err(SchedulerError::DispatchFailure(
                "模拟启动失败".to_string(),
            )),
            _ => Ok(()),
        }
    }

    async fn poll(&self, task_id: &str, _server: &GpuServer) -> SchedulerResult<ExecutionReport> {
        let mut state = self.state.lock().unwrap();
        let count = {
            let entry = state.poll_counts.entry(task_id.to_string()).or_insert(0);
            *entry += 1;
            *entry
        };

        match self.behavior_for(task_id, &state) {
            ExecBehavior::CompleteAfterPolls { polls, actual_cost } => {
                if count >= polls {
                    Ok(ExecutionReport::Completed {
                        result: json!({ "output": "done" }),
                        actual_cost,
                    })
                } else {
                    Ok(ExecutionReport::Running {
                        progress: (count as f64 / polls as f64) * 100.0,
                    })
                }
            }
            ExecBehavior::FailExecution {
                after_polls,
                message,
                retryable,
            } => {
                if count >= after_polls {
                    Ok(ExecutionReport::Failed { message, retryable })
                } else {
                    Ok(ExecutionReport::Running { progress: 10.0 })
                }
            }
            ExecBehavior::FailStart | ExecBehavior::RunForever => {
                Ok(ExecutionReport::Running { progress: 50.0 })
            }
        }
    }

    async fn cancel(&self, task_id: &str, _server: &GpuServer) -> SchedulerResult<()> {
        self.state
            .lock()
            .unwrap()
            .cancelled
            .push(task_id.to_string());
        Ok(())
    }

    async fn health_check(&self, _server: &GpuServer) -> SchedulerResult<bool> {
        Ok(true)
    }
}

// ============ 实体构造器 ============

pub struct TaskBuilder {
    user_id: String,
    title: String,
    task_type: String,
    priority: i32,
    config: serde_json::Value,
    max_retries: i32,
    created_at: Option<DateTime<Utc>>,
}

impl Default for TaskBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskBuilder {
    pub fn new() -> Self {
        Self {
            user_id: "user-1".to_string(),
            title: "测试任务".to_string(),
            task_type: "training".to_string(),
            priority: 5,
            config: json!({}),
            max_retries: 3,
            created_at: None,
        }
    }

    pub fn user(mut self, user_id: &str) -> Self {
        self.user_id = user_id.to_string();
        self
    }

    pub fn title(mut self, title: &str) -> Self {
        self.title = title.to_string();
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn cost_estimate(mut self, estimate: f64) -> Self {
        self.config["cost_estimate"] = json!(estimate);
        self
    }

    pub fn max_retries(mut self, max_retries: i32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = Some(at);
        self
    }

    pub fn build(self) -> Task {
        let mut task = Task::new(
            self.user_id,
            self.title,
            self.task_type,
            self.priority,
            self.config,
            self.max_retries,
        );
        if let Some(at) = self.created_at {
            task.created_at = at;
            task.updated_at = at;
        }
        task
    }
}

pub struct GpuServerBuilder {
    id: Option<String>,
    name: String,
    max_concurrent_tasks: i32,
    status: GpuServerStatus,
    last_heartbeat: Option<DateTime<Utc>>,
}

impl Default for GpuServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl GpuServerBuilder {
    pub fn new() -> Self {
        Self {
            id: None,
            name: "gpu-01".to_string(),
            max_concurrent_tasks: 2,
            status: GpuServerStatus::Online,
            last_heartbeat: Some(Utc::now()),
        }
    }

    pub fn id(mut self, id: &str) -> Self {
        self.id = Some(id.to_string());
        self
    }

    pub fn name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn max_concurrent_tasks(mut self, max: i32) -> Self {
        self.max_concurrent_tasks = max;
        self
    }

    pub fn status(mut self, status: GpuServerStatus) -> Self {
        self.status = status;
        self
    }

    pub fn last_heartbeat(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.last_heartbeat = at;
        self
    }

    pub fn build(self) -> GpuServer {
        GpuServer {
            id: self
                .id
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            name: self.name,
            address: "10.0.0.1:22".to_string(),
            credentials_ref: None,
            status: self.status,
            max_concurrent_tasks: self.max_concurrent_tasks,
            current_tasks: 0,
            cpu_usage: None,
            memory_usage: None,
            gpu_usage: None,
            last_heartbeat: self.last_heartbeat,
            registered_at: Utc::now(),
        }
    }
}
