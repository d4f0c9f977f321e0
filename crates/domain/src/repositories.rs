use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entities::{
    BalanceReservation, GpuServer, GpuServerStatus, RechargeCode, RechargeRecord, Task, TaskStatus,
    WorkerHeartbeat,
};
use crate::errors::SchedulerResult;

/// 任务存储适配层：调度器只通过该接口读写任务记录
#[async_trait]
pub trait TaskRepository: Send + Sync {
    async fn create(&self, task: &Task) -> SchedulerResult<()>;
    async fn get_by_id(&self, task_id: &str) -> SchedulerResult<Option<Task>>;
    /// 带属主过滤的查询，供API层做归属校验
    async fn get_by_id_for_user(
        &self,
        task_id: &str,
        user_id: &str,
    ) -> SchedulerResult<Option<Task>>;
    async fn list_by_user(
        &self,
        user_id: &str,
        limit: i64,
        offset: i64,
    ) -> SchedulerResult<Vec<Task>>;
    async fn count_by_user(&self, user_id: &str) -> SchedulerResult<i64>;
    async fn list_by_status(&self, status: TaskStatus) -> SchedulerResult<Vec<Task>>;
    /// 某GPU服务器上所有running状态的任务（孤儿回收用）
    async fn get_running_by_worker(&self, worker_id: &str) -> SchedulerResult<Vec<Task>>;
    async fn count_by_status(&self, status: TaskStatus) -> SchedulerResult<i64>;
    /// 整行更新；调用方负责在调度临界区内做读-改-写
    async fn update(&self, task: &Task) -> SchedulerResult<()>;
    /// 进度更新快路径，不触碰其他字段
    async fn update_progress(&self, task_id: &str, progress: f64) -> SchedulerResult<()>;
}

/// Worker注册表：GPU服务器的容量、负载与健康状态的权威视图
#[async_trait]
pub trait WorkerRepository: Send + Sync {
    async fn register(&self, server: &GpuServer) -> SchedulerResult<()>;
    async fn get_by_id(&self, server_id: &str) -> SchedulerResult<Option<GpuServer>>;
    async fn list(&self) -> SchedulerResult<Vec<GpuServer>>;
    /// status == online 且 current_tasks < max_concurrent_tasks
    async fn list_available(&self) -> SchedulerResult<Vec<GpuServer>>;
    /// 心跳上报：刷新last_heartbeat与负载快照，offline的服务器恢复为online
    async fn register_heartbeat(
        &self,
        server_id: &str,
        heartbeat: &WorkerHeartbeat,
    ) -> SchedulerResult<()>;
    /// 条件占用一个槽位（current_tasks < max_concurrent_tasks时原子+1），
    /// 返回是否占用成功
    async fn try_acquire_slot(&self, server_id: &str) -> SchedulerResult<bool>;
    /// 释放一个槽位，下限为0
    async fn release_slot(&self, server_id: &str) -> SchedulerResult<()>;
    /// 唯一的状态迁移入口，健康监控与调度循环共用
    async fn update_status(
        &self,
        server_id: &str,
        status: GpuServerStatus,
    ) -> SchedulerResult<()>;
}

/// 充值码兑换结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedeemOutcome {
    pub amount: f64,
    pub new_balance: f64,
    pub recharge_record_id: String,
}

/// 余额账本：所有账户余额变动的唯一入口，操作必须原子
#[async_trait]
pub trait BalanceLedger: Send + Sync {
    /// 冻结预估费用。并发预留同一账户时至多一个超额预留成功，
    /// 余额不足返回InsufficientBalance
    async fn reserve(
        &self,
        user_id: &str,
        task_id: &str,
        amount: f64,
    ) -> SchedulerResult<BalanceReservation>;
    /// 按实际费用结算（封顶为预留额），退还差额，返回实际扣费
    async fn settle(&self, reservation_id: &str, final_cost: f64) -> SchedulerResult<f64>;
    /// 全额退还（执行前失败时使用）
    async fn release(&self, reservation_id: &str) -> SchedulerResult<()>;
    /// 按任务退还预留，孤儿任务恢复路径使用；无预留时为no-op
    async fn release_for_task(&self, task_id: &str) -> SchedulerResult<()>;
    /// 查询任务当前持有的预留，进程重启后恢复结算用
    async fn reservation_for_task(
        &self,
        task_id: &str,
    ) -> SchedulerResult<Option<BalanceReservation>>;
    async fn balance(&self, user_id: &str) -> SchedulerResult<f64>;
    /// 兑换充值码。used_count的检查与自增为一个原子步骤，
    /// 并发兑换不会超过max_uses
    async fn redeem(&self, user_id: &str, code: &str) -> SchedulerResult<RedeemOutcome>;
    async fn create_code(&self, code: &RechargeCode) -> SchedulerResult<()>;
    async fn recharge_records(&self, user_id: &str) -> SchedulerResult<Vec<RechargeRecord>>;
}

/// 心跳快照的便捷构造
impl WorkerHeartbeat {
    pub fn now(current_tasks: i32) -> Self {
        Self {
            current_tasks,
            cpu_usage: None,
            memory_usage: None,
            gpu_usage: None,
            timestamp: Utc::now(),
        }
    }

    pub fn at(current_tasks: i32, timestamp: DateTime<Utc>) -> Self {
        Self {
            current_tasks,
            cpu_usage: None,
            memory_usage: None,
            gpu_usage: None,
            timestamp,
        }
    }
}
