use async_trait::async_trait;

use crate::entities::{GpuServer, Task};
use crate::errors::SchedulerResult;

/// 执行器轮询返回的状态报告
#[derive(Debug, Clone)]
pub enum ExecutionReport {
    Running { progress: f64 },
    Completed {
        result: serde_json::Value,
        actual_cost: f64,
    },
    Failed { message: String, retryable: bool },
}

/// 远程执行能力接口。调度器不关心传输协议（SSH或其他），
/// 任何实现了start/poll/cancel/health_check的传输层均可替换接入。
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// 在目标GPU服务器上启动任务，同步失败视为DispatchFailure
    async fn start(&self, task: &Task, server: &GpuServer) -> SchedulerResult<()>;
    /// 轮询任务进度；调度循环按固定间隔调用并折算回任务状态
    async fn poll(&self, task_id: &str, server: &GpuServer) -> SchedulerResult<ExecutionReport>;
    /// 发送取消信号。取消是协作式的：调用方自行限定等待确认的时间
    async fn cancel(&self, task_id: &str, server: &GpuServer) -> SchedulerResult<()>;
    async fn health_check(&self, server: &GpuServer) -> SchedulerResult<bool>;
}
