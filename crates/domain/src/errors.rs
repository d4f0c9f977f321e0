use thiserror::Error;

use crate::entities::TaskStatus;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),
    #[error("数据库操作错误: {0}")]
    DatabaseOperation(String),
    #[error("任务未找到: {id}")]
    TaskNotFound { id: String },
    #[error("GPU服务器未找到: {id}")]
    WorkerNotFound { id: String },
    #[error("余额预留未找到: {id}")]
    ReservationNotFound { id: String },
    #[error("余额不足: 需要 {required}")]
    InsufficientBalance { required: f64 },
    #[error("没有可用的GPU服务器")]
    WorkerUnavailable,
    #[error("任务下发失败: {0}")]
    DispatchFailure(String),
    #[error("任务执行失败: {message}")]
    ExecutionFailure { message: String, retryable: bool },
    #[error("任务 {task_id} 所在GPU服务器 {worker_id} 已失联")]
    OrphanedTask { task_id: String, worker_id: String },
    #[error("任务 {task_id} 取消确认超时，已强制取消")]
    CancellationTimeout { task_id: String },
    #[error("充值码不存在")]
    CodeInvalid,
    #[error("充值码已过期")]
    CodeExpired,
    #[error("充值码已达使用上限")]
    CodeExhausted,
    #[error("非法状态迁移: {from:?} -> {to:?}")]
    InvalidStateTransition { from: TaskStatus, to: TaskStatus },
    #[error("无效的任务参数: {0}")]
    InvalidTaskParams(String),
    #[error("序列化错误: {0}")]
    Serialization(String),
    #[error("配置错误: {0}")]
    Configuration(String),
    #[error("操作超时: {0}")]
    Timeout(String),
    #[error("权限不足: {0}")]
    Permission(String),
    #[error("内部错误: {0}")]
    Internal(String),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;

impl SchedulerError {
    pub fn task_not_found<S: Into<String>>(id: S) -> Self {
        Self::TaskNotFound { id: id.into() }
    }

    pub fn worker_not_found<S: Into<String>>(id: S) -> Self {
        Self::WorkerNotFound { id: id.into() }
    }

    pub fn database_error<S: Into<String>>(msg: S) -> Self {
        Self::DatabaseOperation(msg.into())
    }

    pub fn config_error<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn invalid_params<S: Into<String>>(msg: S) -> Self {
        Self::InvalidTaskParams(msg.into())
    }

    pub fn execution_failure<S: Into<String>>(msg: S, retryable: bool) -> Self {
        Self::ExecutionFailure {
            message: msg.into(),
            retryable,
        }
    }

    /// 该错误是否应进入重试路径
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SchedulerError::DispatchFailure(_)
                | SchedulerError::ExecutionFailure {
                    retryable: true,
                    ..
                }
                | SchedulerError::OrphanedTask { .. }
                | SchedulerError::Timeout(_)
        )
    }

    /// 面向任务记录的错误原因标识，写入error_message供客户端读取
    pub fn reason_code(&self) -> &'static str {
        match self {
            SchedulerError::InsufficientBalance { .. } => "insufficient_balance",
            SchedulerError::WorkerUnavailable => "worker_unavailable",
            SchedulerError::DispatchFailure(_) => "dispatch_failure",
            SchedulerError::ExecutionFailure { .. } => "execution_failure",
            SchedulerError::OrphanedTask { .. } => "orphaned_task",
            SchedulerError::CancellationTimeout { .. } => "cancellation_timeout",
            SchedulerError::Timeout(_) => "timeout",
            _ => "internal_error",
        }
    }
}

impl From<serde_json::Error> for SchedulerError {
    fn from(err: serde_json::Error) -> Self {
        SchedulerError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for SchedulerError {
    fn from(err: anyhow::Error) -> Self {
        SchedulerError::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SchedulerError::TaskNotFound {
            id: "abc".to_string(),
        };
        assert_eq!(err.to_string(), "任务未找到: abc");

        let err = SchedulerError::InsufficientBalance { required: 10.0 };
        assert_eq!(err.to_string(), "余额不足: 需要 10");
    }

    #[test]
    fn test_is_retryable() {
        assert!(SchedulerError::DispatchFailure("连接失败".to_string()).is_retryable());
        assert!(SchedulerError::execution_failure("OOM", true).is_retryable());
        assert!(!SchedulerError::execution_failure("配置无效", false).is_retryable());
        assert!(!SchedulerError::InsufficientBalance { required: 1.0 }.is_retryable());
        assert!(!SchedulerError::CodeExhausted.is_retryable());
    }

    #[test]
    fn test_reason_code() {
        assert_eq!(
            SchedulerError::InsufficientBalance { required: 5.0 }.reason_code(),
            "insufficient_balance"
        );
        assert_eq!(
            SchedulerError::OrphanedTask {
                task_id: "t".to_string(),
                worker_id: "w".to_string()
            }
            .reason_code(),
            "orphaned_task"
        );
    }
}
