use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use gpu_scheduler_domain::SchedulerError;
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("调度器错误: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("验证错误: {0}")]
    Validation(#[from] validator::ValidationErrors),

    #[error("请求参数错误: {0}")]
    BadRequest(String),

    #[error("缺少身份标识")]
    MissingIdentity,

    #[error("权限不足")]
    Forbidden,

    #[error("内部服务器错误: {0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_message, error_type) = match &self {
            ApiError::Scheduler(SchedulerError::TaskNotFound { id }) => (
                StatusCode::NOT_FOUND,
                format!("任务 {id} 不存在"),
                "TASK_NOT_FOUND",
            ),
            ApiError::Scheduler(SchedulerError::WorkerNotFound { id }) => (
                StatusCode::NOT_FOUND,
                format!("GPU服务器 {id} 不存在"),
                "WORKER_NOT_FOUND",
            ),
            ApiError::Scheduler(SchedulerError::InsufficientBalance { required }) => (
                StatusCode::BAD_REQUEST,
                format!("余额不足，本次操作需要 {required}"),
                "INSUFFICIENT_BALANCE",
            ),
            ApiError::Scheduler(SchedulerError::CodeInvalid) => (
                StatusCode::NOT_FOUND,
                "充值码不存在".to_string(),
                "CODE_INVALID",
            ),
            ApiError::Scheduler(SchedulerError::CodeExpired) => (
                StatusCode::BAD_REQUEST,
                "充值码已过期".to_string(),
                "CODE_EXPIRED",
            ),
            ApiError::Scheduler(SchedulerError::CodeExhausted) => (
                StatusCode::BAD_REQUEST,
                "充值码已达使用上限".to_string(),
                "CODE_EXHAUSTED",
            ),
            ApiError::Scheduler(SchedulerError::InvalidStateTransition { from, to }) => (
                StatusCode::CONFLICT,
                format!("任务状态不允许该操作: {from:?} -> {to:?}"),
                "INVALID_STATE_TRANSITION",
            ),
            ApiError::Scheduler(SchedulerError::InvalidTaskParams(msg)) => (
                StatusCode::BAD_REQUEST,
                format!("任务参数无效: {msg}"),
                "INVALID_TASK_PARAMS",
            ),
            ApiError::Scheduler(SchedulerError::WorkerUnavailable) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "没有可用的GPU服务器".to_string(),
                "WORKER_UNAVAILABLE",
            ),
            ApiError::Validation(errors) => {
                let details: Vec<String> = errors
                    .field_errors()
                    .iter()
                    .map(|(field, errs)| {
                        let messages: Vec<String> = errs
                            .iter()
                            .map(|e| {
                                e.message
                                    .as_ref()
                                    .map(|m| m.to_string())
                                    .unwrap_or_else(|| "验证失败".to_string())
                            })
                            .collect();
                        format!("{}: {}", field, messages.join(", "))
                    })
                    .collect();
                (
                    StatusCode::BAD_REQUEST,
                    format!("请求参数验证失败: {}", details.join("; ")),
                    "VALIDATION_ERROR",
                )
            }
            ApiError::BadRequest(msg) => (
                StatusCode::BAD_REQUEST,
                format!("请求参数错误: {msg}"),
                "BAD_REQUEST",
            ),
            ApiError::MissingIdentity => (
                StatusCode::UNAUTHORIZED,
                "请求缺少 X-User-Id 头".to_string(),
                "MISSING_IDENTITY",
            ),
            ApiError::Forbidden => (
                StatusCode::FORBIDDEN,
                "权限不足".to_string(),
                "FORBIDDEN",
            ),
            ApiError::Scheduler(_) | ApiError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "系统内部错误".to_string(),
                "INTERNAL_ERROR",
            ),
        };

        if status.is_server_error() {
            tracing::error!("API内部错误: {self}");
        }

        let body = Json(json!({
            "error": {
                "message": error_message,
                "type": error_type,
                "code": status.as_u16(),
                "timestamp": chrono::Utc::now().to_rfc3339(),
            }
        }));

        (status, body).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_not_found_maps_to_404() {
        let error = ApiError::Scheduler(SchedulerError::task_not_found("abc"));
        assert_eq!(error.into_response().status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_insufficient_balance_maps_to_400() {
        let error = ApiError::Scheduler(SchedulerError::InsufficientBalance { required: 10.0 });
        assert_eq!(error.into_response().status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_code_errors_map_to_client_errors() {
        assert_eq!(
            ApiError::Scheduler(SchedulerError::CodeInvalid)
                .into_response()
                .status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::Scheduler(SchedulerError::CodeExpired)
                .into_response()
                .status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::Scheduler(SchedulerError::CodeExhausted)
                .into_response()
                .status(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn test_invalid_state_transition_maps_to_409() {
        use gpu_scheduler_domain::entities::TaskStatus;
        let error = ApiError::Scheduler(SchedulerError::InvalidStateTransition {
            from: TaskStatus::Completed,
            to: TaskStatus::Cancelled,
        });
        assert_eq!(error.into_response().status(), StatusCode::CONFLICT);
    }

    #[test]
    fn test_unclassified_scheduler_error_maps_to_500() {
        let error = ApiError::Scheduler(SchedulerError::Internal("boom".to_string()));
        assert_eq!(
            error.into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_missing_identity_maps_to_401() {
        assert_eq!(
            ApiError::MissingIdentity.into_response().status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ApiError::Forbidden.into_response().status(),
            StatusCode::FORBIDDEN
        );
    }
}
