use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::info;
use validator::Validate;

use gpu_scheduler_domain::{
    entities::{Task, TaskStatus},
    SchedulerError,
};

use crate::{
    auth::CurrentUser,
    error::ApiResult,
    response::{created, success, PaginatedResponse},
    routes::AppState,
    validation,
};

/// 任务创建请求
#[derive(Debug, Deserialize, Validate)]
pub struct CreateTaskRequest {
    #[validate(custom(function = validation::validate_title))]
    pub title: String,
    #[validate(custom(function = validation::validate_task_type))]
    pub task_type: String,
    #[validate(range(min = 1, max = 10, message = "优先级必须在1到10之间"))]
    pub priority: i32,
    #[validate(custom(function = validation::validate_task_config))]
    #[serde(default)]
    pub config: serde_json::Value,
    #[validate(range(min = 0, max = 10, message = "重试次数必须在0到10之间"))]
    pub max_retries: Option<i32>,
}

/// 任务查询参数
#[derive(Debug, Deserialize)]
pub struct TaskQueryParams {
    pub page: Option<i64>,
    pub page_size: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct TaskCreated {
    pub id: String,
    pub status: TaskStatus,
    pub progress: f64,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// 提交任务。入队前做余额预检，预估费用超过余额直接拒绝。
pub async fn create_task(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(request): Json<CreateTaskRequest>,
) -> ApiResult<impl axum::response::IntoResponse> {
    request.validate()?;

    let task = Task::new(
        user.id.clone(),
        request.title,
        request.task_type,
        request.priority,
        request.config,
        request.max_retries.unwrap_or(3),
    );

    let estimate = task.cost_estimate();
    let balance = state.ledger.balance(&user.id).await?;
    if balance < estimate {
        return Err(SchedulerError::InsufficientBalance { required: estimate }.into());
    }

    state.task_repo.create(&task).await?;
    state.scheduler.submit(&task).await;

    info!("用户 {} 提交任务 {} (优先级 {})", user.id, task.id, task.priority);
    Ok(created(TaskCreated {
        id: task.id,
        status: task.status,
        progress: task.progress,
        created_at: task.created_at,
    }))
}

/// 当前用户的任务列表，按创建时间倒序分页
pub async fn list_tasks(
    State(state): State<AppState>,
    user: CurrentUser,
    Query(params): Query<TaskQueryParams>,
) -> ApiResult<impl axum::response::IntoResponse> {
    let page = params.page.unwrap_or(1).max(1);
    let page_size = params.page_size.unwrap_or(20).clamp(1, 100);

    let total = state.task_repo.count_by_user(&user.id).await?;
    let items = state
        .task_repo
        .list_by_user(&user.id, page_size, (page - 1) * page_size)
        .await?;

    Ok(success(PaginatedResponse::new(items, total, page, page_size)))
}

/// 查询单个任务，非管理员只能看自己的
pub async fn get_task(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<String>,
) -> ApiResult<impl axum::response::IntoResponse> {
    let task = load_owned_task(&state, &user, &id).await?;
    Ok(success(task))
}

/// 取消任务。pending直接终止，running走协作式取消。
pub async fn cancel_task(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<String>,
) -> ApiResult<impl axum::response::IntoResponse> {
    load_owned_task(&state, &user, &id).await?;
    let task = state.scheduler.cancel(&id).await?;
    Ok(success(task))
}

/// 重新排队一个失败或已取消的任务
pub async fn retry_task(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<String>,
) -> ApiResult<impl axum::response::IntoResponse> {
    load_owned_task(&state, &user, &id).await?;
    let task = state.scheduler.retry(&id).await?;
    Ok(success(task))
}

async fn load_owned_task(
    state: &AppState,
    user: &CurrentUser,
    task_id: &str,
) -> ApiResult<Task> {
    let task = if user.is_admin() {
        state.task_repo.get_by_id(task_id).await?
    } else {
        state.task_repo.get_by_id_for_user(task_id, &user.id).await?
    };
    task.ok_or_else(|| SchedulerError::task_not_found(task_id).into())
}
