use axum::{
    extract::{Path, State},
    Json,
};
use chrono::Utc;
use serde::Deserialize;
use tracing::info;
use validator::Validate;

use gpu_scheduler_domain::{
    entities::{
        ClusterOverview, GpuServer, GpuServerRegistration, GpuServerStatus, TaskStatus,
        WorkerHeartbeat,
    },
    SchedulerError,
};

use crate::{
    auth::CurrentUser,
    error::ApiResult,
    response::{created, success},
    routes::AppState,
};

/// GPU服务器注册请求（管理员）
#[derive(Debug, Deserialize, Validate)]
pub struct RegisterServerRequest {
    #[validate(length(min = 1, max = 255, message = "服务器名称长度必须在1到255之间"))]
    pub name: String,
    #[validate(length(min = 1, max = 255, message = "服务器地址长度必须在1到255之间"))]
    pub address: String,
    pub credentials_ref: Option<String>,
    #[validate(range(min = 1, max = 64, message = "并发任务上限必须在1到64之间"))]
    pub max_concurrent_tasks: i32,
}

/// 心跳上报请求
#[derive(Debug, Deserialize)]
pub struct HeartbeatRequest {
    pub current_tasks: i32,
    pub cpu_usage: Option<f64>,
    pub memory_usage: Option<f64>,
    pub gpu_usage: Option<f64>,
}

pub async fn list_servers(
    State(state): State<AppState>,
    _user: CurrentUser,
) -> ApiResult<impl axum::response::IntoResponse> {
    let servers = state.worker_repo.list().await?;
    Ok(success(servers))
}

pub async fn register_server(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(request): Json<RegisterServerRequest>,
) -> ApiResult<impl axum::response::IntoResponse> {
    user.require_admin()?;
    request.validate()?;

    let server = GpuServer::new(GpuServerRegistration {
        name: request.name,
        address: request.address,
        credentials_ref: request.credentials_ref,
        max_concurrent_tasks: request.max_concurrent_tasks,
    });
    state.worker_repo.register(&server).await?;

    info!("管理员 {} 注册GPU服务器 {} ({})", user.id, server.id, server.name);
    Ok(created(server))
}

pub async fn get_server_status(
    State(state): State<AppState>,
    _user: CurrentUser,
    Path(id): Path<String>,
) -> ApiResult<impl axum::response::IntoResponse> {
    let server = state
        .worker_repo
        .get_by_id(&id)
        .await?
        .ok_or_else(|| SchedulerError::worker_not_found(&id))?;
    Ok(success(server))
}

/// GPU服务器心跳：刷新负载快照，离线的服务器恢复在线，
/// 并唤醒调度循环让等待中的任务立即获得匹配机会
pub async fn report_heartbeat(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<HeartbeatRequest>,
) -> ApiResult<impl axum::response::IntoResponse> {
    let heartbeat = WorkerHeartbeat {
        current_tasks: request.current_tasks,
        cpu_usage: request.cpu_usage,
        memory_usage: request.memory_usage,
        gpu_usage: request.gpu_usage,
        timestamp: Utc::now(),
    };
    state.worker_repo.register_heartbeat(&id, &heartbeat).await?;
    state.scheduler.notify_tick();
    Ok(success(serde_json::json!({ "acknowledged": true })))
}

/// 集群概览：容量、负载与队列长度的汇总视图
pub async fn cluster_overview(
    State(state): State<AppState>,
    _user: CurrentUser,
) -> ApiResult<impl axum::response::IntoResponse> {
    let servers = state.worker_repo.list().await?;
    let total_servers = servers.len() as i64;
    let online_servers = servers.iter().filter(|s| s.is_online()).count() as i64;
    let total_gpus: i64 = servers.iter().map(|s| s.max_concurrent_tasks as i64).sum();
    let busy_gpus: i64 = servers.iter().map(|s| s.current_tasks as i64).sum();

    let usages: Vec<f64> = servers
        .iter()
        .filter(|s| s.status != GpuServerStatus::Offline)
        .filter_map(|s| s.gpu_usage)
        .collect();
    let average_gpu_usage = if usages.is_empty() {
        0.0
    } else {
        usages.iter().sum::<f64>() / usages.len() as f64
    };

    let overview = ClusterOverview {
        total_servers,
        online_servers,
        total_gpus,
        busy_gpus,
        total_running_tasks: state.task_repo.count_by_status(TaskStatus::Running).await?,
        queue_length: state.scheduler.queue_length() as i64,
        average_gpu_usage,
    };
    Ok(success(overview))
}
