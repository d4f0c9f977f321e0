use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use gpu_scheduler_dispatcher::TaskScheduler;
use gpu_scheduler_domain::repositories::{BalanceLedger, TaskRepository, WorkerRepository};

use crate::handlers::{
    gpu::{cluster_overview, get_server_status, list_servers, register_server, report_heartbeat},
    health::health_check,
    recharge::{create_code, get_balance, list_records, redeem_code},
    tasks::{cancel_task, create_task, get_task, list_tasks, retry_task},
};

/// API应用状态
#[derive(Clone)]
pub struct AppState {
    pub task_repo: Arc<dyn TaskRepository>,
    pub worker_repo: Arc<dyn WorkerRepository>,
    pub ledger: Arc<dyn BalanceLedger>,
    pub scheduler: TaskScheduler,
}

/// 创建API路由
pub fn create_routes(state: AppState) -> Router {
    Router::new()
        // 健康检查
        .route("/health", get(health_check))
        // 任务管理API
        .route("/api/tasks", get(list_tasks).post(create_task))
        .route("/api/tasks/{id}", get(get_task))
        .route("/api/tasks/{id}/cancel", post(cancel_task))
        .route("/api/tasks/{id}/retry", post(retry_task))
        // GPU服务器API
        .route("/api/gpu/servers", get(list_servers).post(register_server))
        .route("/api/gpu/servers/{id}/status", get(get_server_status))
        .route("/api/gpu/servers/{id}/heartbeat", post(report_heartbeat))
        .route("/api/gpu/cluster/overview", get(cluster_overview))
        // 充值API
        .route("/api/recharge/codes", post(create_code))
        .route("/api/recharge/redeem", post(redeem_code))
        .route("/api/recharge/balance", get(get_balance))
        .route("/api/recharge/records", get(list_records))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
