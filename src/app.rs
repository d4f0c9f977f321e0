use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::{net::TcpListener, sync::broadcast};
use tracing::{error, info};

use gpu_scheduler_api::{create_routes, AppState};
use gpu_scheduler_dispatcher::{
    HealthMonitor, HealthMonitorConfig, RetryPolicy, SchedulerConfig, TaskScheduler,
};
use gpu_scheduler_domain::entities::{GpuServer, GpuServerRegistration, GpuServerStatus, RechargeCode};
use gpu_scheduler_infrastructure::{DatabaseManager, SimulatedExecutor};
use gpu_scheduler_infrastructure::executors::SimulatedExecutorConfig;

use crate::config::AppConfig;

/// 应用运行模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppMode {
    /// 仅运行调度循环与健康监控
    Dispatcher,
    /// 仅运行API服务器
    Api,
    /// 运行所有组件
    All,
    /// 零配置演示模式：内存SQLite + 模拟执行器 + 预置资源
    Embedded,
}

/// 主应用程序
pub struct Application {
    config: AppConfig,
    mode: AppMode,
    db: DatabaseManager,
    scheduler: TaskScheduler,
    health_monitor: Arc<HealthMonitor>,
    state: AppState,
}

impl Application {
    pub async fn new(config: AppConfig, mode: AppMode) -> Result<Self> {
        info!("初始化应用程序，模式: {:?}", mode);

        let database_url = if mode == AppMode::Embedded {
            "sqlite::memory:".to_string()
        } else {
            config.database.url.clone()
        };
        // 内存SQLite的多个连接是相互独立的数据库，必须收敛到单连接
        let max_connections = if database_url.contains(":memory:") {
            1
        } else {
            config.database.max_connections
        };

        let db = DatabaseManager::new(&database_url, max_connections)
            .await
            .with_context(|| format!("连接数据库失败: {database_url}"))?;
        db.init_schema().await.context("初始化数据库表结构失败")?;
        db.health_check().await.context("数据库健康检查失败")?;

        let task_repo = db.task_repository();
        let worker_repo = db.worker_repository();
        let ledger = db.balance_ledger();

        let executor = Arc::new(SimulatedExecutor::new(SimulatedExecutorConfig {
            steps_per_poll: config.executor.steps_per_poll,
            billing_rate_per_step: config.executor.billing_rate_per_step,
        }));

        let retry_policy = RetryPolicy {
            base_interval_seconds: config.retry.base_interval_seconds,
            max_interval_seconds: config.retry.max_interval_seconds,
            backoff_multiplier: config.retry.backoff_multiplier,
            jitter_factor: config.retry.jitter_factor,
        };
        let scheduler_config = SchedulerConfig {
            tick_interval_seconds: config.dispatcher.tick_interval_seconds,
            poll_interval_ms: config.dispatcher.poll_interval_ms,
            remote_call_timeout_ms: config.dispatcher.remote_call_timeout_ms,
            cancel_grace_period_ms: config.dispatcher.cancel_grace_period_ms,
            max_poll_failures: config.dispatcher.max_poll_failures,
        };

        let scheduler = TaskScheduler::new(
            Arc::clone(&task_repo),
            Arc::clone(&worker_repo),
            Arc::clone(&ledger),
            executor,
            retry_policy,
            scheduler_config,
        );

        let health_monitor = Arc::new(HealthMonitor::new(
            Arc::clone(&worker_repo),
            scheduler.clone(),
            HealthMonitorConfig {
                heartbeat_timeout_seconds: config.health_monitor.heartbeat_timeout_seconds,
                check_interval_seconds: config.health_monitor.check_interval_seconds,
            },
        ));

        let state = AppState {
            task_repo,
            worker_repo,
            ledger,
            scheduler: scheduler.clone(),
        };

        let app = Self {
            config,
            mode,
            db,
            scheduler,
            health_monitor,
            state,
        };

        if mode == AppMode::Embedded {
            app.seed_embedded_resources().await?;
        }

        Ok(app)
    }

    /// 演示模式预置：一台在线的模拟GPU服务器和一个公开充值码
    async fn seed_embedded_resources(&self) -> Result<()> {
        let mut server = GpuServer::new(GpuServerRegistration {
            name: "sim-gpu-01".to_string(),
            address: "simulated://local".to_string(),
            credentials_ref: None,
            max_concurrent_tasks: 4,
        });
        server.status = GpuServerStatus::Online;
        server.last_heartbeat = Some(chrono::Utc::now());
        self.state.worker_repo.register(&server).await?;
        self.state
            .worker_repo
            .update_status(&server.id, GpuServerStatus::Online)
            .await?;

        let code = RechargeCode::new(100.0, 1000, None, "embedded".to_string());
        self.state.ledger.create_code(&code).await?;

        info!("演示环境就绪: GPU服务器 {} 已上线", server.id);
        info!("演示充值码: {} (面额 {})", code.code, code.amount);
        Ok(())
    }

    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        info!("启动应用程序，模式: {:?}", self.mode);

        let run_dispatcher = matches!(
            self.mode,
            AppMode::Dispatcher | AppMode::All | AppMode::Embedded
        );
        let run_api = matches!(self.mode, AppMode::Api | AppMode::All | AppMode::Embedded);

        let mut handles = Vec::new();

        if run_dispatcher {
            // 重启恢复：pending重新入队，running重挂watcher或孤儿回收
            self.scheduler.restore().await.context("恢复调度状态失败")?;

            let scheduler = self.scheduler.clone();
            handles.push(tokio::spawn(async move {
                scheduler.run().await;
            }));

            let monitor = Arc::clone(&self.health_monitor);
            handles.push(tokio::spawn(async move {
                monitor.run().await;
            }));
        }

        if run_api {
            let listener = TcpListener::bind(&self.config.api.bind_address)
                .await
                .with_context(|| format!("绑定API地址失败: {}", self.config.api.bind_address))?;
            info!("API服务监听 {}", self.config.api.bind_address);

            let router = create_routes(self.state.clone());
            let mut rx = shutdown_rx.resubscribe();
            handles.push(tokio::spawn(async move {
                let shutdown = async move {
                    let _ = rx.recv().await;
                };
                if let Err(e) = axum::serve(listener, router)
                    .with_graceful_shutdown(shutdown)
                    .await
                {
                    error!("API服务异常退出: {e}");
                }
            }));
        }

        let _ = shutdown_rx.recv().await;
        info!("应用收到关闭信号");

        self.scheduler.stop().await;
        self.health_monitor.stop().await;
        for handle in handles {
            let _ = handle.await;
        }
        self.db.close().await;

        info!("应用已停止");
        Ok(())
    }
}
