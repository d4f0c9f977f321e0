use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use gpu_scheduler_domain::{
    entities::GpuServerStatus, repositories::WorkerRepository, SchedulerResult,
};

use crate::scheduler::TaskScheduler;

/// 健康监控配置
#[derive(Debug, Clone)]
pub struct HealthMonitorConfig {
    /// 心跳超时阈值（秒），超过后判定离线
    pub heartbeat_timeout_seconds: i64,
    /// 巡检间隔（秒）
    pub check_interval_seconds: u64,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_seconds: 90,
            check_interval_seconds: 30,
        }
    }
}

/// 心跳巡检器：周期性扫描Worker注册表，把心跳过期的GPU服务器
/// 标记为offline，并通知调度器回收其上的运行中任务。
pub struct HealthMonitor {
    worker_repo: Arc<dyn WorkerRepository>,
    scheduler: TaskScheduler,
    config: HealthMonitorConfig,
    running: Arc<tokio::sync::RwLock<bool>>,
}

impl HealthMonitor {
    pub fn new(
        worker_repo: Arc<dyn WorkerRepository>,
        scheduler: TaskScheduler,
        config: HealthMonitorConfig,
    ) -> Self {
        Self {
            worker_repo,
            scheduler,
            config,
            running: Arc::new(tokio::sync::RwLock::new(false)),
        }
    }

    pub async fn run(self: Arc<Self>) {
        {
            let mut running = self.running.write().await;
            *running = true;
        }
        info!(
            "健康监控启动: 心跳超时 {} 秒，巡检间隔 {} 秒",
            self.config.heartbeat_timeout_seconds, self.config.check_interval_seconds
        );

        let interval = Duration::from_secs(self.config.check_interval_seconds);
        loop {
            if !*self.running.read().await {
                info!("收到停止信号，退出健康监控");
                break;
            }
            if let Err(e) = self.check_once().await {
                error!("健康巡检出错: {}", e);
            }
            tokio::time::sleep(interval).await;
        }
    }

    pub async fn stop(&self) {
        let mut running = self.running.write().await;
        *running = false;
    }

    /// 一轮巡检。判定依据是last_heartbeat与当前时间的差值；
    /// 从未上报过心跳的服务器以注册时间为基准。
    pub async fn check_once(&self) -> SchedulerResult<usize> {
        let now = Utc::now();
        let servers = self.worker_repo.list().await?;
        let mut transitioned = 0usize;

        for server in servers {
            let age = server
                .heartbeat_age_seconds(now)
                .unwrap_or_else(|| (now - server.registered_at).num_seconds());

            if age > self.config.heartbeat_timeout_seconds {
                if server.status != GpuServerStatus::Offline {
                    warn!(
                        "GPU服务器 {} 心跳过期 {} 秒，标记为offline",
                        server.id, age
                    );
                    self.worker_repo
                        .update_status(&server.id, GpuServerStatus::Offline)
                        .await?;
                    transitioned += 1;

                    // 离线服务器上的运行中任务全部走孤儿回收
                    if let Err(e) = self.scheduler.handle_worker_offline(&server.id).await {
                        error!("回收离线服务器 {} 上的任务失败: {}", server.id, e);
                    }
                }
            } else if age > self.config.heartbeat_timeout_seconds / 2 {
                // 心跳变慢但尚未超时：降级提示，不触发任务回收
                if server.status == GpuServerStatus::Online {
                    debug!("GPU服务器 {} 心跳延迟 {} 秒，标记为degraded", server.id, age);
                    self.worker_repo
                        .update_status(&server.id, GpuServerStatus::Degraded)
                        .await?;
                    transitioned += 1;
                }
            }
        }

        Ok(transitioned)
    }
}
