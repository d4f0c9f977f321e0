use async_trait::async_trait;
use gpu_scheduler_domain::{
    entities::{GpuServer, GpuServerStatus, WorkerHeartbeat},
    repositories::WorkerRepository,
    SchedulerError, SchedulerResult,
};
use sqlx::{Row, SqlitePool};
use tracing::debug;

const SERVER_COLUMNS: &str = "id, name, address, credentials_ref, status, max_concurrent_tasks, current_tasks, cpu_usage, memory_usage, gpu_usage, last_heartbeat, registered_at";

pub struct SqliteWorkerRepository {
    pool: SqlitePool,
}

impl SqliteWorkerRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_server(row: &sqlx::sqlite::SqliteRow) -> SchedulerResult<GpuServer> {
        Ok(GpuServer {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            address: row.try_get("address")?,
            credentials_ref: row.try_get("credentials_ref")?,
            status: row.try_get("status")?,
            max_concurrent_tasks: row.try_get("max_concurrent_tasks")?,
            current_tasks: row.try_get("current_tasks")?,
            cpu_usage: row.try_get("cpu_usage")?,
            memory_usage: row.try_get("memory_usage")?,
            gpu_usage: row.try_get("gpu_usage")?,
            last_heartbeat: row.try_get("last_heartbeat")?,
            registered_at: row.try_get("registered_at")?,
        })
    }
}

#[async_trait]
impl WorkerRepository for SqliteWorkerRepository {
    async fn register(&self, server: &GpuServer) -> SchedulerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO gpu_servers (id, name, address, credentials_ref, status, max_concurrent_tasks, current_tasks, cpu_usage, memory_usage, gpu_usage, last_heartbeat, registered_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                address = excluded.address,
                credentials_ref = excluded.credentials_ref,
                max_concurrent_tasks = excluded.max_concurrent_tasks
            "#,
        )
        .bind(&server.id)
        .bind(&server.name)
        .bind(&server.address)
        .bind(&server.credentials_ref)
        .bind(server.status)
        .bind(server.max_concurrent_tasks)
        .bind(server.current_tasks)
        .bind(server.cpu_usage)
        .bind(server.memory_usage)
        .bind(server.gpu_usage)
        .bind(server.last_heartbeat)
        .bind(server.registered_at)
        .execute(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        debug!("注册GPU服务器成功: {}", server.id);
        Ok(())
    }

    async fn get_by_id(&self, server_id: &str) -> SchedulerResult<Option<GpuServer>> {
        let row = sqlx::query(&format!(
            "SELECT {SERVER_COLUMNS} FROM gpu_servers WHERE id = $1"
        ))
        .bind(server_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        row.as_ref().map(Self::row_to_server).transpose()
    }

    async fn list(&self) -> SchedulerResult<Vec<GpuServer>> {
        let rows = sqlx::query(&format!(
            "SELECT {SERVER_COLUMNS} FROM gpu_servers ORDER BY id ASC"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        rows.iter().map(Self::row_to_server).collect()
    }

    async fn list_available(&self) -> SchedulerResult<Vec<GpuServer>> {
        let rows = sqlx::query(&format!(
            "SELECT {SERVER_COLUMNS} FROM gpu_servers WHERE status = $1 AND current_tasks < max_concurrent_tasks ORDER BY id ASC"
        ))
        .bind(GpuServerStatus::Online)
        .fetch_all(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        rows.iter().map(Self::row_to_server).collect()
    }

    async fn register_heartbeat(
        &self,
        server_id: &str,
        heartbeat: &WorkerHeartbeat,
    ) -> SchedulerResult<()> {
        // 心跳到达即视为恢复在线，degraded/offline都会被拉回；
        // 负载快照以Worker侧上报为准，截断到 0..=max_concurrent_tasks
        let result = sqlx::query(
            r#"
            UPDATE gpu_servers
            SET last_heartbeat = $1, current_tasks = MIN(MAX($2, 0), max_concurrent_tasks),
                cpu_usage = $3, memory_usage = $4, gpu_usage = $5, status = $6
            WHERE id = $7
            "#,
        )
        .bind(heartbeat.timestamp)
        .bind(heartbeat.current_tasks)
        .bind(heartbeat.cpu_usage)
        .bind(heartbeat.memory_usage)
        .bind(heartbeat.gpu_usage)
        .bind(GpuServerStatus::Online)
        .bind(server_id)
        .execute(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        if result.rows_affected() == 0 {
            return Err(SchedulerError::WorkerNotFound {
                id: server_id.to_string(),
            });
        }
        Ok(())
    }

    async fn try_acquire_slot(&self, server_id: &str) -> SchedulerResult<bool> {
        // 条件自增：容量判断与占用是同一条语句，天然原子
        let result = sqlx::query(
            "UPDATE gpu_servers SET current_tasks = current_tasks + 1 WHERE id = $1 AND current_tasks < max_concurrent_tasks",
        )
        .bind(server_id)
        .execute(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        Ok(result.rows_affected() > 0)
    }

    async fn release_slot(&self, server_id: &str) -> SchedulerResult<()> {
        let result = sqlx::query(
            "UPDATE gpu_servers SET current_tasks = CASE WHEN current_tasks > 0 THEN current_tasks - 1 ELSE 0 END WHERE id = $1",
        )
        .bind(server_id)
        .execute(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        if result.rows_affected() == 0 {
            return Err(SchedulerError::WorkerNotFound {
                id: server_id.to_string(),
            });
        }
        Ok(())
    }

    async fn update_status(
        &self,
        server_id: &str,
        status: GpuServerStatus,
    ) -> SchedulerResult<()> {
        let result = sqlx::query("UPDATE gpu_servers SET status = $1 WHERE id = $2")
            .bind(status)
            .bind(server_id)
            .execute(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;

        if result.rows_affected() == 0 {
            return Err(SchedulerError::WorkerNotFound {
                id: server_id.to_string(),
            });
        }

        debug!("更新GPU服务器状态成功: {} -> {:?}", server_id, status);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::sqlite::init_schema;
    use chrono::Utc;
    use gpu_scheduler_domain::entities::GpuServerRegistration;

    async fn setup_repo() -> SqliteWorkerRepository {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        init_schema(&pool).await.unwrap();
        SqliteWorkerRepository::new(pool)
    }

    fn sample_server(max_tasks: i32) -> GpuServer {
        let mut server = GpuServer::new(GpuServerRegistration {
            name: "gpu-01".to_string(),
            address: "10.0.0.1:22".to_string(),
            credentials_ref: None,
            max_concurrent_tasks: max_tasks,
        });
        server.status = GpuServerStatus::Online;
        server
    }

    #[tokio::test]
    async fn test_register_and_get() {
        let repo = setup_repo().await;
        let server = sample_server(4);
        repo.register(&server).await.unwrap();

        let loaded = repo.get_by_id(&server.id).await.unwrap().unwrap();
        assert_eq!(loaded.name, "gpu-01");
        assert_eq!(loaded.status, GpuServerStatus::Online);
        assert_eq!(loaded.current_tasks, 0);
    }

    #[tokio::test]
    async fn test_slot_acquire_until_full() {
        let repo = setup_repo().await;
        let server = sample_server(2);
        repo.register(&server).await.unwrap();

        assert!(repo.try_acquire_slot(&server.id).await.unwrap());
        assert!(repo.try_acquire_slot(&server.id).await.unwrap());
        // 满载后拒绝
        assert!(!repo.try_acquire_slot(&server.id).await.unwrap());

        repo.release_slot(&server.id).await.unwrap();
        assert!(repo.try_acquire_slot(&server.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_release_slot_floors_at_zero() {
        let repo = setup_repo().await;
        let server = sample_server(2);
        repo.register(&server).await.unwrap();

        repo.release_slot(&server.id).await.unwrap();
        let loaded = repo.get_by_id(&server.id).await.unwrap().unwrap();
        assert_eq!(loaded.current_tasks, 0);
    }

    #[tokio::test]
    async fn test_heartbeat_brings_server_back_online() {
        let repo = setup_repo().await;
        let server = sample_server(2);
        repo.register(&server).await.unwrap();
        repo.update_status(&server.id, GpuServerStatus::Offline)
            .await
            .unwrap();

        let heartbeat = WorkerHeartbeat {
            current_tasks: 1,
            cpu_usage: Some(35.0),
            memory_usage: Some(60.0),
            gpu_usage: Some(80.0),
            timestamp: Utc::now(),
        };
        repo.register_heartbeat(&server.id, &heartbeat).await.unwrap();

        let loaded = repo.get_by_id(&server.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, GpuServerStatus::Online);
        assert_eq!(loaded.current_tasks, 1);
        assert_eq!(loaded.gpu_usage, Some(80.0));
        assert!(loaded.last_heartbeat.is_some());
    }

    #[tokio::test]
    async fn test_heartbeat_load_snapshot_clamped_to_capacity() {
        let repo = setup_repo().await;
        let server = sample_server(2);
        repo.register(&server).await.unwrap();

        let snapshot = |current_tasks: i32| WorkerHeartbeat {
            current_tasks,
            cpu_usage: None,
            memory_usage: None,
            gpu_usage: None,
            timestamp: Utc::now(),
        };

        // 上报超过容量的负载被截断到上限
        repo.register_heartbeat(&server.id, &snapshot(99)).await.unwrap();
        let loaded = repo.get_by_id(&server.id).await.unwrap().unwrap();
        assert_eq!(loaded.current_tasks, 2);

        // 负数截断到0
        repo.register_heartbeat(&server.id, &snapshot(-1)).await.unwrap();
        let loaded = repo.get_by_id(&server.id).await.unwrap().unwrap();
        assert_eq!(loaded.current_tasks, 0);
    }

    #[tokio::test]
    async fn test_list_available_excludes_full_and_offline() {
        let repo = setup_repo().await;
        let online = sample_server(2);
        let mut offline = sample_server(2);
        offline.status = GpuServerStatus::Offline;
        let full = sample_server(1);

        repo.register(&online).await.unwrap();
        repo.register(&offline).await.unwrap();
        repo.register(&full).await.unwrap();
        assert!(repo.try_acquire_slot(&full.id).await.unwrap());

        let available = repo.list_available().await.unwrap();
        assert_eq!(available.len(), 1);
        assert_eq!(available[0].id, online.id);
    }

    #[tokio::test]
    async fn test_missing_server_errors() {
        let repo = setup_repo().await;
        let err = repo
            .update_status("不存在", GpuServerStatus::Online)
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::WorkerNotFound { .. }));
    }
}
