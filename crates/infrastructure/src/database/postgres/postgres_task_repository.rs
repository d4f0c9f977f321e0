use async_trait::async_trait;
use gpu_scheduler_domain::{
    entities::{Task, TaskStatus},
    repositories::TaskRepository,
    SchedulerError, SchedulerResult,
};
use sqlx::{PgPool, Row};
use tracing::debug;

use crate::database::mapping::MappingHelpers;

const TASK_COLUMNS: &str = "id, user_id, title, task_type, status, priority, progress, gpu_server_id, config, result, error_message, cost, retry_count, max_retries, created_at, updated_at, started_at, completed_at";

pub struct PostgresTaskRepository {
    pool: PgPool,
}

impl PostgresTaskRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_task(row: &sqlx::postgres::PgRow) -> SchedulerResult<Task> {
        let config_text: String = row.try_get("config")?;
        let result_text: Option<String> = row.try_get("result")?;

        Ok(Task {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            title: row.try_get("title")?,
            task_type: row.try_get("task_type")?,
            status: row.try_get("status")?,
            priority: row.try_get("priority")?,
            progress: row.try_get("progress")?,
            gpu_server_id: row.try_get("gpu_server_id")?,
            config: MappingHelpers::text_to_json(&config_text)?,
            result: MappingHelpers::opt_text_to_json(result_text)?,
            error_message: row.try_get("error_message")?,
            cost: row.try_get("cost")?,
            retry_count: row.try_get("retry_count")?,
            max_retries: row.try_get("max_retries")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }
}

#[async_trait]
impl TaskRepository for PostgresTaskRepository {
    async fn create(&self, task: &Task) -> SchedulerResult<()> {
        let config_text = MappingHelpers::json_to_text(&task.config)?;
        let result_text = MappingHelpers::opt_json_to_text(&task.result)?;

        sqlx::query(
            r#"
            INSERT INTO tasks (id, user_id, title, task_type, status, priority, progress, gpu_server_id, config, result, error_message, cost, retry_count, max_retries, created_at, updated_at, started_at, completed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
            "#,
        )
        .bind(&task.id)
        .bind(&task.user_id)
        .bind(&task.title)
        .bind(&task.task_type)
        .bind(task.status)
        .bind(task.priority)
        .bind(task.progress)
        .bind(&task.gpu_server_id)
        .bind(config_text)
        .bind(result_text)
        .bind(&task.error_message)
        .bind(task.cost)
        .bind(task.retry_count)
        .bind(task.max_retries)
        .bind(task.created_at)
        .bind(task.updated_at)
        .bind(task.started_at)
        .bind(task.completed_at)
        .execute(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        debug!("创建任务成功: {}", task.id);
        Ok(())
    }

    async fn get_by_id(&self, task_id: &str) -> SchedulerResult<Option<Task>> {
        let row = sqlx::query(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1"))
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;

        row.as_ref().map(Self::row_to_task).transpose()
    }

    async fn get_by_id_for_user(
        &self,
        task_id: &str,
        user_id: &str,
    ) -> SchedulerResult<Option<Task>> {
        let row = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1 AND user_id = $2"
        ))
        .bind(task_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        row.as_ref().map(Self::row_to_task).transpose()
    }

    async fn list_by_user(
        &self,
        user_id: &str,
        limit: i64,
        offset: i64,
    ) -> SchedulerResult<Vec<Task>> {
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE user_id = $1 ORDER BY created_at DESC LIMIT $2 OFFSET $3"
        ))
        .bind(user_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        rows.iter().map(Self::row_to_task).collect()
    }

    async fn count_by_user(&self, user_id: &str) -> SchedulerResult<i64> {
        let row = sqlx::query("SELECT COUNT(*) as count FROM tasks WHERE user_id = $1")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;

        Ok(row.try_get("count")?)
    }

    async fn list_by_status(&self, status: TaskStatus) -> SchedulerResult<Vec<Task>> {
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE status = $1 ORDER BY created_at ASC"
        ))
        .bind(status)
        .fetch_all(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        rows.iter().map(Self::row_to_task).collect()
    }

    async fn get_running_by_worker(&self, worker_id: &str) -> SchedulerResult<Vec<Task>> {
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE status = $1 AND gpu_server_id = $2"
        ))
        .bind(TaskStatus::Running)
        .bind(worker_id)
        .fetch_all(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        rows.iter().map(Self::row_to_task).collect()
    }

    async fn count_by_status(&self, status: TaskStatus) -> SchedulerResult<i64> {
        let row = sqlx::query("SELECT COUNT(*) as count FROM tasks WHERE status = $1")
            .bind(status)
            .fetch_one(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;

        Ok(row.try_get("count")?)
    }

    async fn update(&self, task: &Task) -> SchedulerResult<()> {
        let config_text = MappingHelpers::json_to_text(&task.config)?;
        let result_text = MappingHelpers::opt_json_to_text(&task.result)?;

        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET status = $2, priority = $3, progress = $4, gpu_server_id = $5, config = $6,
                result = $7, error_message = $8, cost = $9, retry_count = $10,
                updated_at = $11, started_at = $12, completed_at = $13
            WHERE id = $1
            "#,
        )
        .bind(&task.id)
        .bind(task.status)
        .bind(task.priority)
        .bind(task.progress)
        .bind(&task.gpu_server_id)
        .bind(config_text)
        .bind(result_text)
        .bind(&task.error_message)
        .bind(task.cost)
        .bind(task.retry_count)
        .bind(task.updated_at)
        .bind(task.started_at)
        .bind(task.completed_at)
        .execute(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        if result.rows_affected() == 0 {
            return Err(SchedulerError::TaskNotFound {
                id: task.id.clone(),
            });
        }

        debug!("更新任务成功: {} -> {:?}", task.id, task.status);
        Ok(())
    }

    async fn update_progress(&self, task_id: &str, progress: f64) -> SchedulerResult<()> {
        let result = sqlx::query(
            "UPDATE tasks SET progress = $1, updated_at = $2 WHERE id = $3",
        )
        .bind(progress)
        .bind(chrono::Utc::now())
        .bind(task_id)
        .execute(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        if result.rows_affected() == 0 {
            return Err(SchedulerError::TaskNotFound {
                id: task_id.to_string(),
            });
        }
        Ok(())
    }
}
