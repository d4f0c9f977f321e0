pub mod sqlite_balance_ledger;
pub mod sqlite_task_repository;
pub mod sqlite_worker_repository;

pub use sqlite_balance_ledger::SqliteBalanceLedger;
pub use sqlite_task_repository::SqliteTaskRepository;
pub use sqlite_worker_repository::SqliteWorkerRepository;

use gpu_scheduler_domain::{SchedulerError, SchedulerResult};
use sqlx::SqlitePool;

/// SQLite建表。嵌入式部署与测试共用，幂等。
pub async fn init_schema(pool: &SqlitePool) -> SchedulerResult<()> {
    let statements = [
        r#"
        CREATE TABLE IF NOT EXISTS tasks (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            title TEXT NOT NULL,
            task_type TEXT NOT NULL,
            status TEXT NOT NULL,
            priority INTEGER NOT NULL,
            progress REAL NOT NULL DEFAULT 0,
            gpu_server_id TEXT,
            config TEXT NOT NULL,
            result TEXT,
            error_message TEXT,
            cost REAL NOT NULL DEFAULT 0,
            retry_count INTEGER NOT NULL DEFAULT 0,
            max_retries INTEGER NOT NULL DEFAULT 3,
            created_at DATETIME NOT NULL,
            updated_at DATETIME NOT NULL,
            started_at DATETIME,
            completed_at DATETIME
        )
        "#,
        "CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status)",
        "CREATE INDEX IF NOT EXISTS idx_tasks_user ON tasks(user_id, created_at)",
        r#"
        CREATE TABLE IF NOT EXISTS gpu_servers (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            address TEXT NOT NULL,
            credentials_ref TEXT,
            status TEXT NOT NULL,
            max_concurrent_tasks INTEGER NOT NULL,
            current_tasks INTEGER NOT NULL DEFAULT 0,
            cpu_usage REAL,
            memory_usage REAL,
            gpu_usage REAL,
            last_heartbeat DATETIME,
            registered_at DATETIME NOT NULL
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS user_accounts (
            user_id TEXT PRIMARY KEY,
            balance REAL NOT NULL DEFAULT 0,
            updated_at DATETIME NOT NULL
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS balance_reservations (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            task_id TEXT NOT NULL,
            amount REAL NOT NULL,
            created_at DATETIME NOT NULL
        )
        "#,
        "CREATE INDEX IF NOT EXISTS idx_reservations_task ON balance_reservations(task_id)",
        r#"
        CREATE TABLE IF NOT EXISTS recharge_codes (
            id TEXT PRIMARY KEY,
            code TEXT NOT NULL UNIQUE,
            amount REAL NOT NULL,
            max_uses INTEGER NOT NULL,
            used_count INTEGER NOT NULL DEFAULT 0,
            expires_at DATETIME,
            created_by TEXT NOT NULL,
            created_at DATETIME NOT NULL
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS recharge_records (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            recharge_code_id TEXT NOT NULL,
            amount REAL NOT NULL,
            created_at DATETIME NOT NULL
        )
        "#,
    ];

    for statement in statements {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(SchedulerError::Database)?;
    }
    Ok(())
}
