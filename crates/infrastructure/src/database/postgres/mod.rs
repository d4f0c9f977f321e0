pub mod postgres_balance_ledger;
pub mod postgres_task_repository;
pub mod postgres_worker_repository;

pub use postgres_balance_ledger::PostgresBalanceLedger;
pub use postgres_task_repository::PostgresTaskRepository;
pub use postgres_worker_repository::PostgresWorkerRepository;
