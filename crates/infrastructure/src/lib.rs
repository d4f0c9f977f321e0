pub mod database;
pub mod executors;

pub use database::manager::{DatabaseManager, DatabasePool, DatabaseType};
pub use executors::SimulatedExecutor;
