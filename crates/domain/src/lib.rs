pub mod entities;
pub mod errors;
pub mod executor;
pub mod repositories;

pub use entities::{
    BalanceReservation, ClusterOverview, GpuServer, GpuServerRegistration, GpuServerStatus,
    RechargeCode, RechargeRecord, Task, TaskStatus, UserAccount, WorkerHeartbeat,
};
pub use errors::{SchedulerError, SchedulerResult};
pub use executor::{ExecutionReport, RemoteExecutor};
pub use repositories::{BalanceLedger, RedeemOutcome, TaskRepository, WorkerRepository};
