use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub task_type: String, // "training", "inference", "data_processing" 等
    pub status: TaskStatus,
    pub priority: i32,  // 数值越大越先调度
    pub progress: f64,  // 0.0 - 100.0
    pub gpu_server_id: Option<String>,
    pub config: serde_json::Value, // 对调度器不透明，原样传给执行器
    pub result: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub cost: f64,
    pub retry_count: i32,
    pub max_retries: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    #[serde(rename = "pending")]
    Pending,
    #[serde(rename = "running")]
    Running,
    #[serde(rename = "completed")]
    Completed,
    #[serde(rename = "failed")]
    Failed,
    #[serde(rename = "cancelled")]
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    fn parse(s: &str) -> Result<Self, String> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            _ => Err(format!("Invalid task status: {s}")),
        }
    }

    /// 终态不可再变更
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl sqlx::Type<sqlx::Postgres> for TaskStatus {
    fn type_info() -> sqlx::postgres::PgTypeInfo {
        sqlx::postgres::PgTypeInfo::with_name("VARCHAR")
    }
}

impl sqlx::Type<sqlx::Sqlite> for TaskStatus {
    fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
        <str as sqlx::Type<sqlx::Sqlite>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Postgres> for TaskStatus {
    fn decode(value: sqlx::postgres::PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as sqlx::Decode<sqlx::Postgres>>::decode(value)?;
        TaskStatus::parse(s).map_err(Into::into)
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for TaskStatus {
    fn decode(value: sqlx::sqlite::SqliteValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as sqlx::Decode<sqlx::Sqlite>>::decode(value)?;
        TaskStatus::parse(s).map_err(Into::into)
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Postgres> for TaskStatus {
    fn encode_by_ref(
        &self,
        buf: &mut sqlx::postgres::PgArgumentBuffer,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        <&str as sqlx::Encode<sqlx::Postgres>>::encode(self.as_str(), buf)
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for TaskStatus {
    fn encode_by_ref(
        &self,
        buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        <&str as sqlx::Encode<sqlx::Sqlite>>::encode(self.as_str(), buf)
    }
}

impl Task {
    pub fn new(
        user_id: String,
        title: String,
        task_type: String,
        priority: i32,
        config: serde_json::Value,
        max_retries: i32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            user_id,
            title,
            task_type,
            status: TaskStatus::Pending,
            priority,
            progress: 0.0,
            gpu_server_id: None,
            config,
            result: None,
            error_message: None,
            cost: 0.0,
            retry_count: 0,
            max_retries,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self.status, TaskStatus::Running)
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }

    /// 从任务配置中读取预估费用，缺省为1.0
    pub fn cost_estimate(&self) -> f64 {
        self.config
            .get("cost_estimate")
            .and_then(|v| v.as_f64())
            .filter(|v| *v >= 0.0)
            .unwrap_or(1.0)
    }

    /// 状态迁移并维护时间戳；终态不允许再迁出
    pub fn transition_to(&mut self, status: TaskStatus) -> Result<(), (TaskStatus, TaskStatus)> {
        if self.status.is_terminal() {
            return Err((self.status, status));
        }
        self.status = status;
        self.updated_at = Utc::now();
        match status {
            TaskStatus::Running => {
                if self.started_at.is_none() {
                    self.started_at = Some(self.updated_at);
                }
            }
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled => {
                if self.completed_at.is_none() {
                    self.completed_at = Some(self.updated_at);
                }
            }
            _ => {}
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpuServer {
    pub id: String,
    pub name: String,
    pub address: String,
    /// 凭据句柄（如SSH密钥路径），调度器不解释，透传给执行器
    pub credentials_ref: Option<String>,
    pub status: GpuServerStatus,
    pub max_concurrent_tasks: i32,
    pub current_tasks: i32,
    pub cpu_usage: Option<f64>,
    pub memory_usage: Option<f64>,
    pub gpu_usage: Option<f64>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub registered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum GpuServerStatus {
    #[serde(rename = "online")]
    Online,
    #[serde(rename = "degraded")]
    Degraded,
    #[serde(rename = "offline")]
    Offline,
}

impl GpuServerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GpuServerStatus::Online => "online",
            GpuServerStatus::Degraded => "degraded",
            GpuServerStatus::Offline => "offline",
        }
    }

    fn parse(s: &str) -> Result<Self, String> {
        match s {
            "online" => Ok(GpuServerStatus::Online),
            "degraded" => Ok(GpuServerStatus::Degraded),
            "offline" => Ok(GpuServerStatus::Offline),
            _ => Err(format!("Invalid gpu server status: {s}")),
        }
    }
}

impl sqlx::Type<sqlx::Postgres> for GpuServerStatus {
    fn type_info() -> sqlx::postgres::PgTypeInfo {
        sqlx::postgres::PgTypeInfo::with_name("VARCHAR")
    }
}

impl sqlx::Type<sqlx::Sqlite> for GpuServerStatus {
    fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
        <str as sqlx::Type<sqlx::Sqlite>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Postgres> for GpuServerStatus {
    fn decode(value: sqlx::postgres::PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as sqlx::Decode<sqlx::Postgres>>::decode(value)?;
        GpuServerStatus::parse(s).map_err(Into::into)
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for GpuServerStatus {
    fn decode(value: sqlx::sqlite::SqliteValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as sqlx::Decode<sqlx::Sqlite>>::decode(value)?;
        GpuServerStatus::parse(s).map_err(Into::into)
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Postgres> for GpuServerStatus {
    fn encode_by_ref(
        &self,
        buf: &mut sqlx::postgres::PgArgumentBuffer,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        <&str as sqlx::Encode<sqlx::Postgres>>::encode(self.as_str(), buf)
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for GpuServerStatus {
    fn encode_by_ref(
        &self,
        buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        <&str as sqlx::Encode<sqlx::Sqlite>>::encode(self.as_str(), buf)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpuServerRegistration {
    pub name: String,
    pub address: String,
    pub credentials_ref: Option<String>,
    pub max_concurrent_tasks: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerHeartbeat {
    pub current_tasks: i32,
    pub cpu_usage: Option<f64>,
    pub memory_usage: Option<f64>,
    pub gpu_usage: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

impl GpuServer {
    pub fn new(registration: GpuServerRegistration) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: registration.name,
            address: registration.address,
            credentials_ref: registration.credentials_ref,
            status: GpuServerStatus::Offline,
            max_concurrent_tasks: registration.max_concurrent_tasks,
            current_tasks: 0,
            cpu_usage: None,
            memory_usage: None,
            gpu_usage: None,
            last_heartbeat: None,
            registered_at: Utc::now(),
        }
    }

    pub fn is_online(&self) -> bool {
        matches!(self.status, GpuServerStatus::Online)
    }

    pub fn free_slots(&self) -> i32 {
        (self.max_concurrent_tasks - self.current_tasks).max(0)
    }

    pub fn has_capacity(&self) -> bool {
        self.is_online() && self.current_tasks < self.max_concurrent_tasks
    }

    pub fn heartbeat_age_seconds(&self, now: DateTime<Utc>) -> Option<i64> {
        self.last_heartbeat.map(|hb| (now - hb).num_seconds())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserAccount {
    pub user_id: String,
    pub balance: f64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RechargeCode {
    pub id: String,
    pub code: String,
    pub amount: f64,
    pub max_uses: i32,
    pub used_count: i32,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

impl RechargeCode {
    pub fn new(
        amount: f64,
        max_uses: i32,
        expires_at: Option<DateTime<Utc>>,
        created_by: String,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            code: Self::generate_code(16),
            amount,
            max_uses,
            used_count: 0,
            expires_at,
            created_by,
            created_at: Utc::now(),
        }
    }

    /// 生成充值码，排除易混淆字符（0/O/1/I）
    pub fn generate_code(length: usize) -> String {
        const CHARSET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
        let mut rng = rand::rng();
        (0..length)
            .map(|_| CHARSET[rng.random_range(0..CHARSET.len())] as char)
            .collect()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|exp| exp <= now)
    }

    pub fn is_exhausted(&self) -> bool {
        self.used_count >= self.max_uses
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RechargeRecord {
    pub id: String,
    pub user_id: String,
    pub recharge_code_id: String,
    pub amount: f64,
    pub created_at: DateTime<Utc>,
}

/// 余额预留：调度时冻结预估费用，结算时按实际费用扣减并退还差额
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceReservation {
    pub id: String,
    pub user_id: String,
    pub task_id: String,
    pub amount: f64,
    pub created_at: DateTime<Utc>,
}

/// 集群概览统计
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterOverview {
    pub total_servers: i64,
    pub online_servers: i64,
    pub total_gpus: i64,
    pub busy_gpus: i64,
    pub total_running_tasks: i64,
    pub queue_length: i64,
    pub average_gpu_usage: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_task_status_terminal() {
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_task_transition_sets_timestamps() {
        let mut task = Task::new(
            "user-1".to_string(),
            "训练任务".to_string(),
            "training".to_string(),
            5,
            json!({}),
            3,
        );
        assert!(task.started_at.is_none());

        task.transition_to(TaskStatus::Running).unwrap();
        assert!(task.started_at.is_some());
        assert!(task.completed_at.is_none());

        task.transition_to(TaskStatus::Completed).unwrap();
        assert!(task.completed_at.is_some());

        // 终态不可迁出
        assert!(task.transition_to(TaskStatus::Pending).is_err());
    }

    #[test]
    fn test_cost_estimate_from_config() {
        let mut task = Task::new(
            "user-1".to_string(),
            "t".to_string(),
            "inference".to_string(),
            1,
            json!({ "cost_estimate": 10.0 }),
            3,
        );
        assert_eq!(task.cost_estimate(), 10.0);

        task.config = json!({});
        assert_eq!(task.cost_estimate(), 1.0);

        // 负值视为无效，回退到默认值
        task.config = json!({ "cost_estimate": -5.0 });
        assert_eq!(task.cost_estimate(), 1.0);
    }

    #[test]
    fn test_gpu_server_capacity() {
        let mut server = GpuServer::new(GpuServerRegistration {
            name: "gpu-01".to_string(),
            address: "10.0.0.1:22".to_string(),
            credentials_ref: None,
            max_concurrent_tasks: 2,
        });
        assert!(!server.has_capacity()); // 初始离线

        server.status = GpuServerStatus::Online;
        assert!(server.has_capacity());
        assert_eq!(server.free_slots(), 2);

        server.current_tasks = 2;
        assert!(!server.has_capacity());
        assert_eq!(server.free_slots(), 0);
    }

    #[test]
    fn test_recharge_code_checks() {
        let now = Utc::now();
        let mut code = RechargeCode::new(50.0, 1, Some(now + chrono::Duration::hours(1)), "admin".to_string());
        assert_eq!(code.code.len(), 16);
        assert!(!code.is_expired(now));
        assert!(!code.is_exhausted());

        code.used_count = 1;
        assert!(code.is_exhausted());

        code.expires_at = Some(now - chrono::Duration::seconds(1));
        assert!(code.is_expired(now));
    }
}
