use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub dispatcher: DispatcherConfig,
    pub health_monitor: HealthMonitorSettings,
    pub retry: RetryConfig,
    pub executor: ExecutorConfig,
    pub api: ApiConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            dispatcher: DispatcherConfig::default(),
            health_monitor: HealthMonitorSettings::default(),
            retry: RetryConfig::default(),
            executor: ExecutorConfig::default(),
            api: ApiConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite:gpu-scheduler.db?mode=rwc".to_string(),
            max_connections: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub tick_interval_seconds: u64,
    pub poll_interval_ms: u64,
    pub remote_call_timeout_ms: u64,
    pub cancel_grace_period_ms: u64,
    pub max_poll_failures: u32,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            tick_interval_seconds: 5,
            poll_interval_ms: 1000,
            remote_call_timeout_ms: 10_000,
            cancel_grace_period_ms: 5_000,
            max_poll_failures: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthMonitorSettings {
    pub heartbeat_timeout_seconds: i64,
    pub check_interval_seconds: u64,
}

impl Default for HealthMonitorSettings {
    fn default() -> Self {
        Self {
            heartbeat_timeout_seconds: 90,
            check_interval_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub base_interval_seconds: u64,
    pub max_interval_seconds: u64,
    pub backoff_multiplier: f64,
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_interval_seconds: 5,
            max_interval_seconds: 300,
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub steps_per_poll: u32,
    pub billing_rate_per_step: f64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            steps_per_poll: 5,
            billing_rate_per_step: 0.01,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub bind_address: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
        }
    }
}

impl AppConfig {
    /// 配置加载顺序：内置默认值 < TOML文件 < GPU_SCHEDULER__环境变量
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder()
            .add_source(ConfigBuilder::try_from(&AppConfig::default()).context("序列化默认配置失败")?);

        match config_path {
            Some(path) => {
                if !Path::new(path).exists() {
                    return Err(anyhow::anyhow!("配置文件不存在: {path}"));
                }
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            }
            None => {
                for path in ["config/scheduler.toml", "scheduler.toml"] {
                    if Path::new(path).exists() {
                        builder = builder.add_source(File::new(path, FileFormat::Toml));
                        break;
                    }
                }
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("GPU_SCHEDULER")
                .separator("__")
                .try_parsing(true),
        );

        builder
            .build()
            .context("构建配置失败")?
            .try_deserialize()
            .context("解析配置失败")
    }
}
