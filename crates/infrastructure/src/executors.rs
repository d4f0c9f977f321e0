//! 模拟执行器：不连接真实GPU服务器，按任务类型推进固定步数。
//! 嵌入式部署与端到端演示使用，接口与真实传输层实现完全一致。

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, info};

use gpu_scheduler_domain::{
    entities::{GpuServer, Task},
    executor::{ExecutionReport, RemoteExecutor},
    SchedulerError, SchedulerResult,
};

#[derive(Debug, Clone)]
pub struct SimulatedExecutorConfig {
    /// 每次轮询推进的步数
    pub steps_per_poll: u32,
    /// 每步计费
    pub billing_rate_per_step: f64,
}

impl Default for SimulatedExecutorConfig {
    fn default() -> Self {
        Self {
            steps_per_poll: 5,
            billing_rate_per_step: 0.01,
        }
    }
}

struct SimulatedRun {
    total_steps: u32,
    completed_steps: u32,
    fail_at_step: Option<u32>,
}

#[derive(Default)]
pub struct SimulatedExecutor {
    config: SimulatedExecutorConfig,
    runs: Mutex<HashMap<String, SimulatedRun>>,
}

impl SimulatedExecutor {
    pub fn new(config: SimulatedExecutorConfig) -> Self {
        Self {
            config,
            runs: Mutex::new(HashMap::new()),
        }
    }

    /// 不同任务类型的模拟工作量
    fn total_steps_for(task_type: &str) -> u32 {
        match task_type {
            "training" => 100,
            "inference" => 50,
            "data_processing" => 20,
            _ => 30,
        }
    }
}

#[async_trait]
impl RemoteExecutor for SimulatedExecutor {
    async fn start(&self, task: &Task, server: &GpuServer) -> SchedulerResult<()> {
        // 任务配置可注入失败点，演示重试路径用
        let fail_at_step = task
            .config
            .get("simulate_fail_at_step")
            .and_then(|v| v.as_u64())
            .map(|v| v as u32);

        let run = SimulatedRun {
            total_steps: Self::total_steps_for(&task.task_type),
            completed_steps: 0,
            fail_at_step,
        };
        self.runs
            .lock()
            .expect("runs lock poisoned")
            .insert(task.id.clone(), run);

        info!(
            "模拟执行器在 {} 上启动任务 {} ({} 步)",
            server.id,
            task.id,
            Self::total_steps_for(&task.task_type)
        );
        Ok(())
    }

    async fn poll(&self, task_id: &str, _server: &GpuServer) -> SchedulerResult<ExecutionReport> {
        let mut runs = self.runs.lock().expect("runs lock poisoned");
        let Some(run) = runs.get_mut(task_id) else {
            return Err(SchedulerError::execution_failure(
                format!("任务 {task_id} 不在执行器中"),
                true,
            ));
        };

        run.completed_steps = (run.completed_steps + self.config.steps_per_poll).min(run.total_steps);

        if let Some(fail_at) = run.fail_at_step {
            if run.completed_steps >= fail_at {
                runs.remove(task_id);
                return Ok(ExecutionReport::Failed {
                    message: format!("模拟执行在第 {fail_at} 步失败"),
                    retryable: true,
                });
            }
        }

        if run.completed_steps >= run.total_steps {
            let total_steps = run.total_steps;
            runs.remove(task_id);
            let actual_cost = total_steps as f64 * self.config.billing_rate_per_step;
            return Ok(ExecutionReport::Completed {
                result: json!({
                    "steps": total_steps,
                    "output": format!("模拟执行完成，共 {total_steps} 步"),
                }),
                actual_cost,
            });
        }

        Ok(ExecutionReport::Running {
            progress: (run.completed_steps as f64 / run.total_steps as f64) * 100.0,
        })
    }

    async fn cancel(&self, task_id: &str, _server: &GpuServer) -> SchedulerResult<()> {
        let removed = self
            .runs
            .lock()
            .expect("runs lock poisoned")
            .remove(task_id)
            .is_some();
        debug!("模拟执行器取消任务 {} (存在: {})", task_id, removed);
        Ok(())
    }

    async fn health_check(&self, _server: &GpuServer) -> SchedulerResult<bool> {
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpu_scheduler_domain::entities::{GpuServerRegistration, Task};

    fn sample_server() -> GpuServer {
        GpuServer::new(GpuServerRegistration {
            name: "gpu-01".to_string(),
            address: "10.0.0.1:22".to_string(),
            credentials_ref: None,
            max_concurrent_tasks: 2,
        })
    }

    fn sample_task(task_type: &str, config: serde_json::Value) -> Task {
        Task::new(
            "user-1".to_string(),
            "t".to_string(),
            task_type.to_string(),
            1,
            config,
            3,
        )
    }

    #[tokio::test]
    async fn test_simulated_run_to_completion() {
        let executor = SimulatedExecutor::new(SimulatedExecutorConfig {
            steps_per_poll: 10,
            billing_rate_per_step: 0.1,
        });
        let server = sample_server();
        let task = sample_task("inference", json!({}));
        executor.start(&task, &server).await.unwrap();

        // inference共50步，每轮10步：4轮running，第5轮完成
        for _ in 0..4 {
            match executor.poll(&task.id, &server).await.unwrap() {
                ExecutionReport::Running { progress } => assert!(progress < 100.0),
                other => panic!("意外的报告: {other:?}"),
            }
        }
        match executor.poll(&task.id, &server).await.unwrap() {
            ExecutionReport::Completed { actual_cost, .. } => {
                assert!((actual_cost - 5.0).abs() < f64::EPSILON)
            }
            other => panic!("意外的报告: {other:?}"),
        }

        // 完成后任务已从执行器移除
        assert!(executor.poll(&task.id, &server).await.is_err());
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let executor = SimulatedExecutor::new(SimulatedExecutorConfig {
            steps_per_poll: 10,
            billing_rate_per_step: 0.01,
        });
        let server = sample_server();
        let task = sample_task("training", json!({ "simulate_fail_at_step": 10 }));
        executor.start(&task, &server).await.unwrap();

        match executor.poll(&task.id, &server).await.unwrap() {
            ExecutionReport::Failed { retryable, .. } => assert!(retryable),
            other => panic!("意外的报告: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancel_removes_run() {
        let executor = SimulatedExecutor::new(SimulatedExecutorConfig::default());
        let server = sample_server();
        let task = sample_task("training", json!({}));
        executor.start(&task, &server).await.unwrap();

        executor.cancel(&task.id, &server).await.unwrap();
        assert!(executor.poll(&task.id, &server).await.is_err());
        // 重复取消为no-op
        executor.cancel(&task.id, &server).await.unwrap();
    }
}
