use std::time::Duration;

use gpu_scheduler_domain::entities::Task;

/// 重试策略：决定失败任务是否重新入队以及退避时长
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// 基础重试间隔（秒）
    pub base_interval_seconds: u64,
    /// 最大重试间隔（秒）
    pub max_interval_seconds: u64,
    /// 指数退避倍数
    pub backoff_multiplier: f64,
    /// 重试间隔的随机抖动范围（0.0-1.0）
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_interval_seconds: 5,
            max_interval_seconds: 300,
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetryPolicy {
    /// 任务是否还有重试额度
    pub fn should_retry(&self, task: &Task) -> bool {
        task.retry_count < task.max_retries
    }

    /// 按当前重试次数计算退避时长，带随机抖动避免雷群
    pub fn backoff_delay(&self, retry_count: i32) -> Duration {
        let base = self.base_interval_seconds as f64;
        let exponential = base * self.backoff_multiplier.powi(retry_count.max(0));
        let capped = exponential.min(self.max_interval_seconds as f64);

        let jitter = capped * self.jitter_factor * (rand::random::<f64>() - 0.5) * 2.0;
        let final_secs = (capped + jitter).max(0.0);

        Duration::from_millis((final_secs * 1000.0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn task_with_retries(retry_count: i32, max_retries: i32) -> Task {
        let mut task = Task::new(
            "user-1".to_string(),
            "t".to_string(),
            "training".to_string(),
            1,
            json!({}),
            max_retries,
        );
        task.retry_count = retry_count;
        task
    }

    #[test]
    fn test_should_retry_bound() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(&task_with_retries(0, 3)));
        assert!(policy.should_retry(&task_with_retries(2, 3)));
        assert!(!policy.should_retry(&task_with_retries(3, 3)));
        assert!(!policy.should_retry(&task_with_retries(0, 0)));
    }

    #[test]
    fn test_backoff_delay_within_bounds() {
        let policy = RetryPolicy {
            base_interval_seconds: 5,
            max_interval_seconds: 300,
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        };

        for retry_count in 0..10 {
            let delay = policy.backoff_delay(retry_count);
            // 抖动最多±10%，上限之外不应再增长
            assert!(delay <= Duration::from_secs(330), "retry {retry_count}: {delay:?}");
        }

        // 无抖动时严格指数增长并封顶
        let no_jitter = RetryPolicy {
            jitter_factor: 0.0,
            ..policy
        };
        assert_eq!(no_jitter.backoff_delay(0), Duration::from_secs(5));
        assert_eq!(no_jitter.backoff_delay(1), Duration::from_secs(10));
        assert_eq!(no_jitter.backoff_delay(2), Duration::from_secs(20));
        assert_eq!(no_jitter.backoff_delay(20), Duration::from_secs(300));
    }
}
