use std::time::Duration;

use orchestrator_domain::TaskConfig;

/// 单次重试等待的上限
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(24 * 60 * 60);

/// 指数退避重试策略
///
/// 第 n 次重试（从 0 开始）等待 `base × backoff^n`。
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub backoff: f64,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, backoff: f64) -> Self {
        Self {
            max_retries,
            base_delay,
            backoff,
        }
    }

    pub fn from_task_config(config: &TaskConfig) -> Self {
        Self::new(config.max_retries, config.retry_delay, config.retry_backoff)
    }

    /// 工作流步骤使用固定的 2 倍退避
    pub fn for_steps(max_retries: u32, base_delay: Duration) -> Self {
        Self::new(max_retries, base_delay, 2.0)
    }

    pub fn should_retry(&self, retry_count: u32) -> bool {
        retry_count < self.max_retries
    }

    /// 把 `max_retries` 当作总尝试次数时的上限，至少执行一次
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.max(1)
    }

    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let exponent = i32::try_from(retry_count).unwrap_or(i32::MAX);
        let secs = self.base_delay.as_secs_f64() * self.backoff.powi(exponent);
        if !secs.is_finite() || secs < 0.0 || secs >= MAX_RETRY_DELAY.as_secs_f64() {
            return MAX_RETRY_DELAY;
        }
        Duration::from_secs_f64(secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_delays() {
        let policy = RetryPolicy::new(3, Duration::from_secs(1), 2.0);
        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
    }

    #[test]
    fn test_backoff_of_one_keeps_delay_constant() {
        let policy = RetryPolicy::new(5, Duration::from_millis(250), 1.0);
        assert_eq!(policy.delay_for(0), policy.delay_for(4));
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = RetryPolicy::new(100, Duration::from_secs(60), 10.0);
        assert_eq!(policy.delay_for(50), MAX_RETRY_DELAY);
    }

    #[test]
    fn test_retry_budget() {
        let policy = RetryPolicy::from_task_config(&TaskConfig::default().with_max_retries(2));
        assert!(policy.should_retry(0));
        assert!(policy.should_retry(1));
        assert!(!policy.should_retry(2));
    }

    #[test]
    fn test_step_attempt_cap() {
        let base = Duration::from_secs(1);
        assert_eq!(RetryPolicy::for_steps(0, base).max_attempts(), 1);
        assert_eq!(RetryPolicy::for_steps(1, base).max_attempts(), 1);
        assert_eq!(RetryPolicy::for_steps(3, base).max_attempts(), 3);
    }
}
