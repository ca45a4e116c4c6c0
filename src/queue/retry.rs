//! 投递重试机制（指数退避策略）

use std::time::Duration;

use rand::Rng;

use crate::config::RetryConfig;
use crate::error::{Result, TripCoreError};

/// 重试策略
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// 初始延迟（毫秒）
    pub initial_delay_ms: u64,
    /// 最大延迟（毫秒）
    pub max_delay_ms: u64,
    /// 退避倍数
    pub backoff_multiplier: f64,
}

impl RetryPolicy {
    /// 从配置创建重试策略
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            initial_delay_ms: config.initial_delay_ms,
            max_delay_ms: config.max_delay_ms,
            backoff_multiplier: config.backoff_multiplier,
        }
    }

    /// 计算第 attempt 次失败后的重试延迟（指数退避，±10% 抖动）
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let base_ms = (self.initial_delay_ms as f64
            * self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32))
        .min(self.max_delay_ms as f64);
        let jitter = rand::thread_rng().gen_range(0.9..1.1);
        let delay_ms = (base_ms * jitter).min(self.max_delay_ms as f64) as u64;
        Duration::from_millis(delay_ms)
    }

    /// 退避总时长上界（用于判断任务是否卡死）
    pub fn max_total_delay(&self, max_attempts: u32) -> Duration {
        Duration::from_millis(self.max_delay_ms.saturating_mul(max_attempts as u64))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

/// 带重试的执行函数
///
/// 仅对可重试错误退避重试；不可重试错误与用尽次数后直接返回最后错误
pub async fn execute_with_retry<F, Fut, T>(
    policy: &RetryPolicy,
    max_attempts: u32,
    mut f: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        match f().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if e.is_retryable() && attempt < max_attempts {
                    let delay = policy.calculate_delay(attempt);
                    tokio::time::sleep(delay).await;
                    continue;
                }
                return Err(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy() -> RetryPolicy {
        RetryPolicy {
            initial_delay_ms: 100,
            max_delay_ms: 1000,
            backoff_multiplier: 2.0,
        }
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = policy();
        let first = policy.calculate_delay(1).as_millis() as f64;
        let second = policy.calculate_delay(2).as_millis() as f64;
        let far = policy.calculate_delay(10).as_millis() as u64;

        // 第一次约 100ms，第二次约 200ms（各 ±10% 抖动）
        assert!((90.0..=110.0).contains(&first));
        assert!((180.0..=220.0).contains(&second));
        // 封顶在 max_delay_ms
        assert!(far <= 1000);
    }

    #[tokio::test]
    async fn test_execute_with_retry_recovers() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy {
            initial_delay_ms: 1,
            max_delay_ms: 2,
            backoff_multiplier: 1.0,
        };

        let result = execute_with_retry(&policy, 3, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(TripCoreError::ServiceUnavailable("flaky".to_string()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_execute_with_retry_gives_up_on_non_retryable() {
        let calls = AtomicU32::new(0);

        let result: Result<()> = execute_with_retry(&RetryPolicy::default(), 5, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(TripCoreError::AlertNotFound("sos_x".to_string()))
            }
        })
        .await;

        assert!(result.is_err());
        // 不可重试错误不消耗剩余次数
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
