//! 滑动窗口限流器
//!
//! 按（调用方身份, 端点类）维度限流。关键端点类（SOS 触发、
//! 实时订阅）配额显著高于普通端点类。计数键按调用方隔离，
//! 某一调用方超额不影响其他调用方的配额。

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::admission::store::AdmissionStore;
use crate::config::AdmissionConfig;
use crate::error::{Result, TripCoreError};
use crate::metrics::AdmissionMetrics;

const RATE_KEY_PREFIX: &str = "rate";

/// 端点类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointClass {
    /// 关键类：SOS 触发、实时订阅
    Critical,
    /// 普通类：一般 API
    Standard,
}

impl EndpointClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointClass::Critical => "critical",
            EndpointClass::Standard => "standard",
        }
    }
}

/// 滑动窗口限流器
///
/// 当前窗口计数 + 上一窗口按剩余占比加权，近似滑动窗口
pub struct SlidingWindowLimiter {
    store: Arc<dyn AdmissionStore>,
    config: AdmissionConfig,
    metrics: Arc<AdmissionMetrics>,
}

impl SlidingWindowLimiter {
    pub fn new(
        store: Arc<dyn AdmissionStore>,
        config: AdmissionConfig,
        metrics: Arc<AdmissionMetrics>,
    ) -> Self {
        Self {
            store,
            config,
            metrics,
        }
    }

    fn window_key(class: EndpointClass, actor: &str, window_index: i64) -> String {
        format!("{}:{}:{}:{}", RATE_KEY_PREFIX, class.as_str(), actor, window_index)
    }

    fn limit_for(&self, class: EndpointClass) -> u64 {
        match class {
            EndpointClass::Critical => self.config.critical_limit,
            EndpointClass::Standard => self.config.standard_limit,
        }
    }

    /// 限流检查
    ///
    /// 超额时返回 `RateLimited`，附带距窗口重置的秒数作为重试提示
    pub async fn check(&self, actor: &str, class: EndpointClass) -> Result<()> {
        let window = self.config.window_seconds.max(1);
        let now_secs = crate::utils::epoch_millis() / 1000;
        let window_index = now_secs / window as i64;
        let elapsed_secs = (now_secs % window as i64) as u64;

        let current_key = Self::window_key(class, actor, window_index);
        let previous_key = Self::window_key(class, actor, window_index - 1);

        // 计数键保留两个窗口长，供下一窗口加权
        let current = self.store.incr_window(&current_key, window * 2).await?;
        let previous = self.store.get_window(&previous_key).await?;

        let previous_weight = (window - elapsed_secs) as f64 / window as f64;
        let estimated = current as f64 + previous as f64 * previous_weight;

        if estimated > self.limit_for(class) as f64 {
            let retry_after_secs = window - elapsed_secs;
            self.metrics
                .requests_rejected_total
                .with_label_values(&[class.as_str()])
                .inc();
            return Err(TripCoreError::RateLimited {
                actor: actor.to_string(),
                class: class.as_str().to_string(),
                retry_after_secs,
            });
        }

        self.metrics
            .requests_allowed_total
            .with_label_values(&[class.as_str()])
            .inc();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::store::MemoryAdmissionStore;
    use crate::config::BreakerConfig;

    fn limiter(standard_limit: u64, critical_limit: u64) -> SlidingWindowLimiter {
        let config = AdmissionConfig {
            window_seconds: 60,
            critical_limit,
            standard_limit,
            breaker: BreakerConfig::default(),
        };
        SlidingWindowLimiter::new(
            Arc::new(MemoryAdmissionStore::new()),
            config,
            Arc::new(AdmissionMetrics::new()),
        )
    }

    #[tokio::test]
    async fn test_rejects_over_quota_with_retry_hint() {
        let limiter = limiter(3, 100);

        for _ in 0..3 {
            limiter.check("driver_1", EndpointClass::Standard).await.unwrap();
        }

        let rejection = limiter.check("driver_1", EndpointClass::Standard).await;
        match rejection {
            Err(TripCoreError::RateLimited {
                retry_after_secs, ..
            }) => {
                assert!(retry_after_secs > 0 && retry_after_secs <= 60);
            }
            other => panic!("expected RateLimited, got {:?}", other.err()),
        }
    }

    #[tokio::test]
    async fn test_actor_isolation() {
        let limiter = limiter(3, 100);

        // driver_1 用尽配额
        for _ in 0..3 {
            limiter.check("driver_1", EndpointClass::Standard).await.unwrap();
        }
        assert!(limiter.check("driver_1", EndpointClass::Standard).await.is_err());

        // driver_2 的配额不受影响
        for _ in 0..3 {
            limiter.check("driver_2", EndpointClass::Standard).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_critical_class_has_higher_quota() {
        let limiter = limiter(2, 50);

        for _ in 0..2 {
            limiter.check("rider_1", EndpointClass::Standard).await.unwrap();
        }
        assert!(limiter.check("rider_1", EndpointClass::Standard).await.is_err());

        // 同一调用方的关键类配额独立且更高
        for _ in 0..10 {
            limiter.check("rider_1", EndpointClass::Critical).await.unwrap();
        }
    }
}
