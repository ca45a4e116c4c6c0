//! 熔断器
//!
//! 包裹每个外部依赖（各通知通道、文档数据库）。
//! Closed 放行并统计失败；连续失败达到阈值转 Open，
//! 调用短路拒绝不触达依赖；冷却结束后转 HalfOpen，
//! 仅允许一次试探调用：成功回 Closed，失败回 Open 并重置冷却。
//! 状态存于共享存储，横向扩容的各实例看到同一份。

use std::sync::Arc;

use crate::admission::store::{AdmissionStore, BreakerRecord, BreakerState};
use crate::config::BreakerConfig;
use crate::error::{Result, TripCoreError};
use crate::metrics::AdmissionMetrics;
use crate::utils::epoch_millis;

/// 调用许可
///
/// `acquire` 放行后持有；调用结束后交还给 `record_success`
/// 或 `record_failure`
#[derive(Debug)]
pub struct BreakerPermit {
    /// 是否为半开试探调用
    trial: bool,
}

/// 熔断器
pub struct CircuitBreaker {
    store: Arc<dyn AdmissionStore>,
    config: BreakerConfig,
    metrics: Arc<AdmissionMetrics>,
}

impl CircuitBreaker {
    pub fn new(
        store: Arc<dyn AdmissionStore>,
        config: BreakerConfig,
        metrics: Arc<AdmissionMetrics>,
    ) -> Self {
        Self {
            store,
            config,
            metrics,
        }
    }

    /// 获取调用许可
    ///
    /// Open 且冷却未结束时返回 `CircuitOpen`，不触达依赖
    pub async fn acquire(&self, dependency: &str) -> Result<BreakerPermit> {
        let record = self.store.load_breaker(dependency).await?;

        let record = match record {
            None => return Ok(BreakerPermit { trial: false }),
            Some(record) => record,
        };

        match record.state {
            BreakerState::Closed => Ok(BreakerPermit { trial: false }),
            BreakerState::Open | BreakerState::HalfOpen => {
                let cooldown_ms = (self.config.cooldown_seconds as i64) * 1000;
                if epoch_millis() - record.opened_at_ms >= cooldown_ms
                    && self
                        .store
                        .try_claim_trial(dependency, self.config.trial_ttl_seconds)
                        .await?
                {
                    let half_open = BreakerRecord {
                        state: BreakerState::HalfOpen,
                        failures: record.failures,
                        opened_at_ms: record.opened_at_ms,
                    };
                    self.store.store_breaker(dependency, &half_open).await?;
                    self.metrics
                        .breaker_transitions_total
                        .with_label_values(&[dependency, BreakerState::HalfOpen.as_str()])
                        .inc();
                    return Ok(BreakerPermit { trial: true });
                }

                self.metrics
                    .breaker_short_circuits_total
                    .with_label_values(&[dependency])
                    .inc();
                Err(TripCoreError::CircuitOpen {
                    dependency: dependency.to_string(),
                })
            }
        }
    }

    /// 记录调用成功
    pub async fn record_success(&self, dependency: &str, permit: BreakerPermit) -> Result<()> {
        if permit.trial {
            self.store
                .store_breaker(dependency, &BreakerRecord::closed())
                .await?;
            self.store.release_trial(dependency).await?;
            self.metrics
                .breaker_transitions_total
                .with_label_values(&[dependency, BreakerState::Closed.as_str()])
                .inc();
            return Ok(());
        }

        // 成功清零失败计数，避免零散失败累积误熔断
        if let Some(record) = self.store.load_breaker(dependency).await? {
            if record.failures > 0 {
                self.store
                    .store_breaker(dependency, &BreakerRecord::closed())
                    .await?;
            }
        }
        Ok(())
    }

    /// 记录调用失败
    pub async fn record_failure(&self, dependency: &str, permit: BreakerPermit) -> Result<()> {
        let now = epoch_millis();

        if permit.trial {
            // 试探失败：回到 Open 并重置冷却
            let record = self.store.load_breaker(dependency).await?;
            let failures = record.map(|r| r.failures).unwrap_or(0).saturating_add(1);
            self.store
                .store_breaker(
                    dependency,
                    &BreakerRecord {
                        state: BreakerState::Open,
                        failures,
                        opened_at_ms: now,
                    },
                )
                .await?;
            self.store.release_trial(dependency).await?;
            self.metrics
                .breaker_transitions_total
                .with_label_values(&[dependency, BreakerState::Open.as_str()])
                .inc();
            return Ok(());
        }

        let mut record = self
            .store
            .load_breaker(dependency)
            .await?
            .unwrap_or_else(BreakerRecord::closed);
        record.failures = record.failures.saturating_add(1);

        if record.state == BreakerState::Closed && record.failures >= self.config.failure_threshold
        {
            record.state = BreakerState::Open;
            record.opened_at_ms = now;
            self.metrics
                .breaker_transitions_total
                .with_label_values(&[dependency, BreakerState::Open.as_str()])
                .inc();
            tracing::warn!(
                dependency = %dependency,
                failures = record.failures,
                "Circuit breaker opened"
            );
        }

        self.store.store_breaker(dependency, &record).await?;
        Ok(())
    }

    /// 查询依赖当前熔断状态（无记录视为 Closed）
    pub async fn state_of(&self, dependency: &str) -> Result<BreakerState> {
        Ok(self
            .store
            .load_breaker(dependency)
            .await?
            .map(|record| record.state)
            .unwrap_or(BreakerState::Closed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::store::MemoryAdmissionStore;

    fn breaker(failure_threshold: u32, cooldown_seconds: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            Arc::new(MemoryAdmissionStore::new()),
            BreakerConfig {
                failure_threshold,
                cooldown_seconds,
                trial_ttl_seconds: 10,
            },
            Arc::new(AdmissionMetrics::new()),
        )
    }

    #[tokio::test]
    async fn test_opens_after_threshold_and_short_circuits() -> Result<()> {
        let breaker = breaker(3, 60);
        let dep = "channel:sms";

        for _ in 0..3 {
            let permit = breaker.acquire(dep).await?;
            breaker.record_failure(dep, permit).await?;
        }
        assert_eq!(breaker.state_of(dep).await?, BreakerState::Open);

        // 冷却未结束：短路拒绝，不触达依赖
        let rejected = breaker.acquire(dep).await;
        assert!(matches!(rejected, Err(TripCoreError::CircuitOpen { .. })));
        Ok(())
    }

    #[tokio::test]
    async fn test_half_open_trial_success_closes() -> Result<()> {
        let breaker = breaker(1, 0);
        let dep = "channel:push";

        let permit = breaker.acquire(dep).await?;
        breaker.record_failure(dep, permit).await?;
        assert_eq!(breaker.state_of(dep).await?, BreakerState::Open);

        // 冷却（0 秒）结束：允许一次试探
        let trial = breaker.acquire(dep).await?;
        // 试探名额被占用期间，并发调用仍被短路
        assert!(breaker.acquire(dep).await.is_err());

        breaker.record_success(dep, trial).await?;
        assert_eq!(breaker.state_of(dep).await?, BreakerState::Closed);
        assert!(breaker.acquire(dep).await.is_ok());
        Ok(())
    }

    #[tokio::test]
    async fn test_half_open_trial_failure_reopens() -> Result<()> {
        let breaker = breaker(1, 0);
        let dep = "channel:email";

        let permit = breaker.acquire(dep).await?;
        breaker.record_failure(dep, permit).await?;

        let trial = breaker.acquire(dep).await?;
        breaker.record_failure(dep, trial).await?;
        assert_eq!(breaker.state_of(dep).await?, BreakerState::Open);
        Ok(())
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() -> Result<()> {
        let breaker = breaker(3, 60);
        let dep = "postgres";

        for _ in 0..2 {
            let permit = breaker.acquire(dep).await?;
            breaker.record_failure(dep, permit).await?;
        }
        let permit = breaker.acquire(dep).await?;
        breaker.record_success(dep, permit).await?;

        // 计数已清零，再次失败 2 次不应熔断
        for _ in 0..2 {
            let permit = breaker.acquire(dep).await?;
            breaker.record_failure(dep, permit).await?;
        }
        assert_eq!(breaker.state_of(dep).await?, BreakerState::Closed);
        Ok(())
    }
}
