//! 准入控制模块
//!
//! 限流器 + 熔断器，共同守住摄入路径与外部依赖调用

pub mod circuit_breaker;
pub mod rate_limiter;
pub mod store;

use std::sync::Arc;

use serde::Serialize;

use crate::config::AdmissionConfig;
use crate::error::Result;
use crate::metrics::AdmissionMetrics;

pub use circuit_breaker::{BreakerPermit, CircuitBreaker};
pub use rate_limiter::{EndpointClass, SlidingWindowLimiter};
pub use store::{AdmissionStore, BreakerRecord, BreakerState, MemoryAdmissionStore, RedisAdmissionStore};

/// 依赖健康状态（对外健康查询用）
#[derive(Debug, Clone, Serialize)]
pub struct DependencyHealth {
    /// 依赖名
    pub dependency: String,
    /// 熔断器状态
    pub state: BreakerState,
}

/// 准入控制模块
pub struct AdmissionControl {
    /// 滑动窗口限流器
    pub limiter: SlidingWindowLimiter,
    /// 熔断器
    pub breaker: Arc<CircuitBreaker>,
}

impl AdmissionControl {
    pub fn new(store: Arc<dyn AdmissionStore>, config: AdmissionConfig) -> Self {
        let metrics = Arc::new(AdmissionMetrics::new());
        let limiter =
            SlidingWindowLimiter::new(store.clone(), config.clone(), metrics.clone());
        let breaker = Arc::new(CircuitBreaker::new(store, config.breaker, metrics));
        Self { limiter, breaker }
    }

    /// 限流检查
    pub async fn check(&self, actor: &str, class: EndpointClass) -> Result<()> {
        self.limiter.check(actor, class).await
    }

    /// 查询各依赖的熔断状态快照
    pub async fn breaker_snapshot(&self, dependencies: &[String]) -> Result<Vec<DependencyHealth>> {
        let mut snapshot = Vec::with_capacity(dependencies.len());
        for dependency in dependencies {
            snapshot.push(DependencyHealth {
                dependency: dependency.clone(),
                state: self.breaker.state_of(dependency).await?,
            });
        }
        Ok(snapshot)
    }
}
