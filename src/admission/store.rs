//! 准入控制共享状态存储
//!
//! 限流窗口计数与熔断器状态是跨实例共享的，全部修改都是
//! 外部存储上的单个原子操作（INCR / SET NX），不使用长持锁。

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use redis::{AsyncCommands, Client};
use serde::{Deserialize, Serialize};

use crate::error::Result;

const BREAKER_KEY_PREFIX: &str = "breaker";
const BREAKER_TRIAL_KEY_PREFIX: &str = "breaker:trial";

/// 熔断器状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    /// 关闭：调用放行，统计失败
    Closed,
    /// 打开：调用短路拒绝
    Open,
    /// 半开：仅允许一次试探调用
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

/// 熔断器状态记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerRecord {
    /// 当前状态
    pub state: BreakerState,
    /// 连续失败计数
    pub failures: u32,
    /// 熔断时间（Unix 毫秒，Closed 时为 0）
    pub opened_at_ms: i64,
}

impl BreakerRecord {
    /// 关闭态初始记录
    pub fn closed() -> Self {
        Self {
            state: BreakerState::Closed,
            failures: 0,
            opened_at_ms: 0,
        }
    }
}

/// 准入控制存储接口
#[async_trait]
pub trait AdmissionStore: Send + Sync {
    /// 原子递增窗口计数并返回递增后的值；首次写入时设置过期时间
    async fn incr_window(&self, key: &str, ttl_seconds: u64) -> Result<u64>;

    /// 读取窗口计数（不存在或已过期返回 0）
    async fn get_window(&self, key: &str) -> Result<u64>;

    /// 读取熔断器状态
    async fn load_breaker(&self, dependency: &str) -> Result<Option<BreakerRecord>>;

    /// 写入熔断器状态
    async fn store_breaker(&self, dependency: &str, record: &BreakerRecord) -> Result<()>;

    /// 原子抢占半开试探名额（SET NX 语义），抢到返回 true
    async fn try_claim_trial(&self, dependency: &str, ttl_seconds: u64) -> Result<bool>;

    /// 释放半开试探名额
    async fn release_trial(&self, dependency: &str) -> Result<()>;
}

/// Redis 准入控制存储
pub struct RedisAdmissionStore {
    client: Client,
}

impl RedisAdmissionStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn breaker_key(dependency: &str) -> String {
        format!("{}:{}", BREAKER_KEY_PREFIX, dependency)
    }

    fn trial_key(dependency: &str) -> String {
        format!("{}:{}", BREAKER_TRIAL_KEY_PREFIX, dependency)
    }
}

#[async_trait]
impl AdmissionStore for RedisAdmissionStore {
    async fn incr_window(&self, key: &str, ttl_seconds: u64) -> Result<u64> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let count: u64 = conn.incr(key, 1).await?;
        // 首次写入时设置过期时间
        if count == 1 {
            let _: bool = conn.expire(key, ttl_seconds as i64).await?;
        }
        Ok(count)
    }

    async fn get_window(&self, key: &str) -> Result<u64> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let count: Option<u64> = conn.get(key).await?;
        Ok(count.unwrap_or(0))
    }

    async fn load_breaker(&self, dependency: &str) -> Result<Option<BreakerRecord>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let value: Option<String> = conn.get(Self::breaker_key(dependency)).await?;
        match value {
            Some(data) => Ok(Some(serde_json::from_str(&data)?)),
            None => Ok(None),
        }
    }

    async fn store_breaker(&self, dependency: &str, record: &BreakerRecord) -> Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let value = serde_json::to_string(record)?;
        let _: () = conn.set(Self::breaker_key(dependency), value).await?;
        Ok(())
    }

    async fn try_claim_trial(&self, dependency: &str, ttl_seconds: u64) -> Result<bool> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let claimed: bool = redis::cmd("SET")
            .arg(Self::trial_key(dependency))
            .arg(1)
            .arg("NX")
            .arg("EX")
            .arg(ttl_seconds)
            .query_async(&mut conn)
            .await?;
        Ok(claimed)
    }

    async fn release_trial(&self, dependency: &str) -> Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let _: i64 = conn.del(Self::trial_key(dependency)).await?;
        Ok(())
    }
}

/// 内存准入控制存储（单进程部署与测试用）
pub struct MemoryAdmissionStore {
    /// 窗口计数：key -> (计数, 过期时间)
    counters: DashMap<String, (u64, Instant)>,
    /// 熔断器状态
    breakers: DashMap<String, BreakerRecord>,
    /// 半开试探名额：dependency -> 过期时间
    trials: DashMap<String, Instant>,
}

impl MemoryAdmissionStore {
    pub fn new() -> Self {
        Self {
            counters: DashMap::new(),
            breakers: DashMap::new(),
            trials: DashMap::new(),
        }
    }
}

impl Default for MemoryAdmissionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AdmissionStore for MemoryAdmissionStore {
    async fn incr_window(&self, key: &str, ttl_seconds: u64) -> Result<u64> {
        let mut entry = self
            .counters
            .entry(key.to_string())
            .or_insert_with(|| (0, Instant::now() + Duration::from_secs(ttl_seconds)));
        if Instant::now() >= entry.1 {
            *entry = (0, Instant::now() + Duration::from_secs(ttl_seconds));
        }
        entry.0 += 1;
        Ok(entry.0)
    }

    async fn get_window(&self, key: &str) -> Result<u64> {
        Ok(self
            .counters
            .get(key)
            .filter(|entry| Instant::now() < entry.1)
            .map(|entry| entry.0)
            .unwrap_or(0))
    }

    async fn load_breaker(&self, dependency: &str) -> Result<Option<BreakerRecord>> {
        Ok(self.breakers.get(dependency).map(|r| r.clone()))
    }

    async fn store_breaker(&self, dependency: &str, record: &BreakerRecord) -> Result<()> {
        self.breakers.insert(dependency.to_string(), record.clone());
        Ok(())
    }

    async fn try_claim_trial(&self, dependency: &str, ttl_seconds: u64) -> Result<bool> {
        let now = Instant::now();
        let mut claimed = false;
        let mut entry = self.trials.entry(dependency.to_string()).or_insert_with(|| {
            claimed = true;
            now + Duration::from_secs(ttl_seconds)
        });
        if !claimed && now >= *entry {
            *entry = now + Duration::from_secs(ttl_seconds);
            claimed = true;
        }
        Ok(claimed)
    }

    async fn release_trial(&self, dependency: &str) -> Result<()> {
        self.trials.remove(dependency);
        Ok(())
    }
}
