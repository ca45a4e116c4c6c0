//! 统一异常处理模块
//!
//! 定义行程实时核心的错误类型与可重试性判定

use thiserror::Error;

/// 行程实时核心错误类型
#[derive(Debug, Error)]
pub enum TripCoreError {
    /// 配置错误
    #[error("Configuration error: {0}")]
    Config(String),

    /// 限流拒绝（附带重试提示）
    #[error("Rate limit exceeded for actor {actor} on {class} endpoints, retry in {retry_after_secs}s")]
    RateLimited {
        actor: String,
        class: String,
        retry_after_secs: u64,
    },

    /// 熔断器打开，依赖不可用
    #[error("Dependency {dependency} unavailable: circuit open")]
    CircuitOpen { dependency: String },

    /// 告警状态机非法转移
    #[error("Invalid alert state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    /// 行程不在可订阅/可告警窗口内
    #[error("Trip {0} is not active")]
    TripNotActive(String),

    /// 告警不存在
    #[error("Alert {0} not found")]
    AlertNotFound(String),

    /// Redis 错误
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// 数据库错误
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// 序列化错误
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// 通知通道投递失败
    #[error("Channel delivery failed: {0}")]
    ChannelDelivery(String),

    /// 服务不可用
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),
}

impl TripCoreError {
    /// 判断错误是否可重试
    ///
    /// 瞬时依赖故障（存储、通道、熔断短路）可重试；
    /// 数据完整性类错误（非法转移、记录缺失）不可重试
    pub fn is_retryable(&self) -> bool {
        match self {
            TripCoreError::Redis(_)
            | TripCoreError::Database(_)
            | TripCoreError::ChannelDelivery(_)
            | TripCoreError::ServiceUnavailable(_)
            | TripCoreError::CircuitOpen { .. }
            | TripCoreError::RateLimited { .. } => true,
            TripCoreError::Config(_)
            | TripCoreError::InvalidTransition { .. }
            | TripCoreError::TripNotActive(_)
            | TripCoreError::AlertNotFound(_)
            | TripCoreError::Serialization(_) => false,
        }
    }
}

/// 行程实时核心统一 Result 类型
pub type Result<T> = std::result::Result<T, TripCoreError>;
