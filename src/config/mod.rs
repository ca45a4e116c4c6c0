//! 配置管理模块
//!
//! 提供行程实时核心的统一配置结构与加载逻辑：
//! - 各子模块配置结构（带运维常量默认值）
//! - TOML 配置文件加载，支持环境变量覆盖

use std::env;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// 默认配置文件路径
const DEFAULT_CONFIG_PATH: &str = "config/ridex.toml";

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// 日志级别（trace/debug/info/warn/error）
    pub level: String,
    /// 是否显示 target
    pub with_target: bool,
    /// 是否显示线程 ID
    pub with_thread_ids: bool,
    /// 是否显示文件名
    pub with_file: bool,
    /// 是否显示行号
    pub with_line_number: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            with_target: true,
            with_thread_ids: false,
            with_file: false,
            with_line_number: false,
        }
    }
}

/// 位置缓存配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocationCacheConfig {
    /// 缓存条目空闲过期时间（秒）
    pub ttl_seconds: u64,
}

impl Default for LocationCacheConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: 300, // 行程停止上报 5 分钟后过期
        }
    }
}

/// 订阅与广播配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastConfig {
    /// 订阅登记过期时间（秒），每次续订时刷新
    pub subscription_ttl_seconds: u64,
    /// 行程活跃窗口过期时间（秒）
    pub trip_active_ttl_seconds: u64,
    /// 单连接推送缓冲区大小（条），满则丢弃
    pub connection_buffer: usize,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            subscription_ttl_seconds: 3600,
            trip_active_ttl_seconds: 24 * 3600, // 单次行程上限 24 小时
            connection_buffer: 64,
        }
    }
}

/// 熔断器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// 连续失败阈值，达到后熔断
    pub failure_threshold: u32,
    /// 熔断冷却时间（秒）
    pub cooldown_seconds: u64,
    /// 半开试探调用占用时间（秒）
    pub trial_ttl_seconds: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_seconds: 30,
            trial_ttl_seconds: 10,
        }
    }
}

/// 准入控制配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// 滑动窗口长度（秒）
    pub window_seconds: u64,
    /// 关键端点类（SOS 触发、实时订阅）单窗口配额
    pub critical_limit: u64,
    /// 普通端点类单窗口配额
    pub standard_limit: u64,
    /// 熔断器配置
    pub breaker: BreakerConfig,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            window_seconds: 60,
            critical_limit: 600, // 关键类配额显著高于普通类
            standard_limit: 120,
            breaker: BreakerConfig::default(),
        }
    }
}

/// 重试策略配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// 初始延迟（毫秒）
    pub initial_delay_ms: u64,
    /// 最大延迟（毫秒）
    pub max_delay_ms: u64,
    /// 退避倍数
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1000,
            max_delay_ms: 60_000,
            backoff_multiplier: 2.0,
        }
    }
}

/// 通知投递队列配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// 拉取间隔（毫秒）
    pub poll_interval_ms: u64,
    /// 单次拉取任务数
    pub batch_size: u32,
    /// 默认最大尝试次数
    pub default_max_attempts: u32,
    /// 重试退避策略
    pub retry: RetryConfig,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
            batch_size: 50,
            default_max_attempts: 3,
            retry: RetryConfig::default(),
        }
    }
}

/// SOS 告警协调配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SosConfig {
    /// 确认窗口（秒），超时未确认则升级
    pub ack_window_seconds: u64,
    /// 单通道通知任务最大尝试次数
    pub channel_max_attempts: u32,
    /// 告警落库最大尝试次数（落库失败前不返回成功）
    pub persist_max_attempts: u32,
    /// 落库重试初始延迟（毫秒）
    pub persist_initial_delay_ms: u64,
}

impl Default for SosConfig {
    fn default() -> Self {
        Self {
            ack_window_seconds: 30, // 30 秒未确认升级
            channel_max_attempts: 3,
            persist_max_attempts: 3,
            persist_initial_delay_ms: 200,
        }
    }
}

/// 行程实时核心配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TripCoreConfig {
    /// 本实例标识（订阅归属与日志用）
    pub instance_id: String,
    /// Redis URL（缓存、订阅登记、广播、准入计数）
    pub redis_url: String,
    /// PostgreSQL URL（告警与通知任务持久化）
    pub database_url: String,
    /// 日志配置
    pub logging: LoggingConfig,
    /// 位置缓存配置
    pub location: LocationCacheConfig,
    /// 订阅与广播配置
    pub broadcast: BroadcastConfig,
    /// 准入控制配置
    pub admission: AdmissionConfig,
    /// 通知投递队列配置
    pub queue: QueueConfig,
    /// SOS 告警协调配置
    pub sos: SosConfig,
}

impl Default for TripCoreConfig {
    fn default() -> Self {
        Self {
            instance_id: format!("trip-core-{}", std::process::id()),
            redis_url: "redis://127.0.0.1/".to_string(),
            database_url: "postgresql://localhost/ridex".to_string(),
            logging: LoggingConfig::default(),
            location: LocationCacheConfig::default(),
            broadcast: BroadcastConfig::default(),
            admission: AdmissionConfig::default(),
            queue: QueueConfig::default(),
            sos: SosConfig::default(),
        }
    }
}

/// 加载配置
///
/// 优先级：
/// 1. 显式传入的路径
/// 2. 环境变量 `RIDEX_CONFIG` 指定的路径
/// 3. 默认路径 `config/ridex.toml`（不存在时使用默认配置）
///
/// `RIDEX_REDIS_URL` / `RIDEX_DATABASE_URL` 环境变量始终覆盖文件取值
pub fn load_config(path: Option<&str>) -> Result<TripCoreConfig> {
    let path = path
        .map(|p| p.to_string())
        .or_else(|| env::var("RIDEX_CONFIG").ok())
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());

    let mut config = if Path::new(&path).exists() {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("failed to read config file: {}", path))?;
        toml::from_str(&content).with_context(|| format!("invalid config format: {}", path))?
    } else {
        TripCoreConfig::default()
    };

    if let Ok(redis_url) = env::var("RIDEX_REDIS_URL") {
        config.redis_url = redis_url;
    }
    if let Ok(database_url) = env::var("RIDEX_DATABASE_URL") {
        config.database_url = database_url;
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TripCoreConfig::default();
        assert_eq!(config.location.ttl_seconds, 300);
        assert_eq!(config.sos.ack_window_seconds, 30);
        assert!(config.admission.critical_limit > config.admission.standard_limit);
    }

    #[test]
    fn test_parse_partial_toml() {
        let toml_str = r#"
            instance_id = "trip-core-test"

            [admission]
            window_seconds = 10
            critical_limit = 100
            standard_limit = 20

            [admission.breaker]
            failure_threshold = 3
            cooldown_seconds = 5
            trial_ttl_seconds = 2
        "#;
        let config: TripCoreConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.instance_id, "trip-core-test");
        assert_eq!(config.admission.window_seconds, 10);
        assert_eq!(config.admission.breaker.failure_threshold, 3);
        // 未指定的段落使用默认值
        assert_eq!(config.queue.default_max_attempts, 3);
    }
}
