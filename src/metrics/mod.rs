//! # Prometheus 指标收集模块
//!
//! 为各个子模块提供统一的 Prometheus 指标收集能力。

use once_cell::sync::Lazy;
use prometheus::{
    Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
};

/// 全局指标注册表
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

/// 位置缓存指标
pub struct LocationMetrics {
    /// 接受写入的样本总数
    pub samples_accepted_total: IntCounter,
    /// 因时间戳过旧被丢弃的样本总数
    pub samples_stale_total: IntCounter,
    /// 广播发布失败总数（尽力而为，失败即丢弃）
    pub publish_failure_total: IntCounter,
    /// 缓存读取总数（按命中/未命中分类）
    pub cache_reads_total: IntCounterVec,
}

impl LocationMetrics {
    pub fn new() -> Self {
        let samples_accepted_total = IntCounter::new(
            "location_samples_accepted_total",
            "Total number of location samples accepted into the cache",
        )
        .expect("Failed to create location_samples_accepted_total metric");

        let samples_stale_total = IntCounter::new(
            "location_samples_stale_total",
            "Total number of location samples discarded as stale",
        )
        .expect("Failed to create location_samples_stale_total metric");

        let publish_failure_total = IntCounter::new(
            "location_publish_failure_total",
            "Total number of dropped broadcast publishes on the location path",
        )
        .expect("Failed to create location_publish_failure_total metric");

        let cache_reads_total = IntCounterVec::new(
            Opts::new(
                "location_cache_reads_total",
                "Total number of location cache reads",
            ),
            &["result"],
        )
        .expect("Failed to create location_cache_reads_total metric");

        // 注册指标，忽略重复注册错误（测试中可能会重复创建）
        let _ = REGISTRY.register(Box::new(samples_accepted_total.clone()));
        let _ = REGISTRY.register(Box::new(samples_stale_total.clone()));
        let _ = REGISTRY.register(Box::new(publish_failure_total.clone()));
        let _ = REGISTRY.register(Box::new(cache_reads_total.clone()));

        Self {
            samples_accepted_total,
            samples_stale_total,
            publish_failure_total,
            cache_reads_total,
        }
    }
}

impl Default for LocationMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// 订阅与广播指标
pub struct BroadcastMetrics {
    /// 当前活跃订阅数（本实例）
    pub subscriptions_active: IntGauge,
    /// 发布的推送信封总数
    pub envelopes_published_total: IntCounterVec,
    /// 成功投递到本地连接的信封总数
    pub envelopes_delivered_total: IntCounter,
    /// 因缓冲区满或连接关闭而丢弃的信封总数
    pub envelopes_dropped_total: IntCounter,
}

impl BroadcastMetrics {
    pub fn new() -> Self {
        let subscriptions_active = IntGauge::new(
            "broadcast_subscriptions_active",
            "Number of active subscriptions attached to this instance",
        )
        .expect("Failed to create broadcast_subscriptions_active metric");

        let envelopes_published_total = IntCounterVec::new(
            Opts::new(
                "broadcast_envelopes_published_total",
                "Total number of envelopes published on the fan-out bus",
            ),
            &["event_type"],
        )
        .expect("Failed to create broadcast_envelopes_published_total metric");

        let envelopes_delivered_total = IntCounter::new(
            "broadcast_envelopes_delivered_total",
            "Total number of envelopes delivered to local connections",
        )
        .expect("Failed to create broadcast_envelopes_delivered_total metric");

        let envelopes_dropped_total = IntCounter::new(
            "broadcast_envelopes_dropped_total",
            "Total number of envelopes dropped for lagging or closed connections",
        )
        .expect("Failed to create broadcast_envelopes_dropped_total metric");

        let _ = REGISTRY.register(Box::new(subscriptions_active.clone()));
        let _ = REGISTRY.register(Box::new(envelopes_published_total.clone()));
        let _ = REGISTRY.register(Box::new(envelopes_delivered_total.clone()));
        let _ = REGISTRY.register(Box::new(envelopes_dropped_total.clone()));

        Self {
            subscriptions_active,
            envelopes_published_total,
            envelopes_delivered_total,
            envelopes_dropped_total,
        }
    }
}

impl Default for BroadcastMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// 准入控制指标
pub struct AdmissionMetrics {
    /// 放行请求总数（按端点类分类）
    pub requests_allowed_total: IntCounterVec,
    /// 限流拒绝总数（按端点类分类）
    pub requests_rejected_total: IntCounterVec,
    /// 熔断器状态转移总数
    pub breaker_transitions_total: IntCounterVec,
    /// 熔断短路拒绝总数
    pub breaker_short_circuits_total: IntCounterVec,
}

impl AdmissionMetrics {
    pub fn new() -> Self {
        let requests_allowed_total = IntCounterVec::new(
            Opts::new(
                "admission_requests_allowed_total",
                "Total number of requests allowed by the rate limiter",
            ),
            &["class"],
        )
        .expect("Failed to create admission_requests_allowed_total metric");

        let requests_rejected_total = IntCounterVec::new(
            Opts::new(
                "admission_requests_rejected_total",
                "Total number of requests rejected by the rate limiter",
            ),
            &["class"],
        )
        .expect("Failed to create admission_requests_rejected_total metric");

        let breaker_transitions_total = IntCounterVec::new(
            Opts::new(
                "admission_breaker_transitions_total",
                "Total number of circuit breaker state transitions",
            ),
            &["dependency", "state"],
        )
        .expect("Failed to create admission_breaker_transitions_total metric");

        let breaker_short_circuits_total = IntCounterVec::new(
            Opts::new(
                "admission_breaker_short_circuits_total",
                "Total number of calls short-circuited by an open breaker",
            ),
            &["dependency"],
        )
        .expect("Failed to create admission_breaker_short_circuits_total metric");

        let _ = REGISTRY.register(Box::new(requests_allowed_total.clone()));
        let _ = REGISTRY.register(Box::new(requests_rejected_total.clone()));
        let _ = REGISTRY.register(Box::new(breaker_transitions_total.clone()));
        let _ = REGISTRY.register(Box::new(breaker_short_circuits_total.clone()));

        Self {
            requests_allowed_total,
            requests_rejected_total,
            breaker_transitions_total,
            breaker_short_circuits_total,
        }
    }
}

impl Default for AdmissionMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// 通知投递队列指标
pub struct QueueMetrics {
    /// 入队任务总数（按优先级分类）
    pub jobs_enqueued_total: IntCounterVec,
    /// 完成任务总数
    pub jobs_completed_total: IntCounter,
    /// 重试任务总数
    pub jobs_retried_total: IntCounter,
    /// 终态失败任务总数
    pub jobs_failed_total: IntCounter,
    /// 当前队列深度
    pub queue_depth: IntGauge,
    /// 投递耗时（秒，按通道分类）
    pub delivery_duration_seconds: HistogramVec,
}

impl QueueMetrics {
    pub fn new() -> Self {
        let jobs_enqueued_total = IntCounterVec::new(
            Opts::new(
                "queue_jobs_enqueued_total",
                "Total number of notification jobs enqueued",
            ),
            &["priority"],
        )
        .expect("Failed to create queue_jobs_enqueued_total metric");

        let jobs_completed_total = IntCounter::new(
            "queue_jobs_completed_total",
            "Total number of notification jobs completed",
        )
        .expect("Failed to create queue_jobs_completed_total metric");

        let jobs_retried_total = IntCounter::new(
            "queue_jobs_retried_total",
            "Total number of notification job retries scheduled",
        )
        .expect("Failed to create queue_jobs_retried_total metric");

        let jobs_failed_total = IntCounter::new(
            "queue_jobs_failed_total",
            "Total number of notification jobs terminally failed",
        )
        .expect("Failed to create queue_jobs_failed_total metric");

        let queue_depth =
            IntGauge::new("queue_depth", "Current depth of the notification delivery queue")
                .expect("Failed to create queue_depth metric");

        let delivery_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "queue_delivery_duration_seconds",
                "Notification delivery duration in seconds",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
            &["channel"],
        )
        .expect("Failed to create queue_delivery_duration_seconds metric");

        let _ = REGISTRY.register(Box::new(jobs_enqueued_total.clone()));
        let _ = REGISTRY.register(Box::new(jobs_completed_total.clone()));
        let _ = REGISTRY.register(Box::new(jobs_retried_total.clone()));
        let _ = REGISTRY.register(Box::new(jobs_failed_total.clone()));
        let _ = REGISTRY.register(Box::new(queue_depth.clone()));
        let _ = REGISTRY.register(Box::new(delivery_duration_seconds.clone()));

        Self {
            jobs_enqueued_total,
            jobs_completed_total,
            jobs_retried_total,
            jobs_failed_total,
            queue_depth,
            delivery_duration_seconds,
        }
    }
}

impl Default for QueueMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// SOS 告警指标
pub struct SosMetrics {
    /// 触发告警总数
    pub alerts_triggered_total: IntCounter,
    /// 确认告警总数
    pub alerts_acknowledged_total: IntCounter,
    /// 升级告警总数
    pub alerts_escalated_total: IntCounter,
    /// 解除告警总数
    pub alerts_resolved_total: IntCounter,
    /// 通道投递结果总数（按通道与结果分类）
    pub channel_results_total: IntCounterVec,
    /// 告警落库重试总数
    pub persist_retries_total: IntCounter,
    /// 告警落库耗时（秒）
    pub persist_duration_seconds: Histogram,
}

impl SosMetrics {
    pub fn new() -> Self {
        let alerts_triggered_total = IntCounter::new(
            "sos_alerts_triggered_total",
            "Total number of SOS alerts triggered",
        )
        .expect("Failed to create sos_alerts_triggered_total metric");

        let alerts_acknowledged_total = IntCounter::new(
            "sos_alerts_acknowledged_total",
            "Total number of SOS alerts acknowledged",
        )
        .expect("Failed to create sos_alerts_acknowledged_total metric");

        let alerts_escalated_total = IntCounter::new(
            "sos_alerts_escalated_total",
            "Total number of SOS alerts escalated",
        )
        .expect("Failed to create sos_alerts_escalated_total metric");

        let alerts_resolved_total = IntCounter::new(
            "sos_alerts_resolved_total",
            "Total number of SOS alerts resolved",
        )
        .expect("Failed to create sos_alerts_resolved_total metric");

        let channel_results_total = IntCounterVec::new(
            Opts::new(
                "sos_channel_results_total",
                "Total number of SOS channel delivery results",
            ),
            &["channel", "status"],
        )
        .expect("Failed to create sos_channel_results_total metric");

        let persist_retries_total = IntCounter::new(
            "sos_persist_retries_total",
            "Total number of SOS alert persistence retries",
        )
        .expect("Failed to create sos_persist_retries_total metric");

        let persist_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "sos_persist_duration_seconds",
                "SOS alert persistence duration in seconds",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]),
        )
        .expect("Failed to create sos_persist_duration_seconds metric");

        let _ = REGISTRY.register(Box::new(alerts_triggered_total.clone()));
        let _ = REGISTRY.register(Box::new(alerts_acknowledged_total.clone()));
        let _ = REGISTRY.register(Box::new(alerts_escalated_total.clone()));
        let _ = REGISTRY.register(Box::new(alerts_resolved_total.clone()));
        let _ = REGISTRY.register(Box::new(channel_results_total.clone()));
        let _ = REGISTRY.register(Box::new(persist_retries_total.clone()));
        let _ = REGISTRY.register(Box::new(persist_duration_seconds.clone()));

        Self {
            alerts_triggered_total,
            alerts_acknowledged_total,
            alerts_escalated_total,
            alerts_resolved_total,
            channel_results_total,
            persist_retries_total,
            persist_duration_seconds,
        }
    }
}

impl Default for SosMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// 获取 Prometheus 指标导出格式
pub fn gather_metrics() -> String {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}
