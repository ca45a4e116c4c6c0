//! 投递执行器
//!
//! 队列的消费侧：这是整条管线里唯一允许等待的组件。
//! 按优先级拉取到期任务，经熔断器守护调用对应通道，
//! 失败按指数退避重试，用尽次数后转终态 Failed 留存。

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tokio::time::interval;
use tracing::{error, warn};

use crate::admission::CircuitBreaker;
use crate::channels::{ChannelKind, ChannelRegistry};
use crate::error::{Result, TripCoreError};
use crate::metrics::QueueMetrics;
use crate::queue::job::{JobPayload, NotificationJob};
use crate::queue::retry::RetryPolicy;
use crate::queue::store::JobStore;

/// 投递结果回调
///
/// 把任务结果通知给关心的一方（SOS 协调器借此累计通道结果、
/// 执行升级检查），避免队列模块反向依赖告警模块
#[async_trait]
pub trait DeliveryObserver: Send + Sync {
    /// 通道投递任务到达终态（成功或终态失败）
    async fn channel_attempted(
        &self,
        alert_id: &str,
        channel: ChannelKind,
        succeeded: bool,
    ) -> Result<()>;

    /// 升级检查任务到期
    async fn escalation_due(&self, alert_id: &str) -> Result<()>;
}

/// 空回调（无 SOS 协调器时使用）
pub struct NoopObserver;

#[async_trait]
impl DeliveryObserver for NoopObserver {
    async fn channel_attempted(
        &self,
        _alert_id: &str,
        _channel: ChannelKind,
        _succeeded: bool,
    ) -> Result<()> {
        Ok(())
    }

    async fn escalation_due(&self, _alert_id: &str) -> Result<()> {
        Ok(())
    }
}

/// 投递执行器配置
#[derive(Debug, Clone)]
pub struct DeliveryWorkerConfig {
    /// 拉取间隔（毫秒）
    pub poll_interval_ms: u64,
    /// 单次拉取任务数
    pub batch_size: u32,
    /// 重试退避策略
    pub retry: RetryPolicy,
}

impl From<&crate::config::QueueConfig> for DeliveryWorkerConfig {
    fn from(config: &crate::config::QueueConfig) -> Self {
        Self {
            poll_interval_ms: config.poll_interval_ms,
            batch_size: config.batch_size,
            retry: RetryPolicy::from_config(&config.retry),
        }
    }
}

/// 投递执行器
pub struct DeliveryWorker {
    store: Arc<dyn JobStore>,
    channels: Arc<ChannelRegistry>,
    breaker: Arc<CircuitBreaker>,
    observer: Arc<dyn DeliveryObserver>,
    metrics: Arc<QueueMetrics>,
    config: DeliveryWorkerConfig,
}

impl DeliveryWorker {
    pub fn new(
        store: Arc<dyn JobStore>,
        channels: Arc<ChannelRegistry>,
        breaker: Arc<CircuitBreaker>,
        observer: Arc<dyn DeliveryObserver>,
        metrics: Arc<QueueMetrics>,
        config: DeliveryWorkerConfig,
    ) -> Self {
        Self {
            store,
            channels,
            breaker,
            observer,
            metrics,
            config,
        }
    }

    /// 启动消费循环
    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let worker = self.clone();
        let mut interval = interval(Duration::from_millis(worker.config.poll_interval_ms));

        tokio::spawn(async move {
            loop {
                interval.tick().await;
                if let Err(e) = worker.tick().await {
                    error!(error = %e, "Delivery worker tick failed");
                }
            }
        })
    }

    /// 执行一轮拉取与投递，返回处理的任务数
    pub async fn tick(&self) -> Result<usize> {
        let jobs = self.store.fetch_due(self.config.batch_size).await?;
        let count = jobs.len();

        for job in jobs {
            self.process(job).await;
        }

        if let Ok(depth) = self.store.depth().await {
            self.metrics.queue_depth.set(depth as i64);
        }
        Ok(count)
    }

    async fn process(&self, job: NotificationJob) {
        let outcome = self.attempt(&job).await;

        match outcome {
            Ok(()) => {
                if let Err(e) = self.store.mark_completed(&job.job_id).await {
                    error!(error = %e, job_id = %job.job_id, "Failed to mark job completed");
                    return;
                }
                self.metrics.jobs_completed_total.inc();
                self.notify_terminal(&job, true).await;
            }
            Err(e) => {
                // 不可重试错误与用尽次数：终态失败，留存供运维排查
                if !e.is_retryable() || !job.attempts_remaining() {
                    error!(
                        job_id = %job.job_id,
                        attempts = job.attempts,
                        error = %e,
                        "Notification job terminally failed"
                    );
                    if let Err(mark_err) = self.store.mark_failed(&job.job_id, &e.to_string()).await
                    {
                        error!(error = %mark_err, job_id = %job.job_id, "Failed to mark job failed");
                        return;
                    }
                    self.metrics.jobs_failed_total.inc();
                    self.notify_terminal(&job, false).await;
                } else {
                    let delay = self.config.retry.calculate_delay(job.attempts);
                    let next_attempt_at =
                        Utc::now() + chrono::Duration::milliseconds(delay.as_millis() as i64);
                    warn!(
                        job_id = %job.job_id,
                        attempts = job.attempts,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %e,
                        "Notification job rescheduled"
                    );
                    if let Err(mark_err) = self
                        .store
                        .mark_retrying(&job.job_id, next_attempt_at, &e.to_string())
                        .await
                    {
                        error!(error = %mark_err, job_id = %job.job_id, "Failed to reschedule job");
                        return;
                    }
                    self.metrics.jobs_retried_total.inc();
                }
            }
        }
    }

    /// 回调任务终态（仅 SOS 关联的通道任务）
    async fn notify_terminal(&self, job: &NotificationJob, succeeded: bool) {
        if let JobPayload::ChannelDelivery {
            channel,
            notification,
        } = &job.payload
        {
            if let Some(alert_id) = &notification.alert_id {
                if let Err(e) = self
                    .observer
                    .channel_attempted(alert_id, *channel, succeeded)
                    .await
                {
                    error!(error = %e, alert_id = %alert_id, "Failed to record channel result");
                }
            }
        }
    }

    async fn attempt(&self, job: &NotificationJob) -> Result<()> {
        match &job.payload {
            JobPayload::ChannelDelivery {
                channel,
                notification,
            } => {
                let adapter = self.channels.get(*channel).ok_or_else(|| {
                    TripCoreError::Config(format!(
                        "no adapter registered for channel {}",
                        channel.as_str()
                    ))
                })?;

                // 熔断器守护：Open 时短路，不触达通道
                let dependency = channel.dependency_name();
                let permit = self.breaker.acquire(&dependency).await?;

                let started = Instant::now();
                let result = adapter.deliver(notification).await;
                self.metrics
                    .delivery_duration_seconds
                    .with_label_values(&[channel.as_str()])
                    .observe(started.elapsed().as_secs_f64());

                match result {
                    Ok(()) => {
                        self.breaker.record_success(&dependency, permit).await?;
                        Ok(())
                    }
                    Err(e) => {
                        self.breaker.record_failure(&dependency, permit).await?;
                        Err(e)
                    }
                }
            }
            JobPayload::EscalationCheck { alert_id } => {
                self.observer.escalation_due(alert_id).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::MemoryAdmissionStore;
    use crate::channels::{MockChannel, OutboundNotification};
    use crate::config::BreakerConfig;
    use crate::metrics::AdmissionMetrics;
    use crate::queue::job::{JobPriority, JobStatus};
    use crate::queue::store::MemoryJobStore;

    fn worker_with(
        store: Arc<dyn JobStore>,
        push: Arc<MockChannel>,
        breaker_config: BreakerConfig,
    ) -> DeliveryWorker {
        let mut channels = ChannelRegistry::new();
        channels.register(push);
        let breaker = Arc::new(CircuitBreaker::new(
            Arc::new(MemoryAdmissionStore::new()),
            breaker_config,
            Arc::new(AdmissionMetrics::new()),
        ));
        DeliveryWorker::new(
            store,
            Arc::new(channels),
            breaker,
            Arc::new(NoopObserver),
            Arc::new(QueueMetrics::new()),
            DeliveryWorkerConfig {
                poll_interval_ms: 10,
                batch_size: 10,
                retry: RetryPolicy {
                    initial_delay_ms: 1,
                    max_delay_ms: 2,
                    backoff_multiplier: 1.0,
                },
            },
        )
    }

    fn push_job(max_attempts: u32) -> NotificationJob {
        NotificationJob::new(
            JobPriority::High,
            JobPayload::ChannelDelivery {
                channel: ChannelKind::Push,
                notification: OutboundNotification {
                    trip_id: "t1".to_string(),
                    alert_id: None,
                    title: "trip update".to_string(),
                    body: serde_json::json!({"text": "driver arriving"}),
                },
            },
            max_attempts,
        )
    }

    #[tokio::test]
    async fn test_successful_delivery_completes_job() -> Result<()> {
        let store = Arc::new(MemoryJobStore::new());
        let push = Arc::new(MockChannel::new(ChannelKind::Push));
        let worker = worker_with(store.clone(), push.clone(), BreakerConfig::default());

        let job = push_job(3);
        store.enqueue(&job).await?;

        assert_eq!(worker.tick().await?, 1);
        let stored = store.load(&job.job_id).await?.unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert_eq!(push.delivered().len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_delivery_retries_then_terminally_fails() -> Result<()> {
        let store = Arc::new(MemoryJobStore::new());
        let push = Arc::new(MockChannel::new(ChannelKind::Push));
        push.set_fail(true);
        let worker = worker_with(store.clone(), push.clone(), BreakerConfig::default());

        let job = push_job(2);
        store.enqueue(&job).await?;

        // 第一次尝试失败：进入重试
        worker.tick().await?;
        let stored = store.load(&job.job_id).await?.unwrap();
        assert_eq!(stored.status, JobStatus::Retrying);
        assert_eq!(stored.attempts, 1);

        // 等退避到期后第二次尝试：用尽次数，终态失败
        tokio::time::sleep(Duration::from_millis(10)).await;
        worker.tick().await?;
        let stored = store.load(&job.job_id).await?.unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.attempts, 2);
        assert!(stored.last_error.is_some());

        // 终态后不再被拉取
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(worker.tick().await?, 0);
        assert_eq!(push.attempt_count(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_open_breaker_short_circuits_without_invoking_channel() -> Result<()> {
        let store = Arc::new(MemoryJobStore::new());
        let push = Arc::new(MockChannel::new(ChannelKind::Push));
        push.set_fail(true);
        let worker = worker_with(
            store.clone(),
            push.clone(),
            BreakerConfig {
                failure_threshold: 1,
                cooldown_seconds: 60,
                trial_ttl_seconds: 10,
            },
        );

        // 第一个任务触发失败，熔断器打开
        let first = push_job(1);
        store.enqueue(&first).await?;
        worker.tick().await?;
        assert_eq!(push.attempt_count(), 1);

        // 第二个任务被短路：通道不再被调用，任务进入重试
        let second = push_job(3);
        store.enqueue(&second).await?;
        worker.tick().await?;
        assert_eq!(push.attempt_count(), 1);
        let stored = store.load(&second.job_id).await?.unwrap();
        assert_eq!(stored.status, JobStatus::Retrying);
        Ok(())
    }
}
