//! SOS 告警协调器
//!
//! 告警生命周期的执行者：落库、并行多通道通知、确认跟踪、
//! 超时升级与解除。持久化先于通知是硬不变量——任何通知任务
//! 入队之前，告警记录必须已经落库确认，不允许因为全部下游
//! 通道失败而丢失一条告警。

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tracing::{error, info, warn};

use crate::admission::CircuitBreaker;
use crate::broadcast::BroadcastModule;
use crate::broadcast::types::PushEnvelope;
use crate::channels::{ChannelKind, OutboundNotification};
use crate::config::SosConfig;
use crate::error::{Result, TripCoreError};
use crate::metrics::SosMetrics;
use crate::queue::job::{JobPayload, JobPriority, NotificationJob};
use crate::queue::retry::{RetryPolicy, execute_with_retry};
use crate::queue::store::JobStore;
use crate::queue::worker::DeliveryObserver;
use crate::sos::alert::{
    AlertState, ChannelOutcome, ChannelResult, GeoPoint, SosAlert, TriggerSource,
};
use crate::sos::profile::ProfileDirectory;
use crate::sos::repository::AlertRepository;

/// 告警仓储所在文档数据库的熔断器依赖名
pub const ALERT_STORE_DEPENDENCY: &str = "postgres";

/// SOS 告警协调器
pub struct SosCoordinator {
    repository: Arc<dyn AlertRepository>,
    jobs: Arc<dyn JobStore>,
    broadcast: Arc<BroadcastModule>,
    breaker: Arc<CircuitBreaker>,
    profiles: Arc<dyn ProfileDirectory>,
    metrics: Arc<SosMetrics>,
    config: SosConfig,
}

impl SosCoordinator {
    pub fn new(
        repository: Arc<dyn AlertRepository>,
        jobs: Arc<dyn JobStore>,
        broadcast: Arc<BroadcastModule>,
        breaker: Arc<CircuitBreaker>,
        profiles: Arc<dyn ProfileDirectory>,
        metrics: Arc<SosMetrics>,
        config: SosConfig,
    ) -> Self {
        Self {
            repository,
            jobs,
            broadcast,
            breaker,
            profiles,
            metrics,
            config,
        }
    }

    /// 触发 SOS 告警，返回告警 ID
    ///
    /// 行程已有活跃告警时幂等返回现有 ID。落库失败时带短退避
    /// 重试，仍失败则把失败返回给调用方（端上回退到直拨紧急通道），
    /// 不做任何通知尝试。
    pub async fn trigger(
        &self,
        trip_id: &str,
        triggered_by: TriggerSource,
        location: Option<GeoPoint>,
    ) -> Result<String> {
        if !self.broadcast.registry.is_trip_active(trip_id).await? {
            return Err(TripCoreError::TripNotActive(trip_id.to_string()));
        }

        // 重复触发幂等：同一行程已有活跃告警时返回现有告警
        if let Some(existing) = self.repository.find_active_by_trip(trip_id).await? {
            info!(
                trip_id = %trip_id,
                alert_id = %existing.alert_id,
                "Duplicate SOS trigger, returning existing alert"
            );
            return Ok(existing.alert_id);
        }

        let mut alert = SosAlert::new(trip_id, triggered_by, location);
        alert.transition(AlertState::Persisted)?;
        self.persist_with_retry(&alert).await?;
        self.metrics.alerts_triggered_total.inc();
        info!(trip_id = %trip_id, alert_id = %alert.alert_id, "SOS alert persisted");

        // 落库确认后才进入通知阶段
        alert.transition(AlertState::Notifying)?;
        self.repository
            .update_state(&alert.alert_id, AlertState::Notifying)
            .await?;

        // 紧急联系人由档案子系统解析，失败不阻断通知
        let contacts = match self
            .profiles
            .emergency_contacts(trip_id, triggered_by)
            .await
        {
            Ok(contacts) => contacts,
            Err(e) => {
                warn!(error = %e, trip_id = %trip_id, "Failed to resolve emergency contacts");
                Vec::new()
            }
        };

        // 各通道并行独立：一个任务入队失败不影响其余通道
        for channel in ChannelKind::sos_notify_set() {
            let job = NotificationJob::new(
                JobPriority::Critical,
                JobPayload::ChannelDelivery {
                    channel,
                    notification: self.sos_notification(&alert, &contacts),
                },
                self.config.channel_max_attempts,
            );
            if let Err(e) = self.jobs.enqueue(&job).await {
                error!(
                    error = %e,
                    alert_id = %alert.alert_id,
                    channel = channel.as_str(),
                    "Failed to enqueue SOS channel job"
                );
            }
        }

        // 升级检查走队列延时任务：进程重启不丢失待升级检查
        let escalation_check = NotificationJob::delayed(
            JobPriority::Critical,
            JobPayload::EscalationCheck {
                alert_id: alert.alert_id.clone(),
            },
            self.config.channel_max_attempts,
            self.config.ack_window_seconds,
        );
        if let Err(e) = self.jobs.enqueue(&escalation_check).await {
            error!(error = %e, alert_id = %alert.alert_id, "Failed to enqueue escalation check");
        }

        self.publish_event(&alert.trip_id, &alert.alert_id, AlertState::Notifying)
            .await;

        Ok(alert.alert_id)
    }

    /// 运营确认告警
    pub async fn acknowledge(&self, alert_id: &str, operator_id: &str) -> Result<()> {
        let mut alert = self.load_alert(alert_id).await?;
        if alert.state == AlertState::Acknowledged {
            return Ok(());
        }
        alert.transition(AlertState::Acknowledged)?;
        self.repository
            .mark_acknowledged(alert_id, operator_id)
            .await?;
        self.metrics.alerts_acknowledged_total.inc();
        info!(alert_id = %alert_id, operator_id = %operator_id, "SOS alert acknowledged");

        self.publish_event(&alert.trip_id, alert_id, AlertState::Acknowledged)
            .await;
        Ok(())
    }

    /// 解除告警（运营或触发者），解除后不再调度升级
    pub async fn resolve(&self, alert_id: &str, resolution: &str) -> Result<()> {
        let mut alert = self.load_alert(alert_id).await?;
        if alert.state == AlertState::Resolved {
            return Ok(());
        }

        // 提前解除（尚未确认）时先经过 Acknowledged，保证 Resolved
        // 只从 Acknowledged/Escalated 到达
        if matches!(alert.state, AlertState::Persisted | AlertState::Notifying) {
            alert.transition(AlertState::Acknowledged)?;
            self.repository
                .update_state(alert_id, AlertState::Acknowledged)
                .await?;
        }

        alert.transition(AlertState::Resolved)?;
        self.repository
            .mark_resolved(alert_id, resolution, Utc::now())
            .await?;
        self.metrics.alerts_resolved_total.inc();
        info!(alert_id = %alert_id, resolution = %resolution, "SOS alert resolved");

        self.publish_event(&alert.trip_id, alert_id, AlertState::Resolved)
            .await;
        Ok(())
    }

    /// 读取告警
    pub async fn get(&self, alert_id: &str) -> Result<Option<SosAlert>> {
        self.repository.load(alert_id).await
    }

    /// 落库（熔断器守护 + 短退避重试）
    async fn persist_with_retry(&self, alert: &SosAlert) -> Result<()> {
        let policy = RetryPolicy {
            initial_delay_ms: self.config.persist_initial_delay_ms,
            max_delay_ms: self.config.persist_initial_delay_ms * 8,
            backoff_multiplier: 2.0,
        };
        let attempts = AtomicU32::new(0);
        let timer = self.metrics.persist_duration_seconds.start_timer();

        let outcome = execute_with_retry(&policy, self.config.persist_max_attempts, || {
            attempts.fetch_add(1, Ordering::SeqCst);
            let this = self;
            async move {
                let permit = this.breaker.acquire(ALERT_STORE_DEPENDENCY).await?;
                match this.repository.insert(alert).await {
                    Ok(()) => {
                        this.breaker
                            .record_success(ALERT_STORE_DEPENDENCY, permit)
                            .await?;
                        Ok(())
                    }
                    Err(e) => {
                        this.breaker
                            .record_failure(ALERT_STORE_DEPENDENCY, permit)
                            .await?;
                        Err(e)
                    }
                }
            }
        })
        .await;
        timer.observe_duration();

        let retries = attempts.load(Ordering::SeqCst).saturating_sub(1);
        if retries > 0 {
            self.metrics.persist_retries_total.inc_by(retries as u64);
        }
        outcome
    }

    fn sos_notification(&self, alert: &SosAlert, contacts: &[String]) -> OutboundNotification {
        OutboundNotification {
            trip_id: alert.trip_id.clone(),
            alert_id: Some(alert.alert_id.clone()),
            title: "SOS alert".to_string(),
            body: json!({
                "alertId": alert.alert_id,
                "tripId": alert.trip_id,
                "triggeredBy": alert.triggered_by.as_str(),
                "triggeredAt": alert.triggered_at.timestamp_millis(),
                "location": alert.location,
                "emergencyContacts": contacts,
            }),
        }
    }

    async fn load_alert(&self, alert_id: &str) -> Result<SosAlert> {
        self.repository
            .load(alert_id)
            .await?
            .ok_or_else(|| TripCoreError::AlertNotFound(alert_id.to_string()))
    }

    /// SOS 事件上总线（行程主题 + 运营看板），失败仅记录
    async fn publish_event(&self, trip_id: &str, alert_id: &str, state: AlertState) {
        let envelope = PushEnvelope::sos_event(trip_id, alert_id, state.as_str());
        if let Err(e) = self.broadcast.publish_sos(&envelope).await {
            warn!(error = %e, alert_id = %alert_id, "Failed to publish SOS event");
        }
    }
}

#[async_trait]
impl DeliveryObserver for SosCoordinator {
    async fn channel_attempted(
        &self,
        alert_id: &str,
        channel: ChannelKind,
        succeeded: bool,
    ) -> Result<()> {
        let status = if succeeded {
            ChannelOutcome::Success
        } else {
            ChannelOutcome::Failure
        };
        let result = ChannelResult {
            channel,
            status,
            attempted_at: Utc::now(),
        };
        self.repository
            .append_channel_result(alert_id, &result)
            .await?;
        self.metrics
            .channel_results_total
            .with_label_values(&[
                channel.as_str(),
                if succeeded { "success" } else { "failure" },
            ])
            .inc();
        Ok(())
    }

    async fn escalation_due(&self, alert_id: &str) -> Result<()> {
        let alert = match self.repository.load(alert_id).await? {
            Some(alert) => alert,
            None => {
                warn!(alert_id = %alert_id, "Escalation check for unknown alert");
                return Ok(());
            }
        };

        match alert.state {
            // 已确认或已解除：升级取消，空操作
            AlertState::Acknowledged | AlertState::Resolved | AlertState::Escalated => Ok(()),
            AlertState::Persisted | AlertState::Notifying => {
                let mut alert = alert;
                alert.transition(AlertState::Escalated)?;
                self.repository
                    .update_state(alert_id, AlertState::Escalated)
                    .await?;
                self.metrics.alerts_escalated_total.inc();
                warn!(
                    alert_id = %alert_id,
                    trip_id = %alert.trip_id,
                    ack_window_seconds = self.config.ack_window_seconds,
                    "SOS alert escalated: no acknowledgement within window"
                );

                // 升级走带外通道：呼叫值班运营
                let contacts = self
                    .profiles
                    .emergency_contacts(&alert.trip_id, alert.triggered_by)
                    .await
                    .unwrap_or_default();
                let escalation_job = NotificationJob::new(
                    JobPriority::Critical,
                    JobPayload::ChannelDelivery {
                        channel: ChannelKind::VoiceCall,
                        notification: self.sos_notification(&alert, &contacts),
                    },
                    self.config.channel_max_attempts,
                );
                self.jobs.enqueue(&escalation_job).await?;

                self.publish_event(&alert.trip_id, alert_id, AlertState::Escalated)
                    .await;
                Ok(())
            }
            AlertState::Triggered => {
                warn!(alert_id = %alert_id, "Escalation check found unpersisted alert");
                Ok(())
            }
        }
    }
}
