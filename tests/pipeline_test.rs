//! 管线端到端测试（内存存储装配）
//!
//! 覆盖位置广播与 SOS 告警管线的关键性质：
//! 乱序样本收敛、重复投递幂等、落库先于通知、
//! 多通道冗余通知、确认与超时升级。

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ridex_trip_core::admission::{AdmissionControl, MemoryAdmissionStore};
use ridex_trip_core::broadcast::{
    BroadcastModule, ConnectionTable, LocalEventBus, MemorySubscriptionRegistry,
};
use ridex_trip_core::channels::{ChannelKind, ChannelRegistry, MockChannel, NotificationChannel};
use ridex_trip_core::config::TripCoreConfig;
use ridex_trip_core::error::{Result, TripCoreError};
use ridex_trip_core::location::LocationSample;
use ridex_trip_core::metrics::{BroadcastMetrics, SosMetrics};
use ridex_trip_core::queue::{JobStatus, MemoryJobStore};
use ridex_trip_core::sos::{
    AlertRepository, AlertState, ChannelOutcome, ChannelResult, SosAlert, SosCoordinator,
    TriggerSource,
};
use ridex_trip_core::{TripCoreService, queue::JobStore};

fn sample(trip_id: &str, captured_at: i64) -> LocationSample {
    LocationSample {
        trip_id: trip_id.to_string(),
        lat: 22.54,
        lng: 114.05,
        speed: 40.0,
        heading: 90.0,
        captured_at,
    }
}

struct TestHarness {
    service: TripCoreService,
    channels: Vec<Arc<MockChannel>>,
}

impl TestHarness {
    fn new(config: TripCoreConfig) -> Self {
        let mut registry = ChannelRegistry::new();
        let mut channels = Vec::new();
        for kind in ChannelKind::sos_notify_set() {
            let channel = Arc::new(MockChannel::new(kind));
            registry.register(channel.clone());
            channels.push(channel);
        }
        let voice = Arc::new(MockChannel::new(ChannelKind::VoiceCall));
        registry.register(voice.clone());
        channels.push(voice);

        Self {
            service: TripCoreService::in_memory(config, registry),
            channels,
        }
    }

    fn channel(&self, kind: ChannelKind) -> &Arc<MockChannel> {
        self.channels
            .iter()
            .find(|channel| channel.kind() == kind)
            .unwrap()
    }

    async fn drain_queue(&self) -> Result<()> {
        // 手动驱动投递执行器，避免测试依赖后台定时
        while self.service.queue.worker.tick().await? > 0 {}
        Ok(())
    }
}

#[tokio::test]
async fn test_out_of_order_samples_converge_to_max_timestamp() -> Result<()> {
    let harness = TestHarness::new(TripCoreConfig::default());
    let service = &harness.service;
    service.trip_started("t1").await?;

    // 时间戳 [5, 3, 8] 乱序到达
    assert!(service.ingest_location("driver_1", &sample("t1", 5)).await?);
    assert!(!service.ingest_location("driver_1", &sample("t1", 3)).await?);
    assert!(service.ingest_location("driver_1", &sample("t1", 8)).await?);

    let cached = service.location.last_known("t1").await?.unwrap();
    assert_eq!(cached.captured_at, 8);
    Ok(())
}

#[tokio::test]
async fn test_duplicate_redelivery_leaves_subscriber_state_unchanged() -> Result<()> {
    let harness = TestHarness::new(TripCoreConfig::default());
    let service = &harness.service;
    service.trip_started("t1").await?;

    let (tx, mut rx) = service.connection_channel();
    service.subscribe_to_trip("rider_1", "t1", "c1", tx).await?;

    service.ingest_location("driver_1", &sample("t1", 10)).await?;
    // 同一样本重复投递：缓存与订阅端都不变
    service.ingest_location("driver_1", &sample("t1", 10)).await?;

    let first = rx.recv().await.unwrap();
    assert_eq!(first.payload["capturedAt"], 10);
    assert!(rx.try_recv().is_err());

    let cached = service.location.last_known("t1").await?.unwrap();
    assert_eq!(cached.captured_at, 10);
    Ok(())
}

#[tokio::test]
async fn test_sos_mixed_channel_outcomes_and_explicit_acknowledge() -> Result<()> {
    let mut config = TripCoreConfig::default();
    config.sos.channel_max_attempts = 1; // 失败立即终态，便于断言结果记录
    let harness = TestHarness::new(config);
    let service = &harness.service;
    service.trip_started("t1").await?;

    // 短信通道故障，其余通道正常
    harness.channel(ChannelKind::Sms).set_fail(true);

    let alert_id = service
        .trigger_sos(
            "rider_1",
            "t1",
            TriggerSource::Passenger,
            Some(ridex_trip_core::GeoPoint { lat: 22.5, lng: 114.0 }),
        )
        .await?;
    harness.drain_queue().await?;

    let alert = service.get_alert(&alert_id).await?.unwrap();
    // 通知中：部分通道成功即算完成投递，状态仍为 Notifying
    assert_eq!(alert.state, AlertState::Notifying);
    assert!(alert.fully_delivered());

    let successes = alert
        .channel_results
        .iter()
        .filter(|result| result.status == ChannelOutcome::Success)
        .count();
    let failures: Vec<_> = alert
        .channel_results
        .iter()
        .filter(|result| result.status == ChannelOutcome::Failure)
        .collect();
    assert_eq!(successes, 3);
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].channel, ChannelKind::Sms);

    // 只有显式确认才进入 Acknowledged
    service.acknowledge_alert(&alert_id, "operator_7").await?;
    let alert = service.get_alert(&alert_id).await?.unwrap();
    assert_eq!(alert.state, AlertState::Acknowledged);
    assert_eq!(alert.acknowledged_by.as_deref(), Some("operator_7"));
    Ok(())
}

#[tokio::test]
async fn test_unacknowledged_alert_escalates_exactly_once() -> Result<()> {
    let mut config = TripCoreConfig::default();
    config.sos.ack_window_seconds = 0; // 确认窗口立即到期
    let harness = TestHarness::new(config);
    let service = &harness.service;
    service.trip_started("t1").await?;

    let alert_id = service
        .trigger_sos("rider_1", "t1", TriggerSource::Passenger, None)
        .await?;
    harness.drain_queue().await?;

    let alert = service.get_alert(&alert_id).await?.unwrap();
    assert_eq!(alert.state, AlertState::Escalated);

    // 升级通知恰好一条（语音电话），重复驱动不再产生新任务
    assert_eq!(harness.channel(ChannelKind::VoiceCall).delivered().len(), 1);
    harness.drain_queue().await?;
    assert_eq!(harness.channel(ChannelKind::VoiceCall).delivered().len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_acknowledged_alert_does_not_escalate() -> Result<()> {
    let mut config = TripCoreConfig::default();
    config.sos.ack_window_seconds = 0;
    let harness = TestHarness::new(config);
    let service = &harness.service;
    service.trip_started("t1").await?;

    let alert_id = service
        .trigger_sos("rider_1", "t1", TriggerSource::Driver, None)
        .await?;
    // 在驱动队列前确认：升级检查到期时应为空操作
    service.acknowledge_alert(&alert_id, "operator_1").await?;
    harness.drain_queue().await?;

    let alert = service.get_alert(&alert_id).await?.unwrap();
    assert_eq!(alert.state, AlertState::Acknowledged);
    assert!(harness.channel(ChannelKind::VoiceCall).delivered().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_duplicate_sos_trigger_is_idempotent() -> Result<()> {
    let harness = TestHarness::new(TripCoreConfig::default());
    let service = &harness.service;
    service.trip_started("t1").await?;

    let first = service
        .trigger_sos("rider_1", "t1", TriggerSource::Passenger, None)
        .await?;
    let second = service
        .trigger_sos("rider_1", "t1", TriggerSource::Passenger, None)
        .await?;
    assert_eq!(first, second);
    Ok(())
}

#[tokio::test]
async fn test_resolve_clears_sos_active_and_records_resolution() -> Result<()> {
    let harness = TestHarness::new(TripCoreConfig::default());
    let service = &harness.service;
    service.trip_started("t1").await?;

    let alert_id = service
        .trigger_sos("rider_1", "t1", TriggerSource::Passenger, None)
        .await?;
    service.acknowledge_alert(&alert_id, "operator_1").await?;
    service.resolve_alert(&alert_id, "rider confirmed safe").await?;

    let alert = service.get_alert(&alert_id).await?.unwrap();
    assert_eq!(alert.state, AlertState::Resolved);
    assert_eq!(alert.resolution.as_deref(), Some("rider confirmed safe"));
    assert!(alert.resolved_at.is_some());

    // 解除后行程可再次触发新告警（旧告警不再算活跃）
    let new_alert = service
        .trigger_sos("rider_1", "t1", TriggerSource::Passenger, None)
        .await?;
    assert_ne!(new_alert, alert_id);
    Ok(())
}

/// 落库必定失败的仓储，用于验证"持久化先于通知"不变量
struct FailingAlertRepository;

#[async_trait]
impl AlertRepository for FailingAlertRepository {
    async fn insert(&self, _alert: &SosAlert) -> Result<()> {
        Err(TripCoreError::ServiceUnavailable(
            "alert store down".to_string(),
        ))
    }

    async fn load(&self, _alert_id: &str) -> Result<Option<SosAlert>> {
        Ok(None)
    }

    async fn find_active_by_trip(&self, _trip_id: &str) -> Result<Option<SosAlert>> {
        Ok(None)
    }

    async fn update_state(&self, _alert_id: &str, _state: AlertState) -> Result<()> {
        Ok(())
    }

    async fn mark_acknowledged(&self, _alert_id: &str, _operator_id: &str) -> Result<()> {
        Ok(())
    }

    async fn mark_resolved(
        &self,
        _alert_id: &str,
        _resolution: &str,
        _resolved_at: DateTime<Utc>,
    ) -> Result<()> {
        Ok(())
    }

    async fn append_channel_result(
        &self,
        _alert_id: &str,
        _result: &ChannelResult,
    ) -> Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn test_persist_failure_blocks_all_notifications() -> Result<()> {
    let config = TripCoreConfig {
        sos: ridex_trip_core::config::SosConfig {
            persist_max_attempts: 2,
            persist_initial_delay_ms: 1,
            ..Default::default()
        },
        ..Default::default()
    };

    let connections = Arc::new(ConnectionTable::new());
    let broadcast_metrics = Arc::new(BroadcastMetrics::new());
    let bus = Arc::new(LocalEventBus::new(
        connections.clone(),
        broadcast_metrics.clone(),
    ));
    let registry = Arc::new(MemorySubscriptionRegistry::new());
    let broadcast = Arc::new(BroadcastModule::new(
        registry,
        bus,
        connections,
        broadcast_metrics,
        "instance_test".to_string(),
    ));
    broadcast.open_trip("t1").await?;

    let jobs: Arc<MemoryJobStore> = Arc::new(MemoryJobStore::new());
    let admission = AdmissionControl::new(
        Arc::new(MemoryAdmissionStore::new()),
        config.admission.clone(),
    );
    let coordinator = SosCoordinator::new(
        Arc::new(FailingAlertRepository),
        jobs.clone(),
        broadcast,
        admission.breaker.clone(),
        Arc::new(ridex_trip_core::sos::StaticProfileDirectory::new(vec![
            "contact_1".to_string(),
        ])),
        Arc::new(SosMetrics::new()),
        config.sos.clone(),
    );

    // 落库（含重试）失败：触发调用失败返回，端上回退直拨紧急通道
    let outcome = coordinator
        .trigger("t1", TriggerSource::Passenger, None)
        .await;
    assert!(outcome.is_err());

    // 不变量：落库未确认前，任何通知任务都不得入队
    assert_eq!(jobs.depth().await?, 0);
    Ok(())
}

#[tokio::test]
async fn test_enqueued_jobs_reach_terminal_state() -> Result<()> {
    let mut config = TripCoreConfig::default();
    config.sos.channel_max_attempts = 2;
    config.queue.retry.initial_delay_ms = 1;
    config.queue.retry.max_delay_ms = 2;
    let harness = TestHarness::new(config);
    let service = &harness.service;
    service.trip_started("t1").await?;

    harness.channel(ChannelKind::Email).set_fail(true);
    let alert_id = service
        .trigger_sos("rider_1", "t1", TriggerSource::Passenger, None)
        .await?;

    // 驱动队列直到所有重试用尽
    for _ in 0..8 {
        harness.drain_queue().await?;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }

    // 入队成功的任务终到 Completed 或 Failed，深度归零（除未到期的升级检查）
    let failed = service.queue.failed_jobs(10).await?;
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].status, JobStatus::Failed);
    assert_eq!(failed[0].attempts, 2);

    let alert = service.get_alert(&alert_id).await?.unwrap();
    assert!(alert
        .channel_results
        .iter()
        .any(|result| result.channel == ChannelKind::Email
            && result.status == ChannelOutcome::Failure));
    Ok(())
}
