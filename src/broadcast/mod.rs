//! 订阅登记与广播扇出模块
//!
//! 核心能力：
//! - 订阅登记（跨实例共享）与行程活跃窗口管理
//! - 位置/SOS 事件经总线扇出到各实例的本地连接

pub mod bus;
pub mod registry;
pub mod types;

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{Result, TripCoreError};
use crate::metrics::BroadcastMetrics;
use crate::utils::epoch_millis;

pub use bus::{ConnectionTable, EventBus, LocalEventBus, RedisEventBus};
pub use registry::{MemorySubscriptionRegistry, RedisSubscriptionRegistry, SubscriptionRegistry};
pub use types::{EVENT_TYPE_LOCATION, EVENT_TYPE_SOS, OPS_TOPIC, PushEnvelope, Subscription};

/// 广播模块
pub struct BroadcastModule {
    /// 订阅登记仓储（跨实例共享）
    pub registry: Arc<dyn SubscriptionRegistry>,
    /// 扇出总线
    pub bus: Arc<dyn EventBus>,
    /// 本实例连接表
    pub connections: Arc<ConnectionTable>,
    /// 监控指标
    metrics: Arc<BroadcastMetrics>,
    /// 本实例 ID
    instance_id: String,
}

impl BroadcastModule {
    pub fn new(
        registry: Arc<dyn SubscriptionRegistry>,
        bus: Arc<dyn EventBus>,
        connections: Arc<ConnectionTable>,
        metrics: Arc<BroadcastMetrics>,
        instance_id: String,
    ) -> Self {
        Self {
            registry,
            bus,
            connections,
            metrics,
            instance_id,
        }
    }

    /// 启动跨实例监听任务
    pub fn start(&self) {
        self.bus.start();
    }

    /// 订阅行程位置更新
    ///
    /// 行程必须处于活跃窗口内；`sink` 是连接的推送发送端
    pub async fn subscribe(
        &self,
        trip_id: &str,
        connection_id: &str,
        sink: mpsc::Sender<PushEnvelope>,
    ) -> Result<()> {
        if !self.registry.is_trip_active(trip_id).await? {
            return Err(TripCoreError::TripNotActive(trip_id.to_string()));
        }

        let subscription = Subscription {
            trip_id: trip_id.to_string(),
            connection_id: connection_id.to_string(),
            instance_id: self.instance_id.clone(),
            subscribed_at: epoch_millis(),
        };
        self.registry.subscribe(&subscription).await?;
        self.connections.attach(trip_id, connection_id, sink);
        self.metrics.subscriptions_active.inc();

        debug!(trip_id = %trip_id, connection_id = %connection_id, "Subscription registered");
        Ok(())
    }

    /// 取消订阅
    pub async fn unsubscribe(&self, trip_id: &str, connection_id: &str) -> Result<()> {
        self.registry.unsubscribe(trip_id, connection_id).await?;
        self.connections.detach(trip_id, connection_id);
        self.metrics.subscriptions_active.dec();
        Ok(())
    }

    /// 连接断开，移除其全部订阅
    pub async fn disconnect(&self, connection_id: &str) -> Result<()> {
        self.registry.remove_connection(connection_id).await?;
        let removed = self.connections.detach_connection(connection_id);
        self.metrics.subscriptions_active.sub(removed as i64);
        Ok(())
    }

    /// 附着运营看板连接（接收全部 SOS 事件）
    pub fn attach_ops(&self, connection_id: &str, sink: mpsc::Sender<PushEnvelope>) {
        self.connections.attach(OPS_TOPIC, connection_id, sink);
    }

    /// 发布事件信封到行程主题
    pub async fn publish(&self, topic: &str, envelope: &PushEnvelope) -> Result<()> {
        self.bus.publish(topic, envelope).await?;
        self.metrics
            .envelopes_published_total
            .with_label_values(&[&envelope.event_type])
            .inc();
        Ok(())
    }

    /// 发布 SOS 事件：行程主题 + 运营看板主题
    pub async fn publish_sos(&self, envelope: &PushEnvelope) -> Result<()> {
        self.publish(envelope.trip_id.as_str(), envelope).await?;
        self.publish(OPS_TOPIC, envelope).await?;
        Ok(())
    }

    /// 行程进入活跃窗口
    pub async fn open_trip(&self, trip_id: &str) -> Result<()> {
        self.registry.mark_trip_active(trip_id).await
    }

    /// 行程结束：关闭订阅窗口并清理订阅
    pub async fn close_trip(&self, trip_id: &str) -> Result<()> {
        self.registry.mark_trip_completed(trip_id).await?;
        self.registry.close_trip(trip_id).await?;
        self.connections.remove_topic(trip_id);
        Ok(())
    }
}
