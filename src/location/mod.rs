//! 位置缓存模块
//!
//! 按行程缓存最新位置样本，并在接受写入时经广播总线扇出。
//! 摄入路径永不阻塞：总线不可达时发布丢弃，缓存写入保留。

pub mod memory;
pub mod redis_store;
pub mod sample;
pub mod store;

use std::sync::Arc;

use tracing::warn;

use crate::broadcast::BroadcastModule;
use crate::broadcast::types::PushEnvelope;
use crate::error::Result;
use crate::metrics::LocationMetrics;

pub use memory::MemoryLocationStore;
pub use redis_store::RedisLocationStore;
pub use sample::LocationSample;
pub use store::LocationStore;

/// 位置缓存模块
pub struct LocationModule {
    /// 位置缓存
    pub store: Arc<dyn LocationStore>,
    /// 广播模块
    broadcast: Arc<BroadcastModule>,
    /// 监控指标
    metrics: Arc<LocationMetrics>,
}

impl LocationModule {
    pub fn new(
        store: Arc<dyn LocationStore>,
        broadcast: Arc<BroadcastModule>,
        metrics: Arc<LocationMetrics>,
    ) -> Self {
        Self {
            store,
            broadcast,
            metrics,
        }
    }

    /// 摄入位置样本
    ///
    /// 仅当样本比已存值新时接受；接受后扇出到订阅者。
    /// 返回样本是否被接受。
    pub async fn ingest(&self, sample: &LocationSample) -> Result<bool> {
        let accepted = self.store.put_if_newer(sample).await?;
        if !accepted {
            self.metrics.samples_stale_total.inc();
            return Ok(false);
        }
        self.metrics.samples_accepted_total.inc();

        let envelope = PushEnvelope::location(sample)?;
        if let Err(e) = self.broadcast.publish(&sample.trip_id, &envelope).await {
            // 位置流为尽力而为：发布失败即丢弃，缓存写入保留，
            // 订阅者等待下一条样本
            warn!(error = %e, trip_id = %sample.trip_id, "Dropped location publish");
            self.metrics.publish_failure_total.inc();
        }
        Ok(true)
    }

    /// 读取行程最新已知位置
    pub async fn last_known(&self, trip_id: &str) -> Result<Option<LocationSample>> {
        let sample = self.store.get(trip_id).await?;
        let result = if sample.is_some() { "hit" } else { "miss" };
        self.metrics.cache_reads_total.with_label_values(&[result]).inc();
        Ok(sample)
    }

    /// 行程结束时清理位置缓存
    pub async fn forget(&self, trip_id: &str) -> Result<()> {
        self.store.remove(trip_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::{
        ConnectionTable, LocalEventBus, MemorySubscriptionRegistry,
    };
    use crate::metrics::BroadcastMetrics;
    use tokio::sync::mpsc;

    fn sample(trip_id: &str, captured_at: i64) -> LocationSample {
        LocationSample {
            trip_id: trip_id.to_string(),
            lat: 22.54,
            lng: 114.05,
            speed: 42.0,
            heading: 270.0,
            captured_at,
        }
    }

    fn wire() -> (LocationModule, Arc<BroadcastModule>) {
        let connections = Arc::new(ConnectionTable::new());
        let broadcast_metrics = Arc::new(BroadcastMetrics::new());
        let bus = Arc::new(LocalEventBus::new(
            connections.clone(),
            broadcast_metrics.clone(),
        ));
        let broadcast = Arc::new(BroadcastModule::new(
            Arc::new(MemorySubscriptionRegistry::new()),
            bus,
            connections,
            broadcast_metrics,
            "instance_test".to_string(),
        ));
        let module = LocationModule::new(
            Arc::new(MemoryLocationStore::new(300)),
            broadcast.clone(),
            Arc::new(LocationMetrics::new()),
        );
        (module, broadcast)
    }

    #[tokio::test]
    async fn test_ingest_publishes_to_subscribers() -> Result<()> {
        let (module, broadcast) = wire();
        broadcast.open_trip("t1").await?;

        let (tx, mut rx) = mpsc::channel(4);
        broadcast.subscribe("t1", "c1", tx).await?;

        assert!(module.ingest(&sample("t1", 100)).await?);

        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.event_type, "location");
        assert_eq!(envelope.payload["capturedAt"], 100);
        Ok(())
    }

    #[tokio::test]
    async fn test_stale_sample_not_published() -> Result<()> {
        let (module, broadcast) = wire();
        broadcast.open_trip("t1").await?;

        let (tx, mut rx) = mpsc::channel(4);
        broadcast.subscribe("t1", "c1", tx).await?;

        assert!(module.ingest(&sample("t1", 100)).await?);
        assert!(!module.ingest(&sample("t1", 50)).await?);

        // 仅新样本被扇出
        assert!(rx.recv().await.is_some());
        assert!(rx.try_recv().is_err());

        let cached = module.last_known("t1").await?.unwrap();
        assert_eq!(cached.captured_at, 100);
        Ok(())
    }
}
