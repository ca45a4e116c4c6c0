//! 广播扇出总线
//!
//! 把位置/SOS 事件从接收样本的实例投递到持有订阅连接的全部实例。
//! 投递语义为 at-least-once、尽力而为：总线不可达时发布即丢弃，
//! 绝不排队、绝不阻塞摄入路径。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use redis::{AsyncCommands, Client};
use tokio::sync::mpsc;
use tracing::{error, warn};

use crate::broadcast::types::PushEnvelope;
use crate::error::Result;
use crate::metrics::BroadcastMetrics;

const EVENT_CHANNEL_PREFIX: &str = "trip:events";

/// 本实例连接表
///
/// 记录物理附着在本实例上的连接的推送发送端，按主题扇出。
/// 投递使用 try_send：缓冲区满或连接已关闭时丢弃，永不阻塞。
pub struct ConnectionTable {
    /// topic -> connection_id -> 推送发送端
    sinks: DashMap<String, HashMap<String, mpsc::Sender<PushEnvelope>>>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self {
            sinks: DashMap::new(),
        }
    }

    /// 附着连接到主题
    pub fn attach(&self, topic: &str, connection_id: &str, sink: mpsc::Sender<PushEnvelope>) {
        self.sinks
            .entry(topic.to_string())
            .or_default()
            .insert(connection_id.to_string(), sink);
    }

    /// 从主题摘除连接
    pub fn detach(&self, topic: &str, connection_id: &str) {
        if let Some(mut entry) = self.sinks.get_mut(topic) {
            entry.remove(connection_id);
        }
    }

    /// 摘除连接的全部主题，返回摘除数量
    pub fn detach_connection(&self, connection_id: &str) -> usize {
        let mut removed = 0;
        for mut entry in self.sinks.iter_mut() {
            if entry.remove(connection_id).is_some() {
                removed += 1;
            }
        }
        removed
    }

    /// 移除主题下的全部连接
    pub fn remove_topic(&self, topic: &str) {
        self.sinks.remove(topic);
    }

    /// 向主题下全部本地连接扇出，返回 (投递数, 丢弃数)
    pub fn fan_out(&self, topic: &str, envelope: &PushEnvelope) -> (usize, usize) {
        let mut delivered = 0;
        let mut dropped = 0;
        let mut closed = Vec::new();

        if let Some(entry) = self.sinks.get(topic) {
            for (connection_id, sink) in entry.iter() {
                match sink.try_send(envelope.clone()) {
                    Ok(()) => delivered += 1,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        // 慢连接：丢弃本条，订阅者等待下一条
                        dropped += 1;
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        dropped += 1;
                        closed.push(connection_id.clone());
                    }
                }
            }
        }

        if !closed.is_empty() {
            if let Some(mut entry) = self.sinks.get_mut(topic) {
                for connection_id in closed {
                    entry.remove(&connection_id);
                }
            }
        }

        (delivered, dropped)
    }
}

impl Default for ConnectionTable {
    fn default() -> Self {
        Self::new()
    }
}

/// 广播扇出总线接口
#[async_trait]
pub trait EventBus: Send + Sync {
    /// 发布事件信封到主题（行程 ID 或运营主题）
    async fn publish(&self, topic: &str, envelope: &PushEnvelope) -> Result<()>;

    /// 启动跨实例订阅监听（本地实现为空操作）
    fn start(&self) {}
}

/// Redis Pub/Sub 扇出总线
///
/// 发布到 `trip:events:{topic}` 频道；每个实例运行一个模式订阅
/// 监听任务，把收到的信封转发给本地连接表。
pub struct RedisEventBus {
    client: Client,
    connections: Arc<ConnectionTable>,
    metrics: Arc<BroadcastMetrics>,
}

impl RedisEventBus {
    pub fn new(client: Client, connections: Arc<ConnectionTable>, metrics: Arc<BroadcastMetrics>) -> Self {
        Self {
            client,
            connections,
            metrics,
        }
    }

    fn event_channel(topic: &str) -> String {
        format!("{}:{}", EVENT_CHANNEL_PREFIX, topic)
    }

    async fn listen(
        client: Client,
        connections: Arc<ConnectionTable>,
        metrics: Arc<BroadcastMetrics>,
    ) -> Result<()> {
        let mut pubsub = client.get_async_pubsub().await?;
        pubsub
            .psubscribe(format!("{}:*", EVENT_CHANNEL_PREFIX))
            .await?;
        let mut stream = pubsub.into_on_message();

        while let Some(msg) = stream.next().await {
            let channel = msg.get_channel_name().to_string();
            let topic = channel
                .strip_prefix(&format!("{}:", EVENT_CHANNEL_PREFIX))
                .unwrap_or(&channel)
                .to_string();

            let payload: String = match msg.get_payload() {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(error = %e, channel = %channel, "Failed to read bus message payload");
                    continue;
                }
            };

            match serde_json::from_str::<PushEnvelope>(&payload) {
                Ok(envelope) => {
                    let (delivered, dropped) = connections.fan_out(&topic, &envelope);
                    metrics.envelopes_delivered_total.inc_by(delivered as u64);
                    metrics.envelopes_dropped_total.inc_by(dropped as u64);
                }
                Err(e) => {
                    warn!(error = %e, channel = %channel, "Failed to parse bus envelope");
                }
            }
        }

        Ok(())
    }
}

#[async_trait]
impl EventBus for RedisEventBus {
    async fn publish(&self, topic: &str, envelope: &PushEnvelope) -> Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let channel = Self::event_channel(topic);
        let message = serde_json::to_string(envelope)?;
        let _: i64 = conn.publish(&channel, message).await?;
        Ok(())
    }

    fn start(&self) {
        let client = self.client.clone();
        let connections = self.connections.clone();
        let metrics = self.metrics.clone();

        tokio::spawn(async move {
            loop {
                if let Err(e) =
                    Self::listen(client.clone(), connections.clone(), metrics.clone()).await
                {
                    error!(error = %e, "Trip event listener exited, reconnecting");
                }
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        });
    }
}

/// 本地扇出总线（单进程部署与测试用）
///
/// 发布直接扇出到本地连接表，无跨实例传输。
pub struct LocalEventBus {
    connections: Arc<ConnectionTable>,
    metrics: Arc<BroadcastMetrics>,
}

impl LocalEventBus {
    pub fn new(connections: Arc<ConnectionTable>, metrics: Arc<BroadcastMetrics>) -> Self {
        Self {
            connections,
            metrics,
        }
    }
}

#[async_trait]
impl EventBus for LocalEventBus {
    async fn publish(&self, topic: &str, envelope: &PushEnvelope) -> Result<()> {
        let (delivered, dropped) = self.connections.fan_out(topic, envelope);
        self.metrics.envelopes_delivered_total.inc_by(delivered as u64);
        self.metrics.envelopes_dropped_total.inc_by(dropped as u64);
        Ok(())
    }
}
