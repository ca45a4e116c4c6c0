//! 订阅登记仓储
//!
//! 记录哪些连接订阅了哪些行程，以及行程的活跃窗口。
//! 登记是跨实例共享状态：订阅者与发布者可能在不同进程上。

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use dashmap::DashMap;
use redis::{AsyncCommands, Client};

use crate::broadcast::types::Subscription;
use crate::error::Result;

const TRIP_SUBSCRIBERS_KEY_PREFIX: &str = "trip:subs";
const CONNECTION_TRIPS_KEY_PREFIX: &str = "conn:trips";
const TRIP_ACTIVE_KEY_PREFIX: &str = "trip:active";

/// 订阅登记仓储接口
#[async_trait]
pub trait SubscriptionRegistry: Send + Sync {
    /// 登记订阅
    async fn subscribe(&self, subscription: &Subscription) -> Result<()>;

    /// 移除订阅
    async fn unsubscribe(&self, trip_id: &str, connection_id: &str) -> Result<()>;

    /// 查询行程的全部订阅
    async fn subscribers_of(&self, trip_id: &str) -> Result<Vec<Subscription>>;

    /// 移除连接的全部订阅（连接断开时调用）
    async fn remove_connection(&self, connection_id: &str) -> Result<()>;

    /// 关闭行程的订阅窗口并清理其全部订阅
    async fn close_trip(&self, trip_id: &str) -> Result<()>;

    /// 标记行程进入活跃窗口（可订阅、可触发 SOS）
    async fn mark_trip_active(&self, trip_id: &str) -> Result<()>;

    /// 标记行程结束
    async fn mark_trip_completed(&self, trip_id: &str) -> Result<()>;

    /// 查询行程是否处于活跃窗口
    async fn is_trip_active(&self, trip_id: &str) -> Result<bool>;
}

/// Redis 订阅登记仓储
pub struct RedisSubscriptionRegistry {
    client: Client,
    /// 订阅登记过期时间（秒）
    subscription_ttl_seconds: u64,
    /// 行程活跃窗口过期时间（秒）
    trip_active_ttl_seconds: u64,
}

impl RedisSubscriptionRegistry {
    pub fn new(
        client: Client,
        subscription_ttl_seconds: u64,
        trip_active_ttl_seconds: u64,
    ) -> Self {
        Self {
            client,
            subscription_ttl_seconds,
            trip_active_ttl_seconds,
        }
    }

    fn trip_subscribers_key(&self, trip_id: &str) -> String {
        format!("{}:{}", TRIP_SUBSCRIBERS_KEY_PREFIX, trip_id)
    }

    fn connection_trips_key(&self, connection_id: &str) -> String {
        format!("{}:{}", CONNECTION_TRIPS_KEY_PREFIX, connection_id)
    }

    fn trip_active_key(&self, trip_id: &str) -> String {
        format!("{}:{}", TRIP_ACTIVE_KEY_PREFIX, trip_id)
    }
}

#[async_trait]
impl SubscriptionRegistry for RedisSubscriptionRegistry {
    async fn subscribe(&self, subscription: &Subscription) -> Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let trip_key = self.trip_subscribers_key(&subscription.trip_id);
        let conn_key = self.connection_trips_key(&subscription.connection_id);
        let value = serde_json::to_string(subscription)?;

        let _: () = conn
            .hset(&trip_key, &subscription.connection_id, value)
            .await?;
        let _: i64 = conn.sadd(&conn_key, &subscription.trip_id).await?;

        // 订阅登记带过期时间，每次订阅时刷新
        let _: bool = conn
            .expire(&trip_key, self.subscription_ttl_seconds as i64)
            .await?;
        let _: bool = conn
            .expire(&conn_key, self.subscription_ttl_seconds as i64)
            .await?;

        Ok(())
    }

    async fn unsubscribe(&self, trip_id: &str, connection_id: &str) -> Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let trip_key = self.trip_subscribers_key(trip_id);
        let conn_key = self.connection_trips_key(connection_id);

        let _: i64 = conn.hdel(&trip_key, connection_id).await?;
        let _: i64 = conn.srem(&conn_key, trip_id).await?;
        Ok(())
    }

    async fn subscribers_of(&self, trip_id: &str) -> Result<Vec<Subscription>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let trip_key = self.trip_subscribers_key(trip_id);
        let entries: HashMap<String, String> = conn.hgetall(&trip_key).await?;

        let mut subscriptions = Vec::with_capacity(entries.len());
        for (_, value) in entries {
            match serde_json::from_str::<Subscription>(&value) {
                Ok(subscription) => subscriptions.push(subscription),
                Err(e) => {
                    tracing::warn!(error = %e, trip_id = %trip_id, "Failed to parse subscription record");
                }
            }
        }
        Ok(subscriptions)
    }

    async fn remove_connection(&self, connection_id: &str) -> Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let conn_key = self.connection_trips_key(connection_id);
        let trip_ids: Vec<String> = conn.smembers(&conn_key).await?;

        for trip_id in trip_ids {
            let trip_key = self.trip_subscribers_key(&trip_id);
            let _: i64 = conn.hdel(&trip_key, connection_id).await?;
        }
        let _: i64 = conn.del(&conn_key).await?;
        Ok(())
    }

    async fn close_trip(&self, trip_id: &str) -> Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let trip_key = self.trip_subscribers_key(trip_id);
        let connection_ids: Vec<String> = conn.hkeys(&trip_key).await?;

        for connection_id in connection_ids {
            let conn_key = self.connection_trips_key(&connection_id);
            let _: i64 = conn.srem(&conn_key, trip_id).await?;
        }
        let _: i64 = conn.del(&trip_key).await?;
        Ok(())
    }

    async fn mark_trip_active(&self, trip_id: &str) -> Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let key = self.trip_active_key(trip_id);
        let _: () = conn
            .set_ex(&key, 1, self.trip_active_ttl_seconds)
            .await?;
        Ok(())
    }

    async fn mark_trip_completed(&self, trip_id: &str) -> Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let key = self.trip_active_key(trip_id);
        let _: i64 = conn.del(&key).await?;
        Ok(())
    }

    async fn is_trip_active(&self, trip_id: &str) -> Result<bool> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let key = self.trip_active_key(trip_id);
        let exists: bool = conn.exists(&key).await?;
        Ok(exists)
    }
}

/// 内存订阅登记仓储（单进程部署与测试用）
pub struct MemorySubscriptionRegistry {
    /// trip_id -> connection_id -> 订阅
    subscriptions: DashMap<String, HashMap<String, Subscription>>,
    /// connection_id -> 订阅的行程集合
    connection_trips: DashMap<String, HashSet<String>>,
    /// 活跃行程集合
    active_trips: DashMap<String, ()>,
}

impl MemorySubscriptionRegistry {
    pub fn new() -> Self {
        Self {
            subscriptions: DashMap::new(),
            connection_trips: DashMap::new(),
            active_trips: DashMap::new(),
        }
    }
}

impl Default for MemorySubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SubscriptionRegistry for MemorySubscriptionRegistry {
    async fn subscribe(&self, subscription: &Subscription) -> Result<()> {
        self.subscriptions
            .entry(subscription.trip_id.clone())
            .or_default()
            .insert(subscription.connection_id.clone(), subscription.clone());
        self.connection_trips
            .entry(subscription.connection_id.clone())
            .or_default()
            .insert(subscription.trip_id.clone());
        Ok(())
    }

    async fn unsubscribe(&self, trip_id: &str, connection_id: &str) -> Result<()> {
        if let Some(mut entry) = self.subscriptions.get_mut(trip_id) {
            entry.remove(connection_id);
        }
        if let Some(mut entry) = self.connection_trips.get_mut(connection_id) {
            entry.remove(trip_id);
        }
        Ok(())
    }

    async fn subscribers_of(&self, trip_id: &str) -> Result<Vec<Subscription>> {
        Ok(self
            .subscriptions
            .get(trip_id)
            .map(|entry| entry.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn remove_connection(&self, connection_id: &str) -> Result<()> {
        if let Some((_, trip_ids)) = self.connection_trips.remove(connection_id) {
            for trip_id in trip_ids {
                if let Some(mut entry) = self.subscriptions.get_mut(&trip_id) {
                    entry.remove(connection_id);
                }
            }
        }
        Ok(())
    }

    async fn close_trip(&self, trip_id: &str) -> Result<()> {
        if let Some((_, connections)) = self.subscriptions.remove(trip_id) {
            for connection_id in connections.keys() {
                if let Some(mut entry) = self.connection_trips.get_mut(connection_id) {
                    entry.remove(trip_id);
                }
            }
        }
        Ok(())
    }

    async fn mark_trip_active(&self, trip_id: &str) -> Result<()> {
        self.active_trips.insert(trip_id.to_string(), ());
        Ok(())
    }

    async fn mark_trip_completed(&self, trip_id: &str) -> Result<()> {
        self.active_trips.remove(trip_id);
        Ok(())
    }

    async fn is_trip_active(&self, trip_id: &str) -> Result<bool> {
        Ok(self.active_trips.contains_key(trip_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subscription(trip_id: &str, connection_id: &str) -> Subscription {
        Subscription {
            trip_id: trip_id.to_string(),
            connection_id: connection_id.to_string(),
            instance_id: "instance_1".to_string(),
            subscribed_at: crate::utils::epoch_millis(),
        }
    }

    #[tokio::test]
    async fn test_subscribe_and_unsubscribe() -> Result<()> {
        let registry = MemorySubscriptionRegistry::new();

        registry.subscribe(&subscription("t1", "c1")).await?;
        registry.subscribe(&subscription("t1", "c2")).await?;
        assert_eq!(registry.subscribers_of("t1").await?.len(), 2);

        registry.unsubscribe("t1", "c1").await?;
        let remaining = registry.subscribers_of("t1").await?;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].connection_id, "c2");
        Ok(())
    }

    #[tokio::test]
    async fn test_remove_connection_clears_all_trips() -> Result<()> {
        let registry = MemorySubscriptionRegistry::new();

        registry.subscribe(&subscription("t1", "c1")).await?;
        registry.subscribe(&subscription("t2", "c1")).await?;
        registry.remove_connection("c1").await?;

        assert!(registry.subscribers_of("t1").await?.is_empty());
        assert!(registry.subscribers_of("t2").await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_trip_active_window() -> Result<()> {
        let registry = MemorySubscriptionRegistry::new();

        assert!(!registry.is_trip_active("t1").await?);
        registry.mark_trip_active("t1").await?;
        assert!(registry.is_trip_active("t1").await?);
        registry.mark_trip_completed("t1").await?;
        assert!(!registry.is_trip_active("t1").await?);
        Ok(())
    }
}
