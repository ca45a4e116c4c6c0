//! 位置缓存 Redis 实现
//!
//! 样本以 JSON 存储在 `trip:loc:{trip_id}`，带空闲过期时间

use redis::{AsyncCommands, Client};

use crate::error::Result;
use crate::location::sample::LocationSample;
use crate::location::store::LocationStore;

const LOCATION_KEY_PREFIX: &str = "trip:loc";

/// Redis 位置缓存
pub struct RedisLocationStore {
    client: Client,
    /// 条目空闲过期时间（秒）
    ttl_seconds: u64,
}

impl RedisLocationStore {
    /// 创建新的 Redis 位置缓存
    pub fn new(client: Client, ttl_seconds: u64) -> Self {
        Self {
            client,
            ttl_seconds,
        }
    }

    fn location_key(&self, trip_id: &str) -> String {
        format!("{}:{}", LOCATION_KEY_PREFIX, trip_id)
    }
}

#[async_trait::async_trait]
impl LocationStore for RedisLocationStore {
    async fn put_if_newer(&self, sample: &LocationSample) -> Result<bool> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let key = self.location_key(&sample.trip_id);

        // 新鲜度检查：按时间戳 last-write-wins，乱序样本丢弃。
        // 读-比-写之间跨实例的竞争由更新样本的后续覆盖收敛。
        let stored: Option<String> = conn.get(&key).await?;
        if let Some(data) = stored {
            let current: LocationSample = serde_json::from_str(&data)?;
            if !sample.is_newer_than(&current) {
                return Ok(false);
            }
        }

        let value = serde_json::to_string(sample)?;
        let _: () = conn.set_ex(&key, value, self.ttl_seconds).await?;
        Ok(true)
    }

    async fn get(&self, trip_id: &str) -> Result<Option<LocationSample>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let key = self.location_key(trip_id);
        let value: Option<String> = conn.get(&key).await?;

        match value {
            Some(data) => Ok(Some(serde_json::from_str(&data)?)),
            None => Ok(None),
        }
    }

    async fn remove(&self, trip_id: &str) -> Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let key = self.location_key(trip_id);
        let _: () = conn.del(&key).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(trip_id: &str, captured_at: i64) -> LocationSample {
        LocationSample {
            trip_id: trip_id.to_string(),
            lat: 22.54,
            lng: 114.05,
            speed: 35.0,
            heading: 180.0,
            captured_at,
        }
    }

    #[tokio::test]
    #[ignore] // 需要 Redis
    async fn test_redis_put_if_newer() -> Result<()> {
        let client = Client::open("redis://127.0.0.1/").unwrap();
        let store = RedisLocationStore::new(client, 300);

        let trip_id = "trip_redis_store_test";
        store.remove(trip_id).await?;

        assert!(store.put_if_newer(&sample(trip_id, 5)).await?);
        assert!(!store.put_if_newer(&sample(trip_id, 3)).await?);
        assert!(store.put_if_newer(&sample(trip_id, 8)).await?);

        let stored = store.get(trip_id).await?.unwrap();
        assert_eq!(stored.captured_at, 8);

        store.remove(trip_id).await?;
        Ok(())
    }
}
