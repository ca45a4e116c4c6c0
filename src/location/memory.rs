//! 位置缓存内存实现
//!
//! 用于单进程部署和测试，过期采用读时惰性检查

use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::error::Result;
use crate::location::sample::LocationSample;
use crate::location::store::LocationStore;

struct CachedSample {
    sample: LocationSample,
    stored_at: Instant,
}

/// 内存位置缓存
pub struct MemoryLocationStore {
    entries: DashMap<String, CachedSample>,
    ttl: Duration,
}

impl MemoryLocationStore {
    /// 创建新的内存位置缓存
    pub fn new(ttl_seconds: u64) -> Self {
        Self {
            entries: DashMap::new(),
            ttl: Duration::from_secs(ttl_seconds),
        }
    }
}

#[async_trait::async_trait]
impl LocationStore for MemoryLocationStore {
    async fn put_if_newer(&self, sample: &LocationSample) -> Result<bool> {
        match self.entries.entry(sample.trip_id.clone()) {
            Entry::Occupied(mut occupied) => {
                let expired = occupied.get().stored_at.elapsed() >= self.ttl;
                if expired || sample.is_newer_than(&occupied.get().sample) {
                    occupied.insert(CachedSample {
                        sample: sample.clone(),
                        stored_at: Instant::now(),
                    });
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(CachedSample {
                    sample: sample.clone(),
                    stored_at: Instant::now(),
                });
                Ok(true)
            }
        }
    }

    async fn get(&self, trip_id: &str) -> Result<Option<LocationSample>> {
        if let Some(entry) = self.entries.get(trip_id) {
            if entry.stored_at.elapsed() < self.ttl {
                return Ok(Some(entry.sample.clone()));
            }
        }
        // 过期条目惰性清理
        self.entries
            .remove_if(trip_id, |_, cached| cached.stored_at.elapsed() >= self.ttl);
        Ok(None)
    }

    async fn remove(&self, trip_id: &str) -> Result<()> {
        self.entries.remove(trip_id);
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
    async fn test_out_of_order_samples_discarded() -> Result<()> {
        let store = MemoryLocationStore::new(300);

        // 乱序到达 [5, 3, 8]：3 不得覆盖 5，最终值为 8
        assert!(store.put_if_newer(&sample("t1", 5)).await?);
        assert!(!store.put_if_newer(&sample("t1", 3)).await?);
        assert!(store.put_if_newer(&sample("t1", 8)).await?);

        let stored = store.get("t1").await?.unwrap();
        assert_eq!(stored.captured_at, 8);
        Ok(())
    }

    #[tokio::test]
    async fn test_duplicate_redelivery_is_noop() -> Result<()> {
        let store = MemoryLocationStore::new(300);

        assert!(store.put_if_newer(&sample("t1", 5)).await?);
        assert!(!store.put_if_newer(&sample("t1", 5)).await?);

        let stored = store.get("t1").await?.unwrap();
        assert_eq!(stored.captured_at, 5);
        Ok(())
    }

    #[tokio::test]
    async fn test_idle_expiry() -> Result<()> {
        let store = MemoryLocationStore::new(0);

        store.put_if_newer(&sample("t1", 5)).await?;
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(store.get("t1").await?.is_none());
        Ok(())
    }
}
