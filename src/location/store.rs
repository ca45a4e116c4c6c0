//! 位置缓存统一接口
//!
//! 提供按行程存取最新位置样本的能力，供本实例与其他实例共享

use async_trait::async_trait;

use crate::error::Result;
use crate::location::sample::LocationSample;

/// 位置缓存接口
///
/// 实现约束：
/// - 仅当样本时间戳比已存值更新时才写入（乱序样本丢弃）
/// - 条目带空闲过期时间，每次接受写入时刷新
#[async_trait]
pub trait LocationStore: Send + Sync {
    /// 写入样本，仅当更新成功时返回 true
    async fn put_if_newer(&self, sample: &LocationSample) -> Result<bool>;

    /// 读取行程最新位置样本
    async fn get(&self, trip_id: &str) -> Result<Option<LocationSample>>;

    /// 删除行程位置缓存（行程结束时调用）
    async fn remove(&self, trip_id: &str) -> Result<()>;
}
