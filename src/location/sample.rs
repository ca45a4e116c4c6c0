//! 位置样本类型
//!
//! 司机端高频上报的 GPS 采样，仅保留每行程最新一条

use serde::{Deserialize, Serialize};

/// 位置样本
///
/// 线上契约字段为 camelCase（与端上推送消息一致）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationSample {
    /// 行程 ID
    pub trip_id: String,
    /// 纬度
    pub lat: f64,
    /// 经度
    pub lng: f64,
    /// 速度（km/h）
    pub speed: f64,
    /// 航向角（度，正北为 0）
    pub heading: f64,
    /// 采集时间（Unix 毫秒）
    pub captured_at: i64,
}

impl LocationSample {
    /// 判断本样本是否比另一样本更新
    ///
    /// 相同时间戳视为重复投递，不算更新
    pub fn is_newer_than(&self, other: &LocationSample) -> bool {
        self.captured_at > other.captured_at
    }
}
