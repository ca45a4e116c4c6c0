//! 广播与订阅类型定义

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::Result;
use crate::location::sample::LocationSample;

/// 位置事件类型
pub const EVENT_TYPE_LOCATION: &str = "location";
/// SOS 事件类型
pub const EVENT_TYPE_SOS: &str = "sosEvent";

/// 运营看板广播主题（非行程主题）
pub const OPS_TOPIC: &str = "ops";

/// 端上推送信封（线上契约，camelCase）
///
/// 客户端约定：`location` 信封中 `payload.capturedAt` 不比已渲染值新时
/// 必须忽略（重复投递为空操作）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushEnvelope {
    /// 事件类型：location | sosEvent
    #[serde(rename = "type")]
    pub event_type: String,
    /// 行程 ID
    pub trip_id: String,
    /// 事件负载
    pub payload: serde_json::Value,
    /// 发出时间（Unix 毫秒）
    pub ts: i64,
}

impl PushEnvelope {
    /// 从位置样本构造位置信封
    pub fn location(sample: &LocationSample) -> Result<Self> {
        Ok(Self {
            event_type: EVENT_TYPE_LOCATION.to_string(),
            trip_id: sample.trip_id.clone(),
            payload: serde_json::to_value(sample)?,
            ts: crate::utils::epoch_millis(),
        })
    }

    /// 构造 SOS 事件信封
    pub fn sos_event(trip_id: &str, alert_id: &str, state: &str) -> Self {
        Self {
            event_type: EVENT_TYPE_SOS.to_string(),
            trip_id: trip_id.to_string(),
            payload: json!({
                "alertId": alert_id,
                "state": state,
            }),
            ts: crate::utils::epoch_millis(),
        }
    }
}

/// 订阅登记
///
/// 连接由持有它的实例负责；登记本身是跨实例共享状态
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    /// 行程 ID
    pub trip_id: String,
    /// 连接 ID
    pub connection_id: String,
    /// 持有连接的实例 ID
    pub instance_id: String,
    /// 订阅时间（Unix 毫秒）
    pub subscribed_at: i64,
}
