//! SOS 告警状态机类型
//!
//! Triggered -> Persisted -> Notifying -> (Acknowledged | Escalated) -> Resolved
//! 非法转移是程序不变量违例，以错误中止操作而不是继续执行。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::channels::ChannelKind;
use crate::error::{Result, TripCoreError};
use crate::utils::new_alert_id;

/// 告警状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertState {
    /// 已触发（尚未落库）
    Triggered,
    /// 已持久化
    Persisted,
    /// 各通道并行通知中
    Notifying,
    /// 已被运营确认
    Acknowledged,
    /// 确认窗口超时，已升级
    Escalated,
    /// 已解除（终态）
    Resolved,
}

impl AlertState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertState::Triggered => "triggered",
            AlertState::Persisted => "persisted",
            AlertState::Notifying => "notifying",
            AlertState::Acknowledged => "acknowledged",
            AlertState::Escalated => "escalated",
            AlertState::Resolved => "resolved",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "persisted" => AlertState::Persisted,
            "notifying" => AlertState::Notifying,
            "acknowledged" => AlertState::Acknowledged,
            "escalated" => AlertState::Escalated,
            "resolved" => AlertState::Resolved,
            _ => AlertState::Triggered,
        }
    }

    /// 状态转移表
    ///
    /// Resolved 仅可自 Acknowledged/Escalated 到达；
    /// 通知前必须先完成持久化（Triggered 只能去 Persisted）
    pub fn can_transition(self, to: AlertState) -> bool {
        matches!(
            (self, to),
            (AlertState::Triggered, AlertState::Persisted)
                | (AlertState::Persisted, AlertState::Notifying)
                | (AlertState::Persisted, AlertState::Acknowledged)
                | (AlertState::Persisted, AlertState::Escalated)
                | (AlertState::Notifying, AlertState::Acknowledged)
                | (AlertState::Notifying, AlertState::Escalated)
                | (AlertState::Escalated, AlertState::Acknowledged)
                | (AlertState::Acknowledged, AlertState::Resolved)
                | (AlertState::Escalated, AlertState::Resolved)
        )
    }

    /// 是否终态
    pub fn is_terminal(&self) -> bool {
        matches!(self, AlertState::Resolved)
    }
}

/// 触发来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    Passenger,
    Driver,
}

impl TriggerSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerSource::Passenger => "passenger",
            TriggerSource::Driver => "driver",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "driver" => TriggerSource::Driver,
            _ => TriggerSource::Passenger,
        }
    }
}

/// 触发时的位置
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

/// 通道投递结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelOutcome {
    Success,
    Failure,
}

/// 单通道投递结果记录
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelResult {
    /// 通道
    pub channel: ChannelKind,
    /// 结果
    pub status: ChannelOutcome,
    /// 记录时间
    pub attempted_at: DateTime<Utc>,
}

/// SOS 告警记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SosAlert {
    /// 告警 ID
    pub alert_id: String,
    /// 行程 ID
    pub trip_id: String,
    /// 触发来源
    pub triggered_by: TriggerSource,
    /// 触发位置（触发时缓存可能为空）
    pub location: Option<GeoPoint>,
    /// 触发时间
    pub triggered_at: DateTime<Utc>,
    /// 当前状态
    pub state: AlertState,
    /// 各通道投递结果
    pub channel_results: Vec<ChannelResult>,
    /// 确认人（运营）
    pub acknowledged_by: Option<String>,
    /// 解除时间
    pub resolved_at: Option<DateTime<Utc>>,
    /// 解除原因（终态必填）
    pub resolution: Option<String>,
}

impl SosAlert {
    /// 创建新告警（初始态 Triggered，待落库）
    pub fn new(trip_id: &str, triggered_by: TriggerSource, location: Option<GeoPoint>) -> Self {
        Self {
            alert_id: new_alert_id(),
            trip_id: trip_id.to_string(),
            triggered_by,
            location,
            triggered_at: Utc::now(),
            state: AlertState::Triggered,
            channel_results: Vec::new(),
            acknowledged_by: None,
            resolved_at: None,
            resolution: None,
        }
    }

    /// 按转移表推进状态；非法转移返回错误
    pub fn transition(&mut self, to: AlertState) -> Result<()> {
        if !self.state.can_transition(to) {
            return Err(TripCoreError::InvalidTransition {
                from: self.state.as_str().to_string(),
                to: to.as_str().to_string(),
            });
        }
        self.state = to;
        Ok(())
    }

    /// 告警是否仍在生命周期内（未解除）
    pub fn is_active(&self) -> bool {
        !self.state.is_terminal()
    }

    /// 是否已完成投递（至少一个通道成功）
    pub fn fully_delivered(&self) -> bool {
        self.channel_results
            .iter()
            .any(|result| result.status == ChannelOutcome::Success)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        let mut alert = SosAlert::new("t1", TriggerSource::Passenger, None);
        alert.transition(AlertState::Persisted).unwrap();
        alert.transition(AlertState::Notifying).unwrap();
        alert.transition(AlertState::Acknowledged).unwrap();
        alert.transition(AlertState::Resolved).unwrap();
        assert!(!alert.is_active());
    }

    #[test]
    fn test_notify_before_persist_is_rejected() {
        let mut alert = SosAlert::new("t1", TriggerSource::Driver, None);
        let result = alert.transition(AlertState::Notifying);
        assert!(matches!(result, Err(TripCoreError::InvalidTransition { .. })));
        assert_eq!(alert.state, AlertState::Triggered);
    }

    #[test]
    fn test_resolved_only_from_ack_or_escalated() {
        assert!(!AlertState::Notifying.can_transition(AlertState::Resolved));
        assert!(!AlertState::Persisted.can_transition(AlertState::Resolved));
        assert!(AlertState::Acknowledged.can_transition(AlertState::Resolved));
        assert!(AlertState::Escalated.can_transition(AlertState::Resolved));
    }

    #[test]
    fn test_terminal_state_has_no_exits() {
        for to in [
            AlertState::Triggered,
            AlertState::Persisted,
            AlertState::Notifying,
            AlertState::Acknowledged,
            AlertState::Escalated,
        ] {
            assert!(!AlertState::Resolved.can_transition(to));
        }
    }

    #[test]
    fn test_fully_delivered_needs_one_success() {
        let mut alert = SosAlert::new("t1", TriggerSource::Passenger, None);
        assert!(!alert.fully_delivered());

        alert.channel_results.push(ChannelResult {
            channel: ChannelKind::Sms,
            status: ChannelOutcome::Failure,
            attempted_at: Utc::now(),
        });
        assert!(!alert.fully_delivered());

        alert.channel_results.push(ChannelResult {
            channel: ChannelKind::Push,
            status: ChannelOutcome::Success,
            attempted_at: Utc::now(),
        });
        assert!(alert.fully_delivered());
    }
}
