//! 通知通道适配器
//!
//! 统一的多通道出口：推送、短信、邮件、运营看板、语音电话。
//! 通道调用由投递队列驱动，并由对应熔断器守护。

pub mod mock;
pub mod webhook;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub use mock::MockChannel;
pub use webhook::{WebhookChannel, WebhookChannelConfig, WebhookChannelFactory};

/// 通知通道类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    /// App 推送
    Push,
    /// 短信
    Sms,
    /// 邮件
    Email,
    /// 运营看板推送
    OperatorDashboard,
    /// 语音电话（升级专用）
    VoiceCall,
}

impl ChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::Push => "push",
            ChannelKind::Sms => "sms",
            ChannelKind::Email => "email",
            ChannelKind::OperatorDashboard => "operator_dashboard",
            ChannelKind::VoiceCall => "voice_call",
        }
    }

    /// SOS 首轮并行通知的通道集合
    pub fn sos_notify_set() -> [ChannelKind; 4] {
        [
            ChannelKind::Push,
            ChannelKind::Sms,
            ChannelKind::Email,
            ChannelKind::OperatorDashboard,
        ]
    }

    /// 熔断器维度的依赖名
    pub fn dependency_name(&self) -> String {
        format!("channel:{}", self.as_str())
    }
}

/// 出站通知内容
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundNotification {
    /// 行程 ID
    pub trip_id: String,
    /// 关联告警 ID（SOS 通知时存在）
    pub alert_id: Option<String>,
    /// 通知标题
    pub title: String,
    /// 通知内容
    pub body: serde_json::Value,
}

/// 通知通道接口
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    /// 通道类型
    fn kind(&self) -> ChannelKind;

    /// 投递一条通知；失败返回错误由队列按退避重试
    async fn deliver(&self, notification: &OutboundNotification) -> Result<()>;
}

/// 通道注册表
pub struct ChannelRegistry {
    channels: HashMap<ChannelKind, Arc<dyn NotificationChannel>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self {
            channels: HashMap::new(),
        }
    }

    /// 注册通道适配器
    pub fn register(&mut self, channel: Arc<dyn NotificationChannel>) {
        self.channels.insert(channel.kind(), channel);
    }

    /// 查询通道适配器
    pub fn get(&self, kind: ChannelKind) -> Option<Arc<dyn NotificationChannel>> {
        self.channels.get(&kind).cloned()
    }

    /// 已注册的通道类型列表
    pub fn kinds(&self) -> Vec<ChannelKind> {
        self.channels.keys().copied().collect()
    }
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new()
    }
}
