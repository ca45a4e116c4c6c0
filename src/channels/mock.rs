//! 内存通知通道
//!
//! 用于测试与本地联调：记录收到的通知，可按需强制失败

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::channels::{ChannelKind, NotificationChannel, OutboundNotification};
use crate::error::{Result, TripCoreError};

/// 内存通知通道
pub struct MockChannel {
    kind: ChannelKind,
    fail: AtomicBool,
    attempts: AtomicU32,
    delivered: Mutex<Vec<OutboundNotification>>,
}

impl MockChannel {
    pub fn new(kind: ChannelKind) -> Self {
        Self {
            kind,
            fail: AtomicBool::new(false),
            attempts: AtomicU32::new(0),
            delivered: Mutex::new(Vec::new()),
        }
    }

    /// 设置后续投递是否失败
    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// 通道被调用的总次数（含失败）
    pub fn attempt_count(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// 已成功投递的通知快照
    pub fn delivered(&self) -> Vec<OutboundNotification> {
        self.delivered.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl NotificationChannel for MockChannel {
    fn kind(&self) -> ChannelKind {
        self.kind
    }

    async fn deliver(&self, notification: &OutboundNotification) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(TripCoreError::ChannelDelivery(format!(
                "{} channel forced failure",
                self.kind.as_str()
            )));
        }
        self.delivered.lock().unwrap().push(notification.clone());
        Ok(())
    }
}
