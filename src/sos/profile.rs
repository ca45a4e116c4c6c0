//! 用户档案查询边界
//!
//! 触发者身份与紧急联系人列表由档案子系统负责解析，
//! 本核心只依赖这个接口。查询失败不阻断告警通知。

use async_trait::async_trait;

use crate::error::Result;
use crate::sos::alert::TriggerSource;

/// 档案查询接口（由平台档案子系统实现）
#[async_trait]
pub trait ProfileDirectory: Send + Sync {
    /// 解析行程触发方的紧急联系人列表
    async fn emergency_contacts(
        &self,
        trip_id: &str,
        triggered_by: TriggerSource,
    ) -> Result<Vec<String>>;
}

/// 空实现（未接入档案子系统时使用）
pub struct NoopProfileDirectory;

#[async_trait]
impl ProfileDirectory for NoopProfileDirectory {
    async fn emergency_contacts(
        &self,
        _trip_id: &str,
        _triggered_by: TriggerSource,
    ) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
}

/// 固定名单实现（测试与联调用）
pub struct StaticProfileDirectory {
    contacts: Vec<String>,
}

impl StaticProfileDirectory {
    pub fn new(contacts: Vec<String>) -> Self {
        Self { contacts }
    }
}

#[async_trait]
impl ProfileDirectory for StaticProfileDirectory {
    async fn emergency_contacts(
        &self,
        _trip_id: &str,
        _triggered_by: TriggerSource,
    ) -> Result<Vec<String>> {
        Ok(self.contacts.clone())
    }
}
