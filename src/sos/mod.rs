//! SOS 告警模块
//!
//! 告警状态机、持久化仓储与协调器

pub mod alert;
pub mod coordinator;
pub mod profile;
pub mod repository;

use std::sync::Arc;

use crate::error::Result;

pub use alert::{AlertState, ChannelOutcome, ChannelResult, GeoPoint, SosAlert, TriggerSource};
pub use coordinator::{ALERT_STORE_DEPENDENCY, SosCoordinator};
pub use profile::{NoopProfileDirectory, ProfileDirectory, StaticProfileDirectory};
pub use repository::{
    AlertRepository, MemoryAlertRepository, PostgresAlertRepository, init_sos_alerts_table,
};

/// SOS 告警模块
pub struct SosModule {
    /// 告警协调器
    pub coordinator: Arc<SosCoordinator>,
    /// 告警仓储
    pub repository: Arc<dyn AlertRepository>,
}

impl SosModule {
    pub fn new(coordinator: Arc<SosCoordinator>, repository: Arc<dyn AlertRepository>) -> Self {
        Self {
            coordinator,
            repository,
        }
    }

    /// 读取告警
    pub async fn get_alert(&self, alert_id: &str) -> Result<Option<SosAlert>> {
        self.repository.load(alert_id).await
    }
}
