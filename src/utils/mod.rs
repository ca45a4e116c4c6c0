//! 辅助工具函数模块
//!
//! 提供时间戳与标识符生成等常用辅助函数

use ulid::Ulid;
use uuid::Uuid;

/// 获取当前 Unix 毫秒时间戳
pub fn epoch_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// 生成告警 ID（ULID，可按时间排序）
pub fn new_alert_id() -> String {
    format!("sos_{}", Ulid::new())
}

/// 生成通知任务 ID
pub fn new_job_id() -> String {
    format!("job_{}", Ulid::new())
}

/// 生成连接 ID（由接入网关在建立连接时调用）
pub fn new_connection_id() -> String {
    format!("conn_{}", Uuid::new_v4())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_prefixes() {
        assert!(new_alert_id().starts_with("sos_"));
        assert!(new_job_id().starts_with("job_"));
        assert!(new_connection_id().starts_with("conn_"));
    }

    #[test]
    fn test_ids_unique() {
        assert_ne!(new_job_id(), new_job_id());
    }
}
