//! 通知投递任务类型

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::channels::{ChannelKind, OutboundNotification};
use crate::utils::new_job_id;

/// 任务优先级（critical > high > normal > low）
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    Low = 0,
    Normal = 1,
    High = 2,
    Critical = 3,
}

impl JobPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobPriority::Low => "low",
            JobPriority::Normal => "normal",
            JobPriority::High => "high",
            JobPriority::Critical => "critical",
        }
    }

    pub fn as_i16(&self) -> i16 {
        *self as i16
    }

    pub fn from_i16(value: i16) -> Self {
        match value {
            3 => JobPriority::Critical,
            2 => JobPriority::High,
            1 => JobPriority::Normal,
            _ => JobPriority::Low,
        }
    }
}

/// 任务状态
///
/// Queued -> InFlight -> (Completed | Retrying -> Queued | Failed)
/// Failed 为终态，永不再试
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    InFlight,
    Completed,
    Retrying,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::InFlight => "in_flight",
            JobStatus::Completed => "completed",
            JobStatus::Retrying => "retrying",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "in_flight" => JobStatus::InFlight,
            "completed" => JobStatus::Completed,
            "retrying" => JobStatus::Retrying,
            "failed" => JobStatus::Failed,
            _ => JobStatus::Queued,
        }
    }

    /// 是否终态
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// 任务负载
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobPayload {
    /// 经指定通道投递一条通知
    ChannelDelivery {
        channel: ChannelKind,
        notification: OutboundNotification,
    },
    /// 告警升级检查（延时任务，确认窗口到期时执行）
    EscalationCheck { alert_id: String },
}

/// 通知投递任务
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationJob {
    /// 任务 ID
    pub job_id: String,
    /// 优先级
    pub priority: JobPriority,
    /// 负载
    pub payload: JobPayload,
    /// 已开始的尝试次数
    pub attempts: u32,
    /// 最大尝试次数
    pub max_attempts: u32,
    /// 下次尝试时间
    pub next_attempt_at: DateTime<Utc>,
    /// 状态
    pub status: JobStatus,
    /// 创建时间
    pub created_at: DateTime<Utc>,
    /// 最近一次失败原因
    pub last_error: Option<String>,
}

impl NotificationJob {
    /// 创建立即执行的任务
    pub fn new(priority: JobPriority, payload: JobPayload, max_attempts: u32) -> Self {
        let now = Utc::now();
        Self {
            job_id: new_job_id(),
            priority,
            payload,
            attempts: 0,
            max_attempts,
            next_attempt_at: now,
            status: JobStatus::Queued,
            created_at: now,
            last_error: None,
        }
    }

    /// 创建延时任务（升级检查等定时语义走延时任务而非进程内定时器，
    /// 进程重启不会丢失待升级检查）
    pub fn delayed(
        priority: JobPriority,
        payload: JobPayload,
        max_attempts: u32,
        delay_seconds: u64,
    ) -> Self {
        let mut job = Self::new(priority, payload, max_attempts);
        job.next_attempt_at = job.created_at + Duration::seconds(delay_seconds as i64);
        job
    }

    /// 是否还有剩余尝试次数
    pub fn attempts_remaining(&self) -> bool {
        self.attempts < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_order() {
        assert!(JobPriority::Critical > JobPriority::High);
        assert!(JobPriority::High > JobPriority::Normal);
        assert!(JobPriority::Normal > JobPriority::Low);
        assert_eq!(JobPriority::from_i16(JobPriority::Critical.as_i16()), JobPriority::Critical);
    }

    #[test]
    fn test_delayed_job_scheduling() {
        let job = NotificationJob::delayed(
            JobPriority::Critical,
            JobPayload::EscalationCheck {
                alert_id: "sos_1".to_string(),
            },
            3,
            30,
        );
        assert_eq!((job.next_attempt_at - job.created_at).num_seconds(), 30);
        assert_eq!(job.status, JobStatus::Queued);
    }

    #[test]
    fn test_payload_round_trip() {
        let payload = JobPayload::EscalationCheck {
            alert_id: "sos_1".to_string(),
        };
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["kind"], "escalation_check");
        let parsed: JobPayload = serde_json::from_value(value).unwrap();
        assert!(matches!(parsed, JobPayload::EscalationCheck { alert_id } if alert_id == "sos_1"));
    }
}
