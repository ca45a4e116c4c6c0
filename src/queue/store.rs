//! 通知任务存储
//!
//! `enqueue` 返回成功即任务已落库：进程重启后仍会被尝试。
//! 拉取即认领：任务在同一条语句内转入 InFlight 并累加尝试次数，
//! 多实例并发拉取互不重复（SKIP LOCKED）。

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row, postgres::PgRow};
use tokio::sync::Mutex;

use crate::error::Result;
use crate::queue::job::{JobPayload, JobPriority, JobStatus, NotificationJob};

/// 通知任务存储接口
#[async_trait]
pub trait JobStore: Send + Sync {
    /// 入队；返回成功即已持久化
    async fn enqueue(&self, job: &NotificationJob) -> Result<()>;

    /// 拉取到期任务并认领（按优先级降序），认领即 InFlight 且 attempts 加一
    async fn fetch_due(&self, limit: u32) -> Result<Vec<NotificationJob>>;

    /// 标记完成
    async fn mark_completed(&self, job_id: &str) -> Result<()>;

    /// 标记等待重试，指定下次尝试时间
    async fn mark_retrying(
        &self,
        job_id: &str,
        next_attempt_at: DateTime<Utc>,
        error: &str,
    ) -> Result<()>;

    /// 标记终态失败（不再重试，留存供运维排查）
    async fn mark_failed(&self, job_id: &str, error: &str) -> Result<()>;

    /// 读取任务
    async fn load(&self, job_id: &str) -> Result<Option<NotificationJob>>;

    /// 队列深度（未到终态的任务数）
    async fn depth(&self) -> Result<u64>;

    /// 终态失败任务列表（运维可见性）
    async fn failed_jobs(&self, limit: u32) -> Result<Vec<NotificationJob>>;
}

/// PostgreSQL 通知任务存储
pub struct PostgresJobStore {
    pool: PgPool,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn job_from_row(row: &PgRow) -> Result<NotificationJob> {
        let payload_value: serde_json::Value = row.try_get("payload")?;
        let payload: JobPayload = serde_json::from_value(payload_value)?;
        let status: String = row.try_get("status")?;

        Ok(NotificationJob {
            job_id: row.try_get("job_id")?,
            priority: JobPriority::from_i16(row.try_get("priority")?),
            payload,
            attempts: row.try_get::<i32, _>("attempts")? as u32,
            max_attempts: row.try_get::<i32, _>("max_attempts")? as u32,
            next_attempt_at: row.try_get("next_attempt_at")?,
            status: JobStatus::parse(&status),
            created_at: row.try_get("created_at")?,
            last_error: row.try_get("last_error")?,
        })
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    async fn enqueue(&self, job: &NotificationJob) -> Result<()> {
        let payload = serde_json::to_value(&job.payload)?;
        sqlx::query(
            "INSERT INTO notification_jobs
             (job_id, priority, payload, attempts, max_attempts, next_attempt_at, status, created_at, last_error)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(&job.job_id)
        .bind(job.priority.as_i16())
        .bind(payload)
        .bind(job.attempts as i32)
        .bind(job.max_attempts as i32)
        .bind(job.next_attempt_at)
        .bind(job.status.as_str())
        .bind(job.created_at)
        .bind(&job.last_error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fetch_due(&self, limit: u32) -> Result<Vec<NotificationJob>> {
        let rows = sqlx::query(
            "WITH due AS (
                 SELECT job_id FROM notification_jobs
                 WHERE status IN ('queued', 'retrying') AND next_attempt_at <= NOW()
                 ORDER BY priority DESC, next_attempt_at ASC
                 LIMIT $1
                 FOR UPDATE SKIP LOCKED
             )
             UPDATE notification_jobs j
             SET status = 'in_flight', attempts = j.attempts + 1
             FROM due
             WHERE j.job_id = due.job_id
             RETURNING j.job_id, j.priority, j.payload, j.attempts, j.max_attempts,
                       j.next_attempt_at, j.status, j.created_at, j.last_error",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut jobs = Vec::with_capacity(rows.len());
        for row in &rows {
            jobs.push(Self::job_from_row(row)?);
        }
        // RETURNING 不保证顺序，按优先级重排
        jobs.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.next_attempt_at.cmp(&b.next_attempt_at)));
        Ok(jobs)
    }

    async fn mark_completed(&self, job_id: &str) -> Result<()> {
        sqlx::query("UPDATE notification_jobs SET status = 'completed', last_error = NULL WHERE job_id = $1")
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn mark_retrying(
        &self,
        job_id: &str,
        next_attempt_at: DateTime<Utc>,
        error: &str,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE notification_jobs
             SET status = 'retrying', next_attempt_at = $2, last_error = $3
             WHERE job_id = $1",
        )
        .bind(job_id)
        .bind(next_attempt_at)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_failed(&self, job_id: &str, error: &str) -> Result<()> {
        sqlx::query(
            "UPDATE notification_jobs SET status = 'failed', last_error = $2 WHERE job_id = $1",
        )
        .bind(job_id)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load(&self, job_id: &str) -> Result<Option<NotificationJob>> {
        let row = sqlx::query(
            "SELECT job_id, priority, payload, attempts, max_attempts, next_attempt_at, status, created_at, last_error
             FROM notification_jobs WHERE job_id = $1",
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(Self::job_from_row(&row)?)),
            None => Ok(None),
        }
    }

    async fn depth(&self) -> Result<u64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS depth FROM notification_jobs
             WHERE status IN ('queued', 'retrying', 'in_flight')",
        )
        .fetch_one(&self.pool)
        .await?;
        let depth: i64 = row.try_get("depth")?;
        Ok(depth as u64)
    }

    async fn failed_jobs(&self, limit: u32) -> Result<Vec<NotificationJob>> {
        let rows = sqlx::query(
            "SELECT job_id, priority, payload, attempts, max_attempts, next_attempt_at, status, created_at, last_error
             FROM notification_jobs WHERE status = 'failed'
             ORDER BY created_at DESC LIMIT $1",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut jobs = Vec::with_capacity(rows.len());
        for row in &rows {
            jobs.push(Self::job_from_row(row)?);
        }
        Ok(jobs)
    }
}

/// 通知任务表初始化
pub async fn init_notification_jobs_table(pool: &PgPool) -> Result<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS notification_jobs (
            job_id TEXT PRIMARY KEY,
            priority SMALLINT NOT NULL,
            payload JSONB NOT NULL,
            attempts INTEGER NOT NULL DEFAULT 0,
            max_attempts INTEGER NOT NULL,
            next_attempt_at TIMESTAMPTZ NOT NULL,
            status TEXT NOT NULL,
            created_at TIMESTAMPTZ NOT NULL,
            last_error TEXT
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_notification_jobs_due
         ON notification_jobs (status, next_attempt_at)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_notification_jobs_priority
         ON notification_jobs (priority DESC)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// 内存通知任务存储（单进程部署与测试用）
pub struct MemoryJobStore {
    jobs: Mutex<HashMap<String, NotificationJob>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn enqueue(&self, job: &NotificationJob) -> Result<()> {
        self.jobs
            .lock()
            .await
            .insert(job.job_id.clone(), job.clone());
        Ok(())
    }

    async fn fetch_due(&self, limit: u32) -> Result<Vec<NotificationJob>> {
        let mut jobs = self.jobs.lock().await;
        let now = Utc::now();

        let mut due: Vec<String> = jobs
            .values()
            .filter(|job| {
                matches!(job.status, JobStatus::Queued | JobStatus::Retrying)
                    && job.next_attempt_at <= now
            })
            .map(|job| job.job_id.clone())
            .collect();

        due.sort_by_key(|job_id| {
            let job = &jobs[job_id];
            (std::cmp::Reverse(job.priority), job.next_attempt_at)
        });
        due.truncate(limit as usize);

        let mut claimed = Vec::with_capacity(due.len());
        for job_id in due {
            if let Some(job) = jobs.get_mut(&job_id) {
                job.status = JobStatus::InFlight;
                job.attempts += 1;
                claimed.push(job.clone());
            }
        }
        Ok(claimed)
    }

    async fn mark_completed(&self, job_id: &str) -> Result<()> {
        if let Some(job) = self.jobs.lock().await.get_mut(job_id) {
            job.status = JobStatus::Completed;
            job.last_error = None;
        }
        Ok(())
    }

    async fn mark_retrying(
        &self,
        job_id: &str,
        next_attempt_at: DateTime<Utc>,
        error: &str,
    ) -> Result<()> {
        if let Some(job) = self.jobs.lock().await.get_mut(job_id) {
            job.status = JobStatus::Retrying;
            job.next_attempt_at = next_attempt_at;
            job.last_error = Some(error.to_string());
        }
        Ok(())
    }

    async fn mark_failed(&self, job_id: &str, error: &str) -> Result<()> {
        if let Some(job) = self.jobs.lock().await.get_mut(job_id) {
            job.status = JobStatus::Failed;
            job.last_error = Some(error.to_string());
        }
        Ok(())
    }

    async fn load(&self, job_id: &str) -> Result<Option<NotificationJob>> {
        Ok(self.jobs.lock().await.get(job_id).cloned())
    }

    async fn depth(&self) -> Result<u64> {
        Ok(self
            .jobs
            .lock()
            .await
            .values()
            .filter(|job| !job.status.is_terminal())
            .count() as u64)
    }

    async fn failed_jobs(&self, limit: u32) -> Result<Vec<NotificationJob>> {
        let jobs = self.jobs.lock().await;
        let mut failed: Vec<NotificationJob> = jobs
            .values()
            .filter(|job| job.status == JobStatus::Failed)
            .cloned()
            .collect();
        failed.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        failed.truncate(limit as usize);
        Ok(failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::{ChannelKind, OutboundNotification};

    fn delivery_job(priority: JobPriority) -> NotificationJob {
        NotificationJob::new(
            priority,
            JobPayload::ChannelDelivery {
                channel: ChannelKind::Push,
                notification: OutboundNotification {
                    trip_id: "t1".to_string(),
                    alert_id: None,
                    title: "trip update".to_string(),
                    body: serde_json::json!({"text": "arriving soon"}),
                },
            },
            3,
        )
    }

    #[tokio::test]
    async fn test_fetch_due_orders_by_priority() -> Result<()> {
        let store = MemoryJobStore::new();

        store.enqueue(&delivery_job(JobPriority::Low)).await?;
        store.enqueue(&delivery_job(JobPriority::Critical)).await?;
        store.enqueue(&delivery_job(JobPriority::Normal)).await?;

        let due = store.fetch_due(10).await?;
        assert_eq!(due.len(), 3);
        assert_eq!(due[0].priority, JobPriority::Critical);
        assert_eq!(due[2].priority, JobPriority::Low);
        assert!(due.iter().all(|job| job.status == JobStatus::InFlight));
        assert!(due.iter().all(|job| job.attempts == 1));
        Ok(())
    }

    #[tokio::test]
    async fn test_delayed_job_not_due_until_deadline() -> Result<()> {
        let store = MemoryJobStore::new();
        let job = NotificationJob::delayed(
            JobPriority::Critical,
            JobPayload::EscalationCheck {
                alert_id: "sos_1".to_string(),
            },
            3,
            3600,
        );
        store.enqueue(&job).await?;

        assert!(store.fetch_due(10).await?.is_empty());
        assert_eq!(store.depth().await?, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_terminal_failed_surfaced() -> Result<()> {
        let store = MemoryJobStore::new();
        let job = delivery_job(JobPriority::Normal);
        store.enqueue(&job).await?;

        store.mark_failed(&job.job_id, "sms provider 503").await?;

        let failed = store.failed_jobs(10).await?;
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].last_error.as_deref(), Some("sms provider 503"));
        assert_eq!(store.depth().await?, 0);
        Ok(())
    }

    #[tokio::test]
    #[ignore] // 需要 PostgreSQL
    async fn test_postgres_enqueue_and_claim() -> Result<()> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(2)
            .connect("postgresql://localhost/ridex_test")
            .await?;
        init_notification_jobs_table(&pool).await?;
        let store = PostgresJobStore::new(pool);

        let job = delivery_job(JobPriority::Critical);
        store.enqueue(&job).await?;

        let due = store.fetch_due(10).await?;
        assert!(due.iter().any(|j| j.job_id == job.job_id));

        store.mark_completed(&job.job_id).await?;
        let loaded = store.load(&job.job_id).await?.unwrap();
        assert_eq!(loaded.status, JobStatus::Completed);
        Ok(())
    }
}
