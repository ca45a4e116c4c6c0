//! 通知投递队列模块
//!
//! 持久化、按优先级、带重试的异步投递：行程常规通知与
//! SOS 管线共用。与广播总线分属两档投递保证，互不混用——
//! 位置流永不落入队列积压。

pub mod job;
pub mod retry;
pub mod store;
pub mod worker;

use std::sync::Arc;

use crate::error::Result;
use crate::metrics::QueueMetrics;

pub use job::{JobPayload, JobPriority, JobStatus, NotificationJob};
pub use retry::{RetryPolicy, execute_with_retry};
pub use store::{JobStore, MemoryJobStore, PostgresJobStore, init_notification_jobs_table};
pub use worker::{DeliveryObserver, DeliveryWorker, DeliveryWorkerConfig, NoopObserver};

/// 通知投递队列模块
pub struct QueueModule {
    /// 任务存储
    pub store: Arc<dyn JobStore>,
    /// 投递执行器
    pub worker: Arc<DeliveryWorker>,
    /// 监控指标
    metrics: Arc<QueueMetrics>,
}

impl QueueModule {
    pub fn new(
        store: Arc<dyn JobStore>,
        worker: Arc<DeliveryWorker>,
        metrics: Arc<QueueMetrics>,
    ) -> Self {
        Self {
            store,
            worker,
            metrics,
        }
    }

    /// 启动投递执行器
    pub fn start(&self) -> tokio::task::JoinHandle<()> {
        self.worker.start()
    }

    /// 入队；返回成功即已持久化，任务终将到达 Completed 或 Failed
    pub async fn enqueue(&self, job: &NotificationJob) -> Result<()> {
        self.store.enqueue(job).await?;
        self.metrics
            .jobs_enqueued_total
            .with_label_values(&[job.priority.as_str()])
            .inc();
        Ok(())
    }

    /// 队列深度
    pub async fn depth(&self) -> Result<u64> {
        self.store.depth().await
    }

    /// 终态失败任务（运维可见性）
    pub async fn failed_jobs(&self, limit: u32) -> Result<Vec<NotificationJob>> {
        self.store.failed_jobs(limit).await
    }
}
