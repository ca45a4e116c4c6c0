//! 行程实时核心服务门面
//!
//! 装配各子模块并对平台其余部分暴露统一入口：
//! 位置摄入、行程订阅、SOS 触发/确认/解除、行程生命周期信号
//! 与健康查询。服务自身无状态，可多实例水平扩容——共享状态
//! 全部在外部存储（Redis / PostgreSQL）。

use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;
use tokio::sync::mpsc;

use crate::admission::{AdmissionControl, AdmissionStore, DependencyHealth, EndpointClass, MemoryAdmissionStore, RedisAdmissionStore};
use crate::broadcast::{
    BroadcastModule, ConnectionTable, EventBus, LocalEventBus, MemorySubscriptionRegistry,
    PushEnvelope, RedisEventBus, RedisSubscriptionRegistry, SubscriptionRegistry,
};
use crate::channels::ChannelRegistry;
use crate::config::TripCoreConfig;
use crate::error::Result;
use crate::location::{
    LocationModule, LocationSample, LocationStore, MemoryLocationStore, RedisLocationStore,
};
use crate::metrics::{BroadcastMetrics, LocationMetrics, QueueMetrics, SosMetrics};
use crate::queue::{
    DeliveryWorker, DeliveryWorkerConfig, JobStore, MemoryJobStore, PostgresJobStore, QueueModule,
    init_notification_jobs_table,
};
use crate::sos::{
    ALERT_STORE_DEPENDENCY, AlertRepository, GeoPoint, MemoryAlertRepository,
    NoopProfileDirectory, PostgresAlertRepository, SosAlert, SosCoordinator, SosModule,
    TriggerSource, init_sos_alerts_table,
};

/// 健康查询结果（运维看板用）
#[derive(Debug, Clone, serde::Serialize)]
pub struct HealthStatus {
    /// 各依赖的熔断状态
    pub breakers: Vec<DependencyHealth>,
    /// 通知队列深度
    pub queue_depth: u64,
}

/// 行程实时核心服务
pub struct TripCoreService {
    /// 准入控制
    pub admission: Arc<AdmissionControl>,
    /// 位置缓存
    pub location: Arc<LocationModule>,
    /// 订阅与广播
    pub broadcast: Arc<BroadcastModule>,
    /// 通知投递队列
    pub queue: Arc<QueueModule>,
    /// SOS 告警
    pub sos: Arc<SosModule>,
    /// 通知通道注册表
    channels: Arc<ChannelRegistry>,
    /// 配置
    config: TripCoreConfig,
}

impl TripCoreService {
    /// 以外部共享存储（Redis + PostgreSQL）装配服务
    pub async fn connect(config: TripCoreConfig, channels: ChannelRegistry) -> Result<Self> {
        let redis_client = redis::Client::open(config.redis_url.as_str())?;
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(&config.database_url)
            .await?;
        init_notification_jobs_table(&pool).await?;
        init_sos_alerts_table(&pool).await?;

        let connections = Arc::new(ConnectionTable::new());
        let broadcast_metrics = Arc::new(BroadcastMetrics::new());
        let bus: Arc<dyn EventBus> = Arc::new(RedisEventBus::new(
            redis_client.clone(),
            connections.clone(),
            broadcast_metrics.clone(),
        ));

        Ok(Self::assemble(
            config.clone(),
            channels,
            Arc::new(RedisLocationStore::new(
                redis_client.clone(),
                config.location.ttl_seconds,
            )),
            Arc::new(RedisSubscriptionRegistry::new(
                redis_client.clone(),
                config.broadcast.subscription_ttl_seconds,
                config.broadcast.trip_active_ttl_seconds,
            )),
            Arc::new(RedisAdmissionStore::new(redis_client)),
            connections,
            broadcast_metrics,
            bus,
            Arc::new(PostgresJobStore::new(pool.clone())),
            Arc::new(PostgresAlertRepository::new(pool)),
        ))
    }

    /// 以内存存储装配服务（单进程部署与测试）
    pub fn in_memory(config: TripCoreConfig, channels: ChannelRegistry) -> Self {
        let connections = Arc::new(ConnectionTable::new());
        let broadcast_metrics = Arc::new(BroadcastMetrics::new());
        let bus: Arc<dyn EventBus> = Arc::new(LocalEventBus::new(
            connections.clone(),
            broadcast_metrics.clone(),
        ));

        Self::assemble(
            config.clone(),
            channels,
            Arc::new(MemoryLocationStore::new(config.location.ttl_seconds)),
            Arc::new(MemorySubscriptionRegistry::new()),
            Arc::new(MemoryAdmissionStore::new()),
            connections,
            broadcast_metrics,
            bus,
            Arc::new(MemoryJobStore::new()),
            Arc::new(MemoryAlertRepository::new()),
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        config: TripCoreConfig,
        channels: ChannelRegistry,
        location_store: Arc<dyn LocationStore>,
        registry: Arc<dyn SubscriptionRegistry>,
        admission_store: Arc<dyn AdmissionStore>,
        connections: Arc<ConnectionTable>,
        broadcast_metrics: Arc<BroadcastMetrics>,
        bus: Arc<dyn EventBus>,
        job_store: Arc<dyn JobStore>,
        alert_repository: Arc<dyn AlertRepository>,
    ) -> Self {
        let channels = Arc::new(channels);
        let admission = Arc::new(AdmissionControl::new(
            admission_store,
            config.admission.clone(),
        ));
        let broadcast = Arc::new(BroadcastModule::new(
            registry,
            bus,
            connections,
            broadcast_metrics,
            config.instance_id.clone(),
        ));
        let location = Arc::new(LocationModule::new(
            location_store,
            broadcast.clone(),
            Arc::new(LocationMetrics::new()),
        ));

        let coordinator = Arc::new(SosCoordinator::new(
            alert_repository.clone(),
            job_store.clone(),
            broadcast.clone(),
            admission.breaker.clone(),
            Arc::new(NoopProfileDirectory),
            Arc::new(SosMetrics::new()),
            config.sos.clone(),
        ));

        let queue_metrics = Arc::new(QueueMetrics::new());
        let worker = Arc::new(DeliveryWorker::new(
            job_store.clone(),
            channels.clone(),
            admission.breaker.clone(),
            coordinator.clone(),
            queue_metrics.clone(),
            DeliveryWorkerConfig::from(&config.queue),
        ));
        let queue = Arc::new(QueueModule::new(job_store, worker, queue_metrics));
        let sos = Arc::new(SosModule::new(coordinator, alert_repository));

        Self {
            admission,
            location,
            broadcast,
            queue,
            sos,
            channels,
            config,
        }
    }

    /// 启动后台任务：跨实例事件监听 + 投递执行器
    pub fn start(&self) -> tokio::task::JoinHandle<()> {
        self.broadcast.start();
        self.queue.start()
    }

    /// 为新接入连接创建推送信道（缓冲区大小取配置）
    pub fn connection_channel(&self) -> (mpsc::Sender<PushEnvelope>, mpsc::Receiver<PushEnvelope>) {
        mpsc::channel(self.config.broadcast.connection_buffer)
    }

    /// 摄入位置样本，返回是否接受
    ///
    /// 摄入路径错误就地恢复：样本被丢弃，下一条样本取而代之
    pub async fn ingest_location(&self, actor: &str, sample: &LocationSample) -> Result<bool> {
        self.admission.check(actor, EndpointClass::Standard).await?;
        self.location.ingest(sample).await
    }

    /// 订阅行程位置，立即返回最后已知位置（新客户端不空白）
    pub async fn subscribe_to_trip(
        &self,
        actor: &str,
        trip_id: &str,
        connection_id: &str,
        sink: mpsc::Sender<PushEnvelope>,
    ) -> Result<Option<LocationSample>> {
        self.admission.check(actor, EndpointClass::Critical).await?;
        self.broadcast.subscribe(trip_id, connection_id, sink).await?;
        self.location.last_known(trip_id).await
    }

    /// 取消订阅
    pub async fn unsubscribe(&self, trip_id: &str, connection_id: &str) -> Result<()> {
        self.broadcast.unsubscribe(trip_id, connection_id).await
    }

    /// 连接断开：立即移除其全部订阅
    pub async fn disconnect(&self, connection_id: &str) -> Result<()> {
        self.broadcast.disconnect(connection_id).await
    }

    /// 触发 SOS 告警，返回告警 ID
    ///
    /// 失败会明确返回给调用方，端上据此回退到直拨紧急通道
    pub async fn trigger_sos(
        &self,
        actor: &str,
        trip_id: &str,
        triggered_by: TriggerSource,
        location: Option<GeoPoint>,
    ) -> Result<String> {
        self.admission.check(actor, EndpointClass::Critical).await?;
        self.sos
            .coordinator
            .trigger(trip_id, triggered_by, location)
            .await
    }

    /// 运营确认告警
    pub async fn acknowledge_alert(&self, alert_id: &str, operator_id: &str) -> Result<()> {
        self.sos.coordinator.acknowledge(alert_id, operator_id).await
    }

    /// 解除告警
    pub async fn resolve_alert(&self, alert_id: &str, resolution: &str) -> Result<()> {
        self.sos.coordinator.resolve(alert_id, resolution).await
    }

    /// 读取告警
    pub async fn get_alert(&self, alert_id: &str) -> Result<Option<SosAlert>> {
        self.sos.get_alert(alert_id).await
    }

    /// 行程开始：打开订阅窗口与 SOS 资格
    pub async fn trip_started(&self, trip_id: &str) -> Result<()> {
        self.broadcast.open_trip(trip_id).await
    }

    /// 行程结束：关闭订阅窗口、清理订阅与位置缓存
    pub async fn trip_completed(&self, trip_id: &str) -> Result<()> {
        self.broadcast.close_trip(trip_id).await?;
        self.location.forget(trip_id).await
    }

    /// 健康查询：各依赖熔断状态 + 队列深度
    pub async fn health_status(&self) -> Result<HealthStatus> {
        let mut dependencies = vec![ALERT_STORE_DEPENDENCY.to_string()];
        for kind in self.channels.kinds() {
            dependencies.push(kind.dependency_name());
        }
        dependencies.sort();

        Ok(HealthStatus {
            breakers: self.admission.breaker_snapshot(&dependencies).await?,
            queue_depth: self.queue.depth().await?,
        })
    }
}
