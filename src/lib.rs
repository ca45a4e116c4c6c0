//! Ridex Trip Core 实时核心库
//!
//! 网约车平台的行程位置广播与 SOS 告警管线：
//! - 高频位置样本的摄入、缓存与跨实例扇出
//! - SOS 告警状态机：落库先行、多通道冗余通知、超时升级
//! - 准入控制（限流 + 熔断）与持久化重试投递队列
//!
//! 服务进程无状态，共享状态全部在外部存储（Redis / PostgreSQL），
//! 任意实例摄入的样本可到达任意实例持有的订阅连接。

pub mod admission;
pub mod broadcast;
pub mod channels;
pub mod config;
pub mod error;
pub mod location;
pub mod metrics;
pub mod queue;
pub mod service;
pub mod sos;
pub mod tracing;
pub mod utils;

pub use admission::{AdmissionControl, BreakerState, CircuitBreaker, DependencyHealth, EndpointClass};
pub use broadcast::{BroadcastModule, PushEnvelope, Subscription};
pub use channels::{ChannelKind, ChannelRegistry, NotificationChannel, OutboundNotification};
pub use config::{TripCoreConfig, load_config};
pub use error::{Result, TripCoreError};
pub use location::{LocationModule, LocationSample};
pub use queue::{JobPayload, JobPriority, JobStatus, NotificationJob, QueueModule};
pub use service::{HealthStatus, TripCoreService};
pub use sos::{AlertState, GeoPoint, SosAlert, SosModule, TriggerSource};
