//! Webhook 通知通道
//!
//! 经 HTTP POST 把通知转交给各通道供应商的网关服务

use std::collections::HashMap;

use reqwest::Client;
use serde::Serialize;

use crate::channels::{ChannelKind, NotificationChannel, OutboundNotification};
use crate::error::{Result, TripCoreError};
use crate::utils::epoch_millis;

/// Webhook 通道配置
#[derive(Debug, Clone)]
pub struct WebhookChannelConfig {
    /// 供应商端点
    pub endpoint: String,
    /// 签名密钥（置入 x-ridex-signature 请求头）
    pub secret: Option<String>,
    /// 附加请求头
    pub headers: HashMap<String, String>,
}

/// Webhook 通道工厂
///
/// 复用同一个 HTTP 客户端构建多个通道适配器
#[derive(Clone)]
pub struct WebhookChannelFactory {
    client: Client,
}

impl WebhookChannelFactory {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .use_rustls_tls()
            .build()
            .map_err(|err| TripCoreError::Config(format!("failed to build http client: {}", err)))?;
        Ok(Self { client })
    }

    /// 构建通道适配器
    pub fn build(&self, kind: ChannelKind, config: WebhookChannelConfig) -> WebhookChannel {
        WebhookChannel {
            client: self.client.clone(),
            kind,
            config,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WebhookRequest<'a> {
    channel: &'a str,
    trip_id: &'a str,
    alert_id: Option<&'a str>,
    title: &'a str,
    body: &'a serde_json::Value,
    ts: i64,
}

/// Webhook 通道适配器
pub struct WebhookChannel {
    client: Client,
    kind: ChannelKind,
    config: WebhookChannelConfig,
}

#[async_trait::async_trait]
impl NotificationChannel for WebhookChannel {
    fn kind(&self) -> ChannelKind {
        self.kind
    }

    async fn deliver(&self, notification: &OutboundNotification) -> Result<()> {
        let request_body = WebhookRequest {
            channel: self.kind.as_str(),
            trip_id: &notification.trip_id,
            alert_id: notification.alert_id.as_deref(),
            title: &notification.title,
            body: &notification.body,
            ts: epoch_millis(),
        };

        let mut builder = self
            .client
            .post(&self.config.endpoint)
            .header("content-type", "application/json");
        if let Some(secret) = &self.config.secret {
            builder = builder.header("x-ridex-signature", secret);
        }
        for (key, value) in &self.config.headers {
            builder = builder.header(key, value);
        }

        let response = builder.json(&request_body).send().await.map_err(|err| {
            TripCoreError::ChannelDelivery(format!(
                "{} webhook request failed: {}",
                self.kind.as_str(),
                err
            ))
        })?;

        if !response.status().is_success() {
            return Err(TripCoreError::ChannelDelivery(format!(
                "{} webhook returned {}",
                self.kind.as_str(),
                response.status()
            )));
        }
        Ok(())
    }
}
