//! SOS 告警仓储
//!
//! 告警记录的持久化层。`insert` 的确认先于任何通知动作，
//! 通道结果的追加是仓储上的原子操作（与协调器的状态更新并发）。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use sqlx::{PgPool, Row, postgres::PgRow};

use crate::error::Result;
use crate::sos::alert::{AlertState, ChannelResult, GeoPoint, SosAlert, TriggerSource};

/// 告警仓储接口
#[async_trait]
pub trait AlertRepository: Send + Sync {
    /// 落库新告警；返回成功即可独立读出
    async fn insert(&self, alert: &SosAlert) -> Result<()>;

    /// 读取告警
    async fn load(&self, alert_id: &str) -> Result<Option<SosAlert>>;

    /// 查询行程当前活跃（未解除）的告警
    async fn find_active_by_trip(&self, trip_id: &str) -> Result<Option<SosAlert>>;

    /// 更新状态
    async fn update_state(&self, alert_id: &str, state: AlertState) -> Result<()>;

    /// 记录确认
    async fn mark_acknowledged(&self, alert_id: &str, operator_id: &str) -> Result<()>;

    /// 记录解除（终态，解除原因必填）
    async fn mark_resolved(
        &self,
        alert_id: &str,
        resolution: &str,
        resolved_at: DateTime<Utc>,
    ) -> Result<()>;

    /// 追加一条通道投递结果
    async fn append_channel_result(&self, alert_id: &str, result: &ChannelResult) -> Result<()>;
}

/// PostgreSQL 告警仓储
pub struct PostgresAlertRepository {
    pool: PgPool,
}

impl PostgresAlertRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn alert_from_row(row: &PgRow) -> Result<SosAlert> {
        let location: Option<serde_json::Value> = row.try_get("location")?;
        let location = match location {
            Some(value) => Some(serde_json::from_value::<GeoPoint>(value)?),
            None => None,
        };
        let channel_results: serde_json::Value = row.try_get("channel_results")?;
        let channel_results: Vec<ChannelResult> = serde_json::from_value(channel_results)?;
        let state: String = row.try_get("state")?;
        let triggered_by: String = row.try_get("triggered_by")?;

        Ok(SosAlert {
            alert_id: row.try_get("alert_id")?,
            trip_id: row.try_get("trip_id")?,
            triggered_by: TriggerSource::parse(&triggered_by),
            location,
            triggered_at: row.try_get("triggered_at")?,
            state: AlertState::parse(&state),
            channel_results,
            acknowledged_by: row.try_get("acknowledged_by")?,
            resolved_at: row.try_get("resolved_at")?,
            resolution: row.try_get("resolution")?,
        })
    }
}

#[async_trait]
impl AlertRepository for PostgresAlertRepository {
    async fn insert(&self, alert: &SosAlert) -> Result<()> {
        let location = match &alert.location {
            Some(point) => Some(serde_json::to_value(point)?),
            None => None,
        };
        let channel_results = serde_json::to_value(&alert.channel_results)?;

        sqlx::query(
            "INSERT INTO sos_alerts
             (alert_id, trip_id, triggered_by, location, triggered_at, state, channel_results,
              acknowledged_by, resolved_at, resolution)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(&alert.alert_id)
        .bind(&alert.trip_id)
        .bind(alert.triggered_by.as_str())
        .bind(location)
        .bind(alert.triggered_at)
        .bind(alert.state.as_str())
        .bind(channel_results)
        .bind(&alert.acknowledged_by)
        .bind(alert.resolved_at)
        .bind(&alert.resolution)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load(&self, alert_id: &str) -> Result<Option<SosAlert>> {
        let row = sqlx::query(
            "SELECT alert_id, trip_id, triggered_by, location, triggered_at, state,
                    channel_results, acknowledged_by, resolved_at, resolution
             FROM sos_alerts WHERE alert_id = $1",
        )
        .bind(alert_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(Self::alert_from_row(&row)?)),
            None => Ok(None),
        }
    }

    async fn find_active_by_trip(&self, trip_id: &str) -> Result<Option<SosAlert>> {
        let row = sqlx::query(
            "SELECT alert_id, trip_id, triggered_by, location, triggered_at, state,
                    channel_results, acknowledged_by, resolved_at, resolution
             FROM sos_alerts
             WHERE trip_id = $1 AND state != 'resolved'
             ORDER BY triggered_at DESC LIMIT 1",
        )
        .bind(trip_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(Self::alert_from_row(&row)?)),
            None => Ok(None),
        }
    }

    async fn update_state(&self, alert_id: &str, state: AlertState) -> Result<()> {
        sqlx::query("UPDATE sos_alerts SET state = $2 WHERE alert_id = $1")
            .bind(alert_id)
            .bind(state.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn mark_acknowledged(&self, alert_id: &str, operator_id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE sos_alerts SET state = 'acknowledged', acknowledged_by = $2 WHERE alert_id = $1",
        )
        .bind(alert_id)
        .bind(operator_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_resolved(
        &self,
        alert_id: &str,
        resolution: &str,
        resolved_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE sos_alerts SET state = 'resolved', resolution = $2, resolved_at = $3
             WHERE alert_id = $1",
        )
        .bind(alert_id)
        .bind(resolution)
        .bind(resolved_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn append_channel_result(&self, alert_id: &str, result: &ChannelResult) -> Result<()> {
        let entry = serde_json::to_value(result)?;
        // JSONB 原子追加，与状态更新并发安全
        sqlx::query(
            "UPDATE sos_alerts SET channel_results = channel_results || $2::jsonb
             WHERE alert_id = $1",
        )
        .bind(alert_id)
        .bind(entry)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// SOS 告警表初始化
pub async fn init_sos_alerts_table(pool: &PgPool) -> Result<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS sos_alerts (
            alert_id TEXT PRIMARY KEY,
            trip_id TEXT NOT NULL,
            triggered_by TEXT NOT NULL,
            location JSONB,
            triggered_at TIMESTAMPTZ NOT NULL,
            state TEXT NOT NULL,
            channel_results JSONB NOT NULL DEFAULT '[]'::jsonb,
            acknowledged_by TEXT,
            resolved_at TIMESTAMPTZ,
            resolution TEXT
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_sos_alerts_trip_active
         ON sos_alerts (trip_id) WHERE state != 'resolved'",
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// 内存告警仓储（单进程部署与测试用）
pub struct MemoryAlertRepository {
    alerts: DashMap<String, SosAlert>,
}

impl MemoryAlertRepository {
    pub fn new() -> Self {
        Self {
            alerts: DashMap::new(),
        }
    }
}

impl Default for MemoryAlertRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AlertRepository for MemoryAlertRepository {
    async fn insert(&self, alert: &SosAlert) -> Result<()> {
        self.alerts.insert(alert.alert_id.clone(), alert.clone());
        Ok(())
    }

    async fn load(&self, alert_id: &str) -> Result<Option<SosAlert>> {
        Ok(self.alerts.get(alert_id).map(|alert| alert.clone()))
    }

    async fn find_active_by_trip(&self, trip_id: &str) -> Result<Option<SosAlert>> {
        Ok(self
            .alerts
            .iter()
            .filter(|entry| entry.trip_id == trip_id && entry.is_active())
            .max_by_key(|entry| entry.triggered_at)
            .map(|entry| entry.clone()))
    }

    async fn update_state(&self, alert_id: &str, state: AlertState) -> Result<()> {
        if let Some(mut alert) = self.alerts.get_mut(alert_id) {
            alert.state = state;
        }
        Ok(())
    }

    async fn mark_acknowledged(&self, alert_id: &str, operator_id: &str) -> Result<()> {
        if let Some(mut alert) = self.alerts.get_mut(alert_id) {
            alert.state = AlertState::Acknowledged;
            alert.acknowledged_by = Some(operator_id.to_string());
        }
        Ok(())
    }

    async fn mark_resolved(
        &self,
        alert_id: &str,
        resolution: &str,
        resolved_at: DateTime<Utc>,
    ) -> Result<()> {
        if let Some(mut alert) = self.alerts.get_mut(alert_id) {
            alert.state = AlertState::Resolved;
            alert.resolution = Some(resolution.to_string());
            alert.resolved_at = Some(resolved_at);
        }
        Ok(())
    }

    async fn append_channel_result(&self, alert_id: &str, result: &ChannelResult) -> Result<()> {
        if let Some(mut alert) = self.alerts.get_mut(alert_id) {
            alert.channel_results.push(result.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_insert_then_independently_readable() -> Result<()> {
        let repository = MemoryAlertRepository::new();
        let mut alert = SosAlert::new("t1", TriggerSource::Passenger, None);
        alert.state = AlertState::Persisted;

        repository.insert(&alert).await?;

        let loaded = repository.load(&alert.alert_id).await?.unwrap();
        assert_eq!(loaded.state, AlertState::Persisted);
        assert_eq!(loaded.trip_id, "t1");
        Ok(())
    }

    #[tokio::test]
    async fn test_find_active_ignores_resolved() -> Result<()> {
        let repository = MemoryAlertRepository::new();

        let mut resolved = SosAlert::new("t1", TriggerSource::Driver, None);
        resolved.state = AlertState::Resolved;
        resolved.resolution = Some("false alarm".to_string());
        repository.insert(&resolved).await?;
        assert!(repository.find_active_by_trip("t1").await?.is_none());

        let mut active = SosAlert::new("t1", TriggerSource::Driver, None);
        active.state = AlertState::Notifying;
        repository.insert(&active).await?;

        let found = repository.find_active_by_trip("t1").await?.unwrap();
        assert_eq!(found.alert_id, active.alert_id);
        Ok(())
    }
}
