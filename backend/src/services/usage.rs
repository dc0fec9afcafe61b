//! Thin usage-event recorder.

use crate::database::Dialect;
use crate::exceptions::store::format_time;
use chrono::{DateTime, Utc};
use sqlx::AnyPool;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum UsageError {
    #[error("usage: {0}")]
    Invalid(&'static str),

    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

/// Coarse-grained result of a usage event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Ok,
    Warn,
    Error,
}

impl Outcome {
    fn as_str(&self) -> &'static str {
        match self {
            Outcome::Ok => "ok",
            Outcome::Warn => "warn",
            Outcome::Error => "error",
        }
    }
}

/// Normalized telemetry payload inserted into usage_events.
#[derive(Debug, Clone)]
pub struct UsageEvent {
    pub timestamp: Option<DateTime<Utc>>,
    pub org_id: i64,
    pub user_id: i64,
    pub feature: String,
    pub tool: String,
    pub count: i64,
    pub latency_ms: Option<i64>,
    pub outcome: Outcome,
    pub sampling_rate: f64,
}

impl UsageEvent {
    pub fn new(org_id: i64, user_id: i64, feature: &str, tool: &str, ok: bool) -> Self {
        Self {
            timestamp: None,
            org_id,
            user_id,
            feature: feature.to_string(),
            tool: tool.to_string(),
            count: 1,
            latency_ms: None,
            outcome: if ok { Outcome::Ok } else { Outcome::Error },
            sampling_rate: 1.0,
        }
    }

    fn validate(&self) -> Result<(), UsageError> {
        if self.org_id == 0 {
            return Err(UsageError::Invalid("org id is required"));
        }
        if self.user_id == 0 {
            return Err(UsageError::Invalid("user id is required"));
        }
        if self.feature.is_empty() {
            return Err(UsageError::Invalid("feature is required"));
        }
        if self.tool.is_empty() {
            return Err(UsageError::Invalid("tool is required"));
        }
        if self.count < 0 {
            return Err(UsageError::Invalid("count must be non-negative"));
        }
        if self.sampling_rate <= 0.0 {
            return Err(UsageError::Invalid("sampling rate must be positive"));
        }
        Ok(())
    }
}

/// Persist a single usage event row.
pub async fn track_usage(
    pool: &AnyPool,
    dialect: Dialect,
    event: &UsageEvent,
) -> Result<(), UsageError> {
    event.validate()?;
    let ts = event.timestamp.unwrap_or_else(Utc::now);
    let count = if event.count == 0 { 1 } else { event.count };

    let sql = format!(
        "INSERT INTO usage_events \
         (ts, org_id, user_id, feature, tool, count, latency_ms, outcome, sampling_rate) \
         VALUES ({}, {}, {}, {}, {}, {}, {}, {}, {})",
        dialect.placeholder(1),
        dialect.placeholder(2),
        dialect.placeholder(3),
        dialect.placeholder(4),
        dialect.placeholder(5),
        dialect.placeholder(6),
        dialect.placeholder(7),
        dialect.placeholder(8),
        dialect.placeholder(9),
    );
    sqlx::query(&sql)
        .bind(format_time(ts))
        .bind(event.org_id)
        .bind(event.user_id)
        .bind(&event.feature)
        .bind(&event.tool)
        .bind(count)
        .bind(event.latency_ms)
        .bind(event.outcome.as_str())
        .bind(event.sampling_rate)
        .execute(pool)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{create_pool, init_schema};
    use sqlx::Row;

    #[tokio::test]
    async fn tracks_a_valid_event() {
        let pool = create_pool("sqlite::memory:", Dialect::Sqlite).await.unwrap();
        init_schema(&pool, Dialect::Sqlite).await.unwrap();

        let mut event = UsageEvent::new(7, 42, "harness", "mirror", true);
        event.latency_ms = Some(12);
        track_usage(&pool, Dialect::Sqlite, &event).await.unwrap();

        let row = sqlx::query("SELECT feature, tool, count, outcome FROM usage_events")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(row.try_get::<String, _>("feature").unwrap(), "harness");
        assert_eq!(row.try_get::<i64, _>("count").unwrap(), 1);
        assert_eq!(row.try_get::<String, _>("outcome").unwrap(), "ok");
    }

    #[tokio::test]
    async fn rejects_malformed_events() {
        let pool = create_pool("sqlite::memory:", Dialect::Sqlite).await.unwrap();
        init_schema(&pool, Dialect::Sqlite).await.unwrap();

        let event = UsageEvent::new(0, 42, "harness", "mirror", true);
        let err = track_usage(&pool, Dialect::Sqlite, &event).await.unwrap_err();
        assert!(matches!(err, UsageError::Invalid(_)));

        let mut event = UsageEvent::new(7, 42, "harness", "mirror", true);
        event.sampling_rate = 0.0;
        let err = track_usage(&pool, Dialect::Sqlite, &event).await.unwrap_err();
        assert!(matches!(err, UsageError::Invalid(_)));
    }
}
