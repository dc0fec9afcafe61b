//! Persistence for exception records and their lifecycle events.
//!
//! SQL is dialect-neutral: statements are rendered with the pool's
//! placeholder style, and time columns hold UTC RFC 3339 text so ordering
//! works identically on SQLite and Postgres. Reads tolerate the handful of
//! textual layouts the embedded store has historically produced.

use crate::database::Dialect;
use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use gatekeeper_shared::{ActiveException, Exception, ExceptionEvent, ExceptionStatus};
use sqlx::{AnyPool, Row};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Db(#[from] sqlx::Error),

    #[error("unknown time format: {0}")]
    Time(String),

    #[error("unknown status: {0}")]
    Status(String),
}

impl From<StoreError> for crate::error::AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Db(sqlx::Error::RowNotFound) => {
                crate::error::AppError::NotFound("Exception".to_string())
            }
            other => crate::error::AppError::DatabaseError(other.to_string()),
        }
    }
}

/// Fields required to open a new exception request.
#[derive(Debug, Clone)]
pub struct NewException {
    pub rule_id: String,
    pub org_id: Option<String>,
    pub subject_type: String,
    pub subject_id: String,
    pub requested_by: String,
    pub reason: String,
    pub valid_until: Option<DateTime<Utc>>,
}

/// Row projection consumed by the reminder sweep.
#[derive(Debug, Clone)]
pub struct ReminderRow {
    pub id: i64,
    pub rule_id: String,
    pub org_id: Option<String>,
    pub subject_type: String,
    pub subject_id: String,
    pub valid_until: DateTime<Utc>,
    pub slack_channel: Option<String>,
    pub slack_ts: Option<String>,
}

pub struct ExceptionStore {
    pool: AnyPool,
    dialect: Dialect,
}

/// Serialize a timestamp for storage.
pub fn format_time(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Parse a stored timestamp, accepting RFC 3339 (with or without fractional
/// seconds) and the space-separated layouts SQLite defaults produce.
pub fn parse_time(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    let raw = raw.trim();
    if let Ok(t) = DateTime::parse_from_rfc3339(raw) {
        return Ok(t.with_timezone(&Utc));
    }
    if let Ok(t) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
        return Ok(t.and_utc());
    }
    if let Ok(t) = DateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%:z") {
        return Ok(t.with_timezone(&Utc));
    }
    Err(StoreError::Time(raw.to_string()))
}

fn parse_time_opt(raw: Option<String>) -> Result<Option<DateTime<Utc>>, StoreError> {
    match raw {
        None => Ok(None),
        Some(s) if s.trim().is_empty() => Ok(None),
        Some(s) => parse_time(&s).map(Some),
    }
}

impl ExceptionStore {
    pub fn new(pool: AnyPool, dialect: Dialect) -> Self {
        Self { pool, dialect }
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    fn ph(&self, n: usize) -> String {
        self.dialect.placeholder(n)
    }

    /// Insert a pending exception plus its `request` audit event in one
    /// transaction. Returns the assigned id.
    pub async fn create(&self, req: &NewException, now: DateTime<Utc>) -> Result<i64, StoreError> {
        let mut tx = self.pool.begin().await?;

        let sql = format!(
            "INSERT INTO exceptions \
             (rule_id, org_id, subject_type, subject_id, requested_by, reason, status, \
              valid_until, created_at, updated_at) \
             VALUES ({}, {}, {}, {}, {}, {}, 'pending', {}, {}, {}) RETURNING id",
            self.ph(1),
            self.ph(2),
            self.ph(3),
            self.ph(4),
            self.ph(5),
            self.ph(6),
            self.ph(7),
            self.ph(8),
            self.ph(9),
        );
        let row = sqlx::query(&sql)
            .bind(&req.rule_id)
            .bind(&req.org_id)
            .bind(&req.subject_type)
            .bind(&req.subject_id)
            .bind(&req.requested_by)
            .bind(&req.reason)
            .bind(req.valid_until.map(format_time))
            .bind(format_time(now))
            .bind(format_time(now))
            .fetch_one(&mut *tx)
            .await?;
        let id: i64 = row.try_get(0)?;

        self.insert_event_sql(&mut tx, id, &req.requested_by, "request", Some(&req.reason), now)
            .await?;

        tx.commit().await?;
        Ok(id)
    }

    pub async fn load(&self, id: i64) -> Result<Exception, StoreError> {
        let sql = format!(
            "SELECT id, rule_id, org_id, subject_type, subject_id, requested_by, reason, \
             status, valid_from, valid_until, created_at, updated_at, slack_channel, slack_ts \
             FROM exceptions WHERE id={}",
            self.ph(1)
        );
        let row = sqlx::query(&sql).bind(id).fetch_one(&self.pool).await?;
        row_to_exception(&row)
    }

    /// Set a terminal-ish status and append the matching audit event.
    pub async fn set_status(
        &self,
        id: i64,
        status: ExceptionStatus,
        actor: &str,
        action: &str,
        note: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        let sql = format!(
            "UPDATE exceptions SET status={}, updated_at={} WHERE id={}",
            self.ph(1),
            self.ph(2),
            self.ph(3)
        );
        sqlx::query(&sql)
            .bind(status.as_str())
            .bind(format_time(now))
            .bind(id)
            .execute(&mut *tx)
            .await?;
        self.insert_event_sql(&mut tx, id, actor, action, note, now).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Persist the approval: status, valid_from, and (when supplied) the new
    /// valid_until, COALESCEd onto any existing value.
    pub async fn approve(
        &self,
        id: i64,
        valid_from: DateTime<Utc>,
        valid_until: Option<DateTime<Utc>>,
        actor: &str,
        note: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        let sql = format!(
            "UPDATE exceptions SET status='approved', valid_from={}, \
             valid_until=COALESCE({}, valid_until), updated_at={} WHERE id={}",
            self.ph(1),
            self.ph(2),
            self.ph(3),
            self.ph(4)
        );
        sqlx::query(&sql)
            .bind(format_time(valid_from))
            .bind(valid_until.map(format_time))
            .bind(format_time(now))
            .bind(id)
            .execute(&mut *tx)
            .await?;
        self.insert_event_sql(&mut tx, id, actor, "approve", Some(note), now)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Persist a new expiry from an extension and append the `extend` event.
    pub async fn extend(
        &self,
        id: i64,
        valid_until: DateTime<Utc>,
        actor: &str,
        note: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        let sql = format!(
            "UPDATE exceptions SET valid_until={}, updated_at={} WHERE id={}",
            self.ph(1),
            self.ph(2),
            self.ph(3)
        );
        sqlx::query(&sql)
            .bind(format_time(valid_until))
            .bind(format_time(now))
            .bind(id)
            .execute(&mut *tx)
            .await?;
        self.insert_event_sql(&mut tx, id, actor, "extend", Some(note), now)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn insert_event(
        &self,
        id: i64,
        actor: &str,
        action: &str,
        note: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let sql = format!(
            "INSERT INTO exception_events(exception_id, actor, action, note, at) \
             VALUES ({}, {}, {}, {}, {})",
            self.ph(1),
            self.ph(2),
            self.ph(3),
            self.ph(4),
            self.ph(5)
        );
        sqlx::query(&sql)
            .bind(id)
            .bind(actor)
            .bind(action)
            .bind(note)
            .bind(format_time(at))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn insert_event_sql(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Any>,
        id: i64,
        actor: &str,
        action: &str,
        note: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let sql = format!(
            "INSERT INTO exception_events(exception_id, actor, action, note, at) \
             VALUES ({}, {}, {}, {}, {})",
            self.ph(1),
            self.ph(2),
            self.ph(3),
            self.ph(4),
            self.ph(5)
        );
        sqlx::query(&sql)
            .bind(id)
            .bind(actor)
            .bind(action)
            .bind(note)
            .bind(format_time(at))
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    /// Most recent event time for an action on one exception. Source of
    /// truth for the extension backoff, so it survives restarts.
    pub async fn last_event_time(
        &self,
        id: i64,
        action: &str,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let sql = format!(
            "SELECT MAX(at) FROM exception_events WHERE exception_id={} AND action={}",
            self.ph(1),
            self.ph(2)
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .bind(action)
            .fetch_one(&self.pool)
            .await?;
        let raw: Option<String> = row.try_get(0)?;
        parse_time_opt(raw)
    }

    pub async fn events(&self, id: i64) -> Result<Vec<ExceptionEvent>, StoreError> {
        let sql = format!(
            "SELECT id, exception_id, actor, action, note, at FROM exception_events \
             WHERE exception_id={} ORDER BY at ASC, id ASC",
            self.ph(1)
        );
        let rows = sqlx::query(&sql).bind(id).fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| {
                Ok(ExceptionEvent {
                    id: row.try_get("id")?,
                    exception_id: row.try_get("exception_id")?,
                    actor: row
                        .try_get::<Option<String>, _>("actor")?
                        .unwrap_or_default(),
                    action: row.try_get("action")?,
                    note: row.try_get("note")?,
                    at: parse_time(&row.try_get::<String, _>("at")?)?,
                })
            })
            .collect()
    }

    /// Approved exceptions for a rule (optionally one org), null expiries
    /// last, id as the tie-break. Returns one page plus the total count.
    pub async fn list_active(
        &self,
        rule_id: &str,
        org_id: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<ActiveException>, i64), StoreError> {
        let mut filter = format!("status='approved' AND rule_id={}", self.ph(1));
        if org_id.is_some() {
            filter.push_str(&format!(" AND org_id={}", self.ph(2)));
        }

        let count_sql = format!("SELECT COUNT(*) FROM exceptions WHERE {}", filter);
        let mut count_query = sqlx::query(&count_sql).bind(rule_id);
        if let Some(org) = org_id {
            count_query = count_query.bind(org);
        }
        let total: i64 = count_query.fetch_one(&self.pool).await?.try_get(0)?;

        let next = if org_id.is_some() { 3 } else { 2 };
        let sql = format!(
            "SELECT id, subject_type, subject_id, requested_by, valid_until \
             FROM exceptions WHERE {} \
             ORDER BY valid_until IS NULL, valid_until ASC, id ASC \
             LIMIT {} OFFSET {}",
            filter,
            self.ph(next),
            self.ph(next + 1)
        );
        let mut query = sqlx::query(&sql).bind(rule_id);
        if let Some(org) = org_id {
            query = query.bind(org);
        }
        let rows = query.bind(limit).bind(offset).fetch_all(&self.pool).await?;

        let mut items = Vec::with_capacity(rows.len());
        for row in &rows {
            items.push(ActiveException {
                id: row.try_get("id")?,
                subject_type: row
                    .try_get::<Option<String>, _>("subject_type")?
                    .unwrap_or_default(),
                subject_id: row
                    .try_get::<Option<String>, _>("subject_id")?
                    .unwrap_or_default(),
                requested_by: row.try_get("requested_by")?,
                valid_until: parse_time_opt(row.try_get("valid_until")?)?,
            });
        }
        Ok((items, total))
    }

    /// Full rows by status, newest first. Ops tooling surface.
    pub async fn list_by_status(
        &self,
        status: ExceptionStatus,
    ) -> Result<Vec<Exception>, StoreError> {
        let sql = format!(
            "SELECT id, rule_id, org_id, subject_type, subject_id, requested_by, reason, \
             status, valid_from, valid_until, created_at, updated_at, slack_channel, slack_ts \
             FROM exceptions WHERE status={} ORDER BY created_at DESC, id DESC",
            self.ph(1)
        );
        let rows = sqlx::query(&sql)
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_exception).collect()
    }

    /// Transition every overdue approved row to expired, appending one
    /// `expired` event per row, all in one transaction. Returns the ids.
    pub async fn expire_due(&self, now: DateTime<Utc>) -> Result<Vec<i64>, StoreError> {
        let mut tx = self.pool.begin().await?;

        let select = format!(
            "SELECT id FROM exceptions \
             WHERE status='approved' AND valid_until IS NOT NULL AND valid_until <= {}",
            self.ph(1)
        );
        let rows = sqlx::query(&select)
            .bind(format_time(now))
            .fetch_all(&mut *tx)
            .await?;
        let ids: Vec<i64> = rows
            .iter()
            .map(|row| row.try_get::<i64, _>(0))
            .collect::<Result<_, _>>()?;

        for id in &ids {
            let update = format!(
                "UPDATE exceptions SET status='expired', updated_at={} WHERE id={}",
                self.ph(1),
                self.ph(2)
            );
            sqlx::query(&update)
                .bind(format_time(now))
                .bind(id)
                .execute(&mut *tx)
                .await?;
            self.insert_event_sql(&mut tx, *id, "system", "expired", Some("auto-expired"), now)
                .await?;
        }

        tx.commit().await?;
        Ok(ids)
    }

    /// Approved exceptions expiring inside [lower, upper] that have never
    /// been reminded.
    pub async fn reminder_candidates(
        &self,
        lower: DateTime<Utc>,
        upper: DateTime<Utc>,
    ) -> Result<Vec<ReminderRow>, StoreError> {
        let sql = format!(
            "SELECT e.id, e.rule_id, e.org_id, e.subject_type, e.subject_id, e.valid_until, \
             e.slack_channel, e.slack_ts \
             FROM exceptions e \
             WHERE e.status='approved' AND e.valid_until IS NOT NULL \
             AND e.valid_until >= {} AND e.valid_until <= {} \
             AND NOT EXISTS (SELECT 1 FROM exception_events ev \
                             WHERE ev.exception_id=e.id AND ev.action='remind') \
             ORDER BY e.valid_until ASC",
            self.ph(1),
            self.ph(2)
        );
        let rows = sqlx::query(&sql)
            .bind(format_time(lower))
            .bind(format_time(upper))
            .fetch_all(&self.pool)
            .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let valid_until = parse_time(&row.try_get::<String, _>("valid_until")?)?;
            out.push(ReminderRow {
                id: row.try_get("id")?,
                rule_id: row.try_get("rule_id")?,
                org_id: row.try_get("org_id")?,
                subject_type: row
                    .try_get::<Option<String>, _>("subject_type")?
                    .unwrap_or_default(),
                subject_id: row
                    .try_get::<Option<String>, _>("subject_id")?
                    .unwrap_or_default(),
                valid_until,
                slack_channel: row.try_get("slack_channel")?,
                slack_ts: row.try_get("slack_ts")?,
            });
        }
        Ok(out)
    }

    /// Record the Slack message coordinates of the approval card so later
    /// reminders can thread onto it.
    pub async fn record_slack_thread(
        &self,
        id: i64,
        channel: &str,
        ts: &str,
    ) -> Result<(), StoreError> {
        let sql = format!(
            "UPDATE exceptions SET slack_channel={}, slack_ts={} WHERE id={}",
            self.ph(1),
            self.ph(2),
            self.ph(3)
        );
        sqlx::query(&sql)
            .bind(channel)
            .bind(ts)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn row_to_exception(row: &sqlx::any::AnyRow) -> Result<Exception, StoreError> {
    let status_raw: String = row.try_get("status")?;
    let status =
        ExceptionStatus::parse(&status_raw).ok_or_else(|| StoreError::Status(status_raw))?;
    Ok(Exception {
        id: row.try_get("id")?,
        rule_id: row.try_get("rule_id")?,
        org_id: row.try_get("org_id")?,
        subject_type: row
            .try_get::<Option<String>, _>("subject_type")?
            .unwrap_or_default(),
        subject_id: row
            .try_get::<Option<String>, _>("subject_id")?
            .unwrap_or_default(),
        requested_by: row.try_get("requested_by")?,
        reason: row.try_get("reason")?,
        status,
        valid_from: parse_time_opt(row.try_get("valid_from")?)?,
        valid_until: parse_time_opt(row.try_get("valid_until")?)?,
        created_at: parse_time(&row.try_get::<String, _>("created_at")?)?,
        updated_at: parse_time(&row.try_get::<String, _>("updated_at")?)?,
        slack_channel: row.try_get("slack_channel")?,
        slack_ts: row.try_get("slack_ts")?,
    })
}
