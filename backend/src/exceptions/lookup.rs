//! Coverage checks: is a rule/subject pair currently waived?

use super::store::{format_time, ExceptionStore, StoreError};
use chrono::{DateTime, Utc};
use sqlx::Row;

impl ExceptionStore {
    /// Return the id of an approved exception covering the subject at `now`,
    /// if one exists. An open `valid_from`/`valid_until` counts as covering.
    pub async fn is_excepted(
        &self,
        rule_id: &str,
        subject_type: &str,
        subject_id: &str,
        org_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Option<i64>, StoreError> {
        let dialect = |n| self.dialect().placeholder(n);
        let mut filter = format!(
            "rule_id={} AND subject_type={} AND subject_id={} AND status='approved' \
             AND (valid_from IS NULL OR valid_from <= {}) \
             AND (valid_until IS NULL OR valid_until >= {})",
            dialect(1),
            dialect(2),
            dialect(3),
            dialect(4),
            dialect(5),
        );
        if org_id.is_some() {
            filter.push_str(&format!(" AND org_id={}", dialect(6)));
        }
        let sql = format!("SELECT id FROM exceptions WHERE {} LIMIT 1", filter);

        let mut query = sqlx::query(&sql)
            .bind(rule_id)
            .bind(subject_type)
            .bind(subject_id)
            .bind(format_time(now))
            .bind(format_time(now));
        if let Some(org) = org_id {
            query = query.bind(org);
        }

        match query.fetch_optional(self.pool()).await? {
            Some(row) => Ok(Some(row.try_get(0)?)),
            None => Ok(None),
        }
    }
}
