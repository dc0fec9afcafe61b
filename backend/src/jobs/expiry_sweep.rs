//! Expiry Sweep Job - auto-expires approved exceptions past their validity

use crate::clock::Clock;
use crate::exceptions::{ExceptionStore, StoreError};
use std::sync::Arc;

pub struct ExpirySweepJob {
    store: Arc<ExceptionStore>,
    clock: Clock,
}

impl ExpirySweepJob {
    pub fn new(store: Arc<ExceptionStore>, clock: Clock) -> Self {
        Self { store, clock }
    }

    /// Flip every approved row with `valid_until <= now` to expired. The
    /// status update and the `expired` audit event commit atomically.
    pub async fn run(&self) -> Result<Vec<i64>, StoreError> {
        let now = (self.clock)();
        let expired = self.store.expire_due(now).await?;
        if !expired.is_empty() {
            tracing::info!(count = expired.len(), ids = ?expired, "expired exceptions");
        }
        Ok(expired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::fixed_clock;
    use crate::database::{create_pool, init_schema, Dialect};
    use crate::exceptions::NewException;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use gatekeeper_shared::ExceptionStatus;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 10, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn expires_due_rows_with_single_system_event() {
        let pool = create_pool("sqlite::memory:", Dialect::Sqlite).await.unwrap();
        init_schema(&pool, Dialect::Sqlite).await.unwrap();
        let store = Arc::new(ExceptionStore::new(pool, Dialect::Sqlite));

        let id = store
            .create(
                &NewException {
                    rule_id: "r".into(),
                    org_id: None,
                    subject_type: "repo".into(),
                    subject_id: "acme/x".into(),
                    requested_by: "alice".into(),
                    reason: "test".into(),
                    valid_until: Some(t0() + Duration::days(7)),
                },
                t0(),
            )
            .await
            .unwrap();
        store
            .approve(id, t0(), None, "boss", "approved", t0())
            .await
            .unwrap();

        // Just before the cap: nothing happens.
        let job = ExpirySweepJob::new(store.clone(), fixed_clock(t0() + Duration::days(6)));
        assert!(job.run().await.unwrap().is_empty());

        // Just after: one expiry, one event, authored by system.
        let job = ExpirySweepJob::new(
            store.clone(),
            fixed_clock(t0() + Duration::days(7) + Duration::seconds(1)),
        );
        assert_eq!(job.run().await.unwrap(), vec![id]);
        assert_eq!(
            store.load(id).await.unwrap().status,
            ExceptionStatus::Expired
        );

        let events = store.events(id).await.unwrap();
        let expired: Vec<_> = events.iter().filter(|e| e.action == "expired").collect();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].actor, "system");
        assert_eq!(expired[0].note.as_deref(), Some("auto-expired"));
    }
}
