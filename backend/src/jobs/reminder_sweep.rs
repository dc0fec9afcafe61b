//! Reminder Sweep Job - posts once-only Slack reminders for expiring exceptions

use crate::clock::Clock;
use crate::exceptions::{ExceptionStore, ReminderRow};
use crate::services::slack::{button_block, section_block, SlackPoster};
use chrono::Duration;
use serde_json::json;
use std::sync::Arc;

pub struct ReminderSweepJob {
    store: Arc<ExceptionStore>,
    slack: Arc<dyn SlackPoster>,
    default_channel: String,
    lead: Duration,
    window: Duration,
    clock: Clock,
}

#[derive(Debug, Default)]
pub struct ReminderSweepResult {
    pub candidates: usize,
    pub sent: usize,
    pub errors: Vec<String>,
}

impl ReminderSweepJob {
    pub fn new(
        store: Arc<ExceptionStore>,
        slack: Arc<dyn SlackPoster>,
        default_channel: impl Into<String>,
        lead: Duration,
        window: Duration,
        clock: Clock,
    ) -> Self {
        Self {
            store,
            slack,
            default_channel: default_channel.into(),
            lead,
            window,
            clock,
        }
    }

    /// Remind once when an expiry falls inside [now + lead - window, now + lead].
    ///
    /// A failed post leaves the row unreminded; the next sweep retries it.
    /// The `remind` event is only appended after a successful post, which
    /// keeps the once-only invariant anchored in the audit table.
    pub async fn run(&self) -> Result<ReminderSweepResult, crate::exceptions::StoreError> {
        let now = (self.clock)();
        let upper = now + self.lead;
        let lower = upper - self.window;

        let rows = self.store.reminder_candidates(lower, upper).await?;
        let mut result = ReminderSweepResult {
            candidates: rows.len(),
            ..Default::default()
        };

        for row in rows {
            match self.send_reminder(&row).await {
                Ok(()) => {
                    let note = format!("expiry {}", row.valid_until.to_rfc3339());
                    self.store
                        .insert_event(row.id, "system", "remind", Some(&note), (self.clock)())
                        .await?;
                    result.sent += 1;
                }
                Err(e) => {
                    tracing::warn!(id = row.id, error = %e, "reminder post failed");
                    result.errors.push(format!("exception {}: {}", row.id, e));
                }
            }
        }

        if result.sent > 0 || !result.errors.is_empty() {
            tracing::info!(
                candidates = result.candidates,
                sent = result.sent,
                errors = result.errors.len(),
                "reminder sweep completed"
            );
        }
        Ok(result)
    }

    async fn send_reminder(&self, row: &ReminderRow) -> Result<(), String> {
        let channel = row
            .slack_channel
            .clone()
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| self.default_channel.clone());
        let text = format!(
            ":alarm_clock: *Exception expiring soon* — {}\nClick *Extend 24h* if still needed.",
            row.valid_until.to_rfc3339()
        );

        let extend_ctx = json!({
            "exc_id": row.id.to_string(),
            "rule_id": row.rule_id,
            "org_id": row.org_id.clone().unwrap_or_default(),
            "subject_type": row.subject_type,
            "subject_id": row.subject_id,
            "hours": "24",
        })
        .to_string();
        let revoke_ctx = json!({
            "exc_id": row.id.to_string(),
            "rule_id": row.rule_id,
            "org_id": row.org_id.clone().unwrap_or_default(),
            "subject_type": row.subject_type,
            "subject_id": row.subject_id,
        })
        .to_string();

        let mut card = json!({
            "channel": channel,
            "text": text,
            "blocks": [
                section_block(&text),
                {
                    "type": "actions",
                    "elements": [
                        button_block("Extend 24h", "primary", "extend24", &extend_ctx),
                        button_block("Revoke", "danger", "revoke", &revoke_ctx),
                    ],
                },
            ],
        });
        if let Some(ts) = row.slack_ts.clone().filter(|t| !t.is_empty()) {
            card["thread_ts"] = json!(ts);
        }

        self.slack
            .post_message(card)
            .await
            .map(|_| ())
            .map_err(|e| e.to_string())
    }
}
