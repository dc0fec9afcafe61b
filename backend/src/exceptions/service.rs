//! Exception lifecycle state machine.
//!
//! pending -> approved -> (extended)* -> expired, with terminal denied and
//! revoked. Approvals cap validity at seven days from first approval;
//! extensions enforce a thirty-minute backoff sourced from the audit table.

use super::store::{ExceptionStore, NewException};
use crate::clock::{system_clock, Clock};
use crate::error::{ApiResult, AppError};
use crate::pagination::PaginationParams;
use crate::services::slack::{button_block, section_block, SlackPoster};
use chrono::{DateTime, Duration, Utc};
use gatekeeper_shared::{
    ActiveExceptionPage, Exception, ExceptionStatus,
};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;

const EXTEND_DEFAULT_HOURS: i64 = 24;
const EXTEND_MIN_HOURS: i64 = 1;
const EXTEND_MAX_HOURS: i64 = 72;

/// Minimum gap between extensions on one exception.
fn extend_backoff() -> Duration {
    Duration::minutes(30)
}

/// Hard cap on exception validity, counted from first approval.
pub fn max_validity() -> Duration {
    Duration::days(7)
}

#[derive(Debug, Clone)]
pub struct CreateExceptionRequest {
    pub rule_id: String,
    pub org_id: Option<String>,
    pub subject_type: String,
    pub subject_id: String,
    pub requested_by: String,
    pub reason: String,
    pub valid_until: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CreatedException {
    pub id: i64,
    pub status: ExceptionStatus,
}

#[derive(Debug, Serialize)]
pub struct ApprovalOutcome {
    pub id: i64,
    pub status: ExceptionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub valid_from: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub valid_until: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct DecisionOutcome {
    pub id: i64,
    pub status: ExceptionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ExtendOutcome {
    pub id: i64,
    pub status: ExceptionStatus,
    pub valid_until: DateTime<Utc>,
    pub capped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

pub struct ExceptionService {
    store: Arc<ExceptionStore>,
    slack: Arc<dyn SlackPoster>,
    /// Allow-list of approver identifiers; empty admits any non-empty actor.
    approvers: Vec<String>,
    default_channel: String,
    clock: Clock,
}

impl ExceptionService {
    pub fn new(
        store: Arc<ExceptionStore>,
        slack: Arc<dyn SlackPoster>,
        approvers: Vec<String>,
        default_channel: impl Into<String>,
    ) -> Self {
        Self {
            store,
            slack,
            approvers,
            default_channel: default_channel.into(),
            clock: system_clock(),
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn store(&self) -> &Arc<ExceptionStore> {
        &self.store
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    fn authorize<'a>(&self, actor: &'a str) -> ApiResult<&'a str> {
        let actor = actor.trim();
        if actor.is_empty() {
            return Err(AppError::Forbidden("actor is required".to_string()));
        }
        if !self.approvers.is_empty() && !self.approvers.iter().any(|a| a == actor) {
            return Err(AppError::Forbidden(format!(
                "{} is not on the approver allow-list",
                actor
            )));
        }
        Ok(actor)
    }

    /// Open a new pending exception.
    pub async fn create(&self, req: CreateExceptionRequest) -> ApiResult<CreatedException> {
        let valid_until = match req.valid_until.as_deref().filter(|s| !s.is_empty()) {
            Some(raw) => Some(
                DateTime::parse_from_rfc3339(raw)
                    .map_err(|_| {
                        AppError::BadRequest(format!("valid_until must be RFC3339, got {:?}", raw))
                    })?
                    .with_timezone(&Utc),
            ),
            None => None,
        };

        let now = self.now();
        let id = self
            .store
            .create(
                &NewException {
                    rule_id: req.rule_id.clone(),
                    org_id: req.org_id.clone(),
                    subject_type: req.subject_type.clone(),
                    subject_id: req.subject_id.clone(),
                    requested_by: req.requested_by.clone(),
                    reason: req.reason.clone(),
                    valid_until,
                },
                now,
            )
            .await?;
        tracing::info!(id, rule_id = %req.rule_id, subject = %req.subject_id, "exception requested");

        // Approval card is best-effort; the request stands even when Slack
        // is down. Thread metadata is recorded for later reminders.
        if let Err(e) = self.post_approval_card(id, &req).await {
            tracing::warn!(id, error = %e, "approval card post failed");
        }

        Ok(CreatedException {
            id,
            status: ExceptionStatus::Pending,
        })
    }

    /// Approve an exception. Idempotent: re-approving echoes current times.
    pub async fn approve(
        &self,
        id: i64,
        actor: &str,
        valid_until: Option<String>,
    ) -> ApiResult<ApprovalOutcome> {
        let actor = self.authorize(actor)?;
        let exc = self.store.load(id).await?;
        let now = self.now();

        if exc.status == ExceptionStatus::Approved {
            return Ok(ApprovalOutcome {
                id: exc.id,
                status: exc.status,
                valid_from: exc.valid_from,
                valid_until: exc.valid_until,
                message: Some("already approved".to_string()),
            });
        }
        if exc.status.is_terminal() {
            return Err(AppError::Conflict(format!(
                "exception {} is {}",
                id, exc.status
            )));
        }

        let valid_from = exc.valid_from.unwrap_or(now);
        let cap = valid_from + max_validity();

        let new_until = match valid_until.as_deref().filter(|s| !s.is_empty()) {
            Some(raw) => match DateTime::parse_from_rfc3339(raw) {
                Ok(t) => {
                    let t = t.with_timezone(&Utc);
                    Some(if t > cap { cap } else { t })
                }
                // Unparseable payloads fall back to whatever is stored.
                Err(_) => None,
            },
            None => None,
        };

        let note = match new_until {
            Some(until) => format!("approved until {}", until.to_rfc3339()),
            None => "approved".to_string(),
        };
        self.store
            .approve(id, valid_from, new_until, actor, &note, now)
            .await?;
        tracing::info!(id, actor, "exception approved");

        Ok(ApprovalOutcome {
            id,
            status: ExceptionStatus::Approved,
            valid_from: Some(valid_from),
            valid_until: new_until.or(exc.valid_until),
            message: None,
        })
    }

    /// Deny or revoke. Idempotent on repeat; terminal thereafter.
    pub async fn decide(
        &self,
        id: i64,
        actor: &str,
        target: ExceptionStatus,
        note: Option<String>,
    ) -> ApiResult<DecisionOutcome> {
        debug_assert!(matches!(
            target,
            ExceptionStatus::Denied | ExceptionStatus::Revoked
        ));
        let actor = self.authorize(actor)?;
        let exc = self.store.load(id).await?;

        if exc.status == target {
            return Ok(DecisionOutcome {
                id,
                status: target,
                message: Some(format!("already {}", target)),
            });
        }
        if exc.status.is_terminal() {
            return Err(AppError::Conflict(format!(
                "exception {} is {}",
                id, exc.status
            )));
        }

        let action = match target {
            ExceptionStatus::Denied => "deny",
            _ => "revoke",
        };
        let note = note.filter(|n| !n.is_empty()).unwrap_or_else(|| action.to_string());
        self.store
            .set_status(id, target, actor, action, Some(&note), self.now())
            .await?;
        tracing::info!(id, actor, action, "exception decided");

        Ok(DecisionOutcome {
            id,
            status: target,
            message: None,
        })
    }

    /// Extend an approved exception by `hours` (default 24, clamped to
    /// [1, 72]), subject to the 30-minute backoff and the 7-day cap.
    pub async fn extend(
        &self,
        id: i64,
        actor: &str,
        hours: Option<i64>,
    ) -> ApiResult<ExtendOutcome> {
        let actor = self.authorize(actor)?;
        let hours = hours
            .unwrap_or(EXTEND_DEFAULT_HOURS)
            .clamp(EXTEND_MIN_HOURS, EXTEND_MAX_HOURS);

        let exc = self.store.load(id).await?;
        if exc.status != ExceptionStatus::Approved {
            return Err(AppError::Conflict("not approved".to_string()));
        }

        let now = self.now();
        if let Some(last) = self.store.last_event_time(id, "extend").await? {
            let elapsed = now - last;
            if elapsed < extend_backoff() {
                let retry_after = (extend_backoff() - elapsed).num_seconds().max(1) as u64;
                return Err(AppError::TooManyRequests { retry_after });
            }
        }

        let valid_from = exc.valid_from.unwrap_or(now);
        let cap = valid_from + max_validity();
        let base = match exc.valid_until {
            Some(until) if until > now => until,
            _ => now,
        };
        let mut proposed = base + Duration::hours(hours);
        let mut capped = false;
        if proposed > cap {
            proposed = cap;
            capped = true;
        }

        if proposed <= base {
            // Already pinned to the cap; acknowledge without mutating.
            return Ok(ExtendOutcome {
                id,
                status: exc.status,
                valid_until: base,
                capped: true,
                message: Some("hit 7-day cap".to_string()),
            });
        }

        let prev = exc
            .valid_until
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "(none)".to_string());
        let mut note = format!("+{}h (prev={})", hours, prev);
        if capped {
            note.push_str(" capped at 7d");
        }
        self.store.extend(id, proposed, actor, &note, now).await?;
        tracing::info!(id, actor, hours, capped, "exception extended");

        Ok(ExtendOutcome {
            id,
            status: exc.status,
            valid_until: proposed,
            capped,
            message: None,
        })
    }

    /// Approved exceptions for a rule, null expiries last.
    pub async fn list_active(
        &self,
        rule_id: &str,
        org_id: Option<&str>,
        pagination: &PaginationParams,
    ) -> ApiResult<ActiveExceptionPage> {
        let rule_id = rule_id.trim();
        if rule_id.is_empty() {
            return Err(AppError::BadRequest("rule_id required".to_string()));
        }
        let org_id = org_id.map(str::trim).filter(|s| !s.is_empty());

        let (items, total) = self
            .store
            .list_active(rule_id, org_id, pagination.limit(), pagination.offset())
            .await?;
        Ok(ActiveExceptionPage {
            items,
            page: pagination.page(),
            total_pages: pagination.total_pages(total),
            total,
            page_size: pagination.limit(),
        })
    }

    /// Full rows by status for ops tooling.
    pub async fn list_by_status(&self, status: &str) -> ApiResult<Vec<Exception>> {
        let status = ExceptionStatus::parse(status)
            .ok_or_else(|| AppError::BadRequest(format!("unknown status {:?}", status)))?;
        Ok(self.store.list_by_status(status).await?)
    }

    /// Post the approval card and record its thread coordinates on success.
    async fn post_approval_card(&self, id: i64, req: &CreateExceptionRequest) -> ApiResult<()> {
        let text = format!(
            ":shield: *Exception requested* #{} — `{}` on {}:{} by {}\n>{}",
            id, req.rule_id, req.subject_type, req.subject_id, req.requested_by, req.reason
        );
        let context = json!({
            "exc_id": id.to_string(),
            "rule_id": req.rule_id,
            "org_id": req.org_id.clone().unwrap_or_default(),
            "subject_type": req.subject_type,
            "subject_id": req.subject_id,
        })
        .to_string();

        let card = json!({
            "channel": self.default_channel,
            "text": text,
            "blocks": [
                section_block(&text),
                {
                    "type": "actions",
                    "elements": [
                        button_block("Approve", "primary", "approve", &context),
                        button_block("Deny", "danger", "deny", &context),
                    ],
                },
            ],
        });

        let resp = self
            .slack
            .post_message(card)
            .await
            .map_err(|e| AppError::ExternalServiceError {
                service: "slack".to_string(),
                message: e.to_string(),
            })?;
        if !resp.channel.is_empty() || !resp.ts.is_empty() {
            self.store
                .record_slack_thread(id, &resp.channel, &resp.ts)
                .await?;
        }
        Ok(())
    }
}
