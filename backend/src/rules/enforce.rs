//! Map a rule decision onto side effects: deny errors, Slack notifications,
//! canary demotion.

use super::compile::CompiledRule;
use crate::error::{AppError, PolicyViolation};
use crate::services::slack::SlackPoster;
use gatekeeper_shared::{Decision, RuleDecision};
use serde_json::json;
use std::sync::Arc;

const DEFAULT_NOTIFY_TEXT: &str = ":rotating_light: Compliance notification";

pub struct Enforcer {
    slack: Arc<dyn SlackPoster>,
    /// SLACK_CHANNEL override; takes precedence over rule routing.
    channel_override: Option<String>,
    /// SECOPS_CHANNEL fallback when a rule names no channel.
    default_channel: String,
}

impl Enforcer {
    pub fn new(
        slack: Arc<dyn SlackPoster>,
        channel_override: Option<String>,
        default_channel: impl Into<String>,
    ) -> Self {
        Self {
            slack,
            channel_override,
            default_channel: default_channel.into(),
        }
    }

    /// Perform the side effects for a decision.
    ///
    /// Canary rules demote deny to notify with a `_canary` reason suffix, so
    /// they can never fail a request. Deny surfaces as a `PolicyViolation`;
    /// callers render the structured envelope.
    pub async fn enforce(
        &self,
        rule: &CompiledRule,
        decision: &RuleDecision,
        correlation_id: &str,
    ) -> Result<(), AppError> {
        let mut decision = decision.clone();
        if decision.decision == Decision::Allow {
            return Ok(());
        }

        if rule.canary && decision.decision == Decision::Deny {
            decision.decision = Decision::Notify;
            decision.reason = format!("{}_canary", decision.reason);
        }

        match decision.decision {
            Decision::Allow => Ok(()),
            Decision::Deny => {
                let message = detail_str(&decision, "message");
                let remediation = detail_str(&decision, "remediation");
                Err(AppError::PolicyViolation(Box::new(PolicyViolation {
                    rule_id: decision.rule_id.clone(),
                    reason: decision.reason.clone(),
                    message,
                    remediation,
                    docs_url: rule.docs_url.clone(),
                    owners: rule.owners.clone(),
                    correlation_id: correlation_id.to_string(),
                })))
            }
            Decision::Notify => {
                let text = decision
                    .details
                    .get("message")
                    .and_then(|v| v.as_str())
                    .unwrap_or(DEFAULT_NOTIFY_TEXT)
                    .to_string();
                let payload = json!({
                    "channel": self.pick_channel(rule),
                    "text": text,
                    "rule_id": decision.rule_id,
                    "reason": decision.reason,
                    "details": decision.details,
                });
                // Notifications are best-effort; a failed post never fails
                // the observed request.
                if let Err(e) = self.slack.post_message(payload).await {
                    tracing::warn!(rule_id = %decision.rule_id, error = %e, "notify post failed");
                }
                Ok(())
            }
        }
    }

    fn pick_channel(&self, rule: &CompiledRule) -> String {
        if let Some(channel) = &self.channel_override {
            return channel.clone();
        }
        rule.notify
            .channels
            .first()
            .cloned()
            .unwrap_or_else(|| self.default_channel.clone())
    }
}

fn detail_str(decision: &RuleDecision, key: &str) -> String {
    decision
        .details
        .get(key)
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}
