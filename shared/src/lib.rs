use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single telemetry record: open attribute map with an optional `ts`.
/// Attributes the rule language types are declared by the expression
/// environment; everything else passes through untyped.
pub type Event = serde_json::Map<String, serde_json::Value>;

/// Outcome of evaluating a rule against an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Allow,
    Deny,
    Notify,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Allow => "allow",
            Decision::Deny => "deny",
            Decision::Notify => "notify",
        }
    }

    pub fn parse(s: &str) -> Option<Decision> {
        match s {
            "allow" => Some(Decision::Allow),
            "deny" => Some(Decision::Deny),
            "notify" => Some(Decision::Notify),
            _ => None,
        }
    }
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleDecision {
    pub rule_id: String,
    pub decision: Decision,
    pub reason: String,
    #[serde(default)]
    pub details: serde_json::Map<String, serde_json::Value>,
}

impl RuleDecision {
    /// The decision produced when a rule expression evaluates to false.
    pub fn allow(rule_id: impl Into<String>) -> Self {
        Self {
            rule_id: rule_id.into(),
            decision: Decision::Allow,
            reason: String::new(),
            details: serde_json::Map::new(),
        }
    }
}

/// Structured JSON body returned to clients when a rule denies a request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyError {
    pub code: String,
    pub rule_id: String,
    pub reason: String,
    pub message: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub remediation: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub docs_url: String,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub owners: Vec<String>,
    pub correlation_id: String,
}

/// Top-level payload shape for deny responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub error: PolicyError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExceptionStatus {
    Pending,
    Approved,
    Denied,
    Revoked,
    Expired,
}

impl ExceptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExceptionStatus::Pending => "pending",
            ExceptionStatus::Approved => "approved",
            ExceptionStatus::Denied => "denied",
            ExceptionStatus::Revoked => "revoked",
            ExceptionStatus::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<ExceptionStatus> {
        match s {
            "pending" => Some(ExceptionStatus::Pending),
            "approved" => Some(ExceptionStatus::Approved),
            "denied" => Some(ExceptionStatus::Denied),
            "revoked" => Some(ExceptionStatus::Revoked),
            "expired" => Some(ExceptionStatus::Expired),
            _ => None,
        }
    }

    /// Denied and revoked rows never transition again; expired rows only
    /// echo idempotent reads.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExceptionStatus::Denied | ExceptionStatus::Revoked | ExceptionStatus::Expired
        )
    }
}

impl std::fmt::Display for ExceptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persistent waiver of a rule against a subject for a time window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Exception {
    pub id: i64,
    pub rule_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub org_id: Option<String>,
    pub subject_type: String,
    pub subject_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requested_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub status: ExceptionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub valid_from: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub valid_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slack_channel: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slack_ts: Option<String>,
}

/// Append-only audit record for a lifecycle transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExceptionEvent {
    pub id: i64,
    pub exception_id: i64,
    pub actor: String,
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    pub at: DateTime<Utc>,
}

/// JSON shape for GET /exceptions/active items.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveException {
    pub id: i64,
    pub subject_type: String,
    pub subject_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requested_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub valid_until: Option<DateTime<Utc>>,
}

/// Paginated GET /exceptions/active response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveExceptionPage {
    pub items: Vec<ActiveException>,
    pub page: i64,
    #[serde(rename = "totalPages")]
    pub total_pages: i64,
    pub total: i64,
    #[serde(rename = "pageSize")]
    pub page_size: i64,
}
