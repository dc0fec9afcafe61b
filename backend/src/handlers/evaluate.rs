//! Gateway surface: evaluate observed events against compiled rules.
//!
//! Denies render the structured `policy_violation` envelope with HTTP 403;
//! subjects covered by an approved exception skip enforcement entirely.

use axum::{
    extract::{Path, State},
    http::HeaderMap,
    response::Json,
    routing::post,
    Router,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

use crate::error::{ApiResult, AppError, PolicyViolation};
use crate::rules::metrics::parse_window;
use crate::rules::{evaluate_event, evaluate_series, CompiledRule, RuleError};
use crate::AppState;
use gatekeeper_shared::{Event, RuleDecision};

pub fn rule_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/:id/evaluate", post(evaluate_one))
        .route("/:id/evaluate-series", post(evaluate_many))
}

#[derive(Debug, Deserialize)]
pub struct SeriesRequest {
    #[serde(default)]
    pub window: Option<String>,
    pub events: Vec<Event>,
}

fn correlation_id(headers: &HeaderMap) -> String {
    headers
        .get("x-correlation-id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

async fn evaluate_one(
    State(state): State<Arc<AppState>>,
    Path(rule_id): Path<String>,
    headers: HeaderMap,
    Json(event): Json<Event>,
) -> ApiResult<Json<serde_json::Value>> {
    let corr = correlation_id(&headers);
    let rule = state
        .registry
        .find(&rule_id)
        .ok_or_else(|| AppError::NotFound(format!("Rule {}", rule_id)))?;

    if let Some(exception_id) = covering_exception(&state, rule, &event).await? {
        tracing::info!(rule_id = %rule.id, exception_id, "subject covered by exception");
        return Ok(Json(json!({
            "rule_id": rule.id,
            "decision": "allow",
            "excepted_by": exception_id,
        })));
    }

    let cancel = state.shutdown.child_token();
    let decision = match evaluate_event(rule, &event, &cancel).await {
        Ok(decision) => decision,
        Err(e) => eval_error_decision(rule, e, &corr)?,
    };

    state.enforcer.enforce(rule, &decision, &corr).await?;
    Ok(Json(serde_json::to_value(&decision).map_err(|e| {
        AppError::InternalError(e.to_string())
    })?))
}

async fn evaluate_many(
    State(state): State<Arc<AppState>>,
    Path(rule_id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<SeriesRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let corr = correlation_id(&headers);
    let rule = state
        .registry
        .find(&rule_id)
        .ok_or_else(|| AppError::NotFound(format!("Rule {}", rule_id)))?;

    let window = parse_window(request.window.as_deref().unwrap_or("15m"))
        .map_err(AppError::BadRequest)?;

    let cancel = state.shutdown.child_token();
    let decision = match evaluate_series(rule, &request.events, window, &cancel).await {
        Ok(decision) => decision,
        Err(RuleError::EmptySeries) => {
            return Err(AppError::BadRequest(
                "series must contain at least one event".to_string(),
            ))
        }
        Err(e) => eval_error_decision(rule, e, &corr)?,
    };

    state.enforcer.enforce(rule, &decision, &corr).await?;
    Ok(Json(serde_json::to_value(&decision).map_err(|e| {
        AppError::InternalError(e.to_string())
    })?))
}

/// Apply the rule's failure policy to an evaluation error: fail closed,
/// fail open with a logged warning, or surface to the caller.
fn eval_error_decision(
    rule: &CompiledRule,
    err: RuleError,
    corr: &str,
) -> ApiResult<RuleDecision> {
    match rule.block_on_error {
        Some(true) => Err(AppError::PolicyViolation(Box::new(PolicyViolation {
            rule_id: rule.id.clone(),
            reason: format!("{}_eval_error", rule.id),
            message: err.to_string(),
            remediation: String::new(),
            docs_url: rule.docs_url.clone(),
            owners: rule.owners.clone(),
            correlation_id: corr.to_string(),
        }))),
        Some(false) => {
            tracing::warn!(rule_id = %rule.id, error = %err, "eval failed open");
            Ok(RuleDecision::allow(rule.id.clone()))
        }
        None => Err(AppError::InternalError(err.to_string())),
    }
}

/// Check whether the event's subject carries an approved waiver for the rule.
async fn covering_exception(
    state: &AppState,
    rule: &CompiledRule,
    event: &Event,
) -> ApiResult<Option<i64>> {
    let subject_type = event.get("subject_type").and_then(|v| v.as_str());
    let subject_id = event.get("subject_id").and_then(|v| v.as_str());
    let (subject_type, subject_id) = match (subject_type, subject_id) {
        (Some(t), Some(i)) if !t.is_empty() && !i.is_empty() => (t, i),
        _ => return Ok(None),
    };
    let org_id = event
        .get("org_id")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty());

    let now = state.service.now();
    let hit = state
        .service
        .store()
        .is_excepted(&rule.id, subject_type, subject_id, org_id, now)
        .await?;
    Ok(hit)
}
