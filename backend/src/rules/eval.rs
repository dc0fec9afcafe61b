//! Rule evaluation against single events and event series.

use super::compile::CompiledRule;
use super::env::{build_context, normalize_event};
use super::RuleError;
use cel_interpreter::Value;
use chrono::{DateTime, Duration, Utc};
use gatekeeper_shared::{Decision, Event, RuleDecision};
use tokio_util::sync::CancellationToken;

/// Evaluate a compiled rule against one event.
///
/// The CEL program runs on a blocking worker because helper bindings may do
/// provider I/O. A false expression yields an `allow` decision with empty
/// reason and details.
pub async fn evaluate_event(
    rule: &CompiledRule,
    event: &Event,
    cancel: &CancellationToken,
) -> Result<RuleDecision, RuleError> {
    let now = (rule.bindings.clock)();
    let normalized = normalize_event(Some(event), now);

    let compiled = rule.clone();
    let token = cancel.clone();
    let matched = tokio::task::spawn_blocking(move || run_program(&compiled, &normalized, &token))
        .await
        .map_err(|e| RuleError::Eval {
            rule_id: rule.id.clone(),
            message: format!("worker failed: {}", e),
        })??;

    if !matched {
        return Ok(RuleDecision::allow(rule.id.clone()));
    }

    let mut decision = RuleDecision {
        rule_id: rule.id.clone(),
        decision: Decision::parse(&rule.on_match.decision).unwrap_or(Decision::Deny),
        reason: rule.on_match.reason.clone(),
        details: rule.on_match.details.clone(),
    };
    if decision.reason.is_empty() {
        decision.reason = rule.id.clone();
    }
    Ok(decision)
}

/// Evaluate a rule over a series of events inside the trailing window.
///
/// Events without a `ts` attribute are spread uniformly across
/// `[now - window, now]`; each event is appended to the rule's window store
/// and evaluated in order. The decision for the last event is returned.
pub async fn evaluate_series(
    rule: &CompiledRule,
    events: &[Event],
    window: Duration,
    cancel: &CancellationToken,
) -> Result<RuleDecision, RuleError> {
    if events.is_empty() {
        return Err(RuleError::EmptySeries);
    }

    let now = (rule.bindings.clock)();
    let spacing = window / (events.len() as i32 + 1);

    let mut last = RuleDecision::allow(rule.id.clone());
    for (i, event) in events.iter().enumerate() {
        let ts = event_ts(event)
            .unwrap_or_else(|| now - window + spacing * (i as i32 + 1));
        rule.bindings.store.append(ts, event);
        last = evaluate_event(rule, event, cancel).await?;
    }
    Ok(last)
}

fn event_ts(event: &Event) -> Option<DateTime<Utc>> {
    let raw = event.get("ts")?.as_str()?;
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

fn run_program(
    rule: &CompiledRule,
    event: &Event,
    cancel: &CancellationToken,
) -> Result<bool, RuleError> {
    let ctx = build_context(&rule.bindings, event, cancel).map_err(|e| RuleError::Eval {
        rule_id: rule.id.clone(),
        message: e.to_string(),
    })?;

    let value = rule.program.execute(&ctx).map_err(|e| RuleError::Eval {
        rule_id: rule.id.clone(),
        message: e.to_string(),
    })?;

    match value {
        Value::Bool(b) => Ok(b),
        other => Err(RuleError::NotBoolean {
            rule_id: rule.id.clone(),
            got: format!("{:?}", other),
        }),
    }
}
