use axum::{extract::State, response::Json};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::AppState;

pub mod evaluate;
pub mod exceptions;

pub use evaluate::rule_routes;
pub use exceptions::exception_routes;

pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<Value> {
    let db = crate::database::health_check(state.service.store().pool()).await;
    Json(json!({
        "status": if db { "ok" } else { "degraded" },
        "service": "gatekeeper",
        "rules": state.registry.len(),
        "time": chrono::Utc::now().to_rfc3339(),
    }))
}
