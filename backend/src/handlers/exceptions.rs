//! HTTP surface for the exception lifecycle.

use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    response::Json,
    routing::{get, post},
    Form, Router,
};
use serde::Deserialize;
use std::sync::Arc;
use validator::Validate;

use crate::error::{ApiResult, AppError};
use crate::exceptions::CreateExceptionRequest;
use crate::pagination::PaginationParams;
use crate::AppState;
use gatekeeper_shared::{ActiveExceptionPage, Exception, ExceptionStatus};

pub fn exception_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", post(create_exception).get(list_exceptions))
        .route("/active", get(list_active))
        .route("/:id/approve", post(approve_exception))
        .route("/:id/deny", post(deny_exception))
        .route("/:id/revoke", post(revoke_exception))
        .route("/:id/extend", post(extend_exception))
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateExceptionForm {
    #[validate(length(min = 1, message = "rule_id is required"))]
    pub rule_id: String,
    pub org_id: Option<String>,
    #[validate(length(min = 1, message = "subject_type is required"))]
    pub subject_type: String,
    #[validate(length(min = 1, message = "subject_id is required"))]
    pub subject_id: String,
    #[validate(length(min = 1, message = "requested_by is required"))]
    pub requested_by: String,
    #[validate(length(min = 1, message = "reason is required"))]
    pub reason: String,
    pub valid_until: Option<String>,
}

/// Shared form for lifecycle mutations. `actor` may instead arrive via the
/// X-Actor header (the Slack gateway sends it that way).
#[derive(Debug, Default, Deserialize)]
pub struct ActionForm {
    pub actor: Option<String>,
    pub valid_until: Option<String>,
    pub note: Option<String>,
    pub hours: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct StatusQuery {
    pub status: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ActiveQuery {
    pub rule_id: Option<String>,
    pub org_id: Option<String>,
    #[serde(flatten)]
    pub pagination: PaginationParams,
}

fn actor_from(form_actor: Option<&str>, headers: &HeaderMap) -> String {
    if let Some(actor) = form_actor.map(str::trim).filter(|a| !a.is_empty()) {
        return actor.to_string();
    }
    headers
        .get("x-actor")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .trim()
        .to_string()
}

async fn create_exception(
    State(state): State<Arc<AppState>>,
    Form(form): Form<CreateExceptionForm>,
) -> ApiResult<Json<serde_json::Value>> {
    form.validate()
        .map_err(|e| AppError::BadRequest(e.to_string()))?;

    let created = state
        .service
        .create(CreateExceptionRequest {
            rule_id: form.rule_id,
            org_id: form.org_id.filter(|s| !s.is_empty()),
            subject_type: form.subject_type,
            subject_id: form.subject_id,
            requested_by: form.requested_by,
            reason: form.reason,
            valid_until: form.valid_until,
        })
        .await?;
    Ok(Json(serde_json::json!({
        "id": created.id,
        "status": created.status,
    })))
}

async fn list_exceptions(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StatusQuery>,
) -> ApiResult<Json<Vec<Exception>>> {
    let status = query.status.unwrap_or_else(|| "pending".to_string());
    Ok(Json(state.service.list_by_status(&status).await?))
}

async fn list_active(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ActiveQuery>,
) -> ApiResult<Json<ActiveExceptionPage>> {
    let page = state
        .service
        .list_active(
            query.rule_id.as_deref().unwrap_or_default(),
            query.org_id.as_deref(),
            &query.pagination,
        )
        .await?;
    Ok(Json(page))
}

async fn approve_exception(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    headers: HeaderMap,
    Form(form): Form<ActionForm>,
) -> ApiResult<Json<serde_json::Value>> {
    let actor = actor_from(form.actor.as_deref(), &headers);
    let outcome = state.service.approve(id, &actor, form.valid_until).await?;
    Ok(Json(serde_json::to_value(outcome).map_err(|e| {
        AppError::InternalError(e.to_string())
    })?))
}

async fn deny_exception(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    headers: HeaderMap,
    Form(form): Form<ActionForm>,
) -> ApiResult<Json<serde_json::Value>> {
    decide(state, id, headers, form, ExceptionStatus::Denied).await
}

async fn revoke_exception(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    headers: HeaderMap,
    Form(form): Form<ActionForm>,
) -> ApiResult<Json<serde_json::Value>> {
    decide(state, id, headers, form, ExceptionStatus::Revoked).await
}

async fn decide(
    state: Arc<AppState>,
    id: i64,
    headers: HeaderMap,
    form: ActionForm,
    target: ExceptionStatus,
) -> ApiResult<Json<serde_json::Value>> {
    let actor = actor_from(form.actor.as_deref(), &headers);
    let outcome = state.service.decide(id, &actor, target, form.note).await?;
    Ok(Json(serde_json::to_value(outcome).map_err(|e| {
        AppError::InternalError(e.to_string())
    })?))
}

async fn extend_exception(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    headers: HeaderMap,
    Form(form): Form<ActionForm>,
) -> ApiResult<Json<serde_json::Value>> {
    let actor = actor_from(form.actor.as_deref(), &headers);
    let outcome = state.service.extend(id, &actor, form.hours).await?;
    Ok(Json(serde_json::to_value(outcome).map_err(|e| {
        AppError::InternalError(e.to_string())
    })?))
}
