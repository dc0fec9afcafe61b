// Gateway evaluation flows: deny envelopes, notify routing, exception
// coverage.

use crate::tests::helpers::*;
use axum::http::StatusCode;
use serde_json::json;
use tower::ServiceExt;

#[tokio::test]
async fn mirror_deny_renders_policy_violation_envelope() {
    let app = test_app().await;
    let mut request = json_request(
        "/rules/mirror_class_limit/evaluate",
        json!({
            "action": "mirror",
            "resource_class": "secret",
            "resource_provider": "github",
        }),
    );
    request
        .headers_mut()
        .insert("x-correlation-id", "corr-42".parse().unwrap());

    let response = app.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let body = body_json(response).await;
    let error = &body["error"];
    assert_eq!(error["code"], "policy_violation");
    assert_eq!(error["rule_id"], "mirror_class_limit");
    assert_eq!(error["reason"], "mirror_class_limit");
    assert_eq!(
        error["message"],
        "Mirroring secret-class resources is not permitted."
    );
    assert_eq!(
        error["remediation"],
        "Request an exception or use a sanctioned export path."
    );
    assert_eq!(error["owners"][0], "secops");
    assert_eq!(error["correlation_id"], "corr-42");
}

#[tokio::test]
async fn non_matching_event_allows() {
    let app = test_app().await;
    let response = app
        .router
        .clone()
        .oneshot(json_request(
            "/rules/mirror_class_limit/evaluate",
            json!({"action": "read", "resource_class": "internal"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["decision"], "allow");
    assert_eq!(body["rule_id"], "mirror_class_limit");
    // No notifications for allow decisions.
    assert!(app.slack.posts.lock().unwrap().is_empty());
}

#[tokio::test]
async fn unknown_rule_is_404() {
    let app = test_app().await;
    let response = app
        .router
        .clone()
        .oneshot(json_request("/rules/nope/evaluate", json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn excepted_subject_skips_enforcement() {
    let app = test_app().await;

    // Approve a waiver for repo acme/x against the mirror rule.
    let id = app
        .state
        .service
        .create(crate::exceptions::CreateExceptionRequest {
            rule_id: "mirror_class_limit".into(),
            org_id: Some("org-1".into()),
            subject_type: "repo".into(),
            subject_id: "acme/x".into(),
            requested_by: "alice".into(),
            reason: "migration window".into(),
            valid_until: None,
        })
        .await
        .unwrap()
        .id;
    app.state.service.approve(id, "boss", None).await.unwrap();

    let response = app
        .router
        .clone()
        .oneshot(json_request(
            "/rules/mirror_class_limit/evaluate",
            json!({
                "action": "mirror",
                "resource_class": "secret",
                "subject_type": "repo",
                "subject_id": "acme/x",
                "org_id": "org-1",
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["decision"], "allow");
    assert_eq!(body["excepted_by"].as_i64().unwrap(), id);

    // A different repo still gets denied.
    let response = app
        .router
        .clone()
        .oneshot(json_request(
            "/rules/mirror_class_limit/evaluate",
            json!({
                "action": "mirror",
                "resource_class": "secret",
                "subject_type": "repo",
                "subject_id": "acme/other",
                "org_id": "org-1",
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn canary_rule_notifies_instead_of_denying() {
    let app = test_app().await;
    // secret_expiry_spike is a canary observe rule; drive its store-backed
    // rate over the threshold through the series endpoint.
    let events: Vec<serde_json::Value> = (0..10)
        .map(|_| json!({"error_kind": "secret_expired", "outcome": "deny"}))
        .collect();
    let response = app
        .router
        .clone()
        .oneshot(json_request(
            "/rules/secret_expiry_spike/evaluate-series",
            json!({"window": "30m", "events": events}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["decision"], "notify");

    let posts = app.slack.posts.lock().unwrap();
    assert_eq!(posts.len(), 1);
    assert_eq!(posts[0]["channel"], "#secops");
    assert_eq!(posts[0]["reason"], "secret_expiry_spike");
}

#[tokio::test]
async fn empty_series_is_rejected() {
    let app = test_app().await;
    let response = app
        .router
        .clone()
        .oneshot(json_request(
            "/rules/secret_expiry_spike/evaluate-series",
            json!({"window": "30m", "events": []}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn consent_abandonment_series_notifies_secops() {
    let app = test_app().await;
    let mut events: Vec<serde_json::Value> = Vec::new();
    for _ in 0..8 {
        events.push(json!({"deny_reason": "quota", "outcome": "deny"}));
    }
    for _ in 0..2 {
        events.push(json!({"deny_reason": "consent_required", "outcome": "deny"}));
    }

    // 2/10 abandonment: under the 30% threshold.
    let response = app
        .router
        .clone()
        .oneshot(json_request(
            "/rules/consent_abandonment/evaluate-series",
            json!({"window": "15m", "events": events}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["decision"], "allow");

    // Four more consent denials push it to ~43%.
    let more: Vec<serde_json::Value> = (0..4)
        .map(|_| json!({"deny_reason": "consent_required", "outcome": "deny"}))
        .collect();
    let response = app
        .router
        .clone()
        .oneshot(json_request(
            "/rules/consent_abandonment/evaluate-series",
            json!({"window": "15m", "events": more}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["decision"], "notify");
    assert_eq!(body["reason"], "consent_abandonment_spike");

    let posts = app.slack.posts.lock().unwrap();
    assert_eq!(posts.len(), 1);
    assert_eq!(posts[0]["channel"], "#secops");
}
