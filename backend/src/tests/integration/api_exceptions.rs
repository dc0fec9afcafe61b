// End-to-end lifecycle flows over the HTTP surface.

use crate::tests::helpers::*;
use axum::http::StatusCode;
use tower::ServiceExt;

fn create_form(rule_id: &str, subject_id: &str, valid_until: Option<&str>) -> String {
    let mut body = format!(
        "rule_id={}&org_id=org-1&subject_type=repo&subject_id={}&requested_by=alice&reason=migration+window",
        rule_id, subject_id
    );
    if let Some(until) = valid_until {
        body.push_str(&format!("&valid_until={}", urlencode(until)));
    }
    body
}

fn urlencode(raw: &str) -> String {
    raw.replace(':', "%3A").replace('+', "%2B")
}

async fn create(app: &TestApp, form: String) -> i64 {
    let response = app
        .router
        .clone()
        .oneshot(form_request("/exceptions", form))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "pending");
    body["id"].as_i64().unwrap()
}

#[tokio::test]
async fn create_approve_extend_flow() {
    let app = test_app().await;
    let until = (t0() + chrono::Duration::hours(12)).to_rfc3339();
    let id = create(&app, create_form("mirror_class_limit", "acme%2Fx", Some(&until))).await;

    // Approve without a payload: valid_from = now, requested expiry kept.
    let response = app
        .router
        .clone()
        .oneshot(form_request(
            &format!("/exceptions/{}/approve", id),
            "actor=boss".to_string(),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "approved");
    let valid_from =
        chrono::DateTime::parse_from_rfc3339(body["valid_from"].as_str().unwrap()).unwrap();
    assert_eq!(valid_from, t0());

    // Re-approving is an idempotent echo.
    let response = app
        .router
        .clone()
        .oneshot(form_request(
            &format!("/exceptions/{}/approve", id),
            "actor=boss".to_string(),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["message"], "already approved");

    // First extension moves the expiry; the immediate retry hits the backoff.
    let response = app
        .router
        .clone()
        .oneshot(form_request(
            &format!("/exceptions/{}/extend", id),
            "actor=boss&hours=24".to_string(),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["capped"], false);

    let response = app
        .router
        .clone()
        .oneshot(form_request(
            &format!("/exceptions/{}/extend", id),
            "actor=boss&hours=24".to_string(),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(response.headers().contains_key("retry-after"));
}

#[tokio::test]
async fn actor_is_required_for_mutations() {
    let app = test_app().await;
    let id = create(&app, create_form("mirror_class_limit", "acme%2Fx", None)).await;

    let response = app
        .router
        .clone()
        .oneshot(form_request(
            &format!("/exceptions/{}/approve", id),
            String::new(),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    // The Slack gateway supplies the actor via header instead.
    let request = {
        let mut req = form_request(&format!("/exceptions/{}/approve", id), String::new());
        req.headers_mut()
            .insert("x-actor", "boss".parse().unwrap());
        req
    };
    let response = app.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn unknown_exception_is_404() {
    let app = test_app().await;
    let response = app
        .router
        .clone()
        .oneshot(form_request(
            "/exceptions/9999/approve",
            "actor=boss".to_string(),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn deny_is_terminal_over_http() {
    let app = test_app().await;
    let id = create(&app, create_form("mirror_class_limit", "acme%2Fx", None)).await;

    let response = app
        .router
        .clone()
        .oneshot(form_request(
            &format!("/exceptions/{}/deny", id),
            "actor=boss&note=not+justified".to_string(),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["status"], "denied");

    // Approving a denied exception conflicts.
    let response = app
        .router
        .clone()
        .oneshot(form_request(
            &format!("/exceptions/{}/approve", id),
            "actor=boss".to_string(),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn active_listing_orders_null_expiry_last() {
    let app = test_app().await;

    let untils = [
        None,
        Some((t0() + chrono::Duration::hours(1)).to_rfc3339()),
        Some((t0() + chrono::Duration::hours(2)).to_rfc3339()),
    ];
    let mut ids = Vec::new();
    for (i, until) in untils.iter().enumerate() {
        let subject = format!("acme%2Frepo-{}", i);
        let id = create(&app, create_form("mirror_class_limit", &subject, until.as_deref())).await;
        let response = app
            .router
            .clone()
            .oneshot(form_request(
                &format!("/exceptions/{}/approve", id),
                "actor=boss".to_string(),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        ids.push(id);
    }

    let response = app
        .router
        .clone()
        .oneshot(get_request("/exceptions/active?rule_id=mirror_class_limit"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;

    let items = body["items"].as_array().unwrap();
    assert_eq!(items.len(), 3);
    // Expiring soonest first, null expiry last, ids ascending as tie-break.
    assert_eq!(items[0]["id"].as_i64().unwrap(), ids[1]);
    assert_eq!(items[1]["id"].as_i64().unwrap(), ids[2]);
    assert_eq!(items[2]["id"].as_i64().unwrap(), ids[0]);
    assert!(items[2].get("valid_until").is_none());

    assert_eq!(body["page"], 1);
    assert_eq!(body["total"], 3);
    assert_eq!(body["totalPages"], 1);
    assert_eq!(body["pageSize"], 25);

    // Missing rule_id is a 400.
    let response = app
        .router
        .clone()
        .oneshot(get_request("/exceptions/active"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn pending_listing_returns_full_rows() {
    let app = test_app().await;
    let id = create(&app, create_form("mirror_class_limit", "acme%2Fx", None)).await;

    let response = app
        .router
        .clone()
        .oneshot(get_request("/exceptions?status=pending"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    let rows = body.as_array().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["id"].as_i64().unwrap(), id);
    assert_eq!(rows[0]["rule_id"], "mirror_class_limit");
    assert_eq!(rows[0]["reason"], "migration window");
}

#[tokio::test]
async fn create_validates_required_fields() {
    let app = test_app().await;
    let response = app
        .router
        .clone()
        .oneshot(form_request(
            "/exceptions",
            "rule_id=&subject_type=repo&subject_id=x&requested_by=alice&reason=r".to_string(),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn approval_card_is_posted_on_create() {
    let app = test_app().await;
    let id = create(&app, create_form("mirror_class_limit", "acme%2Fx", None)).await;

    let posts = app.slack.posts.lock().unwrap();
    assert_eq!(posts.len(), 1);
    assert_eq!(posts[0]["channel"], "#secops");
    drop(posts);

    // Thread metadata from the card lands on the row.
    let row = app.store.load(id).await.unwrap();
    assert_eq!(row.slack_channel.as_deref(), Some("C123"));
    assert_eq!(row.slack_ts.as_deref(), Some("1700000000.000100"));
}
