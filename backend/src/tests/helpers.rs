// Common test utilities: an in-memory app wired like main(), with a fixed
// clock and a recording Slack double.

use axum::routing::get;
use axum::Router;
use chrono::{DateTime, TimeZone, Utc};
use std::sync::{Arc, Mutex};

use crate::clock::fixed_clock;
use crate::database::{create_pool, init_schema, Dialect};
use crate::exceptions::{ExceptionService, ExceptionStore};
use crate::handlers;
use crate::rules::{Compiler, Enforcer, RuleRegistry, WindowStore};
use crate::services::slack::{SlackError, SlackMessageResponse, SlackPoster};
use crate::AppState;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
pub struct FakeSlack {
    pub posts: Mutex<Vec<serde_json::Value>>,
}

#[async_trait]
impl SlackPoster for FakeSlack {
    async fn post_message(
        &self,
        payload: serde_json::Value,
    ) -> Result<SlackMessageResponse, SlackError> {
        self.posts.lock().unwrap().push(payload);
        Ok(SlackMessageResponse {
            channel: "C123".into(),
            ts: "1700000000.000100".into(),
        })
    }
}

pub struct TestApp {
    pub router: Router,
    pub state: Arc<AppState>,
    pub store: Arc<ExceptionStore>,
    pub slack: Arc<FakeSlack>,
}

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 1, 10, 0, 0).unwrap()
}

fn rules_dir() -> std::path::PathBuf {
    std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("../rules")
}

/// Build a full application against in-memory SQLite, frozen at `at`.
pub async fn test_app_at(at: DateTime<Utc>) -> TestApp {
    let pool = create_pool("sqlite::memory:", Dialect::Sqlite).await.unwrap();
    init_schema(&pool, Dialect::Sqlite).await.unwrap();

    let slack = Arc::new(FakeSlack::default());
    let store = Arc::new(ExceptionStore::new(pool, Dialect::Sqlite));
    let service = Arc::new(
        ExceptionService::new(store.clone(), slack.clone(), vec![], "#secops")
            .with_clock(fixed_clock(at)),
    );

    let compiler = Compiler::new(Arc::new(WindowStore::default()));
    let registry = RuleRegistry::load_dir(&compiler, rules_dir()).expect("stock rules compile");

    let enforcer = Enforcer::new(slack.clone(), None, "#secops");
    let state = Arc::new(AppState {
        service,
        registry,
        enforcer,
        shutdown: CancellationToken::new(),
    });

    let router = Router::new()
        .route("/health", get(handlers::health_check))
        .nest("/exceptions", handlers::exception_routes())
        .nest("/rules", handlers::rule_routes())
        .with_state(state.clone());

    TestApp {
        router,
        state,
        store,
        slack,
    }
}

pub async fn test_app() -> TestApp {
    test_app_at(t0()).await
}

pub async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

pub fn form_request(uri: &str, body: String) -> axum::http::Request<axum::body::Body> {
    axum::http::Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/x-www-form-urlencoded")
        .body(axum::body::Body::from(body))
        .unwrap()
}

pub fn json_request(
    uri: &str,
    value: serde_json::Value,
) -> axum::http::Request<axum::body::Body> {
    axum::http::Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(axum::body::Body::from(value.to_string()))
        .unwrap()
}

pub fn get_request(uri: &str) -> axum::http::Request<axum::body::Body> {
    axum::http::Request::builder()
        .method("GET")
        .uri(uri)
        .body(axum::body::Body::empty())
        .unwrap()
}
