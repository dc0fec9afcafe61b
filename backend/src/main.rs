use axum::{
    http::Method,
    routing::get,
    Router,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod clock;
mod config;
mod database;
mod error;
mod exceptions;
mod handlers;
mod jobs;
mod pagination;
mod rules;
mod services;

pub use error::{ApiError, ApiResult, AppError};
pub use pagination::PaginationParams;

use exceptions::{ExceptionService, ExceptionStore};
use jobs::{ExpirySweepJob, JobScheduler, ReminderSweepJob};
use rules::{Compiler, Enforcer, MetricsProvider, RuleRegistry, WindowStore};
use services::slack::{NoopSlackPoster, SlackApiPoster, SlackPoster, SlackWebhookPoster};

#[cfg(test)]
mod tests;

pub struct AppState {
    pub service: Arc<ExceptionService>,
    pub registry: RuleRegistry,
    pub enforcer: Enforcer,
    pub shutdown: CancellationToken,
}

/// Bounded drain for in-flight requests after the shutdown signal.
const SHUTDOWN_GRACE: std::time::Duration = std::time::Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = config::Config::from_env()?;

    let dialect = database::Dialect::detect(&config.database_url, config.db_driver.as_deref());
    let pool = database::create_pool(&config.database_url, dialect).await?;
    database::init_schema(&pool, dialect).await?;

    let slack: Arc<dyn SlackPoster> = if let Some(token) = &config.slack.bot_token {
        Arc::new(SlackApiPoster::new(token.clone()))
    } else if let Some(url) = &config.slack.webhook_url {
        Arc::new(SlackWebhookPoster::new(url.clone()))
    } else {
        tracing::warn!("no Slack transport configured, notifications are dropped");
        Arc::new(NoopSlackPoster)
    };

    let window_store = Arc::new(WindowStore::default());
    let mut compiler = Compiler::new(window_store.clone());
    if let Some(prom_url) = &config.prom_url {
        let provider: Arc<dyn MetricsProvider> = Arc::new(rules::prom::PromProvider::new(prom_url.clone()));
        compiler = compiler.with_provider(provider);
        tracing::info!("metrics provider: prometheus");
    } else if let Some(ch_dsn) = &config.ch_dsn {
        let provider: Arc<dyn MetricsProvider> =
            Arc::new(rules::clickhouse::ChProvider::new(ch_dsn.clone()));
        compiler = compiler.with_provider(provider);
        tracing::info!("metrics provider: clickhouse");
    }

    let registry = if std::path::Path::new(&config.rules_dir).is_dir() {
        let registry = RuleRegistry::load_dir(&compiler, &config.rules_dir)?;
        tracing::info!(rules = registry.len(), dir = %config.rules_dir, "rules loaded");
        registry
    } else {
        tracing::warn!(dir = %config.rules_dir, "rules directory missing, registry is empty");
        RuleRegistry::default()
    };

    let store = Arc::new(ExceptionStore::new(pool, dialect));
    let service = Arc::new(ExceptionService::new(
        store.clone(),
        slack.clone(),
        config.approvers.clone(),
        config.secops_channel.clone(),
    ));
    let enforcer = Enforcer::new(
        slack.clone(),
        config.slack.channel.clone(),
        config.secops_channel.clone(),
    );

    let shutdown = CancellationToken::new();

    let reminders = Arc::new(ReminderSweepJob::new(
        store.clone(),
        slack.clone(),
        config.secops_channel.clone(),
        chrono::Duration::hours(config.sweeper.reminder_lead_hours as i64),
        chrono::Duration::hours(config.sweeper.reminder_window_hours as i64),
        clock::system_clock(),
    ));
    let expiry = Arc::new(ExpirySweepJob::new(store.clone(), clock::system_clock()));
    let mut scheduler = JobScheduler::new(
        reminders,
        expiry,
        config.sweeper.clone(),
        shutdown.child_token(),
    )
    .await?;
    scheduler.start().await?;

    let app_state = Arc::new(AppState {
        service,
        registry,
        enforcer,
        shutdown: shutdown.clone(),
    });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    let app = Router::new()
        .route("/health", get(handlers::health_check))
        .nest("/exceptions", handlers::exception_routes())
        .nest("/rules", handlers::rule_routes())
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()).layer(cors))
        .with_state(app_state);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    tracing::info!("exceptions service listening on {}", config.listen_addr);

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            shutdown.cancel();
        });
    }

    let drain = shutdown.clone();
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        drain.cancelled().await;
    });

    let grace = shutdown.clone();
    tokio::select! {
        result = server => result?,
        _ = async {
            grace.cancelled().await;
            tokio::time::sleep(SHUTDOWN_GRACE).await;
        } => {
            tracing::warn!("drain grace elapsed, closing remaining connections");
        }
    }

    scheduler.shutdown().await?;
    tracing::info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
}
