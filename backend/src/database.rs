use sqlx::any::AnyPoolOptions;
use sqlx::AnyPool;
use std::time::Duration;

/// SQL placeholder dialect of the active pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Sqlite,
    Postgres,
}

impl Dialect {
    /// Detect the dialect from the connection URL, honoring a DB_DRIVER override.
    pub fn detect(database_url: &str, driver_override: Option<&str>) -> Dialect {
        if let Some(driver) = driver_override {
            return match driver.to_ascii_lowercase().as_str() {
                "postgres" | "postgresql" | "pg" => Dialect::Postgres,
                _ => Dialect::Sqlite,
            };
        }
        if database_url.starts_with("postgres://") || database_url.starts_with("postgresql://") {
            Dialect::Postgres
        } else {
            Dialect::Sqlite
        }
    }

    /// Produce the placeholder for the nth parameter (1-indexed).
    pub fn placeholder(&self, n: usize) -> String {
        match self {
            Dialect::Sqlite => "?".to_string(),
            Dialect::Postgres => format!("${}", n),
        }
    }
}

/// Database pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of connections in the pool
    pub max_connections: u32,
    /// Maximum time to wait for a connection
    pub acquire_timeout: Duration,
}

impl PoolConfig {
    /// Embedded stores get a single writer; server stores get a real pool.
    pub fn for_dialect(dialect: Dialect) -> Self {
        match dialect {
            Dialect::Sqlite => Self {
                max_connections: 1,
                acquire_timeout: Duration::from_secs(30),
            },
            Dialect::Postgres => Self {
                max_connections: 20,
                acquire_timeout: Duration::from_secs(30),
            },
        }
    }
}

/// Create a database connection pool for the configured store.
pub async fn create_pool(database_url: &str, dialect: Dialect) -> anyhow::Result<AnyPool> {
    sqlx::any::install_default_drivers();
    let config = PoolConfig::for_dialect(dialect);

    let pool = AnyPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(config.acquire_timeout)
        .connect(database_url)
        .await?;

    tracing::info!(
        "Database pool created: dialect={:?}, max={}",
        dialect,
        config.max_connections
    );

    Ok(pool)
}

/// Create the exceptions, audit, and usage tables if they do not exist.
///
/// Time columns are stored as UTC RFC 3339 text so that lexicographic order
/// matches chronological order on both backends.
pub async fn init_schema(pool: &AnyPool, dialect: Dialect) -> anyhow::Result<()> {
    let id_column = match dialect {
        Dialect::Sqlite => "INTEGER PRIMARY KEY AUTOINCREMENT",
        Dialect::Postgres => "BIGSERIAL PRIMARY KEY",
    };

    let statements = [
        format!(
            "CREATE TABLE IF NOT EXISTS exceptions (
                id {id_column},
                rule_id TEXT NOT NULL,
                org_id TEXT,
                subject_type TEXT,
                subject_id TEXT,
                requested_by TEXT,
                reason TEXT,
                status TEXT NOT NULL DEFAULT 'pending',
                valid_from TEXT,
                valid_until TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                slack_channel TEXT,
                slack_ts TEXT
            )"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS exception_events (
                id {id_column},
                exception_id BIGINT NOT NULL,
                actor TEXT,
                action TEXT NOT NULL,
                note TEXT,
                at TEXT NOT NULL
            )"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS usage_events (
                id {id_column},
                ts TEXT NOT NULL,
                org_id BIGINT NOT NULL,
                user_id BIGINT NOT NULL,
                feature TEXT NOT NULL,
                tool TEXT NOT NULL,
                count BIGINT NOT NULL,
                latency_ms BIGINT,
                outcome TEXT NOT NULL,
                sampling_rate DOUBLE PRECISION NOT NULL
            )"
        ),
        "CREATE INDEX IF NOT EXISTS ix_exc_approved \
         ON exceptions(status, valid_from, valid_until)"
            .to_string(),
        "CREATE INDEX IF NOT EXISTS ix_excevts_exc_time \
         ON exception_events(exception_id, action, at)"
            .to_string(),
    ];

    for statement in &statements {
        sqlx::query(statement).execute(pool).await?;
    }
    tracing::info!("Database schema ready");
    Ok(())
}

/// Check database health
pub async fn health_check(pool: &AnyPool) -> bool {
    sqlx::query("SELECT 1").execute(pool).await.is_ok()
}
