use std::env;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    /// Forces the SQL placeholder dialect regardless of the URL scheme.
    pub db_driver: Option<String>,
    pub listen_addr: String,
    pub rules_dir: String,
    pub prom_url: Option<String>,
    pub ch_dsn: Option<String>,
    pub slack: SlackConfig,
    /// Default channel for reminders and compliance notifications.
    pub secops_channel: String,
    /// Comma-separated allow-list of approver identifiers. Empty means any
    /// non-empty actor may approve.
    pub approvers: Vec<String>,
    pub sweeper: SweeperConfig,
}

/// Slack routing. A bot token selects the chat.postMessage API; a webhook URL
/// selects the incoming-webhook path. `channel` overrides rule routing.
#[derive(Debug, Clone)]
pub struct SlackConfig {
    pub bot_token: Option<String>,
    pub webhook_url: Option<String>,
    pub channel: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SweeperConfig {
    /// Sweep cadence in minutes.
    pub interval_minutes: u32,
    /// Reminders fire when an expiry falls within [now + lead - window, now + lead].
    pub reminder_lead_hours: u32,
    pub reminder_window_hours: u32,
    /// Upper bound for a single sweep tick (seconds).
    pub tick_timeout_secs: u64,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval_minutes: 15,
            reminder_lead_hours: 24,
            reminder_window_hours: 12,
            tick_timeout_secs: 30,
        }
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = env::var("DATABASE_URL")
            .or_else(|_| env::var("SQLITE_DSN"))
            .unwrap_or_else(|_| "sqlite://gatekeeper.db?mode=rwc".to_string());

        let listen_addr = env::var("EXCEPTIONS_LISTEN")
            .or_else(|_| env::var("EXCEPTIONS_ADDR"))
            .unwrap_or_else(|_| "0.0.0.0:8081".to_string());

        let approvers = env::var("SECOPS_APPROVERS")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let mut sweeper = SweeperConfig::default();
        if let Ok(raw) = env::var("EXCEPTIONS_REMINDER_INTERVAL") {
            if let Ok(n) = raw.parse() {
                sweeper.interval_minutes = n;
            }
        }
        if let Ok(raw) = env::var("EXCEPTIONS_REMINDER_WINDOW") {
            if let Ok(n) = raw.parse() {
                sweeper.reminder_window_hours = n;
            }
        }

        Ok(Config {
            database_url,
            db_driver: env::var("DB_DRIVER").ok(),
            listen_addr,
            rules_dir: env::var("RULES_DIR").unwrap_or_else(|_| "rules".to_string()),
            prom_url: env::var("PROM_URL").ok().filter(|v| !v.is_empty()),
            ch_dsn: env::var("CH_DSN").ok().filter(|v| !v.is_empty()),
            slack: SlackConfig {
                bot_token: env::var("SLACK_BOT_TOKEN").ok().filter(|v| !v.is_empty()),
                webhook_url: env::var("SLACK_WEBHOOK_URL").ok().filter(|v| !v.is_empty()),
                channel: env::var("SLACK_CHANNEL").ok().filter(|v| !v.is_empty()),
            },
            secops_channel: env::var("SECOPS_CHANNEL")
                .unwrap_or_else(|_| "#secops".to_string()),
            approvers,
            sweeper,
        })
    }
}

impl SlackConfig {
    /// Check if any Slack transport is configured
    pub fn is_configured(&self) -> bool {
        self.bot_token.is_some() || self.webhook_url.is_some()
    }
}
