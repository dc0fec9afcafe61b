//! Metrics provider abstraction for window-aggregate rules.

use chrono::Duration;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Backend-specific query fragments with `{{window}}` placeholders resolved
/// at call time.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Selector {
    #[serde(rename = "prom", default, skip_serializing_if = "Option::is_none")]
    pub promql: Option<String>,
    #[serde(rename = "ch", default, skip_serializing_if = "Option::is_none")]
    pub chsql: Option<String>,
}

impl Selector {
    pub fn is_empty(&self) -> bool {
        self.promql.is_none() && self.chsql.is_none()
    }
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("{0} provider is not configured")]
    NotConfigured(&'static str),

    #[error("selector is empty")]
    EmptySelector,

    #[error("query failed: {0}")]
    Query(String),

    #[error("decode failed: {0}")]
    Decode(String),

    #[error("provider returned invalid value {0}")]
    InvalidValue(f64),
}

/// Access to a time-series backend that can compute aggregate rates.
///
/// Implementations are synchronous on purpose: they are invoked from inside
/// CEL function bindings, which run on a blocking worker thread.
pub trait MetricsProvider: Send + Sync {
    /// Return a fraction in [0, 1] for the selector over the trailing window
    /// `(now - window, now]`.
    fn rate(&self, selector: &Selector, window: Duration) -> Result<f64, ProviderError>;
}

/// Parse a rule window string such as `90s`, `15m`, `6h` or `7d`.
pub fn parse_window(raw: &str) -> Result<Duration, String> {
    let raw = raw.trim();
    if raw.len() < 2 {
        return Err(format!("invalid duration {:?}", raw));
    }
    let (number, unit) = raw.split_at(raw.len() - 1);
    let value: i64 = number
        .parse()
        .map_err(|_| format!("invalid duration {:?}", raw))?;
    if value < 0 {
        return Err(format!("invalid duration {:?}", raw));
    }
    match unit {
        "s" => Ok(Duration::seconds(value)),
        "m" => Ok(Duration::minutes(value)),
        "h" => Ok(Duration::hours(value)),
        "d" => Ok(Duration::days(value)),
        _ => Err(format!("invalid duration {:?}", raw)),
    }
}

/// Format a window for PromQL range selectors, preferring the coarsest unit
/// that divides the window evenly.
pub fn prom_window(window: Duration) -> String {
    let seconds = window.num_seconds();
    if seconds % 3600 == 0 {
        format!("{}h", seconds / 3600)
    } else if seconds % 60 == 0 {
        format!("{}m", seconds / 60)
    } else {
        format!("{}s", seconds)
    }
}

/// Format a window for column-store SQL `INTERVAL` expressions.
pub fn ch_window(window: Duration) -> String {
    let seconds = window.num_seconds();
    if seconds % 3600 == 0 {
        format!("{} HOUR", seconds / 3600)
    } else if seconds % 60 == 0 {
        format!("{} MINUTE", seconds / 60)
    } else {
        format!("{} SECOND", seconds)
    }
}

pub(crate) fn clamp01(value: f64) -> f64 {
    value.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_window_units() {
        assert_eq!(parse_window("90s").unwrap(), Duration::seconds(90));
        assert_eq!(parse_window("15m").unwrap(), Duration::minutes(15));
        assert_eq!(parse_window("6h").unwrap(), Duration::hours(6));
        assert_eq!(parse_window("7d").unwrap(), Duration::days(7));
        assert!(parse_window("abc").is_err());
        assert!(parse_window("").is_err());
        assert!(parse_window("-5m").is_err());
    }

    #[test]
    fn prom_window_prefers_coarse_units() {
        assert_eq!(prom_window(Duration::hours(2)), "2h");
        assert_eq!(prom_window(Duration::minutes(15)), "15m");
        assert_eq!(prom_window(Duration::seconds(90)), "90s");
    }

    #[test]
    fn ch_window_prefers_coarse_units() {
        assert_eq!(ch_window(Duration::hours(1)), "1 HOUR");
        assert_eq!(ch_window(Duration::minutes(30)), "30 MINUTE");
        assert_eq!(ch_window(Duration::seconds(45)), "45 SECOND");
    }

    #[test]
    fn selector_yaml_keys() {
        let sel: Selector =
            serde_yaml::from_str("prom: sum(rate(x[{{window}}]))\nch: SELECT 1").unwrap();
        assert!(sel.promql.unwrap().contains("{{window}}"));
        assert_eq!(sel.chsql.unwrap(), "SELECT 1");
    }
}
