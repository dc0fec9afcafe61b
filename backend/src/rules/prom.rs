//! Prometheus range-query metrics provider.

use super::metrics::{clamp01, prom_window, MetricsProvider, ProviderError, Selector};
use chrono::Duration;
use serde::Deserialize;
use std::sync::OnceLock;

/// Evaluates PromQL selectors through the Prometheus HTTP query API.
///
/// The blocking client is built lazily on first use so the provider can be
/// constructed on the async runtime and only ever issues requests from
/// blocking worker threads.
pub struct PromProvider {
    base_url: String,
    client: OnceLock<reqwest::blocking::Client>,
    timeout: std::time::Duration,
}

#[derive(Debug, Deserialize)]
struct PromResponse {
    status: String,
    #[serde(default)]
    data: PromData,
}

#[derive(Debug, Default, Deserialize)]
struct PromData {
    #[serde(default)]
    result: Vec<PromSample>,
}

#[derive(Debug, Deserialize)]
struct PromSample {
    value: (f64, String),
}

impl PromProvider {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client: OnceLock::new(),
            timeout: std::time::Duration::from_secs(5),
        }
    }

    fn client(&self) -> &reqwest::blocking::Client {
        self.client.get_or_init(|| {
            reqwest::blocking::Client::builder()
                .timeout(self.timeout)
                .build()
                .unwrap_or_default()
        })
    }
}

impl MetricsProvider for PromProvider {
    fn rate(&self, selector: &Selector, window: Duration) -> Result<f64, ProviderError> {
        if self.base_url.is_empty() {
            return Err(ProviderError::NotConfigured("prometheus"));
        }
        let query = selector
            .promql
            .as_deref()
            .filter(|q| !q.is_empty())
            .ok_or(ProviderError::EmptySelector)?;

        let query = query.replace("{{window}}", &prom_window(window));

        let response = self
            .client()
            .get(&self.base_url)
            .query(&[("query", query.as_str())])
            .send()
            .map_err(|e| ProviderError::Query(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ProviderError::Query(format!("prometheus returned {}", status)));
        }

        let body: PromResponse = response
            .json()
            .map_err(|e| ProviderError::Decode(e.to_string()))?;

        if body.status != "success" || body.data.result.is_empty() {
            return Ok(0.0);
        }

        let raw = &body.data.result[0].value.1;
        if raw.is_empty() {
            return Ok(0.0);
        }
        let value: f64 = raw
            .parse()
            .map_err(|_| ProviderError::Decode(format!("bad sample value {:?}", raw)))?;
        Ok(clamp01(value))
    }
}
