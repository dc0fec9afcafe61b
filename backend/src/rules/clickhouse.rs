//! Column-store metrics provider speaking the ClickHouse HTTP interface.

use super::metrics::{ch_window, clamp01, MetricsProvider, ProviderError, Selector};
use chrono::Duration;
use std::sync::OnceLock;

/// Executes scalar SQL selectors against a ClickHouse endpoint (CH_DSN).
/// Queries are posted to the HTTP interface and the single result value is
/// scanned from the response body.
pub struct ChProvider {
    endpoint: String,
    client: OnceLock<reqwest::blocking::Client>,
    timeout: std::time::Duration,
}

impl ChProvider {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
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

impl MetricsProvider for ChProvider {
    fn rate(&self, selector: &Selector, window: Duration) -> Result<f64, ProviderError> {
        if self.endpoint.is_empty() {
            return Err(ProviderError::NotConfigured("clickhouse"));
        }
        let query = selector
            .chsql
            .as_deref()
            .filter(|q| !q.is_empty())
            .ok_or(ProviderError::EmptySelector)?;

        let query = query.replace("{{window}}", &ch_window(window));

        let response = self
            .client()
            .post(&self.endpoint)
            .body(query)
            .send()
            .map_err(|e| ProviderError::Query(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .map_err(|e| ProviderError::Decode(e.to_string()))?;
        if !status.is_success() {
            return Err(ProviderError::Query(format!(
                "clickhouse returned {}: {}",
                status,
                body.trim()
            )));
        }

        let scalar = body.trim();
        if scalar.is_empty() {
            return Err(ProviderError::Decode("empty scalar result".to_string()));
        }
        let value: f64 = scalar
            .parse()
            .map_err(|_| ProviderError::Decode(format!("bad scalar {:?}", scalar)))?;
        Ok(clamp01(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string_contains, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn selector() -> Selector {
        Selector {
            promql: None,
            chsql: Some(
                "SELECT countIf(deny_reason='consent_required')/count() \
                 FROM audit_events WHERE ts >= now() - INTERVAL {{window}}"
                    .to_string(),
            ),
        }
    }

    async fn rate_via_blocking(
        provider: ChProvider,
        selector: Selector,
        window: Duration,
    ) -> Result<f64, ProviderError> {
        tokio::task::spawn_blocking(move || provider.rate(&selector, window))
            .await
            .expect("join")
    }

    #[tokio::test]
    async fn substitutes_interval_and_scans_scalar() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_string_contains("INTERVAL 15 MINUTE"))
            .respond_with(ResponseTemplate::new(200).set_body_string("0.31\n"))
            .mount(&server)
            .await;

        let provider = ChProvider::new(server.uri());
        let value = rate_via_blocking(provider, selector(), Duration::minutes(15))
            .await
            .unwrap();
        assert!((value - 0.31).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn garbage_scalar_is_a_decode_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not-a-number"))
            .mount(&server)
            .await;

        let provider = ChProvider::new(server.uri());
        let err = rate_via_blocking(provider, selector(), Duration::minutes(5))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Decode(_)));
    }

    #[tokio::test]
    async fn empty_dsn_or_selector_fail() {
        let provider = ChProvider::new("");
        let err = rate_via_blocking(provider, selector(), Duration::minutes(5))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::NotConfigured(_)));

        let provider = ChProvider::new("http://localhost:9");
        let err = rate_via_blocking(provider, Selector::default(), Duration::minutes(5))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::EmptySelector));
    }

    #[tokio::test]
    async fn clamps_negative_values() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("-0.5"))
            .mount(&server)
            .await;

        let provider = ChProvider::new(server.uri());
        let value = rate_via_blocking(provider, selector(), Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(value, 0.0);
    }
}
