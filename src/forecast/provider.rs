//! Hourly forecast provider

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value;
use std::time::Duration;

use super::HourlySeries;
use crate::config::ProviderConfig;
use crate::error::TaskFailure;

#[async_trait]
pub trait WeatherProvider: Send + Sync {
    /// Hourly values of `measures` at (`lat`, `lon`)
    async fn hourly(&self, lat: f64, lon: f64, measures: &[&str]) -> Result<HourlySeries, TaskFailure>;
}

/// Client for the Open-Meteo forecast API
#[derive(Debug, Clone)]
pub struct OpenMeteoClient {
    client: reqwest::Client,
    base_url: String,
}

impl OpenMeteoClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.to_string(),
        })
    }

    pub fn from_config(config: &ProviderConfig) -> Result<Self> {
        Self::new(&config.base_url, config.timeout())
    }
}

/// Map a non-200 response to a failure
pub fn classify_status(status: StatusCode, body: &str) -> TaskFailure {
    let detail = format!("Failed to fetch weather: HTTP {}: {}", status.as_u16(), body.trim());
    if status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
    {
        TaskFailure::Transient(detail)
    } else {
        TaskFailure::Permanent(detail)
    }
}

#[async_trait]
impl WeatherProvider for OpenMeteoClient {
    async fn hourly(&self, lat: f64, lon: f64, measures: &[&str]) -> Result<HourlySeries, TaskFailure> {
        let response = self
            .client
            .get(&self.base_url)
            .query(&[
                ("latitude", lat.to_string()),
                ("longitude", lon.to_string()),
                ("hourly", measures.join(",")),
            ])
            .send()
            .await
            .map_err(TaskFailure::transient)?;

        let status = response.status();
        if status != StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| TaskFailure::permanent(format!("response is not JSON: {}", e)))?;

        HourlySeries::from_response(&body, measures)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn client(server: &MockServer) -> OpenMeteoClient {
        OpenMeteoClient::new(&format!("{}/v1/forecast", server.uri()), Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_fetches_requested_measures() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/forecast"))
            .and(query_param("latitude", "51.5"))
            .and(query_param("longitude", "-0.12"))
            .and(query_param("hourly", "rain,cloudcover"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "hourly": {
                    "time": ["2024-01-01T00:00"],
                    "rain": [1.5],
                    "cloudcover": [50]
                }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let series = client(&server)
            .await
            .hourly(51.5, -0.12, &["rain", "cloudcover"])
            .await
            .unwrap();

        assert_eq!(series.first("rain").unwrap(), 1.5);
        assert_eq!(series.first("cloudcover").unwrap(), 50.0);
    }

    #[tokio::test]
    async fn test_server_errors_are_transient() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503).set_body_string("upstream unavailable"))
            .mount(&server)
            .await;

        let failure = client(&server).await.hourly(0.0, 0.0, &["rain"]).await.unwrap_err();
        assert!(matches!(failure, TaskFailure::Transient(ref m) if m.contains("503")));
    }

    #[tokio::test]
    async fn test_client_errors_are_permanent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": true,
                "reason": "Latitude must be in range of -90 to 90°."
            })))
            .mount(&server)
            .await;

        let failure = client(&server).await.hourly(91.0, 0.0, &["rain"]).await.unwrap_err();
        assert!(!failure.is_retryable());
    }

    #[tokio::test]
    async fn test_bad_shape_is_permanent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"hourly": {"time": []}})))
            .mount(&server)
            .await;

        let failure = client(&server).await.hourly(0.0, 0.0, &["rain"]).await.unwrap_err();
        assert!(matches!(failure, TaskFailure::Permanent(_)));
    }

    #[tokio::test]
    async fn test_connection_refused_is_transient() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = OpenMeteoClient::new(&format!("http://{}/v1/forecast", addr), Duration::from_secs(1)).unwrap();
        let failure = client.hourly(0.0, 0.0, &["rain"]).await.unwrap_err();
        assert!(matches!(failure, TaskFailure::Transient(_)));
    }

    #[test]
    fn test_classify_status() {
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, "").is_retryable());
        assert!(classify_status(StatusCode::REQUEST_TIMEOUT, "").is_retryable());
        assert!(classify_status(StatusCode::BAD_GATEWAY, "").is_retryable());
        assert!(!classify_status(StatusCode::NOT_FOUND, "").is_retryable());
        assert!(!classify_status(StatusCode::NO_CONTENT, "").is_retryable());
    }
}
