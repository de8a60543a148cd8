//! HTTP client for the Core API.
//!
//! The Core API owns the device inventory, live measurements, preference
//! and forecast series, and accepts setpoint/schedule writes. Everything
//! the controller knows about the building flows through this interface;
//! the trait seam keeps the planner, limiter and dispatcher testable
//! without a network.

use crate::domain::{Device, TimeSeries};
use crate::error::ControlError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

/// Weather endpoints expose both measured history and forecasts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeatherScope {
    Historic,
    Forecast,
}

impl WeatherScope {
    fn path_segment(&self) -> &'static str {
        match self {
            WeatherScope::Historic => "historic",
            WeatherScope::Forecast => "forecast",
        }
    }
}

#[async_trait]
pub trait CoreApi: Send + Sync {
    async fn devices(&self) -> Result<Vec<Device>, ControlError>;

    async fn device_state(&self, device_id: &str, field: Option<&str>)
        -> Result<f64, ControlError>;

    /// Current total building consumption in kW, positive for draw.
    async fn building_consumption(&self) -> Result<f64, ControlError>;

    async fn preferences(
        &self,
        preference_type: &str,
        device_id: &str,
        start: DateTime<Utc>,
        stop: DateTime<Utc>,
    ) -> Result<TimeSeries, ControlError>;

    async fn historic(
        &self,
        historic_type: &str,
        start: DateTime<Utc>,
        stop: DateTime<Utc>,
        device_id: Option<&str>,
    ) -> Result<TimeSeries, ControlError>;

    async fn weather(
        &self,
        scope: WeatherScope,
        variable: &str,
        start: DateTime<Utc>,
        stop: DateTime<Utc>,
    ) -> Result<TimeSeries, ControlError>;

    async fn non_controllable_forecast(
        &self,
        variable: &str,
        start: DateTime<Utc>,
        stop: DateTime<Utc>,
    ) -> Result<TimeSeries, ControlError>;

    async fn post_setpoint(&self, device_id: &str, setpoint: f64) -> Result<(), ControlError>;

    async fn post_schedule(
        &self,
        priority: i64,
        body: &serde_json::Value,
    ) -> Result<(), ControlError>;
}

/// `GET /devices` envelope.
#[derive(Debug, Deserialize)]
struct DevicesEnvelope {
    content: Vec<Device>,
}

/// `GET /building/consumption` payload. The meter reports consumption as
/// negative; the sign is flipped so positive means draw from the grid.
#[derive(Debug, Deserialize)]
struct ConsumptionPayload {
    total_consumption: f64,
}

const MAX_GET_ATTEMPTS: u32 = 3;
const RETRY_BACKOFF_MS: u64 = 250;

pub struct HttpCoreApi {
    client: Client,
    base_url: String,
}

impl HttpCoreApi {
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        Self {
            client: Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    /// GET with bounded retry. Transient failures (connect errors,
    /// timeouts, 5xx) are retried up to three times with a short backoff,
    /// then surfaced as `DATA_UNAVAILABLE` for the cycle.
    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, ControlError> {
        let url = self.url(path);
        let mut last_error = String::new();
        for attempt in 1..=MAX_GET_ATTEMPTS {
            let result = self.client.get(&url).query(query).send().await;
            match result {
                Ok(response) if response.status().is_success() => {
                    return response.json::<T>().await.map_err(|e| {
                        ControlError::DataUnavailable(format!("{url}: malformed body: {e}"))
                    });
                }
                Ok(response) if response.status().is_client_error() => {
                    return Err(ControlError::DataUnavailable(format!(
                        "{url}: status {}",
                        response.status()
                    )));
                }
                Ok(response) => {
                    last_error = format!("status {}", response.status());
                }
                Err(e) => {
                    last_error = e.to_string();
                }
            }
            if attempt < MAX_GET_ATTEMPTS {
                debug!(url = %url, attempt, error = %last_error, "retrying core api call");
                tokio::time::sleep(Duration::from_millis(RETRY_BACKOFF_MS * attempt as u64)).await;
            }
        }
        warn!(url = %url, error = %last_error, "core api call exhausted retries");
        Err(ControlError::DataUnavailable(format!("{url}: {last_error}")))
    }

    async fn post_json(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<(), ControlError> {
        let url = self.url(path);
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| ControlError::WriteFailed(format!("{url}: {e}")))?;
        if !response.status().is_success() {
            return Err(ControlError::WriteFailed(format!(
                "{url}: status {}",
                response.status()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl CoreApi for HttpCoreApi {
    async fn devices(&self) -> Result<Vec<Device>, ControlError> {
        let envelope: DevicesEnvelope = self.get_json("/devices", &[]).await?;
        Ok(envelope.content)
    }

    async fn device_state(
        &self,
        device_id: &str,
        field: Option<&str>,
    ) -> Result<f64, ControlError> {
        let path = format!("/devices/state/{device_id}");
        let mut query = Vec::new();
        if let Some(field) = field {
            query.push(("field", field.to_string()));
        }
        self.get_json(&path, &query).await
    }

    async fn building_consumption(&self) -> Result<f64, ControlError> {
        let payload: ConsumptionPayload = self.get_json("/building/consumption", &[]).await?;
        Ok(-payload.total_consumption)
    }

    async fn preferences(
        &self,
        preference_type: &str,
        device_id: &str,
        start: DateTime<Utc>,
        stop: DateTime<Utc>,
    ) -> Result<TimeSeries, ControlError> {
        self.get_json(
            "/preferences",
            &[
                ("type", preference_type.to_string()),
                ("device_id", device_id.to_string()),
                ("start", start.to_rfc3339()),
                ("stop", stop.to_rfc3339()),
            ],
        )
        .await
    }

    async fn historic(
        &self,
        historic_type: &str,
        start: DateTime<Utc>,
        stop: DateTime<Utc>,
        device_id: Option<&str>,
    ) -> Result<TimeSeries, ControlError> {
        let mut query = vec![
            ("type", historic_type.to_string()),
            ("start", start.to_rfc3339()),
            ("stop", stop.to_rfc3339()),
        ];
        if let Some(device_id) = device_id {
            query.push(("device_id", device_id.to_string()));
        }
        self.get_json("/historic", &query).await
    }

    async fn weather(
        &self,
        scope: WeatherScope,
        variable: &str,
        start: DateTime<Utc>,
        stop: DateTime<Utc>,
    ) -> Result<TimeSeries, ControlError> {
        let path = format!("/weather/{}", scope.path_segment());
        self.get_json(
            &path,
            &[
                ("variable", variable.to_string()),
                ("start", start.to_rfc3339()),
                ("stop", stop.to_rfc3339()),
            ],
        )
        .await
    }

    async fn non_controllable_forecast(
        &self,
        variable: &str,
        start: DateTime<Utc>,
        stop: DateTime<Utc>,
    ) -> Result<TimeSeries, ControlError> {
        self.get_json(
            "/forecast/non_controllable",
            &[
                ("variable", variable.to_string()),
                ("start", start.to_rfc3339()),
                ("stop", stop.to_rfc3339()),
            ],
        )
        .await
    }

    async fn post_setpoint(&self, device_id: &str, setpoint: f64) -> Result<(), ControlError> {
        let path = format!("/devices/setpoint/{device_id}");
        self.post_json(&path, &serde_json::json!({ "setpoint": setpoint }))
            .await
    }

    async fn post_schedule(
        &self,
        priority: i64,
        body: &serde_json::Value,
    ) -> Result<(), ControlError> {
        let path = format!("/devices/schedule/{priority}");
        self.post_json(&path, body).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_trailing_slash_is_normalized() {
        let api = HttpCoreApi::new("http://localhost:8000/", Duration::from_secs(5));
        assert_eq!(api.url("/devices"), "http://localhost:8000/devices");
    }

    #[test]
    fn consumption_sign_is_flipped() {
        let payload: ConsumptionPayload =
            serde_json::from_str(r#"{"total_consumption": -6.2}"#).unwrap();
        assert!((-payload.total_consumption - 6.2).abs() < f64::EPSILON);
    }
}
