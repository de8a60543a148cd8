//! Message bus integration.
//!
//! Planning requests arrive on the single `mpc` topic as a JSON envelope;
//! an empty or missing `params` object means "stop the real-time
//! limiter". Acks and user notifications are published on sibling
//! channels. The transport is Redis pub/sub; the dispatcher only sees the
//! [`Acker`]/[`Notifier`] seams and the parsed [`PlanningRequest`], so
//! everything above the transport is testable in-process.

use crate::domain::TimeSeries;
use crate::error::ControlError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

pub const REQUEST_TOPIC: &str = "mpc";
pub const ACK_CHANNEL: &str = "mpc:ack";
pub const NOTIFY_CHANNEL: &str = "mpc:notify";

/// Envelope received on the `mpc` topic.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanningRequest {
    #[serde(default)]
    pub params: Option<PlanningParams>,
}

/// Parameters of a non-empty planning request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanningParams {
    pub start: DateTime<Utc>,
    pub stop: DateTime<Utc>,
    /// Step length in minutes.
    pub interval: i64,
    pub price_profile: TimeSeries,
    pub power_limit: TimeSeries,
    #[serde(default)]
    pub space_heating: bool,
    #[serde(default)]
    pub electric_storage: bool,
    #[serde(default)]
    pub electric_vehicle: bool,
    #[serde(default)]
    pub water_heater: bool,
}

/// Publishes boolean acks for planning requests.
#[async_trait]
pub trait Acker: Send + Sync {
    async fn ack(&self, ok: bool, detail: &str);
}

/// Emits user-facing notifications (limiter out of options, etc.).
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, message: &str);
}

#[derive(Debug, Serialize)]
struct AckPayload<'a> {
    ok: bool,
    detail: &'a str,
}

#[derive(Debug, Serialize)]
struct NotifyPayload<'a> {
    message: &'a str,
    at: DateTime<Utc>,
}

/// Redis-backed bus endpoint.
#[derive(Clone)]
pub struct RedisBus {
    client: redis::Client,
}

impl RedisBus {
    pub fn connect(url: &str) -> Result<Self, ControlError> {
        let client = redis::Client::open(url)
            .map_err(|e| ControlError::ConfigInvalid(format!("bus url: {e}")))?;
        Ok(Self { client })
    }

    async fn publish(&self, channel: &str, payload: String) -> Result<(), ControlError> {
        let mut connection = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| ControlError::BusTransient(e.to_string()))?;
        connection
            .publish::<_, _, ()>(channel, payload)
            .await
            .map_err(|e| ControlError::BusTransient(e.to_string()))
    }

    /// Subscribe to the request topic and feed the dispatcher until the
    /// connection drops. The caller owns the reconnect policy.
    pub async fn run(
        &self,
        dispatcher: std::sync::Arc<crate::dispatcher::Dispatcher>,
    ) -> Result<(), ControlError> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| ControlError::BusTransient(e.to_string()))?;
        pubsub
            .subscribe(REQUEST_TOPIC)
            .await
            .map_err(|e| ControlError::BusTransient(e.to_string()))?;
        info!(topic = REQUEST_TOPIC, "subscribed to planning requests");

        let mut stream = pubsub.on_message();
        while let Some(message) = stream.next().await {
            let payload: String = match message.get_payload() {
                Ok(p) => p,
                Err(e) => {
                    warn!(error = %e, "undecodable bus message payload");
                    continue;
                }
            };
            let request: PlanningRequest = match serde_json::from_str(&payload) {
                Ok(r) => r,
                Err(e) => {
                    error!(error = %e, "malformed planning request");
                    self.ack(false, "malformed planning request").await;
                    continue;
                }
            };
            let accepted = dispatcher.clone().handle_request(request).await;
            self.ack(accepted, if accepted { "accepted" } else { "rejected" })
                .await;
        }
        Err(ControlError::BusTransient(
            "request subscription ended".into(),
        ))
    }
}

#[async_trait]
impl Acker for RedisBus {
    async fn ack(&self, ok: bool, detail: &str) {
        let payload = serde_json::to_string(&AckPayload { ok, detail })
            .unwrap_or_else(|_| String::from("{\"ok\":false}"));
        if let Err(e) = self.publish(ACK_CHANNEL, payload).await {
            warn!(error = %e, "failed to publish ack");
        }
    }
}

#[async_trait]
impl Notifier for RedisBus {
    async fn notify(&self, message: &str) {
        let payload = serde_json::to_string(&NotifyPayload {
            message,
            at: Utc::now(),
        })
        .unwrap_or_else(|_| String::from("{}"));
        if let Err(e) = self.publish(NOTIFY_CHANNEL, payload).await {
            warn!(error = %e, "failed to publish notification");
        }
    }
}

/// Notifier that only logs; used when no bus is wired (tests, dry runs).
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, message: &str) {
        warn!(message, "user notification");
    }
}
