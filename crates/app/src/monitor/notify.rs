//! Outbound fall notifications.
//!
//! The pipeline gates dispatch through [`Cooldown`] and hands alerts to an
//! [`AlertSink`]. [`WebhookDispatcher`] delivers them on its own runtime so a
//! slow or unreachable receiver never holds up frame processing.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::runtime::{Builder, Runtime};
use tracing::{debug, error, info, warn};
use video_ingest::Frame;

use crate::monitor::{config::NotifyConfig, data::SessionId, encoding::prepare_snapshot};

/// Minimum spacing between dispatches for one session.
#[derive(Debug)]
pub(crate) struct Cooldown {
    window: Duration,
    last: Option<Instant>,
}

impl Cooldown {
    pub(crate) fn new(window: Duration) -> Self {
        Self { window, last: None }
    }

    /// Claim the dispatch slot. The window restarts at the moment of the claim.
    pub(crate) fn try_acquire(&mut self, now: Instant) -> bool {
        match self.last {
            Some(last) if now.saturating_duration_since(last) <= self.window => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}

/// A confirmed fall, ready to be reported.
#[derive(Clone)]
pub(crate) struct FallAlert {
    pub(crate) session_id: SessionId,
    pub(crate) confidence: f32,
    /// Raw frame captured when the fall was confirmed.
    pub(crate) snapshot: Option<Arc<Frame>>,
    pub(crate) detected_at: DateTime<Utc>,
}

/// Fire-and-forget receiver of fall alerts. `dispatch` must return promptly.
pub(crate) trait AlertSink: Send + Sync {
    fn dispatch(&self, alert: FallAlert);
}

#[derive(Debug, Serialize)]
pub(crate) struct FallAlertPayload {
    pub(crate) session_id: SessionId,
    pub(crate) confidence_score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) snapshot_base64: Option<String>,
}

impl FallAlertPayload {
    pub(crate) fn new(alert: &FallAlert, snapshot_base64: Option<String>) -> Self {
        Self {
            session_id: alert.session_id.clone(),
            confidence_score: (f64::from(alert.confidence) * 100.0).round() / 100.0,
            snapshot_base64,
        }
    }
}

#[derive(Deserialize)]
struct WebhookAck {
    #[serde(default)]
    alert_id: Option<serde_json::Value>,
}

/// Delivers alerts to the configured webhook.
pub(crate) struct WebhookDispatcher {
    runtime: Option<Runtime>,
    client: Client,
    config: Arc<NotifyConfig>,
}

impl WebhookDispatcher {
    pub(crate) fn new(config: NotifyConfig) -> Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("notify")
            .enable_all()
            .build()
            .context("failed to build notification runtime")?;
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .context("failed to build webhook client")?;
        Ok(Self {
            runtime: Some(runtime),
            client,
            config: Arc::new(config),
        })
    }
}

impl AlertSink for WebhookDispatcher {
    fn dispatch(&self, alert: FallAlert) {
        let Some(runtime) = self.runtime.as_ref() else {
            warn!(session = %alert.session_id, "notification runtime is gone; alert dropped");
            return;
        };
        let client = self.client.clone();
        let config = Arc::clone(&self.config);
        runtime.spawn(async move {
            let snapshot = match alert.snapshot.clone() {
                Some(frame) => encode_snapshot(frame, &config).await,
                None => None,
            };
            let payload = FallAlertPayload::new(&alert, snapshot);
            debug!(
                session = %alert.session_id,
                detected_at = %alert.detected_at,
                has_snapshot = payload.snapshot_base64.is_some(),
                "dispatching fall alert"
            );
            deliver(&client, &config, &payload).await;
        });
    }
}

impl Drop for WebhookDispatcher {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

async fn encode_snapshot(frame: Arc<Frame>, config: &NotifyConfig) -> Option<String> {
    let (max_width, quality) = (config.snapshot_max_width, config.snapshot_quality);
    match tokio::task::spawn_blocking(move || prepare_snapshot(&frame, max_width, quality)).await {
        Ok(Ok(encoded)) => Some(encoded),
        Ok(Err(err)) => {
            warn!("snapshot encoding failed, sending alert without it: {err:#}");
            None
        }
        Err(err) => {
            warn!("snapshot encoding task failed: {err}");
            None
        }
    }
}

/// Post `payload` to the webhook. Only `201 Created` counts as delivered.
///
/// Timeouts and unexpected statuses are retried up to `max_retries` attempts in
/// total; a connection failure ends delivery at once.
pub(crate) async fn deliver(
    client: &Client,
    config: &NotifyConfig,
    payload: &FallAlertPayload,
) -> bool {
    let attempts = config.max_retries.max(1);
    for attempt in 1..=attempts {
        let request = client
            .post(&config.webhook_url)
            .timeout(config.timeout)
            .json(payload);
        match request.send().await {
            Ok(response) if response.status() == StatusCode::CREATED => {
                let alert_id = response
                    .json::<WebhookAck>()
                    .await
                    .ok()
                    .and_then(|ack| ack.alert_id);
                match alert_id {
                    Some(id) => info!(session = %payload.session_id, %id, "fall alert delivered"),
                    None => info!(session = %payload.session_id, "fall alert delivered"),
                }
                metrics::counter!("fallwatch_notifications_total", "outcome" => "delivered")
                    .increment(1);
                return true;
            }
            Ok(response) => {
                warn!(
                    attempt,
                    attempts,
                    status = %response.status(),
                    "webhook did not accept fall alert"
                );
            }
            Err(err) if err.is_timeout() => {
                warn!(attempt, attempts, "webhook request timed out");
            }
            Err(err) if err.is_connect() => {
                error!("webhook unreachable at {}: {err}", config.webhook_url);
                metrics::counter!("fallwatch_notifications_total", "outcome" => "failed")
                    .increment(1);
                return false;
            }
            Err(err) => {
                error!("webhook request failed: {err}");
                metrics::counter!("fallwatch_notifications_total", "outcome" => "failed")
                    .increment(1);
                return false;
            }
        }
        if attempt < attempts {
            tokio::time::sleep(config.retry_delay).await;
        }
    }
    error!(attempts, "giving up on fall alert for session {}", payload.session_id);
    metrics::counter!("fallwatch_notifications_total", "outcome" => "failed").increment(1);
    false
}
