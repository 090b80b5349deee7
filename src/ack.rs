use crate::outcome::BestEffort;
use crate::request::InboundEvent;
use crate::signature;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::Serialize;
use serde_json::Value;
use std::{sync::Arc, time::Duration};
use tracing::{info, warn};

pub const ACK_TIMEOUT: Duration = Duration::from_secs(10);

/// What the ACK stage did, reported verbatim in the `ack` field of the response.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AckReport {
    pub attempted: bool,
    pub ack_url: Option<String>,
    pub http_status: Option<u16>,
    pub curl_error: Option<String>,
    pub response_json: Option<Value>,
}

impl AckReport {
    pub fn skipped() -> Self {
        Self {
            attempted: false,
            ack_url: None,
            http_status: None,
            curl_error: None,
            response_json: None,
        }
    }

    fn failed(url: &str, error: String) -> Self {
        Self {
            attempted: true,
            ack_url: Some(url.to_string()),
            http_status: None,
            curl_error: Some(error),
            response_json: None,
        }
    }
}

#[derive(Debug, Serialize)]
struct AckPayload<'a> {
    success: bool,
    request_id: &'a str,
    event_type: &'a str,
    received_at: String,
    receiver: &'a str,
    environment: &'a str,
}

#[derive(Debug, Clone)]
pub struct AckResponse {
    pub status: u16,
    pub body: String,
}

#[async_trait]
pub trait AckSender: Send + Sync {
    async fn post(&self, url: Url, headers: Vec<(&'static str, String)>, body: Vec<u8>) -> Result<AckResponse>;
}

#[derive(Debug, Clone)]
pub struct HttpAckSender {
    client: Client,
}

impl HttpAckSender {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .timeout(ACK_TIMEOUT)
            .build()
            .context("Failed to build ACK HTTP client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl AckSender for HttpAckSender {
    async fn post(&self, url: Url, headers: Vec<(&'static str, String)>, body: Vec<u8>) -> Result<AckResponse> {
        let mut request = self.client.post(url).body(body);
        for (name, value) in headers {
            request = request.header(name, value);
        }
        let response = request.send().await?;
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        Ok(AckResponse { status, body })
    }
}

pub struct AckDispatcher {
    sender: Arc<dyn AckSender>,
    api_key: String,
    receiver: String,
    environment: String,
}

impl AckDispatcher {
    pub fn new(sender: Arc<dyn AckSender>, api_key: String, receiver: String, environment: String) -> Self {
        Self {
            sender,
            api_key,
            receiver,
            environment,
        }
    }

    /// Posts a signed confirmation to the event's `ack_url`, if it has one.
    /// Never fails: transport errors and non-2xx replies come back as a
    /// degraded report.
    pub async fn dispatch(&self, event: &InboundEvent) -> BestEffort<AckReport> {
        let Some(raw_url) = event.ack_url.as_deref() else {
            return BestEffort::ok(AckReport::skipped());
        };

        let url = match Url::parse(raw_url) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => url,
            Ok(url) => {
                let msg = format!("unsupported ack_url scheme '{}'", url.scheme());
                return BestEffort::degraded(AckReport::failed(raw_url, msg.clone()), msg);
            }
            Err(e) => {
                let msg = format!("invalid ack_url: {}", e);
                return BestEffort::degraded(AckReport::failed(raw_url, msg.clone()), msg);
            }
        };

        let payload = AckPayload {
            success: true,
            request_id: &event.request_id,
            event_type: &event.event_type,
            received_at: event.received_at_str(),
            receiver: &self.receiver,
            environment: &self.environment,
        };
        let body = match serde_json::to_vec(&payload) {
            Ok(b) => b,
            Err(e) => {
                let msg = format!("failed to encode ACK payload: {}", e);
                return BestEffort::degraded(AckReport::failed(raw_url, msg.clone()), msg);
            }
        };
        let headers = vec![
            ("content-type", "application/json".to_string()),
            ("x-api-key", self.api_key.clone()),
            ("x-request-id", event.request_id.clone()),
            ("x-event-type", event.event_type.clone()),
            ("x-signature", signature::sign(&body, &self.api_key)),
        ];

        match self.sender.post(url, headers, body).await {
            Ok(response) => {
                let report = AckReport {
                    attempted: true,
                    ack_url: Some(raw_url.to_string()),
                    http_status: Some(response.status),
                    curl_error: None,
                    response_json: serde_json::from_str(&response.body).ok(),
                };
                if (200..300).contains(&response.status) {
                    info!("ACK for {} accepted by {} ({})", event.request_id, raw_url, response.status);
                    BestEffort::ok(report)
                } else {
                    warn!("ACK for {} rejected by {} ({})", event.request_id, raw_url, response.status);
                    BestEffort::degraded(report, format!("ack endpoint returned HTTP {}", response.status))
                }
            }
            Err(e) => {
                let msg = format!("{:#}", e);
                warn!("ACK for {} to {} failed: {}", event.request_id, raw_url, msg);
                BestEffort::degraded(AckReport::failed(raw_url, msg.clone()), msg)
            }
        }
    }
}
