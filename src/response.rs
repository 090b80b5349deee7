use crate::ack::AckReport;
use crate::signature::{SignatureCheck, SignatureReason};
use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::{json, Value};

/// Terminal failure states. Each maps to exactly one status code.
#[derive(Debug, Clone, PartialEq)]
pub enum Rejection {
    RateLimited { limit: u32 },
    PayloadTooLarge { limit: usize },
    Unauthorized,
    MissingSignature { environment: String },
    BadSignature { reason: SignatureReason, environment: String },
    DedupeUnavailable,
}

impl Rejection {
    pub fn status(&self) -> StatusCode {
        match self {
            Rejection::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Rejection::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Rejection::Unauthorized
            | Rejection::MissingSignature { .. }
            | Rejection::BadSignature { .. } => StatusCode::UNAUTHORIZED,
            Rejection::DedupeUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    pub fn body(&self) -> Value {
        match self {
            Rejection::RateLimited { limit } => json!({
                "success": false,
                "error": "Rate limit exceeded",
                "limit": limit,
                "window": "1 minute",
            }),
            Rejection::PayloadTooLarge { limit } => json!({
                "success": false,
                "error": "Payload too large",
                "limit": limit,
            }),
            Rejection::Unauthorized => json!({
                "success": false,
                "error": "Unauthorized",
            }),
            Rejection::MissingSignature { environment } => json!({
                "success": false,
                "error": "Missing signature",
                "reason": "signature_required",
                "environment": environment,
            }),
            Rejection::BadSignature {
                reason,
                environment,
            } => json!({
                "success": false,
                "error": "Invalid signature",
                "reason": reason,
                "environment": environment,
            }),
            Rejection::DedupeUnavailable => json!({
                "success": false,
                "error": "Deduplication unavailable",
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SignatureSummary {
    pub present: bool,
    pub verified: bool,
    pub reason: SignatureReason,
    pub required: bool,
}

impl SignatureSummary {
    pub fn new(check: SignatureCheck, required: bool) -> Self {
        Self {
            present: check.present,
            verified: check.verified,
            reason: check.reason,
            required,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DuplicateReceipt {
    pub success: bool,
    pub duplicate: bool,
    pub request_id: String,
    pub event_type: String,
    pub received_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessedReceipt {
    pub success: bool,
    pub request_id: String,
    pub event_type: String,
    pub received_at: String,
    pub environment: String,
    pub signature: SignatureSummary,
    pub database_logged: bool,
    pub ack: AckReport,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WebhookResponse {
    Rejected(Rejection),
    Duplicate(DuplicateReceipt),
    Processed(ProcessedReceipt),
}

impl WebhookResponse {
    pub fn status(&self) -> StatusCode {
        match self {
            WebhookResponse::Rejected(r) => r.status(),
            WebhookResponse::Duplicate(_) | WebhookResponse::Processed(_) => StatusCode::OK,
        }
    }
}

impl From<Rejection> for WebhookResponse {
    fn from(rejection: Rejection) -> Self {
        WebhookResponse::Rejected(rejection)
    }
}

impl IntoResponse for WebhookResponse {
    fn into_response(self) -> Response {
        let status = self.status();
        match self {
            WebhookResponse::Rejected(rejection) => {
                let body = Json(rejection.body());
                if matches!(rejection, Rejection::RateLimited { .. }) {
                    (status, [(header::RETRY_AFTER, "60")], body).into_response()
                } else {
                    (status, body).into_response()
                }
            }
            WebhookResponse::Duplicate(receipt) => (status, Json(receipt)).into_response(),
            WebhookResponse::Processed(receipt) => (status, Json(receipt)).into_response(),
        }
    }
}
