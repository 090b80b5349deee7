use crate::ack::{AckDispatcher, AckSender, HttpAckSender};
use crate::audit::{AuditStore, PersistenceSink, SqliteAuditStore};
use crate::auth::{self, mask_credential, presented_credential};
use crate::config::Config;
use crate::dedupe::{DedupeStore, Deduplicator, FileDedupeStore};
use crate::filelog::{AuditEvent, AuditLine, FileLog};
use crate::rate_limit::{MemoryRateStore, RateLimiter, RateStore};
use crate::request::{client_ip, InboundEvent, ParsedRequest};
use crate::response::{DuplicateReceipt, ProcessedReceipt, Rejection, SignatureSummary, WebhookResponse};
use crate::retention::Sweeper;
use crate::signature::{self, SignatureReason};
use anyhow::Result;
use axum::{
    body::Bytes,
    extract::{ConnectInfo, State},
    http::HeaderMap,
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use std::{net::SocketAddr, sync::Arc};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

const MAX_BODY_BYTES: usize = 1024 * 1024; // 1MB safety cap

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub rate_limiter: Arc<RateLimiter>,
    pub deduplicator: Arc<Deduplicator>,
    pub persistence: Arc<PersistenceSink>,
    pub file_log: Arc<FileLog>,
    pub ack: Arc<AckDispatcher>,
}

impl AppState {
    pub fn new(
        config: Config,
        rate_store: Arc<dyn RateStore>,
        dedupe_store: Arc<dyn DedupeStore>,
        audit_store: Arc<dyn AuditStore>,
        ack_sender: Arc<dyn AckSender>,
    ) -> Self {
        let ack = AckDispatcher::new(
            ack_sender,
            config.secret.clone(),
            config.receiver_name.clone(),
            config.environment.clone(),
        );
        Self {
            rate_limiter: Arc::new(RateLimiter::new(rate_store, config.rate_limit)),
            deduplicator: Arc::new(Deduplicator::new(dedupe_store)),
            persistence: Arc::new(PersistenceSink::new(audit_store)),
            file_log: Arc::new(FileLog::new(config.log_dir.clone())),
            ack: Arc::new(ack),
            config: Arc::new(config),
        }
    }

    pub fn sweeper(&self) -> Sweeper {
        Sweeper {
            log_root: self.config.log_dir.clone(),
            dedupe_dir: self.config.dedupe_dir(),
            log_max_age: self.config.log_retention,
            dedupe_max_age: self.config.dedupe_retention,
            rate_limiter: self.rate_limiter.clone(),
        }
    }
}

pub async fn run_server() -> Result<()> {
    let config = Config::from_env()?;
    info!(
        "Environment '{}', rate limit {}/min, logs under {}",
        config.environment,
        config.rate_limit,
        config.log_dir.display()
    );
    if !config.is_production() {
        warn!("Unsigned webhooks are accepted outside production");
    }
    if config.trust_proxy_headers {
        info!("Client address taken from proxy headers");
    }

    let audit = SqliteAuditStore::connect_lazy(&config.database_url)?;
    if let Err(e) = audit.ensure_schema().await {
        warn!("Audit table unavailable, continuing without it: {:#}", e);
    }

    let addr = config.bind_addr;
    let sweep_interval = config.sweep_interval;
    let dedupe_store = FileDedupeStore::new(config.dedupe_dir());
    let state = AppState::new(
        config,
        Arc::new(MemoryRateStore::new()),
        Arc::new(dedupe_store),
        Arc::new(audit),
        Arc::new(HttpAckSender::new()?),
    );
    let sweeper = state.sweeper().spawn(sweep_interval);

    let app = build_router(state);

    info!("Listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let served = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await;
    sweeper.abort();
    served?;
    Ok(())
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", post(handle_webhook))
        .route("/webhook", post(handle_webhook))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> &'static str {
    "OK"
}

async fn handle_webhook(
    State(state): State<AppState>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: Bytes,
) -> WebhookResponse {
    let request = ParsedRequest::parse(&headers, body);
    let source_ip = client_ip(
        &request.headers,
        peer.map(|ConnectInfo(addr)| addr),
        state.config.trust_proxy_headers,
    );
    process_webhook(&state, request, source_ip, Utc::now()).await
}

/// One pass through the receiver: rate limit, authenticate, verify the
/// signature, dedupe, persist, acknowledge. Each rejecting stage returns
/// before any later stage runs.
pub async fn process_webhook(
    state: &AppState,
    request: ParsedRequest,
    source_ip: String,
    received_at: DateTime<Utc>,
) -> WebhookResponse {
    let config = &state.config;
    let event = InboundEvent::from_request(&request, source_ip, received_at);

    if !state.rate_limiter.allow_at(&event.source_ip, received_at).await {
        warn!("Rate limit exceeded for {}", event.source_ip);
        state
            .file_log
            .record(context_line(AuditEvent::RateLimited, &event).field("limit", config.rate_limit.to_string()))
            .await;
        return Rejection::RateLimited {
            limit: config.rate_limit,
        }
        .into();
    }

    if request.raw_body.len() > MAX_BODY_BYTES {
        warn!(
            "Rejecting request: body too large ({} bytes > {} bytes)",
            request.raw_body.len(),
            MAX_BODY_BYTES
        );
        return Rejection::PayloadTooLarge {
            limit: MAX_BODY_BYTES,
        }
        .into();
    }

    if !auth::authorize(&request.headers, &config.secret) {
        let masked = mask_credential(presented_credential(&request.headers));
        warn!("Unauthorized webhook from {} (key {})", event.source_ip, masked);
        state
            .file_log
            .record(context_line(AuditEvent::Unauthorized, &event).field("key", masked))
            .await;
        return Rejection::Unauthorized.into();
    }

    let check = signature::verify(&request.headers, &request.raw_body, &config.secret);
    match check.reason {
        SignatureReason::Absent if config.is_production() => {
            warn!("Missing signature for {} in production", event.request_id);
            state
                .file_log
                .record(context_line(AuditEvent::MissingSignature, &event))
                .await;
            return Rejection::MissingSignature {
                environment: config.environment.clone(),
            }
            .into();
        }
        SignatureReason::BadFormat | SignatureReason::Mismatch => {
            warn!(
                "Webhook signature verification failed for {} ({})",
                event.request_id,
                check.reason.as_str()
            );
            state
                .file_log
                .record(context_line(AuditEvent::BadSignature, &event).field("reason", check.reason.as_str()))
                .await;
            return Rejection::BadSignature {
                reason: check.reason,
                environment: config.environment.clone(),
            }
            .into();
        }
        SignatureReason::Absent | SignatureReason::Ok => {}
    }

    match state.deduplicator.is_duplicate(&event.request_id).await {
        Ok(false) => {}
        Ok(true) => {
            info!("Duplicate delivery of {}", event.request_id);
            state
                .file_log
                .record(context_line(AuditEvent::Duplicate, &event))
                .await;
            return WebhookResponse::Duplicate(DuplicateReceipt {
                success: true,
                duplicate: true,
                request_id: event.request_id.clone(),
                event_type: event.event_type.clone(),
                received_at: event.received_at_str(),
            });
        }
        Err(e) => {
            error!("Dedupe store failed for {}: {:#}", event.request_id, e);
            return Rejection::DedupeUnavailable.into();
        }
    }

    info!(
        "Accepted webhook {} ({}) from {}",
        event.request_id, event.event_type, event.source_ip
    );
    state
        .file_log
        .record(
            context_line(AuditEvent::Received, &event)
                .field("signature", check.reason.as_str())
                .field("bytes", event.raw_body.len().to_string()),
        )
        .await;

    let persisted = state.persistence.record(&event, check.verified).await;

    let ack = state.ack.dispatch(&event).await;
    if ack.value.attempted {
        let mut line = context_line(AuditEvent::AckSent, &event)
            .field("ack_url", ack.value.ack_url.clone().unwrap_or_default());
        if let Some(status) = ack.value.http_status {
            line = line.field("status", status.to_string());
        }
        if let Some(warning) = &ack.warning {
            line = line.field("error", warning.clone());
        }
        state.file_log.record(line).await;
    }

    WebhookResponse::Processed(ProcessedReceipt {
        success: true,
        request_id: event.request_id.clone(),
        event_type: event.event_type.clone(),
        received_at: event.received_at_str(),
        environment: config.environment.clone(),
        signature: SignatureSummary::new(check, config.is_production()),
        database_logged: persisted.value,
        ack: ack.value,
    })
}

fn context_line(kind: AuditEvent, event: &InboundEvent) -> AuditLine {
    AuditLine::new(kind)
        .field("ip", event.source_ip.clone())
        .field("origin", event.origin.clone())
        .field("request_id", event.request_id.clone())
        .field("event_type", event.event_type.clone())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Shutdown signal received (Ctrl+C)");
        }
        _ = terminate => {
            info!("Shutdown signal received (SIGTERM)");
        }
    }
}
