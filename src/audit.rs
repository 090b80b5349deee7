use crate::outcome::BestEffort;
use crate::request::InboundEvent;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct AuditRecord {
    pub request_id: String,
    pub event_type: String,
    pub payload: String,
    pub signature_verified: bool,
    pub source_ip: String,
    pub origin: String,
    pub received_at: DateTime<Utc>,
}

impl AuditRecord {
    pub fn from_event(event: &InboundEvent, signature_verified: bool) -> Self {
        Self {
            request_id: event.request_id.clone(),
            event_type: event.event_type.clone(),
            payload: event.payload_text(),
            signature_verified,
            source_ip: event.source_ip.clone(),
            origin: event.origin.clone(),
            received_at: event.received_at,
        }
    }
}

#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn insert(&self, record: &AuditRecord) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct SqliteAuditStore {
    pool: SqlitePool,
}

impl SqliteAuditStore {
    /// Does not touch the database; connections are opened on first use.
    pub fn connect_lazy(url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_lazy(url)
            .with_context(|| format!("Invalid DATABASE_URL {}", url))?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS webhook_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
                request_id TEXT NOT NULL,
                event_type TEXT NOT NULL,
                payload TEXT NOT NULL,
                signature_verified BOOLEAN NOT NULL,
                source_ip TEXT NOT NULL,
                origin TEXT NOT NULL,
                received_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create webhook_events table")?;
        Ok(())
    }

    async fn insert_row(&self, record: &AuditRecord) -> sqlx::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO webhook_events
                (request_id, event_type, payload, signature_verified, source_ip, origin, received_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.request_id)
        .bind(&record.event_type)
        .bind(&record.payload)
        .bind(record.signature_verified)
        .bind(&record.source_ip)
        .bind(&record.origin)
        .bind(record.received_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn is_missing_table(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.message().contains("no such table"))
}

#[async_trait]
impl AuditStore for SqliteAuditStore {
    /// Creates the table and retries once if it is missing, which happens when
    /// the database was unreachable while the server started.
    async fn insert(&self, record: &AuditRecord) -> Result<()> {
        let inserted = match self.insert_row(record).await {
            Err(e) if is_missing_table(&e) => {
                info!("webhook_events missing, creating it before retrying {}", record.request_id);
                match self.ensure_schema().await {
                    Ok(()) => self.insert_row(record).await.map_err(anyhow::Error::from),
                    Err(schema_err) => Err(schema_err),
                }
            }
            other => other.map_err(anyhow::Error::from),
        };
        inserted.with_context(|| format!("Failed to insert audit row for {}", record.request_id))
    }
}

pub struct PersistenceSink {
    store: Arc<dyn AuditStore>,
}

impl PersistenceSink {
    pub fn new(store: Arc<dyn AuditStore>) -> Self {
        Self { store }
    }

    /// `value` is whether the row was written; a failure is carried as the warning.
    pub async fn record(&self, event: &InboundEvent, signature_verified: bool) -> BestEffort<bool> {
        let record = AuditRecord::from_event(event, signature_verified);
        match self.store.insert(&record).await {
            Ok(()) => {
                debug!("Audit row stored for {}", record.request_id);
                BestEffort::ok(true)
            }
            Err(e) => {
                warn!("Audit row not stored for {}: {:#}", record.request_id, e);
                BestEffort::degraded(false, format!("{:#}", e))
            }
        }
    }
}
