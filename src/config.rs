use anyhow::{anyhow, Result};
use std::{env, net::SocketAddr, path::PathBuf, str::FromStr, time::Duration};
use tracing::warn;

pub const PRODUCTION: &str = "production";

const DEFAULT_RATE_LIMIT: u32 = 60; // per minute
const DEFAULT_LOG_RETENTION_DAYS: u64 = 30;
const DEFAULT_DEDUPE_RETENTION_DAYS: u64 = 7;
const DEFAULT_SWEEP_SECS: u64 = 3600;
const DEFAULT_DATABASE_URL: &str = "sqlite:webhooks.db?mode=rwc";
const DEFAULT_RECEIVER: &str = "loyalty-webhook";

#[derive(Debug, Clone)]
pub struct Config {
    pub secret: String,
    pub environment: String,
    pub rate_limit: u32,
    pub log_dir: PathBuf,
    pub database_url: String,
    pub log_retention: Duration,
    pub dedupe_retention: Duration,
    pub sweep_interval: Duration,
    pub bind_addr: SocketAddr,
    pub receiver_name: String,
    /// Read the client address from cf-connecting-ip / x-real-ip / x-forwarded-for.
    /// Only safe behind a proxy that overwrites those headers.
    pub trust_proxy_headers: bool,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from any key lookup; `from_env` passes the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let secret = get("WEBHOOK_SECRET").ok_or_else(|| anyhow!("WEBHOOK_SECRET must be set"))?;
        let environment = get("APP_ENV")
            .map(|v| v.to_ascii_lowercase())
            .unwrap_or_else(|| PRODUCTION.to_string());

        let days = |key: &str, default: u64| {
            Duration::from_secs(parse_or(get(key), key, default) * 24 * 60 * 60)
        };

        Ok(Self {
            secret,
            environment,
            rate_limit: parse_or(get("WEBHOOK_RATE_LIMIT"), "WEBHOOK_RATE_LIMIT", DEFAULT_RATE_LIMIT),
            log_dir: get("WEBHOOK_LOG_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("logs")),
            database_url: get("DATABASE_URL").unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string()),
            log_retention: days("LOG_RETENTION_DAYS", DEFAULT_LOG_RETENTION_DAYS),
            dedupe_retention: days("DEDUPE_RETENTION_DAYS", DEFAULT_DEDUPE_RETENTION_DAYS),
            sweep_interval: Duration::from_secs(
                parse_or(get("RETENTION_SWEEP_SECS"), "RETENTION_SWEEP_SECS", DEFAULT_SWEEP_SECS).max(1),
            ),
            bind_addr: parse_or(
                get("BIND_ADDR"),
                "BIND_ADDR",
                SocketAddr::from(([0, 0, 0, 0], 3146)),
            ),
            receiver_name: get("RECEIVER_NAME").unwrap_or_else(|| DEFAULT_RECEIVER.to_string()),
            trust_proxy_headers: parse_flag(get("TRUST_PROXY_HEADERS"), "TRUST_PROXY_HEADERS"),
        })
    }

    pub fn is_production(&self) -> bool {
        self.environment == PRODUCTION
    }

    pub fn dedupe_dir(&self) -> PathBuf {
        self.log_dir.join("dedupe")
    }
}

fn parse_or<T>(raw: Option<String>, key: &str, default: T) -> T
where
    T: FromStr + std::fmt::Debug,
{
    match raw {
        None => default,
        Some(value) => match value.parse() {
            Ok(parsed) => parsed,
            Err(_) => {
                warn!("Ignoring invalid {}={:?}, using default {:?}", key, value, default);
                default
            }
        },
    }
}

fn parse_flag(raw: Option<String>, key: &str) -> bool {
    match raw.as_deref().map(str::to_ascii_lowercase).as_deref() {
        None => false,
        Some("1" | "true" | "yes" | "on") => true,
        Some("0" | "false" | "no" | "off") => false,
        Some(other) => {
            warn!("Ignoring invalid {}={:?}, using default false", key, other);
            false
        }
    }
}
