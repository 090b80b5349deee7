use axum::{body::Bytes, http::HeaderMap};
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};
use std::{collections::HashMap, net::SocketAddr};

pub const REQUEST_ID_HEADER: &str = "x-request-id";
pub const EVENT_TYPE_HEADER: &str = "x-event-type";
const UNKNOWN_EVENT: &str = "unknown";

/// A request reduced to what the pipeline looks at: lowercased headers, the
/// untouched body bytes and the body as a JSON object (empty when it is not one).
#[derive(Debug, Clone)]
pub struct ParsedRequest {
    pub headers: HashMap<String, String>,
    pub raw_body: Bytes,
    pub payload: Map<String, Value>,
}

impl ParsedRequest {
    pub fn parse(headers: &HeaderMap, body: Bytes) -> Self {
        let payload = parse_payload(&body);
        Self {
            headers: normalize_headers(headers),
            raw_body: body,
            payload,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        lookup_header(&self.headers, name)
    }

    fn field(&self, key: &str) -> Option<String> {
        match self.payload.get(key)? {
            Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

/// Non-UTF-8 values are kept lossily so a header that was sent never reads as absent.
pub fn normalize_headers(headers: &HeaderMap) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for (name, value) in headers.iter() {
        out.entry(name.as_str().to_ascii_lowercase())
            .or_insert_with(|| String::from_utf8_lossy(value.as_bytes()).into_owned());
    }
    out
}

pub fn lookup_header<'a>(headers: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
    headers
        .get(&name.to_ascii_lowercase())
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
}

fn parse_payload(body: &[u8]) -> Map<String, Value> {
    match serde_json::from_slice::<Value>(body) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    }
}

#[derive(Debug, Clone)]
pub struct InboundEvent {
    pub request_id: String,
    pub event_type: String,
    pub raw_body: Bytes,
    pub source_ip: String,
    pub origin: String,
    pub received_at: DateTime<Utc>,
    pub ack_url: Option<String>,
}

impl InboundEvent {
    pub fn from_request(request: &ParsedRequest, source_ip: String, received_at: DateTime<Utc>) -> Self {
        let request_id = request
            .header(REQUEST_ID_HEADER)
            .map(str::to_string)
            .or_else(|| request.field("request_id"))
            .or_else(|| request.field("event_id"))
            .unwrap_or_else(generate_request_id);
        let event_type = request
            .header(EVENT_TYPE_HEADER)
            .map(str::to_string)
            .or_else(|| request.field("event_type"))
            .or_else(|| request.field("event"))
            .unwrap_or_else(|| UNKNOWN_EVENT.to_string());
        let ack_url = request.field("ack_url").or_else(|| request.field("callback_url"));
        let origin = request
            .header("origin")
            .or_else(|| request.header("user-agent"))
            .unwrap_or("-")
            .to_string();

        Self {
            request_id,
            event_type,
            raw_body: request.raw_body.clone(),
            source_ip,
            origin,
            received_at,
            ack_url,
        }
    }

    pub fn received_at_str(&self) -> String {
        self.received_at.to_rfc3339_opts(SecondsFormat::Secs, true)
    }

    pub fn payload_text(&self) -> String {
        String::from_utf8_lossy(&self.raw_body).into_owned()
    }
}

pub fn generate_request_id() -> String {
    format!("req_{}", hex::encode(rand::random::<[u8; 8]>()))
}

/// Address used for rate limiting and audit lines. Proxy headers are
/// caller-controlled, so they are only read when `trust_proxy` is set.
pub fn client_ip(headers: &HashMap<String, String>, peer: Option<SocketAddr>, trust_proxy: bool) -> String {
    let forwarded = if trust_proxy {
        lookup_header(headers, "cf-connecting-ip")
            .or_else(|| lookup_header(headers, "x-real-ip"))
            .or_else(|| lookup_header(headers, "x-forwarded-for"))
            .map(|s| s.split(',').next().unwrap_or(s).trim().to_string())
            .filter(|s| !s.is_empty())
    } else {
        None
    };
    forwarded
        .or_else(|| peer.map(|addr| addr.ip().to_string()))
        .unwrap_or_else(|| "unknown".to_string())
}
