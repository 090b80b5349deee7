use crate::request::lookup_header;
use constant_time_eq::constant_time_eq;
use std::collections::HashMap;

pub const API_KEY_HEADER: &str = "x-api-key";
const AUTHORIZATION_HEADER: &str = "authorization";

pub fn authorize(headers: &HashMap<String, String>, secret: &str) -> bool {
    if secret.is_empty() {
        return false;
    }
    let api_key_ok = lookup_header(headers, API_KEY_HEADER)
        .map(|key| secure_eq(key, secret))
        .unwrap_or(false);
    let bearer_ok = bearer_token(headers)
        .map(|token| secure_eq(token, secret))
        .unwrap_or(false);
    api_key_ok || bearer_ok
}

/// Whatever credential the caller sent, for masked logging.
pub fn presented_credential(headers: &HashMap<String, String>) -> Option<&str> {
    lookup_header(headers, API_KEY_HEADER).or_else(|| bearer_token(headers))
}

pub fn mask_credential(value: Option<&str>) -> String {
    match value {
        None => "none".to_string(),
        Some(v) => {
            let prefix: String = v.chars().take(4).collect();
            format!("{}***", prefix)
        }
    }
}

fn bearer_token(headers: &HashMap<String, String>) -> Option<&str> {
    let value = lookup_header(headers, AUTHORIZATION_HEADER)?;
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    Some(token.trim()).filter(|t| !t.is_empty())
}

fn secure_eq(given: &str, expected: &str) -> bool {
    given.len() == expected.len() && constant_time_eq(given.as_bytes(), expected.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "test_webhook_api_key_123456";

    fn headers(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn accepts_api_key_header() {
        assert!(authorize(&headers(&[("x-api-key", SECRET)]), SECRET));
        assert!(!authorize(&headers(&[("x-api-key", "test_webhook_api_key_12345")]), SECRET));
    }

    #[test]
    fn accepts_bearer_token() {
        let auth = format!("Bearer {}", SECRET);
        assert!(authorize(&headers(&[("authorization", &auth)]), SECRET));
        let lower = format!("bearer {}", SECRET);
        assert!(authorize(&headers(&[("authorization", &lower)]), SECRET));
        assert!(!authorize(&headers(&[("authorization", "Bearer nope")]), SECRET));
        assert!(!authorize(&headers(&[("authorization", &format!("Basic {}", SECRET))]), SECRET));
    }

    #[test]
    fn rejects_missing_credential_and_empty_secret() {
        assert!(!authorize(&headers(&[]), SECRET));
        assert!(!authorize(&headers(&[("x-api-key", "")]), ""));
    }

    #[test]
    fn masks_credentials() {
        assert_eq!(mask_credential(Some(SECRET)), "test***");
        assert_eq!(mask_credential(Some("ab")), "ab***");
        assert_eq!(mask_credential(None), "none");
        let h = headers(&[("authorization", "Bearer abcdefgh")]);
        assert_eq!(presented_credential(&h), Some("abcdefgh"));
    }
}
