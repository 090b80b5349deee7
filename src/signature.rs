use crate::request::lookup_header;
use constant_time_eq::constant_time_eq;
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use std::collections::HashMap;

pub const SIGNATURE_HEADER: &str = "x-signature";
const PREFIX: &str = "sha256=";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SignatureReason {
    Absent,
    BadFormat,
    Mismatch,
    Ok,
}

impl SignatureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignatureReason::Absent => "absent",
            SignatureReason::BadFormat => "bad_format",
            SignatureReason::Mismatch => "mismatch",
            SignatureReason::Ok => "ok",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignatureCheck {
    pub present: bool,
    pub verified: bool,
    pub reason: SignatureReason,
}

impl SignatureCheck {
    fn failed(reason: SignatureReason) -> Self {
        Self {
            present: reason != SignatureReason::Absent,
            verified: false,
            reason,
        }
    }
}

pub fn verify(headers: &HashMap<String, String>, raw_body: &[u8], secret: &str) -> SignatureCheck {
    if !headers.contains_key(SIGNATURE_HEADER) {
        return SignatureCheck::failed(SignatureReason::Absent);
    }
    let Some(sig_hex) = lookup_header(headers, SIGNATURE_HEADER).and_then(|v| v.strip_prefix(PREFIX))
    else {
        return SignatureCheck::failed(SignatureReason::BadFormat);
    };
    if sig_hex.len() != 64 || !sig_hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return SignatureCheck::failed(SignatureReason::BadFormat);
    }
    // hex::decode accepts either case, so the byte comparison is case-insensitive.
    let Ok(expected) = hex::decode(sig_hex) else {
        return SignatureCheck::failed(SignatureReason::BadFormat);
    };
    let Some(computed) = digest(raw_body, secret) else {
        return SignatureCheck::failed(SignatureReason::Mismatch);
    };

    if expected.len() == computed.len() && constant_time_eq(&computed, &expected) {
        SignatureCheck {
            present: true,
            verified: true,
            reason: SignatureReason::Ok,
        }
    } else {
        SignatureCheck::failed(SignatureReason::Mismatch)
    }
}

/// `sha256=<lowercase hex>` over `body`, the form carried in `X-Signature`.
pub fn sign(body: &[u8], secret: &str) -> String {
    let hex_digest = digest(body, secret).map(hex::encode).unwrap_or_default();
    format!("{PREFIX}{hex_digest}")
}

fn digest(body: &[u8], secret: &str) -> Option<Vec<u8>> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(body);
    Some(mac.finalize().into_bytes().to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "test-secret";
    const BODY: &[u8] = br#"{"event_type":"points.earned","request_id":"evt-001"}"#;

    fn with_signature(value: &str) -> HashMap<String, String> {
        HashMap::from([(SIGNATURE_HEADER.to_string(), value.to_string())])
    }

    #[test]
    fn absent_header_is_not_present() {
        let check = verify(&HashMap::new(), BODY, SECRET);
        assert_eq!(
            check,
            SignatureCheck {
                present: false,
                verified: false,
                reason: SignatureReason::Absent
            }
        );
    }

    #[test]
    fn verifies_valid_signature_in_either_case() {
        let sig = sign(BODY, SECRET);
        assert!(sig.starts_with("sha256="));
        assert_eq!(sig.len(), 7 + 64);

        let check = verify(&with_signature(&sig), BODY, SECRET);
        assert!(check.present && check.verified);
        assert_eq!(check.reason, SignatureReason::Ok);

        let upper = format!("sha256={}", sig[7..].to_ascii_uppercase());
        assert!(verify(&with_signature(&upper), BODY, SECRET).verified);
    }

    #[test]
    fn rejects_malformed_values() {
        for value in ["", "deadbeef", "sha256=xyz", "md5=abcd", "sha256=sha256=", "sha256=\u{FFFD}\u{FFFD}"] {
            let check = verify(&with_signature(value), BODY, SECRET);
            assert!(check.present, "{value:?} should count as present");
            assert_eq!(check.reason, SignatureReason::BadFormat, "{value:?}");
        }
        let short = format!("sha256={}", "a".repeat(63));
        assert_eq!(verify(&with_signature(&short), BODY, SECRET).reason, SignatureReason::BadFormat);
    }

    #[test]
    fn detects_mismatch_on_body_or_secret_change() {
        let sig = sign(BODY, SECRET);
        let tampered = verify(&with_signature(&sig), b"{\"event_type\":\"x\"}", SECRET);
        assert_eq!(tampered.reason, SignatureReason::Mismatch);
        assert!(tampered.present && !tampered.verified);

        let wrong_key = verify(&with_signature(&sig), BODY, "other-secret");
        assert_eq!(wrong_key.reason, SignatureReason::Mismatch);
    }
}
