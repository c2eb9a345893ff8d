use axum::http::HeaderMap;
use base64::{engine::general_purpose::STANDARD, Engine};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

pub const SIGNATURE_HEADER: &str = "x-beehive-signature";

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("missing signature header")]
    Missing,

    #[error("malformed signature header")]
    Malformed,

    #[error("signature does not match any signing key")]
    Mismatch,
}

/// Verifies webhook bodies against a current/next signing key pair.
#[derive(Debug, Clone)]
pub enum WebhookVerifier {
    Signed {
        current: String,
        next: Option<String>,
    },
    /// Only reachable through an explicit opt-out in configuration.
    Unsigned,
}

impl WebhookVerifier {
    pub fn verify(&self, headers: &HeaderMap, body: &[u8]) -> Result<(), SignatureError> {
        let Self::Signed { current, next } = self else {
            return Ok(());
        };

        let signature = extract_signature(headers)?;
        let keys = std::iter::once(current.as_str()).chain(next.as_deref());
        for key in keys {
            if signature_matches(key, body, &signature) {
                return Ok(());
            }
        }
        Err(SignatureError::Mismatch)
    }
}

pub fn extract_signature(headers: &HeaderMap) -> Result<Vec<u8>, SignatureError> {
    let Some(raw_header) = headers.get(SIGNATURE_HEADER) else {
        return Err(SignatureError::Missing);
    };

    let Ok(value) = raw_header.to_str() else {
        return Err(SignatureError::Malformed);
    };

    STANDARD
        .decode(value.trim())
        .map_err(|_| SignatureError::Malformed)
}

fn signature_matches(key: &str, body: &[u8], signature: &[u8]) -> bool {
    let Ok(mut mac) = HmacSha256::new_from_slice(key.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(signature).is_ok()
}

/// Produces the header value a sender attaches to `body`.
pub fn sign_body(key: &str, body: &[u8]) -> Option<String> {
    let mut mac = HmacSha256::new_from_slice(key.as_bytes()).ok()?;
    mac.update(body);
    Some(STANDARD.encode(mac.finalize().into_bytes()))
}
