//! Signed access credential carried in the `accessToken` cookie.
//!
//! The credential binds a session id to an expiry and is HMAC-signed so the
//! pipeline can reject forged or expired cookies before touching the session
//! store. Minting belongs to the authentication collaborator; this module
//! provides both sides so the collaborator-facing session API can set the
//! cookie it later verifies.

use axum::http::{HeaderMap, HeaderValue, header::InvalidHeaderValue};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use uuid::Uuid;

pub const ACCESS_COOKIE_NAME: &str = "accessToken";
pub const REFRESH_COOKIE_NAME: &str = "refreshToken";

/// Access credentials are short-lived; the session record outlives them and
/// the collaborator re-mints against `refreshToken`.
pub const ACCESS_TTL_SECONDS: i64 = 15 * 60;
pub const REFRESH_TTL_SECONDS: i64 = 7 * 24 * 60 * 60;

const CREDENTIAL_VERSION: &str = "v1";

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CredentialError {
    #[error("malformed credential")]
    Malformed,
    #[error("credential expired")]
    Expired,
    #[error("credential signature mismatch")]
    BadSignature,
}

/// Signs and verifies access credentials with a shared key.
#[derive(Clone)]
pub struct CredentialSigner {
    key: Vec<u8>,
}

impl CredentialSigner {
    #[must_use]
    pub fn new(key: Vec<u8>) -> Self {
        Self { key }
    }

    /// Mint a credential of the form `v1.<session_id>.<exp_unix>.<sig>`.
    #[must_use]
    pub fn sign(&self, session_id: Uuid, expires_at: DateTime<Utc>) -> String {
        let payload = format!(
            "{CREDENTIAL_VERSION}.{session_id}.{exp}",
            exp = expires_at.timestamp()
        );
        let signature = URL_SAFE_NO_PAD.encode(self.mac_for(&payload));
        format!("{payload}.{signature}")
    }

    /// Verify a credential and return the bound session id.
    ///
    /// # Errors
    /// Returns `Malformed` on structural problems, `Expired` once the embedded
    /// expiry has passed, and `BadSignature` on MAC mismatch.
    pub fn verify(&self, token: &str, now: DateTime<Utc>) -> Result<Uuid, CredentialError> {
        let mut parts = token.rsplitn(2, '.');
        let signature = parts.next().ok_or(CredentialError::Malformed)?;
        let payload = parts.next().ok_or(CredentialError::Malformed)?;

        let signature = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| CredentialError::Malformed)?;
        // Constant-time comparison via the MAC itself.
        let mut mac = HmacSha256::new_from_slice(&self.key).map_err(|_| CredentialError::Malformed)?;
        mac.update(payload.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| CredentialError::BadSignature)?;

        let mut fields = payload.split('.');
        let version = fields.next().ok_or(CredentialError::Malformed)?;
        if version != CREDENTIAL_VERSION {
            return Err(CredentialError::Malformed);
        }
        let session_id = fields
            .next()
            .and_then(|raw| Uuid::parse_str(raw).ok())
            .ok_or(CredentialError::Malformed)?;
        let expires_at = fields
            .next()
            .and_then(|raw| raw.parse::<i64>().ok())
            .ok_or(CredentialError::Malformed)?;
        if fields.next().is_some() {
            return Err(CredentialError::Malformed);
        }

        if now.timestamp() >= expires_at {
            return Err(CredentialError::Expired);
        }

        Ok(session_id)
    }

    fn mac_for(&self, payload: &str) -> Vec<u8> {
        let mut mac = HmacSha256::new_from_slice(&self.key).expect("HMAC accepts any key length");
        mac.update(payload.as_bytes());
        mac.finalize().into_bytes().to_vec()
    }
}

impl std::fmt::Debug for CredentialSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialSigner").field("key", &"***").finish()
    }
}

/// Extract the access credential from the `Cookie` header.
#[must_use]
pub fn extract_access_token(headers: &HeaderMap) -> Option<String> {
    let header = headers.get(axum::http::header::COOKIE)?;
    let value = header.to_str().ok()?;
    for pair in value.split(';') {
        let trimmed = pair.trim();
        let mut parts = trimmed.splitn(2, '=');
        let key = parts.next()?.trim();
        let val = parts.next()?.trim();
        if key == ACCESS_COOKIE_NAME {
            return Some(val.to_string());
        }
    }
    None
}

/// Build the `Set-Cookie` value for a freshly minted access credential.
///
/// # Errors
/// Returns an error if the token contains bytes invalid in a header value.
pub fn access_cookie(token: &str) -> Result<HeaderValue, InvalidHeaderValue> {
    HeaderValue::from_str(&format!(
        "{ACCESS_COOKIE_NAME}={token}; Path=/; HttpOnly; Secure; SameSite=Strict; Max-Age={ACCESS_TTL_SECONDS}"
    ))
}

/// `Set-Cookie` value that clears the access credential.
#[must_use]
pub fn clear_access_cookie() -> HeaderValue {
    HeaderValue::from_static("accessToken=; Path=/; HttpOnly; Secure; SameSite=Strict; Max-Age=0")
}
