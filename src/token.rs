use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use pasetors::Public;
use pasetors::keys::{AsymmetricPublicKey, AsymmetricSecretKey};
use pasetors::token::UntrustedToken;
use pasetors::version4::{PublicToken, V4};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use time::OffsetDateTime;

use crate::error::Error;
use crate::types::{KeyId, SessionHandle, UserId};

const TOKEN_PREFIX: &str = "v4.public.";

/// Ed25519 public key (32 bytes) for access-token verification.
#[derive(Clone, PartialEq, Eq)]
pub struct PublicKey {
    bytes: [u8; 32],
}

impl PublicKey {
    /// Get the raw key bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.bytes
    }

    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.bytes)
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PublicKey").field(&self.to_hex()).finish()
    }
}

/// Parses a hex-encoded Ed25519 public key (32 bytes) into a `PublicKey`.
///
/// # Errors
///
/// Returns `Error::General` if the hex is invalid or the key length is not 32 bytes.
pub fn parse_public_key_hex(public_key_hex: &str) -> Result<PublicKey, Error> {
    let bytes = hex::decode(public_key_hex)
        .map_err(|e| Error::General(format!("invalid signing key hex: {e}")))?;
    if bytes.len() != 32 {
        return Err(Error::General(format!(
            "invalid signing key length: expected 32, got {}",
            bytes.len()
        )));
    }
    let mut arr = [0u8; 32];
    arr.copy_from_slice(&bytes);
    Ok(PublicKey { bytes: arr })
}

/// Claims carried by an access token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessTokenClaims {
    pub session_handle: SessionHandle,
    pub user_id: UserId,
    #[serde(default)]
    pub user_data: JsonValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anti_csrf_token: Option<String>,
    /// Hash of the refresh token this access token was minted from. Present
    /// only until the authority has seen the token once after a refresh.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_refresh_token_hash: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub exp: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub iat: OffsetDateTime,
}

/// Why an access token failed local verification.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenError {
    /// Token was signed with a key version other than the cached one.
    #[error("signing key mismatch: token uses {token}, cached {cached}")]
    KeyMismatch { token: KeyId, cached: KeyId },

    #[error("access token expired")]
    Expired,

    /// Malformed token, bad signature, or unparseable claims.
    #[error("invalid access token: {0}")]
    Invalid(String),
}

/// Verifies a PASETO v4.public access token against the cached signing key.
///
/// Checks, in order: format, key version (footer `kid`), signature, claims, expiry.
///
/// # Errors
///
/// Returns [`TokenError::KeyMismatch`] when the footer names a different key,
/// [`TokenError::Expired`] for a correctly signed but expired token, and
/// [`TokenError::Invalid`] otherwise.
pub fn verify_access_token(
    key_id: &KeyId,
    public_key: &PublicKey,
    token_str: &str,
) -> Result<AccessTokenClaims, TokenError> {
    if !token_str.starts_with(TOKEN_PREFIX) {
        return Err(TokenError::Invalid("invalid token format".into()));
    }

    let untrusted_token = UntrustedToken::<Public, V4>::try_from(token_str)
        .map_err(|e| TokenError::Invalid(e.to_string()))?;

    let kid = extract_kid_from_untrusted_footer(untrusted_token.untrusted_footer())
        .map_err(|e| TokenError::Invalid(e.to_string()))?;
    if kid != key_id.0 {
        return Err(TokenError::KeyMismatch {
            token: KeyId(kid),
            cached: key_id.clone(),
        });
    }

    let pk = AsymmetricPublicKey::<V4>::from(&public_key.bytes[..])
        .map_err(|e| TokenError::Invalid(e.to_string()))?;

    // No expected footer: the signature already covers it.
    let trusted_token = PublicToken::verify(&pk, &untrusted_token, None, None)
        .map_err(|e| TokenError::Invalid(e.to_string()))?;

    let claims: AccessTokenClaims = serde_json::from_str(trusted_token.payload())
        .map_err(|e| TokenError::Invalid(format!("claims: {e}")))?;

    if claims.exp <= OffsetDateTime::now_utc() {
        return Err(TokenError::Expired);
    }

    Ok(claims)
}

/// Signs access-token claims with the given key, naming `key_id` in the footer.
///
/// # Errors
///
/// Returns `Error::General` if the claims cannot be serialized or signing fails.
pub fn sign_access_token(
    secret_key: &AsymmetricSecretKey<V4>,
    key_id: &KeyId,
    claims: &AccessTokenClaims,
) -> Result<String, Error> {
    let message = serde_json::to_vec(claims)
        .map_err(|e| Error::General(format!("access token claims: {e}")))?;
    let footer = serde_json::json!({ "kid": key_id.0 }).to_string();
    PublicToken::sign(secret_key, &message, Some(footer.as_bytes()), None)
        .map_err(|e| Error::General(format!("access token signing: {e}")))
}

/// Extract key ID from a PASETO token without verifying signature.
/// Validates v4.public format prefix.
///
/// # Errors
///
/// Returns `Error::Unauthorized` if the token format is invalid or the footer
/// does not contain a `kid` claim.
pub fn extract_kid_from_token(token_str: &str) -> Result<KeyId, Error> {
    let footer_bytes = extract_footer_from_token(token_str)?;
    extract_kid_from_untrusted_footer(&footer_bytes).map(KeyId)
}

/// Extracts the key ID (kid) from an untrusted token's footer.
pub(crate) fn extract_kid_from_untrusted_footer(footer_bytes: &[u8]) -> Result<String, Error> {
    let footer_str = std::str::from_utf8(footer_bytes)
        .map_err(|_| Error::Unauthorized("invalid footer".into()))?;

    let footer_json: JsonValue = serde_json::from_str(footer_str)
        .map_err(|_| Error::Unauthorized("invalid footer".into()))?;

    let kid = footer_json
        .get("kid")
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::Unauthorized("missing footer claim: kid".into()))?
        .to_owned();

    Ok(kid)
}

/// Extracts the footer bytes from a PASETO token string.
pub(crate) fn extract_footer_from_token(token_str: &str) -> Result<Vec<u8>, Error> {
    if !token_str.starts_with(TOKEN_PREFIX) {
        return Err(Error::Unauthorized("invalid token format".into()));
    }

    let parts: Vec<&str> = token_str.split('.').collect();
    if parts.len() != 4 {
        return Err(Error::Unauthorized("invalid token format".into()));
    }

    let footer_b64 = parts[3];
    if footer_b64.is_empty() {
        return Ok(Vec::new());
    }

    URL_SAFE_NO_PAD
        .decode(footer_b64)
        .map_err(|_| Error::Unauthorized("invalid footer".into()))
}
