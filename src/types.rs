use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use time::OffsetDateTime;

/// Stable opaque identifier of a session.
///
/// Survives token rotation: refreshing a session issues new tokens under the
/// same handle.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display, From, Into,
)]
#[serde(transparent)]
pub struct SessionHandle(pub String);

impl SessionHandle {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Application-defined user identifier (opaque string).
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, From, Into,
)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Signing-key version carried in the access-token footer.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, From, Into,
)]
#[serde(transparent)]
pub struct KeyId(pub String);

/// A signed credential and its expiry.
///
/// Never mutated: rotation produces a new `Token`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Token {
    #[serde(rename = "token")]
    pub value: String,
    #[serde(rename = "expiry", with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
}

impl Token {
    #[must_use]
    pub fn new(value: impl Into<String>, expires_at: OffsetDateTime) -> Self {
        Self {
            value: value.into(),
            expires_at,
        }
    }

    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.expires_at <= OffsetDateTime::now_utc()
    }
}

/// A verified, created or refreshed session.
///
/// Owned by a single request. Token fields are only populated when the client
/// has something new to store:
///
/// | origin                         | access | refresh | id-refresh | anti-csrf |
/// |--------------------------------|--------|---------|------------|-----------|
/// | create / refresh               | yes    | yes     | yes        | if enabled|
/// | verify, authority rotated token| yes    | no      | no         | no        |
/// | verify, local fast path        | no     | no      | no         | no        |
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub handle: SessionHandle,
    pub user_id: UserId,
    /// Payload embedded in the access token at creation.
    #[serde(default)]
    pub user_data: JsonValue,
    #[serde(default)]
    pub access_token: Option<Token>,
    #[serde(default)]
    pub refresh_token: Option<Token>,
    #[serde(default)]
    pub id_refresh_token: Option<Token>,
    #[serde(default)]
    pub anti_csrf_token: Option<String>,
}

impl Session {
    /// Session identity with no tokens attached.
    #[must_use]
    pub fn bare(handle: SessionHandle, user_id: UserId, user_data: JsonValue) -> Self {
        Self {
            handle,
            user_id,
            user_data,
            access_token: None,
            refresh_token: None,
            id_refresh_token: None,
            anti_csrf_token: None,
        }
    }

    /// Keeps only what a verify response may carry: identity and a rotated
    /// access token.
    #[must_use]
    pub fn into_verified(self) -> Self {
        Self {
            refresh_token: None,
            id_refresh_token: None,
            anti_csrf_token: None,
            ..self
        }
    }

    /// Returns `true` if any token must be written back to the client.
    #[must_use]
    pub fn has_new_tokens(&self) -> bool {
        self.access_token.is_some()
            || self.refresh_token.is_some()
            || self.id_refresh_token.is_some()
    }
}
