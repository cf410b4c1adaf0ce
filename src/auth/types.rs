//! Session data model and provider event vocabulary.

use serde::{Deserialize, Serialize};

/// Identity record issued by the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
    /// Provider `user_metadata` (display name, avatar URL, ...).
    #[serde(default, rename = "user_metadata")]
    pub metadata: serde_json::Value,
}

impl User {
    /// Display name from metadata, if the provider recorded one.
    pub fn display_name(&self) -> Option<&str> {
        self.metadata
            .get("full_name")
            .or_else(|| self.metadata.get("name"))
            .and_then(serde_json::Value::as_str)
    }
}

/// Provider-issued token bundle.
///
/// Embeds its [`User`], so a session without a user cannot be represented.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    /// Absolute expiry, unix seconds.
    #[serde(default)]
    pub expires_at: Option<i64>,
    /// Relative lifetime as returned by the token endpoint.
    #[serde(default)]
    pub expires_in: Option<i64>,
    pub user: User,
}

fn default_token_type() -> String {
    "bearer".into()
}

impl Session {
    /// Fill `expires_at` from `expires_in` when the endpoint only gave the latter.
    pub fn with_absolute_expiry(mut self, now_secs: i64) -> Self {
        if self.expires_at.is_none() {
            self.expires_at = self.expires_in.map(|secs| now_secs + secs);
        }
        self
    }

    /// True when the access token expires within `margin_secs` of `now_secs`.
    pub fn is_expired(&self, now_secs: i64, margin_secs: i64) -> bool {
        self.expires_at
            .is_some_and(|exp| exp <= now_secs + margin_secs)
    }

    /// Decode a session persisted by the provider.
    ///
    /// Accepts both the bare session object and the older
    /// `{"currentSession": {...}}` envelope. Returns `None` for empty or
    /// malformed values; another tab may be mid-write.
    pub fn from_persisted(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() || raw == "null" {
            return None;
        }
        let value: serde_json::Value = serde_json::from_str(raw).ok()?;
        let value = match value.get("currentSession") {
            Some(inner) => inner.clone(),
            None => value,
        };
        serde_json::from_value(value).ok()
    }
}

/// Kind of auth state change reported by the provider SDK.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthChangeEvent {
    InitialSession,
    SignedIn,
    SignedOut,
    TokenRefreshed,
    UserUpdated,
    PasswordRecovery,
}

impl AuthChangeEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InitialSession => "INITIAL_SESSION",
            Self::SignedIn => "SIGNED_IN",
            Self::SignedOut => "SIGNED_OUT",
            Self::TokenRefreshed => "TOKEN_REFRESHED",
            Self::UserUpdated => "USER_UPDATED",
            Self::PasswordRecovery => "PASSWORD_RECOVERY",
        }
    }
}

/// One notification from the provider's auth state stream.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthEvent {
    pub kind: AuthChangeEvent,
    pub session: Option<Session>,
}

impl AuthEvent {
    pub fn new(kind: AuthChangeEvent, session: Option<Session>) -> Self {
        Self { kind, session }
    }
}

/// Scope of a provider sign-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignOutScope {
    /// Revoke every session of the user.
    Global,
    /// Drop only this client's persisted session.
    Local,
    /// Revoke every session except this one.
    Others,
}

impl SignOutScope {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Global => "global",
            Self::Local => "local",
            Self::Others => "others",
        }
    }
}

/// OAuth providers the dashboard offers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OAuthProvider {
    Google,
}

impl OAuthProvider {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Google => "google",
        }
    }
}

/// Result of an email sign-up.
#[derive(Debug, Clone, PartialEq)]
pub struct SignUpOutcome {
    pub user: User,
    /// `None` when the provider requires email confirmation first.
    pub session: Option<Session>,
}

impl SignUpOutcome {
    pub fn needs_confirmation(&self) -> bool {
        self.session.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session_json() -> serde_json::Value {
        serde_json::json!({
            "access_token": "at",
            "refresh_token": "rt",
            "token_type": "bearer",
            "expires_at": 2_000,
            "user": {
                "id": "u1",
                "email": "a@example.com",
                "user_metadata": { "full_name": "Alice" }
            }
        })
    }

    #[test]
    fn persisted_session_parses_bare_object() {
        let session = Session::from_persisted(&session_json().to_string()).unwrap();
        assert_eq!(session.user.id, "u1");
        assert_eq!(session.user.display_name(), Some("Alice"));
    }

    #[test]
    fn persisted_session_parses_legacy_envelope() {
        let raw = serde_json::json!({ "currentSession": session_json() }).to_string();
        let session = Session::from_persisted(&raw).unwrap();
        assert_eq!(session.refresh_token, "rt");
    }

    #[test]
    fn persisted_session_rejects_partial_writes() {
        assert!(Session::from_persisted("").is_none());
        assert!(Session::from_persisted("null").is_none());
        assert!(Session::from_persisted("{\"access_token\": \"at\"").is_none());
        // Well-formed JSON but no user
        assert!(Session::from_persisted("{\"access_token\": \"at\"}").is_none());
    }

    #[test]
    fn expiry_honours_margin() {
        let session = Session::from_persisted(&session_json().to_string()).unwrap();
        assert!(!session.is_expired(1_000, 60));
        assert!(session.is_expired(1_950, 60));
        assert!(session.is_expired(2_000, 0));
    }

    #[test]
    fn absolute_expiry_derived_from_expires_in() {
        let mut value = session_json();
        value["expires_at"] = serde_json::Value::Null;
        value["expires_in"] = serde_json::json!(3600);
        let session: Session = serde_json::from_value(value).unwrap();
        let session = session.with_absolute_expiry(100);
        assert_eq!(session.expires_at, Some(3700));
    }

    #[test]
    fn change_event_names_match_sdk() {
        let parsed: AuthChangeEvent = serde_json::from_str("\"TOKEN_REFRESHED\"").unwrap();
        assert_eq!(parsed, AuthChangeEvent::TokenRefreshed);
        assert_eq!(AuthChangeEvent::SignedOut.as_str(), "SIGNED_OUT");
    }
}
