//! Supabase Auth (GoTrue) client.
//!
//! Implements [`IdentityProvider`] against the project's `/auth/v1` REST
//! endpoints, the way the browser SDK does:
//! - Password sign-in and refresh via `POST /token?grant_type=...`
//! - Email sign-up via `POST /signup` (session only when confirmation is off)
//! - Sign-out via `POST /logout?scope=...`
//! - OAuth is a redirect, so only the authorize URL is built here
//!
//! ## Design
//! - The session is persisted as JSON under the resolved storage key in tab
//!   storage; every read goes back to storage so sessions written by other
//!   tabs are picked up without a notification
//! - Expired sessions are refreshed on `get_session()`, one refresh at a time
//! - A refresh the server rejects ends the session (`SIGNED_OUT`)
//! - A token dropped by a local-only sign-out stays revocable by a later
//!   global sign-out until the server confirms it

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::auth::provider::IdentityProvider;
use crate::auth::types::{
    AuthChangeEvent, AuthEvent, OAuthProvider, Session, SignOutScope, SignUpOutcome, User,
};
use crate::auth::AuthError;
use crate::cache::{Clock, SystemClock};
use crate::config::SessionConfig;
use crate::storage::TabStorage;

/// Refresh this many seconds before the access token actually expires.
const EXPIRY_MARGIN_SECS: i64 = 10;

const EVENT_CAPACITY: usize = 64;

/// Error body shapes returned by GoTrue across versions.
#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    error_description: Option<String>,
    msg: Option<String>,
    message: Option<String>,
    error: Option<String>,
}

fn error_message(body: &str) -> String {
    serde_json::from_str::<ErrorBody>(body)
        .ok()
        .and_then(|b| b.error_description.or(b.msg).or(b.message).or(b.error))
        .unwrap_or_else(|| body.trim().to_string())
}

/// Supabase Auth client bound to one tab's storage.
pub struct SupabaseAuth {
    url: String,
    anon_key: String,
    storage_key: String,
    storage: TabStorage,
    http: reqwest::Client,
    clock: Arc<dyn Clock>,
    events: broadcast::Sender<AuthEvent>,
    refresh_lock: tokio::sync::Mutex<()>,
    /// Access token dropped locally whose server-side revocation is unconfirmed.
    unrevoked: Mutex<Option<String>>,
}

impl SupabaseAuth {
    pub fn new(config: &SessionConfig, storage: TabStorage) -> Result<Self, AuthError> {
        Self::with_clock(config, storage, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: &SessionConfig,
        storage: TabStorage,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, AuthError> {
        config.validate()?;
        let http = reqwest::Client::builder()
            .timeout(config.http_timeout())
            .build()?;
        let (events, _rx) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            url: config.supabase_url.trim_end_matches('/').to_string(),
            anon_key: config.anon_key.clone(),
            storage_key: config.resolve_storage_key(),
            storage,
            http,
            clock,
            events,
            refresh_lock: tokio::sync::Mutex::new(()),
            unrevoked: Mutex::new(None),
        })
    }

    pub fn storage_key(&self) -> &str {
        &self.storage_key
    }

    fn auth_url(&self, endpoint: &str) -> String {
        format!("{}/auth/v1/{endpoint}", self.url)
    }

    fn now_secs(&self) -> i64 {
        self.clock.now_millis() / 1000
    }

    fn persisted(&self) -> Option<Session> {
        self.storage
            .get(&self.storage_key)
            .and_then(|raw| Session::from_persisted(&raw))
    }

    fn persist(&self, session: &Session) {
        match serde_json::to_string(session) {
            Ok(json) => self.storage.set(&self.storage_key, json),
            Err(e) => tracing::warn!("Failed to serialize session: {e}"),
        }
    }

    fn emit(&self, kind: AuthChangeEvent, session: Option<Session>) {
        tracing::debug!(event = kind.as_str(), "Auth state change");
        // No listener yet is fine.
        let _ = self.events.send(AuthEvent::new(kind, session));
    }

    /// Body of a successful response, or the provider's error.
    async fn read_body(resp: reqwest::Response) -> Result<String, AuthError> {
        let status = resp.status();
        let body = resp.text().await?;
        if status.is_success() {
            Ok(body)
        } else {
            Err(AuthError::Provider {
                status: status.as_u16(),
                message: error_message(&body),
            })
        }
    }

    async fn post_token(
        &self,
        grant_type: &str,
        body: serde_json::Value,
    ) -> Result<Session, AuthError> {
        let resp = self
            .http
            .post(self.auth_url("token"))
            .query(&[("grant_type", grant_type)])
            .header("apikey", &self.anon_key)
            .json(&body)
            .send()
            .await?;
        let body = Self::read_body(resp).await?;
        let session: Session = serde_json::from_str(&body)?;
        Ok(session.with_absolute_expiry(self.now_secs()))
    }

    async fn refresh(&self, stale: &Session) -> Result<Option<Session>, AuthError> {
        let _refreshing = self.refresh_lock.lock().await;

        // Another caller or tab may have finished first.
        match self.persisted() {
            None => return Ok(None),
            Some(current)
                if current.access_token != stale.access_token
                    && !current.is_expired(self.now_secs(), EXPIRY_MARGIN_SECS) =>
            {
                return Ok(Some(current));
            }
            Some(_) => {}
        }

        let body = serde_json::json!({ "refresh_token": stale.refresh_token });
        match self.post_token("refresh_token", body).await {
            Ok(session) => {
                tracing::debug!(user_id = %session.user.id, "Session refreshed");
                self.persist(&session);
                self.emit(AuthChangeEvent::TokenRefreshed, Some(session.clone()));
                Ok(Some(session))
            }
            Err(e) if e.is_rejection() => {
                tracing::warn!(user_id = %stale.user.id, "Refresh token rejected, ending session: {e}");
                self.storage.remove(&self.storage_key);
                self.emit(AuthChangeEvent::SignedOut, None);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl IdentityProvider for SupabaseAuth {
    async fn get_session(&self) -> Result<Option<Session>, AuthError> {
        let Some(session) = self.persisted() else {
            return Ok(None);
        };
        if !session.is_expired(self.now_secs(), EXPIRY_MARGIN_SECS) {
            return Ok(Some(session));
        }
        self.refresh(&session).await
    }

    fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
        self.events.subscribe()
    }

    async fn sign_in_with_oauth(
        &self,
        provider: OAuthProvider,
        redirect_to: Option<&str>,
    ) -> Result<String, AuthError> {
        let mut url = format!("{}?provider={}", self.auth_url("authorize"), provider.as_str());
        if let Some(redirect) = redirect_to {
            url.push_str("&redirect_to=");
            url.push_str(&urlencoding::encode(redirect));
        }
        Ok(url)
    }

    async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<Session, AuthError> {
        let body = serde_json::json!({ "email": email, "password": password });
        let session = self.post_token("password", body).await?;
        tracing::info!(user_id = %session.user.id, "Signed in with password");
        self.persist(&session);
        self.emit(AuthChangeEvent::SignedIn, Some(session.clone()));
        Ok(session)
    }

    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        metadata: serde_json::Value,
    ) -> Result<SignUpOutcome, AuthError> {
        let resp = self
            .http
            .post(self.auth_url("signup"))
            .header("apikey", &self.anon_key)
            .json(&serde_json::json!({
                "email": email,
                "password": password,
                "data": metadata,
            }))
            .send()
            .await?;
        let body = Self::read_body(resp).await?;
        let value: serde_json::Value = serde_json::from_str(&body)?;

        if value.get("access_token").is_some() {
            let session: Session = serde_json::from_value(value)?;
            let session = session.with_absolute_expiry(self.now_secs());
            self.persist(&session);
            self.emit(AuthChangeEvent::SignedIn, Some(session.clone()));
            return Ok(SignUpOutcome {
                user: session.user.clone(),
                session: Some(session),
            });
        }

        // Email confirmation pending: the body is the user, possibly wrapped.
        let user_value = match value.get("user") {
            Some(user) => user.clone(),
            None => value,
        };
        let user: User = serde_json::from_value(user_value)?;
        tracing::info!(user_id = %user.id, "Signed up, awaiting email confirmation");
        Ok(SignUpOutcome {
            user,
            session: None,
        })
    }

    async fn sign_out(&self, scope: SignOutScope) -> Result<(), AuthError> {
        let revoking = self
            .persisted()
            .map(|s| s.access_token)
            .or_else(|| self.unrevoked.lock().clone());
        if scope != SignOutScope::Local {
            if let Some(token) = &revoking {
                let resp = self
                    .http
                    .post(self.auth_url("logout"))
                    .query(&[("scope", scope.as_str())])
                    .header("apikey", &self.anon_key)
                    .bearer_auth(token)
                    .send()
                    .await?;
                let status = resp.status();
                // The session is already gone server-side for these.
                if !status.is_success() && !matches!(status.as_u16(), 401 | 403 | 404) {
                    let body = resp.text().await.unwrap_or_default();
                    return Err(AuthError::Provider {
                        status: status.as_u16(),
                        message: error_message(&body),
                    });
                }
                let mut unrevoked = self.unrevoked.lock();
                if unrevoked.as_ref() == Some(token) {
                    *unrevoked = None;
                }
            }
        }

        if scope == SignOutScope::Others {
            return Ok(());
        }
        // Only drop the session this call set out to revoke.
        if let Some(current) = self.persisted() {
            if revoking.as_deref() != Some(current.access_token.as_str()) {
                tracing::debug!(
                    user_id = %current.user.id,
                    scope = scope.as_str(),
                    "Session replaced during sign-out, keeping it"
                );
                return Ok(());
            }
            if scope == SignOutScope::Local {
                *self.unrevoked.lock() = Some(current.access_token);
            }
        }
        self.storage.remove(&self.storage_key);
        self.emit(AuthChangeEvent::SignedOut, None);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "supabase"
    }
}
