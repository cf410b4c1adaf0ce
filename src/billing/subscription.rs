//! Subscription status fetching with stale-while-revalidate caching.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::auth::store::SessionStore;
use crate::auth::AuthError;
use crate::cache::{ArtifactCache, Freshness};

/// Cache key prefix for per-user subscription status.
pub const SUBSCRIPTION_KEY_PREFIX: &str = "subscription_status_";

/// Storage key of a user's cached subscription status.
pub fn subscription_cache_key(user_id: &str) -> String {
    format!("{SUBSCRIPTION_KEY_PREFIX}{user_id}")
}

/// Entitlement snapshot returned by the dashboard API.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionStatus {
    #[serde(default)]
    pub is_subscribed: bool,
    #[serde(default)]
    pub plan: Option<String>,
    /// Billing provider status, e.g. "active", "past_due", "canceled".
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub current_period_end: Option<String>,
    #[serde(default)]
    pub cancel_at_period_end: bool,
    /// Fields this crate does not interpret, kept for consumers.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

// ── Entitlement API ──────────────────────────────────────────────

/// The one endpoint reporting a user's subscription status.
#[async_trait]
pub trait EntitlementApi: Send + Sync {
    async fn fetch_status(
        &self,
        user_id: &str,
        access_token: Option<&str>,
    ) -> Result<SubscriptionStatus, AuthError>;
}

/// HTTP client for `GET /api/subscription/status`.
pub struct HttpEntitlementApi {
    base_url: String,
    http: reqwest::Client,
}

impl HttpEntitlementApi {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, AuthError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    fn status_url(&self) -> String {
        format!("{}/api/subscription/status", self.base_url)
    }
}

#[async_trait]
impl EntitlementApi for HttpEntitlementApi {
    async fn fetch_status(
        &self,
        user_id: &str,
        access_token: Option<&str>,
    ) -> Result<SubscriptionStatus, AuthError> {
        let mut request = self
            .http
            .get(self.status_url())
            .query(&[("user_id", user_id)]);
        if let Some(token) = access_token {
            request = request.bearer_auth(token);
        }

        let resp = request.send().await?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let message = resp.text().await.unwrap_or_default();
            return Err(AuthError::Entitlement { status, message });
        }
        let body = resp.text().await?;
        Ok(serde_json::from_str(&body)?)
    }
}

// ── Fetcher ──────────────────────────────────────────────────────

/// Wraps the entitlement call with the artifact cache.
///
/// A fresh cached value is served immediately while a background refresh
/// runs; without one, the network is asked and a failed fetch falls back to
/// whatever (possibly expired) value was cached.
pub struct SubscriptionFetcher {
    api: Arc<dyn EntitlementApi>,
    cache: ArtifactCache,
    store: Arc<SessionStore>,
    /// Users with a background refresh in flight.
    refreshing: Mutex<HashSet<String>>,
    cancel: CancellationToken,
}

impl SubscriptionFetcher {
    pub fn new(
        api: Arc<dyn EntitlementApi>,
        cache: ArtifactCache,
        store: Arc<SessionStore>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            api,
            cache,
            store,
            refreshing: Mutex::new(HashSet::new()),
            cancel,
        })
    }

    /// Subscription status for `user_id`.
    ///
    /// With `use_cache`, a fresh cached value returns without waiting on the
    /// network. Errors only when the fetch fails and nothing was cached.
    pub async fn check_subscription_status(
        self: &Arc<Self>,
        user_id: &str,
        use_cache: bool,
    ) -> Result<SubscriptionStatus, AuthError> {
        let key = subscription_cache_key(user_id);
        let cached = self.cache.peek::<SubscriptionStatus>(&key);

        let fallback = match cached {
            Some((artifact, Freshness::Fresh)) if use_cache => {
                tracing::debug!(user_id, "Serving cached subscription status");
                self.store.set_subscription(user_id, artifact.data.clone());
                self.spawn_background_refresh(user_id);
                return Ok(artifact.data);
            }
            Some((artifact, Freshness::Fresh)) => Some(artifact.data),
            Some((artifact, Freshness::Expired)) => {
                self.cache.remove(&key);
                Some(artifact.data)
            }
            None => None,
        };

        match self.fetch_and_store(user_id).await {
            Ok(status) => Ok(status),
            Err(e) => match fallback {
                Some(stale) => {
                    tracing::warn!(user_id, "Subscription fetch failed, serving cached value: {e}");
                    self.store.set_subscription(user_id, stale.clone());
                    Ok(stale)
                }
                None => Err(e),
            },
        }
    }

    /// Prime the store for `user_id` in the background, cache first.
    pub fn spawn_prime(self: &Arc<Self>, user_id: &str) {
        let this = Arc::clone(self);
        let user_id = user_id.to_string();
        let cancel = self.cancel.child_token();
        this.store.set_subscription_loading(true);
        tokio::spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => {}
                result = this.check_subscription_status(&user_id, true) => {
                    if let Err(e) = result {
                        tracing::warn!(user_id = %user_id, "Failed to load subscription status: {e}");
                    }
                }
            }
            this.store.set_subscription_loading(false);
        });
    }

    #[cfg(test)]
    fn refreshes_in_flight(&self) -> usize {
        self.refreshing.lock().len()
    }

    fn spawn_background_refresh(self: &Arc<Self>, user_id: &str) {
        if !self.refreshing.lock().insert(user_id.to_string()) {
            return;
        }
        let this = Arc::clone(self);
        let user_id = user_id.to_string();
        let cancel = self.cancel.child_token();
        tokio::spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => {
                    tracing::debug!(user_id = %user_id, "Background subscription refresh cancelled");
                }
                result = this.fetch_and_store(&user_id) => {
                    if let Err(e) = result {
                        tracing::warn!(user_id = %user_id, "Background subscription refresh failed: {e}");
                    }
                }
            }
            this.refreshing.lock().remove(&user_id);
        });
    }

    async fn fetch_and_store(&self, user_id: &str) -> Result<SubscriptionStatus, AuthError> {
        let token = self
            .store
            .session()
            .filter(|s| s.user.id == user_id)
            .map(|s| s.access_token);
        let status = self.api.fetch_status(user_id, token.as_deref()).await?;

        // A sign-out or account switch may have happened while waiting; never
        // write another account's entitlement back into storage.
        if self.store.set_subscription(user_id, status.clone()) {
            self.cache.put(&subscription_cache_key(user_id), &status);
        } else {
            tracing::debug!(user_id, "User changed during fetch, not caching status");
        }
        Ok(status)
    }
}
