//! The public session API of one tab.
//!
//! [`SessionManager`] owns the [`SessionStore`] and wires it to the provider
//! event stream, the cross-tab storage channel and the subscription
//! fetcher. Consumers read state through the getters or a
//! [`SessionSnapshot`] receiver and act through the sign-in/sign-out calls.
//!
//! All background work runs under one cancellation token; [`shutdown`]
//! (or [`page_unload`]) stops it and returns the sync guard to idle.
//!
//! [`shutdown`]: SessionManager::shutdown
//! [`page_unload`]: SessionManager::page_unload

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;

use super::error::AuthError;
use super::provider::IdentityProvider;
use super::store::{SessionSnapshot, SessionStore};
use super::types::{AuthChangeEvent, AuthEvent, OAuthProvider, Session, SignOutScope, SignUpOutcome, User};
use crate::billing::{EntitlementApi, SubscriptionFetcher, SubscriptionStatus};
use crate::cache::{ArtifactCache, Clock, SystemClock};
use crate::config::SessionConfig;
use crate::storage::TabStorage;
use crate::sync::{
    CrossTabSync, GuardState, LocalCleanup, SignOutVerifier, SyncContext, SyncGuard,
};

/// What happened to the provider-side session during `sign_out()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteSignOut {
    Confirmed,
    Failed(String),
    /// Still pending after the timeout; a background retry was issued.
    TimedOut,
}

/// Result of an explicit sign-out. Local state is always cleared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignOutOutcome {
    pub remote: RemoteSignOut,
    /// Route the caller should navigate to.
    pub redirect_to: String,
}

pub struct SessionManager {
    config: SessionConfig,
    ctx: SyncContext,
    verifier: Arc<SignOutVerifier>,
    cross_tab: Arc<CrossTabSync>,
    storage: TabStorage,
    cancel: CancellationToken,
    started: AtomicBool,
}

impl SessionManager {
    pub fn new(
        config: SessionConfig,
        provider: Arc<dyn IdentityProvider>,
        entitlements: Arc<dyn EntitlementApi>,
        storage: TabStorage,
    ) -> Arc<Self> {
        Self::with_clock(config, provider, entitlements, storage, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: SessionConfig,
        provider: Arc<dyn IdentityProvider>,
        entitlements: Arc<dyn EntitlementApi>,
        storage: TabStorage,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        let cancel = CancellationToken::new();
        let store = Arc::new(SessionStore::new());
        let cache =
            ArtifactCache::with_clock(storage.clone(), config.subscription_cache_ttl(), clock);
        let fetcher =
            SubscriptionFetcher::new(entitlements, cache, store.clone(), cancel.child_token());
        let ctx = SyncContext {
            provider,
            store,
            fetcher,
            guard: Arc::new(SyncGuard::new()),
            cleanup: LocalCleanup::new(storage.clone(), &config.extra_clear_keys),
            sign_out_retry: Arc::default(),
        };
        let verifier = SignOutVerifier::new(
            ctx.clone(),
            config.sign_out_verify_attempts,
            config.sign_out_verify_interval(),
            cancel.child_token(),
        );
        let cross_tab = CrossTabSync::new(
            ctx.clone(),
            config.resolve_storage_key(),
            config.cross_tab_debounce(),
            cancel.child_token(),
        );

        Arc::new(Self {
            config,
            ctx,
            verifier,
            cross_tab,
            storage,
            cancel,
            started: AtomicBool::new(false),
        })
    }

    // ── Lifecycle ───────────────────────────────────────────────

    /// Subscribe to the provider and other tabs, then look up the initial
    /// session in the background. Calling it again does nothing.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        // Subscribe before the first lookup so no event slips between them.
        let events = self.ctx.provider.subscribe();
        self.spawn_auth_listener(events);
        self.cross_tab.spawn(self.storage.subscribe());

        let this = Arc::clone(self);
        tokio::spawn(async move { this.load_initial_session().await });

        tracing::info!(
            provider = self.ctx.provider.name(),
            storage_key = self.cross_tab.storage_key(),
            tab = self.storage.tab_id(),
            "Session manager started"
        );
    }

    /// Cancel all background work and return the guard to idle.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        self.verifier.cancel_pending();
        self.cross_tab.cancel_pending();
        self.ctx.guard.reset();
        self.ctx.store.set_verifying_sign_out(false);
        tracing::info!(tab = self.storage.tab_id(), "Session manager stopped");
    }

    pub fn page_unload(&self) {
        tracing::debug!(tab = self.storage.tab_id(), "Page unload");
        self.shutdown();
    }

    // ── State ───────────────────────────────────────────────────

    pub fn user(&self) -> Option<User> {
        self.ctx.store.user()
    }

    pub fn session(&self) -> Option<Session> {
        self.ctx.store.session()
    }

    pub fn loading(&self) -> bool {
        self.ctx.store.loading()
    }

    pub fn subscription_status(&self) -> Option<SubscriptionStatus> {
        self.ctx.store.snapshot().subscription_status
    }

    pub fn subscription_loading(&self) -> bool {
        self.ctx.store.snapshot().subscription_loading
    }

    pub fn is_verifying_sign_out(&self) -> bool {
        self.ctx.store.snapshot().is_verifying_sign_out
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.ctx.store.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.ctx.store.subscribe()
    }

    pub fn guard_state(&self) -> GuardState {
        self.ctx.guard.state()
    }

    pub fn storage_key(&self) -> &str {
        self.cross_tab.storage_key()
    }

    // ── Actions ─────────────────────────────────────────────────

    /// URL that starts the Google OAuth redirect.
    pub async fn sign_in_with_google(&self) -> Result<String, AuthError> {
        let url = self
            .ctx
            .provider
            .sign_in_with_oauth(OAuthProvider::Google, self.config.oauth_redirect_to.as_deref())
            .await?;
        tracing::info!("Starting Google sign-in");
        Ok(url)
    }

    pub async fn sign_in_with_email(
        &self,
        email: &str,
        password: &str,
    ) -> Result<Session, AuthError> {
        self.ctx.cancel_sign_out_retry();
        match self.ctx.provider.sign_in_with_password(email, password).await {
            Ok(session) => {
                tracing::info!(user_id = %session.user.id, "Signed in with email");
                self.ctx.adopt_session(session.clone());
                Ok(session)
            }
            Err(e) => {
                tracing::warn!("Email sign-in failed: {e}");
                Err(e)
            }
        }
    }

    /// Register with email and password; `name` becomes `full_name` metadata.
    pub async fn sign_up_with_email(
        &self,
        email: &str,
        password: &str,
        name: Option<&str>,
    ) -> Result<SignUpOutcome, AuthError> {
        let metadata = match name.map(str::trim).filter(|n| !n.is_empty()) {
            Some(name) => serde_json::json!({ "full_name": name }),
            None => serde_json::json!({}),
        };
        self.ctx.cancel_sign_out_retry();
        let outcome = self.ctx.provider.sign_up(email, password, metadata).await?;
        match &outcome.session {
            Some(session) => self.ctx.adopt_session(session.clone()),
            None => tracing::info!(user_id = %outcome.user.id, "Sign-up needs email confirmation"),
        }
        Ok(outcome)
    }

    /// Sign out of this tab now and of the provider within the timeout.
    ///
    /// Local state and per-user caches are cleared before the network call.
    /// Never fails: the remote result is reported in the outcome.
    pub async fn sign_out(&self) -> SignOutOutcome {
        let lease = self.ctx.guard.force(GuardState::SigningOut);
        self.verifier.cancel_pending();
        self.cross_tab.cancel_pending();
        let user_id = self.ctx.clear_local();
        tracing::info!(user_id = user_id.as_deref().unwrap_or("-"), "Signing out");

        let timeout = self.config.sign_out_timeout();
        let global = self.ctx.provider.sign_out(SignOutScope::Global);
        let remote = match tokio::time::timeout(timeout, global).await {
            Ok(Ok(())) => RemoteSignOut::Confirmed,
            Ok(Err(e)) => {
                tracing::warn!("Remote sign-out failed: {e}");
                RemoteSignOut::Failed(e.to_string())
            }
            Err(_) => {
                tracing::warn!(
                    timeout_ms = self.config.sign_out_timeout_ms,
                    "Remote sign-out timed out, retrying in background"
                );
                self.spawn_sign_out_retry();
                RemoteSignOut::TimedOut
            }
        };

        let local = self.ctx.provider.sign_out(SignOutScope::Local);
        match tokio::time::timeout(timeout, local).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::debug!("Local sign-out failed: {e}"),
            Err(_) => tracing::debug!("Local sign-out timed out"),
        }

        drop(lease);
        SignOutOutcome {
            remote,
            redirect_to: self.config.login_path.clone(),
        }
    }

    /// Re-fetch the current user's subscription status, bypassing the cache.
    ///
    /// `Ok(None)` when nobody is signed in.
    pub async fn refresh_subscription_status(
        &self,
    ) -> Result<Option<SubscriptionStatus>, AuthError> {
        let Some(user_id) = self.ctx.store.current_user_id() else {
            return Ok(None);
        };
        self.ctx.store.set_subscription_loading(true);
        let result = self
            .ctx
            .fetcher
            .check_subscription_status(&user_id, false)
            .await;
        self.ctx.store.set_subscription_loading(false);
        result.map(Some)
    }

    pub async fn check_subscription_status(
        &self,
        user_id: &str,
        use_cache: bool,
    ) -> Result<SubscriptionStatus, AuthError> {
        self.ctx
            .fetcher
            .check_subscription_status(user_id, use_cache)
            .await
    }

    // ── Background work ─────────────────────────────────────────

    async fn load_initial_session(&self) {
        let lookup = async {
            match self.ctx.provider.get_session().await {
                Ok(Some(session)) => return Some(session),
                Ok(None) => tracing::debug!("No session on first lookup, retrying"),
                Err(e) => tracing::warn!("Initial session lookup failed, retrying: {e}"),
            }
            tokio::time::sleep(self.config.initial_session_retry_delay()).await;
            match self.ctx.provider.get_session().await {
                Ok(session) => session,
                Err(e) => {
                    tracing::warn!("Initial session retry failed: {e}");
                    None
                }
            }
        };

        let timeout = self.config.initial_session_timeout();
        tokio::select! {
            () = self.cancel.cancelled() => {}
            result = tokio::time::timeout(timeout, lookup) => match result {
                Ok(Some(session)) if !self.ctx.guard.is_signing_out() => {
                    tracing::info!(user_id = %session.user.id, "Session restored");
                    self.ctx.adopt_session(session);
                }
                Ok(_) => self.ctx.store.finish_loading(),
                Err(_) => {
                    tracing::warn!(
                        timeout_ms = self.config.initial_session_timeout_ms,
                        "Initial session lookup timed out"
                    );
                    self.ctx.store.finish_loading();
                }
            },
        }
    }

    fn spawn_auth_listener(self: &Arc<Self>, mut events: broadcast::Receiver<AuthEvent>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = this.cancel.cancelled() => break,
                    event = events.recv() => match event {
                        Ok(event) => this.handle_auth_event(event),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            // Missed transitions; ask the provider directly.
                            tracing::warn!(skipped, "Auth event stream lagged");
                            let sync = Arc::clone(&this.cross_tab);
                            tokio::spawn(async move { sync.reconcile().await });
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
            tracing::debug!("Auth event listener stopped");
        });
    }

    fn handle_auth_event(&self, event: AuthEvent) {
        tracing::debug!(event = event.kind.as_str(), "Auth event");
        match event.kind {
            AuthChangeEvent::SignedOut => {
                self.verifier.on_signed_out();
            }
            _ if self.ctx.guard.is_signing_out() => {
                tracing::debug!(event = event.kind.as_str(), "Ignoring auth event during sign-out");
            }
            AuthChangeEvent::SignedIn => {
                if let Some(session) = event.session {
                    self.ctx.adopt_session(session);
                }
            }
            AuthChangeEvent::TokenRefreshed => {
                if let Some(session) = event.session {
                    self.ctx.store.set_session(Some(session));
                }
            }
            _ => match event.session {
                Some(session) => self.ctx.adopt_session(session),
                None => self.ctx.store.set_session(None),
            },
        }
    }

    /// Retry the Global sign-out in the background. A later sign-in in this
    /// tab or another one cancels it.
    fn spawn_sign_out_retry(&self) {
        let provider = Arc::clone(&self.ctx.provider);
        let cancel = self.cancel.child_token();
        if let Some(previous) = self.ctx.sign_out_retry.lock().replace(cancel.clone()) {
            previous.cancel();
        }
        tokio::spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => {
                    tracing::debug!("Background sign-out cancelled");
                }
                result = provider.sign_out(SignOutScope::Global) => match result {
                    Ok(()) => tracing::info!("Background sign-out completed"),
                    Err(e) => tracing::warn!("Background sign-out failed: {e}"),
                },
            }
        });
    }
}
