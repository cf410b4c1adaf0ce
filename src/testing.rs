//! In-process fakes for the provider and entitlement boundaries.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::auth::provider::IdentityProvider;
use crate::auth::types::{
    AuthChangeEvent, AuthEvent, OAuthProvider, Session, SignOutScope, SignUpOutcome, User,
};
use crate::auth::AuthError;
use crate::auth::store::SessionStore;
use crate::billing::{EntitlementApi, SubscriptionFetcher, SubscriptionStatus};
use crate::cache::{ArtifactCache, Clock};
use crate::storage::{SharedStorage, TabStorage};
use crate::sync::{LocalCleanup, SyncContext, SyncGuard};

pub(crate) fn user_for(id: &str) -> User {
    User {
        id: id.to_string(),
        email: Some(format!("{id}@example.com")),
        metadata: serde_json::json!({ "full_name": id }),
    }
}

pub(crate) fn session_for(id: &str) -> Session {
    Session {
        access_token: format!("access-{id}"),
        refresh_token: format!("refresh-{id}"),
        token_type: "bearer".into(),
        expires_at: Some(4_000_000_000),
        expires_in: Some(3600),
        user: user_for(id),
    }
}

pub(crate) fn status_for(subscribed: bool) -> SubscriptionStatus {
    SubscriptionStatus {
        is_subscribed: subscribed,
        plan: subscribed.then(|| "pro".to_string()),
        status: Some(if subscribed { "active" } else { "canceled" }.to_string()),
        ..SubscriptionStatus::default()
    }
}

/// Let spawned tasks run until they block on something other than the scheduler.
pub(crate) async fn settle() {
    for _ in 0..64 {
        tokio::task::yield_now().await;
    }
}

/// Sync collaborators over fresh in-memory storage, with an anonymous store.
pub(crate) fn sync_context(
    provider: Arc<FakeProvider>,
    cancel: &CancellationToken,
) -> (SyncContext, Arc<FakeEntitlements>, TabStorage) {
    sync_context_on(provider, cancel, SharedStorage::in_memory().tab())
}

pub(crate) fn sync_context_on(
    provider: Arc<FakeProvider>,
    cancel: &CancellationToken,
    storage: TabStorage,
) -> (SyncContext, Arc<FakeEntitlements>, TabStorage) {
    let store = Arc::new(SessionStore::new());
    let api = FakeEntitlements::new(status_for(true));
    let fetcher = SubscriptionFetcher::new(
        api.clone(),
        ArtifactCache::new(storage.clone(), Duration::from_secs(300)),
        store.clone(),
        cancel.child_token(),
    );
    let ctx = SyncContext {
        provider,
        store,
        fetcher,
        guard: Arc::new(SyncGuard::new()),
        cleanup: LocalCleanup::new(storage.clone(), &[]),
        sign_out_retry: Arc::default(),
    };
    (ctx, api, storage)
}

// ── Clock ────────────────────────────────────────────────────────

/// Manually advanced wall clock.
#[derive(Default)]
pub(crate) struct ManualClock(AtomicI64);

impl ManualClock {
    pub(crate) fn at(millis: i64) -> Arc<Self> {
        Arc::new(Self(AtomicI64::new(millis)))
    }

    pub(crate) fn advance(&self, by: Duration) {
        let by = i64::try_from(by.as_millis()).unwrap();
        self.0.fetch_add(by, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}

// ── Entitlements ─────────────────────────────────────────────────

pub(crate) struct FakeEntitlements {
    status: Mutex<SubscriptionStatus>,
    fail_status: Mutex<Option<u16>>,
    delay: Mutex<Duration>,
    calls: AtomicUsize,
}

impl FakeEntitlements {
    pub(crate) fn new(status: SubscriptionStatus) -> Arc<Self> {
        Arc::new(Self {
            status: Mutex::new(status),
            fail_status: Mutex::new(None),
            delay: Mutex::new(Duration::ZERO),
            calls: AtomicUsize::new(0),
        })
    }

    pub(crate) fn set_status(&self, status: SubscriptionStatus) {
        *self.status.lock() = status;
    }

    pub(crate) fn fail_with(&self, status: u16) {
        *self.fail_status.lock() = Some(status);
    }

    pub(crate) fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EntitlementApi for FakeEntitlements {
    async fn fetch_status(
        &self,
        _user_id: &str,
        _access_token: Option<&str>,
    ) -> Result<SubscriptionStatus, AuthError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(status) = *self.fail_status.lock() {
            return Err(AuthError::Entitlement {
                status,
                message: "unavailable".into(),
            });
        }
        Ok(self.status.lock().clone())
    }
}

// ── Identity provider ────────────────────────────────────────────

/// Scriptable identity provider.
///
/// `get_session` first drains scripted answers, then reports the live session.
pub(crate) struct FakeProvider {
    live: Mutex<Option<Session>>,
    scripted: Mutex<VecDeque<Option<Session>>>,
    events: broadcast::Sender<AuthEvent>,
    get_session_calls: AtomicUsize,
    get_session_delay: Mutex<Duration>,
    fail_get_session: AtomicBool,
    sign_out_calls: Mutex<Vec<SignOutScope>>,
    global_sign_out_delay: Mutex<Duration>,
    reject_password: AtomicBool,
}

impl FakeProvider {
    pub(crate) fn new() -> Arc<Self> {
        let (events, _rx) = broadcast::channel(64);
        Arc::new(Self {
            live: Mutex::new(None),
            scripted: Mutex::new(VecDeque::new()),
            events,
            get_session_calls: AtomicUsize::new(0),
            get_session_delay: Mutex::new(Duration::ZERO),
            fail_get_session: AtomicBool::new(false),
            sign_out_calls: Mutex::new(Vec::new()),
            global_sign_out_delay: Mutex::new(Duration::ZERO),
            reject_password: AtomicBool::new(false),
        })
    }

    pub(crate) fn with_session(id: &str) -> Arc<Self> {
        let provider = Self::new();
        provider.set_live(Some(session_for(id)));
        provider
    }

    pub(crate) fn set_live(&self, session: Option<Session>) {
        *self.live.lock() = session;
    }

    pub(crate) fn script_get_session(&self, answers: Vec<Option<Session>>) {
        self.scripted.lock().extend(answers);
    }

    pub(crate) fn set_get_session_delay(&self, delay: Duration) {
        *self.get_session_delay.lock() = delay;
    }

    pub(crate) fn fail_get_session(&self, fail: bool) {
        self.fail_get_session.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn set_global_sign_out_delay(&self, delay: Duration) {
        *self.global_sign_out_delay.lock() = delay;
    }

    pub(crate) fn reject_passwords(&self) {
        self.reject_password.store(true, Ordering::SeqCst);
    }

    pub(crate) fn emit(&self, kind: AuthChangeEvent, session: Option<Session>) {
        let _ = self.events.send(AuthEvent::new(kind, session));
    }

    pub(crate) fn get_session_calls(&self) -> usize {
        self.get_session_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn sign_out_calls(&self) -> Vec<SignOutScope> {
        self.sign_out_calls.lock().clone()
    }
}

#[async_trait]
impl IdentityProvider for FakeProvider {
    async fn get_session(&self) -> Result<Option<Session>, AuthError> {
        self.get_session_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.get_session_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail_get_session.load(Ordering::SeqCst) {
            return Err(AuthError::Provider {
                status: 503,
                message: "auth service unavailable".into(),
            });
        }
        if let Some(answer) = self.scripted.lock().pop_front() {
            return Ok(answer);
        }
        Ok(self.live.lock().clone())
    }

    fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
        self.events.subscribe()
    }

    async fn sign_in_with_oauth(
        &self,
        provider: OAuthProvider,
        redirect_to: Option<&str>,
    ) -> Result<String, AuthError> {
        Ok(format!(
            "https://fake.auth/authorize?provider={}&redirect_to={}",
            provider.as_str(),
            redirect_to.unwrap_or_default()
        ))
    }

    async fn sign_in_with_password(
        &self,
        email: &str,
        _password: &str,
    ) -> Result<Session, AuthError> {
        if self.reject_password.load(Ordering::SeqCst) {
            return Err(AuthError::Provider {
                status: 400,
                message: "Invalid login credentials".into(),
            });
        }
        let id = email.split('@').next().unwrap_or(email);
        let session = session_for(id);
        self.set_live(Some(session.clone()));
        self.emit(AuthChangeEvent::SignedIn, Some(session.clone()));
        Ok(session)
    }

    async fn sign_up(
        &self,
        email: &str,
        _password: &str,
        metadata: serde_json::Value,
    ) -> Result<SignUpOutcome, AuthError> {
        let id = email.split('@').next().unwrap_or(email);
        let mut session = session_for(id);
        session.user.metadata = metadata;
        self.set_live(Some(session.clone()));
        self.emit(AuthChangeEvent::SignedIn, Some(session.clone()));
        Ok(SignUpOutcome {
            user: session.user.clone(),
            session: Some(session),
        })
    }

    async fn sign_out(&self, scope: SignOutScope) -> Result<(), AuthError> {
        self.sign_out_calls.lock().push(scope);
        if scope == SignOutScope::Global {
            let delay = *self.global_sign_out_delay.lock();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
        if scope != SignOutScope::Others {
            self.set_live(None);
            self.emit(AuthChangeEvent::SignedOut, None);
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "fake"
    }
}
