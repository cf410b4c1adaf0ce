//! Reconciling this tab with session changes made by other tabs.
//!
//! Another tab signing in, refreshing a token or signing out shows up here
//! as a storage event on the provider's session key.
//!
//! - **Fast path**: the new value parses as a session with a user; adopt it
//! - **Slow path**: the value is empty or unreadable; after a short quiet
//!   window ask the provider for the authoritative session, under the
//!   [`SyncGuard`](super::SyncGuard)

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::guard::GuardState;
use super::SyncContext;
use crate::auth::types::Session;
use crate::billing::{subscription_cache_key, SubscriptionStatus};
use crate::cache::ArtifactCache;
use crate::storage::{StorageEvent, StorageEvents, StorageNotice};

/// Result of one slow-path reconcile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPass {
    /// A session differing from the local one was adopted.
    Adopted,
    /// The provider had no session; local state was cleared.
    Cleared,
    /// Local state already matched the provider.
    Unchanged,
    /// The guard was busy, or sign-out/teardown took over.
    Skipped,
    /// The provider could not be reached; local state kept.
    Failed,
}

pub struct CrossTabSync {
    ctx: SyncContext,
    storage_key: String,
    debounce: Duration,
    /// Debounced slow-path check waiting for its quiet window.
    pending: Mutex<Option<(u64, CancellationToken)>>,
    next_id: AtomicU64,
    in_pass: AtomicBool,
    /// An ambiguous event arrived while this channel's own pass held the guard.
    rerun: AtomicBool,
    cancel: CancellationToken,
}

impl CrossTabSync {
    pub fn new(
        ctx: SyncContext,
        storage_key: String,
        debounce: Duration,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            storage_key,
            debounce,
            pending: Mutex::new(None),
            next_id: AtomicU64::new(0),
            in_pass: AtomicBool::new(false),
            rerun: AtomicBool::new(false),
            cancel,
        })
    }

    pub fn storage_key(&self) -> &str {
        &self.storage_key
    }

    /// Consume `events` until teardown.
    pub fn spawn(self: &Arc<Self>, mut events: StorageEvents) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = this.cancel.cancelled() => break,
                    notice = events.recv() => match notice {
                        Some(StorageNotice::Changed(event)) => this.handle_event(&event),
                        // A dropped provider-key change is only recoverable by asking the provider.
                        Some(StorageNotice::Missed(_)) => this.handle_missed(),
                        None => break,
                    },
                }
            }
            this.cancel_pending();
            tracing::debug!("Cross-tab listener stopped");
        })
    }

    /// Dispatch one storage event written by another tab.
    pub fn handle_event(self: &Arc<Self>, event: &StorageEvent) {
        if self.ctx.guard.is_signing_out() {
            tracing::debug!(key = %event.key, "Ignoring storage event during sign-out");
            return;
        }

        if event.key == self.storage_key {
            match event.new_value.as_deref().and_then(Session::from_persisted) {
                Some(session) => {
                    self.cancel_pending();
                    self.adopt(session);
                }
                None => self.schedule_reconcile(),
            }
            return;
        }

        if let Some(user_id) = self.ctx.store.current_user_id() {
            if event.key == subscription_cache_key(&user_id) {
                self.adopt_subscription(&user_id, event.new_value.as_deref());
                return;
            }
        }

        if self.ctx.cleanup.is_clear_key(&event.key) {
            tracing::debug!(key = %event.key, source_tab = %event.source_tab, "Local artifact changed in another tab");
        }
    }

    /// Events were dropped before this tab saw them; re-check the provider.
    pub fn handle_missed(self: &Arc<Self>) {
        if self.ctx.guard.is_signing_out() {
            return;
        }
        self.schedule_reconcile();
    }

    /// Drop a debounced check that has not started yet.
    pub fn cancel_pending(&self) {
        if let Some((_, token)) = self.pending.lock().take() {
            token.cancel();
        }
    }

    pub fn has_pending(&self) -> bool {
        self.pending.lock().is_some()
    }

    /// Ask the provider for its session and make local state match.
    ///
    /// Skips without waiting if the guard is not idle.
    pub async fn reconcile(self: &Arc<Self>) -> SyncPass {
        let Some(lease) = self.ctx.guard.try_acquire(GuardState::Syncing) else {
            if self.in_pass.load(Ordering::SeqCst) {
                self.rerun.store(true, Ordering::SeqCst);
            }
            return SyncPass::Skipped;
        };
        self.in_pass.store(true, Ordering::SeqCst);

        let result = tokio::select! {
            () = self.cancel.cancelled() => None,
            result = self.ctx.provider.get_session() => Some(result),
        };
        let pass = match result {
            None => SyncPass::Skipped,
            Some(_) if self.ctx.guard.is_signing_out() => SyncPass::Skipped,
            Some(Ok(Some(session))) => self.adopt(session),
            Some(Ok(None)) => {
                if self.ctx.store.user().is_some() {
                    let user_id = self.ctx.clear_local();
                    tracing::info!(
                        user_id = user_id.as_deref().unwrap_or("-"),
                        "Signed out in another tab, local state cleared"
                    );
                    SyncPass::Cleared
                } else {
                    self.ctx.store.finish_loading();
                    SyncPass::Unchanged
                }
            }
            Some(Err(e)) => {
                tracing::warn!("Cross-tab session check failed: {e}");
                SyncPass::Failed
            }
        };

        drop(lease);
        self.in_pass.store(false, Ordering::SeqCst);
        if self.rerun.swap(false, Ordering::SeqCst) && !self.cancel.is_cancelled() {
            self.schedule_reconcile();
        }
        tracing::debug!(?pass, "Cross-tab reconcile finished");
        pass
    }

    fn adopt(&self, session: Session) -> SyncPass {
        if self.ctx.store.session().as_ref() == Some(&session) {
            return SyncPass::Unchanged;
        }
        tracing::info!(user_id = %session.user.id, "Adopting session from another tab");
        self.ctx.adopt_session(session);
        SyncPass::Adopted
    }

    fn adopt_subscription(&self, user_id: &str, raw: Option<&str>) {
        let Some(artifact) = raw.and_then(ArtifactCache::decode::<SubscriptionStatus>) else {
            return;
        };
        if self.ctx.store.set_subscription(user_id, artifact.data) {
            tracing::debug!(user_id, "Adopted subscription status from another tab");
        }
    }

    fn schedule_reconcile(self: &Arc<Self>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = self.cancel.child_token();
        if let Some((_, previous)) = self.pending.lock().replace((id, token.clone())) {
            previous.cancel();
        }

        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                () = token.cancelled() => return,
                () = tokio::time::sleep(this.debounce) => {}
            }
            {
                let mut pending = this.pending.lock();
                if pending.as_ref().is_some_and(|(current, _)| *current == id) {
                    *pending = None;
                }
            }
            this.reconcile().await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{SharedStorage, TabStorage};
    use crate::sync::GuardState;
    use crate::testing::{
        session_for, settle, status_for, sync_context_on, FakeEntitlements, FakeProvider,
    };

    const KEY: &str = "sb-proj-auth-token";

    struct Fixture {
        sync: Arc<CrossTabSync>,
        ctx: SyncContext,
        provider: Arc<FakeProvider>,
        api: Arc<FakeEntitlements>,
        /// Storage handle of this tab.
        local: TabStorage,
        /// Another tab on the same storage.
        other: TabStorage,
        cancel: CancellationToken,
    }

    fn fixture(provider: Arc<FakeProvider>) -> Fixture {
        let shared = SharedStorage::in_memory();
        let cancel = CancellationToken::new();
        let (ctx, api, local) = sync_context_on(provider.clone(), &cancel, shared.tab());
        let sync = CrossTabSync::new(
            ctx.clone(),
            KEY.to_string(),
            Duration::from_millis(150),
            cancel.clone(),
        );
        Fixture {
            sync,
            ctx,
            provider,
            api,
            local,
            other: shared.tab(),
            cancel,
        }
    }

    fn event(key: &str, new_value: Option<String>) -> StorageEvent {
        StorageEvent {
            key: key.to_string(),
            old_value: None,
            new_value,
            source_tab: "other".into(),
        }
    }

    fn persisted(id: &str) -> Option<String> {
        Some(serde_json::to_string(&session_for(id)).unwrap())
    }

    #[tokio::test(start_paused = true)]
    async fn fast_path_adopts_session_without_provider_call() {
        let f = fixture(FakeProvider::new());
        f.sync.handle_event(&event(KEY, persisted("u2")));

        assert_eq!(f.ctx.store.snapshot().user_id(), Some("u2"));
        settle().await;
        assert_eq!(f.provider.get_session_calls(), 0);
        assert_eq!(f.api.calls(), 1);

        // Same session again changes nothing and does not re-prime
        f.sync.handle_event(&event(KEY, persisted("u2")));
        settle().await;
        assert_eq!(f.api.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn removal_triggers_debounced_provider_check_and_cleanup() {
        let f = fixture(FakeProvider::new());
        f.ctx.store.set_session(Some(session_for("u1")));
        f.local.set("cached_avatar_u1", "data:");
        f.local.set("selectedProblems", "[]");

        f.sync.handle_event(&event(KEY, None));
        assert!(f.sync.has_pending());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(f.provider.get_session_calls(), 0);

        tokio::time::sleep(Duration::from_millis(60)).await;
        settle().await;
        assert_eq!(f.provider.get_session_calls(), 1);
        assert!(f.ctx.store.user().is_none());
        assert!(f.local.keys().is_empty());
        assert_eq!(f.ctx.guard.state(), GuardState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn unreadable_value_with_live_session_keeps_user() {
        let f = fixture(FakeProvider::with_session("u1"));
        f.ctx.store.set_session(Some(session_for("u1")));

        f.sync.handle_event(&event(KEY, Some("{\"access_token\":".into())));
        tokio::time::sleep(Duration::from_millis(200)).await;
        settle().await;
        assert_eq!(f.provider.get_session_calls(), 1);
        assert_eq!(f.ctx.store.snapshot().user_id(), Some("u1"));
    }

    #[tokio::test(start_paused = true)]
    async fn bursts_collapse_into_one_check() {
        let f = fixture(FakeProvider::new());
        for _ in 0..5 {
            f.sync.handle_event(&event(KEY, None));
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        settle().await;
        assert_eq!(f.provider.get_session_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn fast_path_cancels_pending_check() {
        let f = fixture(FakeProvider::new());
        f.sync.handle_event(&event(KEY, None));
        f.sync.handle_event(&event(KEY, persisted("u3")));
        assert!(!f.sync.has_pending());

        tokio::time::sleep(Duration::from_millis(500)).await;
        settle().await;
        assert_eq!(f.provider.get_session_calls(), 0);
        assert_eq!(f.ctx.store.snapshot().user_id(), Some("u3"));
    }

    #[tokio::test(start_paused = true)]
    async fn events_are_ignored_while_signing_out() {
        let f = fixture(FakeProvider::with_session("u9"));
        f.ctx.store.set_session(Some(session_for("u1")));
        let _signing_out = f.ctx.guard.force(GuardState::SigningOut);

        f.sync.handle_event(&event(KEY, None));
        f.sync.handle_event(&event(KEY, persisted("u9")));
        tokio::time::sleep(Duration::from_millis(500)).await;
        settle().await;

        assert_eq!(f.provider.get_session_calls(), 0);
        assert_eq!(f.ctx.store.snapshot().user_id(), Some("u1"));
    }

    #[tokio::test(start_paused = true)]
    async fn busy_guard_skips_and_is_left_alone() {
        let f = fixture(FakeProvider::new());
        f.ctx.store.set_session(Some(session_for("u1")));
        let _verifying = f.ctx.guard.try_acquire(GuardState::Syncing).unwrap();

        assert_eq!(f.sync.reconcile().await, SyncPass::Skipped);
        assert_eq!(f.provider.get_session_calls(), 0);
        assert_eq!(f.ctx.guard.state(), GuardState::Syncing);
        assert_eq!(f.ctx.store.snapshot().user_id(), Some("u1"));
    }

    #[tokio::test(start_paused = true)]
    async fn sign_out_starting_mid_check_wins() {
        let provider = FakeProvider::new();
        provider.set_get_session_delay(Duration::from_millis(300));
        let f = fixture(provider);
        f.ctx.store.set_session(Some(session_for("u1")));

        let sync = f.sync.clone();
        let pass = tokio::spawn(async move { sync.reconcile().await });
        settle().await;
        let signing_out = f.ctx.guard.force(GuardState::SigningOut);

        assert_eq!(pass.await.unwrap(), SyncPass::Skipped);
        assert_eq!(f.ctx.store.snapshot().user_id(), Some("u1"));
        assert!(f.ctx.guard.is_signing_out());
        drop(signing_out);
        assert_eq!(f.ctx.guard.state(), GuardState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn provider_failure_keeps_local_state() {
        let provider = FakeProvider::new();
        provider.fail_get_session(true);
        let f = fixture(provider);
        f.ctx.store.set_session(Some(session_for("u1")));

        assert_eq!(f.sync.reconcile().await, SyncPass::Failed);
        assert_eq!(f.ctx.store.snapshot().user_id(), Some("u1"));
        assert_eq!(f.ctx.guard.state(), GuardState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn subscription_written_by_other_tab_is_adopted() {
        let f = fixture(FakeProvider::new());
        f.ctx.store.set_session(Some(session_for("u1")));

        let envelope = serde_json::json!({ "data": status_for(true), "timestamp": 1 });
        f.sync
            .handle_event(&event("subscription_status_u1", Some(envelope.to_string())));
        assert!(f.ctx.store.snapshot().subscription_status.unwrap().is_subscribed);

        // Another account's status is not shown
        let other = serde_json::json!({ "data": status_for(false), "timestamp": 1 });
        f.sync
            .handle_event(&event("subscription_status_u2", Some(other.to_string())));
        assert!(f.ctx.store.snapshot().subscription_status.unwrap().is_subscribed);
    }

    #[tokio::test(start_paused = true)]
    async fn listener_follows_other_tab_until_teardown() {
        let f = fixture(FakeProvider::new());
        let handle = f.sync.spawn(f.local.subscribe());

        f.other.set(KEY, persisted("u5").unwrap());
        settle().await;
        assert_eq!(f.ctx.store.snapshot().user_id(), Some("u5"));

        // This tab's own writes are not echoed back
        f.local.set(KEY, "");
        settle().await;
        assert!(!f.sync.has_pending());

        f.cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn lagging_listener_reconciles_with_provider() {
        let f = fixture(FakeProvider::new());
        f.local.set(KEY, persisted("u1").unwrap());
        f.ctx.store.set_session(Some(session_for("u1")));
        let handle = f.sync.spawn(f.local.subscribe());

        // The sign-out write is pushed out of the buffer before the listener runs
        f.other.remove(KEY);
        for i in 0..300 {
            f.other.set("run_result", format!("{i}"));
        }
        settle().await;
        assert!(f.sync.has_pending());

        tokio::time::sleep(Duration::from_millis(200)).await;
        settle().await;
        assert!(f.ctx.store.snapshot().user.is_none());
        assert_eq!(f.ctx.guard.state(), GuardState::Idle);

        f.cancel.cancel();
        handle.await.unwrap();
    }
}
