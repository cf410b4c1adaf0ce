//! Keeping one tab's session consistent with the identity provider.
//!
//! Three routines can change the session state of a tab besides the
//! explicit sign-in/sign-out calls:
//!
//! - **Cross-tab sync**: another tab wrote the provider's session key
//! - **Sign-out verification**: the provider SDK reported `SIGNED_OUT`
//! - **Subscription priming**: a user was seen for the first time
//!
//! The first two coordinate through the [`SyncGuard`]; the explicit
//! sign-out forces the guard and wins over both.

pub mod cleanup;
pub mod cross_tab;
pub mod guard;
pub mod verifier;

pub use cleanup::LocalCleanup;
pub use cross_tab::{CrossTabSync, SyncPass};
pub use guard::{GuardLease, GuardState, SyncGuard};
pub use verifier::{SignOutVerifier, VerifierOutcome};

use parking_lot::Mutex;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::auth::provider::IdentityProvider;
use crate::auth::store::SessionStore;
use crate::auth::types::Session;
use crate::billing::SubscriptionFetcher;

/// Collaborators shared by the routines that reconcile session state.
#[derive(Clone)]
pub struct SyncContext {
    pub provider: Arc<dyn IdentityProvider>,
    pub store: Arc<SessionStore>,
    pub fetcher: Arc<SubscriptionFetcher>,
    pub guard: Arc<SyncGuard>,
    pub cleanup: LocalCleanup,
    /// Background provider sign-out left running by an explicit sign-out.
    pub sign_out_retry: Arc<Mutex<Option<CancellationToken>>>,
}

impl SyncContext {
    /// Adopt `session`, priming the subscription status the first time its
    /// user is seen.
    pub fn adopt_session(&self, session: Session) {
        self.cancel_sign_out_retry();
        let user_id = session.user.id.clone();
        self.store.set_session(Some(session));
        if self.store.mark_processed(&user_id) {
            self.fetcher.spawn_prime(&user_id);
        }
    }

    /// Adopt `session` and re-prime the subscription status unconditionally.
    pub fn restore_session(&self, session: Session) {
        self.cancel_sign_out_retry();
        let user_id = session.user.id.clone();
        self.store.set_session(Some(session));
        self.store.mark_processed(&user_id);
        self.fetcher.spawn_prime(&user_id);
    }

    /// Stop a pending background sign-out; a newer session supersedes it.
    pub fn cancel_sign_out_retry(&self) {
        if let Some(retry) = self.sign_out_retry.lock().take() {
            tracing::debug!("Cancelling background sign-out");
            retry.cancel();
        }
    }

    /// Drop the local session and purge per-user artifacts.
    ///
    /// Returns the id of the user that was signed in, if any.
    pub fn clear_local(&self) -> Option<String> {
        let user_id = self.store.current_user_id();
        self.store.clear();
        self.cleanup.purge(user_id.as_deref());
        user_id
    }
}
