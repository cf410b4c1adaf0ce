//! Observable in-memory session state for one tab.
//!
//! Holds:
//! - the current `{user, session}` pair and the initial `loading` flag
//! - the derived subscription status and its loading flag
//! - whether a sign-out verification is in progress
//! - the set of users whose first sign-in work already ran
//!
//! Every mutation is a single `watch` update, so observers never see a
//! session without its user or a subscription belonging to another account.

use parking_lot::Mutex;
use std::collections::HashSet;
use tokio::sync::watch;

use super::types::{Session, User};
use crate::billing::SubscriptionStatus;

/// Point-in-time view of the session state published to consumers.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub user: Option<User>,
    pub session: Option<Session>,
    /// True until the initial session lookup settles (or times out).
    pub loading: bool,
    pub subscription_status: Option<SubscriptionStatus>,
    pub subscription_loading: bool,
    pub is_verifying_sign_out: bool,
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        Self {
            user: None,
            session: None,
            loading: true,
            subscription_status: None,
            subscription_loading: false,
            is_verifying_sign_out: false,
        }
    }
}

impl SessionSnapshot {
    pub fn is_authenticated(&self) -> bool {
        self.user.is_some()
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user.as_ref().map(|u| u.id.as_str())
    }
}

/// Session state holder shared by every part of the core.
pub struct SessionStore {
    state: watch::Sender<SessionSnapshot>,
    /// Users whose first sign-in work already ran in this store's lifetime.
    processed_users: Mutex<HashSet<String>>,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore {
    pub fn new() -> Self {
        let (state, _rx) = watch::channel(SessionSnapshot::default());
        Self {
            state,
            processed_users: Mutex::new(HashSet::new()),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.state.subscribe()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.state.borrow().clone()
    }

    pub fn user(&self) -> Option<User> {
        self.state.borrow().user.clone()
    }

    pub fn session(&self) -> Option<Session> {
        self.state.borrow().session.clone()
    }

    pub fn current_user_id(&self) -> Option<String> {
        self.state.borrow().user_id().map(str::to_string)
    }

    pub fn loading(&self) -> bool {
        self.state.borrow().loading
    }

    /// Adopt a provider session (or its absence) as the current state.
    ///
    /// Settles `loading`. Switching to a different user drops the previous
    /// user's subscription status.
    pub fn set_session(&self, session: Option<Session>) {
        self.state.send_if_modified(|state| {
            let user = session.as_ref().map(|s| s.user.clone());
            if state.user_id() != user.as_ref().map(|u| u.id.as_str()) {
                state.subscription_status = None;
                state.subscription_loading = false;
            }
            let changed = state.session != session || state.user != user || state.loading;
            state.user = user;
            state.session = session;
            state.loading = false;
            changed
        });
    }

    /// Drop the user, session and derived status; settles `loading`.
    pub fn clear(&self) {
        self.state.send_if_modified(|state| {
            let changed = state.user.is_some()
                || state.session.is_some()
                || state.subscription_status.is_some()
                || state.subscription_loading
                || state.loading;
            state.user = None;
            state.session = None;
            state.subscription_status = None;
            state.subscription_loading = false;
            state.loading = false;
            changed
        });
        self.processed_users.lock().clear();
    }

    /// Force `loading` off without touching the session.
    pub fn finish_loading(&self) {
        self.state.send_if_modified(|state| std::mem::replace(&mut state.loading, false));
    }

    /// Publish a subscription status if `user_id` is still the current user.
    ///
    /// Returns false (and publishes nothing) when the account changed while
    /// the status was being fetched.
    pub fn set_subscription(&self, user_id: &str, status: SubscriptionStatus) -> bool {
        self.state.send_if_modified(|state| {
            if state.user_id() != Some(user_id) {
                return false;
            }
            state.subscription_status = Some(status);
            state.subscription_loading = false;
            true
        })
    }

    pub fn set_subscription_loading(&self, loading: bool) {
        self.state.send_if_modified(|state| {
            std::mem::replace(&mut state.subscription_loading, loading) != loading
        });
    }

    pub fn set_verifying_sign_out(&self, verifying: bool) {
        self.state.send_if_modified(|state| {
            std::mem::replace(&mut state.is_verifying_sign_out, verifying) != verifying
        });
    }

    /// Record that first-sign-in work ran for `user_id`.
    ///
    /// Returns true the first time a user is seen.
    pub fn mark_processed(&self, user_id: &str) -> bool {
        self.processed_users.lock().insert(user_id.to_string())
    }
}
