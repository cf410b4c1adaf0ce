//! Tri-state token serializing session reconciliation within one tab.
//!
//! The guard is a compare-and-set flag, not a lock: a caller that finds it
//! busy skips its turn instead of queueing. Explicit sign-out overrides
//! whatever state the guard is in.

use parking_lot::Mutex;
use std::sync::Arc;

/// What currently owns the session state of this tab.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardState {
    Idle,
    /// A cross-tab reconcile or a sign-out verification is running.
    Syncing,
    /// An explicit `sign_out()` is in flight.
    SigningOut,
}

impl GuardState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Syncing => "syncing",
            Self::SigningOut => "signing-out",
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: GuardState,
    /// Overlapping explicit sign-outs; the guard returns to idle after the last.
    sign_out_holders: u32,
}

#[derive(Debug)]
pub struct SyncGuard {
    inner: Mutex<Inner>,
}

impl Default for SyncGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncGuard {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: GuardState::Idle,
                sign_out_holders: 0,
            }),
        }
    }

    pub fn state(&self) -> GuardState {
        self.inner.lock().state
    }

    pub fn is_signing_out(&self) -> bool {
        self.state() == GuardState::SigningOut
    }

    /// Move `idle -> to`. Returns `None` without waiting if the guard is busy.
    pub fn try_acquire(self: &Arc<Self>, to: GuardState) -> Option<GuardLease> {
        debug_assert_ne!(to, GuardState::Idle);
        let mut inner = self.inner.lock();
        if inner.state != GuardState::Idle {
            tracing::debug!(
                held = inner.state.as_str(),
                wanted = to.as_str(),
                "Sync guard busy, skipping"
            );
            return None;
        }
        inner.state = to;
        if to == GuardState::SigningOut {
            inner.sign_out_holders += 1;
        }
        Some(GuardLease {
            guard: Arc::clone(self),
            held: to,
        })
    }

    /// Take the guard regardless of its current state.
    pub fn force(self: &Arc<Self>, to: GuardState) -> GuardLease {
        debug_assert_ne!(to, GuardState::Idle);
        let mut inner = self.inner.lock();
        if inner.state != to {
            tracing::debug!(from = inner.state.as_str(), to = to.as_str(), "Sync guard forced");
        }
        inner.state = to;
        if to == GuardState::SigningOut {
            inner.sign_out_holders += 1;
        }
        GuardLease {
            guard: Arc::clone(self),
            held: to,
        }
    }

    /// Back to idle unconditionally (teardown).
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = GuardState::Idle;
        inner.sign_out_holders = 0;
    }

    fn release(&self, held: GuardState) {
        let mut inner = self.inner.lock();
        if held == GuardState::SigningOut {
            inner.sign_out_holders = inner.sign_out_holders.saturating_sub(1);
            if inner.sign_out_holders > 0 {
                return;
            }
        }
        // Someone else took over since; leave their state alone.
        if inner.state == held {
            inner.state = GuardState::Idle;
        }
    }
}

/// Ownership of a non-idle guard state. Dropping it releases the guard.
#[must_use = "dropping the lease releases the guard immediately"]
#[derive(Debug)]
pub struct GuardLease {
    guard: Arc<SyncGuard>,
    held: GuardState,
}

impl GuardLease {
    pub fn held(&self) -> GuardState {
        self.held
    }
}

impl Drop for GuardLease {
    fn drop(&mut self) {
        self.guard.release(self.held);
    }
}
